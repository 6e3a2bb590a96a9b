pub mod prelude;

pub mod scans;
