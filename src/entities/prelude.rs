pub use super::scans::Entity as Scans;
