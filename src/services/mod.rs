pub mod analysis;
pub mod change_feed;
pub mod compressor;
pub mod ingest;
pub mod notifier;
pub mod scan_store;
pub mod storage;
pub mod sync;
pub mod upload;
