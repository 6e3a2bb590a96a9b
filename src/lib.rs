pub mod config;
pub mod entities;
pub mod error;
pub mod infrastructure;
pub mod models;
pub mod services;

pub use config::ScanConfig;
pub use error::{IngestError, IngestStage, StoreError};
pub use models::{AccountTier, Language, Scan, Session};
pub use services::compressor::ImageRef;
pub use services::ingest::IngestionService;
pub use services::sync::{AnalysisSynchronizer, SyncNotice, SyncSettings};
