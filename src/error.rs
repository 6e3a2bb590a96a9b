use thiserror::Error;

#[derive(Error, Debug)]
pub enum CompressionError {
    #[error("Failed to read image: {0}")]
    Read(#[from] std::io::Error),

    #[error("Failed to decode image: {0}")]
    Decode(String),

    #[error("Failed to encode JPEG at quality {quality}: {reason}")]
    Encode { quality: u8, reason: String },

    #[error("Compression worker failed: {0}")]
    Worker(String),

    #[error("Image is still {size} bytes at minimum quality (limit {limit})")]
    Oversized { size: usize, limit: usize },
}

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("Object storage rejected upload of {path}: {reason}")]
    Storage { path: String, reason: String },

    #[error("Upload of {path} timed out after {seconds}s")]
    Timeout { path: String, seconds: u64 },
}

/// Failures surfaced by the scan record store. "Not found" is not an error
/// and is reported as `Ok(None)` instead.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StoreError {
    #[error("Store rejected request: {message}")]
    Rejected {
        message: String,
        code: Option<String>,
    },

    #[error("Store unreachable: {0}")]
    Network(String),
}

impl StoreError {
    pub fn code(&self) -> Option<&str> {
        match self {
            StoreError::Rejected { code, .. } => code.as_deref(),
            StoreError::Network(_) => None,
        }
    }
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => StoreError::Rejected {
                message: db_err.message().to_string(),
                code: db_err.code().map(|c| c.into_owned()),
            },
            sqlx::Error::Io(io) => StoreError::Network(io.to_string()),
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed => {
                StoreError::Network(err.to_string())
            }
            other => StoreError::Rejected {
                message: other.to_string(),
                code: None,
            },
        }
    }
}

impl From<sea_orm::DbErr> for StoreError {
    fn from(err: sea_orm::DbErr) -> Self {
        use sea_orm::{DbErr, RuntimeErr};

        match err {
            DbErr::ConnectionAcquire(e) => StoreError::Network(e.to_string()),
            DbErr::Conn(e) => StoreError::Network(e.to_string()),
            DbErr::Exec(RuntimeErr::SqlxError(e)) | DbErr::Query(RuntimeErr::SqlxError(e)) => {
                e.into()
            }
            other => StoreError::Rejected {
                message: other.to_string(),
                code: None,
            },
        }
    }
}

/// Stage at which an ingestion stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestStage {
    Quota,
    Compression,
    Upload,
    Persistence,
}

impl std::fmt::Display for IngestStage {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        let label = match self {
            IngestStage::Quota => "quota check failed",
            IngestStage::Compression => "compression failed",
            IngestStage::Upload => "upload failed",
            IngestStage::Persistence => "save failed",
        };
        f.write_str(label)
    }
}

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Quota exceeded: {used} of {limit} free scans used")]
    QuotaExceeded { used: u64, limit: u64 },

    #[error("quota check failed: {0}")]
    QuotaCheck(#[source] StoreError),

    #[error("compression failed: {0}")]
    Compression(#[from] CompressionError),

    #[error("upload failed: {0}")]
    Upload(#[from] UploadError),

    #[error("save failed (image already stored at {image_url}): {source}")]
    Persistence {
        image_url: String,
        #[source]
        source: StoreError,
    },
}

impl IngestError {
    pub fn stage(&self) -> IngestStage {
        match self {
            IngestError::QuotaExceeded { .. } | IngestError::QuotaCheck(_) => IngestStage::Quota,
            IngestError::Compression(_) => IngestStage::Compression,
            IngestError::Upload(_) => IngestStage::Upload,
            IngestError::Persistence { .. } => IngestStage::Persistence,
        }
    }

    /// Short per-stage message meant for the end user
    pub fn user_message(&self) -> String {
        match self {
            IngestError::QuotaExceeded { limit, .. } => format!(
                "You have used all {} free scans. Upgrade to keep scanning.",
                limit
            ),
            IngestError::QuotaCheck(_) => {
                "Could not check your scan allowance. Please try again.".to_string()
            }
            IngestError::Compression(_) => {
                "The image could not be prepared for upload.".to_string()
            }
            IngestError::Upload(_) => "The image could not be uploaded.".to_string(),
            IngestError::Persistence { .. } => {
                "The image was uploaded but the scan could not be saved.".to_string()
            }
        }
    }
}

/// Channel-level failures inside the synchronizer. These are logged and
/// absorbed, never returned to callers.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncError {
    #[error("change feed error: {0}")]
    Subscription(String),

    #[error("poll for scan {id} failed: {reason}")]
    Poll { id: String, reason: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_labels() {
        let err = IngestError::QuotaExceeded { used: 3, limit: 3 };
        assert_eq!(err.stage(), IngestStage::Quota);

        let err = IngestError::Persistence {
            image_url: "http://img".to_string(),
            source: StoreError::Network("reset".to_string()),
        };
        assert_eq!(err.stage().to_string(), "save failed");
        assert!(err.to_string().contains("http://img"));
    }

    #[test]
    fn test_db_error_mapping() {
        let err: StoreError = sea_orm::DbErr::Conn(sea_orm::RuntimeErr::Internal(
            "refused".to_string(),
        ))
        .into();
        assert!(matches!(err, StoreError::Network(_)));

        let err: StoreError = sea_orm::DbErr::RecordNotInserted.into();
        assert!(matches!(err, StoreError::Rejected { code: None, .. }));
    }
}
