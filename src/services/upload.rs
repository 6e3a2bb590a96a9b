use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, instrument};

use crate::error::UploadError;
use crate::services::compressor::CompressedImage;
use crate::services::storage::StorageService;

const CONTENT_TYPE: &str = "image/jpeg";

/// Pushes compressed scans to object storage. A failed put is reported as
/// is; retrying is up to the caller.
pub struct UploadClient {
    storage: Arc<dyn StorageService>,
    prefix: String,
    timeout: Duration,
}

impl UploadClient {
    pub fn new(storage: Arc<dyn StorageService>, prefix: impl Into<String>, timeout: Duration) -> Self {
        Self {
            storage,
            prefix: prefix.into(),
            timeout,
        }
    }

    #[instrument(skip(self, image), fields(size = image.data.len()))]
    pub async fn upload(&self, image: &CompressedImage) -> Result<String, UploadError> {
        let path = object_path(&self.prefix, Utc::now(), rand::random::<u32>());

        let put = self
            .storage
            .put_object(&path, image.data.clone(), CONTENT_TYPE);
        match tokio::time::timeout(self.timeout, put).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(UploadError::Storage {
                    path,
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(UploadError::Timeout {
                    path,
                    seconds: self.timeout.as_secs(),
                });
            }
        }

        let url = self.storage.public_url(&path);
        info!("☁️  Uploaded scan image to {}", path);
        Ok(url)
    }
}

/// `{prefix}/{yyyymmddThhmmss.ffffff}-{8 hex}.jpg`. Microsecond timestamp
/// plus a random suffix; collisions are left to the store.
pub fn object_path(prefix: &str, now: DateTime<Utc>, entropy: u32) -> String {
    let stamp = now.format("%Y%m%dT%H%M%S%.6f");
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        format!("{}-{:08x}.jpg", stamp, entropy)
    } else {
        format!("{}/{}-{:08x}.jpg", prefix, stamp, entropy)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_object_path_format() {
        let now = Utc.with_ymd_and_hms(2026, 10, 14, 9, 30, 5).unwrap()
            + chrono::Duration::microseconds(42);
        assert_eq!(
            object_path("scans/", now, 0xdead_beef),
            "scans/20261014T093005.000042-deadbeef.jpg"
        );
        assert_eq!(
            object_path("", now, 1),
            "20261014T093005.000042-00000001.jpg"
        );
    }

    #[test]
    fn test_same_instant_differs_by_entropy() {
        let now = Utc::now();
        assert_ne!(object_path("scans", now, 1), object_path("scans", now, 2));
    }
}
