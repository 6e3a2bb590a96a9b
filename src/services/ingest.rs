use std::sync::Arc;
use tracing::{error, info, instrument, warn};

use crate::config::ScanConfig;
use crate::error::{CompressionError, IngestError, UploadError};
use crate::models::{AccountTier, Scan, Session};
use crate::services::compressor::{CompressedImage, CompressionSettings, ImageCompressor, ImageRef};
use crate::services::notifier::BackendNotifier;
use crate::services::scan_store::ScanStore;
use crate::services::storage::StorageService;
use crate::services::sync::AnalysisSynchronizer;
use crate::services::upload::UploadClient;

/// Runs one capture/import through compress, upload, persist and the
/// optimistic merge. Stages run strictly in order; independent ingestions
/// may run concurrently and share only the synchronizer's list.
pub struct IngestionService {
    config: ScanConfig,
    compressor: ImageCompressor,
    uploader: UploadClient,
    store: Arc<dyn ScanStore>,
    sync: AnalysisSynchronizer,
    notifier: Option<BackendNotifier>,
}

impl IngestionService {
    pub fn new(
        config: ScanConfig,
        storage: Arc<dyn StorageService>,
        store: Arc<dyn ScanStore>,
        sync: AnalysisSynchronizer,
    ) -> Self {
        let compressor = ImageCompressor::new(CompressionSettings::from(&config));
        let uploader = UploadClient::new(
            storage,
            config.public_prefix.clone(),
            config.request_timeout,
        );
        Self {
            config,
            compressor,
            uploader,
            store,
            sync,
            notifier: None,
        }
    }

    pub fn with_notifier(mut self, notifier: BackendNotifier) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn synchronizer(&self) -> &AnalysisSynchronizer {
        &self.sync
    }

    #[instrument(skip(self, session, image), fields(owner = %session.owner_id, language = %session.language))]
    pub async fn ingest(&self, session: &Session, image: ImageRef) -> Result<Scan, IngestError> {
        self.check_quota(session).await?;

        let compressed = self
            .compressor
            .compress(image, self.config.target_bytes)
            .await
            .inspect_err(|e| error!("❌ Compression failed: {}", e))?;
        if compressed.estimated_size > self.config.max_upload_bytes {
            let err = CompressionError::Oversized {
                size: compressed.estimated_size,
                limit: self.config.max_upload_bytes,
            };
            error!("❌ {}", err);
            return Err(err.into());
        }

        let image_url = self.upload_with_retry(&compressed).await?;
        drop(compressed);

        let scan = self
            .store
            .create_scan(&image_url, session.language, &session.owner_id)
            .await
            .map_err(|source| {
                error!(
                    "❌ Saving scan failed, image stays orphaned at {}: {}",
                    image_url, source
                );
                IngestError::Persistence {
                    image_url: image_url.clone(),
                    source,
                }
            })?;

        self.publish(session, &scan).await;

        if let Some(notifier) = &self.notifier {
            notifier.spawn_notify(session.language);
        }

        info!("✅ Ingested scan {}", scan.id);
        Ok(scan)
    }

    async fn check_quota(&self, session: &Session) -> Result<(), IngestError> {
        if session.tier == AccountTier::Paid {
            return Ok(());
        }

        let used = self
            .store
            .count_scans(&session.owner_id)
            .await
            .map_err(IngestError::QuotaCheck)?;
        let limit = self.config.free_tier_limit;
        if used >= limit {
            info!(
                "🚫 User {} reached the free tier limit ({}/{})",
                session.owner_id, used, limit
            );
            return Err(IngestError::QuotaExceeded { used, limit });
        }
        Ok(())
    }

    async fn upload_with_retry(&self, image: &CompressedImage) -> Result<String, UploadError> {
        let attempts = self.config.upload_attempts.max(1);
        let mut attempt = 1;
        loop {
            match self.uploader.upload(image).await {
                Ok(url) => return Ok(url),
                Err(e) if attempt < attempts => {
                    warn!(
                        "⚠️  Upload attempt {}/{} failed: {}, retrying",
                        attempt, attempts, e
                    );
                    tokio::time::sleep(self.config.upload_retry_delay).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!("❌ Upload failed after {} attempts: {}", attempt, e);
                    return Err(e);
                }
            }
        }
    }

    /// Optimistic merge, then a full refresh. The scan is already saved, so
    /// a failing refresh is only logged.
    async fn publish(&self, session: &Session, scan: &Scan) {
        if self.sync.owner_id() != session.owner_id {
            warn!(
                "Scan {} belongs to user {} but the synchronizer tracks {}, skipping merge",
                scan.id,
                session.owner_id,
                self.sync.owner_id()
            );
            return;
        }

        self.sync.merge_optimistic(scan.clone());
        if let Err(e) = self.sync.refresh().await {
            warn!("⚠️  Scan list refresh after ingest failed: {}", e);
        }
    }
}
