use async_trait::async_trait;
use chrono::Utc;
use futures::stream::BoxStream;
use sea_orm::ActiveValue::Set;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    QueryOrder,
};
use tracing::{debug, info};
use uuid::Uuid;

use crate::entities::{prelude::*, scans};
use crate::error::{StoreError, SyncError};
use crate::models::{Language, Scan};
use crate::services::change_feed;

/// A change to one of the subscribed owner's scans, in server emission order
#[derive(Debug, Clone, PartialEq)]
pub enum ChangeEvent {
    Inserted(Scan),
    Updated(Scan),
    Deleted { id: String },
}

impl ChangeEvent {
    pub fn scan_id(&self) -> &str {
        match self {
            ChangeEvent::Inserted(scan) | ChangeEvent::Updated(scan) => &scan.id,
            ChangeEvent::Deleted { id } => id,
        }
    }
}

pub type ChangeStream = BoxStream<'static, Result<ChangeEvent, SyncError>>;

/// Typed access to the `scans` table
#[async_trait]
pub trait ScanStore: Send + Sync {
    async fn create_scan(
        &self,
        image_url: &str,
        language: Language,
        owner_id: &str,
    ) -> Result<Scan, StoreError>;

    /// `Ok(None)` when no scan has this id
    async fn get_scan(&self, id: &str) -> Result<Option<Scan>, StoreError>;

    /// Newest first
    async fn list_scans(&self, owner_id: &str) -> Result<Vec<Scan>, StoreError>;

    async fn count_scans(&self, owner_id: &str) -> Result<u64, StoreError>;

    async fn delete_scan(&self, id: &str) -> Result<(), StoreError>;

    /// Long-lived feed of insert/update/delete events for one owner
    async fn subscribe_changes(&self, owner_id: &str) -> Result<ChangeStream, StoreError>;
}

pub struct SeaOrmScanStore {
    db: DatabaseConnection,
    feed_url: Option<String>,
}

impl SeaOrmScanStore {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db, feed_url: None }
    }

    /// Enable the LISTEN/NOTIFY change feed. PostgreSQL only.
    pub fn with_change_feed(mut self, database_url: impl Into<String>) -> Self {
        self.feed_url = Some(database_url.into());
        self
    }
}

#[async_trait]
impl ScanStore for SeaOrmScanStore {
    async fn create_scan(
        &self,
        image_url: &str,
        language: Language,
        owner_id: &str,
    ) -> Result<Scan, StoreError> {
        let model = scans::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            image_url: Set(image_url.to_string()),
            created_at: Set(Utc::now()),
            language: Set(language),
            user_id: Set(owner_id.to_string()),
            analysis: Set(None),
        }
        .insert(&self.db)
        .await?;

        info!("📝 Created scan {} for user {}", model.id, owner_id);
        Ok(model.into())
    }

    async fn get_scan(&self, id: &str) -> Result<Option<Scan>, StoreError> {
        let model = Scans::find_by_id(id).one(&self.db).await?;
        Ok(model.map(Scan::from))
    }

    async fn list_scans(&self, owner_id: &str) -> Result<Vec<Scan>, StoreError> {
        let models = Scans::find()
            .filter(scans::Column::UserId.eq(owner_id))
            .order_by_desc(scans::Column::CreatedAt)
            .all(&self.db)
            .await?;
        Ok(models.into_iter().map(Scan::from).collect())
    }

    async fn count_scans(&self, owner_id: &str) -> Result<u64, StoreError> {
        let count = Scans::find()
            .filter(scans::Column::UserId.eq(owner_id))
            .count(&self.db)
            .await?;
        Ok(count)
    }

    async fn delete_scan(&self, id: &str) -> Result<(), StoreError> {
        let res = Scans::delete_by_id(id).exec(&self.db).await?;
        if res.rows_affected == 0 {
            debug!("Scan {} was already gone", id);
        } else {
            info!("🗑️  Deleted scan {}", id);
        }
        Ok(())
    }

    async fn subscribe_changes(&self, owner_id: &str) -> Result<ChangeStream, StoreError> {
        let Some(url) = &self.feed_url else {
            return Err(StoreError::Rejected {
                message: "change feed is not configured for this database".to_string(),
                code: Some("unsupported".to_string()),
            });
        };
        change_feed::subscribe(url, self.db.clone(), owner_id.to_string()).await
    }
}
