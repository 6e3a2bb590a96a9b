use futures::StreamExt;
use sea_orm::{DatabaseConnection, EntityTrait};
use serde::Deserialize;
use sqlx::postgres::PgListener;
use tracing::{debug, info, warn};

use crate::entities::prelude::*;
use crate::error::{StoreError, SyncError};
use crate::models::Scan;
use crate::services::scan_store::{ChangeEvent, ChangeStream};

/// Channel the `scans_notify_change` trigger publishes to
pub const CHANNEL: &str = "scan_changes";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

#[derive(Debug, Deserialize)]
struct Payload {
    op: String,
    id: String,
    user_id: String,
}

/// Decode a trigger payload. `Ok(None)` means the row belongs to another owner.
pub fn decode_payload(payload: &str, owner_id: &str) -> Result<Option<(ChangeOp, String)>, SyncError> {
    let payload: Payload = serde_json::from_str(payload)
        .map_err(|e| SyncError::Subscription(format!("malformed notification: {}", e)))?;

    if payload.user_id != owner_id {
        return Ok(None);
    }

    let op = match payload.op.as_str() {
        "INSERT" => ChangeOp::Insert,
        "UPDATE" => ChangeOp::Update,
        "DELETE" => ChangeOp::Delete,
        other => {
            return Err(SyncError::Subscription(format!(
                "unknown change operation: {}",
                other
            )));
        }
    };
    Ok(Some((op, payload.id)))
}

/// What a single `try_recv` on the listener amounted to
#[derive(Debug, PartialEq)]
pub enum Received<T> {
    Notification(T),
    /// The connection dropped. The listener would reconnect on its next
    /// call, but anything sent in between is gone.
    ConnectionLost,
    Failed(String),
}

impl<T> From<Result<Option<T>, sqlx::Error>> for Received<T> {
    fn from(res: Result<Option<T>, sqlx::Error>) -> Self {
        match res {
            Ok(Some(notification)) => Received::Notification(notification),
            Ok(None) => Received::ConnectionLost,
            Err(e) => Received::Failed(e.to_string()),
        }
    }
}

struct Feed {
    listener: PgListener,
    db: DatabaseConnection,
    owner_id: String,
}

/// Listen on [`CHANNEL`] and turn notifications for `owner_id` into change
/// events. Inserts and updates re-read the row since the payload only
/// carries the key. The stream ends when the connection drops or the
/// listener fails, so the subscriber can resubscribe and re-sync.
pub async fn subscribe(
    database_url: &str,
    db: DatabaseConnection,
    owner_id: String,
) -> Result<ChangeStream, StoreError> {
    let mut listener = PgListener::connect(database_url).await?;
    listener.listen(CHANNEL).await?;
    info!("📡 Listening for scan changes of user {}", owner_id);

    let feed = Feed {
        listener,
        db,
        owner_id,
    };
    let stream = futures::stream::unfold(Some(feed), |state| async move {
        let mut feed = state?;
        loop {
            match Received::from(feed.listener.try_recv().await) {
                Received::Notification(notification) => {
                    if let Some(item) = to_event(&feed, notification.payload()).await {
                        return Some((item, Some(feed)));
                    }
                }
                Received::ConnectionLost => {
                    warn!("Change feed connection for user {} lost", feed.owner_id);
                    return None;
                }
                Received::Failed(reason) => {
                    return Some((Err(SyncError::Subscription(reason)), None));
                }
            }
        }
    });

    Ok(stream.boxed())
}

async fn to_event(feed: &Feed, payload: &str) -> Option<Result<ChangeEvent, SyncError>> {
    let (op, id) = match decode_payload(payload, &feed.owner_id) {
        Ok(Some(decoded)) => decoded,
        Ok(None) => return None,
        Err(e) => return Some(Err(e)),
    };

    if op == ChangeOp::Delete {
        return Some(Ok(ChangeEvent::Deleted { id }));
    }

    match Scans::find_by_id(id.as_str()).one(&feed.db).await {
        Ok(Some(model)) => {
            let scan = Scan::from(model);
            Some(Ok(if op == ChangeOp::Insert {
                ChangeEvent::Inserted(scan)
            } else {
                ChangeEvent::Updated(scan)
            }))
        }
        Ok(None) => {
            // Deleted before we could read it; the DELETE notification follows
            debug!("Scan {} vanished before it could be read", id);
            None
        }
        Err(e) => Some(Err(SyncError::Subscription(format!(
            "failed to read scan {}: {}",
            id, e
        )))),
    }
}
