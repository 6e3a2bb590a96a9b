//! Keeps one owner's scan list in step with the server and delivers the
//! first arrival of an analysis for the selected scan.

pub mod reducer;

pub use reducer::{
    AnalysisPhase, ScanListState, SelectedScan, Source, SyncEvent, Transition, reduce,
};

use futures::StreamExt;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tokio::time::{Instant, MissedTickBehavior, sleep};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::ScanConfig;
use crate::error::{StoreError, SyncError};
use crate::models::{Scan, Session};
use crate::services::analysis::{AnalysisStatus, parse_analysis};
use crate::services::scan_store::ScanStore;

/// One-off notifications for consumers that react to transitions rather
/// than re-rendering the whole list
#[derive(Debug, Clone, PartialEq)]
pub enum SyncNotice {
    AnalysisReady { id: String },
    SelectionCleared { id: String },
}

#[derive(Debug, Clone)]
pub struct SyncSettings {
    pub poll_interval: Duration,
    pub request_timeout: Duration,
    pub resubscribe_delay: Duration,
}

impl From<&ScanConfig> for SyncSettings {
    fn from(config: &ScanConfig) -> Self {
        Self {
            poll_interval: config.poll_interval,
            request_timeout: config.request_timeout,
            resubscribe_delay: config.resubscribe_delay,
        }
    }
}

struct PollTask {
    id: String,
    cancel: CancellationToken,
}

struct Inner {
    session: Session,
    store: Arc<dyn ScanStore>,
    settings: SyncSettings,
    state: watch::Sender<ScanListState>,
    notices: broadcast::Sender<SyncNotice>,
    poller: Mutex<Option<PollTask>>,
    shutdown: CancellationToken,
}

impl Drop for Inner {
    // Background tasks only hold weak references and exit on this token
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

/// Merges optimistic inserts, change feed events and poll results for one
/// owner into a single [`ScanListState`].
///
/// Cheap to clone. Methods that apply events may spawn the poll task and
/// must run inside a Tokio runtime. Dropping the last clone stops the
/// background tasks like [`shutdown`](Self::shutdown) does.
#[derive(Clone)]
pub struct AnalysisSynchronizer {
    inner: Arc<Inner>,
}

impl AnalysisSynchronizer {
    pub fn new(session: Session, store: Arc<dyn ScanStore>, settings: SyncSettings) -> Self {
        let (state, _) = watch::channel(ScanListState::default());
        let (notices, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                session,
                store,
                settings,
                state,
                notices,
                poller: Mutex::new(None),
                shutdown: CancellationToken::new(),
            }),
        }
    }

    /// Fetch the owner's list and attach the change feed
    pub async fn start(session: Session, store: Arc<dyn ScanStore>, settings: SyncSettings) -> Self {
        let sync = Self::new(session, store, settings);
        if let Err(e) = sync.refresh().await {
            warn!(
                "⚠️  Initial scan list fetch for user {} failed: {}",
                sync.owner_id(),
                e
            );
        }
        sync.spawn_change_feed();
        sync
    }

    pub fn session(&self) -> &Session {
        &self.inner.session
    }

    pub fn owner_id(&self) -> &str {
        &self.inner.session.owner_id
    }

    pub fn snapshot(&self) -> ScanListState {
        self.inner.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<ScanListState> {
        self.inner.state.subscribe()
    }

    pub fn notices(&self) -> broadcast::Receiver<SyncNotice> {
        self.inner.notices.subscribe()
    }

    /// Analysis status of a listed scan, `None` if the id is not listed
    pub fn analysis_status(&self, id: &str) -> Option<AnalysisStatus> {
        self.inner.state.borrow().get(id).map(AnalysisStatus::of)
    }

    /// Id of the scan currently being polled, if any
    pub fn polling(&self) -> Option<String> {
        self.lock_poller().as_ref().map(|task| task.id.clone())
    }

    /// Fold one event into the list and run its side effects
    pub fn apply(&self, event: SyncEvent) -> Transition {
        let event = match event {
            SyncEvent::Upsert { source, scan } if scan.owner_id != self.owner_id() => {
                warn!(
                    "Ignoring {:?} upsert of scan {} owned by another user",
                    source, scan.id
                );
                return Transition::default();
            }
            SyncEvent::Refreshed { mut scans, as_of } => {
                scans.retain(|s| s.owner_id == self.inner.session.owner_id);
                SyncEvent::Refreshed { scans, as_of }
            }
            other => other,
        };

        let merged_analysis = match &event {
            SyncEvent::Upsert { scan, .. } if scan.has_analysis() => Some(scan.id.clone()),
            _ => None,
        };

        let mut transition = Transition::default();
        self.inner.state.send_if_modified(|state| {
            let (next, t) = reduce(std::mem::take(state), event);
            *state = next;
            transition = t;
            transition.changed
        });

        if let Some(id) = merged_analysis.filter(|_| transition.changed) {
            self.warn_if_unreadable(&id);
        }

        if let Some(id) = &transition.analyzed {
            info!("✅ Analysis arrived for scan {}", id);
            let _ = self
                .inner
                .notices
                .send(SyncNotice::AnalysisReady { id: id.clone() });
        }
        if let Some(id) = &transition.selection_cleared {
            debug!("Selected scan {} went away", id);
            let _ = self
                .inner
                .notices
                .send(SyncNotice::SelectionCleared { id: id.clone() });
        }

        self.reconcile_poller();
        transition
    }

    pub fn merge_optimistic(&self, scan: Scan) -> Transition {
        self.apply(SyncEvent::Upsert {
            source: Source::Optimistic,
            scan,
        })
    }

    /// Select a listed scan (or clear with `None`). Polling follows the selection.
    pub fn select(&self, id: Option<&str>) -> Transition {
        self.apply(SyncEvent::Select(id.map(str::to_string)))
    }

    /// Replace the list with the server's view
    pub async fn refresh(&self) -> Result<(), StoreError> {
        let as_of = self.inner.state.borrow().revision();
        let scans = self.inner.store.list_scans(self.owner_id()).await?;
        debug!(
            "Fetched {} scans for user {}",
            scans.len(),
            self.owner_id()
        );
        self.apply(SyncEvent::Refreshed { scans, as_of });
        Ok(())
    }

    /// Delete on the server, then drop the entry locally
    pub async fn delete_scan(&self, id: &str) -> Result<(), StoreError> {
        self.inner.store.delete_scan(id).await?;
        self.apply(SyncEvent::Removed {
            source: Source::Local,
            id: id.to_string(),
        });
        Ok(())
    }

    /// Stop the change feed and any poll task. Used on logout and teardown.
    pub fn shutdown(&self) {
        info!("🛑 Stopping synchronizer for user {}", self.owner_id());
        self.inner.shutdown.cancel();
        if let Some(task) = self.lock_poller().take() {
            task.cancel.cancel();
        }
    }

    pub fn is_shut_down(&self) -> bool {
        self.inner.shutdown.is_cancelled()
    }

    fn warn_if_unreadable(&self, id: &str) {
        let state = self.inner.state.borrow();
        let Some(raw) = state.get(id).and_then(|scan| scan.analysis.as_ref()) else {
            return;
        };
        if let Err(failure) = parse_analysis(raw) {
            warn!("⚠️  Analysis of scan {} is unreadable: {}", id, failure);
        }
    }

    fn upgrade(inner: &Weak<Inner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    fn lock_poller(&self) -> std::sync::MutexGuard<'_, Option<PollTask>> {
        self.inner
            .poller
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Exactly one poll task while the selected scan lacks analysis, none otherwise
    fn reconcile_poller(&self) {
        let mut poller = self.lock_poller();
        let wanted = if self.is_shut_down() {
            None
        } else {
            self.inner
                .state
                .borrow()
                .awaiting_analysis()
                .map(str::to_string)
        };

        if poller.as_ref().map(|t| &t.id) == wanted.as_ref() {
            return;
        }

        if let Some(task) = poller.take() {
            task.cancel.cancel();
            debug!("⏹️  Stopped polling scan {}", task.id);
        }

        if let Some(id) = wanted {
            let cancel = self.inner.shutdown.child_token();
            self.spawn_poll(id.clone(), cancel.clone());
            *poller = Some(PollTask { id, cancel });
        }
    }

    fn spawn_poll(&self, id: String, cancel: CancellationToken) {
        let weak = Arc::downgrade(&self.inner);
        let period = self.inner.settings.poll_interval;
        info!("⏱️  Polling scan {} every {:?}", id, period);

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(this) = Self::upgrade(&weak) else { break };
                // Cancelling drops the in-flight request
                let outcome = tokio::select! {
                    biased;
                    _ = cancel.cancelled() => break,
                    outcome = this.poll_once(&id) => outcome,
                };
                if let Err(e) = outcome {
                    warn!("⚠️  {}", e);
                }
            }
            debug!("Poll task for scan {} finished", id);
        });
    }

    async fn poll_once(&self, id: &str) -> Result<(), SyncError> {
        let fetch = self.inner.store.get_scan(id);
        let scan = match tokio::time::timeout(self.inner.settings.request_timeout, fetch).await {
            Ok(Ok(scan)) => scan,
            Ok(Err(e)) => {
                return Err(SyncError::Poll {
                    id: id.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => {
                return Err(SyncError::Poll {
                    id: id.to_string(),
                    reason: format!(
                        "timed out after {:?}",
                        self.inner.settings.request_timeout
                    ),
                });
            }
        };

        match scan {
            Some(scan) => {
                self.apply(SyncEvent::Upsert {
                    source: Source::Poll,
                    scan,
                });
            }
            None => {
                info!("Scan {} no longer exists, dropping it", id);
                self.apply(SyncEvent::Removed {
                    source: Source::Poll,
                    id: id.to_string(),
                });
            }
        }
        Ok(())
    }

    fn spawn_change_feed(&self) {
        let weak = Arc::downgrade(&self.inner);
        let store = self.inner.store.clone();
        let shutdown = self.inner.shutdown.clone();
        let owner_id = self.owner_id().to_string();
        let resubscribe_delay = self.inner.settings.resubscribe_delay;

        tokio::spawn(async move {
            loop {
                let subscribed = tokio::select! {
                    _ = shutdown.cancelled() => break,
                    res = store.subscribe_changes(&owner_id) => res,
                };

                match subscribed {
                    Ok(mut stream) => {
                        info!("📡 Change feed connected for user {}", owner_id);
                        // Changes made before the subscription was live were never pushed
                        let Some(this) = Self::upgrade(&weak) else { break };
                        if let Err(e) = this.refresh().await {
                            warn!("⚠️  Re-sync after connecting failed: {}", e);
                        }
                        drop(this);

                        loop {
                            tokio::select! {
                                _ = shutdown.cancelled() => return,
                                next = stream.next() => match next {
                                    Some(Ok(event)) => {
                                        let Some(this) = Self::upgrade(&weak) else { return };
                                        debug!("Change feed event for scan {}", event.scan_id());
                                        this.apply(event.into());
                                    }
                                    Some(Err(e)) => warn!("⚠️  {}", e),
                                    None => {
                                        warn!("Change feed for user {} ended", owner_id);
                                        break;
                                    }
                                }
                            }
                        }
                    }
                    Err(e) if e.code() == Some("unsupported") => {
                        info!(
                            "No change feed available for user {}, relying on polling",
                            owner_id
                        );
                        return;
                    }
                    Err(e) => warn!(
                        "⚠️  {}",
                        SyncError::Subscription(e.to_string())
                    ),
                }

                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = sleep(resubscribe_delay) => {}
                }
            }
            debug!("Change feed task for user {} stopped", owner_id);
        });
    }
}
