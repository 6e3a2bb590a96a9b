#![allow(dead_code)]

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use futures::channel::mpsc;
use letter_scan::StoreError;
use letter_scan::error::SyncError;
use letter_scan::models::{Language, Scan};
use letter_scan::services::scan_store::{ChangeEvent, ChangeStream, ScanStore};
use letter_scan::services::storage::StorageService;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::{Arc, Mutex};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use tokio::sync::Notify;

pub const PUBLIC_BASE: &str = "https://cdn.test";

pub struct MockStorageService {
    pub files: Mutex<HashMap<String, Vec<u8>>>,
    pub puts: AtomicUsize,
    failures_left: AtomicUsize,
}

impl MockStorageService {
    pub fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            puts: AtomicUsize::new(0),
            failures_left: AtomicUsize::new(0),
        }
    }

    /// Fail the next `n` puts
    pub fn fail_next(&self, n: usize) {
        self.failures_left.store(n, Ordering::SeqCst);
    }

    pub fn stored(&self) -> usize {
        self.files.lock().unwrap().len()
    }
}

#[async_trait]
impl StorageService for MockStorageService {
    async fn put_object(&self, path: &str, data: Vec<u8>, _content_type: &str) -> anyhow::Result<()> {
        self.puts.fetch_add(1, Ordering::SeqCst);
        let failing = self
            .failures_left
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("connection reset by peer");
        }
        self.files.lock().unwrap().insert(path.to_string(), data);
        Ok(())
    }

    fn public_url(&self, path: &str) -> String {
        format!("{}/{}", PUBLIC_BASE, path)
    }
}

/// Scan table in memory plus a hand-driven change feed
pub struct InMemoryScanStore {
    scans: Mutex<Vec<Scan>>,
    feeds: Mutex<Vec<mpsc::UnboundedSender<Result<ChangeEvent, SyncError>>>>,
    pub feed_supported: AtomicBool,
    pub fail_create: AtomicBool,
    pub fail_reads: AtomicBool,
    pub creates: AtomicUsize,
    pub counts: AtomicUsize,
    pub gets: AtomicUsize,
    pub lists: AtomicUsize,
    pub subscriptions: AtomicUsize,
    get_gate: Mutex<Option<Arc<Notify>>>,
}

impl InMemoryScanStore {
    pub fn new() -> Self {
        Self {
            scans: Mutex::new(Vec::new()),
            feeds: Mutex::new(Vec::new()),
            feed_supported: AtomicBool::new(true),
            fail_create: AtomicBool::new(false),
            fail_reads: AtomicBool::new(false),
            creates: AtomicUsize::new(0),
            counts: AtomicUsize::new(0),
            gets: AtomicUsize::new(0),
            lists: AtomicUsize::new(0),
            subscriptions: AtomicUsize::new(0),
            get_gate: Mutex::new(None),
        }
    }

    pub fn insert(&self, scan: Scan) {
        self.scans.lock().unwrap().push(scan);
    }

    /// Write an analysis the way the worker does, without emitting an event
    pub fn set_analysis(&self, id: &str, analysis: serde_json::Value) -> Option<Scan> {
        let mut scans = self.scans.lock().unwrap();
        let scan = scans.iter_mut().find(|s| s.id == id)?;
        scan.analysis = Some(analysis);
        Some(scan.clone())
    }

    pub fn remove(&self, id: &str) {
        self.scans.lock().unwrap().retain(|s| s.id != id);
    }

    /// Deliver an event to every open subscription
    pub fn push(&self, event: ChangeEvent) {
        let feeds = self.feeds.lock().unwrap();
        for feed in feeds.iter() {
            let _ = feed.unbounded_send(Ok(event.clone()));
        }
    }

    /// End every open subscription
    pub fn drop_feeds(&self) {
        self.feeds.lock().unwrap().clear();
    }

    /// Make `get_scan` wait for a permit on the returned `Notify`
    pub fn gate_gets(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.get_gate.lock().unwrap() = Some(gate.clone());
        gate
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }

    fn check_reads(&self) -> Result<(), StoreError> {
        if self.fail_reads.load(Ordering::SeqCst) {
            return Err(StoreError::Network("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl ScanStore for InMemoryScanStore {
    async fn create_scan(
        &self,
        image_url: &str,
        language: Language,
        owner_id: &str,
    ) -> Result<Scan, StoreError> {
        self.creates.fetch_add(1, Ordering::SeqCst);
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                message: "permission denied for table scans".to_string(),
                code: Some("42501".to_string()),
            });
        }
        let scan = Scan {
            id: uuid::Uuid::new_v4().to_string(),
            image_url: image_url.to_string(),
            created_at: Utc::now(),
            language,
            owner_id: owner_id.to_string(),
            analysis: None,
        };
        self.insert(scan.clone());
        Ok(scan)
    }

    async fn get_scan(&self, id: &str) -> Result<Option<Scan>, StoreError> {
        self.gets.fetch_add(1, Ordering::SeqCst);
        let gate = self.get_gate.lock().unwrap().clone();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.check_reads()?;
        Ok(self.scans.lock().unwrap().iter().find(|s| s.id == id).cloned())
    }

    async fn list_scans(&self, owner_id: &str) -> Result<Vec<Scan>, StoreError> {
        self.lists.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        let mut scans: Vec<Scan> = self
            .scans
            .lock()
            .unwrap()
            .iter()
            .filter(|s| s.owner_id == owner_id)
            .cloned()
            .collect();
        scans.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(scans)
    }

    async fn count_scans(&self, owner_id: &str) -> Result<u64, StoreError> {
        self.counts.fetch_add(1, Ordering::SeqCst);
        self.check_reads()?;
        let scans = self.scans.lock().unwrap();
        Ok(scans.iter().filter(|s| s.owner_id == owner_id).count() as u64)
    }

    async fn delete_scan(&self, id: &str) -> Result<(), StoreError> {
        self.remove(id);
        Ok(())
    }

    async fn subscribe_changes(&self, owner_id: &str) -> Result<ChangeStream, StoreError> {
        self.subscriptions.fetch_add(1, Ordering::SeqCst);
        if !self.feed_supported.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected {
                message: "no realtime".to_string(),
                code: Some("unsupported".to_string()),
            });
        }
        let (tx, rx) = mpsc::unbounded();
        self.feeds.lock().unwrap().push(tx);
        let owner_id = owner_id.to_string();
        let stream = rx.filter(move |event| {
            let keep = match event {
                Ok(ChangeEvent::Inserted(scan)) | Ok(ChangeEvent::Updated(scan)) => {
                    scan.owner_id == owner_id
                }
                _ => true,
            };
            futures::future::ready(keep)
        });
        Ok(stream.boxed())
    }
}

pub fn scan(id: &str, owner: &str, minutes_ago: i64) -> Scan {
    Scan {
        id: id.to_string(),
        image_url: format!("{}/scans/{}.jpg", PUBLIC_BASE, id),
        created_at: Utc::now() - chrono::Duration::minutes(minutes_ago),
        language: Language::De,
        owner_id: owner.to_string(),
        analysis: None,
    }
}

/// Worker-shaped analysis payload
pub fn analysis(sender: &str) -> serde_json::Value {
    serde_json::json!({
        "content": [{
            "type": "text",
            "text": format!("```json\n{{\"sender\": \"{}\", \"urgency\": \"high\"}}\n```", sender)
        }]
    })
}

/// Small PNG with some texture so JPEG sizes respond to quality
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = image::RgbImage::from_fn(width, height, |x, y| {
        image::Rgb([(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x ^ y) % 256) as u8])
    });
    let mut buf = Vec::new();
    image::DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), image::ImageOutputFormat::Png)
        .unwrap();
    buf
}
