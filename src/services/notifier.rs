use reqwest::Client;
use serde::Serialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::models::Language;

#[derive(Debug, Serialize)]
struct ScanCreated<'a> {
    language: &'a str,
}

/// Client for the bookkeeping endpoint `POST /scans`. Calls are best
/// effort: failures are logged and never reach the caller.
#[derive(Clone)]
pub struct BackendNotifier {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl BackendNotifier {
    pub fn new(base_url: &str, token: Option<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }

    pub fn endpoint(&self) -> String {
        format!("{}/scans", self.base_url)
    }

    /// Send the notification and swallow any failure
    pub async fn notify_scan_created(&self, language: Language) {
        if let Err(e) = self.try_notify(language).await {
            warn!("⚠️  Backend notification failed: {}", e);
        }
    }

    /// Fire and forget on the runtime
    pub fn spawn_notify(&self, language: Language) {
        let notifier = self.clone();
        tokio::spawn(async move { notifier.notify_scan_created(language).await });
    }

    async fn try_notify(&self, language: Language) -> anyhow::Result<()> {
        let mut request = self.client.post(self.endpoint()).json(&ScanCreated {
            language: language.code(),
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }

        let response = request.send().await?;
        let status = response.status();
        if !status.is_success() {
            anyhow::bail!("backend answered {}", status);
        }
        debug!("Backend acknowledged scan ({})", status);
        Ok(())
    }
}
