use std::env;
use std::time::Duration;

/// Tuning for the scan ingestion pipeline and the analysis synchronizer
#[derive(Debug, Clone)]
pub struct ScanConfig {
    /// Soft ceiling for the compressed image in bytes (default: 1 MB)
    pub target_bytes: usize,

    /// Images wider than this are scaled down before encoding (default: 1600 px)
    pub max_width: u32,

    /// JPEG quality of the first encoding attempt (default: 80)
    pub initial_quality: u8,

    /// Quality decrement between attempts (default: 10)
    pub quality_step: u8,

    /// Lowest quality the compressor will try (default: 20)
    pub quality_floor: u8,

    /// Hard ceiling: a best-effort image above this is not uploaded (default: 5 MB)
    pub max_upload_bytes: usize,

    /// Object key prefix for uploaded scans (default: "scans")
    pub public_prefix: String,

    /// Scans a free account may store (default: 3)
    pub free_tier_limit: u64,

    /// Upload attempts per ingestion, including the first (default: 2)
    pub upload_attempts: u32,

    /// Pause between upload attempts (default: 500 ms)
    pub upload_retry_delay: Duration,

    /// Poll interval while the selected scan awaits analysis (default: 5 s)
    pub poll_interval: Duration,

    /// Upper bound for a single upload or poll request (default: 30 s)
    pub request_timeout: Duration,

    /// Wait before re-subscribing after the change feed dropped (default: 5 s)
    pub resubscribe_delay: Duration,

    /// Base URL of the bookkeeping backend, notifications are skipped when unset
    pub backend_url: Option<String>,

    /// Bearer token sent with backend notifications
    pub backend_token: Option<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            target_bytes: 1_000_000,
            max_width: 1600,
            initial_quality: 80,
            quality_step: 10,
            quality_floor: 20,
            max_upload_bytes: 5 * 1024 * 1024, // 5 MB
            public_prefix: "scans".to_string(),
            free_tier_limit: 3,
            upload_attempts: 2,
            upload_retry_delay: Duration::from_millis(500),
            poll_interval: Duration::from_secs(5),
            request_timeout: Duration::from_secs(30),
            resubscribe_delay: Duration::from_secs(5),
            backend_url: None,
            backend_token: None,
        }
    }
}

impl ScanConfig {
    /// Load configuration from environment variables
    pub fn from_env() -> Self {
        let default = Self::default();

        Self {
            target_bytes: parse_var("SCAN_TARGET_BYTES").unwrap_or(default.target_bytes),

            max_width: parse_var("SCAN_MAX_WIDTH").unwrap_or(default.max_width),

            initial_quality: parse_var("SCAN_INITIAL_QUALITY")
                .map(|q: u8| q.clamp(1, 100))
                .unwrap_or(default.initial_quality),

            quality_step: parse_var("SCAN_QUALITY_STEP")
                .filter(|s: &u8| *s > 0)
                .unwrap_or(default.quality_step),

            quality_floor: parse_var("SCAN_QUALITY_FLOOR")
                .map(|q: u8| q.clamp(1, 100))
                .unwrap_or(default.quality_floor),

            max_upload_bytes: parse_var("SCAN_MAX_UPLOAD_BYTES")
                .unwrap_or(default.max_upload_bytes),

            public_prefix: env::var("SCAN_PUBLIC_PREFIX")
                .map(|v| v.trim_matches('/').to_string())
                .unwrap_or(default.public_prefix),

            free_tier_limit: parse_var("FREE_TIER_LIMIT").unwrap_or(default.free_tier_limit),

            upload_attempts: parse_var("UPLOAD_ATTEMPTS")
                .map(|n: u32| n.max(1))
                .unwrap_or(default.upload_attempts),

            upload_retry_delay: parse_var("UPLOAD_RETRY_DELAY_MS")
                .map(Duration::from_millis)
                .unwrap_or(default.upload_retry_delay),

            poll_interval: parse_var("POLL_INTERVAL_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.poll_interval),

            request_timeout: parse_var("REQUEST_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.request_timeout),

            resubscribe_delay: parse_var("RESUBSCRIBE_DELAY_SECS")
                .map(Duration::from_secs)
                .unwrap_or(default.resubscribe_delay),

            backend_url: env::var("BACKEND_URL").ok().filter(|v| !v.is_empty()),
            backend_token: env::var("BACKEND_TOKEN").ok().filter(|v| !v.is_empty()),
        }
    }

    /// Create config for development (no quota, fast polling)
    pub fn development() -> Self {
        Self {
            free_tier_limit: u64::MAX,
            poll_interval: Duration::from_secs(2),
            request_timeout: Duration::from_secs(10),
            resubscribe_delay: Duration::from_secs(1),
            ..Self::default()
        }
    }
}

fn parse_var<T: std::str::FromStr>(key: &str) -> Option<T> {
    env::var(key).ok().and_then(|v| v.trim().parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = ScanConfig::default();
        assert_eq!(config.target_bytes, 1_000_000);
        assert_eq!(config.free_tier_limit, 3);
        assert_eq!(config.poll_interval, Duration::from_secs(5));
        assert!(config.initial_quality > config.quality_floor);
        assert!(config.backend_url.is_none());
    }

    #[test]
    fn test_development_config() {
        let config = ScanConfig::development();
        assert_eq!(config.free_tier_limit, u64::MAX);
        assert_eq!(config.max_width, ScanConfig::default().max_width);
    }
}
