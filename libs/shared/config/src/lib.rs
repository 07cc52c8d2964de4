use std::env;
use tracing::warn;

/// Default interval for the polling-based store subscription, in milliseconds.
const DEFAULT_POLL_INTERVAL_MS: u64 = 1000;

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub signaling_store_url: String,
    pub signaling_store_anon_key: String,
    pub signaling_store_service_key: String,
    pub signaling_poll_interval_ms: u64,
    /// Auto-cancel an unanswered call after this many seconds. None disables.
    pub call_ring_timeout_secs: Option<u64>,
    /// Mark closed calls as ended/rejected instead of deleting the record.
    pub call_retain_history: bool,
}

impl AppConfig {
    pub fn from_env() -> Self {
        let config = Self {
            signaling_store_url: env::var("SIGNALING_STORE_URL")
                .unwrap_or_else(|_| {
                    warn!("SIGNALING_STORE_URL not set, using empty value");
                    String::new()
                }),
            signaling_store_anon_key: env::var("SIGNALING_STORE_ANON_KEY")
                .unwrap_or_else(|_| {
                    warn!("SIGNALING_STORE_ANON_KEY not set, using empty value");
                    String::new()
                }),
            signaling_store_service_key: env::var("SIGNALING_STORE_SERVICE_KEY")
                .unwrap_or_else(|_| String::new()),
            signaling_poll_interval_ms: env::var("SIGNALING_POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_POLL_INTERVAL_MS),
            call_ring_timeout_secs: env::var("CALL_RING_TIMEOUT_SECS")
                .ok()
                .and_then(|v| v.parse().ok()),
            call_retain_history: env::var("CALL_RETAIN_HISTORY")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(false),
        };

        if !config.is_configured() {
            warn!("Signaling store not fully configured - missing environment variables");
        }

        config
    }

    pub fn is_configured(&self) -> bool {
        !self.signaling_store_url.is_empty() && !self.signaling_store_anon_key.is_empty()
    }
}
