use std::time::Duration;

use crate::backoff::BackoffConfig;

/// Fixed namespace for the persisted outbox blob. The version suffix exists
/// so a future format change can migrate by reading the old key.
pub const OUTBOX_STORAGE_KEY: &str = "appeals:outbox:v1";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub backoff: BackoffConfig,
    /// Quiet window after the last visibility change before a read-receipt
    /// batch is flushed.
    pub read_debounce: Duration,
    /// How long the position resolver waits for the renderer to confirm the
    /// anchor is visible before force-aligning to bottom.
    pub anchor_settle_timeout: Duration,
    /// Viewport fraction at which the anchor message is placed, leaving the
    /// unread content visible below the separator.
    pub anchor_viewport_fraction: f32,
    pub storage_key: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            backoff: BackoffConfig::outbox_default(),
            read_debounce: Duration::from_millis(300),
            anchor_settle_timeout: Duration::from_millis(1500),
            anchor_viewport_fraction: 0.25,
            storage_key: OUTBOX_STORAGE_KEY.to_string(),
        }
    }
}

impl SyncConfig {
    /// Defaults with millisecond overrides from the environment, for field
    /// tuning without a rebuild.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = parse_ms_env("APPEAL_SYNC_READ_DEBOUNCE_MS") {
            config.read_debounce = ms;
        }
        if let Some(ms) = parse_ms_env("APPEAL_SYNC_ANCHOR_TIMEOUT_MS") {
            config.anchor_settle_timeout = ms;
        }
        if let Some(ms) = parse_ms_env("APPEAL_SYNC_BACKOFF_BASE_MS") {
            config.backoff.base_delay = ms;
        }
        if let Some(ms) = parse_ms_env("APPEAL_SYNC_BACKOFF_CAP_MS") {
            config.backoff.max_delay = ms;
        }

        config
    }
}

fn parse_ms_env(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|raw| raw.trim().parse::<u64>().ok())
        .map(Duration::from_millis)
}
