use std::{fs, time::Duration};

use serde::Deserialize;

/// Tunables of the synchronization core.
#[derive(Debug, Clone)]
pub struct SyncSettings {
    /// Live tail window per open conversation.
    pub page_size: usize,
    /// Backward page size for `load_older`.
    pub older_page_size: usize,
    /// Trailing debounce applied to typing signals.
    pub typing_debounce: Duration,
    /// Age after which a typing signal is treated as expired.
    pub typing_ttl: Duration,
    /// Age after which a presence record is treated as offline.
    pub presence_ttl: Duration,
    pub heartbeat_interval: Duration,
    /// How long an optimistic write may wait for its server echo.
    pub reconcile_timeout: Duration,
    /// Automatic retries for idempotent mutations on transient failures.
    pub mutation_retries: u32,
    pub retry_backoff: Duration,
    pub resubscribe_delay: Duration,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            page_size: 50,
            older_page_size: 30,
            typing_debounce: Duration::from_secs(2),
            typing_ttl: Duration::from_secs(5),
            presence_ttl: Duration::from_secs(90),
            heartbeat_interval: Duration::from_secs(30),
            reconcile_timeout: Duration::from_secs(10),
            mutation_retries: 1,
            retry_backoff: Duration::from_millis(250),
            resubscribe_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct SettingsFile {
    page_size: Option<usize>,
    older_page_size: Option<usize>,
    typing_debounce_ms: Option<u64>,
    typing_ttl_ms: Option<u64>,
    presence_ttl_ms: Option<u64>,
    heartbeat_interval_ms: Option<u64>,
    reconcile_timeout_ms: Option<u64>,
    mutation_retries: Option<u32>,
    retry_backoff_ms: Option<u64>,
    resubscribe_delay_ms: Option<u64>,
}

/// Defaults, overlaid by `sync.toml` when present, overlaid by `APP__*`
/// environment variables.
pub fn load_settings() -> SyncSettings {
    let mut settings = SyncSettings::default();

    if let Ok(raw) = fs::read_to_string("sync.toml") {
        if let Ok(file) = toml::from_str::<SettingsFile>(&raw) {
            apply_file(&mut settings, file);
        }
    }

    if let Some(v) = env_usize("APP__PAGE_SIZE") {
        settings.page_size = v;
    }
    if let Some(v) = env_usize("APP__OLDER_PAGE_SIZE") {
        settings.older_page_size = v;
    }
    if let Some(v) = env_ms("APP__TYPING_DEBOUNCE_MS") {
        settings.typing_debounce = v;
    }
    if let Some(v) = env_ms("APP__TYPING_TTL_MS") {
        settings.typing_ttl = v;
    }
    if let Some(v) = env_ms("APP__PRESENCE_TTL_MS") {
        settings.presence_ttl = v;
    }
    if let Some(v) = env_ms("APP__HEARTBEAT_INTERVAL_MS") {
        settings.heartbeat_interval = v;
    }
    if let Some(v) = env_ms("APP__RECONCILE_TIMEOUT_MS") {
        settings.reconcile_timeout = v;
    }
    if let Ok(v) = std::env::var("APP__MUTATION_RETRIES") {
        if let Ok(parsed) = v.parse::<u32>() {
            settings.mutation_retries = parsed;
        }
    }
    if let Some(v) = env_ms("APP__RETRY_BACKOFF_MS") {
        settings.retry_backoff = v;
    }
    if let Some(v) = env_ms("APP__RESUBSCRIBE_DELAY_MS") {
        settings.resubscribe_delay = v;
    }

    settings
}

fn apply_file(settings: &mut SyncSettings, file: SettingsFile) {
    if let Some(v) = file.page_size {
        settings.page_size = v;
    }
    if let Some(v) = file.older_page_size {
        settings.older_page_size = v;
    }
    if let Some(v) = file.typing_debounce_ms {
        settings.typing_debounce = Duration::from_millis(v);
    }
    if let Some(v) = file.typing_ttl_ms {
        settings.typing_ttl = Duration::from_millis(v);
    }
    if let Some(v) = file.presence_ttl_ms {
        settings.presence_ttl = Duration::from_millis(v);
    }
    if let Some(v) = file.heartbeat_interval_ms {
        settings.heartbeat_interval = Duration::from_millis(v);
    }
    if let Some(v) = file.reconcile_timeout_ms {
        settings.reconcile_timeout = Duration::from_millis(v);
    }
    if let Some(v) = file.mutation_retries {
        settings.mutation_retries = v;
    }
    if let Some(v) = file.retry_backoff_ms {
        settings.retry_backoff = Duration::from_millis(v);
    }
    if let Some(v) = file.resubscribe_delay_ms {
        settings.resubscribe_delay = Duration::from_millis(v);
    }
}

fn env_ms(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok().and_then(|v| v.parse::<usize>().ok())
}
