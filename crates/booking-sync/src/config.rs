use std::time::Duration;

pub const DEFAULT_POLLING_INTERVAL: Duration = Duration::from_secs(30);
pub const DEFAULT_FALLBACK_DELAY: Duration = Duration::from_secs(1);
pub const DEFAULT_MAX_CONSECUTIVE_ERRORS: u32 = 3;
pub const DEFAULT_REPORT_INTERVAL: Duration = Duration::from_secs(60);
pub const CONNECTIVITY_PATTERNS: [&str; 3] = ["failed to establish", "connection lost", "timed out"];

/// Session options supplied by the caller at `start`.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Attempt the push channel first. When false the session polls from the start.
    pub enabled: bool,
    pub fallback_to_polling: bool,
    pub polling_interval: Duration,
    /// Pause between a push failure and the first poll.
    pub fallback_delay: Duration,
    pub throttle: ThrottleConfig,
    pub channel: ChannelConfig,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            fallback_to_polling: true,
            polling_interval: DEFAULT_POLLING_INTERVAL,
            fallback_delay: DEFAULT_FALLBACK_DELAY,
            throttle: ThrottleConfig::default(),
            channel: ChannelConfig::default(),
        }
    }
}

impl SyncOptions {
    /// Defaults overridden by `BOOKING_SYNC_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Like [`SyncOptions::from_env`], reading variables through `lookup`.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let flag = |name: &str| lookup(name).and_then(|value| parse_flag(&value));
        let millis = |name: &str| lookup(name).and_then(|value| parse_millis(&value));

        let enabled = flag("BOOKING_SYNC_REALTIME").unwrap_or(defaults.enabled);
        let fallback_to_polling =
            flag("BOOKING_SYNC_FALLBACK").unwrap_or(defaults.fallback_to_polling);
        let polling_interval =
            millis("BOOKING_SYNC_POLL_INTERVAL_MS").unwrap_or(defaults.polling_interval);
        let fallback_delay =
            millis("BOOKING_SYNC_FALLBACK_DELAY_MS").unwrap_or(defaults.fallback_delay);
        let max_consecutive_errors = lookup("BOOKING_SYNC_MAX_ERRORS")
            .and_then(|v| v.trim().parse().ok())
            .filter(|v: &u32| *v > 0)
            .unwrap_or(defaults.throttle.max_consecutive_errors);
        let report_interval =
            millis("BOOKING_SYNC_ERROR_WINDOW_MS").unwrap_or(defaults.throttle.report_interval);
        let table = lookup("BOOKING_SYNC_TABLE").unwrap_or(defaults.channel.table);
        let schema = lookup("BOOKING_SYNC_SCHEMA").unwrap_or(defaults.channel.schema);
        Self {
            enabled,
            fallback_to_polling,
            polling_interval,
            fallback_delay,
            throttle: ThrottleConfig {
                max_consecutive_errors,
                report_interval,
                ..defaults.throttle
            },
            channel: ChannelConfig {
                schema,
                table,
                ..defaults.channel
            },
        }
    }
}

#[derive(Debug, Clone)]
pub struct ThrottleConfig {
    pub max_consecutive_errors: u32,
    pub report_interval: Duration,
    /// Lowercase substrings that mark a message as connectivity related.
    pub connectivity_patterns: Vec<String>,
}

impl Default for ThrottleConfig {
    fn default() -> Self {
        Self {
            max_consecutive_errors: DEFAULT_MAX_CONSECUTIVE_ERRORS,
            report_interval: DEFAULT_REPORT_INTERVAL,
            connectivity_patterns: CONNECTIVITY_PATTERNS.iter().map(|p| p.to_string()).collect(),
        }
    }
}

/// Where booking rows live on the push channel and how they are scoped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelConfig {
    pub schema: String,
    pub table: String,
    pub client_column: String,
    pub provider_column: String,
    pub channel_prefix: String,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            schema: "public".into(),
            table: "bookings".into(),
            client_column: "client_id".into(),
            provider_column: "consultant_id".into(),
            channel_prefix: "booking-status".into(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn parse_millis(value: &str) -> Option<Duration> {
    value
        .trim()
        .parse::<u64>()
        .ok()
        .filter(|ms| *ms > 0)
        .map(Duration::from_millis)
}
