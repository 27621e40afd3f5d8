use tokio::time::Instant;

use crate::config::ThrottleConfig;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ThrottleDecision {
    /// Forward the message to the caller.
    Report(String),
    /// Keep quiet; the failure is counted but not surfaced.
    Suppress,
    /// The failure cap was reached. Carries the final message to surface.
    Disable(String),
}

/// Counts consecutive connectivity failures and rate-limits what reaches the
/// caller's error callback.
#[derive(Debug, Clone)]
pub struct ErrorThrottle {
    config: ThrottleConfig,
    consecutive_errors: u32,
    last_error_at: Option<Instant>,
    last_reported_at: Option<Instant>,
    disabled: bool,
}

impl ErrorThrottle {
    pub fn new(config: ThrottleConfig) -> Self {
        Self {
            config,
            consecutive_errors: 0,
            last_error_at: None,
            last_reported_at: None,
            disabled: false,
        }
    }

    pub fn record(&mut self, message: &str) -> ThrottleDecision {
        self.record_at(message, Instant::now())
    }

    pub fn record_at(&mut self, message: &str, now: Instant) -> ThrottleDecision {
        if self.disabled {
            return ThrottleDecision::Suppress;
        }
        self.consecutive_errors = self.consecutive_errors.saturating_add(1);
        self.last_error_at = Some(now);

        if self.consecutive_errors >= self.config.max_consecutive_errors {
            self.disabled = true;
            return ThrottleDecision::Disable(format!(
                "live booking updates disabled after {} consecutive connection failures: {message}",
                self.consecutive_errors
            ));
        }

        if !self.is_connectivity(message) {
            return ThrottleDecision::Suppress;
        }
        if let Some(last) = self.last_reported_at {
            if now.saturating_duration_since(last) < self.config.report_interval {
                return ThrottleDecision::Suppress;
            }
        }
        self.last_reported_at = Some(now);
        ThrottleDecision::Report(message.to_string())
    }

    /// Clears the failure streak. The report window is kept so a flapping
    /// connection still reports at most once per interval.
    pub fn reset(&mut self) {
        self.consecutive_errors = 0;
    }

    pub fn is_connectivity(&self, message: &str) -> bool {
        let lowered = message.to_ascii_lowercase();
        self.config
            .connectivity_patterns
            .iter()
            .any(|pattern| lowered.contains(pattern.as_str()))
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors
    }

    pub fn last_error_at(&self) -> Option<Instant> {
        self.last_error_at
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }
}

impl Default for ErrorThrottle {
    fn default() -> Self {
        Self::new(ThrottleConfig::default())
    }
}
