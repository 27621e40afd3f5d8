use std::time::Duration;

use booking_sync::{BookingStatus, SyncOptions, WatchedBooking};
use clap::Parser;

use crate::telemetry::DEFAULT_LOG_FILTER;

/// Watch booking statuses from the terminal.
#[derive(Parser, Debug, Clone)]
#[command(name = "booking-watch", version)]
pub struct Cli {
    /// Base URL of the booking REST API, e.g. `https://api.example.com/api`.
    #[arg(long, env = "BOOKING_SYNC_API_URL")]
    pub api_url: String,

    /// Booking to watch as `<id>` or `<id>:<status>`; repeatable.
    #[arg(
        long = "booking",
        env = "BOOKING_SYNC_BOOKINGS",
        value_delimiter = ',',
        value_parser = parse_booking
    )]
    pub bookings: Vec<WatchedBooking>,

    /// Follow a single booking with its own poller, as a detail view would.
    #[arg(long, env = "BOOKING_SYNC_DETAIL")]
    pub detail: Option<String>,

    #[arg(long, env = "BOOKING_SYNC_POLL_INTERVAL_MS")]
    pub poll_interval_ms: Option<u64>,

    /// Stop instead of polling when the realtime channel fails.
    #[arg(long, env = "BOOKING_SYNC_NO_FALLBACK")]
    pub no_fallback: bool,

    #[arg(long, env = "RUST_LOG", default_value = DEFAULT_LOG_FILTER)]
    pub log_filter: String,
}

impl Cli {
    /// `BOOKING_SYNC_*` defaults with command-line overrides applied.
    pub fn sync_options(&self) -> SyncOptions {
        let mut options = SyncOptions::from_env();
        if let Some(ms) = self.poll_interval_ms.filter(|ms| *ms > 0) {
            options.polling_interval = Duration::from_millis(ms);
        }
        if self.no_fallback {
            options.fallback_to_polling = false;
        }
        options
    }
}

fn parse_booking(raw: &str) -> Result<WatchedBooking, String> {
    let (id, status) = match raw.split_once(':') {
        Some((id, status)) => {
            let status = BookingStatus::parse(status)
                .ok_or_else(|| format!("unknown booking status `{status}`"))?;
            (id, status)
        }
        None => (raw, BookingStatus::Pending),
    };
    let id = id.trim();
    if id.is_empty() {
        return Err("booking id must not be empty".into());
    }
    Ok(WatchedBooking::new(id, status))
}
