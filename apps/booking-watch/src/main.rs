mod config;
mod telemetry;

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use booking_sync::{
    AuthProvider, BookingId, BookingStatus, BookingSync, EnvAuth, FileIdentityCache,
    HttpBookingApi, IdentityCache, MemoryIdentityCache, StatusPoller, SyncHandlers,
    WatchedBooking,
};
use clap::Parser;
use config::Cli;
use push_channel::UnavailableChannel;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    telemetry::init_tracing(&cli.log_filter);

    if cli.bookings.is_empty() && cli.detail.is_none() {
        bail!("nothing to watch: pass --booking <id[:status]> or --detail <id>");
    }

    let auth: Arc<dyn AuthProvider> = Arc::new(EnvAuth);
    if auth.token().is_none() {
        warn!("BOOKING_SYNC_TOKEN is not set; requests go out unauthenticated");
    }
    let api = Arc::new(
        HttpBookingApi::new(&cli.api_url, Arc::clone(&auth))
            .with_context(|| format!("invalid api url {}", cli.api_url))?,
    );
    let identity_cache: Arc<dyn IdentityCache> = match FileIdentityCache::default_path() {
        Some(path) => Arc::new(FileIdentityCache::open(path)),
        None => Arc::new(MemoryIdentityCache::new()),
    };
    // No realtime endpoint is wired here; sessions demote to polling.
    let channel = Arc::new(UnavailableChannel::new("no realtime endpoint configured"));

    let options = cli.sync_options();
    info!(
        api = %api.base_url(),
        bookings = cli.bookings.len(),
        poll_interval_ms = options.polling_interval.as_millis() as u64,
        fallback = options.fallback_to_polling,
        "starting booking-watch"
    );

    let sync = BookingSync::new(api.clone(), channel, auth).with_identity_cache(identity_cache);
    let handlers = SyncHandlers::new(|id: &BookingId, status| {
        info!(booking = %id, %status, "booking status changed");
    })
    .on_error(|message: &str| {
        warn!(error = %message, "booking sync error");
    });
    let detail = cli.detail.as_deref().map(|id| {
        StatusPoller::spawn(
            api.clone(),
            WatchedBooking::new(id, BookingStatus::Pending),
            options.polling_interval,
            |update| info!(booking = %update.id, status = %update.status, "detail status"),
        )
    });
    let handle = sync.start(cli.bookings.clone(), options, handlers);

    let mut status = handle.subscribe_status();
    let shutdown = tokio::signal::ctrl_c();
    tokio::pin!(shutdown);
    loop {
        tokio::select! {
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = *status.borrow_and_update();
                info!(
                    state = ?snapshot.state,
                    connection = %snapshot.connection_type,
                    connected = snapshot.is_connected,
                    "sync status"
                );
            }
            result = &mut shutdown => {
                result.context("listening for ctrl-c")?;
                info!("shutting down");
                break;
            }
        }
    }

    handle.stop();
    if let Some(poller) = detail {
        poller.stop();
    }
    Ok(())
}
