use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter, Registry};

pub const DEFAULT_LOG_FILTER: &str = "info,booking_sync=debug";

pub fn init_tracing(filter: &str) {
    let env_filter =
        EnvFilter::try_new(filter).unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER));
    let fmt_layer = tracing_subscriber::fmt::layer().with_target(true);
    Registry::default().with(env_filter).with(fmt_layer).init();
}
