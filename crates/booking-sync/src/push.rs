use std::ops::ControlFlow;
use std::sync::Arc;

use push_channel::{
    ChangeType, ChannelEvent, ChannelStatus, PushChannel, Subscription, SubscriptionHandle,
};
use tracing::{debug, info, warn};

use crate::config::ChannelConfig;
use crate::error::SyncResult;
use crate::identity::build_filter;
use crate::{BookingId, BookingStatus, BookingUpdate, CallerIdentity, Role};

/// Controller-facing view of what the push channel reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PushSignal {
    Subscribed,
    /// Connectivity-classified failure message.
    Failed(String),
    Update(BookingUpdate),
}

/// Opens identity-scoped booking subscriptions on a [`PushChannel`].
#[derive(Clone)]
pub struct PushAdapter {
    channel: Arc<dyn PushChannel>,
    config: ChannelConfig,
}

impl PushAdapter {
    pub fn new(channel: Arc<dyn PushChannel>, config: ChannelConfig) -> Self {
        Self { channel, config }
    }

    /// Unique per attempt so a reconnect never joins a half-closed channel.
    pub fn channel_name(&self, identity: &CallerIdentity) -> String {
        let role = match identity.role {
            Role::Client => "client",
            Role::Provider => "provider",
        };
        format!(
            "{}-{role}-{}-{}",
            self.config.channel_prefix,
            identity.id,
            uuid::Uuid::new_v4().simple()
        )
    }

    pub fn open(&self, identity: &CallerIdentity) -> SyncResult<Subscription> {
        let filter = build_filter(identity, &self.config);
        let name = self.channel_name(identity);
        debug!(
            target = "sync.push",
            channel = %name,
            filter = filter.filter.as_deref().unwrap_or("*"),
            "opening booking subscription"
        );
        Ok(self.channel.subscribe(&name, filter)?)
    }

    /// Opens the subscription and pumps translated signals into `on_signal`
    /// until it breaks or the stream ends. `on_open` receives the teardown
    /// handle before any event is read; returning `false` aborts right away.
    pub async fn run<O, F>(&self, identity: &CallerIdentity, on_open: O, mut on_signal: F)
    where
        O: FnOnce(SubscriptionHandle) -> bool,
        F: FnMut(PushSignal) -> ControlFlow<()>,
    {
        let mut subscription = match self.open(identity) {
            Ok(subscription) => subscription,
            Err(err) => {
                let _ = on_signal(PushSignal::Failed(err.to_string()));
                return;
            }
        };
        let handle = subscription.handle();
        if !on_open(handle.clone()) {
            handle.unsubscribe();
            return;
        }

        while let Some(event) = subscription.next_event().await {
            let Some(signal) = translate(event) else {
                continue;
            };
            if on_signal(signal).is_break() {
                return;
            }
        }

        if !handle.is_closed() {
            info!(target = "sync.push", channel = %subscription.channel(), "push stream ended");
            let _ = on_signal(PushSignal::Failed(
                "connection lost: realtime stream ended".into(),
            ));
        }
    }
}

/// Maps a raw channel event to a controller signal. Deletes, rows without an
/// id and rows without a status produce nothing.
pub fn translate(event: ChannelEvent) -> Option<PushSignal> {
    match event {
        ChannelEvent::Status { status, message } => match status {
            ChannelStatus::Subscribed => Some(PushSignal::Subscribed),
            ChannelStatus::ChannelError => Some(PushSignal::Failed(connectivity_message(
                "failed to establish realtime connection",
                message.as_deref().unwrap_or("channel error"),
            ))),
            ChannelStatus::TimedOut => Some(PushSignal::Failed(connectivity_message(
                "realtime subscription timed out",
                message.as_deref().unwrap_or(""),
            ))),
            ChannelStatus::Closed => Some(PushSignal::Failed(connectivity_message(
                "connection lost",
                message.as_deref().unwrap_or("channel closed"),
            ))),
        },
        ChannelEvent::Change(change) => {
            if change.event_type == ChangeType::Delete {
                debug!(target = "sync.push", "ignoring booking delete event");
                return None;
            }
            let row = &change.new_row;
            let Some(id) = row.get("id").and_then(BookingId::from_json) else {
                warn!(target = "sync.push", "change event without booking id");
                return None;
            };
            let Some(raw) = row.get("status").and_then(|value| value.as_str()) else {
                debug!(target = "sync.push", booking = %id, "change event without status");
                return None;
            };
            Some(PushSignal::Update(BookingUpdate {
                id,
                status: BookingStatus::normalize(raw),
            }))
        }
    }
}

fn connectivity_message(prefix: &str, detail: &str) -> String {
    let detail = detail.trim();
    let lowered = detail.to_ascii_lowercase();
    if lowered.starts_with(prefix) {
        detail.to_string()
    } else if detail.is_empty() {
        prefix.to_string()
    } else {
        format!("{prefix}: {detail}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use push_channel::{ChangeEvent, LocalPushChannel, PushError};
    use serde_json::json;

    #[test]
    fn translates_lifecycle_statuses() {
        assert_eq!(
            translate(ChannelEvent::status(ChannelStatus::Subscribed)),
            Some(PushSignal::Subscribed)
        );
        assert_eq!(
            translate(ChannelEvent::status(ChannelStatus::TimedOut)),
            Some(PushSignal::Failed("realtime subscription timed out".into()))
        );
        assert_eq!(
            translate(ChannelEvent::Status {
                status: ChannelStatus::ChannelError,
                message: Some("failed to establish realtime connection: no endpoint".into()),
            }),
            Some(PushSignal::Failed(
                "failed to establish realtime connection: no endpoint".into()
            ))
        );
    }

    #[test]
    fn translates_row_changes() {
        let update = ChangeEvent::update(
            "public",
            "bookings",
            json!({"id": 1, "status": "pending"}),
            json!({"id": 1, "status": "Confirmed"}),
        );
        assert_eq!(
            translate(ChannelEvent::Change(update)),
            Some(PushSignal::Update(BookingUpdate {
                id: BookingId::from(1_i64),
                status: BookingStatus::Confirmed,
            }))
        );

        let insert = ChangeEvent::insert("public", "bookings", json!({"id": "b2", "status": "???"}));
        assert_eq!(
            translate(ChannelEvent::Change(insert)),
            Some(PushSignal::Update(BookingUpdate {
                id: BookingId::from("b2"),
                status: BookingStatus::Pending,
            }))
        );

        let delete = ChangeEvent::delete("public", "bookings", json!({"id": 3}));
        assert_eq!(translate(ChannelEvent::Change(delete)), None);

        let anonymous = ChangeEvent::insert("public", "bookings", json!({"status": "pending"}));
        assert_eq!(translate(ChannelEvent::Change(anonymous)), None);
    }

    #[test]
    fn channel_names_are_unique_per_attempt() {
        let adapter = PushAdapter::new(Arc::new(LocalPushChannel::new()), ChannelConfig::default());
        let identity = CallerIdentity::client("4");
        let first = adapter.channel_name(&identity);
        let second = adapter.channel_name(&identity);
        assert!(first.starts_with("booking-status-client-4-"));
        assert_ne!(first, second);
    }

    #[tokio::test]
    async fn run_reports_subscribe_failures() {
        struct Broken;
        impl PushChannel for Broken {
            fn subscribe(
                &self,
                _channel: &str,
                _filter: push_channel::ChangeFilter,
            ) -> push_channel::PushResult<Subscription> {
                Err(PushError::Transport("socket refused".into()))
            }
        }

        let adapter = PushAdapter::new(Arc::new(Broken), ChannelConfig::default());
        let mut signals = Vec::new();
        adapter
            .run(
                &CallerIdentity::client("1"),
                |_| true,
                |signal| {
                    signals.push(signal);
                    ControlFlow::Continue(())
                },
            )
            .await;
        assert_eq!(signals.len(), 1);
        match &signals[0] {
            PushSignal::Failed(message) => assert!(message.starts_with("failed to establish")),
            other => panic!("unexpected signal {other:?}"),
        }
    }

    #[tokio::test]
    async fn run_reports_stream_end_as_connection_lost() {
        let channel = Arc::new(LocalPushChannel::new());
        let adapter = PushAdapter::new(channel.clone(), ChannelConfig::default());
        let mut signals = Vec::new();
        adapter
            .run(
                &CallerIdentity::client("1"),
                |_| {
                    channel.disconnect_all();
                    true
                },
                |signal| {
                    signals.push(signal);
                    ControlFlow::Continue(())
                },
            )
            .await;
        assert_eq!(
            signals,
            vec![PushSignal::Failed("connection lost: realtime stream ended".into())]
        );
    }
}
