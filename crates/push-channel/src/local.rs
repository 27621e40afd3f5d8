use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::debug;

use crate::{
    ChangeEvent, ChangeFilter, ChannelEvent, ChannelStatus, Predicate, PushChannel, PushResult,
    Subscription, SubscriptionHandle,
};

/// Whether [`LocalPushChannel`] acknowledges new subscriptions by itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AckMode {
    /// Statuses are only delivered through [`LocalPushChannel::broadcast_status`].
    #[default]
    Manual,
    /// Every subscription immediately receives `SUBSCRIBED`.
    Immediate,
}

struct LocalSubscriber {
    channel: String,
    filter: ChangeFilter,
    predicate: Option<Predicate>,
    sender: mpsc::UnboundedSender<ChannelEvent>,
}

type SubscriberMap = Arc<RwLock<HashMap<u64, LocalSubscriber>>>;

/// In-memory push channel for tests and offline wiring.
#[derive(Default)]
pub struct LocalPushChannel {
    ack_mode: AckMode,
    subscribers: SubscriberMap,
    next_id: AtomicU64,
}

impl LocalPushChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_ack_mode(ack_mode: AckMode) -> Self {
        Self {
            ack_mode,
            ..Self::default()
        }
    }

    /// Sends a lifecycle status to every open subscription.
    pub fn broadcast_status(&self, status: ChannelStatus, message: Option<&str>) -> usize {
        let guard = self.subscribers.read();
        guard
            .values()
            .filter(|sub| {
                sub.sender
                    .send(ChannelEvent::Status {
                        status,
                        message: message.map(str::to_string),
                    })
                    .is_ok()
            })
            .count()
    }

    /// Routes a row change to every subscription whose filter admits it.
    pub fn publish_change(&self, change: ChangeEvent) -> usize {
        let guard = self.subscribers.read();
        let mut delivered = 0;
        for sub in guard.values() {
            if sub.filter.schema != change.schema || sub.filter.table != change.table {
                continue;
            }
            if !sub.filter.accepts(change.event_type) {
                continue;
            }
            if let Some(predicate) = sub.predicate.as_ref() {
                if !predicate.matches(change.filtered_row()) {
                    continue;
                }
            }
            if sub.sender.send(ChannelEvent::Change(change.clone())).is_ok() {
                delivered += 1;
            }
        }
        delivered
    }

    /// Drops every open stream without a status, as a dying transport would.
    pub fn disconnect_all(&self) {
        self.subscribers.write().clear();
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().len()
    }

    /// Channel names and filters of the open subscriptions.
    pub fn subscriptions(&self) -> Vec<(String, ChangeFilter)> {
        self.subscribers
            .read()
            .values()
            .map(|sub| (sub.channel.clone(), sub.filter.clone()))
            .collect()
    }
}

impl PushChannel for LocalPushChannel {
    fn subscribe(&self, channel: &str, filter: ChangeFilter) -> PushResult<Subscription> {
        let predicate = filter.predicate()?;
        let (sender, events) = mpsc::unbounded_channel();
        if self.ack_mode == AckMode::Immediate {
            let _ = sender.send(ChannelEvent::status(ChannelStatus::Subscribed));
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.write().insert(
            id,
            LocalSubscriber {
                channel: channel.to_string(),
                filter,
                predicate,
                sender,
            },
        );
        debug!(target = "push.local", channel, id, "subscription opened");

        let subscribers = Arc::clone(&self.subscribers);
        let label = channel.to_string();
        let handle = SubscriptionHandle::new(move || {
            if subscribers.write().remove(&id).is_some() {
                debug!(target = "push.local", channel = %label, id, "subscription closed");
            }
        });
        Ok(Subscription::new(channel, events, handle))
    }
}

/// Channel used when no realtime endpoint is configured: every subscription
/// reports `CHANNEL_ERROR` right away.
#[derive(Debug, Clone)]
pub struct UnavailableChannel {
    reason: String,
}

impl UnavailableChannel {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl PushChannel for UnavailableChannel {
    fn subscribe(&self, channel: &str, _filter: ChangeFilter) -> PushResult<Subscription> {
        let (sender, events) = mpsc::unbounded_channel();
        let _ = sender.send(ChannelEvent::Status {
            status: ChannelStatus::ChannelError,
            message: Some(format!(
                "failed to establish realtime connection: {}",
                self.reason
            )),
        });
        Ok(Subscription::new(
            channel,
            events,
            SubscriptionHandle::detached(),
        ))
    }
}
