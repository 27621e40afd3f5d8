//! Row-level change notification channels.
//!
//! A [`PushChannel`] hands out [`Subscription`]s scoped by a [`ChangeFilter`].
//! Each subscription yields lifecycle statuses (subscribed, channel error,
//! timed out, closed) and row change events on a single ordered stream.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

mod filter;
mod local;

pub use filter::Predicate;
pub use local::{AckMode, LocalPushChannel, UnavailableChannel};

#[derive(Debug, Error)]
pub enum PushError {
    #[error("push channel closed")]
    Closed,
    #[error("invalid filter predicate `{0}`")]
    InvalidFilter(String),
    #[error("push transport error: {0}")]
    Transport(String),
}

pub type PushResult<T> = Result<T, PushError>;

/// Subscription parameters: which rows of which table to stream.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeFilter {
    /// `*` for every change type, otherwise `INSERT`, `UPDATE` or `DELETE`.
    pub event: String,
    pub schema: String,
    pub table: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filter: Option<String>,
}

impl ChangeFilter {
    pub fn all(schema: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            event: "*".into(),
            schema: schema.into(),
            table: table.into(),
            filter: None,
        }
    }

    pub fn with_predicate(mut self, predicate: &Predicate) -> Self {
        self.filter = Some(predicate.to_string());
        self
    }

    pub fn predicate(&self) -> PushResult<Option<Predicate>> {
        self.filter.as_deref().map(Predicate::parse).transpose()
    }

    pub fn accepts(&self, change_type: ChangeType) -> bool {
        self.event == "*" || self.event.eq_ignore_ascii_case(change_type.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeType {
    Insert,
    Update,
    Delete,
}

impl ChangeType {
    pub fn as_str(self) -> &'static str {
        match self {
            ChangeType::Insert => "INSERT",
            ChangeType::Update => "UPDATE",
            ChangeType::Delete => "DELETE",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ChangeEvent {
    pub event_type: ChangeType,
    pub schema: String,
    pub table: String,
    pub old_row: Value,
    pub new_row: Value,
}

impl ChangeEvent {
    pub fn update(
        schema: impl Into<String>,
        table: impl Into<String>,
        old_row: Value,
        new_row: Value,
    ) -> Self {
        Self {
            event_type: ChangeType::Update,
            schema: schema.into(),
            table: table.into(),
            old_row,
            new_row,
        }
    }

    pub fn insert(schema: impl Into<String>, table: impl Into<String>, new_row: Value) -> Self {
        Self {
            event_type: ChangeType::Insert,
            schema: schema.into(),
            table: table.into(),
            old_row: Value::Null,
            new_row,
        }
    }

    pub fn delete(schema: impl Into<String>, table: impl Into<String>, old_row: Value) -> Self {
        Self {
            event_type: ChangeType::Delete,
            schema: schema.into(),
            table: table.into(),
            old_row,
            new_row: Value::Null,
        }
    }

    /// The row a filter predicate is evaluated against.
    pub fn filtered_row(&self) -> &Value {
        match self.event_type {
            ChangeType::Delete => &self.old_row,
            _ => &self.new_row,
        }
    }
}

/// Subscription lifecycle as reported by the transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl ChannelStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        }
    }

    pub fn from_wire(value: &str) -> Option<Self> {
        match value.trim().to_ascii_uppercase().as_str() {
            "SUBSCRIBED" => Some(ChannelStatus::Subscribed),
            "CHANNEL_ERROR" => Some(ChannelStatus::ChannelError),
            "TIMED_OUT" => Some(ChannelStatus::TimedOut),
            "CLOSED" => Some(ChannelStatus::Closed),
            _ => None,
        }
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status {
        status: ChannelStatus,
        message: Option<String>,
    },
    Change(ChangeEvent),
}

impl ChannelEvent {
    pub fn status(status: ChannelStatus) -> Self {
        ChannelEvent::Status {
            status,
            message: None,
        }
    }
}

pub trait PushChannel: Send + Sync {
    fn subscribe(&self, channel: &str, filter: ChangeFilter) -> PushResult<Subscription>;
}

/// An open subscription: the ordered event stream plus its teardown handle.
pub struct Subscription {
    channel: String,
    events: mpsc::UnboundedReceiver<ChannelEvent>,
    handle: SubscriptionHandle,
}

impl Subscription {
    pub fn new(
        channel: impl Into<String>,
        events: mpsc::UnboundedReceiver<ChannelEvent>,
        handle: SubscriptionHandle,
    ) -> Self {
        Self {
            channel: channel.into(),
            events,
            handle,
        }
    }

    pub fn channel(&self) -> &str {
        &self.channel
    }

    pub fn handle(&self) -> SubscriptionHandle {
        self.handle.clone()
    }

    /// Next event, or `None` once the transport dropped the stream.
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        if self.handle.is_closed() {
            return None;
        }
        self.events.recv().await
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("channel", &self.channel)
            .field("handle", &self.handle)
            .finish()
    }
}

type CloseHook = Box<dyn Fn() + Send + Sync>;

struct HandleInner {
    closed: AtomicBool,
    on_close: Option<CloseHook>,
}

/// Cloneable teardown handle. Unsubscribing more than once is a no-op.
#[derive(Clone)]
pub struct SubscriptionHandle {
    inner: Arc<HandleInner>,
}

impl SubscriptionHandle {
    pub fn new<F>(on_close: F) -> Self
    where
        F: Fn() + Send + Sync + 'static,
    {
        Self {
            inner: Arc::new(HandleInner {
                closed: AtomicBool::new(false),
                on_close: Some(Box::new(on_close)),
            }),
        }
    }

    /// Handle for a subscription the transport never established.
    pub fn detached() -> Self {
        Self {
            inner: Arc::new(HandleInner {
                closed: AtomicBool::new(false),
                on_close: None,
            }),
        }
    }

    /// Returns `true` only for the call that actually closed the subscription.
    pub fn unsubscribe(&self) -> bool {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(hook) = self.inner.on_close.as_ref() {
            hook();
        }
        true
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("closed", &self.is_closed())
            .finish()
    }
}
