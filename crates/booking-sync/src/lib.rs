//! Booking Sync: keeps a caller's booking statuses live across client and
//! provider screens.
//!
//! Responsibilities:
//! - subscribing to identity-scoped booking change events on a push channel
//! - falling back to differential HTTP polling when the channel fails
//! - throttling connectivity errors and self-disabling after repeated failures
//! - exposing a start/observe/stop handle to UI code

use std::fmt;

use serde::{Deserialize, Serialize};

pub mod api;
pub mod auth;
pub mod config;
pub mod controller;
pub mod error;
pub mod identity;
pub mod poller;
pub mod push;
pub mod status;
pub mod throttle;

pub use api::{BookingApi, HttpBookingApi};
pub use auth::{AuthProvider, EnvAuth, StaticAuth, StoredUser};
pub use config::{ChannelConfig, SyncOptions, ThrottleConfig};
pub use controller::{BookingSync, ConnectionType, SyncHandle, SyncHandlers, SyncState, SyncStatus};
pub use error::{SyncError, SyncResult};
pub use identity::{FileIdentityCache, IdentityCache, IdentityResolver, MemoryIdentityCache};
pub use poller::{PollOutcome, PollingEngine, StatusPoller};
pub use status::BookingStatus;
pub use throttle::{ErrorThrottle, ThrottleDecision};

/// Booking identifier as the API and the change feed present it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct BookingId(String);

impl BookingId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Reads an id out of a JSON row field, accepting numbers and strings.
    pub fn from_json(value: &serde_json::Value) -> Option<Self> {
        match value {
            serde_json::Value::String(text) if !text.is_empty() => Some(Self(text.clone())),
            serde_json::Value::Number(number) => Some(Self(number.to_string())),
            _ => None,
        }
    }
}

impl fmt::Display for BookingId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BookingId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for BookingId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<i64> for BookingId {
    fn from(value: i64) -> Self {
        Self(value.to_string())
    }
}

/// Caller-owned snapshot of a booking, treated as the last known truth.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchedBooking {
    pub id: BookingId,
    pub status: BookingStatus,
    #[serde(default)]
    pub consultant_id: Option<String>,
    #[serde(default)]
    pub client_id: Option<String>,
}

impl WatchedBooking {
    pub fn new(id: impl Into<BookingId>, status: BookingStatus) -> Self {
        Self {
            id: id.into(),
            status,
            consultant_id: None,
            client_id: None,
        }
    }
}

/// A status change delivered to the caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BookingUpdate {
    pub id: BookingId,
    pub status: BookingStatus,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Client,
    #[serde(alias = "consultant")]
    Provider,
}

impl Role {
    /// Accepts the role names stored by the auth layer.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "client" => Some(Role::Client),
            "provider" | "consultant" => Some(Role::Provider),
            _ => None,
        }
    }
}

/// Who is watching; scopes the push subscription.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallerIdentity {
    pub role: Role,
    pub id: String,
}

impl CallerIdentity {
    pub fn client(id: impl Into<String>) -> Self {
        Self {
            role: Role::Client,
            id: id.into(),
        }
    }

    pub fn provider(id: impl Into<String>) -> Self {
        Self {
            role: Role::Provider,
            id: id.into(),
        }
    }
}
