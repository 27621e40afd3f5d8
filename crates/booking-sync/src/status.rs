use std::fmt;

use serde::{Deserialize, Serialize};

/// Booking lifecycle status. Any value may replace any other; the server
/// owns transition rules.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", from = "String")]
pub enum BookingStatus {
    #[default]
    Pending,
    Confirmed,
    Completed,
    Cancelled,
    Delayed,
    Rescheduled,
}

impl BookingStatus {
    pub const ALL: [BookingStatus; 6] = [
        BookingStatus::Pending,
        BookingStatus::Confirmed,
        BookingStatus::Completed,
        BookingStatus::Cancelled,
        BookingStatus::Delayed,
        BookingStatus::Rescheduled,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            BookingStatus::Pending => "pending",
            BookingStatus::Confirmed => "confirmed",
            BookingStatus::Completed => "completed",
            BookingStatus::Cancelled => "cancelled",
            BookingStatus::Delayed => "delayed",
            BookingStatus::Rescheduled => "rescheduled",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_lowercase().as_str() {
            "pending" => Some(BookingStatus::Pending),
            "confirmed" => Some(BookingStatus::Confirmed),
            "completed" => Some(BookingStatus::Completed),
            "cancelled" | "canceled" => Some(BookingStatus::Cancelled),
            "delayed" => Some(BookingStatus::Delayed),
            "rescheduled" => Some(BookingStatus::Rescheduled),
            _ => None,
        }
    }

    /// Unknown values fall back to `pending` instead of failing.
    pub fn normalize(raw: &str) -> Self {
        Self::parse(raw).unwrap_or_else(|| {
            tracing::debug!(target = "sync.status", raw, "unrecognized booking status");
            BookingStatus::default()
        })
    }
}

impl From<String> for BookingStatus {
    fn from(value: String) -> Self {
        Self::normalize(&value)
    }
}

impl fmt::Display for BookingStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
