use serde::{Deserialize, Serialize};

use crate::{CallerIdentity, Role};

/// The signed-in user as persisted by the auth layer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoredUser {
    pub id: String,
    pub role: Role,
}

/// Session storage owned by the surrounding application.
pub trait AuthProvider: Send + Sync {
    fn token(&self) -> Option<String>;
    fn stored_user(&self) -> Option<StoredUser>;
}

/// Fixed credentials, for tests and tools that receive a token up front.
#[derive(Debug, Clone, Default)]
pub struct StaticAuth {
    token: Option<String>,
    user: Option<StoredUser>,
}

impl StaticAuth {
    pub fn new(token: Option<String>, user: Option<StoredUser>) -> Self {
        Self { token, user }
    }

    pub fn client(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(
            Some(token.into()),
            Some(StoredUser {
                id: user_id.into(),
                role: Role::Client,
            }),
        )
    }

    pub fn provider(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self::new(
            Some(token.into()),
            Some(StoredUser {
                id: user_id.into(),
                role: Role::Provider,
            }),
        )
    }
}

impl AuthProvider for StaticAuth {
    fn token(&self) -> Option<String> {
        self.token.clone()
    }

    fn stored_user(&self) -> Option<StoredUser> {
        self.user.clone()
    }
}

/// Reads `BOOKING_SYNC_TOKEN`, `BOOKING_SYNC_USER_ID` and
/// `BOOKING_SYNC_USER_ROLE` on every call.
#[derive(Debug, Clone, Copy, Default)]
pub struct EnvAuth;

impl AuthProvider for EnvAuth {
    fn token(&self) -> Option<String> {
        std::env::var("BOOKING_SYNC_TOKEN")
            .ok()
            .filter(|token| !token.trim().is_empty())
    }

    fn stored_user(&self) -> Option<StoredUser> {
        let id = std::env::var("BOOKING_SYNC_USER_ID").ok()?;
        let role = std::env::var("BOOKING_SYNC_USER_ROLE")
            .ok()
            .and_then(|raw| Role::parse(&raw))
            .unwrap_or(Role::Client);
        Some(StoredUser { id, role })
    }
}

/// Identity as far as the auth layer knows it. A provider's id here is the
/// user id; [`crate::IdentityResolver`] maps it to the consultant record.
pub fn stored_identity(auth: &dyn AuthProvider) -> Option<CallerIdentity> {
    auth.stored_user().map(|user| CallerIdentity {
        role: user.role,
        id: user.id,
    })
}
