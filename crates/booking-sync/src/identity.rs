use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use push_channel::{ChangeFilter, Predicate};
use tracing::{debug, warn};

use crate::api::BookingApi;
use crate::config::ChannelConfig;
use crate::error::{SyncError, SyncResult};
use crate::{CallerIdentity, Role};

/// Persists the provider user id → consultant id mapping across sessions.
pub trait IdentityCache: Send + Sync {
    fn load(&self, user_id: &str) -> Option<String>;
    fn store(&self, user_id: &str, provider_id: &str) -> SyncResult<()>;
}

#[derive(Debug, Default)]
pub struct MemoryIdentityCache {
    entries: Mutex<HashMap<String, String>>,
}

impl MemoryIdentityCache {
    pub fn new() -> Self {
        Self::default()
    }
}

impl IdentityCache for MemoryIdentityCache {
    fn load(&self, user_id: &str) -> Option<String> {
        self.entries.lock().get(user_id).cloned()
    }

    fn store(&self, user_id: &str, provider_id: &str) -> SyncResult<()> {
        self.entries
            .lock()
            .insert(user_id.to_string(), provider_id.to_string());
        Ok(())
    }
}

/// JSON file cache, the desktop stand-in for browser local storage.
#[derive(Debug)]
pub struct FileIdentityCache {
    path: PathBuf,
    entries: Mutex<HashMap<String, String>>,
}

impl FileIdentityCache {
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).unwrap_or_else(|err| {
                warn!(
                    target = "sync.identity",
                    path = %path.display(),
                    error = %err,
                    "ignoring unreadable identity cache"
                );
                HashMap::new()
            }),
            Err(_) => HashMap::new(),
        };
        Self {
            path,
            entries: Mutex::new(entries),
        }
    }

    /// `<data dir>/booking-sync/identity.json` for the current platform.
    pub fn default_path() -> Option<PathBuf> {
        directories::ProjectDirs::from("dev", "booking-sync", "booking-sync")
            .map(|dirs| dirs.data_dir().join("identity.json"))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl IdentityCache for FileIdentityCache {
    fn load(&self, user_id: &str) -> Option<String> {
        self.entries.lock().get(user_id).cloned()
    }

    fn store(&self, user_id: &str, provider_id: &str) -> SyncResult<()> {
        let mut guard = self.entries.lock();
        guard.insert(user_id.to_string(), provider_id.to_string());
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let bytes = serde_json::to_vec_pretty(&*guard)?;
        fs::write(&self.path, bytes)?;
        Ok(())
    }
}

/// Maps a stored user to the identity the push filter needs, looking a
/// provider's consultant id up at most once per session.
pub struct IdentityResolver {
    api: Arc<dyn BookingApi>,
    cache: Arc<dyn IdentityCache>,
    session: Mutex<Option<(String, String)>>,
}

impl IdentityResolver {
    pub fn new(api: Arc<dyn BookingApi>, cache: Arc<dyn IdentityCache>) -> Self {
        Self {
            api,
            cache,
            session: Mutex::new(None),
        }
    }

    pub async fn resolve(&self, user: &CallerIdentity) -> SyncResult<CallerIdentity> {
        if user.role == Role::Client {
            return Ok(user.clone());
        }

        let session_hit = self
            .session
            .lock()
            .as_ref()
            .filter(|(user_id, _)| user_id == &user.id)
            .map(|(_, provider_id)| provider_id.clone());
        if let Some(provider_id) = session_hit {
            return Ok(CallerIdentity::provider(provider_id));
        }

        if let Some(provider_id) = self.cache.load(&user.id) {
            debug!(target = "sync.identity", user = %user.id, provider = %provider_id, "provider id from cache");
            self.remember(&user.id, &provider_id);
            return Ok(CallerIdentity::provider(provider_id));
        }

        let provider_id = self
            .api
            .resolve_consultant_id(&user.id)
            .await
            .map_err(|err| SyncError::Identity(format!("consultant lookup failed: {err}")))?
            .ok_or_else(|| {
                SyncError::Identity(format!("no consultant profile for user {}", user.id))
            })?;

        if let Err(err) = self.cache.store(&user.id, &provider_id) {
            warn!(target = "sync.identity", error = %err, "failed to persist provider id");
        }
        self.remember(&user.id, &provider_id);
        debug!(target = "sync.identity", user = %user.id, provider = %provider_id, "resolved provider id");
        Ok(CallerIdentity::provider(provider_id))
    }

    fn remember(&self, user_id: &str, provider_id: &str) {
        *self.session.lock() = Some((user_id.to_string(), provider_id.to_string()));
    }
}

/// Push subscription filter for an identity: `client_id=eq.<id>` for clients,
/// `<provider column>=eq.<id>` for providers.
pub fn build_filter(identity: &CallerIdentity, config: &ChannelConfig) -> ChangeFilter {
    let column = match identity.role {
        Role::Client => config.client_column.as_str(),
        Role::Provider => config.provider_column.as_str(),
    };
    ChangeFilter::all(config.schema.clone(), config.table.clone())
        .with_predicate(&Predicate::eq(column, identity.id.clone()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::BookingId;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingApi {
        lookups: AtomicUsize,
        answer: Option<String>,
    }

    #[async_trait]
    impl BookingApi for CountingApi {
        async fn fetch_status(&self, _id: &BookingId) -> SyncResult<String> {
            Ok("pending".into())
        }

        async fn resolve_consultant_id(&self, _user_id: &str) -> SyncResult<Option<String>> {
            self.lookups.fetch_add(1, Ordering::SeqCst);
            Ok(self.answer.clone())
        }
    }

    fn api(answer: Option<&str>) -> Arc<CountingApi> {
        Arc::new(CountingApi {
            lookups: AtomicUsize::new(0),
            answer: answer.map(str::to_string),
        })
    }

    #[test]
    fn filters_follow_role() {
        let config = ChannelConfig::default();
        let client = build_filter(&CallerIdentity::client("9"), &config);
        assert_eq!(client.filter.as_deref(), Some("client_id=eq.9"));
        assert_eq!(client.table, "bookings");
        let provider = build_filter(&CallerIdentity::provider("c-2"), &config);
        assert_eq!(provider.filter.as_deref(), Some("consultant_id=eq.c-2"));
    }

    #[tokio::test]
    async fn clients_resolve_without_lookup() {
        let api = api(Some("c-1"));
        let resolver = IdentityResolver::new(api.clone(), Arc::new(MemoryIdentityCache::new()));
        let resolved = resolver.resolve(&CallerIdentity::client("u-1")).await.unwrap();
        assert_eq!(resolved, CallerIdentity::client("u-1"));
        assert_eq!(api.lookups.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn provider_lookup_happens_once_and_is_persisted() {
        let api = api(Some("c-77"));
        let cache = Arc::new(MemoryIdentityCache::new());
        let resolver = IdentityResolver::new(api.clone(), cache.clone());
        let user = CallerIdentity::provider("u-5");

        for _ in 0..3 {
            let resolved = resolver.resolve(&user).await.unwrap();
            assert_eq!(resolved, CallerIdentity::provider("c-77"));
        }
        assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
        assert_eq!(cache.load("u-5").as_deref(), Some("c-77"));

        let fresh = IdentityResolver::new(api.clone(), cache);
        fresh.resolve(&user).await.unwrap();
        assert_eq!(api.lookups.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn missing_consultant_is_an_identity_error() {
        let resolver = IdentityResolver::new(api(None), Arc::new(MemoryIdentityCache::new()));
        let err = resolver
            .resolve(&CallerIdentity::provider("u-5"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Identity(_)));
        assert!(err.to_string().starts_with("failed to establish"));
    }

    #[test]
    fn file_cache_round_trips_through_disk() {
        let path = std::env::temp_dir().join(format!(
            "booking-sync-identity-{}.json",
            uuid::Uuid::new_v4()
        ));
        let cache = FileIdentityCache::open(&path);
        cache.store("u-1", "c-1").expect("store");

        let reopened = FileIdentityCache::open(&path);
        assert_eq!(reopened.load("u-1").as_deref(), Some("c-1"));
        assert_eq!(reopened.load("u-2"), None);
        let _ = fs::remove_file(&path);
    }

    #[test]
    fn corrupt_file_cache_starts_empty() {
        let path = std::env::temp_dir().join(format!(
            "booking-sync-identity-{}.json",
            uuid::Uuid::new_v4()
        ));
        fs::write(&path, b"not json").expect("write");
        let cache = FileIdentityCache::open(&path);
        assert_eq!(cache.load("u-1"), None);
        let _ = fs::remove_file(&path);
    }
}
