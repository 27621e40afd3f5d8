use std::sync::Arc;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use url::Url;

use crate::auth::AuthProvider;
use crate::error::{SyncError, SyncResult};
use crate::BookingId;

/// The slice of the booking REST API the sync controller reads.
#[async_trait]
pub trait BookingApi: Send + Sync {
    /// Raw status string for one booking.
    async fn fetch_status(&self, id: &BookingId) -> SyncResult<String>;

    /// Consultant record id belonging to a provider's user id, if any.
    async fn resolve_consultant_id(&self, user_id: &str) -> SyncResult<Option<String>>;
}

#[derive(Debug, Deserialize)]
struct StatusResponse {
    status: String,
}

#[derive(Debug, Deserialize)]
struct ConsultantRecord {
    id: Value,
    #[serde(default)]
    user_id: Option<Value>,
    #[serde(default)]
    user: Option<Value>,
}

impl ConsultantRecord {
    fn belongs_to(&self, user_id: &str) -> bool {
        let direct = self.user_id.as_ref().and_then(json_id);
        let nested = self.user.as_ref().and_then(|user| match user {
            Value::Object(map) => map.get("id").and_then(json_id),
            other => json_id(other),
        });
        direct.as_deref() == Some(user_id) || nested.as_deref() == Some(user_id)
    }
}

fn json_id(value: &Value) -> Option<String> {
    BookingId::from_json(value).map(|id| id.as_str().to_string())
}

/// reqwest-backed [`BookingApi`] sending `Authorization: Bearer <token>`.
#[derive(Clone)]
pub struct HttpBookingApi {
    http: reqwest::Client,
    base_url: Url,
    auth: Arc<dyn AuthProvider>,
}

impl HttpBookingApi {
    pub fn new(base_url: &str, auth: Arc<dyn AuthProvider>) -> SyncResult<Self> {
        Self::with_client(reqwest::Client::new(), base_url, auth)
    }

    pub fn with_client(
        http: reqwest::Client,
        base_url: &str,
        auth: Arc<dyn AuthProvider>,
    ) -> SyncResult<Self> {
        let trimmed = base_url.trim();
        if trimmed.is_empty() {
            return Err(SyncError::Config("api base url must not be empty".into()));
        }
        let normalized = if trimmed.ends_with('/') {
            trimmed.to_string()
        } else {
            format!("{trimmed}/")
        };
        Ok(Self {
            http,
            base_url: Url::parse(&normalized)?,
            auth,
        })
    }

    pub fn base_url(&self) -> &Url {
        &self.base_url
    }

    fn endpoint(&self, path: &str) -> SyncResult<Url> {
        Ok(self.base_url.join(path.trim_start_matches('/'))?)
    }

    async fn get_text(&self, url: Url) -> SyncResult<String> {
        let mut request = self.http.get(url);
        if let Some(token) = self.auth.token() {
            request = request.bearer_auth(token);
        }
        let res = request.send().await?;

        if res.status().is_success() {
            Ok(res.text().await?)
        } else {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            Err(SyncError::UnexpectedStatus { status, body })
        }
    }
}

#[async_trait]
impl BookingApi for HttpBookingApi {
    async fn fetch_status(&self, id: &BookingId) -> SyncResult<String> {
        let url = self.endpoint(&format!("events/booking-status/{id}"))?;
        let text = self.get_text(url).await?;
        let body: StatusResponse = serde_json::from_str(&text)
            .map_err(|err| SyncError::Decode(format!("booking {id}: {err}")))?;
        Ok(body.status)
    }

    async fn resolve_consultant_id(&self, user_id: &str) -> SyncResult<Option<String>> {
        let url = self.endpoint("consultants/")?;
        let text = self.get_text(url).await?;
        let records: Vec<ConsultantRecord> = serde_json::from_str(&text)
            .map_err(|err| SyncError::Decode(format!("consultant list: {err}")))?;
        Ok(records
            .iter()
            .find(|record| record.belongs_to(user_id))
            .and_then(|record| json_id(&record.id)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticAuth;
    use serde_json::json;

    #[test]
    fn base_url_gains_trailing_slash() {
        let api = HttpBookingApi::new("https://api.example.com/v1", Arc::new(StaticAuth::default()))
            .expect("api");
        assert_eq!(
            api.endpoint("events/booking-status/4").unwrap().as_str(),
            "https://api.example.com/v1/events/booking-status/4"
        );
        assert_eq!(
            api.endpoint("/consultants/").unwrap().as_str(),
            "https://api.example.com/v1/consultants/"
        );
    }

    #[test]
    fn empty_base_url_is_rejected() {
        let err = HttpBookingApi::new("  ", Arc::new(StaticAuth::default())).err();
        assert!(matches!(err, Some(SyncError::Config(_))));
    }

    #[test]
    fn consultant_records_match_direct_and_nested_users() {
        let direct: ConsultantRecord =
            serde_json::from_value(json!({"id": 3, "user_id": 11})).unwrap();
        let nested: ConsultantRecord =
            serde_json::from_value(json!({"id": "c-4", "user": {"id": "12"}})).unwrap();
        let flat: ConsultantRecord = serde_json::from_value(json!({"id": 5, "user": 13})).unwrap();
        assert!(direct.belongs_to("11"));
        assert!(nested.belongs_to("12"));
        assert!(flat.belongs_to("13"));
        assert!(!direct.belongs_to("12"));
    }
}
