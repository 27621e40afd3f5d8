#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use booking_sync::{
    BookingApi, BookingId, BookingStatus, BookingSync, StaticAuth, SyncError, SyncHandlers,
    SyncResult,
};
use push_channel::LocalPushChannel;
use tokio::sync::mpsc;

#[derive(Clone, Debug)]
pub enum Answer {
    Status(&'static str),
    /// Answers with the status after the delay.
    Slow(Duration, &'static str),
    Malformed,
    ServerError,
    Unreachable,
}

/// In-memory booking API with per-booking answers and call counters.
#[derive(Default)]
pub struct ScriptedApi {
    answers: Mutex<HashMap<String, Answer>>,
    consultant: Mutex<Option<String>>,
    pub fetches: AtomicUsize,
    pub lookups: AtomicUsize,
}

impl ScriptedApi {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn answer(&self, id: &str, answer: Answer) {
        self.answers.lock().unwrap().insert(id.to_string(), answer);
    }

    pub fn set_consultant(&self, id: &str) {
        *self.consultant.lock().unwrap() = Some(id.to_string());
    }

    pub fn fetch_count(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BookingApi for ScriptedApi {
    async fn fetch_status(&self, id: &BookingId) -> SyncResult<String> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let answer = self
            .answers
            .lock()
            .unwrap()
            .get(id.as_str())
            .cloned()
            .unwrap_or(Answer::ServerError);
        match answer {
            Answer::Status(status) => Ok(status.to_string()),
            Answer::Slow(delay, status) => {
                tokio::time::sleep(delay).await;
                Ok(status.to_string())
            }
            Answer::Malformed => Err(SyncError::Decode(format!(
                "booking {id}: expected value at line 1 column 1"
            ))),
            Answer::ServerError => Err(SyncError::UnexpectedStatus {
                status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                body: "boom".into(),
            }),
            Answer::Unreachable => Err(SyncError::Transport("connection refused".into())),
        }
    }

    async fn resolve_consultant_id(&self, _user_id: &str) -> SyncResult<Option<String>> {
        self.lookups.fetch_add(1, Ordering::SeqCst);
        Ok(self.consultant.lock().unwrap().clone())
    }
}

/// Callback recorder backed by channels so tests can await deliveries.
pub struct Recorder {
    pub updates: mpsc::UnboundedReceiver<(BookingId, BookingStatus)>,
    pub errors: mpsc::UnboundedReceiver<String>,
}

impl Recorder {
    pub fn new() -> (SyncHandlers, Recorder) {
        let (update_tx, updates) = mpsc::unbounded_channel();
        let (error_tx, errors) = mpsc::unbounded_channel();
        let handlers = SyncHandlers::new(move |id: &BookingId, status| {
            let _ = update_tx.send((id.clone(), status));
        })
        .on_error(move |message: &str| {
            let _ = error_tx.send(message.to_string());
        });
        (handlers, Recorder { updates, errors })
    }

    pub fn drain_updates(&mut self) -> Vec<(BookingId, BookingStatus)> {
        let mut seen = Vec::new();
        while let Ok(update) = self.updates.try_recv() {
            seen.push(update);
        }
        seen
    }

    pub fn drain_errors(&mut self) -> Vec<String> {
        let mut seen = Vec::new();
        while let Ok(message) = self.errors.try_recv() {
            seen.push(message);
        }
        seen
    }
}

pub fn client_sync(api: Arc<ScriptedApi>, channel: Arc<LocalPushChannel>) -> BookingSync {
    BookingSync::new(api, channel, Arc::new(StaticAuth::client("token", "c1")))
}

/// Sleeps in small steps until `check` holds; panics after `limit`.
pub async fn wait_until<F: Fn() -> bool>(limit: Duration, check: F) {
    let deadline = tokio::time::Instant::now() + limit;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("condition not met within {limit:?}");
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
