use std::cell::Cell;
use std::collections::HashMap;
use std::ops::ControlFlow;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, ReentrantMutex};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, error, warn};

use crate::api::BookingApi;
use crate::error::SyncError;
use crate::{BookingId, BookingStatus, BookingUpdate, WatchedBooking};

/// Result of one polling cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PollOutcome {
    /// Changes in watch-list order.
    pub updates: Vec<BookingUpdate>,
    pub polled: usize,
    pub item_failures: usize,
    /// Items whose request never got an HTTP response.
    pub transport_failures: usize,
}

impl PollOutcome {
    /// A non-empty cycle in which no request reached the server.
    pub fn connectivity_lost(&self) -> bool {
        self.polled > 0 && self.transport_failures == self.polled
    }

    pub fn failure_message(&self) -> String {
        format!(
            "connection lost: status poll failed for all {} bookings",
            self.polled
        )
    }
}

/// Differential status fetcher for a fixed watch list.
pub struct PollingEngine {
    api: Arc<dyn BookingApi>,
    watched: Vec<BookingId>,
    known: HashMap<BookingId, BookingStatus>,
}

impl PollingEngine {
    pub fn new(api: Arc<dyn BookingApi>, watched: &[WatchedBooking]) -> Self {
        Self {
            api,
            watched: watched.iter().map(|booking| booking.id.clone()).collect(),
            known: watched
                .iter()
                .map(|booking| (booking.id.clone(), booking.status))
                .collect(),
        }
    }

    pub fn watched(&self) -> &[BookingId] {
        &self.watched
    }

    pub fn known_status(&self, id: &BookingId) -> Option<BookingStatus> {
        self.known.get(id).copied()
    }

    /// Fetches every watched booking concurrently and reports statuses that
    /// differ from the last one seen. A failing item never aborts the cycle.
    pub async fn tick(&mut self) -> PollOutcome {
        let api = &self.api;
        let results = join_all(self.watched.iter().map(|id| api.fetch_status(id))).await;

        let mut outcome = PollOutcome {
            polled: self.watched.len(),
            ..PollOutcome::default()
        };
        for (id, result) in self.watched.iter().zip(results) {
            match result {
                Ok(raw) => {
                    let status = BookingStatus::normalize(&raw);
                    let previous = self.known.insert(id.clone(), status);
                    if previous != Some(status) {
                        outcome.updates.push(BookingUpdate {
                            id: id.clone(),
                            status,
                        });
                    }
                }
                Err(err) => {
                    outcome.item_failures += 1;
                    if err.is_transport() {
                        outcome.transport_failures += 1;
                    }
                    match err {
                        SyncError::Decode(_) => warn!(
                            target = "sync.poll",
                            booking = %id,
                            error = %err,
                            "malformed status response; skipping"
                        ),
                        _ => debug!(
                            target = "sync.poll",
                            booking = %id,
                            error = %err,
                            "status fetch failed; skipping"
                        ),
                    }
                }
            }
        }
        outcome
    }

    /// Ticks immediately, then every `period`, until `on_outcome` breaks.
    /// Ticks never overlap; a slow cycle delays the next one.
    pub async fn run_every<F>(mut self, period: Duration, mut on_outcome: F)
    where
        F: FnMut(PollOutcome) -> ControlFlow<()> + Send,
    {
        let mut ticker = interval(period.max(Duration::from_millis(1)));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            let outcome = self.tick().await;
            if on_outcome(outcome).is_break() {
                break;
            }
        }
    }
}

/// Polls a single booking, for views that observe one record.
pub struct StatusPoller {
    /// Held across the liveness check and the callback; `stop` takes it too.
    live: Arc<ReentrantMutex<Cell<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl StatusPoller {
    /// Starts polling on the current Tokio runtime. Without one the poller
    /// logs an error and comes back already stopped.
    pub fn spawn<F>(
        api: Arc<dyn BookingApi>,
        booking: WatchedBooking,
        period: Duration,
        on_change: F,
    ) -> Self
    where
        F: Fn(BookingUpdate) + Send + Sync + 'static,
    {
        let Ok(runtime) = Handle::try_current() else {
            error!(
                target = "sync.poll",
                booking = %booking.id,
                "no tokio runtime; single booking poller not started"
            );
            return Self {
                live: Arc::new(ReentrantMutex::new(Cell::new(false))),
                task: Mutex::new(None),
            };
        };

        let live = Arc::new(ReentrantMutex::new(Cell::new(true)));
        let engine = PollingEngine::new(api, std::slice::from_ref(&booking));
        let task = {
            let live = Arc::clone(&live);
            runtime.spawn(async move {
                engine
                    .run_every(period, |outcome| {
                        let live = live.lock();
                        for update in outcome.updates {
                            if !live.get() {
                                break;
                            }
                            debug!(
                                target = "sync.poll",
                                booking = %update.id,
                                status = %update.status,
                                "single booking status changed"
                            );
                            on_change(update);
                        }
                        if live.get() {
                            ControlFlow::Continue(())
                        } else {
                            ControlFlow::Break(())
                        }
                    })
                    .await;
            })
        };
        Self {
            live,
            task: Mutex::new(Some(task)),
        }
    }

    /// Idempotent. Waits for a callback running on another thread; no
    /// callback starts after this returns. Safe to call from the callback.
    pub fn stop(&self) {
        self.live.lock().set(false);
        if let Some(task) = self.task.lock().take() {
            task.abort();
        }
    }

    pub fn is_running(&self) -> bool {
        self.live.lock().get()
    }
}

impl Drop for StatusPoller {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SyncResult;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};

    /// Answers from a mutable table; missing ids fail like an HTTP 500.
    #[derive(Default)]
    struct TableApi {
        rows: Mutex<HashMap<String, SyncResult<String>>>,
    }

    impl TableApi {
        fn set(&self, id: &str, answer: SyncResult<String>) {
            self.rows.lock().insert(id.to_string(), answer);
        }
    }

    fn clone_answer(answer: &SyncResult<String>) -> SyncResult<String> {
        match answer {
            Ok(status) => Ok(status.clone()),
            Err(SyncError::Decode(msg)) => Err(SyncError::Decode(msg.clone())),
            Err(SyncError::Transport(msg)) => Err(SyncError::Transport(msg.clone())),
            Err(other) => Err(SyncError::Config(other.to_string())),
        }
    }

    #[async_trait]
    impl BookingApi for TableApi {
        async fn fetch_status(&self, id: &BookingId) -> SyncResult<String> {
            match self.rows.lock().get(id.as_str()) {
                Some(answer) => clone_answer(answer),
                None => Err(SyncError::UnexpectedStatus {
                    status: reqwest::StatusCode::INTERNAL_SERVER_ERROR,
                    body: String::new(),
                }),
            }
        }

        async fn resolve_consultant_id(&self, _user_id: &str) -> SyncResult<Option<String>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn reports_change_once() {
        let api = Arc::new(TableApi::default());
        api.set("1", Ok("confirmed".into()));
        let mut engine = PollingEngine::new(
            api.clone(),
            &[WatchedBooking::new("1", BookingStatus::Pending)],
        );

        let first = engine.tick().await;
        assert_eq!(
            first.updates,
            vec![BookingUpdate {
                id: "1".into(),
                status: BookingStatus::Confirmed
            }]
        );
        let second = engine.tick().await;
        assert!(second.updates.is_empty());
        assert_eq!(
            engine.known_status(&"1".into()),
            Some(BookingStatus::Confirmed)
        );
    }

    #[tokio::test]
    async fn item_failures_do_not_abort_cycle() {
        let api = Arc::new(TableApi::default());
        api.set("1", Err(SyncError::Decode("expected value".into())));
        api.set("3", Ok("cancelled".into()));
        let mut engine = PollingEngine::new(
            api,
            &[
                WatchedBooking::new("1", BookingStatus::Pending),
                WatchedBooking::new("2", BookingStatus::Pending),
                WatchedBooking::new("3", BookingStatus::Pending),
            ],
        );

        let outcome = engine.tick().await;
        assert_eq!(outcome.polled, 3);
        assert_eq!(outcome.item_failures, 2);
        assert_eq!(outcome.transport_failures, 0);
        assert!(!outcome.connectivity_lost());
        assert_eq!(outcome.updates.len(), 1);
        assert_eq!(outcome.updates[0].id, BookingId::from("3"));
    }

    #[tokio::test]
    async fn all_transport_failures_mean_connectivity_lost() {
        let api = Arc::new(TableApi::default());
        api.set("1", Err(SyncError::Transport("refused".into())));
        api.set("2", Err(SyncError::Transport("refused".into())));
        let mut engine = PollingEngine::new(
            api,
            &[
                WatchedBooking::new("1", BookingStatus::Pending),
                WatchedBooking::new("2", BookingStatus::Pending),
            ],
        );
        let outcome = engine.tick().await;
        assert!(outcome.connectivity_lost());
        assert!(outcome.failure_message().starts_with("connection lost"));
    }

    #[tokio::test]
    async fn empty_watch_list_is_a_successful_cycle() {
        let mut engine = PollingEngine::new(Arc::new(TableApi::default()), &[]);
        let outcome = engine.tick().await;
        assert_eq!(outcome.polled, 0);
        assert!(!outcome.connectivity_lost());
    }

    #[tokio::test]
    async fn unknown_status_normalizes_before_diffing() {
        let api = Arc::new(TableApi::default());
        api.set("1", Ok("archived".into()));
        let mut engine = PollingEngine::new(
            api,
            &[WatchedBooking::new("1", BookingStatus::Pending)],
        );
        assert!(engine.tick().await.updates.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn status_poller_ticks_until_stopped() {
        let api = Arc::new(TableApi::default());
        api.set("9", Ok("pending".into()));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let poller = {
            let seen = seen.clone();
            StatusPoller::spawn(
                api.clone(),
                WatchedBooking::new("9", BookingStatus::Pending),
                Duration::from_secs(30),
                move |update| seen.lock().push(update.status),
            )
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert!(seen.lock().is_empty());

        api.set("9", Ok("delayed".into()));
        tokio::time::sleep(Duration::from_secs(30)).await;
        assert_eq!(seen.lock().as_slice(), [BookingStatus::Delayed]);

        poller.stop();
        poller.stop();
        assert!(!poller.is_running());
        api.set("9", Ok("completed".into()));
        tokio::time::sleep(Duration::from_secs(90)).await;
        assert_eq!(seen.lock().as_slice(), [BookingStatus::Delayed]);
    }

    #[test]
    fn status_poller_outside_a_runtime_starts_stopped() {
        let api = Arc::new(TableApi::default());
        let poller = StatusPoller::spawn(
            api,
            WatchedBooking::new("1", BookingStatus::Pending),
            Duration::from_secs(30),
            |_| {},
        );
        assert!(!poller.is_running());
        poller.stop();
        assert!(!poller.is_running());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn status_poller_stop_waits_for_running_callback() {
        let api = Arc::new(TableApi::default());
        api.set("9", Ok("confirmed".into()));
        let (entered_tx, entered_rx) = std::sync::mpsc::channel();
        let finished = Arc::new(AtomicBool::new(false));
        let calls = Arc::new(Mutex::new(0));
        let poller = {
            let finished = finished.clone();
            let calls = calls.clone();
            StatusPoller::spawn(
                api.clone(),
                WatchedBooking::new("9", BookingStatus::Pending),
                Duration::from_millis(20),
                move |_| {
                    *calls.lock() += 1;
                    let _ = entered_tx.send(());
                    std::thread::sleep(Duration::from_millis(200));
                    finished.store(true, Ordering::SeqCst);
                },
            )
        };

        tokio::task::spawn_blocking(move || entered_rx.recv_timeout(Duration::from_secs(5)))
            .await
            .expect("join")
            .expect("callback entered");
        poller.stop();
        assert!(finished.load(Ordering::SeqCst));
        assert!(!poller.is_running());

        api.set("9", Ok("completed".into()));
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(*calls.lock(), 1);
    }
}
