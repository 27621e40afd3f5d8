use std::collections::HashMap;
use std::fmt;
use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::{Mutex, ReentrantMutex};
use push_channel::{PushChannel, SubscriptionHandle};
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::api::BookingApi;
use crate::auth::{stored_identity, AuthProvider};
use crate::config::SyncOptions;
use crate::error::{SyncError, SyncResult};
use crate::identity::{IdentityCache, IdentityResolver, MemoryIdentityCache};
use crate::poller::{PollOutcome, PollingEngine};
use crate::push::{PushAdapter, PushSignal};
use crate::throttle::{ErrorThrottle, ThrottleDecision};
use crate::{BookingId, BookingStatus, BookingUpdate, CallerIdentity, WatchedBooking};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncState {
    Idle,
    ConnectingPush,
    ConnectedPush,
    ConnectingPoll,
    ConnectedPoll,
}

impl SyncState {
    pub fn connection_type(self) -> ConnectionType {
        match self {
            SyncState::Idle => ConnectionType::None,
            SyncState::ConnectingPush | SyncState::ConnectedPush => ConnectionType::Realtime,
            SyncState::ConnectingPoll | SyncState::ConnectedPoll => ConnectionType::Poll,
        }
    }

    pub fn is_connected(self) -> bool {
        matches!(self, SyncState::ConnectedPush | SyncState::ConnectedPoll)
    }

    fn is_push(self) -> bool {
        self.connection_type() == ConnectionType::Realtime
    }

    fn is_poll(self) -> bool {
        self.connection_type() == ConnectionType::Poll
    }
}

/// Transport currently driving updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    None,
    Realtime,
    Poll,
}

impl ConnectionType {
    pub fn as_str(self) -> &'static str {
        match self {
            ConnectionType::None => "none",
            ConnectionType::Realtime => "realtime",
            ConnectionType::Poll => "poll",
        }
    }
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot published to status subscribers on every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SyncStatus {
    pub state: SyncState,
    pub connection_type: ConnectionType,
    pub is_connected: bool,
}

impl From<SyncState> for SyncStatus {
    fn from(state: SyncState) -> Self {
        Self {
            state,
            connection_type: state.connection_type(),
            is_connected: state.is_connected(),
        }
    }
}

type UpdateFn = dyn Fn(&BookingId, BookingStatus) + Send + Sync;
type ErrorFn = dyn Fn(&str) + Send + Sync;

/// Caller callbacks. They run outside the controller's locks and may call
/// back into the [`SyncHandle`].
#[derive(Clone)]
pub struct SyncHandlers {
    on_update: Arc<UpdateFn>,
    on_error: Option<Arc<ErrorFn>>,
}

impl SyncHandlers {
    pub fn new<F>(on_update: F) -> Self
    where
        F: Fn(&BookingId, BookingStatus) + Send + Sync + 'static,
    {
        Self {
            on_update: Arc::new(on_update),
            on_error: None,
        }
    }

    pub fn on_error<F>(mut self, on_error: F) -> Self
    where
        F: Fn(&str) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(on_error));
        self
    }

    fn error(&self, message: &str) {
        if let Some(on_error) = self.on_error.as_ref() {
            on_error(message);
        }
    }
}

/// Collaborators shared by every session started from it.
pub struct BookingSync {
    api: Arc<dyn BookingApi>,
    channel: Arc<dyn PushChannel>,
    auth: Arc<dyn AuthProvider>,
    identity_cache: Arc<dyn IdentityCache>,
    identity: Option<CallerIdentity>,
}

impl BookingSync {
    pub fn new(
        api: Arc<dyn BookingApi>,
        channel: Arc<dyn PushChannel>,
        auth: Arc<dyn AuthProvider>,
    ) -> Self {
        Self {
            api,
            channel,
            auth,
            identity_cache: Arc::new(MemoryIdentityCache::new()),
            identity: None,
        }
    }

    pub fn with_identity_cache(mut self, cache: Arc<dyn IdentityCache>) -> Self {
        self.identity_cache = cache;
        self
    }

    /// Skips identity resolution: `identity` is used as the filter value as is.
    pub fn with_identity(mut self, identity: CallerIdentity) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Starts a session. Must be called from inside a Tokio runtime; without
    /// one the error callback fires and the handle stays idle.
    pub fn start(
        &self,
        watched: Vec<WatchedBooking>,
        options: SyncOptions,
        handlers: SyncHandlers,
    ) -> SyncHandle {
        let runtime = Handle::try_current().ok();
        let (status_tx, _) = watch::channel(SyncStatus::from(SyncState::Idle));
        let adapter = PushAdapter::new(Arc::clone(&self.channel), options.channel.clone());
        let resolver =
            IdentityResolver::new(Arc::clone(&self.api), Arc::clone(&self.identity_cache));
        let inner = Arc::new(Inner {
            runtime,
            api: Arc::clone(&self.api),
            adapter,
            auth: Arc::clone(&self.auth),
            resolver,
            identity: self.identity.clone(),
            session: Mutex::new(SyncSession::new(watched, &options)),
            options,
            handlers,
            generation: AtomicU64::new(0),
            dispatch: ReentrantMutex::new(()),
            status_tx,
        });

        if inner.runtime.is_none() {
            error!(target = "sync.controller", "no tokio runtime; booking sync stays idle");
            inner
                .handlers
                .error("failed to establish booking sync: no async runtime available");
        } else {
            inner.begin();
        }
        SyncHandle { inner }
    }
}

/// Caller-facing handle of one session. Clones share the session; when the
/// last clone is dropped the session stops.
#[derive(Clone)]
pub struct SyncHandle {
    inner: Arc<Inner>,
}

impl SyncHandle {
    pub fn state(&self) -> SyncState {
        self.inner.session.lock().state
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus::from(self.state())
    }

    pub fn is_connected(&self) -> bool {
        self.state().is_connected()
    }

    pub fn connection_type(&self) -> ConnectionType {
        self.state().connection_type()
    }

    pub fn consecutive_errors(&self) -> u32 {
        self.inner.session.lock().throttle.consecutive_errors()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
        self.inner.status_tx.subscribe()
    }

    /// Replaces the watched set. Restarts polling when polling; the push
    /// filter is identity scoped, so push sessions only record the set.
    pub fn notify_watch_set_changed(&self, watched: Vec<WatchedBooking>) {
        let inner = &self.inner;
        let mut session = inner.session.lock();
        for booking in &watched {
            session.known.insert(booking.id.clone(), booking.status);
        }
        session.watched = watched;
        if session.state.is_poll() && session.poll_task.is_some() {
            debug!(
                target = "sync.controller",
                watched = session.watched.len(),
                "watch set changed; restarting polling"
            );
            inner.start_polling_locked(&mut session);
        }
    }

    /// Idempotent. Once this returns no update callback fires for this
    /// session until the next `reconnect`.
    pub fn stop(&self) {
        let _dispatch = self.inner.dispatch.lock();
        let mut session = self.inner.session.lock();
        if session.state != SyncState::Idle {
            info!(target = "sync.controller", "stopping booking sync");
        }
        self.inner.halt_locked(&mut session);
    }

    /// Stops, then starts again from push with the last watched set.
    pub fn reconnect(&self) {
        let _dispatch = self.inner.dispatch.lock();
        if self.inner.runtime.is_none() {
            self.inner
                .handlers
                .error("failed to establish booking sync: no async runtime available");
            return;
        }
        info!(target = "sync.controller", "manual reconnect");
        self.inner.begin();
    }
}

impl fmt::Debug for SyncHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncHandle")
            .field("state", &self.state())
            .finish()
    }
}

enum Notice {
    Update(BookingUpdate),
    Error(String),
}

struct SyncSession {
    state: SyncState,
    generation: u64,
    poll_epoch: u64,
    watched: Vec<WatchedBooking>,
    /// Last status delivered (or supplied by the caller) per booking.
    known: HashMap<BookingId, BookingStatus>,
    throttle: ErrorThrottle,
    subscription: Option<SubscriptionHandle>,
    push_task: Option<JoinHandle<()>>,
    fallback_task: Option<JoinHandle<()>>,
    poll_task: Option<JoinHandle<()>>,
}

impl SyncSession {
    fn new(watched: Vec<WatchedBooking>, options: &SyncOptions) -> Self {
        Self {
            state: SyncState::Idle,
            generation: 0,
            poll_epoch: 0,
            known: HashMap::new(),
            watched,
            throttle: ErrorThrottle::new(options.throttle.clone()),
            subscription: None,
            push_task: None,
            fallback_task: None,
            poll_task: None,
        }
    }

    fn teardown_push(&mut self) {
        if let Some(subscription) = self.subscription.take() {
            subscription.unsubscribe();
        }
        if let Some(task) = self.push_task.take() {
            task.abort();
        }
    }

    fn teardown(&mut self) {
        self.teardown_push();
        if let Some(task) = self.fallback_task.take() {
            task.abort();
        }
        if let Some(task) = self.poll_task.take() {
            task.abort();
        }
    }
}

struct Inner {
    runtime: Option<Handle>,
    api: Arc<dyn BookingApi>,
    adapter: PushAdapter,
    auth: Arc<dyn AuthProvider>,
    resolver: IdentityResolver,
    identity: Option<CallerIdentity>,
    options: SyncOptions,
    handlers: SyncHandlers,
    session: Mutex<SyncSession>,
    /// Mirrors `SyncSession::generation` for lock-free checks at dispatch.
    generation: AtomicU64,
    dispatch: ReentrantMutex<()>,
    status_tx: watch::Sender<SyncStatus>,
}

impl Inner {
    fn begin(self: &Arc<Self>) {
        let mut session = self.session.lock();
        self.halt_locked(&mut session);
        session.throttle = ErrorThrottle::new(self.options.throttle.clone());
        session.known = session
            .watched
            .iter()
            .map(|booking| (booking.id.clone(), booking.status))
            .collect();

        if self.options.enabled {
            self.set_state(&mut session, SyncState::ConnectingPush);
            self.spawn_push_locked(&mut session);
        } else {
            debug!(target = "sync.controller", "realtime disabled; polling from start");
            self.start_polling_locked(&mut session);
        }
    }

    /// Tears every transport down and invalidates in-flight work.
    fn halt_locked(&self, session: &mut SyncSession) {
        session.teardown();
        session.generation = self.generation.fetch_add(1, Ordering::AcqRel) + 1;
        self.set_state(session, SyncState::Idle);
    }

    fn set_state(&self, session: &mut SyncSession, next: SyncState) {
        if session.state == next {
            return;
        }
        debug!(
            target = "sync.controller",
            from = ?session.state,
            to = ?next,
            "sync state transition"
        );
        session.state = next;
        self.status_tx.send_replace(SyncStatus::from(next));
    }

    fn spawn(&self, task: impl std::future::Future<Output = ()> + Send + 'static) -> Option<JoinHandle<()>> {
        self.runtime.as_ref().map(|runtime| runtime.spawn(task))
    }

    async fn caller_identity(&self) -> SyncResult<CallerIdentity> {
        if let Some(identity) = self.identity.as_ref() {
            return Ok(identity.clone());
        }
        let user = stored_identity(self.auth.as_ref())
            .ok_or_else(|| SyncError::Identity("no signed-in user".into()))?;
        self.resolver.resolve(&user).await
    }

    fn spawn_push_locked(self: &Arc<Self>, session: &mut SyncSession) {
        let weak = Arc::downgrade(self);
        let generation = session.generation;
        session.push_task = self.spawn(async move {
            let resolved = match weak.upgrade() {
                Some(inner) => {
                    let identity = inner.caller_identity().await;
                    identity.map(|identity| (identity, inner.adapter.clone()))
                }
                None => return,
            };
            let (identity, adapter) = match resolved {
                Ok(resolved) => resolved,
                Err(err) => {
                    if let Some(inner) = weak.upgrade() {
                        let _ = inner.on_push_signal(generation, PushSignal::Failed(err.to_string()));
                    }
                    return;
                }
            };
            adapter
                .run(
                    &identity,
                    |handle| {
                        weak.upgrade()
                            .map(|inner| inner.attach_subscription(generation, handle))
                            .unwrap_or(false)
                    },
                    |signal| match weak.upgrade() {
                        Some(inner) => inner.on_push_signal(generation, signal),
                        None => ControlFlow::Break(()),
                    },
                )
                .await;
        });
    }

    fn attach_subscription(&self, generation: u64, handle: SubscriptionHandle) -> bool {
        let mut session = self.session.lock();
        if session.generation != generation || !session.state.is_push() {
            return false;
        }
        session.subscription = Some(handle);
        true
    }

    fn on_push_signal(self: &Arc<Self>, generation: u64, signal: PushSignal) -> ControlFlow<()> {
        let mut notices = Vec::new();
        let flow = {
            let mut session = self.session.lock();
            if session.generation != generation || !session.state.is_push() {
                return ControlFlow::Break(());
            }
            match signal {
                PushSignal::Subscribed => {
                    session.throttle.reset();
                    if session.state != SyncState::ConnectedPush {
                        info!(target = "sync.push", "realtime booking updates connected");
                    }
                    self.set_state(&mut session, SyncState::ConnectedPush);
                    ControlFlow::Continue(())
                }
                PushSignal::Update(update) => {
                    session.throttle.reset();
                    if remember(&mut session, &update) {
                        notices.push(Notice::Update(update));
                    }
                    ControlFlow::Continue(())
                }
                PushSignal::Failed(message) => {
                    warn!(target = "sync.push", error = %message, "realtime subscription failed");
                    self.connectivity_failure_locked(&mut session, message, &mut notices);
                    ControlFlow::Break(())
                }
            }
        };
        self.deliver(generation, notices);
        flow
    }

    fn connectivity_failure_locked(
        self: &Arc<Self>,
        session: &mut SyncSession,
        message: String,
        notices: &mut Vec<Notice>,
    ) {
        let reported = match session.throttle.record(&message) {
            ThrottleDecision::Disable(final_message) => {
                error!(
                    target = "sync.controller",
                    failures = session.throttle.consecutive_errors(),
                    "too many connection failures; disabling booking sync"
                );
                self.halt_locked(session);
                notices.push(Notice::Error(final_message));
                return;
            }
            ThrottleDecision::Report(message) => {
                notices.push(Notice::Error(message));
                true
            }
            ThrottleDecision::Suppress => false,
        };

        if !session.state.is_push() {
            return;
        }
        session.teardown_push();
        if self.options.fallback_to_polling {
            info!(
                target = "sync.controller",
                delay_ms = self.options.fallback_delay.as_millis() as u64,
                "falling back to polling"
            );
            self.set_state(session, SyncState::ConnectingPoll);
            self.schedule_fallback_locked(session);
        } else {
            self.halt_locked(session);
            if !reported {
                notices.push(Notice::Error(format!(
                    "live booking updates unavailable: {message}"
                )));
            }
        }
    }

    fn schedule_fallback_locked(self: &Arc<Self>, session: &mut SyncSession) {
        let weak = Arc::downgrade(self);
        let generation = session.generation;
        let delay = self.options.fallback_delay;
        session.fallback_task = self.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(inner) = weak.upgrade() {
                inner.begin_fallback_polling(generation);
            }
        });
    }

    fn begin_fallback_polling(self: &Arc<Self>, generation: u64) {
        let mut session = self.session.lock();
        if session.generation != generation || session.state != SyncState::ConnectingPoll {
            return;
        }
        // The running fallback task is the caller; drop its handle without aborting.
        session.fallback_task = None;
        self.start_polling_locked(&mut session);
    }

    fn start_polling_locked(self: &Arc<Self>, session: &mut SyncSession) {
        if let Some(task) = session.poll_task.take() {
            task.abort();
        }
        session.poll_epoch += 1;
        self.set_state(session, SyncState::ConnectingPoll);

        let engine = PollingEngine::new(Arc::clone(&self.api), &session.watched);
        let weak: Weak<Self> = Arc::downgrade(self);
        let generation = session.generation;
        let epoch = session.poll_epoch;
        let period = self.options.polling_interval;
        debug!(
            target = "sync.poll",
            watched = session.watched.len(),
            interval_ms = period.as_millis() as u64,
            "starting status polling"
        );
        session.poll_task = self.spawn(async move {
            engine
                .run_every(period, |outcome| match weak.upgrade() {
                    Some(inner) => inner.on_poll_outcome(generation, epoch, outcome),
                    None => ControlFlow::Break(()),
                })
                .await;
        });
    }

    fn on_poll_outcome(
        self: &Arc<Self>,
        generation: u64,
        epoch: u64,
        outcome: PollOutcome,
    ) -> ControlFlow<()> {
        let mut notices = Vec::new();
        let flow = {
            let mut session = self.session.lock();
            if session.generation != generation
                || session.poll_epoch != epoch
                || !session.state.is_poll()
            {
                return ControlFlow::Break(());
            }

            if outcome.connectivity_lost() {
                let message = outcome.failure_message();
                warn!(target = "sync.poll", error = %message, "poll cycle failed");
                self.connectivity_failure_locked(&mut session, message, &mut notices);
            } else {
                session.throttle.reset();
                if outcome.item_failures > 0 {
                    debug!(
                        target = "sync.poll",
                        failed = outcome.item_failures,
                        polled = outcome.polled,
                        "poll cycle finished with item failures"
                    );
                }
                self.set_state(&mut session, SyncState::ConnectedPoll);
                for update in outcome.updates {
                    if remember(&mut session, &update) {
                        notices.push(Notice::Update(update));
                    }
                }
            }

            if session.state.is_poll() {
                ControlFlow::Continue(())
            } else {
                ControlFlow::Break(())
            }
        };
        self.deliver(generation, notices);
        flow
    }

    /// Runs callbacks for `generation`. Updates are dropped once the session
    /// has moved on; errors (including the final disable notice) always go out.
    fn deliver(&self, generation: u64, notices: Vec<Notice>) {
        if notices.is_empty() {
            return;
        }
        let _dispatch = self.dispatch.lock();
        for notice in notices {
            match notice {
                Notice::Update(update) => {
                    if self.generation.load(Ordering::Acquire) != generation {
                        debug!(
                            target = "sync.controller",
                            booking = %update.id,
                            "dropping update for stopped session"
                        );
                        continue;
                    }
                    debug!(
                        target = "sync.controller",
                        booking = %update.id,
                        status = %update.status,
                        "booking status changed"
                    );
                    (self.handlers.on_update)(&update.id, update.status);
                }
                Notice::Error(message) => self.handlers.error(&message),
            }
        }
    }
}

impl Drop for Inner {
    fn drop(&mut self) {
        self.session.get_mut().teardown();
    }
}

/// Records a delivered status; `false` when it repeats the known one.
fn remember(session: &mut SyncSession, update: &BookingUpdate) -> bool {
    if session.known.get(&update.id) == Some(&update.status) {
        return false;
    }
    session.known.insert(update.id.clone(), update.status);
    true
}
