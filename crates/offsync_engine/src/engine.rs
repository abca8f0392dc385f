//! Sync engine state machine.
//!
//! A [`SyncEngine`] is a cheap handle to a worker task that owns the session.
//! Every host call is a message to that task, so state transitions, storage
//! transactions and listener notifications never interleave. The worker
//! keeps reading messages while it is parked on a network call, a backoff
//! timer, a token refresh or the queue-drain handshake; that is how
//! `start`, `cancel` and `notify_queue_drained` reach a running attempt.

use crate::apply::{ApplyEngine, SyncLog};
use crate::auth::{AuthCoordinator, TokenProvider};
use crate::config::SyncConfig;
use crate::drain::QueueDrainCoordinator;
use crate::error::{ErrorKind, SyncError, SyncResult};
use crate::events::{AttemptPhase, ChannelEvent, EngineEvent, ListenerId, ListenerRegistry, SyncEvent};
use crate::http::HttpTransport;
use crate::registry::ConnectionRegistry;
use crate::retry::{RetryAction, RetryScheduler};
use crate::state::{SyncPhase, SyncState, SyncStats};
use crate::storage::{LocalStorage, LocalStorageExt};
use crate::tracker::ChangeTracker;
use crate::transport::HttpClient;
use offsync_protocol::{Conflict, ConflictResolver, PullRequest, PullResponse, PushRequest};
use parking_lot::RwLock;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

enum Command {
    Start { reason: String, background: bool },
    Cancel,
    QueueDrained,
    Foreground,
    Channel(ChannelEvent),
    Shutdown,
}

struct Shared {
    state: watch::Sender<SyncState>,
    stats: RwLock<SyncStats>,
    listeners: ListenerRegistry,
    auth: Arc<AuthCoordinator>,
    sync_log: Option<Arc<SyncLog>>,
}

impl Shared {
    fn emit(&self, event: impl Into<SyncEvent>) {
        self.listeners.emit(&event.into());
    }
}

/// Handle to a running sync engine.
///
/// Clones share the same engine. The worker stops once [`shutdown`] is
/// called or every handle is dropped.
///
/// [`shutdown`]: SyncEngine::shutdown
#[derive(Clone)]
pub struct SyncEngine {
    commands: mpsc::UnboundedSender<Command>,
    shared: Arc<Shared>,
}

impl SyncEngine {
    /// Starts building an engine.
    pub fn builder(config: SyncConfig, registry: Arc<ConnectionRegistry>) -> SyncEngineBuilder {
        SyncEngineBuilder {
            config,
            registry,
            resolver: None,
            token_provider: None,
        }
    }

    /// Requests a sync attempt.
    ///
    /// While an attempt is running, the request is coalesced: at most one
    /// re-run is scheduled, whatever the number of calls.
    pub fn start(&self, reason: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Start {
            reason: reason.into(),
            background: false,
        })
    }

    /// Requests an attempt that is cancelled if the app returns to the foreground.
    pub fn start_background(&self, reason: impl Into<String>) -> SyncResult<()> {
        self.send(Command::Start {
            reason: reason.into(),
            background: true,
        })
    }

    /// Aborts the running attempt at its next suspension point.
    ///
    /// Committed local transactions are kept. A queued re-run is dropped.
    pub fn cancel(&self) -> SyncResult<()> {
        self.send(Command::Cancel)
    }

    /// Acknowledges a `drain_queue` event.
    pub fn notify_queue_drained(&self) -> SyncResult<()> {
        self.send(Command::QueueDrained)
    }

    /// Reports that the host app returned to the foreground.
    pub fn notify_foreground(&self) -> SyncResult<()> {
        self.send(Command::Foreground)
    }

    /// Feeds a realtime channel notification; `cdc` starts a sync.
    pub fn handle_channel_event(&self, event: ChannelEvent) -> SyncResult<()> {
        self.send(Command::Channel(event))
    }

    /// Stops the worker after cancelling any running attempt.
    pub fn shutdown(&self) -> SyncResult<()> {
        self.send(Command::Shutdown)
    }

    /// Returns true while the worker accepts commands.
    pub fn is_running(&self) -> bool {
        !self.commands.is_closed()
    }

    /// Registers a sync listener.
    ///
    /// Listeners run on the engine worker; they must not block.
    pub fn add_sync_listener<F>(&self, listener: F) -> ListenerId
    where
        F: Fn(&SyncEvent) + Send + Sync + 'static,
    {
        self.shared.listeners.add(listener)
    }

    /// Removes a sync listener.
    pub fn remove_sync_listener(&self, id: ListenerId) -> bool {
        self.shared.listeners.remove(id)
    }

    /// Sets or clears the bearer token used by the next request.
    pub fn set_auth_token(&self, token: Option<String>) {
        self.shared.auth.set_token(token);
    }

    /// Registers the callback asked for a token after a 401/403.
    pub fn set_token_provider(&self, provider: Arc<dyn TokenProvider>) {
        self.shared.auth.set_provider(provider);
    }

    /// Returns the current state.
    pub fn state(&self) -> SyncState {
        *self.shared.state.borrow()
    }

    /// Returns a receiver that observes state changes.
    pub fn subscribe_state(&self) -> watch::Receiver<SyncState> {
        self.shared.state.subscribe()
    }

    /// Returns the current stats.
    pub fn stats(&self) -> SyncStats {
        self.shared.stats.read().clone()
    }

    /// Returns the resolved conflicts, if the sync log is enabled.
    pub fn sync_log(&self) -> Option<Vec<Conflict>> {
        self.shared.sync_log.as_ref().map(|log| log.entries())
    }

    fn send(&self, command: Command) -> SyncResult<()> {
        self.commands
            .send(command)
            .map_err(|_| SyncError::EngineStopped)
    }
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("state", &self.state())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Builder for [`SyncEngine`].
pub struct SyncEngineBuilder {
    config: SyncConfig,
    registry: Arc<ConnectionRegistry>,
    resolver: Option<Arc<dyn ConflictResolver>>,
    token_provider: Option<Arc<dyn TokenProvider>>,
}

impl SyncEngineBuilder {
    /// Post-processes every merge with a host resolver.
    pub fn conflict_resolver(mut self, resolver: Arc<dyn ConflictResolver>) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Registers the token provider.
    pub fn token_provider(mut self, provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = Some(provider);
        self
    }

    /// Spawns the worker on the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics if called outside a tokio runtime.
    pub fn spawn<C: HttpClient + 'static>(self, client: C) -> SyncEngine {
        let config = self.config;
        let auth = Arc::new(AuthCoordinator::new(config.auth_token.clone()));
        if let Some(provider) = self.token_provider {
            auth.set_provider(provider);
        }

        let sync_log = config.sync_log.then(|| Arc::new(SyncLog::new()));
        let mut applier = ApplyEngine::new();
        if let Some(resolver) = self.resolver {
            applier = applier.with_resolver(resolver);
        }
        if let Some(log) = &sync_log {
            applier = applier.with_log(Arc::clone(log));
        }

        let (state, _) = watch::channel(SyncState::Idle);
        let shared = Arc::new(Shared {
            state,
            stats: RwLock::new(SyncStats::default()),
            listeners: ListenerRegistry::new(),
            auth: Arc::clone(&auth),
            sync_log,
        });

        let (commands, receiver) = mpsc::unbounded_channel();
        let transport = HttpTransport::new(
            client,
            config.pull_url.clone(),
            config.push_url.clone(),
            config.timeout,
            auth,
        );
        let worker = Worker {
            inbox: Inbox {
                commands: receiver,
                shared: Arc::clone(&shared),
                cancel: CancellationToken::new(),
                drain: QueueDrainCoordinator::new(),
                rerun: None,
                background: false,
                closed: false,
            },
            shared: Arc::clone(&shared),
            retry: RetryScheduler::new(config.retry.clone()),
            registry: self.registry,
            transport,
            applier,
            config,
        };
        tokio::spawn(worker.run());

        SyncEngine { commands, shared }
    }
}

struct PendingStart {
    reason: String,
    background: bool,
}

/// Command intake of the worker, usable while an attempt is parked.
struct Inbox {
    commands: mpsc::UnboundedReceiver<Command>,
    shared: Arc<Shared>,
    cancel: CancellationToken,
    drain: QueueDrainCoordinator,
    rerun: Option<PendingStart>,
    background: bool,
    closed: bool,
}

impl Inbox {
    /// Waits for the next attempt to run; `None` once the engine stops.
    async fn next_idle(&mut self) -> Option<PendingStart> {
        if let Some(pending) = self.rerun.take() {
            return Some(pending);
        }
        while !self.closed {
            match self.commands.recv().await {
                Some(Command::Start { reason, background }) => {
                    return Some(PendingStart { reason, background })
                }
                Some(Command::Channel(event)) => {
                    if self.forward_channel(event) {
                        return Some(PendingStart {
                            reason: "cdc".into(),
                            background: false,
                        });
                    }
                }
                Some(Command::QueueDrained) => {
                    self.drain.acknowledge();
                }
                Some(Command::Cancel) => debug!("cancel requested while idle; ignoring"),
                Some(Command::Foreground) => {}
                Some(Command::Shutdown) | None => self.closed = true,
            }
        }
        None
    }

    /// Runs `future` to completion while serving commands.
    ///
    /// Returns `Cancelled` as soon as the attempt is cancelled.
    async fn suspend<F: Future>(&mut self, future: F) -> SyncResult<F::Output> {
        tokio::pin!(future);
        loop {
            tokio::select! {
                biased;
                _ = self.cancel.cancelled() => return Err(SyncError::Cancelled),
                output = &mut future => return Ok(output),
                command = self.commands.recv(), if !self.closed => self.handle_busy(command),
            }
        }
    }

    fn handle_busy(&mut self, command: Option<Command>) {
        match command {
            Some(Command::Start { reason, background }) => self.coalesce(reason, background),
            Some(Command::Channel(event)) => {
                if self.forward_channel(event) {
                    self.coalesce("cdc".into(), false);
                }
            }
            Some(Command::QueueDrained) => {
                self.drain.acknowledge();
            }
            Some(Command::Cancel) => {
                info!("sync cancel requested");
                self.rerun = None;
                self.cancel.cancel();
            }
            Some(Command::Foreground) => {
                if self.background {
                    info!("app returned to foreground; cancelling background sync");
                    self.cancel.cancel();
                }
            }
            Some(Command::Shutdown) | None => {
                self.closed = true;
                self.rerun = None;
                self.cancel.cancel();
            }
        }
    }

    fn coalesce(&mut self, reason: String, background: bool) {
        debug!(reason = %reason, "sync already running; queueing a re-run");
        self.shared.emit(EngineEvent::SyncQueued {
            reason: reason.clone(),
        });
        match &mut self.rerun {
            Some(pending) => pending.background &= background,
            None => self.rerun = Some(PendingStart { reason, background }),
        }
    }

    fn forward_channel(&self, event: ChannelEvent) -> bool {
        debug!(?event, "channel event");
        let is_cdc = matches!(event, ChannelEvent::Cdc);
        self.shared.emit(event);
        is_cdc
    }

    fn begin(&mut self, background: bool) {
        self.cancel = CancellationToken::new();
        self.background = background;
    }

    fn end(&mut self) {
        self.drain.disarm();
        self.background = false;
    }

    fn check_cancelled(&self) -> SyncResult<()> {
        if self.cancel.is_cancelled() {
            Err(SyncError::Cancelled)
        } else {
            Ok(())
        }
    }
}

enum Step {
    Pull,
    Apply(PullResponse),
    Drain,
    Push,
    Done,
}

impl Step {
    // Network phase an auth failure at this step resumes.
    fn phase(&self) -> SyncPhase {
        match self {
            Step::Push => SyncPhase::Push,
            Step::Pull | Step::Apply(_) | Step::Drain | Step::Done => SyncPhase::Pull,
        }
    }
}

struct Worker<C: HttpClient> {
    inbox: Inbox,
    shared: Arc<Shared>,
    config: SyncConfig,
    registry: Arc<ConnectionRegistry>,
    transport: HttpTransport<C>,
    applier: ApplyEngine,
    retry: RetryScheduler,
}

impl<C: HttpClient + 'static> Worker<C> {
    async fn run(mut self) {
        info!(pull_url = %self.transport.pull_url(), push_url = %self.transport.push_url(), "sync engine started");
        while let Some(start) = self.inbox.next_idle().await {
            self.run_attempt(start).await;
        }
        info!("sync engine stopped");
    }

    async fn run_attempt(&mut self, start: PendingStart) {
        self.inbox.begin(start.background);
        self.retry.reset();
        info!(reason = %start.reason, background = start.background, "sync started");
        self.shared.emit(EngineEvent::SyncStart {
            reason: start.reason,
        });
        self.set_state(SyncState::SyncRequested);

        let started = Instant::now();
        let outcome = self.drive().await;
        self.inbox.end();

        match outcome {
            Ok(()) => {
                self.retry.reset();
                {
                    let mut stats = self.shared.stats.write();
                    stats.attempts_completed += 1;
                    stats.last_sync_time = Some(Instant::now());
                }
                info!(elapsed_ms = started.elapsed().as_millis() as u64, "sync finished");
                self.set_state(SyncState::Done);
            }
            Err(err) => self.fail(err),
        }
    }

    fn fail(&mut self, err: SyncError) {
        {
            let mut stats = self.shared.stats.write();
            stats.attempts_failed += 1;
            stats.last_error = Some(err.to_string());
        }

        if err.is_auth_failure() {
            error!(error = %err, "sync failed: not authenticated");
            self.shared.emit(EngineEvent::AuthFailed);
            self.set_state(SyncState::AuthFailed);
            return;
        }

        if matches!(err, SyncError::Cancelled) {
            info!("sync cancelled");
        } else {
            error!(error = %err, "sync failed");
        }
        self.shared.emit(EngineEvent::Error {
            message: err.to_string(),
        });
        self.set_state(SyncState::Error);
    }

    async fn drive(&mut self) -> SyncResult<()> {
        let storage = self
            .inbox
            .suspend(self.registry.acquire(&self.config.connection_tag))
            .await??;

        let mut step = Step::Pull;
        loop {
            self.inbox.check_cancelled()?;
            let phase = step.phase();
            let outcome = match step {
                Step::Pull => self.pull(&storage).await.map(Step::Apply),
                Step::Apply(response) => self.apply(&storage, &response).map(|()| Step::Drain),
                Step::Drain => self.drain().await.map(|()| Step::Push),
                Step::Push => self.push(&storage).await.map(|()| Step::Done),
                Step::Done => return Ok(()),
            };
            step = match outcome {
                Ok(next) => next,
                Err(err) => self.recover(err, phase).await?,
            };
        }
    }

    async fn recover(&mut self, err: SyncError, phase: SyncPhase) -> SyncResult<Step> {
        match self.retry.on_failure(&err) {
            RetryAction::Backoff(delay) => {
                let attempt = self.retry.attempts();
                let delay_ms = delay.as_millis() as u64;
                warn!(attempt, delay_ms, error = %err, "sync step failed; retrying");
                self.shared.stats.write().retries += 1;
                self.set_state(SyncState::RetryScheduled);
                self.shared.emit(EngineEvent::RetryScheduled {
                    attempt,
                    delay_ms,
                    message: err.to_string(),
                });
                self.inbox.suspend(tokio::time::sleep(delay)).await?;
                Ok(Step::Pull)
            }
            RetryAction::RefreshToken => {
                self.enter_auth_required(&err);
                self.inbox.suspend(self.shared.auth.refresh()).await??;
                self.shared.stats.write().auth_refreshes += 1;
                Ok(match phase {
                    SyncPhase::Pull => Step::Pull,
                    SyncPhase::Push => Step::Push,
                })
            }
            RetryAction::AuthExhausted => {
                self.enter_auth_required(&err);
                Err(SyncError::AuthExhausted {
                    retries: self.retry.auth_retries(),
                })
            }
            RetryAction::GiveUp if err.kind() == ErrorKind::Retriable => {
                Err(SyncError::RetriesExhausted {
                    attempts: self.retry.attempts(),
                    last: Box::new(err),
                })
            }
            RetryAction::GiveUp => Err(err),
        }
    }

    fn enter_auth_required(&mut self, err: &SyncError) {
        warn!(
            error = %err,
            auth_retries = self.retry.auth_retries(),
            "server rejected credentials"
        );
        self.set_state(SyncState::AuthRequired);
        self.shared.emit(EngineEvent::AuthRequired);
    }

    async fn pull(&mut self, storage: &Arc<dyn LocalStorage>) -> SyncResult<PullResponse> {
        self.set_state(SyncState::Syncing(SyncPhase::Pull));
        self.emit_phase(AttemptPhase::Pull);

        let last_pulled_at = storage.view(|view| view.last_pulled_at())?;
        let request = PullRequest::new(last_pulled_at);
        let response = self.inbox.suspend(self.transport.pull(&request)).await??;
        self.on_response(SyncPhase::Pull, response.status);

        let pulled = self.transport.decode_pull(&response)?;
        debug!(
            changes = pulled.changes.len(),
            timestamp = pulled.timestamp,
            "pulled remote changes"
        );
        Ok(pulled)
    }

    fn apply(&mut self, storage: &Arc<dyn LocalStorage>, response: &PullResponse) -> SyncResult<()> {
        self.set_state(SyncState::Applying);
        let report = self.applier.apply(storage.as_ref(), response)?;

        let mut stats = self.shared.stats.write();
        stats.records_pulled += report.writes() as u64;
        stats.conflicts_resolved += report.conflicts as u64;
        Ok(())
    }

    async fn drain(&mut self) -> SyncResult<()> {
        self.set_state(SyncState::WaitingForQueue);
        self.emit_phase(AttemptPhase::DrainQueue);

        let acknowledged = self.inbox.drain.arm();
        self.shared.emit(EngineEvent::DrainQueue);
        self.inbox
            .suspend(acknowledged)
            .await?
            .map_err(|_| SyncError::Cancelled)?;
        debug!("host queue drained");
        Ok(())
    }

    async fn push(&mut self, storage: &Arc<dyn LocalStorage>) -> SyncResult<()> {
        self.set_state(SyncState::Syncing(SyncPhase::Push));
        self.emit_phase(AttemptPhase::Push);

        let tracker = ChangeTracker::new(storage.as_ref());
        let changes = tracker.capture_local_changes()?;
        if changes.is_empty() {
            debug!("no local changes to push");
            return Ok(());
        }

        let last_pulled_at = storage.view(|view| view.last_pulled_at())?;
        let request = PushRequest::new(changes, last_pulled_at);
        let response = self.inbox.suspend(self.transport.push(&request)).await??;
        self.on_response(SyncPhase::Push, response.status);
        self.transport.check_push(&response)?;

        let settled = tracker.mark_pushed_as_synced(&request.changes)?;
        let pushed = request.changes.len();
        info!(pushed, settled, "pushed local changes");
        self.shared.stats.write().records_pushed += pushed as u64;
        Ok(())
    }

    fn on_response(&mut self, phase: SyncPhase, status: u16) {
        debug!(phase = phase.as_str(), status, "sync response");
        self.shared.emit(EngineEvent::Http { phase, status });
        if status != 401 && status != 403 {
            self.retry.on_authorized();
        }
    }

    fn emit_phase(&self, phase: AttemptPhase) {
        self.shared.emit(EngineEvent::Phase {
            phase,
            attempt: self.retry.current_attempt(),
        });
    }

    fn set_state(&self, state: SyncState) {
        let previous = self.shared.state.send_replace(state);
        debug!(from = %previous, to = %state, "sync state transition");
        self.shared.emit(EngineEvent::State { state });
    }
}
