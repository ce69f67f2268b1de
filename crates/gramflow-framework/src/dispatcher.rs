//! Event dispatcher.
//!
//! The [`Dispatcher`] owns the inbound [`EventQueue`], the handler
//! [`Registry`] and a pool of workers. Each worker takes one event at a time
//! and walks it through
//!
//! ```text
//! Queued → Matching → MiddlewareBefore → Executing → MiddlewareAfter → Done
//!                                                                   ↘ Failed
//! ```
//!
//! producing a [`DispatchReport`]. Failures are contained per event: they are
//! logged with the event id, error kind and stage, counted, and never stop a
//! worker.
//!
//! With `shard_by_chat` every chat id is pinned to one worker through a
//! per-worker queue, so events of one chat are handled strictly in arrival
//! order while different chats still run in parallel.
//!
//! ```rust,ignore
//! let dispatcher = Dispatcher::new(DispatcherConfig::default(), bot)?;
//! dispatcher.on(filter::command("start")).handler(start);
//!
//! dispatcher.start(4)?;
//! let queue = dispatcher.queue();
//! queue.push(event).await?;
//! ...
//! dispatcher.stop(true).await;
//! ```

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use futures::future::join_all;
use parking_lot::{Mutex, RwLock};
use tokio::sync::Mutex as AsyncMutex;
use tokio::sync::mpsc::{self, Receiver};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, debug_span, error, info, trace, warn};

use gramflow_core::{BoxedBot, ErrorKind, Event, EventId, Stage};

use crate::context::Context;
use crate::error::{ConfigError, DispatchError, StartError};
use crate::filter::Filter;
use crate::handler::BoxedHandler;
use crate::limiter::{LimitConfig, LimitMode, RateLimiter};
use crate::middleware::{BoxedMiddleware, Middleware, Outcome, run_chain};
use crate::queue::{EventQueue, OverflowPolicy};
use crate::registry::{RegistrationBuilder, RegistrationId, Registry};

/// Buffer of each per-worker queue when sharding by chat.
const SHARD_CAPACITY: usize = 16;

/// How long workers get to react to a force-cancel before being aborted.
const FORCE_GRACE: Duration = Duration::from_secs(1);

// ============================================================================
// Configuration
// ============================================================================

/// Dispatcher settings.
#[derive(Debug, Clone, PartialEq)]
pub struct DispatcherConfig {
    /// Maximum number of queued events.
    pub queue_capacity: usize,
    /// Workers started by [`Dispatcher::start_default`].
    pub worker_count: usize,
    /// Outbound tokens per second per chat.
    pub default_rate: f64,
    /// Outbound burst size per chat.
    pub default_capacity: f64,
    /// Pin each chat to one worker, preserving per-chat order.
    pub shard_by_chat: bool,
    /// How long a graceful stop waits for the queue to drain.
    pub drain_timeout: Duration,
    /// What producers experience when the queue is full.
    pub overflow: OverflowPolicy,
    /// Whether outbound sends wait for tokens or fail.
    pub limit_mode: LimitMode,
    /// Run every matching registration instead of only the first.
    pub fan_out: bool,
    /// Per-event processing budget; `None` means unbounded.
    pub dispatch_timeout: Option<Duration>,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 1024,
            worker_count: 4,
            default_rate: 20.0,
            default_capacity: 20.0,
            shard_by_chat: false,
            drain_timeout: Duration::from_secs(5),
            overflow: OverflowPolicy::Block,
            limit_mode: LimitMode::Block,
            fan_out: false,
            dispatch_timeout: None,
        }
    }
}

impl DispatcherConfig {
    /// Rejects settings the dispatcher cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.queue_capacity == 0 {
            return Err(ConfigError("queue_capacity must be at least 1".into()));
        }
        if self.worker_count == 0 {
            return Err(ConfigError("worker_count must be at least 1".into()));
        }
        if !(self.default_rate.is_finite() && self.default_rate > 0.0) {
            return Err(ConfigError(format!(
                "default_rate must be a positive number, got {}",
                self.default_rate
            )));
        }
        if !(self.default_capacity.is_finite() && self.default_capacity >= 1.0) {
            return Err(ConfigError(format!(
                "default_capacity must be at least 1, got {}",
                self.default_capacity
            )));
        }
        if self.dispatch_timeout == Some(Duration::ZERO) {
            return Err(ConfigError("dispatch_timeout must be positive".into()));
        }
        Ok(())
    }

    pub fn default_limit(&self) -> LimitConfig {
        LimitConfig::new(self.default_rate, self.default_capacity)
    }
}

// ============================================================================
// Reports / statistics
// ============================================================================

/// How an event ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DispatchOutcome {
    /// No registration matched. Not an error.
    NoMatch,
    /// At least one handler ran to completion.
    Handled,
    /// A middleware stopped the chain before the handler.
    ShortCircuited,
    /// Processing failed; see [`DispatchReport::error`].
    Failed,
}

/// The result of processing one event.
#[derive(Debug, Clone)]
pub struct DispatchReport {
    pub event_id: EventId,
    /// Terminal state: `Done` or `Failed`.
    pub state: Stage,
    pub outcome: DispatchOutcome,
    /// Names of the registrations that ran, in order.
    pub handled_by: Vec<String>,
    /// The failure and the stage it happened in.
    pub error: Option<(DispatchError, Stage)>,
}

impl DispatchReport {
    pub fn is_done(&self) -> bool {
        self.state == Stage::Done
    }

    pub fn error_kind(&self) -> Option<ErrorKind> {
        self.error.as_ref().map(|(e, _)| e.kind())
    }
}

/// Counters since the dispatcher was created.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchStats {
    pub processed: u64,
    pub done: u64,
    pub failed: u64,
    pub no_match: u64,
    pub timed_out: u64,
    pub overflow: u64,
    pub abandoned: u64,
}

#[derive(Default)]
struct Counters {
    processed: AtomicU64,
    done: AtomicU64,
    failed: AtomicU64,
    no_match: AtomicU64,
    timed_out: AtomicU64,
    abandoned: AtomicU64,
}

// ============================================================================
// Dispatcher
// ============================================================================

type SharedReceiver = Arc<AsyncMutex<Receiver<Arc<Event>>>>;

enum RunState {
    Idle(Receiver<Arc<Event>>),
    Running {
        tasks: Vec<JoinHandle<()>>,
        receivers: Vec<SharedReceiver>,
    },
    Stopped,
}

struct DispatcherInner {
    config: DispatcherConfig,
    bot: BoxedBot,
    registry: Arc<Registry>,
    middlewares: RwLock<Arc<Vec<BoxedMiddleware>>>,
    limiter: RateLimiter,
    queue: EventQueue,
    force: CancellationToken,
    counters: Counters,
    state: Mutex<RunState>,
}

/// The worker-pool dispatcher.
///
/// Cheap to clone; clones control the same workers.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

impl Dispatcher {
    /// Creates a stopped dispatcher with an empty registry.
    pub fn new(config: DispatcherConfig, bot: BoxedBot) -> Result<Self, ConfigError> {
        Self::with_registry(config, bot, Arc::new(Registry::new()))
    }

    /// Creates a dispatcher resolving against an existing registry.
    pub fn with_registry(
        config: DispatcherConfig,
        bot: BoxedBot,
        registry: Arc<Registry>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        let limiter = RateLimiter::new(config.default_limit(), config.limit_mode);
        let (queue, receiver) = EventQueue::new(config.queue_capacity, config.overflow);

        Ok(Self {
            inner: Arc::new(DispatcherInner {
                config,
                bot,
                registry,
                middlewares: RwLock::new(Arc::new(Vec::new())),
                limiter,
                queue,
                force: CancellationToken::new(),
                counters: Counters::default(),
                state: Mutex::new(RunState::Idle(receiver)),
            }),
        })
    }

    pub fn config(&self) -> &DispatcherConfig {
        &self.inner.config
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.inner.registry
    }

    /// The shared outbound rate limiter.
    pub fn limiter(&self) -> &RateLimiter {
        &self.inner.limiter
    }

    /// Producer handle for transports.
    pub fn queue(&self) -> EventQueue {
        self.inner.queue.clone()
    }

    // ─── Registration ─────────────────────────────────────────────────────────

    /// See [`Registry::register`].
    pub fn register(
        &self,
        filter: impl Filter,
        middlewares: Vec<BoxedMiddleware>,
        handler: BoxedHandler,
        priority: i32,
    ) -> RegistrationId {
        self.inner
            .registry
            .register(filter, middlewares, handler, priority)
    }

    /// See [`Registry::on`].
    pub fn on(&self, filter: impl Filter) -> RegistrationBuilder<'_> {
        self.inner.registry.on(filter)
    }

    pub fn unregister(&self, id: RegistrationId) -> bool {
        self.inner.registry.unregister(id)
    }

    /// Adds a middleware wrapping every registration's own middlewares.
    ///
    /// Dispatcher-wide middlewares run outermost, in the order they were
    /// added.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.use_boxed_middleware(Arc::new(middleware));
    }

    pub fn use_boxed_middleware(&self, middleware: BoxedMiddleware) {
        let mut guard = self.inner.middlewares.write();
        let mut next = Vec::clone(&guard);
        next.push(middleware);
        *guard = Arc::new(next);
    }

    // ─── Processing ───────────────────────────────────────────────────────────

    /// Processes one event on the calling task, bypassing the queue.
    pub async fn dispatch(&self, event: impl Into<Arc<Event>>) -> DispatchReport {
        self.inner.process(event.into()).await
    }

    pub fn stats(&self) -> DispatchStats {
        let c = &self.inner.counters;
        DispatchStats {
            processed: c.processed.load(Ordering::Relaxed),
            done: c.done.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            no_match: c.no_match.load(Ordering::Relaxed),
            timed_out: c.timed_out.load(Ordering::Relaxed),
            overflow: self.inner.queue.overflow_count(),
            abandoned: c.abandoned.load(Ordering::Relaxed),
        }
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.inner.state.lock(), RunState::Running { .. })
    }

    // ─── Lifecycle ────────────────────────────────────────────────────────────

    /// Starts `config.worker_count` workers.
    pub fn start_default(&self) -> Result<(), StartError> {
        self.start(self.inner.config.worker_count)
    }

    /// Starts `worker_count` workers pulling from the queue.
    ///
    /// Must be called from within a tokio runtime. A dispatcher can be
    /// started once.
    pub fn start(&self, worker_count: usize) -> Result<(), StartError> {
        if worker_count == 0 {
            return Err(StartError::NoWorkers);
        }
        let mut state = self.inner.state.lock();
        let receiver = match std::mem::replace(&mut *state, RunState::Stopped) {
            RunState::Idle(receiver) => receiver,
            other => {
                *state = other;
                return Err(StartError::AlreadyStarted);
            }
        };

        let mut tasks = Vec::with_capacity(worker_count + 1);
        let mut receivers = Vec::with_capacity(worker_count + 1);
        let main: SharedReceiver = Arc::new(AsyncMutex::new(receiver));
        receivers.push(Arc::clone(&main));

        if self.inner.config.shard_by_chat {
            let mut senders = Vec::with_capacity(worker_count);
            for worker in 0..worker_count {
                let (tx, rx) = mpsc::channel(SHARD_CAPACITY);
                let rx: SharedReceiver = Arc::new(AsyncMutex::new(rx));
                senders.push(tx);
                receivers.push(Arc::clone(&rx));
                tasks.push(tokio::spawn(Arc::clone(&self.inner).worker(worker, rx)));
            }
            tasks.push(tokio::spawn(Arc::clone(&self.inner).route(main, senders)));
        } else {
            for worker in 0..worker_count {
                tasks.push(tokio::spawn(
                    Arc::clone(&self.inner).worker(worker, Arc::clone(&main)),
                ));
            }
        }

        *state = RunState::Running { tasks, receivers };
        info!(
            workers = worker_count,
            shard_by_chat = self.inner.config.shard_by_chat,
            queue_capacity = self.inner.config.queue_capacity,
            "Dispatcher started"
        );
        Ok(())
    }

    /// Stops accepting events and shuts the workers down.
    ///
    /// A graceful stop lets workers drain the queue for up to
    /// `drain_timeout`; otherwise (or once that elapses) in-flight events are
    /// cancelled. Events still queued afterwards, and events held by workers
    /// that had to be aborted, are logged and counted as abandoned; their
    /// number is returned.
    pub async fn stop(&self, graceful: bool) -> u64 {
        self.inner.queue.close();
        let previous = std::mem::replace(&mut *self.inner.state.lock(), RunState::Stopped);
        let (mut tasks, receivers) = match previous {
            RunState::Running { tasks, receivers } => (tasks, receivers),
            RunState::Idle(receiver) => {
                // never started: everything queued is abandoned
                self.inner.force.cancel();
                let receiver = Arc::new(AsyncMutex::new(receiver));
                return self.inner.abandon_remaining(&receiver).await;
            }
            RunState::Stopped => {
                debug!("Dispatcher already stopped");
                return 0;
            }
        };

        info!(graceful, "Stopping dispatcher");
        let drained = graceful
            && tokio::time::timeout(self.inner.config.drain_timeout, join_all(tasks.iter_mut()))
                .await
                .is_ok();

        let mut abandoned = 0;
        if !drained {
            if graceful {
                warn!(
                    timeout = ?self.inner.config.drain_timeout,
                    "Drain timeout elapsed, cancelling in-flight events"
                );
            }
            self.inner.force.cancel();
            tasks.retain(|t| !t.is_finished());
            if tokio::time::timeout(FORCE_GRACE, join_all(tasks.iter_mut()))
                .await
                .is_err()
            {
                // each stuck worker holds the event it was processing
                let stuck = tasks.iter().filter(|t| !t.is_finished()).count() as u64;
                warn!(aborted = stuck, "Workers did not react to cancellation, aborting them");
                for task in &tasks {
                    task.abort();
                }
                self.inner.counters.abandoned.fetch_add(stuck, Ordering::Relaxed);
                abandoned += stuck;
            }
        }

        for receiver in &receivers {
            abandoned += self.inner.abandon_remaining(receiver).await;
        }
        let stats = self.stats();
        info!(
            processed = stats.processed,
            failed = stats.failed,
            abandoned,
            "Dispatcher stopped"
        );
        abandoned
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("config", &self.inner.config)
            .field("registrations", &self.inner.registry.len())
            .field("running", &self.is_running())
            .finish()
    }
}

/// Shard index for `chat_id` among `shards` workers.
pub fn shard_for(chat_id: Option<i64>, shards: usize) -> usize {
    match chat_id {
        None => 0,
        Some(id) => {
            let mut hasher = DefaultHasher::new();
            id.hash(&mut hasher);
            (hasher.finish() % shards.max(1) as u64) as usize
        }
    }
}

impl DispatcherInner {
    /// Pulls events until the queue ends or the dispatcher is force-stopped.
    async fn worker(self: Arc<Self>, worker: usize, receiver: SharedReceiver) {
        debug!(worker, "Worker started");
        loop {
            let next = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.force.cancelled() => None,
                    event = rx.recv() => event,
                }
            };
            let Some(event) = next else { break };
            self.process(event).await;
        }
        debug!(worker, "Worker stopped");
    }

    /// Forwards events to per-worker queues in arrival order.
    async fn route(
        self: Arc<Self>,
        receiver: SharedReceiver,
        shards: Vec<mpsc::Sender<Arc<Event>>>,
    ) {
        debug!(shards = shards.len(), "Shard router started");
        loop {
            let next = {
                let mut rx = receiver.lock().await;
                tokio::select! {
                    biased;
                    _ = self.force.cancelled() => None,
                    event = rx.recv() => event,
                }
            };
            let Some(event) = next else { break };

            let shard = shard_for(event.chat_id(), shards.len());
            trace!(event_id = %event.id(), shard, "Routing event");
            let permit = tokio::select! {
                biased;
                _ = self.force.cancelled() => None,
                permit = shards[shard].reserve() => permit.ok(),
            };
            match permit {
                Some(permit) => permit.send(event),
                None => {
                    self.abandon(&event);
                    break;
                }
            }
        }
        debug!("Shard router stopped");
    }

    fn abandon(&self, event: &Event) {
        self.counters.abandoned.fetch_add(1, Ordering::Relaxed);
        warn!(event_id = %event.id(), chat_id = ?event.chat_id(), "Event abandoned at shutdown");
    }

    async fn abandon_remaining(&self, receiver: &AsyncMutex<Receiver<Arc<Event>>>) -> u64 {
        let mut rx = receiver.lock().await;
        rx.close();
        let mut count = 0;
        while let Ok(event) = rx.try_recv() {
            self.abandon(&event);
            count += 1;
        }
        count
    }

    async fn process(&self, event: Arc<Event>) -> DispatchReport {
        let span = debug_span!("dispatch", event_id = %event.id(), kind = %event.kind());
        self.process_inner(event).instrument(span).await
    }

    async fn process_inner(&self, event: Arc<Event>) -> DispatchReport {
        self.counters.processed.fetch_add(1, Ordering::Relaxed);
        let event_id = event.id().clone();

        trace!(stage = %Stage::Matching, "Stage transition");
        let matched = if self.config.fan_out {
            self.registry.resolve(&event)
        } else {
            self.registry.first_match(&event).into_iter().collect()
        };

        if matched.is_empty() {
            debug!("No handler matched");
            self.counters.no_match.fetch_add(1, Ordering::Relaxed);
            self.counters.done.fetch_add(1, Ordering::Relaxed);
            return DispatchReport {
                event_id,
                state: Stage::Done,
                outcome: DispatchOutcome::NoMatch,
                handled_by: Vec::new(),
                error: None,
            };
        }

        let ctx = Arc::new(
            Context::new(Arc::clone(&event), self.bot.clone(), self.limiter.clone())
                .with_timeout(self.config.dispatch_timeout)
                .with_cancellation(self.force.child_token()),
        );
        let globals = Arc::clone(&self.middlewares.read());

        let mut handled_by = Vec::with_capacity(matched.len());
        let mut outcome = DispatchOutcome::ShortCircuited;
        let mut failure = None;

        for registration in &matched {
            let name = registration.display_name();
            debug!(handler = %name, "Running handler chain");
            let chain: Vec<&BoxedMiddleware> =
                globals.iter().chain(registration.middlewares()).collect();
            let result = run_chain(&ctx, &chain, registration.handler()).await;
            handled_by.push(name);

            if let Some(err) = result.error {
                failure = Some(err);
                break;
            }
            if result.outcome == Outcome::Completed {
                outcome = DispatchOutcome::Handled;
            }
        }

        match failure {
            None => {
                trace!(stage = %Stage::Done, "Stage transition");
                self.counters.done.fetch_add(1, Ordering::Relaxed);
                DispatchReport {
                    event_id,
                    state: Stage::Done,
                    outcome,
                    handled_by,
                    error: None,
                }
            }
            Some((err, stage)) => {
                let kind = err.kind();
                error!(
                    event_id = %event_id,
                    kind = %kind,
                    stage = %stage,
                    error = %err,
                    "Event processing failed"
                );
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                if kind == ErrorKind::DispatchTimeout {
                    self.counters.timed_out.fetch_add(1, Ordering::Relaxed);
                }
                DispatchReport {
                    event_id,
                    state: Stage::Failed,
                    outcome: DispatchOutcome::Failed,
                    handled_by,
                    error: Some((err, stage)),
                }
            }
        }
    }
}
