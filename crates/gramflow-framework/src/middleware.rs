//! Middleware and the onion-ordered chain runner.
//!
//! A registration's middlewares wrap its handler like the layers of an onion:
//!
//! ```text
//!   before(m1) → before(m2) → handler → after(m2) → after(m1)
//! ```
//!
//! `after` runs only for middlewares whose `before` ran, including one that
//! stopped the chain or failed. Errors and panics in any hook or in the
//! handler are caught here and turned into a failed [`ChainResult`]; they
//! never reach the worker loop.
//!
//! ```rust,ignore
//! struct Auth;
//!
//! #[async_trait]
//! impl Middleware for Auth {
//!     async fn before(&self, ctx: &Context) -> Result<Flow, MiddlewareError> {
//!         match lookup_user(ctx.event().from_id()).await {
//!             Some(user) => {
//!                 ctx.insert("user", user);
//!                 Ok(Flow::Continue)
//!             }
//!             None => Ok(Flow::Stop),
//!         }
//!     }
//! }
//! ```

use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use gramflow_core::{ErrorKind, Stage};

use crate::context::Context;
use crate::error::{DispatchError, HandlerError, MiddlewareError, RateLimitError, panic_message};
use crate::handler::BoxedHandler;
use crate::limiter::{LimitConfig, LimitMode, RateLimiter};

/// Whether the chain proceeds after a `before` hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    /// Skip the remaining `before` hooks and the handler. Not a failure.
    Stop,
}

/// How the inner part of the chain ended, as seen by `after` hooks.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// The handler ran and succeeded.
    Completed,
    /// A middleware returned [`Flow::Stop`].
    ShortCircuited { by: String },
    /// A hook or the handler failed.
    Failed(ErrorKind),
    /// The event's deadline elapsed.
    TimedOut,
    /// The dispatcher was force-stopped.
    Cancelled,
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Completed | Outcome::ShortCircuited { .. })
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Outcome::Completed => f.write_str("completed"),
            Outcome::ShortCircuited { by } => write!(f, "short-circuited by {by}"),
            Outcome::Failed(kind) => write!(f, "failed ({kind})"),
            Outcome::TimedOut => f.write_str("timed out"),
            Outcome::Cancelled => f.write_str("cancelled"),
        }
    }
}

/// A pre/post-processing step around a handler.
///
/// Both hooks default to doing nothing.
#[async_trait]
pub trait Middleware: Send + Sync + 'static {
    /// Name used in logs and failure reports.
    fn name(&self) -> &str {
        std::any::type_name::<Self>()
    }

    /// Runs before the handler. Return [`Flow::Stop`] to short-circuit.
    async fn before(&self, _ctx: &Context) -> Result<Flow, MiddlewareError> {
        Ok(Flow::Continue)
    }

    /// Runs after the handler (or after the chain stopped), with the outcome
    /// of everything inside this middleware.
    ///
    /// `after` hooks always run, even when the event timed out or was
    /// cancelled.
    async fn after(&self, _ctx: &Context, _outcome: &Outcome) -> Result<(), MiddlewareError> {
        Ok(())
    }
}

/// A shareable, type-erased middleware.
pub type BoxedMiddleware = Arc<dyn Middleware>;

// ============================================================================
// Chain runner
// ============================================================================

/// Result of running one registration's chain.
#[derive(Debug)]
pub struct ChainResult {
    /// What the `after` hooks were told.
    pub outcome: Outcome,
    /// The first failure and the stage it happened in.
    pub error: Option<(DispatchError, Stage)>,
}

impl ChainResult {
    pub fn is_ok(&self) -> bool {
        self.error.is_none()
    }
}

enum Interrupt {
    Panicked(String),
    TimedOut,
    Cancelled,
}

/// Polls `fut` until it completes, panics, the context's deadline elapses, or
/// the context is cancelled.
async fn guarded<F: Future>(ctx: &Context, fut: F) -> Result<F::Output, Interrupt> {
    let deadline = async {
        match ctx.deadline() {
            Some(deadline) => tokio::time::sleep_until(deadline).await,
            None => std::future::pending::<()>().await,
        }
    };

    tokio::select! {
        biased;
        _ = ctx.cancellation().cancelled() => Err(Interrupt::Cancelled),
        _ = deadline => Err(Interrupt::TimedOut),
        res = AssertUnwindSafe(fut).catch_unwind() => {
            res.map_err(|payload| Interrupt::Panicked(panic_message(payload.as_ref())))
        }
    }
}

/// Converts an interruption into the matching failure.
fn interrupted(
    ctx: &Context,
    interrupt: Interrupt,
    on_panic: impl FnOnce(String) -> DispatchError,
) -> (DispatchError, Outcome) {
    match interrupt {
        Interrupt::Panicked(msg) => {
            let err = on_panic(msg);
            let kind = err.kind();
            (err, Outcome::Failed(kind))
        }
        Interrupt::TimedOut => {
            // let spawned work observe the timeout
            ctx.cancellation().cancel();
            (
                DispatchError::Timeout(ctx.timeout().unwrap_or_default()),
                Outcome::TimedOut,
            )
        }
        Interrupt::Cancelled => (DispatchError::Cancelled, Outcome::Cancelled),
    }
}

/// Runs `middlewares` around `handler` in onion order.
///
/// The slice is ordered outermost first. Stage transitions are logged at
/// `trace` level.
pub async fn run_chain(
    ctx: &Arc<Context>,
    middlewares: &[&BoxedMiddleware],
    handler: &BoxedHandler,
) -> ChainResult {
    let event_id = ctx.event().id();
    let mut entered = 0;
    let mut outcome = None;
    let mut error: Option<(DispatchError, Stage)> = None;

    trace!(event_id = %event_id, stage = %Stage::MiddlewareBefore, "Stage transition");
    for mw in middlewares {
        entered += 1;
        let name = mw.name().to_string();
        let failure = match guarded(ctx, mw.before(ctx)).await {
            Ok(Ok(Flow::Continue)) => continue,
            Ok(Ok(Flow::Stop)) => {
                debug!(event_id = %event_id, middleware = %name, "Chain short-circuited");
                outcome = Some(Outcome::ShortCircuited { by: name });
                break;
            }
            Ok(Err(source)) => {
                let err = DispatchError::Middleware { name, source };
                let kind = err.kind();
                (err, Outcome::Failed(kind))
            }
            Err(interrupt) => interrupted(ctx, interrupt, |msg| DispatchError::Middleware {
                name,
                source: MiddlewareError::new(format!("panicked: {msg}")),
            }),
        };
        outcome = Some(failure.1);
        error = Some((failure.0, Stage::MiddlewareBefore));
        break;
    }

    let outcome = match outcome {
        Some(outcome) => outcome,
        None => {
            trace!(event_id = %event_id, stage = %Stage::Executing, "Stage transition");
            let failure = match guarded(ctx, handler(Arc::clone(ctx))).await {
                Ok(Ok(())) => None,
                Ok(Err(e)) => {
                    let err = DispatchError::Handler(e);
                    let kind = err.kind();
                    Some((err, Outcome::Failed(kind)))
                }
                Err(interrupt) => Some(interrupted(ctx, interrupt, |msg| {
                    DispatchError::Handler(HandlerError::Panicked(msg))
                })),
            };
            match failure {
                None => Outcome::Completed,
                Some((err, outcome)) => {
                    error = Some((err, Stage::Executing));
                    outcome
                }
            }
        }
    };

    trace!(event_id = %event_id, stage = %Stage::MiddlewareAfter, "Stage transition");
    for mw in middlewares[..entered].iter().rev() {
        let hook = AssertUnwindSafe(mw.after(ctx, &outcome)).catch_unwind().await;
        let source = match hook {
            Ok(Ok(())) => continue,
            Ok(Err(e)) => e,
            Err(payload) => {
                MiddlewareError::new(format!("panicked: {}", panic_message(payload.as_ref())))
            }
        };
        warn!(
            event_id = %event_id,
            middleware = %mw.name(),
            error = %source,
            "Middleware after hook failed"
        );
        if error.is_none() {
            error = Some((
                DispatchError::Middleware {
                    name: mw.name().to_string(),
                    source,
                },
                Stage::MiddlewareAfter,
            ));
        }
    }

    ChainResult { outcome, error }
}

// ============================================================================
// Built-in middlewares
// ============================================================================

/// Middleware from a synchronous `before` closure.
pub struct FnMiddleware<F> {
    name: String,
    before: F,
}

/// Creates a middleware whose `before` hook is `f`.
pub fn from_fn<F>(name: impl Into<String>, f: F) -> FnMiddleware<F>
where
    F: Fn(&Context) -> Result<Flow, MiddlewareError> + Send + Sync + 'static,
{
    FnMiddleware {
        name: name.into(),
        before: f,
    }
}

#[async_trait]
impl<F> Middleware for FnMiddleware<F>
where
    F: Fn(&Context) -> Result<Flow, MiddlewareError> + Send + Sync + 'static,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn before(&self, ctx: &Context) -> Result<Flow, MiddlewareError> {
        (self.before)(ctx)
    }
}

const TRACING_START_KEY: &str = "gramflow.tracing.started_at";

/// Logs chain entry and exit with the elapsed time.
#[derive(Debug, Default, Clone)]
pub struct TracingMiddleware;

#[async_trait]
impl Middleware for TracingMiddleware {
    fn name(&self) -> &str {
        "tracing"
    }

    async fn before(&self, ctx: &Context) -> Result<Flow, MiddlewareError> {
        let event = ctx.event();
        debug!(
            event_id = %event.id(),
            kind = %event.kind(),
            chat_id = ?event.chat_id(),
            "Entering handler chain"
        );
        ctx.insert(TRACING_START_KEY, Instant::now());
        Ok(Flow::Continue)
    }

    async fn after(&self, ctx: &Context, outcome: &Outcome) -> Result<(), MiddlewareError> {
        let elapsed = ctx
            .take::<Instant>(TRACING_START_KEY)
            .map(|started| started.elapsed())
            .unwrap_or(Duration::ZERO);
        debug!(
            event_id = %ctx.event().id(),
            %outcome,
            elapsed_ms = elapsed.as_secs_f64() * 1000.0,
            "Leaving handler chain"
        );
        Ok(())
    }
}

/// Drops events from chats that exceed an inbound rate.
///
/// Uses its own buckets, separate from the outbound limiter, and never
/// waits: a chat without tokens short-circuits the chain. Events without a
/// chat id pass through.
#[derive(Debug, Clone)]
pub struct ThrottleMiddleware {
    limiter: RateLimiter,
    cost: f64,
}

impl ThrottleMiddleware {
    pub fn new(limit: LimitConfig) -> Self {
        Self {
            limiter: RateLimiter::new(limit, LimitMode::Reject),
            cost: 1.0,
        }
    }

    /// Tokens taken per event; defaults to 1.
    pub fn cost(mut self, cost: f64) -> Self {
        self.cost = cost;
        self
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }
}

#[async_trait]
impl Middleware for ThrottleMiddleware {
    fn name(&self) -> &str {
        "throttle"
    }

    async fn before(&self, ctx: &Context) -> Result<Flow, MiddlewareError> {
        let Some(chat_id) = ctx.event().chat_id() else {
            return Ok(Flow::Continue);
        };
        match self.limiter.try_acquire(chat_id, self.cost) {
            Ok(()) => Ok(Flow::Continue),
            Err(RateLimitError::Rejected { retry_after, .. }) => {
                debug!(
                    event_id = %ctx.event().id(),
                    chat_id,
                    ?retry_after,
                    "Throttled"
                );
                Ok(Flow::Stop)
            }
            Err(e) => Err(MiddlewareError::new(e.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::handler::into_handler;
    use gramflow_core::{DetachedBot, Event};

    type Log = Arc<Mutex<Vec<String>>>;

    #[derive(Clone, Copy)]
    enum Before {
        Continue,
        Stop,
        Fail,
        Panic,
    }

    struct Recorder {
        name: &'static str,
        before: Before,
        fail_after: bool,
        log: Log,
    }

    fn recorder(name: &'static str, before: Before, log: &Log) -> BoxedMiddleware {
        Arc::new(Recorder {
            name,
            before,
            fail_after: false,
            log: log.clone(),
        })
    }

    #[async_trait]
    impl Middleware for Recorder {
        fn name(&self) -> &str {
            self.name
        }

        async fn before(&self, _ctx: &Context) -> Result<Flow, MiddlewareError> {
            self.log.lock().push(format!("before:{}", self.name));
            match self.before {
                Before::Continue => Ok(Flow::Continue),
                Before::Stop => Ok(Flow::Stop),
                Before::Fail => Err(MiddlewareError::new("nope")),
                Before::Panic => panic!("middleware bug"),
            }
        }

        async fn after(&self, _ctx: &Context, outcome: &Outcome) -> Result<(), MiddlewareError> {
            self.log.lock().push(format!("after:{}:{outcome}", self.name));
            if self.fail_after {
                return Err(MiddlewareError::new("after failed"));
            }
            Ok(())
        }
    }

    fn ctx() -> Arc<Context> {
        Arc::new(Context::new(
            Arc::new(Event::message(1, "hi").build()),
            Arc::new(DetachedBot),
            RateLimiter::default(),
        ))
    }

    fn logging_handler(log: &Log) -> BoxedHandler {
        let log = log.clone();
        into_handler(move || {
            let log = log.clone();
            async move {
                log.lock().push("handler".to_string());
            }
        })
    }

    async fn run(mws: &[BoxedMiddleware], handler: &BoxedHandler) -> ChainResult {
        let refs: Vec<&BoxedMiddleware> = mws.iter().collect();
        run_chain(&ctx(), &refs, handler).await
    }

    #[tokio::test]
    async fn test_onion_order() {
        let log = Log::default();
        let mws = [
            recorder("m1", Before::Continue, &log),
            recorder("m2", Before::Continue, &log),
        ];
        let result = run(&mws, &logging_handler(&log)).await;

        assert!(result.is_ok());
        assert_eq!(result.outcome, Outcome::Completed);
        assert_eq!(
            *log.lock(),
            [
                "before:m1",
                "before:m2",
                "handler",
                "after:m2:completed",
                "after:m1:completed"
            ]
        );
    }

    #[tokio::test]
    async fn test_stop_skips_inner_layers() {
        let log = Log::default();
        let mws = [
            recorder("m1", Before::Continue, &log),
            recorder("m2", Before::Stop, &log),
            recorder("m3", Before::Continue, &log),
        ];
        let result = run(&mws, &logging_handler(&log)).await;

        assert!(result.is_ok());
        assert_eq!(
            result.outcome,
            Outcome::ShortCircuited { by: "m2".into() }
        );
        assert_eq!(
            *log.lock(),
            [
                "before:m1",
                "before:m2",
                "after:m2:short-circuited by m2",
                "after:m1:short-circuited by m2"
            ]
        );
    }

    #[tokio::test]
    async fn test_before_failure_still_unwinds() {
        let log = Log::default();
        let mws = [
            recorder("m1", Before::Continue, &log),
            recorder("m2", Before::Fail, &log),
        ];
        let result = run(&mws, &logging_handler(&log)).await;

        let (err, stage) = result.error.expect("chain must fail");
        assert_eq!(stage, Stage::MiddlewareBefore);
        assert_eq!(err.kind(), ErrorKind::MiddlewareError);
        assert_eq!(
            *log.lock(),
            [
                "before:m1",
                "before:m2",
                "after:m2:failed (middleware_error)",
                "after:m1:failed (middleware_error)"
            ]
        );
    }

    #[tokio::test]
    async fn test_panics_are_contained() {
        let log = Log::default();
        let mws = [recorder("m1", Before::Panic, &log)];
        let result = run(&mws, &logging_handler(&log)).await;
        assert!(matches!(
            result.error,
            Some((DispatchError::Middleware { .. }, Stage::MiddlewareBefore))
        ));

        async fn boom() {
            panic!("handler bug");
        }
        let result = run(&[], &into_handler(boom)).await;
        assert!(matches!(
            result.error,
            Some((DispatchError::Handler(HandlerError::Panicked(_)), Stage::Executing))
        ));
        assert_eq!(result.outcome, Outcome::Failed(ErrorKind::HandlerError));
    }

    #[tokio::test]
    async fn test_after_failure_marks_event_failed() {
        let log = Log::default();
        let mws: [BoxedMiddleware; 1] = [Arc::new(Recorder {
            name: "m1",
            before: Before::Continue,
            fail_after: true,
            log: log.clone(),
        })];
        let result = run(&mws, &logging_handler(&log)).await;
        assert_eq!(result.outcome, Outcome::Completed);
        assert!(matches!(
            result.error,
            Some((DispatchError::Middleware { .. }, Stage::MiddlewareAfter))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_runs_after_hooks() {
        let log = Log::default();
        let mws = [recorder("m1", Before::Continue, &log)];
        let ctx = Arc::new(
            Context::new(
                Arc::new(Event::message(1, "hi").build()),
                Arc::new(DetachedBot),
                RateLimiter::default(),
            )
            .with_timeout(Some(Duration::from_secs(1))),
        );
        let slow = into_handler(|| async {
            tokio::time::sleep(Duration::from_secs(60)).await;
        });

        let refs: Vec<&BoxedMiddleware> = mws.iter().collect();
        let result = run_chain(&ctx, &refs, &slow).await;

        assert_eq!(result.outcome, Outcome::TimedOut);
        assert!(matches!(
            result.error,
            Some((DispatchError::Timeout(_), Stage::Executing))
        ));
        assert!(ctx.is_cancelled());
        assert_eq!(*log.lock(), ["before:m1", "after:m1:timed out"]);
    }

    #[tokio::test]
    async fn test_throttle_short_circuits_bursts() {
        let throttle: BoxedMiddleware =
            Arc::new(ThrottleMiddleware::new(LimitConfig::new(0.0, 2.0)));
        let log = Log::default();
        let handler = logging_handler(&log);
        let refs = [&throttle];
        let ctx = ctx();

        for _ in 0..2 {
            let result = run_chain(&ctx, &refs, &handler).await;
            assert_eq!(result.outcome, Outcome::Completed);
        }
        let result = run_chain(&ctx, &refs, &handler).await;
        assert!(matches!(result.outcome, Outcome::ShortCircuited { .. }));
        assert_eq!(log.lock().len(), 2);
    }

    #[tokio::test]
    async fn test_fn_middleware_and_tracing() {
        let tracing: BoxedMiddleware = Arc::new(TracingMiddleware);
        let gate: BoxedMiddleware = Arc::new(from_fn("gate", |ctx: &Context| {
            ctx.insert("seen", true);
            Ok(Flow::Continue)
        }));
        let log = Log::default();
        let ctx = ctx();
        let result = run_chain(&ctx, &[&tracing, &gate], &logging_handler(&log)).await;
        assert!(result.is_ok());
        assert_eq!(ctx.get::<bool>("seen"), Some(true));
        assert!(!ctx.contains(TRACING_START_KEY));
    }
}
