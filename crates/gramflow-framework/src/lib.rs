//! # gramflow framework
//!
//! The event-dispatch core:
//! - [`filter`]: composable event predicates
//! - [`registry`]: priority-ordered handler registrations
//! - [`middleware`]: before/after hooks run in onion order
//! - [`limiter`]: per-key token buckets gating outbound calls
//! - [`queue`]: the bounded inbound queue with backpressure
//! - [`dispatcher`]: the worker pool tying it all together
//!
//! Handlers are plain async functions whose parameters are extracted from the
//! per-event [`Context`], in the style of Axum.

pub mod context;
pub mod dispatcher;
pub mod error;
pub mod extractor;
pub mod filter;
pub mod handler;
pub mod limiter;
pub mod middleware;
pub mod queue;
pub mod registry;

pub use context::Context;
pub use dispatcher::{
    DispatchOutcome, DispatchReport, DispatchStats, Dispatcher, DispatcherConfig, shard_for,
};
pub use error::{
    ConfigError, DispatchError, ExtractError, ExtractResult, FilterError, HandlerError,
    MiddlewareError, QueueError, RateLimitError, StartError,
};
pub use extractor::{BotRef, ChatId, CommandArgs, FromContext, FromId, Payload, Text};
pub use filter::{BoxedFilter, Filter, FilterExt};
pub use handler::{
    BoxedHandler, Handler, HandlerResponse, HandlerService, from_service, into_handler,
};
pub use limiter::{Bucket, LimitConfig, LimitMode, RateLimiter};
pub use middleware::{
    BoxedMiddleware, ChainResult, Flow, Middleware, Outcome, ThrottleMiddleware,
    TracingMiddleware, run_chain,
};
pub use queue::{EventQueue, OverflowPolicy};
pub use registry::{Registration, RegistrationBuilder, RegistrationId, Registry};
