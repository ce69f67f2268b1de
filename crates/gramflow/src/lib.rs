//! # gramflow
//!
//! An event-dispatch core for chat bots.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────┐ push ┌─────────────┐     ┌──────────────────────────────────────┐
//! │ Transport │─────▶│ EventQueue  │────▶│ worker: filter → middlewares → handler│──▶ Bot
//! └───────────┘      │ (bounded)   │────▶│ worker: ...                           │   (rate limited)
//!                    └─────────────┘     └──────────────────────────────────────┘
//! ```
//!
//! - **Filters** decide which registration handles an event
//! - **Middlewares** wrap handlers with before/after hooks in onion order
//! - **Handlers** are async functions with Axum-style extractors
//! - **RateLimiter** keeps outbound calls within per-chat token buckets
//! - **Dispatcher** runs a worker pool over the bounded queue
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use gramflow::prelude::*;
//!
//! async fn start() -> &'static str {
//!     "welcome"
//! }
//!
//! async fn echo(Text(text): Text) -> String {
//!     text
//! }
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = GramflowRuntime::new(my_bot())?;
//!     runtime.on(filter::command("start")).handler(start);
//!     runtime.on(filter::message()).priority(-1).handler(echo);
//!
//!     tokio::spawn(my_transport(runtime.queue()));
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```
//!
//! ## Features
//!
//! - `toml-config` *(default)*: `gramflow.toml` configuration files
//! - `yaml-config`: `gramflow.yaml` configuration files
//! - `json-log`: JSON log output

pub use gramflow_core as core;
pub use gramflow_framework as framework;
pub use gramflow_runtime as runtime;

/// Commonly used types for building bots.
pub mod prelude {
    pub use gramflow_runtime::{GramflowConfig, GramflowRuntime};

    pub use gramflow_core::{
        ApiError, ApiResult, Attachment, Bot, BoxedBot, ErrorKind, Event, EventId, EventKind,
        Stage,
    };

    pub use gramflow_framework::filter::{self, FilterExt};
    pub use gramflow_framework::{
        BotRef, ChatId, CommandArgs, Context, DispatchOutcome, DispatchReport, Dispatcher,
        DispatcherConfig, EventQueue, Flow, FromId, HandlerError, LimitConfig, LimitMode,
        Middleware, MiddlewareError, Outcome, OverflowPolicy, Payload, QueueError, RateLimiter,
        Text, ThrottleMiddleware, TracingMiddleware,
    };
    pub use gramflow_framework::middleware::from_fn;

    pub use async_trait::async_trait;

    pub use gramflow_runtime::prelude::*;
}
