//! gramflow runtime: configuration, logging and lifecycle around the
//! dispatcher.
//!
//! - [`config`]: layered settings (files, `GRAMFLOW_*` environment, overrides)
//! - [`logging`]: `tracing-subscriber` setup driven by the `[logging]` table
//! - [`GramflowRuntime`]: owns the dispatcher, runs until a shutdown signal
//!
//! ```ignore
//! use gramflow_runtime::GramflowRuntime;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let runtime = GramflowRuntime::new(my_bot())?;
//!     runtime.on(filter::command("ping")).handler(|| async { "pong" });
//!
//!     tokio::spawn(my_transport(runtime.queue()));
//!     runtime.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod error;
pub mod logging;
pub mod runtime;

pub use config::{ConfigError, ConfigLoader, ConfigResult, GramflowConfig};
pub use error::{RuntimeError, RuntimeResult};
pub use logging::{LoggingBuilder, SpanEvents};
pub use runtime::{GramflowRuntime, RuntimeBuilder};

pub use tracing;

/// Logging macros for handler code.
pub mod prelude {
    pub use tracing::{Level, debug, error, info, instrument, span, trace, warn};
}
