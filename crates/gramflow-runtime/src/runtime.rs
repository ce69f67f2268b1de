//! Runtime orchestration: configuration, logging and the dispatcher
//! lifecycle in one handle.
//!
//! ```rust,ignore
//! use gramflow_runtime::GramflowRuntime;
//!
//! let runtime = GramflowRuntime::builder()
//!     .bot(my_bot)
//!     .config_file("gramflow.toml")
//!     .build()?;
//!
//! runtime.on(filter::command("start")).handler(start);
//!
//! // The transport pushes into this queue
//! let queue = runtime.queue();
//!
//! // Runs until Ctrl+C or SIGTERM, then stops gracefully
//! runtime.run().await?;
//! ```

use std::future::Future;
use std::path::Path;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::signal;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::{ConfigLoader, GramflowConfig, validate_config};
use crate::error::{RuntimeError, RuntimeResult};
use crate::logging;
use gramflow_core::BoxedBot;
use gramflow_framework::{
    BoxedHandler, BoxedMiddleware, DispatchStats, Dispatcher, EventQueue, Filter, Middleware,
    RateLimiter, RegistrationBuilder, RegistrationId,
};

/// Owns the dispatcher and its rate limiter for the life of the bot.
pub struct GramflowRuntime {
    config: GramflowConfig,
    dispatcher: Dispatcher,
    /// Periodic rate limiter sweep, alive while running.
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl GramflowRuntime {
    /// Loads configuration from the default locations.
    pub fn new(bot: BoxedBot) -> RuntimeResult<Self> {
        Self::builder().bot(bot).build()
    }

    pub fn builder() -> RuntimeBuilder {
        RuntimeBuilder::new()
    }

    /// Validates `config`, initializes logging from it and builds a stopped
    /// dispatcher sending through `bot`.
    pub fn from_config(config: GramflowConfig, bot: BoxedBot) -> RuntimeResult<Self> {
        validate_config(&config)?;
        logging::init_from_config(&config.logging);

        let dispatcher = Dispatcher::new(config.dispatcher_config(), bot)?;
        for (key, limit) in &config.rate_limit.overrides {
            dispatcher.limiter().set_limit(key, (*limit).into());
        }

        info!(
            workers = config.dispatcher.worker_count,
            queue_capacity = config.dispatcher.queue_capacity,
            rate = config.rate_limit.rate,
            capacity = config.rate_limit.capacity,
            limit_overrides = config.rate_limit.overrides.len(),
            log_level = %config.logging.level,
            "Runtime initialized from configuration"
        );

        Ok(Self {
            config,
            dispatcher,
            sweeper: Mutex::new(None),
        })
    }

    pub fn config(&self) -> &GramflowConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn limiter(&self) -> &RateLimiter {
        self.dispatcher.limiter()
    }

    /// Producer handle for transports.
    pub fn queue(&self) -> EventQueue {
        self.dispatcher.queue()
    }

    pub fn stats(&self) -> DispatchStats {
        self.dispatcher.stats()
    }

    pub fn is_running(&self) -> bool {
        self.dispatcher.is_running()
    }

    // =========================================================================
    // Registration
    // =========================================================================

    pub fn register(
        &self,
        filter: impl Filter,
        middlewares: Vec<BoxedMiddleware>,
        handler: BoxedHandler,
        priority: i32,
    ) -> RegistrationId {
        self.dispatcher
            .register(filter, middlewares, handler, priority)
    }

    pub fn on(&self, filter: impl Filter) -> RegistrationBuilder<'_> {
        self.dispatcher.on(filter)
    }

    pub fn unregister(&self, id: RegistrationId) -> bool {
        self.dispatcher.unregister(id)
    }

    /// Adds a middleware around every registration.
    pub fn use_middleware(&self, middleware: impl Middleware) {
        self.dispatcher.use_middleware(middleware);
    }

    // =========================================================================
    // Lifecycle
    // =========================================================================

    /// Starts the configured number of workers and the bucket sweep.
    pub fn start(&self) -> RuntimeResult<()> {
        self.dispatcher.start_default()?;

        if let Some(interval) = self.config.rate_limit.cleanup_interval() {
            let limiter = self.dispatcher.limiter().clone();
            *self.sweeper.lock() = Some(tokio::spawn(sweep(limiter, interval)));
        }

        info!("Runtime started");
        Ok(())
    }

    /// Stops the dispatcher; returns the number of abandoned events.
    pub async fn stop(&self, graceful: bool) -> u64 {
        if let Some(sweeper) = self.sweeper.lock().take() {
            sweeper.abort();
        }
        let abandoned = self.dispatcher.stop(graceful).await;
        if abandoned > 0 {
            warn!(abandoned, "Events were left unprocessed");
        }
        info!("Runtime stopped");
        abandoned
    }

    /// Runs until Ctrl+C or SIGTERM, then stops gracefully.
    pub async fn run(&self) -> RuntimeResult<()> {
        self.start()?;
        info!("gramflow runtime is now running. Press Ctrl+C to stop.");

        let result = wait_for_shutdown().await;
        self.stop(true).await;
        result
    }

    /// Runs until `shutdown` completes, then stops gracefully.
    pub async fn run_until<F>(&self, shutdown: F) -> RuntimeResult<()>
    where
        F: Future<Output = ()>,
    {
        self.start()?;
        shutdown.await;
        self.stop(true).await;
        Ok(())
    }
}

impl std::fmt::Debug for GramflowRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GramflowRuntime")
            .field("dispatcher", &self.dispatcher)
            .finish_non_exhaustive()
    }
}

async fn sweep(limiter: RateLimiter, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    // the first tick completes immediately
    ticker.tick().await;
    loop {
        ticker.tick().await;
        let evicted = limiter.cleanup();
        debug!(evicted, live = limiter.bucket_count(), "Rate limiter sweep");
    }
}

/// Waits for Ctrl+C or SIGTERM.
async fn wait_for_shutdown() -> RuntimeResult<()> {
    #[cfg(unix)]
    {
        let mut sigterm = signal::unix::signal(signal::unix::SignalKind::terminate())?;
        tokio::select! {
            result = signal::ctrl_c() => {
                result?;
                info!("Received Ctrl+C, shutting down");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down");
            }
        }
    }

    #[cfg(not(unix))]
    {
        signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down");
    }

    Ok(())
}

// =============================================================================
// RuntimeBuilder
// =============================================================================

/// Builder for a [`GramflowRuntime`] with custom configuration sources.
pub struct RuntimeBuilder {
    config_loader: ConfigLoader,
    bot: Option<BoxedBot>,
}

impl RuntimeBuilder {
    pub fn new() -> Self {
        Self {
            config_loader: ConfigLoader::new(),
            bot: None,
        }
    }

    /// The outbound platform client. Required.
    pub fn bot(mut self, bot: BoxedBot) -> Self {
        self.bot = Some(bot);
        self
    }

    pub fn config_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.file(path);
        self
    }

    pub fn profile(mut self, profile: impl AsRef<str>) -> Self {
        self.config_loader = self.config_loader.profile(profile);
        self
    }

    pub fn search_path<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config_loader = self.config_loader.search_path(path);
        self
    }

    pub fn with_env(mut self) -> Self {
        self.config_loader = self.config_loader.with_env();
        self
    }

    pub fn without_env(mut self) -> Self {
        self.config_loader = self.config_loader.without_env();
        self
    }

    /// Merges `config` over every file and environment source.
    pub fn merge(mut self, config: GramflowConfig) -> Self {
        self.config_loader = self.config_loader.merge(config);
        self
    }

    pub fn build(self) -> RuntimeResult<GramflowRuntime> {
        let bot = self.bot.ok_or(RuntimeError::MissingBot)?;
        let config = self.config_loader.load()?;
        GramflowRuntime::from_config(config, bot)
    }
}

impl Default for RuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::config::{ConfigError, LimitOverride};
    use gramflow_core::{DetachedBot, Event};
    use gramflow_framework::StartError;
    use gramflow_framework::filter::any_event;

    fn bot() -> BoxedBot {
        Arc::new(DetachedBot)
    }

    fn small_config() -> GramflowConfig {
        let mut config = GramflowConfig::default();
        config.dispatcher.worker_count = 2;
        config.dispatcher.queue_capacity = 16;
        config
    }

    #[tokio::test]
    async fn test_run_until_drains_queue() {
        let runtime = GramflowRuntime::from_config(small_config(), bot()).unwrap();
        let handled = Arc::new(AtomicUsize::new(0));
        let counter = handled.clone();
        runtime.on(any_event()).handler(move || {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
            }
        });

        let queue = runtime.queue();
        for n in 0..5 {
            queue.push(Event::message(n, "hi").build()).await.unwrap();
        }
        runtime.run_until(async {}).await.unwrap();

        assert_eq!(handled.load(Ordering::SeqCst), 5);
        assert!(!runtime.is_running());
        assert_eq!(runtime.stats().processed, 5);
    }

    #[tokio::test]
    async fn test_start_twice_fails() {
        let runtime = GramflowRuntime::from_config(small_config(), bot()).unwrap();
        runtime.start().unwrap();
        assert!(matches!(
            runtime.start(),
            Err(RuntimeError::Start(StartError::AlreadyStarted))
        ));
        assert_eq!(runtime.stop(true).await, 0);
    }

    #[tokio::test]
    async fn test_overrides_applied_to_limiter() {
        let mut config = small_config();
        config.rate_limit.overrides.insert(
            "-100".into(),
            LimitOverride {
                rate: 1.0,
                capacity: 3.0,
            },
        );
        let runtime = GramflowRuntime::from_config(config, bot()).unwrap();
        assert_eq!(runtime.limiter().available(-100), 3.0);
        assert_eq!(runtime.limiter().available(7), 20.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweeper_evicts_full_buckets() {
        let mut config = small_config();
        config.rate_limit.cleanup_interval_ms = 1000;
        let runtime = GramflowRuntime::from_config(config, bot()).unwrap();
        runtime.limiter().try_acquire(1, 1.0).unwrap();
        assert_eq!(runtime.limiter().bucket_count(), 1);

        runtime.start().unwrap();
        // refilled after 50ms at 20 tokens/s, swept on the 1s tick
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(runtime.limiter().bucket_count(), 0);
        runtime.stop(true).await;
    }

    #[test]
    fn test_invalid_config_rejected() {
        let mut config = small_config();
        config.dispatcher.worker_count = 0;
        assert!(matches!(
            GramflowRuntime::from_config(config, bot()),
            Err(RuntimeError::Config(ConfigError::ValidationError { .. }))
        ));
    }

    #[test]
    fn test_builder_requires_bot() {
        let err = GramflowRuntime::builder().without_env().build().unwrap_err();
        assert!(matches!(err, RuntimeError::MissingBot));
    }
}
