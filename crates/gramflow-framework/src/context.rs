//! Per-event processing context.
//!
//! One [`Context`] is created for every event a worker picks up. It is shared
//! (as `Arc<Context>`) by every middleware and the handler of that event, and
//! carries:
//!
//! - the immutable [`Event`] and the [`Bot`](gramflow_core::Bot) used to answer it,
//! - a string-keyed value map middlewares use to hand data to handlers,
//! - the event's deadline and cancellation token,
//! - the shared outbound [`RateLimiter`].
//!
//! ```rust,ignore
//! // in a middleware
//! ctx.insert("user", profile);
//!
//! // in a handler
//! async fn greet(ctx: Arc<Context>) -> Option<String> {
//!     let user: Profile = ctx.get("user")?;
//!     Some(format!("hello, {}", user.name))
//! }
//! ```

use std::any::Any;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use gramflow_core::{ApiError, ApiResult, BoxedBot, Event};

use crate::limiter::RateLimiter;

/// Everything a middleware or handler can see about one in-flight event.
pub struct Context {
    event: Arc<Event>,
    bot: BoxedBot,
    limiter: RateLimiter,
    values: Mutex<HashMap<String, Box<dyn Any + Send + Sync>>>,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    cancel: CancellationToken,
}

impl Context {
    /// Creates a context with no deadline and a fresh cancellation token.
    pub fn new(event: Arc<Event>, bot: BoxedBot, limiter: RateLimiter) -> Self {
        Self {
            event,
            bot,
            limiter,
            values: Mutex::new(HashMap::new()),
            timeout: None,
            deadline: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Starts the event's deadline clock.
    pub fn with_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.timeout = timeout;
        self.deadline = timeout.map(|t| Instant::now() + t);
        self
    }

    pub(crate) fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    // ─── Event / bot ──────────────────────────────────────────────────────────

    pub fn event(&self) -> &Arc<Event> {
        &self.event
    }

    pub fn bot(&self) -> &BoxedBot {
        &self.bot
    }

    /// Returns a clone of the bot `Arc`.
    pub fn bot_arc(&self) -> BoxedBot {
        self.bot.clone()
    }

    pub fn limiter(&self) -> &RateLimiter {
        &self.limiter
    }

    // ─── Deadline / cancellation ──────────────────────────────────────────────

    /// The processing budget this event was given.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// The instant after which processing of this event is abandoned.
    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Token cancelled when the event times out or the dispatcher is
    /// force-stopped. Long-running handlers can select on it.
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    // ─── Values ───────────────────────────────────────────────────────────────

    /// Stores a value under `key`, replacing any previous value.
    pub fn insert<T: Send + Sync + 'static>(&self, key: impl Into<String>, value: T) {
        self.values.lock().insert(key.into(), Box::new(value));
    }

    /// Returns a clone of the value under `key` if it exists and has type `T`.
    pub fn get<T: Clone + 'static>(&self, key: &str) -> Option<T> {
        self.values
            .lock()
            .get(key)
            .and_then(|v| v.downcast_ref::<T>())
            .cloned()
    }

    /// Returns `true` if any value is stored under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.values.lock().contains_key(key)
    }

    /// Removes and returns the value under `key`.
    ///
    /// If the stored value has a different type it is left in place.
    pub fn take<T: 'static>(&self, key: &str) -> Option<T> {
        let mut values = self.values.lock();
        if !values.get(key).is_some_and(|v| v.is::<T>()) {
            return None;
        }
        values
            .remove(key)
            .and_then(|v| v.downcast::<T>().ok())
            .map(|v| *v)
    }

    // ─── Outbound ─────────────────────────────────────────────────────────────

    /// Sends `text` to the event's chat.
    ///
    /// The send goes through the outbound rate limiter keyed by chat id.
    pub async fn reply(&self, text: &str) -> ApiResult<i64> {
        let peer_id = self.event.chat_id().ok_or(ApiError::MissingPeer)?;
        trace!(peer_id, "Sending reply");
        self.limiter
            .call(peer_id, 1.0, || self.bot.send_message(peer_id, text))
            .await?
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("event", &self.event.id())
            .field("bot", &self.bot.id())
            .field("deadline", &self.deadline)
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gramflow_core::DetachedBot;

    fn context(event: Event) -> Context {
        Context::new(Arc::new(event), Arc::new(DetachedBot), RateLimiter::default())
    }

    #[test]
    fn test_values() {
        let ctx = context(Event::message(1, "hi").build());
        ctx.insert("count", 3u32);
        assert!(ctx.contains("count"));
        assert_eq!(ctx.get::<u32>("count"), Some(3));
        assert_eq!(ctx.get::<String>("count"), None);

        // wrong type leaves the value in place
        assert_eq!(ctx.take::<String>("count"), None);
        assert_eq!(ctx.take::<u32>("count"), Some(3));
        assert!(!ctx.contains("count"));
    }

    #[tokio::test]
    async fn test_reply_without_chat() {
        let ctx = context(
            Event::builder(gramflow_core::EventKind::Other("wall_post".into())).build(),
        );
        assert!(matches!(ctx.reply("x").await, Err(ApiError::MissingPeer)));
    }
}
