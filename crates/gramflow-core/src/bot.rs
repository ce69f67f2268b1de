//! Outbound-action interface.
//!
//! The dispatch core never talks to the platform directly. Handlers reach it
//! through a [`Bot`], implemented by the (external) API client. The core only
//! needs the few operations below; platform-specific calls go through
//! [`Bot::call_api`].

use std::any::Any;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ApiResult;

/// A connected bot able to perform platform API calls.
#[async_trait]
pub trait Bot: Send + Sync {
    /// Returns the identifier of this bot (group id, token owner, ...).
    fn id(&self) -> &str;

    /// Performs a raw platform API call.
    async fn call_api(&self, method: &str, params: Value) -> ApiResult<Value>;

    /// Sends a text message to `peer_id`, returning the platform message id.
    async fn send_message(&self, peer_id: i64, text: &str) -> ApiResult<i64>;

    /// Returns `self` as `Any` for downcasting to the concrete client type.
    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Type-erased, shareable bot handle.
pub type BoxedBot = Arc<dyn Bot>;

/// Downcasts a [`BoxedBot`] to its concrete client type.
pub fn downcast_bot<T: Bot + 'static>(bot: BoxedBot) -> Option<Arc<T>> {
    bot.as_any().downcast::<T>().ok()
}

/// A bot that is not connected to any platform.
///
/// Every call fails with [`ApiError::NotConnected`](crate::ApiError::NotConnected).
/// Useful for dispatchers that only route events and for tests.
#[derive(Debug, Default, Clone)]
pub struct DetachedBot;

#[async_trait]
impl Bot for DetachedBot {
    fn id(&self) -> &str {
        "detached"
    }

    async fn call_api(&self, _method: &str, _params: Value) -> ApiResult<Value> {
        Err(crate::ApiError::NotConnected)
    }

    async fn send_message(&self, _peer_id: i64, _text: &str) -> ApiResult<i64> {
        Err(crate::ApiError::NotConnected)
    }

    fn as_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
