//! Handler parameter extraction.
//!
//! Any type implementing [`FromContext`] can appear as a handler parameter:
//!
//! ```rust,ignore
//! async fn echo(Text(text): Text, ChatId(chat): ChatId) -> String {
//!     format!("{chat} said {text}")
//! }
//!
//! async fn vote(Payload(choice): Payload<Choice>, bot: BotRef<VkBot>) { ... }
//! ```
//!
//! If extraction of any parameter fails the handler is not called and the
//! event fails with an extraction error. Wrap a parameter in `Option<T>` to
//! make it optional.

use std::ops::Deref;
use std::sync::Arc;

use serde::de::DeserializeOwned;

use gramflow_core::{Bot, BoxedBot, Event};

use crate::context::Context;
use crate::error::{ExtractError, ExtractResult};

/// A type that can be extracted from a [`Context`].
pub trait FromContext: Sized {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self>;
}

impl FromContext for Arc<Context> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx))
    }
}

impl FromContext for Arc<Event> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Ok(Arc::clone(ctx.event()))
    }
}

impl FromContext for BoxedBot {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Ok(ctx.bot_arc())
    }
}

/// Optional parameters never fail.
impl<T: FromContext> FromContext for Option<T> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Ok(T::from_context(ctx).ok())
    }
}

/// Lets a handler inspect the extraction error itself.
impl<T: FromContext> FromContext for Result<T, ExtractError> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Ok(T::from_context(ctx))
    }
}

// ============================================================================
// Event fields
// ============================================================================

/// The message text.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Text(pub String);

impl FromContext for Text {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        ctx.event()
            .text()
            .map(|t| Text(t.to_string()))
            .ok_or(ExtractError::MissingText)
    }
}

/// The chat the event originated in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChatId(pub i64);

impl FromContext for ChatId {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        ctx.event()
            .chat_id()
            .map(ChatId)
            .ok_or(ExtractError::MissingChat)
    }
}

/// The user that caused the event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FromId(pub i64);

impl FromContext for FromId {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        ctx.event()
            .from_id()
            .map(FromId)
            .ok_or_else(|| ExtractError::MissingValue("from_id".into()))
    }
}

/// A parsed bot command: `"/ban 42 spam"` becomes
/// `CommandArgs { name: "ban", args: "42 spam" }`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandArgs {
    pub name: String,
    pub args: String,
}

impl CommandArgs {
    /// Splits the arguments on whitespace.
    pub fn split(&self) -> impl Iterator<Item = &str> {
        self.args.split_whitespace()
    }
}

impl FromContext for CommandArgs {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        let event = ctx.event();
        let name = event.command().ok_or(ExtractError::NotCommand)?;
        Ok(CommandArgs {
            name: name.to_string(),
            args: event.command_args().unwrap_or_default().to_string(),
        })
    }
}

/// The button payload, decoded from JSON.
#[derive(Debug, Clone)]
pub struct Payload<T>(pub T);

impl<T: DeserializeOwned> FromContext for Payload<T> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        let raw = ctx
            .event()
            .payload()
            .ok_or_else(|| ExtractError::Payload("event has no payload".into()))?;
        serde_json::from_str(raw)
            .map(Payload)
            .map_err(|e| ExtractError::Payload(e.to_string()))
    }
}

impl<T> Deref for Payload<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

// ============================================================================
// Concrete bot
// ============================================================================

/// The bot, downcast to its concrete client type.
///
/// Fails with [`ExtractError::BotTypeMismatch`] if the dispatcher runs with a
/// different client.
#[derive(Clone)]
pub struct BotRef<T: Bot>(pub Arc<T>);

impl<T: Bot> Deref for BotRef<T> {
    type Target = T;

    fn deref(&self) -> &T {
        &self.0
    }
}

impl<T: Bot + 'static> FromContext for BotRef<T> {
    fn from_context(ctx: &Arc<Context>) -> ExtractResult<Self> {
        Arc::downcast::<T>(ctx.bot_arc().as_any())
            .map(BotRef)
            .map_err(|_| ExtractError::BotTypeMismatch {
                expected: std::any::type_name::<T>(),
            })
    }
}

impl<T: Bot + std::fmt::Debug> std::fmt::Debug for BotRef<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BotRef").field(&self.0).finish()
    }
}
