//! Shared error vocabulary.
//!
//! Every per-event failure is reported with an [`ErrorKind`] and the [`Stage`]
//! of processing it happened in. The concrete error enums live next to the
//! components that raise them; this module only holds the types shared across
//! crates.

use std::fmt;

use thiserror::Error;

// =============================================================================
// API Errors
// =============================================================================

/// Errors returned by outbound platform calls.
#[derive(Debug, Clone, Error)]
pub enum ApiError {
    /// The bot is not connected to the platform.
    #[error("bot is not connected")]
    NotConnected,

    /// The call timed out.
    #[error("API call timed out")]
    Timeout,

    /// The platform answered with an error.
    #[error("API error {code}: {message}")]
    Platform {
        /// Platform error code.
        code: i32,
        /// Human-readable description.
        message: String,
    },

    /// The event carries no peer to answer to.
    #[error("event has no chat to reply to")]
    MissingPeer,

    /// The call was refused by the outbound rate limiter.
    #[error("rate limited, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Suggested wait before retrying, in milliseconds.
        retry_after_ms: u64,
    },

    /// Request or response could not be (de)serialized.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Any other transport-level failure.
    #[error("{0}")]
    Other(String),
}

/// Result type for outbound platform calls.
pub type ApiResult<T> = Result<T, ApiError>;

// =============================================================================
// ErrorKind / Stage
// =============================================================================

/// Classification of a per-event failure, used for logging and statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// A filter predicate failed; treated as "no match".
    FilterError,
    /// A middleware `before` or `after` hook failed.
    MiddlewareError,
    /// The handler callback failed.
    HandlerError,
    /// A non-blocking rate-limit acquire was denied.
    RateLimitRejected,
    /// The event queue was full.
    QueueOverflow,
    /// The event's deadline elapsed.
    DispatchTimeout,
    /// Processing was force-cancelled by a dispatcher stop.
    Cancelled,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::FilterError => "filter_error",
            ErrorKind::MiddlewareError => "middleware_error",
            ErrorKind::HandlerError => "handler_error",
            ErrorKind::RateLimitRejected => "rate_limit_rejected",
            ErrorKind::QueueOverflow => "queue_overflow",
            ErrorKind::DispatchTimeout => "dispatch_timeout",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Processing state of one in-flight event.
///
/// `Queued → Matching → MiddlewareBefore → Executing → MiddlewareAfter → Done`,
/// with `Failed` reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Queued,
    Matching,
    MiddlewareBefore,
    Executing,
    MiddlewareAfter,
    Done,
    Failed,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Queued => "queued",
            Stage::Matching => "matching",
            Stage::MiddlewareBefore => "middleware_before",
            Stage::Executing => "executing",
            Stage::MiddlewareAfter => "middleware_after",
            Stage::Done => "done",
            Stage::Failed => "failed",
        }
    }

    /// Returns `true` for `Done` and `Failed`.
    pub fn is_terminal(self) -> bool {
        matches!(self, Stage::Done | Stage::Failed)
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
