//! Error types for the dispatch framework.
//!
//! Per-event errors never escape a worker: the dispatcher converts them into a
//! failed [`DispatchReport`](crate::dispatcher::DispatchReport) and logs them.

use std::time::Duration;

use thiserror::Error;

use gramflow_core::{ApiError, ErrorKind};

/// A filter predicate could not decide.
///
/// The registry treats this as "does not match" and logs it.
#[derive(Debug, Clone, Error)]
#[error("filter failed: {0}")]
pub struct FilterError(pub String);

impl FilterError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Errors that can occur during context extraction.
#[derive(Debug, Clone, Error)]
pub enum ExtractError {
    /// The event carries no text.
    #[error("event has no text")]
    MissingText,

    /// The event carries no chat id.
    #[error("event has no chat id")]
    MissingChat,

    /// The event is not a command.
    #[error("event is not a command")]
    NotCommand,

    /// A context value was not set by any middleware.
    #[error("context value '{0}' is missing or has a different type")]
    MissingValue(String),

    /// The button payload could not be decoded.
    #[error("invalid payload: {0}")]
    Payload(String),

    /// The bot type does not match the expected type.
    #[error("bot type mismatch: expected '{expected}'")]
    BotTypeMismatch {
        /// Expected bot type name.
        expected: &'static str,
    },

    /// Custom extraction error.
    #[error("{0}")]
    Custom(String),
}

impl ExtractError {
    /// Creates a custom extraction error.
    pub fn custom(msg: impl Into<String>) -> Self {
        Self::Custom(msg.into())
    }
}

/// Result type for extraction operations.
pub type ExtractResult<T> = Result<T, ExtractError>;

/// A middleware hook failed.
#[derive(Debug, Clone, Error)]
#[error("{0}")]
pub struct MiddlewareError(pub String);

impl MiddlewareError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// A handler callback failed.
#[derive(Debug, Clone, Error)]
pub enum HandlerError {
    /// A handler parameter could not be extracted from the context.
    #[error("extraction failed: {0}")]
    Extract(#[from] ExtractError),

    /// An outbound call made while producing the response failed.
    #[error("outbound call failed: {0}")]
    Api(#[from] ApiError),

    /// The handler returned an error.
    #[error("{0}")]
    Failed(String),

    /// The handler panicked.
    #[error("handler panicked: {0}")]
    Panicked(String),
}

impl HandlerError {
    pub fn failed(message: impl Into<String>) -> Self {
        Self::Failed(message.into())
    }
}

/// Rate limiter refusals.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RateLimitError {
    /// Not enough tokens and the limiter does not wait.
    #[error("rate limit exceeded for '{key}', retry after {retry_after:?}")]
    Rejected {
        /// The bucket key.
        key: String,
        /// Time until enough tokens will have accrued.
        retry_after: Duration,
    },

    /// The requested cost can never be satisfied by the bucket.
    #[error("cost {cost} exceeds bucket capacity {capacity} for '{key}'")]
    CostExceedsCapacity {
        key: String,
        cost: f64,
        capacity: f64,
    },

    /// Negative or non-finite cost.
    #[error("invalid cost {0}")]
    InvalidCost(f64),
}

impl RateLimitError {
    /// `None` for caller mistakes, which are not limiter denials.
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            RateLimitError::Rejected { .. } => Some(ErrorKind::RateLimitRejected),
            RateLimitError::CostExceedsCapacity { .. } | RateLimitError::InvalidCost(_) => None,
        }
    }
}

impl From<RateLimitError> for ApiError {
    fn from(err: RateLimitError) -> Self {
        match err {
            RateLimitError::Rejected { retry_after, .. } => ApiError::RateLimited {
                retry_after_ms: retry_after.as_millis() as u64,
            },
            other => ApiError::Other(other.to_string()),
        }
    }
}

/// Producer-side queue errors.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum QueueError {
    /// The queue is full and the overflow policy rejects.
    #[error("event queue is full (capacity {capacity})")]
    Overflow {
        /// The configured queue capacity.
        capacity: usize,
    },

    /// The dispatcher has stopped accepting events.
    #[error("event queue is closed")]
    Closed,
}

impl QueueError {
    pub fn kind(&self) -> Option<ErrorKind> {
        match self {
            QueueError::Overflow { .. } => Some(ErrorKind::QueueOverflow),
            QueueError::Closed => None,
        }
    }
}

/// Reasons an event's processing failed.
#[derive(Debug, Clone, Error)]
pub enum DispatchError {
    /// A middleware hook failed.
    #[error("middleware '{name}' failed: {source}")]
    Middleware {
        /// Name of the failing middleware.
        name: String,
        #[source]
        source: MiddlewareError,
    },

    /// The handler failed.
    #[error("handler failed: {0}")]
    Handler(#[from] HandlerError),

    /// The event's deadline elapsed.
    #[error("dispatch timed out after {0:?}")]
    Timeout(Duration),

    /// The dispatcher was stopped while the event was in flight.
    #[error("dispatch cancelled")]
    Cancelled,
}

impl DispatchError {
    /// Returns the error classification.
    pub fn kind(&self) -> ErrorKind {
        match self {
            DispatchError::Middleware { .. } => ErrorKind::MiddlewareError,
            DispatchError::Handler(_) => ErrorKind::HandlerError,
            DispatchError::Timeout(_) => ErrorKind::DispatchTimeout,
            DispatchError::Cancelled => ErrorKind::Cancelled,
        }
    }
}

/// Lifecycle misuse of the dispatcher.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StartError {
    /// `start` was called on a running or stopped dispatcher.
    #[error("dispatcher was already started")]
    AlreadyStarted,

    /// `start` was called with zero workers.
    #[error("worker count must be at least 1")]
    NoWorkers,
}

/// Startup-time configuration errors; fatal.
#[derive(Debug, Clone, Error)]
#[error("invalid dispatcher configuration: {0}")]
pub struct ConfigError(pub String);

/// Renders a caught panic payload for logging.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
