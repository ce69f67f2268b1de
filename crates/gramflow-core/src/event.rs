//! Inbound event model.
//!
//! An [`Event`] is one occurrence delivered by the platform transport: a new
//! message, a button press, or anything else the platform reports. Events are
//! created once by the transport and are read-only afterwards; the dispatch
//! core shares them between filters, middlewares and handlers as
//! [`Arc<Event>`](std::sync::Arc).
//!
//! ```rust,ignore
//! use gramflow_core::{Event, EventKind};
//!
//! let event = Event::message(2_000_000_001, "/start")
//!     .from_id(42)
//!     .build();
//!
//! assert_eq!(event.kind(), &EventKind::Message);
//! assert_eq!(event.command(), Some("start"));
//! ```

use std::fmt;
use std::str::FromStr;
use std::time::SystemTime;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ============================================================================
// EventId
// ============================================================================

/// Unique identifier of an inbound event.
///
/// Transports that receive an id from the platform should pass it through
/// [`EventBuilder::id`]; otherwise a random UUID is assigned.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(String);

impl EventId {
    /// Generates a fresh random id.
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    /// Returns the id as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<String> for EventId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl From<&str> for EventId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<u64> for EventId {
    fn from(value: u64) -> Self {
        Self(value.to_string())
    }
}

// ============================================================================
// EventKind
// ============================================================================

/// Classification of an inbound event.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// A new chat message.
    Message,
    /// A button press / callback query.
    Callback,
    /// Any other platform event, keyed by the platform's type name.
    Other(String),
}

impl EventKind {
    /// Returns a short, stable name for logging.
    pub fn as_str(&self) -> &str {
        match self {
            EventKind::Message => "message",
            EventKind::Callback => "callback",
            EventKind::Other(name) => name,
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EventKind {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(match s.to_lowercase().as_str() {
            "message" | "message_new" => EventKind::Message,
            "callback" | "message_event" => EventKind::Callback,
            other => EventKind::Other(other.to_string()),
        })
    }
}

// ============================================================================
// Attachment
// ============================================================================

/// A media attachment carried by a message.
///
/// Only the attachment type is interpreted by the core; the remaining
/// platform fields are kept verbatim in `raw`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    /// Attachment type as reported by the platform (`photo`, `sticker`, ...).
    #[serde(rename = "type")]
    pub kind: String,
    /// The untouched attachment object.
    #[serde(default)]
    pub raw: Value,
}

impl Attachment {
    /// Creates an attachment with an empty raw body.
    pub fn new(kind: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            raw: Value::Null,
        }
    }

    /// Returns `true` if this attachment has the given type.
    pub fn is(&self, kind: &str) -> bool {
        self.kind.eq_ignore_ascii_case(kind)
    }
}

// ============================================================================
// Event
// ============================================================================

/// One inbound occurrence from the chat platform.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    id: EventId,
    kind: EventKind,
    #[serde(default)]
    chat_id: Option<i64>,
    #[serde(default)]
    from_id: Option<i64>,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    attachments: Vec<Attachment>,
    #[serde(default)]
    payload: Option<String>,
    #[serde(default)]
    raw: Value,
    #[serde(default = "SystemTime::now")]
    timestamp: SystemTime,
}

impl Event {
    /// Starts building an event of the given kind.
    pub fn builder(kind: EventKind) -> EventBuilder {
        EventBuilder::new(kind)
    }

    /// Starts building a message event in `chat_id` with `text`.
    pub fn message(chat_id: i64, text: impl Into<String>) -> EventBuilder {
        EventBuilder::new(EventKind::Message)
            .chat_id(chat_id)
            .text(text)
    }

    /// Starts building a callback (button press) event in `chat_id`.
    pub fn callback(chat_id: i64) -> EventBuilder {
        EventBuilder::new(EventKind::Callback).chat_id(chat_id)
    }

    pub fn id(&self) -> &EventId {
        &self.id
    }

    pub fn kind(&self) -> &EventKind {
        &self.kind
    }

    /// The chat / peer the event originated in.
    pub fn chat_id(&self) -> Option<i64> {
        self.chat_id
    }

    /// The user that caused the event.
    pub fn from_id(&self) -> Option<i64> {
        self.from_id
    }

    pub fn text(&self) -> Option<&str> {
        self.text.as_deref()
    }

    pub fn attachments(&self) -> &[Attachment] {
        &self.attachments
    }

    /// The raw button payload, usually a JSON document.
    pub fn payload(&self) -> Option<&str> {
        self.payload.as_deref()
    }

    /// Parses the button payload as JSON.
    ///
    /// Missing or malformed payloads yield an empty object, matching how
    /// platforms treat buttons without payload.
    pub fn payload_json(&self) -> Value {
        self.payload
            .as_deref()
            .and_then(|p| serde_json::from_str(p).ok())
            .unwrap_or_else(|| Value::Object(Default::default()))
    }

    /// The untouched platform object this event was decoded from.
    pub fn raw(&self) -> &Value {
        &self.raw
    }

    pub fn timestamp(&self) -> SystemTime {
        self.timestamp
    }

    /// Returns the bot command named by the message text, without the leading
    /// `/` and without a trailing `@botname` mention.
    ///
    /// `"/start@my_bot payload"` yields `Some("start")`.
    pub fn command(&self) -> Option<&str> {
        let text = self.text.as_deref()?.trim_start();
        let word = text.strip_prefix('/')?.split_whitespace().next()?;
        let name = word.split('@').next().unwrap_or(word);
        (!name.is_empty()).then_some(name)
    }

    /// Returns the text following the command word, trimmed.
    pub fn command_args(&self) -> Option<&str> {
        self.command()?;
        let text = self.text.as_deref()?.trim_start();
        Some(
            text.split_once(char::is_whitespace)
                .map(|(_, rest)| rest.trim())
                .unwrap_or(""),
        )
    }

    /// Returns `true` for one-to-one conversations, where the peer is the
    /// author.
    pub fn is_private(&self) -> bool {
        matches!((self.chat_id, self.from_id), (Some(c), Some(f)) if c == f)
    }
}

// ============================================================================
// EventBuilder
// ============================================================================

/// Builder for [`Event`], used by transports and tests.
#[derive(Debug, Clone)]
pub struct EventBuilder {
    event: Event,
}

impl EventBuilder {
    fn new(kind: EventKind) -> Self {
        Self {
            event: Event {
                id: EventId::random(),
                kind,
                chat_id: None,
                from_id: None,
                text: None,
                attachments: Vec::new(),
                payload: None,
                raw: Value::Null,
                timestamp: SystemTime::now(),
            },
        }
    }

    pub fn id(mut self, id: impl Into<EventId>) -> Self {
        self.event.id = id.into();
        self
    }

    pub fn chat_id(mut self, chat_id: i64) -> Self {
        self.event.chat_id = Some(chat_id);
        self
    }

    pub fn from_id(mut self, from_id: i64) -> Self {
        self.event.from_id = Some(from_id);
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.event.text = Some(text.into());
        self
    }

    pub fn attachment(mut self, attachment: Attachment) -> Self {
        self.event.attachments.push(attachment);
        self
    }

    pub fn payload(mut self, payload: impl Into<String>) -> Self {
        self.event.payload = Some(payload.into());
        self
    }

    pub fn raw(mut self, raw: Value) -> Self {
        self.event.raw = raw;
        self
    }

    pub fn timestamp(mut self, timestamp: SystemTime) -> Self {
        self.event.timestamp = timestamp;
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_command_parsing() {
        let event = Event::message(1, "/Start@my_bot hello world").build();
        assert_eq!(event.command(), Some("Start"));
        assert_eq!(event.command_args(), Some("hello world"));

        let plain = Event::message(1, "start").build();
        assert_eq!(plain.command(), None);
        assert_eq!(plain.command_args(), None);

        let bare = Event::message(1, "/").build();
        assert_eq!(bare.command(), None);
    }

    #[test]
    fn test_command_without_args() {
        let event = Event::message(1, "/help").build();
        assert_eq!(event.command(), Some("help"));
        assert_eq!(event.command_args(), Some(""));
    }

    #[test]
    fn test_payload_json_tolerates_garbage() {
        let good = Event::callback(1).payload(r#"{"button":"ok"}"#).build();
        assert_eq!(good.payload_json()["button"], "ok");

        let bad = Event::callback(1).payload("not json").build();
        assert!(bad.payload_json().as_object().is_some_and(|o| o.is_empty()));
    }

    #[test]
    fn test_private_detection() {
        let private = Event::message(7, "hi").from_id(7).build();
        let group = Event::message(2_000_000_001, "hi").from_id(7).build();
        assert!(private.is_private());
        assert!(!group.is_private());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("message_new".parse::<EventKind>().unwrap(), EventKind::Message);
        assert_eq!("message_event".parse::<EventKind>().unwrap(), EventKind::Callback);
        assert_eq!(
            "group_join".parse::<EventKind>().unwrap(),
            EventKind::Other("group_join".into())
        );
    }

    #[test]
    fn test_deserialize_from_transport_json() {
        let event: Event = serde_json::from_value(serde_json::json!({
            "id": "evt-1",
            "kind": "message",
            "chat_id": 5,
            "text": "/start",
            "attachments": [{ "type": "photo", "raw": { "id": 1 } }]
        }))
        .unwrap();

        assert_eq!(event.id().as_str(), "evt-1");
        assert_eq!(event.chat_id(), Some(5));
        assert!(event.attachments()[0].is("photo"));
    }
}
