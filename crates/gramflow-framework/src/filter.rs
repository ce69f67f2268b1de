//! Event filters.
//!
//! A [`Filter`] is a pure predicate over one [`Event`]. Filters compose into
//! an expression tree with [`And`], [`Or`] and [`Not`] (or the
//! [`FilterExt`] methods), evaluated left to right with short-circuiting.
//!
//! ```rust,ignore
//! use gramflow_framework::filter::{self, FilterExt};
//!
//! // "/start" in a private chat, unless the author is blocked
//! let f = filter::command("start")
//!     .and(filter::chat_type(ChatType::Private))
//!     .and(filter::user([13, 666]).not());
//! ```
//!
//! # Failure
//!
//! [`Filter::check`] may return a [`FilterError`]. The registry evaluates
//! filters through [`evaluate`], which treats errors and panics as "does not
//! match" and logs them, so one broken filter never aborts dispatch.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use regex::Regex;
use tracing::warn;

use crate::error::{FilterError, panic_message};
use gramflow_core::{Event, EventKind};

/// A predicate selecting which events a handler should process.
///
/// Implementations must be cheap and must not block.
pub trait Filter: Send + Sync + 'static {
    /// Decides whether `event` matches.
    fn check(&self, event: &Event) -> Result<bool, FilterError>;

    /// Name used when logging filter failures.
    fn name(&self) -> &'static str {
        std::any::type_name::<Self>()
    }
}

/// A shareable, type-erased filter.
pub type BoxedFilter = Arc<dyn Filter>;

impl Filter for BoxedFilter {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        (**self).check(event)
    }

    fn name(&self) -> &'static str {
        (**self).name()
    }
}

/// Evaluates `filter` against `event`, containing failures.
///
/// Returns `false` when the filter errors or panics; the failure is logged
/// with the event id and never propagated.
pub fn evaluate(filter: &dyn Filter, event: &Event) -> bool {
    match panic::catch_unwind(AssertUnwindSafe(|| filter.check(event))) {
        Ok(Ok(matched)) => matched,
        Ok(Err(e)) => {
            warn!(
                event_id = %event.id(),
                filter = filter.name(),
                error = %e,
                "Filter failed, treating as no match"
            );
            false
        }
        Err(payload) => {
            warn!(
                event_id = %event.id(),
                filter = filter.name(),
                panic = %panic_message(payload.as_ref()),
                "Filter panicked, treating as no match"
            );
            false
        }
    }
}

// ============================================================================
// Combinators
// ============================================================================

/// Matches when both operands match. The right operand is not evaluated when
/// the left one does not match.
#[derive(Clone)]
pub struct And<A, B>(pub A, pub B);

impl<A: Filter, B: Filter> Filter for And<A, B> {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        if !self.0.check(event)? {
            return Ok(false);
        }
        self.1.check(event)
    }

    fn name(&self) -> &'static str {
        "and"
    }
}

/// Matches when either operand matches. The right operand is not evaluated
/// when the left one matches.
#[derive(Clone)]
pub struct Or<A, B>(pub A, pub B);

impl<A: Filter, B: Filter> Filter for Or<A, B> {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        if self.0.check(event)? {
            return Ok(true);
        }
        self.1.check(event)
    }

    fn name(&self) -> &'static str {
        "or"
    }
}

/// Inverts its operand.
#[derive(Clone)]
pub struct Not<F>(pub F);

impl<F: Filter> Filter for Not<F> {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        self.0.check(event).map(|m| !m)
    }

    fn name(&self) -> &'static str {
        "not"
    }
}

/// Matches when every filter in the list matches (vacuously true when empty).
#[derive(Clone)]
pub struct All(pub Vec<BoxedFilter>);

impl Filter for All {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        for f in &self.0 {
            if !f.check(event)? {
                return Ok(false);
            }
        }
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "all"
    }
}

/// Matches when at least one filter in the list matches.
#[derive(Clone)]
pub struct AnyOf(pub Vec<BoxedFilter>);

impl Filter for AnyOf {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        for f in &self.0 {
            if f.check(event)? {
                return Ok(true);
            }
        }
        Ok(false)
    }

    fn name(&self) -> &'static str {
        "any_of"
    }
}

/// Combinator methods available on every filter.
pub trait FilterExt: Filter + Sized {
    fn and<B: Filter>(self, other: B) -> And<Self, B> {
        And(self, other)
    }

    fn or<B: Filter>(self, other: B) -> Or<Self, B> {
        Or(self, other)
    }

    fn not(self) -> Not<Self> {
        Not(self)
    }

    fn boxed(self) -> BoxedFilter {
        Arc::new(self)
    }
}

impl<F: Filter> FilterExt for F {}

/// Matches when every filter matches.
pub fn all(filters: impl IntoIterator<Item = BoxedFilter>) -> All {
    All(filters.into_iter().collect())
}

/// Matches when any filter matches.
pub fn any(filters: impl IntoIterator<Item = BoxedFilter>) -> AnyOf {
    AnyOf(filters.into_iter().collect())
}

// ============================================================================
// Built-in filters
// ============================================================================

/// Matches every event.
#[derive(Debug, Clone, Copy, Default)]
pub struct AnyEvent;

impl Filter for AnyEvent {
    fn check(&self, _event: &Event) -> Result<bool, FilterError> {
        Ok(true)
    }

    fn name(&self) -> &'static str {
        "any_event"
    }
}

pub fn any_event() -> AnyEvent {
    AnyEvent
}

/// Matches bot commands (`/name args...`), case-insensitively.
#[derive(Debug, Clone)]
pub struct Command {
    names: Vec<String>,
}

impl Filter for Command {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        if event.kind() != &EventKind::Message {
            return Ok(false);
        }
        Ok(event
            .command()
            .is_some_and(|cmd| self.names.iter().any(|n| n.eq_ignore_ascii_case(cmd))))
    }

    fn name(&self) -> &'static str {
        "command"
    }
}

/// Matches the single command `name` (given without the leading `/`).
pub fn command(name: impl Into<String>) -> Command {
    Command {
        names: vec![normalize_command(name.into())],
    }
}

/// Matches any of the given commands.
pub fn commands<I, S>(names: I) -> Command
where
    I: IntoIterator<Item = S>,
    S: Into<String>,
{
    Command {
        names: names
            .into_iter()
            .map(|n| normalize_command(n.into()))
            .collect(),
    }
}

fn normalize_command(name: String) -> String {
    name.strip_prefix('/').map(str::to_string).unwrap_or(name)
}

/// How [`Text`] compares the message text with its pattern.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TextMatch {
    Exact,
    Prefix,
    Contains,
}

/// Matches message text against a literal pattern.
#[derive(Debug, Clone)]
pub struct Text {
    pattern: String,
    mode: TextMatch,
    ignore_case: bool,
}

impl Text {
    /// Makes the comparison case-insensitive.
    pub fn ignore_case(mut self) -> Self {
        self.ignore_case = true;
        self.pattern = self.pattern.to_lowercase();
        self
    }
}

impl Filter for Text {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        let Some(text) = event.text() else {
            return Ok(false);
        };
        let folded;
        let text = if self.ignore_case {
            folded = text.to_lowercase();
            folded.as_str()
        } else {
            text
        };
        Ok(match self.mode {
            TextMatch::Exact => text == self.pattern,
            TextMatch::Prefix => text.starts_with(&self.pattern),
            TextMatch::Contains => text.contains(&self.pattern),
        })
    }

    fn name(&self) -> &'static str {
        "text"
    }
}

fn text(pattern: impl Into<String>, mode: TextMatch) -> Text {
    Text {
        pattern: pattern.into(),
        mode,
        ignore_case: false,
    }
}

/// Matches messages whose text equals `pattern`.
pub fn text_eq(pattern: impl Into<String>) -> Text {
    text(pattern, TextMatch::Exact)
}

/// Matches messages whose text starts with `pattern`.
pub fn text_prefix(pattern: impl Into<String>) -> Text {
    text(pattern, TextMatch::Prefix)
}

/// Matches messages whose text contains `pattern`.
pub fn text_contains(pattern: impl Into<String>) -> Text {
    text(pattern, TextMatch::Contains)
}

/// Matches message text against a regular expression (search semantics).
#[derive(Debug, Clone)]
pub struct RegexFilter(Regex);

impl Filter for RegexFilter {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        Ok(event.text().is_some_and(|t| self.0.is_match(t)))
    }

    fn name(&self) -> &'static str {
        "regex"
    }
}

/// Compiles `pattern` into a text filter.
pub fn regex(pattern: &str) -> Result<RegexFilter, regex::Error> {
    Regex::new(pattern).map(RegexFilter)
}

/// Matches events of one kind.
#[derive(Debug, Clone)]
pub struct Kind(pub EventKind);

impl Filter for Kind {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        Ok(event.kind() == &self.0)
    }

    fn name(&self) -> &'static str {
        "kind"
    }
}

pub fn kind(kind: EventKind) -> Kind {
    Kind(kind)
}

/// Matches new-message events.
pub fn message() -> Kind {
    Kind(EventKind::Message)
}

/// Matches button-press events.
pub fn callback() -> Kind {
    Kind(EventKind::Callback)
}

/// Matches events from the listed chats / peers.
#[derive(Debug, Clone)]
pub struct Chat(Vec<i64>);

impl Filter for Chat {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        Ok(event.chat_id().is_some_and(|id| self.0.contains(&id)))
    }

    fn name(&self) -> &'static str {
        "chat"
    }
}

pub fn chat(chat_id: i64) -> Chat {
    Chat(vec![chat_id])
}

pub fn chats(chat_ids: impl IntoIterator<Item = i64>) -> Chat {
    Chat(chat_ids.into_iter().collect())
}

/// Matches events authored by the listed users.
#[derive(Debug, Clone)]
pub struct User(Vec<i64>);

impl Filter for User {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        Ok(event.from_id().is_some_and(|id| self.0.contains(&id)))
    }

    fn name(&self) -> &'static str {
        "user"
    }
}

pub fn user(user_ids: impl IntoIterator<Item = i64>) -> User {
    User(user_ids.into_iter().collect())
}

/// Conversation type, derived from the peer and author ids.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatType {
    /// One-to-one conversation: the peer is the author.
    Private,
    /// Multi-user conversation.
    Group,
}

/// Matches messages by conversation type.
#[derive(Debug, Clone, Copy)]
pub struct ChatTypeFilter(ChatType);

impl Filter for ChatTypeFilter {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        if event.kind() != &EventKind::Message {
            return Ok(false);
        }
        let (Some(chat), Some(from)) = (event.chat_id(), event.from_id()) else {
            return Ok(false);
        };
        Ok(match self.0 {
            ChatType::Private => chat == from,
            ChatType::Group => chat != from,
        })
    }

    fn name(&self) -> &'static str {
        "chat_type"
    }
}

pub fn chat_type(chat_type: ChatType) -> ChatTypeFilter {
    ChatTypeFilter(chat_type)
}

/// Message content categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentType {
    /// Non-blank text.
    Text,
    /// At least one attachment of any type.
    Attachment,
    Sticker,
    Photo,
}

/// Matches messages by content type.
#[derive(Debug, Clone, Copy)]
pub struct ContentTypeFilter(ContentType);

impl Filter for ContentTypeFilter {
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        if event.kind() != &EventKind::Message {
            return Ok(false);
        }
        let attachments = event.attachments();
        Ok(match self.0 {
            ContentType::Text => event.text().is_some_and(|t| !t.trim().is_empty()),
            ContentType::Attachment => !attachments.is_empty(),
            ContentType::Sticker => attachments.iter().any(|a| a.is("sticker")),
            ContentType::Photo => attachments.iter().any(|a| a.is("photo")),
        })
    }

    fn name(&self) -> &'static str {
        "content_type"
    }
}

pub fn content_type(content_type: ContentType) -> ContentTypeFilter {
    ContentTypeFilter(content_type)
}

/// A user-supplied infallible predicate.
#[derive(Clone)]
pub struct Predicate<F>(F);

impl<F> Filter for Predicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        Ok((self.0)(event))
    }

    fn name(&self) -> &'static str {
        "predicate"
    }
}

pub fn predicate<F>(f: F) -> Predicate<F>
where
    F: Fn(&Event) -> bool + Send + Sync + 'static,
{
    Predicate(f)
}

/// A user-supplied fallible predicate.
#[derive(Clone)]
pub struct TryPredicate<F>(F);

impl<F> Filter for TryPredicate<F>
where
    F: Fn(&Event) -> Result<bool, FilterError> + Send + Sync + 'static,
{
    fn check(&self, event: &Event) -> Result<bool, FilterError> {
        (self.0)(event)
    }

    fn name(&self) -> &'static str {
        "try_predicate"
    }
}

pub fn try_predicate<F>(f: F) -> TryPredicate<F>
where
    F: Fn(&Event) -> Result<bool, FilterError> + Send + Sync + 'static,
{
    TryPredicate(f)
}

#[cfg(test)]
mod tests {
    use super::*;
    use gramflow_core::Attachment;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn msg(text: &str) -> Event {
        Event::message(100, text).from_id(7).build()
    }

    fn counting(result: bool, counter: &Arc<AtomicUsize>) -> impl Filter + use<> {
        let counter = Arc::clone(counter);
        predicate(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            result
        })
    }

    #[test]
    fn test_command_matching() {
        let f = command("start");
        assert!(f.check(&msg("/start")).unwrap());
        assert!(f.check(&msg("/START now")).unwrap());
        assert!(f.check(&msg("/start@bot")).unwrap());
        assert!(!f.check(&msg("/started")).unwrap());
        assert!(!f.check(&msg("start")).unwrap());
        assert!(!f.check(&Event::callback(1).text("/start").build()).unwrap());

        let multi = commands(["/help", "about"]);
        assert!(multi.check(&msg("/help")).unwrap());
        assert!(multi.check(&msg("/about")).unwrap());
    }

    #[test]
    fn test_text_modes() {
        assert!(text_eq("hi").check(&msg("hi")).unwrap());
        assert!(!text_eq("hi").check(&msg("Hi")).unwrap());
        assert!(text_eq("hi").ignore_case().check(&msg("Hi")).unwrap());
        assert!(text_prefix("he").check(&msg("hello")).unwrap());
        assert!(text_contains("LL").ignore_case().check(&msg("hello")).unwrap());
        assert!(!text_contains("x").check(&Event::callback(1).build()).unwrap());
    }

    #[test]
    fn test_regex() {
        let f = regex(r"\d{3}").unwrap();
        assert!(f.check(&msg("code 123 here")).unwrap());
        assert!(!f.check(&msg("no digits")).unwrap());
        assert!(regex("(").is_err());
    }

    #[test]
    fn test_and_short_circuits() {
        let right = Arc::new(AtomicUsize::new(0));
        let f = And(predicate(|_| false), counting(true, &right));
        assert!(!f.check(&msg("x")).unwrap());
        assert_eq!(right.load(Ordering::SeqCst), 0);

        let f = And(predicate(|_| true), counting(true, &right));
        assert!(f.check(&msg("x")).unwrap());
        assert_eq!(right.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_or_short_circuits() {
        let right = Arc::new(AtomicUsize::new(0));
        let f = predicate(|_| true).or(counting(false, &right));
        assert!(f.check(&msg("x")).unwrap());
        assert_eq!(right.load(Ordering::SeqCst), 0);

        let f = predicate(|_| false).or(counting(false, &right));
        assert!(!f.check(&msg("x")).unwrap());
        assert_eq!(right.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_all_stops_at_first_false() {
        let tail = Arc::new(AtomicUsize::new(0));
        let f = all([
            predicate(|_| true).boxed(),
            predicate(|_| false).boxed(),
            counting(true, &tail).boxed(),
        ]);
        assert!(!f.check(&msg("x")).unwrap());
        assert_eq!(tail.load(Ordering::SeqCst), 0);
        assert!(all([]).check(&msg("x")).unwrap());
        assert!(!any([]).check(&msg("x")).unwrap());
    }

    #[test]
    fn test_not() {
        assert!(command("start").not().check(&msg("/help")).unwrap());
        assert!(!command("start").not().check(&msg("/start")).unwrap());
    }

    #[test]
    fn test_chat_user_and_type() {
        let group = Event::message(2_000_000_001, "x").from_id(7).build();
        let private = Event::message(7, "x").from_id(7).build();

        assert!(chat(2_000_000_001).check(&group).unwrap());
        assert!(!chats([1, 2]).check(&group).unwrap());
        assert!(user([7]).check(&group).unwrap());
        assert!(chat_type(ChatType::Group).check(&group).unwrap());
        assert!(chat_type(ChatType::Private).check(&private).unwrap());
        assert!(!chat_type(ChatType::Private).check(&group).unwrap());
    }

    #[test]
    fn test_content_type() {
        let photo = Event::message(1, " ")
            .attachment(Attachment::new("photo"))
            .build();
        assert!(content_type(ContentType::Photo).check(&photo).unwrap());
        assert!(content_type(ContentType::Attachment).check(&photo).unwrap());
        assert!(!content_type(ContentType::Sticker).check(&photo).unwrap());
        assert!(!content_type(ContentType::Text).check(&photo).unwrap());
        assert!(content_type(ContentType::Text).check(&msg("hey")).unwrap());
    }

    #[test]
    fn test_evaluate_contains_errors_and_panics() {
        let failing = try_predicate(|_| Err(FilterError::new("boom")));
        assert!(!evaluate(&failing, &msg("x")));

        let panicking = predicate(|_| panic!("filter bug"));
        assert!(!evaluate(&panicking, &msg("x")));

        // an error on the left side of Or aborts the whole expression
        let f = try_predicate(|_| Err(FilterError::new("boom"))).or(any_event());
        assert!(!evaluate(&f, &msg("x")));
    }

    #[test]
    fn test_kind_filters() {
        assert!(message().check(&msg("x")).unwrap());
        assert!(callback().check(&Event::callback(1).build()).unwrap());
        assert!(
            kind(EventKind::Other("wall_post_new".into()))
                .check(&Event::builder(EventKind::Other("wall_post_new".into())).build())
                .unwrap()
        );
    }
}
