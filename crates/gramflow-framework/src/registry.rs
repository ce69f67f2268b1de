//! Handler registry.
//!
//! A [`Registration`] binds a [`Filter`], an ordered list of middlewares and a
//! handler under a priority. The [`Registry`] keeps registrations sorted by
//! descending priority, then ascending insertion order, and resolves events
//! against them.
//!
//! ```rust,ignore
//! let registry = Registry::new();
//!
//! registry
//!     .on(filter::command("start"))
//!     .name("start")
//!     .priority(10)
//!     .middleware(TracingMiddleware)
//!     .handler(start);
//!
//! // Catch-all, tried last
//! registry.on(filter::any_event()).priority(-100).handler(fallback);
//! ```
//!
//! # Concurrency
//!
//! The registration list is copy-on-write: writers build a new list under a
//! single-writer lock and swap it in, readers clone the current `Arc` and
//! resolve against that snapshot. A resolve therefore never observes a
//! partially applied registration.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, trace};

use gramflow_core::Event;

use crate::filter::{self, BoxedFilter, Filter, FilterExt, evaluate};
use crate::handler::{BoxedHandler, Handler, into_handler};
use crate::middleware::{BoxedMiddleware, Middleware};

/// Identifies a registration for later removal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct RegistrationId(u64);

impl fmt::Display for RegistrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An immutable (filter, middlewares, handler, priority) binding.
pub struct Registration {
    id: RegistrationId,
    name: Option<String>,
    filter: BoxedFilter,
    middlewares: Vec<BoxedMiddleware>,
    handler: BoxedHandler,
    priority: i32,
}

impl Registration {
    pub fn id(&self) -> RegistrationId {
        self.id
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The name for logs: the given name or the id.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| self.id.to_string())
    }

    pub fn priority(&self) -> i32 {
        self.priority
    }

    pub fn filter(&self) -> &BoxedFilter {
        &self.filter
    }

    pub fn middlewares(&self) -> &[BoxedMiddleware] {
        &self.middlewares
    }

    pub fn handler(&self) -> &BoxedHandler {
        &self.handler
    }

    /// Evaluates the filter, containing errors and panics.
    pub fn matches(&self, event: &Event) -> bool {
        evaluate(&self.filter, event)
    }
}

impl fmt::Debug for Registration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registration")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("priority", &self.priority)
            .field("filter", &self.filter.name())
            .field("middlewares", &self.middlewares.len())
            .finish_non_exhaustive()
    }
}

type Snapshot = Arc<Vec<Arc<Registration>>>;

/// Ordered collection of registrations.
pub struct Registry {
    entries: RwLock<Snapshot>,
    next_id: AtomicU64,
}

impl Default for Registry {
    fn default() -> Self {
        Self::new()
    }
}

impl Registry {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(Arc::new(Vec::new())),
            next_id: AtomicU64::new(1),
        }
    }

    /// Registers `handler` behind `filter` and `middlewares`.
    ///
    /// Higher priorities are tried first; equal priorities keep insertion
    /// order.
    pub fn register(
        &self,
        filter: impl Filter,
        middlewares: Vec<BoxedMiddleware>,
        handler: BoxedHandler,
        priority: i32,
    ) -> RegistrationId {
        self.insert(None, filter.boxed(), middlewares, handler, priority)
    }

    /// Like [`register`](Self::register), restricted to events from `chat_id`.
    pub fn register_for_chat(
        &self,
        chat_id: i64,
        filter: impl Filter,
        middlewares: Vec<BoxedMiddleware>,
        handler: BoxedHandler,
        priority: i32,
    ) -> RegistrationId {
        self.register(filter::chat(chat_id).and(filter), middlewares, handler, priority)
    }

    /// Starts a fluent registration.
    pub fn on(&self, filter: impl Filter) -> RegistrationBuilder<'_> {
        RegistrationBuilder {
            registry: self,
            filter: filter.boxed(),
            name: None,
            middlewares: Vec::new(),
            priority: 0,
        }
    }

    fn insert(
        &self,
        name: Option<String>,
        filter: BoxedFilter,
        middlewares: Vec<BoxedMiddleware>,
        handler: BoxedHandler,
        priority: i32,
    ) -> RegistrationId {
        // Ids grow monotonically, so they double as insertion sequence.
        let id = RegistrationId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let registration = Arc::new(Registration {
            id,
            name,
            filter,
            middlewares,
            handler,
            priority,
        });

        let mut entries = self.entries.write();
        let mut next = Vec::with_capacity(entries.len() + 1);
        next.extend(entries.iter().cloned());
        let at = next.partition_point(|r| (Reverse(r.priority), r.id) < (Reverse(priority), id));
        next.insert(at, registration);
        *entries = Arc::new(next);

        debug!(id = %id, priority, position = at, "Handler registered");
        id
    }

    /// Removes a registration. Returns `false` if `id` is unknown.
    ///
    /// Events already resolved against an older snapshot still run it.
    pub fn unregister(&self, id: RegistrationId) -> bool {
        let mut entries = self.entries.write();
        if !entries.iter().any(|r| r.id == id) {
            return false;
        }
        let next: Vec<_> = entries.iter().filter(|r| r.id != id).cloned().collect();
        *entries = Arc::new(next);
        debug!(id = %id, "Handler unregistered");
        true
    }

    /// Removes every registration.
    pub fn clear(&self) {
        *self.entries.write() = Arc::new(Vec::new());
    }

    /// Returns the current registration list.
    pub fn snapshot(&self) -> Snapshot {
        Arc::clone(&self.entries.read())
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// All registrations matching `event`, in priority order.
    pub fn resolve(&self, event: &Event) -> Vec<Arc<Registration>> {
        let snapshot = self.snapshot();
        let matched: Vec<_> = snapshot
            .iter()
            .filter(|r| r.matches(event))
            .cloned()
            .collect();
        trace!(event_id = %event.id(), matched = matched.len(), "Resolved event");
        matched
    }

    /// The highest-priority registration matching `event`.
    ///
    /// Filters after the first match are not evaluated.
    pub fn first_match(&self, event: &Event) -> Option<Arc<Registration>> {
        self.snapshot().iter().find(|r| r.matches(event)).cloned()
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Registry")
            .field("registrations", &self.len())
            .finish()
    }
}

/// Fluent registration, finished by [`handler`](Self::handler).
#[must_use = "nothing is registered until `.handler(..)` is called"]
pub struct RegistrationBuilder<'a> {
    registry: &'a Registry,
    filter: BoxedFilter,
    name: Option<String>,
    middlewares: Vec<BoxedMiddleware>,
    priority: i32,
}

impl RegistrationBuilder<'_> {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Restricts the registration to events from `chat_id`.
    pub fn chat(mut self, chat_id: i64) -> Self {
        self.filter = filter::chat(chat_id).and(self.filter).boxed();
        self
    }

    /// Appends a middleware; the first one added is the outermost.
    pub fn middleware(mut self, middleware: impl Middleware) -> Self {
        self.middlewares.push(Arc::new(middleware));
        self
    }

    pub fn boxed_middleware(mut self, middleware: BoxedMiddleware) -> Self {
        self.middlewares.push(middleware);
        self
    }

    /// Registers `handler` and returns its id.
    pub fn handler<F, T>(self, handler: F) -> RegistrationId
    where
        F: Handler<T>,
        T: 'static,
    {
        self.boxed_handler(into_handler(handler))
    }

    pub fn boxed_handler(self, handler: BoxedHandler) -> RegistrationId {
        self.registry.insert(
            self.name,
            self.filter,
            self.middlewares,
            handler,
            self.priority,
        )
    }
}
