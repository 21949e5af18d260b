//! Error handler stacks
//!
//! Errors raised by a driver pass through three stacks before reaching the
//! caller, most specific first:
//! 1. the connection's own stack
//! 2. the per-connection-default stack inherited when the connection was made
//! 3. the context-wide stack
//!
//! Inside a stack, handlers run from the most recently pushed down. The first
//! handler returning `true` absorbs the error; nothing below it sees it, and
//! neither does the caller.
//!
//! Handlers are pushed either owned (the stack keeps it alive) or borrowed
//! (the stack holds a weak reference and skips it once the caller drops it).
//! Cloning a stack copies references, never handlers.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::{debug, error, info, warn};

use crate::error::{Error, Severity};

/// Intercepts errors before they surface
pub trait ErrorHandler: Send + Sync {
    /// Inspect an error; return `true` if it is fully handled
    fn handle(&self, error: &Error) -> bool;

    /// Name used in log output
    fn name(&self) -> &str {
        "handler"
    }
}

/// Identifies one push onto a stack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(u64);

static NEXT_HANDLER_ID: AtomicU64 = AtomicU64::new(1);

impl HandlerId {
    fn next() -> Self {
        Self(NEXT_HANDLER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Clone)]
enum Slot {
    Owned(Arc<dyn ErrorHandler>),
    Borrowed(Weak<dyn ErrorHandler>),
}

impl Slot {
    fn get(&self) -> Option<Arc<dyn ErrorHandler>> {
        match self {
            Slot::Owned(h) => Some(Arc::clone(h)),
            Slot::Borrowed(w) => w.upgrade(),
        }
    }
}

/// Ordered handler references
#[derive(Clone, Default)]
pub struct HandlerStack {
    entries: Vec<(HandlerId, Slot)>,
}

impl HandlerStack {
    /// Empty stack
    pub fn new() -> Self {
        Self::default()
    }

    /// Push a handler the stack takes ownership of
    pub fn push_owned(&mut self, handler: impl ErrorHandler + 'static) -> HandlerId {
        self.push_shared(Arc::new(handler))
    }

    /// Push an already shared handler; the stack keeps a strong reference
    pub fn push_shared(&mut self, handler: Arc<dyn ErrorHandler>) -> HandlerId {
        let id = HandlerId::next();
        self.entries.push((id, Slot::Owned(handler)));
        id
    }

    /// Push a handler that stays owned by the caller
    pub fn push_borrowed<H: ErrorHandler + 'static>(&mut self, handler: &Arc<H>) -> HandlerId {
        let weak: Weak<dyn ErrorHandler> = Arc::downgrade(handler) as Weak<dyn ErrorHandler>;
        let id = HandlerId::next();
        self.entries.push((id, Slot::Borrowed(weak)));
        id
    }

    /// Remove a handler by id; returns whether it was present
    pub fn remove(&mut self, id: HandlerId) -> bool {
        let before = self.entries.len();
        self.entries.retain(|(entry, _)| *entry != id);
        self.entries.len() != before
    }

    /// Remove the most recently pushed handler
    pub fn pop(&mut self) -> Option<HandlerId> {
        self.entries.pop().map(|(id, _)| id)
    }

    /// Number of entries, including borrowed ones whose handler is gone
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the stack has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop borrowed entries whose handler no longer exists
    pub fn prune(&mut self) {
        self.entries.retain(|(_, slot)| match slot {
            Slot::Owned(_) => true,
            Slot::Borrowed(w) => w.strong_count() > 0,
        });
    }

    /// Run the stack top-down; `true` if some handler absorbed the error
    pub fn dispatch(&self, error: &Error) -> bool {
        for (_, slot) in self.entries.iter().rev() {
            if let Some(handler) = slot.get() {
                if handler.handle(error) {
                    debug!(handler = handler.name(), error = %error, "Error absorbed by handler");
                    return true;
                }
            }
        }
        false
    }
}

impl fmt::Debug for HandlerStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerStack")
            .field("len", &self.entries.len())
            .finish()
    }
}

/// The three scopes a connection reports through
#[derive(Clone, Default, Debug)]
pub struct HandlerChain {
    /// Handlers pushed on the connection itself
    pub own: HandlerStack,
    /// Per-connection-default handlers captured at creation
    pub defaults: HandlerStack,
    /// Context-wide handlers captured at creation
    pub context: HandlerStack,
}

impl HandlerChain {
    /// Chain with an empty own stack over the given snapshots
    pub fn new(defaults: HandlerStack, context: HandlerStack) -> Self {
        Self {
            own: HandlerStack::new(),
            defaults,
            context,
        }
    }

    /// Run own, then defaults, then context-wide
    pub fn dispatch(&self, error: &Error) -> bool {
        self.own.dispatch(error) || self.defaults.dispatch(error) || self.context.dispatch(error)
    }
}

/// Logs every error through `tracing` and lets it continue
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl ErrorHandler for LoggingHandler {
    fn handle(&self, err: &Error) -> bool {
        match err.severity() {
            Severity::Info => info!(code = ?err.code(), "{}", err),
            Severity::Warning => warn!(code = ?err.code(), "{}", err),
            Severity::Error | Severity::Fatal => {
                error!(code = ?err.code(), category = %err.category(), "{}", err)
            }
        }
        false
    }

    fn name(&self) -> &str {
        "logging"
    }
}

/// Absorbs everything; pair with the pending-error queue to poll instead
#[derive(Debug, Default, Clone, Copy)]
pub struct SilentHandler;

impl ErrorHandler for SilentHandler {
    fn handle(&self, _error: &Error) -> bool {
        true
    }

    fn name(&self) -> &str {
        "silent"
    }
}

/// Absorbs errors at or below a severity
#[derive(Debug, Clone, Copy)]
pub struct SeverityFilter {
    max: Severity,
}

impl SeverityFilter {
    /// Absorb errors whose severity is `max` or lower
    pub fn up_to(max: Severity) -> Self {
        Self { max }
    }
}

impl ErrorHandler for SeverityFilter {
    fn handle(&self, error: &Error) -> bool {
        error.severity() <= self.max
    }

    fn name(&self) -> &str {
        "severity_filter"
    }
}

/// Handler from a closure
pub struct FnHandler<F> {
    name: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    /// Wrap a closure
    pub fn new(name: impl Into<String>, f: F) -> Self {
        Self {
            name: name.into(),
            f,
        }
    }
}

impl<F> ErrorHandler for FnHandler<F>
where
    F: Fn(&Error) -> bool + Send + Sync,
{
    fn handle(&self, error: &Error) -> bool {
        (self.f)(error)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Records every error it sees
#[derive(Debug, Default)]
pub struct CollectingHandler {
    absorb: bool,
    seen: Mutex<Vec<Error>>,
}

impl CollectingHandler {
    /// Record and let errors continue
    pub fn new() -> Self {
        Self::default()
    }

    /// Record and absorb
    pub fn absorbing() -> Self {
        Self {
            absorb: true,
            seen: Mutex::new(Vec::new()),
        }
    }

    /// Errors seen so far
    pub fn take(&self) -> Vec<Error> {
        std::mem::take(&mut *self.seen.lock())
    }

    /// Number of errors seen so far
    pub fn count(&self) -> usize {
        self.seen.lock().len()
    }
}

impl ErrorHandler for CollectingHandler {
    fn handle(&self, error: &Error) -> bool {
        self.seen.lock().push(error.duplicate());
        self.absorb
    }

    fn name(&self) -> &str {
        "collecting"
    }
}
