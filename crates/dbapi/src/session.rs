//! Shared per-connection state
//!
//! A [`Session`] owns the physical connection. [`crate::connection::Connection`],
//! cursors, bulk sessions and blob streams all hold a [`SessionHandle`] to
//! the same `Arc<Mutex<Session>>`; the generation stamp invalidates handles
//! once the logical connection is closed or the session returns to a pool.

use std::collections::HashSet;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};
use tracing::{info, warn};

use crate::driver::{DriverCapabilities, NativeConnection, ServerMessage};
use crate::error::{Error, Result, Severity};
use crate::handler::HandlerChain;

pub(crate) struct Session {
    pub(crate) id: u64,
    pub(crate) native: Box<dyn NativeConnection>,
    pub(crate) capabilities: DriverCapabilities,
    pub(crate) handlers: HandlerChain,
    pub(crate) pending: Option<Vec<Error>>,
    pub(crate) cursors: HashSet<String>,
    pub(crate) cancel: Arc<AtomicBool>,
    pub(crate) generation: u64,
    pub(crate) closed: bool,
}

impl Session {
    pub(crate) fn new(
        id: u64,
        native: Box<dyn NativeConnection>,
        capabilities: DriverCapabilities,
        cancel: Arc<AtomicBool>,
    ) -> Self {
        Self {
            id,
            native,
            capabilities,
            handlers: HandlerChain::default(),
            pending: None,
            cursors: HashSet::new(),
            cancel,
            generation: 0,
            closed: false,
        }
    }

    pub(crate) fn set_pending(&mut self, enabled: bool) {
        match (enabled, self.pending.is_some()) {
            (true, false) => self.pending = Some(Vec::new()),
            (false, true) => self.pending = None,
            _ => {}
        }
    }

    /// Close driver-side cursors and pending blob writes; bump the generation.
    pub(crate) fn retire(&mut self) {
        for name in std::mem::take(&mut self.cursors) {
            if let Err(e) = self.native.close_cursor(&name) {
                warn!(session = self.id, cursor = %name, error = %e, "Failed to close cursor");
            }
        }
        self.native.abort_blob_write();
        self.generation += 1;
        self.pending = None;
    }
}

pub(crate) type SharedSession = Arc<Mutex<Session>>;

/// A generation-checked reference to a session
#[derive(Clone)]
pub(crate) struct SessionHandle {
    shared: SharedSession,
    generation: u64,
}

impl SessionHandle {
    pub(crate) fn new(shared: SharedSession) -> Self {
        let generation = shared.lock().generation;
        Self { shared, generation }
    }

    pub(crate) fn shared(&self) -> &SharedSession {
        &self.shared
    }

    fn lock(&self) -> Result<MutexGuard<'_, Session>> {
        let session = self.shared.lock();
        if session.closed || session.generation != self.generation {
            return Err(Error::client("connection is closed"));
        }
        Ok(session)
    }

    /// Local bookkeeping; errors bypass the handler chain
    pub(crate) fn with<T>(&self, f: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let mut session = self.lock()?;
        f(&mut session)
    }

    fn run<T>(
        &self,
        op: impl FnOnce(&mut Session) -> Result<T>,
    ) -> Result<(Result<T>, Vec<Error>, HandlerChain)> {
        let mut session = self.lock()?;
        let result = op(&mut session);
        let messages: Vec<Error> = session
            .native
            .take_messages()
            .into_iter()
            .map(ServerMessage::into_error)
            .collect();
        if let Some(queue) = session.pending.as_mut() {
            queue.extend(messages.iter().map(Error::duplicate));
            if let Err(e) = &result {
                queue.push(e.duplicate());
            }
        }
        Ok((result, messages, session.handlers.clone()))
    }

    /// Driver call whose failure a handler may absorb (`Ok(None)`)
    pub(crate) fn call<T>(&self, op: impl FnOnce(&mut Session) -> Result<T>) -> Result<Option<T>> {
        let (result, messages, chain) = self.run(op)?;
        report_messages(&chain, messages);
        match result {
            Ok(v) => Ok(Some(v)),
            Err(e) if chain.dispatch(&e) => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Driver call whose failure always surfaces; handlers still observe it
    pub(crate) fn call_strict<T>(&self, op: impl FnOnce(&mut Session) -> Result<T>) -> Result<T> {
        let (result, messages, chain) = self.run(op)?;
        report_messages(&chain, messages);
        result.map_err(|e| {
            chain.dispatch(&e);
            e
        })
    }
}

fn report_messages(chain: &HandlerChain, messages: Vec<Error>) {
    for msg in messages {
        if chain.dispatch(&msg) {
            continue;
        }
        match msg.severity() {
            Severity::Info => info!(code = ?msg.code(), "Server message: {}", msg),
            _ => warn!(code = ?msg.code(), "Unhandled server message: {}", msg),
        }
    }
}
