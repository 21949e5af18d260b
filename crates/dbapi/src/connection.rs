//! Logical connections
//!
//! A [`Connection`] is what callers hold: one physical session plus its
//! handler chain, pending-error queue and pool membership. It is single
//! owner; drive it from one thread at a time. The only cross-thread entry
//! point is [`CancelHandle`].
//!
//! Statement operations (`execute`, `query`, cursor fetches, bulk batches,
//! blob commits) return a neutral result when a handler absorbs their error.
//! Operations that hand out a new object or change session state (`open_cursor`,
//! `bulk_insert`, `use_database`, blob stream creation) always return the
//! error, after the handlers have seen it.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, warn};

use crate::blob::{BlobOptions, BlobReader, BlobWriter, ItemDescriptor};
use crate::bulk::{BulkInsert, BulkOptions};
use crate::context::ContextInner;
use crate::cursor::{Cursor, CursorSpec};
use crate::driver::{DriverCapabilities, StatementOutcome};
use crate::error::{Error, Result};
use crate::handler::{ErrorHandler, HandlerId};
use crate::params::ConnParams;
use crate::security::{validate_object_name, validate_sql_identifier};
use crate::session::SessionHandle;
use crate::types::{Row, Value};

/// Interrupts whatever the connection's server is processing
#[derive(Debug, Clone)]
pub struct CancelHandle {
    flag: Arc<AtomicBool>,
}

impl CancelHandle {
    pub(crate) fn new(flag: Arc<AtomicBool>) -> Self {
        Self { flag }
    }

    /// Request cancellation; safe to call repeatedly and from any thread
    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }
}

/// A validated connection handed out by a [`crate::context::DriverContext`]
pub struct Connection {
    id: u64,
    handle: SessionHandle,
    cancel: CancelHandle,
    params: ConnParams,
    server: String,
    capabilities: DriverCapabilities,
    context: Arc<ContextInner>,
    released: bool,
}

impl Connection {
    pub(crate) fn new(
        id: u64,
        handle: SessionHandle,
        cancel: CancelHandle,
        params: ConnParams,
        server: String,
        capabilities: DriverCapabilities,
        context: Arc<ContextInner>,
    ) -> Self {
        Self {
            id,
            handle,
            cancel,
            params,
            server,
            capabilities,
            context,
            released: false,
        }
    }

    /// Connection id (unique within the process)
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server this connection reached
    pub fn server_name(&self) -> &str {
        &self.server
    }

    /// Parameters the connection was made with
    pub fn params(&self) -> &ConnParams {
        &self.params
    }

    /// Pool the connection belongs to
    pub fn pool_name(&self) -> Option<&str> {
        self.params.pool_name()
    }

    /// Whether closing returns the connection to its pool
    pub fn is_reusable(&self) -> bool {
        self.params.reusable() && self.params.pool_name().is_some()
    }

    /// Driver capabilities
    pub fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    /// Current database
    pub fn database(&self) -> Result<Option<String>> {
        self.handle.with(|s| Ok(s.native.database()))
    }

    /// Run a batch and return everything it produced
    pub fn execute_batch(&self, sql: &str, params: &[Value]) -> Result<StatementOutcome> {
        let outcome = self.handle.call(|s| s.native.execute(sql, params))?;
        Ok(outcome.unwrap_or_default())
    }

    /// Run a statement; returns affected rows
    pub fn execute(&self, sql: &str, params: &[Value]) -> Result<u64> {
        self.execute_batch(sql, params).map(|o| o.rows_affected)
    }

    /// Run a query; returns the rows of its first result set
    pub fn query(&self, sql: &str, params: &[Value]) -> Result<Vec<Row>> {
        let outcome = self.execute_batch(sql, params)?;
        Ok(outcome
            .result_sets
            .into_iter()
            .next()
            .map(|rs| rs.into_rows())
            .unwrap_or_default())
    }

    /// First row of a query
    pub fn query_one(&self, sql: &str, params: &[Value]) -> Result<Option<Row>> {
        Ok(self.query(sql, params)?.into_iter().next())
    }

    /// Start a transaction
    pub fn begin(&self) -> Result<()> {
        self.handle.call(|s| s.native.begin()).map(|_| ())
    }

    /// Commit the open transaction
    pub fn commit(&self) -> Result<()> {
        self.handle.call(|s| s.native.commit()).map(|_| ())
    }

    /// Roll back the open transaction
    pub fn rollback(&self) -> Result<()> {
        self.handle.call(|s| s.native.rollback()).map(|_| ())
    }

    /// Switch the current database
    pub fn use_database(&self, database: &str) -> Result<()> {
        validate_sql_identifier(database)?;
        self.handle.call_strict(|s| s.native.use_database(database))
    }

    /// Statement timeout for this connection; `None` waits indefinitely
    pub fn set_timeout(&self, timeout: Option<Duration>) -> Result<()> {
        self.handle.with(|s| {
            s.native.set_timeout(timeout);
            Ok(())
        })
    }

    /// Handle for cancelling from another thread
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Cancel pending work on this connection; idempotent
    pub fn cancel(&self) -> Result<()> {
        self.cancel.cancel();
        self.handle.with(|s| s.native.cancel())
    }

    /// Liveness probe
    pub fn is_alive(&self) -> bool {
        self.handle
            .with(|s| Ok(s.native.is_alive()))
            .unwrap_or(false)
    }

    /// Turn the pending-error queue on or off (off discards queued errors)
    pub fn enable_pending_errors(&self, enabled: bool) -> Result<()> {
        self.handle.with(|s| {
            s.set_pending(enabled);
            Ok(())
        })
    }

    /// Drain queued errors and messages
    pub fn take_pending_errors(&self) -> Vec<Error> {
        self.handle
            .with(|s| Ok(s.pending.as_mut().map(std::mem::take).unwrap_or_default()))
            .unwrap_or_default()
    }

    /// Push a handler onto this connection's own stack (the stack owns it)
    pub fn push_handler_owned(&self, handler: impl ErrorHandler + 'static) -> Result<HandlerId> {
        self.handle.with(|s| Ok(s.handlers.own.push_owned(handler)))
    }

    /// Push a caller-owned handler onto this connection's own stack
    pub fn push_handler_borrowed<H: ErrorHandler + 'static>(&self, handler: &Arc<H>) -> Result<HandlerId> {
        self.handle.with(|s| Ok(s.handlers.own.push_borrowed(handler)))
    }

    /// Remove a handler from this connection's own stack
    pub fn remove_handler(&self, id: HandlerId) -> Result<bool> {
        self.handle.with(|s| Ok(s.handlers.own.remove(id)))
    }

    /// Open a named cursor
    pub fn open_cursor(&self, spec: CursorSpec) -> Result<Cursor> {
        if !self.capabilities.cursors {
            return Err(Error::unsupported("cursors not supported by this driver"));
        }
        validate_sql_identifier(spec.name())?;
        let name = spec.name().to_string();
        self.handle.with(|s| {
            if s.cursors.contains(&name) {
                return Err(Error::client(format!("cursor '{name}' is already open")));
            }
            Ok(())
        })?;
        let info = self.handle.call_strict(|s| {
            let info = s.native.open_cursor(&spec)?;
            s.cursors.insert(name.clone());
            Ok(info)
        })?;
        Ok(Cursor::new(self.handle.clone(), name, info))
    }

    /// Start a bulk insert into `table`
    pub fn bulk_insert(&self, table: &str, options: BulkOptions) -> Result<BulkInsert> {
        if !self.capabilities.bulk_insert {
            return Err(Error::unsupported("bulk insert not supported by this driver"));
        }
        validate_object_name(table)?;
        Ok(BulkInsert::new(
            self.handle.clone(),
            table.to_string(),
            self.capabilities.overflow,
            options,
        ))
    }

    /// Size of a large-object cell, `None` when NULL
    pub fn blob_size(&self, item: &ItemDescriptor) -> Result<Option<usize>> {
        self.handle.call_strict(|s| s.native.blob_size(item))
    }

    /// Read a whole large-object cell, `None` when NULL
    pub fn read_blob(&self, item: &ItemDescriptor) -> Result<Option<Vec<u8>>> {
        let Some(size) = self.blob_size(item)? else {
            return Ok(None);
        };
        let mut bytes = Vec::with_capacity(size);
        std::io::Read::read_to_end(&mut self.blob_reader(item)?, &mut bytes)
            .map_err(|e| Error::data_source(format!("blob read failed: {e}")))?;
        Ok(Some(bytes))
    }

    /// Stream a large-object cell
    pub fn blob_reader(&self, item: &ItemDescriptor) -> Result<BlobReader> {
        self.ensure_blobs()?;
        Ok(BlobReader::new(self.handle.clone(), item.clone()))
    }

    /// Replace a large-object cell with exactly `len` bytes
    pub fn blob_writer(
        &self,
        item: &ItemDescriptor,
        len: usize,
        options: BlobOptions,
    ) -> Result<BlobWriter> {
        self.ensure_blobs()?;
        BlobWriter::open(self.handle.clone(), item.clone(), len, options)
    }

    fn ensure_blobs(&self) -> Result<()> {
        if self.capabilities.blobs {
            Ok(())
        } else {
            Err(Error::unsupported("blob streams not supported by this driver"))
        }
    }

    /// Close: reusable connections go back to their pool, others are destroyed
    pub fn close(mut self) -> Result<()> {
        self.release(false)
    }

    /// Destroy the physical connection even if it is reusable
    pub fn discard(mut self) -> Result<()> {
        self.release(true)
    }

    fn release(&mut self, discard: bool) -> Result<()> {
        if self.released {
            return Ok(());
        }
        self.released = true;
        let reusable = !discard && self.is_reusable();
        debug!(connection = self.id, server = %self.server, reusable, "Releasing connection");
        self.context
            .release(self.handle.shared(), &self.params, &self.server, reusable)
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        if let Err(e) = self.release(false) {
            warn!(connection = self.id, error = %e, "Error closing connection");
        }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("server", &self.server)
            .field("pool", &self.pool_name())
            .field("reusable", &self.is_reusable())
            .finish()
    }
}
