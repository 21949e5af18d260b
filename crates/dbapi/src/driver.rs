//! Native driver interface
//!
//! Every backend implements two traits:
//! - [`Driver`]: a factory for physical connections, selected by name through
//!   the [`DriverRegistry`]
//! - [`NativeConnection`]: one physical connection, driven by exactly one
//!   thread at a time
//!
//! Optional capabilities (cursors, blob streams, bulk load) have default
//! implementations that report [`Error::Unsupported`]; [`DriverCapabilities`]
//! advertises which ones a backend overrides.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::blob::{BlobOptions, ItemDescriptor};
use crate::cursor::CursorSpec;
use crate::error::{Error, Result, Severity};
use crate::mapper::ServerRef;
use crate::params::ConnParams;
use crate::types::{ColumnMetadata, ColumnType, OverflowPolicy, Row, Value};

/// What a backend supports beyond plain statement execution
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DriverCapabilities {
    /// Server-side bulk load
    pub bulk_insert: bool,
    /// Positioned, updatable cursors
    pub cursors: bool,
    /// Incremental large-object streams
    pub blobs: bool,
    /// Bulk-load width overflow handling when a session does not override it
    pub overflow: OverflowPolicy,
}

impl Default for DriverCapabilities {
    fn default() -> Self {
        Self {
            bulk_insert: true,
            cursors: true,
            blobs: true,
            overflow: OverflowPolicy::default(),
        }
    }
}

impl DriverCapabilities {
    /// Statement execution only
    pub fn minimal() -> Self {
        Self {
            bulk_insert: false,
            cursors: false,
            blobs: false,
            overflow: OverflowPolicy::default(),
        }
    }

    /// Set bulk load support
    pub fn with_bulk_insert(mut self, enabled: bool) -> Self {
        self.bulk_insert = enabled;
        self
    }

    /// Set the default overflow policy
    pub fn with_overflow(mut self, overflow: OverflowPolicy) -> Self {
        self.overflow = overflow;
        self
    }
}

/// Settings handed to [`Driver::connect`]
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Bound on establishing the physical connection
    pub login_timeout: Option<Duration>,
    /// Initial statement timeout
    pub timeout: Option<Duration>,
    /// Raised by [`crate::connection::CancelHandle`]; drivers poll it while blocked
    pub cancel: Arc<AtomicBool>,
}

/// A message emitted by the server alongside (or instead of) a result
#[derive(Debug, Clone, PartialEq)]
pub struct ServerMessage {
    /// Message number
    pub code: i32,
    /// Severity class
    pub severity: Severity,
    /// Message state
    pub state: u8,
    /// Originating server
    pub server: String,
    /// Procedure name for RPC messages
    pub procedure: Option<String>,
    /// Line within the batch or procedure
    pub line: u32,
    /// Message text
    pub message: String,
}

impl ServerMessage {
    /// An informational message (e.g. from `PRINT`)
    pub fn info(server: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: 0,
            severity: Severity::Info,
            state: 1,
            server: server.into(),
            procedure: None,
            line: 1,
            message: message.into(),
        }
    }

    /// Convert into the matching [`Error`] variant
    pub fn into_error(self) -> Error {
        match self.procedure {
            Some(procedure) => Error::Rpc {
                code: self.code,
                severity: self.severity,
                server: self.server,
                procedure,
                line: self.line,
                message: self.message,
            },
            None => Error::from_server_message(
                self.code,
                self.severity,
                self.state,
                self.server,
                self.message,
            ),
        }
    }
}

/// One result set produced by a statement
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResultSet {
    /// Column descriptions
    pub columns: Vec<ColumnMetadata>,
    /// Row values in column order
    pub rows: Vec<Vec<Value>>,
}

impl ResultSet {
    /// Convert into named rows
    pub fn into_rows(self) -> Vec<Row> {
        let names: Vec<String> = self.columns.into_iter().map(|c| c.name).collect();
        self.rows
            .into_iter()
            .map(|values| Row::new(names.clone(), values))
            .collect()
    }
}

/// Result of executing a batch
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatementOutcome {
    /// Rows inserted, updated or deleted
    pub rows_affected: u64,
    /// Result sets in the order they were produced
    pub result_sets: Vec<ResultSet>,
    /// The batch was interrupted by a cancel request
    pub cancelled: bool,
}

/// A fetched cursor cell; large objects are described, not materialized
#[derive(Debug, Clone, PartialEq)]
pub enum Cell {
    /// Ordinary value
    Value(Value),
    /// Large-object cell; `len` is `None` for NULL
    Lob {
        /// Length in bytes
        len: Option<usize>,
    },
}

impl Cell {
    /// Whether the cell holds NULL
    pub fn is_null(&self) -> bool {
        match self {
            Cell::Value(v) => v.is_null(),
            Cell::Lob { len } => len.is_none(),
        }
    }
}

/// One row returned by [`NativeConnection::fetch`]
#[derive(Debug, Clone, PartialEq)]
pub struct FetchedRow {
    /// Stable identity of the row in its table
    pub row_id: u64,
    /// Per-cursor fetch counter; descriptors from earlier fetches go stale
    pub fetch_seq: u64,
    /// Cells in projection order
    pub cells: Vec<Cell>,
}

/// Shape of an opened cursor
#[derive(Debug, Clone, PartialEq)]
pub struct CursorInfo {
    /// Table the cursor reads (target of positioned statements)
    pub table: String,
    /// Projection
    pub columns: Vec<ColumnMetadata>,
}

/// A bound bulk-load column (1-based table position)
#[derive(Debug, Clone, PartialEq)]
pub struct BulkColumn {
    /// Position in the target table
    pub position: usize,
    /// Declared type of the binding
    pub column_type: ColumnType,
}

fn unsupported<T>(what: &str) -> Result<T> {
    Err(Error::unsupported(format!("{what} not supported by this driver")))
}

/// One physical connection
pub trait NativeConnection: Send {
    /// Name of the server this connection reached
    fn server_name(&self) -> &str;

    /// Current database
    fn database(&self) -> Option<String>;

    /// Execute a batch
    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutcome>;

    /// Start a transaction
    fn begin(&mut self) -> Result<()> {
        self.execute("BEGIN TRANSACTION", &[]).map(|_| ())
    }

    /// Commit the open transaction
    fn commit(&mut self) -> Result<()> {
        self.execute("COMMIT TRANSACTION", &[]).map(|_| ())
    }

    /// Roll back the open transaction
    fn rollback(&mut self) -> Result<()> {
        self.execute("ROLLBACK TRANSACTION", &[]).map(|_| ())
    }

    /// Switch the current database
    fn use_database(&mut self, database: &str) -> Result<()> {
        self.execute(&format!("USE {database}"), &[]).map(|_| ())
    }

    /// Open a named cursor
    fn open_cursor(&mut self, _spec: &CursorSpec) -> Result<CursorInfo> {
        unsupported("cursors")
    }

    /// Advance a cursor by one row
    fn fetch(&mut self, _cursor: &str) -> Result<Option<FetchedRow>> {
        unsupported("cursors")
    }

    /// Close a cursor
    fn close_cursor(&mut self, _cursor: &str) -> Result<()> {
        unsupported("cursors")
    }

    /// Load rows as one committed batch
    fn bulk_load(
        &mut self,
        _table: &str,
        _columns: &[BulkColumn],
        _rows: &[Vec<Value>],
    ) -> Result<u64> {
        unsupported("bulk insert")
    }

    /// Size of a large-object cell, `None` when NULL
    fn blob_size(&mut self, _item: &ItemDescriptor) -> Result<Option<usize>> {
        unsupported("blob streams")
    }

    /// Read part of a large-object cell; returns bytes copied (0 at end)
    fn read_blob(&mut self, _item: &ItemDescriptor, _offset: usize, _buf: &mut [u8]) -> Result<usize> {
        unsupported("blob streams")
    }

    /// Begin replacing a large-object cell with exactly `len` bytes
    fn begin_blob_write(
        &mut self,
        _item: &ItemDescriptor,
        _len: usize,
        _options: &BlobOptions,
    ) -> Result<()> {
        unsupported("blob streams")
    }

    /// Send the next chunk of the pending blob write
    fn write_blob_chunk(&mut self, _data: &[u8]) -> Result<()> {
        unsupported("blob streams")
    }

    /// Commit the pending blob write
    fn finish_blob_write(&mut self) -> Result<()> {
        unsupported("blob streams")
    }

    /// Discard the pending blob write, if any
    fn abort_blob_write(&mut self) {}

    /// Drain informational messages produced since the last call
    fn take_messages(&mut self) -> Vec<ServerMessage>;

    /// Abandon whatever the server is processing for this connection
    fn cancel(&mut self) -> Result<()> {
        Ok(())
    }

    /// Set the statement timeout
    fn set_timeout(&mut self, timeout: Option<Duration>);

    /// Cheap liveness probe
    fn is_alive(&mut self) -> bool;

    /// Return the connection to a clean state before pooling
    fn reset(&mut self) -> Result<()> {
        Ok(())
    }

    /// Close the physical connection
    fn close(&mut self) -> Result<()>;
}

/// A backend able to establish physical connections
pub trait Driver: Send + Sync {
    /// Registry key
    fn name(&self) -> &str;

    /// Supported optional features
    fn capabilities(&self) -> DriverCapabilities;

    /// Establish a physical connection to `server`
    fn connect(
        &self,
        server: &ServerRef,
        params: &ConnParams,
        options: &ConnectOptions,
    ) -> Result<Box<dyn NativeConnection>>;
}

/// Drivers keyed by (case-insensitive) name
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn Driver>>,
}

impl DriverRegistry {
    /// Empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the built-in drivers: `memory` (over the shared
    /// cluster) and, with the `sqlserver` feature, `tds`.
    pub fn with_defaults() -> Self {
        let registry =
            Self::new().with_driver(crate::memory::MemoryDriver::new(crate::memory::MemoryCluster::shared()));
        #[cfg(feature = "sqlserver")]
        let registry = registry.with_driver(crate::tds::TdsDriver::new());
        registry
    }

    /// Register a driver, replacing any driver of the same name
    pub fn register(&mut self, driver: Arc<dyn Driver>) {
        tracing::debug!(driver = driver.name(), "Registering driver");
        self.drivers
            .insert(driver.name().to_ascii_lowercase(), driver);
    }

    /// Builder form of [`Self::register`]
    pub fn with_driver(mut self, driver: impl Driver + 'static) -> Self {
        self.register(Arc::new(driver));
        self
    }

    /// Look up a driver
    pub fn get(&self, name: &str) -> Result<Arc<dyn Driver>> {
        self.drivers
            .get(&name.to_ascii_lowercase())
            .cloned()
            .ok_or_else(|| Error::data_source(format!("driver not found: {name}")))
    }

    /// Registered driver names, sorted
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.drivers.keys().cloned().collect();
        names.sort();
        names
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry")
            .field("drivers", &self.names())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_server_message_classification() {
        let msg = ServerMessage {
            code: 1205,
            severity: Severity::Error,
            state: 45,
            server: "SRV".into(),
            procedure: None,
            line: 3,
            message: "chosen as deadlock victim".into(),
        };
        assert!(matches!(msg.into_error(), Error::Deadlock { .. }));

        let rpc = ServerMessage {
            procedure: Some("sp_who".into()),
            code: 2812,
            ..ServerMessage::info("SRV", "not found")
        };
        assert!(matches!(rpc.into_error(), Error::Rpc { line: 1, .. }));
    }

    #[test]
    fn test_registry_lookup() {
        let registry = DriverRegistry::with_defaults();
        assert!(registry.get("memory").is_ok());
        assert!(registry.get("MEMORY").is_ok());

        let err = registry.get("ctlib").err().unwrap();
        assert!(matches!(err, Error::DataSource { .. }));
    }

    #[test]
    fn test_result_set_into_rows() {
        let rs = ResultSet {
            columns: vec![ColumnMetadata::new("id", ColumnType::Int)],
            rows: vec![vec![Value::Int32(1)], vec![Value::Int32(2)]],
        };
        let rows = rs.into_rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[1].get_by_name("id"), Some(&Value::Int32(2)));
    }

    #[test]
    fn test_cell_null() {
        assert!(Cell::Lob { len: None }.is_null());
        assert!(!Cell::Lob { len: Some(0) }.is_null());
        assert!(Cell::Value(Value::Null).is_null());
    }
}
