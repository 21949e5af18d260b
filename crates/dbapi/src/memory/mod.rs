//! In-process simulated servers
//!
//! The `memory` driver connects to [`MemoryServer`]s registered in a
//! [`MemoryCluster`]. Servers keep their tables in process memory and
//! execute a small T-SQL subset, which makes them the backend for tests and
//! examples that need failover, pooling, bulk copy or blob streaming without
//! a network.
//!
//! Each server has a [`ServerType`] flavor that controls the behaviors which
//! differ between the TDS server families:
//!
//! | behavior                         | `Sybase`         | `MsSql`              |
//! |----------------------------------|------------------|----------------------|
//! | empty string in a character cell | stored as `' '`  | stored as `''`       |
//! | column nullability when omitted  | `NOT NULL`       | `NULL`               |
//! | INSERT longer than column width  | truncated        | error 8152           |
//!
//! ```rust
//! use dbapi::memory::{MemoryCluster, MemoryServer, ServerType};
//!
//! let cluster = MemoryCluster::new();
//! let srv = cluster.add_server(
//!     MemoryServer::new("PRIMARY", ServerType::MsSql)
//!         .with_login("app", "secret")
//!         .with_database("orders"),
//! );
//! srv.set_online(false);
//! assert!(!cluster.server("primary").unwrap().is_online());
//! ```

mod engine;
mod sql;

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::driver::{ConnectOptions, Driver, DriverCapabilities, NativeConnection, ServerMessage};
use crate::error::{Error, Result, Severity};
use crate::mapper::ServerRef;
use crate::params::ConnParams;
use crate::types::{ColumnType, Value};

use engine::MemoryConnection;

/// Database every server starts with and connections default to
pub const DEFAULT_DATABASE: &str = "master";

/// Server family a [`MemoryServer`] imitates
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ServerType {
    /// Sybase ASE
    Sybase,
    /// Microsoft SQL Server
    MsSql,
}

impl ServerType {
    /// What an empty string reads back as from a character column
    pub fn stored_empty_string(&self) -> &'static str {
        match self {
            Self::Sybase => " ",
            Self::MsSql => "",
        }
    }

    /// Nullability of a column declared without `NULL` / `NOT NULL`
    pub fn default_nullable(&self) -> bool {
        matches!(self, Self::MsSql)
    }

    /// Whether a plain INSERT silently truncates over-wide values
    pub fn truncates_on_insert(&self) -> bool {
        matches!(self, Self::Sybase)
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Sybase => write!(f, "sybase"),
            Self::MsSql => write!(f, "mssql"),
        }
    }
}

#[derive(Debug, Clone)]
pub(crate) struct Column {
    pub(crate) name: String,
    pub(crate) column_type: ColumnType,
    pub(crate) nullable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct Table {
    pub(crate) name: String,
    pub(crate) columns: Vec<Column>,
    pub(crate) rows: BTreeMap<u64, Vec<Value>>,
    next_row_id: u64,
}

impl Table {
    pub(crate) fn new(name: String, columns: Vec<Column>) -> Self {
        Self {
            name,
            columns,
            rows: BTreeMap::new(),
            next_row_id: 1,
        }
    }

    pub(crate) fn column_index(&self, name: &str) -> Option<usize> {
        self.columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
    }

    pub(crate) fn insert(&mut self, values: Vec<Value>) -> u64 {
        let id = self.next_row_id;
        self.next_row_id += 1;
        self.rows.insert(id, values);
        id
    }
}

#[derive(Debug, Clone, Default)]
pub(crate) struct Database {
    /// Keyed by lowercase table name
    pub(crate) tables: HashMap<String, Table>,
}

/// Databases keyed by lowercase name
pub(crate) type Catalog = HashMap<String, Database>;

/// A simulated server
pub struct MemoryServer {
    name: String,
    server_type: ServerType,
    online: AtomicBool,
    logins: RwLock<HashMap<String, String>>,
    pub(crate) catalog: Mutex<Catalog>,
    open: AtomicUsize,
    connects: AtomicU64,
}

impl MemoryServer {
    /// An online server with only the `master` database and no login checks
    pub fn new(name: impl Into<String>, server_type: ServerType) -> Self {
        let mut catalog = Catalog::new();
        catalog.insert(DEFAULT_DATABASE.to_string(), Database::default());
        Self {
            name: name.into(),
            server_type,
            online: AtomicBool::new(true),
            logins: RwLock::new(HashMap::new()),
            catalog: Mutex::new(catalog),
            open: AtomicUsize::new(0),
            connects: AtomicU64::new(0),
        }
    }

    /// Require a login; once any login is added, unknown users are refused
    pub fn with_login(mut self, user: impl Into<String>, password: impl Into<String>) -> Self {
        self.logins.get_mut().insert(user.into(), password.into());
        self
    }

    /// Add a database
    pub fn with_database(self, name: &str) -> Self {
        self.create_database(name);
        self
    }

    /// Server name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Server flavor
    pub fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Whether the server accepts connections and statements
    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::SeqCst)
    }

    /// Take the server down or bring it back; existing connections stop
    /// answering while it is down
    pub fn set_online(&self, online: bool) {
        debug!(server = %self.name, online, "Memory server state changed");
        self.online.store(online, Ordering::SeqCst);
    }

    /// Create a database if it does not exist
    pub fn create_database(&self, name: &str) {
        self.catalog
            .lock()
            .entry(name.to_ascii_lowercase())
            .or_default();
    }

    /// Whether a database exists
    pub fn has_database(&self, name: &str) -> bool {
        self.catalog.lock().contains_key(&name.to_ascii_lowercase())
    }

    /// Rows in a table, `None` when the table does not exist
    pub fn row_count(&self, database: &str, table: &str) -> Option<usize> {
        self.catalog
            .lock()
            .get(&database.to_ascii_lowercase())?
            .tables
            .get(&table.to_ascii_lowercase())
            .map(|t| t.rows.len())
    }

    /// Physical connections currently open
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Physical connections ever accepted
    pub fn total_connects(&self) -> u64 {
        self.connects.load(Ordering::SeqCst)
    }

    fn authenticate(&self, user: Option<&str>, password: Option<&str>) -> Result<()> {
        let logins = self.logins.read();
        if logins.is_empty() {
            return Ok(());
        }
        let user = user.unwrap_or_default();
        match logins.get(user) {
            Some(expected) if Some(expected.as_str()) == password => Ok(()),
            _ => Err(Error::connection(format!(
                "Login failed for user '{}' on server {}",
                user, self.name
            ))),
        }
    }

    pub(crate) fn connection_opened(&self) {
        self.open.fetch_add(1, Ordering::SeqCst);
        self.connects.fetch_add(1, Ordering::SeqCst);
    }

    pub(crate) fn connection_closed(&self) {
        self.open.fetch_sub(1, Ordering::SeqCst);
    }

    /// Error as this server reports it
    pub(crate) fn error(&self, code: i32, class: u8, message: impl Into<String>) -> Error {
        self.message(code, class, message).into_error()
    }

    pub(crate) fn message(&self, code: i32, class: u8, message: impl Into<String>) -> ServerMessage {
        ServerMessage {
            code,
            severity: Severity::from_class(class),
            state: 1,
            server: self.name.clone(),
            procedure: None,
            line: 1,
            message: message.into(),
        }
    }
}

impl fmt::Debug for MemoryServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryServer")
            .field("name", &self.name)
            .field("server_type", &self.server_type)
            .field("online", &self.is_online())
            .field("open_connections", &self.open_connections())
            .finish()
    }
}

/// Named simulated servers; clones share the same servers
#[derive(Debug, Clone, Default)]
pub struct MemoryCluster {
    servers: Arc<RwLock<HashMap<String, Arc<MemoryServer>>>>,
}

impl MemoryCluster {
    /// Empty cluster
    pub fn new() -> Self {
        Self::default()
    }

    /// Process-wide cluster used by [`crate::driver::DriverRegistry::with_defaults`]
    pub fn shared() -> Self {
        static SHARED: OnceLock<MemoryCluster> = OnceLock::new();
        SHARED.get_or_init(MemoryCluster::new).clone()
    }

    /// Register a server, replacing one with the same (case-insensitive) name
    pub fn add_server(&self, server: MemoryServer) -> Arc<MemoryServer> {
        let server = Arc::new(server);
        self.servers
            .write()
            .insert(server.name.to_ascii_lowercase(), Arc::clone(&server));
        server
    }

    /// Look up a server
    pub fn server(&self, name: &str) -> Option<Arc<MemoryServer>> {
        self.servers.read().get(&name.to_ascii_lowercase()).cloned()
    }

    /// Unregister a server; open connections to it keep working
    pub fn remove_server(&self, name: &str) -> Option<Arc<MemoryServer>> {
        self.servers.write().remove(&name.to_ascii_lowercase())
    }

    /// Registered server names, sorted
    pub fn server_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.servers.read().values().map(|s| s.name.clone()).collect();
        names.sort();
        names
    }
}

/// Driver connecting to a [`MemoryCluster`]
#[derive(Debug, Clone)]
pub struct MemoryDriver {
    cluster: MemoryCluster,
    capabilities: DriverCapabilities,
}

impl MemoryDriver {
    /// Driver over `cluster` with every capability enabled
    pub fn new(cluster: MemoryCluster) -> Self {
        Self {
            cluster,
            capabilities: DriverCapabilities::default(),
        }
    }

    /// Advertise different capabilities
    pub fn with_capabilities(mut self, capabilities: DriverCapabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Cluster this driver connects to
    pub fn cluster(&self) -> &MemoryCluster {
        &self.cluster
    }
}

impl Driver for MemoryDriver {
    fn name(&self) -> &str {
        "memory"
    }

    fn capabilities(&self) -> DriverCapabilities {
        self.capabilities
    }

    fn connect(
        &self,
        server: &ServerRef,
        params: &ConnParams,
        options: &ConnectOptions,
    ) -> Result<Box<dyn NativeConnection>> {
        let target = self
            .cluster
            .server(&server.name)
            .ok_or_else(|| Error::connection(format!("server {} not found", server.name)))?;
        if !target.is_online() {
            return Err(Error::connection(format!(
                "server {} is not accepting connections",
                target.name
            )));
        }
        target.authenticate(
            params.user(),
            params.password().map(|p| p.expose_secret()),
        )?;

        let database = params.database().unwrap_or(DEFAULT_DATABASE);
        if !target.has_database(database) {
            return Err(Error::connection(format!(
                "Cannot open database \"{}\" requested by the login on server {}",
                database, target.name
            )));
        }

        debug!(server = %target.name, database, "Memory connection established");
        Ok(Box::new(MemoryConnection::new(target, database, options)))
    }
}
