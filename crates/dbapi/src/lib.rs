//! # dbapi
//!
//! Synchronous database access layer for TDS-family servers (Sybase ASE,
//! Microsoft SQL Server) with a pluggable driver model.
//!
//! ## Features
//!
//! - **Connection parameters**: layered [`params::ConnParams`] parsed from URLs,
//!   ODBC-style strings or the environment, with secret passwords
//! - **Service mapping**: logical service names resolved to candidate servers
//!   by priority, random or single-server [`mapper::ServiceMapper`]s
//! - **Failover**: [`factory::ConnectionFactory`] walks candidates, validates
//!   each connection and reports every failure when none qualifies
//! - **Driver context**: connection ceiling, named pools and scoped
//!   [`handler::ErrorHandler`] stacks in [`context::DriverContext`]
//! - **Bulk copy**: late-bound, batched [`bulk::BulkInsert`] with overflow
//!   policies and cancellation
//! - **Cursors and blobs**: updatable named cursors and incremental
//!   large-object streams addressed by [`blob::ItemDescriptor`]
//! - **In-memory servers**: the [`memory`] driver simulates both server
//!   families for tests and examples
//!
//! ## Quick Start
//!
//! ```rust
//! use dbapi::prelude::*;
//! use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
//! use std::sync::Arc;
//!
//! # fn main() -> dbapi::Result<()> {
//! let cluster = MemoryCluster::new();
//! cluster.add_server(MemoryServer::new("PRIMARY", ServerType::MsSql));
//! cluster.add_server(MemoryServer::new("STANDBY", ServerType::MsSql));
//! cluster.server("PRIMARY").unwrap().set_online(false);
//!
//! let ctx = DriverContext::new(
//!     DriverRegistry::new().with_driver(MemoryDriver::new(cluster)),
//!     "memory",
//!     ContextConfig::default(),
//! )?;
//! let mapper = PriorityMapper::new()
//!     .with("orders", ServerRef::new("PRIMARY"))
//!     .with("orders", ServerRef::new("STANDBY"));
//! let factory = ConnectionFactory::new(ctx, Arc::new(mapper), Arc::new(TrivialValidator));
//!
//! let conn = factory.connect(&ConnParams::new().with_server("orders"))?;
//! assert_eq!(conn.server_name(), "STANDBY");
//!
//! conn.execute("CREATE TABLE t (id INT)", &[])?;
//! conn.execute("INSERT INTO t VALUES (?)", &[Value::Int32(7)])?;
//! let rows = conn.query("SELECT id FROM t", &[])?;
//! assert_eq!(rows[0].get(0), Some(&Value::Int32(7)));
//! # Ok(())
//! # }
//! ```
//!
//! ## Feature Flags
//!
//! - `sqlserver` - SQL Server driver (`tds`) via tiberius
//! - `full` - All features enabled

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_code)]

pub mod blob;
pub mod bulk;
pub mod connection;
pub mod context;
pub mod cursor;
pub mod driver;
pub mod error;
pub mod factory;
pub mod handler;
pub mod mapper;
pub mod memory;
pub mod params;
pub mod security;
mod session;
pub mod types;
pub mod validator;

// Backend implementations (conditionally compiled)
#[cfg(feature = "sqlserver")]
pub mod tds;

/// Prelude module for convenient imports
pub mod prelude {
    // Error types
    pub use crate::error::{Error, ErrorCategory, MultiError, Result, Severity};

    // Value and type system
    pub use crate::types::{
        ColumnMetadata, ColumnType, OverflowAction, OverflowPolicy, Row, StringNullPolicy, Value,
    };

    // Parameters and service resolution
    pub use crate::mapper::{PriorityMapper, RandomMapper, ServerRef, ServiceMapper, SingleServerMapper};
    pub use crate::params::{ConnParams, SensitiveString};

    // Drivers
    pub use crate::driver::{Driver, DriverCapabilities, DriverRegistry, NativeConnection};

    // Context, pools and connections
    pub use crate::connection::{CancelHandle, Connection};
    pub use crate::context::{ContextConfig, DriverContext, HandlerScope, PoolStats};
    pub use crate::factory::{ConnectionFactory, DispatchMode, FactoryConfig};
    pub use crate::validator::{
        ConnValidator, DatabaseValidator, FnValidator, QueryValidator, TrivialValidator, Verdict,
    };

    // Error handlers
    pub use crate::handler::{
        CollectingHandler, ErrorHandler, FnHandler, HandlerId, LoggingHandler, SeverityFilter,
        SilentHandler,
    };

    // Bulk copy, cursors and blobs
    pub use crate::blob::{BlobOptions, BlobReader, BlobWriter, ItemDescriptor};
    pub use crate::bulk::{BulkInsert, BulkOptions, BulkState};
    pub use crate::cursor::{Cursor, CursorSpec};
}

// Re-export commonly used items at crate root
pub use error::{Error, Result};
pub use types::Value;
