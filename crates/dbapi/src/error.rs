//! Error types for dbapi
//!
//! Every failure a native driver can produce surfaces as one [`Error`]:
//! - Server errors (the backend rejected a statement), with RPC, deadlock
//!   and timeout subtypes
//! - Client errors (usage violations detected locally, no round-trip)
//! - Data-source errors (driver registry / context failures)
//! - Multi errors (several messages for one logical operation)

use std::fmt;
use thiserror::Error;

/// Result type for dbapi operations
pub type Result<T> = std::result::Result<T, Error>;

/// Server error code reported when a transaction is chosen as deadlock victim
pub const DEADLOCK_VICTIM_CODE: i32 = 1205;

/// Server error code for "string or binary data would be truncated"
pub const TRUNCATION_CODE: i32 = 8152;

/// Server error code for a lock request timeout
pub const LOCK_TIMEOUT_CODE: i32 = 1222;

/// Message severity, ordered from least to most severe
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub enum Severity {
    /// Informational message (PRINT output, status messages)
    #[default]
    Info,
    /// Warning; the statement completed
    Warning,
    /// Statement-level error
    Error,
    /// Connection-level failure; the connection is no longer usable
    Fatal,
}

impl Severity {
    /// Map a TDS severity class (0-25) onto [`Severity`]
    pub fn from_class(class: u8) -> Self {
        match class {
            0..=9 => Self::Info,
            10 => Self::Warning,
            11..=19 => Self::Error,
            _ => Self::Fatal,
        }
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
            Self::Fatal => write!(f, "fatal"),
        }
    }
}

/// Error categories for classification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCategory {
    /// Backend rejected or failed a statement
    Server,
    /// Local usage violation
    Client,
    /// Driver load / context failure
    DataSource,
    /// A physical connect attempt failed (I/O, login)
    Connection,
    /// Operation timed out (retriable)
    Timeout,
    /// Deadlock detected (retriable)
    Deadlock,
    /// Configuration error
    Configuration,
    /// Type conversion errors
    TypeConversion,
    /// Several errors aggregated
    Multi,
    /// Unknown/other errors
    Other,
}

impl ErrorCategory {
    /// Whether errors in this category are generally retriable
    #[inline]
    pub const fn is_retriable(self) -> bool {
        matches!(self, Self::Connection | Self::Timeout | Self::Deadlock)
    }
}

/// Main error type for dbapi
#[derive(Error, Debug)]
#[allow(missing_docs)]
pub enum Error {
    /// The server rejected or failed a statement
    #[error("server error {code} (severity {severity}) on {server}: {message}")]
    Server {
        code: i32,
        severity: Severity,
        state: u8,
        server: String,
        message: String,
    },

    /// Error raised inside a stored procedure
    #[error("rpc error {code} in {procedure} line {line} on {server}: {message}")]
    Rpc {
        code: i32,
        severity: Severity,
        server: String,
        procedure: String,
        line: u32,
        message: String,
    },

    /// Deadlock detected; the statement was rolled back by the server
    #[error("deadlock detected on {server}: {message}")]
    Deadlock { server: String, message: String },

    /// Operation timed out
    #[error("timeout: {message}")]
    Timeout { message: String },

    /// Usage violation detected locally
    #[error("client error: {message}")]
    Client { message: String },

    /// The global connection ceiling would be exceeded
    #[error("connection ceiling of {limit} reached")]
    CeilingExceeded { limit: usize },

    /// Driver load or context creation failed
    #[error("data source error: {message}")]
    DataSource { message: String },

    /// A physical connect attempt failed
    #[error("connection error: {message}")]
    Connection {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Several errors reported for one logical operation
    #[error("{0}")]
    Multi(MultiError),

    /// Configuration error
    #[error("configuration error: {message}")]
    Configuration { message: String },

    /// Type conversion failed
    #[error("type conversion error: {message}")]
    TypeConversion { message: String },

    /// Unsupported operation for this driver
    #[error("unsupported: {message}")]
    Unsupported { message: String },

    /// Internal error
    #[error("internal error: {message}")]
    Internal { message: String },
}

impl Error {
    /// Get the error category
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Server { .. } | Self::Rpc { .. } => ErrorCategory::Server,
            Self::Deadlock { .. } => ErrorCategory::Deadlock,
            Self::Timeout { .. } => ErrorCategory::Timeout,
            Self::Client { .. } | Self::CeilingExceeded { .. } => ErrorCategory::Client,
            Self::DataSource { .. } => ErrorCategory::DataSource,
            Self::Connection { .. } => ErrorCategory::Connection,
            Self::Multi(_) => ErrorCategory::Multi,
            Self::Configuration { .. } => ErrorCategory::Configuration,
            Self::TypeConversion { .. } => ErrorCategory::TypeConversion,
            Self::Unsupported { .. } | Self::Internal { .. } => ErrorCategory::Other,
        }
    }

    /// Whether this error is retriable
    #[inline]
    pub fn is_retriable(&self) -> bool {
        self.category().is_retriable()
    }

    /// Whether the error originated on the server
    pub fn is_server(&self) -> bool {
        matches!(
            self,
            Self::Server { .. } | Self::Rpc { .. } | Self::Deadlock { .. } | Self::Timeout { .. }
        )
    }

    /// Whether the error is a local usage violation
    pub fn is_client(&self) -> bool {
        self.category() == ErrorCategory::Client
    }

    /// Severity of the error.
    ///
    /// Non-server errors are always [`Severity::Error`]; a [`MultiError`]
    /// reports its most severe member.
    pub fn severity(&self) -> Severity {
        match self {
            Self::Server { severity, .. } | Self::Rpc { severity, .. } => *severity,
            Self::Multi(multi) => multi.severity(),
            _ => Severity::Error,
        }
    }

    /// Server-assigned message number, if any
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Server { code, .. } | Self::Rpc { code, .. } => Some(*code),
            Self::Deadlock { .. } => Some(DEADLOCK_VICTIM_CODE),
            _ => None,
        }
    }

    /// Classify a raw server message into the matching error variant
    pub fn from_server_message(
        code: i32,
        severity: Severity,
        state: u8,
        server: impl Into<String>,
        message: impl Into<String>,
    ) -> Self {
        let server = server.into();
        let message = message.into();
        match code {
            DEADLOCK_VICTIM_CODE => Self::Deadlock { server, message },
            LOCK_TIMEOUT_CODE => Self::Timeout {
                message: format!("{server}: {message}"),
            },
            _ => Self::Server {
                code,
                severity,
                state,
                server,
                message,
            },
        }
    }

    /// Create a server error
    pub fn server(code: i32, severity: Severity, message: impl Into<String>) -> Self {
        Self::Server {
            code,
            severity,
            state: 1,
            server: String::new(),
            message: message.into(),
        }
    }

    /// Create a client (usage) error
    pub fn client(message: impl Into<String>) -> Self {
        Self::Client {
            message: message.into(),
        }
    }

    /// Create a data source error
    pub fn data_source(message: impl Into<String>) -> Self {
        Self::DataSource {
            message: message.into(),
        }
    }

    /// Create a connection error
    pub fn connection(message: impl Into<String>) -> Self {
        Self::Connection {
            message: message.into(),
            source: None,
        }
    }

    /// Create a connection error with source
    pub fn connection_with_source(
        message: impl Into<String>,
        source: impl std::error::Error + Send + Sync + 'static,
    ) -> Self {
        Self::Connection {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a timeout error
    pub fn timeout(message: impl Into<String>) -> Self {
        Self::Timeout {
            message: message.into(),
        }
    }

    /// Create a configuration error
    pub fn config(message: impl Into<String>) -> Self {
        Self::Configuration {
            message: message.into(),
        }
    }

    /// Create a type conversion error
    pub fn type_conversion(message: impl Into<String>) -> Self {
        Self::TypeConversion {
            message: message.into(),
        }
    }

    /// Create an unsupported operation error
    pub fn unsupported(message: impl Into<String>) -> Self {
        Self::Unsupported {
            message: message.into(),
        }
    }

    /// Create an internal error
    pub fn internal(message: impl Into<String>) -> Self {
        Self::Internal {
            message: message.into(),
        }
    }

    /// Return a copy of this error suitable for a second reporting path.
    ///
    /// The `source` chain of connection errors is flattened into the message.
    pub fn duplicate(&self) -> Self {
        match self {
            Self::Server {
                code,
                severity,
                state,
                server,
                message,
            } => Self::Server {
                code: *code,
                severity: *severity,
                state: *state,
                server: server.clone(),
                message: message.clone(),
            },
            Self::Rpc {
                code,
                severity,
                server,
                procedure,
                line,
                message,
            } => Self::Rpc {
                code: *code,
                severity: *severity,
                server: server.clone(),
                procedure: procedure.clone(),
                line: *line,
                message: message.clone(),
            },
            Self::Deadlock { server, message } => Self::Deadlock {
                server: server.clone(),
                message: message.clone(),
            },
            Self::Timeout { message } => Self::timeout(message.clone()),
            Self::Client { message } => Self::client(message.clone()),
            Self::CeilingExceeded { limit } => Self::CeilingExceeded { limit: *limit },
            Self::DataSource { message } => Self::data_source(message.clone()),
            Self::Connection { message, source } => match source {
                Some(src) => Self::connection(format!("{message}: {src}")),
                None => Self::connection(message.clone()),
            },
            Self::Multi(multi) => Self::Multi(MultiError {
                errors: multi.errors.iter().map(Error::duplicate).collect(),
            }),
            Self::Configuration { message } => Self::config(message.clone()),
            Self::TypeConversion { message } => Self::type_conversion(message.clone()),
            Self::Unsupported { message } => Self::unsupported(message.clone()),
            Self::Internal { message } => Self::internal(message.clone()),
        }
    }
}

impl fmt::Display for ErrorCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Server => write!(f, "server"),
            Self::Client => write!(f, "client"),
            Self::DataSource => write!(f, "data_source"),
            Self::Connection => write!(f, "connection"),
            Self::Timeout => write!(f, "timeout"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Configuration => write!(f, "configuration"),
            Self::TypeConversion => write!(f, "type_conversion"),
            Self::Multi => write!(f, "multi"),
            Self::Other => write!(f, "other"),
        }
    }
}

/// Aggregate of the errors reported for one logical operation
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty aggregate
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an error
    pub fn push(&mut self, error: Error) {
        self.errors.push(error);
    }

    /// Number of collected errors
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Whether no errors were collected
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Collected errors in arrival order
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Consume the aggregate
    pub fn into_errors(self) -> Vec<Error> {
        self.errors
    }

    /// Most severe member; informational when empty
    pub fn severity(&self) -> Severity {
        self.errors
            .iter()
            .map(Error::severity)
            .max()
            .unwrap_or(Severity::Info)
    }
}

impl From<Vec<Error>> for MultiError {
    fn from(errors: Vec<Error>) -> Self {
        Self { errors }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} error(s)", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            write!(f, "{}{}", if i == 0 { ": " } else { "; " }, err)?;
        }
        Ok(())
    }
}
