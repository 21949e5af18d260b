//! Post-connect validation
//!
//! A [`ConnValidator`] inspects a freshly established connection and returns
//! a [`Verdict`]. Errors raised while validating are classified separately
//! through [`ConnValidator::validate_error`], so "validation failed" and
//! "validation could not run" can lead to different failover decisions.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::connection::Connection;
use crate::error::{Error, ErrorCategory, Result};

/// Outcome of validating a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verdict {
    /// Use the connection
    Valid,
    /// Discard the connection, try the next candidate
    TemporarilyInvalid,
    /// Discard the connection and skip this server for the rest of the request
    PermanentlyInvalid,
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Valid => write!(f, "valid"),
            Verdict::TemporarilyInvalid => write!(f, "temporarily_invalid"),
            Verdict::PermanentlyInvalid => write!(f, "permanently_invalid"),
        }
    }
}

/// Checks connections before the factory hands them out
pub trait ConnValidator: Send + Sync {
    /// Inspect a connection
    fn validate(&self, conn: &Connection) -> Result<Verdict>;

    /// Classify an error raised by [`Self::validate`]
    fn validate_error(&self, _error: &Error) -> Verdict {
        Verdict::TemporarilyInvalid
    }

    /// Validator name for logs
    fn name(&self) -> &str {
        "validator"
    }
}

/// Accepts every connection
#[derive(Debug, Default, Clone, Copy)]
pub struct TrivialValidator;

impl ConnValidator for TrivialValidator {
    fn validate(&self, _conn: &Connection) -> Result<Verdict> {
        Ok(Verdict::Valid)
    }

    fn name(&self) -> &str {
        "trivial"
    }
}

/// Valid when the connection can switch to a database
#[derive(Debug, Clone)]
pub struct DatabaseValidator {
    database: String,
}

impl DatabaseValidator {
    /// Validator for `database`
    pub fn new(database: impl Into<String>) -> Self {
        Self {
            database: database.into(),
        }
    }
}

impl ConnValidator for DatabaseValidator {
    fn validate(&self, conn: &Connection) -> Result<Verdict> {
        conn.use_database(&self.database)?;
        Ok(Verdict::Valid)
    }

    /// A missing database will not appear by retrying the same server
    fn validate_error(&self, error: &Error) -> Verdict {
        match error.category() {
            ErrorCategory::Server | ErrorCategory::Client => Verdict::PermanentlyInvalid,
            _ => Verdict::TemporarilyInvalid,
        }
    }

    fn name(&self) -> &str {
        "database"
    }
}

/// Valid when a probe query succeeds (and, optionally, returns a row)
#[derive(Debug, Clone)]
pub struct QueryValidator {
    sql: String,
    require_row: bool,
}

impl QueryValidator {
    /// Probe with `sql`
    pub fn new(sql: impl Into<String>) -> Self {
        Self {
            sql: sql.into(),
            require_row: false,
        }
    }

    /// Treat an empty result as temporarily invalid
    pub fn require_row(mut self) -> Self {
        self.require_row = true;
        self
    }
}

impl ConnValidator for QueryValidator {
    fn validate(&self, conn: &Connection) -> Result<Verdict> {
        let rows = conn.query(&self.sql, &[])?;
        if self.require_row && rows.is_empty() {
            return Ok(Verdict::TemporarilyInvalid);
        }
        Ok(Verdict::Valid)
    }

    fn name(&self) -> &str {
        "query"
    }
}

/// Validator from closures
pub struct FnValidator<F, C = fn(&Error) -> Verdict> {
    name: String,
    check: F,
    classify: C,
}

fn classify_temporary(_: &Error) -> Verdict {
    Verdict::TemporarilyInvalid
}

impl<F> FnValidator<F>
where
    F: Fn(&Connection) -> Result<Verdict> + Send + Sync,
{
    /// Wrap a check; its errors classify as temporarily invalid
    pub fn new(name: impl Into<String>, check: F) -> Self {
        Self {
            name: name.into(),
            check,
            classify: classify_temporary,
        }
    }
}

impl<F, C> FnValidator<F, C>
where
    F: Fn(&Connection) -> Result<Verdict> + Send + Sync,
    C: Fn(&Error) -> Verdict + Send + Sync,
{
    /// Replace the error classifier
    pub fn with_classifier<C2>(self, classify: C2) -> FnValidator<F, C2>
    where
        C2: Fn(&Error) -> Verdict + Send + Sync,
    {
        FnValidator {
            name: self.name,
            check: self.check,
            classify,
        }
    }
}

impl<F, C> ConnValidator for FnValidator<F, C>
where
    F: Fn(&Connection) -> Result<Verdict> + Send + Sync,
    C: Fn(&Error) -> Verdict + Send + Sync,
{
    fn validate(&self, conn: &Connection) -> Result<Verdict> {
        (self.check)(conn)
    }

    fn validate_error(&self, error: &Error) -> Verdict {
        (self.classify)(error)
    }

    fn name(&self) -> &str {
        &self.name
    }
}
