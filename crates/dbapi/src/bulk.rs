//! Bulk insert sessions
//!
//! A [`BulkInsert`] binds typed cells to table positions, snapshots the
//! bound values on every [`BulkInsert::add_row`] and sends buffered rows to
//! the server as one committed batch on [`BulkInsert::store_batch`].
//!
//! State machine:
//! - `Created`: columns may be bound
//! - `Active`: rows have been added; binding is a usage error
//! - `Flushed`: a batch was stored; bindings persist, buffer is empty
//! - `Completed` / `Cancelled`: terminal
//!
//! Cancelling discards only rows not yet stored. Dropping a session that
//! was not completed cancels it.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::driver::BulkColumn;
use crate::error::{Error, Result};
use crate::session::SessionHandle;
use crate::types::{ColumnType, OverflowAction, OverflowPolicy, Value};

/// Bulk session settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkOptions {
    /// Overrides the driver's default width overflow handling
    pub overflow: Option<OverflowPolicy>,
    /// Store a batch automatically once this many rows are buffered
    pub batch_size: Option<usize>,
}

impl BulkOptions {
    /// Default options
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the overflow policy
    pub fn with_overflow(mut self, policy: OverflowPolicy) -> Self {
        self.overflow = Some(policy);
        self
    }

    /// Set the automatic batch size
    pub fn with_batch_size(mut self, rows: usize) -> Self {
        self.batch_size = Some(rows);
        self
    }
}

/// Lifecycle of a bulk session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BulkState {
    /// Binding columns
    Created,
    /// Rows added since the last stored batch
    Active,
    /// Last batch stored
    Flushed,
    /// Finished; nothing more can be sent
    Completed,
    /// Aborted; stored batches remain
    Cancelled,
}

impl fmt::Display for BulkState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Created => "created",
            Self::Active => "active",
            Self::Flushed => "flushed",
            Self::Completed => "completed",
            Self::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug)]
struct Binding {
    column_type: ColumnType,
    value: Value,
}

/// A bulk load into one table
pub struct BulkInsert {
    handle: SessionHandle,
    table: String,
    bindings: BTreeMap<usize, Binding>,
    rows: Vec<Vec<Value>>,
    state: BulkState,
    overflow: OverflowPolicy,
    batch_size: Option<usize>,
    stored: u64,
    batches: u64,
}

impl BulkInsert {
    pub(crate) fn new(
        handle: SessionHandle,
        table: String,
        overflow: OverflowPolicy,
        options: BulkOptions,
    ) -> Self {
        debug!(table = %table, "Bulk insert session created");
        Self {
            handle,
            table,
            bindings: BTreeMap::new(),
            rows: Vec::new(),
            state: BulkState::Created,
            overflow: options.overflow.unwrap_or(overflow),
            batch_size: options.batch_size.filter(|n| *n > 0),
            stored: 0,
            batches: 0,
        }
    }

    /// Target table
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Current state
    pub fn state(&self) -> BulkState {
        self.state
    }

    /// Rows committed by stored batches
    pub fn stored_rows(&self) -> u64 {
        self.stored
    }

    /// Rows buffered and not yet stored
    pub fn pending_rows(&self) -> usize {
        self.rows.len()
    }

    /// Overflow policy in effect
    pub fn overflow_policy(&self) -> OverflowPolicy {
        self.overflow
    }

    fn ensure_live(&self) -> Result<()> {
        match self.state {
            BulkState::Completed | BulkState::Cancelled => Err(Error::client(format!(
                "bulk insert into {} is {}",
                self.table, self.state
            ))),
            _ => Ok(()),
        }
    }

    /// Bind table position `pos` (1-based); only before the first row
    pub fn bind(&mut self, pos: usize, column_type: ColumnType) -> Result<()> {
        self.ensure_live()?;
        if self.state != BulkState::Created {
            return Err(Error::client(format!(
                "cannot bind column {} of {}: rows were already added",
                pos, self.table
            )));
        }
        if pos == 0 {
            return Err(Error::client("bulk column positions are 1-based"));
        }
        self.bindings.insert(
            pos,
            Binding {
                column_type,
                value: Value::Null,
            },
        );
        Ok(())
    }

    /// Set the value of a bound position for the next row
    pub fn set(&mut self, pos: usize, value: impl Into<Value>) -> Result<()> {
        self.ensure_live()?;
        let binding = self.bindings.get_mut(&pos).ok_or_else(|| {
            Error::client(format!("column {} of {} is not bound", pos, self.table))
        })?;
        binding.value = value.into();
        Ok(())
    }

    /// Snapshot the bound values as one row
    pub fn add_row(&mut self) -> Result<()> {
        self.ensure_live()?;
        if self.bindings.is_empty() {
            return Err(Error::client(format!(
                "no columns bound for bulk insert into {}",
                self.table
            )));
        }
        let row = self
            .bindings
            .iter()
            .map(|(pos, b)| self.prepare(*pos, b))
            .collect::<Result<Vec<_>>>()?;
        self.rows.push(row);
        self.state = BulkState::Active;

        if self.batch_size.is_some_and(|n| self.rows.len() >= n) {
            self.store_batch()?;
        }
        Ok(())
    }

    fn prepare(&self, pos: usize, binding: &Binding) -> Result<Value> {
        let value = binding.value.coerce(&binding.column_type)?;
        let Some(width) = binding.column_type.declared_width() else {
            return Ok(value);
        };
        let width = width as usize;
        let overflows = value.byte_len().is_some_and(|len| len > width);
        if !overflows {
            return Ok(value);
        }
        match self.overflow.action_for(&binding.column_type) {
            Some(OverflowAction::Reject) => Err(Error::client(format!(
                "value for column {} of {} exceeds declared width {} of {}",
                pos, self.table, width, binding.column_type
            ))),
            _ => Ok(value.truncated(width)),
        }
    }

    /// Commit buffered rows as one batch; returns the rows stored
    pub fn store_batch(&mut self) -> Result<u64> {
        self.ensure_live()?;
        if self.rows.is_empty() {
            if self.state == BulkState::Active {
                self.state = BulkState::Flushed;
            }
            return Ok(0);
        }

        let columns: Vec<BulkColumn> = self
            .bindings
            .iter()
            .map(|(pos, b)| BulkColumn {
                position: *pos,
                column_type: b.column_type,
            })
            .collect();
        let (table, rows) = (&self.table, &self.rows);
        let outcome = self
            .handle
            .call(|s| s.native.bulk_load(table, &columns, rows))?;
        let Some(count) = outcome else {
            warn!(table = %self.table, pending = self.rows.len(), "Bulk batch not stored, rows kept pending");
            return Ok(0);
        };
        self.rows.clear();
        self.state = BulkState::Flushed;
        self.stored += count;
        self.batches += 1;
        info!(table = %self.table, rows = count, batch = self.batches, "Bulk batch stored");
        Ok(count)
    }

    /// Store any pending rows and finish the session; returns total stored rows
    pub fn complete(&mut self) -> Result<u64> {
        self.ensure_live()?;
        if !self.rows.is_empty() {
            self.store_batch()?;
            if !self.rows.is_empty() {
                return Err(Error::client(format!(
                    "{} pending rows for {} could not be stored",
                    self.rows.len(),
                    self.table
                )));
            }
        }
        self.state = BulkState::Completed;
        debug!(table = %self.table, rows = self.stored, "Bulk insert completed");
        Ok(self.stored)
    }

    /// Discard rows not yet stored. Repeated calls are no-ops.
    pub fn cancel(&mut self) -> Result<()> {
        match self.state {
            BulkState::Cancelled => Ok(()),
            BulkState::Completed => Err(Error::client(format!(
                "bulk insert into {} already completed",
                self.table
            ))),
            _ => {
                let dropped = self.rows.len();
                self.rows.clear();
                self.state = BulkState::Cancelled;
                if let Err(e) = self.handle.with(|s| s.native.cancel()) {
                    debug!(table = %self.table, error = %e, "Driver cancel failed");
                }
                info!(table = %self.table, discarded = dropped, kept = self.stored, "Bulk insert cancelled");
                Ok(())
            }
        }
    }
}

impl Drop for BulkInsert {
    fn drop(&mut self) {
        if matches!(self.state, BulkState::Active | BulkState::Flushed) {
            let _ = self.cancel();
        }
    }
}

impl fmt::Debug for BulkInsert {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BulkInsert")
            .field("table", &self.table)
            .field("state", &self.state)
            .field("bound", &self.bindings.len())
            .field("pending", &self.rows.len())
            .field("stored", &self.stored)
            .finish()
    }
}
