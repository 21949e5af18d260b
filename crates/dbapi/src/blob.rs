//! Large-object streams
//!
//! An [`ItemDescriptor`] locates one large-object cell. Descriptors taken
//! from a cursor row are tied to that fetch: once the cursor advances or
//! closes, the driver rejects them. Descriptors built with
//! [`ItemDescriptor::new`] locate the cell by a search condition instead
//! and must match exactly one row.
//!
//! [`BlobReader`] implements [`std::io::Read`]; [`BlobWriter`] implements
//! [`std::io::Write`] and replaces the cell with exactly the declared number
//! of bytes when finished.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{Error, Result};
use crate::security::{validate_condition, validate_object_name, validate_sql_identifier};
use crate::session::SessionHandle;

/// How a descriptor identifies its row
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Locator {
    /// The row a cursor fetched
    Row {
        /// Cursor name
        cursor: String,
        /// Row identity
        row_id: u64,
        /// Fetch the descriptor belongs to
        fetch_seq: u64,
    },
    /// The single row matching a search condition
    Condition(String),
}

/// Locates one large-object cell
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemDescriptor {
    table: String,
    column: String,
    locator: Locator,
}

impl ItemDescriptor {
    /// Descriptor for the row of `table` matching `condition`
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        condition: impl Into<String>,
    ) -> Result<Self> {
        let table = table.into();
        let column = column.into();
        let condition = condition.into();
        validate_object_name(&table)?;
        validate_sql_identifier(&column)?;
        validate_condition(&condition)?;
        Ok(Self {
            table,
            column,
            locator: Locator::Condition(condition),
        })
    }

    pub(crate) fn for_row(
        table: &str,
        column: &str,
        cursor: &str,
        row_id: u64,
        fetch_seq: u64,
    ) -> Self {
        Self {
            table: table.to_string(),
            column: column.to_string(),
            locator: Locator::Row {
                cursor: cursor.to_string(),
                row_id,
                fetch_seq,
            },
        }
    }

    /// Table name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Column name
    pub fn column(&self) -> &str {
        &self.column
    }

    /// Row locator
    pub fn locator(&self) -> &Locator {
        &self.locator
    }
}

impl fmt::Display for ItemDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.locator {
            Locator::Row { cursor, row_id, .. } => {
                write!(f, "{}.{} (cursor {} row {})", self.table, self.column, cursor, row_id)
            }
            Locator::Condition(c) => write!(f, "{}.{} WHERE {}", self.table, self.column, c),
        }
    }
}

/// Blob write settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlobOptions {
    /// Whether the server logs the change (minimally logged when false)
    pub log_changes: bool,
}

impl Default for BlobOptions {
    fn default() -> Self {
        Self { log_changes: true }
    }
}

impl BlobOptions {
    /// Skip transaction logging for the write
    pub fn without_logging() -> Self {
        Self { log_changes: false }
    }
}

fn to_io(err: Error) -> io::Error {
    io::Error::other(err)
}

/// Incremental reader over one cell
pub struct BlobReader {
    handle: SessionHandle,
    item: ItemDescriptor,
    offset: usize,
}

impl BlobReader {
    pub(crate) fn new(handle: SessionHandle, item: ItemDescriptor) -> Self {
        Self {
            handle,
            item,
            offset: 0,
        }
    }

    /// Bytes read so far
    pub fn position(&self) -> usize {
        self.offset
    }

    /// Cell being read
    pub fn descriptor(&self) -> &ItemDescriptor {
        &self.item
    }
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader")
            .field("item", &self.item)
            .field("offset", &self.offset)
            .finish()
    }
}

impl io::Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if buf.is_empty() {
            return Ok(0);
        }
        let item = &self.item;
        let offset = self.offset;
        let n = self
            .handle
            .call_strict(|s| s.native.read_blob(item, offset, buf))
            .map_err(to_io)?;
        self.offset += n;
        Ok(n)
    }
}

/// Incremental writer replacing one cell
pub struct BlobWriter {
    handle: SessionHandle,
    item: ItemDescriptor,
    expected: usize,
    written: usize,
    done: bool,
}

impl BlobWriter {
    pub(crate) fn open(
        handle: SessionHandle,
        item: ItemDescriptor,
        len: usize,
        options: BlobOptions,
    ) -> Result<Self> {
        handle.call_strict(|s| s.native.begin_blob_write(&item, len, &options))?;
        debug!(item = %item, len, "Blob write started");
        Ok(Self {
            handle,
            item,
            expected: len,
            written: 0,
            done: false,
        })
    }

    /// Declared length
    pub fn expected_len(&self) -> usize {
        self.expected
    }

    /// Bytes sent so far
    pub fn written(&self) -> usize {
        self.written
    }

    /// Commit the value; fails unless exactly the declared length was written
    pub fn finish(mut self) -> Result<()> {
        self.commit()
    }

    fn commit(&mut self) -> Result<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        if self.written != self.expected {
            self.abort();
            return Err(Error::client(format!(
                "blob write for {} ended after {} of {} bytes",
                self.item, self.written, self.expected
            )));
        }
        self.handle.call(|s| s.native.finish_blob_write())?;
        debug!(item = %self.item, len = self.written, "Blob write committed");
        Ok(())
    }

    fn abort(&mut self) {
        let _ = self.handle.with(|s| {
            s.native.abort_blob_write();
            Ok(())
        });
        debug!(item = %self.item, "Blob write aborted");
    }
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("item", &self.item)
            .field("expected", &self.expected)
            .field("written", &self.written)
            .field("done", &self.done)
            .finish()
    }
}

impl io::Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return Err(to_io(Error::client("blob write already finished")));
        }
        if self.written + buf.len() > self.expected {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!(
                    "blob write exceeds declared length {} for {}",
                    self.expected, self.item
                ),
            ));
        }
        if buf.is_empty() {
            return Ok(0);
        }
        self.handle
            .call_strict(|s| s.native.write_blob_chunk(buf))
            .map_err(to_io)?;
        self.written += buf.len();
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        if !self.done && self.written == self.expected {
            self.commit().map_err(to_io)?;
        }
        Ok(())
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        if self.written == self.expected {
            if let Err(e) = self.commit() {
                warn!(item = %self.item, error = %e, "Blob write failed on drop");
            }
        } else {
            self.done = true;
            self.abort();
        }
    }
}
