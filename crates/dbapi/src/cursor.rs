//! Positioned cursors
//!
//! ```rust
//! use dbapi::prelude::*;
//! use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
//!
//! # fn main() -> dbapi::Result<()> {
//! let cluster = MemoryCluster::new();
//! cluster.add_server(MemoryServer::new("SRV", ServerType::MsSql));
//! let registry = DriverRegistry::new().with_driver(MemoryDriver::new(cluster));
//! let ctx = DriverContext::new(registry, "memory", ContextConfig::default())?;
//!
//! let conn = ctx.connect(&ConnParams::new().with_server("SRV"))?;
//! conn.execute("CREATE TABLE notes (id INT, body TEXT NULL)", &[])?;
//! conn.execute("INSERT INTO notes VALUES (1, 'draft')", &[])?;
//!
//! let mut cur = conn.open_cursor(
//!     CursorSpec::new("upd", "SELECT id, body FROM notes").for_update(["body"]),
//! )?;
//! while cur.next()? {
//!     cur.update("notes", "body = 'final'")?;
//! }
//! cur.close()?;
//!
//! let row = conn.query_one("SELECT body FROM notes", &[])?.unwrap();
//! assert_eq!(row.get(0).and_then(|v| v.as_str()), Some("final"));
//! # Ok(())
//! # }
//! ```

use std::fmt;

use tracing::debug;

use crate::blob::{BlobOptions, BlobReader, BlobWriter, ItemDescriptor};
use crate::driver::{Cell, CursorInfo, FetchedRow};
use crate::error::{Error, Result};
use crate::security::validate_object_name;
use crate::session::SessionHandle;
use crate::types::{ColumnMetadata, ColumnType, Row, Value};

/// What to open
#[derive(Debug, Clone, PartialEq)]
pub struct CursorSpec {
    name: String,
    sql: String,
    update_columns: Vec<String>,
    params: Vec<Value>,
}

impl CursorSpec {
    /// Cursor `name` over a SELECT statement
    pub fn new(name: impl Into<String>, sql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            sql: sql.into(),
            update_columns: Vec::new(),
            params: Vec::new(),
        }
    }

    /// Mark columns for update
    pub fn for_update<I, S>(mut self, columns: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.update_columns = columns.into_iter().map(Into::into).collect();
        self
    }

    /// Statement parameters
    pub fn with_params(mut self, params: Vec<Value>) -> Self {
        self.params = params;
        self
    }

    /// Cursor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// SELECT text as given
    pub fn sql(&self) -> &str {
        &self.sql
    }

    /// Columns marked for update
    pub fn update_columns(&self) -> &[String] {
        &self.update_columns
    }

    /// Statement parameters
    pub fn params(&self) -> &[Value] {
        &self.params
    }

    /// Statement text with the `FOR UPDATE OF` clause appended when columns are marked
    pub fn statement(&self) -> String {
        if self.update_columns.is_empty()
            || self.sql.to_ascii_uppercase().contains("FOR UPDATE")
        {
            return self.sql.clone();
        }
        format!(
            "{} FOR UPDATE OF {}",
            self.sql.trim_end().trim_end_matches(';'),
            self.update_columns.join(", ")
        )
    }
}

/// An open cursor
pub struct Cursor {
    handle: SessionHandle,
    name: String,
    info: CursorInfo,
    current: Option<FetchedRow>,
    open: bool,
}

impl Cursor {
    pub(crate) fn new(handle: SessionHandle, name: String, info: CursorInfo) -> Self {
        debug!(cursor = %name, table = %info.table, "Cursor opened");
        Self {
            handle,
            name,
            info,
            current: None,
            open: true,
        }
    }

    /// Cursor name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Table the cursor reads
    pub fn table(&self) -> &str {
        &self.info.table
    }

    /// Projection
    pub fn columns(&self) -> &[ColumnMetadata] {
        &self.info.columns
    }

    /// Whether a row is currently fetched
    pub fn has_row(&self) -> bool {
        self.current.is_some()
    }

    /// Advance by one row; `false` at the end
    pub fn next(&mut self) -> Result<bool> {
        self.ensure_open()?;
        let name = &self.name;
        self.current = self
            .handle
            .call(|s| s.native.fetch(name))?
            .flatten();
        Ok(self.current.is_some())
    }

    fn ensure_open(&self) -> Result<()> {
        if self.open {
            Ok(())
        } else {
            Err(Error::client(format!("cursor '{}' is closed", self.name)))
        }
    }

    fn row(&self) -> Result<&FetchedRow> {
        self.ensure_open()?;
        self.current
            .as_ref()
            .ok_or_else(|| Error::client(format!("cursor '{}' has no current row", self.name)))
    }

    fn cell(&self, col: usize) -> Result<(&FetchedRow, &Cell, &ColumnMetadata)> {
        let row = self.row()?;
        let cell = row.cells.get(col).ok_or_else(|| {
            Error::client(format!("column index {} out of range for cursor '{}'", col, self.name))
        })?;
        Ok((row, cell, &self.info.columns[col]))
    }

    /// Whether a column of the current row is NULL
    pub fn is_null(&self, col: usize) -> Result<bool> {
        Ok(self.cell(col)?.1.is_null())
    }

    /// Byte length of a column of the current row, `None` for NULL
    pub fn blob_size(&self, col: usize) -> Result<Option<usize>> {
        Ok(match self.cell(col)?.1 {
            Cell::Lob { len } => *len,
            Cell::Value(v) => v.byte_len(),
        })
    }

    /// Column value; large objects are read in full
    pub fn value(&self, col: usize) -> Result<Value> {
        let (_, cell, meta) = self.cell(col)?;
        match cell {
            Cell::Value(v) => Ok(v.clone()),
            Cell::Lob { len: None } => Ok(Value::Null),
            Cell::Lob { len: Some(len) } => {
                let mut bytes = Vec::with_capacity(*len);
                std::io::Read::read_to_end(&mut self.blob_reader(col)?, &mut bytes)
                    .map_err(|e| Error::data_source(format!("blob read failed: {e}")))?;
                lob_value(&meta.column_type, bytes)
            }
        }
    }

    /// Column value by name
    pub fn value_by_name(&self, name: &str) -> Result<Value> {
        let col = self
            .info
            .columns
            .iter()
            .position(|c| c.name.eq_ignore_ascii_case(name))
            .ok_or_else(|| Error::client(format!("no column '{name}' in cursor '{}'", self.name)))?;
        self.value(col)
    }

    /// The whole current row, large objects materialized
    pub fn current_row(&self) -> Result<Row> {
        let names = self.info.columns.iter().map(|c| c.name.clone()).collect();
        let values = (0..self.info.columns.len())
            .map(|i| self.value(i))
            .collect::<Result<Vec<_>>>()?;
        Ok(Row::new(names, values))
    }

    /// Locator for one cell of the current row
    pub fn descriptor(&self, col: usize) -> Result<ItemDescriptor> {
        let (row, _, meta) = self.cell(col)?;
        Ok(ItemDescriptor::for_row(
            &self.info.table,
            &meta.name,
            &self.name,
            row.row_id,
            row.fetch_seq,
        ))
    }

    /// Stream one cell of the current row
    pub fn blob_reader(&self, col: usize) -> Result<BlobReader> {
        Ok(BlobReader::new(self.handle.clone(), self.descriptor(col)?))
    }

    /// Replace one cell of the current row with exactly `len` bytes
    pub fn blob_writer(&self, col: usize, len: usize, options: BlobOptions) -> Result<BlobWriter> {
        BlobWriter::open(self.handle.clone(), self.descriptor(col)?, len, options)
    }

    /// Positioned UPDATE of the current row.
    ///
    /// `sql` is either a full `UPDATE ... SET ...` statement or just the
    /// assignment list; `WHERE CURRENT OF` is appended.
    pub fn update(&mut self, table: &str, sql: &str) -> Result<u64> {
        validate_object_name(table)?;
        self.row()?;
        let sql = sql.trim();
        let upper = sql.to_ascii_uppercase();
        let statement = if upper.starts_with("UPDATE") {
            format!("{} WHERE CURRENT OF {}", sql, self.name)
        } else if upper.starts_with("SET") {
            format!("UPDATE {} {} WHERE CURRENT OF {}", table, sql, self.name)
        } else {
            format!("UPDATE {} SET {} WHERE CURRENT OF {}", table, sql, self.name)
        };
        self.positioned(&statement)
    }

    /// Positioned DELETE of the current row
    pub fn delete(&mut self, table: &str) -> Result<u64> {
        validate_object_name(table)?;
        self.row()?;
        let statement = format!("DELETE FROM {} WHERE CURRENT OF {}", table, self.name);
        let affected = self.positioned(&statement)?;
        self.current = None;
        Ok(affected)
    }

    fn positioned(&self, statement: &str) -> Result<u64> {
        let outcome = self
            .handle
            .call(|s| s.native.execute(statement, &[]))?;
        Ok(outcome.map_or(0, |o| o.rows_affected))
    }

    /// Close the cursor; its name may be reused afterwards
    pub fn close(mut self) -> Result<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> Result<()> {
        if !self.open {
            return Ok(());
        }
        self.open = false;
        self.current = None;
        let name = &self.name;
        self.handle.call_strict(|s| {
            s.cursors.remove(name);
            s.native.close_cursor(name)
        })?;
        debug!(cursor = %self.name, "Cursor closed");
        Ok(())
    }
}

impl fmt::Debug for Cursor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("name", &self.name)
            .field("table", &self.info.table)
            .field("columns", &self.info.columns.len())
            .field("has_row", &self.current.is_some())
            .field("open", &self.open)
            .finish()
    }
}

impl Drop for Cursor {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            debug!(cursor = %self.name, error = %e, "Cursor close on drop failed");
        }
    }
}

fn lob_value(ty: &ColumnType, bytes: Vec<u8>) -> Result<Value> {
    match ty {
        ColumnType::Text | ColumnType::Char(_) | ColumnType::VarChar(_) => String::from_utf8(bytes)
            .map(Value::String)
            .map_err(|_| Error::type_conversion("text column holds invalid UTF-8")),
        _ => Ok(Value::Bytes(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_statement_appends_for_update() {
        let spec = CursorSpec::new("c", "SELECT a, b FROM t;").for_update(["b"]);
        assert_eq!(spec.statement(), "SELECT a, b FROM t FOR UPDATE OF b");

        let plain = CursorSpec::new("c", "SELECT a FROM t");
        assert_eq!(plain.statement(), "SELECT a FROM t");

        let explicit = CursorSpec::new("c", "SELECT a FROM t FOR UPDATE").for_update(["a"]);
        assert_eq!(explicit.statement(), "SELECT a FROM t FOR UPDATE");
    }

    #[test]
    fn test_lob_value_by_type() {
        assert_eq!(
            lob_value(&ColumnType::Text, b"abc".to_vec()).unwrap(),
            Value::String("abc".into())
        );
        assert_eq!(
            lob_value(&ColumnType::Image, vec![1, 2]).unwrap(),
            Value::Bytes(vec![1, 2])
        );
        assert!(lob_value(&ColumnType::Text, vec![0xff, 0xfe]).is_err());
    }
}
