//! Statement execution for memory connections

use std::cmp::Ordering as CmpOrdering;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::sql::{self, CmpOp, Expr, Predicate, Projection, Select, Statement, Target};
use super::{Catalog, Column, MemoryServer, ServerType, Table};
use crate::blob::{BlobOptions, ItemDescriptor, Locator};
use crate::cursor::CursorSpec;
use crate::driver::{
    BulkColumn, Cell, ConnectOptions, CursorInfo, FetchedRow, NativeConnection, ResultSet,
    ServerMessage, StatementOutcome,
};
use crate::error::{Error, Result, TRUNCATION_CODE};
use crate::types::{ColumnMetadata, ColumnType, TypeClass, Value};

const POLL_INTERVAL: Duration = Duration::from_millis(10);

struct CursorState {
    database: String,
    table: String,
    projection: Vec<usize>,
    row_ids: Vec<u64>,
    pos: usize,
    fetch_seq: u64,
    current: Option<u64>,
    /// `None` read-only, `Some(empty)` every column
    updatable: Option<Vec<String>>,
}

struct CellRef {
    database: String,
    table: String,
    row_id: u64,
    column: usize,
}

struct PendingWrite {
    cell: CellRef,
    expected: usize,
    data: Vec<u8>,
    log_changes: bool,
}

/// A change made inside an open transaction, with what is needed to revert it
enum Undo {
    Insert {
        database: String,
        table: String,
        row_id: u64,
    },
    /// Row updated or deleted
    Restore {
        database: String,
        table: String,
        row_id: u64,
        before: Vec<Value>,
    },
    Create {
        database: String,
        table: String,
    },
    Drop {
        database: String,
        table: String,
        definition: Table,
    },
}

impl Undo {
    fn revert(self, catalog: &mut Catalog) {
        match self {
            Undo::Insert {
                database,
                table,
                row_id,
            } => {
                if let Some(t) = catalog.get_mut(&database).and_then(|d| d.tables.get_mut(&table)) {
                    t.rows.remove(&row_id);
                }
            }
            Undo::Restore {
                database,
                table,
                row_id,
                before,
            } => {
                if let Some(t) = catalog.get_mut(&database).and_then(|d| d.tables.get_mut(&table)) {
                    t.rows.insert(row_id, before);
                }
            }
            Undo::Create { database, table } => {
                if let Some(d) = catalog.get_mut(&database) {
                    d.tables.remove(&table);
                }
            }
            Undo::Drop {
                database,
                table,
                definition,
            } => {
                if let Some(d) = catalog.get_mut(&database) {
                    d.tables.insert(table, definition);
                }
            }
        }
    }
}

/// One physical connection to a [`MemoryServer`]
pub(crate) struct MemoryConnection {
    server: Arc<MemoryServer>,
    database: String,
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
    messages: Vec<ServerMessage>,
    cursors: HashMap<String, CursorState>,
    /// Changes of the open transaction, oldest first
    undo: Vec<Undo>,
    tran_count: u32,
    blob_write: Option<PendingWrite>,
    closed: bool,
}

impl MemoryConnection {
    pub(crate) fn new(server: Arc<MemoryServer>, database: &str, options: &ConnectOptions) -> Self {
        server.connection_opened();
        Self {
            server,
            database: database.to_ascii_lowercase(),
            timeout: options.timeout,
            cancel: Arc::clone(&options.cancel),
            messages: Vec::new(),
            cursors: HashMap::new(),
            undo: Vec::new(),
            tran_count: 0,
            blob_write: None,
            closed: false,
        }
    }

    fn flavor(&self) -> ServerType {
        self.server.server_type()
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::connection("connection is closed"));
        }
        if !self.server.is_online() {
            return Err(Error::connection(format!(
                "server {} closed the connection",
                self.server.name()
            )));
        }
        Ok(())
    }

    /// (database, table) keys for a possibly qualified name
    fn table_key(&self, name: &str) -> (String, String) {
        let (database, table) = sql::split_object_name(name);
        (
            database.map_or_else(|| self.database.clone(), str::to_ascii_lowercase),
            table.to_ascii_lowercase(),
        )
    }

    fn run(&mut self, statement: Statement, params: &[Value], outcome: &mut StatementOutcome) -> Result<()> {
        match statement {
            Statement::CreateTable { table, columns } => {
                let (db, key) = self.table_key(&table);
                let mut catalog = self.server.catalog.lock();
                let database = catalog
                    .get_mut(&db)
                    .ok_or_else(|| self.server.error(911, 16, format!("Database '{db}' does not exist.")))?;
                if database.tables.contains_key(&key) {
                    return Err(self.server.error(
                        2714,
                        16,
                        format!("There is already an object named '{table}' in the database."),
                    ));
                }
                let mut defs: Vec<Column> = Vec::with_capacity(columns.len());
                for c in columns {
                    if defs.iter().any(|d| d.name.eq_ignore_ascii_case(&c.name)) {
                        return Err(self.server.error(
                            2705,
                            16,
                            format!("Column names in each table must be unique. Column name '{}' is specified more than once.", c.name),
                        ));
                    }
                    defs.push(Column {
                        name: c.name,
                        column_type: c.column_type,
                        nullable: c.nullable.unwrap_or(self.flavor().default_nullable()),
                    });
                }
                let name = sql::split_object_name(&table).1.to_string();
                database.tables.insert(key.clone(), Table::new(name, defs));
                if self.tran_count > 0 {
                    self.undo.push(Undo::Create { database: db, table: key });
                }
            }
            Statement::DropTable { table } => {
                let (db, key) = self.table_key(&table);
                let removed = self
                    .server
                    .catalog
                    .lock()
                    .get_mut(&db)
                    .and_then(|d| d.tables.remove(&key));
                let Some(definition) = removed else {
                    return Err(self.server.error(
                        3701,
                        11,
                        format!("Cannot drop the table '{table}', because it does not exist or you do not have permission."),
                    ));
                };
                if self.tran_count > 0 {
                    self.undo.push(Undo::Drop {
                        database: db,
                        table: key,
                        definition,
                    });
                }
            }
            Statement::Insert {
                table,
                columns,
                rows,
            } => {
                outcome.rows_affected += self.insert(&table, columns, rows, params)?;
            }
            Statement::Select(select) => {
                let result = self.select(&select, params)?;
                outcome.result_sets.push(result);
            }
            Statement::Update {
                table,
                assignments,
                target,
            } => {
                outcome.rows_affected += self.update(&table, &assignments, target, params)?;
            }
            Statement::Delete { table, target } => {
                outcome.rows_affected += self.delete(&table, target, params)?;
            }
            Statement::Use(database) => {
                if !self.server.has_database(&database) {
                    return Err(self.server.error(
                        911,
                        16,
                        format!("Database '{database}' does not exist. Make sure that the name is entered correctly."),
                    ));
                }
                self.database = database.to_ascii_lowercase();
                self.messages.push(self.server.message(
                    5701,
                    0,
                    format!("Changed database context to '{database}'."),
                ));
            }
            Statement::Print(expr) => {
                let text = self.eval(&expr, params, None)?.as_string().unwrap_or_default();
                self.messages.push(self.server.message(0, 0, text));
            }
            Statement::RaiseError {
                message,
                severity,
                state,
            } => {
                let mut msg = self.server.message(50000, severity, message);
                msg.state = state;
                if severity > 10 {
                    return Err(msg.into_error());
                }
                self.messages.push(msg);
            }
            Statement::WaitFor(delay) => self.wait(delay, outcome)?,
            Statement::Begin => self.tran_count += 1,
            Statement::Commit => {
                if self.tran_count == 0 {
                    return Err(self.server.error(
                        3902,
                        16,
                        "The COMMIT TRANSACTION request has no corresponding BEGIN TRANSACTION.",
                    ));
                }
                self.tran_count -= 1;
                if self.tran_count == 0 {
                    self.undo.clear();
                }
            }
            Statement::Rollback => {
                if self.tran_count == 0 {
                    return Err(self.server.error(
                        3903,
                        16,
                        "The ROLLBACK TRANSACTION request has no corresponding BEGIN TRANSACTION.",
                    ));
                }
                self.roll_back();
            }
        }
        Ok(())
    }

    /// Revert this connection's open transaction, newest change first
    fn roll_back(&mut self) {
        if !self.undo.is_empty() {
            let mut catalog = self.server.catalog.lock();
            for entry in self.undo.drain(..).rev() {
                entry.revert(&mut catalog);
            }
        }
        self.tran_count = 0;
    }

    fn wait(&mut self, delay: Duration, outcome: &mut StatementOutcome) -> Result<()> {
        let start = Instant::now();
        loop {
            let elapsed = start.elapsed();
            if elapsed >= delay {
                return Ok(());
            }
            if self.cancel.swap(false, Ordering::SeqCst) {
                outcome.cancelled = true;
                return Ok(());
            }
            let mut step = (delay - elapsed).min(POLL_INTERVAL);
            if let Some(timeout) = self.timeout {
                if elapsed >= timeout {
                    return Err(Error::timeout(format!(
                        "statement on {} timed out after {:?}",
                        self.server.name(),
                        timeout
                    )));
                }
                step = step.min(timeout - elapsed);
            }
            thread::sleep(step);
        }
    }

    fn eval(&self, expr: &Expr, params: &[Value], row: Option<(&Table, &[Value])>) -> Result<Value> {
        match expr {
            Expr::Literal(v) => Ok(v.clone()),
            Expr::Param(i) => params.get(*i).cloned().ok_or_else(|| {
                self.server.error(
                    8178,
                    16,
                    format!(
                        "The parameterized query expects the parameter '@p{}', which was not supplied.",
                        i + 1
                    ),
                )
            }),
            Expr::Column(name) => match row {
                Some((table, values)) => {
                    let idx = self.column_index(table, name)?;
                    Ok(values[idx].clone())
                }
                None => Err(self.server.error(
                    128,
                    15,
                    format!("The name \"{name}\" is not permitted in this context."),
                )),
            },
        }
    }

    fn column_index(&self, table: &Table, name: &str) -> Result<usize> {
        table
            .column_index(name)
            .ok_or_else(|| self.server.error(207, 16, format!("Invalid column name '{name}'.")))
    }

    fn missing_table(&self, name: &str) -> Error {
        self.server
            .error(208, 16, format!("Invalid object name '{name}'."))
    }

    /// Convert a value for storage in `column`, applying the flavor rules
    fn store(&self, table: &str, column: &Column, value: Value) -> Result<Value> {
        if value.is_null() {
            if !column.nullable {
                return Err(self.server.error(
                    515,
                    16,
                    format!(
                        "Cannot insert the value NULL into column '{}', table '{}'; column does not allow nulls.",
                        column.name, table
                    ),
                ));
            }
            return Ok(Value::Null);
        }

        let ty = column.column_type;
        let mut value = value.coerce(&ty).map_err(|_| {
            self.server.error(
                245,
                16,
                format!(
                    "Conversion failed when converting {} to data type {}.",
                    value.sql_type(),
                    ty.sql_name()
                ),
            )
        })?;

        if let Some(width) = ty.declared_width() {
            let width = width as usize;
            if value.byte_len().is_some_and(|len| len > width) {
                if !self.flavor().truncates_on_insert() {
                    return Err(self.server.error(
                        TRUNCATION_CODE,
                        16,
                        "String or binary data would be truncated.",
                    ));
                }
                value = value.truncated(width);
            }
        }

        if ty.class() == TypeClass::Character && value.as_str() == Some("") {
            value = Value::String(self.flavor().stored_empty_string().to_string());
        }

        Ok(match (ty, value) {
            (ColumnType::Char(n), Value::String(s)) => {
                Value::String(format!("{:<width$}", s, width = n as usize))
            }
            (ColumnType::Binary(n), Value::Bytes(mut b)) => {
                b.resize(n as usize, 0);
                Value::Bytes(b)
            }
            (_, v) => v,
        })
    }

    fn insert(
        &mut self,
        table_name: &str,
        columns: Option<Vec<String>>,
        rows: Vec<Vec<Expr>>,
        params: &[Value],
    ) -> Result<u64> {
        let (db, key) = self.table_key(table_name);
        let mut catalog = self.server.catalog.lock();
        let table = catalog
            .get_mut(&db)
            .and_then(|d| d.tables.get_mut(&key))
            .ok_or_else(|| self.missing_table(table_name))?;

        let targets: Vec<usize> = match &columns {
            Some(names) => names
                .iter()
                .map(|n| self.column_index(table, n))
                .collect::<Result<_>>()?,
            None => (0..table.columns.len()).collect(),
        };

        let mut prepared = Vec::with_capacity(rows.len());
        for exprs in &rows {
            if exprs.len() != targets.len() {
                return Err(self.server.error(
                    213,
                    16,
                    "Column name or number of supplied values does not match table definition.",
                ));
            }
            let mut supplied: Vec<Option<Value>> = vec![None; table.columns.len()];
            for (idx, expr) in targets.iter().zip(exprs) {
                supplied[*idx] = Some(self.eval(expr, params, None)?);
            }
            let values = table
                .columns
                .iter()
                .zip(supplied)
                .map(|(col, v)| self.store(&table.name, col, v.unwrap_or(Value::Null)))
                .collect::<Result<Vec<_>>>()?;
            prepared.push(values);
        }

        let count = prepared.len() as u64;
        for values in prepared {
            let row_id = table.insert(values);
            if self.tran_count > 0 {
                self.undo.push(Undo::Insert {
                    database: db.clone(),
                    table: key.clone(),
                    row_id,
                });
            }
        }
        Ok(count)
    }

    fn matching(&self, table: &Table, filter: &[Predicate], params: &[Value]) -> Result<Vec<u64>> {
        enum Operand {
            Constant(Value),
            Column(usize),
        }
        enum Check {
            Compare(usize, CmpOp, Operand),
            Null(usize, bool),
        }

        let mut checks = Vec::with_capacity(filter.len());
        for predicate in filter {
            checks.push(match predicate {
                Predicate::IsNull { column, negated } => {
                    Check::Null(self.column_index(table, column)?, *negated)
                }
                Predicate::Compare { column, op, value } => {
                    let idx = self.column_index(table, column)?;
                    let operand = match value {
                        Expr::Column(other) => Operand::Column(self.column_index(table, other)?),
                        other => {
                            let v = self.eval(other, params, None)?;
                            let ty = table.columns[idx].column_type;
                            Operand::Constant(v.coerce(&ty).map_err(|_| {
                                self.server.error(
                                    245,
                                    16,
                                    format!(
                                        "Conversion failed when converting {} to data type {}.",
                                        v.sql_type(),
                                        ty.sql_name()
                                    ),
                                )
                            })?)
                        }
                    };
                    Check::Compare(idx, *op, operand)
                }
            });
        }

        Ok(table
            .rows
            .iter()
            .filter(|(_, values)| {
                checks.iter().all(|check| match check {
                    Check::Null(idx, negated) => values[*idx].is_null() != *negated,
                    Check::Compare(idx, op, operand) => {
                        let rhs = match operand {
                            Operand::Constant(v) => v,
                            Operand::Column(j) => &values[*j],
                        };
                        compare(&values[*idx], rhs).is_some_and(|ord| op_holds(*op, ord))
                    }
                })
            })
            .map(|(id, _)| *id)
            .collect())
    }

    fn select(&self, select: &Select, params: &[Value]) -> Result<ResultSet> {
        let Some(table_name) = &select.table else {
            let Projection::Items(items) = &select.projection else {
                return Err(self.server.error(263, 16, "Must specify table to select from."));
            };
            let values = items
                .iter()
                .map(|e| self.eval(e, params, None))
                .collect::<Result<Vec<_>>>()?;
            let columns = values
                .iter()
                .enumerate()
                .map(|(i, v)| ColumnMetadata::new("", value_type(v)).with_ordinal(i as u32 + 1))
                .collect();
            return Ok(ResultSet {
                columns,
                rows: vec![values],
            });
        };

        let (db, key) = self.table_key(table_name);
        let catalog = self.server.catalog.lock();
        let table = catalog
            .get(&db)
            .and_then(|d| d.tables.get(&key))
            .ok_or_else(|| self.missing_table(table_name))?;
        let ids = self.matching(table, &select.filter, params)?;

        if select.projection == Projection::Count {
            return Ok(ResultSet {
                columns: vec![ColumnMetadata::new("", ColumnType::Int).with_ordinal(1)],
                rows: vec![vec![Value::Int32(ids.len() as i32)]],
            });
        }

        enum Item {
            Column(usize),
            Constant(Value),
        }
        let items: Vec<Item> = match &select.projection {
            Projection::Items(exprs) => exprs
                .iter()
                .map(|e| match e {
                    Expr::Column(name) => self.column_index(table, name).map(Item::Column),
                    other => self.eval(other, params, None).map(Item::Constant),
                })
                .collect::<Result<_>>()?,
            _ => (0..table.columns.len()).map(Item::Column).collect(),
        };

        let columns = items
            .iter()
            .enumerate()
            .map(|(i, item)| {
                let meta = match item {
                    Item::Column(idx) => column_metadata(&table.columns[*idx]),
                    Item::Constant(v) => ColumnMetadata::new("", value_type(v)),
                };
                meta.with_ordinal(i as u32 + 1)
            })
            .collect();
        let rows = ids
            .iter()
            .filter_map(|id| table.rows.get(id))
            .map(|values| {
                items
                    .iter()
                    .map(|item| match item {
                        Item::Column(idx) => values[*idx].clone(),
                        Item::Constant(v) => v.clone(),
                    })
                    .collect()
            })
            .collect();
        Ok(ResultSet { columns, rows })
    }

    /// Rows a modification targets, with the table keys
    fn targets(
        &self,
        table_name: &str,
        target: &Target,
        params: &[Value],
        columns: &[&str],
    ) -> Result<(String, String, Vec<u64>)> {
        let (db, key) = self.table_key(table_name);
        let catalog = self.server.catalog.lock();
        let table = catalog
            .get(&db)
            .and_then(|d| d.tables.get(&key))
            .ok_or_else(|| self.missing_table(table_name))?;

        let ids = match target {
            Target::Filter(filter) => self.matching(table, filter, params)?,
            Target::CurrentOf(cursor) => {
                let state = self.cursors.get(&cursor.to_ascii_lowercase()).ok_or_else(|| {
                    self.server.error(16916, 16, format!("A cursor with the name '{cursor}' does not exist."))
                })?;
                if state.database != db || state.table != key {
                    return Err(self.server.error(
                        16933,
                        16,
                        format!("The cursor '{cursor}' does not include the table being modified."),
                    ));
                }
                let Some(updatable) = &state.updatable else {
                    return Err(self.server.error(16929, 16, format!("The cursor '{cursor}' is READ ONLY.")));
                };
                for column in columns {
                    if !updatable.is_empty() && !updatable.iter().any(|u| u.eq_ignore_ascii_case(column)) {
                        return Err(self.server.error(
                            16932,
                            16,
                            format!("The cursor has a FOR UPDATE list and the requested column '{column}' is not in this list."),
                        ));
                    }
                }
                let row_id = state.current.ok_or_else(|| {
                    self.server.error(16930, 16, "The requested row is not in the fetch buffer.")
                })?;
                if !table.rows.contains_key(&row_id) {
                    return Err(self.server.error(
                        16934,
                        10,
                        "Optimistic concurrency check failed. The row was modified outside of this cursor.",
                    ));
                }
                vec![row_id]
            }
        };
        Ok((db, key, ids))
    }

    fn update(
        &mut self,
        table_name: &str,
        assignments: &[(String, Expr)],
        target: Target,
        params: &[Value],
    ) -> Result<u64> {
        let names: Vec<&str> = assignments.iter().map(|(c, _)| c.as_str()).collect();
        let (db, key, ids) = self.targets(table_name, &target, params, &names)?;

        let mut catalog = self.server.catalog.lock();
        let table = catalog
            .get_mut(&db)
            .and_then(|d| d.tables.get_mut(&key))
            .ok_or_else(|| self.missing_table(table_name))?;
        let indices = names
            .iter()
            .map(|n| self.column_index(table, n))
            .collect::<Result<Vec<_>>>()?;

        let mut changes = Vec::with_capacity(ids.len());
        for id in &ids {
            let Some(current) = table.rows.get(id) else {
                continue;
            };
            let mut next = current.clone();
            for ((_, expr), idx) in assignments.iter().zip(&indices) {
                let value = self.eval(expr, params, Some((&*table, current.as_slice())))?;
                next[*idx] = self.store(&table.name, &table.columns[*idx], value)?;
            }
            changes.push((*id, next));
        }
        let count = changes.len() as u64;
        for (id, values) in changes {
            if let Some(before) = table.rows.insert(id, values) {
                if self.tran_count > 0 {
                    self.undo.push(Undo::Restore {
                        database: db.clone(),
                        table: key.clone(),
                        row_id: id,
                        before,
                    });
                }
            }
        }
        Ok(count)
    }

    fn delete(&mut self, table_name: &str, target: Target, params: &[Value]) -> Result<u64> {
        let (db, key, ids) = self.targets(table_name, &target, params, &[])?;
        let removed = {
            let mut catalog = self.server.catalog.lock();
            let table = catalog
                .get_mut(&db)
                .and_then(|d| d.tables.get_mut(&key))
                .ok_or_else(|| self.missing_table(table_name))?;
            let mut removed = 0;
            for id in ids {
                let Some(before) = table.rows.remove(&id) else {
                    continue;
                };
                removed += 1;
                if self.tran_count > 0 {
                    self.undo.push(Undo::Restore {
                        database: db.clone(),
                        table: key.clone(),
                        row_id: id,
                        before,
                    });
                }
            }
            removed
        };
        if let Target::CurrentOf(cursor) = target {
            if let Some(state) = self.cursors.get_mut(&cursor.to_ascii_lowercase()) {
                state.current = None;
            }
        }
        Ok(removed as u64)
    }

    /// Locate the cell a descriptor points at
    fn resolve(&self, item: &ItemDescriptor) -> Result<CellRef> {
        let (db, key) = self.table_key(item.table());
        let catalog = self.server.catalog.lock();
        let table = catalog
            .get(&db)
            .and_then(|d| d.tables.get(&key))
            .ok_or_else(|| self.missing_table(item.table()))?;

        let row_id = match item.locator() {
            Locator::Row {
                cursor,
                row_id,
                fetch_seq,
            } => {
                let state = self
                    .cursors
                    .get(&cursor.to_ascii_lowercase())
                    .ok_or_else(|| {
                        Error::client(format!("descriptor {item} refers to a closed cursor"))
                    })?;
                if state.fetch_seq != *fetch_seq || state.current != Some(*row_id) {
                    return Err(Error::client(format!(
                        "descriptor {item} is stale: cursor '{cursor}' has moved"
                    )));
                }
                *row_id
            }
            Locator::Condition(condition) => {
                let filter = sql::parse_condition(condition)
                    .map_err(|e| self.server.error(102, 15, e.0))?;
                let ids = self.matching(table, &filter, &[])?;
                match ids.as_slice() {
                    [id] => *id,
                    _ => {
                        return Err(Error::client(format!(
                            "descriptor {item} matches {} rows, expected exactly one",
                            ids.len()
                        )))
                    }
                }
            }
        };

        if !table.rows.contains_key(&row_id) {
            return Err(Error::client(format!("descriptor {item} refers to a deleted row")));
        }
        let column = self.column_index(table, item.column())?;
        match table.columns[column].column_type.class() {
            TypeClass::Character | TypeClass::Binary => Ok(CellRef {
                database: db,
                table: key,
                row_id,
                column,
            }),
            _ => Err(Error::client(format!(
                "column {} is not a character or binary column",
                item.column()
            ))),
        }
    }

    fn cell_value(&self, cell: &CellRef) -> Result<Value> {
        self.server
            .catalog
            .lock()
            .get(&cell.database)
            .and_then(|d| d.tables.get(&cell.table))
            .and_then(|t| t.rows.get(&cell.row_id))
            .map(|values| values[cell.column].clone())
            .ok_or_else(|| Error::client("blob cell no longer exists"))
    }

    fn disconnect(&mut self) {
        if !self.closed {
            self.closed = true;
            self.server.connection_closed();
        }
    }
}

fn op_holds(op: CmpOp, ord: CmpOrdering) -> bool {
    match op {
        CmpOp::Eq => ord == CmpOrdering::Equal,
        CmpOp::Ne => ord != CmpOrdering::Equal,
        CmpOp::Lt => ord == CmpOrdering::Less,
        CmpOp::Gt => ord == CmpOrdering::Greater,
        CmpOp::Le => ord != CmpOrdering::Greater,
        CmpOp::Ge => ord != CmpOrdering::Less,
    }
}

/// SQL comparison; NULL compares as unknown and trailing spaces are ignored
fn compare(a: &Value, b: &Value) -> Option<CmpOrdering> {
    match (a, b) {
        (Value::Null, _) | (_, Value::Null) => None,
        (Value::String(x), Value::String(y)) => Some(x.trim_end_matches(' ').cmp(y.trim_end_matches(' '))),
        (Value::Bytes(x), Value::Bytes(y)) => Some(x.cmp(y)),
        (Value::DateTime(x), Value::DateTime(y)) => Some(x.cmp(y)),
        (Value::Uuid(x), Value::Uuid(y)) => Some(x.cmp(y)),
        (Value::Decimal(x), Value::Decimal(y)) => Some(x.cmp(y)),
        (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
        _ => a.as_f64()?.partial_cmp(&b.as_f64()?),
    }
}

fn column_metadata(column: &Column) -> ColumnMetadata {
    ColumnMetadata::new(column.name.clone(), column.column_type).with_nullable(column.nullable)
}

fn value_type(value: &Value) -> ColumnType {
    match value {
        Value::Null | Value::Int32(_) => ColumnType::Int,
        Value::Bool(_) => ColumnType::Bit,
        Value::UInt8(_) => ColumnType::TinyInt,
        Value::Int16(_) => ColumnType::SmallInt,
        Value::Int64(_) => ColumnType::BigInt,
        Value::Float32(_) => ColumnType::Real,
        Value::Float64(_) => ColumnType::Float,
        Value::Decimal(d) => ColumnType::Decimal {
            precision: 38,
            scale: d.scale().min(38) as u8,
        },
        Value::String(s) => ColumnType::VarChar(s.len().max(1) as u32),
        Value::Bytes(b) => ColumnType::VarBinary(b.len().max(1) as u32),
        Value::DateTime(_) => ColumnType::DateTime,
        Value::Uuid(_) => ColumnType::UniqueIdentifier,
    }
}

impl NativeConnection for MemoryConnection {
    fn server_name(&self) -> &str {
        self.server.name()
    }

    fn database(&self) -> Option<String> {
        Some(self.database.clone())
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutcome> {
        self.ensure_open()?;
        self.cancel.store(false, Ordering::SeqCst);
        let statements =
            sql::parse_batch(sql).map_err(|e| self.server.error(102, 15, e.0))?;

        let mut outcome = StatementOutcome::default();
        for statement in statements {
            if self.cancel.swap(false, Ordering::SeqCst) {
                outcome.cancelled = true;
            }
            if outcome.cancelled {
                debug!(server = %self.server.name(), "Batch cancelled");
                break;
            }
            self.run(statement, params, &mut outcome)?;
        }
        Ok(outcome)
    }

    fn open_cursor(&mut self, spec: &CursorSpec) -> Result<CursorInfo> {
        self.ensure_open()?;
        let name = spec.name().to_ascii_lowercase();
        if self.cursors.contains_key(&name) {
            return Err(self.server.error(
                16915,
                16,
                format!("A cursor with the name '{}' already exists.", spec.name()),
            ));
        }
        let not_a_query = || {
            self.server.error(
                16948,
                16,
                format!("Cursor '{}' must be declared over a single SELECT from a table.", spec.name()),
            )
        };

        let mut statements = sql::parse_batch(&spec.statement())
            .map_err(|e| self.server.error(102, 15, e.0))?;
        let select = match (statements.pop(), statements.is_empty()) {
            (Some(Statement::Select(select)), true) => select,
            _ => return Err(not_a_query()),
        };
        let Some(table_name) = &select.table else {
            return Err(not_a_query());
        };

        let (db, key) = self.table_key(table_name);
        let state = {
            let catalog = self.server.catalog.lock();
            let table = catalog
                .get(&db)
                .and_then(|d| d.tables.get(&key))
                .ok_or_else(|| self.missing_table(table_name))?;

            let projection: Vec<usize> = match &select.projection {
                Projection::All => (0..table.columns.len()).collect(),
                Projection::Count => return Err(not_a_query()),
                Projection::Items(items) => items
                    .iter()
                    .map(|e| match e {
                        Expr::Column(c) => self.column_index(table, c),
                        _ => Err(not_a_query()),
                    })
                    .collect::<Result<_>>()?,
            };
            if let Some(columns) = &select.for_update {
                for c in columns {
                    self.column_index(table, c)?;
                }
            }
            let row_ids = self.matching(table, &select.filter, spec.params())?;

            CursorState {
                database: db,
                table: key,
                projection,
                row_ids,
                pos: 0,
                fetch_seq: 0,
                current: None,
                updatable: select.for_update.clone(),
            }
        };

        let columns = {
            let catalog = self.server.catalog.lock();
            let table = catalog
                .get(&state.database)
                .and_then(|d| d.tables.get(&state.table))
                .ok_or_else(|| self.missing_table(table_name))?;
            state
                .projection
                .iter()
                .enumerate()
                .map(|(i, idx)| column_metadata(&table.columns[*idx]).with_ordinal(i as u32 + 1))
                .collect()
        };

        debug!(cursor = %spec.name(), rows = state.row_ids.len(), "Memory cursor opened");
        self.cursors.insert(name, state);
        Ok(CursorInfo {
            table: table_name.clone(),
            columns,
        })
    }

    fn fetch(&mut self, cursor: &str) -> Result<Option<FetchedRow>> {
        self.ensure_open()?;
        let server = Arc::clone(&self.server);
        let state = self.cursors.get_mut(&cursor.to_ascii_lowercase()).ok_or_else(|| {
            server.error(16916, 16, format!("A cursor with the name '{cursor}' does not exist."))
        })?;

        let catalog = server.catalog.lock();
        let table = catalog
            .get(&state.database)
            .and_then(|d| d.tables.get(&state.table))
            .ok_or_else(|| server.error(208, 16, format!("Invalid object name '{}'.", state.table)))?;

        state.fetch_seq += 1;
        while let Some(id) = state.row_ids.get(state.pos).copied() {
            state.pos += 1;
            let Some(values) = table.rows.get(&id) else {
                continue;
            };
            state.current = Some(id);
            let cells = state
                .projection
                .iter()
                .map(|idx| {
                    let value = &values[*idx];
                    if table.columns[*idx].column_type.is_lob() {
                        Cell::Lob {
                            len: value.byte_len(),
                        }
                    } else {
                        Cell::Value(value.clone())
                    }
                })
                .collect();
            return Ok(Some(FetchedRow {
                row_id: id,
                fetch_seq: state.fetch_seq,
                cells,
            }));
        }
        state.current = None;
        Ok(None)
    }

    fn close_cursor(&mut self, cursor: &str) -> Result<()> {
        if self.cursors.remove(&cursor.to_ascii_lowercase()).is_some() {
            debug!(cursor, "Memory cursor closed");
        }
        Ok(())
    }

    fn bulk_load(&mut self, table_name: &str, columns: &[BulkColumn], rows: &[Vec<Value>]) -> Result<u64> {
        self.ensure_open()?;
        let (db, key) = self.table_key(table_name);
        let mut catalog = self.server.catalog.lock();
        let table = catalog
            .get_mut(&db)
            .and_then(|d| d.tables.get_mut(&key))
            .ok_or_else(|| self.missing_table(table_name))?;

        if let Some(bad) = columns
            .iter()
            .find(|c| c.position == 0 || c.position > table.columns.len())
        {
            return Err(self.server.error(
                4819,
                16,
                format!(
                    "Cannot bulk load. Column position {} does not exist in table '{}'.",
                    bad.position, table.name
                ),
            ));
        }

        let mut prepared = Vec::with_capacity(rows.len());
        for row in rows {
            let mut supplied: Vec<Value> = vec![Value::Null; table.columns.len()];
            for (column, value) in columns.iter().zip(row) {
                supplied[column.position - 1] = value.clone();
            }
            let values = table
                .columns
                .iter()
                .zip(supplied)
                .map(|(col, v)| self.store(&table.name, col, v))
                .collect::<Result<Vec<_>>>()?;
            prepared.push(values);
        }

        let count = prepared.len() as u64;
        for values in prepared {
            table.insert(values);
        }
        Ok(count)
    }

    fn blob_size(&mut self, item: &ItemDescriptor) -> Result<Option<usize>> {
        self.ensure_open()?;
        let cell = self.resolve(item)?;
        Ok(self.cell_value(&cell)?.byte_len())
    }

    fn read_blob(&mut self, item: &ItemDescriptor, offset: usize, buf: &mut [u8]) -> Result<usize> {
        self.ensure_open()?;
        let cell = self.resolve(item)?;
        let value = self.cell_value(&cell)?;
        let bytes = value.as_bytes().unwrap_or_default();
        if offset >= bytes.len() {
            return Ok(0);
        }
        let n = buf.len().min(bytes.len() - offset);
        buf[..n].copy_from_slice(&bytes[offset..offset + n]);
        Ok(n)
    }

    fn begin_blob_write(&mut self, item: &ItemDescriptor, len: usize, options: &BlobOptions) -> Result<()> {
        self.ensure_open()?;
        if self.blob_write.is_some() {
            return Err(Error::client("a blob write is already in progress on this connection"));
        }
        let cell = self.resolve(item)?;
        debug!(item = %item, len, log_changes = options.log_changes, "Memory blob write started");
        self.blob_write = Some(PendingWrite {
            cell,
            expected: len,
            data: Vec::with_capacity(len),
            log_changes: options.log_changes,
        });
        Ok(())
    }

    fn write_blob_chunk(&mut self, data: &[u8]) -> Result<()> {
        self.ensure_open()?;
        let pending = self
            .blob_write
            .as_mut()
            .ok_or_else(|| Error::client("no blob write in progress"))?;
        if pending.data.len() + data.len() > pending.expected {
            return Err(Error::client(format!(
                "blob write exceeds declared length {}",
                pending.expected
            )));
        }
        pending.data.extend_from_slice(data);
        Ok(())
    }

    fn finish_blob_write(&mut self) -> Result<()> {
        self.ensure_open()?;
        let pending = self
            .blob_write
            .take()
            .ok_or_else(|| Error::client("no blob write in progress"))?;
        if pending.data.len() != pending.expected {
            return Err(Error::client(format!(
                "blob write ended after {} of {} bytes",
                pending.data.len(),
                pending.expected
            )));
        }

        let cell = &pending.cell;
        let mut catalog = self.server.catalog.lock();
        let table = catalog
            .get_mut(&cell.database)
            .and_then(|d| d.tables.get_mut(&cell.table))
            .ok_or_else(|| Error::client("blob cell no longer exists"))?;
        let column = table.columns[cell.column].clone();
        let value = match column.column_type.class() {
            TypeClass::Character => Value::String(String::from_utf8(pending.data).map_err(|_| {
                self.server.error(245, 16, format!("Invalid character data for column '{}'.", column.name))
            })?),
            _ => Value::Bytes(pending.data),
        };
        let value = self.store(&table.name, &column, value)?;
        let row = table
            .rows
            .get_mut(&cell.row_id)
            .ok_or_else(|| Error::client("blob cell no longer exists"))?;
        let before = std::mem::replace(&mut row[cell.column], value);
        if self.tran_count > 0 {
            if pending.log_changes {
                let mut previous = row.clone();
                previous[cell.column] = before;
                self.undo.push(Undo::Restore {
                    database: cell.database.clone(),
                    table: cell.table.clone(),
                    row_id: cell.row_id,
                    before: previous,
                });
            } else {
                warn!(table = %table.name, "Unlogged blob write inside a transaction will not roll back");
            }
        }
        Ok(())
    }

    fn abort_blob_write(&mut self) {
        self.blob_write = None;
    }

    fn take_messages(&mut self) -> Vec<ServerMessage> {
        std::mem::take(&mut self.messages)
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn is_alive(&mut self) -> bool {
        !self.closed && self.server.is_online()
    }

    fn reset(&mut self) -> Result<()> {
        self.ensure_open()?;
        if self.tran_count > 0 {
            debug!(server = %self.server.name(), "Rolling back open transaction before pooling");
            self.roll_back();
        }
        self.cursors.clear();
        self.blob_write = None;
        self.messages.clear();
        self.cancel.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.disconnect();
        Ok(())
    }
}

impl Drop for MemoryConnection {
    fn drop(&mut self) {
        self.disconnect();
    }
}
