//! SQL Server driver over TDS (tiberius)
//!
//! The driver is registered as `tds`. Each connection owns a
//! current-thread tokio runtime and blocks on it, so the async client fits
//! the thread-per-connection model of [`NativeConnection`].
//!
//! Supported: parameterized batches, transactions and bulk load. Cursors and
//! blob streams are not exposed by the client and report
//! [`Error::Unsupported`].
//!
//! Cancellation is checked before a batch is sent. A statement that runs past
//! its timeout is abandoned and the connection is marked dead, since the TDS
//! stream cannot be resumed mid-response.

use std::borrow::Cow;
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tiberius::{AuthMethod, Client, ColumnData, Config, TokenRow};
use tokio::net::TcpStream;
use tokio::runtime::Runtime;
use tokio_util::compat::{Compat, TokioAsyncWriteCompatExt};
use tracing::{debug, warn};

use crate::driver::{
    BulkColumn, ConnectOptions, Driver, DriverCapabilities, NativeConnection, ResultSet,
    ServerMessage, StatementOutcome,
};
use crate::error::{Error, Result, Severity};
use crate::mapper::ServerRef;
use crate::params::ConnParams;
use crate::security::{validate_object_name, validate_sql_identifier};
use crate::types::{ColumnMetadata, ColumnType, Value, DATETIME_FORMAT};

/// Default TDS listener port
pub const DEFAULT_PORT: u16 = 1433;

/// Driver for Microsoft SQL Server
#[derive(Debug, Default, Clone)]
pub struct TdsDriver;

impl TdsDriver {
    /// Create the driver
    pub fn new() -> Self {
        Self
    }
}

impl Driver for TdsDriver {
    fn name(&self) -> &str {
        "tds"
    }

    fn capabilities(&self) -> DriverCapabilities {
        DriverCapabilities::minimal().with_bulk_insert(true)
    }

    fn connect(
        &self,
        server: &ServerRef,
        params: &ConnParams,
        options: &ConnectOptions,
    ) -> Result<Box<dyn NativeConnection>> {
        let mut config = Config::new();
        config.host(&server.host);
        config.port(server.port.or(params.explicit_port()).unwrap_or(DEFAULT_PORT));
        if let Some(database) = params.database() {
            config.database(database);
        }
        let user = params.user().unwrap_or("sa");
        let password = params.password().map(|p| p.expose_secret()).unwrap_or("");
        config.authentication(AuthMethod::sql_server(user, password));
        if params.option("trust_cert").is_some_and(|v| v.eq_ignore_ascii_case("true")) {
            config.trust_cert();
        }

        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(|e| Error::connection_with_source("failed to start TDS runtime", e))?;

        let login = async {
            let tcp = TcpStream::connect(config.get_addr())
                .await
                .map_err(|e| Error::connection(format!("Failed to connect to {server}: {e}")))?;
            tcp.set_nodelay(true).ok();
            Client::connect(config, tcp.compat_write())
                .await
                .map_err(|e| Error::connection(format!("Failed to authenticate with {server}: {e}")))
        };
        let client = match options.login_timeout {
            Some(limit) => runtime
                .block_on(tokio::time::timeout(limit, login))
                .map_err(|_| Error::timeout(format!("login to {server} timed out after {limit:?}")))??,
            None => runtime.block_on(login)?,
        };

        debug!(server = %server, "TDS connection established");
        Ok(Box::new(TdsConnection {
            runtime,
            client,
            server: server.name.clone(),
            database: params.database().map(str::to_string),
            timeout: options.timeout,
            cancel: Arc::clone(&options.cancel),
            broken: false,
            closed: false,
        }))
    }
}

/// Owned parameter for typed TDS binding; values are never interpolated
struct SqlParam<'a>(&'a Value);

impl tiberius::ToSql for SqlParam<'_> {
    fn to_sql(&self) -> ColumnData<'_> {
        column_data(self.0)
    }
}

fn column_data(value: &Value) -> ColumnData<'static> {
    match value {
        Value::Null => ColumnData::String(None),
        Value::Bool(b) => ColumnData::Bit(Some(*b)),
        Value::UInt8(n) => ColumnData::U8(Some(*n)),
        Value::Int16(n) => ColumnData::I16(Some(*n)),
        Value::Int32(n) => ColumnData::I32(Some(*n)),
        Value::Int64(n) => ColumnData::I64(Some(*n)),
        Value::Float32(n) => ColumnData::F32(Some(*n)),
        Value::Float64(n) => ColumnData::F64(Some(*n)),
        Value::String(s) => ColumnData::String(Some(Cow::Owned(s.clone()))),
        Value::Bytes(b) => ColumnData::Binary(Some(Cow::Owned(b.clone()))),
        Value::Uuid(u) => ColumnData::Guid(Some(*u)),
        // bound as typed strings; the server converts implicitly
        Value::Decimal(d) => ColumnData::String(Some(Cow::Owned(d.to_string()))),
        Value::DateTime(dt) => {
            ColumnData::String(Some(Cow::Owned(dt.format(DATETIME_FORMAT).to_string())))
        }
    }
}

fn decode(row: &tiberius::Row, idx: usize) -> Value {
    // typed probes before raw bytes so BIT does not decode as binary
    if let Ok(Some(v)) = row.try_get::<bool, _>(idx) {
        return Value::Bool(v);
    }
    if let Ok(Some(v)) = row.try_get::<u8, _>(idx) {
        return Value::UInt8(v);
    }
    if let Ok(Some(v)) = row.try_get::<i16, _>(idx) {
        return Value::Int16(v);
    }
    if let Ok(Some(v)) = row.try_get::<i32, _>(idx) {
        return Value::Int32(v);
    }
    if let Ok(Some(v)) = row.try_get::<i64, _>(idx) {
        return Value::Int64(v);
    }
    if let Ok(Some(v)) = row.try_get::<f32, _>(idx) {
        return Value::Float32(v);
    }
    if let Ok(Some(v)) = row.try_get::<f64, _>(idx) {
        return Value::Float64(v);
    }
    if let Ok(Some(v)) = row.try_get::<&str, _>(idx) {
        return Value::String(v.to_string());
    }
    if let Ok(Some(v)) = row.try_get::<uuid::Uuid, _>(idx) {
        return Value::Uuid(v);
    }
    if let Ok(Some(v)) = row.try_get::<rust_decimal::Decimal, _>(idx) {
        return Value::Decimal(v);
    }
    if let Ok(Some(v)) = row.try_get::<chrono::NaiveDateTime, _>(idx) {
        return Value::DateTime(v);
    }
    if let Ok(Some(bytes)) = row.try_get::<&[u8], _>(idx) {
        return Value::Bytes(bytes.to_vec());
    }
    Value::Null
}

fn column_type(ty: tiberius::ColumnType) -> ColumnType {
    use tiberius::ColumnType as T;
    match ty {
        T::Bit | T::Bitn => ColumnType::Bit,
        T::Int1 => ColumnType::TinyInt,
        T::Int2 => ColumnType::SmallInt,
        T::Int4 | T::Intn => ColumnType::Int,
        T::Int8 => ColumnType::BigInt,
        T::Float4 => ColumnType::Real,
        T::Float8 | T::Floatn => ColumnType::Float,
        T::Decimaln | T::Numericn | T::Money | T::Money4 => ColumnType::Decimal {
            precision: 38,
            scale: 4,
        },
        T::Datetime | T::Datetime4 | T::Datetimen | T::Datetime2 | T::Daten => ColumnType::DateTime,
        T::Guid => ColumnType::UniqueIdentifier,
        T::BigBinary | T::BigVarBin => ColumnType::VarBinary(8000),
        T::Image => ColumnType::Image,
        T::Text | T::NText | T::Xml => ColumnType::Text,
        _ => ColumnType::VarChar(8000),
    }
}

fn into_error(server: &str, err: tiberius::error::Error) -> Error {
    match err {
        tiberius::error::Error::Server(token) => Error::from_server_message(
            token.code() as i32,
            Severity::from_class(token.class()),
            token.state(),
            if token.server().is_empty() {
                server.to_string()
            } else {
                token.server().to_string()
            },
            token.message(),
        ),
        tiberius::error::Error::Io { kind, message } => {
            Error::connection(format!("{server}: {kind:?}: {message}"))
        }
        other => Error::data_source(format!("{server}: {other}")),
    }
}

/// One TDS connection
struct TdsConnection {
    runtime: Runtime,
    client: Client<Compat<TcpStream>>,
    server: String,
    database: Option<String>,
    timeout: Option<Duration>,
    cancel: Arc<AtomicBool>,
    broken: bool,
    closed: bool,
}

impl TdsConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed || self.broken {
            return Err(Error::connection(format!("connection to {} is closed", self.server)));
        }
        Ok(())
    }

    /// Drive a client future under the statement timeout
    fn block<T, F>(runtime: &Runtime, timeout: Option<Duration>, broken: &mut bool, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        match timeout {
            Some(limit) => match runtime.block_on(tokio::time::timeout(limit, fut)) {
                Ok(result) => result,
                Err(_) => {
                    *broken = true;
                    Err(Error::timeout(format!("statement timed out after {limit:?}")))
                }
            },
            None => runtime.block_on(fut),
        }
    }
}

/// Row-returning batches go through `query`; everything else through
/// `execute`, which is the only path reporting affected row counts.
fn returns_rows(sql: &str) -> bool {
    let head = sql.trim_start();
    ["SELECT", "WITH", "EXEC", "EXECUTE"]
        .iter()
        .any(|kw| head.len() >= kw.len() && head[..kw.len()].eq_ignore_ascii_case(kw))
}

impl NativeConnection for TdsConnection {
    fn server_name(&self) -> &str {
        &self.server
    }

    fn database(&self) -> Option<String> {
        self.database.clone()
    }

    fn execute(&mut self, sql: &str, params: &[Value]) -> Result<StatementOutcome> {
        self.ensure_open()?;
        if self.cancel.swap(false, Ordering::SeqCst) {
            debug!(server = %self.server, "Batch cancelled before send");
            return Ok(StatementOutcome {
                cancelled: true,
                ..StatementOutcome::default()
            });
        }

        let bound: Vec<SqlParam<'_>> = params.iter().map(SqlParam).collect();
        let refs: Vec<&dyn tiberius::ToSql> = bound.iter().map(|p| p as &dyn tiberius::ToSql).collect();
        let server = self.server.clone();
        let client = &mut self.client;

        if returns_rows(sql) {
            let fut = async {
                let stream = client.query(sql, &refs).await.map_err(|e| into_error(&server, e))?;
                stream.into_results().await.map_err(|e| into_error(&server, e))
            };
            let results = Self::block(&self.runtime, self.timeout, &mut self.broken, fut)?;
            let result_sets = results
                .into_iter()
                .map(|rows| {
                    let columns = rows
                        .first()
                        .map(|r| {
                            r.columns()
                                .iter()
                                .enumerate()
                                .map(|(i, c)| {
                                    ColumnMetadata::new(c.name(), column_type(c.column_type()))
                                        .with_ordinal(i as u32 + 1)
                                })
                                .collect()
                        })
                        .unwrap_or_default();
                    let rows = rows
                        .iter()
                        .map(|r| (0..r.len()).map(|i| decode(r, i)).collect())
                        .collect();
                    ResultSet { columns, rows }
                })
                .collect();
            Ok(StatementOutcome {
                result_sets,
                ..StatementOutcome::default()
            })
        } else {
            let fut = async { client.execute(sql, &refs).await.map_err(|e| into_error(&server, e)) };
            let result = Self::block(&self.runtime, self.timeout, &mut self.broken, fut)?;
            Ok(StatementOutcome {
                rows_affected: result.total(),
                ..StatementOutcome::default()
            })
        }
    }

    fn use_database(&mut self, database: &str) -> Result<()> {
        validate_sql_identifier(database)?;
        self.execute(&format!("USE [{database}]"), &[])?;
        self.database = Some(database.to_string());
        Ok(())
    }

    fn bulk_load(&mut self, table: &str, columns: &[BulkColumn], rows: &[Vec<Value>]) -> Result<u64> {
        self.ensure_open()?;
        validate_object_name(table)?;
        let width = columns.iter().map(|c| c.position).max().unwrap_or(0);
        let server = self.server.clone();
        let client = &mut self.client;

        let fut = async {
            let mut request = client.bulk_insert(table).await.map_err(|e| into_error(&server, e))?;
            for row in rows {
                let mut cells: Vec<ColumnData<'static>> = vec![ColumnData::String(None); width];
                for (column, value) in columns.iter().zip(row) {
                    cells[column.position - 1] = column_data(value);
                }
                let mut token = TokenRow::new();
                for cell in cells {
                    token.push(cell);
                }
                request.send(token).await.map_err(|e| into_error(&server, e))?;
            }
            let result = request.finalize().await.map_err(|e| into_error(&server, e))?;
            Ok(result.total())
        };
        let loaded = Self::block(&self.runtime, self.timeout, &mut self.broken, fut)?;
        debug!(server = %self.server, table, rows = loaded, "TDS bulk load committed");
        Ok(loaded)
    }

    fn take_messages(&mut self) -> Vec<ServerMessage> {
        Vec::new()
    }

    fn cancel(&mut self) -> Result<()> {
        self.cancel.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn set_timeout(&mut self, timeout: Option<Duration>) {
        self.timeout = timeout;
    }

    fn is_alive(&mut self) -> bool {
        if self.closed || self.broken {
            return false;
        }
        let client = &mut self.client;
        let alive = self
            .runtime
            .block_on(async { client.simple_query("SELECT 1").await?.into_results().await })
            .is_ok();
        if !alive {
            warn!(server = %self.server, "TDS liveness probe failed");
            self.broken = true;
        }
        alive
    }

    fn reset(&mut self) -> Result<()> {
        self.execute("IF @@TRANCOUNT > 0 ROLLBACK TRANSACTION", &[])?;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_param_null_and_scalars() {
        assert!(matches!(column_data(&Value::Null), ColumnData::String(None)));
        assert!(matches!(column_data(&Value::Bool(true)), ColumnData::Bit(Some(true))));
        assert!(matches!(column_data(&Value::Int64(-5)), ColumnData::I64(Some(-5))));
        assert!(matches!(column_data(&Value::UInt8(7)), ColumnData::U8(Some(7))));
    }

    #[test]
    fn test_param_string_is_bound_verbatim() {
        let hostile = "'; DROP TABLE users; --";
        match column_data(&Value::String(hostile.into())) {
            ColumnData::String(Some(s)) => assert_eq!(s, hostile),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_returns_rows() {
        assert!(returns_rows("  select 1"));
        assert!(returns_rows("EXEC sp_who"));
        assert!(!returns_rows("UPDATE t SET a = 1"));
        assert!(!returns_rows("SEL"));
    }

    #[test]
    fn test_capabilities() {
        let caps = TdsDriver::new().capabilities();
        assert!(caps.bulk_insert);
        assert!(!caps.cursors);
        assert!(!caps.blobs);
    }
}
