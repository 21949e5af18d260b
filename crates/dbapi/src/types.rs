//! Value types for dbapi
//!
//! The type system covers what the TDS driver family transports:
//! - Integers, bit, floating point and exact decimals
//! - Character and binary data, including TEXT/IMAGE large objects
//! - DATETIME and UNIQUEIDENTIFIER
//!
//! Two policies that differ between backends are explicit values here
//! instead of per-driver behavior: [`OverflowPolicy`] (what happens when a
//! value exceeds a column's declared width) and [`StringNullPolicy`]
//! (how optional or empty strings become [`Value`]s).

use chrono::NaiveDateTime;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use uuid::Uuid;

use crate::error::{Error, Result};

/// SQL value type that can hold any database value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Value {
    /// SQL NULL
    Null,
    /// BIT
    Bool(bool),
    /// TINYINT (unsigned on TDS servers)
    UInt8(u8),
    /// SMALLINT
    Int16(i16),
    /// INT
    Int32(i32),
    /// BIGINT
    Int64(i64),
    /// REAL
    Float32(f32),
    /// FLOAT
    Float64(f64),
    /// DECIMAL / NUMERIC
    Decimal(Decimal),
    /// CHAR, VARCHAR, TEXT
    String(String),
    /// BINARY, VARBINARY, IMAGE
    Bytes(Vec<u8>),
    /// DATETIME
    DateTime(NaiveDateTime),
    /// UNIQUEIDENTIFIER
    Uuid(Uuid),
}

impl Value {
    /// Check if value is NULL
    #[inline]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Build a string value from an optional string under an explicit policy.
    ///
    /// `None` is always NULL. `Some("")` is NULL only under
    /// [`StringNullPolicy::EmptyIsNull`].
    pub fn from_opt_str(value: Option<&str>, policy: StringNullPolicy) -> Self {
        match value {
            None => Self::Null,
            Some("") if policy == StringNullPolicy::EmptyIsNull => Self::Null,
            Some(s) => Self::String(s.to_owned()),
        }
    }

    /// Get SQL type name
    pub fn sql_type(&self) -> &'static str {
        match self {
            Self::Null => "NULL",
            Self::Bool(_) => "BIT",
            Self::UInt8(_) => "TINYINT",
            Self::Int16(_) => "SMALLINT",
            Self::Int32(_) => "INT",
            Self::Int64(_) => "BIGINT",
            Self::Float32(_) => "REAL",
            Self::Float64(_) => "FLOAT",
            Self::Decimal(_) => "DECIMAL",
            Self::String(_) => "VARCHAR",
            Self::Bytes(_) => "VARBINARY",
            Self::DateTime(_) => "DATETIME",
            Self::Uuid(_) => "UNIQUEIDENTIFIER",
        }
    }

    /// Try to convert to bool
    pub fn as_bool(&self) -> Option<bool> {
        match self {
            Self::Bool(b) => Some(*b),
            Self::UInt8(n) => Some(*n != 0),
            Self::Int16(n) => Some(*n != 0),
            Self::Int32(n) => Some(*n != 0),
            Self::Int64(n) => Some(*n != 0),
            Self::String(s) => match s.trim().to_lowercase().as_str() {
                "true" | "t" | "yes" | "y" | "1" => Some(true),
                "false" | "f" | "no" | "n" | "0" => Some(false),
                _ => None,
            },
            _ => None,
        }
    }

    /// Try to convert to i64
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Self::Bool(b) => Some(i64::from(*b)),
            Self::UInt8(n) => Some(i64::from(*n)),
            Self::Int16(n) => Some(i64::from(*n)),
            Self::Int32(n) => Some(i64::from(*n)),
            Self::Int64(n) => Some(*n),
            Self::Float32(n) if n.is_finite() => Some(*n as i64),
            Self::Float64(n) if n.is_finite() => Some(*n as i64),
            Self::Decimal(d) => d.trunc().to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to convert to f64
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::UInt8(n) => Some(f64::from(*n)),
            Self::Int16(n) => Some(f64::from(*n)),
            Self::Int32(n) => Some(f64::from(*n)),
            Self::Int64(n) => Some(*n as f64),
            Self::Float32(n) => Some(f64::from(*n)),
            Self::Float64(n) => Some(*n),
            Self::Decimal(d) => d.to_string().parse().ok(),
            Self::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Try to borrow as string
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s.as_str()),
            _ => None,
        }
    }

    /// Try to borrow as bytes
    pub fn as_bytes(&self) -> Option<&[u8]> {
        match self {
            Self::Bytes(b) => Some(b.as_slice()),
            Self::String(s) => Some(s.as_bytes()),
            _ => None,
        }
    }

    /// Try to convert to UUID
    pub fn as_uuid(&self) -> Option<Uuid> {
        match self {
            Self::Uuid(u) => Some(*u),
            Self::String(s) => Uuid::parse_str(s.trim()).ok(),
            Self::Bytes(b) if b.len() == 16 => Uuid::from_slice(b).ok(),
            _ => None,
        }
    }

    /// Length in bytes of character/binary payloads
    pub fn byte_len(&self) -> Option<usize> {
        match self {
            Self::String(s) => Some(s.len()),
            Self::Bytes(b) => Some(b.len()),
            _ => None,
        }
    }

    /// Cut a character or binary payload to at most `width` bytes,
    /// never splitting a UTF-8 sequence
    pub fn truncated(self, width: usize) -> Value {
        match self {
            Self::String(mut s) => {
                let mut cut = width.min(s.len());
                while !s.is_char_boundary(cut) {
                    cut -= 1;
                }
                s.truncate(cut);
                Self::String(s)
            }
            Self::Bytes(mut b) => {
                b.truncate(width);
                Self::Bytes(b)
            }
            other => other,
        }
    }

    /// Convert to owned string representation
    pub fn as_string(&self) -> Option<String> {
        match self {
            Self::Null => None,
            Self::String(s) => Some(s.clone()),
            Self::Bytes(b) => Some(hex_literal(b)),
            Self::Bool(b) => Some(if *b { "1".into() } else { "0".into() }),
            Self::UInt8(n) => Some(n.to_string()),
            Self::Int16(n) => Some(n.to_string()),
            Self::Int32(n) => Some(n.to_string()),
            Self::Int64(n) => Some(n.to_string()),
            Self::Float32(n) => Some(n.to_string()),
            Self::Float64(n) => Some(n.to_string()),
            Self::Decimal(d) => Some(d.to_string()),
            Self::DateTime(dt) => Some(dt.format(DATETIME_FORMAT).to_string()),
            Self::Uuid(u) => Some(u.to_string()),
        }
    }

    /// Convert the value for storage in a column of type `ty`.
    ///
    /// Width limits are not applied here; see [`OverflowPolicy`].
    pub fn coerce(&self, ty: &ColumnType) -> Result<Value> {
        if self.is_null() {
            return Ok(Value::Null);
        }
        let mismatch = || {
            Error::type_conversion(format!(
                "cannot convert {} to {}",
                self.sql_type(),
                ty.sql_name()
            ))
        };
        let int = |lo: i64, hi: i64| -> Result<i64> {
            let n = self.as_i64().ok_or_else(mismatch)?;
            if n < lo || n > hi {
                return Err(Error::type_conversion(format!(
                    "value {} out of range for {}",
                    n,
                    ty.sql_name()
                )));
            }
            Ok(n)
        };
        Ok(match ty {
            ColumnType::Bit => Value::Bool(self.as_bool().ok_or_else(mismatch)?),
            ColumnType::TinyInt => Value::UInt8(int(0, i64::from(u8::MAX))? as u8),
            ColumnType::SmallInt => {
                Value::Int16(int(i64::from(i16::MIN), i64::from(i16::MAX))? as i16)
            }
            ColumnType::Int => Value::Int32(int(i64::from(i32::MIN), i64::from(i32::MAX))? as i32),
            ColumnType::BigInt => Value::Int64(int(i64::MIN, i64::MAX)?),
            ColumnType::Real => Value::Float32(self.as_f64().ok_or_else(mismatch)? as f32),
            ColumnType::Float => Value::Float64(self.as_f64().ok_or_else(mismatch)?),
            ColumnType::Decimal { scale, .. } => {
                let mut d = match self {
                    Value::Decimal(d) => *d,
                    Value::String(s) => s.trim().parse::<Decimal>().map_err(|_| mismatch())?,
                    Value::Float32(_) | Value::Float64(_) => {
                        Decimal::try_from(self.as_f64().ok_or_else(mismatch)?)
                            .map_err(|_| mismatch())?
                    }
                    other => Decimal::from(other.as_i64().ok_or_else(mismatch)?),
                };
                d.rescale(u32::from(*scale));
                Value::Decimal(d)
            }
            ColumnType::Char(_) | ColumnType::VarChar(_) | ColumnType::Text => match self {
                Value::Bytes(b) => Value::String(
                    String::from_utf8(b.clone()).map_err(|_| mismatch())?,
                ),
                other => Value::String(other.as_string().ok_or_else(mismatch)?),
            },
            ColumnType::Binary(_) | ColumnType::VarBinary(_) | ColumnType::Image => {
                Value::Bytes(self.as_bytes().ok_or_else(mismatch)?.to_vec())
            }
            ColumnType::DateTime => match self {
                Value::DateTime(dt) => Value::DateTime(*dt),
                Value::String(s) => Value::DateTime(parse_datetime(s).ok_or_else(mismatch)?),
                _ => return Err(mismatch()),
            },
            ColumnType::UniqueIdentifier => Value::Uuid(self.as_uuid().ok_or_else(mismatch)?),
        })
    }
}

/// Canonical DATETIME text form
pub const DATETIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

/// Parse the DATETIME literal forms accepted by TDS servers
pub fn parse_datetime(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    ["%Y-%m-%d %H:%M:%S%.f", "%Y-%m-%dT%H:%M:%S%.f", "%Y-%m-%d %H:%M:%S"]
        .iter()
        .find_map(|fmt| NaiveDateTime::parse_from_str(s, fmt).ok())
        .or_else(|| {
            chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d")
                .ok()
                .and_then(|d| d.and_hms_opt(0, 0, 0))
        })
}

fn hex_literal(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(2 + bytes.len() * 2);
    out.push_str("0x");
    for b in bytes {
        out.push_str(&format!("{b:02X}"));
    }
    out
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_string() {
            Some(s) => f.write_str(&s),
            None => f.write_str("NULL"),
        }
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u8> for Value {
    fn from(v: u8) -> Self {
        Self::UInt8(v)
    }
}

impl From<i16> for Value {
    fn from(v: i16) -> Self {
        Self::Int16(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Self::Int32(v)
    }
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Self::Int64(v)
    }
}

impl From<f32> for Value {
    fn from(v: f32) -> Self {
        Self::Float32(v)
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Self::Float64(v)
    }
}

impl From<Decimal> for Value {
    fn from(v: Decimal) -> Self {
        Self::Decimal(v)
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Self::String(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Self::String(v.to_owned())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Self::Bytes(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Self::Bytes(v.to_vec())
    }
}

impl From<NaiveDateTime> for Value {
    fn from(v: NaiveDateTime) -> Self {
        Self::DateTime(v)
    }
}

impl From<Uuid> for Value {
    fn from(v: Uuid) -> Self {
        Self::Uuid(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(val) => val.into(),
            None => Self::Null,
        }
    }
}

/// How optional or empty strings are turned into values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StringNullPolicy {
    /// `Some("")` stays an empty, non-NULL string
    #[default]
    EmptyIsEmpty,
    /// `Some("")` becomes NULL
    EmptyIsNull,
}

/// Broad class of a column type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TypeClass {
    /// Integer, bit, floating point and decimal types
    Numeric,
    /// CHAR, VARCHAR, TEXT
    Character,
    /// BINARY, VARBINARY, IMAGE
    Binary,
    /// DATETIME
    Temporal,
    /// UNIQUEIDENTIFIER
    Identifier,
}

/// Column type as declared on the server
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(missing_docs)]
pub enum ColumnType {
    Bit,
    TinyInt,
    SmallInt,
    Int,
    BigInt,
    Real,
    Float,
    Decimal { precision: u8, scale: u8 },
    Char(u32),
    VarChar(u32),
    Text,
    Binary(u32),
    VarBinary(u32),
    Image,
    DateTime,
    UniqueIdentifier,
}

impl ColumnType {
    /// Parse a type name with its optional width arguments
    pub fn parse(name: &str, args: &[u32]) -> Result<Self> {
        let width = |default: u32| args.first().copied().unwrap_or(default);
        Ok(match name.to_ascii_uppercase().as_str() {
            "BIT" => Self::Bit,
            "TINYINT" => Self::TinyInt,
            "SMALLINT" => Self::SmallInt,
            "INT" | "INTEGER" => Self::Int,
            "BIGINT" => Self::BigInt,
            "REAL" => Self::Real,
            "FLOAT" => Self::Float,
            "DECIMAL" | "NUMERIC" => Self::Decimal {
                precision: width(18).min(38) as u8,
                scale: args.get(1).copied().unwrap_or(0).min(38) as u8,
            },
            "CHAR" => Self::Char(width(1)),
            "VARCHAR" => Self::VarChar(width(1)),
            "TEXT" => Self::Text,
            "BINARY" => Self::Binary(width(1)),
            "VARBINARY" => Self::VarBinary(width(1)),
            "IMAGE" => Self::Image,
            "DATETIME" => Self::DateTime,
            "UNIQUEIDENTIFIER" => Self::UniqueIdentifier,
            other => return Err(Error::config(format!("unknown column type: {other}"))),
        })
    }

    /// SQL type name without width
    pub fn sql_name(&self) -> &'static str {
        match self {
            Self::Bit => "BIT",
            Self::TinyInt => "TINYINT",
            Self::SmallInt => "SMALLINT",
            Self::Int => "INT",
            Self::BigInt => "BIGINT",
            Self::Real => "REAL",
            Self::Float => "FLOAT",
            Self::Decimal { .. } => "DECIMAL",
            Self::Char(_) => "CHAR",
            Self::VarChar(_) => "VARCHAR",
            Self::Text => "TEXT",
            Self::Binary(_) => "BINARY",
            Self::VarBinary(_) => "VARBINARY",
            Self::Image => "IMAGE",
            Self::DateTime => "DATETIME",
            Self::UniqueIdentifier => "UNIQUEIDENTIFIER",
        }
    }

    /// Type class
    pub fn class(&self) -> TypeClass {
        match self {
            Self::Char(_) | Self::VarChar(_) | Self::Text => TypeClass::Character,
            Self::Binary(_) | Self::VarBinary(_) | Self::Image => TypeClass::Binary,
            Self::DateTime => TypeClass::Temporal,
            Self::UniqueIdentifier => TypeClass::Identifier,
            _ => TypeClass::Numeric,
        }
    }

    /// Whether the column holds a large object (TEXT / IMAGE)
    #[inline]
    pub fn is_lob(&self) -> bool {
        matches!(self, Self::Text | Self::Image)
    }

    /// Declared width for fixed and variable width character/binary types
    pub fn declared_width(&self) -> Option<u32> {
        match self {
            Self::Char(n) | Self::VarChar(n) | Self::Binary(n) | Self::VarBinary(n) => Some(*n),
            _ => None,
        }
    }
}

impl fmt::Display for ColumnType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decimal { precision, scale } => write!(f, "DECIMAL({precision},{scale})"),
            other => match other.declared_width() {
                Some(w) => write!(f, "{}({})", other.sql_name(), w),
                None => f.write_str(other.sql_name()),
            },
        }
    }
}

/// What to do with a value longer than its column's declared width
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowAction {
    /// Cut the value to the declared width
    Truncate,
    /// Fail with a server error
    Reject,
}

/// Width overflow handling per type class
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OverflowPolicy {
    /// Character columns
    pub character: OverflowAction,
    /// Binary columns
    pub binary: OverflowAction,
}

impl Default for OverflowPolicy {
    fn default() -> Self {
        Self {
            character: OverflowAction::Truncate,
            binary: OverflowAction::Reject,
        }
    }
}

impl OverflowPolicy {
    /// Reject every overflow
    pub const fn strict() -> Self {
        Self {
            character: OverflowAction::Reject,
            binary: OverflowAction::Reject,
        }
    }

    /// Truncate every overflow
    pub const fn lenient() -> Self {
        Self {
            character: OverflowAction::Truncate,
            binary: OverflowAction::Truncate,
        }
    }

    /// Action for a column type; `None` when width does not apply
    pub fn action_for(&self, ty: &ColumnType) -> Option<OverflowAction> {
        ty.declared_width()?;
        match ty.class() {
            TypeClass::Character => Some(self.character),
            TypeClass::Binary => Some(self.binary),
            _ => None,
        }
    }
}

/// Database row as ordered column values
#[derive(Debug, Clone, PartialEq)]
pub struct Row {
    /// Column names
    columns: Vec<String>,
    /// Column values (same order as columns)
    values: Vec<Value>,
}

impl Row {
    /// Create a new row
    pub fn new(columns: Vec<String>, values: Vec<Value>) -> Self {
        debug_assert_eq!(columns.len(), values.len());
        Self { columns, values }
    }

    /// Get column count
    #[inline]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    /// Check if row is empty
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Get column names
    #[inline]
    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    /// Get all values
    #[inline]
    pub fn values(&self) -> &[Value] {
        &self.values
    }

    /// Get value by column index
    #[inline]
    pub fn get(&self, idx: usize) -> Option<&Value> {
        self.values.get(idx)
    }

    /// Get value by column name
    pub fn get_by_name(&self, name: &str) -> Option<&Value> {
        self.columns
            .iter()
            .position(|c| c.eq_ignore_ascii_case(name))
            .and_then(|idx| self.values.get(idx))
    }

    /// Convert row to HashMap
    pub fn into_map(self) -> HashMap<String, Value> {
        self.columns.into_iter().zip(self.values).collect()
    }
}

/// Column metadata
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMetadata {
    /// Column name
    pub name: String,
    /// Declared type
    pub column_type: ColumnType,
    /// Whether column is nullable
    pub nullable: bool,
    /// Column ordinal (1-based)
    pub ordinal: u32,
}

impl ColumnMetadata {
    /// Create basic column metadata
    pub fn new(name: impl Into<String>, column_type: ColumnType) -> Self {
        Self {
            name: name.into(),
            column_type,
            nullable: true,
            ordinal: 0,
        }
    }

    /// Set nullability
    pub fn with_nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    /// Set ordinal
    pub fn with_ordinal(mut self, ordinal: u32) -> Self {
        self.ordinal = ordinal;
        self
    }
}
