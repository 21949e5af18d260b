//! Identifier and fragment checks for SQL text built by the library.
//!
//! Cursor positioned updates, blob descriptors, `USE` and bulk-load targets
//! all splice caller-supplied names into SQL. Everything spliced goes through
//! one of these checks first:
//! - [`validate_sql_identifier`] for a single name part (cursor, column, database)
//! - [`validate_object_name`] for a possibly qualified table (`db.owner.tbl`, `db..tbl`, `#tmp`)
//! - [`validate_condition`] for a raw search condition
//! - [`escape_string_literal`] for values placed inside `'...'`

use crate::error::Error;

/// Longest name part accepted
pub const MAX_IDENTIFIER_LEN: usize = 255;

/// Longest raw condition accepted
pub const MAX_CONDITION_LEN: usize = 4096;

/// Validate a single SQL name part.
///
/// Rules:
/// - Must not be empty, at most 255 characters
/// - Must start with an ASCII letter or underscore
/// - May only contain ASCII alphanumeric characters, underscores and `$`
///
/// # Examples
///
/// ```
/// use dbapi::security::validate_sql_identifier;
///
/// assert!(validate_sql_identifier("titles").is_ok());
/// assert!(validate_sql_identifier("cur_1").is_ok());
///
/// assert!(validate_sql_identifier("x; DROP TABLE users--").is_err());
/// assert!(validate_sql_identifier("").is_err());
/// assert!(validate_sql_identifier("123abc").is_err());
/// ```
pub fn validate_sql_identifier(name: &str) -> crate::Result<()> {
    check_part(name, name, false)
}

/// Validate a table name that may be qualified or temporary.
///
/// Accepts up to three dot-separated parts. The middle (owner) part of a
/// three-part name may be empty, as in `pubs..titles`. The last part may
/// carry one or two leading `#` for temporary tables.
///
/// ```
/// use dbapi::security::validate_object_name;
///
/// assert!(validate_object_name("titles").is_ok());
/// assert!(validate_object_name("pubs.dbo.titles").is_ok());
/// assert!(validate_object_name("pubs..titles").is_ok());
/// assert!(validate_object_name("#bulk_stage").is_ok());
///
/// assert!(validate_object_name("a.b.c.d").is_err());
/// assert!(validate_object_name("titles; SHUTDOWN").is_err());
/// ```
pub fn validate_object_name(name: &str) -> crate::Result<()> {
    if name.is_empty() {
        return Err(Error::client("object name cannot be empty"));
    }

    let parts: Vec<&str> = name.split('.').collect();
    if parts.len() > 3 {
        return Err(Error::client(format!(
            "Invalid object name '{}': too many name parts",
            name
        )));
    }

    let last = parts.len() - 1;
    for (i, part) in parts.iter().enumerate() {
        if part.is_empty() && parts.len() == 3 && i == 1 {
            continue;
        }
        check_part(name, part, i == last)?;
    }
    Ok(())
}

/// Validate a raw search condition (the text after `WHERE`).
///
/// Best-effort deny-list: statement separators, comments and backslash
/// escapes are rejected. Conditions should come from application code,
/// never from end users.
///
/// ```
/// use dbapi::security::validate_condition;
///
/// assert!(validate_condition("id = 7").is_ok());
/// assert!(validate_condition("1=1; DROP TABLE users").is_err());
/// ```
pub fn validate_condition(clause: &str) -> crate::Result<()> {
    if clause.trim().is_empty() {
        return Err(Error::client("search condition cannot be empty"));
    }

    if clause.len() > MAX_CONDITION_LEN {
        return Err(Error::client(format!(
            "search condition too long: {} chars (max {})",
            clause.len(),
            MAX_CONDITION_LEN
        )));
    }

    let prohibited = [";", "--", "/*", "*/", "\\"];
    if let Some(p) = prohibited.iter().find(|p| clause.contains(*p)) {
        return Err(Error::client(format!(
            "search condition contains prohibited sequence '{}': {}",
            p, clause
        )));
    }

    Ok(())
}

/// Escape a value for a single-quoted SQL string literal.
///
/// ```
/// use dbapi::security::escape_string_literal;
///
/// assert_eq!(escape_string_literal("don't"), "don''t");
/// ```
pub fn escape_string_literal(value: &str) -> String {
    if !value.contains('\'') {
        return value.to_string();
    }
    value.replace('\'', "''")
}

fn check_part(full: &str, part: &str, allow_temp: bool) -> crate::Result<()> {
    let body = if allow_temp {
        part.strip_prefix("##")
            .or_else(|| part.strip_prefix('#'))
            .unwrap_or(part)
    } else {
        part
    };

    if body.is_empty() {
        return Err(Error::client(format!(
            "Invalid SQL identifier '{}': empty name part",
            full
        )));
    }

    if part.len() > MAX_IDENTIFIER_LEN {
        return Err(Error::client(format!(
            "SQL identifier too long: {} chars (max {})",
            part.len(),
            MAX_IDENTIFIER_LEN
        )));
    }

    let mut chars = body.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => {
            return Err(Error::client(format!(
                "Invalid SQL identifier '{}': must start with a letter or underscore",
                full
            )));
        }
    }

    if let Some(c) = chars.find(|c| !(c.is_ascii_alphanumeric() || *c == '_' || *c == '$')) {
        return Err(Error::client(format!(
            "Invalid SQL identifier '{}': contains invalid character '{}'",
            full, c
        )));
    }

    Ok(())
}
