//! Connection parameters
//!
//! [`ConnParams`] is an immutable parameter bag. A derived bag overrides a
//! subset of fields and delegates everything else to the bag it wraps, so
//! layers such as "environment", "application defaults" and "this request"
//! stack without copying:
//!
//! ```rust
//! use std::sync::Arc;
//! use dbapi::params::ConnParams;
//!
//! let defaults = Arc::new(ConnParams::new().with_user("reader").with_database("pubs"));
//! let request = ConnParams::derive(defaults).with_server("PROD_SYB");
//!
//! assert_eq!(request.server(), Some("PROD_SYB"));
//! assert_eq!(request.user(), Some("reader"));
//! assert_eq!(request.port(), 1433);
//! ```
//!
//! Three textual forms are accepted: the `dbapi:` URL
//! (`dbapi:<driver>://<user>[:<password>]@<server>[:<port>]/<database>[?k=v&...]`),
//! ODBC-style `Key=Value;...` strings and the `DBAPI_*` environment variables.

use secrecy::{ExposeSecret, SecretString};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use crate::error::{Error, Result};

/// Port used when no layer sets one
pub const DEFAULT_PORT: u16 = 1433;

/// URL scheme prefix for connection URLs
pub const URL_PREFIX: &str = "dbapi:";

/// Environment variable names consulted by [`ConnParams::from_env`]
pub const ENV_SERVER: &str = "DBAPI_SERVER";
#[allow(missing_docs)]
pub const ENV_DATABASE: &str = "DBAPI_DATABASE";
#[allow(missing_docs)]
pub const ENV_USER: &str = "DBAPI_USER";
#[allow(missing_docs)]
pub const ENV_PASSWORD: &str = "DBAPI_PASSWORD";

/// Wrapper for sensitive configuration values
///
/// Prevents accidental logging of secrets while allowing access when needed.
pub struct SensitiveString(SecretString);

impl SensitiveString {
    /// Create a new sensitive string
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::from(value.into()))
    }

    /// Expose the secret value
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }
}

impl Clone for SensitiveString {
    fn clone(&self) -> Self {
        Self::new(self.expose_secret())
    }
}

impl fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("***REDACTED***")
    }
}

impl PartialEq for SensitiveString {
    fn eq(&self, other: &Self) -> bool {
        self.expose_secret() == other.expose_secret()
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Clone, Default, Debug)]
struct Fields {
    driver: Option<String>,
    server: Option<String>,
    user: Option<String>,
    password: Option<SensitiveString>,
    database: Option<String>,
    protocol_version: Option<u16>,
    port: Option<u16>,
    pool_name: Option<String>,
    reusable: Option<bool>,
    options: BTreeMap<String, String>,
}

/// Layered connection parameters
#[derive(Clone, Default)]
pub struct ConnParams {
    fields: Fields,
    base: Option<Arc<ConnParams>>,
}

macro_rules! resolve_str {
    ($self:ident, $field:ident) => {
        match $self.fields.$field.as_deref() {
            Some(v) => Some(v),
            None => $self.base.as_deref().and_then(|b| b.$field()),
        }
    };
}

impl ConnParams {
    /// Create an empty parameter bag
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a layer that delegates unset fields to `base`
    pub fn derive(base: Arc<ConnParams>) -> Self {
        Self {
            fields: Fields::default(),
            base: Some(base),
        }
    }

    /// Layer over the `DBAPI_*` process environment
    pub fn from_env() -> Self {
        Self::from_env_with(|key| std::env::var(key).ok())
    }

    /// Layer over an arbitrary variable lookup (testable form of [`Self::from_env`])
    pub fn from_env_with<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.is_empty());
        Self {
            fields: Fields {
                server: get(ENV_SERVER),
                database: get(ENV_DATABASE),
                user: get(ENV_USER),
                password: get(ENV_PASSWORD).map(SensitiveString::new),
                ..Fields::default()
            },
            base: None,
        }
    }

    /// Parse a `dbapi:` connection URL.
    ///
    /// Recognized query keys: `pool_name`, `reusable`, `protocol_version`;
    /// every other key lands in [`Self::option`].
    pub fn parse_url(input: &str) -> Result<Self> {
        let rest = input
            .strip_prefix(URL_PREFIX)
            .ok_or_else(|| Error::config(format!("connection URL must start with '{URL_PREFIX}'")))?;

        let normalized = if rest.starts_with("//") {
            format!("{URL_PREFIX}{rest}")
        } else {
            rest.to_string()
        };
        let url = url::Url::parse(&normalized)
            .map_err(|e| Error::config(format!("invalid connection URL: {e}")))?;

        let mut params = Self::new();
        if url.scheme() != "dbapi" {
            params.fields.driver = Some(url.scheme().to_string());
        }
        let host = url
            .host_str()
            .filter(|h| !h.is_empty())
            .ok_or_else(|| Error::config("connection URL has no server"))?;
        params.fields.server = Some(decode(host)?);
        if !url.username().is_empty() {
            params.fields.user = Some(decode(url.username())?);
        }
        if let Some(password) = url.password() {
            params.fields.password = Some(SensitiveString::new(decode(password)?));
        }
        params.fields.port = url.port();

        let database = url.path().trim_start_matches('/');
        if !database.is_empty() {
            params.fields.database = Some(decode(database)?);
        }

        for (key, value) in url.query_pairs() {
            params.apply_option(&key, &value)?;
        }
        Ok(params)
    }

    /// Parse an ODBC-style `Key=Value;...` connection string.
    ///
    /// Keys are case-insensitive and order-independent; braces around a
    /// value are stripped. `Server=host,port` carries the port.
    pub fn parse_odbc(input: &str) -> Result<Self> {
        let mut params = Self::new();
        for pair in input.split(';').map(str::trim).filter(|p| !p.is_empty()) {
            let (key, value) = pair
                .split_once('=')
                .ok_or_else(|| Error::config(format!("malformed connection string pair: {pair}")))?;
            let value = value.trim();
            let value = value
                .strip_prefix('{')
                .and_then(|v| v.strip_suffix('}'))
                .unwrap_or(value);

            match key.trim().to_ascii_lowercase().as_str() {
                "driver" => params.fields.driver = Some(value.to_string()),
                "server" | "address" | "addr" => match value.split_once(',') {
                    Some((host, port)) => {
                        params.fields.server = Some(host.trim().to_string());
                        params.fields.port = Some(parse_port(port.trim())?);
                    }
                    None => params.fields.server = Some(value.to_string()),
                },
                "port" => params.fields.port = Some(parse_port(value)?),
                "database" => params.fields.database = Some(value.to_string()),
                "uid" | "user" | "user id" => params.fields.user = Some(value.to_string()),
                "pwd" | "password" => {
                    params.fields.password = Some(SensitiveString::new(value))
                }
                other => params.apply_option(other, value)?,
            }
        }
        Ok(params)
    }

    fn apply_option(&mut self, key: &str, value: &str) -> Result<()> {
        match key.to_ascii_lowercase().as_str() {
            "pool_name" | "pool" => self.fields.pool_name = Some(value.to_string()),
            "reusable" | "is_pooled" => self.fields.reusable = Some(parse_bool(key, value)?),
            "protocol_version" | "version" => {
                self.fields.protocol_version = Some(value.parse().map_err(|_| {
                    Error::config(format!("invalid protocol version: {value}"))
                })?)
            }
            other => {
                self.fields
                    .options
                    .insert(other.to_string(), value.to_string());
            }
        }
        Ok(())
    }

    /// Set the driver name
    pub fn with_driver(mut self, driver: impl Into<String>) -> Self {
        self.fields.driver = Some(driver.into());
        self
    }

    /// Set the server (or logical service) name
    pub fn with_server(mut self, server: impl Into<String>) -> Self {
        self.fields.server = Some(server.into());
        self
    }

    /// Set the login name
    pub fn with_user(mut self, user: impl Into<String>) -> Self {
        self.fields.user = Some(user.into());
        self
    }

    /// Set the password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.fields.password = Some(SensitiveString::new(password));
        self
    }

    /// Set the database
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.fields.database = Some(database.into());
        self
    }

    /// Set the wire protocol version (e.g. 125, 74)
    pub fn with_protocol_version(mut self, version: u16) -> Self {
        self.fields.protocol_version = Some(version);
        self
    }

    /// Set the port
    pub fn with_port(mut self, port: u16) -> Self {
        self.fields.port = Some(port);
        self
    }

    /// Set the pool name
    pub fn with_pool_name(mut self, pool: impl Into<String>) -> Self {
        self.fields.pool_name = Some(pool.into());
        self
    }

    /// Mark connections made with these parameters as reusable
    pub fn with_reusable(mut self, reusable: bool) -> Self {
        self.fields.reusable = Some(reusable);
        self
    }

    /// Add a driver-specific option (keys are case-insensitive)
    pub fn with_option(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.fields
            .options
            .insert(key.into().to_ascii_lowercase(), value.into());
        self
    }

    /// Driver name
    pub fn driver(&self) -> Option<&str> {
        resolve_str!(self, driver)
    }

    /// Server or service name
    pub fn server(&self) -> Option<&str> {
        resolve_str!(self, server)
    }

    /// Login name
    pub fn user(&self) -> Option<&str> {
        resolve_str!(self, user)
    }

    /// Database name
    pub fn database(&self) -> Option<&str> {
        resolve_str!(self, database)
    }

    /// Pool name
    pub fn pool_name(&self) -> Option<&str> {
        resolve_str!(self, pool_name)
    }

    /// Password
    pub fn password(&self) -> Option<&SensitiveString> {
        match &self.fields.password {
            Some(p) => Some(p),
            None => self.base.as_deref().and_then(ConnParams::password),
        }
    }

    /// Protocol version, if any layer sets one
    pub fn protocol_version(&self) -> Option<u16> {
        self.fields
            .protocol_version
            .or_else(|| self.base.as_deref().and_then(ConnParams::protocol_version))
    }

    /// Explicit port, if any layer sets one
    pub fn explicit_port(&self) -> Option<u16> {
        self.fields
            .port
            .or_else(|| self.base.as_deref().and_then(ConnParams::explicit_port))
    }

    /// Port, defaulting to [`DEFAULT_PORT`]
    pub fn port(&self) -> u16 {
        self.explicit_port().unwrap_or(DEFAULT_PORT)
    }

    /// Whether connections are returned to their pool on close
    pub fn reusable(&self) -> bool {
        self.fields
            .reusable
            .or_else(|| self.base.as_deref().map(ConnParams::reusable))
            .unwrap_or(false)
    }

    /// Driver-specific option
    pub fn option(&self, key: &str) -> Option<&str> {
        let key = key.to_ascii_lowercase();
        match self.fields.options.get(&key) {
            Some(v) => Some(v.as_str()),
            None => self.base.as_deref().and_then(|b| b.option(&key)),
        }
    }

    /// All options, outer layers overriding inner ones
    pub fn options(&self) -> BTreeMap<String, String> {
        let mut merged = self
            .base
            .as_deref()
            .map(ConnParams::options)
            .unwrap_or_default();
        merged.extend(
            self.fields
                .options
                .iter()
                .map(|(k, v)| (k.clone(), v.clone())),
        );
        merged
    }

    /// Number of layers in the delegation chain (1 for a standalone bag)
    pub fn depth(&self) -> usize {
        1 + self.base.as_deref().map_or(0, ConnParams::depth)
    }

    /// Whether no layer sets server, user or database
    pub fn is_unspecified(&self) -> bool {
        self.server().is_none() && self.user().is_none() && self.database().is_none()
    }

    /// Whether a live connection made with `self` satisfies a request for `wanted`.
    ///
    /// Fields left unset in `wanted` match anything.
    pub fn satisfies(&self, wanted: &ConnParams) -> bool {
        fn field_ok(have: Option<&str>, want: Option<&str>) -> bool {
            match want {
                None => true,
                Some(w) => have.is_some_and(|h| h.eq_ignore_ascii_case(w)),
            }
        }
        field_ok(self.server(), wanted.server())
            && field_ok(self.user(), wanted.user())
            && field_ok(self.database(), wanted.database())
            && field_ok(self.driver(), wanted.driver())
            && wanted.password().map_or(true, |w| {
                self.password()
                    .is_some_and(|h| h.expose_secret() == w.expose_secret())
            })
    }
}

impl fmt::Debug for ConnParams {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnParams")
            .field("driver", &self.driver())
            .field("server", &self.server())
            .field("user", &self.user())
            .field("password", &self.password().map(|_| "***"))
            .field("database", &self.database())
            .field("port", &self.port())
            .field("pool_name", &self.pool_name())
            .field("reusable", &self.reusable())
            .field("depth", &self.depth())
            .finish()
    }
}

fn decode(raw: &str) -> Result<String> {
    urlencoding::decode(raw)
        .map(|s| s.into_owned())
        .map_err(|e| Error::config(format!("invalid percent-encoding in '{raw}': {e}")))
}

fn parse_port(value: &str) -> Result<u16> {
    value
        .parse()
        .map_err(|_| Error::config(format!("invalid port: {value}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::config(format!("invalid boolean for {key}: {value}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_defaults() {
        let params = ConnParams::new()
            .with_server("MSSQL67")
            .with_user("anyone")
            .with_password("allowed");

        assert_eq!(params.server(), Some("MSSQL67"));
        assert_eq!(params.password().unwrap().expose_secret(), "allowed");
        assert_eq!(params.port(), DEFAULT_PORT);
        assert_eq!(params.explicit_port(), None);
        assert!(!params.reusable());
        assert_eq!(params.depth(), 1);
    }

    #[test]
    fn test_delegation_chain() {
        let inner = Arc::new(
            ConnParams::new()
                .with_server("INNER")
                .with_database("db1")
                .with_option("Charset", "utf8"),
        );
        let middle = Arc::new(ConnParams::derive(inner).with_database("db2"));
        let outer = ConnParams::derive(middle).with_user("bob").with_port(2638);

        assert_eq!(outer.server(), Some("INNER"));
        assert_eq!(outer.database(), Some("db2"));
        assert_eq!(outer.user(), Some("bob"));
        assert_eq!(outer.port(), 2638);
        assert_eq!(outer.option("charset"), Some("utf8"));
        assert_eq!(outer.depth(), 3);
    }

    #[test]
    fn test_debug_redacts_password() {
        let params = ConnParams::new().with_password("hunter2");
        let dbg = format!("{params:?}");
        assert!(!dbg.contains("hunter2"));
        assert!(dbg.contains("***"));
    }

    #[test]
    fn test_env_layer_fills_unset_fields() {
        let env = Arc::new(ConnParams::from_env_with(|key| match key {
            ENV_SERVER => Some("ENV_SRV".into()),
            ENV_USER => Some("env_user".into()),
            ENV_DATABASE => Some(String::new()),
            _ => None,
        }));
        let params = ConnParams::derive(env).with_user("explicit");

        assert_eq!(params.server(), Some("ENV_SRV"));
        assert_eq!(params.user(), Some("explicit"));
        assert_eq!(params.database(), None);
        assert!(params.password().is_none());
    }

    #[test]
    fn test_satisfies() {
        let live = ConnParams::new()
            .with_server("S1")
            .with_user("u")
            .with_database("d");

        assert!(live.satisfies(&ConnParams::new()));
        assert!(live.satisfies(&ConnParams::new().with_server("s1")));
        assert!(!live.satisfies(&ConnParams::new().with_database("other")));

        let secured = live.clone().with_password("pw");
        assert!(secured.satisfies(&ConnParams::new().with_password("pw")));
        assert!(!secured.satisfies(&ConnParams::new().with_password("PW")));
        assert!(!live.satisfies(&ConnParams::new().with_password("pw")));
    }
}
