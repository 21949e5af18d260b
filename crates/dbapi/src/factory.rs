//! Validated connections with failover
//!
//! [`ConnectionFactory`] resolves `params.server()` as a service name through
//! a [`ServiceMapper`], connects to candidates in order and keeps the first
//! connection the [`ConnValidator`] accepts.
//!
//! - connect failure: recorded, next candidate
//! - `TemporarilyInvalid`: connection discarded, next candidate
//! - `PermanentlyInvalid`: connection discarded, server skipped for the rest
//!   of this request
//! - no candidate left: [`Error::Multi`] carrying every recorded failure
//!
//! In [`DispatchMode::Redispatch`] the mapper is consulted again for every
//! attempt instead of walking a list captured up front, so topology changes
//! made between attempts are picked up.

use std::collections::HashSet;
use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::Connection;
use crate::context::DriverContext;
use crate::error::{Error, MultiError, Result};
use crate::mapper::{ServerRef, ServiceMapper};
use crate::params::ConnParams;
use crate::validator::{ConnValidator, Verdict};

/// How candidates are walked
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DispatchMode {
    /// One resolution per request
    #[default]
    Standard,
    /// Re-resolve before every attempt
    Redispatch,
}

/// Factory settings
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FactoryConfig {
    /// Candidate walking mode
    pub mode: DispatchMode,
    /// Attempt bound for redispatch; defaults to the service's candidate count
    pub max_attempts: Option<usize>,
}

impl FactoryConfig {
    /// Redispatch with an attempt bound
    pub fn redispatch(max_attempts: usize) -> Self {
        Self {
            mode: DispatchMode::Redispatch,
            max_attempts: Some(max_attempts),
        }
    }
}

/// Turns service requests into validated connections
pub struct ConnectionFactory {
    context: DriverContext,
    mapper: Arc<dyn ServiceMapper>,
    validator: Arc<dyn ConnValidator>,
    config: FactoryConfig,
}

impl ConnectionFactory {
    /// Standard-mode factory
    pub fn new(
        context: DriverContext,
        mapper: Arc<dyn ServiceMapper>,
        validator: Arc<dyn ConnValidator>,
    ) -> Self {
        Self {
            context,
            mapper,
            validator,
            config: FactoryConfig::default(),
        }
    }

    /// Replace the settings
    pub fn with_config(mut self, config: FactoryConfig) -> Self {
        self.config = config;
        self
    }

    /// Context connections are made in
    pub fn context(&self) -> &DriverContext {
        &self.context
    }

    /// Connect to the service named by `params.server()`
    pub fn connect(&self, params: &ConnParams) -> Result<Connection> {
        let service = params
            .server()
            .ok_or_else(|| Error::config("no service name given in connection parameters"))?;

        if let Some(conn) = self.context.take_pooled(params)? {
            return Ok(conn);
        }

        let mut failures = MultiError::new();
        let mut excluded: HashSet<ServerRef> = HashSet::new();

        match self.config.mode {
            DispatchMode::Standard => {
                let candidates = self.mapper.candidates(service);
                if candidates.is_empty() {
                    return Err(no_servers(service, self.mapper.name()));
                }
                debug!(service, candidates = candidates.len(), "Resolved service");
                for server in &candidates {
                    if excluded.contains(server) {
                        debug!(service, server = %server, "Skipping excluded server");
                        continue;
                    }
                    if let Some(conn) = self.attempt(server, params, &mut excluded, &mut failures)? {
                        return Ok(conn);
                    }
                }
            }
            DispatchMode::Redispatch => {
                let limit = self
                    .config
                    .max_attempts
                    .unwrap_or_else(|| self.mapper.candidate_count(service).max(1));
                for attempt in 0..limit {
                    let Some(server) = self.mapper.get_server(service) else {
                        if attempt == 0 {
                            return Err(no_servers(service, self.mapper.name()));
                        }
                        break;
                    };
                    if excluded.contains(&server) {
                        debug!(service, server = %server, attempt, "Skipping excluded server");
                        continue;
                    }
                    if let Some(conn) = self.attempt(&server, params, &mut excluded, &mut failures)? {
                        return Ok(conn);
                    }
                }
            }
        }

        warn!(service, failures = failures.len(), "All candidate servers exhausted");
        if failures.is_empty() {
            failures.push(Error::data_source(format!(
                "no usable server for service {service}"
            )));
        }
        Err(Error::Multi(failures))
    }

    fn attempt(
        &self,
        server: &ServerRef,
        params: &ConnParams,
        excluded: &mut HashSet<ServerRef>,
        failures: &mut MultiError,
    ) -> Result<Option<Connection>> {
        let conn = match self.context.connect_server(server, params) {
            Ok(conn) => conn,
            Err(e @ Error::CeilingExceeded { .. }) => return Err(e),
            Err(e) => {
                warn!(server = %server, error = %e, "Connect failed, trying next candidate");
                failures.push(e);
                return Ok(None);
            }
        };

        let verdict = match self.validator.validate(&conn) {
            Ok(verdict) => verdict,
            Err(e) => {
                let verdict = self.validator.validate_error(&e);
                debug!(server = %server, error = %e, %verdict, "Validation raised an error");
                failures.push(e);
                verdict
            }
        };

        match verdict {
            Verdict::Valid => {
                info!(server = %server, validator = self.validator.name(), "Connection validated");
                Ok(Some(conn))
            }
            Verdict::TemporarilyInvalid | Verdict::PermanentlyInvalid => {
                self.context.record_validation_failure();
                if verdict == Verdict::PermanentlyInvalid {
                    excluded.insert(server.clone());
                }
                warn!(server = %server, validator = self.validator.name(), %verdict, "Connection rejected");
                failures.push(Error::data_source(format!(
                    "server {server} rejected by {} validator: {verdict}",
                    self.validator.name()
                )));
                if let Err(e) = conn.discard() {
                    debug!(server = %server, error = %e, "Error discarding rejected connection");
                }
                Ok(None)
            }
        }
    }
}

impl fmt::Debug for ConnectionFactory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionFactory")
            .field("mapper", &self.mapper.name())
            .field("validator", &self.validator.name())
            .field("config", &self.config)
            .finish()
    }
}

fn no_servers(service: &str, mapper: &str) -> Error {
    Error::data_source(format!("service {service} has no servers in {mapper} mapper"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = FactoryConfig::default();
        assert_eq!(config.mode, DispatchMode::Standard);
        assert_eq!(config.max_attempts, None);

        let redispatch = FactoryConfig::redispatch(4);
        assert_eq!(redispatch.mode, DispatchMode::Redispatch);
        assert_eq!(redispatch.max_attempts, Some(4));
    }
}
