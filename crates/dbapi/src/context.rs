//! Driver context: connection ceiling, named pools and handler scopes
//!
//! ```rust
//! use dbapi::prelude::*;
//! use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
//!
//! # fn main() -> dbapi::Result<()> {
//! let cluster = MemoryCluster::new();
//! cluster.add_server(MemoryServer::new("SYB1", ServerType::Sybase));
//! let registry = DriverRegistry::new().with_driver(MemoryDriver::new(cluster));
//!
//! let ctx = DriverContext::new(
//!     registry,
//!     "memory",
//!     ContextConfig::default().with_max_connections(2),
//! )?;
//! let params = ConnParams::new().with_server("SYB1").with_user("sa");
//!
//! let a = ctx.connect(&params)?;
//! let b = ctx.connect(&params)?;
//! assert!(ctx.connect(&params).is_err());
//!
//! drop(a);
//! let c = ctx.connect(&params)?;
//! assert_eq!(ctx.live_connections(), 2);
//! # drop((b, c));
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::connection::{CancelHandle, Connection};
use crate::driver::{ConnectOptions, Driver, DriverCapabilities, DriverRegistry};
use crate::error::{Error, Result};
use crate::handler::{ErrorHandler, HandlerChain, HandlerId, HandlerStack};
use crate::mapper::ServerRef;
use crate::params::ConnParams;
use crate::session::{Session, SessionHandle, SharedSession};

/// Context settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextConfig {
    /// Ceiling on live connections (in use plus pooled); `None` is unlimited
    pub max_connections: Option<usize>,
    /// Bound on establishing a physical connection
    pub login_timeout: Option<Duration>,
    /// Default statement timeout for new connections
    pub timeout: Option<Duration>,
    /// Whether new connections queue pending errors
    pub pending_errors: bool,
    /// Probe pooled connections before handing them out
    pub test_on_borrow: bool,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_connections: None,
            login_timeout: Some(Duration::from_secs(30)),
            timeout: None,
            pending_errors: false,
            test_on_borrow: true,
        }
    }
}

impl ContextConfig {
    /// Set the connection ceiling
    pub fn with_max_connections(mut self, max: usize) -> Self {
        self.max_connections = Some(max);
        self
    }

    /// Set the login timeout
    pub fn with_login_timeout(mut self, timeout: Duration) -> Self {
        self.login_timeout = Some(timeout);
        self
    }

    /// Set the default statement timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Enable pending-error queues on new connections
    pub fn with_pending_errors(mut self, enabled: bool) -> Self {
        self.pending_errors = enabled;
        self
    }

    /// Enable/disable test on borrow
    pub fn with_test_on_borrow(mut self, test: bool) -> Self {
        self.test_on_borrow = test;
        self
    }
}

/// Pool statistics
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Physical connections established
    pub connections_created: u64,
    /// Physical connections destroyed
    pub connections_closed: u64,
    /// Logical connections handed out
    pub acquisitions: u64,
    /// Acquisitions served from a pool
    pub pool_hits: u64,
    /// Connections returned to a pool on close
    pub pool_returns: u64,
    /// Requests refused by the ceiling
    pub ceiling_rejections: u64,
    /// Connections rejected by a validator
    pub validation_failures: u64,
}

/// Atomic pool stats for concurrent updates
#[derive(Debug, Default)]
#[allow(missing_docs)]
pub struct AtomicPoolStats {
    pub connections_created: AtomicU64,
    pub connections_closed: AtomicU64,
    pub acquisitions: AtomicU64,
    pub pool_hits: AtomicU64,
    pub pool_returns: AtomicU64,
    pub ceiling_rejections: AtomicU64,
    pub validation_failures: AtomicU64,
}

impl AtomicPoolStats {
    /// Create new atomic stats
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a connection creation
    pub fn record_created(&self) {
        self.connections_created.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a connection close
    pub fn record_closed(&self) {
        self.connections_closed.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition
    pub fn record_acquisition(&self) {
        self.acquisitions.fetch_add(1, Ordering::Relaxed);
    }

    /// Record an acquisition served from a pool
    pub fn record_pool_hit(&self) {
        self.pool_hits.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a return to a pool
    pub fn record_pool_return(&self) {
        self.pool_returns.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a ceiling rejection
    pub fn record_ceiling_rejection(&self) {
        self.ceiling_rejections.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a validator rejection
    pub fn record_validation_failure(&self) {
        self.validation_failures.fetch_add(1, Ordering::Relaxed);
    }

    /// Snapshot current stats
    pub fn snapshot(&self) -> PoolStats {
        PoolStats {
            connections_created: self.connections_created.load(Ordering::Relaxed),
            connections_closed: self.connections_closed.load(Ordering::Relaxed),
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            pool_hits: self.pool_hits.load(Ordering::Relaxed),
            pool_returns: self.pool_returns.load(Ordering::Relaxed),
            ceiling_rejections: self.ceiling_rejections.load(Ordering::Relaxed),
            validation_failures: self.validation_failures.load(Ordering::Relaxed),
        }
    }
}

/// Which context-owned handler stack to modify
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerScope {
    /// Consulted last by every connection created afterwards
    ContextWide,
    /// Inherited by connections created afterwards, consulted after their own stack
    ConnectionDefault,
}

struct IdleEntry {
    session: SharedSession,
    params: ConnParams,
    server: String,
    since: Instant,
}

pub(crate) struct ContextInner {
    driver: Arc<dyn Driver>,
    registry: DriverRegistry,
    config: RwLock<ContextConfig>,
    live: Mutex<usize>,
    idle: Mutex<HashMap<String, Vec<IdleEntry>>>,
    context_handlers: RwLock<HandlerStack>,
    default_handlers: RwLock<HandlerStack>,
    stats: AtomicPoolStats,
    next_id: AtomicU64,
}

impl ContextInner {
    fn reserve(&self) -> Result<()> {
        let max = self.config.read().max_connections;
        let mut live = self.live.lock();
        if let Some(max) = max {
            if *live >= max {
                self.stats.record_ceiling_rejection();
                warn!(live = *live, max, "Connection ceiling reached");
                return Err(Error::CeilingExceeded { limit: max });
            }
        }
        *live += 1;
        Ok(())
    }

    fn release_slot(&self) {
        let mut live = self.live.lock();
        *live = live.saturating_sub(1);
    }

    fn destroy(&self, session: &SharedSession) -> Result<()> {
        let result = {
            let mut s = session.lock();
            if s.closed {
                return Ok(());
            }
            s.retire();
            s.closed = true;
            s.native.close()
        };
        self.release_slot();
        self.stats.record_closed();
        result
    }

    pub(crate) fn release(
        &self,
        session: &SharedSession,
        params: &ConnParams,
        server: &str,
        reusable: bool,
    ) -> Result<()> {
        let pool = match params.pool_name() {
            Some(pool) if reusable => pool.to_string(),
            _ => return self.destroy(session),
        };

        let ready = {
            let mut s = session.lock();
            if s.closed {
                return Ok(());
            }
            s.retire();
            s.handlers = HandlerChain::default();
            s.native.is_alive() && s.native.reset().is_ok()
        };
        if !ready {
            debug!(pool = %pool, server, "Dropping dead connection instead of pooling it");
            return self.destroy(session);
        }

        self.idle.lock().entry(pool.clone()).or_default().push(IdleEntry {
            session: Arc::clone(session),
            params: params.clone(),
            server: server.to_string(),
            since: Instant::now(),
        });
        self.stats.record_pool_return();
        debug!(pool = %pool, server, "Connection returned to pool");
        Ok(())
    }

    fn close_idle(&self, entries: Vec<IdleEntry>) -> usize {
        let n = entries.len();
        for entry in entries {
            if let Err(e) = self.destroy(&entry.session) {
                warn!(server = %entry.server, error = %e, "Error closing pooled connection");
            }
        }
        n
    }
}

impl Drop for ContextInner {
    fn drop(&mut self) {
        let pools: Vec<IdleEntry> = self.idle.get_mut().drain().flat_map(|(_, v)| v).collect();
        self.close_idle(pools);
    }
}

/// Owns connection bookkeeping for one default driver
#[derive(Clone)]
pub struct DriverContext {
    inner: Arc<ContextInner>,
}

impl DriverContext {
    /// Create a context whose connections use `driver` unless their
    /// parameters name another registered driver.
    ///
    /// Fails with a data-source error when the driver is not registered.
    pub fn new(registry: DriverRegistry, driver: &str, config: ContextConfig) -> Result<Self> {
        let default_driver = registry.get(driver)?;
        info!(driver, max_connections = ?config.max_connections, "Driver context created");
        Ok(Self {
            inner: Arc::new(ContextInner {
                driver: default_driver,
                registry,
                config: RwLock::new(config),
                live: Mutex::new(0),
                idle: Mutex::new(HashMap::new()),
                context_handlers: RwLock::new(HandlerStack::new()),
                default_handlers: RwLock::new(HandlerStack::new()),
                stats: AtomicPoolStats::new(),
                next_id: AtomicU64::new(1),
            }),
        })
    }

    /// Default driver name
    pub fn driver_name(&self) -> &str {
        self.inner.driver.name()
    }

    /// Default driver capabilities
    pub fn capabilities(&self) -> DriverCapabilities {
        self.inner.driver.capabilities()
    }

    /// Current settings
    pub fn config(&self) -> ContextConfig {
        self.inner.config.read().clone()
    }

    /// Set the live-connection ceiling; applies to subsequent requests
    pub fn set_max_connections(&self, max: Option<usize>) {
        self.inner.config.write().max_connections = max;
    }

    /// Live-connection ceiling
    pub fn max_connections(&self) -> Option<usize> {
        self.inner.config.read().max_connections
    }

    /// Default statement timeout for new connections
    pub fn set_timeout(&self, timeout: Option<Duration>) {
        self.inner.config.write().timeout = timeout;
    }

    /// Login timeout for new physical connections
    pub fn set_login_timeout(&self, timeout: Option<Duration>) {
        self.inner.config.write().login_timeout = timeout;
    }

    /// Connect to `params.server()`, reusing a pooled connection when the
    /// parameters name a pool that holds a matching idle one.
    pub fn connect(&self, params: &ConnParams) -> Result<Connection> {
        if let Some(conn) = self.take_pooled(params)? {
            return Ok(conn);
        }
        let server = params
            .server()
            .ok_or_else(|| Error::config("no server given in connection parameters"))?;
        let mut server = ServerRef::parse(server)?;
        if server.port.is_none() {
            server.port = params.explicit_port();
        }
        self.connect_server(&server, params)
    }

    /// Establish a new physical connection to a specific server
    pub(crate) fn connect_server(&self, server: &ServerRef, params: &ConnParams) -> Result<Connection> {
        let driver = match params.driver() {
            Some(name) => self.inner.registry.get(name)?,
            None => Arc::clone(&self.inner.driver),
        };
        self.inner.reserve()?;

        let config = self.config();
        let cancel = Arc::new(AtomicBool::new(false));
        let options = ConnectOptions {
            login_timeout: config.login_timeout,
            timeout: config.timeout,
            cancel: Arc::clone(&cancel),
        };
        debug!(driver = driver.name(), server = %server, user = ?params.user(), "Connecting");
        let native = match driver.connect(server, params, &options) {
            Ok(native) => native,
            Err(e) => {
                self.inner.release_slot();
                debug!(server = %server, error = %e, "Connect failed");
                return Err(e);
            }
        };
        self.inner.stats.record_created();

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let session = Session::new(id, native, driver.capabilities(), cancel);
        let shared = Arc::new(Mutex::new(session));
        Ok(self.hand_out(shared, params.clone(), server.name.clone(), driver.capabilities()))
    }

    fn hand_out(
        &self,
        shared: SharedSession,
        params: ConnParams,
        server: String,
        capabilities: DriverCapabilities,
    ) -> Connection {
        let chain = HandlerChain::new(
            self.inner.default_handlers.read().clone(),
            self.inner.context_handlers.read().clone(),
        );
        let pending = self.inner.config.read().pending_errors;
        let (id, cancel) = {
            let mut s = shared.lock();
            s.handlers = chain;
            s.set_pending(pending);
            (s.id, CancelHandle::new(Arc::clone(&s.cancel)))
        };
        self.inner.stats.record_acquisition();
        Connection::new(
            id,
            SessionHandle::new(shared),
            cancel,
            params,
            server,
            capabilities,
            Arc::clone(&self.inner),
        )
    }

    /// Hand out an idle pooled connection matching `params`, if any
    pub(crate) fn take_pooled(&self, params: &ConnParams) -> Result<Option<Connection>> {
        let Some(pool) = params.pool_name() else {
            return Ok(None);
        };
        let test = self.inner.config.read().test_on_borrow;

        loop {
            let entry = {
                let mut idle = self.inner.idle.lock();
                let Some(entries) = idle.get_mut(pool) else {
                    return Ok(None);
                };
                match entries.iter().rposition(|e| e.params.satisfies(params)) {
                    Some(i) => entries.remove(i),
                    None => return Ok(None),
                }
            };

            if test && !entry.session.lock().native.is_alive() {
                debug!(pool, server = %entry.server, "Pooled connection failed liveness check");
                self.inner.destroy(&entry.session)?;
                continue;
            }

            self.inner.stats.record_pool_hit();
            debug!(
                pool,
                server = %entry.server,
                idle_ms = entry.since.elapsed().as_millis() as u64,
                "Reusing pooled connection"
            );
            let capabilities = entry.session.lock().capabilities;
            return Ok(Some(self.hand_out(
                entry.session,
                entry.params,
                entry.server,
                capabilities,
            )));
        }
    }

    pub(crate) fn record_validation_failure(&self) {
        self.inner.stats.record_validation_failure();
    }

    /// Push a handler the stack will own
    pub fn push_handler_owned(
        &self,
        scope: HandlerScope,
        handler: impl ErrorHandler + 'static,
    ) -> HandlerId {
        self.stack(scope).write().push_owned(handler)
    }

    /// Push a handler that stays owned by the caller
    pub fn push_handler_borrowed<H: ErrorHandler + 'static>(
        &self,
        scope: HandlerScope,
        handler: &Arc<H>,
    ) -> HandlerId {
        self.stack(scope).write().push_borrowed(handler)
    }

    /// Remove a handler; connections made earlier keep their snapshot
    pub fn remove_handler(&self, scope: HandlerScope, id: HandlerId) -> bool {
        self.stack(scope).write().remove(id)
    }

    fn stack(&self, scope: HandlerScope) -> &RwLock<HandlerStack> {
        match scope {
            HandlerScope::ContextWide => &self.inner.context_handlers,
            HandlerScope::ConnectionDefault => &self.inner.default_handlers,
        }
    }

    /// Live connections (in use plus pooled)
    pub fn live_connections(&self) -> usize {
        *self.inner.live.lock()
    }

    /// Idle connections in one pool
    pub fn idle_count(&self, pool: &str) -> usize {
        self.inner.idle.lock().get(pool).map_or(0, Vec::len)
    }

    /// Destroy every idle connection of one pool; returns how many
    pub fn close_pool(&self, pool: &str) -> usize {
        let entries = self.inner.idle.lock().remove(pool).unwrap_or_default();
        let n = self.inner.close_idle(entries);
        if n > 0 {
            info!(pool, closed = n, "Pool closed");
        }
        n
    }

    /// Destroy every idle connection of every pool; returns how many
    pub fn close_unused(&self) -> usize {
        let entries: Vec<IdleEntry> = self
            .inner
            .idle
            .lock()
            .drain()
            .flat_map(|(_, v)| v)
            .collect();
        self.inner.close_idle(entries)
    }

    /// Statistics snapshot
    pub fn stats(&self) -> PoolStats {
        self.inner.stats.snapshot()
    }
}

impl fmt::Debug for DriverContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverContext")
            .field("driver", &self.driver_name())
            .field("live", &self.live_connections())
            .field("config", &self.config())
            .finish()
    }
}
