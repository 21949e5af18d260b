//! Tests for the driver context: ceiling, pools and statistics

use std::sync::{Arc, Barrier};
use std::time::Duration;

use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
use dbapi::prelude::*;

fn setup(config: ContextConfig) -> (MemoryCluster, DriverContext) {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SYB1", ServerType::Sybase).with_database("pubs"));
    let ctx = DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster.clone())),
        "memory",
        config,
    )
    .unwrap();
    (cluster, ctx)
}

fn params() -> ConnParams {
    ConnParams::new().with_server("SYB1").with_user("sa")
}

fn pooled() -> ConnParams {
    params().with_pool_name("main").with_reusable(true)
}

// ==================== ContextConfig Tests ====================

#[test]
fn test_context_config_default() {
    let config = ContextConfig::default();

    assert_eq!(config.max_connections, None);
    assert_eq!(config.timeout, None);
    assert!(config.test_on_borrow);
}

#[test]
fn test_unknown_default_driver() {
    let err = DriverContext::new(DriverRegistry::new(), "nope", ContextConfig::default()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DataSource);
}

#[test]
fn test_unknown_driver_in_params() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    let err = ctx.connect(&params().with_driver("odbc")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DataSource);
    assert_eq!(ctx.live_connections(), 0);
}

// ==================== Ceiling Tests ====================

#[test]
fn test_ceiling_enforcement() {
    let (_cluster, ctx) = setup(ContextConfig::default().with_max_connections(3));

    let mut held: Vec<Connection> = (0..3).map(|_| ctx.connect(&params()).unwrap()).collect();
    let err = ctx.connect(&params()).unwrap_err();
    assert!(err.is_client());
    assert!(matches!(err, Error::CeilingExceeded { limit: 3 }));
    assert_eq!(ctx.stats().ceiling_rejections, 1);

    held.pop().unwrap().close().unwrap();
    held.push(ctx.connect(&params()).unwrap());
    assert_eq!(ctx.live_connections(), 3);
}

#[test]
fn test_ceiling_holds_under_concurrent_connects() {
    const CEILING: usize = 3;
    const THREADS: usize = 8;
    let (_cluster, ctx) = setup(ContextConfig::default().with_max_connections(CEILING));
    let barrier = Arc::new(Barrier::new(THREADS));

    let workers: Vec<_> = (0..THREADS)
        .map(|_| {
            let ctx = ctx.clone();
            let barrier = Arc::clone(&barrier);
            std::thread::spawn(move || {
                let conn = ctx.connect(&params());
                let ok = match &conn {
                    Ok(_) => true,
                    Err(err) => {
                        assert!(matches!(err, Error::CeilingExceeded { .. }));
                        false
                    }
                };
                // hold every connection until all threads have tried
                barrier.wait();
                ok
            })
        })
        .collect();
    let held = workers
        .into_iter()
        .map(|w| w.join().unwrap())
        .filter(|ok| *ok)
        .count();

    assert_eq!(held, CEILING);
    assert_eq!(ctx.stats().ceiling_rejections, (THREADS - CEILING) as u64);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn test_ceiling_counts_idle_pooled_connections() {
    let (_cluster, ctx) = setup(ContextConfig::default().with_max_connections(1));

    ctx.connect(&pooled()).unwrap().close().unwrap();
    assert_eq!(ctx.idle_count("main"), 1);
    assert!(matches!(
        ctx.connect(&params()),
        Err(Error::CeilingExceeded { .. })
    ));

    assert_eq!(ctx.close_unused(), 1);
    assert!(ctx.connect(&params()).is_ok());
}

#[test]
fn test_raising_ceiling_at_runtime() {
    let (_cluster, ctx) = setup(ContextConfig::default().with_max_connections(1));
    let _a = ctx.connect(&params()).unwrap();
    assert!(ctx.connect(&params()).is_err());

    ctx.set_max_connections(Some(2));
    assert_eq!(ctx.max_connections(), Some(2));
    let _b = ctx.connect(&params()).unwrap();
}

#[test]
fn test_failed_connect_releases_slot() {
    let (cluster, ctx) = setup(ContextConfig::default().with_max_connections(1));
    cluster.server("SYB1").unwrap().set_online(false);
    assert!(ctx.connect(&params()).is_err());
    assert_eq!(ctx.live_connections(), 0);

    cluster.server("SYB1").unwrap().set_online(true);
    assert!(ctx.connect(&params()).is_ok());
}

// ==================== Pool Reuse Tests ====================

#[test]
fn test_reusable_connection_returns_to_pool() {
    let (cluster, ctx) = setup(ContextConfig::default());
    let server = cluster.server("SYB1").unwrap();

    let conn = ctx.connect(&pooled()).unwrap();
    assert!(conn.is_reusable());
    conn.close().unwrap();
    assert_eq!(ctx.idle_count("main"), 1);
    assert_eq!(server.open_connections(), 1);

    let again = ctx.connect(&pooled()).unwrap();
    assert_eq!(ctx.idle_count("main"), 0);
    assert_eq!(server.total_connects(), 1);

    let stats = ctx.stats();
    assert_eq!(stats.connections_created, 1);
    assert_eq!(stats.acquisitions, 2);
    assert_eq!(stats.pool_hits, 1);
    assert_eq!(stats.pool_returns, 1);
    drop(again);
}

#[test]
fn test_non_reusable_connection_is_destroyed() {
    let (cluster, ctx) = setup(ContextConfig::default());
    let conn = ctx
        .connect(&params().with_pool_name("main"))
        .unwrap();
    assert!(!conn.is_reusable());
    drop(conn);

    assert_eq!(ctx.idle_count("main"), 0);
    assert_eq!(cluster.server("SYB1").unwrap().open_connections(), 0);
    assert_eq!(ctx.stats().connections_closed, 1);
}

#[test]
fn test_discard_bypasses_pool() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    ctx.connect(&pooled()).unwrap().discard().unwrap();
    assert_eq!(ctx.idle_count("main"), 0);
    assert_eq!(ctx.live_connections(), 0);
}

#[test]
fn test_pool_matches_parameters() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    ctx.connect(&pooled().with_database("pubs")).unwrap().close().unwrap();

    let other = ctx.connect(&pooled().with_database("master")).unwrap();
    assert_eq!(ctx.stats().pool_hits, 0);
    assert_eq!(ctx.idle_count("main"), 1);
    drop(other);

    let same = ctx.connect(&pooled().with_database("pubs")).unwrap();
    assert_eq!(ctx.stats().pool_hits, 1);
    assert_eq!(same.database().unwrap().as_deref(), Some("pubs"));
}

#[test]
fn test_pool_requires_matching_password() {
    let cluster = MemoryCluster::new();
    let server = cluster.add_server(MemoryServer::new("SEC1", ServerType::MsSql).with_login("sa", "pw"));
    let ctx = DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster.clone())),
        "memory",
        ContextConfig::default(),
    )
    .unwrap();
    let login = |password: &str| {
        ConnParams::new()
            .with_server("SEC1")
            .with_user("sa")
            .with_password(password)
            .with_pool_name("secure")
            .with_reusable(true)
    };

    ctx.connect(&login("pw")).unwrap().close().unwrap();
    assert_eq!(ctx.idle_count("secure"), 1);

    let err = ctx.connect(&login("WRONG")).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
    assert_eq!(ctx.idle_count("secure"), 1);
    assert_eq!(ctx.stats().pool_hits, 0);

    ctx.connect(&login("pw")).unwrap();
    assert_eq!(ctx.stats().pool_hits, 1);
    assert_eq!(server.total_connects(), 1);
}

#[test]
fn test_pooled_connection_is_reset() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    let conn = ctx.connect(&pooled()).unwrap();
    conn.execute("CREATE TABLE t (id INT)", &[]).unwrap();
    conn.begin().unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    conn.close().unwrap();

    let conn = ctx.connect(&pooled()).unwrap();
    let row = conn.query_one("SELECT COUNT(*) FROM t", &[]).unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int32(0)));
}

#[test]
fn test_dead_pooled_connection_is_replaced() {
    let (cluster, ctx) = setup(ContextConfig::default());
    let server = cluster.server("SYB1").unwrap();
    ctx.connect(&pooled()).unwrap().close().unwrap();

    server.set_online(false);
    assert!(ctx.connect(&pooled()).is_err());
    assert_eq!(ctx.idle_count("main"), 0);
    assert_eq!(ctx.live_connections(), 0);

    server.set_online(true);
    ctx.connect(&pooled()).unwrap();
    assert_eq!(server.total_connects(), 2);
}

#[test]
fn test_close_pool() {
    let (cluster, ctx) = setup(ContextConfig::default());
    let a = ctx.connect(&pooled()).unwrap();
    let b = ctx.connect(&pooled()).unwrap();
    a.close().unwrap();
    b.close().unwrap();
    assert_eq!(ctx.idle_count("main"), 2);

    assert_eq!(ctx.close_pool("main"), 2);
    assert_eq!(ctx.close_pool("main"), 0);
    assert_eq!(cluster.server("SYB1").unwrap().open_connections(), 0);
}

// ==================== Connection Handle Tests ====================

#[test]
fn test_handles_outliving_connection_fail() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    let conn = ctx.connect(&pooled()).unwrap();
    conn.execute("CREATE TABLE t (id INT)", &[]).unwrap();
    let mut bulk = conn.bulk_insert("t", BulkOptions::default()).unwrap();
    bulk.bind(1, ColumnType::Int).unwrap();
    conn.close().unwrap();

    let err = bulk.add_row().and_then(|_| bulk.store_batch()).unwrap_err();
    assert!(err.is_client());
}

#[test]
fn test_statement_timeout_from_context() {
    let (_cluster, ctx) = setup(ContextConfig::default().with_timeout(Duration::from_millis(20)));
    let conn = ctx.connect(&params()).unwrap();

    let err = conn.execute("WAITFOR DELAY '00:00:05'", &[]).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Timeout);

    conn.set_timeout(None).unwrap();
    conn.execute("WAITFOR DELAY '00:00:00.010'", &[]).unwrap();
}

#[test]
fn test_cancel_from_another_thread() {
    let (_cluster, ctx) = setup(ContextConfig::default());
    let conn = ctx.connect(&params()).unwrap();
    let handle = conn.cancel_handle();

    let canceller = std::thread::spawn(move || {
        std::thread::sleep(Duration::from_millis(30));
        handle.cancel();
    });
    let outcome = conn.execute_batch("WAITFOR DELAY '00:00:05'", &[]).unwrap();
    canceller.join().unwrap();

    assert!(outcome.cancelled);
    conn.cancel().unwrap();
    conn.cancel().unwrap();
    assert!(conn.is_alive());
}
