//! Tests for error handler stacks and the pending-error queue

use std::sync::{Arc, Mutex};

use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
use dbapi::prelude::*;

fn context() -> DriverContext {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SYB1", ServerType::Sybase));
    DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster)),
        "memory",
        ContextConfig::default(),
    )
    .unwrap()
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn params() -> ConnParams {
    ConnParams::new().with_server("SYB1")
}

fn recorder(
    name: &'static str,
    log: &Arc<Mutex<Vec<&'static str>>>,
) -> FnHandler<impl Fn(&Error) -> bool + Send + Sync> {
    let log = Arc::clone(log);
    FnHandler::new(name, move |_err: &Error| {
        log.lock().unwrap().push(name);
        false
    })
}

// ==================== Chain Order Tests ====================

#[test]
fn test_chain_runs_own_then_defaults_then_context() {
    let ctx = context();
    let log = Arc::new(Mutex::new(Vec::new()));
    ctx.push_handler_owned(HandlerScope::ContextWide, recorder("context", &log));
    ctx.push_handler_owned(HandlerScope::ConnectionDefault, recorder("defaults", &log));

    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(recorder("own", &log)).unwrap();

    let err = conn.execute("SELECT * FROM missing", &[]).unwrap_err();
    assert_eq!(err.code(), Some(208));
    assert_eq!(*log.lock().unwrap(), vec!["own", "defaults", "context"]);
}

#[test]
fn test_stack_runs_most_recent_first() {
    let ctx = context();
    let log = Arc::new(Mutex::new(Vec::new()));
    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(recorder("first", &log)).unwrap();
    conn.push_handler_owned(recorder("second", &log)).unwrap();

    conn.execute("SELECT * FROM missing", &[]).unwrap_err();
    assert_eq!(*log.lock().unwrap(), vec!["second", "first"]);
}

#[test]
fn test_absorbing_handler_stops_propagation() {
    let ctx = context();
    let context_seen = Arc::new(CollectingHandler::new());
    ctx.push_handler_borrowed(HandlerScope::ContextWide, &context_seen);

    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(SilentHandler).unwrap();
    assert_eq!(conn.execute("SELECT * FROM missing", &[]).unwrap(), 0);
    assert_eq!(context_seen.count(), 0);
}

#[test]
fn test_connections_keep_their_snapshot() {
    let ctx = context();
    let early = ctx.connect(&params()).unwrap();

    let collector = Arc::new(CollectingHandler::absorbing());
    let id = ctx.push_handler_borrowed(HandlerScope::ContextWide, &collector);

    assert!(early.execute("SELECT * FROM missing", &[]).is_err());
    assert_eq!(collector.count(), 0);

    let late = ctx.connect(&params()).unwrap();
    assert_eq!(late.execute("SELECT * FROM missing", &[]).unwrap(), 0);
    assert_eq!(collector.count(), 1);

    assert!(ctx.remove_handler(HandlerScope::ContextWide, id));
    assert!(!ctx.remove_handler(HandlerScope::ContextWide, id));
    assert_eq!(late.execute("SELECT * FROM missing", &[]).unwrap(), 0);
    assert_eq!(collector.count(), 2);

    let after = ctx.connect(&params()).unwrap();
    assert!(after.execute("SELECT * FROM missing", &[]).is_err());
}

// ==================== Absorption Tests ====================

#[test]
fn test_absorbed_statements_return_neutral_values() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(SilentHandler).unwrap();

    assert_eq!(conn.execute("SELEC 1", &[]).unwrap(), 0);
    assert!(conn.query("SELECT * FROM missing", &[]).unwrap().is_empty());
    assert!(conn.query_one("SELECT * FROM missing", &[]).unwrap().is_none());
}

#[test]
fn test_handle_producing_operations_always_surface() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    let collector = Arc::new(CollectingHandler::absorbing());
    conn.push_handler_borrowed(&collector).unwrap();

    let err = conn.use_database("nowhere").unwrap_err();
    assert_eq!(err.code(), Some(911));

    let err = conn
        .open_cursor(CursorSpec::new("c1", "SELECT * FROM missing"))
        .unwrap_err();
    assert_eq!(err.code(), Some(208));

    // handlers still observe the failures
    assert_eq!(collector.count(), 2);
}

#[test]
fn test_dropped_borrowed_handler_is_skipped() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    let collector = Arc::new(CollectingHandler::absorbing());
    conn.push_handler_borrowed(&collector).unwrap();

    assert!(conn.execute("SELECT * FROM missing", &[]).is_ok());
    assert_eq!(collector.count(), 1);

    drop(collector);
    assert!(conn.execute("SELECT * FROM missing", &[]).is_err());
}

#[test]
fn test_remove_connection_handler() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    let id = conn.push_handler_owned(SilentHandler).unwrap();
    assert!(conn.execute("SELECT * FROM missing", &[]).is_ok());

    assert!(conn.remove_handler(id).unwrap());
    assert!(conn.execute("SELECT * FROM missing", &[]).is_err());
}

#[test]
fn test_logging_handler_never_absorbs() {
    init_tracing();
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(LoggingHandler).unwrap();
    assert!(conn.execute("SELECT * FROM missing", &[]).is_err());
}

// ==================== Severity Tests ====================

#[test]
fn test_severity_filter_absorbs_warnings_only() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    let below = Arc::new(CollectingHandler::new());
    conn.push_handler_borrowed(&below).unwrap();
    conn.push_handler_owned(SeverityFilter::up_to(Severity::Warning))
        .unwrap();

    conn.execute("RAISERROR('careful', 10, 1)", &[]).unwrap();
    assert_eq!(below.count(), 0);

    let err = conn.execute("RAISERROR('boom', 16, 1)", &[]).unwrap_err();
    assert_eq!(err.code(), Some(50000));
    assert_eq!(err.severity(), Severity::Error);
    assert!(err.is_server());

    let seen = below.take();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].code(), Some(50000));
}

#[test]
fn test_server_messages_reach_handlers() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    let collector = Arc::new(CollectingHandler::absorbing());
    conn.push_handler_borrowed(&collector).unwrap();

    conn.execute("PRINT 'hello'", &[]).unwrap();
    let seen = collector.take();
    assert_eq!(seen.len(), 1);
    assert_eq!(seen[0].severity(), Severity::Info);
    assert!(seen[0].to_string().contains("hello"));
}

// ==================== Pending Queue Tests ====================

#[test]
fn test_pending_queue_collects_messages_and_errors() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    conn.enable_pending_errors(true).unwrap();
    conn.push_handler_owned(SilentHandler).unwrap();

    conn.execute("PRINT 'step one'", &[]).unwrap();
    conn.execute("SELECT * FROM missing", &[]).unwrap();

    let pending = conn.take_pending_errors();
    assert_eq!(pending.len(), 2);
    assert_eq!(pending[0].severity(), Severity::Info);
    assert_eq!(pending[1].code(), Some(208));
    assert!(conn.take_pending_errors().is_empty());
}

#[test]
fn test_pending_queue_disabled_by_default() {
    let ctx = context();
    let conn = ctx.connect(&params()).unwrap();
    conn.push_handler_owned(SilentHandler).unwrap();
    conn.execute("SELECT * FROM missing", &[]).unwrap();
    assert!(conn.take_pending_errors().is_empty());

    conn.enable_pending_errors(true).unwrap();
    conn.execute("SELECT * FROM missing", &[]).unwrap();
    conn.enable_pending_errors(false).unwrap();
    assert!(conn.take_pending_errors().is_empty());
}

#[test]
fn test_pending_queue_from_context_config() {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SYB1", ServerType::Sybase));
    let ctx = DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster)),
        "memory",
        ContextConfig::default().with_pending_errors(true),
    )
    .unwrap();

    let conn = ctx.connect(&params()).unwrap();
    assert!(conn.execute("SELECT * FROM missing", &[]).is_err());
    assert_eq!(conn.take_pending_errors().len(), 1);
}
