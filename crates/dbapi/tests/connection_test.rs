//! Tests for connection statements, transactions and server flavors

use std::sync::Arc;

use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
use dbapi::prelude::*;

fn context(cluster: &MemoryCluster) -> DriverContext {
    DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster.clone())),
        "memory",
        ContextConfig::default(),
    )
    .unwrap()
}

fn connect(server_type: ServerType) -> Connection {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SRV", server_type).with_database("pubs"));
    context(&cluster)
        .connect(&ConnParams::new().with_server("SRV"))
        .unwrap()
}

// ==================== Login Tests ====================

#[test]
fn test_login_checks_credentials() {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SRV", ServerType::MsSql).with_login("anyone", "allowed"));
    let ctx = context(&cluster);

    let good = ConnParams::new()
        .with_server("SRV")
        .with_user("anyone")
        .with_password("allowed");
    assert!(ctx.connect(&good).is_ok());

    let bad = ConnParams::new()
        .with_server("SRV")
        .with_user("anyone")
        .with_password("nope");
    let err = ctx.connect(&bad).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
}

#[test]
fn test_connect_to_missing_database() {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("SRV", ServerType::Sybase));
    let err = context(&cluster)
        .connect(&ConnParams::new().with_server("SRV").with_database("pubs"))
        .unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Connection);
}

#[test]
fn test_missing_server_name() {
    let cluster = MemoryCluster::new();
    let err = context(&cluster).connect(&ConnParams::new()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

// ==================== Statement Tests ====================

#[test]
fn test_crud_with_parameters() {
    let conn = connect(ServerType::MsSql);
    conn.execute("CREATE TABLE items (id INT NOT NULL, label VARCHAR(30) NULL, qty SMALLINT NULL)", &[])
        .unwrap();

    let inserted = conn
        .execute(
            "INSERT INTO items (id, label, qty) VALUES (?, ?, ?), (?, ?, ?)",
            &[
                Value::from(1),
                Value::from("apple"),
                Value::from(3_i16),
                Value::from(2),
                Value::from("pear"),
                Value::Null,
            ],
        )
        .unwrap();
    assert_eq!(inserted, 2);

    assert_eq!(
        conn.execute("UPDATE items SET qty = 9 WHERE id = @p1", &[Value::from(2)])
            .unwrap(),
        1
    );
    let row = conn
        .query_one("SELECT label, qty FROM items WHERE id = 2", &[])
        .unwrap()
        .unwrap();
    assert_eq!(row.get_by_name("label"), Some(&Value::String("pear".into())));
    assert_eq!(row.get_by_name("qty").and_then(Value::as_i64), Some(9));

    assert_eq!(conn.execute("DELETE FROM items WHERE id = 1", &[]).unwrap(), 1);
    assert_eq!(conn.query("SELECT * FROM items", &[]).unwrap().len(), 1);
}

#[test]
fn test_batch_with_several_result_sets() {
    let conn = connect(ServerType::Sybase);
    let outcome = conn
        .execute_batch(
            "CREATE TABLE t (id INT NOT NULL); INSERT INTO t VALUES (1); INSERT INTO t VALUES (2); \
             SELECT id FROM t WHERE id = 1; SELECT COUNT(*) FROM t",
            &[],
        )
        .unwrap();

    assert_eq!(outcome.rows_affected, 2);
    assert_eq!(outcome.result_sets.len(), 2);
    assert_eq!(outcome.result_sets[1].rows, vec![vec![Value::Int32(2)]]);
    assert!(!outcome.cancelled);
}

#[test]
fn test_server_errors_carry_codes() {
    let conn = connect(ServerType::MsSql);
    conn.execute("CREATE TABLE t (id INT NOT NULL)", &[]).unwrap();

    let cases = [
        ("CREATE TABLE t (id INT)", 2714),
        ("SELECT nope FROM t", 207),
        ("DROP TABLE missing", 3701),
        ("INSERT INTO t VALUES (NULL)", 515),
        ("SELEC * FROM t", 102),
    ];
    for (sql, code) in cases {
        let err = conn.execute(sql, &[]).unwrap_err();
        assert_eq!(err.code(), Some(code), "{sql}");
        assert!(err.is_server(), "{sql}");
        assert!(!err.is_client(), "{sql}");
    }
    // errors leave the connection usable
    assert!(conn.is_alive());
    assert_eq!(conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap(), 1);
}

// ==================== Flavor Tests ====================

#[test]
fn test_insert_overflow_by_server_type() {
    let mssql = connect(ServerType::MsSql);
    mssql.execute("CREATE TABLE t (code VARCHAR(3) NULL)", &[]).unwrap();
    let err = mssql.execute("INSERT INTO t VALUES ('abcdef')", &[]).unwrap_err();
    assert_eq!(err.code(), Some(8152));
    assert_eq!(err.severity(), Severity::Error);

    let sybase = connect(ServerType::Sybase);
    sybase.execute("CREATE TABLE t (code VARCHAR(3) NULL)", &[]).unwrap();
    sybase.execute("INSERT INTO t VALUES ('abcdef')", &[]).unwrap();
    let row = sybase.query_one("SELECT code FROM t", &[]).unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::String("abc".into())));
}

// ==================== Transaction Tests ====================

#[test]
fn test_commit_and_rollback() {
    let conn = connect(ServerType::MsSql);
    conn.execute("CREATE TABLE t (id INT NOT NULL)", &[]).unwrap();

    conn.begin().unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    conn.commit().unwrap();

    conn.begin().unwrap();
    conn.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    conn.execute("CREATE TABLE scratch (id INT)", &[]).unwrap();
    conn.rollback().unwrap();

    let row = conn.query_one("SELECT COUNT(*) FROM t", &[]).unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int32(1)));
    assert_eq!(conn.execute("SELECT * FROM scratch", &[]).unwrap_err().code(), Some(208));
}

#[test]
fn test_rollback_keeps_other_connections_work() {
    let cluster = MemoryCluster::new();
    let server = cluster.add_server(MemoryServer::new("SRV", ServerType::MsSql));
    let ctx = context(&cluster);
    let params = ConnParams::new().with_server("SRV");
    let a = ctx.connect(&params).unwrap();
    let b = ctx.connect(&params).unwrap();
    a.execute("CREATE TABLE t (id INT NOT NULL)", &[]).unwrap();

    a.begin().unwrap();
    a.execute("INSERT INTO t VALUES (100)", &[]).unwrap();

    let mut bulk = b.bulk_insert("t", BulkOptions::default()).unwrap();
    bulk.bind(1, ColumnType::Int).unwrap();
    for id in 0..10 {
        bulk.set(1, id).unwrap();
        bulk.add_row().unwrap();
    }
    assert_eq!(bulk.store_batch().unwrap(), 10);
    bulk.complete().unwrap();
    b.execute("INSERT INTO t VALUES (11)", &[]).unwrap();

    a.rollback().unwrap();
    assert_eq!(server.row_count("master", "t"), Some(11));
    assert!(b.query_one("SELECT id FROM t WHERE id = 100", &[]).unwrap().is_none());
}

#[test]
fn test_rollback_reverts_updates_deletes_and_drops() {
    let conn = connect(ServerType::Sybase);
    conn.execute("CREATE TABLE keep (id INT NOT NULL, v INT NULL)", &[]).unwrap();
    conn.execute("INSERT INTO keep VALUES (1, 10), (2, 20)", &[]).unwrap();

    conn.begin().unwrap();
    conn.execute("UPDATE keep SET v = 99 WHERE id = 1", &[]).unwrap();
    conn.execute("DELETE FROM keep WHERE id = 2", &[]).unwrap();
    conn.execute("DROP TABLE keep", &[]).unwrap();
    conn.rollback().unwrap();

    let rows = conn.query("SELECT id, v FROM keep", &[]).unwrap();
    assert_eq!(rows.len(), 2);
    let first = conn.query_one("SELECT v FROM keep WHERE id = 1", &[]).unwrap().unwrap();
    assert_eq!(first.get(0), Some(&Value::Int32(10)));
}

#[test]
fn test_pool_reset_keeps_other_connections_work() {
    let cluster = MemoryCluster::new();
    let server = cluster.add_server(MemoryServer::new("SRV", ServerType::MsSql));
    let ctx = context(&cluster);
    let pooled = ConnParams::new()
        .with_server("SRV")
        .with_pool_name("p")
        .with_reusable(true);
    let other = ctx.connect(&ConnParams::new().with_server("SRV")).unwrap();
    other.execute("CREATE TABLE t (id INT NOT NULL)", &[]).unwrap();

    let conn = ctx.connect(&pooled).unwrap();
    conn.begin().unwrap();
    conn.execute("INSERT INTO t VALUES (1)", &[]).unwrap();
    other.execute("INSERT INTO t VALUES (2)", &[]).unwrap();
    drop(conn);

    assert_eq!(server.row_count("master", "t"), Some(1));
    let row = other.query_one("SELECT id FROM t", &[]).unwrap().unwrap();
    assert_eq!(row.get(0), Some(&Value::Int32(2)));
}

#[test]
fn test_unbalanced_transaction_statements() {
    let conn = connect(ServerType::MsSql);
    assert_eq!(conn.commit().unwrap_err().code(), Some(3902));
    assert_eq!(conn.rollback().unwrap_err().code(), Some(3903));
}

// ==================== Database Tests ====================

#[test]
fn test_use_database() {
    let conn = connect(ServerType::Sybase);
    assert_eq!(conn.database().unwrap().as_deref(), Some("master"));

    conn.use_database("pubs").unwrap();
    assert_eq!(conn.database().unwrap().as_deref(), Some("pubs"));
    conn.execute("CREATE TABLE authors (id INT NOT NULL)", &[]).unwrap();

    conn.use_database("master").unwrap();
    assert!(conn.execute("SELECT * FROM authors", &[]).is_err());
    assert!(conn.query("SELECT * FROM pubs..authors", &[]).unwrap().is_empty());

    assert!(conn.use_database("pubs; DROP TABLE x").unwrap_err().is_client());
}

// ==================== Factory Validator Tests ====================

#[test]
fn test_single_server_mapper_with_query_validator() {
    let cluster = MemoryCluster::new();
    let server = cluster.add_server(MemoryServer::new("SRV", ServerType::MsSql));
    let ctx = context(&cluster);
    {
        let setup = ctx.connect(&ConnParams::new().with_server("SRV")).unwrap();
        setup.execute("CREATE TABLE health (ok INT)", &[]).unwrap();
    }

    let factory = ConnectionFactory::new(
        ctx,
        Arc::new(SingleServerMapper),
        Arc::new(QueryValidator::new("SELECT ok FROM health").require_row()),
    );
    assert!(factory.connect(&ConnParams::new().with_server("SRV")).is_err());

    let seed = factory.context().connect(&ConnParams::new().with_server("SRV")).unwrap();
    seed.execute("INSERT INTO health VALUES (1)", &[]).unwrap();
    drop(seed);

    let conn = factory.connect(&ConnParams::new().with_server("SRV")).unwrap();
    assert_eq!(conn.server_name(), "SRV");
    assert_eq!(server.total_connects(), 4);
}
