//! Tests for service resolution, validation and failover

use std::sync::Arc;

use dbapi::memory::{MemoryCluster, MemoryDriver, MemoryServer, ServerType};
use dbapi::prelude::*;

fn cluster(names: &[&str]) -> MemoryCluster {
    let cluster = MemoryCluster::new();
    for name in names {
        cluster.add_server(MemoryServer::new(*name, ServerType::MsSql).with_database("pubs"));
    }
    cluster
}

fn context(cluster: &MemoryCluster, config: ContextConfig) -> DriverContext {
    DriverContext::new(
        DriverRegistry::new().with_driver(MemoryDriver::new(cluster.clone())),
        "memory",
        config,
    )
    .unwrap()
}

fn service() -> ConnParams {
    ConnParams::new().with_server("orders").with_user("app")
}

// ==================== Priority Mapper Tests ====================

#[test]
fn test_priority_mapper_cycles_with_duplicates() {
    let s1 = ServerRef::new("S1");
    let s2 = ServerRef::new("S2");
    let mapper = PriorityMapper::new()
        .with("svc", s1.clone())
        .with("svc", s2.clone())
        .with("svc", s1.clone())
        .with("svc", s1.clone());

    let first_cycle: Vec<_> = (0..4).map(|_| mapper.get_server("svc").unwrap()).collect();
    assert_eq!(first_cycle, vec![s1.clone(), s2, s1.clone(), s1.clone()]);
    assert_eq!(mapper.get_server("svc").unwrap(), s1);
}

// ==================== Failover Tests ====================

#[test]
fn test_temporarily_invalid_server_is_never_chosen() {
    let cluster = cluster(&["A", "B"]);
    let ctx = context(&cluster, ContextConfig::default());
    let a = ServerRef::new("A");
    let mapper = PriorityMapper::new()
        .with("orders", a.clone())
        .with("orders", a.clone())
        .with("orders", ServerRef::new("B"))
        .with("orders", a);
    let validator = FnValidator::new("not_b", |conn: &Connection| {
        Ok(if conn.server_name() == "B" {
            Verdict::TemporarilyInvalid
        } else {
            Verdict::Valid
        })
    });
    let factory = ConnectionFactory::new(ctx, Arc::new(mapper), Arc::new(validator));

    for _ in 0..12 {
        let conn = factory.connect(&service()).unwrap();
        assert_eq!(conn.server_name(), "A");
    }
}

#[test]
fn test_requests_rotate_through_servers() {
    let cluster = cluster(&["A", "B"]);
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(TrivialValidator),
    );

    let chosen: Vec<String> = (0..4)
        .map(|_| factory.connect(&service()).unwrap().server_name().to_string())
        .collect();
    assert_eq!(chosen, vec!["A", "B", "A", "B"]);
}

#[test]
fn test_duplicate_entries_weight_requests() {
    let cluster = cluster(&["A", "B"]);
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(TrivialValidator),
    );

    for _ in 0..6 {
        factory.connect(&service()).unwrap();
    }
    assert_eq!(cluster.server("A").unwrap().total_connects(), 4);
    assert_eq!(cluster.server("B").unwrap().total_connects(), 2);
}

#[test]
fn test_connect_failure_moves_to_next_candidate() {
    let cluster = cluster(&["PRIMARY", "STANDBY"]);
    cluster.server("PRIMARY").unwrap().set_online(false);
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("PRIMARY"))
        .with("orders", ServerRef::new("STANDBY"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(TrivialValidator),
    );

    let conn = factory.connect(&service()).unwrap();
    assert_eq!(conn.server_name(), "STANDBY");
}

#[test]
fn test_permanently_invalid_server_is_skipped_for_the_request() {
    let cluster = cluster(&["A", "B"]);
    let ctx = context(&cluster, ContextConfig::default());
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let validator = FnValidator::new("not_a", |conn: &Connection| {
        Ok(if conn.server_name() == "A" {
            Verdict::PermanentlyInvalid
        } else {
            Verdict::Valid
        })
    });
    let factory = ConnectionFactory::new(ctx.clone(), Arc::new(mapper), Arc::new(validator));

    let conn = factory.connect(&service()).unwrap();
    assert_eq!(conn.server_name(), "B");
    assert_eq!(cluster.server("A").unwrap().total_connects(), 1);
    assert_eq!(ctx.stats().validation_failures, 1);
    drop(conn);

    // exclusion lasts for one request only
    factory.connect(&service()).unwrap();
    assert_eq!(cluster.server("A").unwrap().total_connects(), 2);
}

#[test]
fn test_missing_database_is_permanent() {
    let cluster = MemoryCluster::new();
    cluster.add_server(MemoryServer::new("NODB", ServerType::Sybase));
    cluster.add_server(MemoryServer::new("HASDB", ServerType::Sybase).with_database("pubs"));
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("NODB"))
        .with("orders", ServerRef::new("NODB"))
        .with("orders", ServerRef::new("HASDB"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(DatabaseValidator::new("pubs")),
    );

    let conn = factory.connect(&service()).unwrap();
    assert_eq!(conn.server_name(), "HASDB");
    assert_eq!(conn.database().unwrap().as_deref(), Some("pubs"));
    assert_eq!(cluster.server("NODB").unwrap().total_connects(), 1);
}

#[test]
fn test_exhaustion_reports_every_failure() {
    let cluster = cluster(&["A", "B"]);
    for name in ["A", "B"] {
        cluster.server(name).unwrap().set_online(false);
    }
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(TrivialValidator),
    );

    match factory.connect(&service()) {
        Err(Error::Multi(multi)) => {
            assert_eq!(multi.len(), 2);
            assert!(multi
                .errors()
                .iter()
                .all(|e| e.category() == ErrorCategory::Connection));
        }
        other => panic!("expected aggregated error, got {other:?}"),
    }
}

#[test]
fn test_unknown_service() {
    let cluster = cluster(&["A"]);
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(PriorityMapper::new()),
        Arc::new(TrivialValidator),
    );

    let err = factory.connect(&service()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::DataSource);

    let err = factory.connect(&ConnParams::new()).unwrap_err();
    assert_eq!(err.category(), ErrorCategory::Configuration);
}

#[test]
fn test_ceiling_aborts_the_request() {
    let cluster = cluster(&["A", "B"]);
    let ctx = context(&cluster, ContextConfig::default().with_max_connections(1));
    let _held = ctx.connect(&ConnParams::new().with_server("A")).unwrap();
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let factory = ConnectionFactory::new(ctx, Arc::new(mapper), Arc::new(TrivialValidator));

    let err = factory.connect(&service()).unwrap_err();
    assert!(matches!(err, Error::CeilingExceeded { limit: 1 }));
    assert!(err.is_client());
    assert_eq!(cluster.server("B").unwrap().total_connects(), 0);
}

#[test]
fn test_validator_error_is_classified() {
    let cluster = cluster(&["A", "B"]);
    let mapper = PriorityMapper::new()
        .with("orders", ServerRef::new("A"))
        .with("orders", ServerRef::new("B"));
    let validator = FnValidator::new("table_check", |conn: &Connection| {
        if conn.server_name() == "A" {
            conn.execute("SELECT * FROM missing_table", &[])?;
        }
        Ok(Verdict::Valid)
    });
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(validator),
    );

    let conn = factory.connect(&service()).unwrap();
    assert_eq!(conn.server_name(), "B");
}

// ==================== Redispatch Tests ====================

#[test]
fn test_redispatch_consults_mapper_per_attempt() {
    let cluster = cluster(&["A", "B"]);
    cluster.server("A").unwrap().set_online(false);
    let mapper = Arc::new(
        PriorityMapper::new()
            .with("orders", ServerRef::new("A"))
            .with("orders", ServerRef::new("B")),
    );
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        mapper.clone(),
        Arc::new(TrivialValidator),
    )
    .with_config(FactoryConfig::redispatch(3));

    let conn = factory.connect(&service()).unwrap();
    assert_eq!(conn.server_name(), "B");
    // the mapper advanced once per attempt
    assert_eq!(mapper.get_server("orders").unwrap().name, "A");
}

#[test]
fn test_redispatch_attempt_bound() {
    let cluster = cluster(&["A"]);
    cluster.server("A").unwrap().set_online(false);
    let mapper = PriorityMapper::new().with("orders", ServerRef::new("A"));
    let factory = ConnectionFactory::new(
        context(&cluster, ContextConfig::default()),
        Arc::new(mapper),
        Arc::new(TrivialValidator),
    )
    .with_config(FactoryConfig::redispatch(4));

    match factory.connect(&service()) {
        Err(Error::Multi(multi)) => assert_eq!(multi.len(), 4),
        other => panic!("expected aggregated error, got {other:?}"),
    }
}

// ==================== Pool Interaction Tests ====================

#[test]
fn test_factory_reuses_pooled_connection() {
    let cluster = cluster(&["A"]);
    let ctx = context(&cluster, ContextConfig::default());
    let mapper = PriorityMapper::new().with("orders", ServerRef::new("A"));
    let factory = ConnectionFactory::new(ctx.clone(), Arc::new(mapper), Arc::new(TrivialValidator));
    let params = service().with_pool_name("orders_pool").with_reusable(true);

    factory.connect(&params).unwrap().close().unwrap();
    assert_eq!(ctx.idle_count("orders_pool"), 1);

    let conn = factory.connect(&params).unwrap();
    assert_eq!(conn.server_name(), "A");
    assert_eq!(ctx.stats().pool_hits, 1);
    assert_eq!(cluster.server("A").unwrap().total_connects(), 1);
}
