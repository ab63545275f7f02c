use std::sync::Arc;

use dbm_adapters::HttpGateway;
use dbm_core::config::{GatewaySettings, SessionConfig};
use dbm_core::Session;

fn gateway_integration_enabled() -> bool {
    matches!(
        std::env::var("DBM_RUN_GATEWAY_INTEGRATION").ok().as_deref(),
        Some("1")
    )
}

fn integration_session() -> Session<HttpGateway> {
    let base_url = std::env::var("DBM_TEST_GATEWAY_URL")
        .unwrap_or_else(|_| "http://127.0.0.1:8080/api/v1".to_string());
    let mut config = SessionConfig::default();
    config.gateway = GatewaySettings::new(base_url);

    let gateway = HttpGateway::new(&config.gateway).expect("gateway should build");
    Session::new(Arc::new(gateway), &config)
}

#[tokio::test(flavor = "current_thread")]
async fn registry_and_metadata_round_trip() {
    if !gateway_integration_enabled() {
        return;
    }

    let session = integration_session();
    let connections = session
        .registry()
        .fetch_connections()
        .await
        .expect("connections should load");
    let groups = session.registry().list_groups();
    for connection in &connections {
        if let Some(group_id) = connection.group() {
            assert!(
                groups.iter().any(|group| group.id == group_id),
                "connection {} points at unknown group {group_id}",
                connection.id
            );
        }
    }

    let Some(connection) = connections.first() else {
        return;
    };
    session
        .registry()
        .connect(&connection.id)
        .await
        .expect("connect should succeed");

    let databases = session
        .schema_cache()
        .fetch_databases(&connection.id)
        .await
        .expect("databases should load");
    let database = connection
        .default_database()
        .map(str::to_string)
        .or_else(|| databases.first().cloned());

    let tables = session
        .schema_cache()
        .fetch_tables(&connection.id, database.as_deref(), None)
        .await
        .expect("tables should load");
    if let Some(table) = tables.first() {
        let schema = session
            .focus_table_schema(&connection.id, &table.name, database.as_deref(), None)
            .await
            .expect("focus should succeed");
        assert_eq!(schema.table, table.name);
    }

    let result = session
        .queries()
        .execute(&connection.id, "SELECT 1", None)
        .await
        .expect("query should succeed");
    assert_eq!(result.rows.len(), 1);
    assert_eq!(session.queries().result(), Some(result));
}

#[tokio::test(flavor = "current_thread")]
async fn unknown_connection_surfaces_server_message() {
    if !gateway_integration_enabled() {
        return;
    }

    let session = integration_session();
    let err = session
        .registry()
        .test_connection("dbm-integration-missing")
        .await
        .expect_err("unknown connection should fail");
    assert!(!err.to_string().is_empty());
}
