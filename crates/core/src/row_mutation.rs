use std::sync::Arc;

use serde_json::{json, Value};
use thiserror::Error;
use tracing::{info, warn};

use crate::events::{EventBus, RowMutationKind, SessionEvent};
use crate::gateway::{request_value, GatewayClient, GatewayError, GatewayRequest, Method};
use crate::model::Row;
use crate::schema_cache::SchemaCache;

#[derive(Debug, Error)]
pub enum RowMutationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("table `{focused}` on connection `{connection_id}` is focused, not `{table}`; focus `{table}` before changing its rows")]
    FocusMismatch {
        connection_id: String,
        table: String,
        focused: String,
    },
}

/// Inserts, updates and deletes single rows.
///
/// The schema qualifier always comes from the schema cache's current focus,
/// read when the call is made. A focus on any other connection, database or
/// table is rejected before anything is sent. Predicates are passed through
/// untouched and nothing is cached locally; callers re-fetch table data
/// themselves.
pub struct RowMutationCoordinator<G: GatewayClient> {
    gateway: Arc<G>,
    schema_cache: Arc<SchemaCache<G>>,
    events: EventBus,
}

impl<G: GatewayClient> RowMutationCoordinator<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, schema_cache: Arc<SchemaCache<G>>, events: EventBus) -> Self {
        Self {
            gateway,
            schema_cache,
            events,
        }
    }

    pub async fn create_row(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        data: Row,
    ) -> Result<(), RowMutationError> {
        self.submit(
            RowMutationKind::Create,
            connection_id,
            table,
            database,
            Value::Object(data),
        )
        .await
    }

    pub async fn update_row(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        data: Row,
        predicate: &str,
    ) -> Result<(), RowMutationError> {
        self.submit(
            RowMutationKind::Update,
            connection_id,
            table,
            database,
            json!({ "data": data, "where": predicate }),
        )
        .await
    }

    pub async fn delete_row(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        predicate: &str,
    ) -> Result<(), RowMutationError> {
        self.submit(
            RowMutationKind::Delete,
            connection_id,
            table,
            database,
            json!({ "where": predicate }),
        )
        .await
    }

    async fn submit(
        &self,
        kind: RowMutationKind,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        body: Value,
    ) -> Result<(), RowMutationError> {
        let focus = self.schema_cache.current_focus();
        match &focus {
            Some(focus) if focus.targets(connection_id, database, table) => {}
            Some(focus) => {
                warn!(
                    table,
                    focused = focus.table(),
                    "row mutation target differs from the focused table"
                );
                return Err(RowMutationError::FocusMismatch {
                    connection_id: focus.context.connection_id.clone(),
                    table: table.to_string(),
                    focused: focus.table().to_string(),
                });
            }
            None => warn!(table, "row mutation without a focused table"),
        }
        let schema = focus
            .as_ref()
            .and_then(|focus| focus.schema_qualifier().map(str::to_string));

        let (method, default_message) = match kind {
            RowMutationKind::Create => (Method::Post, "failed to create row"),
            RowMutationKind::Update => (Method::Put, "failed to update row"),
            RowMutationKind::Delete => (Method::Delete, "failed to delete row"),
        };
        let request = GatewayRequest::new(method, ["connections", connection_id, "tables", table, "data"])
            .with_query("database", database)
            .with_query("schema", schema.as_deref())
            .with_body(body);

        request_value(self.gateway.as_ref(), request, default_message).await?;
        info!(?kind, table, "row mutation applied");
        self.events.publish(SessionEvent::RowMutated {
            kind,
            table: table.to_string(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{RowMutationCoordinator, RowMutationError};
    use crate::events::{EventBus, RowMutationKind, SessionEvent};
    use crate::gateway::Method;
    use crate::model::Row;
    use crate::schema_cache::SchemaCache;
    use crate::test_support::ScriptedGateway;

    fn schema(table: &str) -> Value {
        json!({
            "database": "sales",
            "table": table,
            "columns": [{ "name": "id", "type": "bigint", "nullable": false, "key": "PRI" }],
            "indexes": null,
            "constraints": null
        })
    }

    fn coordinator(
        gateway: &Arc<ScriptedGateway>,
    ) -> (Arc<SchemaCache<ScriptedGateway>>, RowMutationCoordinator<ScriptedGateway>) {
        let events = EventBus::default();
        let cache = Arc::new(SchemaCache::new(Arc::clone(gateway), events.clone()));
        let rows = RowMutationCoordinator::new(Arc::clone(gateway), Arc::clone(&cache), events);
        (cache, rows)
    }

    fn row(value: Value) -> Row {
        match value {
            Value::Object(map) => map,
            other => panic!("expected an object, got {other}"),
        }
    }

    #[tokio::test]
    async fn delete_on_schema_less_focus_sends_no_qualifier() {
        let gateway = ScriptedGateway::new();
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", schema("orders"));
        gateway.ok(Method::Delete, "connections/c1/tables/orders/data", Value::Null);
        let (cache, rows) = coordinator(&gateway);
        let focused = cache
            .focus_table_schema("c1", "orders", Some("sales"), None)
            .await
            .expect("focus should succeed");
        assert_eq!(focused.table, "orders");

        rows.delete_row("c1", "orders", Some("sales"), "id=5")
            .await
            .expect("delete should succeed");

        let request = gateway.last_call().expect("request recorded");
        assert_eq!(request.method, Method::Delete);
        assert_eq!(request.query_value("database"), Some("sales"));
        assert_eq!(request.query_value("schema"), None);
        assert_eq!(request.body, Some(json!({ "where": "id=5" })));
    }

    #[tokio::test]
    async fn create_uses_qualifier_of_latest_focus() {
        let gateway = ScriptedGateway::new();
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", schema("orders"));
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", schema("orders"));
        gateway.ok(Method::Post, "connections/c1/tables/orders/data", Value::Null);
        let (cache, rows) = coordinator(&gateway);
        cache
            .focus_table_schema("c1", "orders", Some("sales"), Some("public"))
            .await
            .expect("first focus should succeed");
        cache
            .focus_table_schema("c1", "orders", Some("sales"), Some("archive"))
            .await
            .expect("second focus should succeed");

        let data = row(json!({ "id": 7, "amount": "12.50" }));
        rows.create_row("c1", "orders", Some("sales"), data.clone())
            .await
            .expect("create should succeed");

        let request = gateway.last_call().expect("request recorded");
        assert_eq!(request.query_value("schema"), Some("archive"));
        assert_eq!(request.body, Some(Value::Object(data)));
    }

    #[tokio::test]
    async fn update_sends_data_and_opaque_predicate() {
        let gateway = ScriptedGateway::new();
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", schema("orders"));
        gateway.ok(Method::Put, "connections/c1/tables/orders/data", Value::Null);
        let (cache, rows) = coordinator(&gateway);
        cache
            .focus_table_schema("c1", "orders", Some("sales"), Some("public"))
            .await
            .expect("focus should succeed");
        let mut events = cache_events(&rows);

        rows.update_row(
            "c1",
            "orders",
            Some("sales"),
            row(json!({ "amount": "99.00" })),
            "id = 7 AND status <> 'closed'",
        )
        .await
        .expect("update should succeed");

        let request = gateway.last_call().expect("request recorded");
        assert_eq!(request.method, Method::Put);
        assert_eq!(request.query_value("schema"), Some("public"));
        assert_eq!(
            request.body,
            Some(json!({ "data": { "amount": "99.00" }, "where": "id = 7 AND status <> 'closed'" }))
        );
        assert_eq!(
            events.try_recv().ok(),
            Some(SessionEvent::RowMutated {
                kind: RowMutationKind::Update,
                table: "orders".to_string()
            })
        );
    }

    fn cache_events(
        rows: &RowMutationCoordinator<ScriptedGateway>,
    ) -> tokio::sync::broadcast::Receiver<SessionEvent> {
        rows.events.subscribe()
    }

    #[tokio::test]
    async fn failure_uses_default_message_and_publishes_nothing() {
        let gateway = ScriptedGateway::new();
        gateway.fail(Method::Post, "connections/c1/tables/orders/data", 500, "");
        let (_cache, rows) = coordinator(&gateway);
        let mut events = cache_events(&rows);

        let err = rows
            .create_row("c1", "orders", None, row(json!({ "id": 1 })))
            .await
            .expect_err("create should fail");

        assert_eq!(err.to_string(), "failed to create row");
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn malformed_predicate_error_is_surfaced_verbatim() {
        let gateway = ScriptedGateway::new();
        gateway.fail(
            Method::Delete,
            "connections/c1/tables/orders/data",
            500,
            "Error 1064: You have an error in your SQL syntax",
        );
        let (_cache, rows) = coordinator(&gateway);

        let err = rows
            .delete_row("c1", "orders", Some("sales"), "id = = 5")
            .await
            .expect_err("delete should fail");

        assert_eq!(err.to_string(), "Error 1064: You have an error in your SQL syntax");
    }

    #[tokio::test]
    async fn focus_on_another_connection_rejects_the_write() {
        let gateway = ScriptedGateway::new();
        gateway.ok(
            Method::Get,
            "connections/c2/tables/customers/schema",
            json!({ "database": "crm", "table": "customers", "columns": [] }),
        );
        let (cache, rows) = coordinator(&gateway);
        cache
            .focus_table_schema("c2", "customers", Some("crm"), Some("billing"))
            .await
            .expect("focus should succeed");
        let mut events = cache_events(&rows);
        let calls_before = gateway.calls().len();

        let err = rows
            .delete_row("c1", "orders", Some("sales"), "id=5")
            .await
            .expect_err("foreign focus should be rejected");

        assert!(matches!(
            err,
            RowMutationError::FocusMismatch { ref connection_id, ref table, ref focused }
                if connection_id == "c2" && table == "orders" && focused == "customers"
        ));
        assert_eq!(gateway.calls().len(), calls_before);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn focus_on_another_database_rejects_the_write() {
        let gateway = ScriptedGateway::new();
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", schema("orders"));
        let (cache, rows) = coordinator(&gateway);
        cache
            .focus_table_schema("c1", "orders", Some("sales"), Some("archive"))
            .await
            .expect("focus should succeed");

        let err = rows
            .update_row("c1", "orders", Some("staging"), row(json!({ "id": 1 })), "id=1")
            .await
            .expect_err("focus on another database should be rejected");

        assert!(matches!(err, RowMutationError::FocusMismatch { .. }));
        assert_eq!(
            gateway.call_paths(),
            vec!["GET connections/c1/tables/orders/schema"]
        );
    }
}
