//! Structural table changes: ordered alter actions and table renames.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;
use tracing::{debug, info};

use crate::config::InvalidationPolicy;
use crate::events::{EventBus, SessionEvent};
use crate::gateway::{request_value, GatewayClient, GatewayError, GatewayRequest};
use crate::model::non_empty;
use crate::schema_cache::SchemaCache;

#[derive(Debug, Error)]
pub enum SchemaMutationError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("alter request for `{table}` has no actions")]
    EmptyActions { table: String },
    #[error("alter action #{index} is invalid: {reason}")]
    InvalidAction { index: usize, reason: String },
    #[error("new table name is empty")]
    EmptyNewName,
    #[error("failed to encode alter request: {0}")]
    Encode(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AlterActionType {
    AddColumn,
    DropColumn,
    ModifyColumn,
    RenameColumn,
    AddIndex,
    DropIndex,
    RenameTable,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ColumnDef {
    pub name: String,
    #[serde(rename = "type")]
    pub data_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub length: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub precision: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scale: Option<u32>,
    #[serde(default)]
    pub nullable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_value: Option<String>,
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub auto_increment: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
    /// Column to place this one after, where the dialect supports it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub after: Option<String>,
}

impl ColumnDef {
    #[must_use]
    pub fn new(name: impl Into<String>, data_type: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            data_type: data_type.into(),
            nullable: true,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    #[must_use]
    pub fn with_length(mut self, length: u32) -> Self {
        self.length = Some(length);
        self
    }

    #[must_use]
    pub fn with_default(mut self, value: impl Into<String>) -> Self {
        self.default_value = Some(value.into());
        self
    }

    #[must_use]
    pub fn after(mut self, column: impl Into<String>) -> Self {
        self.after = Some(column.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IndexDef {
    pub name: String,
    pub columns: Vec<String>,
    #[serde(default)]
    pub unique: bool,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub index_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comment: Option<String>,
}

impl IndexDef {
    #[must_use]
    pub fn new<S: Into<String>>(name: impl Into<String>, columns: impl IntoIterator<Item = S>) -> Self {
        Self {
            name: name.into(),
            columns: columns.into_iter().map(Into::into).collect(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn unique(mut self) -> Self {
        self.unique = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AlterTableAction {
    #[serde(rename = "type")]
    pub action_type: AlterActionType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub column: Option<ColumnDef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub old_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub new_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexDef>,
}

impl AlterTableAction {
    fn bare(action_type: AlterActionType) -> Self {
        Self {
            action_type,
            column: None,
            old_name: None,
            new_name: None,
            index: None,
        }
    }

    #[must_use]
    pub fn add_column(column: ColumnDef) -> Self {
        Self {
            column: Some(column),
            ..Self::bare(AlterActionType::AddColumn)
        }
    }

    #[must_use]
    pub fn drop_column(name: impl Into<String>) -> Self {
        Self {
            old_name: Some(name.into()),
            ..Self::bare(AlterActionType::DropColumn)
        }
    }

    #[must_use]
    pub fn modify_column(column: ColumnDef) -> Self {
        Self {
            column: Some(column),
            ..Self::bare(AlterActionType::ModifyColumn)
        }
    }

    /// Some dialects restate the full column type on rename, so the new
    /// definition travels with the names.
    #[must_use]
    pub fn rename_column(old_name: impl Into<String>, column: ColumnDef) -> Self {
        Self {
            old_name: Some(old_name.into()),
            new_name: Some(column.name.clone()),
            column: Some(column),
            ..Self::bare(AlterActionType::RenameColumn)
        }
    }

    #[must_use]
    pub fn add_index(index: IndexDef) -> Self {
        Self {
            index: Some(index),
            ..Self::bare(AlterActionType::AddIndex)
        }
    }

    #[must_use]
    pub fn drop_index(name: impl Into<String>) -> Self {
        Self {
            old_name: Some(name.into()),
            ..Self::bare(AlterActionType::DropIndex)
        }
    }

    #[must_use]
    pub fn rename_table(new_name: impl Into<String>) -> Self {
        Self {
            new_name: Some(new_name.into()),
            ..Self::bare(AlterActionType::RenameTable)
        }
    }

    /// Checks that the fields this action kind needs are present.
    pub fn validate(&self) -> Result<(), String> {
        let named = |value: &Option<String>, field: &str| {
            if value.as_deref().and_then(non_empty).is_some() {
                Ok(())
            } else {
                Err(format!("{field} is required"))
            }
        };
        let column = || {
            let Some(column) = &self.column else {
                return Err("column definition is required".to_string());
            };
            if non_empty(&column.name).is_none() {
                return Err("column name is required".to_string());
            }
            if non_empty(&column.data_type).is_none() {
                return Err(format!("column `{}` has no type", column.name));
            }
            Ok(())
        };

        match self.action_type {
            AlterActionType::AddColumn | AlterActionType::ModifyColumn => column(),
            AlterActionType::DropColumn | AlterActionType::DropIndex => {
                named(&self.old_name, "oldName")
            }
            AlterActionType::RenameColumn => {
                named(&self.old_name, "oldName")?;
                named(&self.new_name, "newName")?;
                column()
            }
            AlterActionType::AddIndex => match &self.index {
                None => Err("index definition is required".to_string()),
                Some(index) if non_empty(&index.name).is_none() => {
                    Err("index name is required".to_string())
                }
                Some(index) if index.columns.is_empty() => {
                    Err(format!("index `{}` has no columns", index.name))
                }
                Some(_) => Ok(()),
            },
            AlterActionType::RenameTable => named(&self.new_name, "newName"),
        }
    }
}

/// Actions are applied server-side in the order they were pushed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AlterTableRequest {
    #[serde(default)]
    pub database: String,
    #[serde(default)]
    pub table: String,
    pub actions: Vec<AlterTableAction>,
}

impl AlterTableRequest {
    #[must_use]
    pub fn new(database: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            database: database.into(),
            table: table.into(),
            actions: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_action(mut self, action: AlterTableAction) -> Self {
        self.actions.push(action);
        self
    }

    /// The table name after this request applies, if it renames the table.
    #[must_use]
    pub fn renamed_to(&self) -> Option<&str> {
        self.actions
            .iter()
            .rev()
            .filter(|action| action.action_type == AlterActionType::RenameTable)
            .find_map(|action| action.new_name.as_deref().and_then(non_empty))
    }

    pub fn validate(&self) -> Result<(), SchemaMutationError> {
        if self.actions.is_empty() {
            return Err(SchemaMutationError::EmptyActions {
                table: self.table.clone(),
            });
        }
        for (index, action) in self.actions.iter().enumerate() {
            action
                .validate()
                .map_err(|reason| SchemaMutationError::InvalidAction { index, reason })?;
        }
        Ok(())
    }
}

pub struct SchemaMutationCoordinator<G: GatewayClient> {
    gateway: Arc<G>,
    schema_cache: Arc<SchemaCache<G>>,
    events: EventBus,
    invalidation: InvalidationPolicy,
}

impl<G: GatewayClient> SchemaMutationCoordinator<G> {
    #[must_use]
    pub fn new(
        gateway: Arc<G>,
        schema_cache: Arc<SchemaCache<G>>,
        events: EventBus,
        invalidation: InvalidationPolicy,
    ) -> Self {
        Self {
            gateway,
            schema_cache,
            events,
            invalidation,
        }
    }

    /// Blank `database`/`table` in the request are filled from the arguments.
    pub async fn alter_table(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        mut request: AlterTableRequest,
    ) -> Result<(), SchemaMutationError> {
        if non_empty(&request.table).is_none() {
            request.table = table.to_string();
        }
        if non_empty(&request.database).is_none() {
            request.database = database.unwrap_or_default().to_string();
        }
        request.validate()?;

        let body = serde_json::to_value(&request)?;
        request_value(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", connection_id, "tables", table, "alter"])
                .with_query("database", database)
                .with_body(body),
            "failed to alter table",
        )
        .await?;

        info!(table, actions = request.actions.len(), "table altered");
        self.after_structural_change(connection_id, database, table, request.renamed_to().is_some());
        self.events.publish(SessionEvent::TableAltered {
            table: table.to_string(),
        });
        Ok(())
    }

    pub async fn rename_table(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        new_name: &str,
    ) -> Result<(), SchemaMutationError> {
        let Some(new_name) = non_empty(new_name) else {
            return Err(SchemaMutationError::EmptyNewName);
        };

        request_value(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", connection_id, "tables", table, "rename"])
                .with_query("database", database)
                .with_body(json!({ "newName": new_name })),
            "failed to rename table",
        )
        .await?;

        info!(from = table, to = new_name, "table renamed");
        self.after_structural_change(connection_id, database, table, true);
        self.events.publish(SessionEvent::TableRenamed {
            from: table.to_string(),
            to: new_name.to_string(),
        });
        Ok(())
    }

    fn after_structural_change(
        &self,
        connection_id: &str,
        database: Option<&str>,
        table: &str,
        renamed: bool,
    ) {
        match self.invalidation {
            InvalidationPolicy::Automatic => {
                self.schema_cache.invalidate_table(connection_id, database, table);
                if renamed {
                    self.schema_cache.invalidate_relations(connection_id, database);
                }
            }
            InvalidationPolicy::CallerRefetch => {
                debug!(table, "leaving cached schema for the caller to refetch");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::{json, Value};

    use super::{
        AlterActionType, AlterTableAction, AlterTableRequest, ColumnDef, IndexDef,
        SchemaMutationCoordinator, SchemaMutationError,
    };
    use crate::config::InvalidationPolicy;
    use crate::events::{EventBus, SessionEvent};
    use crate::gateway::Method;
    use crate::schema_cache::SchemaCache;
    use crate::test_support::ScriptedGateway;

    fn orders_schema() -> Value {
        json!({
            "database": "sales",
            "table": "orders",
            "columns": [{ "name": "id", "type": "bigint", "nullable": false, "key": "PRI" }]
        })
    }

    async fn focused(
        gateway: &Arc<ScriptedGateway>,
        policy: InvalidationPolicy,
    ) -> (Arc<SchemaCache<ScriptedGateway>>, SchemaMutationCoordinator<ScriptedGateway>) {
        gateway.ok(Method::Get, "connections/c1/tables/orders/schema", orders_schema());
        gateway.ok(Method::Get, "connections/c1/tables", json!([{ "name": "orders" }]));
        let events = EventBus::default();
        let cache = Arc::new(SchemaCache::new(Arc::clone(gateway), events.clone()));
        cache
            .fetch_tables("c1", Some("sales"), None)
            .await
            .expect("tables should load");
        cache
            .focus_table_schema("c1", "orders", Some("sales"), None)
            .await
            .expect("focus should succeed");
        let coordinator =
            SchemaMutationCoordinator::new(Arc::clone(gateway), Arc::clone(&cache), events, policy);
        (cache, coordinator)
    }

    #[test]
    fn actions_serialize_in_wire_shape() {
        let action = AlterTableAction::add_column(
            ColumnDef::new("note", "varchar").with_length(255).after("amount"),
        );
        assert_eq!(
            serde_json::to_value(&action).expect("action should encode"),
            json!({
                "type": "ADD_COLUMN",
                "column": { "name": "note", "type": "varchar", "length": 255, "nullable": true, "after": "amount" }
            })
        );

        let action = AlterTableAction::drop_index("idx_amount");
        assert_eq!(
            serde_json::to_value(&action).expect("action should encode"),
            json!({ "type": "DROP_INDEX", "oldName": "idx_amount" })
        );
    }

    #[test]
    fn validation_reports_offending_action() {
        let request = AlterTableRequest::new("sales", "orders")
            .with_action(AlterTableAction::drop_column("legacy"))
            .with_action(AlterTableAction::add_index(IndexDef::new("idx_empty", Vec::<String>::new())));

        let err = request.validate().expect_err("empty index should be rejected");
        assert!(matches!(
            err,
            SchemaMutationError::InvalidAction { index: 1, ref reason } if reason.contains("no columns")
        ));

        let mut rename = AlterTableAction::rename_column("amt", ColumnDef::new("amount", "decimal"));
        rename.new_name = None;
        assert_eq!(rename.validate(), Err("newName is required".to_string()));
    }

    #[tokio::test]
    async fn alter_preserves_action_order() {
        let gateway = ScriptedGateway::new();
        let (_cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;
        gateway.ok(Method::Post, "connections/c1/tables/orders/alter", Value::Null);

        let request = AlterTableRequest::new("", "")
            .with_action(AlterTableAction::drop_index("idx_amount"))
            .with_action(AlterTableAction::add_column(ColumnDef::new("note", "text")))
            .with_action(AlterTableAction::drop_column("legacy"))
            .with_action(AlterTableAction::add_index(
                IndexDef::new("idx_note", ["note"]).unique(),
            ));
        coordinator
            .alter_table("c1", "orders", Some("sales"), request)
            .await
            .expect("alter should succeed");

        let call = gateway.last_call().expect("request recorded");
        assert_eq!(call.query_value("database"), Some("sales"));
        let body = call.body.expect("body recorded");
        assert_eq!(body["database"], "sales");
        assert_eq!(body["table"], "orders");
        let kinds = body["actions"]
            .as_array()
            .expect("actions array")
            .iter()
            .map(|action| action["type"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(kinds, vec!["DROP_INDEX", "ADD_COLUMN", "DROP_COLUMN", "ADD_INDEX"]);
    }

    #[tokio::test]
    async fn empty_alter_is_rejected_locally() {
        let gateway = ScriptedGateway::new();
        let (_cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;
        let before = gateway.calls().len();

        let err = coordinator
            .alter_table("c1", "orders", Some("sales"), AlterTableRequest::new("sales", "orders"))
            .await
            .expect_err("empty request should fail");

        assert!(matches!(err, SchemaMutationError::EmptyActions { .. }));
        assert_eq!(gateway.calls().len(), before);
    }

    #[tokio::test]
    async fn automatic_policy_drops_focus_after_alter() {
        let gateway = ScriptedGateway::new();
        let (cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;
        gateway.ok(Method::Post, "connections/c1/tables/orders/alter", Value::Null);
        let mut events = coordinator.events.subscribe();

        coordinator
            .alter_table(
                "c1",
                "orders",
                Some("sales"),
                AlterTableRequest::new("sales", "orders")
                    .with_action(AlterTableAction::modify_column(ColumnDef::new("id", "bigint").not_null())),
            )
            .await
            .expect("alter should succeed");

        assert!(cache.current_focus().is_none());
        assert!(cache.snapshot().tables.is_some());
        assert!(matches!(events.try_recv().ok(), Some(SessionEvent::FocusInvalidated { .. })));
        assert_eq!(
            events.try_recv().ok(),
            Some(SessionEvent::TableAltered { table: "orders".to_string() })
        );
    }

    #[tokio::test]
    async fn caller_refetch_policy_keeps_cache() {
        let gateway = ScriptedGateway::new();
        let (cache, coordinator) = focused(&gateway, InvalidationPolicy::CallerRefetch).await;
        gateway.ok(Method::Post, "connections/c1/tables/orders/rename", Value::Null);
        let before = cache.snapshot();

        coordinator
            .rename_table("c1", "orders", Some("sales"), "orders_2024")
            .await
            .expect("rename should succeed");

        assert_eq!(cache.snapshot(), before);
        let body = gateway.last_call().and_then(|call| call.body);
        assert_eq!(body, Some(json!({ "newName": "orders_2024" })));
    }

    #[tokio::test]
    async fn automatic_rename_drops_focus_and_table_list() {
        let gateway = ScriptedGateway::new();
        let (cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;
        gateway.ok(Method::Post, "connections/c1/tables/orders/rename", Value::Null);

        coordinator
            .rename_table("c1", "orders", Some("sales"), "orders_2024")
            .await
            .expect("rename should succeed");

        let snapshot = cache.snapshot();
        assert!(snapshot.focus.is_none());
        assert!(snapshot.tables.is_none());
    }

    #[tokio::test]
    async fn failed_alter_leaves_cache_untouched() {
        let gateway = ScriptedGateway::new();
        let (cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;
        gateway.fail(Method::Post, "connections/c1/tables/orders/alter", 500, "");
        let before = cache.snapshot();

        let err = coordinator
            .alter_table(
                "c1",
                "orders",
                Some("sales"),
                AlterTableRequest::new("sales", "orders")
                    .with_action(AlterTableAction::rename_table("orders_old")),
            )
            .await
            .expect_err("alter should fail");

        assert_eq!(err.to_string(), "failed to alter table");
        assert_eq!(cache.snapshot(), before);
    }

    #[tokio::test]
    async fn blank_new_name_is_rejected() {
        let gateway = ScriptedGateway::new();
        let (_cache, coordinator) = focused(&gateway, InvalidationPolicy::Automatic).await;

        let err = coordinator
            .rename_table("c1", "orders", Some("sales"), "  ")
            .await
            .expect_err("blank name should fail");
        assert!(matches!(err, SchemaMutationError::EmptyNewName));
        assert_eq!(
            AlterTableAction::rename_table("x").action_type,
            AlterActionType::RenameTable
        );
    }
}
