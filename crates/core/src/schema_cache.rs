use std::sync::Arc;

use parking_lot::Mutex;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{EventBus, SessionEvent};
use crate::gateway::{request_data, request_list, GatewayClient, GatewayError, GatewayRequest};
use crate::model::{SchemaContext, TableInfo, TableSchema};

#[derive(Debug, Error)]
pub enum SchemaCacheError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("schema for `{table}` arrived after a newer focus request and was discarded")]
    FocusSuperseded { table: String },
}

/// A cached list together with the context it was fetched for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedList<T> {
    pub context: SchemaContext,
    pub items: Vec<T>,
}

/// The one table schema mutations are aimed at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FocusedTable {
    pub context: SchemaContext,
    pub schema: TableSchema,
}

impl FocusedTable {
    #[must_use]
    pub fn table(&self) -> &str {
        &self.schema.table
    }

    #[must_use]
    pub fn schema_qualifier(&self) -> Option<&str> {
        self.context.schema()
    }

    #[must_use]
    pub fn targets(&self, connection_id: &str, database: Option<&str>, table: &str) -> bool {
        self.context.connection_id == connection_id
            && self.context.database() == database
            && self.schema.table == table
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct SchemaCacheSnapshot {
    pub databases: Option<CachedList<String>>,
    pub schemas: Option<CachedList<String>>,
    pub tables: Option<CachedList<TableInfo>>,
    pub views: Option<CachedList<TableInfo>>,
    pub focus: Option<FocusedTable>,
}

#[derive(Debug, Default)]
struct SchemaCacheState {
    snapshot: SchemaCacheSnapshot,
    focus_generation: u64,
}

/// Per-session metadata cache.
///
/// Each fetch replaces its list wholesale; on failure the previous value is
/// left exactly as it was. Only [`SchemaCache::focus_table_schema`] writes the
/// focus, and with it the schema qualifier that row mutations read.
pub struct SchemaCache<G: GatewayClient> {
    gateway: Arc<G>,
    events: EventBus,
    state: Mutex<SchemaCacheState>,
}

impl<G: GatewayClient> SchemaCache<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, events: EventBus) -> Self {
        Self {
            gateway,
            events,
            state: Mutex::new(SchemaCacheState::default()),
        }
    }

    #[must_use]
    pub fn snapshot(&self) -> SchemaCacheSnapshot {
        self.state.lock().snapshot.clone()
    }

    #[must_use]
    pub fn current_focus(&self) -> Option<FocusedTable> {
        self.state.lock().snapshot.focus.clone()
    }

    /// Read at the point of use; never hold on to the result across awaits.
    #[must_use]
    pub fn current_schema_qualifier(&self) -> Option<String> {
        self.state
            .lock()
            .snapshot
            .focus
            .as_ref()
            .and_then(|focus| focus.schema_qualifier().map(str::to_string))
    }

    pub async fn fetch_databases(&self, connection_id: &str) -> Result<Vec<String>, SchemaCacheError> {
        let context = SchemaContext::connection(connection_id);
        let databases: Vec<String> = request_list(
            self.gateway.as_ref(),
            GatewayRequest::get(["connections", connection_id, "databases"]),
            "failed to load databases",
        )
        .await?;

        self.state.lock().snapshot.databases = Some(CachedList {
            context: context.clone(),
            items: databases.clone(),
        });
        self.events.publish(SessionEvent::DatabasesLoaded { context });
        Ok(databases)
    }

    pub async fn fetch_schemas(
        &self,
        connection_id: &str,
        database: Option<&str>,
    ) -> Result<Vec<String>, SchemaCacheError> {
        let context = SchemaContext::new(connection_id, database, None);
        let schemas: Vec<String> = request_list(
            self.gateway.as_ref(),
            GatewayRequest::get(["connections", connection_id, "schemas"])
                .with_query("database", context.database()),
            "failed to load schemas",
        )
        .await?;

        self.state.lock().snapshot.schemas = Some(CachedList {
            context: context.clone(),
            items: schemas.clone(),
        });
        self.events.publish(SessionEvent::SchemasLoaded { context });
        Ok(schemas)
    }

    pub async fn fetch_tables(
        &self,
        connection_id: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Result<Vec<TableInfo>, SchemaCacheError> {
        let context = SchemaContext::new(connection_id, database, schema);
        let tables = self.fetch_relations(&context, "tables", "failed to load tables").await?;

        self.state.lock().snapshot.tables = Some(CachedList {
            context: context.clone(),
            items: tables.clone(),
        });
        self.events.publish(SessionEvent::TablesLoaded { context });
        Ok(tables)
    }

    pub async fn fetch_views(
        &self,
        connection_id: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Result<Vec<TableInfo>, SchemaCacheError> {
        let context = SchemaContext::new(connection_id, database, schema);
        let views = self.fetch_relations(&context, "views", "failed to load views").await?;

        self.state.lock().snapshot.views = Some(CachedList {
            context: context.clone(),
            items: views.clone(),
        });
        self.events.publish(SessionEvent::ViewsLoaded { context });
        Ok(views)
    }

    async fn fetch_relations(
        &self,
        context: &SchemaContext,
        kind: &str,
        default_message: &str,
    ) -> Result<Vec<TableInfo>, GatewayError> {
        request_list(
            self.gateway.as_ref(),
            GatewayRequest::get(["connections", context.connection_id.as_str(), kind])
                .with_query("database", context.database())
                .with_query("schema", context.schema()),
            default_message,
        )
        .await
    }

    /// Loads one table's schema and makes it the mutation target.
    ///
    /// If another focus call started after this one, this response is stale:
    /// it is dropped and the newer focus stays in place.
    pub async fn focus_table_schema(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Result<TableSchema, SchemaCacheError> {
        self.focus(SchemaContext::new(connection_id, database, schema), table)
            .await
    }

    pub async fn focus(
        &self,
        context: SchemaContext,
        table: &str,
    ) -> Result<TableSchema, SchemaCacheError> {
        let generation = {
            let mut state = self.state.lock();
            state.focus_generation += 1;
            state.focus_generation
        };

        let table_schema: TableSchema = request_data(
            self.gateway.as_ref(),
            GatewayRequest::get([
                "connections",
                context.connection_id.as_str(),
                "tables",
                table,
                "schema",
            ])
            .with_query("database", context.database())
            .with_query("schema", context.schema()),
            "failed to load table schema",
        )
        .await?;

        {
            let mut state = self.state.lock();
            if state.focus_generation != generation {
                warn!(
                    table,
                    generation,
                    latest = state.focus_generation,
                    "discarding superseded table schema"
                );
                return Err(SchemaCacheError::FocusSuperseded {
                    table: table.to_string(),
                });
            }
            state.snapshot.focus = Some(FocusedTable {
                context: context.clone(),
                schema: table_schema.clone(),
            });
        }

        debug!(table, connection_id = %context.connection_id, "table focused");
        self.events.publish(SessionEvent::TableFocused {
            context,
            table: table.to_string(),
        });
        Ok(table_schema)
    }

    /// Drops the focus if it points at this table. Returns whether it did.
    pub fn invalidate_table(&self, connection_id: &str, database: Option<&str>, table: &str) -> bool {
        let removed = {
            let mut state = self.state.lock();
            let matches = state
                .snapshot
                .focus
                .as_ref()
                .is_some_and(|focus| focus.targets(connection_id, database, table));
            if matches {
                state.focus_generation += 1;
                state.snapshot.focus.take()
            } else {
                None
            }
        };

        let Some(focus) = removed else {
            return false;
        };
        self.events.publish(SessionEvent::FocusInvalidated {
            context: focus.context,
            table: table.to_string(),
        });
        true
    }

    /// Drops cached table and view lists for this connection and database.
    pub fn invalidate_relations(&self, connection_id: &str, database: Option<&str>) {
        let mut state = self.state.lock();
        let belongs = |list: &Option<CachedList<TableInfo>>| {
            list.as_ref().is_some_and(|list| {
                list.context.connection_id == connection_id && list.context.database() == database
            })
        };
        if belongs(&state.snapshot.tables) {
            state.snapshot.tables = None;
        }
        if belongs(&state.snapshot.views) {
            state.snapshot.views = None;
        }
    }

    /// Drops everything fetched for a connection that no longer exists.
    pub fn forget_connection(&self, connection_id: &str) {
        {
            let mut state = self.state.lock();
            let snapshot = &mut state.snapshot;
            if snapshot
                .databases
                .as_ref()
                .is_some_and(|list| list.context.connection_id == connection_id)
            {
                snapshot.databases = None;
            }
            if snapshot
                .schemas
                .as_ref()
                .is_some_and(|list| list.context.connection_id == connection_id)
            {
                snapshot.schemas = None;
            }
            if snapshot
                .tables
                .as_ref()
                .is_some_and(|list| list.context.connection_id == connection_id)
            {
                snapshot.tables = None;
            }
            if snapshot
                .views
                .as_ref()
                .is_some_and(|list| list.context.connection_id == connection_id)
            {
                snapshot.views = None;
            }
            if snapshot
                .focus
                .as_ref()
                .is_some_and(|focus| focus.context.connection_id == connection_id)
            {
                snapshot.focus = None;
                state.focus_generation += 1;
            }
        }
        self.events.publish(SessionEvent::ConnectionForgotten {
            connection_id: connection_id.to_string(),
        });
    }
}
