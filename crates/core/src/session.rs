use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::info;

use crate::config::SessionConfig;
use crate::connection_registry::{ConnectionRegistry, RegistryError};
use crate::events::{EventBus, SessionEvent};
use crate::export::ExportService;
use crate::gateway::GatewayClient;
use crate::model::{SchemaContext, TableSchema};
use crate::query_session::QuerySession;
use crate::row_mutation::RowMutationCoordinator;
use crate::schema_cache::{SchemaCache, SchemaCacheError};
use crate::schema_mutation::SchemaMutationCoordinator;
use crate::type_mapping::TypeMappingPreviewer;

/// One user session: every coordinator wired to the same gateway and event
/// bus, with the schema cache shared by the two mutation coordinators.
pub struct Session<G: GatewayClient> {
    events: EventBus,
    registry: ConnectionRegistry<G>,
    schema_cache: Arc<SchemaCache<G>>,
    queries: QuerySession<G>,
    rows: RowMutationCoordinator<G>,
    schema_mutations: SchemaMutationCoordinator<G>,
    type_mapping: TypeMappingPreviewer<G>,
    exports: ExportService<G>,
}

impl<G: GatewayClient> Session<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, config: &SessionConfig) -> Self {
        let events = EventBus::new(config.event_capacity);
        let schema_cache = Arc::new(SchemaCache::new(Arc::clone(&gateway), events.clone()));

        Self {
            registry: ConnectionRegistry::new(
                Arc::clone(&gateway),
                events.clone(),
                config.group_deletion,
            ),
            queries: QuerySession::new(Arc::clone(&gateway), events.clone()),
            rows: RowMutationCoordinator::new(
                Arc::clone(&gateway),
                Arc::clone(&schema_cache),
                events.clone(),
            ),
            schema_mutations: SchemaMutationCoordinator::new(
                Arc::clone(&gateway),
                Arc::clone(&schema_cache),
                events.clone(),
                config.schema_invalidation,
            ),
            type_mapping: TypeMappingPreviewer::new(Arc::clone(&gateway)),
            exports: ExportService::new(gateway),
            schema_cache,
            events,
        }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    #[must_use]
    pub fn registry(&self) -> &ConnectionRegistry<G> {
        &self.registry
    }

    #[must_use]
    pub fn schema_cache(&self) -> &SchemaCache<G> {
        &self.schema_cache
    }

    #[must_use]
    pub fn queries(&self) -> &QuerySession<G> {
        &self.queries
    }

    #[must_use]
    pub fn rows(&self) -> &RowMutationCoordinator<G> {
        &self.rows
    }

    #[must_use]
    pub fn schema_mutations(&self) -> &SchemaMutationCoordinator<G> {
        &self.schema_mutations
    }

    #[must_use]
    pub fn type_mapping(&self) -> &TypeMappingPreviewer<G> {
        &self.type_mapping
    }

    #[must_use]
    pub fn exports(&self) -> &ExportService<G> {
        &self.exports
    }

    /// Deletes the connection, then drops cached metadata and any held
    /// result that came from it. The local state is dropped whenever the
    /// server deleted the connection, even if the registry refresh failed.
    pub async fn delete_connection(&self, id: &str) -> Result<(), RegistryError> {
        let outcome = self.registry.delete_connection(id).await;
        let deleted = match &outcome {
            Ok(()) => true,
            Err(error) => error.change_applied(),
        };
        if deleted {
            self.schema_cache.forget_connection(id);
            self.queries.forget_connection(id);
            info!(connection_id = id, "connection removed from session");
        }
        outcome
    }

    /// Focuses a table, dropping the schema qualifier when the connection's
    /// dialect has no schema level.
    pub async fn focus_table_schema(
        &self,
        connection_id: &str,
        table: &str,
        database: Option<&str>,
        schema: Option<&str>,
    ) -> Result<TableSchema, SchemaCacheError> {
        let mut context = SchemaContext::new(connection_id, database, schema);
        if let Some(connection) = self.registry.connection(connection_id) {
            context = context.normalized_for(connection.kind);
        }
        self.schema_cache.focus(context, table).await
    }
}
