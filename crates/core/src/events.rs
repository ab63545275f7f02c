use tokio::sync::broadcast;

use crate::model::SchemaContext;

pub const DEFAULT_EVENT_CAPACITY: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RowMutationKind {
    Create,
    Update,
    Delete,
}

/// State-change notifications. Subscribers re-read the owning component's
/// snapshot; events never carry the new state themselves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    GroupsRefreshed { count: usize },
    ConnectionsRefreshed { count: usize },
    DatabasesLoaded { context: SchemaContext },
    SchemasLoaded { context: SchemaContext },
    TablesLoaded { context: SchemaContext },
    ViewsLoaded { context: SchemaContext },
    TableFocused { context: SchemaContext, table: String },
    FocusInvalidated { context: SchemaContext, table: String },
    ConnectionForgotten { connection_id: String },
    QueryStarted { generation: u64 },
    QueryCompleted { generation: u64 },
    QueryFailed { generation: u64, message: String },
    QuerySuperseded { generation: u64 },
    ResultCleared,
    RowMutated { kind: RowMutationKind, table: String },
    TableAltered { table: String },
    TableRenamed { from: String, to: String },
}

#[derive(Debug, Clone)]
pub struct EventBus {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventBus {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publishing without subscribers is fine; the event is dropped.
    pub fn publish(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
