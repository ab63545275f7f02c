use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;
use thiserror::Error;
use tracing::{info, warn};

use crate::config::GroupDeletionPolicy;
use crate::events::{EventBus, SessionEvent};
use crate::gateway::{
    request_data, request_list, request_value, GatewayClient, GatewayError, GatewayRequest,
};
use crate::model::{Connection, ConnectionDraft, Group, GroupDraft, TestOutcome};

#[derive(Debug, Error)]
pub enum RegistryError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("moving group `{group_id}` under `{parent_id}` would create a cycle")]
    GroupCycle { group_id: String, parent_id: String },
    #[error("group `{group_id}` still has {children} child group(s)")]
    GroupNotEmpty { group_id: String, children: usize },
    #[error("failed to serialize request body: {0}")]
    Encode(#[source] serde_json::Error),
    /// The server accepted the change but the follow-up refresh failed, so
    /// the cached lists still show the state from before the change.
    #[error("change applied, but refreshing the registry failed: {0}")]
    RefreshFailed(#[source] GatewayError),
}

impl RegistryError {
    /// Whether the server applied the change despite the error.
    #[must_use]
    pub fn change_applied(&self) -> bool {
        matches!(self, Self::RefreshFailed(_))
    }
}

/// Read-only view over a flat group list.
#[derive(Debug, Clone, Copy)]
pub struct GroupTree<'a> {
    groups: &'a [Group],
}

impl<'a> GroupTree<'a> {
    #[must_use]
    pub fn new(groups: &'a [Group]) -> Self {
        Self { groups }
    }

    #[must_use]
    pub fn roots(&self) -> Vec<&'a Group> {
        self.groups
            .iter()
            .filter(|group| group.parent().is_none())
            .collect()
    }

    #[must_use]
    pub fn children(&self, id: &str) -> Vec<&'a Group> {
        self.groups
            .iter()
            .filter(|group| group.parent() == Some(id))
            .collect()
    }

    /// Every descendant of `id`, deepest first, so deleting in this order never
    /// orphans a group that is still present.
    #[must_use]
    pub fn descendants_deepest_first(&self, id: &str) -> Vec<&'a Group> {
        let mut ordered = Vec::new();
        let mut visited = BTreeSet::new();
        self.collect_post_order(id, &mut visited, &mut ordered);
        ordered
    }

    fn collect_post_order(
        &self,
        id: &str,
        visited: &mut BTreeSet<String>,
        ordered: &mut Vec<&'a Group>,
    ) {
        for child in self.children(id) {
            if !visited.insert(child.id.clone()) {
                continue;
            }
            self.collect_post_order(&child.id, visited, ordered);
            ordered.push(child);
        }
    }

    /// Whether re-parenting `group_id` under `parent_id` closes a loop.
    #[must_use]
    pub fn would_cycle(&self, group_id: &str, parent_id: &str) -> bool {
        let parents: HashMap<&str, &str> = self
            .groups
            .iter()
            .filter_map(|group| group.parent().map(|parent| (group.id.as_str(), parent)))
            .collect();

        let mut seen = BTreeSet::new();
        let mut cursor = Some(parent_id);
        while let Some(current) = cursor {
            if current == group_id {
                return true;
            }
            if !seen.insert(current) {
                // Pre-existing loop that does not involve `group_id`.
                return false;
            }
            cursor = parents.get(current).copied();
        }
        false
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RegistrySnapshot {
    pub connections: Vec<Connection>,
    pub groups: Vec<Group>,
    pub loading: bool,
}

#[derive(Debug, Default)]
struct RegistryState {
    connections: Vec<Connection>,
    groups: Vec<Group>,
    in_flight: usize,
}

struct LoadingGuard<'a> {
    state: &'a Mutex<RegistryState>,
}

impl<'a> LoadingGuard<'a> {
    fn enter(state: &'a Mutex<RegistryState>) -> Self {
        state.lock().in_flight += 1;
        Self { state }
    }
}

impl Drop for LoadingGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Single source of truth for which connections and groups exist.
///
/// Every mutation is two-phase: the gateway call, then, only on success, a
/// full refresh of groups and connections. Local lists are never patched.
pub struct ConnectionRegistry<G: GatewayClient> {
    gateway: Arc<G>,
    events: EventBus,
    deletion_policy: GroupDeletionPolicy,
    state: Mutex<RegistryState>,
}

impl<G: GatewayClient> ConnectionRegistry<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, events: EventBus, deletion_policy: GroupDeletionPolicy) -> Self {
        Self {
            gateway,
            events,
            deletion_policy,
            state: Mutex::new(RegistryState::default()),
        }
    }

    #[must_use]
    pub fn list_connections(&self) -> Vec<Connection> {
        self.state.lock().connections.clone()
    }

    #[must_use]
    pub fn list_groups(&self) -> Vec<Group> {
        self.state.lock().groups.clone()
    }

    #[must_use]
    pub fn connection(&self, id: &str) -> Option<Connection> {
        self.state
            .lock()
            .connections
            .iter()
            .find(|connection| connection.id == id)
            .cloned()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    #[must_use]
    pub fn snapshot(&self) -> RegistrySnapshot {
        let state = self.state.lock();
        RegistrySnapshot {
            connections: state.connections.clone(),
            groups: state.groups.clone(),
            loading: state.in_flight > 0,
        }
    }

    pub async fn fetch_groups(&self) -> Result<Vec<Group>, RegistryError> {
        let groups: Vec<Group> = request_list(
            self.gateway.as_ref(),
            GatewayRequest::get(["groups"]),
            "failed to load groups",
        )
        .await?;

        self.state.lock().groups.clone_from(&groups);
        self.events
            .publish(SessionEvent::GroupsRefreshed { count: groups.len() });
        Ok(groups)
    }

    /// Groups are always refreshed before connections so every group a
    /// connection points at is already known.
    pub async fn fetch_connections(&self) -> Result<Vec<Connection>, RegistryError> {
        let _loading = LoadingGuard::enter(&self.state);
        self.fetch_groups().await?;

        let connections: Vec<Connection> = request_list(
            self.gateway.as_ref(),
            GatewayRequest::get(["connections"]),
            "failed to load connections",
        )
        .await?;

        self.state.lock().connections.clone_from(&connections);
        self.events.publish(SessionEvent::ConnectionsRefreshed {
            count: connections.len(),
        });
        Ok(connections)
    }

    pub async fn create_connection(
        &self,
        draft: &ConnectionDraft,
    ) -> Result<Connection, RegistryError> {
        let created: Connection = request_data(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections"]).with_body(encode(draft)?),
            "failed to create connection",
        )
        .await?;
        info!(connection_id = %created.id, name = %created.name, "connection created");

        self.refresh_after_change().await?;
        Ok(created)
    }

    pub async fn update_connection(
        &self,
        id: &str,
        draft: &ConnectionDraft,
    ) -> Result<Connection, RegistryError> {
        let updated: Connection = request_data(
            self.gateway.as_ref(),
            GatewayRequest::put(["connections", id]).with_body(encode(draft)?),
            "failed to update connection",
        )
        .await?;
        info!(connection_id = %id, "connection updated");

        self.refresh_after_change().await?;
        Ok(updated)
    }

    pub async fn delete_connection(&self, id: &str) -> Result<(), RegistryError> {
        request_value(
            self.gateway.as_ref(),
            GatewayRequest::delete(["connections", id]),
            "failed to delete connection",
        )
        .await?;
        info!(connection_id = %id, "connection deleted");

        self.refresh_after_change().await?;
        Ok(())
    }

    /// Probes a saved connection. Nothing cached changes.
    pub async fn test_connection(&self, id: &str) -> Result<TestOutcome, RegistryError> {
        Ok(request_data(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", id, "test"]),
            "failed to test connection",
        )
        .await?)
    }

    /// Probes an unsaved configuration.
    pub async fn test_connection_config(
        &self,
        draft: &ConnectionDraft,
    ) -> Result<TestOutcome, RegistryError> {
        Ok(request_data(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", "test"]).with_body(encode(draft)?),
            "failed to test connection",
        )
        .await?)
    }

    pub async fn connect(&self, id: &str) -> Result<(), RegistryError> {
        request_value(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", id, "connect"]),
            "failed to open connection",
        )
        .await?;
        info!(connection_id = %id, "connection opened");

        self.refresh_after_change().await?;
        Ok(())
    }

    pub async fn close(&self, id: &str) -> Result<(), RegistryError> {
        request_value(
            self.gateway.as_ref(),
            GatewayRequest::post(["connections", id, "close"]),
            "failed to close connection",
        )
        .await?;
        info!(connection_id = %id, "connection closed");

        self.refresh_after_change().await?;
        Ok(())
    }

    pub async fn create_group(&self, draft: &GroupDraft) -> Result<Group, RegistryError> {
        let created: Group = request_data(
            self.gateway.as_ref(),
            GatewayRequest::post(["groups"]).with_body(encode(draft)?),
            "failed to create group",
        )
        .await?;
        info!(group_id = %created.id, name = %created.name, "group created");

        self.refresh_after_change().await?;
        Ok(created)
    }

    /// Rejects re-parenting that would make the cached tree cyclic before
    /// anything is sent.
    pub async fn update_group(&self, id: &str, draft: &GroupDraft) -> Result<Group, RegistryError> {
        if let Some(parent_id) = draft.parent() {
            let groups = self.list_groups();
            if GroupTree::new(&groups).would_cycle(id, parent_id) {
                return Err(RegistryError::GroupCycle {
                    group_id: id.to_string(),
                    parent_id: parent_id.to_string(),
                });
            }
        }

        let updated: Group = request_data(
            self.gateway.as_ref(),
            GatewayRequest::put(["groups", id]).with_body(encode(draft)?),
            "failed to update group",
        )
        .await?;
        info!(group_id = %id, "group updated");

        self.refresh_after_change().await?;
        Ok(updated)
    }

    /// Child groups are resolved against the cached tree. Under
    /// [`GroupDeletionPolicy::Cascade`] a failure part-way still refreshes,
    /// because the deletions that did succeed changed the server.
    pub async fn delete_group(&self, id: &str) -> Result<(), RegistryError> {
        let groups = self.list_groups();
        let tree = GroupTree::new(&groups);
        let doomed: Vec<String> = match self.deletion_policy {
            GroupDeletionPolicy::RejectIfNonEmpty => {
                let children = tree.children(id).len();
                if children > 0 {
                    return Err(RegistryError::GroupNotEmpty {
                        group_id: id.to_string(),
                        children,
                    });
                }
                vec![id.to_string()]
            }
            GroupDeletionPolicy::Cascade => tree
                .descendants_deepest_first(id)
                .into_iter()
                .map(|group| group.id.clone())
                .chain(std::iter::once(id.to_string()))
                .collect(),
        };

        let mut deleted = 0_usize;
        for group_id in &doomed {
            let outcome = request_value(
                self.gateway.as_ref(),
                GatewayRequest::delete(["groups", group_id.as_str()]),
                "failed to delete group",
            )
            .await;

            if let Err(error) = outcome {
                if deleted > 0 {
                    warn!(group_id = %id, deleted, %error, "cascade delete stopped part-way");
                    if let Err(refresh_error) = self.fetch_connections().await {
                        warn!(group_id = %id, error = %refresh_error, "refresh after partial cascade failed");
                    }
                }
                return Err(error.into());
            }
            deleted += 1;
        }
        info!(group_id = %id, deleted, "group deleted");

        self.refresh_after_change().await?;
        Ok(())
    }

    async fn refresh_after_change(&self) -> Result<(), RegistryError> {
        match self.fetch_connections().await {
            Ok(_) => Ok(()),
            Err(RegistryError::Gateway(error)) => {
                warn!(%error, "registry refresh after a mutation failed");
                Err(RegistryError::RefreshFailed(error))
            }
            Err(other) => Err(other),
        }
    }
}

fn encode(body: &impl serde::Serialize) -> Result<Value, RegistryError> {
    serde_json::to_value(body).map_err(RegistryError::Encode)
}
