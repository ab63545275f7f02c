use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::json;
use thiserror::Error;
use tracing::{debug, warn};

use crate::events::{EventBus, SessionEvent};
use crate::gateway::{request_data, GatewayClient, GatewayError, GatewayRequest};
use crate::model::{ExecuteResult, QueryOptions, QueryResult};

#[derive(Debug, Error)]
pub enum QuerySessionError {
    #[error(transparent)]
    Gateway(#[from] GatewayError),
    #[error("query text is empty")]
    EmptyQuery,
    #[error("query {generation} was superseded by query {latest}")]
    Superseded { generation: u64, latest: u64 },
}

/// The single result a session shows, tagged with where it came from.
#[derive(Debug, Clone, PartialEq)]
pub struct HeldResult {
    pub connection_id: String,
    pub generation: u64,
    pub result: QueryResult,
}

#[derive(Debug, Default)]
struct QuerySessionState {
    held: Option<HeldResult>,
    generation: u64,
    in_flight: usize,
}

struct InFlightGuard<'a> {
    state: &'a Mutex<QuerySessionState>,
}

impl<'a> InFlightGuard<'a> {
    fn enter(state: &'a Mutex<QuerySessionState>) -> Self {
        state.lock().in_flight += 1;
        Self { state }
    }
}

impl Drop for InFlightGuard<'_> {
    fn drop(&mut self) {
        let mut state = self.state.lock();
        state.in_flight = state.in_flight.saturating_sub(1);
    }
}

/// Holds at most one query result.
///
/// Every result-producing execution takes a new generation number. A response
/// is only applied if its generation is still the latest when it arrives, so
/// a slow earlier query can never overwrite a newer one. A failed execution
/// leaves the previously held result in place.
pub struct QuerySession<G: GatewayClient> {
    gateway: Arc<G>,
    events: EventBus,
    state: Mutex<QuerySessionState>,
}

impl<G: GatewayClient> QuerySession<G> {
    #[must_use]
    pub fn new(gateway: Arc<G>, events: EventBus) -> Self {
        Self {
            gateway,
            events,
            state: Mutex::new(QuerySessionState::default()),
        }
    }

    #[must_use]
    pub fn result(&self) -> Option<QueryResult> {
        self.state
            .lock()
            .held
            .as_ref()
            .map(|held| held.result.clone())
    }

    #[must_use]
    pub fn held(&self) -> Option<HeldResult> {
        self.state.lock().held.clone()
    }

    #[must_use]
    pub fn is_loading(&self) -> bool {
        self.state.lock().in_flight > 0
    }

    #[must_use]
    pub fn generation(&self) -> u64 {
        self.state.lock().generation
    }

    pub async fn execute(
        &self,
        connection_id: &str,
        query: &str,
        options: Option<QueryOptions>,
    ) -> Result<QueryResult, QuerySessionError> {
        if query.trim().is_empty() {
            return Err(QuerySessionError::EmptyQuery);
        }

        let _loading = InFlightGuard::enter(&self.state);
        let generation = {
            let mut state = self.state.lock();
            state.generation += 1;
            state.generation
        };
        self.events.publish(SessionEvent::QueryStarted { generation });

        let request = GatewayRequest::post(["connections", connection_id, "query"]).with_body(
            json!({
                "query": query,
                "opts": options.unwrap_or_default(),
            }),
        );
        let outcome: Result<QueryResult, GatewayError> =
            request_data(self.gateway.as_ref(), request, "failed to execute query").await;

        let latest = {
            let mut state = self.state.lock();
            if state.generation == generation {
                if let Ok(result) = &outcome {
                    state.held = Some(HeldResult {
                        connection_id: connection_id.to_string(),
                        generation,
                        result: result.clone(),
                    });
                }
                None
            } else {
                Some(state.generation)
            }
        };

        if let Some(latest) = latest {
            warn!(generation, latest, "discarding superseded query response");
            self.events
                .publish(SessionEvent::QuerySuperseded { generation });
            return Err(QuerySessionError::Superseded { generation, latest });
        }

        match outcome {
            Ok(result) => {
                debug!(
                    generation,
                    rows = result.rows.len(),
                    total = result.total,
                    "query result held"
                );
                self.events
                    .publish(SessionEvent::QueryCompleted { generation });
                Ok(result)
            }
            Err(error) => {
                self.events.publish(SessionEvent::QueryFailed {
                    generation,
                    message: error.to_string(),
                });
                Err(error.into())
            }
        }
    }

    /// Runs a statement that only reports an affected-row count. The held
    /// result is never touched.
    pub async fn execute_non_query(
        &self,
        connection_id: &str,
        query: &str,
        database: Option<&str>,
    ) -> Result<ExecuteResult, QuerySessionError> {
        if query.trim().is_empty() {
            return Err(QuerySessionError::EmptyQuery);
        }

        let _loading = InFlightGuard::enter(&self.state);
        let request = GatewayRequest::post(["connections", connection_id, "execute"])
            .with_query("database", database)
            .with_body(json!({ "query": query }));
        let outcome: ExecuteResult =
            request_data(self.gateway.as_ref(), request, "failed to execute statement").await?;

        debug!(rows_affected = outcome.rows_affected, "statement executed");
        Ok(outcome)
    }

    pub fn clear_result(&self) {
        let cleared = self.state.lock().held.take().is_some();
        if cleared {
            self.events.publish(SessionEvent::ResultCleared);
        }
    }

    /// Any response still on its way will be discarded on arrival.
    pub fn abandon_in_flight(&self) {
        let mut state = self.state.lock();
        state.generation += 1;
        debug!(generation = state.generation, "abandoned in-flight queries");
    }

    /// Drops the held result if it came from this connection.
    pub fn forget_connection(&self, connection_id: &str) {
        let cleared = {
            let mut state = self.state.lock();
            let from_connection = state
                .held
                .as_ref()
                .is_some_and(|held| held.connection_id == connection_id);
            if from_connection {
                state.held = None;
            }
            from_connection
        };
        if cleared {
            self.events.publish(SessionEvent::ResultCleared);
        }
    }
}
