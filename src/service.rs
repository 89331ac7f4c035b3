//! Routing-facing facade over the coordinator, registry and broadcaster.
//!
//! A mutation is validated at the boundary, committed by the
//! [`MutationCoordinator`], and then announced through the [`Broadcaster`]
//! as a post-commit hook. The broadcast outcome never changes the response.

use crate::config::CoordinatorConfig;
use crate::coordinator::{MutationCoordinator, MutationRequest, Sleeper};
use crate::error::{CounterError, Result};
use crate::fanout::{Broadcaster, CounterUpdate, LocalHub, ObserverHandle};
use crate::registry::ConnectionRegistry;
use crate::store::CounterStore;
use crate::types::{Connection, ConnectionId, Counter, Operation, RequestId};
use crate::validation::{sanitize_client_id, validate_request_id};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Successful mutation response.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MutationResponse {
    pub value: i64,
    pub version: u64,
    pub request_id: RequestId,
    /// The token had already been committed; nothing changed.
    pub replayed: bool,
}

/// Failure body for the transport layer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub success: bool,
    pub error: &'static str,
    pub message: String,
}

impl From<&CounterError> for ErrorBody {
    fn from(err: &CounterError) -> Self {
        Self {
            success: false,
            error: err.code(),
            message: err.to_string(),
        }
    }
}

/// Counter operations exposed to request routing and subscription glue.
pub struct CounterService {
    coordinator: MutationCoordinator<dyn CounterStore>,
    registry: Arc<ConnectionRegistry>,
    broadcaster: Broadcaster,
}

impl CounterService {
    pub fn new(
        store: Arc<dyn CounterStore>,
        broadcaster: Broadcaster,
        config: CoordinatorConfig,
    ) -> Self {
        Self::from_coordinator(MutationCoordinator::new(store, config), broadcaster)
    }

    pub fn with_sleeper(
        store: Arc<dyn CounterStore>,
        broadcaster: Broadcaster,
        config: CoordinatorConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self::from_coordinator(
            MutationCoordinator::with_sleeper(store, config, sleeper),
            broadcaster,
        )
    }

    fn from_coordinator(
        coordinator: MutationCoordinator<dyn CounterStore>,
        broadcaster: Broadcaster,
    ) -> Self {
        Self {
            coordinator,
            registry: Arc::clone(broadcaster.registry()),
            broadcaster,
        }
    }

    pub fn coordinator(&self) -> &MutationCoordinator<dyn CounterStore> {
        &self.coordinator
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    pub fn increment(
        &self,
        request_id: Option<&str>,
        client_id: Option<&str>,
    ) -> std::result::Result<MutationResponse, CounterError> {
        self.mutate(Operation::Increment, request_id, client_id)
    }

    pub fn decrement(
        &self,
        request_id: Option<&str>,
        client_id: Option<&str>,
    ) -> std::result::Result<MutationResponse, CounterError> {
        self.mutate(Operation::Decrement, request_id, client_id)
    }

    /// Validate, commit, then broadcast.
    pub fn mutate(
        &self,
        operation: Operation,
        request_id: Option<&str>,
        client_id: Option<&str>,
    ) -> std::result::Result<MutationResponse, CounterError> {
        let request_id = validate_request_id(request_id)?;
        let client_id = sanitize_client_id(client_id);

        let request =
            MutationRequest::new(operation, request_id.clone()).with_client(client_id.clone());
        let outcome = self.coordinator.apply_request(&request)?;

        info!(
            request_id = %request_id,
            client_id = %client_id,
            operation = %operation,
            value = outcome.value,
            replayed = outcome.replayed,
            "counter mutation applied"
        );

        // A replay changed nothing, so observers already have this value
        if !outcome.replayed {
            self.broadcaster.broadcast(&CounterUpdate {
                value: outcome.value,
                operation,
                client_id: Some(client_id),
            });
        }

        Ok(MutationResponse {
            value: outcome.value,
            version: outcome.version,
            request_id,
            replayed: outcome.replayed,
        })
    }

    /// Current counter row.
    pub fn value(&self) -> std::result::Result<Counter, CounterError> {
        self.coordinator
            .store()
            .read_counter()
            .map_err(CounterError::StoreUnavailable)
    }

    /// Register a subscribed observer.
    pub fn connect(&self, id: ConnectionId) -> Result<Connection> {
        self.registry.register(id)
    }

    /// Forget an observer. Safe to call for unknown ids.
    pub fn disconnect(&self, id: &ConnectionId) -> Result<bool> {
        self.registry.remove(id)
    }

    /// Open an in-process observer on `hub` under a fresh id and register it.
    pub fn connect_local(&self, hub: &LocalHub) -> Result<ObserverHandle> {
        let handle = hub.open(ConnectionId::generate());
        if let Err(e) = self.registry.register(handle.id.clone()) {
            warn!(connection_id = %handle.id, error = %e, "failed to register local observer");
            hub.close(&handle.id);
            return Err(e);
        }
        Ok(handle)
    }

    /// Close an in-process observer and forget its registration.
    pub fn disconnect_local(&self, hub: &LocalHub, id: &ConnectionId) -> Result<bool> {
        hub.close(id);
        self.registry.remove(id)
    }
}
