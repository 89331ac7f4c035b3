//! Best-effort broadcast of counter updates to registered observers.

use super::types::{BroadcastReport, CounterUpdate, UpdateEnvelope};
use crate::config::FanoutConfig;
use crate::error::DeliveryError;
use crate::registry::ConnectionRegistry;
use crate::types::{ConnectionId, Timestamp};
use crossbeam_channel::unbounded;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, error, info, warn};

/// Pushes a payload to one observer's channel.
///
/// [`Broadcaster::broadcast`] waits for every post before returning, and a
/// mutation response waits for its broadcast. An implementation must
/// therefore give up once `timeout` has passed and report
/// [`DeliveryError::Timeout`]; a post that blocks longer stalls the caller.
pub trait Delivery: Send + Sync {
    /// Deliver `payload`, returning no later than `timeout` from now.
    ///
    /// Must return [`DeliveryError::Gone`] when the observer's channel no
    /// longer exists, so the connection can be pruned.
    fn post(
        &self,
        connection_id: &ConnectionId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DeliveryError>;
}

/// Post-commit hook that fans an update out to every registered connection.
///
/// Broadcasting never fails: every error is logged and counted in the
/// returned [`BroadcastReport`].
pub struct Broadcaster {
    registry: Arc<ConnectionRegistry>,
    endpoint: Option<Arc<dyn Delivery>>,
    config: FanoutConfig,
}

impl Broadcaster {
    pub fn new(
        registry: Arc<ConnectionRegistry>,
        endpoint: Option<Arc<dyn Delivery>>,
        config: FanoutConfig,
    ) -> Self {
        Self {
            registry,
            endpoint,
            config,
        }
    }

    /// A broadcaster with no delivery endpoint; every broadcast is a no-op.
    pub fn disabled(registry: Arc<ConnectionRegistry>) -> Self {
        Self::new(registry, None, FanoutConfig::default())
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.endpoint.is_some()
    }

    pub fn registry(&self) -> &Arc<ConnectionRegistry> {
        &self.registry
    }

    /// Deliver `update` to every live connection concurrently.
    ///
    /// Returns once every delivery has resolved. Connections reported gone
    /// are removed from the registry; timeouts and other errors are logged
    /// and skipped.
    pub fn broadcast(&self, update: &CounterUpdate) -> BroadcastReport {
        let endpoint = match &self.endpoint {
            Some(endpoint) if self.config.enabled => &**endpoint,
            _ => {
                debug!("fanout endpoint not configured, skipping broadcast");
                return BroadcastReport::default();
            }
        };

        let envelope = UpdateEnvelope::new(update, Timestamp::now());
        let payload = match serde_json::to_vec(&envelope) {
            Ok(payload) => payload,
            Err(e) => {
                error!(error = %e, "failed to serialize counter update");
                return BroadcastReport::default();
            }
        };

        let connections = self.registry.scan();
        if connections.is_empty() {
            debug!("no active connections");
            return BroadcastReport::default();
        }

        let timeout = self.config.delivery_timeout();
        let workers = self.config.max_parallel.clamp(1, connections.len());

        let (job_tx, job_rx) = unbounded();
        for connection in &connections {
            let _ = job_tx.send(connection.id.clone());
        }
        drop(job_tx);

        let (result_tx, result_rx) = unbounded();
        std::thread::scope(|scope| {
            for _ in 0..workers {
                let job_rx = job_rx.clone();
                let result_tx = result_tx.clone();
                let payload = payload.as_slice();
                scope.spawn(move || {
                    for id in job_rx.iter() {
                        let started = Instant::now();
                        let result = catch_unwind(AssertUnwindSafe(|| {
                            endpoint.post(&id, payload, timeout)
                        }))
                        .unwrap_or_else(|_| Err(DeliveryError::Failed("delivery panicked".into())));

                        let elapsed = started.elapsed();
                        if elapsed > timeout.saturating_mul(2) {
                            warn!(
                                connection_id = %id,
                                elapsed_ms = elapsed.as_millis() as u64,
                                timeout_ms = timeout.as_millis() as u64,
                                "delivery endpoint overran its timeout"
                            );
                        }
                        let _ = result_tx.send((id, result));
                    }
                });
            }
        });
        drop(result_tx);

        let mut report = BroadcastReport {
            attempted: connections.len(),
            ..Default::default()
        };

        for (id, result) in result_rx.iter() {
            match result {
                Ok(()) => report.delivered += 1,
                Err(DeliveryError::Gone) => {
                    info!(connection_id = %id, "removing stale connection");
                    match self.registry.remove(&id) {
                        Ok(_) => report.pruned += 1,
                        // The registry keeps the entry when its snapshot cannot be written
                        Err(e) => {
                            warn!(connection_id = %id, error = %e, "failed to remove stale connection");
                            report.failed += 1;
                        }
                    }
                }
                Err(e) => {
                    warn!(connection_id = %id, error = %e, "error sending to connection");
                    report.failed += 1;
                }
            }
        }

        debug!(
            value = update.value,
            attempted = report.attempted,
            delivered = report.delivered,
            pruned = report.pruned,
            failed = report.failed,
            "broadcast complete"
        );
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Operation;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    /// Endpoint that fails for a fixed set of ids and records the rest.
    #[derive(Default)]
    struct ScriptedEndpoint {
        gone: HashSet<String>,
        broken: HashSet<String>,
        delivered: Mutex<Vec<(String, Vec<u8>)>>,
    }

    impl Delivery for ScriptedEndpoint {
        fn post(
            &self,
            connection_id: &ConnectionId,
            payload: &[u8],
            _timeout: Duration,
        ) -> Result<(), DeliveryError> {
            if self.gone.contains(connection_id.as_str()) {
                return Err(DeliveryError::Gone);
            }
            if self.broken.contains(connection_id.as_str()) {
                return Err(DeliveryError::Failed("boom".into()));
            }
            self.delivered
                .lock()
                .push((connection_id.to_string(), payload.to_vec()));
            Ok(())
        }
    }

    fn update() -> CounterUpdate {
        CounterUpdate {
            value: 3,
            operation: Operation::Increment,
            client_id: None,
        }
    }

    fn registry_with(ids: &[&str]) -> Arc<ConnectionRegistry> {
        let registry = Arc::new(ConnectionRegistry::in_memory(Duration::from_secs(3600)));
        for id in ids {
            registry.register(ConnectionId::new(*id)).unwrap();
        }
        registry
    }

    #[test]
    fn test_disabled_is_noop() {
        let registry = registry_with(&["a"]);
        let broadcaster = Broadcaster::disabled(Arc::clone(&registry));

        assert!(!broadcaster.is_enabled());
        assert_eq!(broadcaster.broadcast(&update()), BroadcastReport::default());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_gone_is_pruned_and_others_delivered() {
        let registry = registry_with(&["a", "stale", "b", "broken"]);
        let endpoint = Arc::new(ScriptedEndpoint {
            gone: ["stale".to_string()].into_iter().collect(),
            broken: ["broken".to_string()].into_iter().collect(),
            ..Default::default()
        });
        let broadcaster = Broadcaster::new(
            Arc::clone(&registry),
            Some(endpoint.clone() as Arc<dyn Delivery>),
            FanoutConfig::default(),
        );

        let report = broadcaster.broadcast(&update());
        assert_eq!(
            report,
            BroadcastReport {
                attempted: 4,
                delivered: 2,
                pruned: 1,
                failed: 1,
            }
        );

        assert!(registry.get(&ConnectionId::new("stale")).is_none());
        // Other errors do not prune
        assert!(registry.get(&ConnectionId::new("broken")).is_some());

        let delivered = endpoint.delivered.lock();
        let envelope: UpdateEnvelope = serde_json::from_slice(&delivered[0].1).unwrap();
        assert_eq!(envelope.kind, "counter-update");
        assert_eq!(envelope.value, 3);
    }

    #[test]
    fn test_panicking_endpoint_is_contained() {
        struct Panics;
        impl Delivery for Panics {
            fn post(&self, _: &ConnectionId, _: &[u8], _: Duration) -> Result<(), DeliveryError> {
                panic!("endpoint bug");
            }
        }

        let registry = registry_with(&["a"]);
        let broadcaster = Broadcaster::new(registry, Some(Arc::new(Panics)), FanoutConfig::default());
        let report = broadcaster.broadcast(&update());
        assert_eq!(report.failed, 1);
    }
}
