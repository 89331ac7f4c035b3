//! Fanout tests: committed values reaching observers through the service.

use acidizer::{
    Broadcaster, ConnectionId, ConnectionRegistry, CoordinatorConfig, CounterService,
    CounterStore, CounterUpdate, Delivery, DeliveryError, FanoutConfig, LocalHub, MemoryStore,
    Operation, RegistryConfig, Timestamp, UPDATE_MESSAGE_TYPE,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;

const RECV: Duration = Duration::from_secs(2);

struct Harness {
    service: CounterService,
    hub: Arc<LocalHub>,
    registry: Arc<ConnectionRegistry>,
}

fn harness_with(hub: LocalHub, ttl: Duration, fanout: FanoutConfig) -> Harness {
    let hub = Arc::new(hub);
    let registry = Arc::new(ConnectionRegistry::in_memory(ttl));
    let endpoint: Arc<dyn Delivery> = hub.clone();
    let broadcaster = Broadcaster::new(registry.clone(), Some(endpoint), fanout);
    let service = CounterService::new(
        Arc::new(MemoryStore::new()),
        broadcaster,
        CoordinatorConfig::default(),
    );
    Harness {
        service,
        hub,
        registry,
    }
}

fn harness() -> Harness {
    harness_with(
        LocalHub::new(),
        Duration::from_secs(3600),
        FanoutConfig {
            delivery_timeout_ms: 50,
            ..Default::default()
        },
    )
}

#[test]
fn test_observers_receive_committed_value() {
    let h = harness();
    let a = h.service.connect_local(&h.hub).unwrap();
    let b = h.service.connect_local(&h.hub).unwrap();

    h.service.increment(None, Some("web-1")).unwrap();

    for observer in [&a, &b] {
        let update = observer.recv_update_timeout(RECV).unwrap();
        assert_eq!(update.kind, UPDATE_MESSAGE_TYPE);
        assert_eq!(update.value, 1);
        assert_eq!(update.operation, Operation::Increment);
        assert_eq!(update.client_id.unwrap().as_str(), "web-1");
    }
}

#[test]
fn test_wire_format() {
    let h = harness();
    let observer = h.service.connect_local(&h.hub).unwrap();

    let before = Timestamp::now();
    h.service.increment(None, None).unwrap();
    h.service.decrement(None, None).unwrap();

    let raw = observer.recv_timeout(RECV).unwrap();
    let json: serde_json::Value = serde_json::from_slice(&raw).unwrap();
    assert_eq!(json["type"], "counter-update");
    assert_eq!(json["value"], 1);
    assert_eq!(json["operation"], "increment");
    assert_eq!(json["clientId"], "anonymous");

    let sent = OffsetDateTime::parse(json["timestamp"].as_str().unwrap(), &Rfc3339).unwrap();
    assert!(Timestamp::from_datetime(sent) >= before);

    let update = observer.recv_update_timeout(RECV).unwrap();
    assert_eq!(update.value, 0);
    assert_eq!(update.operation, Operation::Decrement);
}

#[test]
fn test_stale_observer_pruned_others_still_receive() {
    let h = harness();
    let live = h.service.connect_local(&h.hub).unwrap();
    let stale = h.service.connect_local(&h.hub).unwrap();
    let stale_id = stale.id.clone();
    drop(stale);

    assert_eq!(h.registry.len(), 2);
    let response = h.service.increment(None, None).unwrap();

    // The mutation is unaffected by the failed delivery
    assert_eq!(response.value, 1);
    assert_eq!(live.recv_update_timeout(RECV).unwrap().value, 1);
    assert!(h.registry.get(&stale_id).is_none());
    assert_eq!(h.registry.len(), 1);
}

#[test]
fn test_unknown_registration_is_pruned() {
    let h = harness();
    // Registered but never opened on the hub
    let orphan = ConnectionId::new("orphan");
    h.service.connect(orphan.clone()).unwrap();

    h.service.increment(None, None).unwrap();
    assert!(h.registry.get(&orphan).is_none());
}

#[test]
fn test_slow_observer_times_out_but_stays_registered() {
    let h = harness_with(
        LocalHub::with_buffer_size(1),
        Duration::from_secs(3600),
        FanoutConfig {
            delivery_timeout_ms: 20,
            ..Default::default()
        },
    );
    let slow = h.service.connect_local(&h.hub).unwrap();
    let fast = h.service.connect_local(&h.hub).unwrap();

    h.service.increment(None, None).unwrap();
    assert_eq!(fast.recv_update_timeout(RECV).unwrap().value, 1);

    // `slow` never drains, so its second delivery times out
    let response = h.service.increment(None, None).unwrap();
    assert_eq!(response.value, 2);
    assert_eq!(fast.recv_update_timeout(RECV).unwrap().value, 2);

    assert!(h.registry.get(&slow.id).is_some());
    assert_eq!(slow.recv_update_timeout(RECV).unwrap().value, 1);
    assert!(slow.try_recv().is_err());
}

#[test]
fn test_expired_registration_not_delivered() {
    let h = harness_with(LocalHub::new(), Duration::ZERO, FanoutConfig::default());
    let observer = h.service.connect_local(&h.hub).unwrap();

    h.service.increment(None, None).unwrap();

    assert!(observer.try_recv().is_err());
    assert!(h.registry.is_empty());
}

#[test]
fn test_disabled_fanout_is_noop() {
    let h = harness_with(
        LocalHub::new(),
        Duration::from_secs(3600),
        FanoutConfig {
            enabled: false,
            ..Default::default()
        },
    );
    let observer = h.service.connect_local(&h.hub).unwrap();

    let response = h.service.increment(None, None).unwrap();
    assert_eq!(response.value, 1);
    assert!(observer.try_recv().is_err());
    assert_eq!(h.registry.len(), 1);
}

#[test]
fn test_replayed_request_not_rebroadcast() {
    let h = harness();
    let observer = h.service.connect_local(&h.hub).unwrap();
    let token = "3f2b8c1e-7d4a-4e9b-a1c2-0d9e8f7a6b5c";

    let first = h.service.increment(Some(token), None).unwrap();
    let again = h.service.increment(Some(token), None).unwrap();

    assert!(!first.replayed);
    assert!(again.replayed);
    assert_eq!(again.value, first.value);

    assert_eq!(observer.recv_update_timeout(RECV).unwrap().value, 1);
    assert!(observer.try_recv().is_err());
}

#[test]
fn test_failed_mutation_not_broadcast() {
    let h = harness();
    let observer = h.service.connect_local(&h.hub).unwrap();

    assert!(h.service.decrement(None, None).is_err());
    assert!(observer.try_recv().is_err());
}

#[test]
fn test_disconnect_stops_delivery() {
    let h = harness();
    let a = h.service.connect_local(&h.hub).unwrap();
    let b = h.service.connect_local(&h.hub).unwrap();

    assert!(h.service.disconnect_local(&h.hub, &a.id).unwrap());
    assert!(!h.service.disconnect_local(&h.hub, &a.id).unwrap());

    h.service.increment(None, None).unwrap();
    assert_eq!(b.recv_update_timeout(RECV).unwrap().value, 1);
    assert!(a.try_recv().is_err());
    assert_eq!(h.hub.len(), 1);
}

#[test]
fn test_concurrent_mutations_all_announced() {
    let h = Arc::new(harness());
    let observer = h.service.connect_local(&h.hub).unwrap();

    let handles: Vec<_> = (0..8)
        .map(|_| {
            let h = Arc::clone(&h);
            thread::spawn(move || {
                let mut ok = 0;
                for _ in 0..4 {
                    if h.service.increment(None, None).is_ok() {
                        ok += 1;
                    }
                }
                ok
            })
        })
        .collect();
    let committed: usize = handles.into_iter().map(|t| t.join().unwrap()).sum();

    let mut values = Vec::new();
    while let Some(update) = observer.recv_update_timeout(Duration::from_millis(200)) {
        values.push(update.value);
    }
    values.sort_unstable();

    // One message per commit, each carrying a distinct committed value
    assert_eq!(values.len(), committed);
    values.dedup();
    assert_eq!(values.len(), committed);
    assert_eq!(
        h.service.coordinator().store().read_counter().unwrap().value,
        committed as i64
    );
}

/// Endpoint that records payloads per id and fails every post to one id.
struct FlakyEndpoint {
    broken: ConnectionId,
    seen: Mutex<Vec<ConnectionId>>,
}

impl Delivery for FlakyEndpoint {
    fn post(
        &self,
        connection_id: &ConnectionId,
        _payload: &[u8],
        _timeout: Duration,
    ) -> Result<(), DeliveryError> {
        if *connection_id == self.broken {
            return Err(DeliveryError::Failed("socket closed by peer".into()));
        }
        self.seen.lock().push(connection_id.clone());
        Ok(())
    }
}

#[test]
fn test_other_delivery_errors_are_skipped() {
    let registry = Arc::new(ConnectionRegistry::in_memory(Duration::from_secs(60)));
    let endpoint = Arc::new(FlakyEndpoint {
        broken: ConnectionId::new("b"),
        seen: Mutex::new(Vec::new()),
    });
    let broadcaster = Broadcaster::new(
        registry.clone(),
        Some(endpoint.clone() as Arc<dyn Delivery>),
        FanoutConfig {
            max_parallel: 2,
            ..Default::default()
        },
    );

    for id in ["a", "b", "c"] {
        registry.register(ConnectionId::new(id)).unwrap();
    }

    let report = broadcaster.broadcast(&CounterUpdate {
        value: 5,
        operation: Operation::Increment,
        client_id: None,
    });

    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 2);
    assert_eq!(report.failed, 1);
    assert_eq!(report.pruned, 0);
    assert_eq!(registry.len(), 3);

    let mut seen: Vec<_> = endpoint.seen.lock().iter().map(|id| id.to_string()).collect();
    seen.sort();
    assert_eq!(seen, vec!["a", "c"]);
}

#[test]
fn test_failed_prune_keeps_connection() {
    let dir = TempDir::new().unwrap();
    let snapshot_dir = dir.path().join("registry");
    std::fs::create_dir_all(&snapshot_dir).unwrap();
    let registry = Arc::new(
        ConnectionRegistry::open(&RegistryConfig {
            path: Some(snapshot_dir.join("connections.bin")),
            ..Default::default()
        })
        .unwrap(),
    );

    // Never opened on the hub, so every delivery reports it gone
    let orphan = ConnectionId::new("orphan");
    registry.register(orphan.clone()).unwrap();
    std::fs::remove_dir_all(&snapshot_dir).unwrap();

    let hub: Arc<dyn Delivery> = Arc::new(LocalHub::new());
    let broadcaster = Broadcaster::new(registry.clone(), Some(hub), FanoutConfig::default());
    let report = broadcaster.broadcast(&CounterUpdate {
        value: 1,
        operation: Operation::Increment,
        client_id: None,
    });

    assert_eq!(report.attempted, 1);
    assert_eq!(report.pruned, 0);
    assert_eq!(report.failed, 1);
    assert!(registry.get(&orphan).is_some());
}

#[test]
fn test_stuck_observers_do_not_stall_mutations() {
    let h = harness_with(
        LocalHub::with_buffer_size(1),
        Duration::from_secs(3600),
        FanoutConfig {
            delivery_timeout_ms: 50,
            max_parallel: 2,
            ..Default::default()
        },
    );
    let stuck: Vec<_> = (0..4)
        .map(|_| h.service.connect_local(&h.hub).unwrap())
        .collect();

    // Fill every buffer
    h.service.increment(None, None).unwrap();

    let started = Instant::now();
    let response = h.service.increment(None, None).unwrap();
    let elapsed = started.elapsed();

    assert_eq!(response.value, 2);
    // Two rounds of timed-out posts on two workers, plus slack
    assert!(elapsed < Duration::from_secs(2), "mutation waited {elapsed:?}");
    assert_eq!(h.registry.len(), stuck.len());
}
