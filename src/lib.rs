//! # Acidizer
//!
//! A single shared integer counter, mutated concurrently by many independent
//! clients, with three guarantees:
//!
//! - every accepted mutation is applied exactly once, even under concurrent
//!   retries and duplicate submissions
//! - the counter never leaves `0..=MAX_VALUE`
//! - every committed mutation is durably audited and pushed to live observers
//!
//! ## Core Concepts
//!
//! - **Counter store**: the counter row with a fencing `version`, plus an
//!   append-only audit ledger keyed by idempotency token. Written only by an
//!   all-or-nothing conditional commit.
//! - **Coordinator**: bounded optimistic retry loop (read, validate, commit,
//!   back off on conflict).
//! - **Registry**: subscribed observers with an expiry horizon.
//! - **Fanout**: best-effort, concurrent delivery of each committed value,
//!   pruning observers that are gone.
//!
//! ## Example
//!
//! ```ignore
//! use acidizer::{
//!     Broadcaster, ConnectionRegistry, CounterService, FanoutConfig, LedgerConfig, LedgerStore,
//!     LocalHub, ServiceConfig,
//! };
//! use std::sync::Arc;
//!
//! let config = ServiceConfig::default();
//! let store = Arc::new(LedgerStore::open_or_create(config.ledger.clone())?);
//! let registry = Arc::new(ConnectionRegistry::open(&config.registry)?);
//! let hub = Arc::new(LocalHub::new());
//! let broadcaster = Broadcaster::new(registry, Some(hub.clone()), config.fanout.clone());
//! let service = CounterService::new(store, broadcaster, config.coordinator.clone());
//!
//! let observer = service.connect_local(&hub)?;
//! let response = service.increment(None, Some("web-1"))?;
//! let update = observer.recv_update_timeout(std::time::Duration::from_secs(1));
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod fanout;
pub mod registry;
pub mod service;
pub mod store;
pub mod types;
pub mod validation;

// Re-exports
pub use config::{
    CoordinatorConfig, DuplicatePolicy, FanoutConfig, LedgerConfig, RegistryConfig, ServiceConfig,
};
pub use coordinator::{
    backoff, MutationCoordinator, MutationOutcome, MutationRequest, Sleeper, ThreadSleeper,
};
pub use error::{CommitError, ConflictKind, CounterError, DeliveryError, Result, StoreError};
pub use fanout::{
    BroadcastReport, Broadcaster, CounterUpdate, Delivery, LocalHub, ObserverHandle,
    UpdateEnvelope, UPDATE_MESSAGE_TYPE,
};
pub use registry::ConnectionRegistry;
pub use service::{CounterService, ErrorBody, MutationResponse};
pub use store::{CounterStore, LedgerEntry, LedgerStore, MemoryStore};
pub use types::*;
pub use validation::{sanitize_client_id, validate_request_id, MAX_CLIENT_ID_LEN};
