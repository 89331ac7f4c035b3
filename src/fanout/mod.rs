//! Real-time fanout of committed counter changes.
//!
//! After a mutation commits, the [`Broadcaster`] scans the
//! [`ConnectionRegistry`](crate::registry::ConnectionRegistry) and posts a
//! JSON [`UpdateEnvelope`] to every connection through a [`Delivery`]
//! endpoint. Delivery is best-effort:
//! - each observer is tried once, concurrently with the others
//! - an observer reported gone is pruned from the registry
//! - timeouts and other errors are logged and skipped
//!
//! [`LocalHub`] is an in-process endpoint backed by bounded channels.
//!
//! # Example
//!
//! ```ignore
//! let registry = Arc::new(ConnectionRegistry::in_memory(Duration::from_secs(3600)));
//! let hub = Arc::new(LocalHub::new());
//! let broadcaster = Broadcaster::new(registry.clone(), Some(hub.clone()), FanoutConfig::default());
//!
//! let handle = hub.open(ConnectionId::new("browser-1"));
//! registry.register(handle.id.clone())?;
//!
//! broadcaster.broadcast(&CounterUpdate { value: 1, operation: Operation::Increment, client_id: None });
//! let update = handle.recv_update_timeout(Duration::from_secs(1));
//! ```

mod broadcaster;
mod hub;
mod types;

pub use broadcaster::{Broadcaster, Delivery};
pub use hub::{LocalHub, ObserverHandle};
pub use types::{BroadcastReport, CounterUpdate, UpdateEnvelope, UPDATE_MESSAGE_TYPE};
