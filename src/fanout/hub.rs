//! In-process delivery endpoint.
//!
//! Each observer gets a bounded channel. A dropped [`ObserverHandle`] or an
//! explicit [`LocalHub::close`] makes later deliveries report the connection
//! gone; a full channel that stays full past the delivery timeout reports a
//! timeout and the observer keeps its registration.

use super::broadcaster::Delivery;
use super::types::UpdateEnvelope;
use crate::error::DeliveryError;
use crate::types::ConnectionId;
use crossbeam_channel::{
    bounded, Receiver, RecvError, RecvTimeoutError, SendTimeoutError, Sender, TryRecvError,
};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::Duration;

/// Default per-observer buffer (messages).
const DEFAULT_BUFFER_SIZE: usize = 64;

/// Channel-backed endpoint for observers living in this process.
pub struct LocalHub {
    channels: RwLock<HashMap<ConnectionId, Sender<Vec<u8>>>>,
    buffer_size: usize,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::with_buffer_size(DEFAULT_BUFFER_SIZE)
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    /// Open a channel for `id`, replacing any previous one.
    pub fn open(&self, id: ConnectionId) -> ObserverHandle {
        let (sender, receiver) = bounded(self.buffer_size);
        self.channels.write().insert(id.clone(), sender);
        ObserverHandle { id, receiver }
    }

    /// Close the channel for `id`. Returns false if it was not open.
    pub fn close(&self, id: &ConnectionId) -> bool {
        self.channels.write().remove(id).is_some()
    }

    /// Number of open channels.
    pub fn len(&self) -> usize {
        self.channels.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.channels.read().is_empty()
    }
}

impl Default for LocalHub {
    fn default() -> Self {
        Self::new()
    }
}

impl Delivery for LocalHub {
    fn post(
        &self,
        connection_id: &ConnectionId,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<(), DeliveryError> {
        let sender = self
            .channels
            .read()
            .get(connection_id)
            .cloned()
            .ok_or(DeliveryError::Gone)?;

        match sender.send_timeout(payload.to_vec(), timeout) {
            Ok(()) => Ok(()),
            Err(SendTimeoutError::Timeout(_)) => Err(DeliveryError::Timeout(timeout)),
            Err(SendTimeoutError::Disconnected(_)) => {
                self.channels.write().remove(connection_id);
                Err(DeliveryError::Gone)
            }
        }
    }
}

/// Receiving side of one observer's channel.
pub struct ObserverHandle {
    pub id: ConnectionId,
    receiver: Receiver<Vec<u8>>,
}

impl ObserverHandle {
    /// Receive the next raw message (blocking).
    pub fn recv(&self) -> Result<Vec<u8>, RecvError> {
        self.receiver.recv()
    }

    /// Try to receive a message (non-blocking).
    pub fn try_recv(&self) -> Result<Vec<u8>, TryRecvError> {
        self.receiver.try_recv()
    }

    /// Receive with timeout.
    pub fn recv_timeout(&self, timeout: Duration) -> Result<Vec<u8>, RecvTimeoutError> {
        self.receiver.recv_timeout(timeout)
    }

    /// Receive and decode the next update, or None on timeout or a bad message.
    pub fn recv_update_timeout(&self, timeout: Duration) -> Option<UpdateEnvelope> {
        let bytes = self.receiver.recv_timeout(timeout).ok()?;
        serde_json::from_slice(&bytes).ok()
    }
}
