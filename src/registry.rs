//! Registry of subscribed observers.
//!
//! Entries carry an expiry horizon. Expired entries are reclaimed passively
//! on scan; entries whose delivery reports the observer gone are pruned by
//! the broadcaster. There is no heartbeat, so this is sized for a small
//! observer set (low thousands at most).
//!
//! With a configured path the whole set is rewritten to a checksummed
//! snapshot after every change and reloaded on open.

use crate::config::RegistryConfig;
use crate::error::{Result, StoreError};
use crate::types::{Connection, ConnectionId, Timestamp};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};

/// Magic bytes for registry snapshots.
const REGISTRY_MAGIC: &[u8; 4] = b"CON\0";

/// Current snapshot format version.
const REGISTRY_VERSION: u8 = 1;

/// Sanity bound on the encoded snapshot.
const MAX_SNAPSHOT_LEN: usize = 64 * 1024 * 1024;

/// Set of live connections keyed by id.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<ConnectionId, Connection>>,
    ttl: Duration,
    path: Option<PathBuf>,
}

impl ConnectionRegistry {
    /// A registry that lives only in memory.
    pub fn in_memory(ttl: Duration) -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            ttl,
            path: None,
        }
    }

    /// Open a registry, loading its snapshot when one exists.
    pub fn open(config: &RegistryConfig) -> Result<Self> {
        let connections = match &config.path {
            Some(path) if path.exists() => Self::load(path)?,
            _ => HashMap::new(),
        };

        Ok(Self {
            connections: RwLock::new(connections),
            ttl: config.ttl(),
            path: config.path.clone(),
        })
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Upsert a connection; re-registering resets its expiry.
    pub fn register(&self, id: ConnectionId) -> Result<Connection> {
        self.register_at(id, Timestamp::now())
    }

    pub fn register_at(&self, id: ConnectionId, now: Timestamp) -> Result<Connection> {
        let connection = Connection {
            id: id.clone(),
            registered_at: now,
            expires_at: now.add(self.ttl),
        };

        let mut connections = self.connections.write();
        let previous = connections.insert(id.clone(), connection.clone());
        if let Err(e) = self.persist(&connections) {
            // Keep memory in step with the snapshot on disk
            match previous {
                Some(previous) => connections.insert(id, previous),
                None => connections.remove(&id),
            };
            return Err(e);
        }

        debug!(connection_id = %connection.id, "registered connection");
        Ok(connection)
    }

    /// Delete a connection if present.
    ///
    /// If the snapshot cannot be written the connection stays registered.
    pub fn remove(&self, id: &ConnectionId) -> Result<bool> {
        let mut connections = self.connections.write();
        let removed = match connections.remove(id) {
            Some(removed) => removed,
            None => return Ok(false),
        };

        if let Err(e) = self.persist(&connections) {
            connections.insert(id.clone(), removed);
            return Err(e);
        }

        debug!(connection_id = %id, "removed connection");
        Ok(true)
    }

    pub fn get(&self, id: &ConnectionId) -> Option<Connection> {
        self.connections.read().get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.connections.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.read().is_empty()
    }

    /// Full scan of live connections, reclaiming expired ones first.
    pub fn scan(&self) -> Vec<Connection> {
        self.scan_at(Timestamp::now())
    }

    pub fn scan_at(&self, now: Timestamp) -> Vec<Connection> {
        self.purge_expired_at(now);
        let mut live: Vec<_> = self.connections.read().values().cloned().collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    /// Remove expired entries, returning how many were reclaimed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Timestamp::now())
    }

    pub fn purge_expired_at(&self, now: Timestamp) -> usize {
        let mut connections = self.connections.write();
        let before = connections.len();
        connections.retain(|_, c| !c.is_expired(now));
        let purged = before - connections.len();

        if purged > 0 {
            debug!(purged, "reclaimed expired connections");
            // A stale snapshot only holds expired entries, which the next scan drops again
            if let Err(e) = self.persist(&connections) {
                warn!(error = %e, "failed to persist registry after expiry");
            }
        }
        purged
    }

    fn persist(&self, connections: &HashMap<ConnectionId, Connection>) -> Result<()> {
        match &self.path {
            Some(path) => Self::save(path, connections),
            None => Ok(()),
        }
    }

    /// Write the snapshot to a temp file and rename it into place.
    fn save(path: &Path, connections: &HashMap<ConnectionId, Connection>) -> Result<()> {
        let mut entries: Vec<&Connection> = connections.values().collect();
        entries.sort_by(|a, b| a.id.cmp(&b.id));
        let encoded = rmp_serde::to_vec(&entries)?;
        if encoded.len() > MAX_SNAPSHOT_LEN {
            return Err(StoreError::Serialization("Registry snapshot too large".into()));
        }

        let tmp_path = path.with_extension("tmp");
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&tmp_path)?;

        file.write_all(REGISTRY_MAGIC)?;
        file.write_all(&[REGISTRY_VERSION])?;
        file.write_all(&(encoded.len() as u32).to_le_bytes())?;
        file.write_all(&encoded)?;
        file.write_all(&crc32fast::hash(&encoded).to_le_bytes())?;
        file.sync_all()?;

        fs::rename(&tmp_path, path)?;
        Ok(())
    }

    fn load(path: &Path) -> Result<HashMap<ConnectionId, Connection>> {
        let mut file = File::open(path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != REGISTRY_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid registry magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != REGISTRY_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported registry version: {}",
                version[0]
            )));
        }

        let mut len_bytes = [0u8; 4];
        file.read_exact(&mut len_bytes)?;
        let len = u32::from_le_bytes(len_bytes) as usize;
        if len > MAX_SNAPSHOT_LEN {
            return Err(StoreError::Corruption(format!(
                "Registry snapshot too large: {len} bytes"
            )));
        }

        let mut encoded = vec![0u8; len];
        file.read_exact(&mut encoded)?;

        let mut checksum_bytes = [0u8; 4];
        file.read_exact(&mut checksum_bytes)?;
        let stored = u32::from_le_bytes(checksum_bytes);
        let computed = crc32fast::hash(&encoded);
        if stored != computed {
            return Err(StoreError::ChecksumMismatch {
                expected: stored,
                got: computed,
            });
        }

        let entries: Vec<Connection> = rmp_serde::from_slice(&encoded)?;
        Ok(entries.into_iter().map(|c| (c.id.clone(), c)).collect())
    }
}
