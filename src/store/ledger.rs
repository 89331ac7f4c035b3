//! Durable counter store backed by an append-only ledger file.
//!
//! Layout of a store directory:
//!
//! ```text
//! MANIFEST         magic + format version
//! LOCK             exclusive process lock
//! counter.ledger   header, then frames of [u32 len][msgpack LedgerEntry][u32 crc32]
//! ```
//!
//! A commit is appended (and fsynced when `sync_writes` is set) before the
//! in-memory tables change, under the same lock as the conditional checks.
//! Opening the store replays the ledger to rebuild the counter row and the
//! audit index.
//!
//! `MANIFEST` is written last on creation and marks the store as usable. A
//! directory without it holds no acknowledged commits.

use super::table::{lock_with_timeout, stamp, CounterTable};
use super::CounterStore;
use crate::config::LedgerConfig;
use crate::error::{CommitError, Result, StoreError};
use crate::types::{AuditRecord, Committed, Counter, RequestId, Timestamp, INITIAL_VERSION};
use fs2::FileExt;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{BufReader, ErrorKind, Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, error, info, warn};

/// Magic bytes for store manifest.
const STORE_MAGIC: &[u8; 4] = b"CTR\0";

/// Current store format version.
const STORE_VERSION: u8 = 1;

/// Magic bytes for the ledger file.
const LEDGER_MAGIC: &[u8; 4] = b"LDG\0";

/// Current ledger format version.
const LEDGER_VERSION: u8 = 1;

const LEDGER_HEADER_LEN: u64 = 5;

/// Sanity bound on a single frame.
const MAX_FRAME_LEN: usize = 16 * 1024 * 1024;

const LEDGER_FILE: &str = "counter.ledger";

const MANIFEST_FILE: &str = "MANIFEST";

/// One durable ledger entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub enum LedgerEntry {
    /// The counter row was lazily created.
    Initialize { created_at: Timestamp },
    /// A committed mutation: the counter row after the commit and its audit record.
    Commit { counter: Counter, audit: AuditRecord },
}

struct Ledger {
    table: CounterTable,
    file: File,
    /// Length of the valid prefix of the ledger file.
    len: u64,
    sync_writes: bool,
    /// A partial frame could not be removed; the file is no longer appendable.
    failed: bool,
}

impl Ledger {
    fn append(&mut self, entry: &LedgerEntry) -> Result<()> {
        if self.failed {
            return Err(StoreError::Unavailable(
                "ledger holds an unremovable partial frame".into(),
            ));
        }

        let frame = encode_frame(entry)?;

        let written = self.file.write_all(&frame).and_then(|_| {
            if self.sync_writes {
                self.file.sync_data()
            } else {
                Ok(())
            }
        });

        if let Err(e) = written {
            // Drop any partial frame so the next append starts on a boundary
            if let Err(truncate_err) = self.file.set_len(self.len) {
                error!(
                    error = %truncate_err,
                    valid_len = self.len,
                    "failed to truncate partial ledger frame, refusing further writes"
                );
                self.failed = true;
            }
            return Err(e.into());
        }

        self.len += frame.len() as u64;
        Ok(())
    }
}

/// Counter store persisted to an append-only ledger.
pub struct LedgerStore {
    config: LedgerConfig,

    /// Lock file for exclusive access.
    _lock_file: File,

    inner: Mutex<Ledger>,
}

impl LedgerStore {
    /// Open an existing store or create a new one.
    pub fn open_or_create(config: LedgerConfig) -> Result<Self> {
        if config.path.join(MANIFEST_FILE).exists() {
            Self::open(config)
        } else if config.create_if_missing {
            Self::create(config)
        } else {
            Err(StoreError::NotInitialized)
        }
    }

    /// Create a new store. Fails if a store already exists at the path.
    ///
    /// Leftovers of an interrupted creation (no manifest yet) are overwritten.
    pub fn create(config: LedgerConfig) -> Result<Self> {
        fs::create_dir_all(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        if config.path.join(MANIFEST_FILE).exists() {
            return Err(StoreError::AlreadyExists);
        }

        let ledger_path = config.path.join(LEDGER_FILE);
        Self::write_ledger_header(&ledger_path)?;
        Self::write_manifest(&config.path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&ledger_path)?;

        info!(path = %config.path.display(), "created counter ledger");

        let ledger = Ledger {
            table: CounterTable::new(),
            file,
            len: LEDGER_HEADER_LEN,
            sync_writes: config.sync_writes,
            failed: false,
        };

        Ok(Self {
            config,
            _lock_file: lock_file,
            inner: Mutex::new(ledger),
        })
    }

    /// Open an existing store, replaying its ledger.
    pub fn open(config: LedgerConfig) -> Result<Self> {
        Self::verify_manifest(&config.path)?;
        let lock_file = Self::acquire_lock(&config.path)?;

        let ledger_path = config.path.join(LEDGER_FILE);
        Self::repair_header(&ledger_path)?;
        let (table, valid_len, file_len, frames) = Self::replay(&ledger_path)?;

        let file = OpenOptions::new()
            .read(true)
            .append(true)
            .open(&ledger_path)?;

        if valid_len < file_len {
            warn!(
                path = %ledger_path.display(),
                valid_len,
                file_len,
                "truncating torn ledger tail"
            );
            file.set_len(valid_len)?;
            file.sync_all()?;
        }

        info!(
            path = %config.path.display(),
            frames,
            audit_records = table.records().len(),
            version = table.counter().map(|c| c.version),
            "recovered counter ledger"
        );

        let ledger = Ledger {
            table,
            file,
            len: valid_len,
            sync_writes: config.sync_writes,
            failed: false,
        };

        Ok(Self {
            config,
            _lock_file: lock_file,
            inner: Mutex::new(ledger),
        })
    }

    pub fn path(&self) -> &Path {
        &self.config.path
    }

    /// Flush the ledger to disk.
    pub fn sync(&self) -> Result<()> {
        let ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        ledger.file.sync_all()?;
        Ok(())
    }

    /// Rebuild the tables from the ledger.
    ///
    /// Returns the tables, the length of the valid prefix, the file length
    /// and the number of frames replayed.
    fn replay(path: &Path) -> Result<(CounterTable, u64, u64, u64)> {
        let file = File::open(path)?;
        let file_len = file.metadata()?.len();
        let mut reader = BufReader::new(file);

        let mut magic = [0u8; 4];
        reader.read_exact(&mut magic)?;
        if &magic != LEDGER_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid ledger magic".into()));
        }

        let mut version = [0u8; 1];
        reader.read_exact(&mut version)?;
        if version[0] != LEDGER_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported ledger version: {}",
                version[0]
            )));
        }

        let mut table = CounterTable::new();
        let mut offset = LEDGER_HEADER_LEN;
        let mut frames = 0u64;

        while offset < file_len {
            match read_frame(&mut reader) {
                Ok((entry, frame_len)) => {
                    replay_entry(&mut table, entry)?;
                    offset += frame_len;
                    frames += 1;
                }
                // A crash mid-append leaves a short final frame
                Err(StoreError::Io(e)) if e.kind() == ErrorKind::UnexpectedEof => break,
                Err(e) => return Err(e),
            }
        }

        Ok((table, offset, file_len, frames))
    }

    /// Write an empty ledger holding only its header.
    fn write_ledger_header(ledger_path: &Path) -> Result<()> {
        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(ledger_path)?;
        file.write_all(LEDGER_MAGIC)?;
        file.write_all(&[LEDGER_VERSION])?;
        file.sync_all()?;
        Ok(())
    }

    /// Rewrite a missing or short ledger header.
    ///
    /// Frames are only appended after a complete header, so such a ledger
    /// never held a commit.
    fn repair_header(ledger_path: &Path) -> Result<()> {
        let len = match fs::metadata(ledger_path) {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };

        if len < LEDGER_HEADER_LEN {
            warn!(
                path = %ledger_path.display(),
                len,
                "ledger header incomplete, reinitializing"
            );
            Self::write_ledger_header(ledger_path)?;
        }
        Ok(())
    }

    /// Write the manifest through a temp file so it appears whole or not at all.
    fn write_manifest(path: &Path) -> Result<()> {
        let tmp_path = path.join("MANIFEST.tmp");
        let mut file = File::create(&tmp_path)?;

        file.write_all(STORE_MAGIC)?;
        file.write_all(&[STORE_VERSION])?;
        file.sync_all()?;

        fs::rename(&tmp_path, path.join(MANIFEST_FILE))?;
        Ok(())
    }

    fn verify_manifest(path: &Path) -> Result<()> {
        let manifest_path: PathBuf = path.join(MANIFEST_FILE);
        let mut file = File::open(manifest_path)?;

        let mut magic = [0u8; 4];
        file.read_exact(&mut magic)?;
        if &magic != STORE_MAGIC {
            return Err(StoreError::InvalidFormat("Invalid store magic".into()));
        }

        let mut version = [0u8; 1];
        file.read_exact(&mut version)?;
        if version[0] != STORE_VERSION {
            return Err(StoreError::InvalidFormat(format!(
                "Unsupported store version: {}",
                version[0]
            )));
        }

        Ok(())
    }

    fn acquire_lock(path: &Path) -> Result<File> {
        let lock_file = File::create(path.join("LOCK"))?;

        lock_file
            .try_lock_exclusive()
            .map_err(|_| StoreError::Locked)?;

        Ok(lock_file)
    }
}

impl CounterStore for LedgerStore {
    fn read_counter(&self) -> Result<Counter> {
        let mut ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        if let Some(counter) = ledger.table.counter() {
            return Ok(counter.clone());
        }

        let created_at = Timestamp::now();
        ledger.append(&LedgerEntry::Initialize { created_at })?;
        debug!("initialized counter row");
        Ok(ledger.table.initialize(created_at))
    }

    fn commit_mutation(
        &self,
        expected_version: u64,
        new_value: i64,
        audit: AuditRecord,
    ) -> std::result::Result<Committed, CommitError> {
        let mut ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        let next = ledger
            .table
            .check(expected_version, new_value, &audit, Timestamp::now())?;
        let audit = stamp(audit, &next);

        ledger.append(&LedgerEntry::Commit {
            counter: next.clone(),
            audit: audit.clone(),
        })?;

        Ok(ledger.table.apply(next, audit))
    }

    fn find_audit(&self, request_id: &RequestId) -> Result<Option<AuditRecord>> {
        let ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        Ok(ledger.table.find(request_id).cloned())
    }

    fn audit_records(&self) -> Result<Vec<AuditRecord>> {
        let ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        Ok(ledger.table.records().to_vec())
    }

    fn audit_count(&self) -> Result<usize> {
        let ledger = lock_with_timeout(&self.inner, self.config.op_timeout())?;
        Ok(ledger.table.records().len())
    }
}

impl Drop for LedgerStore {
    fn drop(&mut self) {
        // Best-effort sync on drop
        let _ = self.inner.get_mut().file.sync_all();
    }
}

fn encode_frame(entry: &LedgerEntry) -> Result<Vec<u8>> {
    let encoded = rmp_serde::to_vec(entry)?;
    if encoded.len() > MAX_FRAME_LEN {
        return Err(StoreError::Serialization("Ledger entry too large".into()));
    }

    let mut frame = Vec::with_capacity(encoded.len() + 8);
    frame.extend_from_slice(&(encoded.len() as u32).to_le_bytes());
    frame.extend_from_slice(&encoded);
    frame.extend_from_slice(&crc32fast::hash(&encoded).to_le_bytes());
    Ok(frame)
}

/// Read one frame, returning the entry and the frame's length on disk.
fn read_frame(reader: &mut impl Read) -> Result<(LedgerEntry, u64)> {
    let mut len_bytes = [0u8; 4];
    reader.read_exact(&mut len_bytes)?;
    let len = u32::from_le_bytes(len_bytes) as usize;

    if len > MAX_FRAME_LEN {
        return Err(StoreError::Corruption("Ledger frame too large".into()));
    }

    let mut encoded = vec![0u8; len];
    reader.read_exact(&mut encoded)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let stored = u32::from_le_bytes(checksum_bytes);

    let computed = crc32fast::hash(&encoded);
    if stored != computed {
        return Err(StoreError::ChecksumMismatch {
            expected: stored,
            got: computed,
        });
    }

    let entry = rmp_serde::from_slice(&encoded)?;
    Ok((entry, (len + 8) as u64))
}

fn replay_entry(table: &mut CounterTable, entry: LedgerEntry) -> Result<()> {
    match entry {
        LedgerEntry::Initialize { created_at } => {
            table.initialize(created_at);
        }
        LedgerEntry::Commit { counter, audit } => {
            let previous = table.counter().map(|c| c.version).unwrap_or(INITIAL_VERSION);
            if counter.version != previous + 1 {
                return Err(StoreError::Corruption(format!(
                    "Ledger version gap: {} follows {}",
                    counter.version, previous
                )));
            }
            if table.find(&audit.request_id).is_some() {
                return Err(StoreError::Corruption(format!(
                    "Duplicate request id in ledger: {}",
                    audit.request_id
                )));
            }
            table.apply(counter, audit);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{AuditId, Operation};
    use tempfile::TempDir;

    fn config(dir: &TempDir) -> LedgerConfig {
        LedgerConfig {
            path: dir.path().join("store"),
            ..Default::default()
        }
    }

    fn audit(request: &str) -> AuditRecord {
        AuditRecord {
            id: AuditId::generate(),
            request_id: RequestId::new(request),
            operation: Operation::Increment,
            delta: 1,
            old_value: 0,
            new_value: 0,
            version: 0,
            timestamp: Timestamp::now(),
            client_id: None,
        }
    }

    fn increment(store: &LedgerStore, request: &str) -> Committed {
        let counter = store.read_counter().unwrap();
        let mut record = audit(request);
        record.old_value = counter.value;
        store
            .commit_mutation(counter.version, counter.value + 1, record)
            .unwrap()
    }

    #[test]
    fn test_reopen_restores_counter_and_audit() {
        let dir = TempDir::new().unwrap();

        {
            let store = LedgerStore::open_or_create(config(&dir)).unwrap();
            increment(&store, "a");
            increment(&store, "b");
            let committed = increment(&store, "c");
            assert_eq!(committed.value, 3);
            assert_eq!(committed.version, 4);
        }

        let store = LedgerStore::open_or_create(config(&dir)).unwrap();
        let counter = store.read_counter().unwrap();
        assert_eq!(counter.value, 3);
        assert_eq!(counter.version, 4);
        assert_eq!(store.audit_count().unwrap(), 3);

        let record = store.find_audit(&RequestId::new("b")).unwrap().unwrap();
        assert_eq!(record.old_value, 1);
        assert_eq!(record.new_value, 2);
        assert_eq!(record.version, 3);

        // Uniqueness survives the restart
        let err = store
            .commit_mutation(4, 4, audit("a"))
            .unwrap_err();
        assert!(matches!(err, CommitError::DuplicateRequest(_)));
    }

    #[test]
    fn test_second_open_is_locked() {
        let dir = TempDir::new().unwrap();
        let _store = LedgerStore::open_or_create(config(&dir)).unwrap();

        let result = LedgerStore::open(config(&dir));
        assert!(matches!(result, Err(StoreError::Locked)));
    }

    #[test]
    fn test_missing_store_without_create() {
        let dir = TempDir::new().unwrap();
        let result = LedgerStore::open_or_create(LedgerConfig {
            create_if_missing: false,
            ..config(&dir)
        });
        assert!(matches!(result, Err(StoreError::NotInitialized)));
    }

    #[test]
    fn test_torn_tail_is_truncated() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("store").join(LEDGER_FILE);

        {
            let store = LedgerStore::create(config(&dir)).unwrap();
            increment(&store, "a");
        }

        // Simulate a crash halfway through writing the next frame
        let mut file = OpenOptions::new().append(true).open(&ledger_path).unwrap();
        file.write_all(&[42, 0, 0]).unwrap();
        drop(file);

        {
            let store = LedgerStore::open(config(&dir)).unwrap();
            assert_eq!(store.read_counter().unwrap().value, 1);
            increment(&store, "b");
        }

        let store = LedgerStore::open(config(&dir)).unwrap();
        assert_eq!(store.read_counter().unwrap().value, 2);
        assert_eq!(store.audit_count().unwrap(), 2);
    }

    #[test]
    fn test_checksum_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join("store").join(LEDGER_FILE);

        {
            let store = LedgerStore::create(config(&dir)).unwrap();
            increment(&store, "a");
        }

        let mut bytes = fs::read(&ledger_path).unwrap();
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        fs::write(&ledger_path, &bytes).unwrap();

        let result = LedgerStore::open(config(&dir));
        assert!(matches!(result, Err(StoreError::ChecksumMismatch { .. })));
    }

    #[test]
    fn test_initialization_is_persisted() {
        let dir = TempDir::new().unwrap();

        let created_at = {
            let store = LedgerStore::create(config(&dir)).unwrap();
            store.read_counter().unwrap().created_at
        };

        let store = LedgerStore::open(config(&dir)).unwrap();
        let counter = store.read_counter().unwrap();
        assert_eq!(counter.created_at, created_at);
        assert_eq!(counter.version, 1);
    }

    #[test]
    fn test_create_over_existing_store_fails() {
        let dir = TempDir::new().unwrap();
        drop(LedgerStore::create(config(&dir)).unwrap());

        let result = LedgerStore::create(config(&dir));
        assert!(matches!(result, Err(StoreError::AlreadyExists)));
    }

    #[test]
    fn test_interrupted_create_is_retried() {
        let dir = TempDir::new().unwrap();
        let store_path = dir.path().join("store");

        // Crash after a partial ledger header, before the manifest
        fs::create_dir_all(&store_path).unwrap();
        fs::write(store_path.join(LEDGER_FILE), b"LD").unwrap();

        {
            let store = LedgerStore::open_or_create(config(&dir)).unwrap();
            increment(&store, "a");
        }

        let store = LedgerStore::open_or_create(config(&dir)).unwrap();
        assert_eq!(store.read_counter().unwrap().value, 1);
    }

    #[test]
    fn test_manifest_without_complete_ledger_opens_empty() {
        for ledger in [None, Some(&b""[..]), Some(&b"LDG"[..])] {
            let dir = TempDir::new().unwrap();
            let store_path = dir.path().join("store");
            fs::create_dir_all(&store_path).unwrap();
            LedgerStore::write_manifest(&store_path).unwrap();
            if let Some(bytes) = ledger {
                fs::write(store_path.join(LEDGER_FILE), bytes).unwrap();
            }

            {
                let store = LedgerStore::open_or_create(config(&dir)).unwrap();
                assert_eq!(store.read_counter().unwrap().value, 0);
                increment(&store, "a");
            }

            let store = LedgerStore::open(config(&dir)).unwrap();
            assert_eq!(store.read_counter().unwrap().value, 1);
            assert_eq!(store.audit_count().unwrap(), 1);
        }
    }

    #[test]
    fn test_failed_truncate_refuses_further_appends() {
        let dir = TempDir::new().unwrap();
        let ledger_path = dir.path().join(LEDGER_FILE);
        LedgerStore::write_ledger_header(&ledger_path).unwrap();

        // A read-only handle fails both the write and the truncate
        let mut ledger = Ledger {
            table: CounterTable::new(),
            file: File::open(&ledger_path).unwrap(),
            len: LEDGER_HEADER_LEN,
            sync_writes: true,
            failed: false,
        };
        let entry = LedgerEntry::Initialize {
            created_at: Timestamp::now(),
        };

        assert!(matches!(ledger.append(&entry), Err(StoreError::Io(_))));
        assert!(ledger.failed);
        assert!(matches!(
            ledger.append(&entry),
            Err(StoreError::Unavailable(_))
        ));
    }

    #[test]
    fn test_failed_ledger_rejects_commits() {
        let dir = TempDir::new().unwrap();
        let store = LedgerStore::create(config(&dir)).unwrap();
        increment(&store, "a");

        store.inner.lock().failed = true;

        let counter = store.read_counter().unwrap();
        let result = store.commit_mutation(counter.version, 2, audit("b"));
        assert!(matches!(
            result,
            Err(CommitError::Store(StoreError::Unavailable(_)))
        ));
        // Nothing was applied in memory either
        assert_eq!(store.read_counter().unwrap(), counter);
        assert!(store.find_audit(&RequestId::new("b")).unwrap().is_none());
    }
}
