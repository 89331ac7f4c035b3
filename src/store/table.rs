//! In-memory tables shared by the store implementations.

use crate::error::{CommitError, Result, StoreError};
use crate::types::{
    AuditRecord, Committed, Counter, RequestId, Timestamp, INITIAL_VERSION,
};
use parking_lot::{Mutex, MutexGuard};
use std::collections::HashMap;
use std::time::Duration;

/// Counter row plus audit records indexed by request id.
#[derive(Default)]
pub(crate) struct CounterTable {
    counter: Option<Counter>,
    audits: Vec<AuditRecord>,
    by_request: HashMap<RequestId, usize>,
}

impl CounterTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn counter(&self) -> Option<&Counter> {
        self.counter.as_ref()
    }

    /// Install the initial row. No-op if one exists.
    pub fn initialize(&mut self, created_at: Timestamp) -> Counter {
        self.counter
            .get_or_insert_with(|| Counter::initial(created_at))
            .clone()
    }

    /// Evaluate both commit conditions without applying anything.
    ///
    /// Returns the counter row as it will be after the commit.
    pub fn check(
        &self,
        expected_version: u64,
        new_value: i64,
        audit: &AuditRecord,
        now: Timestamp,
    ) -> std::result::Result<Counter, CommitError> {
        if self.by_request.contains_key(&audit.request_id) {
            return Err(CommitError::DuplicateRequest(audit.request_id.clone()));
        }

        let found = self
            .counter
            .as_ref()
            .map(|c| c.version)
            .unwrap_or(INITIAL_VERSION);
        if found != expected_version {
            return Err(CommitError::VersionConflict {
                expected: expected_version,
                found,
            });
        }

        Ok(Counter {
            value: new_value,
            version: expected_version + 1,
            last_updated: Some(now),
            created_at: self.counter.as_ref().map(|c| c.created_at).unwrap_or(now),
        })
    }

    /// Apply a checked commit (or replay one from the ledger).
    pub fn apply(&mut self, counter: Counter, audit: AuditRecord) -> Committed {
        let committed = Committed {
            value: counter.value,
            version: counter.version,
            last_updated: counter.last_updated.unwrap_or(counter.created_at),
        };
        self.by_request
            .insert(audit.request_id.clone(), self.audits.len());
        self.audits.push(audit);
        self.counter = Some(counter);
        committed
    }

    pub fn find(&self, request_id: &RequestId) -> Option<&AuditRecord> {
        self.by_request.get(request_id).map(|&i| &self.audits[i])
    }

    pub fn records(&self) -> &[AuditRecord] {
        &self.audits
    }
}

/// Stamp the audit record with the version the commit will write.
pub(crate) fn stamp(mut audit: AuditRecord, next: &Counter) -> AuditRecord {
    audit.version = next.version;
    audit.new_value = next.value;
    audit
}

/// Acquire a table lock, giving up after `timeout`.
pub(crate) fn lock_with_timeout<T>(mutex: &Mutex<T>, timeout: Duration) -> Result<MutexGuard<'_, T>> {
    mutex
        .try_lock_for(timeout)
        .ok_or(StoreError::Timeout(timeout))
}
