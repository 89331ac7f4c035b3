//! In-process counter store.

use super::table::{lock_with_timeout, stamp, CounterTable};
use super::CounterStore;
use crate::error::{CommitError, Result};
use crate::types::{AuditRecord, Committed, Counter, RequestId, Timestamp};
use parking_lot::Mutex;
use std::time::Duration;

const DEFAULT_OP_TIMEOUT: Duration = Duration::from_secs(1);

/// Counter store kept entirely in memory. Nothing survives a restart.
pub struct MemoryStore {
    table: Mutex<CounterTable>,
    op_timeout: Duration,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_OP_TIMEOUT)
    }

    pub fn with_timeout(op_timeout: Duration) -> Self {
        Self {
            table: Mutex::new(CounterTable::new()),
            op_timeout,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl CounterStore for MemoryStore {
    fn read_counter(&self) -> Result<Counter> {
        let mut table = lock_with_timeout(&self.table, self.op_timeout)?;
        Ok(table.initialize(Timestamp::now()))
    }

    fn commit_mutation(
        &self,
        expected_version: u64,
        new_value: i64,
        audit: AuditRecord,
    ) -> std::result::Result<Committed, CommitError> {
        let mut table = lock_with_timeout(&self.table, self.op_timeout)?;
        let next = table.check(expected_version, new_value, &audit, Timestamp::now())?;
        let audit = stamp(audit, &next);
        Ok(table.apply(next, audit))
    }

    fn find_audit(&self, request_id: &RequestId) -> Result<Option<AuditRecord>> {
        let table = lock_with_timeout(&self.table, self.op_timeout)?;
        Ok(table.find(request_id).cloned())
    }

    fn audit_records(&self) -> Result<Vec<AuditRecord>> {
        let table = lock_with_timeout(&self.table, self.op_timeout)?;
        Ok(table.records().to_vec())
    }

    fn audit_count(&self) -> Result<usize> {
        let table = lock_with_timeout(&self.table, self.op_timeout)?;
        Ok(table.records().len())
    }
}
