//! Counter and audit storage.
//!
//! A [`CounterStore`] holds the singleton [`Counter`] row and the append-only
//! audit ledger. Its only write path is [`CounterStore::commit_mutation`],
//! which applies two conditional operations as one all-or-nothing unit:
//!
//! - compare-and-swap of the counter on its `version`
//! - insert of the audit record, conditional on its `request_id` being new
//!
//! Two implementations are provided:
//! - [`MemoryStore`] keeps everything in process (tests, local development)
//! - [`LedgerStore`] persists every commit to a checksummed append-only file
//!   and replays it on open

mod ledger;
mod memory;
mod table;

use crate::error::{CommitError, Result};
use crate::types::{AuditRecord, Committed, Counter, RequestId};

pub use ledger::{LedgerEntry, LedgerStore};
pub use memory::MemoryStore;

/// Storage for the counter row and its audit ledger.
///
/// Every operation is bounded by the store's operation timeout and reports
/// [`StoreError::Timeout`](crate::error::StoreError::Timeout) when exceeded.
pub trait CounterStore: Send + Sync {
    /// Strongly consistent read. Creates `{value: 0, version: 1}` on first use.
    fn read_counter(&self) -> Result<Counter>;

    /// Commit a mutation read at `expected_version`.
    ///
    /// Sets `value = new_value, version = expected_version + 1` and inserts
    /// `audit` (stamped with the new version) only if the stored version still
    /// equals `expected_version` and no record carries `audit.request_id`.
    /// When both conditions fail, `DuplicateRequest` is reported.
    fn commit_mutation(
        &self,
        expected_version: u64,
        new_value: i64,
        audit: AuditRecord,
    ) -> std::result::Result<Committed, CommitError>;

    /// Look up the committed record for an idempotency token.
    fn find_audit(&self, request_id: &RequestId) -> Result<Option<AuditRecord>>;

    /// All audit records in commit order.
    fn audit_records(&self) -> Result<Vec<AuditRecord>>;

    fn audit_count(&self) -> Result<usize> {
        Ok(self.audit_records()?.len())
    }
}
