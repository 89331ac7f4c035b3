//! Mutation coordinator: bounded optimistic-concurrency loop over a
//! [`CounterStore`].
//!
//! Each attempt reads the counter, validates the new value against the
//! bounds, and commits the counter CAS together with the audit insert. No
//! in-process lock is taken here; concurrent coordinators, possibly in other
//! processes, serialize only through the store's conditional write.

use crate::config::{CoordinatorConfig, DuplicatePolicy};
use crate::error::{CommitError, ConflictKind, CounterError};
use crate::store::CounterStore;
use crate::types::{
    AuditId, AuditRecord, ClientId, Operation, RequestId, Timestamp, MIN_VALUE,
};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Suspends the calling thread between attempts.
pub trait Sleeper: Send + Sync {
    fn sleep(&self, duration: Duration);
}

/// Sleeps on the current thread.
#[derive(Clone, Copy, Debug, Default)]
pub struct ThreadSleeper;

impl Sleeper for ThreadSleeper {
    fn sleep(&self, duration: Duration) {
        std::thread::sleep(duration);
    }
}

/// Backoff before retrying after failed attempt `attempt` (1-based):
/// `base * 2^attempt`.
pub fn backoff(base: Duration, attempt: u32) -> Duration {
    let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
    base.saturating_mul(factor)
}

/// A mutation as handed over by the routing layer.
#[derive(Clone, Debug)]
pub struct MutationRequest {
    pub operation: Operation,
    pub request_id: RequestId,
    pub client_id: Option<ClientId>,
}

impl MutationRequest {
    pub fn new(operation: Operation, request_id: RequestId) -> Self {
        Self {
            operation,
            request_id,
            client_id: None,
        }
    }

    pub fn with_client(mut self, client_id: ClientId) -> Self {
        self.client_id = Some(client_id);
        self
    }
}

/// Result of a successful [`MutationCoordinator::apply_request`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MutationOutcome {
    pub value: i64,
    pub version: u64,
    pub operation: Operation,
    /// True when the token had already been committed and this is its
    /// recorded result rather than a new mutation.
    pub replayed: bool,
    pub attempts: u32,
}

enum Attempt {
    Done(MutationOutcome),
    Conflict(ConflictKind),
}

/// Applies increments and decrements with bounded optimistic retries.
pub struct MutationCoordinator<S: CounterStore + ?Sized> {
    store: Arc<S>,
    config: CoordinatorConfig,
    sleeper: Arc<dyn Sleeper>,
}

impl<S: CounterStore + ?Sized> MutationCoordinator<S> {
    pub fn new(store: Arc<S>, config: CoordinatorConfig) -> Self {
        Self::with_sleeper(store, config, Arc::new(ThreadSleeper))
    }

    pub fn with_sleeper(
        store: Arc<S>,
        config: CoordinatorConfig,
        sleeper: Arc<dyn Sleeper>,
    ) -> Self {
        Self {
            store,
            config,
            sleeper,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn config(&self) -> &CoordinatorConfig {
        &self.config
    }

    /// Apply `delta` (+1 or -1) under `request_id`, returning the new value.
    pub fn apply(&self, delta: i64, request_id: &RequestId) -> Result<i64, CounterError> {
        let operation = Operation::from_delta(delta).ok_or(CounterError::InvalidDelta(delta))?;
        let request = MutationRequest::new(operation, request_id.clone());
        self.apply_request(&request).map(|outcome| outcome.value)
    }

    /// Run the retry loop for one mutation.
    pub fn apply_request(&self, request: &MutationRequest) -> Result<MutationOutcome, CounterError> {
        let max_attempts = self.config.max_retries.max(1);
        let mut last_conflict = ConflictKind::VersionConflict;

        for attempt in 1..=max_attempts {
            match self.attempt(request, attempt)? {
                Attempt::Done(outcome) => return Ok(outcome),
                Attempt::Conflict(kind) => {
                    last_conflict = kind;
                    if attempt < max_attempts {
                        let delay = backoff(self.config.backoff_base(), attempt);
                        debug!(
                            request_id = %request.request_id,
                            attempt,
                            conflict = %kind,
                            delay_ms = delay.as_millis() as u64,
                            "counter update conflicted, backing off"
                        );
                        self.sleeper.sleep(delay);
                    }
                }
            }
        }

        warn!(
            request_id = %request.request_id,
            attempts = max_attempts,
            last_conflict = %last_conflict,
            "counter update gave up"
        );
        Err(CounterError::RetriesExhausted {
            attempts: max_attempts,
            last_conflict,
        })
    }

    fn attempt(&self, request: &MutationRequest, attempt: u32) -> Result<Attempt, CounterError> {
        let current = match self.store.read_counter() {
            Ok(counter) => counter,
            Err(e) if e.is_timeout() => return Ok(Attempt::Conflict(ConflictKind::Timeout)),
            Err(e) => return Err(CounterError::StoreUnavailable(e)),
        };

        let delta = request.operation.delta();
        let new_value = current.value + delta;
        if new_value < MIN_VALUE || new_value > self.config.max_value {
            // A retried token whose mutation already landed may now sit at a bound
            if let Some(outcome) = self.recorded_outcome(request, attempt)? {
                return Ok(Attempt::Done(outcome));
            }
            return Err(CounterError::OutOfBounds {
                attempted: new_value,
                max: self.config.max_value,
            });
        }

        let audit = AuditRecord {
            id: AuditId::generate(),
            request_id: request.request_id.clone(),
            operation: request.operation,
            delta,
            old_value: current.value,
            new_value,
            version: current.version + 1,
            timestamp: Timestamp::now(),
            client_id: request.client_id.clone(),
        };

        match self.store.commit_mutation(current.version, new_value, audit) {
            Ok(committed) => {
                debug!(
                    request_id = %request.request_id,
                    operation = %request.operation,
                    value = committed.value,
                    version = committed.version,
                    attempt,
                    "counter update committed"
                );
                Ok(Attempt::Done(MutationOutcome {
                    value: committed.value,
                    version: committed.version,
                    operation: request.operation,
                    replayed: false,
                    attempts: attempt,
                }))
            }
            Err(CommitError::VersionConflict { .. }) => {
                Ok(Attempt::Conflict(ConflictKind::VersionConflict))
            }
            Err(CommitError::DuplicateRequest(_)) => match self.recorded_outcome(request, attempt)? {
                Some(outcome) => Ok(Attempt::Done(outcome)),
                None => Ok(Attempt::Conflict(ConflictKind::DuplicateRequest)),
            },
            Err(CommitError::Store(e)) if e.is_timeout() => {
                Ok(Attempt::Conflict(ConflictKind::Timeout))
            }
            Err(CommitError::Store(e)) => Err(CounterError::StoreUnavailable(e)),
        }
    }

    /// The committed result for this token, if the policy allows replaying it.
    fn recorded_outcome(
        &self,
        request: &MutationRequest,
        attempt: u32,
    ) -> Result<Option<MutationOutcome>, CounterError> {
        if self.config.duplicate_policy != DuplicatePolicy::ReturnRecorded {
            return Ok(None);
        }

        let record = match self.store.find_audit(&request.request_id) {
            Ok(record) => record,
            Err(e) if e.is_timeout() => None,
            Err(e) => return Err(CounterError::StoreUnavailable(e)),
        };

        Ok(record.map(|record| {
            if record.operation != request.operation {
                warn!(
                    request_id = %request.request_id,
                    recorded = %record.operation,
                    requested = %request.operation,
                    "idempotency token reused for a different operation"
                );
            }
            info!(
                request_id = %request.request_id,
                value = record.new_value,
                version = record.version,
                "returning recorded result for duplicate request"
            );
            MutationOutcome {
                value: record.new_value,
                version: record.version,
                operation: record.operation,
                replayed: true,
                attempts: attempt,
            }
        }))
    }
}
