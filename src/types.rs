//! Core types for the counter store.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use time::error::ComponentRange;
use time::OffsetDateTime;
use uuid::Uuid;

/// Identity of the singleton counter row.
pub const COUNTER_ID: &str = "global-counter";

/// Upper bound of the counter value (inclusive).
pub const MAX_VALUE: i64 = 1_000_000_000;

/// Lower bound of the counter value (inclusive).
pub const MIN_VALUE: i64 = 0;

/// Version of a freshly created counter.
pub const INITIAL_VERSION: u64 = 1;

/// Microseconds since Unix epoch.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Timestamp(pub i64);

impl Timestamp {
    /// Current time.
    pub fn now() -> Self {
        let duration = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default();
        Timestamp(duration.as_micros() as i64)
    }

    pub fn as_micros(self) -> i64 {
        self.0
    }

    /// Calendar form, for wire formats that carry dates.
    pub fn to_datetime(self) -> Result<OffsetDateTime, ComponentRange> {
        OffsetDateTime::from_unix_timestamp_nanos(i128::from(self.0) * 1_000)
    }

    /// Truncates to whole microseconds.
    pub fn from_datetime(datetime: OffsetDateTime) -> Self {
        Timestamp((datetime.unix_timestamp_nanos() / 1_000) as i64)
    }

    /// Saturating `self + duration`.
    pub fn add(self, duration: Duration) -> Self {
        let micros = i64::try_from(duration.as_micros()).unwrap_or(i64::MAX);
        Timestamp(self.0.saturating_add(micros))
    }
}

impl fmt::Debug for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Timestamp({})", self.0)
    }
}

/// Direction of a mutation.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Operation {
    Increment,
    Decrement,
}

impl Operation {
    pub fn delta(self) -> i64 {
        match self {
            Operation::Increment => 1,
            Operation::Decrement => -1,
        }
    }

    /// Only unit deltas are valid mutations.
    pub fn from_delta(delta: i64) -> Option<Self> {
        match delta {
            1 => Some(Operation::Increment),
            -1 => Some(Operation::Decrement),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Operation::Increment => "increment",
            Operation::Decrement => "decrement",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Caller-supplied idempotency token.
///
/// Construction does not validate; see [`crate::validation`] for the
/// boundary checks applied before a token reaches the coordinator.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn new(id: impl Into<String>) -> Self {
        RequestId(id.into())
    }

    /// A fresh UUID v4 token.
    pub fn generate() -> Self {
        RequestId(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "RequestId({})", self.0)
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Sanitized identifier of the client that originated a mutation.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(String);

impl ClientId {
    pub const ANONYMOUS: &'static str = "anonymous";

    pub fn new(id: impl Into<String>) -> Self {
        ClientId(id.into())
    }

    pub fn anonymous() -> Self {
        ClientId(Self::ANONYMOUS.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// System-generated identifier of an audit record.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AuditId(pub Uuid);

impl AuditId {
    pub fn generate() -> Self {
        AuditId(Uuid::new_v4())
    }
}

impl fmt::Debug for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "AuditId({})", self.0)
    }
}

impl fmt::Display for AuditId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The singleton counter row.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Counter {
    pub value: i64,
    /// Fencing token, +1 per committed mutation.
    pub version: u64,
    /// None until the first committed mutation.
    pub last_updated: Option<Timestamp>,
    pub created_at: Timestamp,
}

impl Counter {
    /// The lazily created initial row.
    pub fn initial(created_at: Timestamp) -> Self {
        Self {
            value: MIN_VALUE,
            version: INITIAL_VERSION,
            last_updated: None,
            created_at,
        }
    }
}

/// One committed mutation. Append-only.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    pub id: AuditId,
    pub request_id: RequestId,
    pub operation: Operation,
    pub delta: i64,
    pub old_value: i64,
    pub new_value: i64,
    /// Counter version written by this mutation.
    pub version: u64,
    pub timestamp: Timestamp,
    pub client_id: Option<ClientId>,
}

/// State returned by a successful commit.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Committed {
    pub value: i64,
    pub version: u64,
    pub last_updated: Timestamp,
}

/// Opaque identifier of a subscribed observer.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ConnectionId(String);

impl ConnectionId {
    pub fn new(id: impl Into<String>) -> Self {
        ConnectionId(id.into())
    }

    /// A fresh random identifier (local connections).
    pub fn generate() -> Self {
        ConnectionId(format!("local-{}", Uuid::new_v4().simple()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ConnectionId({})", self.0)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// A registered observer.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Connection {
    pub id: ConnectionId,
    pub registered_at: Timestamp,
    pub expires_at: Timestamp,
}

impl Connection {
    pub fn is_expired(&self, now: Timestamp) -> bool {
        self.expires_at <= now
    }
}
