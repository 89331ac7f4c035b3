//! Fanout message types.

use crate::types::{ClientId, Operation, Timestamp};
use serde::{Deserialize, Serialize};

/// Value of the envelope's `type` field.
pub const UPDATE_MESSAGE_TYPE: &str = "counter-update";

/// A committed change to announce.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CounterUpdate {
    pub value: i64,
    pub operation: Operation,
    /// Client that originated the mutation.
    pub client_id: Option<ClientId>,
}

/// JSON message delivered to every observer.
///
/// ```json
/// {"type":"counter-update","value":42,"operation":"increment","clientId":"web-1","timestamp":"2023-11-14T22:13:20.000001Z"}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    pub value: i64,
    pub operation: Operation,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<ClientId>,
    /// RFC 3339 on the wire.
    #[serde(with = "rfc3339")]
    pub timestamp: Timestamp,
}

impl UpdateEnvelope {
    pub fn new(update: &CounterUpdate, timestamp: Timestamp) -> Self {
        Self {
            kind: UPDATE_MESSAGE_TYPE.to_string(),
            value: update.value,
            operation: update.operation,
            client_id: update.client_id.clone(),
            timestamp,
        }
    }
}

mod rfc3339 {
    use crate::types::Timestamp;
    use serde::{de, ser, Deserialize, Deserializer, Serializer};
    use time::format_description::well_known::Rfc3339;
    use time::OffsetDateTime;

    pub fn serialize<S: Serializer>(timestamp: &Timestamp, serializer: S) -> Result<S::Ok, S::Error> {
        let formatted = timestamp
            .to_datetime()
            .map_err(ser::Error::custom)?
            .format(&Rfc3339)
            .map_err(ser::Error::custom)?;
        serializer.serialize_str(&formatted)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Timestamp, D::Error> {
        let raw = String::deserialize(deserializer)?;
        let datetime = OffsetDateTime::parse(&raw, &Rfc3339).map_err(de::Error::custom)?;
        Ok(Timestamp::from_datetime(datetime))
    }
}

/// Summary of one broadcast.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct BroadcastReport {
    /// Connections a delivery was attempted to.
    pub attempted: usize,
    pub delivered: usize,
    /// Connections removed because their observer was gone.
    pub pruned: usize,
    /// Timeouts and other delivery errors.
    pub failed: usize,
}
