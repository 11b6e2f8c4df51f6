// ABOUTME: Record type for events waiting to be delivered to the broker.
// ABOUTME: A record pairs a unique key with opaque payload fields and an ordering timestamp.

use std::collections::BTreeMap;
use std::fmt;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use ulid::Ulid;

/// Named payload attributes of a record. Opaque to the delivery core.
pub type Fields = BTreeMap<String, serde_json::Value>;

/// Key identifying a record within the store. Keys are compared as strings,
/// which also makes store-assigned ULID keys sort by creation time.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RecordKey(String);

impl RecordKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    /// Generate a fresh key for a record whose producer did not choose one.
    pub fn generate() -> Self {
        Self(Ulid::new().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RecordKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RecordKey {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for RecordKey {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// One undelivered event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    pub key: RecordKey,
    pub fields: Fields,
    pub timestamp: u64,
}

impl Record {
    /// Serialize the record as the JSON body published to the broker.
    pub fn to_payload(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }
}

/// A record that has not been added to the store yet. Key and timestamp are
/// optional; the store assigns them when the producer leaves them out.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordDraft {
    pub key: Option<RecordKey>,
    pub fields: Fields,
    pub timestamp: Option<u64>,
}

impl RecordDraft {
    pub fn new(fields: Fields) -> Self {
        Self {
            key: None,
            fields,
            timestamp: None,
        }
    }

    pub fn with_key(mut self, key: impl Into<RecordKey>) -> Self {
        self.key = Some(key.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: u64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }
}

/// Wall-clock milliseconds since the Unix epoch, clamped at zero for clocks
/// that were never synchronised.
pub fn now_millis() -> u64 {
    u64::try_from(Utc::now().timestamp_millis()).unwrap_or(0)
}
