// ABOUTME: Runtime settings for the reader: a flat map of named values with defaults and typed accessors.
// ABOUTME: Also implements text-to-value coercion for remote updates and the restart-required policy.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::RwLock;
use ulid::Ulid;

/// Settings shared between the router (single writer) and the other tasks.
pub type SharedSettings = Arc<RwLock<Settings>>;

/// Device id used until a real one has been generated or configured.
pub const UNIDENTIFIED_DEVICE_ID: &str = "unidentified_reader";

/// Names of the settings the agent itself understands.
pub mod keys {
    pub const DEVICE_ID: &str = "device_id";
    pub const PUBLISH_TOPIC_TEMPLATE: &str = "publish_topic_template";
    pub const SUBSCRIBE_TOPIC_TEMPLATE: &str = "subscribe_topic_template";
    pub const MANAGE_WHITELIST: &str = "manage_whitelist";
    pub const MANAGE_CONFIG: &str = "manage_config";
    pub const MANAGE_RESET: &str = "manage_reset";
    pub const WHITELIST_ADD_VERB: &str = "whitelist_add_verb";
    pub const WHITELIST_REMOVE_VERB: &str = "whitelist_remove_verb";
    pub const WHITELIST_REPLACE_VERB: &str = "whitelist_replace_verb";
    pub const READ_EVENT: &str = "read_event";
    pub const ERROR_EVENT: &str = "error_event";
    pub const ONLINE_EVENT: &str = "online_event";
    pub const OFFLINE_EVENT: &str = "offline_event";
    pub const CONNECTION_RETRIES: &str = "connection_retries";
    pub const RECONNECT_DELAY_SECS: &str = "reconnect_delay_secs";
    pub const POLL_INTERVAL_MS: &str = "poll_interval_ms";
    pub const DELIVERY_INTERVAL_MS: &str = "delivery_interval_ms";
    pub const PUBLISH_TIMEOUT_MS: &str = "publish_timeout_ms";
    pub const KEEP_ALIVE_SECS: &str = "keep_alive_secs";
    pub const MAX_QUEUE_SIZE: &str = "max_queue_size";
    pub const WHITELIST: &str = "whitelist";
}

/// Settings that take effect without reinitialising the agent. Every other
/// setting is baked into topics or sessions at startup.
const HOT_RELOADABLE: &[&str] = &[
    keys::CONNECTION_RETRIES,
    keys::RECONNECT_DELAY_SECS,
    keys::POLL_INTERVAL_MS,
    keys::DELIVERY_INTERVAL_MS,
    keys::PUBLISH_TIMEOUT_MS,
    keys::MAX_QUEUE_SIZE,
    keys::WHITELIST,
];

/// Returns true if changing the named setting requires a process restart.
pub fn requires_restart(name: &str) -> bool {
    !HOT_RELOADABLE.contains(&name)
}

/// Errors produced when a text payload cannot be read as a setting's type.
#[derive(Debug, Error, PartialEq)]
pub enum CoercionError {
    #[error("cannot read {raw:?} as {expected}")]
    Mismatch { raw: String, expected: &'static str },
}

/// A single setting value. The variant of the current value decides how a
/// remote text update is interpreted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SettingValue {
    Bool(bool),
    Integer(i64),
    Float(f64),
    Text(String),
    List(Vec<serde_json::Value>),
}

impl SettingValue {
    /// Human-readable type name, used in logs and coercion errors.
    pub fn type_name(&self) -> &'static str {
        match self {
            SettingValue::Bool(_) => "bool",
            SettingValue::Integer(_) => "integer",
            SettingValue::Float(_) => "float",
            SettingValue::Text(_) => "string",
            SettingValue::List(_) => "list",
        }
    }

    /// Interpret `raw` as a value of the same type as `self`.
    ///
    /// Numbers are parsed from the trimmed text, lists are decoded as a JSON
    /// array, and strings are taken verbatim.
    pub fn coerce_like(&self, raw: &str) -> Result<SettingValue, CoercionError> {
        let mismatch = || CoercionError::Mismatch {
            raw: raw.to_string(),
            expected: self.type_name(),
        };

        match self {
            SettingValue::Bool(_) => raw
                .trim()
                .parse::<bool>()
                .map(SettingValue::Bool)
                .map_err(|_| mismatch()),
            SettingValue::Integer(_) => raw
                .trim()
                .parse::<i64>()
                .map(SettingValue::Integer)
                .map_err(|_| mismatch()),
            SettingValue::Float(_) => raw
                .trim()
                .parse::<f64>()
                .ok()
                .filter(|v| v.is_finite())
                .map(SettingValue::Float)
                .ok_or_else(mismatch),
            SettingValue::List(_) => serde_json::from_str::<Vec<serde_json::Value>>(raw)
                .map(SettingValue::List)
                .map_err(|_| mismatch()),
            SettingValue::Text(_) => Ok(SettingValue::Text(raw.to_string())),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            SettingValue::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Integer view of numeric values. Floats are truncated.
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            SettingValue::Integer(v) => Some(*v),
            SettingValue::Float(v) => Some(*v as i64),
            _ => None,
        }
    }
}

impl From<&str> for SettingValue {
    fn from(value: &str) -> Self {
        SettingValue::Text(value.to_string())
    }
}

impl From<i64> for SettingValue {
    fn from(value: i64) -> Self {
        SettingValue::Integer(value)
    }
}

/// Flat mapping of named settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Settings {
    values: BTreeMap<String, SettingValue>,
}

impl Default for Settings {
    fn default() -> Self {
        Self::defaults()
    }
}

impl Settings {
    /// Settings with no entries at all.
    pub fn empty() -> Self {
        Self {
            values: BTreeMap::new(),
        }
    }

    /// The built-in defaults every reader starts from.
    pub fn defaults() -> Self {
        let mut s = Self::empty();
        s.set(keys::DEVICE_ID, UNIDENTIFIED_DEVICE_ID.into());
        s.set(
            keys::PUBLISH_TOPIC_TEMPLATE,
            "device/{device_id}/events/{kind}".into(),
        );
        s.set(
            keys::SUBSCRIBE_TOPIC_TEMPLATE,
            "device/{device_id}/manage/{kind}".into(),
        );
        s.set(keys::MANAGE_WHITELIST, "whitelist".into());
        s.set(keys::MANAGE_CONFIG, "configure".into());
        s.set(keys::MANAGE_RESET, "reset".into());
        s.set(keys::WHITELIST_ADD_VERB, "add".into());
        s.set(keys::WHITELIST_REMOVE_VERB, "remove".into());
        s.set(keys::WHITELIST_REPLACE_VERB, "replace".into());
        s.set(keys::READ_EVENT, "read".into());
        s.set(keys::ERROR_EVENT, "error".into());
        s.set(keys::ONLINE_EVENT, "online".into());
        s.set(keys::OFFLINE_EVENT, "offline".into());
        s.set(keys::CONNECTION_RETRIES, SettingValue::Integer(15));
        s.set(keys::RECONNECT_DELAY_SECS, SettingValue::Integer(10));
        s.set(keys::POLL_INTERVAL_MS, SettingValue::Integer(50));
        s.set(keys::DELIVERY_INTERVAL_MS, SettingValue::Integer(500));
        s.set(keys::PUBLISH_TIMEOUT_MS, SettingValue::Integer(5_000));
        s.set(keys::KEEP_ALIVE_SECS, SettingValue::Integer(120));
        s.set(keys::MAX_QUEUE_SIZE, SettingValue::Integer(500));
        s.set(keys::WHITELIST, SettingValue::List(Vec::new()));
        s
    }

    pub fn get(&self, name: &str) -> Option<&SettingValue> {
        self.values.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.values.contains_key(name)
    }

    /// Store a value, returning the one it replaced.
    pub fn set(&mut self, name: &str, value: SettingValue) -> Option<SettingValue> {
        self.values.insert(name.to_string(), value)
    }

    pub fn remove(&mut self, name: &str) -> Option<SettingValue> {
        self.values.remove(name)
    }

    /// Copy every entry of `other` over this map. Used to lay a persisted
    /// settings file on top of the defaults.
    pub fn overlay(&mut self, other: Settings) {
        self.values.extend(other.values);
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.values.keys().map(String::as_str)
    }

    /// Replace the placeholder device id with a generated one. Returns the
    /// new id when a replacement happened.
    pub fn assign_device_id_if_unidentified(&mut self) -> Option<String> {
        let current = self.text(keys::DEVICE_ID, UNIDENTIFIED_DEVICE_ID);
        if current != UNIDENTIFIED_DEVICE_ID && !current.is_empty() {
            return None;
        }
        let id = format!("reader-{}", Ulid::new().to_string().to_lowercase());
        self.set(keys::DEVICE_ID, SettingValue::Text(id.clone()));
        Some(id)
    }

    fn text<'a>(&'a self, name: &str, default: &'a str) -> &'a str {
        self.get(name).and_then(SettingValue::as_str).unwrap_or(default)
    }

    fn non_negative(&self, name: &str, default: u64) -> u64 {
        self.get(name)
            .and_then(SettingValue::as_i64)
            .map(|v| v.max(0) as u64)
            .unwrap_or(default)
    }

    pub fn device_id(&self) -> &str {
        self.text(keys::DEVICE_ID, UNIDENTIFIED_DEVICE_ID)
    }

    pub fn publish_topic_template(&self) -> &str {
        self.text(keys::PUBLISH_TOPIC_TEMPLATE, "device/{device_id}/events/{kind}")
    }

    pub fn subscribe_topic_template(&self) -> &str {
        self.text(keys::SUBSCRIBE_TOPIC_TEMPLATE, "device/{device_id}/manage/{kind}")
    }

    pub fn manage_whitelist(&self) -> &str {
        self.text(keys::MANAGE_WHITELIST, "whitelist")
    }

    pub fn manage_config(&self) -> &str {
        self.text(keys::MANAGE_CONFIG, "configure")
    }

    pub fn manage_reset(&self) -> &str {
        self.text(keys::MANAGE_RESET, "reset")
    }

    pub fn whitelist_add_verb(&self) -> &str {
        self.text(keys::WHITELIST_ADD_VERB, "add")
    }

    pub fn whitelist_remove_verb(&self) -> &str {
        self.text(keys::WHITELIST_REMOVE_VERB, "remove")
    }

    pub fn whitelist_replace_verb(&self) -> &str {
        self.text(keys::WHITELIST_REPLACE_VERB, "replace")
    }

    pub fn read_event(&self) -> &str {
        self.text(keys::READ_EVENT, "read")
    }

    pub fn error_event(&self) -> &str {
        self.text(keys::ERROR_EVENT, "error")
    }

    pub fn online_event(&self) -> &str {
        self.text(keys::ONLINE_EVENT, "online")
    }

    pub fn offline_event(&self) -> &str {
        self.text(keys::OFFLINE_EVENT, "offline")
    }

    /// Connection attempts per connect cycle. Never less than one.
    pub fn connection_retries(&self) -> u32 {
        self.non_negative(keys::CONNECTION_RETRIES, 15).clamp(1, u32::MAX as u64) as u32
    }

    pub fn reconnect_delay(&self) -> Duration {
        Duration::from_secs(self.non_negative(keys::RECONNECT_DELAY_SECS, 10))
    }

    /// Interval between transport polls. Never zero, so the supervisor
    /// always yields between polls.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.non_negative(keys::POLL_INTERVAL_MS, 50).max(1))
    }

    pub fn delivery_interval(&self) -> Duration {
        Duration::from_millis(self.non_negative(keys::DELIVERY_INTERVAL_MS, 500).max(1))
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.non_negative(keys::PUBLISH_TIMEOUT_MS, 5_000).max(1))
    }

    pub fn keep_alive(&self) -> Duration {
        Duration::from_secs(self.non_negative(keys::KEEP_ALIVE_SECS, 120))
    }

    pub fn max_queue_size(&self) -> usize {
        self.non_negative(keys::MAX_QUEUE_SIZE, 500) as usize
    }

    /// Whitelisted identifiers. Non-string list entries are skipped.
    pub fn whitelist(&self) -> Vec<String> {
        match self.get(keys::WHITELIST) {
            Some(SettingValue::List(items)) => items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect(),
            _ => Vec::new(),
        }
    }
}
