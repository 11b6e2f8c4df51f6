// ABOUTME: Core library for readerlink, containing the domain types shared by the store and the agent.
// ABOUTME: Defines records, runtime settings, topic templates, connection state, status events and restart reasons.

pub mod connection;
pub mod lifecycle;
pub mod record;
pub mod settings;
pub mod status;
pub mod topic;

pub use connection::ConnectionState;
pub use lifecycle::{RESTART_EXIT_CODE, RestartReason};
pub use record::{Fields, Record, RecordDraft, RecordKey};
pub use settings::{CoercionError, SettingValue, Settings, SharedSettings, requires_restart};
pub use status::{StatusEvent, StatusEvents};
pub use topic::{TopicError, TopicRoot, TopicTemplate};
