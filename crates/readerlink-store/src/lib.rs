// ABOUTME: Persistence layer for readerlink, keeping pending records and settings on local storage.
// ABOUTME: Provides the record store, the settings file, and the atomic snapshot writer they share.

pub mod records;
pub mod settings_file;
pub mod snapshot;

pub use records::{RecordStore, StorageError};
pub use settings_file::SettingsFile;
pub use snapshot::{SnapshotError, read_json, write_atomic, write_json};
