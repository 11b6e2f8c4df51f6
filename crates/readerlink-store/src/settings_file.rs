// ABOUTME: Load and save the reader's runtime settings as a flat JSON object.
// ABOUTME: Loaded settings are the defaults overlaid with the file; unreadable files fall back to defaults.

use std::path::{Path, PathBuf};

use readerlink_core::Settings;

use crate::snapshot::{SnapshotError, read_json, write_json};

/// The persisted settings file.
#[derive(Debug, Clone)]
pub struct SettingsFile {
    path: PathBuf,
}

impl SettingsFile {
    pub fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    /// Returns the path to the settings file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load settings: the defaults with every entry from the file laid on top.
    ///
    /// A missing file, or one that cannot be read or decoded, yields the
    /// defaults, which are then written back so the next start finds a valid
    /// file. A placeholder device id is replaced with a generated one and
    /// persisted.
    pub fn load(&self) -> Settings {
        let mut settings = Settings::defaults();
        let mut dirty = false;

        match read_json::<Settings>(&self.path) {
            Ok(Some(stored)) => {
                settings.overlay(stored);
                tracing::info!(path = %self.path.display(), "settings loaded");
            }
            Ok(None) => {
                tracing::info!(path = %self.path.display(), "no settings file, using defaults");
                dirty = true;
            }
            Err(e) => {
                tracing::warn!(
                    path = %self.path.display(),
                    error = %e,
                    "settings file unreadable, using defaults"
                );
                dirty = true;
            }
        }

        if let Some(id) = settings.assign_device_id_if_unidentified() {
            tracing::info!(device_id = %id, "generated device id");
            dirty = true;
        }

        if dirty && let Err(e) = self.save(&settings) {
            tracing::warn!(path = %self.path.display(), error = %e, "failed to write settings file");
        }

        settings
    }

    /// Persist the full settings map atomically.
    pub fn save(&self, settings: &Settings) -> Result<(), SnapshotError> {
        write_json(&self.path, settings)?;
        tracing::debug!(path = %self.path.display(), "settings saved");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use readerlink_core::SettingValue;
    use readerlink_core::settings::keys;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn missing_file_yields_defaults_and_is_created() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(&dir.path().join("settings.json"));

        let settings = file.load();

        assert_eq!(settings.connection_retries(), 15);
        assert!(settings.device_id().starts_with("reader-"));
        assert!(file.path().exists());
    }

    #[test]
    fn generated_device_id_is_stable_across_loads() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(&dir.path().join("settings.json"));

        let first = file.load();
        let second = file.load();

        assert_eq!(first.device_id(), second.device_id());
    }

    #[test]
    fn stored_values_override_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(
            &path,
            r#"{"device_id": "gate-3", "connection_retries": 4, "whitelist": ["A1"]}"#,
        )
        .unwrap();

        let settings = SettingsFile::new(&path).load();

        assert_eq!(settings.device_id(), "gate-3");
        assert_eq!(settings.connection_retries(), 4);
        assert_eq!(settings.whitelist(), vec!["A1".to_string()]);
        assert_eq!(settings.read_event(), "read");
    }

    #[test]
    fn corrupt_file_falls_back_to_defaults_and_is_rewritten() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("settings.json");
        fs::write(&path, b"{{{").unwrap();

        let file = SettingsFile::new(&path);
        let settings = file.load();
        assert_eq!(settings.max_queue_size(), 500);

        let reread: Option<Settings> = read_json(&path).unwrap();
        assert!(reread.is_some(), "defaults should have been written back");
    }

    #[test]
    fn save_then_load_keeps_changes() {
        let dir = TempDir::new().unwrap();
        let file = SettingsFile::new(&dir.path().join("settings.json"));

        let mut settings = file.load();
        settings.set(keys::MAX_QUEUE_SIZE, SettingValue::Integer(42));
        file.save(&settings).unwrap();

        assert_eq!(file.load().max_queue_size(), 42);
    }
}
