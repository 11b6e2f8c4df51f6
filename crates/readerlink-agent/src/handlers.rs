// ABOUTME: Handler traits the command router dispatches to, plus the default settings-backed implementations.
// ABOUTME: Whitelist and config changes mutate the shared settings and persist them; resets go to the restart channel.

use std::sync::Arc;

use async_trait::async_trait;
use readerlink_core::settings::keys;
use readerlink_core::{RestartReason, SettingValue, SharedSettings, TopicError};
use readerlink_store::{SettingsFile, SnapshotError};
use thiserror::Error;
use tokio::sync::mpsc;

use crate::topics::DeviceTopics;

/// What a whitelist command does with its identifiers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WhitelistAction {
    Add,
    Remove,
    Replace,
}

/// Errors raised by handlers. The router reports these on the error topic.
#[derive(Debug, Error)]
pub enum HandlerError {
    #[error("failed to persist settings: {0}")]
    Persist(#[from] SnapshotError),

    #[error("change would leave no valid topic layout: {0}")]
    Topics(#[from] TopicError),

    #[error("{0}")]
    Rejected(String),
}

/// Applies whitelist mutations.
#[async_trait]
pub trait WhitelistHandler: Send + Sync {
    async fn apply(&self, action: WhitelistAction, ids: Vec<String>) -> Result<(), HandlerError>;
}

/// Reads and writes named settings.
#[async_trait]
pub trait ConfigHandler: Send + Sync {
    /// The current value, or None if no setting has that name.
    async fn current(&self, name: &str) -> Option<SettingValue>;

    /// Store a value that has already been coerced to the current type.
    async fn apply(&self, name: &str, value: SettingValue) -> Result<(), HandlerError>;
}

/// Asks the process to restart.
#[async_trait]
pub trait ResetHandler: Send + Sync {
    async fn restart(&self, reason: RestartReason);
}

/// Default whitelist and config handler over the shared settings map and its
/// file. Every change is persisted before it is acknowledged. A change that
/// breaks the topic layout, or a failed write, rolls the in-memory value back
/// and leaves the file untouched.
#[derive(Debug, Clone)]
pub struct SettingsHandler {
    settings: SharedSettings,
    file: Arc<SettingsFile>,
}

impl SettingsHandler {
    pub fn new(settings: SharedSettings, file: SettingsFile) -> Self {
        Self {
            settings,
            file: Arc::new(file),
        }
    }

    async fn store(&self, name: &str, value: SettingValue) -> Result<(), HandlerError> {
        let mut settings = self.settings.write().await;
        let previous = settings.set(name, value);

        let outcome = match DeviceTopics::from_settings(&settings) {
            Ok(_) => self.file.save(&settings).map_err(HandlerError::from),
            Err(e) => Err(e.into()),
        };

        if outcome.is_err() {
            match previous {
                Some(previous) => {
                    settings.set(name, previous);
                }
                None => {
                    settings.remove(name);
                }
            }
        }
        outcome
    }
}

/// Apply a whitelist action to the current list, keeping first-seen order
/// and never introducing duplicates.
pub fn apply_whitelist(current: Vec<String>, action: WhitelistAction, ids: Vec<String>) -> Vec<String> {
    match action {
        WhitelistAction::Add => {
            let mut list = current;
            for id in ids {
                if !list.contains(&id) {
                    list.push(id);
                }
            }
            list
        }
        WhitelistAction::Remove => current.into_iter().filter(|id| !ids.contains(id)).collect(),
        WhitelistAction::Replace => {
            let mut list: Vec<String> = Vec::with_capacity(ids.len());
            for id in ids {
                if !list.contains(&id) {
                    list.push(id);
                }
            }
            list
        }
    }
}

#[async_trait]
impl WhitelistHandler for SettingsHandler {
    async fn apply(&self, action: WhitelistAction, ids: Vec<String>) -> Result<(), HandlerError> {
        let current = self.settings.read().await.whitelist();
        let count = ids.len();
        let updated = apply_whitelist(current, action, ids);
        let size = updated.len();

        let value = SettingValue::List(updated.into_iter().map(serde_json::Value::String).collect());
        self.store(keys::WHITELIST, value).await?;

        tracing::info!(?action, identifiers = count, whitelist_size = size, "whitelist updated");
        Ok(())
    }
}

#[async_trait]
impl ConfigHandler for SettingsHandler {
    async fn current(&self, name: &str) -> Option<SettingValue> {
        self.settings.read().await.get(name).cloned()
    }

    async fn apply(&self, name: &str, value: SettingValue) -> Result<(), HandlerError> {
        self.store(name, value).await?;
        tracing::info!(setting = name, "setting updated");
        Ok(())
    }
}

/// Reset handler that forwards restart requests to whoever owns the process
/// lifecycle.
#[derive(Debug, Clone)]
pub struct RestartRequester {
    tx: mpsc::Sender<RestartReason>,
}

impl RestartRequester {
    pub fn new(tx: mpsc::Sender<RestartReason>) -> Self {
        Self { tx }
    }
}

#[async_trait]
impl ResetHandler for RestartRequester {
    async fn restart(&self, reason: RestartReason) {
        tracing::info!(%reason, "restart requested");
        // A full channel already holds a pending restart
        if let Err(e) = self.tx.try_send(reason) {
            tracing::debug!(error = %e, "restart request not queued");
        }
    }
}
