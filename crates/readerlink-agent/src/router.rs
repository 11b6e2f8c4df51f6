// ABOUTME: Command router that maps inbound control messages to whitelist, config and reset handlers.
// ABOUTME: The dispatch table is built once from settings; handler failures are reported on the error topic.

use std::sync::Arc;

use readerlink_core::{
    CoercionError, RestartReason, SettingValue, Settings, StatusEvent, StatusEvents, TopicError,
    TopicRoot, requires_restart,
};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::handlers::{ConfigHandler, HandlerError, ResetHandler, WhitelistAction, WhitelistHandler};
use crate::supervisor::SupervisorHandle;
use crate::topics::DeviceTopics;
use crate::transport::InboundMessage;

/// Malformed control messages. Logged and dropped.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("payload is not valid UTF-8")]
    NotUtf8,

    #[error("whitelist payload must be a JSON string or a list of strings: {0}")]
    WhitelistPayload(String),

    #[error("unknown whitelist action '{0}'")]
    UnknownAction(String),

    #[error("setting '{name}': {source}")]
    Coercion {
        name: String,
        #[source]
        source: CoercionError,
    },
}

#[derive(Debug, Error)]
enum RouteError {
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error(transparent)]
    Handler(#[from] HandlerError),
}

impl RouteError {
    /// Handler failures and rejected setting values go back to the operator;
    /// other malformed input is only logged.
    fn is_reported(&self) -> bool {
        matches!(
            self,
            RouteError::Handler(_) | RouteError::Protocol(ProtocolError::Coercion { .. })
        )
    }
}

/// What a routed message did.
#[derive(Debug, Clone, PartialEq)]
pub enum Dispatched {
    Whitelist {
        action: WhitelistAction,
        ids: Vec<String>,
    },
    Config {
        name: String,
        value: SettingValue,
        restart: bool,
    },
    UnknownSetting(String),
    Reset,
    /// The topic is not one the router handles.
    Ignored,
}

/// The handlers a router dispatches to.
#[derive(Clone)]
pub struct RouterHandlers {
    pub whitelist: Arc<dyn WhitelistHandler>,
    pub config: Arc<dyn ConfigHandler>,
    pub reset: Arc<dyn ResetHandler>,
}

pub struct CommandRouter {
    root: TopicRoot,
    whitelist_kind: String,
    config_kind: String,
    reset_kind: String,
    add_verb: String,
    remove_verb: String,
    replace_verb: String,
    handlers: RouterHandlers,
    supervisor: SupervisorHandle,
    status: StatusEvents,
}

impl CommandRouter {
    pub fn new(
        settings: &Settings,
        handlers: RouterHandlers,
        supervisor: SupervisorHandle,
        status: StatusEvents,
    ) -> Result<Self, TopicError> {
        let topics = DeviceTopics::from_settings(settings)?;
        Ok(Self {
            root: topics.manage_root,
            whitelist_kind: topics.whitelist_kind,
            config_kind: topics.config_kind,
            reset_kind: topics.reset_kind,
            add_verb: settings.whitelist_add_verb().to_string(),
            remove_verb: settings.whitelist_remove_verb().to_string(),
            replace_verb: settings.whitelist_replace_verb().to_string(),
            handlers,
            supervisor,
            status,
        })
    }

    /// Route inbound messages until the channel closes.
    pub async fn run(self, mut inbound: mpsc::Receiver<InboundMessage>) {
        while let Some(message) = inbound.recv().await {
            self.dispatch(message).await;
        }
        tracing::debug!("inbound channel closed, router stopping");
    }

    /// Route one message. Never fails: errors are logged, and reported on
    /// the error topic where the operator can act on them.
    pub async fn dispatch(&self, message: InboundMessage) -> Option<Dispatched> {
        tracing::info!(topic = %message.topic, bytes = message.payload.len(), "command received");
        self.status.emit(StatusEvent::CommandReceived {
            topic: message.topic.clone(),
        });

        match self.route(&message).await {
            Ok(dispatched) => Some(dispatched),
            Err(e) => {
                tracing::warn!(topic = %message.topic, error = %e, "command rejected");
                if e.is_reported() {
                    let text = format!("{}: {e}", message.topic);
                    if !self.supervisor.report_error(&text).await {
                        tracing::warn!(topic = %message.topic, "could not report command error");
                    }
                }
                None
            }
        }
    }

    async fn route(&self, message: &InboundMessage) -> Result<Dispatched, RouteError> {
        let topic = message.topic.as_str();

        if self.root.matches(topic, &self.reset_kind) {
            self.handlers.reset.restart(RestartReason::ResetCommand).await;
            return Ok(Dispatched::Reset);
        }

        if let Some(verb) = self.root.trailing_segment(topic, &self.whitelist_kind) {
            let action = self.action_for(verb)?;
            let ids = decode_identifiers(payload_text(&message.payload)?)?;
            self.handlers.whitelist.apply(action, ids.clone()).await?;
            return Ok(Dispatched::Whitelist { action, ids });
        }

        if let Some(name) = self.root.trailing_segment(topic, &self.config_kind) {
            return self.apply_setting(name, &message.payload).await;
        }

        tracing::debug!(topic, "no route for topic");
        Ok(Dispatched::Ignored)
    }

    fn action_for(&self, verb: &str) -> Result<WhitelistAction, ProtocolError> {
        if verb == self.add_verb {
            Ok(WhitelistAction::Add)
        } else if verb == self.remove_verb {
            Ok(WhitelistAction::Remove)
        } else if verb == self.replace_verb {
            Ok(WhitelistAction::Replace)
        } else {
            Err(ProtocolError::UnknownAction(verb.to_string()))
        }
    }

    async fn apply_setting(&self, name: &str, payload: &[u8]) -> Result<Dispatched, RouteError> {
        let Some(current) = self.handlers.config.current(name).await else {
            tracing::info!(setting = name, "unknown setting, ignoring");
            return Ok(Dispatched::UnknownSetting(name.to_string()));
        };

        let value = current
            .coerce_like(payload_text(payload)?)
            .map_err(|source| ProtocolError::Coercion {
                name: name.to_string(),
                source,
            })?;

        self.handlers.config.apply(name, value.clone()).await?;

        let restart = requires_restart(name);
        if restart {
            self.handlers
                .reset
                .restart(RestartReason::SettingChanged(name.to_string()))
                .await;
        }

        Ok(Dispatched::Config {
            name: name.to_string(),
            value,
            restart,
        })
    }
}

fn payload_text(payload: &[u8]) -> Result<&str, ProtocolError> {
    std::str::from_utf8(payload).map_err(|_| ProtocolError::NotUtf8)
}

/// A whitelist payload is either one identifier as a JSON string or a JSON
/// list of identifier strings.
fn decode_identifiers(text: &str) -> Result<Vec<String>, ProtocolError> {
    let value: Value =
        serde_json::from_str(text).map_err(|e| ProtocolError::WhitelistPayload(e.to_string()))?;

    match value {
        Value::String(id) => Ok(vec![id]),
        Value::Array(items) => items
            .into_iter()
            .map(|item| match item {
                Value::String(id) => Ok(id),
                other => Err(ProtocolError::WhitelistPayload(format!(
                    "list entry {other} is not a string"
                ))),
            })
            .collect(),
        other => Err(ProtocolError::WhitelistPayload(format!(
            "expected string or list, got {other}"
        ))),
    }
}
