// ABOUTME: Test utilities for readerlink-agent, including an in-memory scripted transport.
// ABOUTME: Used in tests to simulate broker behaviour (failures, timeouts, inbound commands) without a network.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use readerlink_core::settings::keys;
use readerlink_core::{SettingValue, Settings};

use crate::transport::{
    InboundMessage, LastWill, OutboundMessage, QoS, SessionOptions, Transport, TransportError,
};

/// How the mock answers a publish.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PublishMode {
    #[default]
    Succeed,
    Fail,
    /// Never resolve, so the caller's timeout fires.
    Hang,
}

#[derive(Debug, Default)]
struct MockState {
    connected: bool,
    connect_failures: u32,
    connects: u32,
    disconnects: u32,
    poll_failures: u32,
    publish_mode: PublishMode,
    topic_modes: HashMap<String, PublishMode>,
    last_will: Option<LastWill>,
    session_will: Option<LastWill>,
    client_ids: Vec<String>,
    subscriptions: Vec<(String, QoS)>,
    published: Vec<OutboundMessage>,
    inbound: VecDeque<InboundMessage>,
}

/// A scripted in-memory transport.
///
/// Clones share state, so a test keeps one clone to steer and inspect the
/// transport after handing another to the supervisor.
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// Make the next `n` connects fail.
    pub fn fail_connects(&self, n: u32) {
        self.with_state(|s| s.connect_failures = n);
    }

    /// Make the next poll fail, dropping the session.
    pub fn fail_next_poll(&self) {
        self.with_state(|s| s.poll_failures += 1);
    }

    /// Set how publishes to topics without a specific mode are answered.
    pub fn set_publish_mode(&self, mode: PublishMode) {
        self.with_state(|s| s.publish_mode = mode);
    }

    /// Set how publishes to one exact topic are answered.
    pub fn set_publish_mode_for(&self, topic: &str, mode: PublishMode) {
        self.with_state(|s| {
            s.topic_modes.insert(topic.to_string(), mode);
        });
    }

    /// Queue a message to be returned by the next poll.
    pub fn push_inbound(&self, message: InboundMessage) {
        self.with_state(|s| s.inbound.push_back(message));
    }

    /// Drop the session as if the broker went away.
    pub fn drop_session(&self) {
        self.with_state(|s| s.connected = false);
    }

    pub fn is_connected(&self) -> bool {
        self.with_state(|s| s.connected)
    }

    pub fn connect_count(&self) -> u32 {
        self.with_state(|s| s.connects)
    }

    pub fn disconnect_count(&self) -> u32 {
        self.with_state(|s| s.disconnects)
    }

    pub fn client_ids(&self) -> Vec<String> {
        self.with_state(|s| s.client_ids.clone())
    }

    /// The will that was armed when the current session was established.
    pub fn session_will(&self) -> Option<LastWill> {
        self.with_state(|s| s.session_will.clone())
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.with_state(|s| s.subscriptions.iter().map(|(f, _)| f.clone()).collect())
    }

    /// Every message the broker acknowledged, in order.
    pub fn published(&self) -> Vec<OutboundMessage> {
        self.with_state(|s| s.published.clone())
    }

    pub fn published_to(&self, topic: &str) -> Vec<OutboundMessage> {
        self.with_state(|s| {
            s.published
                .iter()
                .filter(|m| m.topic == topic)
                .cloned()
                .collect()
        })
    }
}

#[async_trait]
impl Transport for MockTransport {
    fn set_last_will(&mut self, will: LastWill) {
        self.with_state(|s| s.last_will = Some(will));
    }

    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.connects += 1;
            if s.connect_failures > 0 {
                s.connect_failures -= 1;
                s.connected = false;
                return Err(TransportError::Connection("broker unreachable".to_string()));
            }
            s.connected = true;
            s.session_will = s.last_will.clone();
            s.client_ids.push(options.client_id.clone());
            Ok(())
        })
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        self.with_state(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            s.subscriptions.push((filter.to_string(), qos));
            Ok(())
        })
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let mode = self.with_state(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            Ok(s.topic_modes
                .get(&message.topic)
                .copied()
                .unwrap_or(s.publish_mode))
        })?;

        match mode {
            PublishMode::Succeed => {
                self.with_state(|s| s.published.push(message.clone()));
                Ok(())
            }
            PublishMode::Fail => Err(TransportError::Connection("publish rejected".to_string())),
            PublishMode::Hang => {
                std::future::pending::<()>().await;
                Ok(())
            }
        }
    }

    async fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError> {
        self.with_state(|s| {
            if !s.connected {
                return Err(TransportError::NotConnected);
            }
            if s.poll_failures > 0 {
                s.poll_failures -= 1;
                s.connected = false;
                return Err(TransportError::Connection("keepalive timeout".to_string()));
            }
            Ok(s.inbound.drain(..).collect())
        })
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        self.with_state(|s| {
            s.disconnects += 1;
            s.connected = false;
        });
        Ok(())
    }
}

/// Settings tuned for tests: a fixed device id, no reconnect delay and fast
/// polling/delivery.
pub fn fast_settings() -> Settings {
    let mut settings = Settings::defaults();
    settings.set(keys::DEVICE_ID, "r1".into());
    settings.set(keys::CONNECTION_RETRIES, SettingValue::Integer(3));
    settings.set(keys::RECONNECT_DELAY_SECS, SettingValue::Integer(0));
    settings.set(keys::POLL_INTERVAL_MS, SettingValue::Integer(5));
    settings.set(keys::DELIVERY_INTERVAL_MS, SettingValue::Integer(5));
    settings.set(keys::PUBLISH_TIMEOUT_MS, SettingValue::Integer(200));
    settings
}
