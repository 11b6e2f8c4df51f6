// ABOUTME: Defines the Transport trait that broker clients implement, plus the message types crossing it.
// ABOUTME: The core treats the transport as opaque; wire framing is the implementation's concern.

use std::time::Duration;

use async_trait::async_trait;

/// Delivery guarantee requested for a publish or subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QoS {
    AtMostOnce,
    AtLeastOnce,
}

/// A message sent to the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>, qos: QoS) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain: false,
        }
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// A message received on one of the subscribed topics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
        }
    }
}

/// Message the broker publishes on our behalf if the session drops uncleanly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LastWill {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

/// Session parameters handed to `Transport::connect`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub client_id: String,
    pub keep_alive: Duration,
}

/// Errors surfaced by transports. The supervisor turns every one of them into
/// a state transition; none reach the supervisor's callers.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("not connected")]
    NotConnected,

    #[error("connection refused: {0}")]
    Refused(String),

    #[error("connection error: {0}")]
    Connection(String),

    #[error("client error: {0}")]
    Client(String),
}

/// A broker client. Implementations hold at most one session at a time; a
/// `connect` on a transport that already has a session replaces it.
#[async_trait]
pub trait Transport: Send {
    /// Arm the abandonment notice for the next session.
    fn set_last_will(&mut self, will: LastWill);

    /// Establish a session with the broker.
    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError>;

    /// Subscribe to a topic filter.
    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError>;

    /// Send a message. Returns once the broker acknowledged it, or for
    /// at-most-once messages once it was written.
    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError>;

    /// Pump the session: keepalive traffic plus any inbound messages that
    /// arrived since the last poll. Must not wait for new traffic.
    async fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError>;

    /// Close the session cleanly.
    async fn disconnect(&mut self) -> Result<(), TransportError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn outbound_builder_defaults_to_not_retained() {
        let msg = OutboundMessage::new("device/r1/events/read", b"{}".to_vec(), QoS::AtLeastOnce);
        assert!(!msg.retain);
        assert!(msg.clone().retained().retain);
    }

    #[test]
    fn transport_error_display() {
        let errors = vec![
            TransportError::NotConnected,
            TransportError::Refused("bad credentials".to_string()),
            TransportError::Connection("reset by peer".to_string()),
            TransportError::Client("request channel closed".to_string()),
        ];

        for err in &errors {
            assert!(!err.to_string().is_empty());
        }
        assert!(
            TransportError::Refused("bad credentials".to_string())
                .to_string()
                .contains("bad credentials")
        );
    }
}
