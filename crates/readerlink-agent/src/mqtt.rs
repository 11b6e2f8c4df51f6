// ABOUTME: MQTT implementation of the Transport trait on top of rumqttc's AsyncClient and EventLoop.
// ABOUTME: Each connect builds a fresh client; publishes wait for the broker's PUBACK while buffering inbound messages.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing,
};

use crate::config::AgentConfig;
use crate::transport::{
    InboundMessage, LastWill, OutboundMessage, QoS, SessionOptions, Transport, TransportError,
};

const REQUEST_CAPACITY: usize = 64;
/// How long a poll waits for already-arrived traffic before returning.
const DRAIN_WINDOW: Duration = Duration::from_millis(10);

struct Session {
    client: AsyncClient,
    eventloop: EventLoop,
}

pub struct MqttTransport {
    host: String,
    port: u16,
    credentials: Option<(String, String)>,
    will: Option<LastWill>,
    session: Option<Session>,
    inbound: VecDeque<InboundMessage>,
}

impl MqttTransport {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
            credentials: None,
            will: None,
            session: None,
            inbound: VecDeque::new(),
        }
    }

    pub fn from_config(config: &AgentConfig) -> Self {
        let transport = Self::new(config.broker_host.clone(), config.broker_port);
        match &config.username {
            Some(user) => {
                transport.with_credentials(user.clone(), config.password.clone().unwrap_or_default())
            }
            None => transport,
        }
    }

    pub fn with_credentials(mut self, username: String, password: String) -> Self {
        self.credentials = Some((username, password));
        self
    }

    fn options(&self, session: &SessionOptions) -> MqttOptions {
        let mut options = MqttOptions::new(session.client_id.clone(), self.host.clone(), self.port);
        options.set_keep_alive(session.keep_alive.max(Duration::from_secs(5)));
        options.set_clean_session(true);

        if let Some((user, password)) = &self.credentials {
            options.set_credentials(user.clone(), password.clone());
        }
        if let Some(will) = &self.will {
            options.set_last_will(rumqttc::LastWill::new(
                will.topic.clone(),
                will.payload.clone(),
                to_rumqttc(will.qos),
                will.retain,
            ));
        }
        options
    }

    fn session(&mut self) -> Result<&mut Session, TransportError> {
        self.session.as_mut().ok_or(TransportError::NotConnected)
    }
}

fn to_rumqttc(qos: QoS) -> rumqttc::QoS {
    match qos {
        QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
        QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
    }
}

fn connection_error(e: ConnectionError) -> TransportError {
    match e {
        ConnectionError::ConnectionRefused(code) => TransportError::Refused(format!("{code:?}")),
        other => TransportError::Connection(other.to_string()),
    }
}

fn client_error(e: rumqttc::ClientError) -> TransportError {
    TransportError::Client(e.to_string())
}

/// Drive the event loop until `done` accepts an event, buffering inbound
/// publishes on the way.
async fn drive_until(
    eventloop: &mut EventLoop,
    inbound: &mut VecDeque<InboundMessage>,
    mut done: impl FnMut(&Event) -> bool,
) -> Result<(), TransportError> {
    loop {
        let event = eventloop.poll().await.map_err(connection_error)?;
        if let Event::Incoming(Incoming::Publish(publish)) = &event {
            inbound.push_back(InboundMessage::new(
                publish.topic.clone(),
                publish.payload.to_vec(),
            ));
        }
        if done(&event) {
            return Ok(());
        }
    }
}

#[async_trait]
impl Transport for MqttTransport {
    fn set_last_will(&mut self, will: LastWill) {
        self.will = Some(will);
    }

    async fn connect(&mut self, options: &SessionOptions) -> Result<(), TransportError> {
        self.session = None;
        self.inbound.clear();

        let (client, mut eventloop) = AsyncClient::new(self.options(options), REQUEST_CAPACITY);
        let mut refused = None;
        drive_until(&mut eventloop, &mut self.inbound, |event| match event {
            Event::Incoming(Incoming::ConnAck(ack)) => {
                if ack.code != ConnectReturnCode::Success {
                    refused = Some(ack.code);
                }
                true
            }
            _ => false,
        })
        .await?;

        if let Some(code) = refused {
            return Err(TransportError::Refused(format!("{code:?}")));
        }

        tracing::debug!(host = %self.host, port = self.port, "mqtt session open");
        self.session = Some(Session { client, eventloop });
        Ok(())
    }

    async fn subscribe(&mut self, filter: &str, qos: QoS) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        session
            .client
            .subscribe(filter, to_rumqttc(qos))
            .await
            .map_err(client_error)?;

        drive_until(&mut session.eventloop, &mut self.inbound, |event| {
            matches!(event, Event::Incoming(Incoming::SubAck(_)))
        })
        .await
    }

    async fn publish(&mut self, message: &OutboundMessage) -> Result<(), TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;
        session
            .client
            .publish(
                message.topic.clone(),
                to_rumqttc(message.qos),
                message.retain,
                message.payload.clone(),
            )
            .await
            .map_err(client_error)?;

        let mut sent_pkid = None;
        drive_until(&mut session.eventloop, &mut self.inbound, |event| match event {
            Event::Outgoing(Outgoing::Publish(pkid)) if sent_pkid.is_none() => {
                sent_pkid = Some(*pkid);
                message.qos == QoS::AtMostOnce
            }
            Event::Incoming(Incoming::PubAck(ack)) => sent_pkid == Some(ack.pkid),
            _ => false,
        })
        .await
    }

    async fn poll(&mut self) -> Result<Vec<InboundMessage>, TransportError> {
        let session = self.session.as_mut().ok_or(TransportError::NotConnected)?;

        loop {
            match tokio::time::timeout(DRAIN_WINDOW, session.eventloop.poll()).await {
                Err(_) => break,
                Ok(Ok(Event::Incoming(Incoming::Publish(publish)))) => {
                    self.inbound.push_back(InboundMessage::new(
                        publish.topic.clone(),
                        publish.payload.to_vec(),
                    ));
                }
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    self.session = None;
                    return Err(connection_error(e));
                }
            }
        }

        Ok(self.inbound.drain(..).collect())
    }

    async fn disconnect(&mut self) -> Result<(), TransportError> {
        let session = self.session()?;
        session.client.disconnect().await.map_err(client_error)?;

        // Flush the DISCONNECT packet; the loop errors once the socket closes
        let _ = tokio::time::timeout(DRAIN_WINDOW * 10, async {
            while session.eventloop.poll().await.is_ok() {}
        })
        .await;

        self.session = None;
        Ok(())
    }
}
