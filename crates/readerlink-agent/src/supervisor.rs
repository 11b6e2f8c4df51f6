// ABOUTME: Connection supervisor actor owning the single broker session and its lifecycle.
// ABOUTME: SupervisorHandle offers publish/report_error/state to other tasks; connect retries, presence and polling live here.

use std::time::Duration;

use readerlink_core::{ConnectionState, SharedSettings, StatusEvent, StatusEvents};
use thiserror::Error;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

use crate::topics::DeviceTopics;
use crate::transport::{
    InboundMessage, LastWill, OutboundMessage, QoS, SessionOptions, Transport, TransportError,
};

/// Errors that end the supervisor task.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("connection retries exhausted after {attempts} attempts")]
    ConnectExhausted { attempts: u32 },
}

/// Static parameters of the supervisor, fixed for the life of the process.
#[derive(Debug, Clone)]
pub struct SupervisorConfig {
    pub client_id: String,
    /// Bound on one connect attempt, and on the graceful disconnect.
    pub connect_timeout: Duration,
}

enum Command {
    Publish {
        message: OutboundMessage,
        timeout: Duration,
        reply: oneshot::Sender<bool>,
    },
    Disconnect {
        reply: oneshot::Sender<()>,
    },
}

/// Cloneable handle to the supervisor. Publishing never raises: every
/// failure is reported as `false` and handled inside the supervisor.
#[derive(Debug, Clone)]
pub struct SupervisorHandle {
    cmd_tx: mpsc::Sender<Command>,
    state_rx: watch::Receiver<ConnectionState>,
    settings: SharedSettings,
    error_topic: String,
}

impl SupervisorHandle {
    /// Publish a message, waiting at most `timeout` for the broker's
    /// acknowledgement. Returns false when not connected, on failure, or on
    /// timeout; the latter two also mark the session unhealthy.
    pub async fn publish(&self, message: OutboundMessage, timeout: Duration) -> bool {
        let (reply, rx) = oneshot::channel();
        let cmd = Command::Publish {
            message,
            timeout,
            reply,
        };
        if self.cmd_tx.send(cmd).await.is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Publish a diagnostic text to the device's error topic.
    pub async fn report_error(&self, text: &str) -> bool {
        let timeout = self.settings.read().await.publish_timeout();
        let message = OutboundMessage::new(
            self.error_topic.clone(),
            text.as_bytes().to_vec(),
            QoS::AtLeastOnce,
        );
        self.publish(message, timeout).await
    }

    /// Current connection state.
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Wait until the supervisor reaches `state`. Returns false if the
    /// supervisor is gone.
    pub async fn wait_for(&self, state: ConnectionState) -> bool {
        let mut rx = self.state_rx.clone();
        rx.wait_for(|s| *s == state).await.is_ok()
    }

    /// Publish the offline marker, close the session and stop the
    /// supervisor. Returns once the supervisor has finished.
    pub async fn disconnect(&self) {
        let (reply, rx) = oneshot::channel();
        if self.cmd_tx.send(Command::Disconnect { reply }).await.is_ok() {
            let _ = rx.await;
        }
    }
}

/// Spawn the supervisor task. It connects immediately and keeps the session
/// alive until told to disconnect, every handle is dropped, or the retry
/// budget runs out.
pub fn spawn<T: Transport + 'static>(
    transport: T,
    config: SupervisorConfig,
    topics: &DeviceTopics,
    settings: SharedSettings,
    inbound_tx: mpsc::Sender<InboundMessage>,
    status: StatusEvents,
) -> (SupervisorHandle, JoinHandle<Result<(), SupervisorError>>) {
    let (cmd_tx, cmd_rx) = mpsc::channel::<Command>(64);
    let (state_tx, state_rx) = watch::channel(ConnectionState::Disconnected);

    let handle = SupervisorHandle {
        cmd_tx,
        state_rx,
        settings: settings.clone(),
        error_topic: topics.error.clone(),
    };

    let will = LastWill {
        topic: topics.offline.clone(),
        payload: config.client_id.as_bytes().to_vec(),
        qos: QoS::AtLeastOnce,
        retain: true,
    };
    let online = OutboundMessage::new(
        topics.online.clone(),
        config.client_id.as_bytes().to_vec(),
        QoS::AtLeastOnce,
    )
    .retained();

    let supervisor = ConnectionSupervisor {
        transport,
        client_id: config.client_id,
        connect_timeout: config.connect_timeout,
        subscriptions: topics.subscriptions.clone(),
        will,
        online,
        settings,
        state_tx,
        cmd_rx,
        inbound_tx,
        status,
    };

    let task = tokio::spawn(supervisor.run());
    (handle, task)
}

enum Flow {
    Continue,
    Stop,
}

struct ConnectionSupervisor<T> {
    transport: T,
    client_id: String,
    connect_timeout: Duration,
    subscriptions: Vec<String>,
    will: LastWill,
    online: OutboundMessage,
    settings: SharedSettings,
    state_tx: watch::Sender<ConnectionState>,
    cmd_rx: mpsc::Receiver<Command>,
    inbound_tx: mpsc::Sender<InboundMessage>,
    status: StatusEvents,
}

impl<T: Transport> ConnectionSupervisor<T> {
    async fn run(mut self) -> Result<(), SupervisorError> {
        let mut poll_every = self.settings.read().await.poll_interval();
        let mut ticker = poll_ticker(poll_every);

        loop {
            if !self.state().is_connected() {
                if let Flow::Stop = self.connect().await? {
                    return Ok(());
                }
                ticker.reset();
                continue;
            }

            tokio::select! {
                cmd = self.cmd_rx.recv() => {
                    let Some(cmd) = cmd else {
                        tracing::debug!("all supervisor handles dropped");
                        self.shutdown().await;
                        return Ok(());
                    };
                    if let Flow::Stop = self.handle(cmd).await {
                        return Ok(());
                    }
                }
                _ = ticker.tick() => {
                    self.poll().await;

                    let configured = self.settings.read().await.poll_interval();
                    if configured != poll_every {
                        tracing::info!(poll_interval_ms = configured.as_millis() as u64, "poll interval changed");
                        poll_every = configured;
                        ticker = poll_ticker(poll_every);
                    }
                }
            }
        }
    }

    fn state(&self) -> ConnectionState {
        *self.state_tx.borrow()
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state_tx.send_replace(state);
        if previous != state {
            tracing::debug!(from = %previous, to = %state, "connection state changed");
        }
    }

    /// Run connect attempts until one succeeds or the retry budget is spent.
    async fn connect(&mut self) -> Result<Flow, SupervisorError> {
        let (retries, delay) = {
            let settings = self.settings.read().await;
            (settings.connection_retries(), settings.reconnect_delay())
        };

        for attempt in 1..=retries {
            self.set_state(ConnectionState::Connecting);
            self.status.emit(StatusEvent::Connecting { attempt });
            tracing::info!(attempt, retries, client_id = %self.client_id, "connecting to broker");

            match tokio::time::timeout(self.connect_timeout, self.establish()).await {
                Ok(Ok(())) => {
                    self.set_state(ConnectionState::Connected);
                    self.status.emit(StatusEvent::Connected);
                    tracing::info!(attempt, "connected to broker");
                    return Ok(Flow::Continue);
                }
                Ok(Err(e)) => {
                    tracing::warn!(attempt, retries, error = %e, "connection attempt failed");
                }
                Err(_) => {
                    tracing::warn!(
                        attempt,
                        retries,
                        timeout_secs = self.connect_timeout.as_secs(),
                        "connection attempt timed out"
                    );
                }
            }

            if attempt < retries
                && let Flow::Stop = self.wait_refusing(delay).await
            {
                self.set_state(ConnectionState::Disconnected);
                return Ok(Flow::Stop);
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::error!(attempts = retries, "connection retries exhausted");
        Err(SupervisorError::ConnectExhausted { attempts: retries })
    }

    /// One session setup: arm the will, connect, subscribe, announce.
    async fn establish(&mut self) -> Result<(), TransportError> {
        self.transport.set_last_will(self.will.clone());

        let keep_alive = self.settings.read().await.keep_alive();
        let options = SessionOptions {
            client_id: self.client_id.clone(),
            keep_alive,
        };
        self.transport.connect(&options).await?;

        for filter in &self.subscriptions {
            self.transport.subscribe(filter, QoS::AtLeastOnce).await?;
            tracing::debug!(filter = %filter, "subscribed");
        }

        self.transport.publish(&self.online).await?;
        Ok(())
    }

    /// Sleep between connect attempts while still answering commands.
    async fn wait_refusing(&mut self, delay: Duration) -> Flow {
        let deadline = tokio::time::sleep(delay);
        tokio::pin!(deadline);

        loop {
            tokio::select! {
                _ = &mut deadline => return Flow::Continue,
                cmd = self.cmd_rx.recv() => match cmd {
                    None => return Flow::Stop,
                    Some(Command::Publish { message, reply, .. }) => {
                        tracing::debug!(topic = %message.topic, "publish refused while connecting");
                        let _ = reply.send(false);
                    }
                    Some(Command::Disconnect { reply }) => {
                        let _ = reply.send(());
                        return Flow::Stop;
                    }
                },
            }
        }
    }

    async fn handle(&mut self, cmd: Command) -> Flow {
        match cmd {
            Command::Publish {
                message,
                timeout,
                reply,
            } => {
                let delivered = self.publish(&message, timeout).await;
                // Caller may have given up waiting
                let _ = reply.send(delivered);
                Flow::Continue
            }
            Command::Disconnect { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
                Flow::Stop
            }
        }
    }

    async fn publish(&mut self, message: &OutboundMessage, timeout: Duration) -> bool {
        if !self.state().is_connected() {
            return false;
        }

        match tokio::time::timeout(timeout, self.transport.publish(message)).await {
            Ok(Ok(())) => {
                tracing::debug!(topic = %message.topic, bytes = message.payload.len(), "published");
                true
            }
            Ok(Err(e)) => {
                tracing::warn!(topic = %message.topic, error = %e, "publish failed, session marked unhealthy");
                self.set_state(ConnectionState::Disconnected);
                false
            }
            Err(_) => {
                tracing::warn!(
                    topic = %message.topic,
                    timeout_ms = timeout.as_millis() as u64,
                    "publish timed out, session marked unhealthy"
                );
                self.set_state(ConnectionState::Disconnected);
                false
            }
        }
    }

    /// Pump the session once and hand inbound messages to the router.
    async fn poll(&mut self) {
        let timeout = self.settings.read().await.publish_timeout();

        let messages = match tokio::time::timeout(timeout, self.transport.poll()).await {
            Ok(Ok(messages)) => messages,
            Ok(Err(e)) => {
                tracing::warn!(error = %e, "session poll failed");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
            Err(_) => {
                tracing::warn!("session poll timed out");
                self.set_state(ConnectionState::Disconnected);
                return;
            }
        };

        for message in messages {
            match self.inbound_tx.try_send(message) {
                Ok(()) => {}
                Err(TrySendError::Full(message)) => {
                    tracing::warn!(topic = %message.topic, "inbound queue full, dropping command");
                }
                Err(TrySendError::Closed(message)) => {
                    tracing::debug!(topic = %message.topic, "no router listening, dropping command");
                }
            }
        }
    }

    /// Announce offline and close the session, bounded by the connect timeout.
    async fn shutdown(&mut self) {
        if self.state().is_connected() {
            let offline = OutboundMessage {
                topic: self.will.topic.clone(),
                payload: self.will.payload.clone(),
                qos: self.will.qos,
                retain: true,
            };
            match tokio::time::timeout(self.connect_timeout, self.transport.publish(&offline)).await
            {
                Ok(Ok(())) => tracing::debug!("offline marker published"),
                Ok(Err(e)) => tracing::warn!(error = %e, "failed to publish offline marker"),
                Err(_) => tracing::warn!("timed out publishing offline marker"),
            }

            match tokio::time::timeout(self.connect_timeout, self.transport.disconnect()).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => tracing::warn!(error = %e, "disconnect failed"),
                Err(_) => tracing::warn!("timed out closing session"),
            }
        }

        self.set_state(ConnectionState::Disconnected);
        tracing::info!(client_id = %self.client_id, "disconnected from broker");
    }
}

fn poll_ticker(every: Duration) -> tokio::time::Interval {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    ticker
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use readerlink_core::settings::keys;
    use readerlink_core::{SettingValue, Settings};
    use tokio::sync::RwLock;

    use super::*;
    use crate::testing::{MockTransport, PublishMode, fast_settings};

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        probe: MockTransport,
        handle: SupervisorHandle,
        task: JoinHandle<Result<(), SupervisorError>>,
        inbound_rx: mpsc::Receiver<InboundMessage>,
        topics: DeviceTopics,
        status: StatusEvents,
    }

    fn start_with(settings: Settings, probe: MockTransport) -> Harness {
        let topics = DeviceTopics::from_settings(&settings).unwrap();
        let (inbound_tx, inbound_rx) = mpsc::channel(8);
        let status = StatusEvents::default();
        let (handle, task) = spawn(
            probe.clone(),
            SupervisorConfig {
                client_id: "r1".to_string(),
                connect_timeout: Duration::from_millis(500),
            },
            &topics,
            Arc::new(RwLock::new(settings)),
            inbound_tx,
            status.clone(),
        );
        Harness {
            probe,
            handle,
            task,
            inbound_rx,
            topics,
            status,
        }
    }

    async fn eventually(mut cond: impl FnMut() -> bool) {
        let reached = tokio::time::timeout(WAIT, async {
            while !cond() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(reached.is_ok(), "condition not reached in time");
    }

    async fn connected(h: &Harness) {
        let ok = tokio::time::timeout(WAIT, h.handle.wait_for(ConnectionState::Connected))
            .await
            .unwrap();
        assert!(ok, "supervisor should reach Connected");
    }

    fn read_message(topics: &DeviceTopics) -> OutboundMessage {
        OutboundMessage::new(topics.read.clone(), b"{}".to_vec(), QoS::AtLeastOnce)
    }

    #[tokio::test]
    async fn establishes_session_with_will_subscriptions_and_online_marker() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        let will = h.probe.session_will().expect("will armed before connect");
        assert_eq!(will.topic, "device/r1/events/offline");
        assert_eq!(will.payload, b"r1".to_vec());
        assert!(will.retain);

        assert_eq!(h.probe.subscriptions(), h.topics.subscriptions);

        let online = h.probe.published_to("device/r1/events/online");
        assert_eq!(online.len(), 1);
        assert!(online[0].retain);
        assert_eq!(online[0].payload, b"r1".to_vec());
    }

    #[tokio::test]
    async fn retries_until_connect_succeeds() {
        let probe = MockTransport::new();
        probe.fail_connects(2);
        let h = start_with(fast_settings(), probe);
        let mut events = h.status.subscribe();

        connected(&h).await;
        assert_eq!(h.probe.connect_count(), 3);

        let mut attempts = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let StatusEvent::Connecting { attempt } = event {
                attempts.push(attempt);
            }
        }
        assert_eq!(attempts, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn exhausting_retries_ends_the_task() {
        let probe = MockTransport::new();
        probe.fail_connects(10);
        let mut settings = fast_settings();
        settings.set(keys::CONNECTION_RETRIES, SettingValue::Integer(2));
        let h = start_with(settings, probe);

        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(SupervisorError::ConnectExhausted { attempts: 2 })
        ));
        assert_eq!(h.probe.connect_count(), 2);
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);
    }

    #[tokio::test]
    async fn publishes_are_refused_while_reconnecting() {
        let probe = MockTransport::new();
        probe.fail_connects(1);
        let mut settings = fast_settings();
        settings.set(keys::RECONNECT_DELAY_SECS, SettingValue::Integer(60));
        let h = start_with(settings, probe);

        // Give the first attempt time to fail so the supervisor is sleeping
        tokio::time::sleep(Duration::from_millis(50)).await;
        let delivered = tokio::time::timeout(
            Duration::from_millis(500),
            h.handle.publish(read_message(&h.topics), Duration::from_secs(1)),
        )
        .await
        .expect("refusal should be immediate");

        assert!(!delivered);
        assert!(h.probe.published_to(&h.topics.read).is_empty());
        h.handle.disconnect().await;
    }

    #[tokio::test]
    async fn successful_publish_reaches_broker() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        assert!(h.handle.publish(read_message(&h.topics), WAIT).await);
        assert_eq!(h.probe.published_to(&h.topics.read).len(), 1);
    }

    #[tokio::test]
    async fn failed_publish_triggers_reconnect() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;
        h.probe.set_publish_mode_for(&h.topics.read, PublishMode::Fail);

        assert!(!h.handle.publish(read_message(&h.topics), WAIT).await);

        eventually(|| h.probe.connect_count() == 2 && h.handle.state().is_connected()).await;
    }

    #[tokio::test]
    async fn hung_publish_times_out() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;
        h.probe.set_publish_mode_for(&h.topics.read, PublishMode::Hang);

        let started = tokio::time::Instant::now();
        let delivered = h
            .handle
            .publish(read_message(&h.topics), Duration::from_millis(50))
            .await;

        assert!(!delivered);
        assert!(started.elapsed() < WAIT);
    }

    #[tokio::test]
    async fn inbound_messages_are_forwarded() {
        let mut h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        h.probe.push_inbound(InboundMessage::new(
            "device/r1/manage/reset",
            Vec::new(),
        ));

        let message = tokio::time::timeout(WAIT, h.inbound_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(message.topic, "device/r1/manage/reset");
    }

    #[tokio::test]
    async fn poll_failure_triggers_reconnect() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        h.probe.fail_next_poll();

        eventually(|| h.probe.connect_count() == 2 && h.handle.state().is_connected()).await;
    }

    #[tokio::test]
    async fn report_error_publishes_to_error_topic() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        assert!(h.handle.report_error("bad payload").await);

        let errors = h.probe.published_to("device/r1/events/error");
        assert_eq!(errors.len(), 1);
        assert_eq!(errors[0].payload, b"bad payload".to_vec());
    }

    #[tokio::test]
    async fn disconnect_publishes_offline_and_closes() {
        let h = start_with(fast_settings(), MockTransport::new());
        connected(&h).await;

        h.handle.disconnect().await;

        let offline = h.probe.published_to("device/r1/events/offline");
        assert_eq!(offline.len(), 1);
        assert!(offline[0].retain);
        assert_eq!(h.probe.disconnect_count(), 1);
        assert_eq!(h.handle.state(), ConnectionState::Disconnected);

        let result = tokio::time::timeout(WAIT, h.task).await.unwrap().unwrap();
        assert!(result.is_ok());
    }
}
