// ABOUTME: Assembles the supervisor, delivery loop and command router into one running agent.
// ABOUTME: RunningAgent waits for the first restart trigger and then performs the ordered shutdown.

use std::sync::Arc;
use std::time::Duration;

use readerlink_core::{RestartReason, Settings, SharedSettings, StatusEvents, TopicError};
use readerlink_store::{RecordStore, SettingsFile};
use thiserror::Error;
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;

use crate::config::AgentConfig;
use crate::delivery::DeliveryLoop;
use crate::handlers::{RestartRequester, SettingsHandler};
use crate::producer::Producer;
use crate::router::{CommandRouter, RouterHandlers};
use crate::supervisor::{self, SupervisorConfig, SupervisorError, SupervisorHandle};
use crate::topics::DeviceTopics;
use crate::transport::Transport;

const INBOUND_CAPACITY: usize = 32;

/// Errors that prevent the agent from starting.
#[derive(Debug, Error)]
pub enum AgentError {
    #[error("invalid topic configuration: {0}")]
    Topics(#[from] TopicError),
}

/// Process-level options of a running agent.
#[derive(Debug, Clone)]
pub struct AgentOptions {
    /// Broker client id; defaults to the device id.
    pub client_id: Option<String>,
    pub connect_timeout: Duration,
}

impl AgentOptions {
    pub fn from_config(config: &AgentConfig) -> Self {
        Self {
            client_id: None,
            connect_timeout: config.connect_timeout,
        }
    }
}

/// A started agent and the handles other code needs to talk to it.
pub struct RunningAgent {
    pub supervisor: SupervisorHandle,
    pub producer: Producer,
    pub status: StatusEvents,
    pub settings: SharedSettings,
    pub store: Arc<RecordStore>,
    connect_timeout: Duration,
    restart_rx: mpsc::Receiver<RestartReason>,
    supervisor_task: Option<JoinHandle<Result<(), SupervisorError>>>,
    delivery_task: JoinHandle<()>,
    router_task: JoinHandle<()>,
}

/// Start every agent task. The supervisor begins connecting immediately.
pub fn start<T: Transport + 'static>(
    transport: T,
    store: Arc<RecordStore>,
    settings_file: SettingsFile,
    settings: Settings,
    options: AgentOptions,
) -> Result<RunningAgent, AgentError> {
    let topics = DeviceTopics::from_settings(&settings)?;
    let client_id = options
        .client_id
        .unwrap_or_else(|| settings.device_id().to_string());
    let initial = settings.clone();
    let shared: SharedSettings = Arc::new(RwLock::new(settings));
    let status = StatusEvents::default();

    let (inbound_tx, inbound_rx) = mpsc::channel(INBOUND_CAPACITY);
    let (handle, supervisor_task) = supervisor::spawn(
        transport,
        SupervisorConfig {
            client_id: client_id.clone(),
            connect_timeout: options.connect_timeout,
        },
        &topics,
        Arc::clone(&shared),
        inbound_tx,
        status.clone(),
    );

    let (restart_tx, restart_rx) = mpsc::channel(4);
    let settings_handler = Arc::new(SettingsHandler::new(Arc::clone(&shared), settings_file));
    let handlers = RouterHandlers {
        whitelist: settings_handler.clone(),
        config: settings_handler,
        reset: Arc::new(RestartRequester::new(restart_tx)),
    };
    let router = CommandRouter::new(&initial, handlers, handle.clone(), status.clone())?;
    let router_task = tokio::spawn(router.run(inbound_rx));

    let delivery = DeliveryLoop::new(
        Arc::clone(&store),
        handle.clone(),
        Arc::clone(&shared),
        &topics,
        status.clone(),
    );
    let delivery_task = tokio::spawn(delivery.run());

    tracing::info!(
        device_id = %initial.device_id(),
        client_id = %client_id,
        read_topic = %topics.read,
        "agent started"
    );

    Ok(RunningAgent {
        supervisor: handle,
        producer: Producer::new(Arc::clone(&store), Arc::clone(&shared)),
        status,
        settings: shared,
        store,
        connect_timeout: options.connect_timeout,
        restart_rx,
        supervisor_task: Some(supervisor_task),
        delivery_task,
        router_task,
    })
}

impl RunningAgent {
    /// Wait for the first restart trigger: a reset command, a restart-bound
    /// setting change, or the supervisor giving up on the broker.
    pub async fn wait_for_restart(&mut self) -> RestartReason {
        let Some(supervisor_task) = self.supervisor_task.as_mut() else {
            return self
                .restart_rx
                .recv()
                .await
                .unwrap_or(RestartReason::Interrupted);
        };

        let finished = tokio::select! {
            reason = self.restart_rx.recv() => return reason.unwrap_or(RestartReason::Interrupted),
            result = supervisor_task => result,
        };
        self.supervisor_task = None;

        match finished {
            Ok(Err(SupervisorError::ConnectExhausted { .. })) => RestartReason::ConnectExhausted,
            Ok(Ok(())) => RestartReason::Interrupted,
            Err(e) => {
                tracing::error!(error = %e, "supervisor task failed");
                RestartReason::ConnectExhausted
            }
        }
    }

    /// Stop every task. Delivery stops first so no new publish starts; the
    /// supervisor then announces offline and closes the session.
    pub async fn shutdown(mut self, reason: &RestartReason) {
        tracing::info!(%reason, "agent shutting down");
        self.delivery_task.abort();

        if let Some(task) = self.supervisor_task.take() {
            let graceful = tokio::time::timeout(
                self.connect_timeout * 2,
                self.supervisor.disconnect(),
            )
            .await;
            if graceful.is_err() {
                tracing::warn!("supervisor did not stop in time");
            }
            task.abort();
        }

        self.router_task.abort();
    }
}
