// ABOUTME: Runtime for the readerlink edge agent: keeps a broker session alive and drains the record queue through it.
// ABOUTME: Wires the connection supervisor, delivery loop, command router and producer into one running agent.

pub mod agent;
pub mod config;
pub mod delivery;
pub mod handlers;
pub mod mqtt;
pub mod producer;
pub mod router;
pub mod supervisor;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod topics;
pub mod transport;

pub use agent::{AgentError, AgentOptions, RunningAgent, start};
pub use config::{AgentConfig, ConfigError};
pub use delivery::{DeliveryLoop, TickOutcome};
pub use handlers::{
    ConfigHandler, HandlerError, ResetHandler, RestartRequester, SettingsHandler,
    WhitelistAction, WhitelistHandler,
};
pub use mqtt::MqttTransport;
pub use producer::Producer;
pub use router::{CommandRouter, Dispatched, ProtocolError, RouterHandlers};
pub use supervisor::{SupervisorConfig, SupervisorError, SupervisorHandle};
pub use topics::DeviceTopics;
pub use transport::{
    InboundMessage, LastWill, OutboundMessage, QoS, SessionOptions, Transport, TransportError,
};
