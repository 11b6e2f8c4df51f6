// ABOUTME: Reasons the agent process stops, and the exit codes that tell a process supervisor to restart it.
// ABOUTME: Connect exhaustion, reset commands and restart-required setting changes all end in a restart.

use std::fmt;

/// Exit code requesting a restart from the surrounding process supervisor
/// (EX_TEMPFAIL).
pub const RESTART_EXIT_CODE: u8 = 75;

/// Why the agent is shutting down.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RestartReason {
    /// The supervisor used up its connection retry budget.
    ConnectExhausted,
    /// A reset command arrived on the control channel.
    ResetCommand,
    /// A setting that is only read at startup was changed.
    SettingChanged(String),
    /// The process was asked to stop (e.g. ctrl-c). Not a restart.
    Interrupted,
}

impl RestartReason {
    pub fn is_restart(&self) -> bool {
        !matches!(self, RestartReason::Interrupted)
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_restart() { RESTART_EXIT_CODE } else { 0 }
    }
}

impl fmt::Display for RestartReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RestartReason::ConnectExhausted => f.write_str("connection retries exhausted"),
            RestartReason::ResetCommand => f.write_str("reset command received"),
            RestartReason::SettingChanged(name) => write!(f, "setting '{name}' changed"),
            RestartReason::Interrupted => f.write_str("interrupted"),
        }
    }
}
