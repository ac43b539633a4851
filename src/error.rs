//! Error types for control-loop operations

use std::time::Duration;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, CloneEnvError>;

#[derive(Error, Debug)]
pub enum CloneEnvError {
    #[error("Not connected to the robot, call connect() first")]
    NotConnected,

    #[error("Connection to {hostname} failed: {reason}")]
    Connect { reason: String, hostname: String },

    #[error("Shape mismatch for {kind}: expected {expected} values, got {actual}")]
    Shape {
        kind: &'static str,
        expected: usize,
        actual: usize,
    },

    #[error("Invalid action: {0}")]
    InvalidAction(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Reset failed: {0}")]
    Reset(String),

    #[error("A step is already in flight on this environment")]
    StepInFlight,

    #[error("A reset is in progress, steps are not accepted until it completes")]
    ResetInProgress,

    #[error("No observation received within {0:?}")]
    ObservationTimeout(Duration),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl CloneEnvError {
    /// Whether this error means the session is gone and the caller must reconnect.
    pub fn requires_reconnect(&self) -> bool {
        matches!(self, Self::NotConnected | Self::Transport(_))
    }

    pub(crate) fn transport(err: anyhow::Error) -> Self {
        Self::Transport(format!("{:#}", err))
    }
}
