// Error types for the console core
//
// Transport errors live next to the transport in drivers::modbus.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to parse config file: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SupervisorError {
    #[error("Invalid address {0}")]
    InvalidAddress(String),

    #[error("Connection attempt limit reached ({0}), reset required")]
    TooManyAttempts(u32),

    #[error("Connection attempt timed out")]
    Timeout,

    #[error("Connection failed: {0}")]
    ConnectFailed(String),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    #[error("Not connected to the controller")]
    NotConnected,

    #[error("A test is already running")]
    TestAlreadyRunning,

    #[error("Unknown test mode {0}")]
    UnknownMode(u16),
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    #[error("Session {0} not found")]
    SessionNotFound(i64),

    #[error("Session has no id assigned")]
    UnassignedSession,

    #[error("Persistence worker is not running")]
    WorkerStopped,

    #[error("Storage backend error: {0}")]
    Backend(String),
}
