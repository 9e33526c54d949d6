//! Error types for the actuator control core.
//!
//! Bootstrap and config loading use `anyhow`; everything the dispatcher and
//! the watering sessions can refuse or fail with is spelled out here.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegistryError {
    #[error("unknown channel '{0}'")]
    NotFound(String),
    #[error("channel '{0}' is defined more than once")]
    Ambiguous(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LockError {
    #[error("pin {0} is not locked")]
    AlreadyFree(u8),
    #[error("lock for pin {0} is closed")]
    Closed(u8),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionError {
    #[error("channel '{0}' is already watering")]
    AlreadyRunning(String),
    #[error("channel '{0}' is not watering")]
    NotRunning(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RelayError {
    #[error("pin {0} is not registered on the relay board")]
    UnknownPin(u8),
    #[error("relay driver fault on pin {pin}: {reason}")]
    Driver { pin: u8, reason: String },
}

#[derive(Debug, Clone, PartialEq, Error)]
pub enum SensorError {
    #[error("moisture sensor unavailable on input {input}: {reason}")]
    Unavailable { input: u8, reason: String },
}

/// A failure that ended a watering session early. The pin has already
/// been driven off by the time this is reported.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SessionFault {
    #[error(transparent)]
    Relay(#[from] RelayError),
    #[error(transparent)]
    Lock(#[from] LockError),
}

/// Why the dispatcher refused (or could not complete) a command.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    #[error("unknown command '{0}'")]
    UnknownCommand(String),
    #[error(transparent)]
    Channel(#[from] RegistryError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("shutting down, command for '{0}' refused")]
    ShuttingDown(String),
}
