use std::time::Duration;

use crate::door_state::{Command, DoorState};

/// Errors raised by a single door. None of these are fatal to the agent.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum DoorError {
    #[error("Door({index}): no closed sensor")]
    MissingSensorBinding { index: u32 },

    #[error("Door({index}): can't {command} in {state} state")]
    InvalidStateForCommand {
        index: u32,
        command: Command,
        state: DoorState,
    },

    #[error("Door({index}): {state} timed out after {}ms", .elapsed.as_millis())]
    ActuationTimeout {
        index: u32,
        state: DoorState,
        elapsed: Duration,
    },

    #[error("no door with index {index}")]
    UnknownDoor { index: u32 },
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("unable to read {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Json(#[from] json::Error),

    #[error("{key} must be [chip, line, active_level]")]
    BadLine { key: String },

    #[error("{key} must be a non-negative number of milliseconds")]
    BadTime { key: String },

    #[error("{key} must be between 1 and 32 samples")]
    BadDepth { key: String },

    #[error("door index {0} is not a valid index")]
    BadIndex(String),

    #[error("door index {0} configured more than once")]
    DuplicateIndex(u32),

    #[error("GPIO chip {0} is not supported, only gpiochip0 is addressable")]
    UnsupportedChip(String),

    #[error("mqtt: {key} has the wrong type")]
    BadMqtt { key: &'static str },
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("GPIO error: {0}")]
    Gpio(#[from] rppal::gpio::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
