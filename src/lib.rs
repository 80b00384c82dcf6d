pub mod bus;
pub mod config;
pub mod debounce;
pub mod door;
mod door_state;
pub mod error;
pub mod gpio;
pub mod mqtt;
pub mod scheduler;
#[cfg(test)]
mod testing;

pub use bus::{Bus, BusCommand};
pub use config::Config;
pub use door::{Door, DoorTimings, Transition};
pub use door_state::{Command, DoorState, ReportedState};
pub use error::{ConfigError, DoorError, Error};
pub use scheduler::{Cadence, Rate, Registry, Scheduler};
