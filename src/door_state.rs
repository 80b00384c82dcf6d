use std::fmt;
use std::str::FromStr;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum DoorState {
    InitSensing,
    Closed,
    Open,
    /// Moving without a command from us, e.g. the wall button or a remote.
    OpeningSensed,
    /// Open command sent, waiting for the sensor to see the door leave closed.
    OpenStart,
    Opening,
    Closing,
}

impl DoorState {
    /// Transient states are bounded by a timeout and want the fast poll cadence.
    pub fn needs_fast_polling(self) -> bool {
        use DoorState::*;
        match self {
            OpenStart | Opening | OpeningSensed | Closing => true,
            InitSensing | Closed | Open => false,
        }
    }

    /// State as published on the bus. Nothing is published before the first confirmation.
    pub fn reported(self) -> Option<ReportedState> {
        use DoorState::*;
        match self {
            InitSensing => None,
            Open => Some(ReportedState::Open),
            Opening | OpeningSensed => Some(ReportedState::Opening),
            Closed | OpenStart => Some(ReportedState::Closed),
            Closing => Some(ReportedState::Closing),
        }
    }
}

impl fmt::Display for DoorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DoorState::InitSensing => f.write_str("InitSensing"),
            DoorState::Closed => f.write_str("Closed"),
            DoorState::Open => f.write_str("Open"),
            DoorState::OpeningSensed => f.write_str("OpeningSensed"),
            DoorState::OpenStart => f.write_str("OpenStart"),
            DoorState::Opening => f.write_str("Opening"),
            DoorState::Closing => f.write_str("Closing"),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ReportedState {
    Open,
    Opening,
    Closed,
    Closing,
}

impl ReportedState {
    pub fn as_str(self) -> &'static str {
        match self {
            ReportedState::Open => "open",
            ReportedState::Opening => "opening",
            ReportedState::Closed => "closed",
            ReportedState::Closing => "closing",
        }
    }
}

impl fmt::Display for ReportedState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Command {
    Open,
    Close,
}

impl FromStr for Command {
    type Err = ();

    fn from_str(payload: &str) -> Result<Self, Self::Err> {
        match payload {
            "open" => Ok(Command::Open),
            "close" => Ok(Command::Close),
            _ => Err(()),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Command::Open => f.write_str("open"),
            Command::Close => f.write_str("close"),
        }
    }
}
