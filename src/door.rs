//! Per-door state machine.
//!
//! A [`Door`] is polled periodically with the current instant. Each poll samples the closed
//! sensor, runs it through the [`Debouncer`] and evaluates the transition table against the
//! latched confirmed value and the time spent in the current state. Commands are only accepted
//! from the settled state they make sense in and pulse the actuator without blocking: the line is
//! asserted immediately and released by [`Door::release_due`] once the pulse time has passed.

use std::time::{Duration, Instant};

use log::{error, info, trace, warn};

use crate::debounce::Debouncer;
use crate::door_state::{Command, DoorState};
use crate::error::DoorError;
use crate::gpio::{ActuatorBinding, SensorBinding};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct DoorTimings {
    /// Longest a door may take to open fully.
    pub open_time: Duration,
    /// Longest a door may take to close fully.
    pub close_time: Duration,
    /// Longest between an open command and the sensor seeing the door move.
    pub open_start_time: Duration,
    /// Actuator pulse width.
    pub button_pulse_time: Duration,
}

impl Default for DoorTimings {
    fn default() -> Self {
        DoorTimings {
            open_time: Duration::from_millis(10_000),
            close_time: Duration::from_millis(10_000),
            open_start_time: Duration::from_millis(4_000),
            button_pulse_time: Duration::from_millis(300),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Transition {
    pub index: u32,
    pub from: DoorState,
    pub to: DoorState,
}

pub struct Door {
    index: u32,
    state: DoorState,
    debouncer: Debouncer,
    closed_sensor: Option<SensorBinding>,
    open_actuator: Option<ActuatorBinding>,
    close_actuator: Option<ActuatorBinding>,
    timings: DoorTimings,
    last_transition: Instant,
    fault: Option<DoorError>,
    release_at: Option<Instant>,
}

impl Door {
    pub fn new(index: u32, now: Instant) -> Self {
        Door {
            index,
            state: DoorState::InitSensing,
            debouncer: Debouncer::new(),
            closed_sensor: None,
            open_actuator: None,
            close_actuator: None,
            timings: DoorTimings::default(),
            last_transition: now,
            fault: None,
            release_at: None,
        }
    }

    pub fn with_closed_sensor(mut self, sensor: SensorBinding) -> Self {
        self.closed_sensor = Some(sensor);
        self
    }

    pub fn with_open_actuator(mut self, actuator: ActuatorBinding) -> Self {
        self.open_actuator = Some(actuator);
        self
    }

    /// Without a close actuator, close commands pulse the open actuator.
    pub fn with_close_actuator(mut self, actuator: ActuatorBinding) -> Self {
        self.close_actuator = Some(actuator);
        self
    }

    pub fn with_timings(mut self, timings: DoorTimings) -> Self {
        self.timings = timings;
        self
    }

    pub fn with_debouncer(mut self, debouncer: Debouncer) -> Self {
        self.debouncer = debouncer;
        self
    }

    pub fn index(&self) -> u32 {
        self.index
    }

    pub fn state(&self) -> DoorState {
        self.state
    }

    pub fn timings(&self) -> &DoorTimings {
        &self.timings
    }

    pub fn last_transition(&self) -> Instant {
        self.last_transition
    }

    /// A door without a closed sensor can never track its state.
    pub fn fault(&self) -> bool {
        self.fault.is_some() || self.closed_sensor.is_none()
    }

    pub fn needs_fast_polling(&self) -> bool {
        self.state.needs_fast_polling()
    }

    /// Samples the closed sensor and advances the state machine.
    pub fn poll(&mut self, now: Instant) -> Result<Option<Transition>, DoorError> {
        let closed = match &self.closed_sensor {
            Some(sensor) => sensor.is_active(),
            None => return Err(self.missing_sensor()),
        };
        trace!("Door({}): closed={}", self.index, closed);
        self.update(closed, now)
    }

    /// Advances the state machine with a closed sample (polarity already applied).
    ///
    /// Samples are refused while no closed sensor is bound, so such a door never leaves
    /// its current state on sensor input.
    pub fn update(
        &mut self,
        closed: bool,
        now: Instant,
    ) -> Result<Option<Transition>, DoorError> {
        use DoorState::*;

        if self.closed_sensor.is_none() {
            return Err(self.missing_sensor());
        }
        self.debouncer.sample(closed);
        let confirmed = self.debouncer.confirmed();
        let elapsed = now.saturating_duration_since(self.last_transition);
        let timings = self.timings;

        let new_state = match (self.state, confirmed) {
            (InitSensing, Some(true)) => Closed,
            (InitSensing, Some(false)) => Open,
            (Closed, Some(false)) => OpeningSensed,
            (Open, Some(true)) => Closed,
            (OpenStart, Some(false)) => Opening,
            (OpenStart, _) if elapsed > timings.open_start_time => {
                self.warn_timeout(elapsed);
                Closed
            }
            (Opening | OpeningSensed, Some(true)) => Closed,
            (Opening | OpeningSensed, _) if elapsed > timings.open_time => Open,
            (Closing, Some(true)) => Closed,
            (Closing, _) if elapsed > timings.close_time => {
                self.warn_timeout(elapsed);
                Open
            }
            (state, _) => state,
        };

        if new_state != self.state {
            Ok(Some(self.set_state(new_state, now)))
        } else {
            Ok(None)
        }
    }

    pub fn command(&mut self, command: Command, now: Instant) -> Result<Transition, DoorError> {
        let target = match (command, self.state) {
            (Command::Open, DoorState::Closed) => DoorState::OpenStart,
            (Command::Close, DoorState::Open) => DoorState::Closing,
            (command, state) => {
                let err = DoorError::InvalidStateForCommand {
                    index: self.index,
                    command,
                    state,
                };
                error!("{}", err);
                return Err(err);
            }
        };
        self.pulse(command, now);
        Ok(self.set_state(target, now))
    }

    pub fn command_open(&mut self, now: Instant) -> Result<Transition, DoorError> {
        self.command(Command::Open, now)
    }

    pub fn command_close(&mut self, now: Instant) -> Result<Transition, DoorError> {
        self.command(Command::Close, now)
    }

    /// When the asserted actuator, if any, has to be released.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.release_at
    }

    /// Ends an actuator pulse whose time is up. Returns whether a line was released.
    pub fn release_due(&mut self, now: Instant) -> bool {
        match self.release_at {
            Some(at) if now >= at => {
                self.release_all();
                true
            }
            _ => false,
        }
    }

    /// Drives every actuator to its inactive level.
    pub fn release_all(&mut self) {
        let actuators = self
            .open_actuator
            .iter_mut()
            .chain(self.close_actuator.iter_mut());
        for actuator in actuators.filter(|a| a.is_asserted()) {
            actuator.release();
        }
        if self.release_at.take().is_some() {
            trace!("Door({}): actuator released", self.index);
        }
    }

    fn pulse(&mut self, command: Command, now: Instant) {
        self.release_all();
        let index = self.index;
        let actuator = match command {
            Command::Close if self.close_actuator.is_some() => self.close_actuator.as_mut(),
            _ => self.open_actuator.as_mut(),
        };
        match actuator {
            Some(actuator) => {
                actuator.assert();
                self.release_at = Some(now + self.timings.button_pulse_time);
                trace!("Door({}): actuator asserted for {}", index, command);
            }
            None => warn!("Door({}): no actuator bound, {} not sent", index, command),
        }
    }

    fn missing_sensor(&mut self) -> DoorError {
        let err = DoorError::MissingSensorBinding { index: self.index };
        self.fault = Some(err.clone());
        err
    }

    fn set_state(&mut self, new_state: DoorState, now: Instant) -> Transition {
        info!(
            "Door({}): state changed {} -> {}",
            self.index, self.state, new_state
        );
        let transition = Transition {
            index: self.index,
            from: self.state,
            to: new_state,
        };
        self.state = new_state;
        self.last_transition = now;
        transition
    }

    fn warn_timeout(&self, elapsed: Duration) {
        let err = DoorError::ActuationTimeout {
            index: self.index,
            state: self.state,
            elapsed,
        };
        warn!("{}", err);
    }
}
