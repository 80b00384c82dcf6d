//! Adaptive poll scheduler.
//!
//! Every door is polled in index order on each tick. The tick interval is fast while any door is
//! in a transient state (and during the start-up warm-up) and slow once all doors have settled.
//! The scheduler also routes bus commands to doors and ends actuator pulses on time, so the loop
//! in [`Scheduler::run`] only ever sleeps inside [`Bus::wait`].

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info, trace};

use crate::bus::{Bus, BusCommand};
use crate::door::{Door, Transition};
use crate::error::{ConfigError, DoorError};

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Cadence {
    pub fast: Duration,
    pub slow: Duration,
    /// Fast polling is kept up this long after start-up so sensors settle quickly.
    pub warmup: Duration,
}

impl Default for Cadence {
    fn default() -> Self {
        Cadence {
            fast: Duration::from_millis(250),
            slow: Duration::from_secs(3),
            warmup: Duration::from_secs(5),
        }
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Rate {
    Fast,
    Slow,
}

impl fmt::Display for Rate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Rate::Fast => f.write_str("fast"),
            Rate::Slow => f.write_str("slow"),
        }
    }
}

/// Doors keyed by index. Iteration is in index order.
#[derive(Default)]
pub struct Registry {
    doors: BTreeMap<u32, Door>,
}

impl Registry {
    pub fn new() -> Self {
        Registry::default()
    }

    pub fn insert(&mut self, door: Door) -> Result<(), ConfigError> {
        let index = door.index();
        if self.doors.contains_key(&index) {
            return Err(ConfigError::DuplicateIndex(index));
        }
        self.doors.insert(index, door);
        Ok(())
    }

    pub fn get(&self, index: u32) -> Option<&Door> {
        self.doors.get(&index)
    }

    pub fn get_mut(&mut self, index: u32) -> Option<&mut Door> {
        self.doors.get_mut(&index)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Door> {
        self.doors.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Door> {
        self.doors.values_mut()
    }

    pub fn len(&self) -> usize {
        self.doors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.doors.is_empty()
    }
}

pub struct Scheduler {
    registry: Registry,
    cadence: Cadence,
    rate: Rate,
    started: Instant,
    next_tick: Instant,
    faults_reported: BTreeSet<u32>,
}

impl Scheduler {
    pub fn new(registry: Registry, cadence: Cadence, now: Instant) -> Self {
        Scheduler {
            registry,
            cadence,
            rate: Rate::Fast,
            started: now,
            next_tick: now + cadence.fast,
            faults_reported: BTreeSet::new(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn rate(&self) -> Rate {
        self.rate
    }

    pub fn interval(&self) -> Duration {
        match self.rate {
            Rate::Fast => self.cadence.fast,
            Rate::Slow => self.cadence.slow,
        }
    }

    pub fn next_tick(&self) -> Instant {
        self.next_tick
    }

    /// The earliest of the next tick and any pending actuator release.
    pub fn next_wake(&self) -> Instant {
        self.registry
            .iter()
            .filter_map(Door::next_deadline)
            .fold(self.next_tick, Instant::min)
    }

    /// Publishes discovery records and any state already known.
    pub fn announce<B: Bus>(&self, bus: &mut B) {
        for door in self.registry.iter() {
            bus.announce(door.index());
            if let Some(state) = door.state().reported() {
                bus.publish_state(door.index(), state);
            }
        }
    }

    /// Polls every door once and picks the next interval.
    pub fn tick<B: Bus>(&mut self, now: Instant, bus: &mut B) -> Vec<Transition> {
        trace!("Poll timer");
        let mut transitions = Vec::new();
        let mut fast = now.saturating_duration_since(self.started) < self.cadence.warmup;

        for door in self.registry.iter_mut() {
            match door.poll(now) {
                Ok(Some(transition)) => {
                    if let Some(state) = transition.to.reported() {
                        bus.publish_state(transition.index, state);
                    }
                    transitions.push(transition);
                }
                Ok(None) => {}
                Err(err) => {
                    if self.faults_reported.insert(door.index()) {
                        error!("{}", err);
                        bus.publish_fault(door.index(), &err);
                    } else {
                        debug!("{}", err);
                    }
                }
            }
            fast |= door.needs_fast_polling();
        }
        bus.maintain();

        self.set_rate(if fast { Rate::Fast } else { Rate::Slow });
        self.next_tick = now + self.interval();
        transitions
    }

    /// Routes a command to its door and re-publishes the door's state.
    pub fn dispatch<B: Bus>(
        &mut self,
        command: BusCommand,
        now: Instant,
        bus: &mut B,
    ) -> Result<Transition, DoorError> {
        let index = command.index;
        let door = match self.registry.get_mut(index) {
            Some(door) => door,
            None => {
                let err = DoorError::UnknownDoor { index };
                error!("{}, ignoring {} command", err, command.command);
                return Err(err);
            }
        };
        info!("Door({}): {} command", index, command.command);
        let result = door.command(command.command, now);
        if let Some(state) = door.state().reported() {
            bus.publish_state(index, state);
        }
        if door.needs_fast_polling() && self.rate == Rate::Slow {
            self.set_rate(Rate::Fast);
            self.next_tick = self.next_tick.min(now + self.cadence.fast);
        }
        result
    }

    /// Ends due actuator pulses and runs the tick if it is due.
    pub fn service<B: Bus>(&mut self, now: Instant, bus: &mut B) -> Vec<Transition> {
        for door in self.registry.iter_mut() {
            door.release_due(now);
        }
        if now >= self.next_tick {
            self.tick(now, bus)
        } else {
            Vec::new()
        }
    }

    /// Drives the doors until `term` is set, then releases every actuator.
    pub fn run<B: Bus>(&mut self, bus: &mut B, term: &AtomicBool) {
        self.announce(bus);
        while !term.load(Ordering::Relaxed) {
            self.service(Instant::now(), bus);
            if let Some(command) = bus.wait(self.next_wake()) {
                // Rejections are logged by the door and reported through the state publish.
                let _ = self.dispatch(command, Instant::now(), bus);
            }
        }
        self.shutdown();
    }

    pub fn shutdown(&mut self) {
        for door in self.registry.iter_mut() {
            door.release_all();
        }
        info!("main: all actuators released");
    }

    fn set_rate(&mut self, rate: Rate) {
        if rate != self.rate {
            info!("main: start {} polling", rate);
            self.rate = rate;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::recording::{Published, RecordingBus};
    use crate::door_state::{Command, DoorState, ReportedState};
    use crate::gpio::fake::{FakeInput, FakeOutput};
    use crate::gpio::{ActuatorBinding, SensorBinding};

    struct Fleet {
        scheduler: Scheduler,
        sensors: Vec<FakeInput>,
        bus: RecordingBus,
        now: Instant,
    }

    /// Doors 1..=count with active-high sensors, all reading closed.
    fn fleet(count: u32) -> Fleet {
        let now = Instant::now();
        let mut registry = Registry::new();
        let mut sensors = Vec::new();
        for index in 1..=count {
            let sensor = FakeInput::new(true);
            let door = Door::new(index, now)
                .with_closed_sensor(SensorBinding::new(Box::new(sensor.clone()), true))
                .with_open_actuator(ActuatorBinding::new(Box::new(FakeOutput::new()), true));
            registry.insert(door).unwrap();
            sensors.push(sensor);
        }
        Fleet {
            scheduler: Scheduler::new(registry, Cadence::default(), now),
            sensors,
            bus: RecordingBus::new(),
            now,
        }
    }

    impl Fleet {
        fn step(&mut self) -> Vec<Transition> {
            self.now = self.scheduler.next_wake();
            self.scheduler.service(self.now, &mut self.bus)
        }

        fn run_until(&mut self, elapsed: Duration) {
            let until = self.now + elapsed;
            while self.scheduler.next_wake() <= until {
                self.step();
            }
        }
    }

    #[test]
    fn duplicate_index_is_rejected() {
        let now = Instant::now();
        let mut registry = Registry::new();
        registry.insert(Door::new(1, now)).unwrap();
        assert!(matches!(
            registry.insert(Door::new(1, now)),
            Err(ConfigError::DuplicateIndex(1))
        ));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn polls_in_index_order_and_publishes_changes() {
        let now = Instant::now();
        let mut registry = Registry::new();
        for index in [3, 1, 2] {
            let door = Door::new(index, now)
                .with_closed_sensor(SensorBinding::new(Box::new(FakeInput::new(true)), true));
            registry.insert(door).unwrap();
        }
        let mut scheduler = Scheduler::new(registry, Cadence::default(), now);
        let mut bus = RecordingBus::new();
        for i in 1..=4 {
            scheduler.tick(now + Duration::from_millis(250) * i, &mut bus);
        }
        assert_eq!(
            bus.take(),
            vec![
                Published::State(1, ReportedState::Closed),
                Published::State(2, ReportedState::Closed),
                Published::State(3, ReportedState::Closed),
            ]
        );
        assert_eq!(bus.maintained, 4);
    }

    #[test]
    fn warmup_is_fast_then_slows_down() {
        let mut fleet = fleet(2);
        assert_eq!(fleet.scheduler.rate(), Rate::Fast);
        fleet.run_until(Duration::from_secs(4));
        assert_eq!(fleet.scheduler.rate(), Rate::Fast);
        fleet.run_until(Duration::from_secs(2));
        assert_eq!(fleet.scheduler.rate(), Rate::Slow);
        assert_eq!(fleet.scheduler.interval(), Duration::from_secs(3));
    }

    #[test]
    fn cadence_follows_the_fleet() {
        let mut fleet = fleet(2);
        fleet.run_until(Duration::from_secs(6));
        assert_eq!(fleet.scheduler.rate(), Rate::Slow);
        fleet.bus.take();

        let command = BusCommand {
            index: 2,
            command: Command::Open,
        };
        let transition = fleet
            .scheduler
            .dispatch(command, fleet.now, &mut fleet.bus)
            .unwrap();
        assert_eq!(transition.to, DoorState::OpenStart);
        assert_eq!(fleet.scheduler.rate(), Rate::Fast);
        assert!(fleet.scheduler.next_tick() <= fleet.now + Duration::from_millis(250));
        assert_eq!(
            fleet.bus.take(),
            vec![Published::State(2, ReportedState::Closed)]
        );

        // The door never moves, so the open start times out and the fleet settles again.
        fleet.run_until(Duration::from_secs(5));
        assert_eq!(
            fleet.scheduler.registry().get(2).map(Door::state),
            Some(DoorState::Closed)
        );
        assert_eq!(fleet.scheduler.rate(), Rate::Slow);
    }

    #[test]
    fn manual_opening_switches_to_fast_polling() {
        let mut fleet = fleet(2);
        fleet.run_until(Duration::from_secs(6));
        assert_eq!(fleet.scheduler.rate(), Rate::Slow);

        fleet.sensors[0].set(false);
        let mut transitions = Vec::new();
        for _ in 0..4 {
            transitions.extend(fleet.step());
        }
        assert_eq!(
            transitions,
            vec![Transition {
                index: 1,
                from: DoorState::Closed,
                to: DoorState::OpeningSensed
            }]
        );
        assert_eq!(fleet.scheduler.rate(), Rate::Fast);
        assert!(fleet
            .bus
            .published
            .contains(&Published::State(1, ReportedState::Opening)));
    }

    #[test]
    fn pulse_release_wakes_the_loop() {
        let mut fleet = fleet(1);
        fleet.run_until(Duration::from_secs(6));
        let command = BusCommand {
            index: 1,
            command: Command::Open,
        };
        fleet
            .scheduler
            .dispatch(command, fleet.now, &mut fleet.bus)
            .unwrap();
        // Fast tick at +250ms comes first, then the release at +300ms.
        assert_eq!(
            fleet.scheduler.next_wake(),
            fleet.now + Duration::from_millis(250)
        );
        fleet.step();
        assert_eq!(
            fleet.scheduler.next_wake(),
            fleet.now + Duration::from_millis(50)
        );
        fleet.step();
        assert_eq!(
            fleet.scheduler.registry().get(1).and_then(Door::next_deadline),
            None
        );
    }

    #[test]
    fn unknown_door_is_ignored() {
        let mut fleet = fleet(1);
        let command = BusCommand {
            index: 9,
            command: Command::Close,
        };
        assert_eq!(
            fleet.scheduler.dispatch(command, fleet.now, &mut fleet.bus),
            Err(DoorError::UnknownDoor { index: 9 })
        );
        assert!(fleet.bus.published.is_empty());
    }

    #[test]
    fn rejected_command_republishes_state() {
        let mut fleet = fleet(1);
        fleet.run_until(Duration::from_secs(2));
        fleet.bus.take();
        let command = BusCommand {
            index: 1,
            command: Command::Close,
        };
        assert!(fleet
            .scheduler
            .dispatch(command, fleet.now, &mut fleet.bus)
            .is_err());
        assert_eq!(
            fleet.bus.take(),
            vec![Published::State(1, ReportedState::Closed)]
        );
    }

    #[test]
    fn fault_is_notified_once() {
        let now = Instant::now();
        let mut registry = Registry::new();
        registry.insert(Door::new(7, now)).unwrap();
        let mut scheduler = Scheduler::new(registry, Cadence::default(), now);
        let mut bus = RecordingBus::new();
        for i in 1..=10 {
            scheduler.tick(now + Duration::from_secs(1) * i, &mut bus);
        }
        assert_eq!(
            bus.published,
            vec![Published::Fault(
                7,
                DoorError::MissingSensorBinding { index: 7 }
            )]
        );
        assert_eq!(bus.maintained, 10);
        assert_eq!(scheduler.rate(), Rate::Slow);
    }

    #[test]
    fn announce_publishes_discovery_for_every_door() {
        let mut fleet = fleet(2);
        fleet.scheduler.announce(&mut fleet.bus);
        assert_eq!(
            fleet.bus.take(),
            vec![Published::Discovery(1), Published::Discovery(2)]
        );
    }

    /// Stops the loop once the queued commands are used up.
    struct OneShot<'a> {
        inner: RecordingBus,
        term: &'a AtomicBool,
    }

    impl Bus for OneShot<'_> {
        fn publish_state(&mut self, index: u32, state: ReportedState) {
            self.inner.publish_state(index, state)
        }

        fn publish_fault(&mut self, index: u32, fault: &DoorError) {
            self.inner.publish_fault(index, fault)
        }

        fn announce(&mut self, index: u32) {
            self.inner.announce(index)
        }

        fn maintain(&mut self) {
            self.inner.maintain()
        }

        fn wait(&mut self, deadline: Instant) -> Option<BusCommand> {
            let command = self.inner.wait(deadline);
            if command.is_none() {
                self.term.store(true, Ordering::Relaxed);
            }
            command
        }
    }

    #[test]
    fn run_serves_commands_and_releases_on_exit() {
        let mut fleet = fleet(1);
        fleet.run_until(Duration::from_secs(2));
        fleet.bus.take();

        let term = AtomicBool::new(false);
        let mut bus = OneShot {
            inner: std::mem::take(&mut fleet.bus),
            term: &term,
        };
        bus.inner.commands.push_back(BusCommand {
            index: 1,
            command: Command::Open,
        });
        fleet.scheduler.run(&mut bus, &term);

        assert_eq!(
            bus.inner.take(),
            vec![
                Published::Discovery(1),
                Published::State(1, ReportedState::Closed),
                Published::State(1, ReportedState::Closed),
            ]
        );
        let door = fleet.scheduler.registry().get(1).unwrap();
        assert_eq!(door.state(), DoorState::OpenStart);
        assert_eq!(door.next_deadline(), None);
    }
}
