//! The narrow contract between the door scheduler and the message bus.

use std::time::Instant;

use crate::door_state::{Command, ReportedState};
use crate::error::DoorError;

/// A validated command addressed to a door.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BusCommand {
    pub index: u32,
    pub command: Command,
}

pub trait Bus {
    /// Publishes a door's state as a retained message.
    fn publish_state(&mut self, index: u32, state: ReportedState);

    fn publish_fault(&mut self, index: u32, fault: &DoorError);

    /// Publishes the discovery record for a door.
    fn announce(&mut self, index: u32);

    /// Keepalive and write flushing, called once per poll tick.
    fn maintain(&mut self);

    /// Blocks until a command arrives or `deadline` passes.
    fn wait(&mut self, deadline: Instant) -> Option<BusCommand>;
}

/// A bus that records everything published and replays queued commands.
pub mod recording {
    use std::collections::VecDeque;
    use std::time::Instant;

    use super::{Bus, BusCommand};
    use crate::door_state::ReportedState;
    use crate::error::DoorError;

    #[derive(Clone, Debug, Eq, PartialEq)]
    pub enum Published {
        State(u32, ReportedState),
        Fault(u32, DoorError),
        Discovery(u32),
    }

    #[derive(Default)]
    pub struct RecordingBus {
        pub published: Vec<Published>,
        pub maintained: usize,
        pub commands: VecDeque<BusCommand>,
    }

    impl RecordingBus {
        pub fn new() -> Self {
            RecordingBus::default()
        }

        pub fn take(&mut self) -> Vec<Published> {
            std::mem::take(&mut self.published)
        }
    }

    impl Bus for RecordingBus {
        fn publish_state(&mut self, index: u32, state: ReportedState) {
            self.published.push(Published::State(index, state))
        }

        fn publish_fault(&mut self, index: u32, fault: &DoorError) {
            self.published.push(Published::Fault(index, fault.clone()))
        }

        fn announce(&mut self, index: u32) {
            self.published.push(Published::Discovery(index))
        }

        fn maintain(&mut self) {
            self.maintained += 1;
        }

        fn wait(&mut self, _deadline: Instant) -> Option<BusCommand> {
            self.commands.pop_front()
        }
    }
}
