//! Shift-register debounce for the closed sensor.

pub const DEFAULT_DEPTH: u32 = 4;

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum Reading {
    ConfirmedClosed,
    ConfirmedOpen,
    /// The window holds mixed samples.
    Unconfirmed,
}

#[derive(Clone, Debug)]
pub struct Debouncer {
    register: u32,
    mask: u32,
    seen: u32,
    confirmed: Option<bool>,
}

impl Default for Debouncer {
    fn default() -> Self {
        Debouncer::new()
    }
}

impl Debouncer {
    pub fn new() -> Self {
        Debouncer::with_depth(DEFAULT_DEPTH)
    }

    /// `depth` is clamped to `1..=32` samples.
    pub fn with_depth(depth: u32) -> Self {
        let depth = depth.clamp(1, 32);
        let mask = if depth == 32 {
            u32::MAX
        } else {
            (1 << depth) - 1
        };
        Debouncer {
            register: 0,
            mask,
            seen: 0,
            confirmed: None,
        }
    }

    pub fn depth(&self) -> u32 {
        self.mask.count_ones()
    }

    /// Shifts in a raw sample (`true` meaning closed) and classifies the window.
    pub fn sample(&mut self, closed: bool) -> Reading {
        self.register = ((self.register << 1) | closed as u32) & self.mask;
        self.seen = (self.seen + 1).min(self.depth());
        let reading = if self.seen < self.depth() {
            Reading::Unconfirmed
        } else if self.register == self.mask {
            Reading::ConfirmedClosed
        } else if self.register == 0 {
            Reading::ConfirmedOpen
        } else {
            Reading::Unconfirmed
        };
        match reading {
            Reading::ConfirmedClosed => self.confirmed = Some(true),
            Reading::ConfirmedOpen => self.confirmed = Some(false),
            Reading::Unconfirmed => {}
        }
        reading
    }

    /// Last confirmed value, `Some(true)` for closed. Only changes once a full run of the opposite
    /// level has been sampled.
    pub fn confirmed(&self) -> Option<bool> {
        self.confirmed
    }
}
