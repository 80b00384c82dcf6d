//! Binary sensor and actuator lines.
//!
//! The door state machine only ever sees the [`DigitalInput`] and [`DigitalOutput`] traits. The
//! Raspberry Pi implementation lives here too, on top of `rppal`; [`fake`] provides lines that can
//! be driven from tests.

use std::fmt;

use rppal::gpio::{Gpio, InputPin, Level, OutputPin};

use crate::error::{ConfigError, Error};

/// The only chip `rppal` can address.
pub const SOC_CHIP: &str = "gpiochip0";

pub trait DigitalInput {
    /// Raw electrical level of the line, `true` for high.
    fn read(&self) -> bool;
}

pub trait DigitalOutput {
    fn write(&mut self, level: bool);
}

/// Where a line lives and which level means "active".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LineConfig {
    pub chip: String,
    pub line: u8,
    pub active_level: bool,
}

impl fmt::Display for LineConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}:{} (active {})",
            self.chip,
            self.line,
            if self.active_level { "high" } else { "low" }
        )
    }
}

pub struct SensorBinding {
    line: Box<dyn DigitalInput>,
    active_level: bool,
}

impl SensorBinding {
    pub fn new(line: Box<dyn DigitalInput>, active_level: bool) -> Self {
        SensorBinding { line, active_level }
    }

    /// Logical value of the sensor with polarity applied.
    pub fn is_active(&self) -> bool {
        self.line.read() == self.active_level
    }
}

pub struct ActuatorBinding {
    line: Box<dyn DigitalOutput>,
    active_level: bool,
    asserted: bool,
}

impl ActuatorBinding {
    /// Binds the line and drives it to its inactive level straight away.
    pub fn new(line: Box<dyn DigitalOutput>, active_level: bool) -> Self {
        let mut binding = ActuatorBinding {
            line,
            active_level,
            asserted: true,
        };
        binding.release();
        binding
    }

    pub fn assert(&mut self) {
        self.line.write(self.active_level);
        self.asserted = true;
    }

    pub fn release(&mut self) {
        self.line.write(!self.active_level);
        self.asserted = false;
    }

    pub fn is_asserted(&self) -> bool {
        self.asserted
    }
}

impl DigitalInput for InputPin {
    fn read(&self) -> bool {
        self.is_high()
    }
}

impl DigitalOutput for OutputPin {
    fn write(&mut self, level: bool) {
        OutputPin::write(self, if level { Level::High } else { Level::Low })
    }
}

/// Opens configured lines as bindings.
pub trait Lines {
    fn sensor(&self, config: &LineConfig) -> Result<SensorBinding, Error>;
    fn actuator(&self, config: &LineConfig) -> Result<ActuatorBinding, Error>;
}

/// Hands out lines of the SoC GPIO bank.
pub struct PiLines {
    gpio: Gpio,
}

impl PiLines {
    pub fn new() -> Result<Self, Error> {
        Ok(PiLines { gpio: Gpio::new()? })
    }
}

impl Lines for PiLines {
    fn sensor(&self, config: &LineConfig) -> Result<SensorBinding, Error> {
        check_chip(config)?;
        let pin = self.gpio.get(config.line)?.into_input();
        Ok(SensorBinding::new(Box::new(pin), config.active_level))
    }

    fn actuator(&self, config: &LineConfig) -> Result<ActuatorBinding, Error> {
        check_chip(config)?;
        let pin = self.gpio.get(config.line)?.into_output();
        Ok(ActuatorBinding::new(Box::new(pin), config.active_level))
    }
}

fn check_chip(config: &LineConfig) -> Result<(), ConfigError> {
    match config.chip.as_str() {
        SOC_CHIP | "0" | "/dev/gpiochip0" => Ok(()),
        other => Err(ConfigError::UnsupportedChip(other.to_string())),
    }
}

/// Lines backed by shared cells, for exercising doors without hardware.
pub mod fake {
    use std::cell::{Cell, RefCell};
    use std::collections::BTreeMap;
    use std::rc::Rc;

    use super::{
        check_chip, ActuatorBinding, DigitalInput, DigitalOutput, LineConfig, Lines, SensorBinding,
    };
    use crate::error::Error;

    #[derive(Clone, Default)]
    pub struct FakeInput {
        level: Rc<Cell<bool>>,
    }

    impl FakeInput {
        pub fn new(level: bool) -> Self {
            FakeInput {
                level: Rc::new(Cell::new(level)),
            }
        }

        pub fn set(&self, level: bool) {
            self.level.set(level)
        }
    }

    impl DigitalInput for FakeInput {
        fn read(&self) -> bool {
            self.level.get()
        }
    }

    /// Records every level written so tests can count pulses.
    #[derive(Clone, Default)]
    pub struct FakeOutput {
        writes: Rc<RefCell<Vec<bool>>>,
    }

    impl FakeOutput {
        pub fn new() -> Self {
            FakeOutput::default()
        }

        pub fn writes(&self) -> Vec<bool> {
            self.writes.borrow().clone()
        }

        pub fn level(&self) -> Option<bool> {
            self.writes.borrow().last().copied()
        }

        /// Number of writes that drove the line to `active_level`.
        pub fn pulses(&self, active_level: bool) -> usize {
            self.writes
                .borrow()
                .iter()
                .filter(|&&level| level == active_level)
                .count()
        }
    }

    impl DigitalOutput for FakeOutput {
        fn write(&mut self, level: bool) {
            self.writes.borrow_mut().push(level)
        }
    }

    /// Fake lines keyed by line number. Sensors start out low.
    #[derive(Default)]
    pub struct FakeLines {
        inputs: RefCell<BTreeMap<u8, FakeInput>>,
        outputs: RefCell<BTreeMap<u8, FakeOutput>>,
    }

    impl FakeLines {
        pub fn new() -> Self {
            FakeLines::default()
        }

        pub fn input(&self, line: u8) -> FakeInput {
            self.inputs.borrow_mut().entry(line).or_default().clone()
        }

        pub fn output(&self, line: u8) -> FakeOutput {
            self.outputs.borrow_mut().entry(line).or_default().clone()
        }
    }

    impl Lines for FakeLines {
        fn sensor(&self, config: &LineConfig) -> Result<SensorBinding, Error> {
            check_chip(config)?;
            let input = self.input(config.line);
            Ok(SensorBinding::new(Box::new(input), config.active_level))
        }

        fn actuator(&self, config: &LineConfig) -> Result<ActuatorBinding, Error> {
            check_chip(config)?;
            let output = self.output(config.line);
            Ok(ActuatorBinding::new(Box::new(output), config.active_level))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fake::{FakeInput, FakeOutput};
    use super::*;

    #[test]
    fn sensor_applies_polarity() {
        let input = FakeInput::new(false);
        let active_low = SensorBinding::new(Box::new(input.clone()), false);
        let active_high = SensorBinding::new(Box::new(input.clone()), true);
        assert!(active_low.is_active());
        assert!(!active_high.is_active());

        input.set(true);
        assert!(!active_low.is_active());
        assert!(active_high.is_active());
    }

    #[test]
    fn actuator_is_released_on_bind() {
        let output = FakeOutput::new();
        let actuator = ActuatorBinding::new(Box::new(output.clone()), false);
        assert_eq!(output.writes(), vec![true]);
        assert!(!actuator.is_asserted());
    }

    #[test]
    fn actuator_assert_and_release_follow_polarity() {
        let output = FakeOutput::new();
        let mut actuator = ActuatorBinding::new(Box::new(output.clone()), true);
        actuator.assert();
        assert_eq!(output.level(), Some(true));
        assert!(actuator.is_asserted());
        actuator.release();
        assert_eq!(output.writes(), vec![false, true, false]);
        assert_eq!(output.pulses(true), 1);
    }

    #[test]
    fn only_the_soc_chip_is_accepted() {
        let mut config = LineConfig {
            chip: SOC_CHIP.to_string(),
            line: 17,
            active_level: true,
        };
        assert!(check_chip(&config).is_ok());

        config.chip = "gpiochip1".to_string();
        assert!(matches!(
            check_chip(&config),
            Err(ConfigError::UnsupportedChip(chip)) if chip == "gpiochip1"
        ));
    }
}
