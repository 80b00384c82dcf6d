//! JSON configuration file.
//!
//! ```json
//! {
//!   "doors": [
//!     { "index": 1, "closed_sensor": ["gpiochip0", 17, false],
//!       "open_actuator": ["gpiochip0", 27, true], "open_time": 12000 }
//!   ],
//!   "mqtt": { "broker": "localhost", "prefix": "garage/door",
//!             "ha_prefix": "homeassistant/cover/", "device_prefix": "garage_door_" },
//!   "poll": { "fast": 250, "slow": 3000, "warmup": 5000 }
//! }
//! ```
//!
//! All times are in milliseconds.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use json::JsonValue;
use log::{error, warn};

use crate::debounce::{Debouncer, DEFAULT_DEPTH};
use crate::door::{Door, DoorTimings};
use crate::error::ConfigError;
use crate::gpio::{LineConfig, Lines};
use crate::scheduler::{Cadence, Registry};

pub const DEFAULT_MQTT_PORT: u16 = 1883;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoorConfig {
    pub index: u32,
    pub closed_sensor: Option<LineConfig>,
    pub open_actuator: Option<LineConfig>,
    pub close_actuator: Option<LineConfig>,
    pub timings: DoorTimings,
    pub debounce: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker: String,
    pub port: u16,
    /// Prepended to `<index>/state` and `<index>/command`.
    pub prefix: String,
    /// Home Assistant discovery prefix.
    pub ha_prefix: String,
    pub device_prefix: String,
}

impl Default for MqttConfig {
    fn default() -> Self {
        MqttConfig {
            broker: "localhost".to_string(),
            port: DEFAULT_MQTT_PORT,
            prefix: String::new(),
            ha_prefix: String::new(),
            device_prefix: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub doors: Vec<DoorConfig>,
    pub mqtt: MqttConfig,
    pub cadence: Cadence,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Config::parse(&text)
    }

    pub fn parse(text: &str) -> Result<Self, ConfigError> {
        let root = json::parse(text)?;

        let mut doors = Vec::new();
        if root["doors"].is_array() {
            for door in root["doors"].members() {
                if door["index"].is_null() {
                    warn!("config: ignoring door without index");
                    continue;
                }
                doors.push(DoorConfig::parse(door)?);
            }
        } else {
            error!("No doors defined in configuration");
        }

        Ok(Config {
            doors,
            mqtt: MqttConfig::parse(&root["mqtt"])?,
            cadence: parse_cadence(&root["poll"])?,
        })
    }

    /// Binds every configured door. A line that can't be opened is logged and left unbound, so
    /// the door reports a fault instead of stopping the agent.
    pub fn build_registry<L: Lines>(
        &self,
        lines: Option<&L>,
        now: Instant,
    ) -> Result<Registry, ConfigError> {
        let mut registry = Registry::new();
        for door in &self.doors {
            registry.insert(door.build(lines, now))?;
        }
        Ok(registry)
    }
}

impl DoorConfig {
    fn parse(value: &JsonValue) -> Result<Self, ConfigError> {
        let index = value["index"]
            .as_u32()
            .ok_or_else(|| ConfigError::BadIndex(value["index"].dump()))?;
        let key = |name: &str| format!("door {}: {}", index, name);

        let defaults = DoorTimings::default();
        let timings = DoorTimings {
            open_time: millis(&value["open_time"], defaults.open_time, || key("open_time"))?,
            close_time: millis(&value["close_time"], defaults.close_time, || {
                key("close_time")
            })?,
            open_start_time: millis(&value["open_start_time"], defaults.open_start_time, || {
                key("open_start_time")
            })?,
            button_pulse_time: millis(
                &value["button_pulse_time"],
                defaults.button_pulse_time,
                || key("button_pulse_time"),
            )?,
        };

        let debounce = &value["debounce"];
        let debounce = if debounce.is_null() {
            DEFAULT_DEPTH
        } else {
            match debounce.as_u32() {
                Some(depth @ 1..=32) => depth,
                _ => return Err(ConfigError::BadDepth { key: key("debounce") }),
            }
        };

        // `open_btn` is the older name of the open actuator key.
        let open_actuator = if value["open_actuator"].is_null() {
            line(&value["open_btn"], || key("open_btn"))?
        } else {
            if !value["open_btn"].is_null() {
                warn!(
                    "Door({}): both open_actuator and open_btn set, using open_actuator",
                    index
                );
            }
            line(&value["open_actuator"], || key("open_actuator"))?
        };

        Ok(DoorConfig {
            index,
            closed_sensor: line(&value["closed_sensor"], || key("closed_sensor"))?,
            open_actuator,
            close_actuator: line(&value["close_actuator"], || key("close_actuator"))?,
            timings,
            debounce,
        })
    }

    pub fn build<L: Lines>(&self, lines: Option<&L>, now: Instant) -> Door {
        let mut door = Door::new(self.index, now)
            .with_timings(self.timings)
            .with_debouncer(Debouncer::with_depth(self.debounce));
        let lines = match lines {
            Some(lines) => lines,
            None => return door,
        };

        if let Some(config) = &self.closed_sensor {
            match lines.sensor(config) {
                Ok(sensor) => door = door.with_closed_sensor(sensor),
                Err(err) => error!("Door({}): closed sensor {}: {}", self.index, config, err),
            }
        }
        if let Some(config) = &self.open_actuator {
            match lines.actuator(config) {
                Ok(actuator) => door = door.with_open_actuator(actuator),
                Err(err) => error!("Door({}): open actuator {}: {}", self.index, config, err),
            }
        }
        if let Some(config) = &self.close_actuator {
            match lines.actuator(config) {
                Ok(actuator) => door = door.with_close_actuator(actuator),
                Err(err) => error!("Door({}): close actuator {}: {}", self.index, config, err),
            }
        }
        door
    }
}

impl MqttConfig {
    fn parse(value: &JsonValue) -> Result<Self, ConfigError> {
        let mut config = MqttConfig::default();
        if value.is_null() {
            return Ok(config);
        }
        if !value.is_object() {
            return Err(ConfigError::BadMqtt { key: "section" });
        }

        for (key, field) in [
            ("broker", &mut config.broker),
            ("prefix", &mut config.prefix),
            ("ha_prefix", &mut config.ha_prefix),
            ("device_prefix", &mut config.device_prefix),
        ] {
            if value[key].is_null() {
                continue;
            }
            match value[key].as_str() {
                Some(s) => *field = s.to_string(),
                None => return Err(ConfigError::BadMqtt { key }),
            }
        }
        if !value["port"].is_null() {
            config.port = value["port"]
                .as_u16()
                .ok_or(ConfigError::BadMqtt { key: "port" })?;
        }
        Ok(config)
    }
}

fn parse_cadence(value: &JsonValue) -> Result<Cadence, ConfigError> {
    let defaults = Cadence::default();
    Ok(Cadence {
        fast: millis(&value["fast"], defaults.fast, || "poll.fast".to_string())?,
        slow: millis(&value["slow"], defaults.slow, || "poll.slow".to_string())?,
        warmup: millis(&value["warmup"], defaults.warmup, || {
            "poll.warmup".to_string()
        })?,
    })
}

fn millis(
    value: &JsonValue,
    default: Duration,
    key: impl FnOnce() -> String,
) -> Result<Duration, ConfigError> {
    if value.is_null() {
        return Ok(default);
    }
    value
        .as_u64()
        .map(Duration::from_millis)
        .ok_or_else(|| ConfigError::BadTime { key: key() })
}

/// `[chip, line, active_level]`, or the same as an object.
fn line(value: &JsonValue, key: impl FnOnce() -> String) -> Result<Option<LineConfig>, ConfigError> {
    if value.is_null() {
        return Ok(None);
    }
    let (chip, line, level) = if value.is_array() && value.len() == 3 {
        (&value[0], &value[1], &value[2])
    } else if value.is_object() {
        (&value["chip"], &value["line"], &value["active_level"])
    } else {
        return Err(ConfigError::BadLine { key: key() });
    };
    match (chip.as_str(), line.as_u8(), level.as_bool()) {
        (Some(chip), Some(line), Some(active_level)) => Ok(Some(LineConfig {
            chip: chip.to_string(),
            line,
            active_level,
        })),
        _ => Err(ConfigError::BadLine { key: key() }),
    }
}
