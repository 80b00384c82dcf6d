//! MQTT side of the agent.
//!
//! Door state goes out retained on `<prefix><index>/state`, commands come in on
//! `<prefix><index>/command`, and every door gets a Home Assistant discovery record under
//! `<ha_prefix><device_prefix><index>/config`.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::{Duration, Instant};

use json::{object, JsonValue};
use log::{error, info, trace, warn};
use rumqttc::{
    Client, Connection, ConnectionError, Event, MqttOptions, Packet, QoS, RecvTimeoutError,
    TryRecvError,
};

use crate::bus::{Bus, BusCommand};
use crate::config::MqttConfig;
use crate::door_state::{Command, ReportedState};
use crate::error::DoorError;

/// Values read back from the bus older than this are treated as absent.
pub const FRESHNESS: Duration = Duration::from_secs(180);

const KEEP_ALIVE: Duration = Duration::from_secs(10);
const RECONNECT_DELAY: Duration = Duration::from_secs(5);
const REQUEST_CAPACITY: usize = 64;
/// Upper bound on events drained per maintenance call.
const MAINTAIN_BUDGET: usize = 64;

#[derive(Clone, Debug)]
pub struct Topics {
    prefix: String,
    ha_prefix: String,
    device_prefix: String,
}

impl Topics {
    pub fn new(config: &MqttConfig) -> Self {
        Topics {
            prefix: config.prefix.clone(),
            ha_prefix: config.ha_prefix.clone(),
            device_prefix: config.device_prefix.clone(),
        }
    }

    pub fn state(&self, index: u32) -> String {
        format!("{}{}/state", self.prefix, index)
    }

    pub fn command(&self, index: u32) -> String {
        format!("{}{}/command", self.prefix, index)
    }

    pub fn fault(&self, index: u32) -> String {
        format!("{}{}/fault", self.prefix, index)
    }

    pub fn discovery(&self, index: u32) -> String {
        format!("{}{}{}/config", self.ha_prefix, self.device_prefix, index)
    }

    /// Door index of a command topic.
    pub fn command_index(&self, topic: &str) -> Option<u32> {
        topic
            .strip_prefix(self.prefix.as_str())?
            .strip_suffix("/command")?
            .parse()
            .ok()
    }

    pub fn discovery_record(&self, index: u32) -> JsonValue {
        let name = format!("{}{}", self.device_prefix, index);
        object! {
            name: name.clone(),
            unique_id: name,
            state_topic: self.state(index),
            command_topic: self.command(index),
            payload_open: Command::Open.to_string(),
            payload_close: Command::Close.to_string()
        }
    }
}

struct Subscription {
    value: Option<String>,
    received: Instant,
}

/// Last value seen on each subscribed topic.
#[derive(Default)]
pub struct TopicCache {
    subscriptions: HashMap<String, Subscription>,
}

impl TopicCache {
    pub fn new() -> Self {
        TopicCache::default()
    }

    pub fn subscribe(&mut self, topic: String, now: Instant) {
        self.subscriptions.entry(topic).or_insert(Subscription {
            value: None,
            received: now,
        });
    }

    pub fn topics(&self) -> impl Iterator<Item = &str> {
        self.subscriptions.keys().map(String::as_str)
    }

    /// Stores a message. Returns false for topics that aren't subscribed.
    pub fn record(&mut self, topic: &str, payload: &str, now: Instant) -> bool {
        match self.subscriptions.get_mut(topic) {
            Some(subscription) => {
                subscription.value = Some(payload.to_string());
                subscription.received = now;
                true
            }
            None => false,
        }
    }

    pub fn value(&self, topic: &str, now: Instant) -> Option<&str> {
        let subscription = self.subscriptions.get(topic)?;
        let value = subscription.value.as_deref()?;
        if now.saturating_duration_since(subscription.received) < FRESHNESS {
            Some(value)
        } else {
            warn!("mqtt: not returning stale data for {}", topic);
            None
        }
    }
}

pub struct MqttBus {
    client: Client,
    connection: Connection,
    topics: Topics,
    cache: TopicCache,
    pending: VecDeque<BusCommand>,
    retry_at: Option<Instant>,
}

impl MqttBus {
    /// Sets up the client. The connection itself is made from [`Bus::wait`] and
    /// [`Bus::maintain`]; subscriptions are (re)issued on every connect.
    pub fn new(config: &MqttConfig, doors: impl IntoIterator<Item = u32>) -> Self {
        let client_id = format!("door-agent-{}", std::process::id());
        let mut options = MqttOptions::new(client_id, config.broker.as_str(), config.port);
        options.set_keep_alive(KEEP_ALIVE);
        let (client, connection) = Client::new(options, REQUEST_CAPACITY);
        info!("mqtt: connecting to {}:{}", config.broker, config.port);

        let topics = Topics::new(config);
        let now = Instant::now();
        let mut cache = TopicCache::new();
        for index in doors {
            cache.subscribe(topics.command(index), now);
        }

        MqttBus {
            client,
            connection,
            topics,
            cache,
            pending: VecDeque::new(),
            retry_at: None,
        }
    }

    fn publish(&mut self, topic: String, payload: String, retain: bool) {
        trace!(
            "mqtt: publish {}={}{}",
            topic,
            payload,
            if retain { " [r]" } else { "" }
        );
        if let Err(err) = self
            .client
            .try_publish(topic.as_str(), QoS::AtLeastOnce, retain, payload)
        {
            warn!("mqtt: dropped publish to {}: {}", topic, err);
        }
    }

    fn subscribe_all(&mut self) {
        for topic in self.cache.topics() {
            trace!("mqtt: (re)subscribing to {}", topic);
            if let Err(err) = self.client.try_subscribe(topic, QoS::AtLeastOnce) {
                error!("mqtt: subscribe to {} failed: {}", topic, err);
            }
        }
    }

    fn handle_event(&mut self, event: Event) {
        match event {
            Event::Incoming(Packet::ConnAck(_)) => {
                info!("mqtt: connected");
                self.subscribe_all();
            }
            Event::Incoming(Packet::Publish(publish)) => {
                let payload = String::from_utf8_lossy(&publish.payload);
                self.handle_message(&publish.topic, &payload, publish.retain, Instant::now());
            }
            _ => {}
        }
    }

    fn handle_message(&mut self, topic: &str, payload: &str, retain: bool, now: Instant) {
        trace!(
            "mqtt: message: {}={}{}",
            topic,
            payload,
            if retain { " [r]" } else { "" }
        );
        let index = self.topics.command_index(topic);
        // A retained command is history, not a request.
        if retain && index.is_some() {
            info!("mqtt: ignoring retained {:?} on {}", payload, topic);
            return;
        }
        if !self.cache.record(topic, payload, now) {
            return;
        }
        if let Some(index) = index {
            match payload.parse::<Command>() {
                Ok(command) => self.pending.push_back(BusCommand { index, command }),
                Err(()) => warn!("mqtt: ignoring payload {:?} for door {}", payload, index),
            }
        }
    }

    fn connection_lost(&mut self, err: ConnectionError) {
        error!("mqtt: connection lost: {}", err);
        self.retry_at = Some(Instant::now() + RECONNECT_DELAY);
    }

    fn backing_off(&self, now: Instant) -> bool {
        self.retry_at.map_or(false, |at| now < at)
    }
}

impl Bus for MqttBus {
    fn publish_state(&mut self, index: u32, state: ReportedState) {
        let topic = self.topics.state(index);
        self.publish(topic, state.to_string(), true);
    }

    fn publish_fault(&mut self, index: u32, fault: &DoorError) {
        let topic = self.topics.fault(index);
        self.publish(topic, fault.to_string(), true);
    }

    fn announce(&mut self, index: u32) {
        let topic = self.topics.discovery(index);
        let record = self.topics.discovery_record(index).dump();
        self.publish(topic, record, true);
    }

    fn maintain(&mut self) {
        if self.backing_off(Instant::now()) {
            return;
        }
        for _ in 0..MAINTAIN_BUDGET {
            match self.connection.try_recv() {
                Ok(Ok(event)) => self.handle_event(event),
                Ok(Err(err)) => {
                    self.connection_lost(err);
                    break;
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    error!("mqtt: request channel closed");
                    break;
                }
            }
        }
    }

    fn wait(&mut self, deadline: Instant) -> Option<BusCommand> {
        loop {
            if let Some(command) = self.pending.pop_front() {
                return Some(command);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            if let Some(retry_at) = self.retry_at {
                if now < retry_at {
                    thread::sleep(retry_at.min(deadline) - now);
                    continue;
                }
                self.retry_at = None;
                info!("mqtt: reconnecting");
            }
            match self.connection.recv_timeout(deadline - now) {
                Ok(Ok(event)) => self.handle_event(event),
                Ok(Err(err)) => self.connection_lost(err),
                Err(RecvTimeoutError::Timeout) => return None,
                Err(RecvTimeoutError::Disconnected) => {
                    error!("mqtt: request channel closed");
                    thread::sleep(deadline - now);
                    return None;
                }
            }
        }
    }
}
