//! Message bus used to exchange calls and events with other services.
//!
//! Messages are JSON objects addressed with a `_to` field of the form
//! `topic[;key=value]*`, e.g. `receivers;device_id=<uuid>`. The topic part
//! selects the delivery channel; the parameters are read by the receiver.

use chrono::Utc;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::sync::broadcast;

/// Topic the receivers listen on.
pub const TOPIC_RECEIVERS: &str = "receivers";
/// Topic for general lifecycle events.
pub const TOPIC_GENERAL_EVENTS: &str = "events";

/// Bus errors.
#[derive(Debug, Error)]
pub enum BusError {
    #[error("message has no target")]
    MissingTarget,

    #[error("transport error: {0}")]
    Transport(String),
}

/// A bus message: routing fields plus free-form JSON fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BusMessage {
    #[serde(rename = "_to")]
    pub to: String,

    #[serde(rename = "_from", default)]
    pub from: String,

    #[serde(rename = "_call")]
    pub call: String,

    /// Unix seconds.
    #[serde(rename = "_time", default)]
    pub time: i64,

    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Destination parameters parsed from a `_to` field.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Target {
    pub connection_id: Option<u64>,
    pub device_id: Option<String>,
}

impl BusMessage {
    pub fn new(to: impl Into<String>, call: impl Into<String>) -> Self {
        Self {
            to: to.into(),
            from: String::new(),
            call: call.into(),
            time: Utc::now().timestamp(),
            fields: Map::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<Value>) {
        self.fields.insert(key.into(), value.into());
    }

    pub fn get_str(&self, key: &str) -> Option<&str> {
        self.fields.get(key).and_then(Value::as_str)
    }

    /// Topic part of the target (before any `;` parameter or `/` channel).
    pub fn topic(&self) -> &str {
        let end = self.to.find([';', '/']).unwrap_or(self.to.len());
        &self.to[..end]
    }

    /// Parses the `;key=value` parameters of the target.
    pub fn target(&self) -> Target {
        let mut target = Target::default();
        for param in self.to.split(';').skip(1) {
            let (key, value) = param.split_once('=').unwrap_or((param, ""));
            match key {
                "connection_id" => target.connection_id = value.parse().ok().filter(|id| *id != 0),
                "device_id" if !value.is_empty() => target.device_id = Some(value.to_string()),
                _ => {}
            }
        }
        target
    }
}

/// Publish/subscribe access to the bus.
pub trait MessageBus: Send + Sync {
    fn publish(&self, message: BusMessage) -> Result<(), BusError>;

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage>;
}

/// In-process bus: one broadcast channel per topic.
pub struct LocalBus {
    channels: DashMap<String, broadcast::Sender<BusMessage>>,
    channel_capacity: usize,
}

impl LocalBus {
    pub fn new(channel_capacity: usize) -> Self {
        Self {
            channels: DashMap::new(),
            channel_capacity,
        }
    }

    fn sender(&self, topic: &str) -> broadcast::Sender<BusMessage> {
        self.channels
            .entry(topic.to_string())
            .or_insert_with(|| broadcast::channel(self.channel_capacity).0)
            .clone()
    }
}

impl Default for LocalBus {
    fn default() -> Self {
        Self::new(1024)
    }
}

impl MessageBus for LocalBus {
    fn publish(&self, message: BusMessage) -> Result<(), BusError> {
        let topic = message.topic();
        if topic.is_empty() {
            return Err(BusError::MissingTarget);
        }
        tracing::trace!("bus -> {} {}", message.to, message.call);
        // no subscriber is not an error: the message is simply dropped
        let _ = self.sender(topic).send(message);
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> broadcast::Receiver<BusMessage> {
        self.sender(topic).subscribe()
    }
}
