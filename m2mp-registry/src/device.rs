//! Device records.

use crate::router::ChannelRule;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use uuid::Uuid;

/// Lightweight reference to a device, held by sessions.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceHandle {
    pub id: Uuid,
    pub ident: String,
}

/// Everything the registry knows about one device.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Device {
    pub id: Uuid,
    pub ident: String,
    pub domain: String,

    /// Committed configuration.
    pub settings: BTreeMap<String, String>,
    /// Values the device has not acknowledged yet.
    pub settings_to_send: BTreeMap<String, String>,
    /// Unix time of the last acknowledgment per key.
    pub settings_ack_time: BTreeMap<String, i64>,

    pub status: BTreeMap<String, String>,

    /// Queued commands, by command id.
    pub commands: BTreeMap<String, String>,
    pub command_responses: BTreeMap<String, String>,

    pub channel_rules: Vec<ChannelRule>,
}

impl Device {
    pub fn new(id: Uuid, ident: impl Into<String>, domain: impl Into<String>) -> Self {
        Self {
            id,
            ident: ident.into(),
            domain: domain.into(),
            ..Default::default()
        }
    }

    pub fn handle(&self) -> DeviceHandle {
        DeviceHandle {
            id: self.id,
            ident: self.ident.clone(),
        }
    }

    /// Commits a value and queues it for the device.
    pub fn set_setting(&mut self, name: &str, value: &str) {
        self.settings.insert(name.to_string(), value.to_string());
        self.settings_to_send
            .insert(name.to_string(), value.to_string());
        self.settings_ack_time.remove(name);
    }

    /// Records the value a device reported for `name`.
    ///
    /// The queued value is only cleared when the device reports exactly that
    /// value; the reported value is committed either way.
    pub fn ack_setting(&mut self, name: &str, value: &str, now: i64) {
        if self.settings_to_send.get(name).map(String::as_str) == Some(value) {
            self.settings_to_send.remove(name);
            self.settings_ack_time.insert(name.to_string(), now);
        }
        self.settings.insert(name.to_string(), value.to_string());
    }

    pub fn delete_setting(&mut self, name: &str) {
        self.settings.remove(name);
        self.settings_to_send.remove(name);
    }

    pub fn ack_command(&mut self, command_id: &str, response: Option<&str>) {
        self.commands.remove(command_id);
        if let Some(response) = response {
            self.command_responses
                .insert(command_id.to_string(), response.to_string());
        }
    }
}
