//! Transport-independent session logic.
//!
//! [`SessionCore`] reacts to device requests, bus calls and timers, and
//! queues [`Outbound`] items that the transport turns into frames or lines.

use crate::bus::{BusMessage, MessageBus};
use crate::error::ServerError;
use crate::server::SessionTable;
use crate::session::{LivenessAction, Session, SessionPolicy, SessionState, NOTICE_IDENT_TIMEOUT};
use crate::storage::SamplePersister;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use m2mp_protocol::control::{self, CommandOp, SettingsOp, StatusOp};
use m2mp_registry::{is_valid_ident, series_key, ChannelRouter, DeviceRegistry, TimedSample};
use serde_json::json;
use std::sync::Arc;
use tokio::time::Instant;

/// Status key probed after identification when the device never reported it.
pub const STATUS_CAPABILITIES: &str = "cap";

/// Sample type used for server-side lifecycle records.
pub const SAMPLE_SERVER: &str = "_server";

/// Shared collaborators handed to every session.
pub struct Services {
    pub registry: Arc<dyn DeviceRegistry>,
    pub bus: Arc<dyn MessageBus>,
    pub samples: SamplePersister,
    pub table: Arc<SessionTable>,
    pub policy: SessionPolicy,
    /// Topic sessions receive calls on.
    pub receivers_topic: String,
    /// Lifecycle event topic.
    pub events_topic: String,
    /// Target for data no routing rule claims.
    pub default_target: String,
    /// Name of this server, recorded in lifecycle samples.
    pub host: String,
}

/// Something to send to the device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outbound {
    IdentResult(bool),
    /// Server ping.
    Ping(u8),
    /// Answer to a device ping.
    Pong(u8),
    Settings(Vec<(String, String)>),
    RequestAllSettings,
    Command { short_id: u32, text: String },
    RequestStatus(String),
    Data { channel: String, payload: Bytes },
    DataArray { channel: String, items: Vec<Bytes> },
    /// Transport specific raw reply (ALIP lines).
    Line(String),
    /// Last words before the server closes the connection.
    Notice(String),
}

/// Whether the connection goes on after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Payload of a data message.
#[derive(Debug, Clone)]
pub enum Payload {
    Simple(Bytes),
    Array(Vec<Bytes>),
}

pub struct SessionCore {
    pub session: Session,
    services: Arc<Services>,
    router: Option<ChannelRouter>,
    outbox: Vec<Outbound>,
}

impl SessionCore {
    pub fn new(session: Session, services: Arc<Services>) -> Self {
        Self {
            session,
            services,
            router: None,
            outbox: Vec::new(),
        }
    }

    pub fn services(&self) -> &Arc<Services> {
        &self.services
    }

    pub fn registry(&self) -> &dyn DeviceRegistry {
        self.services.registry.as_ref()
    }

    pub fn push(&mut self, out: Outbound) {
        self.outbox.push(out);
    }

    /// Drains everything queued for the device.
    pub fn take_outbox(&mut self) -> Vec<Outbound> {
        std::mem::take(&mut self.outbox)
    }

    /// Publishes on the bus with this session as sender; failures are logged.
    pub fn publish(&self, mut message: BusMessage) {
        message.from = self.session.bus_address();
        if let Err(e) = self.services.bus.publish(message) {
            tracing::warn!("[{}] Bus publish failed: {}", self.session.id, e);
        }
    }

    fn event(&self, call: &str) -> BusMessage {
        BusMessage::new(self.services.events_topic.clone(), call)
            .with("source", self.session.remote_addr.to_string())
            .with("connection_id", self.session.id)
    }

    fn lifecycle_sample(&self, kind: &str, time: DateTime<Utc>) -> Option<TimedSample> {
        let device = self.session.device()?;
        Some(TimedSample::new(
            series_key(&device.id),
            SAMPLE_SERVER,
            time,
            json!({
                "host": self.services.host,
                "source": self.session.remote_addr.to_string(),
                "connection_id": self.session.id,
                "type": kind,
            }),
        ))
    }

    /// Announces the new connection.
    pub fn connected(&self) {
        tracing::info!(
            "[{}] Device connected from {}",
            self.session.id,
            self.session.remote_addr
        );
        self.publish(self.event("device_connected"));
    }

    /// Handles an identification request. The connection stays open on
    /// failure.
    pub fn identify(&mut self, ident: &str, now: Instant) -> bool {
        match self.try_identify(ident) {
            Ok(()) => {
                self.push(Outbound::IdentResult(true));
                self.post_identification(now);
                true
            }
            Err(e) => {
                tracing::warn!("[{}] Identification as {:?} refused: {}", self.session.id, ident, e);
                self.push(Outbound::IdentResult(false));
                false
            }
        }
    }

    fn try_identify(&mut self, ident: &str) -> Result<(), ServerError> {
        if self.session.is_identified() {
            return Err(ServerError::AlreadyIdentified);
        }
        if !self.session.state().can_transition_to(SessionState::Identified) {
            return Err(ServerError::IllegalTransition {
                from: self.session.state(),
                to: SessionState::Identified,
            });
        }
        if !is_valid_ident(ident) {
            return Err(ServerError::InvalidIdent(ident.to_string()));
        }
        let device = self.services.registry.device_by_ident_or_create(ident)?;
        let device_id = device.id;
        self.session.identify(device)?;
        self.services
            .table
            .bind_device(self.session.id, &device_id.to_string());
        self.router = Some(ChannelRouter::new(device_id));
        tracing::info!("[{}] Identified as {} ({})", self.session.id, ident, device_id);
        Ok(())
    }

    /// Settings, commands, probes and lifecycle records sent right after
    /// identification.
    fn post_identification(&mut self, now: Instant) {
        self.push_pending_settings(now);

        let device_id = match self.session.device() {
            Some(device) => device.id,
            None => return,
        };
        match self.services.registry.settings(&device_id) {
            Ok(settings) if settings.is_empty() => self.push(Outbound::RequestAllSettings),
            Ok(_) => {}
            Err(e) => tracing::warn!("[{}] Could not read settings: {}", self.session.id, e),
        }

        self.push_commands();

        match self.services.registry.status(&device_id, STATUS_CAPABILITIES) {
            Ok(None) => self.push(Outbound::RequestStatus(STATUS_CAPABILITIES.to_string())),
            Ok(Some(_)) => {}
            Err(e) => tracing::warn!("[{}] Could not read status: {}", self.session.id, e),
        }

        self.publish(
            self.event("device_identified")
                .with("device_id", device_id.to_string()),
        );
        if let Some(sample) = self.lifecycle_sample("device_identified", Utc::now()) {
            self.services.samples.spawn_store(sample);
        }
        if let Some(sample) =
            self.lifecycle_sample("device_connected", self.session.connected_time())
        {
            self.services.samples.spawn_store(sample);
        }
    }

    /// Pushes settings the device has not acknowledged, skipping values
    /// pushed within the debounce window.
    pub fn push_pending_settings(&mut self, now: Instant) {
        let device_id = match self.session.device() {
            Some(device) => device.id,
            None => return,
        };
        let pending = match self.services.registry.settings_to_send(&device_id) {
            Ok(pending) => pending,
            Err(e) => {
                tracing::warn!("[{}] Could not read pending settings: {}", self.session.id, e);
                return;
            }
        };
        let window = self.services.policy.setting_debounce;
        let to_send: Vec<(String, String)> = pending
            .into_iter()
            .filter(|(k, v)| self.session.should_send_setting(k, v, now, window))
            .collect();
        if !to_send.is_empty() {
            tracing::debug!("[{}] Pushing {} settings", self.session.id, to_send.len());
            self.push(Outbound::Settings(to_send));
        }
    }

    /// Pushes every committed setting.
    pub fn push_all_settings(&mut self) {
        let device_id = match self.session.device() {
            Some(device) => device.id,
            None => return,
        };
        match self.services.registry.settings(&device_id) {
            Ok(settings) => self.push(Outbound::Settings(settings.into_iter().collect())),
            Err(e) => tracing::warn!("[{}] Could not read settings: {}", self.session.id, e),
        }
    }

    /// Pushes queued commands, each under a fresh short id.
    pub fn push_commands(&mut self) {
        let device_id = match self.session.device() {
            Some(device) => device.id,
            None => return,
        };
        let commands = match self.services.registry.commands(&device_id) {
            Ok(commands) => commands,
            Err(e) => {
                tracing::warn!("[{}] Could not read commands: {}", self.session.id, e);
                return;
            }
        };
        for (command_id, text) in commands {
            let short_id = self.session.track_command(command_id);
            self.push(Outbound::Command { short_id, text });
        }
    }

    /// Records a value reported by the device.
    pub fn ack_setting(&mut self, name: &str, value: &str) -> Result<(), ServerError> {
        let device_id = self.device_id()?;
        self.services.registry.ack_setting(&device_id, name, value)?;
        Ok(())
    }

    pub fn forget_setting(&mut self, name: &str) -> Result<(), ServerError> {
        let device_id = self.device_id()?;
        self.services.registry.delete_setting(&device_id, name)?;
        Ok(())
    }

    /// Resolves a short command id and acknowledges the command.
    pub fn ack_command(&mut self, short_id: u32, response: Option<String>) -> Result<(), ServerError> {
        let device_id = self.device_id()?;
        match self.session.take_command(short_id) {
            Some(command_id) => {
                self.services
                    .registry
                    .ack_command(&device_id, &command_id, response.as_deref())?;
                tracing::debug!("[{}] Command {} acknowledged", self.session.id, command_id);
            }
            None => tracing::warn!("[{}] Unknown command short id {}", self.session.id, short_id),
        }
        Ok(())
    }

    /// Asks every session of this device (this one included) to run `call`.
    pub fn notify_device_sessions(&self, call: &str) -> Result<(), ServerError> {
        let device_id = self.device_id()?;
        self.publish(BusMessage::new(
            format!("{};device_id={}", self.services.receivers_topic, device_id),
            call,
        ));
        Ok(())
    }

    pub fn device_id(&self) -> Result<uuid::Uuid, ServerError> {
        self.session
            .device()
            .map(|d| d.id)
            .ok_or(ServerError::NotIdentified)
    }

    /// Dispatches a data message by channel name.
    pub fn route_data(&mut self, channel: &str, payload: Payload) {
        if !self.session.is_identified() {
            tracing::warn!(
                "[{}] Dropping data on {:?} from unidentified device",
                self.session.id,
                channel
            );
            return;
        }

        if channel.split(':').next() == Some("echo") {
            match payload {
                Payload::Simple(payload) => self.push(Outbound::Data {
                    channel: channel.to_string(),
                    payload,
                }),
                Payload::Array(items) => self.push(Outbound::DataArray {
                    channel: channel.to_string(),
                    items,
                }),
            }
            return;
        }

        if control::is_reserved(channel) {
            let items = match payload {
                Payload::Array(items) => items,
                Payload::Simple(_) => {
                    tracing::warn!("[{}] Simple data on control channel {}", self.session.id, channel);
                    return;
                }
            };
            if let Err(e) = self.handle_control(channel, &items) {
                tracing::warn!("[{}] Control request on {} failed: {}", self.session.id, channel, e);
            }
            return;
        }

        self.forward_data(channel, payload);
    }

    fn handle_control(&mut self, channel: &str, items: &[Bytes]) -> Result<(), ServerError> {
        let device_id = self.device_id()?;
        let registry = self.services.registry.clone();
        match channel {
            control::CHANNEL_SETTINGS => match SettingsOp::parse(items)? {
                SettingsOp::GetAll => self.push_all_settings(),
                SettingsOp::Acknowledge(pairs) => {
                    for (k, v) in pairs {
                        registry.ack_setting(&device_id, &k, &v)?;
                    }
                }
                SettingsOp::Define(pairs) => {
                    for (k, v) in pairs {
                        registry.set_setting(&device_id, &k, &v)?;
                    }
                }
                SettingsOp::Forget(keys) => {
                    for k in keys {
                        registry.delete_setting(&device_id, &k)?;
                    }
                }
            },
            control::CHANNEL_STATUS => match StatusOp::parse(items)? {
                StatusOp::Report(pairs) => {
                    for (k, v) in pairs {
                        registry.set_status(&device_id, &k, &v)?;
                    }
                }
            },
            control::CHANNEL_COMMANDS => match CommandOp::parse(items)? {
                CommandOp::Acknowledge { short_id, response } => {
                    let short_id = short_id.parse::<u32>().map_err(|_| {
                        ServerError::InvalidRequest(format!("bad command id {:?}", short_id))
                    })?;
                    self.ack_command(short_id, response.map(|lines| lines.join("\n")))?;
                }
            },
            _ => {}
        }
        Ok(())
    }

    fn forward_data(&mut self, channel: &str, payload: Payload) {
        let device_id = match self.session.device() {
            Some(device) => device.id,
            None => return,
        };
        let target = match self.router.as_mut() {
            Some(router) => match router.resolve(self.services.registry.as_ref(), channel) {
                Ok(target) => target,
                Err(e) => {
                    tracing::warn!("[{}] Routing {} failed: {}", self.session.id, channel, e);
                    None
                }
            },
            None => None,
        }
        .unwrap_or_else(|| self.services.default_target.clone());

        let message = match payload {
            Payload::Simple(data) => {
                BusMessage::new(target, "data_simple").with("data", hex::encode(&data))
            }
            Payload::Array(items) => BusMessage::new(target, "data_array").with(
                "data",
                items.iter().map(hex::encode).collect::<Vec<_>>(),
            ),
        }
        .with("connection_id", self.session.id)
        .with("device_id", device_id.to_string())
        .with("channel", channel);
        self.publish(message);
    }

    /// Handles a call addressed to this session.
    pub fn handle_bus_message(&mut self, message: &BusMessage, now: Instant) -> Flow {
        tracing::debug!("[{}] Bus call {}", self.session.id, message.call);
        match message.call.as_str() {
            "disconnect" => return Flow::Close,
            "disconnect_if_not_identified" if !self.session.is_identified() => {
                return Flow::Close
            }
            "disconnect_if_not_identified" => {}
            "send_settings" => self.push_pending_settings(now),
            "send_commands" => self.push_commands(),
            other => tracing::warn!("[{}] Unhandled bus call {:?}", self.session.id, other),
        }
        Flow::Continue
    }

    /// Closes the connection if identification did not happen in time.
    pub fn check_identified(&mut self) -> Flow {
        if self.session.is_identified() {
            return Flow::Continue;
        }
        tracing::info!("[{}] Identification timeout", self.session.id);
        self.push(Outbound::Notice(NOTICE_IDENT_TIMEOUT.to_string()));
        Flow::Close
    }

    /// Pings a silent device, or gives up on it.
    pub fn check_liveness(&mut self, now: Instant) -> Flow {
        let policy = self.services.policy;
        match self.session.liveness(now, &policy) {
            LivenessAction::Nothing => Flow::Continue,
            LivenessAction::Ping(counter) => {
                self.push(Outbound::Ping(counter));
                Flow::Continue
            }
            LivenessAction::Close(notice) => {
                tracing::info!("[{}] Closing idle connection", self.session.id);
                self.push(Outbound::Notice(notice.to_string()));
                Flow::Close
            }
        }
    }

    /// Cleanup once the connection is gone.
    pub fn closed(&mut self, now: Instant) {
        if self.session.state() != SessionState::Closing {
            // only fails when already closing
            let _ = self.session.transition(SessionState::Closing);
        }
        self.services.table.remove(self.session.id);

        let duration = self.session.connection_duration(now).as_secs();
        let mut event = self
            .event("device_disconnected")
            .with("connection_duration", duration);
        if let Some(device) = self.session.device() {
            event.set("device_id", device.id.to_string());
        }
        self.publish(event);

        if let Some(mut sample) = self.lifecycle_sample("device_disconnected", Utc::now()) {
            if let Some(data) = sample.data.as_object_mut() {
                data.insert("connection_duration".to_string(), json!(duration));
            }
            self.services.samples.spawn_store(sample);
        }
        tracing::info!(
            "[{}] Connection closed after {}s",
            self.session.id,
            duration
        );
    }
}
