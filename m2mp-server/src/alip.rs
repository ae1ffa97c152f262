//! ALIP: the line-oriented text transport.
//!
//! Every request is one line, `<CMD> [content]`. Failures are answered with
//! `ERR <reason>` and the connection stays open.

use crate::connection::Transport;
use crate::core::{Flow, Outbound, SessionCore};
use crate::error::ServerError;
use crate::sensors;
use bytes::{BufMut, BytesMut};
use chrono::{DateTime, Utc};
use m2mp_protocol::alip::{
    AlipCommand, AlipError, CommandRequest, DebugRequest, FileRequest, LineDecoder,
    SettingRequest,
};
use m2mp_registry::{is_valid_ident, series_key, TimedSample};
use serde_json::Value;
use thiserror::Error;
use tokio::time::Instant;

/// Scratch key holding the selected firmware file.
const SCRATCH_FILE: &str = "file";

/// Log level from which every exchanged line is logged at info level.
const LOG_LINES_LEVEL: u8 = 3;

/// Reasons a request is refused.
#[derive(Debug, Error)]
enum Refusal {
    #[error("You must be identified !")]
    NotIdentified,

    #[error("You need to be identified to use settings...")]
    SettingsNotIdentified,

    #[error("Not identified !")]
    DebugNotIdentified,

    #[error("You already identified !")]
    AlreadyIdentified,

    #[error("Invalid identification !")]
    InvalidIdent,

    #[error("no file selected")]
    NoFileSelected,

    #[error("{0}")]
    Request(#[from] AlipError),

    #[error("{0}")]
    Server(#[from] ServerError),
}

/// Server side of an ALIP connection.
#[derive(Debug, Default)]
pub struct AlipTransport;

impl AlipTransport {
    pub fn new() -> Self {
        Self
    }

    fn dispatch(
        &mut self,
        core: &mut SessionCore,
        command: AlipCommand,
        now: Instant,
    ) -> Result<Flow, Refusal> {
        match command {
            AlipCommand::Ident(ident) => {
                if core.session.is_identified() {
                    return Err(Refusal::AlreadyIdentified);
                }
                if !is_valid_ident(&ident) {
                    return Err(Refusal::InvalidIdent);
                }
                core.identify(&ident, now);
            }
            AlipCommand::Setting(request) => {
                if !core.session.is_identified() {
                    return Err(Refusal::SettingsNotIdentified);
                }
                self.setting(core, request, now)?;
            }
            AlipCommand::Command(request) => {
                if !core.session.is_identified() {
                    return Err(Refusal::SettingsNotIdentified);
                }
                match request {
                    CommandRequest::Acknowledge(short_id) => core.ack_command(short_id, None)?,
                    CommandRequest::List => core.push_commands(),
                }
            }
            AlipCommand::Data { data_type, content } => {
                self.store(core, Utc::now(), &data_type, &content)?
            }
            AlipCommand::TimedData {
                time,
                data_type,
                content,
            } => self.store(core, time, &data_type, &content)?,
            AlipCommand::JsonData {
                time,
                data_type,
                value,
            } => {
                let device_id = core.device_id().map_err(|_| Refusal::NotIdentified)?;
                core.services().samples.spawn_store(TimedSample::new(
                    series_key(&device_id),
                    data_type,
                    time,
                    value,
                ));
            }
            AlipCommand::Ping(content) => {
                if !core.session.is_identified() {
                    return Err(Refusal::NotIdentified);
                }
                core.push(Outbound::Line(format!("B {}", content)));
            }
            AlipCommand::Pong(_) => {}
            AlipCommand::Time => core.push(Outbound::Line(format!("T {}", Utc::now().timestamp()))),
            AlipCommand::File(request) => {
                if !core.session.is_identified() {
                    return Err(Refusal::NotIdentified);
                }
                self.file(core, request)?;
            }
            AlipCommand::Debug(request) => self.debug(core, request, now)?,
            AlipCommand::Quit => {
                core.push(Outbound::Line("QUIT bye !".to_string()));
                return Ok(Flow::Close);
            }
        }
        Ok(Flow::Continue)
    }

    fn setting(
        &mut self,
        core: &mut SessionCore,
        request: SettingRequest,
        now: Instant,
    ) -> Result<(), Refusal> {
        match request {
            SettingRequest::Acknowledge { name, value } => core.ack_setting(&name, &value)?,
            SettingRequest::GetAll => core.push_all_settings(),
            SettingRequest::Forget(name) => core.forget_setting(&name)?,
            SettingRequest::Get(name) => {
                let device_id = core.device_id()?;
                let value = core
                    .registry()
                    .setting(&device_id, &name)
                    .map_err(ServerError::from)?
                    .unwrap_or_default();
                core.push(Outbound::Line(format!("S S {} {}", name, value)));
            }
            SettingRequest::GetPending => core.push_pending_settings(now),
        }
        Ok(())
    }

    /// Runs a data line through the sensor processors and stores it.
    fn store(
        &mut self,
        core: &mut SessionCore,
        time: DateTime<Utc>,
        data_type: &str,
        content: &str,
    ) -> Result<(), Refusal> {
        let device_id = core.device_id().map_err(|_| Refusal::NotIdentified)?;
        if data_type == "echo" {
            core.push(Outbound::Line(format!("D echo {}", content)));
            return Ok(());
        }
        let sample = sensors::process(data_type, content)?;
        if core.session.log_level() >= 9 {
            tracing::info!("[{}] Storing {} {}", core.session.id, sample.data_type, sample.data);
        }
        core.services().samples.spawn_store(TimedSample::new(
            series_key(&device_id),
            sample.data_type,
            sample.time.unwrap_or(time),
            sample.data,
        ));
        Ok(())
    }

    fn file(&mut self, core: &mut SessionCore, request: FileRequest) -> Result<(), Refusal> {
        match request {
            FileRequest::Select(name) => {
                let found = core
                    .registry()
                    .firmware(&name)
                    .map_err(ServerError::from)?
                    .is_some();
                core.session
                    .set_scratch(SCRATCH_FILE, if found { name } else { String::new() });
                core.push(Outbound::Line(format!("F N {}", u8::from(found))));
            }
            FileRequest::Size => {
                let content = self.selected_file(core)?;
                core.push(Outbound::Line(format!("F S {}", content.len())));
            }
            FileRequest::Get { offset, size } => {
                let content = self.selected_file(core)?;
                let start = offset.min(content.len());
                let end = offset.saturating_add(size).min(content.len());
                core.push(Outbound::Line(format!(
                    "F G {} {}",
                    offset,
                    hex::encode(&content[start..end])
                )));
            }
        }
        Ok(())
    }

    fn selected_file(&self, core: &SessionCore) -> Result<bytes::Bytes, Refusal> {
        let name = match core.session.scratch(SCRATCH_FILE) {
            Some(name) if !name.is_empty() => name,
            _ => return Err(Refusal::NoFileSelected),
        };
        core.registry()
            .firmware(name)
            .map_err(ServerError::from)?
            .ok_or(Refusal::NoFileSelected)
    }

    fn debug(
        &mut self,
        core: &mut SessionCore,
        request: DebugRequest,
        now: Instant,
    ) -> Result<(), Refusal> {
        let line = match request {
            DebugRequest::Ident => {
                let device_id = core.device_id().map_err(|_| Refusal::DebugNotIdentified)?;
                format!("DB ID {}", device_id)
            }
            DebugRequest::Source => {
                format!("DB SOURCE {} {}", core.session.remote_addr, core.session.id)
            }
            DebugRequest::Connected => format!(
                "DB CONNECTED {}",
                core.session.connection_duration(now).as_secs()
            ),
            DebugRequest::SetSetting { name, value } => {
                let device_id = core.device_id().map_err(|_| Refusal::DebugNotIdentified)?;
                core.registry()
                    .set_setting(&device_id, &name, &value)
                    .map_err(ServerError::from)?;
                core.push(Outbound::Line("DB SET_SETTING OK".to_string()));
                core.notify_device_sessions("send_settings")?;
                return Ok(());
            }
            DebugRequest::AddCommand(command) => {
                let device_id = core.device_id().map_err(|_| Refusal::DebugNotIdentified)?;
                core.registry()
                    .add_command(&device_id, &command)
                    .map_err(ServerError::from)?;
                core.push(Outbound::Line("DB ADD_COMMAND OK".to_string()));
                core.notify_device_sessions("send_commands")?;
                return Ok(());
            }
            DebugRequest::Last(count) => {
                let device_id = core.device_id().map_err(|_| Refusal::DebugNotIdentified)?;
                let samples = core
                    .services()
                    .samples
                    .store_handle()
                    .latest(&series_key(&device_id), count)
                    .map_err(ServerError::from)?;
                core.push(Outbound::Line("BEGIN LAST".to_string()));
                for sample in samples {
                    let data = match &sample.data {
                        Value::String(s) => s.clone(),
                        other => other.to_string(),
                    };
                    core.push(Outbound::Line(format!(
                        "{}, {:>10}, {}",
                        sample.time.format("%Y-%m-%d %H:%M:%S"),
                        sample.data_type,
                        data
                    )));
                }
                "END".to_string()
            }
            DebugRequest::LogLevel(level) => {
                if let Some(level) = level {
                    core.session.set_log_level(level);
                }
                format!("DB LOGLEVEL {}", core.session.log_level())
            }
            DebugRequest::Version => format!("DB VERSION {}", env!("CARGO_PKG_VERSION")),
        };
        core.push(Outbound::Line(line));
        Ok(())
    }
}

impl Transport for AlipTransport {
    type Decoder = LineDecoder;

    fn name(&self) -> &'static str {
        "alip"
    }

    fn decoder(&mut self) -> LineDecoder {
        LineDecoder::new()
    }

    fn handle(&mut self, core: &mut SessionCore, line: String, now: Instant) -> Flow {
        if core.session.log_level() >= LOG_LINES_LEVEL {
            tracing::info!("[{}] --> {}", core.session.id, line);
        } else {
            tracing::trace!("[{}] --> {}", core.session.id, line);
        }

        let result = AlipCommand::parse(&line)
            .map_err(Refusal::from)
            .and_then(|command| self.dispatch(core, command, now));
        match result {
            Ok(flow) => flow,
            Err(refusal) => {
                tracing::warn!("[{}] ERROR: {}", core.session.id, refusal);
                core.push(Outbound::Line(format!("ERR {}", refusal)));
                Flow::Continue
            }
        }
    }

    fn encode(
        &mut self,
        core: &SessionCore,
        out: &Outbound,
        dst: &mut BytesMut,
    ) -> Result<(), ServerError> {
        let mut line = |text: &str| {
            if core.session.log_level() >= LOG_LINES_LEVEL {
                tracing::info!("[{}] <-- {}", core.session.id, text);
            }
            dst.put_slice(text.as_bytes());
            dst.put_u8(b'\n');
        };
        match out {
            Outbound::IdentResult(ok) => line(if *ok { "ID 1" } else { "ID 0" }),
            Outbound::Ping(counter) => line(&format!("A {}", counter)),
            Outbound::Pong(counter) => line(&format!("B {}", counter)),
            Outbound::Settings(settings) => {
                for (k, v) in settings {
                    line(&format!("S S {} {}", k, v));
                }
            }
            Outbound::RequestAllSettings => line("S GA"),
            Outbound::Command { short_id, text } => line(&format!("C {} {}", short_id, text)),
            // capabilities are not probed over ALIP
            Outbound::RequestStatus(_) => {}
            Outbound::Data { channel, payload } => {
                line(&format!("D {} {}", channel, String::from_utf8_lossy(payload)))
            }
            Outbound::DataArray { channel, items } => {
                let items: Vec<_> = items.iter().map(|i| String::from_utf8_lossy(i)).collect();
                line(&format!("D {} {}", channel, items.join(" ")))
            }
            Outbound::Line(text) => line(text),
            Outbound::Notice(notice) => line(&format!("QUIT {}", notice)),
        }
        Ok(())
    }
}
