//! ALIP, the line-oriented ASCII sibling of the binary protocol.
//!
//! Every request and reply is one `\n`-terminated line made of a command
//! token and its space-separated arguments.

use crate::error::ProtocolError;
use chrono::{DateTime, NaiveDateTime, TimeZone, Utc};
use thiserror::Error;

/// Longest accepted line, terminator excluded.
pub const MAX_LINE_LENGTH: usize = 64 * 1024;

/// Errors answered to the device with an `ERR` line.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AlipError {
    #[error("Command \"{0}\" not understood !")]
    NotUnderstood(String),

    #[error("Command not understood: {0}")]
    InvalidSubcommand(String),

    #[error("Debug command \"{0}\" is not understood !")]
    UnknownDebug(String),

    #[error("{0}")]
    Usage(&'static str),

    #[error("Could not guess time: {0}")]
    InvalidTime(String),

    #[error("Invalid {what}: {value}")]
    InvalidNumber { what: &'static str, value: String },

    #[error("Invalid json: {0}")]
    InvalidJson(String),

    #[error("Forbidden data type: {0}")]
    ForbiddenType(String),
}

/// A parsed device request.
#[derive(Debug, Clone, PartialEq)]
pub enum AlipCommand {
    /// `ID <ident>`
    Ident(String),
    /// `S ...`
    Setting(SettingRequest),
    /// `C ...`
    Command(CommandRequest),
    /// `D <type> <data>`, stamped with the reception time.
    Data { data_type: String, content: String },
    /// `E <time> <type> <data>`
    TimedData {
        time: DateTime<Utc>,
        data_type: String,
        content: String,
    },
    /// `J <time> <type> <json>`
    JsonData {
        time: DateTime<Utc>,
        data_type: String,
        value: serde_json::Value,
    },
    /// `A <n>`: device ping, answered with `B <n>`.
    Ping(String),
    /// `B <n>`: device answer to a server ping.
    Pong(String),
    /// `T`: time request.
    Time,
    /// `F ...`
    File(FileRequest),
    /// `DB ...`
    Debug(DebugRequest),
    /// `QUIT`
    Quit,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingRequest {
    /// `S A <name> <value>` or `S S <name> <value>`
    Acknowledge { name: String, value: String },
    /// `S GA`
    GetAll,
    /// `S U <name>`
    Forget(String),
    /// `S G <name>`
    Get(String),
    /// `S G`: settings waiting to be sent.
    GetPending,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandRequest {
    /// `C A <short id>`
    Acknowledge(u32),
    /// `C L`
    List,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileRequest {
    /// `F N <name>`
    Select(String),
    /// `F S`
    Size,
    /// `F G <offset> <size>`
    Get { offset: usize, size: usize },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DebugRequest {
    Ident,
    Source,
    Connected,
    SetSetting { name: String, value: String },
    AddCommand(String),
    Last(usize),
    LogLevel(Option<u8>),
    Version,
}

impl AlipCommand {
    pub fn parse(line: &str) -> Result<Self, AlipError> {
        let (cmd, content) = line.split_once(' ').unwrap_or((line, ""));
        match cmd {
            "ID" => Ok(AlipCommand::Ident(content.to_string())),
            "S" => SettingRequest::parse(content).map(AlipCommand::Setting),
            "C" => CommandRequest::parse(content).map(AlipCommand::Command),
            "D" => {
                let (data_type, content) = content
                    .split_once(' ')
                    .ok_or(AlipError::Usage("You need to specify a type and the content."))?;
                Ok(AlipCommand::Data {
                    data_type: data_type.to_string(),
                    content: content.to_string(),
                })
            }
            "E" => {
                let mut tokens = content.splitn(3, ' ');
                match (tokens.next(), tokens.next(), tokens.next()) {
                    (Some(time), Some(data_type), Some(content)) => Ok(AlipCommand::TimedData {
                        time: parse_device_time(time)?,
                        data_type: data_type.to_string(),
                        content: content.to_string(),
                    }),
                    _ => Err(AlipError::Usage(
                        "You need to specify a time, a type and the content.",
                    )),
                }
            }
            "J" => {
                let mut tokens = content.splitn(3, ' ');
                let (time, data_type, body) = match (tokens.next(), tokens.next(), tokens.next()) {
                    (Some(t), Some(d), Some(b)) => (t, d, b),
                    _ => {
                        return Err(AlipError::Usage(
                            "You need to specify a time, a type and the content.",
                        ))
                    }
                };
                let time = parse_device_time(time)?;
                if data_type.starts_with('_') {
                    return Err(AlipError::ForbiddenType(data_type.to_string()));
                }
                let value = serde_json::from_str(body)
                    .map_err(|e| AlipError::InvalidJson(format!("{body}: {e}")))?;
                Ok(AlipCommand::JsonData {
                    time,
                    data_type: data_type.to_string(),
                    value,
                })
            }
            "A" => Ok(AlipCommand::Ping(content.to_string())),
            "B" => Ok(AlipCommand::Pong(content.to_string())),
            "T" => Ok(AlipCommand::Time),
            "F" => FileRequest::parse(content).map(AlipCommand::File),
            "DB" => DebugRequest::parse(content).map(AlipCommand::Debug),
            "QUIT" => Ok(AlipCommand::Quit),
            _ => Err(AlipError::NotUnderstood(cmd.to_string())),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            AlipCommand::Ident(_) => "ident",
            AlipCommand::Setting(_) => "setting",
            AlipCommand::Command(_) => "command",
            AlipCommand::Data { .. } => "data",
            AlipCommand::TimedData { .. } => "timed_data",
            AlipCommand::JsonData { .. } => "json_data",
            AlipCommand::Ping(_) => "ping",
            AlipCommand::Pong(_) => "pong",
            AlipCommand::Time => "time",
            AlipCommand::File(_) => "file",
            AlipCommand::Debug(_) => "debug",
            AlipCommand::Quit => "quit",
        }
    }
}

impl SettingRequest {
    fn parse(content: &str) -> Result<Self, AlipError> {
        let tokens: Vec<&str> = content.splitn(3, ' ').collect();
        match tokens.as_slice() {
            ["A" | "S", name, value] => Ok(SettingRequest::Acknowledge {
                name: name.to_string(),
                value: value.to_string(),
            }),
            ["GA"] => Ok(SettingRequest::GetAll),
            ["U", name] => Ok(SettingRequest::Forget(name.to_string())),
            ["G", name] => Ok(SettingRequest::Get(name.to_string())),
            ["G", ..] => Ok(SettingRequest::GetPending),
            _ => Err(AlipError::InvalidSubcommand(content.to_string())),
        }
    }
}

impl CommandRequest {
    fn parse(content: &str) -> Result<Self, AlipError> {
        let tokens: Vec<&str> = content.split(' ').collect();
        match tokens.as_slice() {
            ["A", id] if !id.is_empty() => {
                id.parse()
                    .map(CommandRequest::Acknowledge)
                    .map_err(|_| AlipError::InvalidNumber {
                        what: "ack number",
                        value: id.to_string(),
                    })
            }
            ["L"] => Ok(CommandRequest::List),
            _ => Err(AlipError::InvalidSubcommand(content.to_string())),
        }
    }
}

impl FileRequest {
    fn parse(content: &str) -> Result<Self, AlipError> {
        let tokens: Vec<&str> = content.splitn(4, ' ').collect();
        match tokens.as_slice() {
            ["N", name] => Ok(FileRequest::Select(name.to_string())),
            ["S"] => Ok(FileRequest::Size),
            ["G", offset, size] => Ok(FileRequest::Get {
                offset: number("offset", offset)?,
                size: number("size", size)?,
            }),
            _ => Err(AlipError::InvalidSubcommand(content.to_string())),
        }
    }
}

impl DebugRequest {
    fn parse(content: &str) -> Result<Self, AlipError> {
        let (cmd, rest) = content.split_once(' ').unwrap_or((content, ""));
        match cmd {
            "ID" => Ok(DebugRequest::Ident),
            "SOURCE" => Ok(DebugRequest::Source),
            "CONNECTED" => Ok(DebugRequest::Connected),
            "SET_SETTING" => {
                let mut tokens = rest.split(' ');
                match (tokens.next(), tokens.next()) {
                    (Some(name), Some(value)) if !name.is_empty() => {
                        Ok(DebugRequest::SetSetting {
                            name: name.to_string(),
                            value: value.to_string(),
                        })
                    }
                    _ => Err(AlipError::Usage("SET_SETTING needs a name and a value.")),
                }
            }
            "ADD_COMMAND" if !rest.is_empty() => Ok(DebugRequest::AddCommand(rest.to_string())),
            "ADD_COMMAND" => Err(AlipError::Usage("ADD_COMMAND needs a command.")),
            "LAST" if rest.is_empty() => Ok(DebugRequest::Last(10)),
            "LAST" => number("last arg", rest).map(DebugRequest::Last),
            "LOGLEVEL" if rest.is_empty() => Ok(DebugRequest::LogLevel(None)),
            "LOGLEVEL" => number("loglevel", rest).map(|l| DebugRequest::LogLevel(Some(l))),
            "VERSION" => Ok(DebugRequest::Version),
            _ => Err(AlipError::UnknownDebug(cmd.to_string())),
        }
    }
}

fn number<T: std::str::FromStr>(what: &'static str, value: &str) -> Result<T, AlipError> {
    value.parse().map_err(|_| AlipError::InvalidNumber {
        what,
        value: value.to_string(),
    })
}

/// Interprets the time formats devices use.
///
/// * 10 or 11 digits: Unix seconds
/// * 12 characters: `yyMMddHHmmss`
/// * 14 characters or more: `yyyyMMddHHmmss`
pub fn parse_device_time(input: &str) -> Result<DateTime<Utc>, AlipError> {
    let invalid = || AlipError::InvalidTime(input.to_string());
    let naive = match input.len() {
        10 | 11 => {
            let secs: i64 = input.parse().map_err(|_| invalid())?;
            return Utc.timestamp_opt(secs, 0).single().ok_or_else(invalid);
        }
        12 => NaiveDateTime::parse_from_str(input, "%y%m%d%H%M%S"),
        n if n >= 14 => NaiveDateTime::parse_from_str(input, "%Y%m%d%H%M%S"),
        _ => return Err(invalid()),
    };
    naive
        .map(|n| Utc.from_utc_datetime(&n))
        .map_err(|_| invalid())
}

/// Splits a byte stream into lines.
pub struct LineDecoder {
    buffer: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(4096),
        }
    }

    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Returns the next complete line with its `\r\n` or `\n` stripped.
    pub fn decode_line(&mut self) -> Result<Option<String>, ProtocolError> {
        match self.buffer.iter().position(|&b| b == b'\n') {
            Some(pos) => {
                if pos > MAX_LINE_LENGTH {
                    return Err(ProtocolError::LineTooLong {
                        len: pos,
                        max: MAX_LINE_LENGTH,
                    });
                }
                let line = self.buffer.drain(..=pos).collect::<Vec<_>>();
                let mut end = line.len() - 1;
                if end > 0 && line[end - 1] == b'\r' {
                    end -= 1;
                }
                Ok(Some(String::from_utf8_lossy(&line[..end]).into_owned()))
            }
            None if self.buffer.len() > MAX_LINE_LENGTH => Err(ProtocolError::LineTooLong {
                len: self.buffer.len(),
                max: MAX_LINE_LENGTH,
            }),
            None => Ok(None),
        }
    }

    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}

impl Default for LineDecoder {
    fn default() -> Self {
        Self::new()
    }
}
