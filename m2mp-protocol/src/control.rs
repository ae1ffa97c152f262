//! Control sub-protocols carried as data arrays on reserved channels.
//!
//! The first array element is a short request-type token made of flag
//! letters; the remaining elements are its arguments, usually `key=value`
//! pairs.

use crate::error::ProtocolError;
use crate::message::Message;
use bytes::Bytes;

/// Settings channel.
pub const CHANNEL_SETTINGS: &str = "_set";
/// Status channel.
pub const CHANNEL_STATUS: &str = "_sta";
/// Commands channel.
pub const CHANNEL_COMMANDS: &str = "_cmd";

/// Returns whether `channel` is reserved for control traffic.
pub fn is_reserved(channel: &str) -> bool {
    matches!(channel, CHANNEL_SETTINGS | CHANNEL_STATUS | CHANNEL_COMMANDS)
}

/// A settings request sent by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SettingsOp {
    /// The device asks for every committed setting.
    GetAll,
    /// The device reports the values it applied.
    Acknowledge(Vec<(String, String)>),
    /// The device defines values on its own.
    Define(Vec<(String, String)>),
    /// The device does not know these keys.
    Forget(Vec<String>),
}

impl SettingsOp {
    pub fn parse(items: &[Bytes]) -> Result<Self, ProtocolError> {
        let (token, args) = split_request(CHANNEL_SETTINGS, items)?;
        match token.as_str() {
            "ga" => Ok(SettingsOp::GetAll),
            "u" => Ok(SettingsOp::Forget(args.iter().map(|a| text(a)).collect())),
            t if t.contains('g') => Ok(SettingsOp::Acknowledge(pairs(args))),
            t if t.contains('s') => Ok(SettingsOp::Define(pairs(args))),
            _ => Err(unknown(CHANNEL_SETTINGS, token.clone())),
        }
    }
}

/// A status report sent by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StatusOp {
    Report(Vec<(String, String)>),
}

impl StatusOp {
    pub fn parse(items: &[Bytes]) -> Result<Self, ProtocolError> {
        let (token, args) = split_request(CHANNEL_STATUS, items)?;
        if token.contains('g') {
            Ok(StatusOp::Report(pairs(args)))
        } else {
            Err(unknown(CHANNEL_STATUS, token))
        }
    }
}

/// A command acknowledgment sent by a device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandOp {
    Acknowledge {
        short_id: String,
        /// Response lines, when the device attached any.
        response: Option<Vec<String>>,
    },
}

impl CommandOp {
    pub fn parse(items: &[Bytes]) -> Result<Self, ProtocolError> {
        let (token, args) = split_request(CHANNEL_COMMANDS, items)?;
        match args.split_first() {
            Some((short_id, rest)) if token.contains('a') => Ok(CommandOp::Acknowledge {
                short_id: text(short_id),
                response: if rest.is_empty() {
                    None
                } else {
                    Some(rest.iter().map(|r| text(r)).collect())
                },
            }),
            _ => Err(unknown(CHANNEL_COMMANDS, token)),
        }
    }
}

/// Pushes settings to a device: `"sg", key=value...`.
pub fn settings_push<'a, I>(entries: I) -> Message
where
    I: IntoIterator<Item = (&'a str, &'a str)>,
{
    let mut items = vec![Bytes::from_static(b"sg")];
    items.extend(
        entries
            .into_iter()
            .map(|(k, v)| Bytes::from(format!("{k}={v}"))),
    );
    Message::DataArray {
        channel: CHANNEL_SETTINGS.to_string(),
        items,
    }
}

/// Asks a device to report every setting it holds.
pub fn settings_request_all() -> Message {
    Message::array(CHANNEL_SETTINGS, ["ga"])
}

/// Asks a device to report one status value.
pub fn status_request(key: &str) -> Message {
    Message::array(CHANNEL_STATUS, [Bytes::from_static(b"g"), Bytes::from(key.to_string())])
}

/// Sends a command; multi-line command text becomes one element per line.
pub fn command_push(short_id: u32, command: &str) -> Message {
    let mut items = vec![Bytes::from_static(b"e"), Bytes::from(short_id.to_string())];
    items.extend(command.split('\n').map(|line| Bytes::from(line.to_string())));
    Message::DataArray {
        channel: CHANNEL_COMMANDS.to_string(),
        items,
    }
}

fn split_request<'a>(
    channel: &str,
    items: &'a [Bytes],
) -> Result<(String, &'a [Bytes]), ProtocolError> {
    match items.split_first() {
        Some((token, args)) if !token.is_empty() => Ok((text(token), args)),
        _ => Err(ProtocolError::MissingRequestType(channel.to_string())),
    }
}

fn unknown(channel: &str, token: String) -> ProtocolError {
    ProtocolError::UnknownRequestType {
        channel: channel.to_string(),
        token,
    }
}

fn text(bytes: &Bytes) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Splits `key=value` elements, skipping anything without `=`.
fn pairs(args: &[Bytes]) -> Vec<(String, String)> {
    args.iter()
        .filter_map(|a| {
            let s = text(a);
            s.split_once('=')
                .map(|(k, v)| (k.to_string(), v.to_string()))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn items(values: &[&'static str]) -> Vec<Bytes> {
        values.iter().map(|v| Bytes::from_static(v.as_bytes())).collect()
    }

    #[test]
    fn test_settings_ops() {
        assert_eq!(SettingsOp::parse(&items(&["ga"])).unwrap(), SettingsOp::GetAll);
        assert_eq!(
            SettingsOp::parse(&items(&["sg", "a=1", "junk", "b=x=y"])).unwrap(),
            SettingsOp::Acknowledge(vec![
                ("a".to_string(), "1".to_string()),
                ("b".to_string(), "x=y".to_string()),
            ])
        );
        assert_eq!(
            SettingsOp::parse(&items(&["s", "a=2"])).unwrap(),
            SettingsOp::Define(vec![("a".to_string(), "2".to_string())])
        );
        assert_eq!(
            SettingsOp::parse(&items(&["u", "old", "gone"])).unwrap(),
            SettingsOp::Forget(vec!["old".to_string(), "gone".to_string()])
        );
    }

    #[test]
    fn test_missing_or_unknown_type() {
        assert!(matches!(
            SettingsOp::parse(&[]),
            Err(ProtocolError::MissingRequestType(_))
        ));
        let err = StatusOp::parse(&items(&["x", "a=1"])).unwrap_err();
        assert!(!err.is_fatal());
        assert!(CommandOp::parse(&items(&["a"])).is_err());
    }

    #[test]
    fn test_command_ack() {
        assert_eq!(
            CommandOp::parse(&items(&["a", "3"])).unwrap(),
            CommandOp::Acknowledge {
                short_id: "3".to_string(),
                response: None,
            }
        );
        assert_eq!(
            CommandOp::parse(&items(&["a", "4", "line1", "line2"])).unwrap(),
            CommandOp::Acknowledge {
                short_id: "4".to_string(),
                response: Some(vec!["line1".to_string(), "line2".to_string()]),
            }
        );
    }

    #[test]
    fn test_builders() {
        assert_eq!(
            settings_push([("a", "1"), ("b", "2")]),
            Message::array("_set", ["sg", "a=1", "b=2"])
        );
        assert_eq!(settings_request_all(), Message::array("_set", ["ga"]));
        assert_eq!(status_request("cap"), Message::array("_sta", ["g", "cap"]));
        assert_eq!(
            command_push(2, "reboot\nnow"),
            Message::array("_cmd", ["e", "2", "reboot", "now"])
        );
        assert!(is_reserved("_cmd"));
        assert!(!is_reserved("echo"));
    }
}
