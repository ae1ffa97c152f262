//! Decoded M2MP messages.

use bytes::Bytes;

/// A message exchanged with a device, with channel names resolved.
///
/// Ping and pong share opcodes on the wire; the decoder resolves them into
/// `PingRequest` / `PingResponse` from its local role so nothing downstream
/// looks at raw headers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Message {
    IdentRequest {
        ident: String,
    },
    IdentResponse {
        ok: bool,
    },
    PingRequest {
        counter: u8,
    },
    PingResponse {
        counter: u8,
    },
    DataSimple {
        channel: String,
        payload: Bytes,
    },
    DataArray {
        channel: String,
        items: Vec<Bytes>,
    },
    /// Explicit channel declaration. Received declarations are applied by the
    /// decoder and never surface as messages.
    ChannelDeclared {
        id: u8,
        name: String,
    },
    /// The connection ended. Produced by the reading side, never encoded.
    Disconnected {
        cause: String,
    },
}

impl Message {
    pub fn data(channel: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Message::DataSimple {
            channel: channel.into(),
            payload: payload.into(),
        }
    }

    pub fn array<I, T>(channel: impl Into<String>, items: I) -> Self
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        Message::DataArray {
            channel: channel.into(),
            items: items.into_iter().map(Into::into).collect(),
        }
    }

    /// Short name used in logs.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::IdentRequest { .. } => "ident_request",
            Message::IdentResponse { .. } => "ident_response",
            Message::PingRequest { .. } => "ping_request",
            Message::PingResponse { .. } => "ping_response",
            Message::DataSimple { .. } => "data_simple",
            Message::DataArray { .. } => "data_array",
            Message::ChannelDeclared { .. } => "channel_declared",
            Message::Disconnected { .. } => "disconnected",
        }
    }

    /// Channel name of a data message.
    pub fn channel(&self) -> Option<&str> {
        match self {
            Message::DataSimple { channel, .. } | Message::DataArray { channel, .. } => {
                Some(channel)
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_array_builder() {
        let msg = Message::array("_set", ["sg", "a=1"]);
        assert_eq!(
            msg,
            Message::DataArray {
                channel: "_set".to_string(),
                items: vec![Bytes::from_static(b"sg"), Bytes::from_static(b"a=1")],
            }
        );
        assert_eq!(msg.kind(), "data_array");
        assert_eq!(msg.channel(), Some("_set"));
    }

    #[test]
    fn test_channel_only_on_data() {
        assert_eq!(Message::PingRequest { counter: 1 }.channel(), None);
        assert_eq!(Message::data("echo", "x").channel(), Some("echo"));
    }
}
