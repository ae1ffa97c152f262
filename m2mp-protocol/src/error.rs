//! Protocol error types.

use thiserror::Error;

/// Errors raised while framing or interpreting device traffic.
///
/// Framing errors are fatal for the connection that produced them. The
/// control sub-protocol errors (`MissingRequestType`, `UnknownRequestType`)
/// only concern a single message.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("unknown frame header: {0:#04x}")]
    UnknownHeader(u8),

    #[error("frame too large: {size} bytes (max {max})")]
    FrameTooLarge { size: usize, max: usize },

    #[error("empty data frame: missing channel id")]
    EmptyDataFrame,

    #[error("malformed array element at offset {offset}")]
    MalformedArray { offset: usize },

    #[error("channel name too long: {0} bytes (max 254)")]
    ChannelNameTooLong(usize),

    #[error("identifier too long: {0} bytes (max 255)")]
    IdentTooLong(usize),

    #[error("{0} cannot be sent by a {1}")]
    WrongRole(&'static str, &'static str),

    #[error("{0} is not a wire message")]
    NotEncodable(&'static str),

    #[error("line too long: {len} bytes (max {max})")]
    LineTooLong { len: usize, max: usize },

    #[error("missing request type on channel {0}")]
    MissingRequestType(String),

    #[error("unknown request type {token:?} on channel {channel}")]
    UnknownRequestType { channel: String, token: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    /// Returns whether the connection must be torn down after this error.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            ProtocolError::MissingRequestType(_) | ProtocolError::UnknownRequestType { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_protocol_error_display() {
        let err = ProtocolError::UnknownHeader(0x7f);
        assert!(err.to_string().contains("0x7f"));

        let err = ProtocolError::FrameTooLarge {
            size: 2_000_000,
            max: 1_048_576,
        };
        assert!(err.to_string().contains("2000000"));

        let err = ProtocolError::UnknownRequestType {
            channel: "_set".to_string(),
            token: "zz".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.contains("_set"));
        assert!(msg.contains("zz"));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(ProtocolError::UnknownHeader(0x10).is_fatal());
        assert!(ProtocolError::MalformedArray { offset: 3 }.is_fatal());
        assert!(!ProtocolError::MissingRequestType("_cmd".to_string()).is_fatal());
    }
}
