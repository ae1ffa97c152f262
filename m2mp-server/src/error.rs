//! Server error types.

use crate::bus::BusError;
use crate::session::SessionState;
use thiserror::Error;

/// Server errors.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] m2mp_protocol::ProtocolError),

    #[error("registry error: {0}")]
    Registry(#[from] m2mp_registry::RegistryError),

    #[error("bus error: {0}")]
    Bus(#[from] BusError),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("session not identified")]
    NotIdentified,

    #[error("session already identified")]
    AlreadyIdentified,

    #[error("invalid identifier: {0}")]
    InvalidIdent(String),

    #[error("illegal session transition {from:?} -> {to:?}")]
    IllegalTransition { from: SessionState, to: SessionState },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("server shutting down")]
    ShuttingDown,
}

impl ServerError {
    /// Returns whether the connection must be closed after this error.
    pub fn is_fatal(&self) -> bool {
        match self {
            ServerError::Io(_) | ServerError::ShuttingDown => true,
            ServerError::Protocol(e) => e.is_fatal(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m2mp_protocol::ProtocolError;

    #[test]
    fn test_fatality() {
        assert!(ServerError::from(ProtocolError::UnknownHeader(0x99)).is_fatal());
        assert!(!ServerError::from(ProtocolError::MissingRequestType("_set".into())).is_fatal());
        assert!(!ServerError::NotIdentified.is_fatal());
        assert!(ServerError::ShuttingDown.is_fatal());
    }
}
