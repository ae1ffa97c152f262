//! # m2mp-protocol
//!
//! Wire protocols spoken by M2MP devices.
//!
//! This crate provides:
//! - Binary framing with 1/2/4 byte lengths and channel multiplexing
//! - Per-connection channel name tables
//! - Role-aware message encoding and decoding
//! - The settings, status and command sub-protocols on reserved channels
//! - ALIP line decoding and command parsing

pub mod alip;
pub mod channel;
pub mod codec;
pub mod control;
pub mod error;
pub mod frame;
pub mod message;

pub use alip::{AlipCommand, AlipError, LineDecoder};
pub use channel::{RecvChannels, SendChannels};
pub use codec::{Decoder, Encoder};
pub use control::{CommandOp, SettingsOp, StatusOp};
pub use error::ProtocolError;
pub use frame::{Frame, LengthWidth, Role, MAX_FRAME_SIZE};
pub use message::Message;

/// Default port for binary M2MP connections.
pub const DEFAULT_PORT: u16 = 3000;

/// Default port for ALIP connections.
pub const DEFAULT_ALIP_PORT: u16 = 3010;
