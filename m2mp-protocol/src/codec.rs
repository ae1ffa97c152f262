//! Encoder and decoder for M2MP messages.
//!
//! Both halves are stateful: the encoder owns the outgoing channel table and
//! the decoder owns the incoming one plus its read buffer. A connection uses
//! one of each, typically on different tasks.

use crate::channel::{ChannelId, RecvChannels, SendChannels};
use crate::error::ProtocolError;
use crate::frame::{Frame, Role};
use crate::message::Message;
use bytes::{Bytes, BytesMut};

/// Creates a fresh encoder/decoder pair for one connection.
pub fn pair(role: Role) -> (Encoder, Decoder) {
    (Encoder::new(role), Decoder::new(role))
}

/// Encodes messages into frames.
#[derive(Debug)]
pub struct Encoder {
    role: Role,
    channels: SendChannels,
}

impl Encoder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            channels: SendChannels::new(),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Appends the frames for `message` to `dst`.
    ///
    /// A data message on a channel not yet declared on this connection is
    /// preceded by its declaration frame.
    pub fn encode(&mut self, message: &Message, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match message {
            Message::IdentRequest { ident } => {
                self.require(Role::Client, "ident request")?;
                Frame::Ident(Bytes::copy_from_slice(ident.as_bytes())).encode(dst)
            }
            Message::IdentResponse { ok } => {
                self.require(Role::Server, "ident response")?;
                Frame::IdentResult(*ok).encode(dst)
            }
            Message::PingRequest { counter } => Frame::Heartbeat {
                header: self.role.ping_header(),
                counter: *counter,
            }
            .encode(dst),
            Message::PingResponse { counter } => Frame::Heartbeat {
                header: self.role.pong_header(),
                counter: *counter,
            }
            .encode(dst),
            Message::DataSimple { channel, payload } => {
                let channel = self.channel(channel, dst)?;
                Frame::DataSimple {
                    channel,
                    payload: payload.clone(),
                }
                .encode(dst)
            }
            Message::DataArray { channel, items } => {
                let channel = self.channel(channel, dst)?;
                Frame::DataArray {
                    channel,
                    items: items.clone(),
                }
                .encode(dst)
            }
            Message::ChannelDeclared { id, name } => {
                Frame::ChannelDeclaration {
                    id: *id,
                    name: Bytes::copy_from_slice(name.as_bytes()),
                }
                .encode(dst)?;
                self.channels.declare(*id, name);
                Ok(())
            }
            Message::Disconnected { .. } => Err(ProtocolError::NotEncodable("disconnected")),
        }
    }

    /// Encodes a message into a new buffer.
    pub fn encode_to_bytes(&mut self, message: &Message) -> Result<BytesMut, ProtocolError> {
        let mut buf = BytesMut::new();
        self.encode(message, &mut buf)?;
        Ok(buf)
    }

    fn channel(&mut self, name: &str, dst: &mut BytesMut) -> Result<u8, ProtocolError> {
        if name.len() > crate::frame::MAX_SIZE_1B {
            return Err(ProtocolError::ChannelNameTooLong(name.len()));
        }
        match self.channels.resolve(name) {
            ChannelId::Known(id) => Ok(id),
            ChannelId::New(id) => {
                Frame::ChannelDeclaration {
                    id,
                    name: Bytes::copy_from_slice(name.as_bytes()),
                }
                .encode(dst)?;
                Ok(id)
            }
        }
    }

    fn require(&self, role: Role, what: &'static str) -> Result<(), ProtocolError> {
        if self.role == role {
            Ok(())
        } else {
            Err(ProtocolError::WrongRole(what, self.role.as_str()))
        }
    }
}

/// Decodes buffered bytes into messages.
#[derive(Debug)]
pub struct Decoder {
    role: Role,
    channels: RecvChannels,
    buffer: BytesMut,
}

impl Decoder {
    pub fn new(role: Role) -> Self {
        Self {
            role,
            channels: RecvChannels::new(),
            buffer: BytesMut::with_capacity(4096),
        }
    }

    /// Appends data to the internal buffer.
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Attempts to decode the next message from the buffer.
    ///
    /// Channel declarations are applied and skipped. Returns `Ok(None)` when
    /// more data is needed.
    pub fn decode(&mut self) -> Result<Option<Message>, ProtocolError> {
        loop {
            let frame = match Frame::decode(&mut self.buffer, self.role)? {
                Some(frame) => frame,
                None => return Ok(None),
            };
            let message = match frame {
                Frame::Ident(ident) => Message::IdentRequest {
                    ident: String::from_utf8_lossy(&ident).into_owned(),
                },
                Frame::IdentResult(ok) => Message::IdentResponse { ok },
                Frame::Heartbeat { header, counter } => {
                    if header == self.role.pong_header() {
                        Message::PingRequest { counter }
                    } else {
                        Message::PingResponse { counter }
                    }
                }
                Frame::ChannelDeclaration { id, name } => {
                    self.channels
                        .declare(id, String::from_utf8_lossy(&name).into_owned());
                    continue;
                }
                Frame::DataSimple { channel, payload } => Message::DataSimple {
                    channel: self.channels.name(channel).to_string(),
                    payload,
                },
                Frame::DataArray { channel, items } => Message::DataArray {
                    channel: self.channels.name(channel).to_string(),
                    items,
                },
            };
            return Ok(Some(message));
        }
    }

    /// Returns the number of bytes currently buffered.
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }
}
