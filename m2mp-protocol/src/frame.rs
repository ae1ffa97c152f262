//! Binary frame layout for M2MP.
//!
//! Every frame starts with a one byte header. Control frames are two bytes
//! long (identification result, heartbeats) or carry a one byte length
//! (identifier, channel declaration). Data frames carry a big-endian length
//! of 1, 2 or 4 bytes followed by the channel id and the body:
//!
//! ```text
//! +--------+-------------+------------+---------------------------+
//! | header | length      | channel id | body                      |
//! | 1 byte | 1/2/4 bytes | 1 byte     | length - 1 bytes          |
//! +--------+-------------+------------+---------------------------+
//! ```
//!
//! The body of an array frame is a sequence of elements, each prefixed by
//! its own length using the same width as the frame length.

use crate::error::ProtocolError;
use bytes::{Buf, BufMut, Bytes, BytesMut};

/// Identification request (from a client) or result (from a server).
pub const HEADER_IDENT: u8 = 0x01;
/// Ping sent by a client, pong sent by a server.
pub const HEADER_CLIENT_PING: u8 = 0x02;
/// Ping sent by a server, pong sent by a client.
pub const HEADER_SERVER_PING: u8 = 0x03;
/// Channel name declaration.
pub const HEADER_CHANNEL_DECLARATION: u8 = 0x20;

const KIND_SIMPLE: u8 = 0x01;
const KIND_ARRAY: u8 = 0x02;

/// Largest length value carried by a 1-byte length field.
pub const MAX_SIZE_1B: usize = 254;
/// Largest length value carried by a 2-byte length field.
pub const MAX_SIZE_2B: usize = 65_534;
/// Largest accepted data frame length (1 MiB).
pub const MAX_FRAME_SIZE: usize = 1_048_576;

/// Which end of the connection the local codec is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Client,
    Server,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Client => "client",
            Role::Server => "server",
        }
    }

    /// Header used when this side initiates a ping.
    pub fn ping_header(&self) -> u8 {
        match self {
            Role::Client => HEADER_CLIENT_PING,
            Role::Server => HEADER_SERVER_PING,
        }
    }

    /// Header used when this side answers the peer's ping.
    pub fn pong_header(&self) -> u8 {
        match self {
            Role::Client => HEADER_SERVER_PING,
            Role::Server => HEADER_CLIENT_PING,
        }
    }
}

/// Width of a data frame length field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LengthWidth {
    One,
    Two,
    Four,
}

impl LengthWidth {
    const ALL: [LengthWidth; 3] = [LengthWidth::One, LengthWidth::Two, LengthWidth::Four];

    /// Number of bytes used by the length field.
    pub fn bytes(self) -> usize {
        match self {
            LengthWidth::One => 1,
            LengthWidth::Two => 2,
            LengthWidth::Four => 4,
        }
    }

    /// Largest length value this width may carry.
    pub fn limit(self) -> usize {
        match self {
            LengthWidth::One => MAX_SIZE_1B,
            LengthWidth::Two => MAX_SIZE_2B,
            LengthWidth::Four => MAX_FRAME_SIZE,
        }
    }

    /// Picks the smallest width able to carry `size`.
    pub fn for_size(size: usize) -> Result<Self, ProtocolError> {
        Self::ALL
            .into_iter()
            .find(|w| size <= w.limit())
            .ok_or(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            })
    }

    /// Picks the smallest width for an array whose element prefixes use the
    /// same width as the frame length.
    pub fn for_array(count: usize, content: usize) -> Result<(Self, usize), ProtocolError> {
        for width in Self::ALL {
            let size = 1 + count * width.bytes() + content;
            if size <= width.limit() {
                return Ok((width, size));
            }
        }
        Err(ProtocolError::FrameTooLarge {
            size: 1 + count * 4 + content,
            max: MAX_FRAME_SIZE,
        })
    }

    fn header_bits(self) -> u8 {
        match self {
            LengthWidth::One => 0x20,
            LengthWidth::Two => 0x40,
            LengthWidth::Four => 0x60,
        }
    }

    fn from_header(header: u8) -> Option<Self> {
        match header & 0x60 {
            0x20 => Some(LengthWidth::One),
            0x40 => Some(LengthWidth::Two),
            0x60 => Some(LengthWidth::Four),
            _ => None,
        }
    }

    fn put(self, dst: &mut BytesMut, value: usize) {
        match self {
            LengthWidth::One => dst.put_u8(value as u8),
            LengthWidth::Two => dst.put_u16(value as u16),
            LengthWidth::Four => dst.put_u32(value as u32),
        }
    }

    fn read(self, src: &[u8]) -> usize {
        match self {
            LengthWidth::One => src[0] as usize,
            LengthWidth::Two => u16::from_be_bytes([src[0], src[1]]) as usize,
            LengthWidth::Four => u32::from_be_bytes([src[0], src[1], src[2], src[3]]) as usize,
        }
    }
}

/// A frame as it appears on the wire, with numeric channel ids.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Identifier sent by a client.
    Ident(Bytes),
    /// Identification result sent by a server.
    IdentResult(bool),
    /// Ping or pong; the meaning depends on the header and the local role.
    Heartbeat { header: u8, counter: u8 },
    ChannelDeclaration { id: u8, name: Bytes },
    DataSimple { channel: u8, payload: Bytes },
    DataArray { channel: u8, items: Vec<Bytes> },
}

impl Frame {
    /// Appends the encoded frame to `dst`.
    pub fn encode(&self, dst: &mut BytesMut) -> Result<(), ProtocolError> {
        match self {
            Frame::Ident(ident) => {
                if ident.len() > u8::MAX as usize {
                    return Err(ProtocolError::IdentTooLong(ident.len()));
                }
                dst.reserve(2 + ident.len());
                dst.put_u8(HEADER_IDENT);
                dst.put_u8(ident.len() as u8);
                dst.put_slice(ident);
            }
            Frame::IdentResult(ok) => {
                dst.put_u8(HEADER_IDENT);
                dst.put_u8(u8::from(*ok));
            }
            Frame::Heartbeat { header, counter } => {
                dst.put_u8(*header);
                dst.put_u8(*counter);
            }
            Frame::ChannelDeclaration { id, name } => {
                if name.len() > MAX_SIZE_1B {
                    return Err(ProtocolError::ChannelNameTooLong(name.len()));
                }
                dst.reserve(3 + name.len());
                dst.put_u8(HEADER_CHANNEL_DECLARATION);
                dst.put_u8(1 + name.len() as u8);
                dst.put_u8(*id);
                dst.put_slice(name);
            }
            Frame::DataSimple { channel, payload } => {
                let size = 1 + payload.len();
                let width = LengthWidth::for_size(size)?;
                dst.reserve(1 + width.bytes() + size);
                dst.put_u8(width.header_bits() | KIND_SIMPLE);
                width.put(dst, size);
                dst.put_u8(*channel);
                dst.put_slice(payload);
            }
            Frame::DataArray { channel, items } => {
                let content = items.iter().map(Bytes::len).sum();
                let (width, size) = LengthWidth::for_array(items.len(), content)?;
                dst.reserve(1 + width.bytes() + size);
                dst.put_u8(width.header_bits() | KIND_ARRAY);
                width.put(dst, size);
                dst.put_u8(*channel);
                for item in items {
                    width.put(dst, item.len());
                    dst.put_slice(item);
                }
            }
        }
        Ok(())
    }

    /// Decodes one frame from the front of `buf`.
    ///
    /// `local` is the role of the decoding side; it decides how the shared
    /// identification header is read. Returns `Ok(None)` and leaves `buf`
    /// untouched when the frame is incomplete.
    pub fn decode(buf: &mut BytesMut, local: Role) -> Result<Option<Self>, ProtocolError> {
        if buf.len() < 2 {
            return Ok(None);
        }

        let header = buf[0];
        match header {
            HEADER_IDENT => match local {
                Role::Server => {
                    let len = buf[1] as usize;
                    if buf.len() < 2 + len {
                        return Ok(None);
                    }
                    buf.advance(2);
                    Ok(Some(Frame::Ident(buf.split_to(len).freeze())))
                }
                Role::Client => {
                    let ok = buf[1] == 1;
                    buf.advance(2);
                    Ok(Some(Frame::IdentResult(ok)))
                }
            },
            HEADER_CLIENT_PING | HEADER_SERVER_PING => {
                let counter = buf[1];
                buf.advance(2);
                Ok(Some(Frame::Heartbeat { header, counter }))
            }
            HEADER_CHANNEL_DECLARATION => {
                let len = buf[1] as usize;
                if len == 0 {
                    return Err(ProtocolError::EmptyDataFrame);
                }
                if buf.len() < 2 + len {
                    return Ok(None);
                }
                buf.advance(2);
                let id = buf.get_u8();
                let name = buf.split_to(len - 1).freeze();
                Ok(Some(Frame::ChannelDeclaration { id, name }))
            }
            _ => Self::decode_data(buf, header),
        }
    }

    fn decode_data(buf: &mut BytesMut, header: u8) -> Result<Option<Self>, ProtocolError> {
        let kind = header & 0x1f;
        let width = match LengthWidth::from_header(header) {
            Some(width) if header & 0x80 == 0 && (kind == KIND_SIMPLE || kind == KIND_ARRAY) => {
                width
            }
            _ => return Err(ProtocolError::UnknownHeader(header)),
        };

        let prefix = 1 + width.bytes();
        if buf.len() < prefix {
            return Ok(None);
        }
        let size = width.read(&buf[1..prefix]);
        if size > MAX_FRAME_SIZE {
            return Err(ProtocolError::FrameTooLarge {
                size,
                max: MAX_FRAME_SIZE,
            });
        }
        if size == 0 {
            return Err(ProtocolError::EmptyDataFrame);
        }
        if buf.len() < prefix + size {
            return Ok(None);
        }

        buf.advance(prefix);
        let channel = buf.get_u8();
        let body = buf.split_to(size - 1).freeze();

        if kind == KIND_SIMPLE {
            return Ok(Some(Frame::DataSimple {
                channel,
                payload: body,
            }));
        }

        let mut items = Vec::new();
        let mut offset = 0;
        while offset < body.len() {
            if body.len() - offset < width.bytes() {
                return Err(ProtocolError::MalformedArray { offset });
            }
            let len = width.read(&body[offset..]);
            let start = offset + width.bytes();
            if body.len() - start < len {
                return Err(ProtocolError::MalformedArray { offset });
            }
            items.push(body.slice(start..start + len));
            offset = start + len;
        }
        Ok(Some(Frame::DataArray { channel, items }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(frame: &Frame) -> BytesMut {
        let mut buf = BytesMut::new();
        frame.encode(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_width_boundaries() {
        assert_eq!(LengthWidth::for_size(254).unwrap(), LengthWidth::One);
        assert_eq!(LengthWidth::for_size(255).unwrap(), LengthWidth::Two);
        assert_eq!(LengthWidth::for_size(65_534).unwrap(), LengthWidth::Two);
        assert_eq!(LengthWidth::for_size(65_535).unwrap(), LengthWidth::Four);
        assert_eq!(
            LengthWidth::for_size(MAX_FRAME_SIZE).unwrap(),
            LengthWidth::Four
        );
        assert!(LengthWidth::for_size(MAX_FRAME_SIZE + 1).is_err());
    }

    #[test]
    fn test_simple_header_per_width() {
        // length counts the channel id byte: 253 bytes of payload still fit one byte
        let buf = encoded(&Frame::DataSimple {
            channel: 0,
            payload: Bytes::from(vec![0u8; 253]),
        });
        assert_eq!(buf[0], 0x21);
        assert_eq!(buf[1], 254);
        assert_eq!(buf.len(), 2 + 254);

        let buf = encoded(&Frame::DataSimple {
            channel: 0,
            payload: Bytes::from(vec![0u8; 254]),
        });
        assert_eq!(buf[0], 0x41);
        assert_eq!(&buf[1..3], &[0x00, 0xff]);

        let buf = encoded(&Frame::DataSimple {
            channel: 0,
            payload: Bytes::from(vec![0u8; 65_534]),
        });
        assert_eq!(buf[0], 0x61);
        assert_eq!(&buf[1..5], &[0x00, 0x00, 0xff, 0xff]);
    }

    #[test]
    fn test_array_layout() {
        let buf = encoded(&Frame::DataArray {
            channel: 2,
            items: vec![Bytes::from_static(b"ab"), Bytes::from_static(b"c")],
        });
        assert_eq!(&buf[..], &[0x22, 6, 2, 2, b'a', b'b', 1, b'c']);
    }

    #[test]
    fn test_array_width_counts_element_prefixes() {
        // 2 elements of 125 bytes: 1 + 2*1 + 250 = 253 fits one byte
        let items = vec![Bytes::from(vec![1u8; 125]), Bytes::from(vec![2u8; 125])];
        let buf = encoded(&Frame::DataArray {
            channel: 0,
            items: items.clone(),
        });
        assert_eq!(buf[0], 0x22);

        // 3 elements of 84 bytes: 1 + 3 + 252 = 256 needs two bytes
        let items = vec![Bytes::from(vec![1u8; 84]); 3];
        let mut buf = encoded(&Frame::DataArray {
            channel: 0,
            items: items.clone(),
        });
        assert_eq!(buf[0], 0x42);
        let decoded = Frame::decode(&mut buf, Role::Server).unwrap().unwrap();
        assert_eq!(decoded, Frame::DataArray { channel: 0, items });
    }

    #[test]
    fn test_ident_depends_on_local_role() {
        let mut buf = BytesMut::from(&[0x01, 0x03, b'a', b'b', b'c'][..]);
        let frame = Frame::decode(&mut buf, Role::Server).unwrap().unwrap();
        assert_eq!(frame, Frame::Ident(Bytes::from_static(b"abc")));
        assert!(buf.is_empty());

        let mut buf = BytesMut::from(&[0x01, 0x01][..]);
        let frame = Frame::decode(&mut buf, Role::Client).unwrap().unwrap();
        assert_eq!(frame, Frame::IdentResult(true));
    }

    #[test]
    fn test_incomplete_frames_wait() {
        let full = encoded(&Frame::DataSimple {
            channel: 9,
            payload: Bytes::from(vec![7u8; 300]),
        });
        for cut in [1, 2, 3, 10, full.len() - 1] {
            let mut buf = BytesMut::from(&full[..cut]);
            assert!(Frame::decode(&mut buf, Role::Server).unwrap().is_none());
            assert_eq!(buf.len(), cut);
        }
    }

    #[test]
    fn test_unknown_header_rejected() {
        for header in [0x00, 0x04, 0x1f, 0x23, 0x80, 0xff] {
            let mut buf = BytesMut::from(&[header, 0x00, 0x00][..]);
            assert!(matches!(
                Frame::decode(&mut buf, Role::Server),
                Err(ProtocolError::UnknownHeader(h)) if h == header
            ));
        }
    }

    #[test]
    fn test_oversized_length_rejected_before_buffering() {
        let mut buf = BytesMut::from(&[0x61, 0x00, 0x20, 0x00, 0x00][..]);
        assert!(matches!(
            Frame::decode(&mut buf, Role::Server),
            Err(ProtocolError::FrameTooLarge { .. })
        ));
    }

    #[test]
    fn test_malformed_array_element() {
        // element claims 5 bytes but only 2 remain
        let mut buf = BytesMut::from(&[0x22, 0x04, 0x00, 0x05, b'x', b'y'][..]);
        assert!(matches!(
            Frame::decode(&mut buf, Role::Server),
            Err(ProtocolError::MalformedArray { offset: 0 })
        ));
    }

    #[test]
    fn test_channel_name_limit() {
        let mut buf = BytesMut::new();
        let frame = Frame::ChannelDeclaration {
            id: 0,
            name: Bytes::from(vec![b'x'; 255]),
        };
        assert!(matches!(
            frame.encode(&mut buf),
            Err(ProtocolError::ChannelNameTooLong(255))
        ));
    }
}
