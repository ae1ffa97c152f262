//! Device connection.

use crate::error::ClientError;
use bytes::{Bytes, BytesMut};
use m2mp_protocol::{Decoder, Encoder, Message, Role};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

/// Default read buffer size (8 KiB).
pub const DEFAULT_READ_BUFFER_SIZE: usize = 8 * 1024;

/// Connection configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Server address.
    pub addr: SocketAddr,
    pub connect_timeout: Duration,
    /// How long [`DeviceClient::recv`] waits for a message.
    pub recv_timeout: Duration,
    pub read_buffer_size: usize,
}

impl ClientConfig {
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            connect_timeout: Duration::from_secs(10),
            recv_timeout: Duration::from_secs(30),
            read_buffer_size: DEFAULT_READ_BUFFER_SIZE,
        }
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_recv_timeout(mut self, timeout: Duration) -> Self {
        self.recv_timeout = timeout;
        self
    }

    pub fn with_read_buffer_size(mut self, size: usize) -> Self {
        self.read_buffer_size = size.max(64);
        self
    }
}

/// A device talking to an M2MP server.
pub struct DeviceClient {
    config: ClientConfig,
    stream: TcpStream,
    encoder: Encoder,
    decoder: Decoder,
    out: BytesMut,
    buf: Vec<u8>,
}

impl DeviceClient {
    /// Connects to the server.
    pub async fn connect(config: ClientConfig) -> Result<Self, ClientError> {
        tracing::debug!("Connecting to {}...", config.addr);
        let stream = tokio::time::timeout(config.connect_timeout, TcpStream::connect(config.addr))
            .await
            .map_err(|_| ClientError::Timeout)??;
        stream.set_nodelay(true).ok();

        Ok(Self {
            buf: vec![0u8; config.read_buffer_size],
            config,
            stream,
            encoder: Encoder::new(Role::Client),
            decoder: Decoder::new(Role::Client),
            out: BytesMut::with_capacity(1024),
        })
    }

    pub fn local_addr(&self) -> Result<SocketAddr, ClientError> {
        Ok(self.stream.local_addr()?)
    }

    /// Sends one message.
    pub async fn send(&mut self, message: &Message) -> Result<(), ClientError> {
        self.out.clear();
        self.encoder.encode(message, &mut self.out)?;
        self.stream.write_all(&self.out[..]).await?;
        tracing::trace!("-> {}", message.kind());
        Ok(())
    }

    pub async fn send_data(
        &mut self,
        channel: &str,
        payload: impl Into<Bytes>,
    ) -> Result<(), ClientError> {
        self.send(&Message::data(channel, payload)).await
    }

    pub async fn send_array<I, T>(&mut self, channel: &str, items: I) -> Result<(), ClientError>
    where
        I: IntoIterator<Item = T>,
        T: Into<Bytes>,
    {
        self.send(&Message::array(channel, items)).await
    }

    /// Receives the next message.
    ///
    /// A closed or failed socket is reported as [`Message::Disconnected`];
    /// only a silent server yields an error ([`ClientError::Timeout`]).
    pub async fn recv(&mut self) -> Result<Message, ClientError> {
        loop {
            if let Some(message) = self.decoder.decode()? {
                tracing::trace!("<- {}", message.kind());
                return Ok(message);
            }
            let read = tokio::time::timeout(self.config.recv_timeout, self.stream.read(&mut self.buf))
                .await
                .map_err(|_| ClientError::Timeout)?;
            match read {
                Ok(0) => {
                    return Ok(Message::Disconnected {
                        cause: "connection closed".to_string(),
                    })
                }
                Ok(n) => self.decoder.extend(&self.buf[..n]),
                Err(e) => {
                    return Ok(Message::Disconnected {
                        cause: e.to_string(),
                    })
                }
            }
        }
    }

    /// Identifies the device and waits for the verdict. Server pings
    /// received meanwhile are answered.
    pub async fn identify(&mut self, ident: &str) -> Result<bool, ClientError> {
        self.send(&Message::IdentRequest {
            ident: ident.to_string(),
        })
        .await?;
        loop {
            match self.recv().await? {
                Message::IdentResponse { ok } => return Ok(ok),
                Message::PingRequest { counter } => {
                    self.send(&Message::PingResponse { counter }).await?
                }
                Message::Disconnected { .. } => return Err(ClientError::ConnectionClosed),
                other => return Err(ClientError::Unexpected(other.kind())),
            }
        }
    }

    /// Pings the server and waits for the matching answer.
    pub async fn ping(&mut self, counter: u8) -> Result<(), ClientError> {
        self.send(&Message::PingRequest { counter }).await?;
        match self.recv().await? {
            Message::PingResponse { counter: c } if c == counter => Ok(()),
            Message::Disconnected { .. } => Err(ClientError::ConnectionClosed),
            other => Err(ClientError::Unexpected(other.kind())),
        }
    }

    /// Closes the connection.
    pub async fn close(mut self) -> Result<(), ClientError> {
        self.stream.shutdown().await?;
        Ok(())
    }
}
