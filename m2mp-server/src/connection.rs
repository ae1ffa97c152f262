//! Connection runtime shared by both wire protocols.
//!
//! Each connection runs two tasks: a reader that decodes the socket into a
//! small bounded queue (so a busy session slows the device down instead of
//! dropping data), and the session task that owns all session state.

use crate::bus::BusMessage;
use crate::config::SessionConfig;
use crate::core::{Flow, Outbound, SessionCore};
use crate::error::ServerError;
use bytes::BytesMut;
use m2mp_protocol::ProtocolError;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc};
use tokio::time::Instant;

/// Incremental decoder run by the read task.
pub trait InputDecoder: Send + 'static {
    type Item: Send + 'static;

    fn extend(&mut self, data: &[u8]);

    fn next_item(&mut self) -> Result<Option<Self::Item>, ProtocolError>;
}

impl InputDecoder for m2mp_protocol::Decoder {
    type Item = m2mp_protocol::Message;

    fn extend(&mut self, data: &[u8]) {
        m2mp_protocol::Decoder::extend(self, data)
    }

    fn next_item(&mut self) -> Result<Option<Self::Item>, ProtocolError> {
        self.decode()
    }
}

impl InputDecoder for m2mp_protocol::LineDecoder {
    type Item = String;

    fn extend(&mut self, data: &[u8]) {
        m2mp_protocol::LineDecoder::extend(self, data)
    }

    fn next_item(&mut self) -> Result<Option<Self::Item>, ProtocolError> {
        self.decode_line()
    }
}

/// A wire protocol on top of [`SessionCore`].
pub trait Transport: Send + 'static {
    type Decoder: InputDecoder;

    /// Protocol name, for logs.
    fn name(&self) -> &'static str;

    /// Creates the decoder handed to the read task.
    fn decoder(&mut self) -> Self::Decoder;

    /// Handles one decoded input.
    fn handle(
        &mut self,
        core: &mut SessionCore,
        input: <Self::Decoder as InputDecoder>::Item,
        now: Instant,
    ) -> Flow;

    /// Appends the wire form of `out` to `dst`.
    fn encode(
        &mut self,
        core: &SessionCore,
        out: &Outbound,
        dst: &mut BytesMut,
    ) -> Result<(), ServerError>;
}

/// What the read task hands over.
#[derive(Debug)]
pub enum ReadEvent<T> {
    Item(T),
    /// The stream ended or could not be decoded.
    Disconnected(String),
}

async fn read_loop<R, D>(mut reader: R, mut decoder: D, tx: mpsc::Sender<ReadEvent<D::Item>>)
where
    R: AsyncRead + Unpin,
    D: InputDecoder,
{
    let mut buf = vec![0u8; 8192];
    loop {
        let n = match reader.read(&mut buf).await {
            Ok(0) => {
                let _ = tx.send(ReadEvent::Disconnected("connection closed".to_string())).await;
                return;
            }
            Ok(n) => n,
            Err(e) => {
                let _ = tx.send(ReadEvent::Disconnected(e.to_string())).await;
                return;
            }
        };
        decoder.extend(&buf[..n]);
        loop {
            match decoder.next_item() {
                Ok(Some(item)) => {
                    // blocks while the session is busy
                    if tx.send(ReadEvent::Item(item)).await.is_err() {
                        return;
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    let _ = tx.send(ReadEvent::Disconnected(e.to_string())).await;
                    return;
                }
            }
        }
    }
}

/// Runs a connection until either side ends it, then cleans up the session.
pub async fn run_connection<S, T>(
    stream: S,
    mut transport: T,
    mut core: SessionCore,
    mut inbox: mpsc::Receiver<BusMessage>,
    settings: &SessionConfig,
    mut shutdown: broadcast::Receiver<()>,
) -> Result<(), ServerError>
where
    S: AsyncRead + AsyncWrite + Send + 'static,
    T: Transport,
{
    let id = core.session.id;
    let (read_half, mut write_half) = tokio::io::split(stream);
    let (frame_tx, mut frames) = mpsc::channel(settings.frame_queue.max(1));
    let reader = tokio::spawn(read_loop(read_half, transport.decoder(), frame_tx));

    core.connected();
    tracing::debug!("[{}] Speaking {}", id, transport.name());

    let start = Instant::now();
    let tick = settings.tick();
    let mut ticker = tokio::time::interval_at(start + tick, tick);
    let ident_deadline = tokio::time::sleep_until(start + settings.ident_timeout());
    tokio::pin!(ident_deadline);
    let mut ident_checked = false;
    let mut out = BytesMut::with_capacity(1024);
    let mut result = Ok(());

    loop {
        let flow = tokio::select! {
            event = frames.recv() => match event {
                Some(ReadEvent::Item(item)) => {
                    let now = Instant::now();
                    core.session.mark_received(now);
                    transport.handle(&mut core, item, now)
                }
                Some(ReadEvent::Disconnected(cause)) => {
                    tracing::info!("[{}] Disconnected: {}", id, cause);
                    Flow::Close
                }
                None => Flow::Close,
            },
            Some(message) = inbox.recv() => core.handle_bus_message(&message, Instant::now()),
            _ = ticker.tick() => Flow::Continue,
            _ = &mut ident_deadline, if !ident_checked => {
                ident_checked = true;
                core.check_identified()
            }
            _ = shutdown.recv() => {
                tracing::debug!("[{}] Server shutting down", id);
                Flow::Close
            }
        };

        let flow = match flow {
            Flow::Continue => core.check_liveness(Instant::now()),
            Flow::Close => Flow::Close,
        };

        if let Err(e) = flush(&mut transport, &mut core, &mut write_half, &mut out).await {
            tracing::warn!("[{}] Write failed: {}", id, e);
            result = Err(e);
            break;
        }

        if flow == Flow::Close {
            break;
        }
    }

    reader.abort();
    let _ = write_half.shutdown().await;
    core.closed(Instant::now());
    result
}

async fn flush<T, W>(
    transport: &mut T,
    core: &mut SessionCore,
    writer: &mut W,
    out: &mut BytesMut,
) -> Result<(), ServerError>
where
    T: Transport,
    W: AsyncWrite + Unpin,
{
    let pending = core.take_outbox();
    if pending.is_empty() {
        return Ok(());
    }
    for item in &pending {
        transport.encode(core, item, out)?;
    }
    if !out.is_empty() {
        writer.write_all(&out[..]).await?;
        writer.flush().await?;
        out.clear();
        core.session.mark_sent(Instant::now());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alip::AlipTransport;
    use crate::core::tests::{core, fixture};
    use crate::m2mp::M2mpTransport;
    use tokio::io::DuplexStream;
    use tokio_test::assert_ok;

    struct Harness {
        device: DuplexStream,
        inbox: mpsc::Sender<BusMessage>,
        shutdown: broadcast::Sender<()>,
        task: tokio::task::JoinHandle<Result<(), ServerError>>,
    }

    fn spawn<T: Transport>(transport: T, settings: SessionConfig) -> Harness {
        let fx = fixture();
        let core = core(&fx, Instant::now());
        let (device, server) = tokio::io::duplex(4096);
        let (inbox, inbox_rx) = mpsc::channel(4);
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(async move {
            run_connection(server, transport, core, inbox_rx, &settings, shutdown_rx).await
        });
        Harness {
            device,
            inbox,
            shutdown,
            task,
        }
    }

    async fn read_to_end(device: &mut DuplexStream) -> String {
        let mut out = Vec::new();
        tokio::time::timeout(std::time::Duration::from_secs(5), device.read_to_end(&mut out))
            .await
            .unwrap()
            .unwrap();
        String::from_utf8(out).unwrap()
    }

    #[tokio::test]
    async fn test_alip_exchange_until_quit() {
        let mut h = spawn(AlipTransport::new(), SessionConfig::default());
        h.device
            .write_all(b"ID acme:device001\r\nQUIT\n")
            .await
            .unwrap();

        assert_eq!(read_to_end(&mut h.device).await, "ID 1\nS GA\nQUIT bye !\n");
        assert_ok!(h.task.await.unwrap());
    }

    #[tokio::test]
    async fn test_ident_timeout_closes_with_notice() {
        let settings = SessionConfig {
            ident_timeout_secs: 0,
            ..SessionConfig::default()
        };
        let mut h = spawn(AlipTransport::new(), settings);

        assert_eq!(
            read_to_end(&mut h.device).await,
            "QUIT It took you too long to identify yourself !\n"
        );
        assert_ok!(h.task.await.unwrap());
    }

    #[tokio::test]
    async fn test_bus_disconnect_closes() {
        let mut h = spawn(M2mpTransport::new(), SessionConfig::default());
        h.inbox
            .send(BusMessage::new("receivers;connection_id=7", "disconnect"))
            .await
            .unwrap();

        assert_eq!(read_to_end(&mut h.device).await, "");
        assert_ok!(h.task.await.unwrap());
    }

    #[tokio::test]
    async fn test_bus_disconnect_after_full_inbox() {
        let mut h = spawn(M2mpTransport::new(), SessionConfig::default());
        let inbox = h.inbox.clone();
        let sender = tokio::spawn(async move {
            for _ in 0..16 {
                inbox
                    .send(BusMessage::new("receivers;connection_id=7", "send_commands"))
                    .await
                    .unwrap();
            }
            inbox
                .send(BusMessage::new("receivers;connection_id=7", "disconnect"))
                .await
                .unwrap();
        });

        assert_eq!(read_to_end(&mut h.device).await, "");
        assert_ok!(h.task.await.unwrap());
        assert_ok!(sender.await);
    }

    #[tokio::test]
    async fn test_shutdown_signal_closes() {
        let mut h = spawn(M2mpTransport::new(), SessionConfig::default());
        h.shutdown.send(()).unwrap();

        assert_eq!(read_to_end(&mut h.device).await, "");
        assert_ok!(h.task.await.unwrap());
    }

    #[tokio::test]
    async fn test_undecodable_input_disconnects() {
        let mut h = spawn(M2mpTransport::new(), SessionConfig::default());
        h.device.write_all(&[0x99, 0x00]).await.unwrap();

        assert_eq!(read_to_end(&mut h.device).await, "");
        assert_ok!(h.task.await.unwrap());
    }
}
