//! TCP server: listeners, the session table and bus routing.

use crate::alip::AlipTransport;
use crate::bus::{BusMessage, MessageBus};
use crate::config::Config;
use crate::connection::{run_connection, Transport};
use crate::core::{Services, SessionCore};
use crate::error::ServerError;
use crate::m2mp::M2mpTransport;
use crate::session::Session;
use crate::storage::SamplePersister;
use m2mp_registry::{DeviceRegistry, TimeSeriesStore};
use parking_lot::RwLock;
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::Instant;

struct Entry {
    inbox: mpsc::Sender<BusMessage>,
    device_id: Option<String>,
}

#[derive(Default)]
struct Tables {
    by_connection: HashMap<u64, Entry>,
    by_device: HashMap<String, HashSet<u64>>,
}

/// Live sessions, by connection id and by device id.
///
/// Both maps sit behind one lock so they never disagree.
#[derive(Default)]
pub struct SessionTable {
    inner: RwLock<Tables>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, id: u64, inbox: mpsc::Sender<BusMessage>) {
        self.inner.write().by_connection.insert(
            id,
            Entry {
                inbox,
                device_id: None,
            },
        );
    }

    /// Records which device a connection identified as. Unknown ids are ignored.
    pub fn bind_device(&self, id: u64, device_id: &str) {
        let mut tables = self.inner.write();
        let Some(entry) = tables.by_connection.get_mut(&id) else {
            return;
        };
        entry.device_id = Some(device_id.to_string());
        tables
            .by_device
            .entry(device_id.to_string())
            .or_default()
            .insert(id);
    }

    pub fn remove(&self, id: u64) {
        let mut tables = self.inner.write();
        let Some(entry) = tables.by_connection.remove(&id) else {
            return;
        };
        if let Some(device_id) = entry.device_id {
            if let Some(ids) = tables.by_device.get_mut(&device_id) {
                ids.remove(&id);
                if ids.is_empty() {
                    tables.by_device.remove(&device_id);
                }
            }
        }
    }

    pub fn connection_inbox(&self, id: u64) -> Option<mpsc::Sender<BusMessage>> {
        self.inner
            .read()
            .by_connection
            .get(&id)
            .map(|entry| entry.inbox.clone())
    }

    /// Inboxes of every session identified as `device_id`.
    pub fn device_inboxes(&self, device_id: &str) -> Vec<(u64, mpsc::Sender<BusMessage>)> {
        let tables = self.inner.read();
        let Some(ids) = tables.by_device.get(device_id) else {
            return Vec::new();
        };
        ids.iter()
            .filter_map(|id| {
                tables
                    .by_connection
                    .get(id)
                    .map(|entry| (*id, entry.inbox.clone()))
            })
            .collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().by_connection.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Server statistics.
#[derive(Debug, Default)]
pub struct ServerStats {
    pub connections_total: AtomicU64,
    pub connections_active: AtomicU64,
    pub connections_rejected: AtomicU64,
    pub errors_total: AtomicU64,
    pub bus_messages_routed: AtomicU64,
    pub bus_messages_dropped: AtomicU64,
}

/// The device-facing server.
pub struct Server {
    config: Config,
    services: Arc<Services>,
    stats: Arc<ServerStats>,
    shutdown: broadcast::Sender<()>,
    running: AtomicBool,
    next_id: AtomicU64,
}

impl Server {
    pub fn new(
        config: Config,
        registry: Arc<dyn DeviceRegistry>,
        store: Arc<dyn TimeSeriesStore>,
        bus: Arc<dyn MessageBus>,
    ) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        let samples = SamplePersister::new(
            store,
            config.storage.sample_retry_attempts,
            config.storage.sample_retry_delay(),
        );
        let services = Arc::new(Services {
            registry,
            bus,
            samples,
            table: Arc::new(SessionTable::new()),
            policy: config.session.policy(),
            receivers_topic: config.bus.receivers_topic.clone(),
            events_topic: config.bus.events_topic.clone(),
            default_target: config.bus.default_target.clone(),
            host: std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string()),
        });
        Self {
            config,
            services,
            stats: Arc::new(ServerStats::default()),
            shutdown: shutdown_tx,
            running: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Binds the configured listeners and serves until shutdown.
    pub async fn run(&self) -> Result<(), ServerError> {
        let m2mp = TcpListener::bind(self.config.network.bind_addr).await?;
        let alip = match self.config.network.alip_bind_addr {
            Some(addr) => Some(TcpListener::bind(addr).await?),
            None => None,
        };
        self.run_with_listeners(m2mp, alip).await
    }

    /// Serves already bound listeners until shutdown.
    pub async fn run_with_listeners(
        &self,
        m2mp: TcpListener,
        alip: Option<TcpListener>,
    ) -> Result<(), ServerError> {
        let m2mp_addr = m2mp.local_addr()?;
        tracing::info!("M2MP listening on {}", m2mp_addr);
        if let Some(listener) = &alip {
            tracing::info!("ALIP listening on {}", listener.local_addr()?);
        }

        let mut shutdown_rx = self.shutdown.subscribe();
        let router = self.spawn_bus_router();
        self.running.store(true, Ordering::SeqCst);
        self.announce(m2mp_addr.port());

        loop {
            tokio::select! {
                result = m2mp.accept() => match result {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr, M2mpTransport::new()),
                    Err(e) => tracing::error!("Accept error: {}", e),
                },
                result = accept_optional(&alip) => match result {
                    Ok((stream, addr)) => self.spawn_connection(stream, addr, AlipTransport::new()),
                    Err(e) => tracing::error!("ALIP accept error: {}", e),
                },
                _ = shutdown_rx.recv() => {
                    tracing::info!("Server shutting down");
                    break;
                }
            }
        }

        router.abort();
        self.running.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn announce(&self, port: u16) {
        let mut message = BusMessage::new(self.config.bus.events_topic.clone(), "new_receiver")
            .with("tcp_port", port)
            .with("host", self.services.host.clone());
        message.from = self.config.bus.receivers_topic.clone();
        if let Err(e) = self.services.bus.publish(message) {
            tracing::warn!("Could not announce receiver: {}", e);
        }
    }

    fn spawn_connection<T: Transport>(&self, stream: TcpStream, addr: SocketAddr, transport: T) {
        if self.stats.connections_active.load(Ordering::Relaxed)
            >= self.config.network.max_connections as u64
        {
            tracing::warn!("Connection limit reached, rejecting {}", addr);
            self.stats.connections_rejected.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let _ = stream.set_nodelay(true);

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_total.fetch_add(1, Ordering::Relaxed);
        self.stats.connections_active.fetch_add(1, Ordering::Relaxed);

        let (inbox_tx, inbox) = mpsc::channel(self.config.session.inbox_capacity.max(1));
        self.services.table.register(id, inbox_tx);
        let core = SessionCore::new(Session::new(id, addr, Instant::now()), self.services.clone());
        let settings = self.config.session.clone();
        let shutdown = self.shutdown.subscribe();
        let stats = self.stats.clone();

        tokio::spawn(async move {
            if let Err(e) = run_connection(stream, transport, core, inbox, &settings, shutdown).await
            {
                tracing::debug!("[{}] Connection error: {}", id, e);
                stats.errors_total.fetch_add(1, Ordering::Relaxed);
            }
            stats.connections_active.fetch_sub(1, Ordering::Relaxed);
        });
    }

    /// Forwards messages addressed to the receivers topic to session inboxes.
    fn spawn_bus_router(&self) -> JoinHandle<()> {
        let mut messages = self.services.bus.subscribe(&self.config.bus.receivers_topic);
        let table = self.services.table.clone();
        let stats = self.stats.clone();
        let mut shutdown = self.shutdown.subscribe();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = messages.recv() => match received {
                        Ok(message) => route_bus_message(&table, &stats, message).await,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            tracing::warn!("Bus router lagged {} messages", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    _ = shutdown.recv() => break,
                }
            }
        })
    }

    /// Initiates server shutdown.
    pub fn shutdown(&self) {
        let _ = self.shutdown.send(());
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ServerStats {
        &self.stats
    }

    pub fn sessions(&self) -> &SessionTable {
        &self.services.table
    }
}

async fn accept_optional(
    listener: &Option<TcpListener>,
) -> std::io::Result<(TcpStream, SocketAddr)> {
    match listener {
        Some(listener) => listener.accept().await,
        None => std::future::pending().await,
    }
}

/// Waits for room in the inbox; calls are never skipped while the session lives.
async fn deliver(
    stats: &ServerStats,
    id: u64,
    inbox: &mpsc::Sender<BusMessage>,
    message: BusMessage,
) {
    if inbox.capacity() == 0 {
        tracing::debug!("[{}] Inbox full, waiting to deliver {}", id, message.call);
    }
    match inbox.send(message).await {
        Ok(()) => {
            stats.bus_messages_routed.fetch_add(1, Ordering::Relaxed);
        }
        Err(mpsc::error::SendError(message)) => {
            tracing::debug!("[{}] Session gone, dropping {}", id, message.call);
            stats.bus_messages_dropped.fetch_add(1, Ordering::Relaxed);
        }
    }
}

/// Delivers one receivers-topic message: a `connection_id` target wins over
/// a `device_id` target, which reaches every session of the device.
/// Messages are handled one at a time, in bus order.
pub(crate) async fn route_bus_message(
    table: &SessionTable,
    stats: &ServerStats,
    message: BusMessage,
) {
    let target = message.target();
    if let Some(id) = target.connection_id {
        match table.connection_inbox(id) {
            Some(inbox) => deliver(stats, id, &inbox, message).await,
            None => {
                tracing::warn!("No connection {} for {}", id, message.call);
                stats.bus_messages_dropped.fetch_add(1, Ordering::Relaxed);
            }
        }
    } else if let Some(device_id) = target.device_id {
        let inboxes = table.device_inboxes(&device_id);
        if inboxes.is_empty() {
            tracing::debug!("No session for device {} ({})", device_id, message.call);
        }
        for (id, inbox) in inboxes {
            deliver(stats, id, &inbox, message.clone()).await;
        }
    } else if message.call == "quit" {
        tracing::warn!("Ignoring remote quit request from {:?}", message.from);
    } else {
        tracing::warn!("Unhandled receivers message {:?} to {:?}", message.call, message.to);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{LocalBus, TOPIC_GENERAL_EVENTS, TOPIC_RECEIVERS};
    use m2mp_client::{ClientConfig, DeviceClient};
    use m2mp_protocol::Message;
    use m2mp_registry::{MemoryRegistry, MemoryTimeSeries};
    use std::time::Duration;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    #[test]
    fn test_session_table_tracks_devices() {
        let table = SessionTable::new();
        let (tx1, _rx1) = mpsc::channel(1);
        let (tx2, _rx2) = mpsc::channel(1);
        table.register(1, tx1);
        table.register(2, tx2);
        table.bind_device(1, "dev-a");
        table.bind_device(2, "dev-a");
        table.bind_device(99, "dev-b");

        assert_eq!(table.len(), 2);
        assert_eq!(table.device_inboxes("dev-a").len(), 2);
        assert!(table.device_inboxes("dev-b").is_empty());

        table.remove(1);
        table.remove(1);
        assert_eq!(table.len(), 1);
        assert_eq!(table.device_inboxes("dev-a").len(), 1);

        table.remove(2);
        assert!(table.is_empty());
        assert!(table.device_inboxes("dev-a").is_empty());
    }

    #[tokio::test]
    async fn test_route_by_connection_then_device() {
        let table = SessionTable::new();
        let stats = ServerStats::default();
        let (tx1, mut rx1) = mpsc::channel(4);
        let (tx2, mut rx2) = mpsc::channel(4);
        table.register(1, tx1);
        table.register(2, tx2);
        table.bind_device(1, "dev-a");
        table.bind_device(2, "dev-a");

        route_bus_message(
            &table,
            &stats,
            BusMessage::new("receivers;connection_id=2;device_id=dev-a", "disconnect"),
        )
        .await;
        assert!(rx1.try_recv().is_err());
        assert_eq!(rx2.try_recv().unwrap().call, "disconnect");

        route_bus_message(
            &table,
            &stats,
            BusMessage::new("receivers;device_id=dev-a", "send_settings"),
        )
        .await;
        assert_eq!(rx1.try_recv().unwrap().call, "send_settings");
        assert_eq!(rx2.try_recv().unwrap().call, "send_settings");

        route_bus_message(
            &table,
            &stats,
            BusMessage::new("receivers;connection_id=42", "disconnect"),
        )
        .await;
        route_bus_message(&table, &stats, BusMessage::new("receivers", "quit")).await;
        assert_eq!(stats.bus_messages_routed.load(Ordering::Relaxed), 3);
        assert_eq!(stats.bus_messages_dropped.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_route_waits_when_inbox_full() {
        let table = Arc::new(SessionTable::new());
        let stats = Arc::new(ServerStats::default());
        let (tx, mut rx) = mpsc::channel(1);
        table.register(1, tx);

        let router = {
            let table = table.clone();
            let stats = stats.clone();
            tokio::spawn(async move {
                for call in ["send_commands", "send_settings", "disconnect"] {
                    route_bus_message(
                        &table,
                        &stats,
                        BusMessage::new("receivers;connection_id=1", call),
                    )
                    .await;
                }
            })
        };

        // the session is slow; nothing is lost meanwhile
        tokio::time::sleep(Duration::from_millis(50)).await;
        let mut calls = Vec::new();
        for _ in 0..3 {
            calls.push(rx.recv().await.unwrap().call);
        }
        router.await.unwrap();

        assert_eq!(calls, ["send_commands", "send_settings", "disconnect"]);
        assert_eq!(stats.bus_messages_routed.load(Ordering::Relaxed), 3);
        assert_eq!(stats.bus_messages_dropped.load(Ordering::Relaxed), 0);
    }

    #[tokio::test]
    async fn test_route_drops_for_closed_session() {
        let table = SessionTable::new();
        let stats = ServerStats::default();
        let (tx, rx) = mpsc::channel(1);
        table.register(1, tx);
        drop(rx);

        route_bus_message(
            &table,
            &stats,
            BusMessage::new("receivers;connection_id=1", "disconnect"),
        )
        .await;
        assert_eq!(stats.bus_messages_routed.load(Ordering::Relaxed), 0);
        assert_eq!(stats.bus_messages_dropped.load(Ordering::Relaxed), 1);
    }

    struct Running {
        server: Arc<Server>,
        bus: Arc<LocalBus>,
        registry: Arc<MemoryRegistry>,
        m2mp: SocketAddr,
        alip: SocketAddr,
    }

    async fn start(config: Config) -> Running {
        let registry = Arc::new(MemoryRegistry::new());
        let bus = Arc::new(LocalBus::new(64));
        let server = Arc::new(Server::new(
            config,
            registry.clone(),
            Arc::new(MemoryTimeSeries::default()),
            bus.clone(),
        ));
        let m2mp = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let alip = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let m2mp_addr = m2mp.local_addr().unwrap();
        let alip_addr = alip.local_addr().unwrap();

        let s = server.clone();
        tokio::spawn(async move { s.run_with_listeners(m2mp, Some(alip)).await });
        for _ in 0..100 {
            if server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        Running {
            server,
            bus,
            registry,
            m2mp: m2mp_addr,
            alip: alip_addr,
        }
    }

    async fn wait_for_sessions(server: &Server, count: usize) {
        for _ in 0..200 {
            if server.sessions().len() == count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("expected {} sessions, got {}", count, server.sessions().len());
    }

    #[tokio::test]
    async fn test_binary_device_session() {
        let running = start(Config::default()).await;
        let mut events = running.bus.subscribe(TOPIC_GENERAL_EVENTS);

        let mut client = DeviceClient::connect(
            ClientConfig::new(running.m2mp).with_recv_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        assert!(client.identify("acme:device001").await.unwrap());
        assert_eq!(client.recv().await.unwrap(), Message::array("_set", ["ga"]));
        assert_eq!(client.recv().await.unwrap(), Message::array("_sta", ["g", "cap"]));

        client
            .send(&Message::PingRequest { counter: 9 })
            .await
            .unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Message::PingResponse { counter: 9 }
        );

        // settings pushed from the bus reach the device
        let dev = running
            .registry
            .device_by_ident("acme:device001")
            .unwrap()
            .unwrap();
        running.registry.set_setting(&dev.id, "apn", "internet").unwrap();
        running
            .bus
            .publish(BusMessage::new(
                format!("{};device_id={}", TOPIC_RECEIVERS, dev.id),
                "send_settings",
            ))
            .unwrap();
        assert_eq!(
            client.recv().await.unwrap(),
            Message::array("_set", ["sg", "apn=internet"])
        );

        let calls: Vec<String> = std::iter::from_fn(|| events.try_recv().ok())
            .map(|m| m.call)
            .collect();
        assert!(calls.contains(&"device_connected".to_string()));
        assert!(calls.contains(&"device_identified".to_string()));

        running
            .bus
            .publish(BusMessage::new(
                format!("{};device_id={}", TOPIC_RECEIVERS, dev.id),
                "disconnect",
            ))
            .unwrap();
        assert!(matches!(
            client.recv().await.unwrap(),
            Message::Disconnected { .. }
        ));
        wait_for_sessions(&running.server, 0).await;
        running.server.shutdown();
    }

    #[tokio::test]
    async fn test_alip_device_session() {
        let running = start(Config::default()).await;

        let stream = TcpStream::connect(running.alip).await.unwrap();
        let (read, mut write) = stream.into_split();
        let mut lines = BufReader::new(read).lines();

        write.write_all(b"ID acme:device002\nT\nQUIT\n").await.unwrap();
        let mut received = Vec::new();
        while let Ok(Some(line)) =
            tokio::time::timeout(Duration::from_secs(5), lines.next_line())
                .await
                .unwrap()
        {
            received.push(line);
        }
        assert_eq!(received[0], "ID 1");
        assert_eq!(received[1], "S GA");
        assert!(received[2].starts_with("T "));
        assert_eq!(received[3], "QUIT bye !");
        wait_for_sessions(&running.server, 0).await;
        running.server.shutdown();
    }

    #[tokio::test]
    async fn test_connection_limit() {
        let mut config = Config::default();
        config.network.max_connections = 1;
        let running = start(config).await;

        let _first = DeviceClient::connect(ClientConfig::new(running.m2mp))
            .await
            .unwrap();
        wait_for_sessions(&running.server, 1).await;

        let mut second = DeviceClient::connect(
            ClientConfig::new(running.m2mp).with_recv_timeout(Duration::from_secs(5)),
        )
        .await
        .unwrap();
        assert!(matches!(
            second.recv().await.unwrap(),
            Message::Disconnected { .. }
        ));
        assert_eq!(
            running.server.stats().connections_rejected.load(Ordering::Relaxed),
            1
        );
        running.server.shutdown();
    }

    #[tokio::test]
    async fn test_announces_receiver() {
        let bus = Arc::new(LocalBus::new(16));
        let mut events = bus.subscribe(TOPIC_GENERAL_EVENTS);
        let server = Server::new(
            Config::default(),
            Arc::new(MemoryRegistry::new()),
            Arc::new(MemoryTimeSeries::default()),
            bus.clone(),
        );
        server.announce(3000);

        let message = events.try_recv().unwrap();
        assert_eq!(message.call, "new_receiver");
        assert_eq!(message.fields["tcp_port"], 3000);
    }

    #[tokio::test]
    async fn test_shutdown_stops_server() {
        let running = start(Config::default()).await;
        assert!(running.server.is_running());
        running.server.shutdown();
        for _ in 0..100 {
            if !running.server.is_running() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(!running.server.is_running());
    }
}
