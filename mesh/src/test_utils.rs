//! Shared helpers for crate-internal tests.

use std::{
    collections::{BTreeSet, HashMap, HashSet},
    net::SocketAddr,
    sync::{Arc, Once},
    time::Duration,
};

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::{net::TcpListener, sync::mpsc};
use tracing as log;
use tracing_subscriber::{
    filter::LevelFilter, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter,
};

use crate::{
    error::{MeshError, MeshResult},
    packet::{PacketKind, SequencedPacket, SlotId},
    transport::{FrameHandler, Transport},
};

static INIT: Once = Once::new();

/// Initialize test logging infrastructure
pub fn init_test_logging() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::registry()
            .with(tracing_subscriber::fmt::layer())
            .with(
                EnvFilter::builder()
                    .with_default_directive(LevelFilter::INFO.into())
                    .from_env_lossy(),
            )
            .try_init();
    });
}

/// Test utility: Bind an ephemeral port and keep the listener
pub async fn find_free_port() -> (TcpListener, SocketAddr) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    log::debug!("Found free port: {}", addr.port());
    (listener, addr)
}

/// Creation of `object` at `epoch:sequence`.
pub fn creation(epoch: i32, sequence: i32, object: i32) -> SequencedPacket {
    let slot = SlotId::new(epoch, sequence);
    SequencedPacket::new(
        PacketKind::Creation,
        slot,
        slot,
        object,
        Bytes::from(format!("shape {}", object)),
    )
}

/// Geometry edit of `object`, created at `creation`.
pub fn edit(epoch: i32, sequence: i32, creation: (i32, i32), object: i32) -> SequencedPacket {
    SequencedPacket::new(
        PacketKind::GeometryModification,
        SlotId::new(epoch, sequence),
        SlotId::new(creation.0, creation.1),
        object,
        Bytes::from(format!("move {}", object)),
    )
}

enum LinkEvent {
    Frame(Bytes),
    Closed,
}

#[derive(Default)]
struct MockState {
    connected: BTreeSet<String>,
    failing: HashSet<String>,
    sent: HashMap<String, Vec<Bytes>>,
    links: HashMap<String, mpsc::UnboundedSender<LinkEvent>>,
}

/// In-memory transport. Standalone it only records what was sent; joined
/// to a [`MockNetwork`] it also delivers frames, in order, to the peer's
/// handler.
pub struct MockTransport {
    name: String,
    state: Mutex<MockState>,
}

impl MockTransport {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            state: Mutex::new(MockState::default()),
        })
    }

    /// Mark `peer` reachable without routing anything to it.
    pub fn connect(&self, peer: &str) {
        self.state.lock().connected.insert(peer.to_string());
    }

    /// Every later send to `peer` fails while it still looks connected.
    pub fn fail_sends_to(&self, peer: &str) {
        self.state.lock().failing.insert(peer.to_string());
    }

    pub fn sent_to(&self, peer: &str) -> Vec<Bytes> {
        self.state.lock().sent.get(peer).cloned().unwrap_or_default()
    }

    fn attach_link(&self, peer: &str, link: mpsc::UnboundedSender<LinkEvent>) {
        let mut state = self.state.lock();
        state.connected.insert(peer.to_string());
        state.links.insert(peer.to_string(), link);
    }

    /// The remote end went away; drop our side silently.
    fn forget(&self, peer: &str) {
        let mut state = self.state.lock();
        state.connected.remove(peer);
        state.links.remove(peer);
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn send(&self, peer: &str, body: Bytes) -> MeshResult<()> {
        let mut state = self.state.lock();
        if !state.connected.contains(peer) {
            return Err(MeshError::PeerNotConnected(peer.to_string()));
        }
        if state.failing.contains(peer) {
            return Err(MeshError::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                "mock send failure",
            )));
        }
        state
            .sent
            .entry(peer.to_string())
            .or_default()
            .push(body.clone());
        log::trace!(from = %self.name, to = %peer, len = body.len(), "Mock send");
        if let Some(link) = state.links.get(peer) {
            let _ = link.send(LinkEvent::Frame(body));
        }
        Ok(())
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.state.lock().connected.contains(peer)
    }

    fn connected_peers(&self) -> Vec<String> {
        self.state.lock().connected.iter().cloned().collect()
    }

    async fn disconnect(&self, peer: &str) {
        let mut state = self.state.lock();
        state.connected.remove(peer);
        if let Some(link) = state.links.remove(peer) {
            let _ = link.send(LinkEvent::Closed);
        }
    }
}

/// Routes frames between [`MockTransport`]s. Each direction of a link is
/// one channel drained by one task, so per-link ordering holds.
#[derive(Default)]
pub struct MockNetwork {
    transports: Mutex<HashMap<String, Arc<MockTransport>>>,
    handlers: Mutex<HashMap<String, Arc<dyn FrameHandler>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn join(&self, name: &str) -> Arc<MockTransport> {
        let transport = MockTransport::new(name);
        self.transports
            .lock()
            .insert(name.to_string(), transport.clone());
        transport
    }

    pub fn attach(&self, name: &str, handler: Arc<dyn FrameHandler>) {
        self.handlers.lock().insert(name.to_string(), handler);
    }

    fn transport(&self, name: &str) -> Option<Arc<MockTransport>> {
        self.transports.lock().get(name).cloned()
    }

    fn handler(&self, name: &str) -> Option<Arc<dyn FrameHandler>> {
        self.handlers.lock().get(name).cloned()
    }

    /// Open a link in both directions.
    pub fn link(self: &Arc<Self>, a: &str, b: &str) {
        self.open_direction(a, b);
        self.open_direction(b, a);
    }

    fn open_direction(self: &Arc<Self>, from: &str, to: &str) {
        let Some(sender) = self.transport(from) else {
            return;
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        sender.attach_link(to, tx);

        let network = self.clone();
        let from = from.to_string();
        let to = to.to_string();
        tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                let Some(handler) = network.handler(&to) else {
                    continue;
                };
                match event {
                    LinkEvent::Frame(body) => handler.on_frame(&from, body).await,
                    LinkEvent::Closed => {
                        if let Some(receiver) = network.transport(&to) {
                            receiver.forget(&from);
                        }
                        handler.on_disconnect(&from).await;
                        break;
                    }
                }
            }
        });
    }

    /// Close every link of `name`, as if the peer crashed.
    pub async fn isolate(&self, name: &str) {
        if let Some(transport) = self.transport(name) {
            for peer in transport.connected_peers() {
                transport.disconnect(&peer).await;
            }
        }
        self.handlers.lock().remove(name);
    }
}

/// Frame handler that records everything it is given.
pub struct RecordingHandler {
    frames_tx: mpsc::UnboundedSender<(String, Bytes)>,
    frames_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<(String, Bytes)>>,
    disconnects_tx: mpsc::UnboundedSender<String>,
    disconnects_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<String>>,
}

impl RecordingHandler {
    pub fn new() -> Arc<Self> {
        let (frames_tx, frames_rx) = mpsc::unbounded_channel();
        let (disconnects_tx, disconnects_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            frames_tx,
            frames_rx: tokio::sync::Mutex::new(frames_rx),
            disconnects_tx,
            disconnects_rx: tokio::sync::Mutex::new(disconnects_rx),
        })
    }

    pub async fn next_frame(&self) -> (String, Bytes) {
        let mut rx = self.frames_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("frame channel closed")
    }

    pub async fn next_disconnect(&self) -> String {
        let mut rx = self.disconnects_rx.lock().await;
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for a disconnect")
            .expect("disconnect channel closed")
    }
}

#[async_trait]
impl FrameHandler for RecordingHandler {
    async fn on_frame(&self, from: &str, body: Bytes) {
        let _ = self.frames_tx.send((from.to_string(), body));
    }

    async fn on_disconnect(&self, peer: &str) {
        let _ = self.disconnects_tx.send(peer.to_string());
    }
}

/// Poll `condition` every few milliseconds until it holds or `limit` passes.
pub async fn wait_until(limit: Duration, mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
