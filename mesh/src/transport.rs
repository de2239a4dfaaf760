//! Point-to-point peer links.
//!
//! The engine only needs reliable, ordered byte streams per peer. `Transport`
//! is that seam; `TcpTransport` is the production implementation over tokio
//! sockets with the `PACKET\n` envelope and a `HELLO` handshake naming the
//! dialer.

use std::{net::SocketAddr, sync::Arc, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tokio::{
    io::AsyncWriteExt,
    net::{
        tcp::{OwnedReadHalf, OwnedWriteHalf},
        TcpListener, TcpStream,
    },
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use crate::{
    error::{MeshError, MeshResult},
    wire::{message_lines, read_frame, text_message, write_frame, PEER_PROTOCOL},
};

#[async_trait]
pub trait Transport: Send + Sync {
    /// Send one enveloped body to a single peer.
    async fn send(&self, peer: &str, body: Bytes) -> MeshResult<()>;

    fn is_connected(&self, peer: &str) -> bool;

    fn connected_peers(&self) -> Vec<String>;

    /// Drop the link to a peer, if any. No disconnect callback is raised.
    async fn disconnect(&self, peer: &str);
}

/// Receiver side of a transport.
#[async_trait]
pub trait FrameHandler: Send + Sync {
    async fn on_frame(&self, from: &str, body: Bytes);

    async fn on_disconnect(&self, peer: &str);
}

/// Send `body` to every connected peer. Failures drop only that peer from
/// this broadcast. Returns the number of successful sends.
pub async fn broadcast(transport: &dyn Transport, body: &Bytes) -> usize {
    let mut sent = 0;
    for peer in transport.connected_peers() {
        match transport.send(&peer, body.clone()).await {
            Ok(()) => sent += 1,
            Err(e) => log::debug!(peer = %peer, error = %e, "Broadcast send failed"),
        }
    }
    sent
}

struct Link {
    writer: Mutex<OwnedWriteHalf>,
    cancel: CancellationToken,
}

pub struct TcpTransport {
    self_name: String,
    max_frame_bytes: usize,
    connect_timeout: Duration,
    links: DashMap<String, Arc<Link>>,
    shutdown: CancellationToken,
}

impl TcpTransport {
    pub fn new(self_name: &str, max_frame_bytes: usize, connect_timeout: Duration) -> Arc<Self> {
        Arc::new(Self {
            self_name: self_name.to_string(),
            max_frame_bytes,
            connect_timeout,
            links: DashMap::new(),
            shutdown: CancellationToken::new(),
        })
    }

    fn hello(&self) -> Bytes {
        text_message([format!("HELLO {}", PEER_PROTOCOL), self.self_name.clone()])
    }

    fn parse_hello(body: &[u8]) -> MeshResult<String> {
        let lines = message_lines(body);
        let expected = format!("HELLO {}", PEER_PROTOCOL);
        match (lines.first(), lines.get(1)) {
            (Some(greeting), Some(name)) if *greeting == expected && !name.is_empty() => {
                Ok(name.clone())
            }
            _ => Err(MeshError::Handshake {
                peer: "unknown".to_string(),
                reason: format!("unexpected greeting {:?}", lines),
            }),
        }
    }

    async fn read_hello(&self, reader: &mut OwnedReadHalf) -> MeshResult<String> {
        let frame = tokio::time::timeout(
            self.connect_timeout,
            read_frame(reader, self.max_frame_bytes),
        )
        .await
        .map_err(|_| MeshError::Timeout("peer handshake".to_string()))??;
        match frame {
            Some(body) => Self::parse_hello(&body),
            None => Err(MeshError::Closed),
        }
    }

    /// Accept inbound links until shutdown.
    pub fn serve(
        self: &Arc<Self>,
        listener: TcpListener,
        handler: Arc<dyn FrameHandler>,
    ) -> JoinHandle<()> {
        let transport = self.clone();
        let span = tracing::info_span!("peer_listener", name = %self.self_name);
        tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = transport.shutdown.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, addr)) => {
                            let transport = transport.clone();
                            let handler = handler.clone();
                            tokio::spawn(async move {
                                if let Err(e) = transport.accept_link(stream, handler).await {
                                    log::warn!(%addr, error = %e, "Inbound peer link rejected");
                                }
                            });
                        }
                        Err(e) => log::warn!(error = %e, "Peer accept failed"),
                    }
                }
                log::info!("Peer listener stopped");
            }
            .instrument(span),
        )
    }

    async fn accept_link(
        self: Arc<Self>,
        stream: TcpStream,
        handler: Arc<dyn FrameHandler>,
    ) -> MeshResult<()> {
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        let peer = self.read_hello(&mut reader).await?;
        write_frame(&mut writer, &self.hello()).await?;
        self.register(peer, reader, writer, handler);
        Ok(())
    }

    /// Dial a peer and start reading from it.
    pub async fn connect(
        self: &Arc<Self>,
        peer: &str,
        addr: SocketAddr,
        handler: Arc<dyn FrameHandler>,
    ) -> MeshResult<()> {
        let stream = tokio::time::timeout(self.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| MeshError::Timeout(format!("connect to {}", addr)))??;
        stream.set_nodelay(true)?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &self.hello()).await?;
        let announced = self.read_hello(&mut reader).await?;
        if announced != peer {
            return Err(MeshError::Handshake {
                peer: peer.to_string(),
                reason: format!("remote identified as {}", announced),
            });
        }
        self.register(announced, reader, writer, handler);
        Ok(())
    }

    fn register(
        self: &Arc<Self>,
        peer: String,
        reader: OwnedReadHalf,
        writer: OwnedWriteHalf,
        handler: Arc<dyn FrameHandler>,
    ) {
        let link = Arc::new(Link {
            writer: Mutex::new(writer),
            cancel: self.shutdown.child_token(),
        });
        if let Some(previous) = self.links.insert(peer.clone(), link.clone()) {
            log::info!(peer = %peer, "Replacing existing peer link");
            previous.cancel.cancel();
        }
        log::info!(peer = %peer, "Peer link established");

        let transport = self.clone();
        let span = tracing::debug_span!("peer_link", name = %self.self_name, peer = %peer);
        tokio::spawn(
            async move {
                transport.read_loop(&peer, reader, &link, handler).await;
            }
            .instrument(span),
        );
    }

    async fn read_loop(
        &self,
        peer: &str,
        mut reader: OwnedReadHalf,
        link: &Arc<Link>,
        handler: Arc<dyn FrameHandler>,
    ) {
        loop {
            let frame = tokio::select! {
                _ = link.cancel.cancelled() => return,
                frame = read_frame(&mut reader, self.max_frame_bytes) => frame,
            };
            match frame {
                Ok(Some(body)) => handler.on_frame(peer, body).await,
                Ok(None) => {
                    log::info!("Peer closed link");
                    break;
                }
                Err(e) => {
                    log::warn!(error = %e, "Peer link failed");
                    break;
                }
            }
        }

        // Only the link still registered for this peer reports a disconnect.
        let removed = self
            .links
            .remove_if(peer, |_, current| Arc::ptr_eq(current, link))
            .is_some();
        if removed {
            handler.on_disconnect(peer).await;
        }
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.links.clear();
    }
}

#[async_trait]
impl Transport for TcpTransport {
    async fn send(&self, peer: &str, body: Bytes) -> MeshResult<()> {
        let link = self
            .links
            .get(peer)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| MeshError::PeerNotConnected(peer.to_string()))?;
        let mut writer = link.writer.lock().await;
        let result = write_frame(&mut *writer, &body).await;
        if let Err(e) = &result {
            if e.is_connection_fatal() {
                link.cancel.cancel();
                let _ = writer.shutdown().await;
            }
        }
        result
    }

    fn is_connected(&self, peer: &str) -> bool {
        self.links.contains_key(peer)
    }

    fn connected_peers(&self) -> Vec<String> {
        let mut peers: Vec<String> = self.links.iter().map(|e| e.key().clone()).collect();
        peers.sort();
        peers
    }

    async fn disconnect(&self, peer: &str) {
        if let Some((_, link)) = self.links.remove(peer) {
            link.cancel.cancel();
            let mut writer = link.writer.lock().await;
            let _ = writer.shutdown().await;
            log::info!(peer = %peer, "Peer link closed");
        }
    }
}
