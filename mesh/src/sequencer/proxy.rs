use std::{
    net::SocketAddr,
    sync::{
        atomic::{AtomicI32, Ordering},
        Arc,
    },
};

use tokio::{net::TcpStream, sync::Mutex};
use tokio_util::sync::CancellationToken;
use tracing as log;

use super::protocol::{
    parse_hello_reply, parse_sequence_reply, SequencerRequest, SEQUENCER_PROTOCOL, UNAVAILABLE,
};
use crate::{
    config::SequencerConfig,
    error::{MeshError, MeshResult},
    packet::SlotId,
    wire::{read_frame, write_frame},
};

/// Forwards sequence requests to the head over one persistent connection.
///
/// Any failure is reported as "unavailable" (`None`) and drops the
/// connection; the next request reconnects.
#[derive(Debug)]
pub struct ProxySequencer {
    head: String,
    address: Option<SocketAddr>,
    /// Announced epoch, or `UNAVAILABLE` until learned from the handshake.
    epoch: AtomicI32,
    highest_epoch: Arc<AtomicI32>,
    config: SequencerConfig,
    max_frame_bytes: usize,
    connection: Mutex<Option<TcpStream>>,
    closed: CancellationToken,
}

impl ProxySequencer {
    pub fn new(
        head: &str,
        address: Option<SocketAddr>,
        epoch: Option<i32>,
        highest_epoch: Arc<AtomicI32>,
        config: SequencerConfig,
        max_frame_bytes: usize,
        parent: &CancellationToken,
    ) -> Arc<Self> {
        if address.is_none() {
            log::warn!(head = %head, "Head has no sequencer address, local edits will stall");
        }
        Arc::new(Self {
            head: head.to_string(),
            address,
            epoch: AtomicI32::new(epoch.unwrap_or(UNAVAILABLE)),
            highest_epoch,
            config,
            max_frame_bytes,
            connection: Mutex::new(None),
            closed: parent.child_token(),
        })
    }

    pub fn head(&self) -> &str {
        &self.head
    }

    pub fn epoch(&self) -> i32 {
        self.epoch.load(Ordering::SeqCst)
    }

    pub async fn next_sequence(&self) -> Option<SlotId> {
        let sequence = self.request(SequencerRequest::Get).await?;
        Some(SlotId::new(self.epoch(), sequence))
    }

    pub async fn peek_sequence(&self) -> Option<i32> {
        self.request(SequencerRequest::Peek).await
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    async fn request(&self, request: SequencerRequest) -> Option<i32> {
        if self.closed.is_cancelled() {
            return None;
        }
        let mut connection = self.connection.lock().await;
        let result = tokio::select! {
            _ = self.closed.cancelled() => Err(MeshError::Closed),
            result = tokio::time::timeout(
                self.config.request_timeout(),
                self.exchange(&mut *connection, &request),
            ) => result.unwrap_or_else(|_| Err(MeshError::Timeout("sequencer request".to_string()))),
        };
        match result {
            Ok(sequence) if sequence >= 0 => Some(sequence),
            Ok(_) => {
                log::debug!(head = %self.head, "Sequencer reported unavailable");
                None
            }
            Err(e) => {
                log::debug!(head = %self.head, error = %e, "Sequencer request failed");
                *connection = None;
                None
            }
        }
    }

    async fn exchange(
        &self,
        connection: &mut Option<TcpStream>,
        request: &SequencerRequest,
    ) -> MeshResult<i32> {
        if connection.is_none() {
            *connection = Some(self.connect().await?);
        }
        let stream = connection.as_mut().ok_or(MeshError::Closed)?;
        write_frame(stream, &request.encode()).await?;
        let reply = read_frame(stream, self.max_frame_bytes)
            .await?
            .ok_or(MeshError::Closed)?;
        parse_sequence_reply(&reply)
    }

    async fn connect(&self) -> MeshResult<TcpStream> {
        let address = self
            .address
            .ok_or_else(|| MeshError::UnknownPeer(format!("{} (no sequencer address)", self.head)))?;
        let mut stream = tokio::time::timeout(
            self.config.connect_timeout(),
            TcpStream::connect(address),
        )
        .await
        .map_err(|_| MeshError::Timeout(format!("connect to sequencer at {}", address)))??;
        stream.set_nodelay(true)?;

        let hello = SequencerRequest::Hello {
            protocol: SEQUENCER_PROTOCOL.to_string(),
        };
        write_frame(&mut stream, &hello.encode()).await?;
        let reply = read_frame(&mut stream, self.max_frame_bytes)
            .await?
            .ok_or(MeshError::Closed)?;
        let server_epoch = parse_hello_reply(&reply)?;

        let announced = self.epoch();
        if announced == UNAVAILABLE {
            self.epoch.store(server_epoch, Ordering::SeqCst);
        } else if announced != server_epoch {
            return Err(MeshError::Protocol(format!(
                "head {} serves epoch {}, expected {}",
                self.head, server_epoch, announced
            )));
        }
        self.highest_epoch.fetch_max(server_epoch, Ordering::SeqCst);
        log::info!(head = %self.head, epoch = server_epoch, "Connected to sequencer");
        Ok(stream)
    }
}
