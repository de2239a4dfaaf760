use std::sync::{
    atomic::{AtomicI32, Ordering},
    Arc,
};

use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;
use tracing as log;
use tracing::Instrument;

use super::protocol::{
    encode_hello_reply, encode_sequence_reply, SequencerRequest, SEQUENCER_PROTOCOL,
};
use crate::{
    error::{MeshError, MeshResult},
    packet::SlotId,
    wire::{read_frame, write_frame},
};

/// In-process counter held by the head for one epoch.
#[derive(Debug)]
pub struct AuthoritativeSequencer {
    epoch: i32,
    next: AtomicI32,
    closed: CancellationToken,
}

impl AuthoritativeSequencer {
    pub fn new(epoch: i32, parent: &CancellationToken) -> Arc<Self> {
        Arc::new(Self {
            epoch,
            next: AtomicI32::new(0),
            closed: parent.child_token(),
        })
    }

    pub fn epoch(&self) -> i32 {
        self.epoch
    }

    pub fn next_sequence(&self) -> SlotId {
        SlotId::new(self.epoch, self.next.fetch_add(1, Ordering::SeqCst))
    }

    pub fn peek_sequence(&self) -> i32 {
        self.next.load(Ordering::SeqCst)
    }

    pub fn close(&self) {
        self.closed.cancel();
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Answer proxy requests on a shared listener until closed. The listener
    /// outlives this instance and is reused by the next authoritative epoch.
    pub fn serve(self: &Arc<Self>, listener: Arc<TcpListener>, max_frame_bytes: usize) {
        let sequencer = self.clone();
        let span = tracing::info_span!("sequencer", epoch = self.epoch);
        tokio::spawn(
            async move {
                loop {
                    let accepted = tokio::select! {
                        _ = sequencer.closed.cancelled() => break,
                        accepted = listener.accept() => accepted,
                    };
                    match accepted {
                        Ok((stream, addr)) => {
                            let sequencer = sequencer.clone();
                            tokio::spawn(
                                async move {
                                    if let Err(e) =
                                        sequencer.handle_client(stream, max_frame_bytes).await
                                    {
                                        log::debug!(error = %e, "Sequencer client dropped");
                                    }
                                }
                                .instrument(tracing::debug_span!("sequencer_client", %addr)),
                            );
                        }
                        Err(e) => log::warn!(error = %e, "Sequencer accept failed"),
                    }
                }
                log::info!("Sequencer server closed");
            }
            .instrument(span),
        );
    }

    async fn handle_client(&self, mut stream: TcpStream, max_frame_bytes: usize) -> MeshResult<()> {
        stream.set_nodelay(true)?;
        let mut greeted = false;
        loop {
            let frame = tokio::select! {
                _ = self.closed.cancelled() => return Ok(()),
                frame = read_frame(&mut stream, max_frame_bytes) => frame?,
            };
            let Some(body) = frame else {
                return Ok(());
            };

            let reply = match SequencerRequest::parse(&body)? {
                SequencerRequest::Hello { protocol } => {
                    if protocol != SEQUENCER_PROTOCOL {
                        return Err(MeshError::Protocol(format!(
                            "client speaks {}, expected {}",
                            protocol, SEQUENCER_PROTOCOL
                        )));
                    }
                    greeted = true;
                    encode_hello_reply(self.epoch)
                }
                _ if !greeted => {
                    return Err(MeshError::Protocol(
                        "request before handshake".to_string(),
                    ));
                }
                SequencerRequest::Get => {
                    let stamp = self.next_sequence();
                    log::trace!(sequence = stamp.sequence, "Issued sequence to proxy");
                    encode_sequence_reply(stamp.sequence)
                }
                SequencerRequest::Peek => encode_sequence_reply(self.peek_sequence()),
            };
            write_frame(&mut stream, &reply).await?;
        }
    }
}
