//! A running peer: listeners, dialers, the replication session and the
//! console that drives it.

use std::{sync::Arc, time::Duration};

use anyhow::Context;
use canvas_mesh::{
    FrameHandler, LocalEdit, PeerInfo, ReplicationSession, SequencedPacket, SessionOutputs,
    TcpTransport, Transport,
};
use tokio::{
    io::{AsyncBufReadExt, BufReader},
    net::TcpListener,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn, Instrument};

use crate::{
    config::NodeConfig,
    console::{Command, CommandError},
};

const DIAL_INTERVAL: Duration = Duration::from_secs(1);
const CATCH_UP_POLL: Duration = Duration::from_millis(200);

pub struct Node {
    config: NodeConfig,
    session: ReplicationSession,
    transport: Arc<TcpTransport>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Node {
    /// Bind both listeners, build the session and start linking to peers.
    pub async fn start(config: NodeConfig) -> anyhow::Result<(Self, SessionOutputs)> {
        let listener = TcpListener::bind(config.listen)
            .await
            .with_context(|| format!("binding mesh listener on {}", config.listen))?;
        let sequencer_listener = TcpListener::bind(config.sequencer_listen)
            .await
            .with_context(|| format!("binding sequencer listener on {}", config.sequencer_listen))?;

        let transport = TcpTransport::new(
            &config.name,
            config.mesh.max_frame_bytes,
            config.mesh.sequencer.connect_timeout(),
        );
        let (session, outputs) = ReplicationSession::new(
            &config.name,
            Arc::new(config.directory()),
            transport.clone(),
            config.mesh.clone(),
            Some(Arc::new(sequencer_listener)),
        )?;

        let handler: Arc<dyn FrameHandler> = Arc::new(session.clone());
        let mut node = Self {
            config,
            session,
            transport,
            shutdown: CancellationToken::new(),
            tasks: Vec::new(),
        };
        node.tasks.push(node.transport.serve(listener, handler.clone()));
        info!(
            name = %node.config.name,
            listen = %node.config.listen,
            sequencer = %node.config.sequencer_listen,
            "Node listening"
        );

        // One link per pair: the peer with the greater name dials.
        for peer in node.config.peers.clone() {
            if peer.name < node.config.name {
                let task = node.spawn_dialer(peer, handler.clone());
                node.tasks.push(task);
            }
        }

        node.session.start().await;
        let catch_up = node.spawn_catch_up();
        node.tasks.push(catch_up);
        Ok((node, outputs))
    }

    pub fn session(&self) -> &ReplicationSession {
        &self.session
    }

    fn spawn_dialer(&self, peer: PeerInfo, handler: Arc<dyn FrameHandler>) -> JoinHandle<()> {
        let transport = self.transport.clone();
        let directory = self.session.directory().clone();
        let shutdown = self.shutdown.clone();
        let span = tracing::debug_span!("dialer", peer = %peer.name);
        tokio::spawn(
            async move {
                let Some(address) = peer.address else {
                    warn!("Peer has no address, waiting for it to dial in");
                    return;
                };
                while directory.contains(&peer.name) {
                    if !transport.is_connected(&peer.name) {
                        match transport.connect(&peer.name, address, handler.clone()).await {
                            Ok(()) => info!(%address, "Connected to peer"),
                            Err(e) => debug!(%address, error = %e, "Dial failed, will retry"),
                        }
                    }
                    tokio::select! {
                        _ = shutdown.cancelled() => break,
                        _ = tokio::time::sleep(DIAL_INTERVAL) => {}
                    }
                }
            }
            .instrument(span),
        )
    }

    /// A follower with no history asks the head for a copy once linked.
    fn spawn_catch_up(&self) -> JoinHandle<()> {
        let session = self.session.clone();
        let transport = self.transport.clone();
        let shutdown = self.shutdown.clone();
        tokio::spawn(async move {
            loop {
                let head = session.directory().head();
                match head {
                    Some(head) if head.name == session.name() => return,
                    Some(head) if transport.is_connected(&head.name) => {
                        if session.history().is_empty() {
                            if let Err(e) = session.request_history(&head.name).await {
                                warn!(head = %head.name, error = %e, "History request failed");
                            }
                        }
                        return;
                    }
                    _ => {}
                }
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    _ = tokio::time::sleep(CATCH_UP_POLL) => {}
                }
            }
        })
    }

    /// Log everything the session surfaces.
    pub fn spawn_reporters(&mut self, outputs: SessionOutputs) {
        let SessionOutputs {
            mut deliveries,
            mut chat,
        } = outputs;
        self.tasks.push(tokio::spawn(async move {
            while let Some(packet) = deliveries.recv().await {
                info!(
                    kind = %packet.kind(),
                    slot = %packet.slot(),
                    object = packet.object_reference(),
                    body = %String::from_utf8_lossy(packet.body()),
                    "Delivered"
                );
            }
        }));
        self.tasks.push(tokio::spawn(async move {
            while let Some(message) = chat.recv().await {
                info!(from = %message.from, text = %message.text, "Chat");
            }
        }));
    }

    /// Run one console command. Returns `false` when the node should stop.
    pub async fn execute(&self, command: Command) -> anyhow::Result<bool> {
        match command {
            Command::Create { object, text } => {
                self.session.submit(LocalEdit::creation(object, text))?
            }
            Command::Modify { object, text } => {
                self.session.submit(LocalEdit::geometry(object, text))?
            }
            Command::Delete { object } => self.session.submit(LocalEdit::deletion(object))?,
            Command::Chat(text) => {
                let reached = self.session.send_chat(&text).await;
                println!("chat sent to {} peer(s)", reached);
            }
            Command::History => {
                for raw in self.session.history() {
                    match SequencedPacket::decode(raw) {
                        Ok(packet) => println!(
                            "{} {} object={} {}",
                            packet.slot(),
                            packet.kind(),
                            packet.object_reference(),
                            String::from_utf8_lossy(packet.body())
                        ),
                        Err(e) => println!("<undecodable: {}>", e),
                    }
                }
            }
            Command::Stats => {
                println!("epoch: {}", self.session.current_epoch());
                println!("head: {}", self.session.is_head());
                println!("election: {:?}", self.session.election_phase());
                println!("pending edits: {}", self.session.pending_edits());
                println!("{:#?}", self.session.metrics());
                for (peer, frames) in self.session.peer_frames() {
                    println!("frames from {}: {}", peer, frames);
                }
            }
            Command::Peers => {
                for peer in self.session.directory().snapshot() {
                    let link = if peer.name == self.config.name {
                        "self"
                    } else if self.transport.is_connected(&peer.name) {
                        "connected"
                    } else {
                        "offline"
                    };
                    println!("{} {:?} {}", peer.name, peer.level, link);
                }
            }
            Command::Kick(peer) => self.session.kick(&peer).await?,
            Command::Quit => return Ok(false),
        }
        Ok(true)
    }

    pub async fn shutdown(self) {
        self.shutdown.cancel();
        self.session.shutdown().await;
        self.transport.shutdown();
        for task in self.tasks {
            task.abort();
        }
        info!("Node stopped");
    }
}

/// Run a node until stdin asks it to quit, it is interrupted, or it is
/// kicked from the session.
pub async fn run(config: NodeConfig) -> anyhow::Result<()> {
    let (mut node, outputs) = Node::start(config).await?;
    node.spawn_reporters(outputs);

    let session = node.session().clone();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut console_open = true;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            _ = session.closed() => {
                warn!("Session closed");
                break;
            }
            line = lines.next_line(), if console_open => match line? {
                None => {
                    info!("Console closed, running until interrupted");
                    console_open = false;
                }
                Some(line) => match line.parse::<Command>() {
                    Ok(command) => match node.execute(command).await {
                        Ok(true) => {}
                        Ok(false) => break,
                        Err(e) => eprintln!("error: {:#}", e),
                    },
                    Err(CommandError::Empty) => {}
                    Err(e) => eprintln!("{}", e),
                },
            },
        }
    }

    node.shutdown().await;
    Ok(())
}
