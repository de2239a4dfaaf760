//! Stream envelope and line-oriented control messages.
//!
//! Every body on a peer or sequencer connection travels as
//! `PACKET\n` + 4-byte big-endian length + body. Bodies are either a binary
//! sequenced packet (first byte is a kind tag) or an ASCII control message made
//! of `\n`-separated lines terminated by a blank line.

use bytes::{BufMut, Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::{
    error::{MeshError, MeshResult},
    packet::PacketKind,
    peers::PermissionLevel,
};

pub const FRAME_TAG: &[u8] = b"PACKET\n";
pub const FRAME_HEADER_LEN: usize = FRAME_TAG.len() + 4;
pub const LINE_END: char = '\n';

/// Protocol id exchanged when a peer link is opened.
pub const PEER_PROTOCOL: &str = "CANVAS/1.0";

pub fn encode_frame(body: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(FRAME_HEADER_LEN + body.len());
    buf.put_slice(FRAME_TAG);
    buf.put_u32(body.len() as u32);
    buf.put_slice(body);
    buf.freeze()
}

pub async fn write_frame<W>(writer: &mut W, body: &[u8]) -> MeshResult<()>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(&encode_frame(body)).await?;
    writer.flush().await?;
    Ok(())
}

/// Read exactly one frame. Returns `Ok(None)` on a clean end of stream at a
/// frame boundary.
pub async fn read_frame<R>(reader: &mut R, max_len: usize) -> MeshResult<Option<Bytes>>
where
    R: AsyncRead + Unpin,
{
    let mut header = [0u8; FRAME_HEADER_LEN];
    let first = reader.read(&mut header[..1]).await?;
    if first == 0 {
        return Ok(None);
    }
    reader.read_exact(&mut header[1..]).await?;

    if &header[..FRAME_TAG.len()] != FRAME_TAG {
        return Err(MeshError::InvalidFrameTag);
    }
    let mut len_bytes = [0u8; 4];
    len_bytes.copy_from_slice(&header[FRAME_TAG.len()..]);
    let len = u32::from_be_bytes(len_bytes) as usize;
    if len > max_len {
        return Err(MeshError::FrameTooLarge { len, max: max_len });
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    Ok(Some(Bytes::from(body)))
}

/// Render lines as a blank-line terminated text message.
pub fn text_message<I, S>(lines: I) -> Bytes
where
    I: IntoIterator<Item = S>,
    S: AsRef<str>,
{
    let mut out = String::new();
    for line in lines {
        out.push_str(line.as_ref());
        out.push(LINE_END);
    }
    out.push(LINE_END);
    Bytes::from(out)
}

/// Split a text message into its non-empty leading lines.
pub fn message_lines(body: &[u8]) -> Vec<String> {
    String::from_utf8_lossy(body)
        .split(LINE_END)
        .take_while(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Election and membership control messages.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ControlMessage {
    Elect,
    Answer,
    Coord { head: String, epoch: i32 },
    Kick { peer: String },
}

impl ControlMessage {
    pub fn encode(&self) -> Bytes {
        match self {
            ControlMessage::Elect => text_message(["ELECT"]),
            ControlMessage::Answer => text_message(["ANSWER"]),
            ControlMessage::Coord { head, epoch } => {
                text_message(["COORD".to_string(), head.clone(), epoch.to_string()])
            }
            ControlMessage::Kick { peer } => text_message(["KICK", peer.as_str()]),
        }
    }

    /// Parse a control message, `None` when the body is not one.
    pub fn parse(body: &[u8]) -> Option<MeshResult<Self>> {
        let keyword = body.split(|b| *b == b'\n').next()?;
        let lines = || message_lines(body);
        let message = match keyword {
            b"ELECT" => Ok(ControlMessage::Elect),
            b"ANSWER" => Ok(ControlMessage::Answer),
            b"COORD" => {
                let lines = lines();
                match (lines.get(1), lines.get(2).map(|e| e.trim().parse::<i32>())) {
                    (Some(head), Some(Ok(epoch))) if !head.is_empty() => {
                        Ok(ControlMessage::Coord {
                            head: head.clone(),
                            epoch,
                        })
                    }
                    _ => Err(MeshError::Protocol(format!(
                        "malformed COORD message: {:?}",
                        lines
                    ))),
                }
            }
            b"KICK" => match lines().get(1) {
                Some(peer) => Ok(ControlMessage::Kick { peer: peer.clone() }),
                None => Err(MeshError::Protocol(
                    "KICK without peer name".to_string(),
                )),
            },
            _ => return None,
        };
        Some(message)
    }
}

/// Permission change broadcast: kind tag, then `\n<peer>\n<level>\n`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PermissionChange {
    pub peer: String,
    pub level: PermissionLevel,
}

impl PermissionChange {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(PacketKind::PermissionChange.tag());
        buf.put_slice(format!("\n{}\n{}\n", self.peer, self.level.ordinal()).as_bytes());
        buf.freeze()
    }

    pub fn parse(body: &[u8]) -> MeshResult<Self> {
        let text = String::from_utf8_lossy(body.get(1..).unwrap_or_default()).into_owned();
        let mut lines = text.split(LINE_END).filter(|line| !line.is_empty());
        let peer = lines.next().map(str::to_string);
        let level = lines
            .next()
            .and_then(|l| l.trim().parse::<u8>().ok())
            .and_then(PermissionLevel::from_ordinal);
        match (peer, level) {
            (Some(peer), Some(level)) => Ok(Self { peer, level }),
            _ => Err(MeshError::Protocol(format!(
                "malformed permission change: {:?}",
                text
            ))),
        }
    }
}

pub fn encode_chat(text: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + text.len());
    buf.put_u8(PacketKind::Chat.tag());
    buf.put_slice(text);
    buf.freeze()
}

pub fn encode_copy_request() -> Bytes {
    Bytes::from(vec![PacketKind::CopyRequest.tag()])
}

/// Inbound body after routing on its first bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InboundFrame {
    Control(ControlMessage),
    Chat(Bytes),
    PermissionChange(PermissionChange),
    CopyRequest,
    /// Anything else is handed to the packet codec.
    Sequenced(Bytes),
}

impl InboundFrame {
    pub fn classify(body: Bytes) -> MeshResult<Self> {
        if let Some(control) = ControlMessage::parse(&body) {
            return control.map(InboundFrame::Control);
        }
        match body.first().copied().and_then(PacketKind::from_tag) {
            Some(PacketKind::Chat) => Ok(InboundFrame::Chat(body.slice(1..))),
            Some(PacketKind::PermissionChange) => {
                PermissionChange::parse(&body).map(InboundFrame::PermissionChange)
            }
            Some(PacketKind::CopyRequest) => Ok(InboundFrame::CopyRequest),
            _ => Ok(InboundFrame::Sequenced(body)),
        }
    }
}
