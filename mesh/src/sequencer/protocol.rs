//! Line-oriented sequencer protocol.
//!
//! ```text
//! client: HELLO SEQ/1.0\n\n          server: SEQ/1.0 OK\n<epoch>\n\n
//! client: GET SEQUENCE\n\n           server: SEQUENCE\n<n>\n\n
//! client: PEEK SEQUENCE\n\n          server: SEQUENCE\n<n>\n\n
//! ```
//!
//! Every message rides in the same `PACKET\n` envelope as peer traffic.

use bytes::Bytes;

use crate::{
    error::{MeshError, MeshResult},
    wire::{message_lines, text_message},
};

pub const SEQUENCER_PROTOCOL: &str = "SEQ/1.0";

/// Sequence value reported when the server cannot issue one.
pub const UNAVAILABLE: i32 = -1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SequencerRequest {
    Hello { protocol: String },
    Get,
    Peek,
}

impl SequencerRequest {
    pub fn encode(&self) -> Bytes {
        match self {
            SequencerRequest::Hello { protocol } => text_message([format!("HELLO {}", protocol)]),
            SequencerRequest::Get => text_message(["GET SEQUENCE"]),
            SequencerRequest::Peek => text_message(["PEEK SEQUENCE"]),
        }
    }

    pub fn parse(body: &[u8]) -> MeshResult<Self> {
        let lines = message_lines(body);
        let first = lines.first().map(|l| l.trim()).unwrap_or_default();
        match first.split_once(' ') {
            Some(("HELLO", protocol)) => Ok(SequencerRequest::Hello {
                protocol: protocol.trim().to_string(),
            }),
            Some(("GET", "SEQUENCE")) => Ok(SequencerRequest::Get),
            Some(("PEEK", "SEQUENCE")) => Ok(SequencerRequest::Peek),
            _ => Err(MeshError::Protocol(format!(
                "unknown sequencer request {:?}",
                first
            ))),
        }
    }
}

pub fn encode_hello_reply(epoch: i32) -> Bytes {
    text_message([format!("{} OK", SEQUENCER_PROTOCOL), epoch.to_string()])
}

/// Returns the server's current epoch.
pub fn parse_hello_reply(body: &[u8]) -> MeshResult<i32> {
    let lines = message_lines(body);
    let expected = format!("{} OK", SEQUENCER_PROTOCOL);
    match (lines.first(), lines.get(1)) {
        (Some(status), Some(epoch)) if *status == expected => epoch
            .trim()
            .parse()
            .map_err(|_| MeshError::Protocol(format!("bad epoch in greeting: {:?}", epoch))),
        _ => Err(MeshError::Protocol(format!(
            "sequencer refused handshake: {:?}",
            lines
        ))),
    }
}

pub fn encode_sequence_reply(sequence: i32) -> Bytes {
    text_message(["SEQUENCE".to_string(), sequence.to_string()])
}

pub fn parse_sequence_reply(body: &[u8]) -> MeshResult<i32> {
    let lines = message_lines(body);
    match (lines.first().map(String::as_str), lines.get(1)) {
        (Some("SEQUENCE"), Some(value)) => value
            .trim()
            .parse()
            .map_err(|_| MeshError::Protocol(format!("bad sequence value: {:?}", value))),
        _ => Err(MeshError::Protocol(format!(
            "unexpected sequencer reply: {:?}",
            lines
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_wire_text() {
        assert_eq!(&SequencerRequest::Get.encode()[..], b"GET SEQUENCE\n\n");
        assert_eq!(&SequencerRequest::Peek.encode()[..], b"PEEK SEQUENCE\n\n");
        let hello = SequencerRequest::Hello {
            protocol: SEQUENCER_PROTOCOL.to_string(),
        };
        assert_eq!(&hello.encode()[..], b"HELLO SEQ/1.0\n\n");
        assert_eq!(SequencerRequest::parse(&hello.encode()).unwrap(), hello);
        assert!(SequencerRequest::parse(b"PUT SEQUENCE\n\n").is_err());
    }

    #[test]
    fn test_replies() {
        assert_eq!(&encode_hello_reply(3)[..], b"SEQ/1.0 OK\n3\n\n");
        assert_eq!(parse_hello_reply(&encode_hello_reply(3)).unwrap(), 3);
        assert!(parse_hello_reply(b"SEQ/2.0 OK\n3\n\n").is_err());

        assert_eq!(&encode_sequence_reply(17)[..], b"SEQUENCE\n17\n\n");
        assert_eq!(parse_sequence_reply(b"SEQUENCE\n17\n\n").unwrap(), 17);
        assert_eq!(parse_sequence_reply(b"SEQUENCE\n-1\n\n").unwrap(), UNAVAILABLE);
        assert!(parse_sequence_reply(b"SEQUENCE\nabc\n\n").is_err());
    }
}
