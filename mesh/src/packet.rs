//! Sequenced packet model and its fixed big-endian header codec.
//!
//! Layout (all integers big-endian):
//!
//! | offset | size | field                                             |
//! |--------|------|---------------------------------------------------|
//! | 0      | 1    | kind tag                                          |
//! | 1      | 4    | epoch                                             |
//! | 5      | 4    | sequence                                          |
//! | 9      | 4    | creation epoch (ignored for creation/request)     |
//! | 13     | 4    | creation sequence (ignored for creation/request)  |
//! | 17     | 4    | object reference (absent for request)             |
//! | 21     | ...  | body                                              |
//!
//! Retransmission requests are exactly 9 bytes. Creation packets may be as
//! short as 9 bytes when decoding; every packet this module encodes, other
//! than a request, carries the full header and the object reference.

use std::fmt;

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::error::MalformedPacketError;

pub const BASE_HEADER_LEN: usize = 9;
pub const FULL_HEADER_LEN: usize = 17;
const OBJECT_REFERENCE_LEN: usize = 4;

/// Object reference carried by packets that do not target an object.
pub const NO_OBJECT: i32 = -1;

/// Packet kind with an explicit, stable wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Tombstone,
    Creation,
    GeometryModification,
    AttributeModification,
    AttributeDeletion,
    Deletion,
    SequenceRequest,
    Chat,
    CopyRequest,
    Election,
    PermissionChange,
}

impl PacketKind {
    pub fn tag(self) -> u8 {
        match self {
            PacketKind::Tombstone => 0,
            PacketKind::Creation => 1,
            PacketKind::GeometryModification => 2,
            PacketKind::AttributeModification => 3,
            PacketKind::AttributeDeletion => 4,
            PacketKind::Deletion => 5,
            PacketKind::SequenceRequest => 6,
            PacketKind::Chat => 7,
            PacketKind::CopyRequest => 8,
            PacketKind::Election => 9,
            PacketKind::PermissionChange => 10,
        }
    }

    pub fn from_tag(tag: u8) -> Option<Self> {
        let kind = match tag {
            0 => PacketKind::Tombstone,
            1 => PacketKind::Creation,
            2 => PacketKind::GeometryModification,
            3 => PacketKind::AttributeModification,
            4 => PacketKind::AttributeDeletion,
            5 => PacketKind::Deletion,
            6 => PacketKind::SequenceRequest,
            7 => PacketKind::Chat,
            8 => PacketKind::CopyRequest,
            9 => PacketKind::Election,
            10 => PacketKind::PermissionChange,
            _ => return None,
        };
        Some(kind)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            PacketKind::Tombstone => "tombstone",
            PacketKind::Creation => "creation",
            PacketKind::GeometryModification => "geometry-modification",
            PacketKind::AttributeModification => "attribute-modification",
            PacketKind::AttributeDeletion => "attribute-deletion",
            PacketKind::Deletion => "deletion",
            PacketKind::SequenceRequest => "sequence-request",
            PacketKind::Chat => "chat",
            PacketKind::CopyRequest => "copy-request",
            PacketKind::Election => "election",
            PacketKind::PermissionChange => "permission-change",
        }
    }

    /// Kinds whose creation dependency is the packet itself.
    pub fn is_self_dependent(self) -> bool {
        matches!(self, PacketKind::Creation | PacketKind::SequenceRequest)
    }

    /// Kinds surfaced to the drawing surface on delivery.
    pub fn is_application(self) -> bool {
        matches!(
            self,
            PacketKind::Creation
                | PacketKind::GeometryModification
                | PacketKind::AttributeModification
                | PacketKind::AttributeDeletion
                | PacketKind::Deletion
        )
    }

    /// Kinds that occupy a slot in an epoch's delivered sequence.
    pub fn is_sequenced(self) -> bool {
        self.is_application() || self == PacketKind::Tombstone
    }

    fn min_len(self) -> usize {
        if self.is_self_dependent() {
            BASE_HEADER_LEN
        } else {
            FULL_HEADER_LEN
        }
    }
}

impl fmt::Display for PacketKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Position of a packet in the replicated history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId {
    pub epoch: i32,
    pub sequence: i32,
}

impl SlotId {
    pub fn new(epoch: i32, sequence: i32) -> Self {
        Self { epoch, sequence }
    }
}

impl fmt::Display for SlotId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.epoch, self.sequence)
    }
}

/// An immutable packet plus the exact bytes it was decoded from (or encoded to).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SequencedPacket {
    kind: PacketKind,
    slot: SlotId,
    creation: SlotId,
    object_reference: i32,
    body: Bytes,
    raw: Bytes,
    originated_locally: bool,
}

impl SequencedPacket {
    /// Build and encode a packet. The creation dependency is ignored (replaced by
    /// the packet's own slot) for creation kinds.
    pub fn new(
        kind: PacketKind,
        slot: SlotId,
        creation: SlotId,
        object_reference: i32,
        body: Bytes,
    ) -> Self {
        let creation = if kind.is_self_dependent() {
            slot
        } else {
            creation
        };
        let object_reference = if kind == PacketKind::SequenceRequest {
            NO_OBJECT
        } else {
            object_reference
        };
        let raw = encode(kind, slot, creation, object_reference, &body);
        Self {
            kind,
            slot,
            creation,
            object_reference,
            body,
            raw,
            originated_locally: false,
        }
    }

    /// Retransmission request for a missing slot.
    pub fn sequence_request(slot: SlotId) -> Self {
        Self::new(
            PacketKind::SequenceRequest,
            slot,
            slot,
            NO_OBJECT,
            Bytes::new(),
        )
    }

    /// Marker for a slot given up as unrecoverable.
    pub fn tombstone(slot: SlotId) -> Self {
        Self::new(PacketKind::Tombstone, slot, slot, NO_OBJECT, Bytes::new())
    }

    /// Decode a packet; the input is retained as the packet's raw bytes.
    pub fn decode(raw: Bytes) -> Result<Self, MalformedPacketError> {
        let Some(&tag) = raw.first() else {
            return Err(MalformedPacketError::Empty);
        };
        let kind = PacketKind::from_tag(tag).ok_or(MalformedPacketError::UnknownKind(tag))?;
        if raw.len() < kind.min_len() {
            return Err(MalformedPacketError::Truncated {
                kind: kind.as_str(),
                len: raw.len(),
                min: kind.min_len(),
            });
        }

        let mut header = &raw[1..];
        let epoch = header.get_i32();
        let sequence = header.get_i32();
        let slot = SlotId::new(epoch, sequence);

        let creation = if kind.is_self_dependent() || raw.len() < FULL_HEADER_LEN {
            slot
        } else {
            SlotId::new(header.get_i32(), header.get_i32())
        };

        let ref_end = FULL_HEADER_LEN + OBJECT_REFERENCE_LEN;
        let (object_reference, body) =
            if kind == PacketKind::SequenceRequest || raw.len() < ref_end {
                (NO_OBJECT, Bytes::new())
            } else {
                let mut reference = &raw[FULL_HEADER_LEN..ref_end];
                (reference.get_i32(), raw.slice(ref_end..))
            };

        Ok(Self {
            kind,
            slot,
            creation,
            object_reference,
            body,
            raw,
            originated_locally: false,
        })
    }

    /// Mark the packet as authored by this peer so delivery does not echo it.
    pub fn into_local(mut self) -> Self {
        self.originated_locally = true;
        self
    }

    pub fn kind(&self) -> PacketKind {
        self.kind
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    pub fn epoch(&self) -> i32 {
        self.slot.epoch
    }

    pub fn sequence(&self) -> i32 {
        self.slot.sequence
    }

    /// Slot of the creation packet this packet causally depends on.
    pub fn creation(&self) -> SlotId {
        self.creation
    }

    pub fn object_reference(&self) -> i32 {
        self.object_reference
    }

    pub fn body(&self) -> &Bytes {
        &self.body
    }

    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    pub fn originated_locally(&self) -> bool {
        self.originated_locally
    }

    /// True when delivery must wait for another slot to be delivered first.
    pub fn has_foreign_dependency(&self) -> bool {
        !self.kind.is_self_dependent()
            && self.kind != PacketKind::Tombstone
            && self.creation != self.slot
    }
}

fn encode(
    kind: PacketKind,
    slot: SlotId,
    creation: SlotId,
    object_reference: i32,
    body: &[u8],
) -> Bytes {
    if kind == PacketKind::SequenceRequest {
        let mut buf = BytesMut::with_capacity(BASE_HEADER_LEN);
        buf.put_u8(kind.tag());
        buf.put_i32(slot.epoch);
        buf.put_i32(slot.sequence);
        return buf.freeze();
    }

    let mut buf = BytesMut::with_capacity(FULL_HEADER_LEN + OBJECT_REFERENCE_LEN + body.len());
    buf.put_u8(kind.tag());
    buf.put_i32(slot.epoch);
    buf.put_i32(slot.sequence);
    buf.put_i32(creation.epoch);
    buf.put_i32(creation.sequence);
    buf.put_i32(object_reference);
    buf.put_slice(body);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_tags_are_stable() {
        for tag in 0..=10u8 {
            let kind = PacketKind::from_tag(tag).unwrap();
            assert_eq!(kind.tag(), tag);
        }
        assert_eq!(PacketKind::from_tag(11), None);
        assert_eq!(PacketKind::Creation.tag(), 1);
        assert_eq!(PacketKind::SequenceRequest.tag(), 6);
    }

    #[test]
    fn test_modification_header_layout() {
        let packet = SequencedPacket::new(
            PacketKind::GeometryModification,
            SlotId::new(2, 7),
            SlotId::new(1, 3),
            0x0102_0304,
            Bytes::from_static(b"xy"),
        );
        let raw = packet.raw();
        assert_eq!(raw.len(), 23);
        assert_eq!(raw[0], 2);
        assert_eq!(&raw[1..5], &[0, 0, 0, 2]);
        assert_eq!(&raw[5..9], &[0, 0, 0, 7]);
        assert_eq!(&raw[9..13], &[0, 0, 0, 1]);
        assert_eq!(&raw[13..17], &[0, 0, 0, 3]);
        assert_eq!(&raw[17..21], &[1, 2, 3, 4]);
        assert_eq!(&raw[21..], b"xy");

        let decoded = SequencedPacket::decode(raw.clone()).unwrap();
        assert_eq!(decoded, packet);
        assert!(decoded.has_foreign_dependency());
    }

    #[test]
    fn test_creation_depends_on_itself() {
        let packet = SequencedPacket::new(
            PacketKind::Creation,
            SlotId::new(0, 4),
            SlotId::new(9, 9),
            77,
            Bytes::from_static(b"line"),
        );
        assert_eq!(packet.creation(), SlotId::new(0, 4));
        assert!(!packet.has_foreign_dependency());

        // A bare 9-byte creation header is accepted.
        let short = SequencedPacket::decode(Bytes::from_static(&[1, 0, 0, 0, 0, 0, 0, 0, 5]))
            .unwrap();
        assert_eq!(short.slot(), SlotId::new(0, 5));
        assert_eq!(short.creation(), short.slot());
        assert_eq!(short.object_reference(), NO_OBJECT);
        assert!(short.body().is_empty());
    }

    #[test]
    fn test_sequence_request_is_nine_bytes() {
        let request = SequencedPacket::sequence_request(SlotId::new(3, 12));
        assert_eq!(request.raw().len(), BASE_HEADER_LEN);
        let decoded = SequencedPacket::decode(request.raw().clone()).unwrap();
        assert_eq!(decoded.kind(), PacketKind::SequenceRequest);
        assert_eq!(decoded.slot(), SlotId::new(3, 12));
        assert_eq!(decoded.object_reference(), NO_OBJECT);
    }

    #[test]
    fn test_negative_fields_survive_big_endian() {
        let packet = SequencedPacket::new(
            PacketKind::Deletion,
            SlotId::new(0, 1),
            SlotId::new(0, 0),
            -5,
            Bytes::new(),
        );
        let decoded = SequencedPacket::decode(packet.raw().clone()).unwrap();
        assert_eq!(decoded.object_reference(), -5);
    }

    #[test]
    fn test_malformed_inputs_rejected() {
        assert_eq!(
            SequencedPacket::decode(Bytes::new()),
            Err(MalformedPacketError::Empty)
        );
        assert_eq!(
            SequencedPacket::decode(Bytes::from_static(&[99, 0, 0])),
            Err(MalformedPacketError::UnknownKind(99))
        );
        assert_eq!(
            SequencedPacket::decode(Bytes::from_static(&[6, 0, 0, 0, 1])),
            Err(MalformedPacketError::Truncated {
                kind: "sequence-request",
                len: 5,
                min: 9
            })
        );
        // Modifications need the creation fields.
        let err = SequencedPacket::decode(Bytes::from_static(&[2, 0, 0, 0, 0, 0, 0, 0, 1, 0]))
            .unwrap_err();
        assert!(matches!(err, MalformedPacketError::Truncated { min: 17, .. }));
    }

    #[test]
    fn test_into_local_marks_packet() {
        let packet = SequencedPacket::tombstone(SlotId::new(0, 0));
        assert!(!packet.originated_locally());
        assert!(packet.into_local().originated_locally());
    }
}
