//! Per-epoch delivery state.

use std::collections::BTreeMap;

use crate::packet::{PacketKind, SequencedPacket};

/// Delivered sequence plus out-of-order arrivals for one epoch.
///
/// `delivered[i]` always holds sequence `i`, so the next expected sequence is
/// the delivered length.
#[derive(Debug)]
pub struct Epoch {
    number: i32,
    delivered: Vec<SequencedPacket>,
    pending: BTreeMap<i32, SequencedPacket>,
}

impl Epoch {
    pub fn new(number: i32) -> Self {
        Self {
            number,
            delivered: Vec::new(),
            pending: BTreeMap::new(),
        }
    }

    pub fn number(&self) -> i32 {
        self.number
    }

    pub fn next_expected(&self) -> i32 {
        self.delivered.len() as i32
    }

    pub fn last_delivered(&self) -> Option<i32> {
        self.next_expected().checked_sub(1).filter(|s| *s >= 0)
    }

    pub fn is_delivered(&self, sequence: i32) -> bool {
        sequence >= 0 && (sequence as usize) < self.delivered.len()
    }

    pub fn is_pending(&self, sequence: i32) -> bool {
        self.pending.contains_key(&sequence)
    }

    /// True when the slot is delivered or waiting in pending.
    pub fn holds(&self, sequence: i32) -> bool {
        self.is_delivered(sequence) || self.is_pending(sequence)
    }

    /// Look a sequence up in delivered first, then pending.
    pub fn get(&self, sequence: i32) -> Option<&SequencedPacket> {
        if self.is_delivered(sequence) {
            self.delivered.get(sequence as usize)
        } else {
            self.pending.get(&sequence)
        }
    }

    /// Buffer an arrival. A real packet replaces a pending tombstone for the
    /// same slot; anything else already held is rejected.
    pub fn insert_pending(&mut self, packet: SequencedPacket) -> bool {
        let sequence = packet.sequence();
        if self.is_delivered(sequence) {
            return false;
        }
        match self.pending.get(&sequence) {
            Some(held)
                if held.kind() == PacketKind::Tombstone
                    && packet.kind() != PacketKind::Tombstone =>
            {
                self.pending.insert(sequence, packet);
                true
            }
            Some(_) => false,
            None => {
                self.pending.insert(sequence, packet);
                true
            }
        }
    }

    /// The pending packet for the next expected sequence, if it has arrived.
    pub fn next_pending(&self) -> Option<&SequencedPacket> {
        self.pending.get(&self.next_expected())
    }

    /// Lowest buffered sequence.
    pub fn first_pending(&self) -> Option<i32> {
        self.pending.keys().next().copied()
    }

    /// Move the next expected packet from pending into delivered.
    pub fn deliver_next(&mut self) -> Option<&SequencedPacket> {
        let packet = self.pending.remove(&self.next_expected())?;
        self.delivered.push(packet);
        self.delivered.last()
    }

    pub fn delivered(&self) -> &[SequencedPacket] {
        &self.delivered
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    /// Delivered packets in sequence order followed by pending ones.
    pub fn history(&self) -> impl Iterator<Item = &SequencedPacket> {
        self.delivered.iter().chain(self.pending.values())
    }
}
