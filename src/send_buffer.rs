use std::collections::{BTreeMap, BTreeSet};
use std::ops::Bound::{Excluded, Unbounded};

use tokio::time::Instant;

use crate::packet::DataPacket;
use crate::packet_id::{PacketId, SequenceNumber};

/// A data packet that was sent but not yet acknowledged. The entry stays in
///  the send buffer until an ACK retires it, its message expires, or the
///  connection closes.
#[derive(Clone, Debug)]
pub struct SendPacketEntry {
    pub packet: DataPacket,
    pub send_time: Instant,
    /// `None` means the message never expires
    pub expire: Option<Instant>,
}

impl SendPacketEntry {
    pub fn packet_id(&self) -> PacketId {
        self.packet.packet_id
    }

    pub fn message_number(&self) -> SequenceNumber {
        self.packet.message_number
    }

    pub fn is_expired(&self, now: Instant) -> bool {
        match self.expire {
            Some(deadline) => now >= deadline,
            None => false,
        }
    }
}


/// The unacknowledged-packet table, ordered by PacketId.
///
/// Keys live in the modular window (acked frontier, last sent], which is far
///  narrower than half the id space, so windowed scans can chain two plain
///  BTree ranges around the numeric wrap point.
#[derive(Default)]
pub struct SendBuffer {
    entries: BTreeMap<PacketId, SendPacketEntry>,
}

impl SendBuffer {
    pub fn insert(&mut self, entry: SendPacketEntry) {
        self.entries.insert(entry.packet_id(), entry);
    }

    pub fn get(&self, packet_id: PacketId) -> Option<&SendPacketEntry> {
        self.entries.get(&packet_id)
    }

    pub fn remove(&mut self, packet_id: PacketId) -> Option<SendPacketEntry> {
        self.entries.remove(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = &SendPacketEntry> {
        self.entries.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = PacketId> + '_ {
        self.entries.keys().copied()
    }

    /// first key in the modular window (low, high], if any
    pub fn first_in_window(&self, low: PacketId, high: PacketId) -> Option<PacketId> {
        let candidate = self.entries.range((Excluded(low), Unbounded)).next()
            .or_else(|| self.entries.range(..low).next())
            .map(|(id, _)| *id)?;
        in_window(candidate, low, high).then_some(candidate)
    }
}


/// The loss set: ids the peer reported missing or that expiration recovery
///  scheduled for resend. Every member is expected to also be a key of the
///  send buffer, except transiently while one is being retired.
#[derive(Default)]
pub struct LossList {
    ids: BTreeSet<PacketId>,
}

impl LossList {
    pub fn insert(&mut self, packet_id: PacketId) {
        self.ids.insert(packet_id);
    }

    pub fn remove(&mut self, packet_id: PacketId) -> bool {
        self.ids.remove(&packet_id)
    }

    pub fn contains(&self, packet_id: PacketId) -> bool {
        self.ids.contains(&packet_id)
    }

    pub fn len(&self) -> usize {
        self.ids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ids.is_empty()
    }

    pub fn clear(&mut self) {
        self.ids.clear();
    }

    pub fn iter(&self) -> impl Iterator<Item = PacketId> + '_ {
        self.ids.iter().copied()
    }

    /// first id in the modular window (low, high], if any
    pub fn first_in_window(&self, low: PacketId, high: PacketId) -> Option<PacketId> {
        let candidate = self.ids.range((Excluded(low), Unbounded)).next()
            .or_else(|| self.ids.range(..low).next())
            .copied()?;
        in_window(candidate, low, high).then_some(candidate)
    }
}

fn in_window(candidate: PacketId, low: PacketId, high: PacketId) -> bool {
    candidate.blind_diff(low) > 0 && high.blind_diff(candidate) >= 0
}
