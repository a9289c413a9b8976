//! Holding area for outgoing handshake packets awaiting acknowledgment.
//!
//! Packets are only removed once the peer acknowledges their hash, so the
//! same packet can be re-offered on later STUN messages if an earlier
//! carrier was lost. Retrieval is round-robin rather than pop-front: with
//! several records in flight, consecutive STUN transmissions cycle through
//! all of them instead of repeating the first.

use std::collections::HashSet;

use crate::classify::compute_dtls_packet_hash;

#[derive(Debug)]
struct Entry {
    hash: u32,
    packet: Vec<u8>,
}

#[derive(Debug, Default)]
pub struct PacketStash {
    packets: Vec<Entry>,
    /// Round-robin cursor, `< packets.len()` whenever non-empty.
    pos: usize,
}

impl PacketStash {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append unconditionally. Used when capturing the local engine's own
    /// write burst, where duplicates are rare but tolerated.
    pub fn add(&mut self, packet: &[u8]) {
        self.packets.push(Entry {
            hash: compute_dtls_packet_hash(packet),
            packet: packet.to_vec(),
        });
    }

    /// Append only if no stashed packet has the same hash. Returns whether
    /// the packet was added.
    pub fn add_if_unique(&mut self, packet: &[u8]) -> bool {
        let hash = compute_dtls_packet_hash(packet);
        if self.packets.iter().any(|e| e.hash == hash) {
            return false;
        }
        self.packets.push(Entry {
            hash,
            packet: packet.to_vec(),
        });
        true
    }

    /// Remove every packet whose hash the peer acknowledged. The cursor is
    /// moved back by the number of removals before it, so iteration
    /// continues at the same unacknowledged packet.
    pub fn prune_acked(&mut self, acked: &HashSet<u32>) {
        if acked.is_empty() {
            return;
        }
        let removed_before = self.packets[..self.pos]
            .iter()
            .filter(|e| acked.contains(&e.hash))
            .count();
        self.packets.retain(|e| !acked.contains(&e.hash));
        self.pos -= removed_before;
        if self.pos >= self.packets.len() {
            self.pos = 0;
        }
    }

    /// Drop the oldest packets until at most `max_size` remain.
    pub fn prune_to(&mut self, max_size: usize) {
        if self.packets.len() <= max_size {
            return;
        }
        let removed = self.packets.len() - max_size;
        self.packets.drain(..removed);
        if self.pos <= removed {
            self.pos = 0;
        } else {
            self.pos -= removed;
        }
    }

    /// Round-robin retrieval of the next packet.
    ///
    /// Panics if the stash is empty.
    pub fn next(&mut self) -> &[u8] {
        assert!(!self.packets.is_empty());
        let pos = self.pos;
        self.pos = (pos + 1) % self.packets.len();
        &self.packets[pos].packet
    }

    pub fn clear(&mut self) {
        self.packets.clear();
        self.pos = 0;
    }

    pub fn is_empty(&self) -> bool {
        self.packets.is_empty()
    }

    pub fn len(&self) -> usize {
        self.packets.len()
    }
}
