//! Piggybacking DTLS handshake flights on STUN connectivity checks.
//!
//! During ICE, every candidate pair is probed with STUN binding requests and
//! responses. Instead of waiting for the pair to become writable and then
//! running the DTLS handshake on top, the handshake records ride along as
//! STUN attributes, shaving round trips off call setup. Each peer runs one
//! [`PiggybackController`]: the local DTLS engine's outgoing flights are
//! captured into a [`PacketStash`], the ICE layer attaches the next
//! unacknowledged packet plus an acknowledgment attribute to each outgoing
//! STUN message, and incoming attributes are deduplicated for ack purposes
//! and forwarded to the engine.
//!
//! Retransmission is entirely the ICE layer's doing: it keeps sending STUN
//! messages, and this controller keeps offering whatever the peer has not
//! acknowledged yet.

use std::collections::HashSet;

use log::{debug, info, warn};
use tinyvec::ArrayVec;

use crate::classify::{compute_dtls_packet_hash, is_dtls_packet};
use crate::stash::PacketStash;

/// Maximum serialized length of the ack attribute in bytes.
pub const MAX_ACK_SIZE: usize = 16;

const MAX_ACK_HASHES: usize = MAX_ACK_SIZE / 4;

/// The STUN message kinds a piggyback attribute can ride on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StunMessageType {
    BindingRequest,
    BindingResponse,
    BindingIndication,
}

/// Progress of the piggybacked handshake with the remote peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PiggybackState {
    /// We attach piggyback attributes but have no evidence yet that the
    /// peer understands them. Initial state.
    Tentative,
    /// The peer sent piggyback data or acks of its own.
    Confirmed,
    /// The local DTLS handshake finished. We keep acking (and possibly
    /// retransmitting the last flight) until the peer is done too.
    Pending,
    /// Handshake done on both sides. Terminal.
    Complete,
    /// The peer does not support piggybacking, or DTLS failed. The
    /// handshake falls back to plain DTLS datagrams. Terminal.
    Off,
}

/// Per-transport coordinator for the DTLS-in-STUN piggyback exchange.
///
/// Single-threaded: every method must be called from the owning network
/// context. The data callback runs synchronously inside
/// [`report_data_piggybacked`](Self::report_data_piggybacked) and must not
/// re-enter the controller.
pub struct PiggybackController {
    state: PiggybackState,

    /// Outgoing handshake packets not yet acknowledged by the peer.
    pending_packets: PacketStash,

    /// The DTLS engine writes a flight as a burst of single-packet capture
    /// calls. Set on the first capture of a burst, cleared by `flush`.
    writing_packets: bool,

    /// Hashes of distinct packets received so far, in receipt order,
    /// bounded to the last `MAX_ACK_HASHES`.
    received_hashes: ArrayVec<[u32; MAX_ACK_HASHES]>,

    /// Wire form of `received_hashes`: concatenated big-endian u32 hashes.
    ack: Vec<u8>,

    /// Accepted (DTLS-classified) data attributes, duplicates included.
    data_recv_count: u32,

    /// Sink for received handshake bytes, feeding the local DTLS engine.
    dtls_data_callback: Box<dyn FnMut(&[u8])>,
}

impl PiggybackController {
    pub fn new(dtls_data_callback: impl FnMut(&[u8]) + 'static) -> Self {
        PiggybackController {
            state: PiggybackState::Tentative,
            pending_packets: PacketStash::new(),
            writing_packets: false,
            received_hashes: ArrayVec::new(),
            ack: Vec::with_capacity(MAX_ACK_SIZE),
            data_recv_count: 0,
            dtls_data_callback: Box::new(dtls_data_callback),
        }
    }

    pub fn state(&self) -> PiggybackState {
        self.state
    }

    /// Number of accepted data attributes, duplicates included. Diagnostic.
    pub fn count_of_received_data(&self) -> u32 {
        self.data_recv_count
    }

    /// Capture an outgoing handshake packet the DTLS engine is about to
    /// send. Non-DTLS bytes are ignored. The first capture after a
    /// [`flush`](Self::flush) replaces the previous flight.
    pub fn capture_packet(&mut self, data: &[u8]) {
        if !is_dtls_packet(data) {
            return;
        }

        if !self.writing_packets {
            self.pending_packets.clear();
            self.writing_packets = true;
        }

        self.pending_packets.add(data);
    }

    /// Mark the end of a capture burst. Must be called once the engine has
    /// written a complete flight.
    pub fn flush(&mut self) {
        self.writing_packets = false;
    }

    /// Drop all stashed packets, as if the engine had nothing to send.
    /// Test hook.
    pub fn clear_cached_packets(&mut self) {
        self.pending_packets.clear();
    }

    /// The next unacknowledged handshake packet to attach to an outgoing
    /// STUN message of the given type, or `None` if there is nothing (left)
    /// to send. Consecutive calls cycle through all pending packets.
    ///
    /// Must not be called in the middle of a capture burst.
    pub fn data_to_piggyback(&mut self, stun_message_type: StunMessageType) -> Option<&[u8]> {
        debug_assert!(!self.writing_packets);

        if self.state == PiggybackState::Complete {
            return None;
        }

        // Binding indications still carry data in Off: the legacy periodic
        // retransmit path rides on them until DTLS connects.
        if self.state == PiggybackState::Off
            && stun_message_type != StunMessageType::BindingIndication
        {
            return None;
        }

        if self.pending_packets.is_empty() {
            return None;
        }

        Some(self.pending_packets.next())
    }

    /// The serialized ack attribute to attach, or `None` if piggybacking is
    /// over. An empty slice is valid and means "participating, nothing
    /// received yet".
    pub fn ack_to_piggyback(&self, _stun_message_type: StunMessageType) -> Option<&[u8]> {
        if matches!(self.state, PiggybackState::Off | PiggybackState::Complete) {
            return None;
        }
        Some(&self.ack)
    }

    /// Handle the piggyback attributes of one incoming STUN message. Either
    /// attribute may be absent independently.
    pub fn report_data_piggybacked(&mut self, data: Option<&[u8]>, ack: Option<&[u8]>) {
        // Drop silently when the peer previously did not support the
        // mechanism or we already moved to Complete.
        if matches!(self.state, PiggybackState::Off | PiggybackState::Complete) {
            return;
        }

        // We sent piggybacked data but got nothing back: the peer does not
        // support the mechanism.
        if self.state == PiggybackState::Tentative && data.is_none() && ack.is_none() {
            info!("DTLS-STUN piggybacking not supported by peer");
            self.state = PiggybackState::Off;
            return;
        }

        // In Pending the peer may have stopped sending attributes once it
        // reached Complete. Follow it there.
        if self.state == PiggybackState::Pending && data.is_none() && ack.is_none() {
            info!("DTLS-STUN piggybacking complete");
            self.set_complete();
            return;
        }

        // Piggybacked attributes came back: the peer does support this.
        if self.state == PiggybackState::Tentative {
            self.state = PiggybackState::Confirmed;
        }

        if let Some(ack) = ack {
            if !self.pending_packets.is_empty() {
                let acked: HashSet<u32> = ack
                    .chunks_exact(4)
                    .map(|c| u32::from_be_bytes([c[0], c[1], c[2], c[3]]))
                    .collect();
                debug!("DTLS-STUN piggybacking ACK: {acked:?}");
                self.pending_packets.prune_acked(&acked);
            }
        }

        // The response to the final flight of the handshake carries an ack
        // but no data. Must not trigger on the initial server-to-client
        // message, which has no DTLS data yet either (state is not Pending
        // there).
        if data.is_none() && ack.is_some() && self.state == PiggybackState::Pending {
            info!("DTLS-STUN piggybacking complete");
            self.set_complete();
            return;
        }

        let Some(data) = data else {
            return;
        };
        if data.is_empty() {
            return;
        }

        if !is_dtls_packet(data) {
            warn!("Dropping non-DTLS piggyback data");
            return;
        }
        self.data_recv_count += 1;

        // Record the hash for the ack attribute, evicting the oldest hash
        // when the attribute would exceed MAX_ACK_SIZE on the wire.
        let hash = compute_dtls_packet_hash(data);
        if !self.received_hashes.contains(&hash) {
            if self.received_hashes.len() == MAX_ACK_HASHES {
                self.received_hashes.remove(0);
            }
            self.received_hashes.push(hash);
            self.rebuild_ack();
        }

        // Duplicates are delivered too: the DTLS record layer discards them
        // by sequence number, and suppressing here would hide retransmits
        // from the engine's timers.
        (self.dtls_data_callback)(data);
    }

    /// Signal from the DTLS engine that the local handshake finished.
    ///
    /// Which side clears its stash depends on who sends the final flight:
    /// a DTLS 1.2 server keeps its last flight for retransmission until the
    /// post-handshake acknowledgment arrives, while a DTLS 1.2 client has
    /// nothing more to send and only keeps acking. DTLS 1.3 reverses the
    /// roles, its handshake being one round trip shorter.
    pub fn set_dtls_handshake_complete(&mut self, is_dtls_client: bool, is_dtls13: bool) {
        if (is_dtls_client && !is_dtls13) || (!is_dtls_client && is_dtls13) {
            self.pending_packets.clear();
        }

        if matches!(self.state, PiggybackState::Off | PiggybackState::Complete) {
            return;
        }
        self.state = PiggybackState::Pending;
    }

    /// Signal from the DTLS engine that the handshake failed. Forces the
    /// fallback state unless the exchange already finished.
    pub fn set_dtls_failed(&mut self) {
        match self.state {
            PiggybackState::Tentative | PiggybackState::Confirmed | PiggybackState::Pending => {
                info!("DTLS-STUN piggybacking failed during negotiation");
                self.state = PiggybackState::Off;
            }
            PiggybackState::Off | PiggybackState::Complete => {}
        }
    }

    fn set_complete(&mut self) {
        self.state = PiggybackState::Complete;
        self.pending_packets.clear();
        self.ack.clear();
        self.received_hashes.clear();
    }

    fn rebuild_ack(&mut self) {
        self.ack.clear();
        for hash in self.received_hashes.iter() {
            self.ack.extend_from_slice(&hash.to_be_bytes());
        }
    }
}
