#![forbid(unsafe_code)]
#![warn(clippy::all)]

//! DTLS handshakes piggybacked on STUN connectivity checks.
//!
//! Sans-IO building block for ICE transports: captures the DTLS engine's
//! outgoing handshake flights, hands them to the ICE layer for attachment
//! to STUN binding requests/responses, and feeds received piggybacked
//! records back to the engine. The connection becomes DTLS-secured before
//! the candidate pair is even writable.
//!
//! The crate does no socket IO, owns no timers and encodes no STUN: the
//! ICE layer drives it by calling [`PiggybackController::data_to_piggyback`]
//! and [`PiggybackController::ack_to_piggyback`] when building a STUN
//! message, and [`PiggybackController::report_data_piggybacked`] with the
//! attributes of a received one.

mod classify;
mod controller;
mod stash;

pub use classify::{
    compute_dtls_packet_hash, dtls_handshake_acks, is_dtls_client_hello_packet,
    is_dtls_handshake_packet, is_dtls_packet, DTLS_RECORD_HEADER_LEN,
};
pub use controller::{PiggybackController, PiggybackState, StunMessageType, MAX_ACK_SIZE};
pub use stash::PacketStash;
