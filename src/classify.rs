//! Lightweight inspection of raw DTLS datagrams.
//!
//! The piggyback layer never decrypts or defragments records. It only needs
//! to answer three questions about an opaque byte blob: is it a DTLS record
//! at all, is it handshake material, and which handshake message sequences
//! does it carry. Everything here is a pure function over a byte slice.

use crc::{Crc, CRC_32_ISO_HDLC};
use nom::bytes::complete::take;
use nom::error::{make_error, ErrorKind};
use nom::number::complete::{be_u16, be_u24, be_u8};
use nom::{Err, IResult};

/// content_type(1) + version(2) + epoch(2) + sequence(6) + length(2)
pub const DTLS_RECORD_HEADER_LEN: usize = 13;

// RFC 5246 appendix A.1 content types.
const CONTENT_TYPE_CHANGE_CIPHER_SPEC: u8 = 20;
const CONTENT_TYPE_HANDSHAKE: u8 = 22;

// Handshake message types.
const MSG_TYPE_CLIENT_HELLO: u8 = 1;

// DTLS 1.3 unified header bits, RFC 9147 section 4.
const FIXED_BITMASK: u8 = 0b0010_0000;
const CONNECTION_BITMASK: u8 = 0b0001_0000;
const SEQUENCE_NUMBER_BITMASK: u8 = 0b0000_1000;
const LENGTH_PRESENT_BITMASK: u8 = 0b0000_0100;

/// True if the payload looks like a DTLS record: at least a record header
/// and a first byte in the DTLS content type range (20..64), which is
/// disjoint from STUN (0..4) and RTP/RTCP (128..192) first bytes.
pub fn is_dtls_packet(payload: &[u8]) -> bool {
    payload.len() >= DTLS_RECORD_HEADER_LEN && payload[0] > 19 && payload[0] < 64
}

/// True if the payload starts with a ClientHello handshake record.
pub fn is_dtls_client_hello_packet(payload: &[u8]) -> bool {
    is_dtls_packet(payload)
        && payload.len() > 17
        && payload[0] == CONTENT_TYPE_HANDSHAKE
        && payload[13] == MSG_TYPE_CLIENT_HELLO
}

/// True if the payload starts with a handshake record.
///
/// change_cipher_spec counts as handshake material: it is followed in the
/// same flight by the encrypted Finished which starts with a handshake
/// record (22) again.
pub fn is_dtls_handshake_packet(payload: &[u8]) -> bool {
    is_dtls_packet(payload)
        && payload.len() > 17
        && (payload[0] == CONTENT_TYPE_HANDSHAKE || payload[0] == CONTENT_TYPE_CHANGE_CIPHER_SPEC)
}

const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

/// CRC-32 over the whole packet, the on-wire identifier for acknowledgments.
///
/// Both peers compute this independently over the same bytes. It must be
/// stable across processes, so no seeded/randomized hasher. A checksum is
/// enough: a collision only delays a retransmission.
pub fn compute_dtls_packet_hash(packet: &[u8]) -> u32 {
    CRC32.checksum(packet)
}

/// Extract the handshake `message_seq` values from a raw datagram.
///
/// Walks the concatenated records. DTLS 1.3 unified-header ciphertext
/// records (RFC 9147 section 4.1) and epoch > 0 records are skipped since
/// they cannot be read without keys. Returns `None` if the datagram does not
/// parse as a sequence of records.
pub fn dtls_handshake_acks(packet: &[u8]) -> Option<Vec<u16>> {
    match handshake_acks(packet) {
        Ok((rest, acks)) if rest.is_empty() => Some(acks),
        _ => None,
    }
}

fn handshake_acks(packet: &[u8]) -> IResult<&[u8], Vec<u16>> {
    let mut acks = Vec::new();
    let mut input = packet;

    while input.len() >= DTLS_RECORD_HEADER_LEN {
        let (rest, first) = be_u8(input)?;

        if first & FIXED_BITMASK == FIXED_BITMASK {
            // DTLSCiphertext. Encrypted, so only skip over it.
            let (rest, ()) = skip_unified_header(first, rest)?;
            input = rest;
            continue;
        }

        // DTLSPlaintext: version(2) + epoch(2) + sequence(6) + length(2).
        let (rest, _version) = be_u16(rest)?;
        let (rest, epoch) = be_u16(rest)?;
        let (rest, _sequence) = be_u48(rest)?;
        let (rest, length) = be_u16(rest)?;
        let (rest, fragment) = take(length as usize)(rest)?;
        input = rest;

        // Epoch 1+ is encrypted, and non-handshake records carry no
        // message_seq.
        if first != CONTENT_TYPE_HANDSHAKE || epoch != 0 {
            continue;
        }

        // Handshake fragments, RFC 6347 section 4.2.2.
        let mut frag = fragment;
        while !frag.is_empty() {
            let (r, _msg_type) = be_u8(frag)?;
            let (r, _length) = be_u24(r)?;
            let (r, message_seq) = be_u16(r)?;
            let (r, _fragment_offset) = be_u24(r)?;
            let (r, fragment_length) = be_u24(r)?;
            let (r, _body) = take(fragment_length as usize)(r)?;
            acks.push(message_seq);
            frag = r;
        }
    }

    Ok((input, acks))
}

/// Skip a DTLS 1.3 unified-header record given its already-read first byte.
fn skip_unified_header(first: u8, input: &[u8]) -> IResult<&[u8], ()> {
    // Connection ids are not negotiated on this transport, so C must be 0.
    if first & CONNECTION_BITMASK != 0 {
        return Err(Err::Error(make_error(input, ErrorKind::Verify)));
    }

    // sequence_number is 1 or 2 bytes depending on the S bit.
    let seq_len = if first & SEQUENCE_NUMBER_BITMASK != 0 {
        2usize
    } else {
        1usize
    };
    let (input, _) = take(seq_len)(input)?;

    if first & LENGTH_PRESENT_BITMASK != 0 {
        let (input, length) = be_u16(input)?;
        let (input, _) = take(length as usize)(input)?;
        Ok((input, ()))
    } else {
        // No length field: the record extends to the end of the datagram.
        Ok((&input[input.len()..], ()))
    }
}

fn be_u48(input: &[u8]) -> IResult<&[u8], u64> {
    let (input, bytes) = take(6usize)(input)?;
    let mut v = 0u64;
    for b in bytes {
        v = (v << 8) | *b as u64;
    }
    Ok((input, v))
}
