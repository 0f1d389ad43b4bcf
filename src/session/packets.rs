//! Builders for the wire messages of the keep-alive handshake. All packets
//! open with the opcode byte 0x07 followed by a per-phase counter; the third
//! and fourth bytes are the packet length.
//!
//! Building is pure: same inputs always yield the same bytes.

use bytes::{BufMut, Bytes, BytesMut};

use crate::session::checksum::{keep_alive1_checksum, keep_alive2_checksum, ChecksumMode};

pub const KEEP_ALIVE1_PACKET2_LEN: usize = 96;
pub const KEEP_ALIVE2_PACKET_LEN: usize = 40;

/// Initial liveness probe.
pub fn keep_alive1_packet1(cnt: u8) -> Bytes {
    let mut buf = BytesMut::with_capacity(8);
    buf.put_slice(&[0x07, cnt, 0x08, 0x00, 0x01, 0x00, 0x00, 0x00]);
    buf.freeze()
}

/// Echoes the server's seed and its view of our address, carrying the
/// seed-derived checksum. The stage marker is 0x62 for the first two counter
/// values of a cycle, 0x63 afterwards.
pub fn keep_alive1_packet2(
    seed: &[u8; 4],
    server_ip: &[u8; 4],
    keep_alive1_flag: u8,
    cnt: u8,
    enable_crypt: bool,
) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEEP_ALIVE1_PACKET2_LEN);
    buf.put_slice(&[0x07, cnt, 0x60, 0x00, 0x03]);
    buf.put_u8(0x00); // uid length
    buf.put_bytes(0x00, 6); // mac placeholder
    buf.put_slice(server_ip);
    buf.put_u8(0x00);
    buf.put_u8(if cnt == 1 || cnt == 2 { 0x62 } else { 0x63 });
    buf.put_u8(0x00);
    buf.put_u8(keep_alive1_flag);
    buf.put_slice(seed);
    let mode = ChecksumMode::select(enable_crypt, seed);
    buf.put_slice(&keep_alive1_checksum(mode, seed));
    buf.put_bytes(0x00, 64);
    buf.freeze()
}

/// Opens the keep-alive-2 sub-negotiation; the key field is all zeroes on the
/// first round.
pub fn keep_alive2_packet1(cnt: u8, flag: &[u8; 2], nonce: &[u8; 2], key: &[u8; 4]) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEEP_ALIVE2_PACKET_LEN);
    buf.put_slice(&[0x07, cnt, 0x28, 0x00, 0x0b, 0x01]);
    buf.put_slice(flag);
    buf.put_slice(nonce);
    buf.put_bytes(0x00, 6);
    buf.put_slice(key);
    buf.put_bytes(0x00, 20);
    buf.freeze()
}

/// Closes the sub-negotiation. The word-XOR checksum is computed over the
/// assembled packet with its own field zeroed, then spliced in at offset 24.
pub fn keep_alive2_packet2(
    cnt: u8,
    flag: &[u8; 2],
    nonce: &[u8; 2],
    key: &[u8; 4],
    server_ip: &[u8; 4],
) -> Bytes {
    let mut buf = BytesMut::with_capacity(KEEP_ALIVE2_PACKET_LEN);
    buf.put_slice(&[0x07, cnt, 0x28, 0x00, 0x0b, 0x03]);
    buf.put_slice(flag);
    buf.put_slice(nonce);
    buf.put_bytes(0x00, 6);
    buf.put_slice(key);
    buf.put_bytes(0x00, 4);
    let checksum_offset = buf.len();
    buf.put_bytes(0x00, 4);
    buf.put_slice(server_ip);
    buf.put_bytes(0x00, 8);
    let checksum = keep_alive2_checksum(&buf);
    buf[checksum_offset..checksum_offset + 4].copy_from_slice(&checksum);
    buf.freeze()
}
