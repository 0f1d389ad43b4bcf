use md4::Md4;
use md5::Md5;
use sha1::{Digest, Sha1};

/// Strategy for the 8-byte checksum in KeepAlive1-Packet2. The server selects
/// it through the low bits of the seed, but only when crypt is enabled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumMode {
    Constants,
    Md5,
    Md4,
    Sha1,
}

impl ChecksumMode {
    pub fn select(enable_crypt: bool, seed: &[u8; 4]) -> ChecksumMode {
        if !enable_crypt {
            return ChecksumMode::Constants;
        }
        match seed[0] & 0x03 {
            0 => ChecksumMode::Constants,
            1 => ChecksumMode::Md5,
            2 => ChecksumMode::Md4,
            _ => ChecksumMode::Sha1,
        }
    }
}

/// Each digest mode extracts eight bytes from fixed offsets of the digest of
/// the seed; the offsets differ per mode.
pub fn keep_alive1_checksum(mode: ChecksumMode, seed: &[u8]) -> [u8; 8] {
    match mode {
        ChecksumMode::Constants => {
            let mut result = [0u8; 8];
            result[..4].copy_from_slice(&20_000_711u32.to_be_bytes());
            result[4..].copy_from_slice(&126u32.to_be_bytes());
            result
        }
        ChecksumMode::Md5 => pick8(&Md5::digest(seed), [2, 3, 8, 9, 5, 6, 13, 14]),
        ChecksumMode::Md4 => pick8(&Md4::digest(seed), [1, 2, 8, 9, 4, 5, 11, 12]),
        ChecksumMode::Sha1 => pick8(&Sha1::digest(seed), [2, 3, 9, 10, 5, 6, 15, 16]),
    }
}

fn pick8(digest: &[u8], offsets: [usize; 8]) -> [u8; 8] {
    let mut result = [0u8; 8];
    for (r, offset) in result.iter_mut().zip(offsets) {
        *r = digest[offset];
    }
    result
}

/// Word-XOR checksum carried in KeepAlive2-Packet2, computed over the whole
/// packet with the checksum field itself zeroed.
///
/// The 16-bit word decode is fixed little-endian to match the deployed
/// servers; an odd trailing byte does not participate.
pub fn keep_alive2_checksum(packet: &[u8]) -> [u8; 4] {
    let mut acc: u32 = 0;
    for word in packet.chunks_exact(2) {
        acc ^= u16::from_le_bytes([word[0], word[1]]) as u32;
    }
    ((acc & 0xffff).wrapping_mul(0x2c7)).to_le_bytes()
}
