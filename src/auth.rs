//! MIFARE Classic authentication math and command framing.
//!
//! The card and reader run a three-pass mutual authentication per sector:
//!
//! 1. The card emits a 32-bit tag nonce `nT` in the clear.
//! 2. The reader initializes Crypto1 with the sector key and `uid ^ nT`,
//!    then answers with its own nonce and proof `{nR} {aR}` where
//!    `aR = prng_successor(nT, 64)`.
//! 3. The card proves itself back with `{aT}`, `aT = prng_successor(nT, 96)`.
//!
//! After the handshake both sides share a synchronized cipher state and all
//! further traffic is XORed against its keystream. Every command frame ends
//! with the ISO 14443-3A CRC-A over the preceding bytes.

use crate::cipher::{prng_successor, Crypto1State};

/// Which of the two per-sector keys an AUTH command addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyType {
    KeyA,
    KeyB,
}

impl KeyType {
    /// Wire opcode of the AUTH command for this key slot.
    pub fn code(self) -> u8 {
        match self {
            KeyType::KeyA => 0x60,
            KeyType::KeyB => 0x61,
        }
    }
}

/// Opcode of the 16-byte READ command.
const CMD_READ: u8 = 0x30;

/// Load the sector key and absorb `uid ^ nT`, yielding the session state
/// both sides hold after the card's challenge.
pub fn init_cipher(key: u64, uid: u32, tag_nonce: u32) -> Crypto1State {
    let mut state = Crypto1State::load_key(key);
    state.lfsr_word(uid ^ tag_nonce, false);
    state
}

/// Produce the reader's second-pass answer `({nR}, {aR})`.
///
/// The reader nonce is fed into the cipher as it is encrypted; the proof
/// word `aR = prng_successor(nT, 64)` is encrypted with the following
/// keystream word.
pub fn compute_reader_response(
    state: &mut Crypto1State,
    reader_nonce: u32,
    tag_nonce: u32,
) -> (u32, u32) {
    let encrypted_nr = reader_nonce ^ state.lfsr_word(reader_nonce, false);
    let ar = prng_successor(tag_nonce, 64);
    let encrypted_ar = ar ^ state.lfsr_word(0, false);
    (encrypted_nr, encrypted_ar)
}

/// Check the card's third-pass answer `{aT}` against
/// `prng_successor(nT, 96)`. Consumes one keystream word either way.
pub fn verify_card_response(
    state: &mut Crypto1State,
    encrypted_card_response: u32,
    tag_nonce: u32,
) -> bool {
    let at = encrypted_card_response ^ state.lfsr_word(0, false);
    at == prng_successor(tag_nonce, 96)
}

/// XOR a buffer against the per-byte keystream. Symmetric: applying it to
/// ciphertext with a synchronized state yields the plaintext.
pub fn encrypt_bytes(state: &mut Crypto1State, data: &[u8]) -> Vec<u8> {
    data.iter().map(|&b| b ^ state.lfsr_byte(0, false)).collect()
}

/// Alias of [`encrypt_bytes`] for the receiving direction.
pub fn decrypt_bytes(state: &mut Crypto1State, data: &[u8]) -> Vec<u8> {
    encrypt_bytes(state, data)
}

/// ISO 14443-3A CRC-A: poly x16+x12+x5+1, init 0x6363, little-endian out.
pub fn crc_a(data: &[u8]) -> [u8; 2] {
    let mut crc = 0x6363u32;
    for &byte in data {
        let mut b = u32::from(byte) ^ (crc & 0xFF);
        b = (b ^ (b << 4)) & 0xFF;
        crc = ((crc >> 8) ^ (b << 8) ^ (b << 3) ^ (b >> 4)) & 0xFFFF;
    }
    [(crc & 0xFF) as u8, (crc >> 8) as u8]
}

/// True when `frame` ends with a valid CRC-A over its preceding bytes.
pub fn check_crc_a(frame: &[u8]) -> bool {
    if frame.len() < 2 {
        return false;
    }
    let (payload, tail) = frame.split_at(frame.len() - 2);
    crc_a(payload) == [tail[0], tail[1]]
}

/// Frame an AUTH command: `[keyType, block, crcLo, crcHi]`.
pub fn build_auth_command(key_type: KeyType, block: u8) -> [u8; 4] {
    let crc = crc_a(&[key_type.code(), block]);
    [key_type.code(), block, crc[0], crc[1]]
}

/// Frame a READ command: `[0x30, block, crcLo, crcHi]`.
pub fn build_read_command(block: u8) -> [u8; 4] {
    let crc = crc_a(&[CMD_READ, block]);
    [CMD_READ, block, crc[0], crc[1]]
}

/// Pack a 48-bit key as its 6 wire bytes, big-endian.
pub fn key_to_bytes(key: u64) -> [u8; 6] {
    let b = key.to_be_bytes();
    [b[2], b[3], b[4], b[5], b[6], b[7]]
}

/// Read a 48-bit key from its 6 wire bytes.
pub fn key_from_bytes(bytes: &[u8; 6]) -> u64 {
    let mut b = [0u8; 8];
    b[2..].copy_from_slice(bytes);
    u64::from_be_bytes(b)
}
