//! In-memory MIFARE Classic card.
//!
//! Implements the card side of the protocol behind the [`CardTransport`]
//! trait: nonce generation from the weak PRNG, reader-proof verification,
//! nested authentication with the target sector's fresh cipher, and
//! encrypted block reads. Used as the demo backend when no reader hardware
//! is attached and as the end-to-end test double.
//!
//! The card answers malformed, unexpected, or wrongly keyed frames with
//! silence, like a real tag.

use std::collections::HashMap;

use crate::auth::{self, KeyType};
use crate::cipher::{prng_successor, Crypto1State};
use crate::transport::{CardTransport, TransportError};

/// The two keys guarding one sector.
#[derive(Debug, Clone, Copy)]
struct SectorKeys {
    key_a: u64,
    key_b: u64,
}

#[derive(Debug, Clone, Copy)]
enum Session {
    /// Awaiting a plaintext AUTH.
    Idle,
    /// Challenge sent for `sector`, awaiting the reader's `{nR} {aR}`.
    AwaitingResponse {
        state: Crypto1State,
        nt: u32,
        sector: u8,
    },
    /// Mutual authentication done for `sector`; traffic is encrypted.
    Active { state: Crypto1State, sector: u8 },
}

/// A simulated 1K-layout card (4 blocks per sector).
///
/// Sectors must be configured with keys before they answer AUTH; block data
/// defaults to zeros. The tag PRNG starts from `seed` and advances a fixed
/// number of steps per issued nonce, so PRNG calibration against the
/// simulation converges on `step`.
pub struct SimulatedCard {
    uid: u32,
    sectors: HashMap<u8, SectorKeys>,
    blocks: HashMap<u8, [u8; 16]>,
    prng_state: u32,
    prng_step: u32,
    session: Session,
}

impl SimulatedCard {
    pub fn new(uid: u32) -> Self {
        Self {
            uid,
            sectors: HashMap::new(),
            blocks: HashMap::new(),
            prng_state: 0x01200145,
            prng_step: 64,
            session: Session::Idle,
        }
    }

    /// Override the tag PRNG seed and per-nonce advance. The seed must not
    /// be zero (zero is a PRNG fixed point and would repeat forever).
    pub fn with_prng(mut self, seed: u32, step: u32) -> Self {
        self.prng_state = seed;
        self.prng_step = step;
        self
    }

    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Install both keys for one sector.
    pub fn set_sector_keys(&mut self, sector: u8, key_a: u64, key_b: u64) {
        self.sectors.insert(sector, SectorKeys { key_a, key_b });
    }

    /// Store block contents (16 bytes).
    pub fn write_block(&mut self, block: u8, data: [u8; 16]) {
        self.blocks.insert(block, data);
    }

    fn sector_of(block: u8) -> u8 {
        block >> 2
    }

    fn key_for(&self, block: u8, key_type: KeyType) -> Option<u64> {
        let keys = self.sectors.get(&Self::sector_of(block))?;
        Some(match key_type {
            KeyType::KeyA => keys.key_a,
            KeyType::KeyB => keys.key_b,
        })
    }

    fn next_nonce(&mut self) -> u32 {
        self.prng_state = prng_successor(self.prng_state, self.prng_step);
        self.prng_state
    }

    /// Parse a framed AUTH command, returning the addressed key slot and
    /// block when the frame is well formed.
    fn parse_auth(frame: &[u8]) -> Option<(KeyType, u8)> {
        if frame.len() != 4 || !auth::check_crc_a(frame) {
            return None;
        }
        let key_type = match frame[0] {
            0x60 => KeyType::KeyA,
            0x61 => KeyType::KeyB,
            _ => return None,
        };
        Some((key_type, frame[1]))
    }

    fn parse_read(frame: &[u8]) -> Option<u8> {
        if frame.len() != 4 || frame[0] != 0x30 || !auth::check_crc_a(frame) {
            return None;
        }
        Some(frame[1])
    }

    /// Start a handshake: issue a nonce and init the sector cipher.
    fn begin_auth(&mut self, key_type: KeyType, block: u8) -> Result<Vec<u8>, TransportError> {
        let Some(key) = self.key_for(block, key_type) else {
            return Err(TransportError::NoResponse);
        };
        let nt = self.next_nonce();
        let state = auth::init_cipher(key, self.uid, nt);
        self.session = Session::AwaitingResponse {
            state,
            nt,
            sector: Self::sector_of(block),
        };
        Ok(nt.to_be_bytes().to_vec())
    }

    /// Check the reader's `{nR} {aR}` and answer `{aT}` on success.
    fn finish_auth(
        &mut self,
        mut state: Crypto1State,
        nt: u32,
        sector: u8,
        frame: &[u8],
    ) -> Result<Vec<u8>, TransportError> {
        if frame.len() != 8 {
            return Err(TransportError::NoResponse);
        }
        let encrypted_nr = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
        let encrypted_ar = u32::from_be_bytes([frame[4], frame[5], frame[6], frame[7]]);

        // Clocking the ciphertext nonce in encrypted-feedback mode keeps the
        // card synchronized with the reader's plain-mode stepping.
        state.lfsr_word(encrypted_nr, true);
        let ar = encrypted_ar ^ state.lfsr_word(0, false);
        if ar != prng_successor(nt, 64) {
            return Err(TransportError::NoResponse);
        }

        let encrypted_at = prng_successor(nt, 96) ^ state.lfsr_word(0, false);
        self.session = Session::Active { state, sector };
        Ok(encrypted_at.to_be_bytes().to_vec())
    }
}

impl CardTransport for SimulatedCard {
    fn transceive(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
        let session = self.session;
        // Pessimistically drop to idle; successful paths set the new session.
        self.session = Session::Idle;

        match session {
            Session::Idle => {
                let Some((key_type, block)) = Self::parse_auth(data) else {
                    return Err(TransportError::NoResponse);
                };
                self.begin_auth(key_type, block)
            }
            Session::AwaitingResponse { state, nt, sector } => {
                self.finish_auth(state, nt, sector, data)
            }
            Session::Active { mut state, sector } => {
                let plain = auth::decrypt_bytes(&mut state, data);
                if let Some((key_type, block)) = Self::parse_auth(&plain) {
                    // Nested authentication: a fresh cipher on the target
                    // sector encrypts the new nonce.
                    let Some(key) = self.key_for(block, key_type) else {
                        return Err(TransportError::NoResponse);
                    };
                    let nt2 = self.next_nonce();
                    let mut fresh = Crypto1State::load_key(key);
                    let ks = fresh.lfsr_word(self.uid ^ nt2, false);
                    self.session = Session::AwaitingResponse {
                        state: fresh,
                        nt: nt2,
                        sector: Self::sector_of(block),
                    };
                    return Ok((nt2 ^ ks).to_be_bytes().to_vec());
                }
                if let Some(block) = Self::parse_read(&plain) {
                    if Self::sector_of(block) != sector {
                        return Err(TransportError::NoResponse);
                    }
                    let data = self.blocks.get(&block).copied().unwrap_or([0u8; 16]);
                    let crc = auth::crc_a(&data);
                    let mut reply = data.to_vec();
                    reply.extend_from_slice(&crc);
                    let encrypted = auth::encrypt_bytes(&mut state, &reply);
                    self.session = Session::Active { state, sector };
                    return Ok(encrypted);
                }
                Err(TransportError::NoResponse)
            }
        }
    }

    fn reconnect(&mut self) -> Result<(), TransportError> {
        self.session = Session::Idle;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::driver::{AuthError, AuthPhase, ClassicDriver};
    use crate::recovery::{lfsr_recovery32, nonce_distance};

    const UID: u32 = 0xCDB46EFB;
    const KNOWN_KEY: u64 = 0xA0A1A2A3A4A5;
    const TARGET_KEY: u64 = 0xB587C9A1DD01;

    fn card() -> SimulatedCard {
        let mut card = SimulatedCard::new(UID);
        card.set_sector_keys(0, KNOWN_KEY, 0xFFFFFFFFFFFF);
        card.set_sector_keys(2, TARGET_KEY, 0xFFFFFFFFFFFF);
        card
    }

    #[test]
    fn test_authenticate_against_simulated_card() {
        let mut driver = ClassicDriver::new(card(), UID);
        driver.authenticate(KeyType::KeyA, 0, KNOWN_KEY).unwrap();
        assert_eq!(driver.phase(), AuthPhase::Authenticated);
    }

    #[test]
    fn test_wrong_key_gets_silence() {
        let mut driver = ClassicDriver::new(card(), UID);
        let err = driver.authenticate(KeyType::KeyA, 0, 0x0123456789AB).unwrap_err();
        assert!(matches!(
            err,
            AuthError::Transport(TransportError::NoResponse)
        ));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_unconfigured_sector_gets_silence() {
        let mut driver = ClassicDriver::new(card(), UID);
        let err = driver.request_auth(KeyType::KeyA, 0x10).unwrap_err();
        assert!(matches!(
            err,
            AuthError::Transport(TransportError::NoResponse)
        ));
    }

    #[test]
    fn test_read_block_round_trip() {
        let mut card = card();
        let payload = *b"transit pass #42";
        card.write_block(1, payload);

        let mut driver = ClassicDriver::new(card, UID);
        let mut state = driver.authenticate(KeyType::KeyA, 0, KNOWN_KEY).unwrap();
        assert_eq!(driver.read_block(&mut state, 1).unwrap(), payload);

        // Unwritten block in the same sector reads as zeros.
        assert_eq!(driver.read_block(&mut state, 3).unwrap(), [0u8; 16]);
    }

    #[test]
    fn test_read_outside_authenticated_sector_gets_silence() {
        let mut driver = ClassicDriver::new(card(), UID);
        let mut state = driver.authenticate(KeyType::KeyA, 0, KNOWN_KEY).unwrap();
        let err = driver.read_block(&mut state, 0x08).unwrap_err();
        assert!(matches!(
            err,
            AuthError::Transport(TransportError::NoResponse)
        ));
    }

    #[test]
    fn test_tag_prng_advances_a_fixed_step_per_nonce() {
        let mut card = SimulatedCard::new(UID).with_prng(0x0094A2D5, 160);
        card.set_sector_keys(0, KNOWN_KEY, KNOWN_KEY);
        let mut driver = ClassicDriver::new(card, UID);

        let n1 = driver.request_auth(KeyType::KeyA, 0).unwrap();
        driver.reconnect().unwrap();
        let n2 = driver.request_auth(KeyType::KeyA, 0).unwrap();
        assert_eq!(nonce_distance(n1, n2), 160);
    }

    #[test]
    fn test_nested_nonce_satisfies_attack_equation() {
        let mut driver = ClassicDriver::new(card(), UID);
        let mut state = driver.authenticate(KeyType::KeyA, 0, KNOWN_KEY).unwrap();
        let encrypted_nt = driver.nested_auth(&mut state, KeyType::KeyA, 8).unwrap();

        // Third nonce out of the card: one for the first handshake, one for
        // the nested one. Reconstruct it from the card's PRNG parameters.
        let nt2 = prng_successor(0x01200145, 2 * 64);

        let mut fresh = Crypto1State::load_key(TARGET_KEY);
        let ks = fresh.lfsr_word(UID ^ nt2, false);
        assert_eq!(encrypted_nt, nt2 ^ ks);
    }

    #[test]
    fn test_recovery_cracks_simulated_nested_nonce() {
        let mut driver = ClassicDriver::new(card(), UID);
        let mut state = driver.authenticate(KeyType::KeyA, 0, KNOWN_KEY).unwrap();
        let encrypted_nt = driver.nested_auth(&mut state, KeyType::KeyA, 8).unwrap();

        // With the plaintext nonce known (white box), the captured nonce
        // must break to the target key. Black-box runs get the plaintext
        // from PRNG distance prediction instead.
        let nt2 = prng_successor(0x01200145, 2 * 64);
        let keys: Vec<u64> = lfsr_recovery32(encrypted_nt ^ nt2, UID ^ nt2)
            .into_iter()
            .map(|mut c| {
                c.lfsr_rollback_word(UID ^ nt2, false);
                c.get_key()
            })
            .collect();
        assert!(keys.contains(&TARGET_KEY));
    }
}
