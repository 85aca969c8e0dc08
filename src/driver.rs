//! Authenticated card session driver.
//!
//! Runs the three-pass handshake and the encrypted command flows over a
//! [`CardTransport`], tracking where the handshake stands. The driver keeps
//! no retry policy: any transport failure or bad proof parks the session in
//! [`AuthPhase::Failed`] and the caller decides what happens next.

use thiserror::Error;

use crate::auth::{self, KeyType};
use crate::cipher::Crypto1State;
use crate::transport::{CardTransport, TransportError};

/// Reader nonce used for every handshake.
pub const READER_NONCE: u32 = 0x01020304;

/// Handshake progress for the current card session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthPhase {
    /// No handshake in flight.
    Idle,
    /// Tag nonce received.
    Challenged,
    /// Reader response sent, waiting on the card's proof.
    Responded,
    /// Mutual authentication complete, session keystream live.
    Authenticated,
    /// Handshake aborted; a new attempt starts from `Idle`.
    Failed,
}

/// Driver-level failures.
#[derive(Debug, Error)]
pub enum AuthError {
    #[error(transparent)]
    Transport(#[from] TransportError),
    #[error("short response: expected {expected} bytes, got {actual}")]
    ShortResponse { expected: usize, actual: usize },
    #[error("response failed the crc check")]
    BadCrc,
    #[error("card rejected the authentication proof")]
    CardRejected,
}

/// MIFARE Classic command driver over one selected card.
pub struct ClassicDriver<T: CardTransport> {
    transport: T,
    uid: u32,
    phase: AuthPhase,
}

impl<T: CardTransport> ClassicDriver<T> {
    pub fn new(transport: T, uid: u32) -> Self {
        Self {
            transport,
            uid,
            phase: AuthPhase::Idle,
        }
    }

    /// The selected card's 32-bit uid.
    pub fn uid(&self) -> u32 {
        self.uid
    }

    /// Where the current handshake stands.
    pub fn phase(&self) -> AuthPhase {
        self.phase
    }

    /// Drop the session and re-select the card. Resets the phase.
    pub fn reconnect(&mut self) -> Result<(), AuthError> {
        self.phase = AuthPhase::Idle;
        self.transport.reconnect()?;
        Ok(())
    }

    /// First pass only: send a plaintext AUTH and return the tag nonce.
    /// Used by PRNG calibration, which never completes the handshake.
    pub fn request_auth(&mut self, key_type: KeyType, block: u8) -> Result<u32, AuthError> {
        self.phase = AuthPhase::Idle;
        match self.challenge(key_type, block) {
            Ok(nt) => Ok(nt),
            Err(e) => {
                self.phase = AuthPhase::Failed;
                Err(e)
            }
        }
    }

    /// Full three-pass authentication for one sector. On success the
    /// returned state is the live session cipher, synchronized with the
    /// card, and the phase is [`AuthPhase::Authenticated`].
    pub fn authenticate(
        &mut self,
        key_type: KeyType,
        block: u8,
        key: u64,
    ) -> Result<Crypto1State, AuthError> {
        self.phase = AuthPhase::Idle;
        match self.run_handshake(key_type, block, key) {
            Ok(state) => {
                self.phase = AuthPhase::Authenticated;
                Ok(state)
            }
            Err(e) => {
                self.phase = AuthPhase::Failed;
                Err(e)
            }
        }
    }

    /// Issue an AUTH for a second sector inside a live session. The frame
    /// goes out under the session keystream; the card answers with a fresh
    /// nonce already encrypted under the *target* sector's cipher, returned
    /// here raw. The session state is clocked past the frame, and the phase
    /// moves back to `Challenged`.
    pub fn nested_auth(
        &mut self,
        state: &mut Crypto1State,
        key_type: KeyType,
        block: u8,
    ) -> Result<u32, AuthError> {
        let frame = auth::build_auth_command(key_type, block);
        let encrypted = auth::encrypt_bytes(state, &frame);
        let result = self
            .transport
            .transceive(&encrypted)
            .map_err(AuthError::from)
            .and_then(|resp| parse_word(&resp));
        match result {
            Ok(encrypted_nt) => {
                self.phase = AuthPhase::Challenged;
                Ok(encrypted_nt)
            }
            Err(e) => {
                self.phase = AuthPhase::Failed;
                Err(e)
            }
        }
    }

    /// Read a 16-byte block inside a live session. Command and response both
    /// travel under the session keystream.
    pub fn read_block(
        &mut self,
        state: &mut Crypto1State,
        block: u8,
    ) -> Result<[u8; 16], AuthError> {
        match self.try_read_block(state, block) {
            Ok(data) => Ok(data),
            Err(e) => {
                self.phase = AuthPhase::Failed;
                Err(e)
            }
        }
    }

    fn try_read_block(
        &mut self,
        state: &mut Crypto1State,
        block: u8,
    ) -> Result<[u8; 16], AuthError> {
        let frame = auth::build_read_command(block);
        let encrypted = auth::encrypt_bytes(state, &frame);
        let resp = self.transport.transceive(&encrypted)?;
        if resp.len() < 16 {
            return Err(AuthError::ShortResponse {
                expected: 16,
                actual: resp.len(),
            });
        }
        let plain = auth::decrypt_bytes(state, &resp);
        // Transports that keep the trailing crc expose it for checking.
        if plain.len() >= 18 && !auth::check_crc_a(&plain[..18]) {
            return Err(AuthError::BadCrc);
        }
        let mut data = [0u8; 16];
        data.copy_from_slice(&plain[..16]);
        Ok(data)
    }

    fn challenge(&mut self, key_type: KeyType, block: u8) -> Result<u32, AuthError> {
        let frame = auth::build_auth_command(key_type, block);
        let resp = self.transport.transceive(&frame)?;
        let nt = parse_word(&resp)?;
        self.phase = AuthPhase::Challenged;
        Ok(nt)
    }

    fn run_handshake(
        &mut self,
        key_type: KeyType,
        block: u8,
        key: u64,
    ) -> Result<Crypto1State, AuthError> {
        let nt = self.challenge(key_type, block)?;

        let mut state = auth::init_cipher(key, self.uid, nt);
        let (encrypted_nr, encrypted_ar) =
            auth::compute_reader_response(&mut state, READER_NONCE, nt);

        let mut response = [0u8; 8];
        response[..4].copy_from_slice(&encrypted_nr.to_be_bytes());
        response[4..].copy_from_slice(&encrypted_ar.to_be_bytes());
        let resp = self.transport.transceive(&response)?;
        self.phase = AuthPhase::Responded;

        let encrypted_at = parse_word(&resp)?;
        if !auth::verify_card_response(&mut state, encrypted_at, nt) {
            return Err(AuthError::CardRejected);
        }
        Ok(state)
    }
}

fn parse_word(resp: &[u8]) -> Result<u32, AuthError> {
    if resp.len() < 4 {
        return Err(AuthError::ShortResponse {
            expected: 4,
            actual: resp.len(),
        });
    }
    Ok(u32::from_be_bytes([resp[0], resp[1], resp[2], resp[3]]))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::prng_successor;
    use std::collections::VecDeque;

    const KEY: u64 = 0xA0A1A2A3A4A5;
    const UID: u32 = 0xCDB46EFB;

    /// Transport double that replays canned responses and records frames.
    struct Script {
        responses: VecDeque<Result<Vec<u8>, TransportError>>,
        sent: Vec<Vec<u8>>,
    }

    impl Script {
        fn new(responses: Vec<Result<Vec<u8>, TransportError>>) -> Self {
            Self {
                responses: responses.into(),
                sent: Vec::new(),
            }
        }
    }

    impl CardTransport for Script {
        fn transceive(&mut self, data: &[u8]) -> Result<Vec<u8>, TransportError> {
            self.sent.push(data.to_vec());
            self.responses
                .pop_front()
                .unwrap_or(Err(TransportError::NoResponse))
        }

        fn reconnect(&mut self) -> Result<(), TransportError> {
            Ok(())
        }
    }

    /// Compute the card's third-pass proof for a scripted handshake.
    fn card_proof(key: u64, uid: u32, nt: u32) -> u32 {
        let mut reader = auth::init_cipher(key, uid, nt);
        let (encrypted_nr, _) = auth::compute_reader_response(&mut reader, READER_NONCE, nt);

        let mut card = auth::init_cipher(key, uid, nt);
        card.lfsr_word(encrypted_nr, true);
        card.lfsr_word(0, false);
        prng_successor(nt, 96) ^ card.lfsr_word(0, false)
    }

    #[test]
    fn test_request_auth_parses_tag_nonce() {
        let script = Script::new(vec![Ok(vec![0x01, 0x20, 0x01, 0x45])]);
        let mut driver = ClassicDriver::new(script, UID);

        let nt = driver.request_auth(KeyType::KeyA, 0).unwrap();
        assert_eq!(nt, 0x01200145);
        assert_eq!(driver.phase(), AuthPhase::Challenged);
    }

    #[test]
    fn test_request_auth_sends_framed_command() {
        let script = Script::new(vec![Ok(vec![0, 0, 0, 0])]);
        let mut driver = ClassicDriver::new(script, UID);
        driver.request_auth(KeyType::KeyA, 0x04).unwrap();
        assert_eq!(driver.transport.sent[0], auth::build_auth_command(KeyType::KeyA, 0x04));
    }

    #[test]
    fn test_request_auth_transport_failure() {
        let script = Script::new(vec![Err(TransportError::NoResponse)]);
        let mut driver = ClassicDriver::new(script, UID);

        let err = driver.request_auth(KeyType::KeyA, 0).unwrap_err();
        assert!(matches!(err, AuthError::Transport(TransportError::NoResponse)));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_request_auth_short_response() {
        let script = Script::new(vec![Ok(vec![0x01, 0x20])]);
        let mut driver = ClassicDriver::new(script, UID);

        let err = driver.request_auth(KeyType::KeyA, 0).unwrap_err();
        assert!(matches!(err, AuthError::ShortResponse { expected: 4, actual: 2 }));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_authenticate_full_handshake() {
        let nt = 0x0094A2D5u32;
        let proof = card_proof(KEY, UID, nt);
        let script = Script::new(vec![
            Ok(nt.to_be_bytes().to_vec()),
            Ok(proof.to_be_bytes().to_vec()),
        ]);
        let mut driver = ClassicDriver::new(script, UID);

        let state = driver.authenticate(KeyType::KeyA, 0, KEY).unwrap();
        assert_eq!(driver.phase(), AuthPhase::Authenticated);

        // Session state must match an independently computed reader state.
        let mut expected = auth::init_cipher(KEY, UID, nt);
        auth::compute_reader_response(&mut expected, READER_NONCE, nt);
        expected.lfsr_word(0, false);
        assert_eq!(state, expected);
    }

    #[test]
    fn test_authenticate_rejects_bad_proof() {
        let nt = 0x0094A2D5u32;
        let proof = card_proof(KEY, UID, nt) ^ 1;
        let script = Script::new(vec![
            Ok(nt.to_be_bytes().to_vec()),
            Ok(proof.to_be_bytes().to_vec()),
        ]);
        let mut driver = ClassicDriver::new(script, UID);

        let err = driver.authenticate(KeyType::KeyA, 0, KEY).unwrap_err();
        assert!(matches!(err, AuthError::CardRejected));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_nested_auth_clocks_session_state() {
        let script = Script::new(vec![Ok(vec![0xDE, 0xAD, 0xBE, 0xEF])]);
        let mut driver = ClassicDriver::new(script, UID);

        let mut state = auth::init_cipher(KEY, UID, 0x12345678);
        let mut expected_state = state;

        let encrypted_nt = driver.nested_auth(&mut state, KeyType::KeyA, 8).unwrap();
        assert_eq!(encrypted_nt, 0xDEADBEEF);
        assert_eq!(driver.phase(), AuthPhase::Challenged);

        // Four frame bytes consumed from the session keystream.
        auth::encrypt_bytes(&mut expected_state, &auth::build_auth_command(KeyType::KeyA, 8));
        assert_eq!(state, expected_state);
    }

    #[test]
    fn test_read_block_short_response() {
        let script = Script::new(vec![Ok(vec![0x00; 4])]);
        let mut driver = ClassicDriver::new(script, UID);

        let mut state = auth::init_cipher(KEY, UID, 0x12345678);
        let err = driver.read_block(&mut state, 0).unwrap_err();
        assert!(matches!(err, AuthError::ShortResponse { expected: 16, actual: 4 }));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }

    #[test]
    fn test_read_block_rejects_bad_crc() {
        let nt = 0x5A17E03Bu32;
        let mut reader_state = auth::init_cipher(KEY, UID, nt);

        // Card-side encryption of an 18-byte response with a corrupted crc.
        let mut card_state = reader_state;
        auth::encrypt_bytes(&mut card_state, &auth::build_read_command(1));
        let mut response = [0x42u8; 18];
        let crc = auth::crc_a(&response[..16]);
        response[16] = crc[0] ^ 0xFF;
        response[17] = crc[1];
        let encrypted = auth::encrypt_bytes(&mut card_state, &response);

        let script = Script::new(vec![Ok(encrypted)]);
        let mut driver = ClassicDriver::new(script, UID);
        let err = driver.read_block(&mut reader_state, 1).unwrap_err();
        assert!(matches!(err, AuthError::BadCrc));
        assert_eq!(driver.phase(), AuthPhase::Failed);
    }
}
