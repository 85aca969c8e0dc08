//! mfkit - MIFARE Classic analysis toolkit
//!
//! Implements the Crypto1 stream cipher bit for bit, the ISO 14443-3A
//! three-pass authentication it protects, and the cryptanalysis that breaks
//! it: candidate-state recovery from 32 bits of keystream and the nested
//! authentication attack. An in-memory card simulation backs the demo and
//! the test suite; real readers plug in through [`transport::CardTransport`].

pub mod auth;
pub mod cipher;
pub mod driver;
pub mod nested;
pub mod recovery;
pub mod sim;
pub mod transport;

pub use auth::KeyType;
pub use cipher::{prng_successor, swap_endian, Crypto1State};
pub use driver::{AuthError, AuthPhase, ClassicDriver};
pub use nested::{calibrate_prng, AttackConfig, AttackError, CollectedNonce, NestedAttack};
pub use recovery::{lfsr_recovery32, nonce_distance, recover_key_from_nonces};
pub use sim::SimulatedCard;
pub use transport::{CardTransport, TransportError};
