//! Crypto1 stream cipher core.
//!
//! Crypto1 is the proprietary cipher protecting MIFARE Classic sectors: a
//! 48-bit LFSR with a 20-input nonlinear output filter. The register is kept
//! as two interleaved 24-bit halves (`odd` holds bits 47,45,..,1 of the
//! conceptual shift register, `even` holds 46,44,..,0), which is what makes
//! the split-table key recovery in [`crate::recovery`] possible.
//!
//! Everything here is bit-exact against the published cipher: forward
//! stepping (bit/byte/word, plain and encrypted-feedback mode), the exact
//! inverse rollback stepping, key pack/unpack, and the card's separate weak
//! nonce PRNG. All operations are infallible; register widths are enforced
//! by masking.

use serde::{Deserialize, Serialize};

/// Feedback taps of the conceptual 48-bit LFSR that fall on odd positions.
pub const LF_POLY_ODD: u32 = 0x29CE5C;
/// Feedback taps that fall on even positions.
pub const LF_POLY_EVEN: u32 = 0x870804;

/// The interleaved odd/even halves of the 48-bit Crypto1 register.
///
/// Only the low 24 bits of each half are meaningful. The state is a plain
/// value: clone it freely to branch a keystream without disturbing the
/// original (recovery and the nested attack both rely on this).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Crypto1State {
    pub odd: u32,
    pub even: u32,
}

#[inline]
fn bit(x: u32, n: u32) -> u32 {
    (x >> n) & 1
}

/// Bit `n` of `x` under big-endian byte addressing, as the wire words use.
#[inline]
pub(crate) fn bebit(x: u32, n: u32) -> u32 {
    bit(x, n ^ 24)
}

#[inline]
fn bit48(x: u64, n: u32) -> u32 {
    ((x >> n) & 1) as u32
}

/// The Crypto1 nonlinear output filter: a 20-bit window of the odd half in,
/// one keystream bit out. Five 4-bit sub-lookups select a bit of a final
/// 32-entry table.
#[inline]
pub fn filter(x: u32) -> u32 {
    let mut f = (0xf22c0 >> (x & 0xf)) & 16;
    f |= (0x6c9c0 >> ((x >> 4) & 0xf)) & 8;
    f |= (0x3c8b0 >> ((x >> 8) & 0xf)) & 4;
    f |= (0x1e458 >> ((x >> 12) & 0xf)) & 2;
    f |= (0x0d938 >> ((x >> 16) & 0xf)) & 1;
    (0xEC57E80A_u32 >> f) & 1
}

/// Population parity of a 32-bit word: 1 when an odd number of bits are set.
#[inline]
pub fn parity(mut x: u32) -> u32 {
    x ^= x >> 16;
    x ^= x >> 8;
    x ^= x >> 4;
    (0x6996 >> (x & 0xf)) & 1
}

/// Reverse the byte order of a 32-bit word.
#[inline]
pub fn swap_endian(x: u32) -> u32 {
    x.swap_bytes()
}

/// Advance a tag nonce `steps` positions through the card's 16-bit nonce
/// PRNG (taps x16+x14+x13+x11+1, clocked inside a 32-bit big-endian window).
///
/// Additive in `steps`: advancing by `a` then `b` equals advancing by
/// `a + b` in one call.
pub fn prng_successor(n: u32, steps: u32) -> u32 {
    let mut x = swap_endian(n);
    for _ in 0..steps {
        x = x >> 1 | (x >> 16 ^ x >> 18 ^ x >> 19 ^ x >> 21) << 31;
    }
    swap_endian(x)
}

impl Crypto1State {
    /// Pack a 48-bit sector key into the interleaved registers.
    pub fn load_key(key: u64) -> Self {
        let mut odd = 0u32;
        let mut even = 0u32;
        for i in (1..=47u32).rev().step_by(2) {
            odd = odd << 1 | bit48(key, (i - 1) ^ 7);
            even = even << 1 | bit48(key, i ^ 7);
        }
        Self { odd, even }
    }

    /// Unpack the registers back into a 48-bit key. Exact inverse of
    /// [`Crypto1State::load_key`] for every key.
    pub fn get_key(&self) -> u64 {
        let mut key = 0u64;
        for i in (0..24u32).rev() {
            key = key << 1 | u64::from(bit(self.odd, i ^ 3));
            key = key << 1 | u64::from(bit(self.even, i ^ 3));
        }
        key
    }

    /// Clock the register one step and return the keystream bit.
    ///
    /// With `encrypted` set the output bit is folded back into the feedback
    /// (the self-encrypting mode the card uses for the reader nonce). The
    /// returned keystream is identical either way; only the resulting state
    /// differs.
    pub fn lfsr_bit(&mut self, input: u32, encrypted: bool) -> u32 {
        let out = filter(self.odd);

        let mut feed = out & u32::from(encrypted);
        feed ^= u32::from(input != 0);
        feed ^= LF_POLY_ODD & self.odd;
        feed ^= LF_POLY_EVEN & self.even;
        self.even = self.even << 1 | parity(feed);

        std::mem::swap(&mut self.odd, &mut self.even);
        out
    }

    /// Clock eight steps, feeding bit `i` of `input` into step `i` and
    /// packing the output bits the same way (low bit first).
    pub fn lfsr_byte(&mut self, input: u8, encrypted: bool) -> u8 {
        let mut out = 0u8;
        for i in 0..8 {
            out |= (self.lfsr_bit(u32::from(input >> i) & 1, encrypted) as u8) << i;
        }
        out
    }

    /// Clock 32 steps with big-endian bit addressing on both input and
    /// output, matching how words travel on the wire.
    pub fn lfsr_word(&mut self, input: u32, encrypted: bool) -> u32 {
        let mut out = 0u32;
        for i in 0..32 {
            out |= self.lfsr_bit(bebit(input, i), encrypted) << (i ^ 24);
        }
        out
    }

    /// Step the register backwards, undoing one [`Crypto1State::lfsr_bit`]
    /// made with the same input and mode. Returns the keystream bit that
    /// forward step produced.
    pub fn lfsr_rollback_bit(&mut self, input: u32, encrypted: bool) -> u32 {
        // Forward stepping can leave a stale bit 24 in odd; clear it first.
        self.odd &= 0x00FF_FFFF;
        std::mem::swap(&mut self.odd, &mut self.even);

        let mut feed = self.even & 1;
        self.even >>= 1;
        feed ^= LF_POLY_EVEN & self.even;
        feed ^= LF_POLY_ODD & self.odd;
        feed ^= u32::from(input != 0);
        let out = filter(self.odd);
        feed ^= out & u32::from(encrypted);
        self.even |= parity(feed) << 23;
        out
    }

    /// Undo one [`Crypto1State::lfsr_byte`] (bits unwound high to low).
    pub fn lfsr_rollback_byte(&mut self, input: u8, encrypted: bool) -> u8 {
        let mut out = 0u8;
        for i in (0..8).rev() {
            out |= (self.lfsr_rollback_bit(u32::from(input >> i) & 1, encrypted) as u8) << i;
        }
        out
    }

    /// Undo one [`Crypto1State::lfsr_word`].
    pub fn lfsr_rollback_word(&mut self, input: u32, encrypted: bool) -> u32 {
        let mut out = 0u32;
        for i in (0..32u32).rev() {
            out |= self.lfsr_rollback_bit(bebit(input, i), encrypted) << (i ^ 24);
        }
        out
    }
}
