//! Tiered population count
//!
//! Counts the set bits of a byte buffer with the fastest strategy the
//! capability mask allows:
//!
//! 1. AVX2 bulk (buffers of at least [`AVX2_MIN_BYTES`]): a scalar prologue
//!    walks up to the next 32-byte boundary, a Harley-Seal carry-save adder
//!    reduces aligned 256-bit chunks, and the `< 32` byte remainder is handed
//!    to the next tier.
//! 2. Hardware POPCNT: 8-byte words in an unrolled loop, then the `< 8`
//!    trailing bytes one at a time with the same instruction.
//! 3. Portable: branch-free SWAR counting into a 64-bit accumulator.
//!
//! Every tier returns the same count as a naive bit-by-bit loop.

use crate::cpu::{capabilities, Capabilities};

/// Smallest buffer for which the AVX2 bulk tier is entered.
pub const AVX2_MIN_BYTES: usize = 512;

/// The strategy a buffer enters the engine with.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopcountTier {
    Avx2Bulk,
    Hardware,
    Portable,
}

impl PopcountTier {
    /// Entry tier for a buffer of `len` bytes. The AVX2 tier always hands its
    /// remainder on to `Hardware` or `Portable`.
    pub fn select(caps: Capabilities, len: usize) -> Self {
        if caps.avx2() && len >= AVX2_MIN_BYTES {
            Self::Avx2Bulk
        } else if caps.popcnt() {
            Self::Hardware
        } else {
            Self::Portable
        }
    }
}

/// Count the 1-bits in `buf` using the tiers allowed by `caps`.
///
/// `caps` is clamped to the host first, so forcing a flag on can never run an
/// unsupported instruction; it can only switch tiers off.
pub fn count_set_bits(buf: &[u8], caps: Capabilities) -> u64 {
    count_with(buf, caps.clamp_to_host())
}

/// [`count_set_bits`] with the cached host capabilities.
#[inline]
pub fn count_set_bits_auto(buf: &[u8]) -> u64 {
    count_with(buf, capabilities())
}

/// Count the 1-bits of a run of 32-bit words.
#[inline]
pub(crate) fn count_words(words: &[u32], caps: Capabilities) -> u64 {
    count_with(bytemuck::cast_slice(words), caps)
}

/// Dispatch on an already clamped mask.
#[inline]
#[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables, unused_mut))]
pub(crate) fn count_with(buf: &[u8], caps: Capabilities) -> u64 {
    let mut rest = buf;
    let mut count = 0u64;

    #[cfg(target_arch = "x86_64")]
    {
        if PopcountTier::select(caps, rest.len()) == PopcountTier::Avx2Bulk {
            // Safety: caps is clamped to the host, so AVX2 is present
            let (bulk, remainder) = unsafe { avx2::count_bulk(rest) };
            count += bulk;
            rest = remainder;
        }

        if caps.popcnt() {
            // Safety: caps is clamped to the host, so POPCNT is present
            return count + unsafe { hardware::count(rest) };
        }
    }

    count + count_portable(rest)
}

// ============================================================================
// Portable tier
// ============================================================================

const M1: u64 = 0x5555_5555_5555_5555;
const M2: u64 = 0x3333_3333_3333_3333;
const M4: u64 = 0x0f0f_0f0f_0f0f_0f0f;
const H01: u64 = 0x0101_0101_0101_0101;

/// Branch-free SWAR popcount of one 64-bit word.
#[inline]
pub fn popcount64(mut x: u64) -> u64 {
    x -= (x >> 1) & M1;
    x = (x & M2) + ((x >> 2) & M2);
    x = (x + (x >> 4)) & M4;
    x.wrapping_mul(H01) >> 56
}

/// Portable tier, also used for the AVX2 prologue.
#[inline]
pub fn count_portable(buf: &[u8]) -> u64 {
    let mut words = buf.chunks_exact(8);
    let mut count = 0u64;
    for word in &mut words {
        count += popcount64(u64::from_le_bytes(to_array(word)));
    }
    for &byte in words.remainder() {
        count += popcount64(byte as u64);
    }
    count
}

#[inline]
fn to_array(word: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(word);
    out
}

// ============================================================================
// Hardware POPCNT tier
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod hardware {
    use std::arch::x86_64::{_popcnt32, _popcnt64};

    use super::to_array;

    #[inline]
    #[target_feature(enable = "popcnt")]
    unsafe fn word(bytes: &[u8]) -> u64 {
        _popcnt64(u64::from_le_bytes(to_array(bytes)) as i64) as u64
    }

    /// # Safety
    /// Caller must ensure POPCNT is available
    #[target_feature(enable = "popcnt")]
    pub unsafe fn count(buf: &[u8]) -> u64 {
        let mut c0 = 0u64;
        let mut c1 = 0u64;
        let mut c2 = 0u64;
        let mut c3 = 0u64;

        // 4 words per step keeps several popcnt results in flight
        let mut blocks = buf.chunks_exact(32);
        for block in &mut blocks {
            c0 += word(&block[0..8]);
            c1 += word(&block[8..16]);
            c2 += word(&block[16..24]);
            c3 += word(&block[24..32]);
        }

        let mut words = blocks.remainder().chunks_exact(8);
        for w in &mut words {
            c0 += word(w);
        }

        for &byte in words.remainder() {
            c1 += _popcnt32(byte as i32) as u64;
        }

        c0 + c1 + c2 + c3
    }
}

// ============================================================================
// AVX2 bulk tier
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use super::count_portable;

    /// Carry-save adder: `(h, l)` such that `h * 2 + l == a + b + c` per bit.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn csa(a: __m256i, b: __m256i, c: __m256i) -> (__m256i, __m256i) {
        let u = _mm256_xor_si256(a, b);
        let h = _mm256_or_si256(_mm256_and_si256(a, b), _mm256_and_si256(u, c));
        let l = _mm256_xor_si256(u, c);
        (h, l)
    }

    /// Per-register popcount: nibble lookup, then `vpsadbw` into 4 u64 lanes.
    #[inline]
    #[target_feature(enable = "avx2")]
    unsafe fn popcount256(v: __m256i) -> __m256i {
        let lookup = _mm256_setr_epi8(
            0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3, 2, 3, 3, 4, 0, 1, 1, 2, 1, 2, 2, 3, 1, 2, 2, 3,
            2, 3, 3, 4,
        );
        let low_mask = _mm256_set1_epi8(0x0f);
        let lo = _mm256_and_si256(v, low_mask);
        let hi = _mm256_and_si256(_mm256_srli_epi32(v, 4), low_mask);
        let counts = _mm256_add_epi8(
            _mm256_shuffle_epi8(lookup, lo),
            _mm256_shuffle_epi8(lookup, hi),
        );
        _mm256_sad_epu8(counts, _mm256_setzero_si256())
    }

    /// Harley-Seal popcount over `n` aligned 256-bit chunks starting at `ptr`.
    #[target_feature(enable = "avx2")]
    unsafe fn harley_seal(ptr: *const __m256i, n: usize) -> u64 {
        let zero = _mm256_setzero_si256();
        let mut cnt = zero;
        let mut ones = zero;
        let mut twos = zero;
        let mut fours = zero;
        let mut eights = zero;

        let limit = n - n % 16;
        let mut i = 0;
        while i < limit {
            let p = ptr.add(i);

            let (twos_a, o) = csa(ones, _mm256_load_si256(p), _mm256_load_si256(p.add(1)));
            let (twos_b, o) = csa(o, _mm256_load_si256(p.add(2)), _mm256_load_si256(p.add(3)));
            let (fours_a, t) = csa(twos, twos_a, twos_b);
            let (twos_a, o) = csa(o, _mm256_load_si256(p.add(4)), _mm256_load_si256(p.add(5)));
            let (twos_b, o) = csa(o, _mm256_load_si256(p.add(6)), _mm256_load_si256(p.add(7)));
            let (fours_b, t) = csa(t, twos_a, twos_b);
            let (eights_a, f) = csa(fours, fours_a, fours_b);
            let (twos_a, o) = csa(o, _mm256_load_si256(p.add(8)), _mm256_load_si256(p.add(9)));
            let (twos_b, o) = csa(o, _mm256_load_si256(p.add(10)), _mm256_load_si256(p.add(11)));
            let (fours_a, t) = csa(t, twos_a, twos_b);
            let (twos_a, o) = csa(o, _mm256_load_si256(p.add(12)), _mm256_load_si256(p.add(13)));
            let (twos_b, o) = csa(o, _mm256_load_si256(p.add(14)), _mm256_load_si256(p.add(15)));
            let (fours_b, t) = csa(t, twos_a, twos_b);
            let (eights_b, f) = csa(f, fours_a, fours_b);
            let (sixteens, e) = csa(eights, eights_a, eights_b);

            ones = o;
            twos = t;
            fours = f;
            eights = e;
            cnt = _mm256_add_epi64(cnt, popcount256(sixteens));
            i += 16;
        }

        cnt = _mm256_slli_epi64(cnt, 4);
        cnt = _mm256_add_epi64(cnt, _mm256_slli_epi64(popcount256(eights), 3));
        cnt = _mm256_add_epi64(cnt, _mm256_slli_epi64(popcount256(fours), 2));
        cnt = _mm256_add_epi64(cnt, _mm256_slli_epi64(popcount256(twos), 1));
        cnt = _mm256_add_epi64(cnt, popcount256(ones));

        while i < n {
            cnt = _mm256_add_epi64(cnt, popcount256(_mm256_load_si256(ptr.add(i))));
            i += 1;
        }

        let mut lanes = [0u64; 4];
        _mm256_storeu_si256(lanes.as_mut_ptr() as *mut __m256i, cnt);
        lanes.iter().sum()
    }

    /// Count the aligned body of `buf`. Returns the count so far and the
    /// unconsumed tail (`< 32` bytes).
    ///
    /// # Safety
    /// Caller must ensure AVX2 is available
    #[target_feature(enable = "avx2")]
    pub unsafe fn count_bulk(buf: &[u8]) -> (u64, &[u8]) {
        let misalign = buf.as_ptr() as usize % 32;
        let prologue = ((32 - misalign) % 32).min(buf.len());
        let (head, body) = buf.split_at(prologue);

        let mut count = count_portable(head);

        let chunks = body.len() / 32;
        if chunks > 0 {
            count += harley_seal(body.as_ptr() as *const __m256i, chunks);
        }

        (count, &body[chunks * 32..])
    }
}
