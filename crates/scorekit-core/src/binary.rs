//! Binary (sign-quantized) prediction kernel
//!
//! User and item embeddings are packed 32 sign bits per `u32` word. A set bit
//! in `!(user ^ item)` means the two signs agree; with `on_bits` agreeing
//! bits out of `max_on_bits = latent_dim * 32` the bipolar similarity is
//! `on_bits - (max_on_bits - on_bits)`, and the final score is
//!
//! ```text
//! similarity * norm_user * norm_item + bias_user + bias_item
//! ```
//!
//! Two regimes, picked once per call from `latent_dim` (words per vector):
//! - standard (`latent_dim >= 8`): 8-word XNOR chunks counted by the
//!   popcount engine, trailing words counted one at a time
//! - low-dimension (`latent_dim < 8`): `8 / latent_dim` items share one
//!   256-bit register, XNORed against a tiled copy of the user vector

use crate::config::KernelOptions;
use crate::contract::{batch_len, check_len, fast_path_allowed};
use crate::cpu::{capabilities, Capabilities};
use crate::error::KernelError;
use crate::popcount::count_words;

/// 32-bit words in one 256-bit register.
pub const REGISTER_WORDS: usize = 8;

/// Sign bits packed into each word.
pub const BITS_PER_WORD: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryRegime {
    /// One item per pass, 8-word chunks plus a scalar tail.
    Standard,
    /// Several items packed into each register load.
    LowDim,
}

impl BinaryRegime {
    pub fn select(latent_dim: usize, options: &KernelOptions) -> Self {
        if latent_dim < REGISTER_WORDS && options.lowdim_packing {
            Self::LowDim
        } else {
            Self::Standard
        }
    }
}

/// Score packed `items` against the packed `user` vector with default
/// [`KernelOptions`].
///
/// `items` is row-major with stride `user.len()` words; `biases_item`,
/// `norms_item` and `out` hold one entry per item.
pub fn predict_binary(
    user: &[u32],
    items: &[u32],
    bias_user: f32,
    biases_item: &[f32],
    norm_user: f32,
    norms_item: &[f32],
    out: &mut [f32],
) -> Result<(), KernelError> {
    predict_binary_with(
        user,
        items,
        bias_user,
        biases_item,
        norm_user,
        norms_item,
        out,
        &KernelOptions::default(),
    )
}

#[allow(clippy::too_many_arguments)]
pub fn predict_binary_with(
    user: &[u32],
    items: &[u32],
    bias_user: f32,
    biases_item: &[f32],
    norm_user: f32,
    norms_item: &[f32],
    out: &mut [f32],
    options: &KernelOptions,
) -> Result<(), KernelError> {
    predict_binary_using(
        user,
        items,
        bias_user,
        biases_item,
        norm_user,
        norms_item,
        out,
        options,
        capabilities(),
    )
}

/// [`predict_binary_with`] restricted to the instruction sets in `caps`
/// (clamped to the host).
#[allow(clippy::too_many_arguments)]
pub fn predict_binary_using(
    user: &[u32],
    items: &[u32],
    bias_user: f32,
    biases_item: &[f32],
    norm_user: f32,
    norms_item: &[f32],
    out: &mut [f32],
    options: &KernelOptions,
    caps: Capabilities,
) -> Result<(), KernelError> {
    validate(user, items, biases_item, norms_item, out)?;
    let caps = caps.clamp_to_host();
    let params = ScoreParams {
        max_on_bits: (user.len() * BITS_PER_WORD) as u64,
        bias_user,
        norm_user,
        biases_item,
        norms_item,
    };

    match BinaryRegime::select(user.len(), options) {
        BinaryRegime::LowDim => predict_lowdim(user, items, &params, out, caps),
        BinaryRegime::Standard => {
            #[cfg(target_arch = "x86_64")]
            {
                // Item rows pick aligned or unaligned loads per row, so only
                // the user vector is gated.
                if caps.avx2() && fast_path_allowed(options.alignment, &[("user vector", user)])? {
                    // Safety: AVX2 verified, lengths validated, user vector aligned
                    unsafe { avx2::predict_standard(user, items, &params, out, caps) };
                    return Ok(());
                }
            }
            predict_standard_scalar(user, items, &params, out, caps);
        }
    }
    Ok(())
}

fn validate(
    user: &[u32],
    items: &[u32],
    biases_item: &[f32],
    norms_item: &[f32],
    out: &[f32],
) -> Result<(), KernelError> {
    let latent_dim = user.len();
    if latent_dim == 0 {
        return Err(KernelError::ZeroLatentDim);
    }
    let num_items = biases_item.len();
    check_len("item norms", num_items, norms_item.len())?;
    check_len("item vectors", batch_len(num_items, latent_dim, items.len())?, items.len())?;
    check_len("output", num_items, out.len())
}

/// Count of agreeing sign bits between two packed vectors of equal length.
pub fn agreement(user: &[u32], item: &[u32]) -> u64 {
    user.iter()
        .zip(item)
        .map(|(u, v)| (!(u ^ v)).count_ones() as u64)
        .sum()
}

/// Bipolar similarity `2 * on_bits - max_on_bits`: +1 per agreeing bit, -1
/// per disagreeing bit.
#[inline]
pub fn bipolar_similarity(on_bits: u64, max_on_bits: u64) -> i64 {
    2 * on_bits as i64 - max_on_bits as i64
}

struct ScoreParams<'a> {
    max_on_bits: u64,
    bias_user: f32,
    norm_user: f32,
    biases_item: &'a [f32],
    norms_item: &'a [f32],
}

impl ScoreParams<'_> {
    #[inline]
    fn score(&self, item: usize, on_bits: u64) -> f32 {
        let similarity = bipolar_similarity(on_bits, self.max_on_bits) as f32;
        similarity * self.norm_user * self.norms_item[item] + self.bias_user + self.biases_item[item]
    }
}

// ============================================================================
// Standard regime
// ============================================================================

fn predict_standard_scalar(user: &[u32], items: &[u32], params: &ScoreParams<'_>, out: &mut [f32], caps: Capabilities) {
    let latent_dim = user.len();
    let body = latent_dim - latent_dim % REGISTER_WORDS;
    let (user_body, user_tail) = user.split_at(body);
    let mut bits = [0u32; REGISTER_WORDS];

    for (i, (score, row)) in out.iter_mut().zip(items.chunks_exact(latent_dim)).enumerate() {
        let (row_body, row_tail) = row.split_at(body);
        let mut on_bits = 0u64;

        for (x, y) in row_body.chunks_exact(REGISTER_WORDS).zip(user_body.chunks_exact(REGISTER_WORDS)) {
            for k in 0..REGISTER_WORDS {
                bits[k] = !(x[k] ^ y[k]);
            }
            on_bits += count_words(&bits, caps);
        }
        on_bits += agreement(user_tail, row_tail);

        *score = params.score(i, on_bits);
    }
}

// ============================================================================
// Low-dimension regime
// ============================================================================

/// Items are scored in groups of `8 / latent_dim`: each group is copied into a
/// zeroed register-sized bridge (the last group may be partial), XNORed once
/// against the tiled user vector, and each item slot is counted separately.
fn predict_lowdim(user: &[u32], items: &[u32], params: &ScoreParams<'_>, out: &mut [f32], caps: Capabilities) {
    let latent_dim = user.len();
    debug_assert!(latent_dim <= REGISTER_WORDS);
    let per_register = REGISTER_WORDS / latent_dim;

    let mut tiled = [0u32; REGISTER_WORDS];
    for (k, word) in tiled.iter_mut().enumerate() {
        *word = user[k % latent_dim];
    }

    for (group, chunk) in items.chunks(per_register * latent_dim).enumerate() {
        let mut lanes = [0u32; REGISTER_WORDS];
        lanes[..chunk.len()].copy_from_slice(chunk);
        let bits = xnor_register(&lanes, &tiled, caps);

        let first = group * per_register;
        for (k, slot) in bits[..chunk.len()].chunks_exact(latent_dim).enumerate() {
            let item = first + k;
            out[item] = params.score(item, count_words(slot, caps));
        }
    }
}

#[inline]
#[cfg_attr(not(target_arch = "x86_64"), allow(unused_variables))]
fn xnor_register(x: &[u32; REGISTER_WORDS], y: &[u32; REGISTER_WORDS], caps: Capabilities) -> [u32; REGISTER_WORDS] {
    #[cfg(target_arch = "x86_64")]
    {
        if caps.avx2() {
            // Safety: AVX2 verified by the clamped capability mask
            return unsafe { avx2::xnor_register(x, y) };
        }
    }

    let mut bits = [0u32; REGISTER_WORDS];
    for k in 0..REGISTER_WORDS {
        bits[k] = !(x[k] ^ y[k]);
    }
    bits
}

// ============================================================================
// AVX2 implementations
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use super::{agreement, ScoreParams, REGISTER_WORDS};
    use crate::cpu::Capabilities;
    use crate::popcount::count_words;

    /// # Safety
    /// Caller must ensure AVX2 is available
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn xnor_register(x: &[u32; REGISTER_WORDS], y: &[u32; REGISTER_WORDS]) -> [u32; REGISTER_WORDS] {
        let allbits = _mm256_cmpeq_epi32(_mm256_setzero_si256(), _mm256_setzero_si256());
        let xv = _mm256_loadu_si256(x.as_ptr() as *const __m256i);
        let yv = _mm256_loadu_si256(y.as_ptr() as *const __m256i);
        let xnor = _mm256_xor_si256(_mm256_xor_si256(xv, yv), allbits);

        let mut bits = [0u32; REGISTER_WORDS];
        _mm256_storeu_si256(bits.as_mut_ptr() as *mut __m256i, xnor);
        bits
    }

    /// # Safety
    /// Caller must ensure AVX2 is available, that `user` is 32-byte aligned,
    /// and that the slice lengths were validated.
    #[target_feature(enable = "avx2")]
    pub(super) unsafe fn predict_standard(
        user: &[u32],
        items: &[u32],
        params: &ScoreParams<'_>,
        out: &mut [f32],
        caps: Capabilities,
    ) {
        let latent_dim = user.len();
        let body = latent_dim - latent_dim % REGISTER_WORDS;
        let user_ptr = user.as_ptr();
        let allbits = _mm256_cmpeq_epi32(_mm256_setzero_si256(), _mm256_setzero_si256());
        let mut bits = [0u32; REGISTER_WORDS];

        for (i, score) in out.iter_mut().enumerate() {
            let row = &items[i * latent_dim..(i + 1) * latent_dim];
            let row_ptr = row.as_ptr();
            let aligned = row_ptr as usize % 32 == 0;
            let mut on_bits = 0u64;

            let mut j = 0;
            while j < body {
                let x = if aligned {
                    _mm256_load_si256(row_ptr.add(j) as *const __m256i)
                } else {
                    _mm256_loadu_si256(row_ptr.add(j) as *const __m256i)
                };
                let y = _mm256_load_si256(user_ptr.add(j) as *const __m256i);

                // XNOR
                let xnor = _mm256_xor_si256(_mm256_xor_si256(x, y), allbits);
                _mm256_storeu_si256(bits.as_mut_ptr() as *mut __m256i, xnor);

                on_bits += count_words(&bits, caps);
                j += REGISTER_WORDS;
            }

            on_bits += agreement(&user[body..], &row[body..]);

            *score = params.score(i, on_bits);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::AlignedVec;
    use crate::config::AlignmentPolicy;

    fn words(len: usize, seed: u64) -> AlignedVec<u32> {
        let mut state = seed.wrapping_mul(0x9e37_79b9_7f4a_7c15) | 1;
        let values: Vec<u32> = (0..len)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 7;
                state ^= state << 17;
                (state >> 16) as u32
            })
            .collect();
        AlignedVec::from_slice(&values)
    }

    fn floats(len: usize, scale: f32) -> Vec<f32> {
        (0..len).map(|i| ((i * 37 % 11) as f32 - 5.0) * scale).collect()
    }

    fn naive_on_bits(user: &[u32], item: &[u32]) -> u64 {
        let mut matching = 0;
        for (u, v) in user.iter().zip(item) {
            for bit in 0..32 {
                if (u >> bit) & 1 == (v >> bit) & 1 {
                    matching += 1;
                }
            }
        }
        matching
    }

    struct Case {
        user: AlignedVec<u32>,
        items: AlignedVec<u32>,
        biases: Vec<f32>,
        norms: Vec<f32>,
    }

    impl Case {
        fn new(latent_dim: usize, num_items: usize, seed: u64) -> Self {
            Self {
                user: words(latent_dim, seed),
                items: words(latent_dim * num_items, seed + 1),
                biases: floats(num_items, 0.1),
                norms: floats(num_items, 0.03).iter().map(|x| x.abs() + 0.01).collect(),
            }
        }

        fn expected(&self, bias_user: f32, norm_user: f32) -> Vec<f32> {
            let max_on_bits = (self.user.len() * 32) as f32;
            self.items
                .chunks_exact(self.user.len())
                .enumerate()
                .map(|(i, item)| {
                    let on_bits = naive_on_bits(&self.user, item) as f32;
                    (on_bits - (max_on_bits - on_bits)) * norm_user * self.norms[i] + bias_user + self.biases[i]
                })
                .collect()
        }

        fn run(&self, options: &KernelOptions, caps: Capabilities) -> Vec<f32> {
            let mut out = vec![f32::NAN; self.biases.len()];
            predict_binary_using(
                &self.user,
                &self.items,
                0.5,
                &self.biases,
                1.5,
                &self.norms,
                &mut out,
                options,
                caps,
            )
            .unwrap();
            out
        }
    }

    #[test]
    fn test_agreement_bounds() {
        for latent_dim in [1, 3, 8, 9, 15] {
            let user = words(latent_dim, 3);
            let item = words(latent_dim, 4);
            let max_on_bits = (latent_dim * 32) as u64;
            let on_bits = agreement(&user, &item);
            assert!(on_bits <= max_on_bits);
            assert_eq!(on_bits, naive_on_bits(&user, &item));

            let similarity = bipolar_similarity(on_bits, max_on_bits);
            assert!(similarity.unsigned_abs() <= max_on_bits);

            assert_eq!(agreement(&user, &user), max_on_bits);
            assert_eq!(bipolar_similarity(max_on_bits, max_on_bits), max_on_bits as i64);
            assert_eq!(bipolar_similarity(0, max_on_bits), -(max_on_bits as i64));
        }
    }

    #[test]
    fn test_identical_vectors_score_maximum() {
        for latent_dim in [1, 2, 4, 7, 8, 16, 17] {
            let user = words(latent_dim, 9);
            let mut items = AlignedVec::<u32>::zeroed(latent_dim * 3);
            for row in items.chunks_exact_mut(latent_dim) {
                row.copy_from_slice(&user);
            }
            let mut out = [0.0f32; 3];
            predict_binary(&user, &items, 0.0, &[0.0; 3], 1.0, &[1.0; 3], &mut out).unwrap();
            assert_eq!(out, [(latent_dim * 32) as f32; 3], "latent_dim={}", latent_dim);
        }
    }

    #[test]
    fn test_matches_naive_all_tiers() {
        let packed = KernelOptions::default();
        let unpacked = KernelOptions {
            lowdim_packing: false,
            ..KernelOptions::default()
        };
        for latent_dim in [1, 2, 3, 4, 5, 7, 8, 9, 15, 16, 24, 33] {
            for num_items in [0, 1, 2, 5, 8, 13] {
                let case = Case::new(latent_dim, num_items, (latent_dim * 100 + num_items) as u64);
                let expected = case.expected(0.5, 1.5);
                for caps in Capabilities::combinations() {
                    for options in [&packed, &unpacked] {
                        assert_eq!(
                            case.run(options, caps),
                            expected,
                            "latent_dim={} num_items={} caps={:?} options={:?}",
                            latent_dim,
                            num_items,
                            caps,
                            options
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn test_large_vectors_use_bulk_popcount() {
        // 256 words per vector, so each 8-word chunk still goes through the
        // popcount engine while the totals exceed one register
        let case = Case::new(256, 4, 77);
        let expected = case.expected(0.5, 1.5);
        for caps in Capabilities::combinations() {
            assert_eq!(case.run(&KernelOptions::default(), caps), expected);
        }
    }

    #[test]
    fn test_regime_selection() {
        let opts = KernelOptions::default();
        assert_eq!(BinaryRegime::select(1, &opts), BinaryRegime::LowDim);
        assert_eq!(BinaryRegime::select(7, &opts), BinaryRegime::LowDim);
        assert_eq!(BinaryRegime::select(8, &opts), BinaryRegime::Standard);
        let no_packing = KernelOptions {
            lowdim_packing: false,
            ..opts
        };
        assert_eq!(BinaryRegime::select(3, &no_packing), BinaryRegime::Standard);
    }

    #[test]
    fn test_forced_lowdim_agrees_at_boundary() {
        let case = Case::new(REGISTER_WORDS, 11, 5);
        let params = ScoreParams {
            max_on_bits: (REGISTER_WORDS * BITS_PER_WORD) as u64,
            bias_user: 0.5,
            norm_user: 1.5,
            biases_item: &case.biases,
            norms_item: &case.norms,
        };
        for caps in Capabilities::combinations() {
            let caps = caps.clamp_to_host();
            let mut forced = vec![0.0f32; 11];
            predict_lowdim(&case.user, &case.items, &params, &mut forced, caps);
            assert_eq!(forced, case.run(&KernelOptions::default(), caps), "caps={:?}", caps);
        }
    }

    #[test]
    fn test_lowdim_partial_group() {
        // 3 words per item: two items per register, the seventh item alone
        let case = Case::new(3, 7, 21);
        assert_eq!(case.run(&KernelOptions::default(), Capabilities::all()), case.expected(0.5, 1.5));
    }

    #[test]
    fn test_idempotent() {
        let case = Case::new(9, 6, 13);
        let first = case.run(&KernelOptions::default(), Capabilities::all());
        let second = case.run(&KernelOptions::default(), Capabilities::all());
        assert_eq!(
            first.iter().map(|x| x.to_bits()).collect::<Vec<_>>(),
            second.iter().map(|x| x.to_bits()).collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_rejects_bad_lengths_without_writing() {
        let case = Case::new(8, 2, 1);
        let mut out = [9.0f32; 2];
        assert_eq!(
            predict_binary(&[], &case.items, 0.0, &case.biases, 1.0, &case.norms, &mut out),
            Err(KernelError::ZeroLatentDim)
        );
        assert_eq!(
            predict_binary(&case.user, &case.items, 0.0, &case.biases, 1.0, &case.norms[..1], &mut out),
            Err(KernelError::LengthMismatch {
                what: "item norms",
                expected: 2,
                actual: 1
            })
        );
        assert_eq!(
            predict_binary(&case.user, &case.items[..15], 0.0, &case.biases, 1.0, &case.norms, &mut out),
            Err(KernelError::LengthMismatch {
                what: "item vectors",
                expected: 16,
                actual: 15
            })
        );
        assert_eq!(out, [9.0, 9.0]);
    }

    #[test]
    fn test_misaligned_user_rejected_item_base_accepted() {
        // Nine words per row: rows never share an alignment, so the kernel
        // already picks loads per row and only the user vector is gated
        let backing = words(9 * 3 + 1, 2);
        let items = &backing[1..];
        let user = words(9, 3);
        let biases = [0.0f32; 3];
        let norms = [1.0f32; 3];
        let mut out = [0.0f32; 3];

        predict_binary(&user, items, 0.0, &biases, 1.0, &norms, &mut out).unwrap();
        for (i, item) in items.chunks_exact(9).enumerate() {
            let on_bits = naive_on_bits(&user, item) as i64;
            assert_eq!(out[i], (2 * on_bits - 288) as f32);
        }

        let shifted_user = words(10, 4);
        let user = &shifted_user[1..];
        let mut out = [7.0f32; 3];
        let strict = predict_binary(user, items, 0.0, &biases, 1.0, &norms, &mut out);
        if capabilities().avx2() {
            assert_eq!(
                strict,
                Err(KernelError::Misaligned {
                    what: "user vector",
                    offset: 4
                })
            );
            assert_eq!(out, [7.0; 3]);
        } else {
            assert!(strict.is_ok());
        }

        let fallback = KernelOptions {
            alignment: AlignmentPolicy::Fallback,
            ..KernelOptions::default()
        };
        predict_binary_with(user, items, 0.0, &biases, 1.0, &norms, &mut out, &fallback).unwrap();
        for (i, item) in items.chunks_exact(9).enumerate() {
            let on_bits = naive_on_bits(user, item) as i64;
            assert_eq!(out[i], (2 * on_bits - 288) as f32);
        }
    }
}
