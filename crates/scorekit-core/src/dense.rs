//! Dense prediction kernel
//!
//! Scores every candidate as `bias_item + bias_user + dot(user, item)`.
//!
//! # Performance
//! - AVX2 + FMA accumulates 8 f32 products per instruction into one register
//! - The 8 partial lanes are stored to a stack array and summed in lane order
//! - `latent_dim % 8` trailing dimensions use plain scalar multiply-add
//!
//! The scalar fallback emulates the same 8 lanes with `f32::mul_add`, so both
//! paths produce bit-identical scores for the same inputs.
//!
//! # Usage
//! ```ignore
//! use scorekit_core::aligned::AlignedVec;
//! use scorekit_core::dense::predict_dense;
//!
//! let user = AlignedVec::from_slice(&[1.0, 0.0, 1.0, 0.0]);
//! let items = AlignedVec::from_slice(&[1.0, 0.0, 1.0, 0.0, 0.0, 1.0, 0.0, 1.0]);
//! let mut out = [0.0f32; 2];
//! predict_dense(&user, &items, 0.0, &[0.0, 0.0], &mut out)?;
//! assert_eq!(out, [2.0, 0.0]);
//! ```

use crate::config::KernelOptions;
use crate::contract::{batch_len, check_len, fast_path_allowed};
use crate::cpu::{capabilities, Capabilities};
use crate::error::KernelError;

/// Lanes in one 256-bit f32 register.
const LANES: usize = 8;

/// Score `items` against `user` with default [`KernelOptions`].
///
/// `items` is row-major with stride `user.len()`; `biases_item` and `out`
/// hold one entry per item.
pub fn predict_dense(
    user: &[f32],
    items: &[f32],
    bias_user: f32,
    biases_item: &[f32],
    out: &mut [f32],
) -> Result<(), KernelError> {
    predict_dense_with(user, items, bias_user, biases_item, out, &KernelOptions::default())
}

pub fn predict_dense_with(
    user: &[f32],
    items: &[f32],
    bias_user: f32,
    biases_item: &[f32],
    out: &mut [f32],
    options: &KernelOptions,
) -> Result<(), KernelError> {
    predict_dense_using(user, items, bias_user, biases_item, out, options, capabilities())
}

/// [`predict_dense_with`] restricted to the instruction sets in `caps`
/// (clamped to the host).
#[allow(clippy::too_many_arguments)]
pub fn predict_dense_using(
    user: &[f32],
    items: &[f32],
    bias_user: f32,
    biases_item: &[f32],
    out: &mut [f32],
    options: &KernelOptions,
    caps: Capabilities,
) -> Result<(), KernelError> {
    validate(user, items, biases_item, out)?;
    let caps = caps.clamp_to_host();

    #[cfg(target_arch = "x86_64")]
    {
        // Item rows pick aligned or unaligned loads per row, so only the user
        // vector is gated.
        if caps.avx2_fma() && fast_path_allowed(options.alignment, &[("user vector", user)])? {
            // Safety: AVX2+FMA verified, lengths validated, user vector aligned
            unsafe { avx2::predict(user, items, bias_user, biases_item, out) };
            return Ok(());
        }
    }

    #[cfg(not(target_arch = "x86_64"))]
    let _ = (options, caps);

    predict_scalar(user, items, bias_user, biases_item, out);
    Ok(())
}

fn validate(user: &[f32], items: &[f32], biases_item: &[f32], out: &[f32]) -> Result<(), KernelError> {
    let latent_dim = user.len();
    if latent_dim == 0 {
        return Err(KernelError::ZeroLatentDim);
    }
    let num_items = biases_item.len();
    check_len("item vectors", batch_len(num_items, latent_dim, items.len())?, items.len())?;
    check_len("output", num_items, out.len())
}

// ============================================================================
// Scalar implementation (fallback)
// ============================================================================

fn predict_scalar(user: &[f32], items: &[f32], bias_user: f32, biases_item: &[f32], out: &mut [f32]) {
    let latent_dim = user.len();
    let body = latent_dim - latent_dim % LANES;
    let (user_body, user_tail) = user.split_at(body);

    for ((score, &bias_item), row) in out.iter_mut().zip(biases_item).zip(items.chunks_exact(latent_dim)) {
        let (row_body, row_tail) = row.split_at(body);

        let mut lanes = [0.0f32; LANES];
        for (x, y) in row_body.chunks_exact(LANES).zip(user_body.chunks_exact(LANES)) {
            for k in 0..LANES {
                lanes[k] = x[k].mul_add(y[k], lanes[k]);
            }
        }

        let mut prediction = bias_item + bias_user;
        for lane in lanes {
            prediction += lane;
        }
        for (x, y) in row_tail.iter().zip(user_tail) {
            prediction += x * y;
        }

        *score = prediction;
    }
}

// ============================================================================
// AVX2 + FMA implementation
// ============================================================================

#[cfg(target_arch = "x86_64")]
mod avx2 {
    use std::arch::x86_64::*;

    use super::LANES;

    /// # Safety
    /// Caller must ensure AVX2 and FMA are available, that `user` is 32-byte
    /// aligned, and that `items.len() == biases_item.len() * user.len()` and
    /// `out.len() == biases_item.len()`.
    #[target_feature(enable = "avx2", enable = "fma")]
    pub unsafe fn predict(user: &[f32], items: &[f32], bias_user: f32, biases_item: &[f32], out: &mut [f32]) {
        let latent_dim = user.len();
        let user_ptr = user.as_ptr();
        let mut unpacked = [0.0f32; LANES];

        for (i, (score, &bias_item)) in out.iter_mut().zip(biases_item).enumerate() {
            let row = items.as_ptr().add(i * latent_dim);
            let mut prediction = _mm256_setzero_ps();
            let mut j = 0;

            // Rows only stay on a 32-byte boundary when latent_dim % 8 == 0
            if row as usize % 32 == 0 {
                while j + LANES <= latent_dim {
                    let x = _mm256_load_ps(row.add(j));
                    let y = _mm256_load_ps(user_ptr.add(j));
                    prediction = _mm256_fmadd_ps(x, y, prediction);
                    j += LANES;
                }
            } else {
                while j + LANES <= latent_dim {
                    let x = _mm256_loadu_ps(row.add(j));
                    let y = _mm256_load_ps(user_ptr.add(j));
                    prediction = _mm256_fmadd_ps(x, y, prediction);
                    j += LANES;
                }
            }

            _mm256_storeu_ps(unpacked.as_mut_ptr(), prediction);

            let mut scalar_prediction = bias_item + bias_user;
            for lane in unpacked {
                scalar_prediction += lane;
            }

            // Remainder
            while j < latent_dim {
                scalar_prediction += *row.add(j) * *user_ptr.add(j);
                j += 1;
            }

            *score = scalar_prediction;
        }
    }
}
