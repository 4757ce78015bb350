//! Boundary checks shared by the prediction kernels.

use crate::aligned::misalignment;
use crate::config::AlignmentPolicy;
use crate::error::KernelError;

#[inline]
pub(crate) fn check_len(what: &'static str, expected: usize, actual: usize) -> Result<(), KernelError> {
    if expected != actual {
        return Err(KernelError::LengthMismatch {
            what,
            expected,
            actual,
        });
    }
    Ok(())
}

/// `num_items * latent_dim`, reporting overflow as a length mismatch on the
/// item batch.
#[inline]
pub(crate) fn batch_len(num_items: usize, latent_dim: usize, actual: usize) -> Result<usize, KernelError> {
    num_items
        .checked_mul(latent_dim)
        .ok_or(KernelError::LengthMismatch {
            what: "item vectors",
            expected: usize::MAX,
            actual,
        })
}

/// Decide whether a vector fast path may run on these buffers.
///
/// Returns `Ok(true)` when every buffer is 32-byte aligned, `Ok(false)` when
/// one is not and the policy asks for the scalar kernel instead.
pub(crate) fn fast_path_allowed<T>(
    policy: AlignmentPolicy,
    buffers: &[(&'static str, &[T])],
) -> Result<bool, KernelError> {
    for &(what, buf) in buffers {
        let offset = misalignment(buf);
        if offset != 0 {
            return match policy {
                AlignmentPolicy::Strict => Err(KernelError::Misaligned { what, offset }),
                AlignmentPolicy::Fallback => Ok(false),
            };
        }
    }
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::AlignedVec;

    #[test]
    fn test_check_len() {
        assert!(check_len("out", 3, 3).is_ok());
        assert_eq!(
            check_len("out", 3, 2),
            Err(KernelError::LengthMismatch {
                what: "out",
                expected: 3,
                actual: 2
            })
        );
    }

    #[test]
    fn test_batch_len_overflow() {
        assert_eq!(batch_len(4, 3, 12), Ok(12));
        assert!(batch_len(usize::MAX, 2, 0).is_err());
    }

    #[test]
    fn test_fast_path_policy() {
        let buf = AlignedVec::<f32>::zeroed(16);
        let aligned: &[f32] = &buf;
        let shifted: &[f32] = &buf[1..];

        assert_eq!(
            fast_path_allowed(AlignmentPolicy::Strict, &[("user vector", aligned)]),
            Ok(true)
        );
        assert_eq!(
            fast_path_allowed(AlignmentPolicy::Strict, &[("user vector", aligned), ("item vectors", shifted)]),
            Err(KernelError::Misaligned {
                what: "item vectors",
                offset: 4
            })
        );
        assert_eq!(
            fast_path_allowed(AlignmentPolicy::Fallback, &[("item vectors", shifted)]),
            Ok(false)
        );
    }
}
