//! Sign binarization of dense embeddings.
//!
//! Element `j` of a row maps to bit `j % 32` of word `j / 32`; the bit is set
//! iff the value is strictly positive. Zero and negative values (and NaN)
//! clear the bit.

use crate::aligned::AlignedVec;
use crate::binary::BITS_PER_WORD;
use crate::error::BinarizeError;

/// Row-major matrix of packed sign words in aligned storage.
#[derive(Debug, Clone, PartialEq)]
pub struct PackedMatrix {
    words: AlignedVec<u32>,
    rows: usize,
    words_per_row: usize,
}

impl PackedMatrix {
    pub fn rows(&self) -> usize {
        self.rows
    }

    /// Packed latent dimension: `dim / 32`.
    pub fn words_per_row(&self) -> usize {
        self.words_per_row
    }

    pub fn row(&self, index: usize) -> Option<&[u32]> {
        if index >= self.rows {
            return None;
        }
        let start = index * self.words_per_row;
        Some(&self.words[start..start + self.words_per_row])
    }

    pub fn as_slice(&self) -> &[u32] {
        &self.words
    }

    pub fn size_in_bytes(&self) -> usize {
        self.words.size_in_bytes()
    }
}

/// Pack each `dim`-wide row of `vectors` into `dim / 32` sign words.
pub fn binarize(vectors: &[f32], dim: usize) -> Result<PackedMatrix, BinarizeError> {
    if dim == 0 || dim % BITS_PER_WORD != 0 {
        return Err(BinarizeError::InvalidDimension(dim));
    }
    let rows = row_count(vectors.len(), dim)?;
    let words_per_row = dim / BITS_PER_WORD;

    let mut words = AlignedVec::<u32>::zeroed(rows * words_per_row);
    for (word, chunk) in words.iter_mut().zip(vectors.chunks_exact(BITS_PER_WORD)) {
        *word = pack_word(chunk);
    }

    Ok(PackedMatrix {
        words,
        rows,
        words_per_row,
    })
}

#[inline]
fn pack_word(values: &[f32]) -> u32 {
    values
        .iter()
        .enumerate()
        .fold(0u32, |acc, (bit, &v)| if v > 0.0 { acc | (1 << bit) } else { acc })
}

/// Mean absolute value of each `dim`-wide row: the scale restoring magnitude
/// to a sign-only vector.
pub fn abs_mean_norms(vectors: &[f32], dim: usize) -> Result<Vec<f32>, BinarizeError> {
    if dim == 0 {
        return Err(BinarizeError::InvalidDimension(dim));
    }
    row_count(vectors.len(), dim)?;

    Ok(vectors
        .chunks_exact(dim)
        .map(|row| row.iter().map(|v| v.abs()).sum::<f32>() / dim as f32)
        .collect())
}

/// Unpack one packed row back into `words.len() * 32` sign flags.
pub fn unpack_signs(words: &[u32]) -> Vec<bool> {
    words
        .iter()
        .flat_map(|&word| (0..BITS_PER_WORD).map(move |bit| (word >> bit) & 1 == 1))
        .collect()
}

fn row_count(len: usize, dim: usize) -> Result<usize, BinarizeError> {
    if len % dim != 0 {
        return Err(BinarizeError::RaggedRows { len, dim });
    }
    Ok(len / dim)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::aligned::is_aligned;

    #[test]
    fn test_bit_layout() {
        let mut row = vec![-1.0f32; 64];
        row[0] = 0.5;
        row[31] = 2.0;
        row[32] = 1e-6;
        row[63] = 3.0;
        row[40] = 0.0;

        let packed = binarize(&row, 64).unwrap();
        assert_eq!(packed.rows(), 1);
        assert_eq!(packed.words_per_row(), 2);
        assert_eq!(packed.as_slice(), &[1u32 | (1 << 31), 1u32 | (1 << 31)]);
        assert!(is_aligned(packed.as_slice()));
    }

    #[test]
    fn test_rows() {
        let vectors: Vec<f32> = (0..96).map(|i| if i % 3 == 0 { 1.0 } else { -1.0 }).collect();
        let packed = binarize(&vectors, 32).unwrap();
        assert_eq!(packed.rows(), 3);
        assert_eq!(packed.size_in_bytes(), 12);
        for r in 0..3 {
            let signs = unpack_signs(packed.row(r).unwrap());
            let expected: Vec<bool> = vectors[r * 32..(r + 1) * 32].iter().map(|&v| v > 0.0).collect();
            assert_eq!(signs, expected);
        }
        assert!(packed.row(3).is_none());
    }

    #[test]
    fn test_invalid_shapes() {
        assert_eq!(binarize(&[1.0; 16], 16), Err(BinarizeError::InvalidDimension(16)));
        assert_eq!(binarize(&[], 0), Err(BinarizeError::InvalidDimension(0)));
        assert_eq!(
            binarize(&[1.0; 40], 32),
            Err(BinarizeError::RaggedRows { len: 40, dim: 32 })
        );
        assert_eq!(
            abs_mean_norms(&[1.0; 5], 2),
            Err(BinarizeError::RaggedRows { len: 5, dim: 2 })
        );
    }

    #[test]
    fn test_abs_mean_norms() {
        let norms = abs_mean_norms(&[1.0, -3.0, 0.5, 0.5], 2).unwrap();
        assert_eq!(norms, vec![2.0, 0.5]);
        assert!(abs_mean_norms(&[], 4).unwrap().is_empty());
    }
}
