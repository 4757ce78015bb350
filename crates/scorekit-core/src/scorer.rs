//! Per-model scorers owning aligned copies of the model parameters.
//!
//! A scorer answers "score these items for user `u`" by handing the kernels a
//! user row and the item batch. User rows are stored on a padded stride so
//! every row starts on a 32-byte boundary; item rows are contiguous, which is
//! the layout the kernels expect for a batch.

use std::ops::Range;

use tracing::debug;

use crate::aligned::{AlignedVec, Lane};
use crate::binarize::{abs_mean_norms, binarize, PackedMatrix};
use crate::binary::{predict_binary_with, REGISTER_WORDS};
use crate::config::KernelOptions;
use crate::dense::predict_dense_with;
use crate::error::ScorerError;

/// Rows of `width` lanes, each starting on a 32-byte boundary.
#[derive(Debug, Clone)]
struct RowTable<T: Lane> {
    values: AlignedVec<T>,
    width: usize,
    stride: usize,
    rows: usize,
}

impl<T: Lane> RowTable<T> {
    fn from_rows(rows: &[T], width: usize) -> Self {
        let stride = width.div_ceil(REGISTER_WORDS) * REGISTER_WORDS;
        let count = rows.len() / width;
        let mut values = AlignedVec::zeroed(count * stride);
        for (dst, src) in values.chunks_exact_mut(stride).zip(rows.chunks_exact(width)) {
            dst[..width].copy_from_slice(src);
        }
        Self {
            values,
            width,
            stride,
            rows: count,
        }
    }

    fn row(&self, index: usize) -> Option<&[T]> {
        if index >= self.rows {
            return None;
        }
        let start = index * self.stride;
        Some(&self.values[start..start + self.width])
    }

    fn size_in_bytes(&self) -> usize {
        self.values.size_in_bytes()
    }
}

fn check_shape(what: &str, values: usize, biases: usize, dim: usize) -> Result<usize, ScorerError> {
    if dim == 0 {
        return Err(ScorerError::InvalidDimensions("embedding dimension must be at least 1".to_string()));
    }
    if values % dim != 0 {
        return Err(ScorerError::InvalidDimensions(format!(
            "{} vectors hold {} values, not a multiple of dimension {}",
            what, values, dim
        )));
    }
    let rows = values / dim;
    if rows != biases {
        return Err(ScorerError::InvalidDimensions(format!(
            "{} vectors describe {} rows but {} biases were given",
            what, rows, biases
        )));
    }
    Ok(rows)
}

fn check_item_ids(item_ids: &[usize], num_items: usize) -> Result<(), ScorerError> {
    match item_ids.iter().find(|&&id| id >= num_items) {
        Some(&item_id) => Err(ScorerError::UnknownItem { item_id, num_items }),
        None => Ok(()),
    }
}

fn check_range(items: &Range<usize>, num_items: usize) -> Result<(), ScorerError> {
    if items.start > items.end || items.end > num_items {
        return Err(ScorerError::InvalidDimensions(format!(
            "item range {:?} is out of bounds for {} items",
            items, num_items
        )));
    }
    Ok(())
}

fn f32_bytes(values: &[f32]) -> usize {
    std::mem::size_of_val(values)
}

/// Full-catalogue scoring, the common surface of [`DenseScorer`] and
/// [`BinaryScorer`] used by the ranking metrics.
pub trait Predict {
    fn num_users(&self) -> usize;
    fn num_items(&self) -> usize;
    /// Scores for every item, one slot per item in `out`.
    fn predict_into(&self, user_id: usize, out: &mut [f32]) -> Result<(), ScorerError>;
}

impl Predict for DenseScorer {
    fn num_users(&self) -> usize {
        DenseScorer::num_users(self)
    }

    fn num_items(&self) -> usize {
        DenseScorer::num_items(self)
    }

    fn predict_into(&self, user_id: usize, out: &mut [f32]) -> Result<(), ScorerError> {
        DenseScorer::predict_into(self, user_id, out)
    }
}

impl Predict for BinaryScorer {
    fn num_users(&self) -> usize {
        BinaryScorer::num_users(self)
    }

    fn num_items(&self) -> usize {
        BinaryScorer::num_items(self)
    }

    fn predict_into(&self, user_id: usize, out: &mut [f32]) -> Result<(), ScorerError> {
        BinaryScorer::predict_into(self, user_id, out)
    }
}

// ============================================================================
// Dense
// ============================================================================

/// Scores with full-precision latent vectors: `bias_user + bias_item + u·v`.
#[derive(Debug, Clone)]
pub struct DenseScorer {
    users: RowTable<f32>,
    user_biases: Vec<f32>,
    items: AlignedVec<f32>,
    item_biases: AlignedVec<f32>,
    dim: usize,
    options: KernelOptions,
}

impl DenseScorer {
    /// Build from row-major `user_vectors` and `item_vectors` of width `dim`.
    pub fn new(
        user_vectors: &[f32],
        user_biases: &[f32],
        item_vectors: &[f32],
        item_biases: &[f32],
        dim: usize,
    ) -> Result<Self, ScorerError> {
        let num_users = check_shape("user", user_vectors.len(), user_biases.len(), dim)?;
        let num_items = check_shape("item", item_vectors.len(), item_biases.len(), dim)?;

        debug!(
            "Building dense scorer: {} users, {} items, dimension {}",
            num_users, num_items, dim
        );

        Ok(Self {
            users: RowTable::from_rows(user_vectors, dim),
            user_biases: user_biases.to_vec(),
            items: AlignedVec::from_slice(item_vectors),
            item_biases: AlignedVec::from_slice(item_biases),
            dim,
            options: KernelOptions::default(),
        })
    }

    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    pub fn num_users(&self) -> usize {
        self.users.rows
    }

    pub fn num_items(&self) -> usize {
        self.item_biases.len()
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Scores for every item.
    pub fn predict(&self, user_id: usize) -> Result<Vec<f32>, ScorerError> {
        let mut out = vec![0.0; self.num_items()];
        self.predict_into(user_id, &mut out)?;
        Ok(out)
    }

    /// Scores for every item, written into `out` (one slot per item).
    pub fn predict_into(&self, user_id: usize, out: &mut [f32]) -> Result<(), ScorerError> {
        let (user, bias_user) = self.user(user_id)?;
        predict_dense_with(user, &self.items, bias_user, &self.item_biases, out, &self.options)?;
        Ok(())
    }

    /// Scores for the contiguous item range `items`, written into `out`.
    ///
    /// Any start is accepted: user rows are stored aligned and the kernels
    /// load item rows unaligned where needed.
    pub fn predict_range(&self, user_id: usize, items: Range<usize>, out: &mut [f32]) -> Result<(), ScorerError> {
        let (user, bias_user) = self.user(user_id)?;
        check_range(&items, self.num_items())?;
        let vectors = &self.items[items.start * self.dim..items.end * self.dim];
        predict_dense_with(user, vectors, bias_user, &self.item_biases[items], out, &self.options)?;
        Ok(())
    }

    /// Scores for `item_ids`, in the order given.
    pub fn predict_items(&self, user_id: usize, item_ids: &[usize]) -> Result<Vec<f32>, ScorerError> {
        let (user, bias_user) = self.user(user_id)?;
        check_item_ids(item_ids, self.num_items())?;

        let mut vectors = AlignedVec::<f32>::zeroed(item_ids.len() * self.dim);
        for (dst, &id) in vectors.chunks_exact_mut(self.dim).zip(item_ids) {
            dst.copy_from_slice(&self.items[id * self.dim..(id + 1) * self.dim]);
        }
        let biases: Vec<f32> = item_ids.iter().map(|&id| self.item_biases[id]).collect();

        let mut out = vec![0.0; item_ids.len()];
        predict_dense_with(user, &vectors, bias_user, &biases, &mut out, &self.options)?;
        Ok(out)
    }

    /// Bytes held by the model parameters.
    pub fn memory_bytes(&self) -> usize {
        self.users.size_in_bytes()
            + f32_bytes(&self.user_biases)
            + self.items.size_in_bytes()
            + self.item_biases.size_in_bytes()
    }

    fn user(&self, user_id: usize) -> Result<(&[f32], f32), ScorerError> {
        match self.users.row(user_id) {
            Some(row) => Ok((row, self.user_biases[user_id])),
            None => Err(ScorerError::UnknownUser {
                user_id,
                num_users: self.num_users(),
            }),
        }
    }
}

// ============================================================================
// Binary
// ============================================================================

/// Scores with sign-binarized latent vectors scaled by per-row mean absolute
/// values.
#[derive(Debug, Clone)]
pub struct BinaryScorer {
    users: RowTable<u32>,
    user_biases: Vec<f32>,
    user_norms: Vec<f32>,
    items: PackedMatrix,
    item_biases: AlignedVec<f32>,
    item_norms: AlignedVec<f32>,
    dim: usize,
    options: KernelOptions,
}

impl BinaryScorer {
    /// Binarize row-major `user_vectors` and `item_vectors` of width `dim`.
    /// `dim` must be a multiple of 32.
    pub fn new(
        user_vectors: &[f32],
        user_biases: &[f32],
        item_vectors: &[f32],
        item_biases: &[f32],
        dim: usize,
    ) -> Result<Self, ScorerError> {
        let num_users = check_shape("user", user_vectors.len(), user_biases.len(), dim)?;
        let num_items = check_shape("item", item_vectors.len(), item_biases.len(), dim)?;

        let packed_users = binarize(user_vectors, dim)?;
        let items = binarize(item_vectors, dim)?;
        let user_norms = abs_mean_norms(user_vectors, dim)?;
        let item_norms = abs_mean_norms(item_vectors, dim)?;

        debug!(
            "Building binary scorer: {} users, {} items, dimension {} ({} words per vector)",
            num_users,
            num_items,
            dim,
            items.words_per_row()
        );

        Ok(Self {
            users: RowTable::from_rows(packed_users.as_slice(), packed_users.words_per_row()),
            user_biases: user_biases.to_vec(),
            user_norms,
            items,
            item_biases: AlignedVec::from_slice(item_biases),
            item_norms: AlignedVec::from(item_norms),
            dim,
            options: KernelOptions::default(),
        })
    }

    pub fn with_options(mut self, options: KernelOptions) -> Self {
        self.options = options;
        self
    }

    pub fn options(&self) -> &KernelOptions {
        &self.options
    }

    pub fn num_users(&self) -> usize {
        self.users.rows
    }

    pub fn num_items(&self) -> usize {
        self.items.rows()
    }

    pub fn dimension(&self) -> usize {
        self.dim
    }

    /// Packed words per vector.
    pub fn words_per_vector(&self) -> usize {
        self.items.words_per_row()
    }

    pub fn user_norm(&self, user_id: usize) -> Option<f32> {
        self.user_norms.get(user_id).copied()
    }

    pub fn item_norms(&self) -> &[f32] {
        &self.item_norms
    }

    /// Packed sign words of one user.
    pub fn user_signs(&self, user_id: usize) -> Option<&[u32]> {
        self.users.row(user_id)
    }

    /// Packed sign words of one item.
    pub fn item_signs(&self, item_id: usize) -> Option<&[u32]> {
        self.items.row(item_id)
    }

    pub fn predict(&self, user_id: usize) -> Result<Vec<f32>, ScorerError> {
        let mut out = vec![0.0; self.num_items()];
        self.predict_into(user_id, &mut out)?;
        Ok(out)
    }

    pub fn predict_into(&self, user_id: usize, out: &mut [f32]) -> Result<(), ScorerError> {
        let (user, bias_user, norm_user) = self.user(user_id)?;
        predict_binary_with(
            user,
            self.items.as_slice(),
            bias_user,
            &self.item_biases,
            norm_user,
            &self.item_norms,
            out,
            &self.options,
        )?;
        Ok(())
    }

    /// Scores for the contiguous item range `items`, written into `out`.
    ///
    /// Any start is accepted, as for [`DenseScorer::predict_range`].
    pub fn predict_range(&self, user_id: usize, items: Range<usize>, out: &mut [f32]) -> Result<(), ScorerError> {
        let (user, bias_user, norm_user) = self.user(user_id)?;
        check_range(&items, self.num_items())?;
        let words = self.words_per_vector();
        let vectors = &self.items.as_slice()[items.start * words..items.end * words];
        predict_binary_with(
            user,
            vectors,
            bias_user,
            &self.item_biases[items.clone()],
            norm_user,
            &self.item_norms[items],
            out,
            &self.options,
        )?;
        Ok(())
    }

    pub fn predict_items(&self, user_id: usize, item_ids: &[usize]) -> Result<Vec<f32>, ScorerError> {
        let (user, bias_user, norm_user) = self.user(user_id)?;
        check_item_ids(item_ids, self.num_items())?;

        let words = self.words_per_vector();
        let mut vectors = AlignedVec::<u32>::zeroed(item_ids.len() * words);
        let mut biases = Vec::with_capacity(item_ids.len());
        let mut norms = Vec::with_capacity(item_ids.len());
        for (dst, &id) in vectors.chunks_exact_mut(words).zip(item_ids) {
            if let Some(row) = self.items.row(id) {
                dst.copy_from_slice(row);
            }
            biases.push(self.item_biases[id]);
            norms.push(self.item_norms[id]);
        }

        let mut out = vec![0.0; item_ids.len()];
        predict_binary_with(user, &vectors, bias_user, &biases, norm_user, &norms, &mut out, &self.options)?;
        Ok(out)
    }

    pub fn memory_bytes(&self) -> usize {
        self.users.size_in_bytes()
            + f32_bytes(&self.user_biases)
            + f32_bytes(&self.user_norms)
            + self.items.size_in_bytes()
            + self.item_biases.size_in_bytes()
            + self.item_norms.size_in_bytes()
    }

    fn user(&self, user_id: usize) -> Result<(&[u32], f32, f32), ScorerError> {
        match self.users.row(user_id) {
            Some(row) => Ok((row, self.user_biases[user_id], self.user_norms[user_id])),
            None => Err(ScorerError::UnknownUser {
                user_id,
                num_users: self.num_users(),
            }),
        }
    }
}
