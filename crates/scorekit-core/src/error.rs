//! Error types shared by the kernels and the scorers built on top of them.

/// Contract violations detected at the kernel boundary.
///
/// Every variant is raised before the output slice is touched, so a failed
/// call never leaves partially written scores behind.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KernelError {
    #[error("latent dimension must be at least 1")]
    ZeroLatentDim,
    #[error("length mismatch for {what}: expected {expected}, got {actual}")]
    LengthMismatch {
        what: &'static str,
        expected: usize,
        actual: usize,
    },
    #[error("{what} is not 32-byte aligned (address offset {offset})")]
    Misaligned { what: &'static str, offset: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BinarizeError {
    #[error("embedding dimension {0} is not a non-zero multiple of 32")]
    InvalidDimension(usize),
    #[error("embedding buffer of {len} values is not divisible into rows of {dim}")]
    RaggedRows { len: usize, dim: usize },
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ScorerError {
    #[error(transparent)]
    Kernel(#[from] KernelError),
    #[error(transparent)]
    Binarize(#[from] BinarizeError),
    #[error("unknown user id {user_id} (model has {num_users} users)")]
    UnknownUser { user_id: usize, num_users: usize },
    #[error("unknown item id {item_id} (model has {num_items} items)")]
    UnknownItem { item_id: usize, num_items: usize },
    #[error("invalid dimensions: {0}")]
    InvalidDimensions(String),
}
