pub mod aligned;
pub mod binarize;
pub mod binary;
pub mod config;
mod contract;
pub mod cpu;
pub mod dense;
pub mod error;
pub mod eval;
pub mod popcount;
pub mod scorer;

pub use aligned::AlignedVec;
pub use config::{AlignmentPolicy, Config, KernelOptions};
pub use cpu::{capabilities, Capabilities};
pub use error::{BinarizeError, KernelError, ScorerError};
pub use scorer::{BinaryScorer, DenseScorer, Predict};
