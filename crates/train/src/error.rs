//! Errors the harness detects itself. Everything else (shape mismatches,
//! I/O, backend failures) propagates from candle unchanged.

use curve_core::BnId;

#[derive(Debug, thiserror::Error)]
pub enum HarnessError {
    /// Metrics are normalised by the dataset size, so an empty dataset is rejected.
    #[error("dataset is empty: {0} needs at least one sample")]
    EmptyDataset(&'static str),

    #[error("model lives on {found} but the loop was configured for {expected}")]
    DeviceMismatch { expected: String, found: String },

    #[error("cyclic learning rate needs a cycle of at least one epoch")]
    InvalidCycle,

    #[error("momenta snapshot has no entry for batch-norm layer {0}")]
    MissingMomentum(BnId),
}
