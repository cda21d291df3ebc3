//! Task losses.

use candle_core::{DType, Result, Tensor};
use candle_nn::{loss, ops};

/// `(output, target) → scalar loss`, differentiable in `output`.
pub trait Criterion {
    fn loss(&self, output: &Tensor, target: &Tensor) -> Result<Tensor>;
}

impl<F> Criterion for F
where
    F: Fn(&Tensor, &Tensor) -> Result<Tensor>,
{
    fn loss(&self, output: &Tensor, target: &Tensor) -> Result<Tensor> {
        self(output, target)
    }
}

/// Mean cross-entropy over the batch, optionally with label smoothing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CrossEntropy {
    pub label_smoothing: f64,
}

impl CrossEntropy {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_label_smoothing(label_smoothing: f64) -> Self {
        Self { label_smoothing }
    }
}

impl Criterion for CrossEntropy {
    fn loss(&self, output: &Tensor, target: &Tensor) -> Result<Tensor> {
        cross_entropy_with_label_smoothing(output, target, self.label_smoothing)
    }
}

/// `(1 - s) · nll + s · mean_i(-Σ_c log p_ic / C)`.
fn cross_entropy_with_label_smoothing(
    logits: &Tensor,
    labels: &Tensor,
    smoothing: f64,
) -> Result<Tensor> {
    let labels = labels.to_dtype(DType::U32)?;
    if smoothing <= 0.0 {
        return loss::cross_entropy(logits, &labels);
    }
    let classes = logits.dim(1)? as f64;
    let log_probs = ops::log_softmax(logits, 1)?;
    let nll = loss::nll(&log_probs, &labels)?;
    let uniform = log_probs.sum(1)?.neg()?.mean_all()?;
    nll.affine(1.0 - smoothing, 0.0)? + uniform.affine(smoothing / classes, 0.0)?
}

// ── Tests ───────────────────────────────────────────────────────────────────
