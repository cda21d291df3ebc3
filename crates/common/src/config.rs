//! Model configuration for curve experiments.
//!
//! Serialised as JSON next to checkpoints so a curve can be rebuilt for
//! evaluation. Every optional field has a `#[serde(default)]` so a minimal
//! `{"input_dim": .., "num_classes": ..}` still loads.

use serde::{Deserialize, Serialize};

/// How the bends of a curve are blended into a single parameter set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CurveKind {
    /// Bernstein-polynomial blend of all bends.
    Bezier,
    /// Piecewise-linear path through consecutive bends.
    PolyChain,
}

impl std::str::FromStr for CurveKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "bezier" => Ok(Self::Bezier),
            "polychain" => Ok(Self::PolyChain),
            _ => anyhow::bail!("unknown curve kind {s:?} (expected bezier or polychain)"),
        }
    }
}

/// Configuration for the multi-layer perceptron (plain or curve).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    // ── Dimensions ──────────────────────────────────────────────────────────
    /// Number of input features per sample.
    pub input_dim: usize,
    /// Widths of the hidden layers.
    #[serde(default = "default_hidden_dims")]
    pub hidden_dims: Vec<usize>,
    /// Number of output classes.
    pub num_classes: usize,

    // ── Batch normalisation ─────────────────────────────────────────────────
    /// Insert a batch-norm layer after every hidden linear layer.
    #[serde(default = "default_true")]
    pub batch_norm: bool,
    /// Momentum used for running statistics during ordinary training.
    #[serde(default = "default_bn_momentum")]
    pub bn_momentum: f64,
    #[serde(default = "default_bn_eps")]
    pub bn_eps: f64,

    // ── Curve ───────────────────────────────────────────────────────────────
    /// `None` builds a single (endpoint) network.
    #[serde(default)]
    pub curve: Option<CurveKind>,
    /// Number of bends including both endpoints.
    #[serde(default = "default_num_bends")]
    pub num_bends: usize,
    /// Keep the first bend frozen during curve training.
    #[serde(default = "default_true")]
    pub fix_start: bool,
    /// Keep the last bend frozen during curve training.
    #[serde(default = "default_true")]
    pub fix_end: bool,
}

fn default_hidden_dims() -> Vec<usize> {
    vec![64, 64]
}
fn default_true() -> bool {
    true
}
fn default_bn_momentum() -> f64 {
    0.1
}
fn default_bn_eps() -> f64 {
    1e-5
}
fn default_num_bends() -> usize {
    3
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            input_dim: 2,
            hidden_dims: default_hidden_dims(),
            num_classes: 2,
            batch_norm: true,
            bn_momentum: 0.1,
            bn_eps: 1e-5,
            curve: None,
            num_bends: 3,
            fix_start: true,
            fix_end: true,
        }
    }
}

impl ModelConfig {
    /// Reject configurations that cannot build a model.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.input_dim == 0 {
            anyhow::bail!("input_dim must be positive");
        }
        if self.num_classes < 2 {
            anyhow::bail!("num_classes must be at least 2, got {}", self.num_classes);
        }
        if self.hidden_dims.iter().any(|&d| d == 0) {
            anyhow::bail!("hidden_dims must all be positive: {:?}", self.hidden_dims);
        }
        if !(0.0..=1.0).contains(&self.bn_momentum) {
            anyhow::bail!("bn_momentum must lie in [0, 1], got {}", self.bn_momentum);
        }
        if self.curve.is_some() && self.num_bends < 2 {
            anyhow::bail!("a curve needs at least 2 bends, got {}", self.num_bends);
        }
        Ok(())
    }

    /// The same architecture without the curve (used for endpoints).
    pub fn endpoint(&self) -> Self {
        Self {
            curve: None,
            ..self.clone()
        }
    }

    /// Save config to a JSON file.
    pub fn save(&self, path: &std::path::Path) -> anyhow::Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json)?;
        Ok(())
    }

    /// Load config from a JSON file.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
