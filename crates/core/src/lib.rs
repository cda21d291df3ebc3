//! # curve-core — Layers and Models
//!
//! The network side of curve training:
//!
//! | Module | Contents |
//! |--------|----------|
//! | [`curves`] | Bezier / PolyChain coefficients, bend blending |
//! | [`linear`] | `CurveLinear` (one weight pair per bend) |
//! | [`norm`] | `BatchNorm`, `CurveBatchNorm`, the `BatchNormLayer` capability, `BnId` |
//! | [`model`] | the `Model` trait, `Mlp`, `CurveMlp` |
//!
//! ## Design principles
//!
//! 1. **Pure Rust hot path.** Everything goes through `candle-core`/`candle-nn`.
//! 2. **Closed set of batch norms.** The harness recognises exactly the
//!    variants in [`BatchNormKind`] and reaches them through
//!    [`Model::visit_batch_norms_mut`], never by downcasting.
//! 3. **Stable identity.** Every batch-norm layer gets a [`BnId`] at
//!    construction, so per-layer state can be keyed without pointer identity.

pub mod curves;
pub mod linear;
pub mod model;
pub mod norm;

// ── Public re-exports ───────────────────────────────────────────────────────

pub use curves::{blend, curve_coefficients};
pub use linear::CurveLinear;
pub use model::{build_model, CurveMlp, Mlp, Model};
pub use norm::{BatchNorm, BatchNormKind, BatchNormLayer, BnId, BnIdAllocator, CurveBatchNorm};
