//! # curve-train — Loops, Schedules and Recalibration
//!
//! Everything that drives a [`curve_core::Model`] through data:
//!
//! * **[`train`]** / **[`test`]** / **[`predictions`]** — one pass over a
//!   loader, on an explicit device.
//! * **[`update_bn`]** — rebuild batch-norm running statistics with a
//!   cumulative average (after moving to a new curve position).
//! * **[`cyclic_learning_rate`]**, **[`learning_rate_schedule`]** — rate schedules;
//!   **[`adjust_learning_rate`]** applies a rate to every parameter group.
//! * **[`l2_regularizer`]** — sum-of-norms parameter penalty.
//! * **[`save_checkpoint`]** / **[`load_checkpoint`]** — safetensors checkpoints.
//! * **[`evaluate_curve`]** — sweep a curve; **[`FgeEnsemble`]** — snapshot ensembles.
//! * **[`Trainer`]** — epoch loop with rate policy, evaluation and checkpoints.

pub mod checkpoint;
pub mod curve_eval;
pub mod error;
pub mod fge;
pub mod harness;
pub mod loss;
pub mod optim;
pub mod regularizer;
pub mod scheduler;
pub mod trainer;

pub use checkpoint::{checkpoint_path, load_checkpoint, save_checkpoint, Checkpoint, CheckpointPayload};
pub use curve_eval::{evaluate_curve, CurveEvaluation, CurvePoint, CurveSummary};
pub use error::HarnessError;
pub use fge::{is_snapshot_epoch, EnsembleReport, FgeEnsemble};
pub use harness::{predictions, test, train, update_bn, EvalMetrics, MomentaSnapshot, TrainMetrics};
pub use loss::{Criterion, CrossEntropy};
pub use optim::{adjust_learning_rate, ParamGroup, ParamsSgd, Sgd};
pub use regularizer::{l2_regularizer, L2Regularizer, Regularizer};
pub use scheduler::{cyclic_learning_rate, learning_rate_schedule, CyclicLr, LrSchedule};
pub use trainer::{EpochReport, LrPolicy, Trainer, TrainerConfig};
