//! One-pass loops over a [`DataLoader`]: training, evaluation, prediction
//! collection and batch-norm recalibration.
//!
//! Every loop takes the compute device explicitly and fails fast with
//! [`HarnessError::DeviceMismatch`] when the model lives elsewhere. Batches
//! are moved onto that device before the forward pass. Metrics are
//! normalised by the dataset size, so empty datasets are rejected with
//! [`HarnessError::EmptyDataset`].

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use candle_nn::{ops, Optimizer};
use serde::{Deserialize, Serialize};

use curve_common::{place_batch, DataLoader, LabeledDataset};
use curve_core::{BnId, Model};

use crate::error::HarnessError;
use crate::loss::Criterion;
use crate::optim::adjust_learning_rate;
use crate::regularizer::Regularizer;
use crate::scheduler::LrSchedule;

// ── Metrics ─────────────────────────────────────────────────────────────────

/// Result of one training pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TrainMetrics {
    /// Mean regularised loss per sample.
    pub loss: f64,
    /// Percentage of correctly classified samples.
    pub accuracy: f64,
}

/// Result of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EvalMetrics {
    /// Mean task loss per sample.
    pub nll: f64,
    /// `nll` plus the regularisation penalty.
    pub loss: f64,
    pub accuracy: f64,
}

// ── Guards ──────────────────────────────────────────────────────────────────

fn check_device(model: &dyn Model, device: &Device) -> Result<(), HarnessError> {
    if model.device().same_device(device) {
        Ok(())
    } else {
        Err(HarnessError::DeviceMismatch {
            expected: format!("{:?}", device.location()),
            found: format!("{:?}", model.device().location()),
        })
    }
}

fn check_non_empty<D: LabeledDataset + ?Sized>(
    loader: &DataLoader<'_, D>,
    what: &'static str,
) -> Result<usize, HarnessError> {
    match loader.num_samples() {
        0 => Err(HarnessError::EmptyDataset(what)),
        n => Ok(n),
    }
}

/// Number of rows whose arg-max equals the target class.
fn count_correct(output: &Tensor, targets: &Tensor) -> candle_core::Result<usize> {
    let pred = output.argmax(1)?;
    let hits = pred
        .eq(&targets.to_dtype(DType::U32)?)?
        .to_dtype(DType::F32)?
        .sum_all()?
        .to_scalar::<f32>()?;
    Ok(hits as usize)
}

// ── Train ───────────────────────────────────────────────────────────────────

/// One full training pass.
///
/// When `lr_schedule` is given, batch `i` of `num_batches` first sets the
/// optimizer rate to `lr_schedule(i / num_batches)`. The loss of each batch is
/// `criterion(output, target)` plus the regulariser penalty, if any. Curve
/// models sample a fresh curve position per batch.
pub fn train<D, O, C>(
    loader: &DataLoader<'_, D>,
    model: &mut dyn Model,
    optimizer: &mut O,
    criterion: &C,
    regularizer: Option<&dyn Regularizer>,
    lr_schedule: Option<&dyn LrSchedule>,
    device: &Device,
) -> Result<TrainMetrics>
where
    D: LabeledDataset + ?Sized,
    O: Optimizer,
    C: Criterion + ?Sized,
{
    check_device(model, device)?;
    let n = check_non_empty(loader, "train")?;
    let num_batches = loader.num_batches();

    model.set_training(true);
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;

    for (i, batch) in loader.iter().enumerate() {
        if let Some(schedule) = lr_schedule {
            let lr = schedule.lr_at(i as f64 / num_batches as f64);
            adjust_learning_rate(optimizer, lr);
        }
        let (inputs, targets) = batch?;
        let (inputs, targets) = place_batch(&inputs, &targets, device)?;
        let b = inputs.dim(0)?;

        let output = model.forward(&inputs, None)?;
        let mut loss = criterion.loss(&output, &targets)?;
        if let Some(reg) = regularizer {
            loss = (loss + reg.penalty(&*model)?)?;
        }
        optimizer.backward_step(&loss)?;

        let batch_loss = loss.to_dtype(DType::F64)?.to_scalar::<f64>()?;
        loss_sum += batch_loss * b as f64;
        correct += count_correct(&output, &targets)?;
        tracing::trace!(batch = i, size = b, loss = batch_loss, "train batch");
    }

    let metrics = TrainMetrics {
        loss: loss_sum / n as f64,
        accuracy: 100.0 * correct as f64 / n as f64,
    };
    tracing::debug!(loss = metrics.loss, accuracy = metrics.accuracy, samples = n, "train pass");
    Ok(metrics)
}

// ── Test ────────────────────────────────────────────────────────────────────

/// One evaluation pass at curve position `t` (ignored by plain models).
///
/// Parameters are not updated and outputs are detached from the graph.
pub fn test<D, C>(
    loader: &DataLoader<'_, D>,
    model: &mut dyn Model,
    criterion: &C,
    regularizer: Option<&dyn Regularizer>,
    t: Option<f64>,
    device: &Device,
) -> Result<EvalMetrics>
where
    D: LabeledDataset + ?Sized,
    C: Criterion + ?Sized,
{
    check_device(model, device)?;
    let n = check_non_empty(loader, "test")?;

    model.set_training(false);
    let mut nll_sum = 0.0f64;
    let mut loss_sum = 0.0f64;
    let mut correct = 0usize;

    for batch in loader.iter() {
        let (inputs, targets) = batch?;
        let (inputs, targets) = place_batch(&inputs, &targets, device)?;
        let b = inputs.dim(0)? as f64;

        let output = model.forward(&inputs, t)?.detach();
        let nll = criterion.loss(&output, &targets)?.detach();
        let loss = match regularizer {
            Some(reg) => (&nll + reg.penalty(&*model)?.detach())?,
            None => nll.clone(),
        };

        nll_sum += nll.to_dtype(DType::F64)?.to_scalar::<f64>()? * b;
        loss_sum += loss.to_dtype(DType::F64)?.to_scalar::<f64>()? * b;
        correct += count_correct(&output, &targets)?;
    }

    let metrics = EvalMetrics {
        nll: nll_sum / n as f64,
        loss: loss_sum / n as f64,
        accuracy: 100.0 * correct as f64 / n as f64,
    };
    tracing::debug!(
        nll = metrics.nll,
        loss = metrics.loss,
        accuracy = metrics.accuracy,
        samples = n,
        "eval pass"
    );
    Ok(metrics)
}

// ── Predictions ─────────────────────────────────────────────────────────────

/// Class probabilities (row softmax) and targets for every sample, in
/// loader order.
pub fn predictions<D>(
    loader: &DataLoader<'_, D>,
    model: &mut dyn Model,
    t: Option<f64>,
    device: &Device,
) -> Result<(Vec<Vec<f32>>, Vec<u32>)>
where
    D: LabeledDataset + ?Sized,
{
    check_device(model, device)?;
    check_non_empty(loader, "predictions")?;

    model.set_training(false);
    let mut probs = Vec::with_capacity(loader.num_samples());
    let mut targets = Vec::with_capacity(loader.num_samples());
    for batch in loader.iter() {
        let (inputs, batch_targets) = batch?;
        let (inputs, batch_targets) = place_batch(&inputs, &batch_targets, device)?;
        let output = model.forward(&inputs, t)?.detach();
        let p = ops::softmax(&output.to_dtype(DType::F32)?, 1)?;
        probs.extend(p.to_vec2::<f32>()?);
        targets.extend(batch_targets.to_dtype(DType::U32)?.to_vec1::<u32>()?);
    }
    Ok((probs, targets))
}

// ── BN recalibration ────────────────────────────────────────────────────────

/// Original momentum of every batch-norm layer, keyed by [`BnId`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MomentaSnapshot {
    momenta: BTreeMap<BnId, f64>,
}

impl MomentaSnapshot {
    pub fn capture(model: &dyn Model) -> Self {
        let mut momenta = BTreeMap::new();
        model.visit_batch_norms(&mut |bn| {
            momenta.insert(bn.id(), bn.momentum());
        });
        Self { momenta }
    }

    pub fn get(&self, id: BnId) -> Option<f64> {
        self.momenta.get(&id).copied()
    }

    pub fn len(&self) -> usize {
        self.momenta.len()
    }

    pub fn is_empty(&self) -> bool {
        self.momenta.is_empty()
    }

    /// Put every momentum back. Nothing is written unless the snapshot
    /// covers every batch-norm layer of `model`.
    pub fn restore(self, model: &mut dyn Model) -> Result<()> {
        let mut missing = None;
        model.visit_batch_norms(&mut |bn| {
            if missing.is_none() && !self.momenta.contains_key(&bn.id()) {
                missing = Some(bn.id());
            }
        });
        if let Some(id) = missing {
            return Err(HarnessError::MissingMomentum(id).into());
        }
        model.visit_batch_norms_mut(&mut |bn| {
            if let Some(&m) = self.momenta.get(&bn.id()) {
                bn.set_momentum(m);
            }
            Ok(())
        })?;
        Ok(())
    }
}

/// Re-estimate batch-norm running statistics at curve position `t`.
///
/// Statistics are reset and the loader is replayed once in training mode
/// with momentum `b / (n + b)` for a batch of `b` samples after `n` seen, a
/// cumulative average rather than an exponential one. Original momenta are
/// restored afterwards, also when the replay fails. A model without
/// batch-norm layers is left untouched.
pub fn update_bn<D>(
    loader: &DataLoader<'_, D>,
    model: &mut dyn Model,
    t: Option<f64>,
    device: &Device,
) -> Result<()>
where
    D: LabeledDataset + ?Sized,
{
    if !model.has_batch_norm() {
        return Ok(());
    }
    check_device(model, device)?;
    if loader.num_samples() == 0 {
        tracing::warn!("update_bn on an empty loader; running statistics stay at their reset state");
    }

    model.set_training(true);
    model.visit_batch_norms_mut(&mut |bn| bn.reset_running_stats())?;
    let snapshot = MomentaSnapshot::capture(model);

    let replay = replay_cumulative(loader, model, t, device);
    snapshot.restore(model)?;
    let seen = replay?;
    tracing::debug!(samples = seen, "batch-norm statistics recalibrated");
    Ok(())
}

fn replay_cumulative<D>(
    loader: &DataLoader<'_, D>,
    model: &mut dyn Model,
    t: Option<f64>,
    device: &Device,
) -> Result<usize>
where
    D: LabeledDataset + ?Sized,
{
    let mut num_samples = 0usize;
    for batch in loader.iter() {
        let (inputs, _) = batch?;
        let inputs = inputs.to_device(device)?.detach();
        let b = inputs.dim(0)?;
        let momentum = b as f64 / (num_samples + b) as f64;
        model.visit_batch_norms_mut(&mut |bn| {
            bn.set_momentum(momentum);
            Ok(())
        })?;
        model.forward(&inputs, t)?;
        num_samples += b;
    }
    Ok(num_samples)
}

// ── Tests ───────────────────────────────────────────────────────────────────
