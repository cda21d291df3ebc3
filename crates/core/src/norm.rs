//! Batch-normalisation layers.
//!
//! Two variants share one capability:
//!
//! * [`BatchNorm`] — ordinary affine batch norm.
//! * [`CurveBatchNorm`] — one affine pair per bend, blended at the curve
//!   position; running statistics are shared by the whole curve.
//!
//! Both implement [`BatchNormLayer`] and report a [`BatchNormKind`], which is
//! how the harness finds them. Each layer carries a [`BnId`] handed out by a
//! [`BnIdAllocator`] while the owning model is built.
//!
//! # Running statistics
//!
//! In training mode every forward pass updates
//! `running = (1 - momentum) · running + momentum · batch_stat`, using the
//! unbiased batch variance. Normalisation uses the biased batch variance in
//! training mode and the running statistics in evaluation mode.

use std::sync::atomic::{AtomicUsize, Ordering};

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{Init, VarBuilder};

use crate::curves::blend;

// ── Identity and capability ─────────────────────────────────────────────────

/// Stable index of a batch-norm layer inside its model.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BnId(pub usize);

impl std::fmt::Display for BnId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bn#{}", self.0)
    }
}

/// Hands out consecutive [`BnId`]s during model construction.
#[derive(Debug, Default)]
pub struct BnIdAllocator {
    next: usize,
}

impl BnIdAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocate(&mut self) -> BnId {
        let id = BnId(self.next);
        self.next += 1;
        id
    }

    /// Number of ids handed out so far.
    pub fn count(&self) -> usize {
        self.next
    }
}

/// The closed set of batch-norm variants the harness recognises.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BatchNormKind {
    Standard,
    Curve,
}

/// What the recalibration engine needs from a batch-norm layer.
pub trait BatchNormLayer {
    fn id(&self) -> BnId;
    fn kind(&self) -> BatchNormKind;
    fn num_features(&self) -> usize;
    fn momentum(&self) -> f64;
    fn set_momentum(&mut self, momentum: f64);
    /// Back to the untrained state: mean 0, variance 1, no batches tracked.
    fn reset_running_stats(&mut self) -> Result<()>;
    fn running_mean(&self) -> &Tensor;
    fn running_var(&self) -> &Tensor;
    fn num_batches_tracked(&self) -> usize;
}

// ── Shared running statistics ───────────────────────────────────────────────

struct RunningStats {
    mean: Var,
    var: Var,
    num_batches_tracked: AtomicUsize,
}

impl RunningStats {
    fn new(num_features: usize, device: &Device) -> Result<Self> {
        Ok(Self {
            mean: Var::zeros(num_features, DType::F32, device)?,
            var: Var::ones(num_features, DType::F32, device)?,
            num_batches_tracked: AtomicUsize::new(0),
        })
    }

    fn reset(&self) -> Result<()> {
        self.mean.set(&self.mean.zeros_like()?)?;
        self.var.set(&self.var.ones_like()?)?;
        self.num_batches_tracked.store(0, Ordering::Relaxed);
        Ok(())
    }

    fn update(&self, batch_mean: &Tensor, batch_var: &Tensor, momentum: f64) -> Result<()> {
        let mean = (self.mean.affine(1.0 - momentum, 0.0)? + batch_mean.affine(momentum, 0.0)?)?;
        let var = (self.var.affine(1.0 - momentum, 0.0)? + batch_var.affine(momentum, 0.0)?)?;
        self.mean.set(&mean)?;
        self.var.set(&var)?;
        self.num_batches_tracked.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn load(&self, mean: &Tensor, var: &Tensor) -> Result<()> {
        self.mean.set(&mean.to_device(self.mean.device())?)?;
        self.var.set(&var.to_device(self.var.device())?)?;
        Ok(())
    }
}

/// Normalise `x` of shape `(N, C, ..)` over every dimension except `C`.
fn batch_norm(
    x: &Tensor,
    stats: &RunningStats,
    weight: &Tensor,
    bias: &Tensor,
    eps: f64,
    momentum: f64,
    training: bool,
) -> Result<Tensor> {
    let c = stats.mean.dim(0)?;
    let rank = x.rank();
    if rank < 2 || x.dim(1)? != c {
        candle_core::bail!("batch norm expects (N, {c}, ..) input, got {:?}", x.shape());
    }
    let mut bshape = vec![1usize; rank];
    bshape[1] = c;

    let (mean, var) = if training {
        // (C, N·rest) view so every channel reduces along dim 1.
        let flat = x.transpose(0, 1)?.contiguous()?.flatten_from(1)?;
        let m = flat.dim(1)?;
        if m < 2 {
            candle_core::bail!("batch norm needs more than one value per channel in training mode");
        }
        let mean = flat.mean_keepdim(1)?;
        let biased = flat.broadcast_sub(&mean)?.sqr()?.mean_keepdim(1)?;
        let unbiased = biased.affine(m as f64 / (m as f64 - 1.0), 0.0)?;
        stats.update(
            &mean.detach().flatten_all()?,
            &unbiased.detach().flatten_all()?,
            momentum,
        )?;
        (mean.flatten_all()?, biased.flatten_all()?)
    } else {
        (stats.mean.as_tensor().clone(), stats.var.as_tensor().clone())
    };

    let mean = mean.reshape(bshape.clone())?;
    let std = var.affine(1.0, eps)?.sqrt()?.reshape(bshape.clone())?;
    let x_hat = x.broadcast_sub(&mean)?.broadcast_div(&std)?;
    x_hat
        .broadcast_mul(&weight.reshape(bshape.clone())?)?
        .broadcast_add(&bias.reshape(bshape)?)
}

// ── BatchNorm ───────────────────────────────────────────────────────────────

pub struct BatchNorm {
    id: BnId,
    name: String,
    weight: Tensor,
    bias: Tensor,
    stats: RunningStats,
    eps: f64,
    momentum: f64,
}

impl BatchNorm {
    /// `vb` should be scoped to the layer prefix (e.g. `vb.pp("bn0")`) and
    /// `name` should be that prefix; it keys the running statistics in the
    /// model's state dict.
    pub fn new(
        num_features: usize,
        eps: f64,
        momentum: f64,
        id: BnId,
        name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let weight = vb.get_with_hints(num_features, "weight", Init::Const(1.0))?;
        let bias = vb.get_with_hints(num_features, "bias", Init::Const(0.0))?;
        let stats = RunningStats::new(num_features, vb.device())?;
        Ok(Self {
            id,
            name: name.to_string(),
            weight,
            bias,
            stats,
            eps,
            momentum,
        })
    }

    pub fn forward_t(&self, x: &Tensor, training: bool) -> Result<Tensor> {
        batch_norm(
            x,
            &self.stats,
            &self.weight,
            &self.bias,
            self.eps,
            self.momentum,
            training,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// `(name.running_mean, name.running_var)` entries for a state dict.
    /// Copies of the running statistics, keyed `{name}.running_mean|var`.
    pub fn buffers(&self) -> Result<[(String, Tensor); 2]> {
        buffers(&self.name, &self.stats)
    }

    pub fn load_buffers(&self, state: &std::collections::HashMap<String, Tensor>) -> Result<()> {
        load_buffers(&self.name, &self.stats, state)
    }
}

impl BatchNormLayer for BatchNorm {
    fn id(&self) -> BnId {
        self.id
    }
    fn kind(&self) -> BatchNormKind {
        BatchNormKind::Standard
    }
    fn num_features(&self) -> usize {
        self.weight.elem_count()
    }
    fn momentum(&self) -> f64 {
        self.momentum
    }
    fn set_momentum(&mut self, momentum: f64) {
        self.momentum = momentum;
    }
    fn reset_running_stats(&mut self) -> Result<()> {
        self.stats.reset()
    }
    fn running_mean(&self) -> &Tensor {
        self.stats.mean.as_tensor()
    }
    fn running_var(&self) -> &Tensor {
        self.stats.var.as_tensor()
    }
    fn num_batches_tracked(&self) -> usize {
        self.stats.num_batches_tracked.load(Ordering::Relaxed)
    }
}

// ── CurveBatchNorm ──────────────────────────────────────────────────────────

/// Batch norm whose affine parameters live on a curve.
///
/// Parameters are stored as `weight_{j}` / `bias_{j}` for each bend `j`.
pub struct CurveBatchNorm {
    id: BnId,
    name: String,
    weights: Vec<Tensor>,
    biases: Vec<Tensor>,
    stats: RunningStats,
    eps: f64,
    momentum: f64,
}

impl CurveBatchNorm {
    pub fn new(
        num_features: usize,
        num_bends: usize,
        eps: f64,
        momentum: f64,
        id: BnId,
        name: &str,
        vb: VarBuilder,
    ) -> Result<Self> {
        let mut weights = Vec::with_capacity(num_bends);
        let mut biases = Vec::with_capacity(num_bends);
        for j in 0..num_bends {
            weights.push(vb.get_with_hints(num_features, &format!("weight_{j}"), Init::Const(1.0))?);
            biases.push(vb.get_with_hints(num_features, &format!("bias_{j}"), Init::Const(0.0))?);
        }
        let stats = RunningStats::new(num_features, vb.device())?;
        Ok(Self {
            id,
            name: name.to_string(),
            weights,
            biases,
            stats,
            eps,
            momentum,
        })
    }

    /// Forward at the curve point described by `coeffs` (one per bend).
    pub fn forward_t(&self, x: &Tensor, coeffs: &[f64], training: bool) -> Result<Tensor> {
        let weight = blend(&self.weights, coeffs)?;
        let bias = blend(&self.biases, coeffs)?;
        batch_norm(
            x,
            &self.stats,
            &weight,
            &bias,
            self.eps,
            self.momentum,
            training,
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Copies of the running statistics, keyed `{name}.running_mean|var`.
    pub fn buffers(&self) -> Result<[(String, Tensor); 2]> {
        buffers(&self.name, &self.stats)
    }

    pub fn load_buffers(&self, state: &std::collections::HashMap<String, Tensor>) -> Result<()> {
        load_buffers(&self.name, &self.stats, state)
    }
}

impl BatchNormLayer for CurveBatchNorm {
    fn id(&self) -> BnId {
        self.id
    }
    fn kind(&self) -> BatchNormKind {
        BatchNormKind::Curve
    }
    fn num_features(&self) -> usize {
        self.stats.mean.elem_count()
    }
    fn momentum(&self) -> f64 {
        self.momentum
    }
    fn set_momentum(&mut self, momentum: f64) {
        self.momentum = momentum;
    }
    fn reset_running_stats(&mut self) -> Result<()> {
        self.stats.reset()
    }
    fn running_mean(&self) -> &Tensor {
        self.stats.mean.as_tensor()
    }
    fn running_var(&self) -> &Tensor {
        self.stats.var.as_tensor()
    }
    fn num_batches_tracked(&self) -> usize {
        self.stats.num_batches_tracked.load(Ordering::Relaxed)
    }
}

// ── State-dict helpers ──────────────────────────────────────────────────────

fn buffers(name: &str, stats: &RunningStats) -> Result<[(String, Tensor); 2]> {
    Ok([
        (format!("{name}.running_mean"), stats.mean.as_tensor().copy()?),
        (format!("{name}.running_var"), stats.var.as_tensor().copy()?),
    ])
}

fn load_buffers(
    name: &str,
    stats: &RunningStats,
    state: &std::collections::HashMap<String, Tensor>,
) -> Result<()> {
    let mean_key = format!("{name}.running_mean");
    let var_key = format!("{name}.running_var");
    match (state.get(&mean_key), state.get(&var_key)) {
        (Some(mean), Some(var)) => stats.load(mean, var),
        _ => candle_core::bail!("state dict is missing {mean_key} / {var_key}"),
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_nn::VarMap;

    fn standard(momentum: f64) -> Result<(VarMap, BatchNorm)> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bn = BatchNorm::new(2, 1e-5, momentum, BnId(0), "bn0", vb.pp("bn0"))?;
        Ok((varmap, bn))
    }

    #[test]
    fn ids_are_consecutive() {
        let mut ids = BnIdAllocator::new();
        assert_eq!(ids.allocate(), BnId(0));
        assert_eq!(ids.allocate(), BnId(1));
        assert_eq!(ids.count(), 2);
    }

    #[test]
    fn training_forward_normalises_batch() -> Result<()> {
        let (_vm, bn) = standard(0.1)?;
        let x = Tensor::new(&[[1f32, 10.], [3., 20.], [5., 30.]], &Device::Cpu)?;
        let y = bn.forward_t(&x, true)?;
        let cols = y.t()?.to_vec2::<f32>()?;
        for col in cols {
            let mean: f32 = col.iter().sum::<f32>() / 3.0;
            assert!(mean.abs() < 1e-5);
        }
        Ok(())
    }

    #[test]
    fn running_stats_follow_momentum() -> Result<()> {
        let (_vm, bn) = standard(0.5)?;
        // Column 0: mean 2, unbiased var 2. Column 1: mean 0, unbiased var 8.
        let x = Tensor::new(&[[1f32, -2.], [3., 2.]], &Device::Cpu)?;
        bn.forward_t(&x, true)?;
        let mean = bn.running_mean().to_vec1::<f32>()?;
        let var = bn.running_var().to_vec1::<f32>()?;
        assert!((mean[0] - 1.0).abs() < 1e-6 && mean[1].abs() < 1e-6);
        assert!((var[0] - 1.5).abs() < 1e-5, "var {var:?}");
        assert!((var[1] - 4.5).abs() < 1e-5, "var {var:?}");
        assert_eq!(bn.num_batches_tracked(), 1);
        Ok(())
    }

    #[test]
    fn momentum_one_copies_batch_stats() -> Result<()> {
        let (_vm, mut bn) = standard(0.1)?;
        bn.set_momentum(1.0);
        let x = Tensor::new(&[[1f32, -2.], [3., 2.]], &Device::Cpu)?;
        bn.forward_t(&x, true)?;
        assert_eq!(bn.running_mean().to_vec1::<f32>()?, vec![2.0, 0.0]);
        let var = bn.running_var().to_vec1::<f32>()?;
        assert!((var[0] - 2.0).abs() < 1e-5 && (var[1] - 8.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn eval_uses_running_stats_and_does_not_update() -> Result<()> {
        let (_vm, bn) = standard(0.1)?;
        let x = Tensor::new(&[[1f32, 2.], [3., 4.]], &Device::Cpu)?;
        // Fresh stats: mean 0, var 1 → output ≈ input.
        let y = bn.forward_t(&x, false)?.to_vec2::<f32>()?;
        assert!((y[1][1] - 4.0).abs() < 1e-3);
        assert_eq!(bn.running_mean().to_vec1::<f32>()?, vec![0.0, 0.0]);
        assert_eq!(bn.num_batches_tracked(), 0);
        Ok(())
    }

    #[test]
    fn reset_restores_initial_state() -> Result<()> {
        let (_vm, mut bn) = standard(1.0)?;
        let x = Tensor::new(&[[1f32, 2.], [3., 5.]], &Device::Cpu)?;
        bn.forward_t(&x, true)?;
        bn.reset_running_stats()?;
        assert_eq!(bn.running_mean().to_vec1::<f32>()?, vec![0.0, 0.0]);
        assert_eq!(bn.running_var().to_vec1::<f32>()?, vec![1.0, 1.0]);
        assert_eq!(bn.num_batches_tracked(), 0);
        Ok(())
    }

    #[test]
    fn rejects_wrong_channel_count() -> Result<()> {
        let (_vm, bn) = standard(0.1)?;
        let x = Tensor::zeros((4, 3), DType::F32, &Device::Cpu)?;
        assert!(bn.forward_t(&x, true).is_err());
        Ok(())
    }

    #[test]
    fn curve_variant_blends_affine_parameters() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let bn = CurveBatchNorm::new(1, 2, 0.0, 0.1, BnId(3), "bn0", vb.pp("bn0"))?;
        assert_eq!(bn.kind(), BatchNormKind::Curve);
        assert_eq!(bn.id(), BnId(3));
        // bias_1 = 4 → at c = (0.5, 0.5) the blended bias is 2.
        {
            let data = varmap.data().lock().unwrap();
            data["bn0.bias_1"].set(&Tensor::new(&[4f32], &Device::Cpu)?)?;
        }
        let x = Tensor::new(&[[1f32], [3.]], &Device::Cpu)?;
        let y = bn.forward_t(&x, &[0.5, 0.5], true)?.to_vec2::<f32>()?;
        // normalised: -1, +1 (biased var 1, eps 0)
        assert!((y[0][0] - 1.0).abs() < 1e-5 && (y[1][0] - 3.0).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn four_dimensional_input() -> Result<()> {
        let (_vm, bn) = standard(1.0)?;
        let x = Tensor::arange(0f32, 16., &Device::Cpu)?.reshape((2, 2, 2, 2))?;
        let y = bn.forward_t(&x, true)?;
        assert_eq!(y.dims(), &[2, 2, 2, 2]);
        // channel 0 holds 0,1,2,3,8,9,10,11 → mean 5.5
        let mean = bn.running_mean().to_vec1::<f32>()?;
        assert!((mean[0] - 5.5).abs() < 1e-5);
        Ok(())
    }
}
