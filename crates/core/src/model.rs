//! The [`Model`] capability the harness drives, and the multi-layer
//! perceptron in plain ([`Mlp`]) and curve ([`CurveMlp`]) form.
//!
//! Hidden block: linear → batch norm (optional) → ReLU. Parameter names are
//! `fc{i}.*`, `bn{i}.*` and `out.*`; curve models append `_{bend}` to every
//! parameter name, so bend `j` of a curve maps 1:1 onto an endpoint network.

use std::collections::HashMap;

use candle_core::{DType, Device, Result, Tensor, Var};
use candle_nn::{linear, Linear, Module, VarBuilder, VarMap};

use curve_common::{CurveKind, ModelConfig};

use crate::curves::curve_coefficients;
use crate::linear::CurveLinear;
use crate::norm::{BatchNorm, BatchNormLayer, BnIdAllocator, CurveBatchNorm};

// ── Model trait ─────────────────────────────────────────────────────────────

/// A classifier the train/eval loops and the recalibration engine can drive.
pub trait Model {
    /// Per-class scores of shape `(batch, classes)`.
    ///
    /// `t` is the curve position. Plain networks ignore it; curve networks
    /// draw `t ~ U[0, 1)` when it is `None`.
    fn forward(&self, xs: &Tensor, t: Option<f64>) -> Result<Tensor>;

    /// Trainable parameters (frozen bends excluded).
    fn parameters(&self) -> Result<Vec<Var>>;

    fn set_training(&mut self, training: bool);

    fn is_training(&self) -> bool;

    /// Where the parameters live.
    fn device(&self) -> &Device;

    fn visit_batch_norms(&self, f: &mut dyn FnMut(&dyn BatchNormLayer));

    fn visit_batch_norms_mut(
        &mut self,
        f: &mut dyn FnMut(&mut dyn BatchNormLayer) -> Result<()>,
    ) -> Result<()>;

    /// Every parameter (frozen ones included) plus batch-norm running statistics.
    fn state_dict(&self) -> Result<HashMap<String, Tensor>>;

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()>;

    fn has_batch_norm(&self) -> bool {
        let mut found = false;
        self.visit_batch_norms(&mut |_| found = true);
        found
    }
}

/// Build the network described by `config` (curve form when `config.curve` is set).
pub fn build_model(config: &ModelConfig, device: &Device) -> Result<Box<dyn Model>> {
    Ok(match config.curve {
        Some(_) => Box::new(CurveMlp::new(config, device)?),
        None => Box::new(Mlp::new(config, device)?),
    })
}

fn named_vars(varmap: &VarMap) -> Result<Vec<(String, Var)>> {
    let data = varmap
        .data()
        .lock()
        .map_err(|_| candle_core::Error::Msg("varmap lock poisoned".to_string()))?;
    let mut vars: Vec<(String, Var)> = data.iter().map(|(k, v)| (k.clone(), v.clone())).collect();
    vars.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(vars)
}

fn load_vars(varmap: &VarMap, state: &HashMap<String, Tensor>) -> Result<()> {
    for (name, var) in named_vars(varmap)? {
        let Some(value) = state.get(&name) else {
            candle_core::bail!("state dict is missing parameter {name}");
        };
        var.set(&value.to_device(var.device())?)?;
    }
    Ok(())
}

fn layer_dims(config: &ModelConfig) -> Vec<(usize, usize)> {
    let mut dims = Vec::with_capacity(config.hidden_dims.len());
    let mut prev = config.input_dim;
    for &h in &config.hidden_dims {
        dims.push((prev, h));
        prev = h;
    }
    dims
}

// ── Mlp ─────────────────────────────────────────────────────────────────────

struct HiddenBlock {
    fc: Linear,
    bn: Option<BatchNorm>,
}

pub struct Mlp {
    hidden: Vec<HiddenBlock>,
    out: Linear,
    varmap: VarMap,
    device: Device,
    training: bool,
}

impl Mlp {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut ids = BnIdAllocator::new();

        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        for (i, (d_in, d_out)) in layer_dims(config).into_iter().enumerate() {
            let fc = linear(d_in, d_out, vb.pp(format!("fc{i}")))?;
            let bn = if config.batch_norm {
                let name = format!("bn{i}");
                Some(BatchNorm::new(
                    d_out,
                    config.bn_eps,
                    config.bn_momentum,
                    ids.allocate(),
                    &name,
                    vb.pp(&name),
                )?)
            } else {
                None
            };
            hidden.push(HiddenBlock { fc, bn });
        }
        let last = config.hidden_dims.last().copied().unwrap_or(config.input_dim);
        let out = linear(last, config.num_classes, vb.pp("out"))?;

        Ok(Self {
            hidden,
            out,
            varmap,
            device: device.clone(),
            training: true,
        })
    }

    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
}

impl Model for Mlp {
    fn forward(&self, xs: &Tensor, _t: Option<f64>) -> Result<Tensor> {
        let mut x = xs.clone();
        for block in &self.hidden {
            x = block.fc.forward(&x)?;
            if let Some(bn) = &block.bn {
                x = bn.forward_t(&x, self.training)?;
            }
            x = x.relu()?;
        }
        self.out.forward(&x)
    }

    fn parameters(&self) -> Result<Vec<Var>> {
        Ok(named_vars(&self.varmap)?.into_iter().map(|(_, v)| v).collect())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn visit_batch_norms(&self, f: &mut dyn FnMut(&dyn BatchNormLayer)) {
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            f(bn);
        }
    }

    fn visit_batch_norms_mut(
        &mut self,
        f: &mut dyn FnMut(&mut dyn BatchNormLayer) -> Result<()>,
    ) -> Result<()> {
        for bn in self.hidden.iter_mut().filter_map(|b| b.bn.as_mut()) {
            f(bn)?;
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, var) in named_vars(&self.varmap)? {
            state.insert(name, var.as_tensor().copy()?);
        }
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            state.extend(bn.buffers()?);
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        load_vars(&self.varmap, state)?;
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            bn.load_buffers(state)?;
        }
        Ok(())
    }
}

// ── CurveMlp ────────────────────────────────────────────────────────────────

struct CurveBlock {
    fc: CurveLinear,
    bn: Option<CurveBatchNorm>,
}

/// An [`Mlp`] whose parameters trace a curve between two endpoint networks.
pub struct CurveMlp {
    kind: CurveKind,
    num_bends: usize,
    /// `fixed[j]` keeps bend `j` out of [`Model::parameters`].
    fixed: Vec<bool>,
    hidden: Vec<CurveBlock>,
    out: CurveLinear,
    varmap: VarMap,
    device: Device,
    training: bool,
}

impl CurveMlp {
    pub fn new(config: &ModelConfig, device: &Device) -> Result<Self> {
        let Some(kind) = config.curve else {
            candle_core::bail!("CurveMlp needs a curve kind in the model config");
        };
        let num_bends = config.num_bends;
        if num_bends < 2 {
            candle_core::bail!("a curve needs at least 2 bends, got {num_bends}");
        }
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let mut ids = BnIdAllocator::new();

        let mut hidden = Vec::with_capacity(config.hidden_dims.len());
        for (i, (d_in, d_out)) in layer_dims(config).into_iter().enumerate() {
            let fc = CurveLinear::new(d_in, d_out, num_bends, vb.pp(format!("fc{i}")))?;
            let bn = if config.batch_norm {
                let name = format!("bn{i}");
                Some(CurveBatchNorm::new(
                    d_out,
                    num_bends,
                    config.bn_eps,
                    config.bn_momentum,
                    ids.allocate(),
                    &name,
                    vb.pp(&name),
                )?)
            } else {
                None
            };
            hidden.push(CurveBlock { fc, bn });
        }
        let last = config.hidden_dims.last().copied().unwrap_or(config.input_dim);
        let out = CurveLinear::new(last, config.num_classes, num_bends, vb.pp("out"))?;

        let mut fixed = vec![false; num_bends];
        fixed[0] = config.fix_start;
        fixed[num_bends - 1] = config.fix_end;

        Ok(Self {
            kind,
            num_bends,
            fixed,
            hidden,
            out,
            varmap,
            device: device.clone(),
            training: true,
        })
    }

    pub fn kind(&self) -> CurveKind {
        self.kind
    }

    pub fn num_bends(&self) -> usize {
        self.num_bends
    }

    /// Copy the parameters of an endpoint network into bend `bend`.
    pub fn import_endpoint(&mut self, base: &Mlp, bend: usize) -> Result<()> {
        if bend >= self.num_bends {
            candle_core::bail!("bend {bend} out of range for {} bends", self.num_bends);
        }
        let curve_vars: HashMap<String, Var> = named_vars(&self.varmap)?.into_iter().collect();
        for (name, var) in named_vars(&base.varmap)? {
            let key = format!("{name}_{bend}");
            let Some(target) = curve_vars.get(&key) else {
                candle_core::bail!("curve has no parameter {key} for endpoint parameter {name}");
            };
            target.set(var.as_tensor())?;
        }
        Ok(())
    }

    /// Place the interior bends on the straight line between the endpoints:
    /// `θ_j = (1 - α) θ_0 + α θ_{n-1}` with `α = j / (n - 1)`.
    pub fn init_linear(&mut self) -> Result<()> {
        let vars: HashMap<String, Var> = named_vars(&self.varmap)?.into_iter().collect();
        let last = self.num_bends - 1;
        for name in vars.keys().filter_map(|k| k.strip_suffix("_0")) {
            let (Some(start), Some(end)) =
                (vars.get(&format!("{name}_0")), vars.get(&format!("{name}_{last}")))
            else {
                continue;
            };
            for j in 1..last {
                let alpha = j as f64 / last as f64;
                let value = (start.affine(1.0 - alpha, 0.0)? + end.affine(alpha, 0.0)?)?;
                if let Some(target) = vars.get(&format!("{name}_{j}")) {
                    target.set(&value)?;
                }
            }
        }
        Ok(())
    }

    fn bend_of(name: &str) -> Option<usize> {
        name.rsplit_once('_').and_then(|(_, j)| j.parse().ok())
    }
}

impl Model for CurveMlp {
    fn forward(&self, xs: &Tensor, t: Option<f64>) -> Result<Tensor> {
        let t = t.unwrap_or_else(rand::random::<f64>);
        let coeffs = curve_coefficients(self.kind, self.num_bends, t);
        let mut x = xs.clone();
        for block in &self.hidden {
            x = block.fc.forward(&x, &coeffs)?;
            if let Some(bn) = &block.bn {
                x = bn.forward_t(&x, &coeffs, self.training)?;
            }
            x = x.relu()?;
        }
        self.out.forward(&x, &coeffs)
    }

    fn parameters(&self) -> Result<Vec<Var>> {
        Ok(named_vars(&self.varmap)?
            .into_iter()
            .filter(|(name, _)| match Self::bend_of(name) {
                Some(j) => !self.fixed.get(j).copied().unwrap_or(false),
                None => true,
            })
            .map(|(_, v)| v)
            .collect())
    }

    fn set_training(&mut self, training: bool) {
        self.training = training;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn device(&self) -> &Device {
        &self.device
    }

    fn visit_batch_norms(&self, f: &mut dyn FnMut(&dyn BatchNormLayer)) {
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            f(bn);
        }
    }

    fn visit_batch_norms_mut(
        &mut self,
        f: &mut dyn FnMut(&mut dyn BatchNormLayer) -> Result<()>,
    ) -> Result<()> {
        for bn in self.hidden.iter_mut().filter_map(|b| b.bn.as_mut()) {
            f(bn)?;
        }
        Ok(())
    }

    fn state_dict(&self) -> Result<HashMap<String, Tensor>> {
        let mut state = HashMap::new();
        for (name, var) in named_vars(&self.varmap)? {
            state.insert(name, var.as_tensor().copy()?);
        }
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            state.extend(bn.buffers()?);
        }
        Ok(state)
    }

    fn load_state_dict(&mut self, state: &HashMap<String, Tensor>) -> Result<()> {
        load_vars(&self.varmap, state)?;
        for bn in self.hidden.iter().filter_map(|b| b.bn.as_ref()) {
            bn.load_buffers(state)?;
        }
        Ok(())
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::norm::{BatchNormKind, BnId};

    fn config(curve: Option<CurveKind>, batch_norm: bool) -> ModelConfig {
        ModelConfig {
            input_dim: 3,
            hidden_dims: vec![5, 4],
            num_classes: 2,
            batch_norm,
            curve,
            ..Default::default()
        }
    }

    fn max_abs_diff(a: &Tensor, b: &Tensor) -> f32 {
        (a - b)
            .unwrap()
            .abs()
            .unwrap()
            .max_all()
            .unwrap()
            .to_scalar::<f32>()
            .unwrap()
    }

    #[test]
    fn mlp_forward_shape() -> Result<()> {
        let model = Mlp::new(&config(None, true), &Device::Cpu)?;
        let xs = Tensor::randn(0f32, 1.0, (6, 3), &Device::Cpu)?;
        assert_eq!(model.forward(&xs, None)?.dims(), &[6, 2]);
        Ok(())
    }

    #[test]
    fn batch_norm_ids_follow_construction_order() -> Result<()> {
        let model = Mlp::new(&config(None, true), &Device::Cpu)?;
        let mut ids = Vec::new();
        model.visit_batch_norms(&mut |bn| ids.push((bn.id(), bn.kind())));
        assert_eq!(
            ids,
            vec![
                (BnId(0), BatchNormKind::Standard),
                (BnId(1), BatchNormKind::Standard)
            ]
        );

        let curve = CurveMlp::new(&config(Some(CurveKind::Bezier), true), &Device::Cpu)?;
        let mut kinds = Vec::new();
        curve.visit_batch_norms(&mut |bn| kinds.push(bn.kind()));
        assert_eq!(kinds, vec![BatchNormKind::Curve, BatchNormKind::Curve]);
        Ok(())
    }

    #[test]
    fn no_batch_norm_reports_none() -> Result<()> {
        let model = Mlp::new(&config(None, false), &Device::Cpu)?;
        assert!(!model.has_batch_norm());
        Ok(())
    }

    #[test]
    fn fixed_endpoints_are_not_trainable() -> Result<()> {
        let cfg = config(Some(CurveKind::PolyChain), false);
        let curve = CurveMlp::new(&cfg, &Device::Cpu)?;
        // 3 layers × (weight, bias) × 3 bends, endpoints frozen → 6 trainable.
        assert_eq!(curve.parameters()?.len(), 6);

        let free = CurveMlp::new(
            &ModelConfig {
                fix_start: false,
                fix_end: false,
                ..cfg
            },
            &Device::Cpu,
        )?;
        assert_eq!(free.parameters()?.len(), 18);
        Ok(())
    }

    #[test]
    fn curve_endpoints_reproduce_imported_networks() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = config(Some(CurveKind::Bezier), false);
        let start = Mlp::new(&cfg.endpoint(), &dev)?;
        let end = Mlp::new(&cfg.endpoint(), &dev)?;
        let mut curve = CurveMlp::new(&cfg, &dev)?;
        curve.import_endpoint(&start, 0)?;
        curve.import_endpoint(&end, 2)?;

        let xs = Tensor::randn(0f32, 1.0, (4, 3), &dev)?;
        assert!(max_abs_diff(&curve.forward(&xs, Some(0.0))?, &start.forward(&xs, None)?) < 1e-5);
        assert!(max_abs_diff(&curve.forward(&xs, Some(1.0))?, &end.forward(&xs, None)?) < 1e-5);
        Ok(())
    }

    #[test]
    fn init_linear_puts_middle_bend_halfway() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = config(Some(CurveKind::PolyChain), true);
        let mut curve = CurveMlp::new(&cfg, &dev)?;
        curve.init_linear()?;
        let state = curve.state_dict()?;
        let w0 = &state["fc0.weight_0"];
        let w1 = &state["fc0.weight_1"];
        let w2 = &state["fc0.weight_2"];
        let mid = ((w0 + w2)?.affine(0.5, 0.0))?;
        assert!(max_abs_diff(w1, &mid) < 1e-6);
        Ok(())
    }

    #[test]
    fn import_endpoint_rejects_bad_bend() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = config(Some(CurveKind::Bezier), true);
        let base = Mlp::new(&cfg.endpoint(), &dev)?;
        let mut curve = CurveMlp::new(&cfg, &dev)?;
        assert!(curve.import_endpoint(&base, 3).is_err());
        Ok(())
    }

    #[test]
    fn state_dict_round_trip() -> Result<()> {
        let dev = Device::Cpu;
        let cfg = config(None, true);
        let mut a = Mlp::new(&cfg, &dev)?;
        let mut b = Mlp::new(&cfg, &dev)?;
        // Move a's running stats off their initial values.
        a.visit_batch_norms_mut(&mut |bn| {
            bn.set_momentum(1.0);
            Ok(())
        })?;
        a.forward(&Tensor::randn(0f32, 1.0, (8, 3), &dev)?, None)?;

        let state = a.state_dict()?;
        assert!(state.contains_key("bn1.running_var"));
        b.load_state_dict(&state)?;

        a.set_training(false);
        b.set_training(false);
        let xs = Tensor::randn(0f32, 1.0, (5, 3), &dev)?;
        assert!(max_abs_diff(&a.forward(&xs, None)?, &b.forward(&xs, None)?) < 1e-6);
        Ok(())
    }

    #[test]
    fn state_dict_is_a_snapshot() -> Result<()> {
        let dev = Device::Cpu;
        for cfg in [config(None, true), config(Some(CurveKind::PolyChain), true)] {
            let model = build_model(&cfg, &dev)?;
            let before = model.state_dict()?;
            for var in model.parameters()? {
                var.set(&var.ones_like()?)?;
            }
            // A training-mode pass moves the running statistics.
            model.forward(&Tensor::randn(2f32, 1.0, (6, 3), &dev)?, Some(0.5))?;

            let after = model.state_dict()?;
            let differs = |name: &str| -> Result<bool> {
                let a = before[name].flatten_all()?.to_vec1::<f32>()?;
                let b = after[name].flatten_all()?.to_vec1::<f32>()?;
                Ok(a != b)
            };
            let weight = if cfg.curve.is_some() { "fc0.weight_1" } else { "fc0.weight" };
            assert!(differs(weight)?, "{weight} followed the live parameter");
            assert!(differs("bn0.running_mean")?, "running mean followed the live buffer");
        }
        Ok(())
    }

    #[test]
    fn poisoned_varmap_is_an_error() -> Result<()> {
        let model = Mlp::new(&config(None, false), &Device::Cpu)?;
        let varmap = model.varmap().clone();
        let _ = std::thread::spawn(move || {
            let _guard = varmap.data().lock().unwrap();
            panic!("poison the varmap");
        })
        .join();
        assert!(model.parameters().is_err());
        assert!(model.state_dict().is_err());
        Ok(())
    }

    #[test]
    fn load_state_dict_reports_missing_keys() -> Result<()> {
        let mut model = Mlp::new(&config(None, false), &Device::Cpu)?;
        assert!(model.load_state_dict(&HashMap::new()).is_err());
        Ok(())
    }

    #[test]
    fn build_model_picks_variant() -> Result<()> {
        let dev = Device::Cpu;
        let curve = build_model(&config(Some(CurveKind::Bezier), true), &dev)?;
        let mut kinds = Vec::new();
        curve.visit_batch_norms(&mut |bn| kinds.push(bn.kind()));
        assert_eq!(kinds[0], BatchNormKind::Curve);
        let plain = build_model(&config(None, true), &dev)?;
        assert!(plain.has_batch_norm());
        Ok(())
    }
}
