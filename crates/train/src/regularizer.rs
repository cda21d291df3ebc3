//! Parameter penalties added to the task loss.

use candle_core::{DType, Result, Tensor};

use curve_core::Model;

/// A differentiable penalty over a model's trainable parameters.
pub trait Regularizer {
    /// Scalar tensor on the model's device.
    fn penalty(&self, model: &dyn Model) -> Result<Tensor>;
}

impl<F> Regularizer for F
where
    F: Fn(&dyn Model) -> Result<Tensor>,
{
    fn penalty(&self, model: &dyn Model) -> Result<Tensor> {
        self(model)
    }
}

/// `0.5 · weight_decay · Σ_p ‖p‖₂` over the trainable parameters.
///
/// This is the sum of per-parameter norms, not the squared norm. An all-zero
/// parameter contributes 0 with a zero gradient (the subgradient of `‖p‖₂`
/// at the origin) instead of the NaN a plain `sqrt` would back-propagate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct L2Regularizer {
    pub weight_decay: f64,
}

impl Regularizer for L2Regularizer {
    fn penalty(&self, model: &dyn Model) -> Result<Tensor> {
        let mut total: Option<Tensor> = None;
        for p in model.parameters()? {
            let p = p.as_tensor();
            let sq = p.sqr()?.sum_all()?;
            let norm = if sq.to_dtype(DType::F64)?.to_scalar::<f64>()? > 0.0 {
                sq.sqrt()?
            } else {
                p.affine(0.0, 0.0)?.sum_all()?
            };
            total = Some(match total {
                None => norm,
                Some(acc) => (acc + norm)?,
            });
        }
        match total {
            Some(sum) => sum.affine(0.5 * self.weight_decay, 0.0),
            None => Tensor::zeros((), DType::F32, model.device()),
        }
    }
}

pub fn l2_regularizer(weight_decay: f64) -> L2Regularizer {
    L2Regularizer { weight_decay }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;
    use curve_common::ModelConfig;
    use curve_core::Mlp;

    fn mlp(batch_norm: bool) -> Mlp {
        let config = ModelConfig {
            input_dim: 3,
            hidden_dims: vec![4],
            num_classes: 2,
            batch_norm,
            ..Default::default()
        };
        Mlp::new(&config, &Device::Cpu).unwrap()
    }

    fn small_mlp() -> Mlp {
        mlp(false)
    }

    #[test]
    fn zero_decay_is_zero() -> Result<()> {
        let model = small_mlp();
        let reg = l2_regularizer(0.0);
        assert_eq!(reg.penalty(&model)?.to_scalar::<f32>()?, 0.0);
        Ok(())
    }

    #[test]
    fn sums_per_parameter_norms() -> Result<()> {
        let model = small_mlp();
        let mut expected = 0.0f64;
        for p in model.parameters()? {
            let sq: f32 = p.as_tensor().sqr()?.sum_all()?.to_scalar()?;
            expected += (sq as f64).sqrt();
        }
        let got = l2_regularizer(0.2).penalty(&model)?.to_scalar::<f32>()? as f64;
        assert!((got - 0.1 * expected).abs() < 1e-4, "got {got}, want {}", 0.1 * expected);
        Ok(())
    }

    #[test]
    fn penalty_is_differentiable() -> Result<()> {
        let model = small_mlp();
        let penalty = l2_regularizer(1.0).penalty(&model)?;
        let grads = penalty.backward()?;
        for p in model.parameters()? {
            assert!(grads.get(p.as_tensor()).is_some());
        }
        Ok(())
    }

    #[test]
    fn zero_parameters_get_finite_gradients() -> Result<()> {
        // Batch-norm biases start at exactly zero.
        let model = mlp(true);
        let penalty = l2_regularizer(1e-4).penalty(&model)?;
        assert!(penalty.to_scalar::<f32>()?.is_finite());
        let grads = penalty.backward()?;
        for p in model.parameters()? {
            let g = grads.get(p.as_tensor()).expect("every parameter has a gradient");
            let values = g.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|v| v.is_finite()), "{values:?}");
        }
        Ok(())
    }

    #[test]
    fn zero_parameter_adds_nothing_to_the_value() -> Result<()> {
        let model = mlp(true);
        let mut expected = 0.0f64;
        for p in model.parameters()? {
            let sq: f32 = p.as_tensor().sqr()?.sum_all()?.to_scalar()?;
            expected += (sq as f64).sqrt();
        }
        let got = l2_regularizer(2.0).penalty(&model)?.to_scalar::<f32>()? as f64;
        assert!((got - expected).abs() < 1e-4, "got {got}, want {expected}");
        Ok(())
    }

    #[test]
    fn closures_are_regularizers() -> Result<()> {
        let model = small_mlp();
        let constant = |m: &dyn Model| Tensor::new(2f32, m.device());
        assert_eq!(constant.penalty(&model)?.to_scalar::<f32>()?, 2.0);
        Ok(())
    }
}
