//! Linear layer whose weights live on a curve.
//!
//! Each bend `j` owns a full `weight_{j}` / `bias_{j}` pair. The forward pass
//! blends them with the curve coefficients and applies an ordinary affine map,
//! so gradients reach every bend in proportion to its coefficient.

use candle_core::{Result, Tensor};
use candle_nn::{init, Init, VarBuilder};

use crate::curves::blend;

pub struct CurveLinear {
    weights: Vec<Tensor>,
    biases: Vec<Tensor>,
}

impl CurveLinear {
    /// Bends are initialised independently, like `candle_nn::linear`.
    pub fn new(in_dim: usize, out_dim: usize, num_bends: usize, vb: VarBuilder) -> Result<Self> {
        let bound = 1.0 / (in_dim as f64).sqrt();
        let bias_init = Init::Uniform {
            lo: -bound,
            up: bound,
        };
        let mut weights = Vec::with_capacity(num_bends);
        let mut biases = Vec::with_capacity(num_bends);
        for j in 0..num_bends {
            weights.push(vb.get_with_hints(
                (out_dim, in_dim),
                &format!("weight_{j}"),
                init::DEFAULT_KAIMING_NORMAL,
            )?);
            biases.push(vb.get_with_hints(out_dim, &format!("bias_{j}"), bias_init)?);
        }
        Ok(Self { weights, biases })
    }

    pub fn num_bends(&self) -> usize {
        self.weights.len()
    }

    /// `x · W(t)ᵀ + b(t)` with `W(t) = Σ_j coeffs[j] · W_j`.
    pub fn forward(&self, x: &Tensor, coeffs: &[f64]) -> Result<Tensor> {
        let w = blend(&self.weights, coeffs)?;
        let b = blend(&self.biases, coeffs)?;
        x.matmul(&w.t()?)?.broadcast_add(&b)
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn endpoint_coefficients_select_one_bend() -> Result<()> {
        let dev = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &dev);
        let layer = CurveLinear::new(2, 1, 3, vb.pp("fc"))?;
        {
            let data = varmap.data().lock().unwrap();
            data["fc.weight_0"].set(&Tensor::new(&[[1f32, 0.]], &dev)?)?;
            data["fc.bias_0"].set(&Tensor::new(&[0f32], &dev)?)?;
            data["fc.weight_2"].set(&Tensor::new(&[[0f32, 2.]], &dev)?)?;
            data["fc.bias_2"].set(&Tensor::new(&[1f32], &dev)?)?;
        }
        let x = Tensor::new(&[[3f32, 5.]], &dev)?;
        let start = layer.forward(&x, &[1.0, 0.0, 0.0])?.to_vec2::<f32>()?;
        let end = layer.forward(&x, &[0.0, 0.0, 1.0])?.to_vec2::<f32>()?;
        assert_eq!(start, vec![vec![3.0]]);
        assert_eq!(end, vec![vec![11.0]]);
        Ok(())
    }

    #[test]
    fn every_bend_is_registered() -> Result<()> {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        let layer = CurveLinear::new(4, 3, 3, vb)?;
        assert_eq!(layer.num_bends(), 3);
        assert_eq!(varmap.all_vars().len(), 6);
        Ok(())
    }
}
