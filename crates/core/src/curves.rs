//! Curve parameterisations: how bend parameters blend into one point.
//!
//! A curve with `n` bends is a map `t ∈ [0, 1] → θ(t) = Σ_j c_j(t) · θ_j`.
//! Bend 0 is the start endpoint and bend `n - 1` the end endpoint, so every
//! parameterisation here satisfies `c(0) = e_0` and `c(1) = e_{n-1}`.

use candle_core::{Result, Tensor};

use curve_common::CurveKind;

/// Blend coefficients `c_j(t)` for `j = 0..num_bends`.
pub fn curve_coefficients(kind: CurveKind, num_bends: usize, t: f64) -> Vec<f64> {
    match kind {
        CurveKind::Bezier => bezier(num_bends, t),
        CurveKind::PolyChain => poly_chain(num_bends, t),
    }
}

/// Bernstein basis `C(n-1, j) · t^j · (1 - t)^(n-1-j)`.
fn bezier(num_bends: usize, t: f64) -> Vec<f64> {
    let degree = num_bends.saturating_sub(1);
    (0..num_bends)
        .map(|j| binomial(degree, j) * t.powi(j as i32) * (1.0 - t).powi((degree - j) as i32))
        .collect()
}

/// Hat functions centred on the bends: `max(0, 1 - |t·(n-1) - j|)`.
fn poly_chain(num_bends: usize, t: f64) -> Vec<f64> {
    let t_n = t * num_bends.saturating_sub(1) as f64;
    (0..num_bends)
        .map(|j| (1.0 - (t_n - j as f64).abs()).max(0.0))
        .collect()
}

fn binomial(n: usize, k: usize) -> f64 {
    (0..k).fold(1.0, |acc, i| acc * (n - i) as f64 / (i + 1) as f64)
}

/// `Σ_j coeffs[j] · bends[j]`. All bends must share a shape.
pub fn blend(bends: &[Tensor], coeffs: &[f64]) -> Result<Tensor> {
    if bends.is_empty() || bends.len() != coeffs.len() {
        candle_core::bail!(
            "blend needs one coefficient per bend, got {} bends and {} coefficients",
            bends.len(),
            coeffs.len()
        );
    }
    let mut acc = bends[0].affine(coeffs[0], 0.0)?;
    for (bend, &c) in bends.iter().zip(coeffs).skip(1) {
        acc = (acc + bend.affine(c, 0.0)?)?;
    }
    Ok(acc)
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    fn close(a: &[f64], b: &[f64]) -> bool {
        a.len() == b.len() && a.iter().zip(b).all(|(x, y)| (x - y).abs() < 1e-12)
    }

    #[test]
    fn endpoints_are_one_hot() {
        for kind in [CurveKind::Bezier, CurveKind::PolyChain] {
            assert!(close(&curve_coefficients(kind, 3, 0.0), &[1.0, 0.0, 0.0]));
            assert!(close(&curve_coefficients(kind, 3, 1.0), &[0.0, 0.0, 1.0]));
        }
    }

    #[test]
    fn bezier_midpoint() {
        // (1-t)^2, 2t(1-t), t^2 at t = 0.5
        assert!(close(
            &curve_coefficients(CurveKind::Bezier, 3, 0.5),
            &[0.25, 0.5, 0.25]
        ));
    }

    #[test]
    fn polychain_is_piecewise_linear() {
        assert!(close(
            &curve_coefficients(CurveKind::PolyChain, 3, 0.5),
            &[0.0, 1.0, 0.0]
        ));
        assert!(close(
            &curve_coefficients(CurveKind::PolyChain, 3, 0.25),
            &[0.5, 0.5, 0.0]
        ));
    }

    #[test]
    fn coefficients_sum_to_one() {
        for kind in [CurveKind::Bezier, CurveKind::PolyChain] {
            for n in 2..6 {
                for k in 0..=20 {
                    let t = k as f64 / 20.0;
                    let s: f64 = curve_coefficients(kind, n, t).iter().sum();
                    assert!((s - 1.0).abs() < 1e-9, "{kind:?} n={n} t={t} sum={s}");
                }
            }
        }
    }

    #[test]
    fn blend_weights_bends() -> Result<()> {
        let dev = Device::Cpu;
        let a = Tensor::new(&[1f32, 2.0], &dev)?;
        let b = Tensor::new(&[3f32, 6.0], &dev)?;
        let out = blend(&[a, b], &[0.25, 0.75])?.to_vec1::<f32>()?;
        assert_eq!(out, vec![2.5, 5.0]);
        Ok(())
    }

    #[test]
    fn blend_rejects_count_mismatch() {
        let dev = Device::Cpu;
        let a = Tensor::new(&[1f32], &dev).unwrap();
        assert!(blend(&[a], &[0.5, 0.5]).is_err());
    }
}
