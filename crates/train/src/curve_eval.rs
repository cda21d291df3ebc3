//! Sweep a trained curve: recalibrate batch norm and evaluate at evenly
//! spaced positions `t ∈ [0, 1]`.

use std::collections::BTreeMap;

use anyhow::Result;
use candle_core::Device;
use serde::{Deserialize, Serialize};

use curve_common::{DataLoader, LabeledDataset};
use curve_core::Model;

use crate::harness::{test, update_bn};
use crate::loss::Criterion;
use crate::regularizer::Regularizer;

/// Metrics at one curve position. Errors are `100 - accuracy`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurvePoint {
    pub t: f64,
    pub train_loss: f64,
    pub train_nll: f64,
    pub train_error: f64,
    pub test_loss: f64,
    pub test_nll: f64,
    pub test_error: f64,
}

impl CurvePoint {
    const METRICS: [&'static str; 6] = [
        "train_loss",
        "train_nll",
        "train_error",
        "test_loss",
        "test_nll",
        "test_error",
    ];

    fn metric(&self, name: &str) -> f64 {
        match name {
            "train_loss" => self.train_loss,
            "train_nll" => self.train_nll,
            "train_error" => self.train_error,
            "test_loss" => self.test_loss,
            "test_nll" => self.test_nll,
            _ => self.test_error,
        }
    }
}

/// Statistics of one metric along the curve.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct CurveSummary {
    pub min: f64,
    pub max: f64,
    pub mean: f64,
    /// Trapezoid-rule integral over `t`.
    pub integral: f64,
}

impl CurveSummary {
    /// `ts` and `values` must have the same non-zero length.
    pub fn from_series(ts: &[f64], values: &[f64]) -> Self {
        let min = values.iter().copied().fold(f64::INFINITY, f64::min);
        let max = values.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        let mean = values.iter().sum::<f64>() / values.len().max(1) as f64;
        let integral = ts
            .windows(2)
            .zip(values.windows(2))
            .map(|(t, v)| (t[1] - t[0]) * (v[0] + v[1]) / 2.0)
            .sum();
        Self {
            min,
            max,
            mean,
            integral,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CurveEvaluation {
    pub points: Vec<CurvePoint>,
    pub summary: BTreeMap<String, CurveSummary>,
}

impl CurveEvaluation {
    /// The points as CSV with a header row.
    pub fn to_csv(&self) -> String {
        let mut out = String::from("t,");
        out.push_str(&CurvePoint::METRICS.join(","));
        out.push('\n');
        for p in &self.points {
            out.push_str(&format!("{:.4}", p.t));
            for name in CurvePoint::METRICS {
                out.push_str(&format!(",{:.6}", p.metric(name)));
            }
            out.push('\n');
        }
        out
    }
}

/// Evaluate `model` at `num_points` evenly spaced curve positions.
///
/// At each position batch-norm statistics are rebuilt from `train_loader`
/// before both loaders are evaluated. `on_point` sees every row as it is
/// produced.
#[allow(clippy::too_many_arguments)]
pub fn evaluate_curve<D, C>(
    model: &mut dyn Model,
    train_loader: &DataLoader<'_, D>,
    test_loader: &DataLoader<'_, D>,
    criterion: &C,
    regularizer: Option<&dyn Regularizer>,
    num_points: usize,
    device: &Device,
    on_point: &mut dyn FnMut(&CurvePoint),
) -> Result<CurveEvaluation>
where
    D: LabeledDataset + ?Sized,
    C: Criterion + ?Sized,
{
    if num_points < 2 {
        anyhow::bail!("a curve sweep needs at least 2 points, got {num_points}");
    }
    let mut points = Vec::with_capacity(num_points);
    for i in 0..num_points {
        let t = i as f64 / (num_points - 1) as f64;
        update_bn(train_loader, model, Some(t), device)?;
        let tr = test(train_loader, model, criterion, regularizer, Some(t), device)?;
        let te = test(test_loader, model, criterion, regularizer, Some(t), device)?;
        let point = CurvePoint {
            t,
            train_loss: tr.loss,
            train_nll: tr.nll,
            train_error: 100.0 - tr.accuracy,
            test_loss: te.loss,
            test_nll: te.nll,
            test_error: 100.0 - te.accuracy,
        };
        tracing::info!(
            t = format!("{t:.3}"),
            train_loss = format!("{:.4}", point.train_loss),
            train_error = format!("{:.2}", point.train_error),
            test_nll = format!("{:.4}", point.test_nll),
            test_error = format!("{:.2}", point.test_error),
            "curve point"
        );
        on_point(&point);
        points.push(point);
    }

    let ts: Vec<f64> = points.iter().map(|p| p.t).collect();
    let summary = CurvePoint::METRICS
        .iter()
        .map(|&name| {
            let values: Vec<f64> = points.iter().map(|p| p.metric(name)).collect();
            (name.to_string(), CurveSummary::from_series(&ts, &values))
        })
        .collect();

    Ok(CurveEvaluation { points, summary })
}

// ── Tests ───────────────────────────────────────────────────────────────────
