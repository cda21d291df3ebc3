//! Fast geometric ensembling: average the predictions of snapshots taken
//! along a cyclic learning-rate run.

use anyhow::Result;
use serde::{Deserialize, Serialize};

/// Whether `epoch` ends at the low point where a snapshot is taken.
///
/// With the triangular schedule this is the epoch after which
/// `(epoch mod cycle) + 1 == cycle / 2`.
pub fn is_snapshot_epoch(epoch: usize, cycle: usize) -> bool {
    cycle > 0 && (epoch % cycle) + 1 == cycle / 2
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EnsembleReport {
    pub members: usize,
    pub accuracy: f64,
    pub nll: f64,
}

/// Running average of per-sample class probabilities.
#[derive(Debug, Clone, Default)]
pub struct FgeEnsemble {
    sum: Vec<Vec<f64>>,
    targets: Vec<u32>,
    members: usize,
}

impl FgeEnsemble {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn members(&self) -> usize {
        self.members
    }

    /// Add one member's predictions. Every member must predict the same
    /// samples in the same order.
    pub fn add(&mut self, probs: &[Vec<f32>], targets: &[u32]) -> Result<()> {
        if probs.len() != targets.len() {
            anyhow::bail!("{} prediction rows for {} targets", probs.len(), targets.len());
        }
        if self.members == 0 {
            self.sum = probs
                .iter()
                .map(|row| row.iter().map(|&p| p as f64).collect())
                .collect();
            self.targets = targets.to_vec();
        } else {
            if targets != self.targets.as_slice() {
                anyhow::bail!("ensemble member was evaluated on different samples");
            }
            if let Some((acc, row)) = self.sum.iter().zip(probs).find(|(a, r)| a.len() != r.len()) {
                anyhow::bail!("member predicts {} classes, ensemble has {}", row.len(), acc.len());
            }
            for (acc, row) in self.sum.iter_mut().zip(probs) {
                for (a, &p) in acc.iter_mut().zip(row) {
                    *a += p as f64;
                }
            }
        }
        self.members += 1;
        Ok(())
    }

    /// Accuracy (percent) and mean NLL of the averaged prediction.
    pub fn report(&self) -> Option<EnsembleReport> {
        if self.members == 0 || self.targets.is_empty() {
            return None;
        }
        let k = self.members as f64;
        let mut correct = 0usize;
        let mut nll = 0.0f64;
        for (row, &y) in self.sum.iter().zip(&self.targets) {
            let pred = row
                .iter()
                .enumerate()
                .max_by(|a, b| a.1.total_cmp(b.1))
                .map(|(i, _)| i)
                .unwrap_or(0);
            if pred == y as usize {
                correct += 1;
            }
            let p = row.get(y as usize).copied().unwrap_or(0.0) / k;
            nll -= (p + 1e-12).ln();
        }
        let n = self.targets.len() as f64;
        Some(EnsembleReport {
            members: self.members,
            accuracy: 100.0 * correct as f64 / n,
            nll: nll / n,
        })
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
