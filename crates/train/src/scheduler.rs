//! Learning-rate schedules.
//!
//! * [`CyclicLr`] — triangular wave over `cycle` epochs, queried per batch
//!   with the fractional progress through the current epoch.
//! * [`learning_rate_schedule`] — per-epoch step decay for endpoint and
//!   curve training.

use crate::error::HarnessError;

// ── LrSchedule ──────────────────────────────────────────────────────────────

/// A learning rate as a function of progress through the current epoch.
///
/// `progress` is `i / num_batches` for batch `i`, so it lies in `[0, 1)`.
pub trait LrSchedule {
    fn lr_at(&self, progress: f64) -> f64;
}

impl<F: Fn(f64) -> f64> LrSchedule for F {
    fn lr_at(&self, progress: f64) -> f64 {
        self(progress)
    }
}

// ── Cyclic ──────────────────────────────────────────────────────────────────

/// Triangular cyclic learning rate for one epoch of a `cycle`-epoch period.
///
/// With `t = ((epoch mod cycle) + i) / cycle` the rate climbs linearly from
/// `alpha_1` at `t = 0` to `alpha_2` at `t = 0.5` and falls back to `alpha_1`
/// as `t → 1`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CyclicLr {
    epoch: usize,
    cycle: usize,
    alpha_1: f64,
    alpha_2: f64,
}

impl CyclicLr {
    pub fn new(epoch: usize, cycle: usize, alpha_1: f64, alpha_2: f64) -> Result<Self, HarnessError> {
        if cycle == 0 {
            return Err(HarnessError::InvalidCycle);
        }
        Ok(Self {
            epoch,
            cycle,
            alpha_1,
            alpha_2,
        })
    }

    /// Position within the cycle, in `[0, 1)` for `i ∈ [0, 1)`.
    pub fn cycle_position(&self, i: f64) -> f64 {
        ((self.epoch % self.cycle) as f64 + i) / self.cycle as f64
    }
}

impl LrSchedule for CyclicLr {
    fn lr_at(&self, i: f64) -> f64 {
        let t = self.cycle_position(i);
        if t < 0.5 {
            self.alpha_1 * (1.0 - 2.0 * t) + self.alpha_2 * 2.0 * t
        } else {
            self.alpha_1 * (2.0 * t - 1.0) + self.alpha_2 * (2.0 - 2.0 * t)
        }
    }
}

/// Schedule for `epoch` of a cyclic run. Fails when `cycle == 0`.
pub fn cyclic_learning_rate(
    epoch: usize,
    cycle: usize,
    alpha_1: f64,
    alpha_2: f64,
) -> Result<CyclicLr, HarnessError> {
    CyclicLr::new(epoch, cycle, alpha_1, alpha_2)
}

// ── Step decay ──────────────────────────────────────────────────────────────

/// Per-epoch rate: flat for the first half, linear decay to 1% by 90% of
/// training, then flat at 1%.
pub fn learning_rate_schedule(base_lr: f64, epoch: usize, total_epochs: usize) -> f64 {
    let alpha = epoch as f64 / total_epochs.max(1) as f64;
    let factor = if alpha <= 0.5 {
        1.0
    } else if alpha <= 0.9 {
        1.0 - (alpha - 0.5) / 0.4 * 0.99
    } else {
        0.01
    };
    base_lr * factor
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cycle_starts_and_ends_at_lower_bound() {
        let sched = cyclic_learning_rate(0, 1, 0.01, 0.1).unwrap();
        assert!((sched.lr_at(0.0) - 0.01).abs() < 1e-12);
        // Just before the wrap the rate approaches alpha_1 again.
        assert!((sched.lr_at(1.0 - 1e-9) - 0.01).abs() < 1e-8);
    }

    #[test]
    fn peak_at_cycle_midpoint() {
        // cycle 4: epoch 2, i = 0 → t = 0.5
        let sched = cyclic_learning_rate(2, 4, 0.01, 0.1).unwrap();
        assert!((sched.lr_at(0.0) - 0.1).abs() < 1e-12);

        let mut max = f64::MIN;
        for epoch in 0..4 {
            let s = cyclic_learning_rate(epoch, 4, 0.01, 0.1).unwrap();
            for k in 0..100 {
                max = max.max(s.lr_at(k as f64 / 100.0));
            }
        }
        assert!((max - 0.1).abs() < 1e-12);
    }

    #[test]
    fn continuous_at_midpoint() {
        let sched = cyclic_learning_rate(0, 1, 0.05, 0.5).unwrap();
        let eps = 1e-9;
        let below = sched.lr_at(0.5 - eps);
        let at = sched.lr_at(0.5);
        assert!((below - at).abs() < 1e-6);
    }

    #[test]
    fn epoch_wraps_modulo_cycle() {
        let a = cyclic_learning_rate(1, 3, 0.01, 0.1).unwrap();
        let b = cyclic_learning_rate(7, 3, 0.01, 0.1).unwrap();
        assert_eq!(a.lr_at(0.3), b.lr_at(0.3));
    }

    #[test]
    fn zero_cycle_rejected() {
        assert!(matches!(
            cyclic_learning_rate(0, 0, 0.01, 0.1),
            Err(HarnessError::InvalidCycle)
        ));
    }

    #[test]
    fn closures_are_schedules() {
        let constant = |_: f64| 0.3;
        assert_eq!(constant.lr_at(0.7), 0.3);
    }

    #[test]
    fn step_decay_breakpoints() {
        assert!((learning_rate_schedule(0.1, 0, 100) - 0.1).abs() < 1e-12);
        assert!((learning_rate_schedule(0.1, 50, 100) - 0.1).abs() < 1e-12);
        // α = 0.7 → 1 - 0.5 · 0.99 = 0.505
        assert!((learning_rate_schedule(0.1, 70, 100) - 0.0505).abs() < 1e-12);
        assert!((learning_rate_schedule(0.1, 90, 100) - 0.001).abs() < 1e-12);
        assert!((learning_rate_schedule(0.1, 95, 100) - 0.001).abs() < 1e-12);
    }
}
