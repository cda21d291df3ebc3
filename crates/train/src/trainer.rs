//! Trainer: runs epochs of the harness loops with a learning-rate policy.
//!
//! Decouples the per-pass loops (`harness`) from epoch bookkeeping (rate
//! policy, periodic evaluation, checkpointing, resume).

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::Device;
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

use curve_common::{DataLoader, LabeledDataset, ModelConfig};
use curve_core::Model;

use crate::checkpoint::{load_checkpoint, save_checkpoint, CheckpointPayload};
use crate::harness::{test, train, update_bn, EvalMetrics, TrainMetrics};
use crate::loss::CrossEntropy;
use crate::optim::{adjust_learning_rate, ParamsSgd, Sgd};
use crate::regularizer::{l2_regularizer, L2Regularizer, Regularizer};
use crate::scheduler::{cyclic_learning_rate, learning_rate_schedule, LrSchedule};

// ── Config ──────────────────────────────────────────────────────────────────

/// How the learning rate moves during training.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LrPolicy {
    /// One rate per epoch from [`learning_rate_schedule`].
    StepDecay,
    /// Per-batch triangular wave between `lr_1` and `lr_2` over `cycle` epochs.
    Cyclic { cycle: usize, lr_1: f64, lr_2: f64 },
}

/// All training hyper-parameters (CLI-level knobs).
#[derive(Debug, Clone)]
pub struct TrainerConfig {
    pub epochs: usize,
    pub lr: f64,
    pub momentum: f64,
    pub weight_decay: f64,
    /// Apply `weight_decay` through [`l2_regularizer`] instead of the
    /// optimizer (the usual choice for curves).
    pub l2_penalty: bool,
    pub label_smoothing: f64,
    pub policy: LrPolicy,
    /// Evaluate every N epochs (and after the last one). 0 disables.
    pub eval_every: usize,
    /// Checkpoint every N epochs (and after the last one). 0 disables.
    pub save_every: usize,
    /// Curve position used for evaluation; batch-norm statistics are
    /// rebuilt there first.
    pub eval_t: Option<f64>,
    pub output_dir: PathBuf,
    pub checkpoint_name: String,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            epochs: 10,
            lr: 0.05,
            momentum: 0.9,
            weight_decay: 1e-4,
            l2_penalty: false,
            label_smoothing: 0.0,
            policy: LrPolicy::StepDecay,
            eval_every: 1,
            save_every: 0,
            eval_t: None,
            output_dir: PathBuf::from("runs"),
            checkpoint_name: "checkpoint".to_string(),
        }
    }
}

/// What one epoch produced.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: usize,
    /// Rate at the start of the epoch.
    pub lr: f64,
    pub train: TrainMetrics,
    pub test: Option<EvalMetrics>,
    pub seconds: f64,
}

// ── Trainer ─────────────────────────────────────────────────────────────────

/// The training engine. Owns the model, optimizer, loss and regulariser.
pub struct Trainer<M: Model> {
    pub model: M,
    optimizer: Sgd,
    criterion: CrossEntropy,
    regularizer: Option<L2Regularizer>,
    pub config: TrainerConfig,
    model_config: ModelConfig,
    /// Epochs completed so far.
    pub epoch: usize,
    device: Device,
}

impl<M: Model> Trainer<M> {
    pub fn new(
        model: M,
        model_config: ModelConfig,
        config: TrainerConfig,
        device: &Device,
    ) -> anyhow::Result<Self> {
        if !model.device().same_device(device) {
            anyhow::bail!(
                "model lives on {:?}, trainer configured for {:?}",
                model.device().location(),
                device.location()
            );
        }
        let vars = model.parameters()?;
        let (optimizer_decay, regularizer) = if config.l2_penalty {
            (0.0, Some(l2_regularizer(config.weight_decay)))
        } else {
            (config.weight_decay, None)
        };
        let optimizer = Sgd::new(
            vars.clone(),
            ParamsSgd {
                lr: config.lr,
                momentum: config.momentum,
                weight_decay: optimizer_decay,
            },
        )?;

        let total: usize = vars.iter().map(|v| v.elem_count()).sum();
        tracing::info!(
            trainable_params = total,
            tensors = vars.len(),
            batch_norm = model.has_batch_norm(),
            l2_penalty = config.l2_penalty,
            "Trainer ready"
        );

        Ok(Self {
            model,
            optimizer,
            criterion: CrossEntropy::with_label_smoothing(config.label_smoothing),
            regularizer,
            config,
            model_config,
            epoch: 0,
            device: device.clone(),
        })
    }

    /// Train one epoch and evaluate if due.
    pub fn run_epoch<D: LabeledDataset + ?Sized>(
        &mut self,
        train_loader: &DataLoader<'_, D>,
        test_loader: Option<&DataLoader<'_, D>>,
    ) -> anyhow::Result<EpochReport> {
        let epoch = self.epoch;
        let start = Instant::now();

        let schedule = match self.config.policy {
            LrPolicy::StepDecay => {
                let lr = learning_rate_schedule(self.config.lr, epoch, self.config.epochs);
                adjust_learning_rate(&mut self.optimizer, lr);
                None
            }
            LrPolicy::Cyclic { cycle, lr_1, lr_2 } => {
                Some(cyclic_learning_rate(epoch, cycle, lr_1, lr_2)?)
            }
        };
        let lr = match &schedule {
            Some(s) => s.lr_at(0.0),
            None => self.optimizer.learning_rate(),
        };

        let train_metrics = train(
            train_loader,
            &mut self.model,
            &mut self.optimizer,
            &self.criterion,
            self.regularizer.as_ref().map(|r| r as &dyn Regularizer),
            schedule.as_ref().map(|s| s as &dyn LrSchedule),
            &self.device,
        )?;
        self.epoch += 1;

        let last = self.epoch == self.config.epochs;
        let due = |every: usize| every > 0 && (self.epoch % every == 0 || last);
        let eval_due = due(self.config.eval_every);
        let save_due = due(self.config.save_every);
        let test_metrics = match test_loader {
            Some(loader) if eval_due => Some(self.evaluate(train_loader, loader)?),
            _ => None,
        };

        let report = EpochReport {
            epoch,
            lr,
            train: train_metrics,
            test: test_metrics,
            seconds: start.elapsed().as_secs_f64(),
        };
        tracing::info!(
            epoch,
            lr = format!("{lr:.5}"),
            train_loss = format!("{:.4}", report.train.loss),
            train_acc = format!("{:.2}", report.train.accuracy),
            test_nll = report.test.map_or(f64::NAN, |m| m.nll),
            test_acc = report.test.map_or(f64::NAN, |m| m.accuracy),
            secs = format!("{:.2}", report.seconds),
            "epoch"
        );

        if save_due {
            self.save()?;
        }
        Ok(report)
    }

    /// Run the remaining epochs, calling `on_epoch` after each.
    pub fn fit<D: LabeledDataset + ?Sized>(
        &mut self,
        train_loader: &DataLoader<'_, D>,
        test_loader: Option<&DataLoader<'_, D>>,
        on_epoch: &mut dyn FnMut(&EpochReport),
    ) -> anyhow::Result<Vec<EpochReport>> {
        if self.epoch == 0 && self.config.save_every > 0 {
            self.save()?;
        }
        let mut reports = Vec::with_capacity(self.config.epochs.saturating_sub(self.epoch));
        while self.epoch < self.config.epochs {
            let report = self.run_epoch(train_loader, test_loader)?;
            on_epoch(&report);
            reports.push(report);
        }
        Ok(reports)
    }

    /// Evaluate on `test_loader`, first rebuilding batch-norm statistics
    /// from `train_loader` when an evaluation curve position is configured.
    pub fn evaluate<D: LabeledDataset + ?Sized>(
        &mut self,
        train_loader: &DataLoader<'_, D>,
        test_loader: &DataLoader<'_, D>,
    ) -> anyhow::Result<EvalMetrics> {
        let t = self.config.eval_t;
        if t.is_some() {
            update_bn(train_loader, &mut self.model, t, &self.device)?;
        }
        test(
            test_loader,
            &mut self.model,
            &self.criterion,
            self.regularizer.as_ref().map(|r| r as &dyn Regularizer),
            t,
            &self.device,
        )
    }

    /// Checkpoint the model state and optimizer settings under the current
    /// epoch, and write `config.json` next to it.
    pub fn save(&self) -> anyhow::Result<PathBuf> {
        let groups: Vec<ParamsSgd> = self
            .optimizer
            .param_groups()
            .iter()
            .map(|g| g.params)
            .collect();
        let payload = CheckpointPayload::new()
            .tensors("model", &self.model.state_dict()?)
            .value("optimizer", &groups)?;
        let path = save_checkpoint(
            &self.config.output_dir,
            self.epoch,
            &self.config.checkpoint_name,
            &payload,
        )?;
        self.model_config
            .save(&self.config.output_dir.join("config.json"))?;
        Ok(path)
    }

    /// Continue from a checkpoint written by [`save`](Self::save).
    pub fn resume(&mut self, path: &Path) -> anyhow::Result<()> {
        let ckpt = load_checkpoint(path, &self.device)?;
        self.model.load_state_dict(&ckpt.group("model"))?;
        if let Some(groups) = ckpt.value::<Vec<ParamsSgd>>("optimizer")? {
            for (group, params) in self.optimizer.param_groups_mut().iter_mut().zip(groups) {
                group.params = params;
            }
        }
        self.epoch = ckpt.epoch;
        tracing::info!(path = %path.display(), epoch = self.epoch, "resumed");
        Ok(())
    }

    pub fn optimizer(&self) -> &Sgd {
        &self.optimizer
    }

    pub fn device(&self) -> &Device {
        &self.device
    }
}
