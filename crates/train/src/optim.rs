//! SGD with momentum over parameter groups, and the rate setter.

use candle_core::{backprop::GradStore, Result, Tensor, Var};
use candle_nn::Optimizer;
use serde::{Deserialize, Serialize};

/// Hyper-parameters of one parameter group.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ParamsSgd {
    pub lr: f64,
    pub momentum: f64,
    /// Classical weight decay: `wd · p` is added to the gradient.
    pub weight_decay: f64,
}

impl Default for ParamsSgd {
    fn default() -> Self {
        Self {
            lr: 0.01,
            momentum: 0.9,
            weight_decay: 0.0,
        }
    }
}

struct Slot {
    var: Var,
    velocity: Option<Tensor>,
}

/// A set of parameters sharing one learning rate.
pub struct ParamGroup {
    slots: Vec<Slot>,
    pub params: ParamsSgd,
}

impl ParamGroup {
    fn new(vars: Vec<Var>, params: ParamsSgd) -> Self {
        let slots = vars
            .into_iter()
            .map(|var| Slot {
                var,
                velocity: None,
            })
            .collect();
        Self { slots, params }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        let ParamsSgd {
            lr,
            momentum,
            weight_decay,
        } = self.params;
        for slot in &mut self.slots {
            let Some(grad) = grads.get(slot.var.as_tensor()) else {
                continue;
            };
            let mut d_p = grad.clone();
            if weight_decay != 0.0 {
                d_p = (d_p + slot.var.as_tensor().affine(weight_decay, 0.0)?)?;
            }
            if momentum != 0.0 {
                let v = match slot.velocity.take() {
                    Some(v) => (v.affine(momentum, 0.0)? + &d_p)?,
                    None => d_p,
                };
                let v = v.detach();
                d_p = v.clone();
                slot.velocity = Some(v);
            }
            let updated = (slot.var.as_tensor() - d_p.affine(lr, 0.0)?)?;
            slot.var.set(&updated)?;
        }
        Ok(())
    }
}

/// Stochastic gradient descent with heavy-ball momentum.
///
/// `Optimizer::new` builds a single group; more can be added with
/// [`Sgd::add_param_group`]. The first momentum step seeds the velocity with
/// the raw gradient.
pub struct Sgd {
    groups: Vec<ParamGroup>,
}

impl Sgd {
    pub fn add_param_group(&mut self, vars: Vec<Var>, params: ParamsSgd) {
        self.groups.push(ParamGroup::new(vars, params));
    }

    pub fn param_groups(&self) -> &[ParamGroup] {
        &self.groups
    }

    pub fn param_groups_mut(&mut self) -> &mut [ParamGroup] {
        &mut self.groups
    }
}

impl Optimizer for Sgd {
    type Config = ParamsSgd;

    fn new(vars: Vec<Var>, config: ParamsSgd) -> Result<Self> {
        Ok(Self {
            groups: vec![ParamGroup::new(vars, config)],
        })
    }

    fn step(&mut self, grads: &GradStore) -> Result<()> {
        for group in &mut self.groups {
            group.step(grads)?;
        }
        Ok(())
    }

    /// Rate of the first group.
    fn learning_rate(&self) -> f64 {
        self.groups.first().map(|g| g.params.lr).unwrap_or(0.0)
    }

    fn set_learning_rate(&mut self, lr: f64) {
        for group in &mut self.groups {
            group.params.lr = lr;
        }
    }
}

/// Set the learning rate of every parameter group and return it.
///
/// The value is applied as given; zero and negative rates are the caller's call.
pub fn adjust_learning_rate<O: Optimizer>(optimizer: &mut O, lr: f64) -> f64 {
    optimizer.set_learning_rate(lr);
    lr
}

// ── Tests ───────────────────────────────────────────────────────────────────
