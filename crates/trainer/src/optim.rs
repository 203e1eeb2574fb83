use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use tch::nn::{self, OptimizerConfig};

use crate::error::Result;

/// Serializable state of an optimizer, stored next to the parameters in a
/// checkpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct OptimizerState {
    pub base_lr: f64,
    pub lr: f64,
    /// Optimizer steps taken through the wrapper, across resumes. Internal
    /// step counts of the backing optimizer are not part of this state.
    pub updates: u64,
    #[serde(default)]
    pub extra: BTreeMap<String, f64>,
}

/// The parameter-update collaborator driven by the step executor.
pub trait Optimizer {
    fn step(&mut self) -> Result<()>;

    fn zero_grad(&mut self) -> Result<()>;

    /// Rescales accumulated gradients so their global norm is at most `max_norm`.
    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<()>;

    fn set_lr(&mut self, lr: f64) -> Result<()>;

    fn state_dict(&self) -> OptimizerState;

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()>;
}

/// AdamW from `tch::nn` behind the [`Optimizer`] seam.
///
/// libtorch keeps the moment buffers private to the C++ optimizer, so the
/// saved state covers the learning rate, weight decay and update count; the
/// moments restart from zero after a resume.
pub struct TchAdamW {
    inner: nn::Optimizer,
    base_lr: f64,
    lr: f64,
    weight_decay: f64,
    updates: u64,
}

impl TchAdamW {
    pub fn new(vs: &nn::VarStore, lr: f64, weight_decay: f64) -> Result<Self> {
        let inner = nn::AdamW {
            wd: weight_decay,
            ..Default::default()
        }
        .build(vs, lr)?;

        Ok(Self {
            inner,
            base_lr: lr,
            lr,
            weight_decay,
            updates: 0,
        })
    }

    pub fn lr(&self) -> f64 {
        self.lr
    }

    pub fn updates(&self) -> u64 {
        self.updates
    }
}

impl Optimizer for TchAdamW {
    fn step(&mut self) -> Result<()> {
        self.inner.step();
        self.updates += 1;
        Ok(())
    }

    fn zero_grad(&mut self) -> Result<()> {
        self.inner.zero_grad();
        Ok(())
    }

    fn clip_grad_norm(&mut self, max_norm: f64) -> Result<()> {
        self.inner.clip_grad_norm(max_norm);
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) -> Result<()> {
        self.inner.set_lr(lr);
        self.lr = lr;
        Ok(())
    }

    fn state_dict(&self) -> OptimizerState {
        let mut extra = BTreeMap::new();
        extra.insert("weight_decay".to_string(), self.weight_decay);
        OptimizerState {
            base_lr: self.base_lr,
            lr: self.lr,
            updates: self.updates,
            extra,
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> Result<()> {
        self.base_lr = state.base_lr;
        self.updates = state.updates;
        if let Some(wd) = state.extra.get("weight_decay") {
            self.inner.set_weight_decay(*wd);
            self.weight_decay = *wd;
        }
        self.set_lr(state.lr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn state_round_trips_through_load() {
        let vs = nn::VarStore::new(Device::Cpu);
        let w = vs.root().zeros("w", &[3]);
        let mut opt = TchAdamW::new(&vs, 1e-3, 1e-6).unwrap();

        let loss = (&w - Tensor::ones([3], (Kind::Float, Device::Cpu))).square().sum(Kind::Float);
        loss.backward();
        opt.step().unwrap();
        opt.set_lr(5e-4).unwrap();
        let saved = opt.state_dict();
        assert_eq!(saved.updates, 1);

        let other_vs = nn::VarStore::new(Device::Cpu);
        let _ = other_vs.root().zeros("w", &[3]);
        let mut restored = TchAdamW::new(&other_vs, 1e-3, 0.0).unwrap();
        restored.load_state_dict(&saved).unwrap();
        assert_eq!(restored.state_dict(), saved);
        assert_eq!(restored.lr(), 5e-4);
    }
}
