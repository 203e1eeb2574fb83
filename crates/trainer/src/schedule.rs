use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::optim::Optimizer;

/// Epoch-indexed warmup then exponential decay of the learning rate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LrPolicy {
    pub warmup: usize,
    pub factor: f64,
    pub floor: f64,
}

impl Default for LrPolicy {
    fn default() -> Self {
        Self {
            warmup: 3,
            factor: 3e-3,
            floor: 1e-7,
        }
    }
}

impl LrPolicy {
    /// Multiplier applied to the base learning rate for `epoch`.
    pub fn multiplier(&self, epoch: usize) -> f64 {
        let growth = 1.0 + self.factor;
        if epoch < self.warmup {
            growth.powi(epoch as i32)
        } else {
            let decay = (1.0 - self.factor).powi((epoch - self.warmup) as i32);
            (growth.powi(self.warmup as i32) * decay).max(self.floor)
        }
    }
}

/// Multiplier for `epoch` under the default policy.
pub fn compute_lr(epoch: usize) -> f64 {
    LrPolicy::default().multiplier(epoch)
}

/// Applies `base_lr * policy(epoch)` to an optimizer, one tick per epoch.
#[derive(Debug, Clone)]
pub struct LrSchedule {
    base_lr: f64,
    policy: LrPolicy,
    epoch: usize,
}

impl LrSchedule {
    pub fn new(base_lr: f64, policy: LrPolicy, epoch: usize) -> Self {
        Self {
            base_lr,
            policy,
            epoch,
        }
    }

    pub fn epoch(&self) -> usize {
        self.epoch
    }

    pub fn current_lr(&self) -> f64 {
        self.base_lr * self.policy.multiplier(self.epoch)
    }

    pub fn apply<O: Optimizer + ?Sized>(&self, optimizer: &mut O) -> Result<f64> {
        let lr = self.current_lr();
        optimizer.set_lr(lr)?;
        Ok(lr)
    }

    /// Advances one epoch and applies the new rate.
    pub fn step<O: Optimizer + ?Sized>(&mut self, optimizer: &mut O) -> Result<f64> {
        self.epoch += 1;
        self.apply(optimizer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_at_one_for_any_factor() {
        for factor in [0.0, 1e-3, 3e-3, 0.5] {
            let policy = LrPolicy {
                factor,
                ..LrPolicy::default()
            };
            assert_eq!(policy.multiplier(0), 1.0);
        }
        assert_eq!(compute_lr(0), 1.0);
    }

    #[test]
    fn ramps_up_then_decays() {
        let policy = LrPolicy::default();
        for epoch in 1..policy.warmup {
            assert!(policy.multiplier(epoch) > policy.multiplier(epoch - 1));
        }
        for epoch in policy.warmup + 1..200 {
            assert!(policy.multiplier(epoch) <= policy.multiplier(epoch - 1));
        }
    }

    #[test]
    fn never_drops_below_floor() {
        let policy = LrPolicy {
            warmup: 1,
            factor: 0.5,
            floor: 1e-3,
        };
        for epoch in 0..100 {
            assert!(policy.multiplier(epoch) >= policy.floor);
        }
        assert_eq!(policy.multiplier(99), policy.floor);
    }

    #[test]
    fn schedule_resumes_at_checkpoint_epoch() {
        let schedule = LrSchedule::new(1e-4, LrPolicy::default(), 5);
        let expected = 1e-4 * 1.003f64.powi(3) * 0.997f64.powi(2);
        assert!((schedule.current_lr() - expected).abs() < 1e-15);
    }
}
