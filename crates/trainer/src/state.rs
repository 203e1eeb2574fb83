use serde::{Deserialize, Serialize};

use crate::checkpoint::ResumePoint;

/// Progress of a run. Owned by the trainer and lent to the step executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunState {
    /// Index of the epoch in progress, or the next one between epochs.
    pub epoch: usize,
    /// Global count of completed (non-skipped) micro-batch steps.
    pub step: usize,
    pub best_val_loss: f64,
    /// Consecutive evaluations without improvement.
    pub patience_counter: usize,
    /// Micro-batches dropped for a NaN loss or an allocation failure.
    pub skip_counter: usize,
}

impl Default for RunState {
    fn default() -> Self {
        Self::from_resume(ResumePoint::cold_start())
    }
}

/// What a validation result means for early stopping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalVerdict {
    /// New best; the caller persists a checkpoint.
    Improved,
    Stale,
    /// Patience ran out; the epoch loop ends.
    Exhausted,
}

impl RunState {
    pub fn from_resume(point: ResumePoint) -> Self {
        Self {
            epoch: point.epoch,
            step: point.step,
            best_val_loss: point.best_val_loss,
            patience_counter: 0,
            skip_counter: 0,
        }
    }

    /// Snapshot written to a checkpoint. A run resumed from it starts at the
    /// epoch after the one in progress.
    pub fn resume_point(&self) -> ResumePoint {
        ResumePoint {
            best_val_loss: self.best_val_loss,
            epoch: self.epoch + 1,
            step: self.step,
        }
    }

    pub fn record_eval(&mut self, val_loss: f64, patience: usize) -> EvalVerdict {
        if val_loss < self.best_val_loss {
            self.patience_counter = 0;
            self.best_val_loss = val_loss;
            return EvalVerdict::Improved;
        }

        self.patience_counter += 1;
        if self.patience_counter >= patience {
            EvalVerdict::Exhausted
        } else {
            EvalVerdict::Stale
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stops_after_patience_non_improving_evaluations() {
        let mut state = RunState::default();
        let verdicts: Vec<_> = [1.0, 0.9, 0.95, 1.0, 1.1]
            .into_iter()
            .map(|loss| state.record_eval(loss, 3))
            .collect();

        assert_eq!(
            verdicts,
            vec![
                EvalVerdict::Improved,
                EvalVerdict::Improved,
                EvalVerdict::Stale,
                EvalVerdict::Stale,
                EvalVerdict::Exhausted,
            ]
        );
        assert_eq!(state.best_val_loss, 0.9);
        assert_eq!(state.patience_counter, 3);
    }

    #[test]
    fn improvement_resets_patience() {
        let mut state = RunState::default();
        state.record_eval(1.0, 2);
        assert_eq!(state.record_eval(1.0, 2), EvalVerdict::Stale);
        assert_eq!(state.record_eval(0.5, 2), EvalVerdict::Improved);
        assert_eq!(state.patience_counter, 0);
    }

    #[test]
    fn nan_validation_never_improves() {
        let mut state = RunState::default();
        assert_eq!(state.record_eval(f64::NAN, 5), EvalVerdict::Stale);
        assert!(state.best_val_loss.is_infinite());
    }

    #[test]
    fn resume_point_targets_the_next_epoch() {
        let state = RunState {
            epoch: 2,
            step: 40,
            best_val_loss: 1.5,
            patience_counter: 1,
            skip_counter: 3,
        };
        let point = state.resume_point();
        assert_eq!((point.epoch, point.step, point.best_val_loss), (3, 40, 1.5));
        let resumed = RunState::from_resume(point);
        assert_eq!(resumed.patience_counter, 0);
        assert_eq!(resumed.epoch, 3);
    }
}
