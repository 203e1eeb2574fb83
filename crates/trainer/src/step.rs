use std::any::Any;
use std::panic::{self, AssertUnwindSafe};

use log::debug;
use tch::Tensor;

use crate::context::ExecutionContext;
use crate::dataset::Batch;
use crate::error::{self, Result};
use crate::loss::{compute_loss, LossAccuracy};
use crate::model::SequenceModel;
use crate::optim::Optimizer;
use crate::reduce::MetricReducer;
use crate::state::RunState;

/// Knobs of a single optimization step.
#[derive(Debug, Clone, Copy)]
pub struct StepSettings {
    pub grad_accum_steps: usize,
    pub clip_norm: f64,
    pub ignore_idx: i64,
}

impl Default for StepSettings {
    fn default() -> Self {
        Self {
            grad_accum_steps: 1,
            clip_norm: 1.0,
            ignore_idx: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SkipReason {
    NanLoss,
    OutOfMemory,
    /// Another rank skipped the batch.
    PeerSkipped,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum StepOutcome {
    /// Loss (unscaled, per token) and accuracy, averaged across ranks.
    Completed { loss: f64, accuracy: f64 },
    Skipped(SkipReason),
}

impl StepOutcome {
    pub fn metrics(&self) -> Option<(f64, f64)> {
        match *self {
            StepOutcome::Completed { loss, accuracy } => Some((loss, accuracy)),
            StepOutcome::Skipped(_) => None,
        }
    }
}

/// Runs forward, backward and optimizer updates for one micro-batch at a
/// time, containing NaN losses and allocation failures.
pub struct StepExecutor<M, O> {
    model: M,
    optimizer: O,
    reducer: MetricReducer,
    ctx: ExecutionContext,
    settings: StepSettings,
}

impl<M: SequenceModel, O: Optimizer> StepExecutor<M, O> {
    pub fn new(
        model: M,
        optimizer: O,
        reducer: MetricReducer,
        ctx: ExecutionContext,
        settings: StepSettings,
    ) -> Self {
        Self {
            model,
            optimizer,
            reducer,
            ctx,
            settings: StepSettings {
                grad_accum_steps: settings.grad_accum_steps.max(1),
                ..settings
            },
        }
    }

    pub fn model(&self) -> &M {
        &self.model
    }

    pub fn optimizer(&self) -> &O {
        &self.optimizer
    }

    pub fn optimizer_mut(&mut self) -> &mut O {
        &mut self.optimizer
    }

    pub fn context(&self) -> &ExecutionContext {
        &self.ctx
    }

    pub fn reducer(&self) -> &MetricReducer {
        &self.reducer
    }

    /// Model and optimizer together, for restoring a checkpoint.
    pub fn parts_mut(&mut self) -> (&M, &mut O) {
        (&self.model, &mut self.optimizer)
    }

    /// Forward pass and masked loss, with the accuracy averaged across ranks.
    /// With `train == false` the model runs in evaluation mode; gradient
    /// tracking is up to the caller.
    pub fn forward_step(&self, batch: &Batch, train: bool) -> Result<LossAccuracy> {
        let LossAccuracy { loss, accuracy } = self.forward_local(batch, train)?;
        let accuracy = self.reducer.reduce(accuracy)?;
        Ok(LossAccuracy { loss, accuracy })
    }

    fn forward_local(&self, batch: &Batch, train: bool) -> Result<LossAccuracy> {
        let inputs = batch.inputs.to_device(self.ctx.device);
        let targets = batch.targets.to_device(self.ctx.device);

        let logits = tch::autocast(self.ctx.precision.is_mixed(), || {
            self.model.forward_t(&inputs, train)
        });
        compute_loss(&logits, &targets, self.settings.ignore_idx)
    }

    /// One micro-batch of training. `state.step` advances only for batches
    /// that reach backward; the optimizer updates every `grad_accum_steps`
    /// such steps.
    ///
    /// Skipping is decided by the whole group: when any rank hits a NaN loss
    /// or an allocation failure, every rank skips the batch. Each rank issues
    /// the same sequence of collectives whatever happens locally.
    pub fn train_step(&mut self, batch: &Batch, state: &mut RunState) -> Result<StepOutcome> {
        let local = match contain_oom(|| self.forward_local(batch, true)) {
            Ok(Ok(out)) => {
                let loss_value = out.loss.double_value(&[]);
                if loss_value.is_nan() {
                    Err(SkipReason::NanLoss)
                } else {
                    Ok((out, loss_value))
                }
            }
            Ok(Err(err)) if err.is_out_of_memory() => {
                debug!("forward failed: {err}");
                Err(SkipReason::OutOfMemory)
            }
            Ok(Err(err)) => return Err(err),
            Err(reason) => {
                debug!("forward failed: {reason}");
                Err(SkipReason::OutOfMemory)
            }
        };

        // backward has not run yet, so accumulated gradients are untouched
        let local_skip = local.as_ref().err().copied();
        let (out, loss_value) = match (self.agree_on_skip(local_skip)?, local) {
            (None, Ok(pair)) => pair,
            (Some(reason), _) | (None, Err(reason)) => return self.skip(state, reason, false),
        };

        let accum = self.settings.grad_accum_steps;
        let backward_skip = match contain_oom(|| backward(&out.loss, accum)) {
            Ok(()) => None,
            Err(reason) => {
                debug!("backward failed: {reason}");
                Some(SkipReason::OutOfMemory)
            }
        };
        if let Some(reason) = self.agree_on_skip(backward_skip)? {
            // gradients of this batch are partial on one rank at least
            return self.skip(state, reason, true);
        }
        self.optimizer.clip_grad_norm(self.settings.clip_norm)?;

        state.step += 1;
        if state.step % accum == 0 {
            self.optimizer.step()?;
            self.optimizer.zero_grad()?;
        }

        let loss = self.reducer.reduce(loss_value)?;
        let accuracy = self.reducer.reduce(out.accuracy)?;
        Ok(StepOutcome::Completed { loss, accuracy })
    }

    /// Combines the local skip verdict with every other rank's.
    fn agree_on_skip(&self, local: Option<SkipReason>) -> Result<Option<SkipReason>> {
        let any = self.reducer.any(local.is_some())?;
        Ok(match local {
            Some(reason) => Some(reason),
            None if any => Some(SkipReason::PeerSkipped),
            None => None,
        })
    }

    fn skip(
        &mut self,
        state: &mut RunState,
        reason: SkipReason,
        discard_grads: bool,
    ) -> Result<StepOutcome> {
        debug!("skipping step ({reason:?})");
        state.skip_counter += 1;
        if discard_grads {
            self.optimizer.zero_grad()?;
        }
        Ok(StepOutcome::Skipped(reason))
    }
}

fn backward(loss: &Tensor, grad_accum_steps: usize) {
    let scaled = loss / grad_accum_steps as f64;
    scaled.backward();
}

/// Runs `f`, turning a libtorch allocation failure into `Err(message)`.
/// Any other panic keeps unwinding.
fn contain_oom<T>(f: impl FnOnce() -> T) -> std::result::Result<T, String> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Ok(value),
        Err(payload) => {
            let message = panic_message(payload.as_ref());
            if error::is_out_of_memory(&message) {
                Err(message)
            } else {
                panic::resume_unwind(payload)
            }
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = payload.downcast_ref::<&str>() {
        msg.to_string()
    } else {
        String::new()
    }
}
