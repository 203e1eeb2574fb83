use std::sync::Arc;

use log::{debug, info};

use crate::checkpoint::CheckpointStore;
use crate::config::TrainConfig;
use crate::context::ExecutionContext;
use crate::dataset::{num_steps, BatchFactory, DatasetSplits};
use crate::error::Result;
use crate::eval::{evaluate, mean_loss, progress_bar};
use crate::model::SequenceModel;
use crate::optim::Optimizer;
use crate::reduce::{Collective, MetricReducer};
use crate::schedule::LrSchedule;
use crate::sink::ScalarSink;
use crate::state::{EvalVerdict, RunState};
use crate::step::{StepExecutor, StepOutcome};

/// How a run ended.
#[derive(Debug, Clone, PartialEq)]
pub struct RunSummary {
    pub state: RunState,
    pub test_loss: f64,
    /// Patience ran out before `max_epochs`.
    pub stopped_early: bool,
    pub epochs_run: usize,
}

enum EpochEnd {
    Completed,
    PatienceExhausted,
}

/// Drives epochs over the training split, validating every
/// `eval_every_step` global steps and persisting the best model.
pub struct Trainer<M, O> {
    config: TrainConfig,
    executor: StepExecutor<M, O>,
    store: CheckpointStore,
    sink: Option<Box<dyn ScalarSink>>,
    schedule: LrSchedule,
    state: RunState,
}

impl<M: SequenceModel, O: Optimizer> Trainer<M, O> {
    /// Builds the trainer and restores the latest checkpoint, if any.
    ///
    /// `sink` is only used on the master process.
    pub fn new(
        config: TrainConfig,
        model: M,
        optimizer: O,
        ctx: ExecutionContext,
        collective: Arc<dyn Collective>,
        sink: Box<dyn ScalarSink>,
    ) -> Result<Self> {
        config.validate()?;

        let reducer = MetricReducer::new(collective);
        let settings = config.step_settings();
        let mut executor = StepExecutor::new(model, optimizer, reducer, ctx, settings);
        let store = CheckpointStore::new(config.run_dir(), config.save_policy);

        let (model, optimizer) = executor.parts_mut();
        let resume = store.load(model, optimizer)?;
        let state = RunState::from_resume(resume);
        if resume.epoch > 0 || resume.step > 0 {
            info!(
                "resuming at epoch {} step {} (best val loss {:.4})",
                resume.epoch, resume.step, resume.best_val_loss
            );
        }

        let schedule = LrSchedule::new(config.learning_rate, config.lr_policy, state.epoch);
        let sink = if ctx.is_master() { Some(sink) } else { None };

        Ok(Self {
            config,
            executor,
            store,
            sink,
            schedule,
            state,
        })
    }

    pub fn state(&self) -> &RunState {
        &self.state
    }

    pub fn executor(&self) -> &StepExecutor<M, O> {
        &self.executor
    }

    pub fn checkpoint_store(&self) -> &CheckpointStore {
        &self.store
    }

    fn is_master(&self) -> bool {
        self.executor.context().is_master()
    }

    fn world_size(&self) -> usize {
        self.executor.context().distributed.world_size
    }

    pub fn run(&mut self, splits: &DatasetSplits) -> Result<RunSummary> {
        if self.is_master() {
            info!("{:?}", self.config);
        }

        let init_epoch = self.state.epoch;
        let mut stopped_early = false;

        for epoch in init_epoch..self.config.max_epochs {
            self.state.epoch = epoch;
            let lr = self.schedule.apply(self.executor.optimizer_mut())?;
            debug!("epoch {epoch} learning rate {lr:.3e}");

            let (end, train_loss) = self.train_epoch(epoch, splits)?;

            if self.is_master() {
                info!("train loss: {train_loss:.4}");
            }

            self.schedule.step(self.executor.optimizer_mut())?;
            self.state.epoch = epoch + 1;

            if let EpochEnd::PatienceExhausted = end {
                info!(
                    "no improvement in {} evaluations, stopping after epoch {epoch}",
                    self.state.patience_counter
                );
                stopped_early = true;
                break;
            }
        }

        if let Some(sink) = self.sink.as_mut() {
            sink.close()?;
        }

        let test_loss = self.evaluate_split(splits.test.as_ref(), "Test")?;
        if self.is_master() {
            info!("test loss: {test_loss:.4}");
        }

        Ok(RunSummary {
            state: self.state.clone(),
            test_loss,
            stopped_early,
            epochs_run: self.state.epoch.saturating_sub(init_epoch),
        })
    }

    /// One pass over the training split. Returns how the epoch ended and the
    /// mean loss of its completed steps.
    fn train_epoch(&mut self, epoch: usize, splits: &DatasetSplits) -> Result<(EpochEnd, f64)> {
        let total = num_steps(
            splits.train.example_count(),
            self.config.batch_size,
            self.world_size(),
        );
        let progress = progress_bar(total, &format!("Train {epoch}"), self.is_master());

        let mut train_loss = Vec::new();
        let mut end = EpochEnd::Completed;

        splits.train.set_epoch(epoch);
        for batch in splits.train.batches()? {
            let batch = batch?;
            let outcome = self.executor.train_step(&batch, &mut self.state)?;
            progress.inc(1);

            let StepOutcome::Completed { loss, accuracy } = outcome else {
                progress.set_message(format!("skip={}", self.state.skip_counter));
                continue;
            };

            if self.is_master() {
                train_loss.push(loss);
                self.add_scalar("train/loss", loss)?;
                self.add_scalar("train/acc", accuracy)?;
            }
            progress.set_message(format!(
                "loss={loss:.4} acc={accuracy:.4} skip={}",
                self.state.skip_counter
            ));

            if self.state.step % self.config.eval_every_step == 0 {
                if let EvalVerdict::Exhausted = self.validate(splits.valid.as_ref())? {
                    end = EpochEnd::PatienceExhausted;
                    break;
                }
            }
        }
        progress.finish_and_clear();

        let mean = if train_loss.is_empty() {
            0.0
        } else {
            train_loss.iter().sum::<f64>() / train_loss.len() as f64
        };
        Ok((end, mean))
    }

    /// Validation pass plus the early-stopping decision. Every rank sees the
    /// same averaged loss, so every rank takes the same branch.
    fn validate(&mut self, valid: &dyn BatchFactory) -> Result<EvalVerdict> {
        let local = self.evaluate_split(valid, "Eval")?;
        let val_loss = self.executor.reducer().reduce(local)?;

        if self.is_master() {
            info!("val loss: {val_loss:.4}");
            self.add_scalar("val/loss", val_loss)?;
        }

        let verdict = self.state.record_eval(val_loss, self.config.patience);
        if verdict == EvalVerdict::Improved && self.is_master() {
            self.store.save(
                self.executor.model(),
                self.executor.optimizer(),
                self.state.resume_point(),
            )?;
        }
        Ok(verdict)
    }

    fn evaluate_split(&self, split: &dyn BatchFactory, desc: &str) -> Result<f64> {
        let steps = num_steps(split.example_count(), self.config.batch_size, self.world_size());
        mean_loss(evaluate(&self.executor, split, steps, desc)?)
    }

    fn add_scalar(&mut self, tag: &str, value: f64) -> Result<()> {
        let step = self.state.step;
        match self.sink.as_mut() {
            Some(sink) => sink.add_scalar(tag, value, step),
            None => Ok(()),
        }
    }
}
