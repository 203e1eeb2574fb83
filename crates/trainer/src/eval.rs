use indicatif::{ProgressBar, ProgressStyle};

use crate::dataset::{BatchFactory, Batches};
use crate::error::Result;
use crate::model::SequenceModel;
use crate::optim::Optimizer;
use crate::step::StepExecutor;

pub(crate) fn progress_bar(len: usize, desc: &str, visible: bool) -> ProgressBar {
    if !visible {
        return ProgressBar::hidden();
    }
    let pb = ProgressBar::new(len as u64);
    let template = "{prefix} {bar:30.green/black} {pos}/{len} [{elapsed}<{eta}] {msg}";
    if let Ok(style) = ProgressStyle::default_bar().template(template) {
        pb.set_style(style);
    }
    pb.set_prefix(desc.to_string());
    pb
}

/// Lazy pass over an evaluation split yielding one loss per batch.
///
/// Gradient tracking is disabled and the model runs in evaluation mode for as
/// long as the value is alive. Start another pass by calling [`evaluate`]
/// again.
pub struct Evaluation<'a, M, O> {
    executor: &'a StepExecutor<M, O>,
    batches: Batches<'a>,
    progress: ProgressBar,
    _no_grad: tch::NoGradGuard,
}

pub fn evaluate<'a, M, O>(
    executor: &'a StepExecutor<M, O>,
    split: &'a dyn BatchFactory,
    num_steps: usize,
    desc: &str,
) -> Result<Evaluation<'a, M, O>>
where
    M: SequenceModel,
    O: Optimizer,
{
    let batches = split.batches()?;
    let progress = progress_bar(num_steps, desc, executor.context().is_master());
    Ok(Evaluation {
        executor,
        batches,
        progress,
        _no_grad: tch::no_grad_guard(),
    })
}

impl<M: SequenceModel, O: Optimizer> Iterator for Evaluation<'_, M, O> {
    type Item = Result<f64>;

    fn next(&mut self) -> Option<Self::Item> {
        let batch = match self.batches.next() {
            Some(Ok(batch)) => batch,
            Some(Err(err)) => return Some(Err(err)),
            None => {
                self.progress.finish_and_clear();
                return None;
            }
        };

        let result = self.executor.forward_step(&batch, false).map(|out| {
            let loss = out.loss.double_value(&[]);
            self.progress.set_message(format!("loss={loss:.4} acc={:.4}", out.accuracy));
            self.progress.inc(1);
            loss
        });
        Some(result)
    }
}

/// Mean of a loss sequence; an empty sequence averages to `0.0`.
pub fn mean_loss<I>(losses: I) -> Result<f64>
where
    I: IntoIterator<Item = Result<f64>>,
{
    let mut total = 0.0;
    let mut count = 0usize;
    for loss in losses {
        total += loss?;
        count += 1;
    }
    Ok(if count == 0 { 0.0 } else { total / count as f64 })
}
