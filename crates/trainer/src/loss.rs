use tch::{Kind, Reduction, Tensor};

use crate::error::{Result, TrainError};

/// Result of one forward pass.
#[derive(Debug)]
pub struct LossAccuracy {
    /// Per-token negative log-likelihood, still attached to the graph.
    pub loss: Tensor,
    pub accuracy: f64,
}

/// Masked token-level NLL and accuracy.
///
/// `logits` is `[.., vocab]` and `targets` holds one id per leading position.
/// Positions whose target equals `ignore_idx` contribute neither to the loss
/// nor to the accuracy. When every position is ignored the loss is `0.0`
/// (kept on the graph so backward is still valid) and the accuracy is `0.0`.
pub fn compute_loss(logits: &Tensor, targets: &Tensor, ignore_idx: i64) -> Result<LossAccuracy> {
    let vocab_size = *logits
        .size()
        .last()
        .ok_or_else(|| TrainError::Data("logits are missing the vocabulary dimension".into()))?;

    let logits_view = logits.reshape([-1, vocab_size]).to_kind(Kind::Float);
    let targets_view = targets.reshape([-1]).to_kind(Kind::Int64);

    let positions = logits_view.size()[0];
    if targets_view.size()[0] != positions {
        return Err(TrainError::Data(format!(
            "{} target ids for {} logit rows",
            targets_view.size()[0],
            positions
        )));
    }

    let log_probs = logits_view.log_softmax(-1, Kind::Float);
    let loss = log_probs.g_nll_loss::<Tensor>(&targets_view, None, Reduction::Sum, ignore_idx);

    let not_ignore = targets_view.ne(ignore_idx);
    let target_tokens = not_ignore.sum(Kind::Int64).int64_value(&[]);

    let preds = log_probs.argmax(-1, false);
    let correct = preds
        .eq_tensor(&targets_view)
        .logical_and(&not_ignore)
        .sum(Kind::Int64)
        .int64_value(&[]);

    if target_tokens == 0 {
        return Ok(LossAccuracy {
            loss: loss * 0.0,
            accuracy: 0.0,
        });
    }

    Ok(LossAccuracy {
        loss: loss / target_tokens as f64,
        accuracy: correct as f64 / target_tokens as f64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAD: i64 = 0;

    fn one_hot_logits(targets: &[i64], vocab: i64) -> Tensor {
        let eye = Tensor::eye(vocab, (Kind::Float, tch::Device::Cpu));
        let rows = Tensor::from_slice(targets);
        // confident enough that softmax saturates to exactly one
        eye.index_select(0, &rows) * 200.0 - 100.0
    }

    #[test]
    fn perfect_predictions_have_zero_loss_and_full_accuracy() {
        let targets = [3i64, 1, 2, 4];
        let logits = one_hot_logits(&targets, 5);
        let out = compute_loss(&logits, &Tensor::from_slice(&targets), PAD).unwrap();
        assert_eq!(out.accuracy, 1.0);
        assert_eq!(out.loss.double_value(&[]), 0.0);
    }

    #[test]
    fn ignored_positions_are_excluded() {
        // the pad position predicts a wrong id but must not count
        let logits = one_hot_logits(&[3, 1, 2], 5);
        let targets = Tensor::from_slice(&[3i64, 1, PAD]);
        let out = compute_loss(&logits, &targets, PAD).unwrap();
        assert_eq!(out.accuracy, 1.0);
        assert_eq!(out.loss.double_value(&[]), 0.0);
    }

    #[test]
    fn accuracy_counts_only_correct_tokens() {
        let logits = one_hot_logits(&[3, 1, 2, 2], 5);
        let targets = Tensor::from_slice(&[3i64, 4, 2, 1]);
        let out = compute_loss(&logits, &targets, PAD).unwrap();
        assert_eq!(out.accuracy, 0.5);
        assert!(out.loss.double_value(&[]) > 0.0);
    }

    #[test]
    fn all_ignored_batch_is_zero_not_a_fault() {
        let logits =
            Tensor::randn([2, 3, 5], (Kind::Float, tch::Device::Cpu)).set_requires_grad(true);
        let targets = Tensor::full([2, 3], PAD, (Kind::Int64, tch::Device::Cpu));
        let out = compute_loss(&logits, &targets, PAD).unwrap();
        assert_eq!(out.accuracy, 0.0);
        assert_eq!(out.loss.double_value(&[]), 0.0);
        out.loss.backward();
    }

    #[test]
    fn uniform_logits_give_log_vocab_loss() {
        let logits = Tensor::zeros([2, 4, 8], (Kind::Float, tch::Device::Cpu));
        let targets = Tensor::ones([2, 4], (Kind::Int64, tch::Device::Cpu));
        let out = compute_loss(&logits, &targets, PAD).unwrap();
        assert!((out.loss.double_value(&[]) - 8f64.ln()).abs() < 1e-5);
    }

    #[test]
    fn mismatched_shapes_are_rejected() {
        let logits = Tensor::zeros([4, 8], (Kind::Float, tch::Device::Cpu));
        let targets = Tensor::ones([3], (Kind::Int64, tch::Device::Cpu));
        assert!(compute_loss(&logits, &targets, PAD).is_err());
    }
}
