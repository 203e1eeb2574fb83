use std::cell::Cell;
use std::fs;
use std::path::Path;

use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tch::{Device, Tensor};

use crate::context::DistributedContext;
use crate::error::{Result, TrainError};

/// One micro-batch of `(inputs, targets)` token ids, `[batch, time]` each.
#[derive(Debug)]
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

pub type Batches<'a> = Box<dyn Iterator<Item = Result<Batch>> + 'a>;

/// The dataset collaborator. Every call to [`BatchFactory::batches`] starts a
/// fresh pass over the split.
pub trait BatchFactory {
    fn batches(&self) -> Result<Batches<'_>>;

    fn example_count(&self) -> usize;

    /// Selects the shuffle order of the passes that follow. Splits without a
    /// shuffle ignore it.
    fn set_epoch(&self, _epoch: usize) {}
}

/// Number of batches each rank draws from a split of `example_count` examples.
pub fn num_steps(example_count: usize, batch_size: usize, world_size: usize) -> usize {
    example_count.div_ceil(batch_size.max(1) * world_size.max(1))
}

pub struct DatasetSplits {
    pub train: Box<dyn BatchFactory>,
    pub valid: Box<dyn BatchFactory>,
    pub test: Box<dyn BatchFactory>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DataConfig {
    /// Pre-tokenized corpus: one sequence per line, whitespace separated ids.
    pub path: String,
    pub context_length: usize,
    pub valid_fraction: f64,
    pub test_fraction: f64,
    pub seed: u64,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            path: "data/train_tokens.txt".to_string(),
            context_length: 128,
            valid_fraction: 0.05,
            test_fraction: 0.05,
            seed: 42,
        }
    }
}

/// Fixed-length windows cut from a pre-tokenized corpus.
///
/// Each window holds `context_length + 1` ids; the tail window of a sequence
/// is right-padded with `pad_idx` so targets past the end are ignored by the
/// loss.
pub struct TokenCorpus {
    windows: Vec<Vec<i64>>,
    context_length: usize,
    pad_idx: i64,
    max_id: i64,
}

impl TokenCorpus {
    pub fn from_file<P: AsRef<Path>>(
        path: P,
        context_length: usize,
        pad_idx: i64,
    ) -> Result<Self> {
        let text = fs::read_to_string(path.as_ref())?;
        let mut sequences = Vec::new();
        for (line_no, line) in text.lines().enumerate() {
            let ids = line
                .split_whitespace()
                .map(|tok| tok.parse::<i64>())
                .collect::<std::result::Result<Vec<_>, _>>()
                .map_err(|err| TrainError::Data(format!("line {}: {err}", line_no + 1)))?;
            if !ids.is_empty() {
                sequences.push(ids);
            }
        }
        Self::from_sequences(&sequences, context_length, pad_idx)
    }

    pub fn from_sequences(
        sequences: &[Vec<i64>],
        context_length: usize,
        pad_idx: i64,
    ) -> Result<Self> {
        if context_length == 0 {
            return Err(TrainError::Data("context length must be positive".into()));
        }

        let window = context_length + 1;
        let mut windows = Vec::new();
        let mut max_id = pad_idx;

        for seq in sequences.iter().filter(|seq| seq.len() > 1) {
            if let Some(&id) = seq.iter().find(|&&id| id < 0) {
                return Err(TrainError::Data(format!("negative token id {id}")));
            }
            max_id = seq.iter().copied().fold(max_id, i64::max);

            // consecutive windows overlap by one token so every position is a target once
            let mut start = 0;
            while start + 1 < seq.len() {
                let end = (start + window).min(seq.len());
                let mut chunk = seq[start..end].to_vec();
                chunk.resize(window, pad_idx);
                windows.push(chunk);
                start += context_length;
            }
        }

        Ok(Self {
            windows,
            context_length,
            pad_idx,
            max_id,
        })
    }

    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }

    /// Smallest vocabulary covering every id in the corpus.
    pub fn vocab_size(&self) -> i64 {
        self.max_id + 1
    }

    /// Splits the windows into train/valid/test, keeping corpus order.
    pub fn into_splits(
        self,
        config: &DataConfig,
        batch_size: usize,
        dist: DistributedContext,
        device: Device,
    ) -> Result<DatasetSplits> {
        let total = self.windows.len();
        let n_valid = (total as f64 * config.valid_fraction).round() as usize;
        let n_test = (total as f64 * config.test_fraction).round() as usize;
        if n_valid == 0 || n_test == 0 || n_valid + n_test >= total {
            return Err(TrainError::Data(format!(
                "{total} windows cannot be split into train/valid/test with fractions {}/{}",
                config.valid_fraction, config.test_fraction
            )));
        }

        let mut train = self.windows;
        let test = train.split_off(total - n_test);
        let valid = train.split_off(train.len() - n_valid);

        let split = |windows: Vec<Vec<i64>>, shuffle: Option<u64>| -> Box<dyn BatchFactory> {
            Box::new(TokenSplit {
                windows,
                context_length: self.context_length,
                batch_size,
                dist,
                device,
                shuffle,
                epoch: Cell::new(0),
            })
        };

        log::debug!("pad id {} for {} windows", self.pad_idx, total);

        Ok(DatasetSplits {
            train: split(train, Some(config.seed)),
            valid: split(valid, None),
            test: split(test, None),
        })
    }
}

/// One split of a [`TokenCorpus`], sharded across ranks.
pub struct TokenSplit {
    windows: Vec<Vec<i64>>,
    context_length: usize,
    batch_size: usize,
    dist: DistributedContext,
    device: Device,
    shuffle: Option<u64>,
    epoch: Cell<u64>,
}

impl TokenSplit {
    /// Indices for this rank. Every rank gets the same count; the shortfall is
    /// filled by wrapping around, as collective calls need equal step counts.
    fn shard_indices(&self) -> Vec<usize> {
        let mut order: Vec<usize> = (0..self.windows.len()).collect();
        if let Some(seed) = self.shuffle {
            // same seed and epoch on every rank keeps the permutation identical
            let epoch = self.epoch.get();
            order.shuffle(&mut StdRng::seed_from_u64(seed.wrapping_add(epoch)));
        }

        let world = self.dist.world_size;
        if world <= 1 || order.is_empty() {
            return order;
        }

        let per_rank = order.len().div_ceil(world);
        let padded: Vec<usize> = order.iter().copied().cycle().take(per_rank * world).collect();
        padded
            .into_iter()
            .skip(self.dist.shard_index())
            .step_by(world)
            .collect()
    }

    fn make_batch(&self, indices: &[usize]) -> Batch {
        let rows = indices.len() as i64;
        let cols = self.context_length as i64;
        let mut inputs = Vec::with_capacity(indices.len() * self.context_length);
        let mut targets = Vec::with_capacity(indices.len() * self.context_length);

        for &idx in indices {
            let chunk = &self.windows[idx];
            inputs.extend_from_slice(&chunk[0..self.context_length]);
            targets.extend_from_slice(&chunk[1..self.context_length + 1]);
        }

        let input_tensor = Tensor::from_slice(&inputs).view([rows, cols]).to(self.device);
        let target_tensor = Tensor::from_slice(&targets).view([rows, cols]).to(self.device);

        Batch {
            inputs: input_tensor,
            targets: target_tensor,
        }
    }
}

impl BatchFactory for TokenSplit {
    fn batches(&self) -> Result<Batches<'_>> {
        let indices = self.shard_indices();
        let batch_size = self.batch_size.max(1);
        let chunks: Vec<Vec<usize>> = indices.chunks(batch_size).map(<[usize]>::to_vec).collect();
        Ok(Box::new(chunks.into_iter().map(move |chunk| Ok(self.make_batch(&chunk)))))
    }

    fn example_count(&self) -> usize {
        self.windows.len()
    }

    fn set_epoch(&self, epoch: usize) {
        self.epoch.set(epoch as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn corpus() -> TokenCorpus {
        let sequences: Vec<Vec<i64>> = (0..20)
            .map(|i| (1..=9).map(|t| t + i % 3).collect())
            .collect();
        TokenCorpus::from_sequences(&sequences, 4, 0).unwrap()
    }

    fn config() -> DataConfig {
        DataConfig {
            valid_fraction: 0.1,
            test_fraction: 0.1,
            ..DataConfig::default()
        }
    }

    fn single_splits() -> DatasetSplits {
        corpus()
            .into_splits(&config(), 4, DistributedContext::single(), Device::Cpu)
            .unwrap()
    }

    fn train_order(split: &dyn BatchFactory) -> Vec<i64> {
        split
            .batches()
            .unwrap()
            .flat_map(|b| Vec::<i64>::try_from(&b.unwrap().inputs.flatten(0, -1)).unwrap())
            .collect()
    }

    #[test]
    fn windows_are_padded_to_context_plus_one() {
        let corpus = TokenCorpus::from_sequences(&[vec![5, 6, 7, 8, 9, 10]], 4, 0).unwrap();
        assert_eq!(corpus.windows, vec![vec![5, 6, 7, 8, 9], vec![9, 10, 0, 0, 0]]);
        assert_eq!(corpus.vocab_size(), 11);
    }

    #[test]
    fn step_count_matches_batches_per_rank() {
        let total = corpus().len();
        for rank in 0..3 {
            let splits = corpus()
                .into_splits(&config(), 3, DistributedContext::new(rank, 3), Device::Cpu)
                .unwrap();
            let count = splits.train.example_count();
            let expected = num_steps(count, 3, 3);
            assert_eq!(splits.train.batches().unwrap().count(), expected);
            assert!(count < total);
        }
    }

    #[test]
    fn every_pass_restarts_the_split() {
        let splits = single_splits();
        let rows = |split: &dyn BatchFactory| -> usize {
            split
                .batches()
                .unwrap()
                .map(|b| b.unwrap().inputs.size()[0] as usize)
                .sum()
        };
        let first = rows(splits.valid.as_ref());
        assert_eq!(first, splits.valid.example_count());
        assert_eq!(first, rows(splits.valid.as_ref()));
    }

    #[test]
    fn shuffle_order_follows_the_epoch() {
        let resumed = single_splits();
        resumed.train.set_epoch(3);
        let resumed_order = train_order(resumed.train.as_ref());

        let fresh = single_splits();
        let epoch_zero = train_order(fresh.train.as_ref());
        assert_eq!(epoch_zero, train_order(fresh.train.as_ref()));
        fresh.train.set_epoch(3);

        assert_eq!(train_order(fresh.train.as_ref()), resumed_order);
        assert_ne!(epoch_zero, resumed_order);
    }

    #[test]
    fn tiny_corpus_cannot_be_split() {
        let corpus = TokenCorpus::from_sequences(&[vec![1, 2, 3]], 4, 0).unwrap();
        assert!(corpus
            .into_splits(&DataConfig::default(), 2, DistributedContext::single(), Device::Cpu)
            .is_err());
    }
}
