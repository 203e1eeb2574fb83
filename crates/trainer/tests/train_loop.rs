use std::cell::{Cell, RefCell};
use std::path::Path;
use std::rc::Rc;
use std::sync::Arc;
use std::thread;

use tch::{nn, Device, Kind, Tensor};
use tempfile::tempdir;

use dialogue_trainer::dataset::{Batches, DataConfig};
use dialogue_trainer::model::BaselineConfig;
use dialogue_trainer::sink::ScalarRecord;
use dialogue_trainer::{
    BaselineLm, Batch, BatchFactory, CheckpointStore, DatasetSplits, DistributedContext,
    ExecutionContext, JsonlSink, NullSink, Optimizer, OptimizerState, Precision, ResumePoint,
    SavePolicy, ScalarSink, SequenceModel, SingleProcess, TchAdamW, ThreadGroup, TokenCorpus,
    TrainConfig, Trainer,
};

const VOCAB: i64 = 12;

fn corpus() -> TokenCorpus {
    let sequences: Vec<Vec<i64>> = (0..24)
        .map(|i| (0..10).map(|t| 1 + (i + t) % (VOCAB - 1)).collect())
        .collect();
    TokenCorpus::from_sequences(&sequences, 4, 0).unwrap()
}

fn splits(batch_size: usize, dist: DistributedContext) -> DatasetSplits {
    let data = DataConfig {
        context_length: 4,
        valid_fraction: 0.1,
        test_fraction: 0.1,
        ..DataConfig::default()
    };
    corpus().into_splits(&data, batch_size, dist, Device::Cpu).unwrap()
}

fn config(model_dir: &Path) -> TrainConfig {
    TrainConfig {
        model_dir: model_dir.to_path_buf(),
        model_name: "test-run".into(),
        max_epochs: 2,
        cuda: false,
        learning_rate: 1e-2,
        batch_size: 4,
        patience: 100,
        grad_accum_steps: 2,
        eval_every_step: 4,
        model: BaselineConfig {
            hidden_size: 8,
            dropout: 0.0,
        },
        ..TrainConfig::default()
    }
}

fn baseline() -> (BaselineLm, TchAdamW) {
    let config = BaselineConfig {
        hidden_size: 8,
        dropout: 0.0,
    };
    let model = BaselineLm::new(Device::Cpu, VOCAB, &config);
    let opt = TchAdamW::new(model.var_store(), 1e-2, 0.0).unwrap();
    (model, opt)
}

/// Uniform logits whatever the input, so every validation loss is ln(VOCAB).
struct FlatModel {
    vs: nn::VarStore,
    bias: Tensor,
}

impl FlatModel {
    fn new() -> Self {
        let vs = nn::VarStore::new(Device::Cpu);
        let bias = vs.root().zeros("bias", &[VOCAB]);
        Self { vs, bias }
    }
}

impl std::fmt::Debug for FlatModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("FlatModel")
    }
}

impl nn::ModuleT for FlatModel {
    fn forward_t(&self, xs: &Tensor, _train: bool) -> Tensor {
        let size = xs.size();
        let opts = (Kind::Float, Device::Cpu);
        Tensor::zeros([size[0], size[1], VOCAB], opts) + &self.bias
    }
}

impl SequenceModel for FlatModel {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

/// Never changes the parameters.
#[derive(Default)]
struct FrozenOptimizer {
    updates: u64,
    lr: f64,
}

impl Optimizer for FrozenOptimizer {
    fn step(&mut self) -> dialogue_trainer::Result<()> {
        self.updates += 1;
        Ok(())
    }

    fn zero_grad(&mut self) -> dialogue_trainer::Result<()> {
        Ok(())
    }

    fn clip_grad_norm(&mut self, _max_norm: f64) -> dialogue_trainer::Result<()> {
        Ok(())
    }

    fn set_lr(&mut self, lr: f64) -> dialogue_trainer::Result<()> {
        self.lr = lr;
        Ok(())
    }

    fn state_dict(&self) -> OptimizerState {
        OptimizerState {
            lr: self.lr,
            updates: self.updates,
            ..OptimizerState::default()
        }
    }

    fn load_state_dict(&mut self, state: &OptimizerState) -> dialogue_trainer::Result<()> {
        self.lr = state.lr;
        self.updates = state.updates;
        Ok(())
    }
}

/// Evaluation-mode logits put weight `s` on the input id, so a split whose
/// targets equal its inputs scores `ln(1 + (V - 1) e^-s)`. `s` is chosen per
/// evaluation forward to hit `losses` in order; past the end, and in training
/// mode, the logits are uniform.
struct ScheduledModel {
    vs: nn::VarStore,
    bias: Tensor,
    losses: Vec<f64>,
    evals: Cell<usize>,
}

impl ScheduledModel {
    const VOCAB: i64 = 4;

    fn new(losses: &[f64]) -> Self {
        let vs = nn::VarStore::new(Device::Cpu);
        let bias = vs.root().zeros("bias", &[Self::VOCAB]);
        Self {
            vs,
            bias,
            losses: losses.to_vec(),
            evals: Cell::new(0),
        }
    }

    fn weight_for(loss: f64) -> f64 {
        -((loss.exp() - 1.0) / (Self::VOCAB - 1) as f64).ln()
    }
}

impl std::fmt::Debug for ScheduledModel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ScheduledModel")
            .field("evals", &self.evals.get())
            .finish()
    }
}

impl nn::ModuleT for ScheduledModel {
    fn forward_t(&self, xs: &Tensor, train: bool) -> Tensor {
        let size = xs.size();
        let uniform = Tensor::zeros([size[0], size[1], Self::VOCAB], (Kind::Float, Device::Cpu));
        if train {
            return uniform + &self.bias;
        }
        let idx = self.evals.get();
        self.evals.set(idx + 1);
        match self.losses.get(idx) {
            Some(&loss) => {
                uniform + xs.onehot(Self::VOCAB) * Self::weight_for(loss) + &self.bias
            }
            None => uniform + &self.bias,
        }
    }
}

impl SequenceModel for ScheduledModel {
    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }
}

/// The same single-row batch, `count` times per pass.
struct Repeat {
    inputs: Vec<i64>,
    targets: Vec<i64>,
    count: usize,
}

impl BatchFactory for Repeat {
    fn batches(&self) -> dialogue_trainer::Result<Batches<'_>> {
        Ok(Box::new((0..self.count).map(|_| {
            Ok(Batch {
                inputs: Tensor::from_slice(&self.inputs).view([1, -1]),
                targets: Tensor::from_slice(&self.targets).view([1, -1]),
            })
        })))
    }

    fn example_count(&self) -> usize {
        self.count
    }
}

/// Records the checkpoint on disk each time a validation loss is logged,
/// which is before that evaluation's save.
struct CheckpointWatch {
    store: CheckpointStore,
    seen: Rc<RefCell<Vec<ResumePoint>>>,
}

impl ScalarSink for CheckpointWatch {
    fn add_scalar(&mut self, tag: &str, _value: f64, _step: usize) -> dialogue_trainer::Result<()> {
        if tag == "val/loss" {
            self.seen.borrow_mut().push(self.store.peek()?);
        }
        Ok(())
    }

    fn close(&mut self) -> dialogue_trainer::Result<()> {
        Ok(())
    }
}

#[test]
fn full_run_saves_best_checkpoint_and_resumes() {
    let dir = tempdir().unwrap();
    let config = config(dir.path());
    let run_dir = config.run_dir();
    let scalars = run_dir.join("scalars.jsonl");

    let (model, opt) = baseline();
    let sink = JsonlSink::create(&scalars, 1).unwrap();
    let mut trainer = Trainer::new(
        config.clone(),
        model,
        opt,
        ExecutionContext::cpu(),
        Arc::new(SingleProcess),
        Box::new(sink),
    )
    .unwrap();
    assert_eq!(trainer.state().step, 0);

    let summary = trainer.run(&splits(4, DistributedContext::single())).unwrap();

    assert!(!summary.stopped_early);
    assert_eq!(summary.epochs_run, 2);
    assert_eq!(summary.state.epoch, 2);
    assert!(summary.state.step >= 8);
    assert!(summary.state.best_val_loss.is_finite());
    assert!(summary.test_loss > 0.0 && summary.test_loss.is_finite());
    assert!(trainer.checkpoint_store().exists());

    let records = JsonlSink::read_all(&scalars).unwrap();
    let val: Vec<&ScalarRecord> = records.iter().filter(|r| r.tag == "val/loss").collect();
    assert_eq!(val.len(), summary.state.step / 4);
    assert!(val.iter().all(|r| r.step % 4 == 0));
    assert!(records.iter().any(|r| r.tag == "train/acc"));

    let (model, opt) = baseline();
    let resumed = Trainer::new(
        config,
        model,
        opt,
        ExecutionContext::cpu(),
        Arc::new(SingleProcess),
        Box::new(NullSink),
    )
    .unwrap();
    let state = resumed.state();
    assert_eq!(state.best_val_loss, summary.state.best_val_loss);
    assert!(state.epoch >= 1 && state.epoch <= 2);
    assert!(state.step > 0 && state.step % 4 == 0);
    assert!(resumed.executor().optimizer().updates() > 0);
}

#[test]
fn patience_stops_the_epoch_loop_but_still_tests() {
    let dir = tempdir().unwrap();
    let config = TrainConfig {
        max_epochs: 50,
        patience: 2,
        eval_every_step: 1,
        grad_accum_steps: 1,
        ..config(dir.path())
    };

    let mut trainer = Trainer::new(
        config,
        FlatModel::new(),
        FrozenOptimizer::default(),
        ExecutionContext::cpu(),
        Arc::new(SingleProcess),
        Box::new(NullSink),
    )
    .unwrap();
    let summary = trainer.run(&splits(4, DistributedContext::single())).unwrap();

    // first evaluation improves on +inf, the next two do not
    assert!(summary.stopped_early);
    assert_eq!(summary.state.step, 3);
    assert_eq!(summary.state.patience_counter, 2);
    assert_eq!(summary.epochs_run, 1);
    assert!((summary.state.best_val_loss - (VOCAB as f64).ln()).abs() < 1e-5);
    assert!((summary.test_loss - (VOCAB as f64).ln()).abs() < 1e-5);
    assert!(trainer.checkpoint_store().exists());
}

#[test]
fn saves_only_on_improvement_and_stops_when_patience_runs_out() {
    let dir = tempdir().unwrap();
    let config = TrainConfig {
        max_epochs: 3,
        batch_size: 1,
        patience: 3,
        eval_every_step: 1,
        grad_accum_steps: 1,
        save_policy: SavePolicy::FailFast,
        ..config(dir.path())
    };
    let store = CheckpointStore::new(config.run_dir(), SavePolicy::FailFast);
    let seen = Rc::new(RefCell::new(Vec::new()));
    let watch = CheckpointWatch {
        store: store.clone(),
        seen: Rc::clone(&seen),
    };

    let repeat = |targets: Vec<i64>, count| -> Box<dyn BatchFactory> {
        Box::new(Repeat {
            inputs: vec![1, 2, 3],
            targets,
            count,
        })
    };
    let splits = DatasetSplits {
        train: repeat(vec![2, 3, 1], 10),
        valid: repeat(vec![1, 2, 3], 1),
        test: repeat(vec![1, 2, 3], 1),
    };

    let mut trainer = Trainer::new(
        config,
        ScheduledModel::new(&[1.0, 0.9, 0.95, 1.0, 1.1]),
        FrozenOptimizer::default(),
        ExecutionContext::cpu(),
        Arc::new(SingleProcess),
        Box::new(watch),
    )
    .unwrap();
    let summary = trainer.run(&splits).unwrap();

    assert!(summary.stopped_early);
    assert_eq!(summary.state.step, 5);
    assert_eq!(summary.epochs_run, 1);
    assert_eq!(summary.state.patience_counter, 3);
    assert!((summary.test_loss - (ScheduledModel::VOCAB as f64).ln()).abs() < 1e-5);

    // checkpoint as found by evaluations 0..=4: written after 0 and 1 only
    let seen = seen.borrow();
    let progress: Vec<(usize, usize)> = seen.iter().map(|p| (p.epoch, p.step)).collect();
    assert_eq!(progress, vec![(0, 0), (1, 1), (1, 2), (1, 2), (1, 2)]);
    assert!(seen[0].best_val_loss.is_infinite());
    assert!((seen[1].best_val_loss - 1.0).abs() < 1e-5);

    let last = store.peek().unwrap();
    assert_eq!((last.epoch, last.step), (1, 2));
    assert!((last.best_val_loss - 0.9).abs() < 1e-5);
    assert!((summary.state.best_val_loss - 0.9).abs() < 1e-5);
}

#[test]
fn only_the_master_rank_writes() {
    let dir = tempdir().unwrap();
    let base = config(dir.path());
    let handles = ThreadGroup::create(2);

    let workers: Vec<_> = handles
        .into_iter()
        .map(|group| {
            let rank = group.rank() as i64;
            let config = TrainConfig {
                num_devices: 2,
                rank,
                max_epochs: 1,
                eval_every_step: 2,
                grad_accum_steps: 1,
                ..base.clone()
            };
            let scalars = dir.path().join(format!("scalars-{rank}.jsonl"));
            thread::spawn(move || {
                let ctx = ExecutionContext {
                    device: Device::Cpu,
                    precision: Precision::Full,
                    distributed: DistributedContext::new(rank, 2),
                };
                let sink = JsonlSink::create(&scalars, 1).unwrap();
                let mut trainer = Trainer::new(
                    config,
                    FlatModel::new(),
                    FrozenOptimizer::default(),
                    ctx,
                    Arc::new(group),
                    Box::new(sink),
                )
                .unwrap();
                let summary = trainer.run(&splits(2, ctx.distributed)).unwrap();
                (summary, JsonlSink::read_all(&scalars).unwrap().len())
            })
        })
        .collect();

    let results: Vec<_> = workers.into_iter().map(|w| w.join().unwrap()).collect();
    let (master, master_records) = &results[0];
    let (worker, worker_records) = &results[1];

    assert_eq!(master.state.step, worker.state.step);
    assert_eq!(master.state.best_val_loss, worker.state.best_val_loss);
    assert_eq!(master.test_loss, worker.test_loss);
    assert!(*master_records > 0);
    assert_eq!(*worker_records, 0);
    assert!(base.run_dir().join("model.safetensors").exists());
}
