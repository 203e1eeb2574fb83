pub mod checkpoint;
pub mod config;
pub mod context;
pub mod dataset;
pub mod error;
pub mod eval;
pub mod logging;
pub mod loss;
pub mod model;
pub mod optim;
pub mod reduce;
pub mod schedule;
pub mod sink;
pub mod state;
pub mod step;
pub mod train;

pub use checkpoint::{CheckpointStore, ResumePoint, SavePolicy};
pub use config::TrainConfig;
pub use context::{DistributedContext, ExecutionContext, Precision};
pub use dataset::{Batch, BatchFactory, DatasetSplits, TokenCorpus};
pub use error::{Result, TrainError};
pub use model::{BaselineLm, SequenceModel};
pub use optim::{Optimizer, OptimizerState, TchAdamW};
pub use reduce::{Collective, MetricReducer, SingleProcess, ThreadGroup};
pub use schedule::{compute_lr, LrPolicy};
pub use sink::{JsonlSink, NullSink, ScalarSink};
pub use state::RunState;
pub use step::{StepExecutor, StepOutcome};
pub use train::{RunSummary, Trainer};
