use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::checkpoint::SavePolicy;
use crate::context::DistributedContext;
use crate::dataset::DataConfig;
use crate::error::{Result, TrainError};
use crate::model::BaselineConfig;
use crate::schedule::LrPolicy;
use crate::step::StepSettings;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainConfig {
    /// Parent of every run directory.
    pub model_dir: PathBuf,
    pub model_name: String,
    pub max_epochs: usize,
    pub cuda: bool,
    pub mixed: bool,
    pub learning_rate: f64,
    pub weight_decay: f64,
    /// Per-rank micro-batch size.
    pub batch_size: usize,
    /// Consecutive non-improving evaluations before the epoch loop ends.
    pub patience: usize,
    pub grad_accum_steps: usize,
    /// Global step interval between validation passes.
    pub eval_every_step: usize,
    pub clip_norm: f64,
    /// Target id excluded from loss and accuracy (padding).
    pub ignore_idx: i64,
    pub num_devices: usize,
    /// `-1` outside a distributed launch.
    pub rank: i64,
    pub lr_policy: LrPolicy,
    pub save_policy: SavePolicy,
    pub data: DataConfig,
    pub model: BaselineConfig,
    pub scalar_flush_every: usize,
}

impl Default for TrainConfig {
    fn default() -> Self {
        Self {
            model_dir: PathBuf::from("./model"),
            model_name: "baseline".to_string(),
            max_epochs: 15,
            cuda: tch::Cuda::is_available(),
            mixed: false,
            learning_rate: 1e-4,
            weight_decay: 1e-6,
            batch_size: 64,
            patience: 5,
            grad_accum_steps: 2,
            eval_every_step: 3000,
            clip_norm: 1.0,
            ignore_idx: 0,
            num_devices: 1,
            rank: -1,
            lr_policy: LrPolicy::default(),
            save_policy: SavePolicy::default(),
            data: DataConfig::default(),
            model: BaselineConfig::default(),
            scalar_flush_every: 100,
        }
    }
}

impl TrainConfig {
    pub fn from_yaml_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&content)?)
    }

    /// Reads `path` when it exists, defaults otherwise.
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Result<Self> {
        if path.as_ref().exists() {
            Self::from_yaml_file(path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("max_epochs", self.max_epochs),
            ("batch_size", self.batch_size),
            ("patience", self.patience),
            ("grad_accum_steps", self.grad_accum_steps),
            ("eval_every_step", self.eval_every_step),
            ("num_devices", self.num_devices),
        ];
        for (name, value) in positive {
            if value == 0 {
                return Err(TrainError::Config(format!("{name} must be positive")));
            }
        }
        if !(self.learning_rate > 0.0) {
            return Err(TrainError::Config("learning_rate must be positive".into()));
        }
        if !(self.clip_norm > 0.0) {
            return Err(TrainError::Config("clip_norm must be positive".into()));
        }
        if self.num_devices > 1 && !(0..self.num_devices as i64).contains(&self.rank) {
            return Err(TrainError::Config(format!(
                "rank {} outside a group of {} devices",
                self.rank, self.num_devices
            )));
        }
        if self.num_devices == 1 && self.rank > 0 {
            return Err(TrainError::Config(format!("rank {} in a single device run", self.rank)));
        }
        Ok(())
    }

    /// Directory holding the checkpoint, scalars and text log of this run.
    pub fn run_dir(&self) -> PathBuf {
        self.model_dir.join(&self.model_name)
    }

    pub fn distributed_context(&self) -> DistributedContext {
        if self.num_devices > 1 {
            DistributedContext::new(self.rank, self.num_devices)
        } else {
            DistributedContext::single()
        }
    }

    pub fn step_settings(&self) -> StepSettings {
        StepSettings {
            grad_accum_steps: self.grad_accum_steps,
            clip_norm: self.clip_norm,
            ignore_idx: self.ignore_idx,
        }
    }
}
