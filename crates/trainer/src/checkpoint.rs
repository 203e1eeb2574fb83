use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use log::{info, warn};
use memmap2::{Mmap, MmapOptions};
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use serde::{Deserialize, Serialize};
use tch::{Device, Kind, Tensor};

use crate::error::{Result, TrainError};
use crate::model::SequenceModel;
use crate::optim::{Optimizer, OptimizerState};

pub const CHECKPOINT_FILENAME: &str = "model.safetensors";
const FORMAT_TAG: &str = "dialogue-trainer/1";
const INTERRUPT_RETRIES: u32 = 3;

/// Where to resume a run from.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ResumePoint {
    pub best_val_loss: f64,
    pub epoch: usize,
    pub step: usize,
}

impl ResumePoint {
    pub fn cold_start() -> Self {
        Self {
            best_val_loss: f64::INFINITY,
            epoch: 0,
            step: 0,
        }
    }
}

/// How hard a save tries before giving up.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum SavePolicy {
    /// Only interrupted writes are retried, a few times.
    FailFast,
    /// Any IO failure is retried up to `attempts` writes in total.
    Retry { attempts: u32, backoff_ms: u64 },
}

impl Default for SavePolicy {
    fn default() -> Self {
        SavePolicy::Retry {
            attempts: 5,
            backoff_ms: 500,
        }
    }
}

impl SavePolicy {
    fn should_retry(&self, attempt: u32, err: &io::Error) -> bool {
        match *self {
            SavePolicy::FailFast => {
                err.kind() == io::ErrorKind::Interrupted && attempt < INTERRUPT_RETRIES
            }
            SavePolicy::Retry { attempts, .. } => attempt < attempts,
        }
    }

    fn backoff(&self) -> Duration {
        match *self {
            SavePolicy::FailFast => Duration::ZERO,
            SavePolicy::Retry { backoff_ms, .. } => Duration::from_millis(backoff_ms),
        }
    }
}

/// Persists model parameters, optimizer state and run progress as one
/// safetensors file per model directory.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    path: PathBuf,
    policy: SavePolicy,
}

impl CheckpointStore {
    pub fn new<P: AsRef<Path>>(model_dir: P, policy: SavePolicy) -> Self {
        Self {
            path: model_dir.as_ref().join(CHECKPOINT_FILENAME),
            policy,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    /// Progress recorded in the checkpoint, leaving parameters alone.
    pub fn peek(&self) -> Result<ResumePoint> {
        match self.map()? {
            Some(buffer) => Ok(self.read_header(&buffer)?.0),
            None => Ok(ResumePoint::cold_start()),
        }
    }

    /// Restores `model` and `optimizer` in place. A missing checkpoint is the
    /// cold-start path and yields `(+inf, 0, 0)`.
    pub fn load<M, O>(&self, model: &M, optimizer: &mut O) -> Result<ResumePoint>
    where
        M: SequenceModel + ?Sized,
        O: Optimizer + ?Sized,
    {
        let Some(buffer) = self.map()? else {
            return Ok(ResumePoint::cold_start());
        };
        let (point, optimizer_state) = self.read_header(&buffer)?;

        let tensors = SafeTensors::deserialize(&buffer)?;
        let vs = model.var_store();
        let device = vs.device();
        let mut variables = vs.variables();

        for (name, var) in variables.iter_mut() {
            let view = tensors
                .tensor(name)
                .map_err(|_| self.corrupt(&format!("parameter {name} not found")))?;
            let shape: Vec<i64> = view.shape().iter().map(|&x| x as i64).collect();
            if shape != var.size() {
                return Err(self.corrupt(&format!(
                    "parameter {name} has shape {:?}, model expects {:?}",
                    shape,
                    var.size()
                )));
            }
            let stored = Tensor::from_data_size(view.data(), &shape, kind_of(view.dtype())?)
                .to_device(device);
            tch::no_grad(|| {
                var.copy_(&stored);
            });
        }

        optimizer.load_state_dict(&optimizer_state)?;

        info!("Loading model from {}", self.path.display());
        Ok(point)
    }

    fn map(&self) -> Result<Option<Mmap>> {
        let file = match File::open(&self.path) {
            Ok(file) => file,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(err.into()),
        };
        let buffer = unsafe { MmapOptions::new().map(&file)? };
        Ok(Some(buffer))
    }

    fn read_header(&self, buffer: &[u8]) -> Result<(ResumePoint, OptimizerState)> {
        let (_, header) = SafeTensors::read_metadata(buffer)?;
        let meta = header
            .metadata()
            .as_ref()
            .ok_or_else(|| self.corrupt("missing metadata"))?;
        if meta.get("format").map(String::as_str) != Some(FORMAT_TAG) {
            return Err(self.corrupt("unknown checkpoint format"));
        }

        let point = ResumePoint {
            best_val_loss: self.field(meta, "val_loss")?,
            epoch: self.field(meta, "epoch")?,
            step: self.field(meta, "step")?,
        };
        let optimizer_json = meta
            .get("optimizer")
            .ok_or_else(|| self.corrupt("missing optimizer state"))?;
        Ok((point, serde_json::from_str(optimizer_json)?))
    }

    /// Writes the checkpoint next to the canonical path and renames it over
    /// the old one, so readers only ever see a complete file.
    pub fn save<M, O>(&self, model: &M, optimizer: &O, point: ResumePoint) -> Result<()>
    where
        M: SequenceModel + ?Sized,
        O: Optimizer + ?Sized,
    {
        let bytes = encode(model, optimizer, point)?;
        if let Some(dir) = self.path.parent() {
            fs::create_dir_all(dir)?;
        }

        info!("Saving model to {}", self.path.display());
        let mut attempt = 0;
        loop {
            attempt += 1;
            match write_atomic(&self.path, &bytes) {
                Ok(()) => return Ok(()),
                Err(err) if self.policy.should_retry(attempt, &err) => {
                    warn!("checkpoint write attempt {attempt} failed: {err}; retrying");
                    thread::sleep(self.policy.backoff());
                }
                Err(err) => {
                    return Err(TrainError::Checkpoint(format!(
                        "failed to write {} after {attempt} attempt(s): {err}",
                        self.path.display()
                    )))
                }
            }
        }
    }

    fn field<T: std::str::FromStr>(&self, meta: &HashMap<String, String>, key: &str) -> Result<T> {
        meta.get(key)
            .and_then(|raw| raw.parse().ok())
            .ok_or_else(|| self.corrupt(&format!("missing or malformed {key}")))
    }

    fn corrupt(&self, reason: &str) -> TrainError {
        TrainError::Checkpoint(format!("{}: {reason}", self.path.display()))
    }
}

fn encode<M, O>(model: &M, optimizer: &O, point: ResumePoint) -> Result<Vec<u8>>
where
    M: SequenceModel + ?Sized,
    O: Optimizer + ?Sized,
{
    let mut buffers = Vec::new();
    for (name, var) in model.var_store().variables() {
        let tensor = var.to_device(Device::Cpu).contiguous();
        let dtype = dtype_of(tensor.kind())?;
        let numel = tensor.numel();
        let mut data = vec![0u8; numel * tensor.kind().elt_size_in_bytes()];
        tensor.copy_data_u8(&mut data, numel);
        let shape: Vec<usize> = tensor.size().iter().map(|&d| d as usize).collect();
        buffers.push((name, dtype, shape, data));
    }

    let views = buffers
        .iter()
        .map(|(name, dtype, shape, data)| {
            Ok((name.clone(), TensorView::new(*dtype, shape.clone(), data)?))
        })
        .collect::<Result<Vec<_>>>()?;

    // f64 Display round-trips exactly, including `inf`
    let mut metadata = HashMap::new();
    metadata.insert("format".to_string(), FORMAT_TAG.to_string());
    metadata.insert("val_loss".to_string(), point.best_val_loss.to_string());
    metadata.insert("epoch".to_string(), point.epoch.to_string());
    metadata.insert("step".to_string(), point.step.to_string());
    metadata.insert("optimizer".to_string(), serde_json::to_string(&optimizer.state_dict())?);

    Ok(safetensors::serialize(views, &Some(metadata))?)
}

fn write_atomic(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let tmp = path.with_extension("safetensors.tmp");
    let result = (|| {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&tmp, path)
    })();
    if result.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    result
}

fn dtype_of(kind: Kind) -> Result<Dtype> {
    match kind {
        Kind::Float => Ok(Dtype::F32),
        Kind::Double => Ok(Dtype::F64),
        Kind::Half => Ok(Dtype::F16),
        Kind::BFloat16 => Ok(Dtype::BF16),
        Kind::Int64 => Ok(Dtype::I64),
        other => Err(TrainError::Checkpoint(format!("unsupported parameter kind {other:?}"))),
    }
}

fn kind_of(dtype: Dtype) -> Result<Kind> {
    match dtype {
        Dtype::F32 => Ok(Kind::Float),
        Dtype::F64 => Ok(Kind::Double),
        Dtype::F16 => Ok(Kind::Half),
        Dtype::BF16 => Ok(Kind::BFloat16),
        Dtype::I64 => Ok(Kind::Int64),
        other => Err(TrainError::Checkpoint(format!("unsupported dtype {other:?}"))),
    }
}
