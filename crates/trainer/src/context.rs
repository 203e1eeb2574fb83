use serde::{Deserialize, Serialize};
use tch::Device;

use crate::config::TrainConfig;

/// Numeric precision used for the forward pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    Full,
    /// Forward pass runs under libtorch autocast. Requires a CUDA device.
    Mixed,
}

impl Precision {
    pub fn is_mixed(self) -> bool {
        matches!(self, Precision::Mixed)
    }
}

/// Position of this process in a data-parallel run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DistributedContext {
    /// `-1` for a single process run.
    pub rank: i64,
    pub world_size: usize,
}

impl DistributedContext {
    pub fn single() -> Self {
        Self {
            rank: -1,
            world_size: 1,
        }
    }

    pub fn new(rank: i64, world_size: usize) -> Self {
        Self {
            rank,
            world_size: world_size.max(1),
        }
    }

    /// Rank 0 (or the sole process) owns logging and persistence.
    pub fn is_master(&self) -> bool {
        self.rank == 0 || self.rank == -1
    }

    pub fn is_distributed(&self) -> bool {
        self.world_size > 1
    }

    /// Index used to pick a data shard. The single process reads shard 0.
    pub fn shard_index(&self) -> usize {
        self.rank.max(0) as usize
    }
}

impl Default for DistributedContext {
    fn default() -> Self {
        Self::single()
    }
}

/// Device, precision and distributed placement, passed explicitly to every
/// component that touches tensors.
#[derive(Debug, Clone, Copy)]
pub struct ExecutionContext {
    pub device: Device,
    pub precision: Precision,
    pub distributed: DistributedContext,
}

impl ExecutionContext {
    pub fn cpu() -> Self {
        Self {
            device: Device::Cpu,
            precision: Precision::Full,
            distributed: DistributedContext::single(),
        }
    }

    pub fn from_config(config: &TrainConfig) -> Self {
        let distributed = config.distributed_context();
        let device = if distributed.is_distributed() {
            Device::Cuda(distributed.shard_index())
        } else if config.cuda {
            Device::cuda_if_available()
        } else {
            Device::Cpu
        };

        // mixed precision is only honoured on CUDA devices
        let precision = if config.mixed && device.is_cuda() {
            Precision::Mixed
        } else {
            Precision::Full
        };

        Self {
            device,
            precision,
            distributed,
        }
    }

    pub fn is_master(&self) -> bool {
        self.distributed.is_master()
    }
}
