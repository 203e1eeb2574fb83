use std::sync::{Arc, Condvar, Mutex};

use crate::error::{Result, TrainError};

/// Collective sum over every participating process.
///
/// Every rank must call [`Collective::all_reduce_sum`] the same number of
/// times in the same order, otherwise the call blocks forever.
pub trait Collective: Send + Sync {
    fn world_size(&self) -> usize;

    fn all_reduce_sum(&self, value: f64) -> Result<f64>;
}

/// The trivial group of one.
#[derive(Debug, Default, Clone, Copy)]
pub struct SingleProcess;

impl Collective for SingleProcess {
    fn world_size(&self) -> usize {
        1
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        Ok(value)
    }
}

#[derive(Debug, Default)]
struct Round {
    generation: u64,
    arrived: usize,
    partial: f64,
    result: f64,
}

#[derive(Debug)]
struct Group {
    world_size: usize,
    round: Mutex<Round>,
    done: Condvar,
}

/// In-process group whose ranks run on separate threads.
#[derive(Debug, Clone)]
pub struct ThreadGroup {
    group: Arc<Group>,
    rank: usize,
}

impl ThreadGroup {
    /// Creates one handle per rank; hand each to its own thread.
    pub fn create(world_size: usize) -> Vec<ThreadGroup> {
        let group = Arc::new(Group {
            world_size: world_size.max(1),
            round: Mutex::new(Round::default()),
            done: Condvar::new(),
        });
        (0..group.world_size)
            .map(|rank| ThreadGroup {
                group: Arc::clone(&group),
                rank,
            })
            .collect()
    }

    pub fn rank(&self) -> usize {
        self.rank
    }
}

impl Collective for ThreadGroup {
    fn world_size(&self) -> usize {
        self.group.world_size
    }

    fn all_reduce_sum(&self, value: f64) -> Result<f64> {
        let poisoned =
            |_| TrainError::Collective(format!("rank {} found a poisoned group", self.rank));

        let mut round = self.group.round.lock().map_err(poisoned)?;
        let generation = round.generation;
        round.partial += value;
        round.arrived += 1;

        if round.arrived == self.group.world_size {
            round.result = round.partial;
            round.partial = 0.0;
            round.arrived = 0;
            round.generation += 1;
            self.group.done.notify_all();
            return Ok(round.result);
        }

        // the result of this round stays put until every rank, including
        // this one, has arrived at the next round
        while round.generation == generation {
            round = self.group.done.wait(round).map_err(poisoned)?;
        }
        Ok(round.result)
    }
}

/// Averages logged scalars across the group.
#[derive(Clone)]
pub struct MetricReducer {
    collective: Arc<dyn Collective>,
}

impl MetricReducer {
    pub fn new(collective: Arc<dyn Collective>) -> Self {
        Self { collective }
    }

    pub fn single() -> Self {
        Self::new(Arc::new(SingleProcess))
    }

    pub fn world_size(&self) -> usize {
        self.collective.world_size()
    }

    pub fn reduce(&self, value: f64) -> Result<f64> {
        let world_size = self.world_size();
        if world_size <= 1 {
            return Ok(value);
        }
        let sum = self.collective.all_reduce_sum(value)?;
        Ok(sum / world_size as f64)
    }

    /// True on every rank when `flag` is set on any rank.
    pub fn any(&self, flag: bool) -> Result<bool> {
        if self.world_size() <= 1 {
            return Ok(flag);
        }
        let raised = self.collective.all_reduce_sum(if flag { 1.0 } else { 0.0 })?;
        Ok(raised > 0.0)
    }
}

impl std::fmt::Debug for MetricReducer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricReducer")
            .field("world_size", &self.world_size())
            .finish()
    }
}
