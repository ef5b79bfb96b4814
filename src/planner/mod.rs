//! Multistage rechunk planning.
//!
//! Moving data from one chunking to another in a single pass requires a task to hold one
//! source chunk and one target chunk. When both are large and shaped differently (e.g.
//! rows to columns) this does not fit the memory budget, so the data is routed through
//! intermediate chunkings instead. Every intermediate trades memory for extra I/O: the
//! planner looks for the sequence of stages with the fewest chunk reads and writes.
mod stage;

use std::cmp::Reverse;

pub use self::stage::Stage;
use self::stage::{chunk_mem, stage_mem};
use crate::error::{Error, Result};
use crate::prelude::*;
use crate::types::{
    Chunking, ChunkingError, RunConfig, Shape, DEFAULT_MAX_RECHUNK_STAGES, DEFAULT_TASK_OVERHEAD,
};
use stratus_core::util::div_ceil;

/// Plans rechunk operations of arrays with `item_size` bytes per element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RechunkPlanner {
    pub item_size: u64,
    pub max_mem: u64,
    pub min_mem: u64,
    pub task_overhead: u64,
    pub max_stages: usize,
}

/// Plans a rechunk of an array of `shape` from `source` to `target` with the default task
/// overhead and stage limit.
pub fn plan(
    shape: &[u64],
    source: &Chunking,
    target: &Chunking,
    item_size: u64,
    max_mem: u64,
    min_mem: u64,
) -> Result<Vec<Stage>> {
    RechunkPlanner::new(item_size, max_mem)
        .with_min_mem(min_mem)
        .plan(shape, source, target)
}

type SelectionKey = (bool, u64, usize, u64, usize);

struct Candidate {
    stages: Vec<Stage>,
    cost: u64,
    peak_mem: u64,
    meets_floor: bool,
}

impl RechunkPlanner {
    pub fn new(item_size: u64, max_mem: u64) -> Self {
        Self {
            item_size,
            max_mem,
            min_mem: 0,
            task_overhead: DEFAULT_TASK_OVERHEAD,
            max_stages: DEFAULT_MAX_RECHUNK_STAGES,
        }
    }

    pub fn from_config(config: &RunConfig, item_size: u64) -> Self {
        Self {
            item_size,
            max_mem: config.max_mem,
            min_mem: config.min_mem,
            task_overhead: config.task_overhead,
            max_stages: config.max_rechunk_stages,
        }
    }

    pub fn with_min_mem(mut self, min_mem: u64) -> Self {
        self.min_mem = min_mem;
        self
    }

    pub fn with_task_overhead(mut self, task_overhead: u64) -> Self {
        self.task_overhead = task_overhead;
        self
    }

    pub fn with_max_stages(mut self, max_stages: usize) -> Self {
        self.max_stages = max_stages;
        self
    }

    fn validate(&self) -> Result {
        if self.item_size == 0 {
            return Err(Error::InvalidConfig("item size must be positive".into()));
        }

        if self.max_mem <= self.task_overhead {
            return Err(Error::InvalidConfig(format!(
                "max_mem ({}) must exceed the task overhead ({})",
                self.max_mem, self.task_overhead
            )));
        }

        if self.min_mem > self.max_mem {
            return Err(Error::InvalidConfig(format!(
                "min_mem ({}) exceeds max_mem ({})",
                self.min_mem, self.max_mem
            )));
        }

        if self.max_stages == 0 {
            return Err(Error::InvalidConfig(
                "at least one rechunk stage must be allowed".into(),
            ));
        }

        Ok(())
    }

    fn fits(&self, read: &Chunking, write: &Chunking) -> bool {
        stage_mem(read, write, self.item_size, self.task_overhead) <= self.max_mem
    }

    /// Returns the stages that rechunk an array of `shape` from `source` to `target`.
    ///
    /// The stages compose: the first reads `source`, the last writes `target` and each
    /// stage writes the chunking the next one reads. Every stage fits `max_mem`.
    pub fn plan(&self, shape: &[u64], source: &Chunking, target: &Chunking) -> Result<Vec<Stage>> {
        self.validate()?;

        if let Some(axis) = shape.iter().position(|&n| n == 0) {
            return Err(ChunkingError::ZeroExtent { axis }.into());
        }

        for chunking in &[source, target] {
            if chunking.shape().as_slice() != shape {
                return Err(Error::IncompatibleShapes(format!(
                    "chunking {} does not partition an array of shape {:?}",
                    chunking, shape
                )));
            }
        }

        if source == target {
            return Ok(vec![Stage::new(source.clone(), target.clone())?]);
        }

        for &(operand, chunking) in &[("source", source), ("target", target)] {
            let chunk_bytes = chunk_mem(chunking, self.item_size);

            if chunk_bytes.saturating_add(self.task_overhead) > self.max_mem {
                return Err(Error::ChunkTooLarge {
                    operand,
                    chunk_bytes,
                    max_mem: self.max_mem,
                });
            }
        }

        if self.fits(source, target) {
            trace!("rechunk {} -> {} fits a single pass", source, target);
            return Ok(vec![Stage::new(source.clone(), target.clone())?]);
        }

        let mut best: Option<(Candidate, SelectionKey)> = None;
        for (index, chain) in enumerate(self.candidate_chains(source, target)?) {
            let candidate = self.evaluate(&chain)?;
            let key = self.selection_key(&candidate, index);

            if best.as_ref().map_or(true, |(_, best_key)| key < *best_key) {
                best = Some((candidate, key));
            }
        }

        let best = match best {
            Some((candidate, _)) => candidate,
            None => {
                return Err(Error::PlanInfeasible {
                    max_stages: self.max_stages,
                    max_mem: self.max_mem,
                })
            }
        };

        if !best.meets_floor {
            warn!(
                "no rechunk plan from {} to {} keeps every stage above {} bytes, using one \
                 that needs {} bytes per task",
                source, target, self.min_mem, best.peak_mem
            );
        }

        debug!(
            "rechunk {} -> {} in {} stages ({} chunk reads and writes, {} bytes per task)",
            source,
            target,
            best.stages.len(),
            best.cost,
            best.peak_mem
        );

        Ok(best.stages)
    }

    /// Smaller is better. Ties are broken by the number of stages, then by how close the
    /// peak stage memory is to the middle of `[min_mem, max_mem]` and finally by the order
    /// in which candidates were generated.
    fn selection_key(&self, candidate: &Candidate, index: usize) -> SelectionKey {
        let mid = self.min_mem + (self.max_mem - self.min_mem) / 2;
        let distance = max(candidate.peak_mem, mid) - min(candidate.peak_mem, mid);

        (
            !candidate.meets_floor,
            candidate.cost,
            candidate.stages.len(),
            distance,
            index,
        )
    }

    fn evaluate(&self, chain: &[Chunking]) -> Result<Candidate> {
        let stages = chain
            .windows(2)
            .map(|w| Stage::new(w[0].clone(), w[1].clone()))
            .collect::<Result<Vec<_>, _>>()?;

        let mems = stages
            .iter()
            .map(|s| s.projected_mem(self.item_size, self.task_overhead))
            .collect_vec();

        Ok(Candidate {
            cost: stages.iter().fold(0u64, |acc, s| acc.saturating_add(s.cost())),
            peak_mem: mems.iter().copied().max().unwrap_or(0),
            meets_floor: mems.iter().all(|&m| m >= self.min_mem),
            stages,
        })
    }

    /// Chains `source, intermediates..., target` that fit the budget, for every stage count
    /// up to `max_stages`. Duplicate chains are dropped.
    fn candidate_chains(&self, source: &Chunking, target: &Chunking) -> Result<Vec<Vec<Chunking>>> {
        let ndim = source.ndim();
        let source_chunk = source.max_chunk_shape();
        let target_chunk = target.max_chunk_shape();
        let fixed = (0..ndim)
            .map(|axis| source.boundaries(axis) == target.boundaries(axis))
            .collect_vec();

        let mut chains: Vec<Vec<Chunking>> = vec![];
        let mut push = |chain: Option<Vec<Chunking>>| {
            if let Some(chain) = chain {
                if !chains.contains(&chain) {
                    chains.push(chain);
                }
            }
        };

        for num_stages in 2..=self.max_stages {
            let mut chain = vec![source.clone()];

            for k in 1..num_stages {
                let fraction = k as f64 / num_stages as f64;
                let chunk_shape = (0..ndim)
                    .map(|axis| {
                        let s = source_chunk[axis] as f64;
                        let t = target_chunk[axis] as f64;
                        let size = (s.powf(1.0 - fraction) * t.powf(fraction)).round() as u64;
                        min(max(size, 1), source.extent(axis))
                    })
                    .collect::<Shape>();

                chain.push(intermediate(source, &chunk_shape, &fixed)?);
            }

            chain.push(target.clone());
            push(self.shrink(chain, source, &fixed)?);

            if num_stages == 2 {
                let shared = zip(&source_chunk, &target_chunk)
                    .map(|(&s, &t)| min(s, t))
                    .collect::<Shape>();

                let chain = vec![
                    source.clone(),
                    intermediate(source, &shared, &fixed)?,
                    target.clone(),
                ];
                push(self.shrink(chain, source, &fixed)?);
            }
        }

        Ok(chains)
    }

    /// Halves the intermediates of `chain` until all stages fit, or returns `None` if an
    /// intermediate cannot be made any smaller.
    fn shrink(
        &self,
        mut chain: Vec<Chunking>,
        source: &Chunking,
        fixed: &[bool],
    ) -> Result<Option<Vec<Chunking>>> {
        let last = chain.len() - 1;

        // Each pair is checked again once its right side has been shrunk.
        for i in 1..last {
            while !(self.fits(&chain[i - 1], &chain[i]) && self.fits(&chain[i], &chain[i + 1])) {
                let mut chunk_shape = chain[i].max_chunk_shape();
                let axis = (0..chunk_shape.len())
                    .filter(|&axis| !fixed[axis] && chunk_shape[axis] > 1)
                    .max_by_key(|&axis| (chunk_shape[axis], Reverse(axis)));

                let axis = match axis {
                    Some(axis) => axis,
                    None => return Ok(None),
                };

                chunk_shape[axis] = div_ceil(chunk_shape[axis], 2);
                chain[i] = intermediate(source, &chunk_shape, fixed)?;
            }
        }

        chain.dedup();
        Ok(Some(chain))
    }
}

/// Regular chunking of `chunk_shape`, except along `fixed` axes which keep the chunks of
/// `source`.
fn intermediate(source: &Chunking, chunk_shape: &[u64], fixed: &[bool]) -> Result<Chunking> {
    let shape = source.shape();
    let sizes = (0..shape.len())
        .map(|axis| {
            if fixed[axis] {
                source.chunk_sizes(axis)
            } else {
                let size = chunk_shape[axis];
                let n = div_ceil(shape[axis], size);
                (0..n)
                    .map(|i| min(size, shape[axis] - i * size))
                    .collect()
            }
        })
        .collect();

    Ok(Chunking::from_sizes(&shape, sizes)?)
}
