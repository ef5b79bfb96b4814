use serde::Serialize;
use std::fmt;

use crate::types::{Chunking, ChunkingError};

/// One pass of a rechunk plan: every task writes one chunk of `write`, assembled from the
/// chunks of `read` it overlaps.
///
/// `split` is the refinement of `read` and `write`. Each of its chunks lies within exactly
/// one read chunk and one write chunk, so it describes the pieces a task copies.
#[derive(Clone, PartialEq, Eq, Serialize)]
pub struct Stage {
    pub read: Chunking,
    pub split: Chunking,
    pub write: Chunking,
}

impl Stage {
    pub fn new(read: Chunking, write: Chunking) -> Result<Self, ChunkingError> {
        let split = read.refine(&write)?;
        Ok(Self { read, split, write })
    }

    /// A stage that leaves the chunking unchanged and does not need any task.
    pub fn is_noop(&self) -> bool {
        self.read == self.write
    }

    pub fn num_tasks(&self) -> u64 {
        if self.is_noop() {
            0
        } else {
            self.write.num_chunks()
        }
    }

    /// Bytes a single task needs: the largest read chunk, the largest write chunk and
    /// `overhead`.
    pub fn projected_mem(&self, item_size: u64, overhead: u64) -> u64 {
        if self.is_noop() {
            return 0;
        }

        stage_mem(&self.read, &self.write, item_size, overhead)
    }

    /// Number of chunks read plus number of chunks written.
    pub fn cost(&self) -> u64 {
        if self.is_noop() {
            return 0;
        }

        self.read.num_chunks().saturating_add(self.write.num_chunks())
    }
}

pub(super) fn chunk_mem(chunking: &Chunking, item_size: u64) -> u64 {
    chunking.max_chunk_elements().saturating_mul(item_size)
}

pub(super) fn stage_mem(read: &Chunking, write: &Chunking, item_size: u64, overhead: u64) -> u64 {
    chunk_mem(read, item_size)
        .saturating_add(chunk_mem(write, item_size))
        .saturating_add(overhead)
}

impl fmt::Debug for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Stage({} -> {})", self.read, self.write)
    }
}
