use super::{Store, StoreError};
use crate::prelude::*;
use crate::types::{Block, ChunkCoords};

/// Keeps every chunk in memory. Useful for tests and for small computations.
#[derive(Debug, Default)]
pub struct MemoryStore {
    chunks: RwLock<HashMap<(String, ChunkCoords), Block>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        default()
    }

    /// Number of chunks stored for `array`.
    pub fn num_chunks(&self, array: &str) -> usize {
        self.chunks
            .read()
            .keys()
            .filter(|(name, _)| name == array)
            .count()
    }
}

impl Store for MemoryStore {
    fn read(&self, array: &str, chunk: &[u64]) -> Result<Block, StoreError> {
        let key = (array.to_string(), ChunkCoords::from(chunk));

        match self.chunks.read().get(&key) {
            Some(block) => Ok(block.clone()),
            None => Err(StoreError::NotFound {
                array: key.0,
                chunk: key.1,
            }),
        }
    }

    fn write(&self, array: &str, chunk: &[u64], block: &Block) -> Result<(), StoreError> {
        let key = (array.to_string(), ChunkCoords::from(chunk));
        self.chunks.write().insert(key, block.clone());
        Ok(())
    }

    fn contains(&self, array: &str, chunk: &[u64]) -> bool {
        let key = (array.to_string(), ChunkCoords::from(chunk));
        self.chunks.read().contains_key(&key)
    }
}
