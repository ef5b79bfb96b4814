//! Chunk stores: where source arrays are read from and where every node writes its output.
//!
//! Tasks of one node only ever write disjoint chunks and a retried task rewrites the same
//! block, so a store does not need any coordination beyond being safe to share between
//! threads.
mod directory;
mod memory;

use std::fmt::Debug;
use std::io;

pub use self::directory::DirectoryStore;
pub use self::memory::MemoryStore;
use crate::prelude::*;
use crate::types::{Block, ChunkCoords};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("chunk {chunk:?} of array {array:?} does not exist")]
    NotFound { array: String, chunk: ChunkCoords },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: io::Error,
    },

    #[error("corrupted chunk {chunk:?} of array {array:?}: {source}")]
    Codec {
        array: String,
        chunk: ChunkCoords,
        #[source]
        source: bincode::Error,
    },
}

/// Random access to the chunks of named arrays.
pub trait Store: Debug + Send + Sync {
    fn read(&self, array: &str, chunk: &[u64]) -> Result<Block, StoreError>;

    /// Stores `block` as chunk `chunk` of `array`, replacing any previous block.
    fn write(&self, array: &str, chunk: &[u64], block: &Block) -> Result<(), StoreError>;

    fn contains(&self, array: &str, chunk: &[u64]) -> bool {
        self.read(array, chunk).is_ok()
    }
}

/// `"2.0.13"` for chunk `[2, 0, 13]`.
pub(crate) fn chunk_key(chunk: &[u64]) -> String {
    chunk.iter().join(".")
}
