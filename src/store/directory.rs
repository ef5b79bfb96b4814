use bincode::Options;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;

use super::{chunk_key, Store, StoreError};
use crate::prelude::*;
use crate::types::Block;

/// Stores every chunk as a separate file `<root>/<array>/<chunk key>`.
///
/// Blocks are written to a temporary file in the same directory first and then renamed
/// into place, so readers never observe a partially written chunk.
#[derive(Debug)]
pub struct DirectoryStore {
    root: PathBuf,
}

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_varint_encoding()
}

fn io_error(path: &Path, source: io::Error) -> StoreError {
    StoreError::Io {
        path: path.display().to_string(),
        source,
    }
}

impl DirectoryStore {
    pub fn new(root: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let root = root.into();
        fs::create_dir_all(&root).map_err(|e| io_error(&root, e))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn array_dir(&self, array: &str) -> PathBuf {
        self.root.join(array)
    }

    fn chunk_path(&self, array: &str, chunk: &[u64]) -> PathBuf {
        self.array_dir(array).join(chunk_key(chunk))
    }

    /// Deletes all chunks of `array`.
    pub fn remove_array(&self, array: &str) -> Result<(), StoreError> {
        let dir = self.array_dir(array);

        match fs::remove_dir_all(&dir) {
            Err(e) if e.kind() != io::ErrorKind::NotFound => Err(io_error(&dir, e)),
            _ => Ok(()),
        }
    }
}

impl Store for DirectoryStore {
    fn read(&self, array: &str, chunk: &[u64]) -> Result<Block, StoreError> {
        let path = self.chunk_path(array, chunk);

        let buffer = match fs::read(&path) {
            Ok(buffer) => buffer,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound {
                    array: array.to_string(),
                    chunk: chunk.into(),
                })
            }
            Err(e) => return Err(io_error(&path, e)),
        };

        codec()
            .deserialize(&buffer)
            .map_err(|source| StoreError::Codec {
                array: array.to_string(),
                chunk: chunk.into(),
                source,
            })
    }

    fn write(&self, array: &str, chunk: &[u64], block: &Block) -> Result<(), StoreError> {
        let dir = self.array_dir(array);
        let path = self.chunk_path(array, chunk);

        let buffer = codec()
            .serialize(block)
            .map_err(|source| StoreError::Codec {
                array: array.to_string(),
                chunk: chunk.into(),
                source,
            })?;

        fs::create_dir_all(&dir).map_err(|e| io_error(&dir, e))?;

        let mut file = NamedTempFile::new_in(&dir).map_err(|e| io_error(&dir, e))?;
        file.write_all(&buffer).map_err(|e| io_error(file.path(), e))?;
        file.persist(&path).map_err(|e| io_error(&path, e.error))?;

        trace!("wrote {} bytes to {:?}", buffer.len(), path);
        Ok(())
    }

    fn contains(&self, array: &str, chunk: &[u64]) -> bool {
        self.chunk_path(array, chunk).is_file()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::types::DTYPE_F64;

    #[test]
    fn test_directory_store() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path().join("work")).unwrap();
        let block = Block::from_values(&[2, 2], &[1.0f64, 2.0, 3.0, 4.0]).unwrap();

        assert!(matches!(
            store.read("x", &[0, 1]),
            Err(StoreError::NotFound { .. })
        ));

        store.write("x", &[0, 1], &block).unwrap();
        assert!(store.root().join("x").join("0.1").is_file());
        assert!(store.contains("x", &[0, 1]));
        assert_eq!(store.read("x", &[0, 1]).unwrap(), block);

        let zeros = Block::zeros(DTYPE_F64, &[2, 2]);
        store.write("x", &[0, 1], &zeros).unwrap();
        assert_eq!(store.read("x", &[0, 1]).unwrap(), zeros);

        // Only the chunk itself is left behind, no temporary files.
        assert_eq!(fs::read_dir(store.root().join("x")).unwrap().count(), 1);

        store.remove_array("x").unwrap();
        assert!(!store.contains("x", &[0, 1]));
        store.remove_array("x").unwrap();
    }

    #[test]
    fn test_corrupted_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let store = DirectoryStore::new(dir.path()).unwrap();

        fs::create_dir_all(dir.path().join("y")).unwrap();
        fs::write(dir.path().join("y").join("3"), b"\xff\xff\xff").unwrap();

        assert!(matches!(
            store.read("y", &[3]),
            Err(StoreError::Codec { .. })
        ));
    }
}
