use std::path::{Path, PathBuf};

use super::{ChunkData, ChunkId, Cube, CubeSpec};
use crate::error::{ChunkError, CubeError};
use crate::io::ChunkFileReader;

/// A file split into fixed-size chunks. The last chunk may be short.
pub struct FileCube {
    path: PathBuf,
    chunk_size: usize,
    reader: ChunkFileReader,
    chunks: u32,
}

impl FileCube {
    pub fn open<P: AsRef<Path>>(path: P, chunk_size: usize) -> Result<Self, CubeError> {
        if chunk_size == 0 {
            return Err(CubeError::InvalidChunkSize(chunk_size));
        }

        let path = path.as_ref().to_path_buf();
        let reader = ChunkFileReader::new(&path)?;
        let chunks = reader.len().div_ceil(chunk_size) as u64;
        let chunks = u32::try_from(chunks).map_err(|_| CubeError::TooManyChunks(chunks))?;

        Ok(Self {
            path,
            chunk_size,
            reader,
            chunks,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn len(&self) -> usize {
        self.reader.len()
    }

    pub fn is_empty(&self) -> bool {
        self.reader.is_empty()
    }

    pub fn chunk_offset(&self, id: ChunkId) -> u64 {
        id as u64 * self.chunk_size as u64
    }
}

impl Cube for FileCube {
    fn chunk_count(&self) -> u32 {
        self.chunks
    }

    fn read_chunk(&self, id: ChunkId) -> Result<ChunkData, ChunkError> {
        self.reader
            .slice(self.chunk_offset(id) as usize, self.chunk_size)
            .map(|bytes| ChunkData::new(bytes.to_vec()))
            .ok_or_else(|| {
                ChunkError::read(id, format!("beyond end of {}", self.path.display()))
            })
    }

    fn spec(&self) -> Option<CubeSpec> {
        Some(CubeSpec::File {
            path: self.path.clone(),
            chunk_size: self.chunk_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_chunking_with_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, (0u8..10).collect::<Vec<_>>()).unwrap();

        let cube = FileCube::open(&path, 4).unwrap();
        assert_eq!(cube.chunk_count(), 3);
        assert_eq!(cube.read_chunk(0).unwrap().as_bytes(), &[0, 1, 2, 3]);
        assert_eq!(cube.read_chunk(2).unwrap().as_bytes(), &[8, 9]);
        assert_eq!(cube.read_chunk(3).unwrap_err().chunk_id(), 3);
    }

    #[test]
    fn test_empty_file_has_no_chunks() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.bin");
        fs::write(&path, b"").unwrap();

        let cube = FileCube::open(&path, 4).unwrap();
        assert_eq!(cube.chunk_count(), 0);
    }

    #[test]
    fn test_rejects_zero_chunk_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        fs::write(&path, [1u8]).unwrap();

        assert!(matches!(
            FileCube::open(&path, 0),
            Err(CubeError::InvalidChunkSize(0))
        ));
    }

    #[test]
    fn test_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        assert!(matches!(
            FileCube::open(dir.path().join("nope.bin"), 4),
            Err(CubeError::Open { .. })
        ));
    }
}
