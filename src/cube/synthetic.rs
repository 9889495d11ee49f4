use std::collections::BTreeSet;
use std::thread;
use std::time::Duration;

use super::{ChunkData, ChunkId, Cube, CubeSpec};
use crate::error::ChunkError;

/// Deterministic in-memory cube. Chunk `id` holds `chunk_len` bytes derived
/// from the id; ids marked failing cannot be read.
#[derive(Debug, Clone)]
pub struct SyntheticCube {
    chunks: u32,
    chunk_len: usize,
    failing: BTreeSet<ChunkId>,
    delay_ms: u64,
}

impl SyntheticCube {
    pub fn new(chunks: u32, chunk_len: usize) -> Self {
        Self {
            chunks,
            chunk_len,
            failing: BTreeSet::new(),
            delay_ms: 0,
        }
    }

    /// Make every read take at least `delay_ms` milliseconds.
    pub fn with_delay_ms(mut self, delay_ms: u64) -> Self {
        self.delay_ms = delay_ms;
        self
    }

    pub fn with_failing(mut self, ids: impl IntoIterator<Item = ChunkId>) -> Self {
        self.failing.extend(ids);
        self
    }

    pub fn chunk_bytes(id: ChunkId, len: usize) -> Vec<u8> {
        (0..len)
            .map(|i| (id as usize).wrapping_mul(31).wrapping_add(i) as u8)
            .collect()
    }
}

impl Cube for SyntheticCube {
    fn chunk_count(&self) -> u32 {
        self.chunks
    }

    fn read_chunk(&self, id: ChunkId) -> Result<ChunkData, ChunkError> {
        if id >= self.chunks {
            return Err(ChunkError::read(id, "chunk id out of range"));
        }
        if self.delay_ms > 0 {
            thread::sleep(Duration::from_millis(self.delay_ms));
        }
        if self.failing.contains(&id) {
            return Err(ChunkError::read(id, "source data is malformed"));
        }
        Ok(ChunkData::new(Self::chunk_bytes(id, self.chunk_len)))
    }

    fn spec(&self) -> Option<CubeSpec> {
        Some(CubeSpec::Synthetic {
            chunks: self.chunks,
            chunk_len: self.chunk_len,
            failing: self.failing.clone(),
            delay_ms: self.delay_ms,
        })
    }
}
