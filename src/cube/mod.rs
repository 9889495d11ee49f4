//! The task source: a chunk-partitioned computation evaluated lazily.
//!
//! Executors only ever see the [`Cube`] trait. Cubes that can be rebuilt in
//! another process also describe themselves as a [`CubeSpec`].

mod file;
mod synthetic;

pub use file::FileCube;
pub use synthetic::SyntheticCube;

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{ChunkError, CubeError, ProcessorError};

/// Dense, zero-based chunk index.
pub type ChunkId = u32;

/// Current version of the worker document format.
pub const DOCUMENT_VERSION: u32 = 1;

/// Materialized data of one chunk, owned by the worker processing it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChunkData {
    bytes: Vec<u8>,
}

impl ChunkData {
    pub fn new(bytes: Vec<u8>) -> Self {
        Self { bytes }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub trait Cube: Send + Sync {
    /// Number of chunks; fixed for the lifetime of one run.
    fn chunk_count(&self) -> u32;

    /// Materialize chunk `id`. Malformed or missing source data is a
    /// chunk-local failure.
    fn read_chunk(&self, id: ChunkId) -> Result<ChunkData, ChunkError>;

    /// Construction recipe for rebuilding an equivalent cube elsewhere.
    fn spec(&self) -> Option<CubeSpec> {
        None
    }
}

/// Serializable construction graph of a cube.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CubeSpec {
    File {
        path: PathBuf,
        chunk_size: usize,
    },
    Synthetic {
        chunks: u32,
        chunk_len: usize,
        #[serde(default)]
        failing: BTreeSet<ChunkId>,
        #[serde(default)]
        delay_ms: u64,
    },
}

impl CubeSpec {
    pub fn open(&self) -> Result<Box<dyn Cube>, CubeError> {
        match self {
            CubeSpec::File { path, chunk_size } => Ok(Box::new(FileCube::open(path, *chunk_size)?)),
            CubeSpec::Synthetic {
                chunks,
                chunk_len,
                failing,
                delay_ms,
            } => Ok(Box::new(
                SyntheticCube::new(*chunks, *chunk_len)
                    .with_failing(failing.iter().copied())
                    .with_delay_ms(*delay_ms),
            )),
        }
    }
}

/// Run-scoped settings a worker process follows.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerControl {
    /// Created by the parent once it observes an interrupt.
    pub cancel_file: PathBuf,
    pub tick_ms: u64,
    pub interrupt_ms: u64,
}

/// Self-describing document handed to worker processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CubeDocument {
    pub version: u32,
    pub cube: CubeSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub control: Option<WorkerControl>,
}

impl CubeDocument {
    pub fn describe(cube: &dyn Cube) -> Result<Self, CubeError> {
        let spec = cube.spec().ok_or(CubeError::NotSerializable)?;
        Ok(Self {
            version: DOCUMENT_VERSION,
            cube: spec,
            control: None,
        })
    }

    pub fn with_control(mut self, control: WorkerControl) -> Self {
        self.control = Some(control);
        self
    }

    pub fn write_to(&self, path: &Path) -> Result<(), ProcessorError> {
        let json = serde_json::to_string_pretty(self)?;
        fs::write(path, json)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self, ProcessorError> {
        let text = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
