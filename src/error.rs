use std::path::PathBuf;

use thiserror::Error;

use crate::cube::ChunkId;

/// A failure confined to one chunk. Workers log it and move on.
#[derive(Error, Debug)]
pub enum ChunkError {
    #[error("cannot read chunk {id}: {reason}")]
    Read { id: ChunkId, reason: String },

    #[error("processing chunk {id} failed: {reason}")]
    Callback { id: ChunkId, reason: String },

    #[error("unexpected panic while processing chunk {id}: {message}")]
    Panicked { id: ChunkId, message: String },

    #[error("I/O error on chunk {id}: {source}")]
    Io {
        id: ChunkId,
        #[source]
        source: std::io::Error,
    },
}

impl ChunkError {
    pub fn read(id: ChunkId, reason: impl Into<String>) -> Self {
        ChunkError::Read {
            id,
            reason: reason.into(),
        }
    }

    pub fn callback(id: ChunkId, reason: impl Into<String>) -> Self {
        ChunkError::Callback {
            id,
            reason: reason.into(),
        }
    }

    pub fn chunk_id(&self) -> ChunkId {
        match self {
            ChunkError::Read { id, .. }
            | ChunkError::Callback { id, .. }
            | ChunkError::Panicked { id, .. }
            | ChunkError::Io { id, .. } => *id,
        }
    }
}

/// Failures opening or describing a cube.
#[derive(Error, Debug)]
pub enum CubeError {
    #[error("failed to open {}: {source}", .path.display())]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid chunk size {0}: must be greater than zero")]
    InvalidChunkSize(usize),

    #[error("cube has {0} chunks, more than a chunk id can address")]
    TooManyChunks(u64),

    #[error("cube cannot be described as a document")]
    NotSerializable,
}

/// Run-level failures returned from `ChunkProcessor::apply`.
#[derive(Error, Debug)]
pub enum ProcessorError {
    #[error("computations have been interrupted by the user ({skipped} chunks skipped)")]
    RunInterrupted { skipped: usize },

    #[error("worker {worker} exited with {}", describe_code(.code))]
    WorkerFailed { worker: usize, code: Option<i32> },

    #[error("failed to spawn worker {worker}: {source}")]
    Spawn {
        worker: usize,
        #[source]
        source: std::io::Error,
    },

    #[error("empty worker command template")]
    EmptyCommand,

    #[error("invalid worker index {worker} for {workers} workers")]
    InvalidWorker { worker: usize, workers: usize },

    #[error("unsupported cube document version {0}")]
    UnsupportedDocument(u32),

    #[error("failed to build thread pool: {0}")]
    ThreadPool(String),

    #[error("cube document error: {0}")]
    Document(#[from] serde_json::Error),

    #[error(transparent)]
    Cube(#[from] CubeError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProcessorError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ProcessorError::RunInterrupted { .. })
    }
}

/// Problems assembling an engine from configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("process execution with {workers} workers requires {setting}")]
    Missing {
        setting: &'static str,
        workers: usize,
    },

    #[error(transparent)]
    Processor(#[from] ProcessorError),
}

fn describe_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit code {code}"),
        None => "no exit code (terminated by signal)".to_string(),
    }
}
