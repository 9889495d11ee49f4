//! Chunk-parallel evaluation of lazily defined cubes.
//!
//! A [`Cube`] says how many chunks exist and how to materialize one. A
//! [`ChunkProcessor`] runs a callback over every chunk, either on a local
//! thread pool ([`LocalExecutor`]) or in external worker processes
//! ([`ProcessExecutor`]). Diagnostics from any thread funnel through one
//! [`DiagnosticChannel`] and are emitted only by the thread driving the run.

pub mod cancel;
pub mod config;
pub mod cube;
pub mod diagnostics;
pub mod error;
pub mod io;
pub mod processor;
pub mod progress;

pub use cancel::{CancelFile, CancellationToken, InterruptSource, NeverInterrupt};
pub use config::EngineConfig;
pub use cube::{
    ChunkData, ChunkId, Cube, CubeDocument, CubeSpec, FileCube, SyntheticCube, WorkerControl,
};
pub use diagnostics::{DiagnosticChannel, DiagnosticLine, Severity, Verbosity};
pub use error::{ChunkError, ConfigError, CubeError, ProcessorError};
pub use processor::{
    partition, run_worker, ChunkCallback, ChunkProcessor, CommandTemplate, LocalExecutor,
    PollTimings, ProcessExecutor, SharedSink, WorkerArgs,
};
pub use progress::{NoProgress, ProgressMode, ProgressReporter, TextProgress};
