//! Chunk processors: evaluate every chunk of a cube through a callback.
//!
//! Chunks are assigned statically. Worker `k` of `n` owns ids
//! `k, k + n, k + 2n, ...`, whether it is a thread or a process.

mod distributed;
mod local;
mod worker;

pub use distributed::{CommandTemplate, ProcessExecutor, DOCUMENT_FILE};
pub use local::LocalExecutor;
pub use worker::{run_worker, WorkerArgs, WorkerSummary};

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Mutex;
use std::time::Duration;

use crate::cube::{ChunkData, ChunkId, Cube};
use crate::error::{ChunkError, ProcessorError};

/// Lock shared by every callback of one run, for serializing writes to a
/// common output. Across processes it protects nothing.
pub type SharedSink = Mutex<()>;

/// Per-chunk work. Errors are chunk-local: logged, never fatal to the run.
pub type ChunkCallback<'a> =
    dyn Fn(ChunkId, ChunkData, &SharedSink) -> Result<(), ChunkError> + Sync + 'a;

pub trait ChunkProcessor: Send + Sync {
    /// Intended parallelism; the worker count for process execution.
    fn max_threads(&self) -> usize;

    /// Run `callback` once for every started chunk and block until done.
    ///
    /// Fails with [`ProcessorError::RunInterrupted`] only when a cancellation
    /// actually left chunks unstarted.
    fn apply(&self, cube: &dyn Cube, callback: &ChunkCallback<'_>) -> Result<(), ProcessorError>;
}

/// Chunk ids owned by `worker` out of `workers`, in increasing order.
pub fn partition(worker: usize, workers: usize, chunk_count: u32) -> impl Iterator<Item = ChunkId> {
    let step = workers.max(1);
    (worker as u64..chunk_count as u64)
        .step_by(step)
        .map(|id| id as ChunkId)
}

/// Supervisor cadence: completion is polled every `tick`, the host interrupt
/// every `interrupt_every`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PollTimings {
    pub tick: Duration,
    pub interrupt_every: Duration,
}

impl Default for PollTimings {
    fn default() -> Self {
        Self {
            tick: Duration::from_millis(100),
            interrupt_every: Duration::from_millis(2000),
        }
    }
}

impl PollTimings {
    pub fn from_millis(tick_ms: u64, interrupt_ms: u64) -> Self {
        Self {
            tick: Duration::from_millis(tick_ms.max(1)),
            interrupt_every: Duration::from_millis(interrupt_ms),
        }
    }

    /// Ticks between two interrupt checks, at least one.
    pub fn interrupt_ticks(&self) -> u64 {
        let tick = self.tick.as_millis().max(1);
        ((self.interrupt_every.as_millis() / tick) as u64).max(1)
    }
}

/// Run one chunk's work, turning a panic into a chunk-local error.
pub(crate) fn guarded<F>(id: ChunkId, work: F) -> Result<(), ChunkError>
where
    F: FnOnce() -> Result<(), ChunkError>,
{
    panic::catch_unwind(AssertUnwindSafe(work)).unwrap_or_else(|payload| {
        Err(ChunkError::Panicked {
            id,
            message: panic_message(payload.as_ref()),
        })
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_string()
    }
}
