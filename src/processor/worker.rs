use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use tracing::{debug, info};

use super::{partition, LocalExecutor, PollTimings, SharedSink};
use crate::cancel::CancelFile;
use crate::cube::{ChunkData, ChunkId, CubeDocument, DOCUMENT_VERSION};
use crate::error::{ChunkError, ProcessorError};
use crate::io::WorkerStore;

/// What a worker process is told on its command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerArgs {
    pub document: PathBuf,
    pub worker: usize,
    pub workers: usize,
    pub work_dir: PathBuf,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkerSummary {
    pub assigned: usize,
    pub stored: usize,
    /// Chunks left unstarted because the parent asked the workers to stop.
    pub skipped: usize,
}

/// Worker process entry point: rebuild the cube, take this worker's share
/// of chunks and store each one under `<work_dir>/worker-<k>/`.
///
/// When the document carries [`WorkerControl`](crate::cube::WorkerControl),
/// the executor watches its cancel file at the parent's cadence. Stopping
/// early is a clean exit reported through [`WorkerSummary::skipped`].
pub fn run_worker(args: &WorkerArgs, executor: LocalExecutor) -> Result<WorkerSummary, ProcessorError> {
    if args.workers == 0 || args.worker >= args.workers {
        return Err(ProcessorError::InvalidWorker {
            worker: args.worker,
            workers: args.workers,
        });
    }

    let document = CubeDocument::read_from(&args.document)?;
    if document.version != DOCUMENT_VERSION {
        return Err(ProcessorError::UnsupportedDocument(document.version));
    }
    let cube = document.cube.open()?;
    let executor = match &document.control {
        Some(control) => executor
            .with_interrupt(Arc::new(CancelFile::new(&control.cancel_file)))
            .with_timings(PollTimings::from_millis(control.tick_ms, control.interrupt_ms)),
        None => executor,
    };

    let store = WorkerStore::create(&args.work_dir, args.worker)?;
    let ids: Vec<ChunkId> = partition(args.worker, args.workers, cube.chunk_count()).collect();
    debug!(worker = args.worker, assigned = ids.len(), dir = %store.dir().display(), "worker starting");

    let stored = AtomicUsize::new(0);
    let callback = |id: ChunkId, data: ChunkData, _sink: &SharedSink| -> Result<(), ChunkError> {
        store
            .store(id, &data)
            .map_err(|source| ChunkError::Io { id, source })?;
        stored.fetch_add(1, Ordering::SeqCst);
        Ok(())
    };
    let skipped = match executor.apply_ids(cube.as_ref(), &ids, &callback) {
        Ok(()) => 0,
        Err(ProcessorError::RunInterrupted { skipped }) => {
            info!(worker = args.worker, skipped, "worker stopped on request");
            skipped
        }
        Err(err) => return Err(err),
    };

    Ok(WorkerSummary {
        assigned: ids.len(),
        stored: stored.load(Ordering::SeqCst),
        skipped,
    })
}
