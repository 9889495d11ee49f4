use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use tracing::{debug, info, warn};

use super::{guarded, ChunkCallback, ChunkProcessor, PollTimings, SharedSink};
use crate::cancel::{InterruptSource, NeverInterrupt};
use crate::cube::{ChunkId, Cube};
use crate::diagnostics::{DiagnosticChannel, DiagnosticLine};
use crate::error::ProcessorError;
use crate::progress::{NoProgress, ProgressReporter};

/// Fixed-size thread pool with static round-robin assignment.
///
/// Cancellation is cooperative: the calling thread supervises the run and
/// raises a shared flag once the host asks to stop; workers consult it only
/// before starting their next chunk.
pub struct LocalExecutor {
    threads: usize,
    pool: rayon::ThreadPool,
    channel: Arc<DiagnosticChannel>,
    progress: Arc<dyn ProgressReporter>,
    interrupt: Arc<dyn InterruptSource>,
    timings: PollTimings,
}

impl LocalExecutor {
    pub fn new(threads: usize, channel: Arc<DiagnosticChannel>) -> Result<Self, ProcessorError> {
        let threads = threads.max(1);
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(threads)
            .thread_name(|i| format!("cubepool-worker-{i}"))
            .build()
            .map_err(|e| ProcessorError::ThreadPool(e.to_string()))?;

        Ok(Self {
            threads,
            pool,
            channel,
            progress: Arc::new(NoProgress),
            interrupt: Arc::new(NeverInterrupt),
            timings: PollTimings::default(),
        })
    }

    pub fn with_progress(mut self, progress: Arc<dyn ProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    pub fn with_interrupt(mut self, interrupt: Arc<dyn InterruptSource>) -> Self {
        self.interrupt = interrupt;
        self
    }

    pub fn with_timings(mut self, timings: PollTimings) -> Self {
        self.timings = timings;
        self
    }

    /// Process the given ids; worker `k` takes positions `k, k + n, ...`.
    pub fn apply_ids(
        &self,
        cube: &dyn Cube,
        ids: &[ChunkId],
        callback: &ChunkCallback<'_>,
    ) -> Result<(), ProcessorError> {
        let sink = SharedSink::new(());
        let interrupted = AtomicBool::new(false);
        let finished: Vec<AtomicBool> = (0..self.threads).map(|_| AtomicBool::new(false)).collect();
        let skipped: Vec<AtomicUsize> = (0..self.threads).map(|_| AtomicUsize::new(0)).collect();
        let step = 1.0 / ids.len().max(1) as f64;

        debug!(threads = self.threads, chunks = ids.len(), "starting local run");

        if self.interrupt.interrupt_requested() {
            interrupted.store(true, Ordering::SeqCst);
            info!("interrupt already requested; no chunk will start");
        }

        self.pool.in_place_scope(|scope| {
            for worker in 0..self.threads {
                let (sink, interrupted) = (&sink, &interrupted);
                let (finished, skipped) = (&finished, &skipped);

                scope.spawn(move |_| {
                    for &id in ids.iter().skip(worker).step_by(self.threads) {
                        if interrupted.load(Ordering::SeqCst) {
                            skipped[worker].fetch_add(1, Ordering::SeqCst);
                            continue;
                        }

                        let result = guarded(id, || {
                            let data = cube.read_chunk(id)?;
                            callback(id, data, sink)
                        });
                        if let Err(err) = result {
                            warn!(worker, chunk = id, error = %err, "chunk failed");
                            self.channel.record(
                                DiagnosticLine::error(err.to_string())
                                    .with_source(format!("worker {worker}")),
                            );
                        }
                        self.progress.increment(step);
                    }
                    finished[worker].store(true, Ordering::SeqCst);
                });
            }

            self.supervise(&finished, &interrupted);
        });

        let skipped: usize = skipped.iter().map(|s| s.load(Ordering::SeqCst)).sum();

        // A late interrupt that skipped nothing leaves a complete result.
        if interrupted.load(Ordering::SeqCst) && skipped > 0 {
            self.channel.flush_now();
            info!(skipped, "run interrupted");
            return Err(ProcessorError::RunInterrupted { skipped });
        }

        self.progress.finalize();
        self.channel.pump();
        Ok(())
    }

    fn supervise(&self, finished: &[AtomicBool], interrupted: &AtomicBool) {
        let interrupt_ticks = self.timings.interrupt_ticks();
        let mut watching = !interrupted.load(Ordering::SeqCst);
        let mut tick: u64 = 0;

        self.channel.pump();
        while !finished.iter().all(|f| f.load(Ordering::SeqCst)) {
            if watching && tick > 0 && tick % interrupt_ticks == 0 && self.interrupt.interrupt_requested() {
                interrupted.store(true, Ordering::SeqCst);
                watching = false;
                self.channel.flush_now();
                info!("interrupt observed; no further chunks will start");
            }

            thread::sleep(self.timings.tick);
            self.channel.pump();
            tick += 1;
        }
        self.channel.pump();
    }
}

impl ChunkProcessor for LocalExecutor {
    fn max_threads(&self) -> usize {
        self.threads
    }

    fn apply(&self, cube: &dyn Cube, callback: &ChunkCallback<'_>) -> Result<(), ProcessorError> {
        let ids: Vec<ChunkId> = (0..cube.chunk_count()).collect();
        self.apply_ids(cube, &ids, callback)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::CancellationToken;
    use crate::cube::{ChunkData, SyntheticCube};
    use crate::diagnostics::{MemorySink, Verbosity};
    use crate::error::ChunkError;
    use crate::progress::TextProgress;
    use std::sync::Mutex;
    use std::time::Duration;

    fn fast() -> PollTimings {
        PollTimings::from_millis(2, 4)
    }

    fn executor(threads: usize) -> (LocalExecutor, MemorySink) {
        let sink = MemorySink::new();
        let channel = Arc::new(DiagnosticChannel::new(sink.clone(), Verbosity::Standard));
        let executor = LocalExecutor::new(threads, channel).unwrap().with_timings(fast());
        (executor, sink)
    }

    #[test]
    fn test_every_chunk_once() {
        let (executor, _) = executor(3);
        let cube = SyntheticCube::new(10, 4);
        let seen = Mutex::new(Vec::new());

        let callback = |id: ChunkId, data: ChunkData, _sink: &SharedSink| -> Result<(), ChunkError> {
            assert_eq!(data.as_bytes(), SyntheticCube::chunk_bytes(id, 4).as_slice());
            seen.lock().unwrap().push(id);
            Ok(())
        };
        executor.apply(&cube, &callback).unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, (0..10).collect::<Vec<_>>());
        assert_eq!(executor.max_threads(), 3);
    }

    #[test]
    fn test_single_worker_runs_in_increasing_order() {
        let (executor, _) = executor(1);
        let seen = Mutex::new(Vec::new());

        let callback = |id: ChunkId, _data: ChunkData, _sink: &SharedSink| -> Result<(), ChunkError> {
            seen.lock().unwrap().push(id);
            Ok(())
        };
        executor.apply(&SyntheticCube::new(7, 1), &callback).unwrap();

        assert_eq!(seen.into_inner().unwrap(), (0..7).collect::<Vec<_>>());
    }

    #[test]
    fn test_apply_ids_restricts_work() {
        let (executor, _) = executor(2);
        let seen = Mutex::new(Vec::new());

        let callback = |id: ChunkId, _data: ChunkData, _sink: &SharedSink| -> Result<(), ChunkError> {
            seen.lock().unwrap().push(id);
            Ok(())
        };
        executor
            .apply_ids(&SyntheticCube::new(10, 1), &[1, 4, 7], &callback)
            .unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        assert_eq!(seen, vec![1, 4, 7]);
    }

    #[test]
    fn test_zero_chunks() {
        let (executor, _) = executor(2);
        let calls = AtomicUsize::new(0);
        let callback = |_: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        executor.apply(&SyntheticCube::new(0, 1), &callback).unwrap();
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_failed_chunk_is_logged_and_worker_continues() {
        let (executor, sink) = executor(2);
        let cube = SyntheticCube::new(6, 2).with_failing([1]);
        let seen = Mutex::new(Vec::new());

        let callback = |id: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> {
            seen.lock().unwrap().push(id);
            if id == 2 {
                return Err(ChunkError::callback(id, "cannot encode"));
            }
            if id == 4 {
                panic!("poison chunk");
            }
            Ok(())
        };
        executor.apply(&cube, &callback).unwrap();

        let mut seen = seen.into_inner().unwrap();
        seen.sort_unstable();
        // Chunk 3 follows failing chunk 1 on the same worker.
        assert_eq!(seen, vec![0, 2, 3, 4, 5]);

        let lines = sink.lines();
        assert_eq!(lines.len(), 3);
        assert!(lines.iter().any(|l| l.starts_with("[ERROR]") && l.contains("chunk 1")));
        assert!(lines.iter().any(|l| l.contains("chunk 2")));
        assert!(lines.iter().any(|l| l.contains("chunk 4") && l.contains("poison chunk")));
    }

    #[test]
    fn test_interrupt_before_start_skips_everything() {
        let (executor, _) = executor(2);
        let token = CancellationToken::new();
        token.cancel();
        let executor = executor.with_interrupt(Arc::new(token));

        let calls = AtomicUsize::new(0);
        let callback = |_: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        };
        let err = executor.apply(&SyntheticCube::new(5, 1), &callback).unwrap_err();

        assert!(matches!(err, ProcessorError::RunInterrupted { skipped: 5 }));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_interrupt_mid_run_skips_remaining_chunks() {
        let (executor, _) = executor(1);
        let token = CancellationToken::new();
        let executor = executor.with_interrupt(Arc::new(token.clone()));
        let seen = Mutex::new(Vec::new());

        let callback = |id: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> {
            seen.lock().unwrap().push(id);
            if id == 0 {
                token.cancel();
                // Long enough for the supervisor to notice.
                thread::sleep(Duration::from_millis(100));
            }
            Ok(())
        };
        let err = executor.apply(&SyntheticCube::new(6, 1), &callback).unwrap_err();

        assert!(err.is_interrupted());
        assert_eq!(seen.into_inner().unwrap(), vec![0]);
    }

    #[test]
    fn test_late_interrupt_still_succeeds() {
        let (executor, _) = executor(2);
        let token = CancellationToken::new();
        let executor = executor.with_interrupt(Arc::new(token.clone()));
        let started = AtomicUsize::new(0);

        let callback = |_: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> {
            // Once both chunks are running, the host asks to stop.
            if started.fetch_add(1, Ordering::SeqCst) + 1 == 2 {
                token.cancel();
            }
            while !token.is_cancelled() {
                thread::sleep(Duration::from_millis(1));
            }
            thread::sleep(Duration::from_millis(50));
            Ok(())
        };
        executor.apply(&SyntheticCube::new(2, 1), &callback).unwrap();

        assert!(token.is_cancelled());
        assert_eq!(started.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_shared_sink_serializes_writes() {
        let (executor, _) = executor(4);
        let output = Mutex::new(Vec::new());

        let callback = |id: ChunkId, data: ChunkData, sink: &SharedSink| -> Result<(), ChunkError> {
            let _guard = sink.lock().unwrap();
            output.lock().unwrap().push((id, data.len()));
            Ok(())
        };
        executor.apply(&SyntheticCube::new(20, 3), &callback).unwrap();
        assert_eq!(output.into_inner().unwrap().len(), 20);
    }

    #[test]
    fn test_progress_reaches_completion() {
        let sink = MemorySink::new();
        let channel = Arc::new(DiagnosticChannel::new(sink.clone(), Verbosity::Standard));
        let progress = Arc::new(TextProgress::new(Arc::clone(&channel)));
        let executor = LocalExecutor::new(2, Arc::clone(&channel))
            .unwrap()
            .with_timings(fast())
            .with_progress(progress.clone());

        let callback = |_: ChunkId, _: ChunkData, _: &SharedSink| -> Result<(), ChunkError> { Ok(()) };
        executor.apply(&SyntheticCube::new(4, 1).with_failing([3]), &callback).unwrap();

        assert_eq!(progress.value(), 1.0);
        let frames = sink.frames();
        assert!(frames.iter().any(|f| f.contains("100 %")));
        assert_eq!(frames.last().map(String::as_str), Some("\n"));
        // The failure was deferred behind the bar and released by finalize.
        assert_eq!(sink.lines().len(), 1);
        assert_eq!(channel.buffered(), 0);
    }
}
