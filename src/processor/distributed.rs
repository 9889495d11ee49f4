use serde::{Deserialize, Serialize};
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::process::{self, Child, Command, ExitStatus, Stdio};
use std::str::FromStr;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Instant, SystemTime, UNIX_EPOCH};

use tracing::{debug, info, warn};
use wait_timeout::ChildExt;

use super::{guarded, partition, ChunkCallback, ChunkProcessor, PollTimings, SharedSink};
use crate::cancel::{InterruptSource, NeverInterrupt};
use crate::cube::{Cube, CubeDocument, WorkerControl};
use crate::diagnostics::{DiagnosticChannel, DiagnosticLine};
use crate::error::{ChunkError, ProcessorError};
use crate::io::WorkerStore;
use crate::progress::{NoProgress, ProgressReporter};

/// Name of the cube document inside the working directory.
pub const DOCUMENT_FILE: &str = "cube.json";

const PLACEHOLDERS: [&str; 4] = ["{document}", "{worker}", "{workers}", "{work_dir}"];

/// Program and arguments used to launch one worker.
///
/// Arguments may contain `{document}`, `{worker}`, `{workers}` and
/// `{work_dir}`. Without any placeholder the four values are appended in
/// that order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandTemplate {
    pub program: String,
    #[serde(default)]
    pub args: Vec<String>,
}

impl CommandTemplate {
    pub fn new(program: impl Into<String>, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
        }
    }

    /// Fully substituted program and arguments for worker `worker`.
    pub fn render(&self, document: &Path, worker: usize, workers: usize, work_dir: &Path) -> Vec<String> {
        let values = [
            document.to_string_lossy().into_owned(),
            worker.to_string(),
            workers.to_string(),
            work_dir.to_string_lossy().into_owned(),
        ];

        let mut tokens: Vec<String> = std::iter::once(&self.program)
            .chain(&self.args)
            .map(|token| {
                PLACEHOLDERS
                    .iter()
                    .zip(&values)
                    .fold(token.clone(), |acc, (key, value)| acc.replace(key, value))
            })
            .collect();

        let templated = std::iter::once(&self.program)
            .chain(&self.args)
            .any(|token| PLACEHOLDERS.iter().any(|key| token.contains(key)));
        if !templated {
            tokens.extend(values);
        }
        tokens
    }

    fn command(&self, document: &Path, worker: usize, workers: usize, work_dir: &Path) -> Command {
        let mut tokens = self.render(document, worker, workers, work_dir).into_iter();
        let mut cmd = Command::new(tokens.next().unwrap_or_default());
        cmd.args(tokens);
        cmd
    }
}

impl FromStr for CommandTemplate {
    type Err = ProcessorError;

    /// Whitespace-separated program and arguments.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut tokens = s.split_whitespace();
        let program = tokens.next().ok_or(ProcessorError::EmptyCommand)?;
        Ok(Self::new(program, tokens))
    }
}

struct RunningWorker {
    index: usize,
    child: Child,
    stderr: Option<JoinHandle<String>>,
    status: Option<ExitStatus>,
}

/// Runs chunks in external worker processes.
///
/// Each worker re-derives its own static partition from the cube document
/// and stores chunks under `<work_dir>/worker-<k>/`. Once every worker has
/// exited cleanly the stored chunks are handed to the callback here. Nothing
/// in the working directory is ever deleted.
///
/// An interrupt seen while workers run creates the run's cancel file, which
/// every worker polls before starting its next chunk.
pub struct ProcessExecutor {
    workers: usize,
    command: CommandTemplate,
    work_dir: PathBuf,
    channel: Arc<DiagnosticChannel>,
    progress: Arc<dyn ProgressReporter>,
    interrupt: Arc<dyn InterruptSource>,
    timings: PollTimings,
}

impl ProcessExecutor {
    pub fn new(
        workers: usize,
        command: CommandTemplate,
        work_dir: impl Into<PathBuf>,
        channel: Arc<DiagnosticChannel>,
    ) -> Self {
        Self {
            workers: workers.max(1),
            command,
            work_dir: work_dir.into(),
            channel,
            progress: Arc::new(NoProgress),
            interrupt: Arc::new(NeverInterrupt),
            timings: PollTimings::default(),
        }
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

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn document_path(&self) -> PathBuf {
        self.work_dir.join(DOCUMENT_FILE)
    }

    /// Cancel file for one `apply` call. Markers left by earlier runs never match.
    fn cancel_marker(&self) -> PathBuf {
        let stamp = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos())
            .unwrap_or_default();
        self.work_dir
            .join(format!("cancel-{}-{stamp}", process::id()))
    }

    fn control(&self, cancel_file: PathBuf) -> WorkerControl {
        WorkerControl {
            cancel_file,
            tick_ms: self.timings.tick.as_millis() as u64,
            interrupt_ms: self.timings.interrupt_every.as_millis() as u64,
        }
    }

    fn spawn(&self, document: &Path, index: usize) -> Result<RunningWorker, ProcessorError> {
        let mut cmd = self
            .command
            .command(document, index, self.workers, &self.work_dir);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped());

        let mut child = cmd
            .spawn()
            .map_err(|source| ProcessorError::Spawn { worker: index, source })?;

        // Drained on its own thread so a chatty worker never blocks on a full pipe.
        let stderr = child.stderr.take().map(|mut pipe| {
            thread::spawn(move || {
                let mut buf = String::new();
                let _ = pipe.read_to_string(&mut buf);
                buf
            })
        });

        debug!(worker = index, pid = child.id(), "spawned worker");
        Ok(RunningWorker {
            index,
            child,
            stderr,
            status: None,
        })
    }

    /// Wait for every worker, pumping diagnostics and watching for an interrupt.
    /// Returns whether an interrupt was observed.
    fn supervise(&self, running: &mut [RunningWorker], cancel_file: &Path) -> Result<bool, ProcessorError> {
        let interrupt_ticks = self.timings.interrupt_ticks();
        let mut interrupted = false;
        let mut tick: u64 = 0;

        while let Some(first) = running.iter().position(|w| w.status.is_none()) {
            if let Err(err) = self.poll_exits(running, first) {
                warn!(error = %err, "cannot poll worker processes; waiting for them");
                self.settle(running);
                self.channel.error(format!("cannot poll worker processes: {err}"));
                self.channel.flush_now();
                return Err(err.into());
            }

            if !interrupted && tick > 0 && tick % interrupt_ticks == 0 && self.interrupt.interrupt_requested() {
                interrupted = true;
                if let Err(err) = fs::write(cancel_file, b"") {
                    warn!(error = %err, path = %cancel_file.display(), "cannot signal workers to stop");
                }
                self.channel.flush_now();
                info!("interrupt observed; workers told to stop, stored chunks will not be delivered");
            }

            self.channel.pump();
            tick += 1;
        }
        Ok(interrupted)
    }

    /// Reap every worker that has exited, blocking at most one tick on `first`.
    fn poll_exits(&self, running: &mut [RunningWorker], first: usize) -> io::Result<()> {
        if let Some(status) = running[first].child.wait_timeout(self.timings.tick)? {
            self.reap(&mut running[first], status);
        }
        for worker in running.iter_mut().filter(|w| w.status.is_none()) {
            if let Some(status) = worker.child.try_wait()? {
                self.reap(worker, status);
            }
        }
        Ok(())
    }

    /// Block until every worker still running has exited. Workers are never killed.
    fn settle(&self, running: &mut [RunningWorker]) {
        for worker in running.iter_mut().filter(|w| w.status.is_none()) {
            match worker.child.wait() {
                Ok(status) => self.reap(worker, status),
                Err(err) => warn!(worker = worker.index, error = %err, "cannot wait for worker"),
            }
        }
    }

    fn reap(&self, worker: &mut RunningWorker, status: ExitStatus) {
        worker.status = Some(status);
        let output = worker
            .stderr
            .take()
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        let source = format!("worker {}", worker.index);
        for line in output.lines().filter(|l| !l.trim().is_empty()) {
            self.channel
                .record(DiagnosticLine::parse_rendered(line).with_source(source.clone()));
        }

        if status.success() {
            debug!(worker = worker.index, "worker finished");
        } else {
            warn!(worker = worker.index, code = ?status.code(), "worker failed");
            let mut line = DiagnosticLine::error(format!(
                "worker {} failed with status {status}",
                worker.index
            ))
            .with_source(source.clone());
            if let Some(code) = status.code() {
                line = line.with_code(code);
            }
            self.channel.record(line);
            if !output.trim().is_empty() {
                self.channel.record(
                    DiagnosticLine::error(format!("worker output: {}", output.trim()))
                        .with_source(source),
                );
            }
        }
        self.progress.increment(1.0 / self.workers as f64);
    }

    /// Hand every stored chunk to the callback, worker by worker, and return
    /// how many were left undelivered because of an interrupt.
    fn deliver(&self, chunk_count: u32, callback: &ChunkCallback<'_>) -> usize {
        let sink = SharedSink::new(());
        let mut interrupted = false;
        let mut skipped = 0;
        let mut last_check = Instant::now();

        for index in 0..self.workers {
            let store = WorkerStore::open(&self.work_dir, index);
            for id in partition(index, self.workers, chunk_count) {
                if !interrupted && last_check.elapsed() >= self.timings.interrupt_every {
                    last_check = Instant::now();
                    if self.interrupt.interrupt_requested() {
                        interrupted = true;
                        self.channel.flush_now();
                        info!("interrupt observed; remaining chunks will not be delivered");
                    }
                }
                if interrupted {
                    skipped += 1;
                    continue;
                }

                let result = guarded(id, || {
                    let data = store.load(id).map_err(|source| ChunkError::Io { id, source })?;
                    callback(id, data, &sink)
                });
                if let Err(err) = result {
                    warn!(worker = index, chunk = id, error = %err, "chunk failed");
                    self.channel.record(
                        DiagnosticLine::error(err.to_string()).with_source(format!("worker {index}")),
                    );
                }
                self.channel.pump();
            }
        }
        skipped
    }
}

impl ChunkProcessor for ProcessExecutor {
    fn max_threads(&self) -> usize {
        self.workers
    }

    fn apply(&self, cube: &dyn Cube, callback: &ChunkCallback<'_>) -> Result<(), ProcessorError> {
        let chunk_count = cube.chunk_count();

        fs::create_dir_all(&self.work_dir)?;
        let document = self.document_path();
        let cancel_file = self.cancel_marker();
        CubeDocument::describe(cube)?
            .with_control(self.control(cancel_file.clone()))
            .write_to(&document)?;

        if self.interrupt.interrupt_requested() {
            info!("interrupt already requested; no worker will start");
            if chunk_count > 0 {
                self.channel.flush_now();
                return Err(ProcessorError::RunInterrupted {
                    skipped: chunk_count as usize,
                });
            }
            return Ok(());
        }

        debug!(workers = self.workers, chunks = chunk_count, "starting worker processes");
        let mut running = Vec::with_capacity(self.workers);
        for index in 0..self.workers {
            match self.spawn(&document, index) {
                Ok(worker) => running.push(worker),
                Err(err) => {
                    self.settle(&mut running);
                    self.channel.error(err.to_string());
                    self.channel.flush_now();
                    return Err(err);
                }
            }
        }

        let interrupted = self.supervise(&mut running, &cancel_file)?;

        if let Some(failed) = running
            .iter()
            .find(|w| w.status.is_some_and(|s| !s.success()))
        {
            self.channel.flush_now();
            return Err(ProcessorError::WorkerFailed {
                worker: failed.index,
                code: failed.status.and_then(|s| s.code()),
            });
        }

        if interrupted && chunk_count > 0 {
            return Err(ProcessorError::RunInterrupted {
                skipped: chunk_count as usize,
            });
        }

        let skipped = self.deliver(chunk_count, callback);
        if skipped > 0 {
            info!(skipped, "run interrupted");
            return Err(ProcessorError::RunInterrupted { skipped });
        }

        self.progress.finalize();
        self.channel.pump();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_template_substitution() {
        let template: CommandTemplate = "cubepool worker --doc={document} {worker}/{workers} {work_dir}"
            .parse()
            .unwrap();
        let tokens = template.render(Path::new("/tmp/w/cube.json"), 1, 4, Path::new("/tmp/w"));
        assert_eq!(
            tokens,
            vec!["cubepool", "worker", "--doc=/tmp/w/cube.json", "1/4", "/tmp/w"]
        );
    }

    #[test]
    fn test_template_appends_positionally() {
        let template = CommandTemplate::new("/opt/my tools/cubepool", ["worker"]);
        let tokens = template.render(Path::new("doc.json"), 0, 2, Path::new("dir with space"));
        assert_eq!(
            tokens,
            vec!["/opt/my tools/cubepool", "worker", "doc.json", "0", "2", "dir with space"]
        );
    }

    #[test]
    fn test_empty_template_rejected() {
        assert!(matches!(
            "   ".parse::<CommandTemplate>(),
            Err(ProcessorError::EmptyCommand)
        ));
    }

    #[test]
    fn test_document_tells_workers_where_to_look() {
        let channel = Arc::new(DiagnosticChannel::stderr(Default::default()));
        let executor = ProcessExecutor::new(2, CommandTemplate::new("true", Vec::<String>::new()), "/tmp/w", channel)
            .with_timings(PollTimings::from_millis(10, 30));

        let marker = executor.cancel_marker();
        assert!(marker.starts_with("/tmp/w"));
        assert!(marker
            .file_name()
            .and_then(|n| n.to_str())
            .is_some_and(|n| n.starts_with("cancel-")));

        let control = executor.control(marker.clone());
        assert_eq!(control.cancel_file, marker);
        assert_eq!((control.tick_ms, control.interrupt_ms), (10, 30));
    }

    #[cfg(unix)]
    #[test]
    fn test_settle_waits_for_running_workers() {
        use crate::diagnostics::{MemorySink, Verbosity};

        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let channel = Arc::new(DiagnosticChannel::new(sink.clone(), Verbosity::Standard));
        let command = CommandTemplate::new("sh", ["-c", "sleep 0.2; echo '[WARNING] slow disk' >&2"]);
        let executor = ProcessExecutor::new(2, command, dir.path(), channel.clone());

        let document = executor.document_path();
        let mut running: Vec<RunningWorker> = (0..2)
            .map(|index| executor.spawn(&document, index).unwrap())
            .collect();
        executor.settle(&mut running);

        assert!(running
            .iter()
            .all(|w| w.status.is_some_and(|s| s.success()) && w.stderr.is_none()));
        channel.pump();
        assert_eq!(
            sink.lines()
                .iter()
                .filter(|l| l.as_str() == "[WARNING] slow disk")
                .count(),
            2
        );
    }

    #[test]
    fn test_max_threads_is_worker_count() {
        let channel = Arc::new(DiagnosticChannel::stderr(Default::default()));
        let executor = ProcessExecutor::new(3, CommandTemplate::new("true", Vec::<String>::new()), "/tmp", channel);
        assert_eq!(executor.max_threads(), 3);
    }
}
