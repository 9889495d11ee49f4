//! Thread-safe diagnostics with a single emitting thread.
//!
//! Any thread may record lines. Only the consumer thread (the one driving an
//! executor's supervising loop) writes to the visible sink; everyone else
//! just buffers. While a progress redraw is in flight the channel is
//! deferred and recorded lines stay buffered until the next flush.

mod line;
mod sink;

pub use line::{DiagnosticLine, Severity, Verbosity};
pub use sink::{DiagnosticSink, Emitted, MemorySink, StderrSink};

use std::collections::VecDeque;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};

enum Output {
    Line(String),
    Frame(String),
}

struct ChannelState {
    /// Recorded lines still subject to deferral.
    pending: Vec<DiagnosticLine>,
    /// Released output waiting for the consumer thread.
    released: VecDeque<Output>,
    deferred: bool,
    consumer: ThreadId,
    sink: Box<dyn DiagnosticSink>,
}

pub struct DiagnosticChannel {
    state: Mutex<ChannelState>,
    verbosity: Verbosity,
    log_file: Option<PathBuf>,
}

impl DiagnosticChannel {
    /// Channel emitting to `sink`, with the calling thread as consumer.
    pub fn new(sink: impl DiagnosticSink + 'static, verbosity: Verbosity) -> Self {
        Self {
            state: Mutex::new(ChannelState {
                pending: Vec::new(),
                released: VecDeque::new(),
                deferred: false,
                consumer: thread::current().id(),
                sink: Box::new(sink),
            }),
            verbosity,
            log_file: None,
        }
    }

    pub fn stderr(verbosity: Verbosity) -> Self {
        Self::new(StderrSink, verbosity)
    }

    /// Append lines to `path` instead of the visible sink. Progress frames
    /// are dropped while a log file is the target.
    pub fn with_log_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.log_file = Some(path.into());
        self
    }

    pub fn verbosity(&self) -> Verbosity {
        self.verbosity
    }

    pub fn log_file(&self) -> Option<&Path> {
        self.log_file.as_deref()
    }

    /// Make the calling thread the one allowed to emit.
    pub fn claim_consumer(&self) {
        self.lock().consumer = thread::current().id();
    }

    pub fn is_consumer(&self) -> bool {
        self.lock().consumer == thread::current().id()
    }

    pub fn record(&self, line: DiagnosticLine) {
        if !self.verbosity.admits(line.severity) {
            return;
        }

        let mut state = self.lock();
        if let Some(path) = &self.log_file {
            // Falls back to the visible path when the file is unusable.
            if append_line(path, &line.render_for_file(self.verbosity)).is_ok() {
                return;
            }
        }

        state.pending.push(line);
        if !state.deferred {
            state.release(self.verbosity);
        }
        state.drain_if_consumer();
    }

    pub fn error(&self, message: impl Into<String>) {
        self.record(DiagnosticLine::error(message));
    }

    pub fn warn(&self, message: impl Into<String>) {
        self.record(DiagnosticLine::warning(message));
    }

    pub fn info(&self, message: impl Into<String>) {
        self.record(DiagnosticLine::info(message));
    }

    pub fn debug(&self, message: impl Into<String>) {
        self.record(DiagnosticLine::debug(message));
    }

    /// Hold recorded lines back until the next `flush_now`.
    pub fn defer_output(&self) {
        self.lock().deferred = true;
    }

    /// Release every buffered line regardless of deferral, and end deferral.
    pub fn flush_now(&self) {
        let mut state = self.lock();
        state.release(self.verbosity);
        state.deferred = false;
        state.drain_if_consumer();
    }

    /// Hand a rendered progress frame to the visible sink.
    pub fn emit_frame(&self, frame: impl Into<String>) {
        if self.log_file.is_some() {
            return;
        }

        let mut state = self.lock();
        state.released.push_back(Output::Frame(frame.into()));
        state.drain_if_consumer();
    }

    /// Emit released output if called from the consumer thread.
    pub fn pump(&self) {
        self.lock().drain_if_consumer();
    }

    pub fn is_deferred(&self) -> bool {
        self.lock().deferred
    }

    /// Lines and frames recorded but not yet emitted.
    pub fn buffered(&self) -> usize {
        let state = self.lock();
        state.pending.len() + state.released.len()
    }

    fn lock(&self) -> MutexGuard<'_, ChannelState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ChannelState {
    fn release(&mut self, verbosity: Verbosity) {
        self.released.extend(
            self.pending
                .drain(..)
                .map(|line| Output::Line(line.render(verbosity))),
        );
    }

    fn drain_if_consumer(&mut self) {
        if self.consumer != thread::current().id() {
            return;
        }

        while let Some(output) = self.released.pop_front() {
            match output {
                Output::Line(text) => self.sink.write_line(&text),
                Output::Frame(frame) => self.sink.write_frame(&frame),
            }
        }
    }
}

fn append_line(path: &Path, text: &str) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    writeln!(file, "{text}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn channel() -> (Arc<DiagnosticChannel>, MemorySink) {
        let sink = MemorySink::new();
        (
            Arc::new(DiagnosticChannel::new(sink.clone(), Verbosity::Standard)),
            sink,
        )
    }

    #[test]
    fn test_consumer_emits_immediately() {
        let (channel, sink) = channel();
        channel.info("hello");
        channel.debug("hidden");
        assert_eq!(sink.lines(), vec!["## hello"]);
        assert_eq!(channel.buffered(), 0);
    }

    #[test]
    fn test_other_threads_only_buffer() {
        let (channel, sink) = channel();

        let remote = Arc::clone(&channel);
        thread::spawn(move || remote.warn("from worker"))
            .join()
            .unwrap();

        assert!(sink.lines().is_empty());
        assert_eq!(channel.buffered(), 1);

        channel.pump();
        assert_eq!(sink.lines(), vec!["[WARNING] from worker"]);
    }

    #[test]
    fn test_flush_from_worker_does_not_emit() {
        let (channel, sink) = channel();
        channel.defer_output();

        let remote = Arc::clone(&channel);
        thread::spawn(move || {
            remote.error("late");
            remote.flush_now();
        })
        .join()
        .unwrap();

        assert!(sink.lines().is_empty());
        assert!(!channel.is_deferred());
        channel.pump();
        assert_eq!(sink.lines(), vec!["[ERROR] late"]);
    }

    #[test]
    fn test_deferral_holds_lines_until_flush() {
        let (channel, sink) = channel();
        channel.defer_output();
        channel.info("one");
        channel.emit_frame("[>] 0 %\r");
        channel.info("two");

        assert_eq!(sink.entries(), vec![Emitted::Frame("[>] 0 %\r".into())]);
        channel.pump();
        assert_eq!(sink.lines().len(), 0);

        channel.flush_now();
        assert_eq!(sink.lines(), vec!["## one", "## two"]);
        assert!(!channel.is_deferred());
    }

    #[test]
    fn test_concurrent_lines_stay_whole_and_ordered_per_thread() {
        let (channel, sink) = channel();

        thread::scope(|s| {
            for t in 0..4 {
                let channel = &channel;
                s.spawn(move || {
                    for i in 0..50 {
                        channel.info(format!("thread {t} line {i}"));
                    }
                });
            }
        });
        channel.pump();

        let lines = sink.lines();
        assert_eq!(lines.len(), 200);
        for t in 0..4 {
            let prefix = format!("## thread {t} line ");
            let seen: Vec<usize> = lines
                .iter()
                .filter_map(|l| l.strip_prefix(&prefix))
                .map(|n| n.parse().unwrap())
                .collect();
            assert_eq!(seen, (0..50).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_claim_consumer_moves_emission() {
        let (channel, sink) = channel();
        let remote = Arc::clone(&channel);
        thread::spawn(move || {
            remote.claim_consumer();
            remote.info("worker owns output");
        })
        .join()
        .unwrap();

        assert_eq!(sink.lines(), vec!["## worker owns output"]);
        assert!(!channel.is_consumer());
    }

    #[test]
    fn test_log_file_target() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        let sink = MemorySink::new();
        let channel = DiagnosticChannel::new(sink.clone(), Verbosity::Standard).with_log_file(&path);

        channel.error("bad chunk");
        channel.info("done");
        channel.emit_frame("[=>] 50 %\r");

        assert!(sink.entries().is_empty());
        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text, "Error: bad chunk\n## done\n");
    }

    #[test]
    fn test_unwritable_log_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let sink = MemorySink::new();
        let channel = DiagnosticChannel::new(sink.clone(), Verbosity::Standard)
            .with_log_file(dir.path().join("missing").join("run.log"));

        channel.warn("still visible");
        assert_eq!(sink.lines(), vec!["[WARNING] still visible"]);
    }
}
