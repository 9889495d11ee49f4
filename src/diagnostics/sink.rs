use std::io::{self, Write};
use std::sync::{Arc, Mutex, PoisonError};

/// Destination for text emitted by the consumer thread.
pub trait DiagnosticSink: Send {
    fn write_line(&mut self, line: &str);

    /// A progress frame; carries its own line control characters.
    fn write_frame(&mut self, frame: &str);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct StderrSink;

impl DiagnosticSink for StderrSink {
    fn write_line(&mut self, line: &str) {
        let _ = writeln!(io::stderr().lock(), "{line}");
    }

    fn write_frame(&mut self, frame: &str) {
        let mut err = io::stderr().lock();
        let _ = err.write_all(frame.as_bytes());
        let _ = err.flush();
    }
}

/// What a [`MemorySink`] saw, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Emitted {
    Line(String),
    Frame(String),
}

/// Collects emitted text in memory. Clones share the same buffer.
#[derive(Debug, Default, Clone)]
pub struct MemorySink {
    entries: Arc<Mutex<Vec<Emitted>>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entries(&self) -> Vec<Emitted> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn lines(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Emitted::Line(line) => Some(line),
                Emitted::Frame(_) => None,
            })
            .collect()
    }

    pub fn frames(&self) -> Vec<String> {
        self.entries()
            .into_iter()
            .filter_map(|e| match e {
                Emitted::Frame(frame) => Some(frame),
                Emitted::Line(_) => None,
            })
            .collect()
    }

    fn push(&self, entry: Emitted) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(entry);
    }
}

impl DiagnosticSink for MemorySink {
    fn write_line(&mut self, line: &str) {
        self.push(Emitted::Line(line.to_string()));
    }

    fn write_frame(&mut self, frame: &str) {
        self.push(Emitted::Frame(frame.to_string()));
    }
}
