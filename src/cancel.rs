use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// A host-side interrupt the supervising loop polls.
pub trait InterruptSource: Send + Sync {
    fn interrupt_requested(&self) -> bool;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct NeverInterrupt;

impl InterruptSource for NeverInterrupt {
    fn interrupt_requested(&self) -> bool {
        false
    }
}

/// One-way cancellation flag. Clones share state.
#[derive(Debug, Default, Clone)]
pub struct CancellationToken {
    cancelled: Arc<AtomicBool>,
}

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

impl InterruptSource for CancellationToken {
    fn interrupt_requested(&self) -> bool {
        self.is_cancelled()
    }
}

/// Interrupt requested once `path` exists.
#[derive(Debug, Clone)]
pub struct CancelFile {
    path: PathBuf,
}

impl CancelFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl InterruptSource for CancelFile {
    fn interrupt_requested(&self) -> bool {
        self.path.exists()
    }
}
