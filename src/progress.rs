use indicatif::ProgressBar;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::diagnostics::DiagnosticChannel;
use crate::io::{create_progress_bar, PROGRESS_TICKS};

/// Cells between the brackets of a text frame.
pub const BAR_WIDTH: usize = 50;

/// Run progress in [0, 1]. Every update defers diagnostics so a log line
/// never lands in the middle of a redraw; `finalize` releases them.
pub trait ProgressReporter: Send + Sync {
    fn set(&self, p: f64);

    fn increment(&self, dp: f64);

    /// Jump to 100%, finish the bar and flush every buffered diagnostic.
    fn finalize(&self);

    fn value(&self) -> f64;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProgressMode {
    None,
    #[default]
    Text,
    Terminal,
}

pub fn reporter_for(mode: ProgressMode, channel: &Arc<DiagnosticChannel>) -> Arc<dyn ProgressReporter> {
    // A log file target gets tagged lines only, never bar frames.
    if channel.log_file().is_some() {
        return Arc::new(NoProgress);
    }

    match mode {
        ProgressMode::None => Arc::new(NoProgress),
        ProgressMode::Text => Arc::new(TextProgress::new(Arc::clone(channel))),
        ProgressMode::Terminal => Arc::new(TerminalProgress::new(Arc::clone(channel))),
    }
}

/// `[=====>     ] 42 %\r`
pub fn render_bar(p: f64) -> String {
    let p = if p.is_nan() { 0.0 } else { p.clamp(0.0, 1.0) };
    let filled = ((BAR_WIDTH as f64 * p) as usize).min(BAR_WIDTH - 1);

    let mut frame = String::with_capacity(BAR_WIDTH + 10);
    frame.push('[');
    frame.push_str(&"=".repeat(filled));
    frame.push('>');
    frame.push_str(&" ".repeat(BAR_WIDTH - filled - 1));
    frame.push_str(&format!("] {} %\r", (p * 100.0) as u32));
    frame
}

/// Bar frames rendered to text and emitted through the diagnostic channel.
pub struct TextProgress {
    channel: Arc<DiagnosticChannel>,
    value: Mutex<f64>,
}

impl TextProgress {
    pub fn new(channel: Arc<DiagnosticChannel>) -> Self {
        Self {
            channel,
            value: Mutex::new(0.0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, f64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // Caller holds the value lock.
    fn store(&self, value: &mut f64, p: f64) {
        self.channel.defer_output();
        *value = p;
        self.channel.emit_frame(render_bar(p));
    }
}

impl ProgressReporter for TextProgress {
    fn set(&self, p: f64) {
        let mut value = self.lock();
        self.store(&mut value, p);
    }

    fn increment(&self, dp: f64) {
        let mut value = self.lock();
        let p = *value + dp;
        self.store(&mut value, p);
    }

    fn finalize(&self) {
        let mut value = self.lock();
        self.store(&mut value, 1.0);
        self.channel.emit_frame("\n");
        self.channel.flush_now();
    }

    fn value(&self) -> f64 {
        *self.lock()
    }
}

/// An indicatif bar on stderr, with the same deferral discipline.
pub struct TerminalProgress {
    channel: Arc<DiagnosticChannel>,
    bar: ProgressBar,
    value: Mutex<f64>,
}

impl TerminalProgress {
    pub fn new(channel: Arc<DiagnosticChannel>) -> Self {
        Self {
            channel,
            bar: create_progress_bar(),
            value: Mutex::new(0.0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, f64> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn store(&self, value: &mut f64, p: f64) {
        self.channel.defer_output();
        *value = p;
        self.bar
            .set_position((p.clamp(0.0, 1.0) * PROGRESS_TICKS as f64) as u64);
    }
}

impl ProgressReporter for TerminalProgress {
    fn set(&self, p: f64) {
        let mut value = self.lock();
        self.store(&mut value, p);
    }

    fn increment(&self, dp: f64) {
        let mut value = self.lock();
        let p = *value + dp;
        self.store(&mut value, p);
    }

    fn finalize(&self) {
        let mut value = self.lock();
        self.store(&mut value, 1.0);
        self.bar.finish();
        self.channel.flush_now();
    }

    fn value(&self) -> f64 {
        *self.lock()
    }
}

/// Silent runs: same interface, no rendering, no flushing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn set(&self, _p: f64) {}

    fn increment(&self, _dp: f64) {}

    fn finalize(&self) {}

    fn value(&self) -> f64 {
        0.0
    }
}
