use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::cancel::InterruptSource;
use crate::diagnostics::{DiagnosticChannel, Verbosity};
use crate::error::ConfigError;
use crate::processor::{ChunkProcessor, CommandTemplate, LocalExecutor, PollTimings, ProcessExecutor};
use crate::progress::{reporter_for, ProgressMode};

pub fn default_threads() -> usize {
    num_cpus::get().min(8) // Cap at 8 workers for (probably) diminishing returns
}

/// Everything needed to assemble a chunk processor and its diagnostics.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Threads of the local executor.
    pub threads: usize,
    /// Worker processes; zero selects local execution.
    pub workers: usize,
    pub command: Option<CommandTemplate>,
    pub work_dir: Option<PathBuf>,
    pub verbosity: Verbosity,
    pub log_file: Option<PathBuf>,
    pub progress: ProgressMode,
    pub tick_ms: u64,
    pub interrupt_ms: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            threads: default_threads(),
            workers: 0,
            command: None,
            work_dir: None,
            verbosity: Verbosity::Standard,
            log_file: None,
            progress: ProgressMode::Text,
            tick_ms: 100,
            interrupt_ms: 2000,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(serde_json::from_str(&text)?)
    }

    pub fn timings(&self) -> PollTimings {
        PollTimings::from_millis(self.tick_ms, self.interrupt_ms)
    }

    /// Stderr channel, or the log file when one is configured.
    pub fn channel(&self) -> DiagnosticChannel {
        let channel = DiagnosticChannel::stderr(self.verbosity);
        match &self.log_file {
            Some(path) => channel.with_log_file(path),
            None => channel,
        }
    }

    pub fn build_processor(
        &self,
        channel: Arc<DiagnosticChannel>,
        interrupt: Arc<dyn InterruptSource>,
    ) -> Result<Box<dyn ChunkProcessor>, ConfigError> {
        let progress = reporter_for(self.progress, &channel);

        if self.workers == 0 {
            let executor = LocalExecutor::new(self.threads, channel)?
                .with_progress(progress)
                .with_interrupt(interrupt)
                .with_timings(self.timings());
            return Ok(Box::new(executor));
        }

        let missing = |setting| ConfigError::Missing {
            setting,
            workers: self.workers,
        };
        let command = self.command.clone().ok_or_else(|| missing("a worker command"))?;
        let work_dir = self.work_dir.clone().ok_or_else(|| missing("a working directory"))?;

        let executor = ProcessExecutor::new(self.workers, command, work_dir, channel)
            .with_progress(progress)
            .with_interrupt(interrupt)
            .with_timings(self.timings());
        Ok(Box::new(executor))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cancel::NeverInterrupt;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.threads >= 1 && config.threads <= 8);
        assert_eq!(config.workers, 0);
        assert_eq!(config.timings(), PollTimings::default());
    }

    #[test]
    fn test_load_partial_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("engine.json");
        fs::write(
            &path,
            r#"{"workers": 2, "command": {"program": "cubepool", "args": ["worker"]}, "verbosity": "debug"}"#,
        )
        .unwrap();

        let config = EngineConfig::load(&path).unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.verbosity, Verbosity::Debug);
        assert_eq!(config.tick_ms, 100);
        assert_eq!(config.command.unwrap().args, vec!["worker"]);
    }

    #[test]
    fn test_build_local_processor() {
        let config = EngineConfig {
            threads: 3,
            ..EngineConfig::default()
        };
        let channel = Arc::new(config.channel());
        let processor = config.build_processor(channel, Arc::new(NeverInterrupt)).unwrap();
        assert_eq!(processor.max_threads(), 3);
    }

    #[test]
    fn test_process_execution_requires_settings() {
        let config = EngineConfig {
            workers: 2,
            command: Some(CommandTemplate::new("cubepool", ["worker"])),
            ..EngineConfig::default()
        };
        let channel = Arc::new(config.channel());
        let err = config
            .build_processor(channel, Arc::new(NeverInterrupt))
            .err()
            .unwrap();
        assert!(matches!(err, ConfigError::Missing { setting: "a working directory", .. }));
    }

    #[test]
    fn test_build_process_processor() {
        let config = EngineConfig {
            workers: 4,
            command: Some(CommandTemplate::new("cubepool", ["worker"])),
            work_dir: Some(PathBuf::from("/tmp/cubepool")),
            ..EngineConfig::default()
        };
        let channel = Arc::new(config.channel());
        let processor = config.build_processor(channel, Arc::new(NeverInterrupt)).unwrap();
        assert_eq!(processor.max_threads(), 4);
    }
}
