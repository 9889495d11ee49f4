use serde::{Deserialize, Serialize};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Error,
    Warning,
    Info,
    Debug,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Severity::Error => "error",
            Severity::Warning => "warning",
            Severity::Info => "info",
            Severity::Debug => "debug",
        };
        f.write_str(name)
    }
}

/// Severity filter and output style.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verbosity {
    #[default]
    Standard,
    Debug,
}

impl Verbosity {
    pub fn admits(self, severity: Severity) -> bool {
        match self {
            Verbosity::Standard => severity != Severity::Debug,
            Verbosity::Debug => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLine {
    pub severity: Severity,
    pub message: String,
    pub source: Option<String>,
    pub code: Option<i32>,
}

impl DiagnosticLine {
    pub fn new(severity: Severity, message: impl Into<String>) -> Self {
        Self {
            severity,
            message: message.into(),
            source: None,
            code: None,
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self::new(Severity::Error, message)
    }

    pub fn warning(message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, message)
    }

    pub fn info(message: impl Into<String>) -> Self {
        Self::new(Severity::Info, message)
    }

    pub fn debug(message: impl Into<String>) -> Self {
        Self::new(Severity::Debug, message)
    }

    pub fn with_source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn with_code(mut self, code: i32) -> Self {
        self.code = Some(code);
        self
    }

    /// Recover a line rendered by another process's channel. Errors and
    /// warnings keep their severity; anything else becomes debug output.
    pub fn parse_rendered(text: &str) -> Self {
        if let Some(message) = text.strip_prefix("[ERROR] ") {
            Self::error(message)
        } else if let Some(message) = text.strip_prefix("[WARNING] ") {
            Self::warning(message)
        } else {
            Self::debug(text)
        }
    }

    /// Tagged text for the visible sink.
    pub fn render(&self, verbosity: Verbosity) -> String {
        match verbosity {
            Verbosity::Standard => match self.severity {
                Severity::Error => format!("[ERROR] {}", self.message),
                Severity::Warning => format!("[WARNING] {}", self.message),
                Severity::Info | Severity::Debug => format!("## {}", self.message),
            },
            Verbosity::Debug => {
                let tag = match self.severity {
                    Severity::Error => "[ERROR]",
                    Severity::Warning => "[WARNING]",
                    Severity::Info => "[INFO]",
                    Severity::Debug => "[DEBUG]",
                };
                format!("{tag} {}{}", self.message, self.context())
            }
        }
    }

    /// Text appended to a log file target.
    pub fn render_for_file(&self, verbosity: Verbosity) -> String {
        match verbosity {
            Verbosity::Standard => match self.severity {
                Severity::Error => format!("Error: {}", self.message),
                Severity::Warning => format!("Warning: {}", self.message),
                Severity::Info | Severity::Debug => format!("## {}", self.message),
            },
            Verbosity::Debug => {
                let tag = match self.severity {
                    Severity::Error => "Error  message:",
                    Severity::Warning => "Warning  message:",
                    Severity::Info => "Info message:",
                    Severity::Debug => "Debug message:",
                };
                format!("{tag} {}{}", self.message, self.context())
            }
        }
    }

    fn context(&self) -> String {
        let mut out = String::new();
        if let Some(source) = self.source.as_deref().filter(|s| !s.is_empty()) {
            out.push_str(&format!(" [in {source}]"));
        }
        if let Some(code) = self.code.filter(|c| *c != 0) {
            out.push_str(&format!(" ({code})"));
        }
        out
    }
}
