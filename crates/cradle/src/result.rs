//! Run requests and results.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};

use crate::fs::FileSystemMap;

/// Complete observable outcome of one run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CommandResult {
    /// Everything written to the program's stdin.
    pub stdin: String,
    /// Everything the program wrote to stdout.
    pub stdout: String,
    /// Everything the program wrote to stderr.
    pub stderr: String,
    /// Terminal transcript: output and echoed input in arrival order.
    pub tty: String,
    /// Filesystem state when the program exited.
    pub fs: FileSystemMap,
    /// Exit status reported by the engine.
    pub exit_code: i32,
}

impl CommandResult {
    /// Whether the program exited with status 0.
    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

/// How a run is attached to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunMode {
    /// Output is streamed to the terminal and stdin is typed while running.
    Interactive,
    /// No UI; stdin is supplied up front.
    Headless,
}

/// Whether runtime mapping is applied to the request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Safety {
    /// The runtime identifier selects a known module and arguments.
    Sandboxed,
    /// The caller names the module and arguments directly.
    UnsafeCommand,
}

/// What to run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum RunSource {
    /// Source code, written to the runtime's entry path before the run.
    Code {
        /// Program text.
        code: String,
    },
    /// A prepared filesystem and the file to execute.
    Fs {
        /// Path of the entry file inside `fs`.
        entry_path: String,
        /// Files to seed the run with.
        fs: FileSystemMap,
    },
    /// A raw command line (only valid with [`Safety::UnsafeCommand`]).
    Command {
        /// Command line; the first word names the module.
        command: String,
        /// Files to seed the run with.
        fs: FileSystemMap,
    },
}

/// A request to run a program, built by a run-type RPC method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunRequest {
    /// Runtime identifier (ignored for unsafe commands).
    pub runtime: String,
    /// Syntax identifier for display, if any.
    pub syntax: Option<String>,
    /// Program to run.
    pub source: RunSource,
    /// Initial stdin text.
    pub stdin: Option<String>,
    /// UI attachment.
    pub mode: RunMode,
    /// Runtime mapping policy.
    pub safety: Safety,
}

/// Shared, append-only terminal transcript.
#[derive(Debug, Clone, Default)]
pub struct Transcript {
    text: Arc<Mutex<String>>,
}

impl Transcript {
    /// Create an empty transcript.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append text.
    pub fn push(&self, text: &str) {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_str(text);
    }

    /// Copy of the transcript so far.
    pub fn snapshot(&self) -> String {
        self.text
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }
}
