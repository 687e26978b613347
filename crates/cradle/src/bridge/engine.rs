//! The seam to the bytecode engine that actually executes a module.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use thiserror::Error;
use tokio::sync::mpsc;

use super::worker::WorkerEvent;
use crate::fs::FileSystemMap;
use crate::stdin::StdinReader;

/// Errors an engine reports instead of a normal exit.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The module reference did not resolve to a loadable module.
    #[error("module not found: {0}")]
    ModuleNotFound(String),
    /// The program faulted (trap, invalid instruction, engine bug).
    #[error("trap: {0}")]
    Trap(String),
}

/// Everything the engine needs to run one module.
#[derive(Debug)]
pub struct Invocation {
    /// Module reference, resolved by the engine.
    pub module: String,
    /// Program arguments, not including the module itself.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Filesystem the program starts with.
    pub fs: FileSystemMap,
    /// Blocking stdin.
    pub stdin: StdinReader,
}

/// Final state reported by the engine when the program exits.
#[derive(Debug, Clone, Default)]
pub struct EngineExit {
    /// Process exit status.
    pub exit_code: i32,
    /// Filesystem after the run.
    pub fs: FileSystemMap,
}

/// Output sink handed to the engine for the duration of a run.
#[derive(Debug)]
pub struct EngineOutput {
    events: mpsc::UnboundedSender<WorkerEvent>,
    terminated: Arc<AtomicBool>,
}

impl EngineOutput {
    pub(super) fn new(
        events: mpsc::UnboundedSender<WorkerEvent>,
        terminated: Arc<AtomicBool>,
    ) -> Self {
        Self { events, terminated }
    }

    /// Emit stdout text.
    pub fn stdout(&mut self, text: &str) {
        self.emit(WorkerEvent::Stdout(text.to_string()));
    }

    /// Emit stderr text.
    pub fn stderr(&mut self, text: &str) {
        self.emit(WorkerEvent::Stderr(text.to_string()));
    }

    /// Whether the owning bridge has torn the worker down.
    ///
    /// Engines that execute in slices should poll this and stop early; output
    /// emitted after termination is discarded.
    pub fn is_terminated(&self) -> bool {
        self.terminated.load(Ordering::Acquire)
    }

    fn emit(&self, event: WorkerEvent) {
        if !text_is_empty(&event) {
            let _ = self.events.send(event);
        }
    }
}

fn text_is_empty(event: &WorkerEvent) -> bool {
    matches!(event, WorkerEvent::Stdout(t) | WorkerEvent::Stderr(t) if t.is_empty())
}

/// A bytecode engine.
///
/// `run` is called on a dedicated worker thread and may block, including on
/// [`StdinReader::read`]. It emits output through `output` as it goes and
/// returns the exit status and final filesystem.
///
/// Closures with the same signature implement this trait:
///
/// ```rust,ignore
/// let engine = |inv: Invocation, out: &mut EngineOutput| {
///     out.stdout("Hello, World!");
///     Ok(EngineExit { exit_code: 0, fs: inv.fs })
/// };
/// ```
pub trait Engine: Send + Sync + 'static {
    /// Run `invocation` to completion.
    fn run(
        &self,
        invocation: Invocation,
        output: &mut EngineOutput,
    ) -> Result<EngineExit, EngineError>;
}

impl<F> Engine for F
where
    F: Fn(Invocation, &mut EngineOutput) -> Result<EngineExit, EngineError> + Send + Sync + 'static,
{
    fn run(
        &self,
        invocation: Invocation,
        output: &mut EngineOutput,
    ) -> Result<EngineExit, EngineError> {
        self(invocation, output)
    }
}
