//! Execution bridge: run one program on a worker thread and collect its result.
//!
//! A [`RunningCommand`] owns its worker exclusively and moves through a
//! small state machine:
//!
//! ```text
//! Idle -> Starting -> Running -> Completed
//!             \           \
//!              +-----------+--> Failed (crash, fault, cancel)
//! ```
//!
//! Output events are appended to per-stream accumulators and forwarded to an
//! optional live subscriber. Ordering is preserved within each stream;
//! interleaving across stdout and stderr follows message arrival only.

mod engine;
mod worker;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};

pub use engine::{Engine, EngineError, EngineExit, EngineOutput, Invocation};
pub use worker::StartCommand;

use crate::result::{CommandResult, Transcript};
use crate::stdin::StdinControl;
use worker::{Detached, Worker, WorkerEvent};

/// Output accumulated before a run failed.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PartialOutput {
    /// Stdout text received so far.
    pub stdout: String,
    /// Stderr text received so far.
    pub stderr: String,
}

/// Errors from the execution bridge.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// The worker stopped without delivering a result.
    #[error("worker crashed: {reason}")]
    WorkerCrashed {
        /// Panic message or engine fault.
        reason: String,
        /// Output received before the crash.
        partial: PartialOutput,
    },
    /// The run was cancelled by its owner.
    #[error("run cancelled")]
    Cancelled {
        /// Output received before cancellation.
        partial: PartialOutput,
    },
    /// A second start command was sent to the same worker.
    #[error("worker already started")]
    AlreadyStarted,
    /// The worker thread could not be spawned.
    #[error("failed to spawn worker: {0}")]
    Spawn(#[from] std::io::Error),
}

impl BridgeError {
    /// Output accumulated before the failure, if any.
    pub fn partial(&self) -> Option<&PartialOutput> {
        match self {
            BridgeError::WorkerCrashed { partial, .. } | BridgeError::Cancelled { partial } => {
                Some(partial)
            }
            _ => None,
        }
    }
}

/// Lifecycle state of a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    /// Worker spawned, nothing sent yet.
    Idle,
    /// Start command sent, no output seen.
    Starting,
    /// At least one output event received.
    Running,
    /// Result received.
    Completed,
    /// Crashed, faulted or cancelled.
    Failed,
}

/// Which stream an output event belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OutputStream {
    /// Standard output.
    Stdout,
    /// Standard error.
    Stderr,
}

/// A chunk of program output, forwarded live to subscribers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OutputEvent {
    /// Source stream.
    pub stream: OutputStream,
    /// Text as emitted.
    pub text: String,
}

/// Cancels a run from any task or thread.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    tx: Arc<watch::Sender<bool>>,
}

impl CancelHandle {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Request cancellation. Idempotent.
    ///
    /// The run fails with [`BridgeError::Cancelled`] right away, but the
    /// worker thread only stops once the engine returns. Closing stdin
    /// releases an engine blocked on input; any other engine has to poll
    /// [`EngineOutput::is_terminated`]. Threads still running after their
    /// run ended are counted by [`ExecutionBridge::detached_workers`].
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Whether cancellation was requested.
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Wrap a closure as an [`Engine`].
pub fn from_fn<F>(f: F) -> Arc<dyn Engine>
where
    F: Fn(Invocation, &mut EngineOutput) -> Result<EngineExit, EngineError> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Starts runs on fresh workers.
#[derive(Clone)]
pub struct ExecutionBridge {
    engine: Arc<dyn Engine>,
    next_worker: Arc<AtomicU64>,
    detached: Detached,
}

impl std::fmt::Debug for ExecutionBridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionBridge")
            .field("detached_workers", &self.detached_workers())
            .finish_non_exhaustive()
    }
}

impl ExecutionBridge {
    /// Create a bridge that runs programs with `engine`.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self {
            engine,
            next_worker: Arc::new(AtomicU64::new(1)),
            detached: Detached::default(),
        }
    }

    /// Worker threads whose run has ended but which have not returned yet.
    pub fn detached_workers(&self) -> usize {
        self.detached.running()
    }

    /// Spawn a worker and send it `command`.
    ///
    /// `subscriber` receives every output event as it arrives; `transcript`
    /// collects output for the result's `tty` field.
    pub fn start(
        &self,
        command: StartCommand,
        subscriber: Option<broadcast::Sender<OutputEvent>>,
        transcript: Transcript,
    ) -> Result<RunningCommand, BridgeError> {
        let id = self.next_worker.fetch_add(1, Ordering::Relaxed);
        let worker = Worker::spawn(
            Arc::clone(&self.engine),
            format!("cradle-worker-{id}"),
            self.detached.clone(),
        )?;
        let stdin = command.stdin.control();

        let mut running = RunningCommand::new(worker, stdin, subscriber, transcript);
        running.worker.start(command)?;
        running.state = BridgeState::Starting;
        tracing::debug!(worker = id, "run started");
        Ok(running)
    }

    /// Run `command` to completion.
    pub async fn execute(&self, command: StartCommand) -> Result<CommandResult, BridgeError> {
        self.start(command, None, Transcript::new())?.wait().await
    }
}

/// A run in progress. Dropping it terminates the worker and closes stdin.
#[derive(Debug)]
pub struct RunningCommand {
    worker: Worker,
    state: BridgeState,
    stdout: String,
    stderr: String,
    stdin: StdinControl,
    transcript: Transcript,
    subscriber: Option<broadcast::Sender<OutputEvent>>,
    cancel: CancelHandle,
    cancelled: watch::Receiver<bool>,
}

enum Step {
    Cancelled,
    Event(Option<WorkerEvent>),
}

impl RunningCommand {
    fn new(
        worker: Worker,
        stdin: StdinControl,
        subscriber: Option<broadcast::Sender<OutputEvent>>,
        transcript: Transcript,
    ) -> Self {
        let (cancel, cancelled) = CancelHandle::new();
        Self {
            worker,
            state: BridgeState::Idle,
            stdout: String::new(),
            stderr: String::new(),
            stdin,
            transcript,
            subscriber,
            cancel,
            cancelled,
        }
    }

    /// Handle for cancelling this run.
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    /// Current lifecycle state.
    pub fn state(&self) -> BridgeState {
        self.state
    }

    /// Wait for the result.
    ///
    /// Resolves exactly once: with the result, or with a failure carrying
    /// whatever output had arrived.
    pub async fn wait(mut self) -> Result<CommandResult, BridgeError> {
        self.drive().await
    }

    async fn drive(&mut self) -> Result<CommandResult, BridgeError> {
        loop {
            let step = tokio::select! {
                biased;
                _ = self.cancelled.wait_for(|cancelled| *cancelled) => Step::Cancelled,
                event = self.worker.recv() => Step::Event(event),
            };

            match step {
                Step::Cancelled => {
                    tracing::debug!("run cancelled");
                    self.teardown(BridgeState::Failed);
                    return Err(BridgeError::Cancelled {
                        partial: self.partial(),
                    });
                }
                Step::Event(Some(WorkerEvent::Stdout(text))) => {
                    self.output(OutputStream::Stdout, text);
                }
                Step::Event(Some(WorkerEvent::Stderr(text))) => {
                    self.output(OutputStream::Stderr, text);
                }
                Step::Event(Some(WorkerEvent::Result { exit_code, fs })) => {
                    tracing::debug!(exit_code, "run completed");
                    self.teardown(BridgeState::Completed);
                    return Ok(CommandResult {
                        stdin: self.stdin.written_text(),
                        stdout: std::mem::take(&mut self.stdout),
                        stderr: std::mem::take(&mut self.stderr),
                        tty: self.transcript.snapshot(),
                        fs,
                        exit_code,
                    });
                }
                Step::Event(Some(WorkerEvent::Fault(reason))) => {
                    self.teardown(BridgeState::Failed);
                    return Err(self.crashed(reason));
                }
                Step::Event(None) => {
                    let reason = self.worker.exit_reason().await;
                    tracing::error!(%reason, "worker exited without a result");
                    self.teardown(BridgeState::Failed);
                    return Err(self.crashed(reason));
                }
            }
        }
    }

    fn output(&mut self, stream: OutputStream, text: String) {
        self.state = BridgeState::Running;
        match stream {
            OutputStream::Stdout => self.stdout.push_str(&text),
            OutputStream::Stderr => self.stderr.push_str(&text),
        }
        self.transcript.push(&text);
        if let Some(subscriber) = &self.subscriber {
            let _ = subscriber.send(OutputEvent { stream, text });
        }
    }

    fn partial(&self) -> PartialOutput {
        PartialOutput {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
        }
    }

    fn crashed(&self, reason: String) -> BridgeError {
        BridgeError::WorkerCrashed {
            reason,
            partial: self.partial(),
        }
    }

    /// Stop processing messages. Later events (a duplicate result included)
    /// are never read.
    fn teardown(&mut self, state: BridgeState) {
        self.state = state;
        self.worker.terminate();
        self.stdin.close();
    }
}

impl Drop for RunningCommand {
    fn drop(&mut self) {
        self.worker.terminate();
        self.stdin.close();
    }
}
