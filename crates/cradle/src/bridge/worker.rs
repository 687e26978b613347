//! Worker thread that hosts one engine run.
//!
//! The bridge and the worker only talk through messages: one `Start` command
//! in, a stream of [`WorkerEvent`]s out. The worker never sees the bridge's
//! accumulators and the bridge never touches the engine.

use std::any::Any;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::sync::mpsc as std_mpsc;
use std::thread::{self, JoinHandle};

use tokio::sync::mpsc;

use super::BridgeError;
use super::engine::{Engine, EngineOutput, Invocation};
use crate::fs::FileSystemMap;
use crate::stdin::StdinReader;

/// Message sent to a worker to begin a run. Exactly one per worker.
#[derive(Debug)]
pub struct StartCommand {
    /// Module reference passed to the engine.
    pub module: String,
    /// Program arguments.
    pub args: Vec<String>,
    /// Environment variables.
    pub env: BTreeMap<String, String>,
    /// Seeded filesystem.
    pub fs: FileSystemMap,
    /// Consumer half of the run's stdin channel.
    pub stdin: StdinReader,
}

impl StartCommand {
    /// Start `module` with no arguments, environment or files.
    pub fn new(module: impl Into<String>, stdin: StdinReader) -> Self {
        Self {
            module: module.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            fs: FileSystemMap::new(),
            stdin,
        }
    }

    /// Append arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Set an environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Seed the filesystem.
    pub fn fs(mut self, fs: FileSystemMap) -> Self {
        self.fs = fs;
        self
    }

    fn into_invocation(self) -> Invocation {
        Invocation {
            module: self.module,
            args: self.args,
            env: self.env,
            fs: self.fs,
            stdin: self.stdin,
        }
    }
}

/// Messages a worker posts back to its bridge.
#[derive(Debug)]
pub(crate) enum WorkerEvent {
    Stdout(String),
    Stderr(String),
    Result { exit_code: i32, fs: FileSystemMap },
    Fault(String),
}

#[derive(Debug)]
enum WorkerCommand {
    Start(StartCommand),
}

/// Threads let go by [`Worker::terminate`] before they exited.
#[derive(Debug, Clone, Default)]
pub(crate) struct Detached {
    threads: Arc<Mutex<Vec<JoinHandle<()>>>>,
}

impl Detached {
    fn push(&self, thread: JoinHandle<()>) {
        if thread.is_finished() {
            return;
        }
        self.threads
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(thread);
    }

    /// Forget threads that have exited and count the rest.
    pub(crate) fn running(&self) -> usize {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        threads.retain(|thread| !thread.is_finished());
        threads.len()
    }
}

/// Exclusive handle to one worker thread.
#[derive(Debug)]
pub(crate) struct Worker {
    commands: Option<std_mpsc::Sender<WorkerCommand>>,
    events: mpsc::UnboundedReceiver<WorkerEvent>,
    thread: Option<JoinHandle<()>>,
    terminated: Arc<AtomicBool>,
    started: bool,
    detached: Detached,
}

impl Worker {
    /// Spawn an idle worker thread running `engine`.
    ///
    /// If the worker is terminated while its thread is still running, the
    /// thread is handed to `detached`.
    pub(crate) fn spawn(
        engine: Arc<dyn Engine>,
        name: String,
        detached: Detached,
    ) -> Result<Self, BridgeError> {
        let (command_tx, command_rx) = std_mpsc::channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let terminated = Arc::new(AtomicBool::new(false));

        let output = EngineOutput::new(event_tx.clone(), Arc::clone(&terminated));
        let thread = thread::Builder::new()
            .name(name)
            .spawn(move || worker_main(engine, command_rx, event_tx, output))?;

        Ok(Self {
            commands: Some(command_tx),
            events: event_rx,
            thread: Some(thread),
            terminated,
            started: false,
            detached,
        })
    }

    /// Send the start command. A second call is a caller error.
    pub(crate) fn start(&mut self, command: StartCommand) -> Result<(), BridgeError> {
        if self.started {
            return Err(BridgeError::AlreadyStarted);
        }
        self.started = true;

        let sent = self
            .commands
            .take()
            .map(|tx| tx.send(WorkerCommand::Start(command)).is_ok())
            .unwrap_or(false);
        if sent {
            Ok(())
        } else {
            Err(BridgeError::WorkerCrashed {
                reason: "worker exited before start".to_string(),
                partial: Default::default(),
            })
        }
    }

    /// Next event, or `None` once the worker has gone away.
    pub(crate) async fn recv(&mut self) -> Option<WorkerEvent> {
        self.events.recv().await
    }

    /// Why the worker thread stopped without a result.
    pub(crate) async fn exit_reason(&mut self) -> String {
        let Some(thread) = self.thread.take() else {
            return "worker exited without a result".to_string();
        };
        match tokio::task::spawn_blocking(move || thread.join()).await {
            Ok(Err(payload)) => format!("worker panicked: {}", panic_message(payload.as_ref())),
            _ => "worker exited without a result".to_string(),
        }
    }

    /// Detach the thread and stop delivering its events.
    ///
    /// A thread cannot be killed. It is flagged as terminated and its event
    /// channel is closed so further output is dropped. If it is still
    /// running it moves to the detached set until it returns.
    pub(crate) fn terminate(&mut self) {
        self.terminated.store(true, Ordering::Release);
        self.commands = None;
        self.events.close();
        if let Some(thread) = self.thread.take() {
            self.detached.push(thread);
        }
    }

    #[cfg(test)]
    pub(crate) fn from_channel(events: mpsc::UnboundedReceiver<WorkerEvent>) -> Self {
        Self {
            commands: None,
            events,
            thread: None,
            terminated: Arc::new(AtomicBool::new(false)),
            started: true,
            detached: Detached::default(),
        }
    }
}

fn worker_main(
    engine: Arc<dyn Engine>,
    commands: std_mpsc::Receiver<WorkerCommand>,
    events: mpsc::UnboundedSender<WorkerEvent>,
    mut output: EngineOutput,
) {
    let Ok(WorkerCommand::Start(command)) = commands.recv() else {
        return;
    };
    drop(commands);

    tracing::debug!(module = %command.module, args = ?command.args, "worker starting");
    let event = match engine.run(command.into_invocation(), &mut output) {
        Ok(exit) => WorkerEvent::Result {
            exit_code: exit.exit_code,
            fs: exit.fs,
        },
        Err(err) => {
            tracing::error!(error = %err, "engine fault");
            WorkerEvent::Fault(err.to_string())
        }
    };
    let _ = events.send(event);
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("unknown panic")
}
