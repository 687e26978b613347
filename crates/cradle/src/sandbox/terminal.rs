//! Interactive terminal attached to at most one run at a time.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::Stream;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;

use super::SandboxError;
use crate::bridge::{CancelHandle, OutputEvent};
use crate::result::Transcript;
use crate::stdin::{StdinError, StdinWriter};

const OUTPUT_BUFFER: usize = 1024;

struct ActiveRun {
    stdin: StdinWriter,
    cancel: CancelHandle,
    transcript: Transcript,
}

struct Inner {
    output: broadcast::Sender<OutputEvent>,
    busy: AtomicBool,
    active: Mutex<Option<ActiveRun>>,
}

/// The terminal interactive runs stream to and read from.
///
/// Input typed while a run is active goes to that run's stdin and is echoed
/// into its transcript. Output is fanned out to every subscriber.
#[derive(Clone)]
pub struct Terminal {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for Terminal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Terminal")
            .field("busy", &self.is_busy())
            .finish_non_exhaustive()
    }
}

impl Default for Terminal {
    fn default() -> Self {
        Self::new()
    }
}

impl Terminal {
    /// Create an idle terminal.
    pub fn new() -> Self {
        let (output, _) = broadcast::channel(OUTPUT_BUFFER);
        Self {
            inner: Arc::new(Inner {
                output,
                busy: AtomicBool::new(false),
                active: Mutex::new(None),
            }),
        }
    }

    /// Receive output of interactive runs as it is produced.
    pub fn subscribe(&self) -> broadcast::Receiver<OutputEvent> {
        self.inner.output.subscribe()
    }

    /// Output of interactive runs as a stream. Events missed by a slow
    /// consumer are skipped.
    pub fn output(&self) -> impl Stream<Item = OutputEvent> + Send + 'static {
        futures::stream::unfold(self.subscribe(), |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(event) => return Some((event, rx)),
                    Err(RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "terminal subscriber lagged");
                    }
                    Err(RecvError::Closed) => return None,
                }
            }
        })
    }

    /// Whether an interactive run is attached.
    pub fn is_busy(&self) -> bool {
        self.inner.busy.load(Ordering::Acquire)
    }

    /// Type `text` into the active run.
    pub fn input(&self, text: &str) -> Result<(), SandboxError> {
        let mut active = self.active();
        let run = active.as_mut().ok_or(StdinError::Closed)?;
        run.stdin.write(text)?;
        run.transcript.push(text);
        Ok(())
    }

    /// Signal end of input to the active run.
    pub fn end_input(&self) {
        if let Some(run) = self.active().as_mut() {
            run.stdin.close();
        }
    }

    /// Cancel the active run.
    pub fn interrupt(&self) {
        if let Some(run) = self.active().as_ref() {
            tracing::debug!("interrupting interactive run");
            run.cancel.cancel();
        }
    }

    pub(crate) fn sender(&self) -> broadcast::Sender<OutputEvent> {
        self.inner.output.clone()
    }

    /// Claim the terminal for a new run.
    pub(crate) fn reserve(&self) -> Result<TerminalSession, SandboxError> {
        self.inner
            .busy
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .map_err(|_| SandboxError::Busy)?;
        Ok(TerminalSession {
            terminal: self.clone(),
        })
    }

    fn active(&self) -> MutexGuard<'_, Option<ActiveRun>> {
        self.inner
            .active
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }
}

/// Exclusive claim on the terminal. Dropping it detaches the run.
pub(crate) struct TerminalSession {
    terminal: Terminal,
}

impl TerminalSession {
    pub(crate) fn attach(&self, stdin: StdinWriter, cancel: CancelHandle, transcript: Transcript) {
        *self.terminal.active() = Some(ActiveRun {
            stdin,
            cancel,
            transcript,
        });
    }
}

impl Drop for TerminalSession {
    fn drop(&mut self) {
        self.terminal.active().take();
        self.terminal.inner.busy.store(false, Ordering::Release);
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::stdin::{StdinRead, stdin_channel};

    #[test]
    fn test_second_reservation_is_busy() {
        let terminal = Terminal::new();
        let session = terminal.reserve().unwrap();
        assert!(terminal.is_busy());
        assert!(matches!(terminal.reserve(), Err(SandboxError::Busy)));

        drop(session);
        assert!(!terminal.is_busy());
        assert!(terminal.reserve().is_ok());
    }

    #[test]
    fn test_input_reaches_stdin_and_transcript() {
        let terminal = Terminal::new();
        let session = terminal.reserve().unwrap();
        let (writer, mut reader) = stdin_channel(64);
        let transcript = Transcript::new();
        let (cancel, _) = CancelHandle::new();
        session.attach(writer, cancel, transcript.clone());

        terminal.input("42\n").unwrap();
        terminal.end_input();

        assert_eq!(reader.read(16), StdinRead::Data(b"42\n".to_vec()));
        assert_eq!(reader.read(16), StdinRead::EndOfStream);
        assert_eq!(transcript.snapshot(), "42\n");
    }

    #[test]
    fn test_input_without_run_is_rejected() {
        let terminal = Terminal::new();
        assert!(matches!(
            terminal.input("x"),
            Err(SandboxError::Stdin(StdinError::Closed))
        ));
    }

    #[test]
    fn test_interrupt_cancels_active_run() {
        let terminal = Terminal::new();
        let session = terminal.reserve().unwrap();
        let (writer, _reader) = stdin_channel(8);
        let (cancel, _) = CancelHandle::new();
        session.attach(writer, cancel.clone(), Transcript::new());

        terminal.interrupt();
        assert!(cancel.is_cancelled());
    }
}
