//! The sandbox side: turns run requests into worker runs.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{Semaphore, watch};

use super::command::split_command;
use super::editor::{EditorProgram, EditorState};
use super::terminal::Terminal;
use super::{Sandbox, SandboxError, SetEditorProgramArgs};
use crate::bridge::{Engine, ExecutionBridge, StartCommand};
use crate::config::{RuntimeCommand, SandboxConfig};
use crate::fs::{FileSystemMap, normalize_path};
use crate::result::{CommandResult, RunMode, RunRequest, RunSource, Safety, Transcript};
use crate::stdin::{StdinReader, StdinWriter, stdin_channel};

/// Executes programs for the sandbox and owns its UI state.
///
/// Headless runs execute concurrently up to `max_concurrent_runs`;
/// interactive runs are attached to the [`Terminal`] one at a time.
#[derive(Clone)]
pub struct SandboxContext {
    bridge: ExecutionBridge,
    config: Arc<SandboxConfig>,
    terminal: Terminal,
    editor: Arc<watch::Sender<EditorState>>,
    headless: Arc<Semaphore>,
}

impl std::fmt::Debug for SandboxContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxContext")
            .field("config", &self.config)
            .field("terminal", &self.terminal)
            .finish_non_exhaustive()
    }
}

impl SandboxContext {
    /// Create a context that runs programs with `engine`.
    pub fn new(engine: Arc<dyn Engine>, config: SandboxConfig) -> Self {
        let (editor, _) = watch::channel(EditorState::default());
        Self {
            bridge: ExecutionBridge::new(engine),
            headless: Arc::new(Semaphore::new(config.max_concurrent_runs.max(1))),
            config: Arc::new(config),
            terminal: Terminal::new(),
            editor: Arc::new(editor),
        }
    }

    /// Active configuration.
    pub fn config(&self) -> &SandboxConfig {
        &self.config
    }

    /// The terminal interactive runs use.
    pub fn terminal(&self) -> &Terminal {
        &self.terminal
    }

    /// Current editor state.
    pub fn editor(&self) -> EditorState {
        self.editor.borrow().clone()
    }

    /// Follow editor state changes.
    pub fn watch_editor(&self) -> watch::Receiver<EditorState> {
        self.editor.subscribe()
    }

    /// Refuse new headless runs and interrupt the interactive one.
    pub fn shutdown(&self) {
        self.headless.close();
        self.terminal.interrupt();
    }

    /// Run a program and wait for its result.
    pub async fn run(&self, mut request: RunRequest) -> Result<CommandResult, SandboxError> {
        tracing::debug!(
            runtime = %request.runtime,
            mode = ?request.mode,
            safety = ?request.safety,
            "run requested"
        );
        let stdin = request.stdin.take();
        match request.mode {
            RunMode::Headless => self.run_headless(request, stdin).await,
            RunMode::Interactive => self.run_interactive(request, stdin).await,
        }
    }

    async fn run_headless(
        &self,
        request: RunRequest,
        stdin: Option<String>,
    ) -> Result<CommandResult, SandboxError> {
        let _permit = self
            .headless
            .acquire()
            .await
            .map_err(|_| SandboxError::Closed)?;

        let transcript = Transcript::new();
        let (writer, reader) = self.stdin(stdin.as_deref(), &transcript)?;
        drop(writer);

        let command = self.prepare(request, reader)?;
        let result = self.bridge.start(command, None, transcript)?.wait().await?;
        Ok(result)
    }

    async fn run_interactive(
        &self,
        request: RunRequest,
        stdin: Option<String>,
    ) -> Result<CommandResult, SandboxError> {
        if self.headless.is_closed() {
            return Err(SandboxError::Closed);
        }
        let session = self.terminal.reserve()?;

        let transcript = Transcript::new();
        let (writer, reader) = self.stdin(stdin.as_deref(), &transcript)?;
        let command = self.prepare(request, reader)?;
        let running =
            self.bridge
                .start(command, Some(self.terminal.sender()), transcript.clone())?;
        session.attach(writer, running.cancel_handle(), transcript);

        let result = running.wait().await;
        drop(session);
        Ok(result?)
    }

    /// Open a stdin channel, preloaded with `initial` when given.
    fn stdin(
        &self,
        initial: Option<&str>,
        transcript: &Transcript,
    ) -> Result<(StdinWriter, StdinReader), SandboxError> {
        let (mut writer, reader) = stdin_channel(self.config.stdin_capacity);
        if let Some(text) = initial {
            writer.write(text)?;
            transcript.push(text);
        }
        Ok((writer, reader))
    }

    fn runtime(&self, name: &str) -> Result<&RuntimeCommand, SandboxError> {
        self.config
            .runtimes
            .get(name)
            .ok_or_else(|| SandboxError::UnknownRuntime(name.to_string()))
    }

    /// Map a request onto a module invocation.
    fn prepare(&self, request: RunRequest, stdin: StdinReader) -> Result<StartCommand, SandboxError> {
        let (module, args, fs) = match (request.safety, request.source) {
            (Safety::Sandboxed, RunSource::Code { code }) => {
                let runtime = self.runtime(&request.runtime)?;
                let mut fs = FileSystemMap::new();
                fs.write(&runtime.entry_path, code);
                let entry = normalize_path(&runtime.entry_path);
                (runtime.module.clone(), runtime_args(runtime, entry), fs)
            }
            (Safety::Sandboxed, RunSource::Fs { entry_path, fs }) => {
                let runtime = self.runtime(&request.runtime)?;
                let entry = normalize_path(&entry_path);
                if !fs.contains(&entry) {
                    return Err(SandboxError::InvalidCommand(format!(
                        "entry file not found: {entry}"
                    )));
                }
                (runtime.module.clone(), runtime_args(runtime, entry), fs)
            }
            (Safety::UnsafeCommand, RunSource::Command { command, fs }) => {
                let mut words = split_command(&command)?.into_iter();
                let module = words
                    .next()
                    .ok_or_else(|| SandboxError::InvalidCommand("empty command".to_string()))?;
                (module, words.collect(), fs)
            }
            (Safety::Sandboxed, RunSource::Command { .. }) => {
                return Err(SandboxError::InvalidCommand(
                    "raw commands require unsafe mode".to_string(),
                ));
            }
            (Safety::UnsafeCommand, _) => {
                return Err(SandboxError::InvalidCommand(
                    "unsafe mode only runs raw commands".to_string(),
                ));
            }
        };

        let mut command = StartCommand::new(module, stdin).args(args).fs(fs);
        for (key, value) in &self.config.env {
            command = command.env(key, value);
        }
        Ok(command)
    }
}

fn runtime_args(runtime: &RuntimeCommand, entry: String) -> Vec<String> {
    let mut args = runtime.args.clone();
    args.push(entry);
    args
}

fn run_request(mode: RunMode, runtime: &str, source: RunSource, stdin: Option<&str>) -> RunRequest {
    let safety = match source {
        RunSource::Command { .. } => Safety::UnsafeCommand,
        RunSource::Code { .. } | RunSource::Fs { .. } => Safety::Sandboxed,
    };
    RunRequest {
        runtime: runtime.to_string(),
        syntax: None,
        source,
        stdin: stdin.map(str::to_string),
        mode,
        safety,
    }
}

#[async_trait]
impl Sandbox for SandboxContext {
    async fn show_editor(&self) -> Result<(), SandboxError> {
        self.editor.send_modify(|state| state.visible = true);
        Ok(())
    }

    async fn hide_editor(&self) -> Result<(), SandboxError> {
        self.editor.send_modify(|state| state.visible = false);
        Ok(())
    }

    async fn set_editor_program(&self, args: SetEditorProgramArgs) -> Result<(), SandboxError> {
        self.editor.send_modify(|state| {
            state.program = Some(EditorProgram {
                syntax: args.syntax,
                runtime: args.runtime,
                code: args.code,
            });
        });
        Ok(())
    }

    async fn interactive_run_code(
        &self,
        runtime: &str,
        code: &str,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Code {
            code: code.to_string(),
        };
        self.run(run_request(RunMode::Interactive, runtime, source, None))
            .await
    }

    async fn interactive_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Fs {
            entry_path: entry_path.to_string(),
            fs,
        };
        self.run(run_request(RunMode::Interactive, runtime, source, None))
            .await
    }

    async fn interactive_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Command {
            command: command.to_string(),
            fs,
        };
        self.run(run_request(RunMode::Interactive, "", source, None))
            .await
    }

    async fn headless_run_code(
        &self,
        runtime: &str,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Code {
            code: code.to_string(),
        };
        self.run(run_request(RunMode::Headless, runtime, source, stdin))
            .await
    }

    async fn headless_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Fs {
            entry_path: entry_path.to_string(),
            fs,
        };
        self.run(run_request(RunMode::Headless, runtime, source, stdin))
            .await
    }

    async fn headless_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let source = RunSource::Command {
            command: command.to_string(),
            fs,
        };
        self.run(run_request(RunMode::Headless, "", source, stdin))
            .await
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::time::Duration;

    use tokio::time::timeout;

    use super::*;
    use crate::bridge::{BridgeError, EngineExit, EngineOutput, Invocation, from_fn};
    use crate::stdin::{StdinError, StdinRead};

    /// Prints its invocation, then the entry file, then stdin upper-cased.
    fn echo_engine() -> Arc<dyn Engine> {
        from_fn(|mut inv: Invocation, out: &mut EngineOutput| {
            out.stdout(&format!("{} {}\n", inv.module, inv.args.join(" ")));
            if let Some(entry) = inv.args.last().and_then(|path| inv.fs.get(path)) {
                out.stdout(&entry.content().to_text_lossy());
            }
            if let Some(greeting) = inv.env.get("GREETING") {
                out.stderr(greeting);
            }
            while let StdinRead::Data(bytes) = inv.stdin.read(1024) {
                out.stdout(&String::from_utf8_lossy(&bytes).to_uppercase());
            }
            Ok(EngineExit {
                exit_code: 0,
                fs: inv.fs,
            })
        })
    }

    fn context() -> SandboxContext {
        SandboxContext::new(echo_engine(), SandboxConfig::default())
    }

    #[tokio::test]
    async fn test_run_code_writes_entry_file() {
        let result = context()
            .headless_run_code("python", "print('hi')\n", None)
            .await
            .unwrap();

        assert_eq!(result.stdout, "python /program.py\nprint('hi')\n");
        assert!(result.fs.contains("/program.py"));
        assert_eq!(result.stdin, "");
    }

    #[tokio::test]
    async fn test_runtime_args_precede_entry() {
        let result = context()
            .headless_run_code("quickjs", "1", None)
            .await
            .unwrap();

        assert!(result.stdout.starts_with("quickjs --std /program.js\n"));
    }

    #[tokio::test]
    async fn test_headless_stdin_is_closed_and_echoed() {
        let result = context()
            .headless_run_code("ruby", "", Some("abc\n"))
            .await
            .unwrap();

        assert_eq!(result.stdin, "abc\n");
        assert!(result.stdout.ends_with("ABC\n"));
        assert!(result.tty.starts_with("abc\n"));
        assert!(result.tty.ends_with("ABC\n"));
    }

    #[tokio::test]
    async fn test_run_fs_uses_caller_entry() {
        let mut fs = FileSystemMap::new();
        fs.write("/app/main.py", "import os\n");

        let result = context()
            .headless_run_fs("python", "app/main.py", fs, None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "python /app/main.py\nimport os\n");
    }

    #[tokio::test]
    async fn test_run_fs_missing_entry() {
        let err = context()
            .headless_run_fs("python", "/nope.py", FileSystemMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidCommand(m) if m.contains("/nope.py")));
    }

    #[tokio::test]
    async fn test_unknown_runtime() {
        let err = context()
            .headless_run_code("cobol", "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::UnknownRuntime(name) if name == "cobol"));
    }

    #[tokio::test]
    async fn test_unsafe_command_bypasses_registry() {
        let mut config = SandboxConfig::default();
        config.env.insert("GREETING".into(), "hello".into());
        let context = SandboxContext::new(echo_engine(), config);

        let result = context
            .headless_unsafe_command("custom.wasm -x 'two words'", FileSystemMap::new(), None)
            .await
            .unwrap();
        assert_eq!(result.stdout, "custom.wasm -x two words\n");
        assert_eq!(result.stderr, "hello");

        let err = context
            .headless_unsafe_command("   ", FileSystemMap::new(), None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_mismatched_safety_is_rejected() {
        let request = RunRequest {
            runtime: "python".into(),
            syntax: None,
            source: RunSource::Command {
                command: "python".into(),
                fs: FileSystemMap::new(),
            },
            stdin: None,
            mode: RunMode::Headless,
            safety: Safety::Sandboxed,
        };
        let err = context().run(request).await.unwrap_err();
        assert!(matches!(err, SandboxError::InvalidCommand(_)));
    }

    #[tokio::test]
    async fn test_oversized_stdin_fails_the_run() {
        let config = SandboxConfig {
            stdin_capacity: 4,
            ..Default::default()
        };
        let context = SandboxContext::new(echo_engine(), config);

        let err = context
            .headless_run_code("python", "", Some("too long"))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            SandboxError::Stdin(StdinError::BufferFull { requested: 8, available: 4 })
        ));
    }

    #[tokio::test]
    async fn test_interactive_run_reads_terminal_input() {
        let context = context();
        let terminal = context.terminal().clone();
        let mut output = terminal.subscribe();

        let run = tokio::spawn({
            let context = context.clone();
            async move { context.interactive_run_code("python", "").await }
        });

        // The first event arrives only once the run is attached.
        let first = timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(first.text.starts_with("python /program.py"));
        assert!(terminal.is_busy());

        let err = context
            .interactive_run_code("python", "")
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Busy));

        terminal.input("yes\n").unwrap();
        terminal.end_input();
        let result = timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        assert_eq!(result.stdin, "yes\n");
        assert!(result.stdout.ends_with("YES\n"));
        assert!(result.tty.contains("yes\nYES\n"));
        assert!(!terminal.is_busy());
    }

    #[tokio::test]
    async fn test_interrupt_cancels_interactive_run() {
        let context = context();
        let terminal = context.terminal().clone();
        let mut output = terminal.subscribe();

        let run = tokio::spawn({
            let context = context.clone();
            async move { context.interactive_run_code("python", "").await }
        });
        timeout(Duration::from_secs(5), output.recv())
            .await
            .unwrap()
            .unwrap();

        terminal.interrupt();
        let err = timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SandboxError::Bridge(BridgeError::Cancelled { .. })));
        assert!(!terminal.is_busy());
    }

    #[tokio::test]
    async fn test_editor_state() {
        let context = context();
        let mut changes = context.watch_editor();

        context.show_editor().await.unwrap();
        context
            .set_editor_program(SetEditorProgramArgs {
                syntax: "python".into(),
                runtime: "python".into(),
                code: "print(1)".into(),
            })
            .await
            .unwrap();
        assert!(changes.has_changed().unwrap());

        let state = context.editor();
        assert!(state.visible);
        assert_eq!(state.program.unwrap().code, "print(1)");

        context.hide_editor().await.unwrap();
        assert!(!context.editor().visible);
    }

    #[tokio::test]
    async fn test_shutdown_refuses_new_runs() {
        let context = context();
        context.shutdown();

        let err = context
            .headless_run_code("python", "", None)
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Closed));
    }
}
