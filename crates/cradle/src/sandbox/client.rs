//! Host-side handle to a remote sandbox.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::json;

use super::{
    RunCodeArgs, RunFsArgs, Sandbox, SandboxError, SandboxMethod, SetEditorProgramArgs,
    UnsafeCommandArgs,
};
use crate::bridge::PartialOutput;
use crate::fs::FileSystemMap;
use crate::result::CommandResult;
use crate::rpc::{ConnectOptions, Connection, MessagePort, NoMethods, RpcError, connect};

/// Calls sandbox methods over an established connection.
#[derive(Debug, Clone)]
pub struct SandboxClient {
    connection: Connection,
}

impl SandboxClient {
    /// Wrap an established connection.
    pub fn new(connection: Connection) -> Self {
        Self { connection }
    }

    /// Connect to the sandbox listening on the other end of `port`.
    pub async fn connect(port: MessagePort, options: ConnectOptions) -> Result<Self, SandboxError> {
        let connection = connect(port, Arc::new(NoMethods), options).await?;
        Ok(Self::new(connection))
    }

    /// The underlying connection.
    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    /// Tear down the connection.
    pub async fn close(&self) {
        self.connection.destroy().await;
    }

    async fn call<A, R>(&self, method: SandboxMethod, args: &A) -> Result<R, SandboxError>
    where
        A: Serialize + Sync + ?Sized,
        R: DeserializeOwned,
    {
        self.connection
            .invoke(method.as_str(), args)
            .await
            .map_err(run_error)
    }
}

/// Recover the partial output a failed run sent along with its error.
fn run_error(err: RpcError) -> SandboxError {
    let RpcError::Remote(remote) = err else {
        return err.into();
    };
    let partial = remote
        .data
        .clone()
        .and_then(|data| serde_json::from_value::<PartialOutput>(data).ok());
    match partial {
        Some(partial) => SandboxError::RunFailed {
            message: remote.message,
            partial,
        },
        None => RpcError::Remote(remote).into(),
    }
}

#[async_trait]
impl Sandbox for SandboxClient {
    async fn show_editor(&self) -> Result<(), SandboxError> {
        self.call(SandboxMethod::ShowEditor, &json!({})).await
    }

    async fn hide_editor(&self) -> Result<(), SandboxError> {
        self.call(SandboxMethod::HideEditor, &json!({})).await
    }

    async fn set_editor_program(&self, args: SetEditorProgramArgs) -> Result<(), SandboxError> {
        self.call(SandboxMethod::SetEditorProgram, &args).await
    }

    async fn interactive_run_code(
        &self,
        runtime: &str,
        code: &str,
    ) -> Result<CommandResult, SandboxError> {
        let args = RunCodeArgs {
            runtime: runtime.to_string(),
            code: code.to_string(),
            stdin: None,
        };
        self.call(SandboxMethod::InteractiveRunCode, &args).await
    }

    async fn interactive_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError> {
        let args = RunFsArgs {
            runtime: runtime.to_string(),
            entry_path: entry_path.to_string(),
            fs,
            stdin: None,
        };
        self.call(SandboxMethod::InteractiveRunFs, &args).await
    }

    async fn interactive_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError> {
        let args = UnsafeCommandArgs {
            command: command.to_string(),
            fs,
            stdin: None,
        };
        self.call(SandboxMethod::InteractiveUnsafeCommand, &args)
            .await
    }

    async fn headless_run_code(
        &self,
        runtime: &str,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let args = RunCodeArgs {
            runtime: runtime.to_string(),
            code: code.to_string(),
            stdin: stdin.map(str::to_string),
        };
        self.call(SandboxMethod::HeadlessRunCode, &args).await
    }

    async fn headless_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let args = RunFsArgs {
            runtime: runtime.to_string(),
            entry_path: entry_path.to_string(),
            fs,
            stdin: stdin.map(str::to_string),
        };
        self.call(SandboxMethod::HeadlessRunFs, &args).await
    }

    async fn headless_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError> {
        let args = UnsafeCommandArgs {
            command: command.to_string(),
            fs,
            stdin: stdin.map(str::to_string),
        };
        self.call(SandboxMethod::HeadlessUnsafeCommand, &args)
            .await
    }
}
