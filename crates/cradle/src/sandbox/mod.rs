//! The sandbox service: editor control and program runs behind RPC.
//!
//! [`SandboxContext`] does the work inside the sandbox. [`SandboxHandler`]
//! exposes it over a [`Connection`](crate::rpc::Connection), and
//! [`SandboxClient`] is the host-side view of the same methods. All three
//! agree on the method names in [`SandboxMethod`] and the argument types in
//! this module; both the context and the client implement [`Sandbox`].

mod client;
mod command;
mod context;
mod editor;
mod handler;
mod terminal;

use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::{BridgeError, PartialOutput};
use crate::fs::FileSystemMap;
use crate::result::CommandResult;
use crate::rpc::RpcError;
use crate::stdin::StdinError;

pub use client::SandboxClient;
pub use command::split_command;
pub use context::SandboxContext;
pub use editor::{EditorProgram, EditorState};
pub use handler::SandboxHandler;
pub use terminal::Terminal;

/// Errors from sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// No runtime is registered under this identifier.
    #[error("unknown runtime: {0}")]
    UnknownRuntime(String),
    /// The request cannot be turned into a program invocation.
    #[error("invalid command: {0}")]
    InvalidCommand(String),
    /// Another interactive run owns the terminal.
    #[error("an interactive run is already active")]
    Busy,
    /// The sandbox was shut down.
    #[error("sandbox is shut down")]
    Closed,
    /// Writing the program's stdin failed.
    #[error(transparent)]
    Stdin(#[from] StdinError),
    /// The run failed.
    #[error(transparent)]
    Bridge(#[from] BridgeError),
    /// A remote run failed after producing output.
    #[error("{message}")]
    RunFailed {
        /// The sandbox's description of the failure.
        message: String,
        /// Output received before the failure.
        partial: PartialOutput,
    },
    /// The call did not reach the sandbox, or the sandbox reported an error.
    #[error(transparent)]
    Rpc(#[from] RpcError),
}

impl SandboxError {
    /// Output a failed run produced before it stopped, if any.
    ///
    /// Available both for local runs and for runs reported over RPC.
    pub fn partial(&self) -> Option<&PartialOutput> {
        match self {
            SandboxError::Bridge(err) => err.partial(),
            SandboxError::RunFailed { partial, .. } => Some(partial),
            _ => None,
        }
    }
}

/// Methods the sandbox exposes, by wire name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxMethod {
    /// `showEditor()`
    ShowEditor,
    /// `hideEditor()`
    HideEditor,
    /// `setEditorProgram(syntax, runtime, code)`
    SetEditorProgram,
    /// `interactiveRunCode(runtime, code)`
    InteractiveRunCode,
    /// `interactiveRunFS(runtime, entryPath, fs)`
    InteractiveRunFs,
    /// `interactiveUnsafeCommand(command, fs)`
    InteractiveUnsafeCommand,
    /// `headlessRunCode(runtime, code, stdin?)`
    HeadlessRunCode,
    /// `headlessRunFS(runtime, entryPath, fs, stdin?)`
    HeadlessRunFs,
    /// `headlessUnsafeCommand(command, fs, stdin?)`
    HeadlessUnsafeCommand,
}

impl SandboxMethod {
    /// Every method, in declaration order.
    pub const ALL: [SandboxMethod; 9] = [
        SandboxMethod::ShowEditor,
        SandboxMethod::HideEditor,
        SandboxMethod::SetEditorProgram,
        SandboxMethod::InteractiveRunCode,
        SandboxMethod::InteractiveRunFs,
        SandboxMethod::InteractiveUnsafeCommand,
        SandboxMethod::HeadlessRunCode,
        SandboxMethod::HeadlessRunFs,
        SandboxMethod::HeadlessUnsafeCommand,
    ];

    /// Name used on the wire.
    pub fn as_str(self) -> &'static str {
        match self {
            SandboxMethod::ShowEditor => "showEditor",
            SandboxMethod::HideEditor => "hideEditor",
            SandboxMethod::SetEditorProgram => "setEditorProgram",
            SandboxMethod::InteractiveRunCode => "interactiveRunCode",
            SandboxMethod::InteractiveRunFs => "interactiveRunFS",
            SandboxMethod::InteractiveUnsafeCommand => "interactiveUnsafeCommand",
            SandboxMethod::HeadlessRunCode => "headlessRunCode",
            SandboxMethod::HeadlessRunFs => "headlessRunFS",
            SandboxMethod::HeadlessUnsafeCommand => "headlessUnsafeCommand",
        }
    }
}

impl fmt::Display for SandboxMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SandboxMethod {
    type Err = SandboxError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        SandboxMethod::ALL
            .into_iter()
            .find(|method| method.as_str() == s)
            .ok_or_else(|| SandboxError::InvalidCommand(format!("unknown method: {s}")))
    }
}

/// Arguments of `setEditorProgram`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetEditorProgramArgs {
    /// Syntax used for highlighting.
    pub syntax: String,
    /// Runtime the program is run with.
    pub runtime: String,
    /// Program text.
    pub code: String,
}

/// Arguments of `interactiveRunCode` and `headlessRunCode`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunCodeArgs {
    /// Runtime identifier.
    pub runtime: String,
    /// Program text.
    pub code: String,
    /// Stdin supplied up front (headless only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Arguments of `interactiveRunFS` and `headlessRunFS`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunFsArgs {
    /// Runtime identifier.
    pub runtime: String,
    /// File to execute.
    pub entry_path: String,
    /// Files to seed the run with.
    pub fs: FileSystemMap,
    /// Stdin supplied up front (headless only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// Arguments of `interactiveUnsafeCommand` and `headlessUnsafeCommand`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsafeCommandArgs {
    /// Command line; the first word names the module.
    pub command: String,
    /// Files to seed the run with.
    #[serde(default)]
    pub fs: FileSystemMap,
    /// Stdin supplied up front (headless only).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stdin: Option<String>,
}

/// The sandbox's method surface.
#[async_trait]
pub trait Sandbox: Send + Sync {
    /// Show the editing surface.
    async fn show_editor(&self) -> Result<(), SandboxError>;

    /// Hide the editing surface.
    async fn hide_editor(&self) -> Result<(), SandboxError>;

    /// Load a program into the editor.
    async fn set_editor_program(&self, args: SetEditorProgramArgs) -> Result<(), SandboxError>;

    /// Run source code on the terminal.
    async fn interactive_run_code(
        &self,
        runtime: &str,
        code: &str,
    ) -> Result<CommandResult, SandboxError>;

    /// Run a file from a seeded filesystem on the terminal.
    async fn interactive_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError>;

    /// Run a raw command line on the terminal.
    async fn interactive_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
    ) -> Result<CommandResult, SandboxError>;

    /// Run source code with no UI.
    async fn headless_run_code(
        &self,
        runtime: &str,
        code: &str,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError>;

    /// Run a file from a seeded filesystem with no UI.
    async fn headless_run_fs(
        &self,
        runtime: &str,
        entry_path: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError>;

    /// Run a raw command line with no UI.
    async fn headless_unsafe_command(
        &self,
        command: &str,
        fs: FileSystemMap,
        stdin: Option<&str>,
    ) -> Result<CommandResult, SandboxError>;
}
