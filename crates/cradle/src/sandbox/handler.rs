//! Exposes a [`SandboxContext`] as RPC methods.

use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use super::context::SandboxContext;
use super::{
    RunCodeArgs, RunFsArgs, Sandbox, SandboxError, SandboxMethod, SetEditorProgramArgs,
    UnsafeCommandArgs,
};
use crate::rpc::{
    CapabilityDescriptor, ConnectOptions, Connection, MessagePort, MethodHandler, RemoteError,
    RpcError, accept,
};

/// Answers sandbox method calls from the host.
#[derive(Debug, Clone)]
pub struct SandboxHandler {
    context: SandboxContext,
}

impl SandboxHandler {
    /// Serve `context` through this handler.
    pub fn new(context: SandboxContext) -> Self {
        Self { context }
    }

    /// The context calls are dispatched to.
    pub fn context(&self) -> &SandboxContext {
        &self.context
    }

    /// Wait for the host to connect on `port` and serve `context` to it.
    pub async fn serve(
        port: MessagePort,
        context: SandboxContext,
        options: ConnectOptions,
    ) -> Result<Connection, RpcError> {
        accept(port, Arc::new(Self::new(context)), options).await
    }

    async fn dispatch(&self, method: SandboxMethod, args: Value) -> Result<Value, SandboxError> {
        let context = &self.context;
        match method {
            SandboxMethod::ShowEditor => reply(context.show_editor().await?),
            SandboxMethod::HideEditor => reply(context.hide_editor().await?),
            SandboxMethod::SetEditorProgram => {
                let args: SetEditorProgramArgs = parse(args)?;
                reply(context.set_editor_program(args).await?)
            }
            SandboxMethod::InteractiveRunCode => {
                let args: RunCodeArgs = parse(args)?;
                reply(context.interactive_run_code(&args.runtime, &args.code).await?)
            }
            SandboxMethod::InteractiveRunFs => {
                let args: RunFsArgs = parse(args)?;
                reply(
                    context
                        .interactive_run_fs(&args.runtime, &args.entry_path, args.fs)
                        .await?,
                )
            }
            SandboxMethod::InteractiveUnsafeCommand => {
                let args: UnsafeCommandArgs = parse(args)?;
                reply(
                    context
                        .interactive_unsafe_command(&args.command, args.fs)
                        .await?,
                )
            }
            SandboxMethod::HeadlessRunCode => {
                let args: RunCodeArgs = parse(args)?;
                reply(
                    context
                        .headless_run_code(&args.runtime, &args.code, args.stdin.as_deref())
                        .await?,
                )
            }
            SandboxMethod::HeadlessRunFs => {
                let args: RunFsArgs = parse(args)?;
                reply(
                    context
                        .headless_run_fs(
                            &args.runtime,
                            &args.entry_path,
                            args.fs,
                            args.stdin.as_deref(),
                        )
                        .await?,
                )
            }
            SandboxMethod::HeadlessUnsafeCommand => {
                let args: UnsafeCommandArgs = parse(args)?;
                reply(
                    context
                        .headless_unsafe_command(&args.command, args.fs, args.stdin.as_deref())
                        .await?,
                )
            }
        }
    }
}

#[async_trait]
impl MethodHandler for SandboxHandler {
    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::new(SandboxMethod::ALL.map(SandboxMethod::as_str))
    }

    async fn call(&self, method: &str, args: Value) -> Result<Value, RemoteError> {
        let method: SandboxMethod = method
            .parse()
            .map_err(|err: SandboxError| RemoteError::new(err.to_string()))?;
        self.dispatch(method, args).await.map_err(|err| {
            tracing::debug!(%method, error = %err, "sandbox method failed");
            remote_error(&err)
        })
    }
}

/// Failed runs carry their partial output as the error's data.
fn remote_error(err: &SandboxError) -> RemoteError {
    let remote = RemoteError::new(err.to_string());
    match err.partial().map(serde_json::to_value) {
        Some(Ok(partial)) => remote.with_data(partial),
        Some(Err(encode)) => {
            tracing::warn!(error = %encode, "failed to encode partial output");
            remote
        }
        None => remote,
    }
}

fn parse<T: DeserializeOwned>(args: Value) -> Result<T, SandboxError> {
    serde_json::from_value(args).map_err(|err| SandboxError::Rpc(RpcError::Encode(err)))
}

fn reply<T: Serialize>(value: T) -> Result<Value, SandboxError> {
    serde_json::to_value(value).map_err(|err| SandboxError::Rpc(RpcError::Encode(err)))
}
