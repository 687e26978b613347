//! Cradle: sandboxed program runner
//!
//! Cradle runs untrusted bytecode programs on isolated worker threads and
//! exposes them to a host through a capability RPC. A run is seeded with a
//! virtual filesystem (usually unpacked from a `.tar.gz` archive), reads its
//! stdin synchronously from a shared buffer the host fills while it runs, and
//! streams stdout and stderr back as it goes.

pub mod bridge;
pub mod config;
pub mod fs;
pub mod result;
pub mod rpc;
pub mod sandbox;
pub mod stdin;

pub use bridge::{
    BridgeError, BridgeState, CancelHandle, Engine, EngineError, EngineExit, EngineOutput,
    ExecutionBridge, Invocation, OutputEvent, OutputStream, PartialOutput, RunningCommand,
    StartCommand,
};
pub use config::{HandshakeConfig, RuntimeCommand, RuntimeRegistry, SandboxConfig};
pub use fs::{FileContent, FileEntry, FileSystemMap, LoaderError, extract_archive};
pub use result::{CommandResult, RunMode, RunRequest, RunSource, Safety, Transcript};
pub use rpc::{
    CapabilityDescriptor, ConnectOptions, Connection, MessagePort, MethodHandler, RemoteError,
    RpcError, port_pair,
};
pub use sandbox::{
    Sandbox, SandboxClient, SandboxContext, SandboxError, SandboxHandler, SandboxMethod, Terminal,
};
pub use stdin::{StdinControl, StdinError, StdinRead, StdinReader, StdinWriter, stdin_channel};
