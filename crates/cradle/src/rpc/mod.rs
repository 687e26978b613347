//! Capability RPC over an origin-scoped message channel.
//!
//! Two endpoints meet through a handshake: the initiator ([`connect`]) probes
//! with `syn` until the responder ([`accept`]) answers with its capability
//! descriptor, then acknowledges with its own. After that either side may
//! call the other's methods through a [`Connection`]. Calls are correlated by
//! request id, so any number may be outstanding and replies may arrive in any
//! order.

mod connection;
mod handshake;
mod message;
mod port;

use async_trait::async_trait;
use serde_json::Value;
use thiserror::Error;

use crate::config::{HandshakeConfig, SandboxConfig};

pub use connection::Connection;
pub use handshake::{accept, connect};
pub use message::{CapabilityDescriptor, Envelope, Message, Outcome, RemoteError};
pub use port::{MessagePort, port_pair};

/// Errors from the RPC layer.
#[derive(Debug, Error)]
pub enum RpcError {
    /// The channel was torn down before a reply arrived.
    #[error("connection closed")]
    ConnectionClosed,
    /// The remote side never answered the connection probe.
    #[error("handshake timed out after {attempts} probes")]
    HandshakeTimeout {
        /// Probes sent before giving up.
        attempts: u32,
    },
    /// The remote method failed. The message is the remote's, verbatim.
    #[error(transparent)]
    Remote(RemoteError),
    /// Arguments or a return value could not be converted.
    #[error("failed to encode message: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Methods one endpoint exposes to the other.
#[async_trait]
pub trait MethodHandler: Send + Sync + 'static {
    /// Names of the methods this handler answers.
    fn capabilities(&self) -> CapabilityDescriptor;

    /// Invoke `method`. The error is sent back to the caller as is.
    async fn call(&self, method: &str, args: Value) -> Result<Value, RemoteError>;
}

/// Handler for an endpoint that only makes calls.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoMethods;

#[async_trait]
impl MethodHandler for NoMethods {
    fn capabilities(&self) -> CapabilityDescriptor {
        CapabilityDescriptor::default()
    }

    async fn call(&self, method: &str, _args: Value) -> Result<Value, RemoteError> {
        Err(RemoteError::new(format!("unknown method: {method}")))
    }
}

/// Handshake and origin settings for one endpoint.
#[derive(Debug, Clone, Default)]
pub struct ConnectOptions {
    /// Probe backoff used by [`connect`].
    pub handshake: HandshakeConfig,
    /// Origin incoming messages must carry. `None` accepts any origin.
    pub allowed_origin: Option<String>,
}

impl From<&SandboxConfig> for ConnectOptions {
    fn from(config: &SandboxConfig) -> Self {
        Self {
            handshake: config.handshake.clone(),
            allowed_origin: config.allowed_origin.clone(),
        }
    }
}

impl ConnectOptions {
    /// Only accept messages stamped with `origin`.
    pub fn allow_origin(mut self, origin: impl Into<String>) -> Self {
        self.allowed_origin = Some(origin.into());
        self
    }

    /// Use a different probe backoff.
    pub fn handshake(mut self, handshake: HandshakeConfig) -> Self {
        self.handshake = handshake;
        self
    }

    pub(crate) fn accepts(&self, envelope: &Envelope) -> bool {
        let allowed = self
            .allowed_origin
            .as_deref()
            .is_none_or(|origin| origin == "*" || origin == envelope.origin);
        if !allowed {
            tracing::warn!(origin = %envelope.origin, "dropping message from unexpected origin");
        }
        allowed
    }
}
