//! An established RPC connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{Mutex, mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::message::{CapabilityDescriptor, Envelope, Message, Outcome, RemoteError};
use super::port::PortSender;
use super::{ConnectOptions, MethodHandler, RpcError};

type PendingCalls = HashMap<u64, oneshot::Sender<Outcome>>;

struct Shared {
    sender: PortSender,
    local: CapabilityDescriptor,
    remote: CapabilityDescriptor,
    /// Calls awaiting a reply, keyed by request id
    pending: Mutex<PendingCalls>,
    next_call_id: AtomicU64,
    closed: watch::Sender<bool>,
    dispatcher: std::sync::Mutex<Option<JoinHandle<()>>>,
}

impl Shared {
    async fn complete(&self, id: u64, outcome: Outcome) {
        let mut pending = self.pending.lock().await;
        match pending.remove(&id) {
            Some(tx) => {
                let _ = tx.send(outcome);
            }
            None => tracing::debug!(id, "reply for unknown call"),
        }
    }

    /// Mark the connection closed and fail every pending call.
    async fn shutdown(&self) {
        if self.closed.send_replace(true) {
            return;
        }
        let mut pending = self.pending.lock().await;
        let failed = pending.len();
        pending.clear();
        tracing::debug!(failed, "connection closed");
    }
}

/// An established connection. Clones share the same channel.
///
/// The connection stays open until either side calls [`destroy`] or the
/// underlying port goes away; dropping every clone does not close it, so a
/// responder keeps serving calls without holding a handle.
///
/// [`destroy`]: Connection::destroy
#[derive(Clone)]
pub struct Connection {
    shared: Arc<Shared>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("remote", &self.shared.remote)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Connection {
    pub(super) fn establish(
        sender: PortSender,
        incoming: mpsc::UnboundedReceiver<Envelope>,
        handler: Arc<dyn MethodHandler>,
        remote: CapabilityDescriptor,
        options: ConnectOptions,
    ) -> Self {
        let (closed, _) = watch::channel(false);
        let shared = Arc::new(Shared {
            sender,
            local: handler.capabilities(),
            remote,
            pending: Mutex::new(HashMap::new()),
            next_call_id: AtomicU64::new(1),
            closed,
            dispatcher: std::sync::Mutex::new(None),
        });

        let task = tokio::spawn(dispatch(Arc::clone(&shared), incoming, handler, options));
        *shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(task);

        Self { shared }
    }

    /// Methods the remote side exposes.
    pub fn remote_methods(&self) -> &CapabilityDescriptor {
        &self.shared.remote
    }

    /// Whether the connection has been torn down.
    pub fn is_closed(&self) -> bool {
        *self.shared.closed.borrow()
    }

    /// Wait until the connection is torn down by either side.
    pub async fn closed(&self) {
        let mut rx = self.shared.closed.subscribe();
        let _ = rx.wait_for(|closed| *closed).await;
    }

    /// Call a remote method.
    ///
    /// A method the remote did not advertise fails locally with
    /// [`RpcError::Remote`] without touching the channel.
    pub async fn call(&self, method: &str, args: Value) -> Result<Value, RpcError> {
        if !self.shared.remote.contains(method) {
            return Err(RpcError::Remote(RemoteError::new(format!(
                "unknown method: {method}"
            ))));
        }

        let id = self.shared.next_call_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        {
            let mut pending = self.shared.pending.lock().await;
            if self.is_closed() {
                return Err(RpcError::ConnectionClosed);
            }
            pending.insert(id, tx);
        }

        tracing::debug!(id, method, "calling remote method");
        let posted = self.shared.sender.post(Message::Call {
            id,
            method: method.to_string(),
            args,
        });
        if let Err(err) = posted {
            self.shared.pending.lock().await.remove(&id);
            return Err(err);
        }

        match rx.await {
            Ok(Outcome::Ok(value)) => Ok(value),
            Ok(Outcome::Err(err)) => Err(RpcError::Remote(err)),
            Err(_) => Err(RpcError::ConnectionClosed),
        }
    }

    /// Call a remote method with typed arguments and return value.
    pub async fn invoke<A, R>(&self, method: &str, args: &A) -> Result<R, RpcError>
    where
        A: Serialize + ?Sized,
        R: DeserializeOwned,
    {
        let args = serde_json::to_value(args)?;
        let value = self.call(method, args).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Tear the connection down and tell the remote side.
    ///
    /// Pending calls on this side fail with [`RpcError::ConnectionClosed`].
    pub async fn destroy(&self) {
        let _ = self.shared.sender.post(Message::Destroy);
        let task = self
            .shared
            .dispatcher
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.abort();
        }
        self.shared.shutdown().await;
    }
}

async fn dispatch(
    shared: Arc<Shared>,
    mut incoming: mpsc::UnboundedReceiver<Envelope>,
    handler: Arc<dyn MethodHandler>,
    options: ConnectOptions,
) {
    while let Some(envelope) = incoming.recv().await {
        if !options.accepts(&envelope) {
            continue;
        }
        match envelope.message {
            Message::Call { id, method, args } => {
                let shared = Arc::clone(&shared);
                let handler = Arc::clone(&handler);
                tokio::spawn(async move {
                    let result = if shared.local.contains(&method) {
                        handler.call(&method, args).await
                    } else {
                        tracing::warn!(%method, "call to unknown method");
                        Err(RemoteError::new(format!("unknown method: {method}")))
                    };
                    let _ = shared.sender.post(Message::Reply {
                        id,
                        outcome: result.into(),
                    });
                });
            }
            Message::Reply { id, outcome } => shared.complete(id, outcome).await,
            Message::Destroy => {
                tracing::debug!("remote side destroyed the connection");
                break;
            }
            // Late probes and acks from the handshake.
            Message::Syn | Message::SynAck { .. } | Message::Ack { .. } => {}
        }
    }
    shared.shutdown().await;
}
