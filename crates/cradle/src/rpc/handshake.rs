//! Connection handshake: `syn` probes, `syn-ack`, `ack`.

use std::sync::Arc;

use super::connection::Connection;
use super::message::Message;
use super::port::MessagePort;
use super::{ConnectOptions, MethodHandler, RpcError};

/// Open a connection as the initiating side.
///
/// Sends a `syn` probe, then waits with bounded backoff for the remote side
/// to answer, re-probing after each wait. Gives up with
/// [`RpcError::HandshakeTimeout`] after `max_attempts` unanswered probes.
pub async fn connect(
    port: MessagePort,
    handler: Arc<dyn MethodHandler>,
    options: ConnectOptions,
) -> Result<Connection, RpcError> {
    let (sender, mut incoming) = port.into_parts();
    let attempts = options.handshake.max_attempts.max(1);

    for attempt in 0..attempts {
        tracing::debug!(attempt, "sending connection probe");
        sender.post(Message::Syn)?;

        let wait = tokio::time::sleep(options.handshake.delay_for(attempt));
        tokio::pin!(wait);
        loop {
            let envelope = tokio::select! {
                _ = &mut wait => break,
                envelope = incoming.recv() => envelope.ok_or(RpcError::ConnectionClosed)?,
            };
            if !options.accepts(&envelope) {
                continue;
            }
            match envelope.message {
                Message::SynAck { methods } => {
                    sender.post(Message::Ack {
                        methods: handler.capabilities(),
                    })?;
                    tracing::debug!(
                        probes = attempt + 1,
                        remote_methods = methods.len(),
                        "handshake established"
                    );
                    return Ok(Connection::establish(
                        sender, incoming, handler, methods, options,
                    ));
                }
                Message::Destroy => return Err(RpcError::ConnectionClosed),
                other => tracing::debug!(?other, "ignoring message before handshake"),
            }
        }
    }

    tracing::debug!(attempts, "no answer to connection probes");
    Err(RpcError::HandshakeTimeout { attempts })
}

/// Open a connection as the responding side.
///
/// Answers every probe with this side's capabilities until the initiator
/// acknowledges. Waits as long as the port stays open.
pub async fn accept(
    port: MessagePort,
    handler: Arc<dyn MethodHandler>,
    options: ConnectOptions,
) -> Result<Connection, RpcError> {
    let (sender, mut incoming) = port.into_parts();
    let methods = handler.capabilities();

    loop {
        let envelope = incoming.recv().await.ok_or(RpcError::ConnectionClosed)?;
        if !options.accepts(&envelope) {
            continue;
        }
        match envelope.message {
            Message::Syn => sender.post(Message::SynAck {
                methods: methods.clone(),
            })?,
            Message::Ack { methods: remote } => {
                tracing::debug!(remote_methods = remote.len(), "handshake accepted");
                return Ok(Connection::establish(
                    sender, incoming, handler, remote, options,
                ));
            }
            Message::Destroy => return Err(RpcError::ConnectionClosed),
            other => tracing::debug!(?other, "ignoring message before handshake"),
        }
    }
}
