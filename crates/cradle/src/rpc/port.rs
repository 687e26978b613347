//! In-process message channel between two contexts.

use tokio::sync::mpsc;

use super::RpcError;
use super::message::{Envelope, Message};

/// One end of an ordered, reliable message channel.
///
/// Every message posted through a port is stamped with the port's origin so
/// the receiving side can check who sent it.
#[derive(Debug)]
pub struct MessagePort {
    origin: String,
    tx: mpsc::UnboundedSender<Envelope>,
    rx: mpsc::UnboundedReceiver<Envelope>,
}

/// Create two connected ports. Messages posted on one arrive at the other.
pub fn port_pair(origin_a: &str, origin_b: &str) -> (MessagePort, MessagePort) {
    let (a_tx, b_rx) = mpsc::unbounded_channel();
    let (b_tx, a_rx) = mpsc::unbounded_channel();
    (
        MessagePort {
            origin: origin_a.to_string(),
            tx: a_tx,
            rx: a_rx,
        },
        MessagePort {
            origin: origin_b.to_string(),
            tx: b_tx,
            rx: b_rx,
        },
    )
}

impl MessagePort {
    /// Origin stamped on outgoing messages.
    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Post a message to the other end.
    pub fn post(&self, message: Message) -> Result<(), RpcError> {
        post(&self.tx, &self.origin, message)
    }

    /// Receive the next message, or `None` once the other end is gone.
    pub async fn recv(&mut self) -> Option<Envelope> {
        self.rx.recv().await
    }

    /// Receive a message that has already arrived, without waiting.
    pub fn try_recv(&mut self) -> Option<Envelope> {
        self.rx.try_recv().ok()
    }

    pub(super) fn into_parts(self) -> (PortSender, mpsc::UnboundedReceiver<Envelope>) {
        (
            PortSender {
                origin: self.origin,
                tx: self.tx,
            },
            self.rx,
        )
    }
}

/// Sending half of a port, shared by a connection's tasks.
#[derive(Debug, Clone)]
pub(super) struct PortSender {
    origin: String,
    tx: mpsc::UnboundedSender<Envelope>,
}

impl PortSender {
    pub(super) fn post(&self, message: Message) -> Result<(), RpcError> {
        post(&self.tx, &self.origin, message)
    }
}

fn post(
    tx: &mpsc::UnboundedSender<Envelope>,
    origin: &str,
    message: Message,
) -> Result<(), RpcError> {
    tx.send(Envelope {
        origin: origin.to_string(),
        message,
    })
    .map_err(|_| RpcError::ConnectionClosed)
}
