//! Wire messages exchanged between two RPC endpoints.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Named methods one side exposes, fixed at handshake time.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CapabilityDescriptor {
    methods: BTreeSet<String>,
}

impl CapabilityDescriptor {
    /// Build a descriptor from method names.
    pub fn new<I, S>(methods: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            methods: methods.into_iter().map(Into::into).collect(),
        }
    }

    /// Whether `method` is exposed.
    pub fn contains(&self, method: &str) -> bool {
        self.methods.contains(method)
    }

    /// Exposed method names in lexical order.
    pub fn methods(&self) -> impl Iterator<Item = &str> {
        self.methods.iter().map(String::as_str)
    }

    /// Number of exposed methods.
    pub fn len(&self) -> usize {
        self.methods.len()
    }

    /// Whether nothing is exposed.
    pub fn is_empty(&self) -> bool {
        self.methods.is_empty()
    }
}

/// Error returned by a remote method.
///
/// The message is surfaced verbatim to the caller. `data` carries whatever
/// structured detail the method attached to the failure.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message}")]
pub struct RemoteError {
    /// Human-readable failure.
    pub message: String,
    /// Method-specific detail.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    /// An error with only a message.
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            data: None,
        }
    }

    /// Attach structured detail.
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }
}

impl From<String> for RemoteError {
    fn from(message: String) -> Self {
        Self::new(message)
    }
}

impl From<&str> for RemoteError {
    fn from(message: &str) -> Self {
        Self::new(message)
    }
}

/// Result carried by a reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Outcome {
    /// The method returned a value.
    Ok(Value),
    /// The method failed.
    Err(RemoteError),
}

impl From<Result<Value, RemoteError>> for Outcome {
    fn from(result: Result<Value, RemoteError>) -> Self {
        match result {
            Ok(value) => Outcome::Ok(value),
            Err(err) => Outcome::Err(err),
        }
    }
}

/// A protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Message {
    /// Connection probe sent by the initiator until answered.
    Syn,
    /// Responder's answer to a probe, carrying its capabilities.
    SynAck {
        /// Methods the responder exposes.
        methods: CapabilityDescriptor,
    },
    /// Initiator's final handshake step, carrying its capabilities.
    Ack {
        /// Methods the initiator exposes.
        methods: CapabilityDescriptor,
    },
    /// Method invocation.
    Call {
        /// Correlation identifier, unique per caller.
        id: u64,
        /// Method name.
        method: String,
        /// Arguments object.
        args: Value,
    },
    /// Response to a call.
    Reply {
        /// Identifier of the call being answered.
        id: u64,
        /// Return value or error.
        outcome: Outcome,
    },
    /// The sender is tearing the connection down.
    Destroy,
}

/// A message stamped with the sender's origin.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Origin of the sending context.
    pub origin: String,
    /// Payload.
    pub message: Message,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn test_message_wire_format() {
        let call = Message::Call {
            id: 7,
            method: "headlessRunCode".into(),
            args: json!({"runtime": "python"}),
        };
        let value = serde_json::to_value(&call).unwrap();
        assert_eq!(value["type"], "call");
        assert_eq!(value["id"], 7);

        let reply = Message::Reply {
            id: 7,
            outcome: Outcome::Err("boom".into()),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(
            value,
            json!({"type": "reply", "id": 7, "outcome": {"err": {"message": "boom"}}})
        );

        let reply = Message::Reply {
            id: 8,
            outcome: Outcome::Err(RemoteError::new("crashed").with_data(json!({"stdout": "hi"}))),
        };
        let value = serde_json::to_value(&reply).unwrap();
        assert_eq!(value["outcome"]["err"]["data"]["stdout"], "hi");
        let back: Message = serde_json::from_value(value).unwrap();
        assert_eq!(back, reply);

        let ack = Message::SynAck {
            methods: CapabilityDescriptor::new(["b", "a"]),
        };
        let value = serde_json::to_value(&ack).unwrap();
        assert_eq!(value, json!({"type": "syn-ack", "methods": ["a", "b"]}));
    }

    #[test]
    fn test_descriptor_lookup() {
        let descriptor = CapabilityDescriptor::new(["showEditor", "hideEditor"]);
        assert!(descriptor.contains("showEditor"));
        assert!(!descriptor.contains("eval"));
        assert_eq!(descriptor.len(), 2);
    }
}
