//! Discovery wire format.
//!
//! Every datagram is one compact JSON object. `kind` selects the variant,
//! `senderId` and `timestamp` are common to all of them:
//!
//! ```text
//! {"senderId":"a","timestamp":1700000000000,"kind":"announce","displayName":"Alice"}
//! {"senderId":"a","timestamp":1700000000000,"kind":"request","displayName":"Alice",
//!  "proposedCommAddress":"239.255.43.22","proposedCommPort":45455}
//! {"senderId":"a","timestamp":1700000000000,"kind":"offline","reason":"normal_shutdown"}
//! ```
//!
//! `decode` is fed straight from the network and must never panic.

use crate::error::CodecError;
use crate::peer::NodeIdentity;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};

const KINDS: [&str; 4] = ["announce", "request", "response", "offline"];

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct DiscoveryMessage {
    pub sender_id: String,
    /// Milliseconds since the Unix epoch on the sender's clock
    pub timestamp: u64,
    #[serde(flatten)]
    pub body: MessageBody,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(tag = "kind", rename_all = "camelCase")]
pub enum MessageBody {
    /// Periodic liveness heartbeat
    #[serde(rename_all = "camelCase")]
    Announce { display_name: String },
    // Multicast probe on the bootstrap group, answered with a unicast Response
    #[serde(rename_all = "camelCase")]
    Request {
        display_name: String,
        proposed_comm_address: Ipv4Addr,
        proposed_comm_port: u16,
    },
    #[serde(rename_all = "camelCase")]
    Response {
        display_name: String,
        proposed_comm_address: Ipv4Addr,
        proposed_comm_port: u16,
    },
    Offline {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        reason: Option<String>,
    },
}

impl MessageBody {
    pub fn kind(&self) -> &'static str {
        match self {
            MessageBody::Announce { .. } => "announce",
            MessageBody::Request { .. } => "request",
            MessageBody::Response { .. } => "response",
            MessageBody::Offline { .. } => "offline",
        }
    }

    pub fn display_name(&self) -> Option<&str> {
        match self {
            MessageBody::Announce { display_name }
            | MessageBody::Request { display_name, .. }
            | MessageBody::Response { display_name, .. } => Some(display_name),
            MessageBody::Offline { .. } => None,
        }
    }

    /// Communication group proposed by a Request or Response.
    pub fn proposal(&self) -> Option<SocketAddr> {
        match self {
            MessageBody::Request {
                proposed_comm_address,
                proposed_comm_port,
                ..
            }
            | MessageBody::Response {
                proposed_comm_address,
                proposed_comm_port,
                ..
            } => Some(SocketAddr::V4(SocketAddrV4::new(
                *proposed_comm_address,
                *proposed_comm_port,
            ))),
            _ => None,
        }
    }
}

impl DiscoveryMessage {
    fn new(sender: &NodeIdentity, body: MessageBody) -> Self {
        Self {
            sender_id: sender.id.clone(),
            timestamp: now_millis(),
            body,
        }
    }

    pub fn announce(sender: &NodeIdentity) -> Self {
        Self::new(
            sender,
            MessageBody::Announce {
                display_name: sender.display_name.clone(),
            },
        )
    }

    pub fn request(sender: &NodeIdentity, proposal: SocketAddrV4) -> Self {
        Self::new(
            sender,
            MessageBody::Request {
                display_name: sender.display_name.clone(),
                proposed_comm_address: *proposal.ip(),
                proposed_comm_port: proposal.port(),
            },
        )
    }

    pub fn response(sender: &NodeIdentity, proposal: SocketAddrV4) -> Self {
        Self::new(
            sender,
            MessageBody::Response {
                display_name: sender.display_name.clone(),
                proposed_comm_address: *proposal.ip(),
                proposed_comm_port: proposal.port(),
            },
        )
    }

    pub fn offline(sender: &NodeIdentity, reason: Option<&str>) -> Self {
        Self::new(
            sender,
            MessageBody::Offline {
                reason: reason.map(str::to_string),
            },
        )
    }
}

pub fn encode(message: &DiscoveryMessage) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(message).map_err(|e| CodecError::Encode(e.to_string()))
}

pub fn decode(bytes: &[u8]) -> Result<DiscoveryMessage, CodecError> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Err(CodecError::Empty);
    }

    let value: Value =
        serde_json::from_slice(bytes).map_err(|e| CodecError::Malformed(e.to_string()))?;
    let object = value
        .as_object()
        .ok_or_else(|| CodecError::Malformed("expected a JSON object".into()))?;

    let kind = object
        .get("kind")
        .ok_or(CodecError::MissingField("kind"))?
        .as_str()
        .ok_or_else(|| invalid("kind", "not a string"))?;
    if !KINDS.contains(&kind) {
        return Err(CodecError::UnknownKind(kind.to_string()));
    }

    match object.get("senderId").ok_or(CodecError::MissingField("senderId"))? {
        Value::String(id) if !id.is_empty() => {}
        Value::String(_) => return Err(invalid("senderId", "empty")),
        _ => return Err(invalid("senderId", "not a string")),
    }

    object
        .get("timestamp")
        .ok_or(CodecError::MissingField("timestamp"))?
        .as_u64()
        .ok_or_else(|| invalid("timestamp", "not a non-negative integer"))?;

    if kind == "request" || kind == "response" {
        let port = object
            .get("proposedCommPort")
            .ok_or(CodecError::MissingField("proposedCommPort"))?
            .as_u64()
            .ok_or_else(|| invalid("proposedCommPort", "not a number"))?;
        if port == 0 || port > u64::from(u16::MAX) {
            return Err(invalid("proposedCommPort", "out of range"));
        }
    }

    let message: DiscoveryMessage =
        serde_json::from_value(value).map_err(|e| CodecError::Malformed(e.to_string()))?;

    if let Some(proposal) = message.body.proposal() {
        if !proposal.ip().is_multicast() {
            return Err(invalid(
                "proposedCommAddress",
                &format!("{} is not a multicast address", proposal.ip()),
            ));
        }
    }

    Ok(message)
}

fn invalid(field: &'static str, reason: &str) -> CodecError {
    CodecError::InvalidField {
        field,
        reason: reason.to_string(),
    }
}

pub(crate) fn now_millis() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
