pub mod replication;
pub mod schema;
pub mod transport;
pub mod waitlist;

use crate::scene::{EntityType, FieldId};
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Identifies a remote participant on this participant's links.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

/// One changed field. The value stays self-describing JSON on the wire so a
/// receiver can skip field ids it does not know without failing the frame.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WireField {
    pub field: FieldId,
    pub value: serde_json::Value,
}

/// Per-entity delta: identity (type + name + authority) followed by the fields
/// that changed since the peer's last snapshot.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DeltaFrame {
    pub entity_name: String,
    pub entity_type: EntityType,
    pub host_created: bool,
    pub first_sync: bool,
    pub fields: Vec<WireField>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub enum ReplicaMessage {
    Delta(DeltaFrame),
    Destroy { entity_name: String },
}

impl ReplicaMessage {
    pub fn entity_name(&self) -> &str {
        match self {
            ReplicaMessage::Delta(frame) => &frame.entity_name,
            ReplicaMessage::Destroy { entity_name } => entity_name,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct ReplicaPacket {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub schema_hash: u64,
    pub messages: Vec<ReplicaMessage>,
}

/// Packet as read off the wire, with each message still undecoded so one bad
/// frame does not take the rest of the packet down with it.
#[derive(Debug, Deserialize)]
pub struct EncodedPacket {
    pub sequence: u64,
    pub timestamp_ms: u64,
    pub schema_hash: u64,
    pub messages: Vec<serde_json::Value>,
}

impl ReplicaPacket {
    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn encode(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn decode(bytes: &[u8]) -> Result<EncodedPacket, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}

impl EncodedPacket {
    pub fn into_messages(
        self,
    ) -> impl Iterator<Item = Result<ReplicaMessage, serde_json::Error>> {
        self.messages.into_iter().map(serde_json::from_value)
    }
}

/// Outgoing packet sequencing for one participant.
pub struct NetworkSession {
    sequence: u64,
    schema_hash: u64,
}

impl Default for NetworkSession {
    fn default() -> Self {
        Self::new()
    }
}

impl NetworkSession {
    pub fn new() -> Self {
        Self {
            sequence: 0,
            schema_hash: schema::schema_hash(),
        }
    }

    pub fn next_sequence(&mut self) -> u64 {
        self.sequence = self.sequence.wrapping_add(1);
        self.sequence
    }

    pub fn craft_packet(&mut self, messages: Vec<ReplicaMessage>) -> ReplicaPacket {
        ReplicaPacket {
            sequence: self.next_sequence(),
            timestamp_ms: current_time_millis(),
            schema_hash: self.schema_hash,
            messages,
        }
    }
}

pub(crate) fn current_time_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_sequences_increase() {
        let mut session = NetworkSession::new();
        let first = session.craft_packet(Vec::new());
        let second = session.craft_packet(Vec::new());
        assert_eq!(first.sequence + 1, second.sequence);
        assert_eq!(first.schema_hash, schema::schema_hash());
    }

    #[test]
    fn packet_serializes_with_header_fields() {
        let mut session = NetworkSession::new();
        let packet = session.craft_packet(vec![ReplicaMessage::Destroy {
            entity_name: "cyl1".into(),
        }]);

        let bytes = packet.encode().expect("serialization should succeed");
        let output = String::from_utf8(bytes.clone()).expect("utf8 json");
        assert!(output.contains("sequence"));
        assert!(output.contains("schema_hash"));

        let decoded = ReplicaPacket::decode(&bytes).expect("decode");
        let messages: Vec<_> = decoded.into_messages().collect();
        assert_eq!(messages.len(), 1);
        assert_eq!(
            messages[0].as_ref().expect("message").entity_name(),
            "cyl1"
        );
    }

    #[test]
    fn one_unreadable_message_does_not_spoil_the_packet() {
        let raw = br#"{"sequence":3,"timestamp_ms":0,"schema_hash":0,"messages":[
            {"Hologram":{"entity_name":"x"}},
            {"Destroy":{"entity_name":"y"}}
        ]}"#;
        let decoded = ReplicaPacket::decode(raw).expect("envelope decodes");
        let messages: Vec<_> = decoded.into_messages().collect();
        assert!(messages[0].is_err());
        assert_eq!(messages[1].as_ref().expect("destroy").entity_name(), "y");
    }
}
