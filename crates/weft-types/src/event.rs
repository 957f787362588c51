//! Mesh state events and their wire representation.
//!
//! Event identity is the pair `(originator_node, sequence)`: the sequence is
//! a per-originator monotonic counter assigned at publish time, so the pair
//! is globally unique and makes redelivery detectable.

use std::collections::BTreeMap;

use base64::Engine;
use serde::{Deserialize, Serialize};

use crate::NodeId;

/// Closed set of mesh state event types.
///
/// The integer codes are part of the wire format and must not be reordered.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MeshEventType {
    NodeJoined,
    NodeLeft,
    NodeEvicted,
    SessionAdded,
    SessionRemoved,
    NodeShutdown,
    NodeStarted,
    SessionInterrupted,
    SessionRecovered,
    NodeOffline,
    NodeRecovered,
    SplitDetected,
    SplitResolved,
}

impl MeshEventType {
    /// Stable integer code used in the event-log wire record.
    pub fn code(&self) -> u32 {
        match self {
            MeshEventType::NodeJoined => 0,
            MeshEventType::NodeLeft => 1,
            MeshEventType::NodeEvicted => 2,
            MeshEventType::SessionAdded => 3,
            MeshEventType::SessionRemoved => 4,
            MeshEventType::NodeShutdown => 5,
            MeshEventType::NodeStarted => 6,
            MeshEventType::SessionInterrupted => 7,
            MeshEventType::SessionRecovered => 8,
            MeshEventType::NodeOffline => 9,
            MeshEventType::NodeRecovered => 10,
            MeshEventType::SplitDetected => 11,
            MeshEventType::SplitResolved => 12,
        }
    }

    /// Reverse of [`MeshEventType::code`].
    pub fn from_code(code: u32) -> Option<Self> {
        Some(match code {
            0 => MeshEventType::NodeJoined,
            1 => MeshEventType::NodeLeft,
            2 => MeshEventType::NodeEvicted,
            3 => MeshEventType::SessionAdded,
            4 => MeshEventType::SessionRemoved,
            5 => MeshEventType::NodeShutdown,
            6 => MeshEventType::NodeStarted,
            7 => MeshEventType::SessionInterrupted,
            8 => MeshEventType::SessionRecovered,
            9 => MeshEventType::NodeOffline,
            10 => MeshEventType::NodeRecovered,
            11 => MeshEventType::SplitDetected,
            12 => MeshEventType::SplitResolved,
            _ => return None,
        })
    }

    /// Reverse of [`MeshEventType::as_str`].
    pub fn from_name(name: &str) -> Option<Self> {
        Some(match name {
            "NODE_JOINED" => MeshEventType::NodeJoined,
            "NODE_LEFT" => MeshEventType::NodeLeft,
            "NODE_EVICTED" => MeshEventType::NodeEvicted,
            "SESSION_ADDED" => MeshEventType::SessionAdded,
            "SESSION_REMOVED" => MeshEventType::SessionRemoved,
            "NODE_SHUTDOWN" => MeshEventType::NodeShutdown,
            "NODE_STARTED" => MeshEventType::NodeStarted,
            "SESSION_INTERRUPTED" => MeshEventType::SessionInterrupted,
            "SESSION_RECOVERED" => MeshEventType::SessionRecovered,
            "NODE_OFFLINE" => MeshEventType::NodeOffline,
            "NODE_RECOVERED" => MeshEventType::NodeRecovered,
            "SPLIT_DETECTED" => MeshEventType::SplitDetected,
            "SPLIT_RESOLVED" => MeshEventType::SplitResolved,
            _ => return None,
        })
    }

    /// Upper-case name used in logs and the event log table.
    pub fn as_str(&self) -> &'static str {
        match self {
            MeshEventType::NodeJoined => "NODE_JOINED",
            MeshEventType::NodeLeft => "NODE_LEFT",
            MeshEventType::NodeEvicted => "NODE_EVICTED",
            MeshEventType::SessionAdded => "SESSION_ADDED",
            MeshEventType::SessionRemoved => "SESSION_REMOVED",
            MeshEventType::NodeShutdown => "NODE_SHUTDOWN",
            MeshEventType::NodeStarted => "NODE_STARTED",
            MeshEventType::SessionInterrupted => "SESSION_INTERRUPTED",
            MeshEventType::SessionRecovered => "SESSION_RECOVERED",
            MeshEventType::NodeOffline => "NODE_OFFLINE",
            MeshEventType::NodeRecovered => "NODE_RECOVERED",
            MeshEventType::SplitDetected => "SPLIT_DETECTED",
            MeshEventType::SplitResolved => "SPLIT_RESOLVED",
        }
    }
}

impl std::fmt::Display for MeshEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A mesh state event as held in memory and in the durable log.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MeshEvent {
    pub event_type: MeshEventType,
    /// Node that published the event.
    pub originator_node: NodeId,
    /// Node the event is about; zero when not node-scoped.
    pub affected_node: NodeId,
    /// Per-originator monotonic counter. Zero until assigned at publish.
    pub sequence: u64,
    /// Unix seconds, stamped at publish.
    pub timestamp: u64,
    pub metadata: BTreeMap<String, String>,
    pub payload: Vec<u8>,
}

impl MeshEvent {
    /// Create an event about `affected_node` with empty metadata.
    ///
    /// Originator, sequence, and timestamp are assigned by the event
    /// manager at publish time.
    pub fn new(event_type: MeshEventType, affected_node: NodeId) -> Self {
        Self {
            event_type,
            originator_node: 0,
            affected_node,
            sequence: 0,
            timestamp: 0,
            metadata: BTreeMap::new(),
            payload: Vec::new(),
        }
    }

    /// Attach a metadata entry, consuming and returning the event.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// Wire record for a mesh state event, carried in `mesh_event` messages and
/// handed to the transport's state-event broadcast.
///
/// Node IDs and the sequence travel as strings; the payload is base64.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct MeshStateEvent {
    /// Integer code from [`MeshEventType::code`].
    pub event_type: u32,
    pub originator_node: String,
    pub affected_node: String,
    pub sequence_number: String,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(default)]
    pub metadata: BTreeMap<String, String>,
    /// Base64-encoded payload bytes; empty string when there is no payload.
    #[serde(default)]
    pub payload: String,
}

impl MeshStateEvent {
    /// Build the wire record for an event.
    pub fn from_event(event: &MeshEvent) -> Self {
        Self {
            event_type: event.event_type.code(),
            originator_node: event.originator_node.to_string(),
            affected_node: event.affected_node.to_string(),
            sequence_number: event.sequence.to_string(),
            timestamp: event.timestamp,
            metadata: event.metadata.clone(),
            payload: if event.payload.is_empty() {
                String::new()
            } else {
                base64::engine::general_purpose::STANDARD.encode(&event.payload)
            },
        }
    }

    /// Decode back into a [`MeshEvent`].
    ///
    /// Fails on an unknown event-type code, a malformed node ID or
    /// sequence string, or invalid base64 payload.
    pub fn into_event(self) -> Result<MeshEvent, EventDecodeError> {
        let event_type = MeshEventType::from_code(self.event_type)
            .ok_or(EventDecodeError::UnknownEventType(self.event_type))?;
        let originator_node = crate::coerce::parse_u64(&self.originator_node)
            .ok_or_else(|| EventDecodeError::BadField("originator_node"))?;
        let affected_node = crate::coerce::parse_u64(&self.affected_node)
            .ok_or_else(|| EventDecodeError::BadField("affected_node"))?;
        let sequence = crate::coerce::parse_u64(&self.sequence_number)
            .ok_or_else(|| EventDecodeError::BadField("sequence_number"))?;
        let payload = if self.payload.is_empty() {
            Vec::new()
        } else {
            base64::engine::general_purpose::STANDARD
                .decode(&self.payload)
                .map_err(|_| EventDecodeError::BadField("payload"))?
        };
        Ok(MeshEvent {
            event_type,
            originator_node,
            affected_node,
            sequence,
            timestamp: self.timestamp,
            metadata: self.metadata,
            payload,
        })
    }
}

/// Failure decoding a wire event record.
#[derive(Debug, thiserror::Error)]
pub enum EventDecodeError {
    #[error("unknown event type code {0}")]
    UnknownEventType(u32),

    #[error("malformed field: {0}")]
    BadField(&'static str),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_roundtrip() {
        for code in 0..13 {
            let et = MeshEventType::from_code(code).expect("known code");
            assert_eq!(et.code(), code);
        }
        assert!(MeshEventType::from_code(13).is_none());
    }

    #[test]
    fn test_wire_record_roundtrip() {
        let event = MeshEvent {
            event_type: MeshEventType::SplitDetected,
            originator_node: u64::MAX,
            affected_node: 7,
            sequence: 42,
            timestamp: 1_700_000_000,
            metadata: BTreeMap::from([("total_nodes".to_string(), "4".to_string())]),
            payload: vec![1, 2, 3],
        };
        let wire = MeshStateEvent::from_event(&event);
        assert_eq!(wire.originator_node, u64::MAX.to_string());
        let decoded = wire.into_event().expect("decode");
        assert_eq!(decoded, event);
    }

    #[test]
    fn test_empty_payload_stays_empty() {
        let event = MeshEvent::new(MeshEventType::NodeJoined, 2);
        let wire = MeshStateEvent::from_event(&event);
        assert!(wire.payload.is_empty());
        let decoded = wire.into_event().expect("decode");
        assert!(decoded.payload.is_empty());
    }

    #[test]
    fn test_unknown_code_rejected() {
        let wire = MeshStateEvent {
            event_type: 99,
            originator_node: "1".to_string(),
            affected_node: "0".to_string(),
            sequence_number: "1".to_string(),
            timestamp: 0,
            metadata: BTreeMap::new(),
            payload: String::new(),
        };
        assert!(matches!(
            wire.into_event(),
            Err(EventDecodeError::UnknownEventType(99))
        ));
    }

    #[test]
    fn test_event_name_strings() {
        assert_eq!(MeshEventType::NodeOffline.as_str(), "NODE_OFFLINE");
        assert_eq!(MeshEventType::SplitResolved.to_string(), "SPLIT_RESOLVED");
    }

    #[test]
    fn test_names_roundtrip() {
        for code in 0..13 {
            let et = MeshEventType::from_code(code).expect("known code");
            assert_eq!(MeshEventType::from_name(et.as_str()), Some(et));
        }
        assert!(MeshEventType::from_name("NODE_TELEPORTED").is_none());
    }
}
