//! Channel naming conventions and wire encoding helpers.

use serde::Serialize;

use crate::scene_event::SceneEventEnvelope;
use crate::sync_error::ProtoError;

pub const WIRE_ENCODING_CBOR: &str = "cbor";

pub const GOSSIP_PREFIX: &str = "ss";
pub const TOPIC_SCENE_EVENT_SUFFIX: &str = "scene";

/// Per-receiver scene event topic. Each node subscribes to its own topic;
/// senders publish to the receiver's topic.
pub fn topic_scene_event(world_id: &str, node_id: &str) -> String {
    format!("{GOSSIP_PREFIX}.{world_id}.{TOPIC_SCENE_EVENT_SUFFIX}.{node_id}")
}

pub fn to_canonical_cbor<T: Serialize>(value: &T) -> Result<Vec<u8>, ProtoError> {
    let mut buf = Vec::with_capacity(256);
    let canonical_value = serde_cbor::value::to_value(value)?;
    let mut serializer = serde_cbor::ser::Serializer::new(&mut buf);
    serializer.self_describe()?;
    canonical_value.serialize(&mut serializer)?;
    Ok(buf)
}

pub fn encode_scene_event(envelope: &SceneEventEnvelope) -> Result<Vec<u8>, ProtoError> {
    envelope.record.validate()?;
    to_canonical_cbor(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scene_event_topic_matches_expected_format() {
        assert_eq!(topic_scene_event("w1", "peer-1"), "ss.w1.scene.peer-1");
    }
}
