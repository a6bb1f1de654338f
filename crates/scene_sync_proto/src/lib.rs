//! Wire protocol types for distributed world-partition transitions.

pub mod channel;
pub mod scene_event;
pub mod sync_error;
pub mod sync_net;

pub use channel::{
    encode_scene_event, to_canonical_cbor, topic_scene_event, GOSSIP_PREFIX,
    TOPIC_SCENE_EVENT_SUFFIX, WIRE_ENCODING_CBOR,
};
pub use scene_event::{
    decode_scene_event, global_type_hash, partition_id_from_path, EntityId, EntitySnapshot,
    EventProgressId, GlobalTypeHash, NodeId, PartitionHandle, PartitionId, PartitionMigrations,
    SceneEventEnvelope, SceneEventKind, SceneEventPayload, SceneEventRecord, StaticEntityRef,
    SyncQueueEntry, TransitionMode,
};
pub use sync_error::ProtoError;
pub use sync_net::{ChannelSubscription, SceneChannel};
