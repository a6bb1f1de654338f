//! Scene transition event records and their (de)serialization contract.

use serde::{Deserialize, Serialize};

use crate::sync_error::ProtoError;

pub type NodeId = String;

/// Stable cross-process identifier of a partition asset.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionId(pub u32);

/// Process-local handle of one loaded partition instance. Never meaningful
/// across processes without going through the handle translation table.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct PartitionHandle(pub i32);

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct EntityId(pub u64);

/// Hash of a statically-placed entity's authored identity. Identical for
/// every instance produced by repeated additive loads of the same partition.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default,
)]
pub struct GlobalTypeHash(pub u64);

/// Unique identifier of one authority-initiated transition event.
///
/// 128 bits split into two halves: a per-node seed and a per-node sequence
/// number, so ids never collide across nodes and CBOR encoding stays within
/// 64-bit integers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EventProgressId {
    pub seed: u64,
    pub seq: u64,
}

impl EventProgressId {
    pub fn new(seed: u64, seq: u64) -> Self {
        Self { seed, seq }
    }

    pub fn as_u128(&self) -> u128 {
        (u128::from(self.seed) << 64) | u128::from(self.seq)
    }
}

pub fn partition_id_from_path(path: &str) -> PartitionId {
    let digest = blake3::hash(path.as_bytes());
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&digest.as_bytes()[..4]);
    PartitionId(u32::from_le_bytes(bytes))
}

pub fn global_type_hash(authored_name: &str) -> GlobalTypeHash {
    let digest = blake3::hash(authored_name.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    GlobalTypeHash(u64::from_le_bytes(bytes))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransitionMode {
    /// Replaces all additively loaded partitions; resets the world.
    Exclusive,
    /// Loads alongside existing partitions.
    Additive,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SceneEventKind {
    Load,
    Unload,
    Synchronize,
    ReSynchronize,
    LoadComplete,
    UnloadComplete,
    SynchronizeComplete,
    LoadEventCompleted,
    UnloadEventCompleted,
    ActiveChanged,
    ObjectMigrated,
}

impl SceneEventKind {
    /// Events flowing authority to peer; the rest flow peer to authority.
    pub fn is_peer_bound(self) -> bool {
        matches!(
            self,
            SceneEventKind::Load
                | SceneEventKind::Unload
                | SceneEventKind::Synchronize
                | SceneEventKind::ReSynchronize
                | SceneEventKind::LoadEventCompleted
                | SceneEventKind::UnloadEventCompleted
                | SceneEventKind::ActiveChanged
                | SceneEventKind::ObjectMigrated
        )
    }

    /// Kinds carrying the progress id of a tracked load/unload event.
    pub fn carries_progress_id(self) -> bool {
        matches!(
            self,
            SceneEventKind::Load
                | SceneEventKind::Unload
                | SceneEventKind::LoadComplete
                | SceneEventKind::UnloadComplete
                | SceneEventKind::LoadEventCompleted
                | SceneEventKind::UnloadEventCompleted
        )
    }
}

/// One partition the peer should have loaded by the end of synchronization,
/// together with the authority-local handle of that instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncQueueEntry {
    pub partition_id: PartitionId,
    pub partition_handle: PartitionHandle,
}

/// Disambiguates duplicate instances of a statically-placed entity created
/// by loading the same partition more than once.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StaticEntityRef {
    pub type_hash: GlobalTypeHash,
    pub origin_partition_handle: PartitionHandle,
}

/// Full replication state of one entity. Component state rides along as an
/// opaque CBOR block; the protocol never interprets it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntitySnapshot {
    pub entity_id: EntityId,
    pub type_hash: GlobalTypeHash,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin: Option<StaticEntityRef>,
    pub partition_handle: PartitionHandle,
    pub active: bool,
    pub state_cbor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PartitionMigrations {
    pub partition_handle: PartitionHandle,
    pub entity_ids: Vec<EntityId>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data", rename_all = "snake_case")]
pub enum SceneEventPayload {
    None,
    SynchronizeSet {
        queue: Vec<SyncQueueEntry>,
        snapshots: Vec<EntitySnapshot>,
        despawned: Vec<StaticEntityRef>,
    },
    PlacedEntities {
        snapshots: Vec<EntitySnapshot>,
    },
    ResidentEntities {
        entity_ids: Vec<EntityId>,
    },
    RemoveEntities {
        entity_ids: Vec<EntityId>,
    },
    ProgressDone {
        peers_completed: Vec<NodeId>,
        peers_timed_out: Vec<NodeId>,
    },
    Migrations {
        moved: Vec<PartitionMigrations>,
    },
}

pub fn payload_matches_kind(kind: SceneEventKind, payload: &SceneEventPayload) -> bool {
    match kind {
        SceneEventKind::Load => matches!(payload, SceneEventPayload::PlacedEntities { .. }),
        SceneEventKind::Unload
        | SceneEventKind::LoadComplete
        | SceneEventKind::UnloadComplete
        | SceneEventKind::ActiveChanged => matches!(payload, SceneEventPayload::None),
        SceneEventKind::Synchronize => matches!(payload, SceneEventPayload::SynchronizeSet { .. }),
        SceneEventKind::ReSynchronize => matches!(payload, SceneEventPayload::RemoveEntities { .. }),
        SceneEventKind::SynchronizeComplete => {
            matches!(payload, SceneEventPayload::ResidentEntities { .. })
        }
        SceneEventKind::LoadEventCompleted | SceneEventKind::UnloadEventCompleted => {
            matches!(payload, SceneEventPayload::ProgressDone { .. })
        }
        SceneEventKind::ObjectMigrated => matches!(payload, SceneEventPayload::Migrations { .. }),
    }
}

/// The serializable description of one scene transition or notification.
///
/// Created at the start of one transition and consumed once the receiving
/// side has fully processed it; never reused across events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneEventRecord {
    pub event_kind: SceneEventKind,
    /// Mode of the transition, or the peer's target synchronization mode for
    /// `Synchronize` records.
    pub transition_mode: TransitionMode,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub progress_id: Option<EventProgressId>,
    pub partition_id: PartitionId,
    /// Sender-local handle; the receiver translates before use.
    pub partition_handle: PartitionHandle,
    pub payload: SceneEventPayload,
}

impl SceneEventRecord {
    pub fn validate(&self) -> Result<(), ProtoError> {
        if !payload_matches_kind(self.event_kind, &self.payload) {
            return Err(ProtoError::MalformedRecord {
                reason: format!("payload does not match event kind {:?}", self.event_kind),
            });
        }
        if self.event_kind.carries_progress_id() && self.progress_id.is_none() {
            return Err(ProtoError::MalformedRecord {
                reason: format!("missing progress id for {:?}", self.event_kind),
            });
        }
        if !self.event_kind.carries_progress_id() && self.progress_id.is_some() {
            return Err(ProtoError::MalformedRecord {
                reason: format!("unexpected progress id for {:?}", self.event_kind),
            });
        }
        if let SceneEventPayload::SynchronizeSet { queue, .. } = &self.payload {
            if queue.is_empty() {
                return Err(ProtoError::MalformedRecord {
                    reason: "synchronize set carries an empty partition queue".to_string(),
                });
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SceneEventEnvelope {
    pub world_id: String,
    pub sender_id: NodeId,
    pub record: SceneEventRecord,
}

pub fn decode_scene_event(bytes: &[u8]) -> Result<SceneEventEnvelope, ProtoError> {
    let envelope: SceneEventEnvelope = serde_cbor::from_slice(bytes)?;
    envelope.record.validate()?;
    Ok(envelope)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::encode_scene_event;

    fn sample_envelope(record: SceneEventRecord) -> SceneEventEnvelope {
        SceneEventEnvelope {
            world_id: "w1".to_string(),
            sender_id: "authority".to_string(),
            record,
        }
    }

    fn load_record() -> SceneEventRecord {
        SceneEventRecord {
            event_kind: SceneEventKind::Load,
            transition_mode: TransitionMode::Additive,
            progress_id: Some(EventProgressId::new(7, 1)),
            partition_id: PartitionId(11),
            partition_handle: PartitionHandle(3),
            payload: SceneEventPayload::PlacedEntities {
                snapshots: vec![EntitySnapshot {
                    entity_id: EntityId(42),
                    type_hash: GlobalTypeHash(9),
                    origin: Some(StaticEntityRef {
                        type_hash: GlobalTypeHash(9),
                        origin_partition_handle: PartitionHandle(3),
                    }),
                    partition_handle: PartitionHandle(3),
                    active: true,
                    state_cbor: vec![1, 2, 3],
                }],
            },
        }
    }

    #[test]
    fn cbor_round_trip_load_record() {
        let envelope = sample_envelope(load_record());
        let encoded = encode_scene_event(&envelope).expect("encode load");
        let decoded = decode_scene_event(&encoded).expect("decode load");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn cbor_round_trip_synchronize_record() {
        let envelope = sample_envelope(SceneEventRecord {
            event_kind: SceneEventKind::Synchronize,
            transition_mode: TransitionMode::Exclusive,
            progress_id: None,
            partition_id: PartitionId(11),
            partition_handle: PartitionHandle(3),
            payload: SceneEventPayload::SynchronizeSet {
                queue: vec![
                    SyncQueueEntry {
                        partition_id: PartitionId(11),
                        partition_handle: PartitionHandle(3),
                    },
                    SyncQueueEntry {
                        partition_id: PartitionId(12),
                        partition_handle: PartitionHandle(4),
                    },
                ],
                snapshots: Vec::new(),
                despawned: vec![StaticEntityRef {
                    type_hash: GlobalTypeHash(5),
                    origin_partition_handle: PartitionHandle(4),
                }],
            },
        });
        let encoded = encode_scene_event(&envelope).expect("encode sync");
        let decoded = decode_scene_event(&encoded).expect("decode sync");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn cbor_round_trip_progress_done_record() {
        let envelope = sample_envelope(SceneEventRecord {
            event_kind: SceneEventKind::LoadEventCompleted,
            transition_mode: TransitionMode::Additive,
            progress_id: Some(EventProgressId::new(7, 2)),
            partition_id: PartitionId(11),
            partition_handle: PartitionHandle(3),
            payload: SceneEventPayload::ProgressDone {
                peers_completed: vec!["peer-1".to_string()],
                peers_timed_out: vec!["peer-2".to_string()],
            },
        });
        let encoded = encode_scene_event(&envelope).expect("encode done");
        let decoded = decode_scene_event(&encoded).expect("decode done");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn cbor_round_trip_migration_record() {
        let envelope = sample_envelope(SceneEventRecord {
            event_kind: SceneEventKind::ObjectMigrated,
            transition_mode: TransitionMode::Additive,
            progress_id: None,
            partition_id: PartitionId(0),
            partition_handle: PartitionHandle(0),
            payload: SceneEventPayload::Migrations {
                moved: vec![PartitionMigrations {
                    partition_handle: PartitionHandle(3),
                    entity_ids: vec![EntityId(1), EntityId(2)],
                }],
            },
        });
        let encoded = encode_scene_event(&envelope).expect("encode migrations");
        let decoded = decode_scene_event(&encoded).expect("decode migrations");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn validate_rejects_payload_kind_mismatch() {
        let mut record = load_record();
        record.payload = SceneEventPayload::None;
        let err = record.validate().expect_err("mismatch should fail");
        assert!(matches!(err, ProtoError::MalformedRecord { .. }));
    }

    #[test]
    fn validate_rejects_missing_progress_id() {
        let mut record = load_record();
        record.progress_id = None;
        let err = record.validate().expect_err("missing id should fail");
        assert!(matches!(err, ProtoError::MalformedRecord { .. }));
    }

    #[test]
    fn validate_rejects_progress_id_on_synchronize() {
        let record = SceneEventRecord {
            event_kind: SceneEventKind::Synchronize,
            transition_mode: TransitionMode::Exclusive,
            progress_id: Some(EventProgressId::new(1, 1)),
            partition_id: PartitionId(1),
            partition_handle: PartitionHandle(1),
            payload: SceneEventPayload::SynchronizeSet {
                queue: vec![SyncQueueEntry {
                    partition_id: PartitionId(1),
                    partition_handle: PartitionHandle(1),
                }],
                snapshots: Vec::new(),
                despawned: Vec::new(),
            },
        };
        let err = record.validate().expect_err("unexpected id should fail");
        assert!(matches!(err, ProtoError::MalformedRecord { .. }));
    }

    #[test]
    fn validate_rejects_empty_synchronize_queue() {
        let record = SceneEventRecord {
            event_kind: SceneEventKind::Synchronize,
            transition_mode: TransitionMode::Exclusive,
            progress_id: None,
            partition_id: PartitionId(1),
            partition_handle: PartitionHandle(1),
            payload: SceneEventPayload::SynchronizeSet {
                queue: Vec::new(),
                snapshots: Vec::new(),
                despawned: Vec::new(),
            },
        };
        let err = record.validate().expect_err("empty queue should fail");
        assert!(matches!(err, ProtoError::MalformedRecord { .. }));
    }

    #[test]
    fn event_progress_id_packs_into_u128() {
        let id = EventProgressId::new(0xAABB, 0xCCDD);
        assert_eq!(id.as_u128(), (0xAABBu128 << 64) | 0xCCDDu128);
    }

    #[test]
    fn partition_id_from_path_is_stable() {
        let a = partition_id_from_path("worlds/keep.partition");
        let b = partition_id_from_path("worlds/keep.partition");
        let c = partition_id_from_path("worlds/crypt.partition");
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn peer_bound_kinds_partition_the_event_space() {
        let peer_bound = [
            SceneEventKind::Load,
            SceneEventKind::Unload,
            SceneEventKind::Synchronize,
            SceneEventKind::ReSynchronize,
            SceneEventKind::LoadEventCompleted,
            SceneEventKind::UnloadEventCompleted,
            SceneEventKind::ActiveChanged,
            SceneEventKind::ObjectMigrated,
        ];
        let authority_bound = [
            SceneEventKind::LoadComplete,
            SceneEventKind::UnloadComplete,
            SceneEventKind::SynchronizeComplete,
        ];
        for kind in peer_bound {
            assert!(kind.is_peer_bound(), "{kind:?}");
        }
        for kind in authority_bound {
            assert!(!kind.is_peer_bound(), "{kind:?}");
        }
    }
}
