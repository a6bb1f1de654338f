//! Replicated entity bookkeeping at the protocol boundary.
//!
//! The component model itself is external; this store tracks only what the
//! transition protocol needs: which entities are alive, which partition owns
//! them, and how statically-placed instances are matched across nodes.

use std::collections::BTreeMap;

use scene_sync_proto::{
    EntityId, EntitySnapshot, GlobalTypeHash, PartitionHandle, StaticEntityRef,
};

use crate::error::SceneSyncError;
use crate::handle_table::PERSISTENT_ROOT_HANDLE;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntityRecord {
    pub type_hash: GlobalTypeHash,
    pub partition_handle: PartitionHandle,
    /// Set for statically-placed entities: the authored identity plus the
    /// local handle of the partition instance that produced it.
    pub origin: Option<StaticEntityRef>,
    pub active: bool,
    /// Despawned together with its partition when true; otherwise moved to
    /// the persistent root scope across exclusive transitions.
    pub destroy_with_partition: bool,
    /// True once the entity carries an authority-assigned identity. On a
    /// peer, provisional static instances stay false until a snapshot
    /// re-binds them; only replicated entities are reported back during
    /// synchronization.
    pub replicated: bool,
    pub state_cbor: Vec<u8>,
}

/// Locally issued provisional identities start here so they can never shadow
/// an authority-assigned id arriving in a snapshot.
pub const PROVISIONAL_ENTITY_ID_FLOOR: u64 = 1 << 48;

#[derive(Debug, Clone)]
pub struct EntityStore {
    next_entity_id: u64,
    entities: BTreeMap<EntityId, EntityRecord>,
}

impl Default for EntityStore {
    fn default() -> Self {
        Self::new()
    }
}

impl EntityStore {
    pub fn new() -> Self {
        Self::with_id_floor(1)
    }

    pub fn with_id_floor(floor: u64) -> Self {
        Self {
            next_entity_id: floor.max(1),
            entities: BTreeMap::new(),
        }
    }

    /// Spawn with a locally issued id (authority side, and provisional peer
    /// entities awaiting re-binding to their authority id).
    pub fn spawn(&mut self, record: EntityRecord) -> EntityId {
        let entity_id = EntityId(self.next_entity_id);
        self.next_entity_id += 1;
        self.entities.insert(entity_id, record);
        entity_id
    }

    /// Spawn under an id assigned elsewhere. An occupied id means a message
    /// was duplicated or replayed out of contract.
    pub fn spawn_with_id(
        &mut self,
        entity_id: EntityId,
        record: EntityRecord,
    ) -> Result<(), SceneSyncError> {
        if self.entities.contains_key(&entity_id) {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!("entity {} already spawned", entity_id.0),
            });
        }
        self.entities.insert(entity_id, record);
        Ok(())
    }

    pub fn despawn(&mut self, entity_id: EntityId) -> Option<EntityRecord> {
        self.entities.remove(&entity_id)
    }

    pub fn set_active(&mut self, entity_id: EntityId, active: bool) -> bool {
        match self.entities.get_mut(&entity_id) {
            Some(record) => {
                record.active = active;
                true
            }
            None => false,
        }
    }

    pub fn alive(&self, entity_id: EntityId) -> bool {
        self.entities.contains_key(&entity_id)
    }

    pub fn get(&self, entity_id: EntityId) -> Option<&EntityRecord> {
        self.entities.get(&entity_id)
    }

    pub fn move_to_partition(&mut self, entity_id: EntityId, handle: PartitionHandle) -> bool {
        match self.entities.get_mut(&entity_id) {
            Some(record) => {
                record.partition_handle = handle;
                true
            }
            None => false,
        }
    }

    pub fn entities_in(&self, handle: PartitionHandle) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, record)| record.partition_handle == handle)
            .map(|(entity_id, _)| *entity_id)
            .collect()
    }

    pub fn resident_ids(&self) -> Vec<EntityId> {
        self.entities.keys().copied().collect()
    }

    /// Entities carrying an authority-assigned identity.
    pub fn replicated_ids(&self) -> Vec<EntityId> {
        self.entities
            .iter()
            .filter(|(_, record)| record.replicated)
            .map(|(entity_id, _)| *entity_id)
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Despawn every entity owned by `handle`; returns the despawned ids.
    pub fn despawn_partition(&mut self, handle: PartitionHandle) -> Vec<EntityId> {
        let doomed = self.entities_in(handle);
        for entity_id in &doomed {
            self.entities.remove(entity_id);
        }
        doomed
    }

    /// Exclusive-transition sweep: entities marked `destroy_with_partition`
    /// are despawned, the rest are parked in the persistent root scope until
    /// the replacement partition finishes loading.
    pub fn sweep_for_exclusive_transition(&mut self) -> Vec<EntityId> {
        let mut despawned = Vec::new();
        let ids: Vec<EntityId> = self.entities.keys().copied().collect();
        for entity_id in ids {
            let Some(record) = self.entities.get_mut(&entity_id) else {
                continue;
            };
            if record.partition_handle == PERSISTENT_ROOT_HANDLE {
                continue;
            }
            if record.destroy_with_partition {
                self.entities.remove(&entity_id);
                despawned.push(entity_id);
            } else {
                record.partition_handle = PERSISTENT_ROOT_HANDLE;
            }
        }
        despawned
    }

    /// Move every entity parked in the persistent root into `handle`.
    pub fn adopt_root_entities(&mut self, handle: PartitionHandle) -> Vec<EntityId> {
        let parked = self.entities_in(PERSISTENT_ROOT_HANDLE);
        for entity_id in &parked {
            if let Some(record) = self.entities.get_mut(entity_id) {
                record.partition_handle = handle;
            }
        }
        parked
    }

    pub fn snapshot_of(&self, entity_id: EntityId) -> Option<EntitySnapshot> {
        self.entities.get(&entity_id).map(|record| EntitySnapshot {
            entity_id,
            type_hash: record.type_hash,
            origin: record.origin,
            partition_handle: record.partition_handle,
            active: record.active,
            state_cbor: record.state_cbor.clone(),
        })
    }

    pub fn snapshots(&self) -> Vec<EntitySnapshot> {
        self.entities
            .keys()
            .copied()
            .filter_map(|entity_id| self.snapshot_of(entity_id))
            .collect()
    }
}

/// Looks up statically-placed entities by authored identity and the local
/// handle of the partition instance that produced them. One instance per
/// (type hash, handle) pair; matches are consumed so the same instance can
/// never satisfy two snapshots.
#[derive(Debug, Clone, Default)]
pub struct StaticEntityIndex {
    by_origin: BTreeMap<(GlobalTypeHash, PartitionHandle), EntityId>,
}

impl StaticEntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        type_hash: GlobalTypeHash,
        handle: PartitionHandle,
        entity_id: EntityId,
    ) -> bool {
        let key = (type_hash, handle);
        if self.by_origin.contains_key(&key) {
            return false;
        }
        self.by_origin.insert(key, entity_id);
        true
    }

    pub fn take(&mut self, type_hash: GlobalTypeHash, handle: PartitionHandle) -> Option<EntityId> {
        self.by_origin.remove(&(type_hash, handle))
    }

    pub fn peek(&self, type_hash: GlobalTypeHash, handle: PartitionHandle) -> Option<EntityId> {
        self.by_origin.get(&(type_hash, handle)).copied()
    }

    pub fn remove_partition(&mut self, handle: PartitionHandle) {
        self.by_origin.retain(|(_, origin_handle), _| *origin_handle != handle);
    }

    pub fn len(&self) -> usize {
        self.by_origin.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_origin.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn static_record(handle: PartitionHandle, type_hash: GlobalTypeHash) -> EntityRecord {
        EntityRecord {
            type_hash,
            partition_handle: handle,
            origin: Some(StaticEntityRef {
                type_hash,
                origin_partition_handle: handle,
            }),
            active: true,
            destroy_with_partition: true,
            replicated: true,
            state_cbor: Vec::new(),
        }
    }

    fn dynamic_record(handle: PartitionHandle, destroy_with_partition: bool) -> EntityRecord {
        EntityRecord {
            type_hash: GlobalTypeHash(1),
            partition_handle: handle,
            origin: None,
            active: true,
            destroy_with_partition,
            replicated: true,
            state_cbor: Vec::new(),
        }
    }

    #[test]
    fn spawn_issues_unique_ids() {
        let mut store = EntityStore::new();
        let a = store.spawn(dynamic_record(PartitionHandle(1), true));
        let b = store.spawn(dynamic_record(PartitionHandle(1), true));
        assert_ne!(a, b);
        assert!(store.alive(a));
    }

    #[test]
    fn spawn_with_occupied_id_is_a_violation() {
        let mut store = EntityStore::new();
        let id = store.spawn(dynamic_record(PartitionHandle(1), true));
        let err = store
            .spawn_with_id(id, dynamic_record(PartitionHandle(2), true))
            .expect_err("occupied");
        assert!(matches!(err, SceneSyncError::ProtocolViolation { .. }));
    }

    #[test]
    fn despawn_partition_removes_only_its_residents() {
        let mut store = EntityStore::new();
        let keep = store.spawn(dynamic_record(PartitionHandle(1), true));
        let gone = store.spawn(dynamic_record(PartitionHandle(2), true));
        let despawned = store.despawn_partition(PartitionHandle(2));
        assert_eq!(despawned, vec![gone]);
        assert!(store.alive(keep));
        assert!(!store.alive(gone));
    }

    #[test]
    fn exclusive_sweep_parks_persistent_entities_and_despawns_the_rest() {
        let mut store = EntityStore::new();
        let persistent = store.spawn(dynamic_record(PartitionHandle(1), false));
        let doomed = store.spawn(dynamic_record(PartitionHandle(1), true));
        let despawned = store.sweep_for_exclusive_transition();
        assert_eq!(despawned, vec![doomed]);
        assert_eq!(
            store.get(persistent).expect("parked").partition_handle,
            PERSISTENT_ROOT_HANDLE
        );

        let adopted = store.adopt_root_entities(PartitionHandle(9));
        assert_eq!(adopted, vec![persistent]);
        assert_eq!(
            store.get(persistent).expect("adopted").partition_handle,
            PartitionHandle(9)
        );
    }

    #[test]
    fn snapshot_round_trips_record_fields() {
        let mut store = EntityStore::new();
        let id = store.spawn(static_record(PartitionHandle(3), GlobalTypeHash(8)));
        let snapshot = store.snapshot_of(id).expect("snapshot");
        assert_eq!(snapshot.entity_id, id);
        assert_eq!(snapshot.type_hash, GlobalTypeHash(8));
        assert_eq!(snapshot.partition_handle, PartitionHandle(3));
        assert!(snapshot.active);
    }

    #[test]
    fn replicated_ids_exclude_provisional_entities() {
        let mut store = EntityStore::new();
        let replicated = store.spawn(dynamic_record(PartitionHandle(1), true));
        let mut provisional = static_record(PartitionHandle(1), GlobalTypeHash(4));
        provisional.replicated = false;
        store.spawn(provisional);
        assert_eq!(store.replicated_ids(), vec![replicated]);
        assert_eq!(store.len(), 2);
    }

    #[test]
    fn static_index_matches_are_consumed() {
        let mut index = StaticEntityIndex::new();
        assert!(index.register(GlobalTypeHash(8), PartitionHandle(3), EntityId(10)));
        assert!(!index.register(GlobalTypeHash(8), PartitionHandle(3), EntityId(11)));
        assert_eq!(
            index.take(GlobalTypeHash(8), PartitionHandle(3)),
            Some(EntityId(10))
        );
        assert_eq!(index.take(GlobalTypeHash(8), PartitionHandle(3)), None);
    }

    #[test]
    fn static_index_distinguishes_instances_by_handle() {
        let mut index = StaticEntityIndex::new();
        index.register(GlobalTypeHash(8), PartitionHandle(3), EntityId(10));
        index.register(GlobalTypeHash(8), PartitionHandle(4), EntityId(11));
        assert_eq!(
            index.peek(GlobalTypeHash(8), PartitionHandle(4)),
            Some(EntityId(11))
        );
        index.remove_partition(PartitionHandle(3));
        assert_eq!(index.peek(GlobalTypeHash(8), PartitionHandle(3)), None);
        assert_eq!(index.len(), 1);
    }
}
