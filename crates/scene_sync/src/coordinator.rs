//! Top-level orchestration of scene transition events.
//!
//! Each node runs one coordinator. The authority issues transitions and
//! tracks fleet-wide completion; peers mirror the authority's partition set
//! and entity state. All state here is touched only from the owning node's
//! update loop; cross-node consistency comes from the message protocol alone.

mod authority;
mod peer;

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::Arc;

use tracing::warn;

use scene_sync_proto::sync_net as proto_net;
use scene_sync_proto::{
    decode_scene_event, encode_scene_event, topic_scene_event, ChannelSubscription, EntityId,
    EntitySnapshot, EventProgressId, NodeId, PartitionHandle, PartitionId, SceneEventEnvelope,
    SceneEventKind, SceneEventPayload, SceneEventRecord, StaticEntityRef, SyncQueueEntry,
    TransitionMode,
};

use crate::config::SceneSyncConfig;
use crate::engine::{EngineCompletion, PartitionEngine, PlacedEntityContent};
use crate::entities::{EntityRecord, EntityStore, StaticEntityIndex, PROVISIONAL_ENTITY_ID_FLOOR};
use crate::error::SceneSyncError;
use crate::handle_table::HandleTranslationTable;
use crate::migration::ObjectMigrationTracker;
use crate::notice::{SceneEventNotice, SceneNoticeKind};
use crate::progress::SceneEventProgress;
use crate::registry::{LoadedPartitions, PartitionCatalog};
use crate::util::node_seed;

pub trait SceneChannel: proto_net::SceneChannel<SceneSyncError> {}

impl<T> SceneChannel for T where T: proto_net::SceneChannel<SceneSyncError> {}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeRole {
    Authority,
    Peer { authority_id: NodeId },
}

/// State of an inbound synchronization sequence on a peer.
#[derive(Debug, Clone)]
struct PeerSyncState {
    mode: TransitionMode,
    base_handle: PartitionHandle,
    queue: VecDeque<SyncQueueEntry>,
    snapshots: Vec<EntitySnapshot>,
    despawned: Vec<StaticEntityRef>,
}

/// One outstanding physical engine operation and what to do when it lands.
#[derive(Debug, Clone)]
enum PendingLocalOp {
    AuthorityLoad {
        progress_id: EventProgressId,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
    },
    AuthorityUnload {
        progress_id: EventProgressId,
        local_handle: PartitionHandle,
    },
    PeerLoad {
        progress_id: EventProgressId,
        authority_handle: PartitionHandle,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
        snapshots: Vec<EntitySnapshot>,
    },
    PeerUnload {
        progress_id: EventProgressId,
        authority_handle: PartitionHandle,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
    },
    SyncLoad {
        entry: SyncQueueEntry,
        mode: TransitionMode,
        local_handle: PartitionHandle,
    },
}

impl PendingLocalOp {
    fn local_handle(&self) -> PartitionHandle {
        match self {
            PendingLocalOp::AuthorityLoad { local_handle, .. }
            | PendingLocalOp::AuthorityUnload { local_handle, .. }
            | PendingLocalOp::PeerLoad { local_handle, .. }
            | PendingLocalOp::PeerUnload { local_handle, .. }
            | PendingLocalOp::SyncLoad { local_handle, .. } => *local_handle,
        }
    }

    fn is_load(&self) -> bool {
        matches!(
            self,
            PendingLocalOp::AuthorityLoad { .. }
                | PendingLocalOp::PeerLoad { .. }
                | PendingLocalOp::SyncLoad { .. }
        )
    }
}

type ExclusionCheck = Box<dyn Fn(PartitionId) -> bool + Send + Sync>;
type LoadVerifier = Box<dyn Fn(PartitionId, TransitionMode) -> bool + Send + Sync>;
type ReloadCheck = Box<dyn Fn(PartitionId) -> Option<PartitionHandle> + Send + Sync>;

pub struct SceneTransitionCoordinator {
    config: SceneSyncConfig,
    node_id: NodeId,
    role: NodeRole,
    channel: Arc<dyn SceneChannel + Send + Sync>,
    engine: Arc<dyn PartitionEngine + Send + Sync>,
    catalog: PartitionCatalog,
    loaded: LoadedPartitions,
    entities: EntityStore,
    static_index: StaticEntityIndex,
    handle_table: HandleTranslationTable,
    migrations: ObjectMigrationTracker,
    progress: BTreeMap<EventProgressId, SceneEventProgress>,
    /// Single-flight gate: at most one tracked transition per node.
    active_event: Option<EventProgressId>,
    connected_peers: BTreeSet<NodeId>,
    synchronized_peers: BTreeSet<NodeId>,
    peer_sync: Option<PeerSyncState>,
    is_synchronized: bool,
    deferred_migrations: VecDeque<SceneEventRecord>,
    pending_local: Vec<PendingLocalOp>,
    /// Exclusive-teardown unloads; their completions need no further work.
    side_unloads: BTreeSet<PartitionHandle>,
    despawned_statics: Vec<StaticEntityRef>,
    notices: Vec<SceneEventNotice>,
    event_seed: u64,
    next_event_seq: u64,
    exclusion: Option<ExclusionCheck>,
    verify_load: Option<LoadVerifier>,
    reload_check: Option<ReloadCheck>,
}

impl SceneTransitionCoordinator {
    pub fn new(
        node_id: impl Into<NodeId>,
        role: NodeRole,
        config: SceneSyncConfig,
        channel: Arc<dyn SceneChannel + Send + Sync>,
        engine: Arc<dyn PartitionEngine + Send + Sync>,
    ) -> Self {
        let node_id = node_id.into();
        let event_seed = node_seed(&node_id);
        let is_synchronized = matches!(role, NodeRole::Authority);
        let entities = match role {
            NodeRole::Authority => EntityStore::new(),
            NodeRole::Peer { .. } => EntityStore::with_id_floor(PROVISIONAL_ENTITY_ID_FLOOR),
        };
        Self {
            config,
            node_id,
            role,
            channel,
            engine,
            catalog: PartitionCatalog::new(),
            loaded: LoadedPartitions::new(),
            entities,
            static_index: StaticEntityIndex::new(),
            handle_table: HandleTranslationTable::new(),
            migrations: ObjectMigrationTracker::new(),
            progress: BTreeMap::new(),
            active_event: None,
            connected_peers: BTreeSet::new(),
            synchronized_peers: BTreeSet::new(),
            peer_sync: None,
            is_synchronized,
            deferred_migrations: VecDeque::new(),
            pending_local: Vec::new(),
            side_unloads: BTreeSet::new(),
            despawned_statics: Vec::new(),
            notices: Vec::new(),
            event_seed,
            next_event_seq: 0,
            exclusion: None,
            verify_load: None,
            reload_check: None,
        }
    }

    /// Partitions the predicate rejects are skipped when building a
    /// synchronization set for a late-joining peer.
    pub fn set_partition_exclusion(
        &mut self,
        check: impl Fn(PartitionId) -> bool + Send + Sync + 'static,
    ) {
        self.exclusion = Some(Box::new(check));
    }

    /// Verification hook consulted before any load is started, on both the
    /// authority (request rejection) and peers (event abandoned, logged).
    pub fn set_load_verifier(
        &mut self,
        verify: impl Fn(PartitionId, TransitionMode) -> bool + Send + Sync + 'static,
    ) {
        self.verify_load = Some(Box::new(verify));
    }

    /// Peer-side reconnect support: when the check reports an already-loaded
    /// local instance for a synchronization entry, the physical load is
    /// skipped and post-load processing runs directly against it.
    pub fn set_reload_check(
        &mut self,
        check: impl Fn(PartitionId) -> Option<PartitionHandle> + Send + Sync + 'static,
    ) {
        self.reload_check = Some(Box::new(check));
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn role(&self) -> &NodeRole {
        &self.role
    }

    pub fn config(&self) -> &SceneSyncConfig {
        &self.config
    }

    pub fn loaded(&self) -> &LoadedPartitions {
        &self.loaded
    }

    pub fn entities(&self) -> &EntityStore {
        &self.entities
    }

    pub fn handle_table(&self) -> &HandleTranslationTable {
        &self.handle_table
    }

    pub fn catalog(&self) -> &PartitionCatalog {
        &self.catalog
    }

    pub fn is_event_active(&self) -> bool {
        self.active_event.is_some()
    }

    pub fn tracked_event_count(&self) -> usize {
        self.progress.len()
    }

    pub fn is_synchronized(&self) -> bool {
        self.is_synchronized
    }

    pub fn deferred_migration_count(&self) -> usize {
        self.deferred_migrations.len()
    }

    /// Peers that have completed their initial synchronization.
    pub fn synchronized_peers(&self) -> Vec<NodeId> {
        self.synchronized_peers.iter().cloned().collect()
    }

    pub fn register_partition(
        &mut self,
        partition_id: PartitionId,
        name: impl Into<String>,
    ) -> Result<(), SceneSyncError> {
        if !self.config.allow_runtime_partition_registration && !self.catalog.is_empty() {
            return Err(SceneSyncError::RuntimeRegistrationDisabled);
        }
        self.catalog.register(partition_id, name);
        Ok(())
    }

    pub fn drain_notices(&mut self) -> Vec<SceneEventNotice> {
        std::mem::take(&mut self.notices)
    }

    /// Entry point for one inbound scene event message.
    pub fn handle_envelope(
        &mut self,
        envelope: SceneEventEnvelope,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        if envelope.world_id != self.config.world_id {
            warn!(
                world = %envelope.world_id,
                sender = %envelope.sender_id,
                "scene event for foreign world ignored"
            );
            return Ok(());
        }
        envelope.record.validate()?;
        let sender = envelope.sender_id;
        let record = envelope.record;
        match self.role.clone() {
            NodeRole::Authority => {
                if record.event_kind.is_peer_bound() {
                    return Err(SceneSyncError::ProtocolViolation {
                        reason: format!(
                            "authority received peer-bound event {:?}",
                            record.event_kind
                        ),
                    });
                }
                match record.event_kind {
                    SceneEventKind::LoadComplete | SceneEventKind::UnloadComplete => {
                        self.handle_transition_complete(&sender, record, now_ms)
                    }
                    SceneEventKind::SynchronizeComplete => {
                        self.handle_synchronize_complete(&sender, record)
                    }
                    _ => Err(SceneSyncError::ProtocolViolation {
                        reason: format!("unroutable event {:?}", record.event_kind),
                    }),
                }
            }
            NodeRole::Peer { authority_id } => {
                if !record.event_kind.is_peer_bound() {
                    return Err(SceneSyncError::ProtocolViolation {
                        reason: format!(
                            "peer received authority-bound event {:?}",
                            record.event_kind
                        ),
                    });
                }
                if sender != authority_id {
                    warn!(sender = %sender, "scene event from non-authority sender ignored");
                    return Ok(());
                }
                match record.event_kind {
                    SceneEventKind::Load => self.handle_load(record),
                    SceneEventKind::Unload => self.handle_unload(record),
                    SceneEventKind::Synchronize => self.handle_synchronize(record),
                    SceneEventKind::ReSynchronize => self.handle_resynchronize(record),
                    SceneEventKind::LoadEventCompleted
                    | SceneEventKind::UnloadEventCompleted => {
                        self.handle_event_completed(&sender, record)
                    }
                    SceneEventKind::ActiveChanged => self.handle_active_changed(record),
                    SceneEventKind::ObjectMigrated => self.handle_object_migrated(record),
                    _ => Err(SceneSyncError::ProtocolViolation {
                        reason: format!("unroutable event {:?}", record.event_kind),
                    }),
                }
            }
        }
    }

    /// Drain a subscription and process every message in arrival order.
    pub fn pump(
        &mut self,
        subscription: &ChannelSubscription,
        now_ms: i64,
    ) -> Result<usize, SceneSyncError> {
        let messages = subscription.drain();
        let mut handled = 0;
        for bytes in messages {
            let envelope = decode_scene_event(&bytes)?;
            self.handle_envelope(envelope, now_ms)?;
            handled += 1;
        }
        Ok(handled)
    }

    /// Once-per-tick pump: engine completions, tracker timeouts, and the
    /// migration batch flush.
    pub fn tick(&mut self, now_ms: i64) -> Result<(), SceneSyncError> {
        let completions = self.engine.drain_completed();
        for completion in completions {
            self.on_engine_completion(completion, now_ms)?;
        }

        let tracked: Vec<EventProgressId> = self.progress.keys().copied().collect();
        for progress_id in tracked {
            self.try_finish_progress(progress_id, now_ms)?;
        }

        if matches!(self.role, NodeRole::Authority) {
            let entities = &self.entities;
            let flushed = self.migrations.flush(|entity_id| entities.alive(entity_id));
            if let Some(moved) = flushed {
                let record = SceneEventRecord {
                    event_kind: SceneEventKind::ObjectMigrated,
                    transition_mode: TransitionMode::Additive,
                    progress_id: None,
                    partition_id: PartitionId(0),
                    partition_handle: PartitionHandle(0),
                    payload: SceneEventPayload::Migrations { moved },
                };
                self.broadcast_to_peers(&record)?;
            }
        }
        Ok(())
    }

    fn on_engine_completion(
        &mut self,
        completion: EngineCompletion,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        match completion {
            EngineCompletion::Loaded { handle, placed, .. } => {
                let position = self
                    .pending_local
                    .iter()
                    .position(|op| op.is_load() && op.local_handle() == handle)
                    .ok_or_else(|| SceneSyncError::ProtocolViolation {
                        reason: format!("load completion for unknown handle {}", handle.0),
                    })?;
                match self.pending_local.remove(position) {
                    PendingLocalOp::AuthorityLoad {
                        progress_id,
                        partition_id,
                        mode,
                        local_handle,
                    } => self.on_authority_load_complete(
                        progress_id,
                        partition_id,
                        mode,
                        local_handle,
                        placed,
                        now_ms,
                    ),
                    PendingLocalOp::PeerLoad {
                        progress_id,
                        authority_handle,
                        partition_id,
                        mode,
                        local_handle,
                        snapshots,
                    } => self.on_peer_load_complete(
                        progress_id,
                        authority_handle,
                        partition_id,
                        mode,
                        local_handle,
                        snapshots,
                        placed,
                    ),
                    PendingLocalOp::SyncLoad {
                        entry,
                        mode,
                        local_handle,
                    } => self.on_sync_entry_loaded(entry, mode, local_handle, placed),
                    _ => Err(SceneSyncError::ProtocolViolation {
                        reason: "load completion matched an unload operation".to_string(),
                    }),
                }
            }
            EngineCompletion::Unloaded { handle } => {
                if self.side_unloads.remove(&handle) {
                    return Ok(());
                }
                let position = self
                    .pending_local
                    .iter()
                    .position(|op| !op.is_load() && op.local_handle() == handle)
                    .ok_or_else(|| SceneSyncError::ProtocolViolation {
                        reason: format!("unload completion for unknown handle {}", handle.0),
                    })?;
                match self.pending_local.remove(position) {
                    PendingLocalOp::AuthorityUnload { progress_id, .. } => {
                        self.on_authority_unload_complete(progress_id, now_ms)
                    }
                    PendingLocalOp::PeerUnload {
                        progress_id,
                        authority_handle,
                        partition_id,
                        mode,
                        local_handle,
                    } => self.on_peer_unload_complete(
                        progress_id,
                        authority_handle,
                        partition_id,
                        mode,
                        local_handle,
                    ),
                    _ => Err(SceneSyncError::ProtocolViolation {
                        reason: "unload completion matched a load operation".to_string(),
                    }),
                }
            }
        }
    }

    fn next_progress_id(&mut self) -> EventProgressId {
        self.next_event_seq += 1;
        EventProgressId::new(self.event_seed, self.next_event_seq)
    }

    fn push_notice(&mut self, notice: SceneEventNotice) {
        self.notices.push(notice);
    }

    fn phase_notice(
        &mut self,
        kind: SceneNoticeKind,
        partition_id: PartitionId,
        mode: TransitionMode,
        node_id: impl Into<NodeId>,
    ) {
        self.push_notice(SceneEventNotice::phase(kind, partition_id, mode, node_id));
    }

    fn send_to(&self, target: &str, record: SceneEventRecord) -> Result<(), SceneSyncError> {
        let envelope = SceneEventEnvelope {
            world_id: self.config.world_id.clone(),
            sender_id: self.node_id.clone(),
            record,
        };
        let bytes = encode_scene_event(&envelope)?;
        self.channel
            .publish(&topic_scene_event(&self.config.world_id, target), &bytes)
    }

    fn broadcast_to_peers(&self, record: &SceneEventRecord) -> Result<(), SceneSyncError> {
        for peer in &self.connected_peers {
            self.send_to(peer, record.clone())?;
        }
        Ok(())
    }

    fn send_to_authority(&self, record: SceneEventRecord) -> Result<(), SceneSyncError> {
        match &self.role {
            NodeRole::Peer { authority_id } => self.send_to(&authority_id.clone(), record),
            NodeRole::Authority => Err(SceneSyncError::ProtocolViolation {
                reason: "authority attempted to message itself".to_string(),
            }),
        }
    }

    /// Tear down the instance being replaced by an exclusive load.
    fn replace_exclusive_instance(&mut self) -> Result<(), SceneSyncError> {
        if let Some(old) = self.loaded.active() {
            if let Some(authority_handle) = self.handle_table.to_authority(old) {
                self.handle_table.remove(authority_handle, old)?;
            }
            self.loaded.remove(old);
            self.entities.despawn_partition(old);
            self.static_index.remove_partition(old);
            self.despawned_statics
                .retain(|origin| origin.origin_partition_handle != old);
        }
        Ok(())
    }

    /// Spawn provisional entities for a partition instance's authored
    /// content. On the authority these carry replicated identities; on peers
    /// they stay provisional until a snapshot re-binds them.
    fn register_placed(
        &mut self,
        handle: PartitionHandle,
        placed: Vec<PlacedEntityContent>,
        replicated: bool,
    ) -> Result<Vec<EntitySnapshot>, SceneSyncError> {
        let mut snapshots = Vec::new();
        for content in placed {
            let origin = StaticEntityRef {
                type_hash: content.type_hash,
                origin_partition_handle: handle,
            };
            let entity_id = self.entities.spawn(EntityRecord {
                type_hash: content.type_hash,
                partition_handle: handle,
                origin: Some(origin),
                active: true,
                destroy_with_partition: true,
                replicated,
                state_cbor: content.state_cbor,
            });
            if !self.static_index.register(content.type_hash, handle, entity_id) {
                return Err(SceneSyncError::ProtocolViolation {
                    reason: format!(
                        "duplicate static entity type {:#x} in partition instance {}",
                        content.type_hash.0, handle.0
                    ),
                });
            }
            if let Some(snapshot) = self.entities.snapshot_of(entity_id) {
                snapshots.push(snapshot);
            }
        }
        Ok(snapshots)
    }

    /// Despawn an entity outside any transition. Statically-placed entities
    /// are remembered so late joiners reproduce the despawned state.
    pub fn despawn_entity(&mut self, entity_id: EntityId) -> bool {
        let Some(record) = self.entities.despawn(entity_id) else {
            return false;
        };
        if let Some(origin) = record.origin {
            self.static_index
                .take(origin.type_hash, origin.origin_partition_handle);
            self.despawned_statics.push(origin);
        }
        true
    }
}
