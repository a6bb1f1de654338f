//! Authority-side transition requests and fleet progress handling.

use tracing::warn;

use scene_sync_proto::{
    EntityId, EventProgressId, GlobalTypeHash, NodeId, PartitionHandle, PartitionId,
    SceneEventKind, SceneEventPayload, SceneEventRecord, StaticEntityRef, SyncQueueEntry,
    TransitionMode,
};

use crate::engine::PlacedEntityContent;
use crate::entities::EntityRecord;
use crate::error::SceneSyncError;
use crate::handle_table::PERSISTENT_ROOT_HANDLE;
use crate::notice::{SceneEventNotice, SceneNoticeKind};
use crate::progress::{ProgressOutcome, SceneEventProgress, TrackedEventKind};
use crate::util::progress_id_hex;

use super::{NodeRole, PendingLocalOp, SceneTransitionCoordinator};

impl SceneTransitionCoordinator {
    fn ensure_authority(&self) -> Result<(), SceneSyncError> {
        match self.role {
            NodeRole::Authority => Ok(()),
            NodeRole::Peer { .. } => Err(SceneSyncError::NotAuthority {
                node_id: self.node_id.clone(),
            }),
        }
    }

    fn ensure_enabled(&self) -> Result<(), SceneSyncError> {
        if self.config.scene_management_enabled {
            Ok(())
        } else {
            Err(SceneSyncError::SceneManagementDisabled)
        }
    }

    fn ensure_gate_free(&self) -> Result<(), SceneSyncError> {
        match self.active_event {
            Some(active) => Err(SceneSyncError::TransitionInProgress { active }),
            None => Ok(()),
        }
    }

    /// Begin loading a partition across the fleet.
    ///
    /// `Exclusive` mode conceptually replaces the world: additively loaded
    /// partitions are torn down first and entities that survive transitions
    /// are parked in the persistent root until the new partition is up.
    pub fn request_load(
        &mut self,
        partition_id: PartitionId,
        mode: TransitionMode,
        now_ms: i64,
    ) -> Result<EventProgressId, SceneSyncError> {
        self.ensure_enabled()?;
        self.ensure_authority()?;
        self.ensure_gate_free()?;
        let name = self
            .catalog
            .resolve(partition_id)
            .ok_or(SceneSyncError::UnknownPartition { partition_id })?
            .to_string();
        if let Some(verify) = &self.verify_load {
            if !verify(partition_id, mode) {
                return Err(SceneSyncError::VerificationRejected { partition_id });
            }
        }

        let progress_id = self.next_progress_id();

        if mode == TransitionMode::Exclusive {
            self.entities.sweep_for_exclusive_transition();
            self.teardown_additive_partitions()?;
        }

        let local_handle = self.engine.begin_load(partition_id, &name, mode)?;
        self.pending_local.push(PendingLocalOp::AuthorityLoad {
            progress_id,
            partition_id,
            mode,
            local_handle,
        });

        self.open_tracker(
            progress_id,
            TrackedEventKind::Load,
            partition_id,
            local_handle,
            mode,
            now_ms,
        );
        self.phase_notice(
            SceneNoticeKind::Started,
            partition_id,
            mode,
            self.node_id.clone(),
        );
        Ok(progress_id)
    }

    /// Begin unloading a partition instance across the fleet. The exclusive
    /// partition cannot be unloaded from under itself; replace it with
    /// another exclusive load instead.
    pub fn request_unload(
        &mut self,
        partition_handle: PartitionHandle,
        now_ms: i64,
    ) -> Result<EventProgressId, SceneSyncError> {
        self.ensure_enabled()?;
        self.ensure_authority()?;
        self.ensure_gate_free()?;
        let partition = self
            .loaded
            .get(partition_handle)
            .ok_or(SceneSyncError::PartitionNotLoaded { partition_handle })?;
        if self.loaded.active() == Some(partition_handle) {
            return Err(SceneSyncError::ExclusiveUnloadDenied { partition_handle });
        }

        let progress_id = self.next_progress_id();
        let record = SceneEventRecord {
            event_kind: SceneEventKind::Unload,
            transition_mode: partition.mode,
            progress_id: Some(progress_id),
            partition_id: partition.partition_id,
            partition_handle,
            payload: SceneEventPayload::None,
        };
        self.broadcast_to_peers(&record)?;

        self.loaded.remove(partition_handle);
        self.entities.despawn_partition(partition_handle);
        self.static_index.remove_partition(partition_handle);
        self.despawned_statics
            .retain(|origin| origin.origin_partition_handle != partition_handle);

        self.engine.begin_unload(partition_handle)?;
        self.pending_local.push(PendingLocalOp::AuthorityUnload {
            progress_id,
            local_handle: partition_handle,
        });

        self.open_tracker(
            progress_id,
            TrackedEventKind::Unload,
            partition.partition_id,
            partition_handle,
            partition.mode,
            now_ms,
        );
        self.phase_notice(
            SceneNoticeKind::Started,
            partition.partition_id,
            partition.mode,
            self.node_id.clone(),
        );
        Ok(progress_id)
    }

    /// Send a newly approved peer everything it needs to mirror the current
    /// world: the ordered partition queue, live entity snapshots, and the
    /// statically-placed entities that are currently despawned.
    pub fn synchronize_peer(&mut self, peer_id: &str) -> Result<(), SceneSyncError> {
        self.ensure_enabled()?;
        self.ensure_authority()?;
        self.connected_peers.insert(peer_id.to_string());

        let active = self.loaded.active();
        let mut queue = Vec::new();
        if let Some(active_handle) = active {
            if let Some(partition) = self.loaded.get(active_handle) {
                queue.push(SyncQueueEntry {
                    partition_id: partition.partition_id,
                    partition_handle: active_handle,
                });
            }
        }
        for (handle, partition) in self.loaded.iter() {
            if Some(handle) == active {
                continue;
            }
            if let Some(excluded) = &self.exclusion {
                if excluded(partition.partition_id) {
                    continue;
                }
            }
            queue.push(SyncQueueEntry {
                partition_id: partition.partition_id,
                partition_handle: handle,
            });
        }
        let Some(base) = queue.first().copied() else {
            warn!(peer = peer_id, "nothing loaded; synchronization skipped");
            return Ok(());
        };

        let snapshots = self.entities.snapshots();
        let despawned: Vec<StaticEntityRef> = self
            .despawned_statics
            .iter()
            .copied()
            .filter(|origin| self.loaded.is_loaded(origin.origin_partition_handle))
            .collect();

        let record = SceneEventRecord {
            event_kind: SceneEventKind::Synchronize,
            transition_mode: self.config.peer_sync_mode,
            progress_id: None,
            partition_id: base.partition_id,
            partition_handle: base.partition_handle,
            payload: SceneEventPayload::SynchronizeSet {
                queue,
                snapshots,
                despawned,
            },
        };
        self.send_to(peer_id, record)?;
        self.phase_notice(
            SceneNoticeKind::SynchronizeStarted,
            base.partition_id,
            self.config.peer_sync_mode,
            peer_id.to_string(),
        );
        Ok(())
    }

    /// Change which partition is the active (exclusive) one and tell peers.
    pub fn set_active_partition(
        &mut self,
        partition_handle: PartitionHandle,
    ) -> Result<(), SceneSyncError> {
        self.ensure_enabled()?;
        self.ensure_authority()?;
        let partition = self
            .loaded
            .get(partition_handle)
            .ok_or(SceneSyncError::PartitionNotLoaded { partition_handle })?;
        self.loaded.set_active(partition_handle)?;
        let record = SceneEventRecord {
            event_kind: SceneEventKind::ActiveChanged,
            transition_mode: TransitionMode::Exclusive,
            progress_id: None,
            partition_id: partition.partition_id,
            partition_handle,
            payload: SceneEventPayload::None,
        };
        self.broadcast_to_peers(&record)?;
        self.phase_notice(
            SceneNoticeKind::ActiveChanged,
            partition.partition_id,
            TransitionMode::Exclusive,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub fn peer_connected(&mut self, peer_id: &str) {
        self.connected_peers.insert(peer_id.to_string());
    }

    /// Drop a peer from the fleet. Live trackers stop expecting it so a
    /// disconnect can never block event completion.
    pub fn peer_disconnected(&mut self, peer_id: &str, now_ms: i64) -> Result<(), SceneSyncError> {
        self.connected_peers.remove(peer_id);
        self.synchronized_peers.remove(peer_id);
        let tracked: Vec<EventProgressId> = self.progress.keys().copied().collect();
        for progress_id in tracked {
            if let Some(tracker) = self.progress.get_mut(&progress_id) {
                tracker.peer_disconnected(peer_id);
            }
            self.try_finish_progress(progress_id, now_ms)?;
        }
        Ok(())
    }

    pub fn connected_peers(&self) -> Vec<NodeId> {
        self.connected_peers.iter().cloned().collect()
    }

    /// Spawn a dynamically created replicated entity.
    pub fn spawn_entity(
        &mut self,
        type_hash: GlobalTypeHash,
        partition_handle: PartitionHandle,
        destroy_with_partition: bool,
        state_cbor: Vec<u8>,
    ) -> Result<EntityId, SceneSyncError> {
        self.ensure_authority()?;
        if partition_handle != PERSISTENT_ROOT_HANDLE && !self.loaded.is_loaded(partition_handle) {
            return Err(SceneSyncError::PartitionNotLoaded { partition_handle });
        }
        Ok(self.entities.spawn(EntityRecord {
            type_hash,
            partition_handle,
            origin: None,
            active: true,
            destroy_with_partition,
            replicated: true,
            state_cbor,
        }))
    }

    /// Record a live gameplay-time partition change for an entity. Moves
    /// that happen as part of a transition are carried by the transition
    /// itself and are not queued here.
    pub fn notify_entity_partition_changed(
        &mut self,
        entity_id: EntityId,
        new_handle: PartitionHandle,
    ) -> Result<(), SceneSyncError> {
        self.ensure_authority()?;
        if !self.entities.move_to_partition(entity_id, new_handle) {
            warn!(entity = entity_id.0, "partition change for unknown entity ignored");
            return Ok(());
        }
        if self.active_event.is_none() {
            self.migrations.record(new_handle, entity_id);
        }
        Ok(())
    }

    fn open_tracker(
        &mut self,
        progress_id: EventProgressId,
        kind: TrackedEventKind,
        partition_id: PartitionId,
        partition_handle: PartitionHandle,
        mode: TransitionMode,
        now_ms: i64,
    ) {
        let tracker = SceneEventProgress::new(
            progress_id,
            kind,
            partition_id,
            partition_handle,
            mode,
            self.connected_peers.clone(),
            now_ms,
            self.config.transition_timeout_ms,
        );
        self.progress.insert(progress_id, tracker);
        self.active_event = Some(progress_id);
    }

    fn teardown_additive_partitions(&mut self) -> Result<(), SceneSyncError> {
        for handle in self.loaded.additive_handles() {
            self.engine.begin_unload(handle)?;
            self.side_unloads.insert(handle);
            self.loaded.remove(handle);
            self.entities.despawn_partition(handle);
            self.static_index.remove_partition(handle);
            self.despawned_statics
                .retain(|origin| origin.origin_partition_handle != handle);
        }
        Ok(())
    }

    pub(super) fn on_authority_load_complete(
        &mut self,
        progress_id: EventProgressId,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
        placed: Vec<PlacedEntityContent>,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        if mode == TransitionMode::Exclusive {
            self.replace_exclusive_instance()?;
        }
        self.loaded.insert(local_handle, partition_id, mode)?;
        let snapshots = self.register_placed(local_handle, placed, true)?;
        if mode == TransitionMode::Exclusive {
            self.entities.adopt_root_entities(local_handle);
        }

        let record = SceneEventRecord {
            event_kind: SceneEventKind::Load,
            transition_mode: mode,
            progress_id: Some(progress_id),
            partition_id,
            partition_handle: local_handle,
            payload: SceneEventPayload::PlacedEntities { snapshots },
        };
        self.broadcast_to_peers(&record)?;

        if let Some(tracker) = self.progress.get_mut(&progress_id) {
            tracker.mark_local_done();
        }
        self.phase_notice(
            SceneNoticeKind::PerPeerCompleted,
            partition_id,
            mode,
            self.node_id.clone(),
        );
        self.try_finish_progress(progress_id, now_ms)
    }

    pub(super) fn on_authority_unload_complete(
        &mut self,
        progress_id: EventProgressId,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        let (partition_id, mode) = match self.progress.get_mut(&progress_id) {
            Some(tracker) => {
                tracker.mark_local_done();
                (tracker.partition_id(), tracker.mode())
            }
            None => {
                warn!("unload completion for an already finalized event");
                return Ok(());
            }
        };
        self.phase_notice(
            SceneNoticeKind::PerPeerCompleted,
            partition_id,
            mode,
            self.node_id.clone(),
        );
        self.try_finish_progress(progress_id, now_ms)
    }

    pub(super) fn handle_transition_complete(
        &mut self,
        sender: &str,
        record: SceneEventRecord,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        let progress_id = record.progress_id.ok_or_else(|| {
            SceneSyncError::ProtocolViolation {
                reason: "completion without progress id".to_string(),
            }
        })?;
        let Some(tracker) = self.progress.get_mut(&progress_id) else {
            // Acknowledgements can legitimately trail a timeout finalization.
            warn!(
                sender,
                event = %progress_id_hex(&progress_id),
                "completion for an already finalized event ignored"
            );
            return Ok(());
        };
        let expected = match tracker.kind() {
            TrackedEventKind::Load => SceneEventKind::LoadComplete,
            TrackedEventKind::Unload => SceneEventKind::UnloadComplete,
        };
        if record.event_kind != expected {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!(
                    "completion kind {:?} does not match tracked event {:?}",
                    record.event_kind,
                    tracker.kind()
                ),
            });
        }
        tracker.mark_peer_done(sender);
        let partition_id = tracker.partition_id();
        let mode = tracker.mode();
        self.phase_notice(
            SceneNoticeKind::PerPeerCompleted,
            partition_id,
            mode,
            sender.to_string(),
        );
        self.try_finish_progress(progress_id, now_ms)
    }

    pub(super) fn handle_synchronize_complete(
        &mut self,
        sender: &str,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        let SceneEventPayload::ResidentEntities { entity_ids } = record.payload else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "synchronize completion without resident list".to_string(),
            });
        };
        self.synchronized_peers.insert(sender.to_string());
        self.phase_notice(
            SceneNoticeKind::SynchronizeCompleted,
            record.partition_id,
            record.transition_mode,
            sender.to_string(),
        );

        // Entities the peer holds but the authority no longer tracks have
        // drifted, usually a despawn that raced the synchronization.
        let stale: Vec<EntityId> = entity_ids
            .into_iter()
            .filter(|entity_id| !self.entities.alive(*entity_id))
            .collect();
        if stale.is_empty() || !self.config.resync_enabled {
            return Ok(());
        }
        let repair = SceneEventRecord {
            event_kind: SceneEventKind::ReSynchronize,
            transition_mode: record.transition_mode,
            progress_id: None,
            partition_id: PartitionId(0),
            partition_handle: PartitionHandle(0),
            payload: SceneEventPayload::RemoveEntities { entity_ids: stale },
        };
        self.send_to(sender, repair)?;
        self.phase_notice(
            SceneNoticeKind::ReSynchronized,
            PartitionId(0),
            record.transition_mode,
            sender.to_string(),
        );
        Ok(())
    }

    pub(super) fn try_finish_progress(
        &mut self,
        progress_id: EventProgressId,
        now_ms: i64,
    ) -> Result<(), SceneSyncError> {
        let outcome = match self.progress.get_mut(&progress_id) {
            Some(tracker) => tracker.try_finish(now_ms),
            None => None,
        };
        match outcome {
            Some(outcome) => self.finalize_progress(progress_id, outcome),
            None => Ok(()),
        }
    }

    fn finalize_progress(
        &mut self,
        progress_id: EventProgressId,
        outcome: ProgressOutcome,
    ) -> Result<(), SceneSyncError> {
        let Some(tracker) = self.progress.remove(&progress_id) else {
            return Ok(());
        };
        if self.active_event == Some(progress_id) {
            self.active_event = None;
        }

        let event_kind = match tracker.kind() {
            TrackedEventKind::Load => SceneEventKind::LoadEventCompleted,
            TrackedEventKind::Unload => SceneEventKind::UnloadEventCompleted,
        };
        let record = SceneEventRecord {
            event_kind,
            transition_mode: tracker.mode(),
            progress_id: Some(progress_id),
            partition_id: tracker.partition_id(),
            partition_handle: tracker.partition_handle(),
            payload: SceneEventPayload::ProgressDone {
                peers_completed: outcome.peers_completed.clone(),
                peers_timed_out: outcome.peers_timed_out.clone(),
            },
        };
        self.broadcast_to_peers(&record)?;

        self.push_notice(SceneEventNotice {
            kind: SceneNoticeKind::AllPeersCompletedOrTimedOut,
            partition_id: tracker.partition_id(),
            mode: tracker.mode(),
            node_id: self.node_id.clone(),
            peers_completed: outcome.peers_completed,
            peers_timed_out: outcome.peers_timed_out,
        });
        Ok(())
    }
}
