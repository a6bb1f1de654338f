//! Peer-side handling of inbound scene events.

use std::collections::VecDeque;

use tracing::warn;

use scene_sync_proto::{
    EntitySnapshot, EventProgressId, PartitionHandle, PartitionId, SceneEventKind,
    SceneEventPayload, SceneEventRecord, StaticEntityRef, SyncQueueEntry, TransitionMode,
};

use crate::engine::PlacedEntityContent;
use crate::entities::EntityRecord;
use crate::error::SceneSyncError;
use crate::notice::{SceneEventNotice, SceneNoticeKind};

use super::{PeerSyncState, PendingLocalOp, SceneTransitionCoordinator};

impl SceneTransitionCoordinator {
    pub(super) fn handle_load(&mut self, record: SceneEventRecord) -> Result<(), SceneSyncError> {
        let progress_id = record.progress_id.ok_or_else(|| {
            SceneSyncError::ProtocolViolation {
                reason: "load without progress id".to_string(),
            }
        })?;
        let Some(name) = self.catalog.resolve(record.partition_id).map(str::to_string) else {
            warn!(
                partition = record.partition_id.0,
                "authority requested a non-registered partition"
            );
            return Ok(());
        };
        if let Some(verify) = &self.verify_load {
            if !verify(record.partition_id, record.transition_mode) {
                warn!(
                    partition = record.partition_id.0,
                    "load rejected by local verification"
                );
                return Ok(());
            }
        }
        let SceneEventPayload::PlacedEntities { snapshots } = record.payload else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "load without placed entity payload".to_string(),
            });
        };

        // Mirror the authority's exclusive side effects before loading so
        // the two handle tables stay aligned.
        if record.transition_mode == TransitionMode::Exclusive {
            self.entities.sweep_for_exclusive_transition();
            self.peer_teardown_additive_partitions()?;
        }

        let local_handle =
            self.engine
                .begin_load(record.partition_id, &name, record.transition_mode)?;
        self.pending_local.push(PendingLocalOp::PeerLoad {
            progress_id,
            authority_handle: record.partition_handle,
            partition_id: record.partition_id,
            mode: record.transition_mode,
            local_handle,
            snapshots,
        });
        self.phase_notice(
            SceneNoticeKind::Started,
            record.partition_id,
            record.transition_mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub(super) fn handle_unload(&mut self, record: SceneEventRecord) -> Result<(), SceneSyncError> {
        let progress_id = record.progress_id.ok_or_else(|| {
            SceneSyncError::ProtocolViolation {
                reason: "unload without progress id".to_string(),
            }
        })?;
        let authority_handle = record.partition_handle;
        let local_handle = self.handle_table.to_peer(authority_handle).ok_or_else(|| {
            SceneSyncError::ProtocolViolation {
                reason: format!("no pairing for authority handle {}", authority_handle.0),
            }
        })?;
        if !self.loaded.is_loaded(local_handle) {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!("paired handle {} is not loaded", local_handle.0),
            });
        }

        self.engine.begin_unload(local_handle)?;
        self.loaded.remove(local_handle);
        self.entities.despawn_partition(local_handle);
        self.static_index.remove_partition(local_handle);
        self.pending_local.push(PendingLocalOp::PeerUnload {
            progress_id,
            authority_handle,
            partition_id: record.partition_id,
            mode: record.transition_mode,
            local_handle,
        });
        self.phase_notice(
            SceneNoticeKind::Started,
            record.partition_id,
            record.transition_mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub(super) fn handle_synchronize(
        &mut self,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        let SceneEventPayload::SynchronizeSet {
            queue,
            snapshots,
            despawned,
        } = record.payload
        else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "synchronize without partition set".to_string(),
            });
        };
        self.is_synchronized = false;
        self.peer_sync = Some(PeerSyncState {
            mode: record.transition_mode,
            base_handle: record.partition_handle,
            queue: VecDeque::from(queue),
            snapshots,
            despawned,
        });
        self.phase_notice(
            SceneNoticeKind::SynchronizeStarted,
            record.partition_id,
            record.transition_mode,
            self.node_id.clone(),
        );
        self.process_sync_queue()
    }

    /// Consume synchronization entries until one needs a physical load (the
    /// completion resumes the loop) or the queue runs dry.
    fn process_sync_queue(&mut self) -> Result<(), SceneSyncError> {
        loop {
            // A later Synchronize may have superseded the sequence this load
            // belonged to; there is nothing left to advance.
            let Some(sync) = self.peer_sync.as_mut() else {
                return Ok(());
            };
            let base_handle = sync.base_handle;
            let sync_mode = sync.mode;
            let Some(entry) = sync.queue.pop_front() else {
                return self.finalize_synchronize();
            };
            let mode = if entry.partition_handle == base_handle {
                sync_mode
            } else {
                TransitionMode::Additive
            };

            // Reconnect-without-reload: reuse a partition the peer already
            // has instead of loading a second instance.
            let reuse = self
                .reload_check
                .as_ref()
                .and_then(|check| check(entry.partition_id));
            if let Some(local_handle) = reuse {
                if !self.handle_table.insert(entry.partition_handle, local_handle) {
                    warn!(
                        authority = entry.partition_handle.0,
                        local = local_handle.0,
                        "synchronization pairing already present; duplicate delivery ignored"
                    );
                }
                if !self.loaded.is_loaded(local_handle) {
                    self.loaded.insert(local_handle, entry.partition_id, mode)?;
                }
                continue;
            }

            if mode == TransitionMode::Exclusive {
                self.entities.sweep_for_exclusive_transition();
                self.peer_teardown_additive_partitions()?;
            }

            let Some(name) = self.catalog.resolve(entry.partition_id).map(str::to_string) else {
                warn!(
                    partition = entry.partition_id.0,
                    "synchronization references a non-registered partition"
                );
                return Ok(());
            };
            let local_handle = self.engine.begin_load(entry.partition_id, &name, mode)?;
            self.pending_local.push(PendingLocalOp::SyncLoad {
                entry,
                mode,
                local_handle,
            });
            return Ok(());
        }
    }

    pub(super) fn on_sync_entry_loaded(
        &mut self,
        entry: SyncQueueEntry,
        mode: TransitionMode,
        local_handle: PartitionHandle,
        placed: Vec<PlacedEntityContent>,
    ) -> Result<(), SceneSyncError> {
        if mode == TransitionMode::Exclusive {
            self.replace_exclusive_instance()?;
        }
        self.loaded.insert(local_handle, entry.partition_id, mode)?;
        if !self.handle_table.insert(entry.partition_handle, local_handle) {
            warn!(
                authority = entry.partition_handle.0,
                local = local_handle.0,
                "synchronization pairing already present; duplicate delivery ignored"
            );
        }
        self.register_placed(local_handle, placed, false)?;
        self.process_sync_queue()
    }

    /// All partitions are in place: apply entity state, reproduce despawned
    /// statics, report residents, then replay deferred migrations in their
    /// original arrival order.
    fn finalize_synchronize(&mut self) -> Result<(), SceneSyncError> {
        let Some(sync) = self.peer_sync.take() else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "synchronization finalized without active state".to_string(),
            });
        };
        for snapshot in &sync.snapshots {
            self.apply_entity_snapshot(snapshot)?;
        }
        for origin in &sync.despawned {
            let Some(local_origin) = self.handle_table.to_peer(origin.origin_partition_handle)
            else {
                return Err(SceneSyncError::ProtocolViolation {
                    reason: format!(
                        "despawned static references unknown handle {}",
                        origin.origin_partition_handle.0
                    ),
                });
            };
            match self.static_index.take(origin.type_hash, local_origin) {
                Some(entity_id) => {
                    self.entities.despawn(entity_id);
                }
                None => warn!(
                    type_hash = origin.type_hash.0,
                    "despawned static already absent"
                ),
            }
        }

        self.is_synchronized = true;
        let record = SceneEventRecord {
            event_kind: SceneEventKind::SynchronizeComplete,
            transition_mode: sync.mode,
            progress_id: None,
            partition_id: PartitionId(0),
            partition_handle: PartitionHandle(0),
            payload: SceneEventPayload::ResidentEntities {
                entity_ids: self.entities.replicated_ids(),
            },
        };
        self.send_to_authority(record)?;
        self.phase_notice(
            SceneNoticeKind::SynchronizeCompleted,
            PartitionId(0),
            sync.mode,
            self.node_id.clone(),
        );

        let deferred: Vec<SceneEventRecord> = self.deferred_migrations.drain(..).collect();
        for record in deferred {
            self.apply_object_migrations(record)?;
        }
        Ok(())
    }

    pub(super) fn on_peer_load_complete(
        &mut self,
        progress_id: EventProgressId,
        authority_handle: PartitionHandle,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
        snapshots: Vec<EntitySnapshot>,
        placed: Vec<PlacedEntityContent>,
    ) -> Result<(), SceneSyncError> {
        if mode == TransitionMode::Exclusive {
            self.replace_exclusive_instance()?;
        }
        self.loaded.insert(local_handle, partition_id, mode)?;
        // A fresh load must produce a fresh pairing; an occupied slot means
        // a duplicated or corrupted message.
        if !self.handle_table.insert(authority_handle, local_handle) {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!(
                    "authority handle {} already paired during load",
                    authority_handle.0
                ),
            });
        }
        self.register_placed(local_handle, placed, false)?;
        if mode == TransitionMode::Exclusive {
            self.entities.adopt_root_entities(local_handle);
        }
        for snapshot in &snapshots {
            self.apply_entity_snapshot(snapshot)?;
        }

        let record = SceneEventRecord {
            event_kind: SceneEventKind::LoadComplete,
            transition_mode: mode,
            progress_id: Some(progress_id),
            partition_id,
            partition_handle: authority_handle,
            payload: SceneEventPayload::None,
        };
        self.send_to_authority(record)?;
        self.phase_notice(
            SceneNoticeKind::PerPeerCompleted,
            partition_id,
            mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub(super) fn on_peer_unload_complete(
        &mut self,
        progress_id: EventProgressId,
        authority_handle: PartitionHandle,
        partition_id: PartitionId,
        mode: TransitionMode,
        local_handle: PartitionHandle,
    ) -> Result<(), SceneSyncError> {
        self.handle_table.remove(authority_handle, local_handle)?;
        let record = SceneEventRecord {
            event_kind: SceneEventKind::UnloadComplete,
            transition_mode: mode,
            progress_id: Some(progress_id),
            partition_id,
            partition_handle: authority_handle,
            payload: SceneEventPayload::None,
        };
        self.send_to_authority(record)?;
        self.phase_notice(
            SceneNoticeKind::PerPeerCompleted,
            partition_id,
            mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub(super) fn handle_resynchronize(
        &mut self,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        let SceneEventPayload::RemoveEntities { entity_ids } = record.payload else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "resynchronize without removal list".to_string(),
            });
        };
        for entity_id in entity_ids {
            if self.entities.despawn(entity_id).is_none() {
                warn!(entity = entity_id.0, "resynchronize removal already absent");
            }
        }
        self.phase_notice(
            SceneNoticeKind::ReSynchronized,
            record.partition_id,
            record.transition_mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    pub(super) fn handle_event_completed(
        &mut self,
        sender: &str,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        let SceneEventPayload::ProgressDone {
            peers_completed,
            peers_timed_out,
        } = record.payload
        else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "event completion without peer lists".to_string(),
            });
        };
        self.push_notice(SceneEventNotice {
            kind: SceneNoticeKind::AllPeersCompletedOrTimedOut,
            partition_id: record.partition_id,
            mode: record.transition_mode,
            node_id: sender.to_string(),
            peers_completed,
            peers_timed_out,
        });
        Ok(())
    }

    pub(super) fn handle_active_changed(
        &mut self,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        let authority_handle = record.partition_handle;
        let local_handle = self.handle_table.to_peer(authority_handle).ok_or_else(|| {
            SceneSyncError::ProtocolViolation {
                reason: format!(
                    "active partition references unknown handle {}",
                    authority_handle.0
                ),
            }
        })?;
        self.loaded.set_active(local_handle)?;
        self.phase_notice(
            SceneNoticeKind::ActiveChanged,
            record.partition_id,
            record.transition_mode,
            self.node_id.clone(),
        );
        Ok(())
    }

    /// Migrations arriving before the peer has finished synchronizing are
    /// buffered; applying them early could reference entities that are not
    /// instantiated locally yet.
    pub(super) fn handle_object_migrated(
        &mut self,
        record: SceneEventRecord,
    ) -> Result<(), SceneSyncError> {
        if !self.is_synchronized {
            self.deferred_migrations.push_back(record);
            return Ok(());
        }
        self.apply_object_migrations(record)
    }

    fn apply_object_migrations(&mut self, record: SceneEventRecord) -> Result<(), SceneSyncError> {
        let SceneEventPayload::Migrations { moved } = record.payload else {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "migration record without table".to_string(),
            });
        };
        for group in moved {
            let Some(local_handle) = self.handle_table.to_peer(group.partition_handle) else {
                warn!(
                    authority = group.partition_handle.0,
                    "migration for unknown partition handle skipped"
                );
                continue;
            };
            for entity_id in group.entity_ids {
                if !self.entities.move_to_partition(entity_id, local_handle) {
                    warn!(entity = entity_id.0, "migration for unknown entity skipped");
                }
            }
        }
        Ok(())
    }

    /// Mirror of the authority's exclusive teardown, additionally dropping
    /// the handle pairings for each partition that goes away.
    fn peer_teardown_additive_partitions(&mut self) -> Result<(), SceneSyncError> {
        for local_handle in self.loaded.additive_handles() {
            if let Some(authority_handle) = self.handle_table.to_authority(local_handle) {
                self.handle_table.remove(authority_handle, local_handle)?;
            }
            self.engine.begin_unload(local_handle)?;
            self.side_unloads.insert(local_handle);
            self.loaded.remove(local_handle);
            self.entities.despawn_partition(local_handle);
            self.static_index.remove_partition(local_handle);
        }
        Ok(())
    }

    /// Bind one authority snapshot to local state, translating every handle
    /// it references. Re-applying a snapshot for an entity that is already
    /// resident is a no-op so duplicated synchronization data cannot spawn
    /// twins.
    fn apply_entity_snapshot(&mut self, snapshot: &EntitySnapshot) -> Result<(), SceneSyncError> {
        if self.entities.alive(snapshot.entity_id) {
            return Ok(());
        }
        let local_partition = self
            .handle_table
            .to_peer(snapshot.partition_handle)
            .ok_or_else(|| SceneSyncError::ProtocolViolation {
                reason: format!(
                    "snapshot references unknown partition handle {}",
                    snapshot.partition_handle.0
                ),
            })?;
        match snapshot.origin {
            Some(origin) => {
                let local_origin = self
                    .handle_table
                    .to_peer(origin.origin_partition_handle)
                    .ok_or_else(|| SceneSyncError::ProtocolViolation {
                        reason: format!(
                            "snapshot origin references unknown handle {}",
                            origin.origin_partition_handle.0
                        ),
                    })?;
                let provisional = self
                    .static_index
                    .take(origin.type_hash, local_origin)
                    .ok_or_else(|| SceneSyncError::ProtocolViolation {
                        reason: format!(
                            "no static instance for type {:#x} in partition {}",
                            origin.type_hash.0, local_origin.0
                        ),
                    })?;
                let placed = self.entities.despawn(provisional).ok_or_else(|| {
                    SceneSyncError::ProtocolViolation {
                        reason: format!("static instance {} vanished", provisional.0),
                    }
                })?;
                self.entities.spawn_with_id(
                    snapshot.entity_id,
                    EntityRecord {
                        type_hash: snapshot.type_hash,
                        partition_handle: local_partition,
                        origin: Some(StaticEntityRef {
                            type_hash: origin.type_hash,
                            origin_partition_handle: local_origin,
                        }),
                        active: snapshot.active,
                        destroy_with_partition: placed.destroy_with_partition,
                        replicated: true,
                        state_cbor: snapshot.state_cbor.clone(),
                    },
                )?;
            }
            None => {
                self.entities.spawn_with_id(
                    snapshot.entity_id,
                    EntityRecord {
                        type_hash: snapshot.type_hash,
                        partition_handle: local_partition,
                        origin: None,
                        active: snapshot.active,
                        destroy_with_partition: true,
                        replicated: true,
                        state_cbor: snapshot.state_cbor.clone(),
                    },
                )?;
            }
        }
        Ok(())
    }
}
