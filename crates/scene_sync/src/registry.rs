//! Partition catalog and the per-node registry of loaded instances.

use std::collections::BTreeMap;

use scene_sync_proto::{PartitionHandle, PartitionId, TransitionMode};

use crate::error::SceneSyncError;
use crate::handle_table::PERSISTENT_ROOT_HANDLE;

/// Registered partition identities. An identifier must resolve here before a
/// transition involving it is accepted.
#[derive(Debug, Clone, Default)]
pub struct PartitionCatalog {
    names: BTreeMap<PartitionId, String>,
}

impl PartitionCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, partition_id: PartitionId, name: impl Into<String>) {
        self.names.insert(partition_id, name.into());
    }

    pub fn resolve(&self, partition_id: PartitionId) -> Option<&str> {
        self.names.get(&partition_id).map(String::as_str)
    }

    pub fn contains(&self, partition_id: PartitionId) -> bool {
        self.names.contains_key(&partition_id)
    }

    pub fn len(&self) -> usize {
        self.names.len()
    }

    pub fn is_empty(&self) -> bool {
        self.names.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadedPartition {
    pub partition_id: PartitionId,
    pub mode: TransitionMode,
}

/// Per-node registry of loaded partition instances, keyed by the handles the
/// partition engine issued. Handles are process-local indices and are
/// meaningless elsewhere. The same partition id may be live under several
/// handles (repeated additive load).
#[derive(Debug, Clone, Default)]
pub struct LoadedPartitions {
    loaded: BTreeMap<PartitionHandle, LoadedPartition>,
    active: Option<PartitionHandle>,
}

impl LoadedPartitions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(
        &mut self,
        handle: PartitionHandle,
        partition_id: PartitionId,
        mode: TransitionMode,
    ) -> Result<(), SceneSyncError> {
        if handle == PERSISTENT_ROOT_HANDLE || self.loaded.contains_key(&handle) {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!("partition handle {} already registered", handle.0),
            });
        }
        self.loaded.insert(handle, LoadedPartition { partition_id, mode });
        if mode == TransitionMode::Exclusive {
            self.active = Some(handle);
        }
        Ok(())
    }

    pub fn remove(&mut self, handle: PartitionHandle) -> Option<LoadedPartition> {
        if self.active == Some(handle) {
            self.active = None;
        }
        self.loaded.remove(&handle)
    }

    pub fn get(&self, handle: PartitionHandle) -> Option<LoadedPartition> {
        self.loaded.get(&handle).copied()
    }

    pub fn is_loaded(&self, handle: PartitionHandle) -> bool {
        self.loaded.contains_key(&handle)
    }

    pub fn active(&self) -> Option<PartitionHandle> {
        self.active
    }

    pub fn set_active(&mut self, handle: PartitionHandle) -> Result<(), SceneSyncError> {
        if !self.is_loaded(handle) {
            return Err(SceneSyncError::PartitionNotLoaded {
                partition_handle: handle,
            });
        }
        self.active = Some(handle);
        Ok(())
    }

    pub fn handles_for(&self, partition_id: PartitionId) -> Vec<PartitionHandle> {
        self.loaded
            .iter()
            .filter(|(_, partition)| partition.partition_id == partition_id)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn additive_handles(&self) -> Vec<PartitionHandle> {
        self.loaded
            .iter()
            .filter(|(_, partition)| partition.mode == TransitionMode::Additive)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (PartitionHandle, LoadedPartition)> + '_ {
        self.loaded.iter().map(|(handle, partition)| (*handle, *partition))
    }

    pub fn len(&self) -> usize {
        self.loaded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.loaded.is_empty()
    }
}
