//! Seam to the physical partition-loading engine.
//!
//! Loading and unloading are the only suspending operations in the protocol.
//! The engine reports completion through `drain_completed`; the coordinator
//! never polls internal progress beyond done-or-not-done.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use scene_sync_proto::{GlobalTypeHash, PartitionHandle, PartitionId, TransitionMode};

use crate::error::SceneSyncError;

/// Statically-placed entity content discovered when a partition instance
/// finishes loading.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlacedEntityContent {
    pub type_hash: GlobalTypeHash,
    pub state_cbor: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCompletion {
    Loaded {
        partition_id: PartitionId,
        handle: PartitionHandle,
        placed: Vec<PlacedEntityContent>,
    },
    Unloaded {
        handle: PartitionHandle,
    },
}

pub trait PartitionEngine {
    /// Begin loading; the returned handle is reserved immediately, the
    /// instance becomes usable once the matching completion is drained.
    fn begin_load(
        &self,
        partition_id: PartitionId,
        name: &str,
        mode: TransitionMode,
    ) -> Result<PartitionHandle, SceneSyncError>;

    fn begin_unload(&self, handle: PartitionHandle) -> Result<(), SceneSyncError>;

    fn drain_completed(&self) -> Vec<EngineCompletion>;
}

#[derive(Debug, Clone)]
enum PendingOp {
    Load {
        partition_id: PartitionId,
        handle: PartitionHandle,
    },
    Unload {
        handle: PartitionHandle,
    },
}

#[derive(Debug, Default)]
struct EngineInner {
    next_handle: i32,
    immediate: bool,
    pending: VecDeque<PendingOp>,
    completed: Vec<EngineCompletion>,
    placed_content: Vec<(PartitionId, Vec<PlacedEntityContent>)>,
}

impl EngineInner {
    fn complete_next(&mut self) -> bool {
        let Some(op) = self.pending.pop_front() else {
            return false;
        };
        let completion = match op {
            PendingOp::Load {
                partition_id,
                handle,
            } => EngineCompletion::Loaded {
                partition_id,
                handle,
                placed: self
                    .placed_content
                    .iter()
                    .find(|(id, _)| *id == partition_id)
                    .map(|(_, placed)| placed.clone())
                    .unwrap_or_default(),
            },
            PendingOp::Unload { handle } => EngineCompletion::Unloaded { handle },
        };
        self.completed.push(completion);
        true
    }
}

/// Test double. Operations stay pending until `complete_next`/`complete_all`
/// unless immediate mode is on. Placed content is configured per partition id
/// so loads reproduce authored static entities.
#[derive(Debug, Clone, Default)]
pub struct InMemoryPartitionEngine {
    inner: Arc<Mutex<EngineInner>>,
}

impl InMemoryPartitionEngine {
    pub fn new() -> Self {
        Self::with_handle_floor(1)
    }

    /// Handles issued by this engine start at `floor` so two nodes in one
    /// test never produce numerically equal handles by accident.
    pub fn with_handle_floor(floor: i32) -> Self {
        let engine = Self::default();
        engine.inner.lock().expect("lock engine").next_handle = floor;
        engine
    }

    pub fn immediate() -> Self {
        let engine = Self::new();
        engine.inner.lock().expect("lock engine").immediate = true;
        engine
    }

    pub fn set_placed_content(&self, partition_id: PartitionId, placed: Vec<PlacedEntityContent>) {
        let mut inner = self.inner.lock().expect("lock engine");
        inner.placed_content.retain(|(id, _)| *id != partition_id);
        inner.placed_content.push((partition_id, placed));
    }

    pub fn pending_count(&self) -> usize {
        self.inner.lock().expect("lock engine").pending.len()
    }

    /// Finish the oldest pending operation. Returns false when idle.
    pub fn complete_next(&self) -> bool {
        self.inner.lock().expect("lock engine").complete_next()
    }

    pub fn complete_all(&self) {
        let mut inner = self.inner.lock().expect("lock engine");
        while inner.complete_next() {}
    }
}

impl PartitionEngine for InMemoryPartitionEngine {
    fn begin_load(
        &self,
        partition_id: PartitionId,
        _name: &str,
        _mode: TransitionMode,
    ) -> Result<PartitionHandle, SceneSyncError> {
        let mut inner = self.inner.lock().expect("lock engine");
        let handle = PartitionHandle(inner.next_handle);
        inner.next_handle += 1;
        inner.pending.push_back(PendingOp::Load {
            partition_id,
            handle,
        });
        if inner.immediate {
            inner.complete_next();
        }
        Ok(handle)
    }

    fn begin_unload(&self, handle: PartitionHandle) -> Result<(), SceneSyncError> {
        let mut inner = self.inner.lock().expect("lock engine");
        inner.pending.push_back(PendingOp::Unload { handle });
        if inner.immediate {
            inner.complete_next();
        }
        Ok(())
    }

    fn drain_completed(&self) -> Vec<EngineCompletion> {
        let mut inner = self.inner.lock().expect("lock engine");
        std::mem::take(&mut inner.completed)
    }
}
