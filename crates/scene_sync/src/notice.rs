//! Local observer notifications for transition phases.

use scene_sync_proto::{NodeId, PartitionId, TransitionMode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SceneNoticeKind {
    Started,
    PerPeerCompleted,
    AllPeersCompletedOrTimedOut,
    SynchronizeStarted,
    SynchronizeCompleted,
    ReSynchronized,
    ActiveChanged,
}

/// One in-process notification per transition phase. Observers drain these
/// from the coordinator; starting a new transition while processing a notice
/// is rejected by the single-flight gate rather than detected specially.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SceneEventNotice {
    pub kind: SceneNoticeKind,
    pub partition_id: PartitionId,
    pub mode: TransitionMode,
    /// The initiating or affected node, depending on the phase.
    pub node_id: NodeId,
    pub peers_completed: Vec<NodeId>,
    pub peers_timed_out: Vec<NodeId>,
}

impl SceneEventNotice {
    pub fn phase(
        kind: SceneNoticeKind,
        partition_id: PartitionId,
        mode: TransitionMode,
        node_id: impl Into<NodeId>,
    ) -> Self {
        Self {
            kind,
            partition_id,
            mode,
            node_id: node_id.into(),
            peers_completed: Vec::new(),
            peers_timed_out: Vec::new(),
        }
    }
}
