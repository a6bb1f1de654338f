//! Authority-side progress bookkeeping for one tracked transition event.

use std::collections::BTreeSet;

use scene_sync_proto::{
    EventProgressId, NodeId, PartitionHandle, PartitionId, TransitionMode,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackedEventKind {
    Load,
    Unload,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProgressOutcome {
    pub peers_completed: Vec<NodeId>,
    pub peers_timed_out: Vec<NodeId>,
    pub timed_out: bool,
}

/// Decides when an authority-initiated event is done across the fleet.
///
/// The expected peer set is snapshotted at creation. Completion fires exactly
/// once, either when every expected peer has acknowledged and the local
/// physical operation has finished, or when the timeout bound elapses first.
/// Peers that disconnect mid-event are dropped from the expected set so they
/// cannot block completion; they are reported in neither outcome list.
#[derive(Debug, Clone)]
pub struct SceneEventProgress {
    progress_id: EventProgressId,
    kind: TrackedEventKind,
    partition_id: PartitionId,
    partition_handle: PartitionHandle,
    mode: TransitionMode,
    expected_peers: BTreeSet<NodeId>,
    acknowledged: BTreeSet<NodeId>,
    local_done: bool,
    started_at_ms: i64,
    timeout_ms: i64,
    terminal: bool,
}

impl SceneEventProgress {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        progress_id: EventProgressId,
        kind: TrackedEventKind,
        partition_id: PartitionId,
        partition_handle: PartitionHandle,
        mode: TransitionMode,
        expected_peers: BTreeSet<NodeId>,
        started_at_ms: i64,
        timeout_ms: i64,
    ) -> Self {
        Self {
            progress_id,
            kind,
            partition_id,
            partition_handle,
            mode,
            expected_peers,
            acknowledged: BTreeSet::new(),
            local_done: false,
            started_at_ms,
            timeout_ms,
            terminal: false,
        }
    }

    pub fn progress_id(&self) -> EventProgressId {
        self.progress_id
    }

    pub fn kind(&self) -> TrackedEventKind {
        self.kind
    }

    pub fn partition_id(&self) -> PartitionId {
        self.partition_id
    }

    pub fn partition_handle(&self) -> PartitionHandle {
        self.partition_handle
    }

    pub fn mode(&self) -> TransitionMode {
        self.mode
    }

    pub fn is_terminal(&self) -> bool {
        self.terminal
    }

    pub fn local_done(&self) -> bool {
        self.local_done
    }

    /// Record a peer acknowledgement. Unknown peers are ignored: they either
    /// disconnected mid-event or were never part of the snapshot.
    pub fn mark_peer_done(&mut self, peer: &str) {
        if self.expected_peers.contains(peer) {
            self.acknowledged.insert(peer.to_string());
        }
    }

    pub fn mark_local_done(&mut self) {
        self.local_done = true;
    }

    pub fn peer_disconnected(&mut self, peer: &str) {
        self.expected_peers.remove(peer);
        self.acknowledged.remove(peer);
    }

    pub fn has_timed_out(&self, now_ms: i64) -> bool {
        now_ms.saturating_sub(self.started_at_ms) >= self.timeout_ms
    }

    fn all_acknowledged(&self) -> bool {
        self.acknowledged.is_superset(&self.expected_peers)
    }

    /// Transition to terminal if completion conditions hold. Returns the
    /// outcome the first (and only) time the tracker finishes.
    pub fn try_finish(&mut self, now_ms: i64) -> Option<ProgressOutcome> {
        if self.terminal {
            return None;
        }
        let natural = self.local_done && self.all_acknowledged();
        let timed_out = self.has_timed_out(now_ms);
        if !natural && !timed_out {
            return None;
        }
        self.terminal = true;
        let peers_completed: Vec<NodeId> = self.acknowledged.iter().cloned().collect();
        let peers_timed_out: Vec<NodeId> = self
            .expected_peers
            .difference(&self.acknowledged)
            .cloned()
            .collect();
        Some(ProgressOutcome {
            peers_completed,
            peers_timed_out,
            timed_out: !natural,
        })
    }
}
