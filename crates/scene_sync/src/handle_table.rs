//! Bidirectional translation between authority-local and peer-local handles.

use std::collections::BTreeMap;

use tracing::warn;

use scene_sync_proto::PartitionHandle;

use crate::error::SceneSyncError;

/// Scope for entities that outlive any single partition. The pairing for it
/// is installed at node start and never removed.
pub const PERSISTENT_ROOT_HANDLE: PartitionHandle = PartitionHandle(0);

/// Two coupled maps kept mutually inverse. Partition handles are only unique
/// within the process that issued them, so every cross-process handle use
/// goes through here.
#[derive(Debug, Clone, Default)]
pub struct HandleTranslationTable {
    authority_to_peer: BTreeMap<PartitionHandle, PartitionHandle>,
    peer_to_authority: BTreeMap<PartitionHandle, PartitionHandle>,
}

impl HandleTranslationTable {
    pub fn new() -> Self {
        let mut table = Self::default();
        table
            .authority_to_peer
            .insert(PERSISTENT_ROOT_HANDLE, PERSISTENT_ROOT_HANDLE);
        table
            .peer_to_authority
            .insert(PERSISTENT_ROOT_HANDLE, PERSISTENT_ROOT_HANDLE);
        table
    }

    /// Install a pairing. Returns false without modifying the table when
    /// either side is already mapped; the caller decides whether that means
    /// a duplicated message (ignore) or a broken invariant (fatal).
    pub fn insert(&mut self, authority: PartitionHandle, peer: PartitionHandle) -> bool {
        if self.authority_to_peer.contains_key(&authority) || self.peer_to_authority.contains_key(&peer)
        {
            warn!(
                authority = authority.0,
                peer = peer.0,
                "handle pairing rejected: one side already mapped"
            );
            return false;
        }
        self.authority_to_peer.insert(authority, peer);
        self.peer_to_authority.insert(peer, authority);
        debug_assert_eq!(self.authority_to_peer.len(), self.peer_to_authority.len());
        true
    }

    /// Remove a pairing. Both directions must currently hold exactly this
    /// pair; anything else indicates the two maps have drifted apart.
    pub fn remove(
        &mut self,
        authority: PartitionHandle,
        peer: PartitionHandle,
    ) -> Result<(), SceneSyncError> {
        if authority == PERSISTENT_ROOT_HANDLE || peer == PERSISTENT_ROOT_HANDLE {
            return Err(SceneSyncError::ProtocolViolation {
                reason: "attempted to remove the persistent root pairing".to_string(),
            });
        }
        let forward = self.authority_to_peer.get(&authority).copied();
        let backward = self.peer_to_authority.get(&peer).copied();
        if forward != Some(peer) || backward != Some(authority) {
            return Err(SceneSyncError::ProtocolViolation {
                reason: format!(
                    "handle pairing mismatch on removal: authority={} peer={} forward={:?} backward={:?}",
                    authority.0, peer.0, forward, backward
                ),
            });
        }
        self.authority_to_peer.remove(&authority);
        self.peer_to_authority.remove(&peer);
        Ok(())
    }

    pub fn to_peer(&self, authority: PartitionHandle) -> Option<PartitionHandle> {
        self.authority_to_peer.get(&authority).copied()
    }

    pub fn to_authority(&self, peer: PartitionHandle) -> Option<PartitionHandle> {
        self.peer_to_authority.get(&peer).copied()
    }

    /// Pairings excluding the persistent root.
    pub fn len(&self) -> usize {
        self.authority_to_peer.len() - 1
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pairings(&self) -> impl Iterator<Item = (PartitionHandle, PartitionHandle)> + '_ {
        self.authority_to_peer
            .iter()
            .filter(|(authority, _)| **authority != PERSISTENT_ROOT_HANDLE)
            .map(|(authority, peer)| (*authority, *peer))
    }
}
