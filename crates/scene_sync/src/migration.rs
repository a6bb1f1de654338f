//! Batched notifications of entities changing their owning partition.

use std::collections::BTreeMap;

use scene_sync_proto::{EntityId, PartitionHandle, PartitionMigrations};

/// Queues partition-change notifications so one `ObjectMigrated` broadcast
/// per tick covers every live gameplay-time move, instead of one message per
/// entity. An entity recorded twice between flushes keeps only its most
/// recent destination.
#[derive(Debug, Clone, Default)]
pub struct ObjectMigrationTracker {
    queued: BTreeMap<PartitionHandle, Vec<EntityId>>,
}

impl ObjectMigrationTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, partition_handle: PartitionHandle, entity_id: EntityId) {
        for entities in self.queued.values_mut() {
            entities.retain(|queued| *queued != entity_id);
        }
        self.queued.entry(partition_handle).or_default().push(entity_id);
    }

    pub fn is_empty(&self) -> bool {
        self.queued.values().all(|entities| entities.is_empty())
    }

    /// Once-per-tick flush: prune entities no longer alive, drop empty
    /// per-partition queues, and emit the remainder. The queue is cleared on
    /// emission; `None` means there was nothing worth broadcasting.
    pub fn flush(&mut self, alive: impl Fn(EntityId) -> bool) -> Option<Vec<PartitionMigrations>> {
        let mut moved = Vec::new();
        for (partition_handle, entities) in std::mem::take(&mut self.queued) {
            let entity_ids: Vec<EntityId> =
                entities.into_iter().filter(|id| alive(*id)).collect();
            if entity_ids.is_empty() {
                continue;
            }
            moved.push(PartitionMigrations {
                partition_handle,
                entity_ids,
            });
        }
        if moved.is_empty() {
            None
        } else {
            Some(moved)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flush_groups_entities_by_partition() {
        let mut tracker = ObjectMigrationTracker::new();
        tracker.record(PartitionHandle(1), EntityId(10));
        tracker.record(PartitionHandle(1), EntityId(11));
        tracker.record(PartitionHandle(2), EntityId(12));
        let moved = tracker.flush(|_| true).expect("queued moves");
        assert_eq!(moved.len(), 2);
        assert_eq!(moved[0].partition_handle, PartitionHandle(1));
        assert_eq!(moved[0].entity_ids, vec![EntityId(10), EntityId(11)]);
        assert_eq!(moved[1].entity_ids, vec![EntityId(12)]);
        assert!(tracker.is_empty());
    }

    #[test]
    fn flush_prunes_dead_entities_and_empty_partitions() {
        let mut tracker = ObjectMigrationTracker::new();
        tracker.record(PartitionHandle(1), EntityId(10));
        tracker.record(PartitionHandle(2), EntityId(11));
        let moved = tracker
            .flush(|id| id == EntityId(11))
            .expect("one survivor");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].partition_handle, PartitionHandle(2));
    }

    #[test]
    fn flush_returns_none_when_nothing_queued() {
        let mut tracker = ObjectMigrationTracker::new();
        assert!(tracker.flush(|_| true).is_none());
        tracker.record(PartitionHandle(1), EntityId(10));
        assert!(tracker.flush(|_| false).is_none());
        assert!(tracker.is_empty());
    }

    #[test]
    fn rerecorded_entity_keeps_only_latest_destination() {
        let mut tracker = ObjectMigrationTracker::new();
        tracker.record(PartitionHandle(1), EntityId(10));
        tracker.record(PartitionHandle(2), EntityId(10));
        let moved = tracker.flush(|_| true).expect("queued moves");
        assert_eq!(moved.len(), 1);
        assert_eq!(moved[0].partition_handle, PartitionHandle(2));
        assert_eq!(moved[0].entity_ids, vec![EntityId(10)]);
    }
}
