//! Distributed world-partition transition coordination.
//!
//! One authority node decides which partitions are loaded; peer nodes mirror
//! that state through the scene event protocol. Handles are process-local and
//! are only ever compared across nodes after translation.

mod config;
mod coordinator;
mod engine;
mod entities;
mod error;
mod handle_table;
mod migration;
mod notice;
mod progress;
mod registry;
mod sync_channel;
mod util;

pub use config::SceneSyncConfig;
pub use coordinator::{NodeRole, SceneChannel, SceneTransitionCoordinator};
pub use engine::{EngineCompletion, InMemoryPartitionEngine, PartitionEngine, PlacedEntityContent};
pub use entities::{EntityRecord, EntityStore, StaticEntityIndex};
pub use error::SceneSyncError;
pub use handle_table::{HandleTranslationTable, PERSISTENT_ROOT_HANDLE};
pub use migration::ObjectMigrationTracker;
pub use notice::{SceneEventNotice, SceneNoticeKind};
pub use progress::{ProgressOutcome, SceneEventProgress, TrackedEventKind};
pub use registry::{LoadedPartition, LoadedPartitions, PartitionCatalog};
pub use scene_sync_proto::{
    ChannelSubscription, EntityId, EntitySnapshot, EventProgressId, GlobalTypeHash, NodeId,
    PartitionHandle, PartitionId, PartitionMigrations, SceneEventEnvelope, SceneEventKind,
    SceneEventPayload, SceneEventRecord, StaticEntityRef, SyncQueueEntry, TransitionMode,
};
pub use sync_channel::{InMemorySceneChannel, PublishedMessage};
pub use util::{read_json_from_path, write_json_to_path};
