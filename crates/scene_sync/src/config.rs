//! Per-node configuration for scene transition coordination.

use serde::{Deserialize, Serialize};

use scene_sync_proto::TransitionMode;

/// Explicit per-node configuration. Every value that was process-global in
/// earlier designs (re-synchronization switch, runtime registration switch)
/// is scoped to one node instance here.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SceneSyncConfig {
    pub world_id: String,
    pub scene_management_enabled: bool,
    /// Upper bound on waiting for peer acknowledgements, checked once per
    /// coordinator tick.
    pub transition_timeout_ms: i64,
    /// When false, drift detected in a peer's synchronization report is left
    /// unrepaired instead of triggering a `ReSynchronize`.
    pub resync_enabled: bool,
    pub allow_runtime_partition_registration: bool,
    /// How late-joining peers synchronize: `Exclusive` tears their world down
    /// first, `Additive` keeps whatever they already have loaded.
    pub peer_sync_mode: TransitionMode,
}

impl Default for SceneSyncConfig {
    fn default() -> Self {
        Self {
            world_id: "default".to_string(),
            scene_management_enabled: true,
            transition_timeout_ms: 20_000,
            resync_enabled: true,
            allow_runtime_partition_registration: true,
            peer_sync_mode: TransitionMode::Exclusive,
        }
    }
}

impl SceneSyncConfig {
    pub fn for_world(world_id: impl Into<String>) -> Self {
        Self {
            world_id: world_id.into(),
            ..Self::default()
        }
    }
}
