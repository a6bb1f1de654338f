//! Utility helpers shared across the runtime.

use std::fs;
use std::path::Path;

use serde::de::DeserializeOwned;
use serde::Serialize;

use scene_sync_proto::EventProgressId;

use crate::error::SceneSyncError;

/// Derive a stable 64-bit seed from a node identifier. Used as the high half
/// of every `EventProgressId` the node generates.
pub fn node_seed(node_id: &str) -> u64 {
    let digest = blake3::hash(node_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest.as_bytes()[..8]);
    u64::from_le_bytes(bytes)
}

pub fn progress_id_hex(id: &EventProgressId) -> String {
    hex::encode(id.as_u128().to_be_bytes())
}

/// Write a serializable value to a JSON file.
pub fn write_json_to_path<T: Serialize>(value: &T, path: &Path) -> Result<(), SceneSyncError> {
    let data = serde_json::to_vec_pretty(value)?;
    fs::write(path, data)?;
    Ok(())
}

/// Read a JSON file and deserialize it.
pub fn read_json_from_path<T: DeserializeOwned>(path: &Path) -> Result<T, SceneSyncError> {
    let data = fs::read(path)?;
    Ok(serde_json::from_slice(&data)?)
}
