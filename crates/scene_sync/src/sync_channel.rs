//! In-memory scene event channel for tests and single-process topologies.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use scene_sync_proto::sync_net::{ChannelSubscription, SceneChannel};

use crate::error::SceneSyncError;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Clone, Default)]
pub struct InMemorySceneChannel {
    inbox: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
    published: Arc<Mutex<Vec<PublishedMessage>>>,
}

impl InMemorySceneChannel {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn published(&self) -> Vec<PublishedMessage> {
        self.published.lock().expect("lock published").clone()
    }
}

impl SceneChannel<SceneSyncError> for InMemorySceneChannel {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), SceneSyncError> {
        {
            let mut published = self.published.lock().expect("lock published");
            published.push(PublishedMessage {
                topic: topic.to_string(),
                payload: payload.to_vec(),
            });
        }
        let mut inbox = self.inbox.lock().expect("lock inbox");
        inbox.entry(topic.to_string()).or_default().push(payload.to_vec());
        Ok(())
    }

    fn subscribe(&self, topic: &str) -> Result<ChannelSubscription, SceneSyncError> {
        let mut inbox = self.inbox.lock().expect("lock inbox");
        inbox.entry(topic.to_string()).or_default();
        Ok(ChannelSubscription::new(
            topic.to_string(),
            Arc::clone(&self.inbox),
        ))
    }
}
