//! Scene event channel abstractions (transport-agnostic).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

/// Reliable, ordered, per-topic message channel between nodes.
///
/// Implementations must preserve send order per topic. The protocol relies on
/// this for handle-table consistency.
pub trait SceneChannel<E> {
    fn publish(&self, topic: &str, payload: &[u8]) -> Result<(), E>;
    fn subscribe(&self, topic: &str) -> Result<ChannelSubscription, E>;
}

#[derive(Debug, Clone)]
pub struct ChannelSubscription {
    topic: String,
    inbox: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>,
}

impl ChannelSubscription {
    pub fn new(topic: String, inbox: Arc<Mutex<HashMap<String, Vec<Vec<u8>>>>>) -> Self {
        Self { topic, inbox }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn drain(&self) -> Vec<Vec<u8>> {
        let mut inbox = self.inbox.lock().expect("lock inbox");
        inbox.remove(&self.topic).unwrap_or_default()
    }
}
