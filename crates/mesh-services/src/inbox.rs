use dashmap::DashMap;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::broadcast;

use mesh_core::GossipMessage;

const SUBSCRIBER_BACKLOG: usize = 256;
const DEFAULT_HISTORY: usize = 256;

/// Recent messages delivered to this node, grouped by originator, plus a
/// live feed for the console.
#[derive(Clone)]
pub struct Inbox {
    /// Messages per originator: "host:port" -> newest `history` deliveries in order
    messages: Arc<DashMap<String, VecDeque<GossipMessage>>>,
    history: usize,
    feed: broadcast::Sender<GossipMessage>,
}

impl Default for Inbox {
    fn default() -> Self {
        Self::new()
    }
}

impl Inbox {
    pub fn new() -> Self {
        Self::with_history(DEFAULT_HISTORY)
    }

    /// Keep at most `history` messages per originator.
    pub fn with_history(history: usize) -> Self {
        let (feed, _) = broadcast::channel(SUBSCRIBER_BACKLOG);
        Self {
            messages: Arc::new(DashMap::new()),
            history: history.max(1),
            feed,
        }
    }

    /// Record a delivered message and publish it to subscribers
    pub fn deliver(&self, message: GossipMessage) {
        {
            let mut kept = self.messages.entry(message.originator.clone()).or_default();
            if kept.len() == self.history {
                kept.pop_front();
            }
            kept.push_back(message.clone());
        }
        // No subscribers is fine
        let _ = self.feed.send(message);
    }

    /// Live feed of deliveries from now on
    pub fn subscribe(&self) -> broadcast::Receiver<GossipMessage> {
        self.feed.subscribe()
    }

    /// Retained messages from one originator, oldest first
    pub fn get(&self, originator: &str) -> Vec<GossipMessage> {
        self.messages
            .get(originator)
            .map(|msgs| msgs.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Count messages from one originator
    pub fn count_from(&self, originator: &str) -> usize {
        self.messages
            .get(originator)
            .map(|msgs| msgs.len())
            .unwrap_or(0)
    }

    /// Count of every retained message
    pub fn total(&self) -> usize {
        self.messages.iter().map(|e| e.value().len()).sum()
    }

    /// How many times `message_id` was delivered
    pub fn deliveries_of(&self, message_id: &str) -> usize {
        self.messages
            .iter()
            .map(|e| e.value().iter().filter(|m| m.message_id == message_id).count())
            .sum()
    }
}
