//! Point-to-point message delivery between agents.
//!
//! A transport sends messages to remote agents with bounded retries and
//! exposes a local inbound buffer filled by its listener. Receiving never
//! suspends: `receive()` returns `None` when the buffer is empty and the
//! caller decides how long to wait before polling again.

mod http;
mod memory;
pub mod retry;
mod server;

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{DeliveryError, TransportError};
use crate::protocol::Message;

pub use http::HttpTransport;
pub use memory::{DeliveryAttempt, MemoryNetwork, MemoryTransport};
pub use retry::RetryPolicy;
pub use server::ListenerServer;

/// A delivery as it arrived from the network, not yet validated.
#[derive(Debug, Clone)]
pub struct Inbound {
    /// Transport-assigned id used to acknowledge the delivery.
    pub delivery_id: String,
    pub body: serde_json::Value,
    pub received_at: DateTime<Utc>,
}

impl Inbound {
    pub fn new(body: serde_json::Value) -> Self {
        Self {
            delivery_id: Uuid::new_v4().to_string(),
            body,
            received_at: Utc::now(),
        }
    }
}

/// Callback invoked by a listener for every arrived delivery.
pub type InboundReceiver = Arc<dyn Fn(&Inbound) + Send + Sync>;

/// Trait for agent transports.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Canonical address of this transport (`scheme://host:port`).
    ///
    /// This is the value placed in `reply_to` and `agent_url`; callers never
    /// build it themselves.
    fn url(&self) -> String;

    /// Bring up the inbound listener. Failing here is fatal for the agent.
    async fn start(&self) -> Result<(), TransportError>;

    /// Deliver a message, retrying with exponential backoff.
    ///
    /// Returns the receiver's immediate reply.
    async fn send(&self, url: &str, message: &Message)
    -> Result<serde_json::Value, DeliveryError>;

    /// Take the oldest buffered delivery, if any. Never blocks.
    fn receive(&self) -> Option<Inbound>;

    /// Register a callback invoked for every delivery, in arrival order.
    fn register_receiver(&self, receiver: InboundReceiver);

    /// Mark a delivery as fully handled.
    async fn acknowledge(&self, delivery_id: &str) -> Result<(), TransportError>;

    /// Stop the listener.
    async fn shutdown(&self) -> Result<(), TransportError> {
        Ok(())
    }
}

/// FIFO buffer between a listener and the processing loop.
///
/// Also tracks deliveries that were handed out but not yet acknowledged.
#[derive(Default)]
pub struct InboundQueue {
    buffer: Mutex<VecDeque<Inbound>>,
    unacked: Mutex<HashMap<String, DateTime<Utc>>>,
    receivers: RwLock<Vec<InboundReceiver>>,
}

impl InboundQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffer a delivery and notify registered receivers.
    pub fn push(&self, inbound: Inbound) {
        self.unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(inbound.delivery_id.clone(), inbound.received_at);

        let receivers = self
            .receivers
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        for receiver in &receivers {
            receiver(&inbound);
        }

        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push_back(inbound);
    }

    pub fn pop(&self) -> Option<Inbound> {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop_front()
    }

    pub fn len(&self) -> usize {
        self.buffer
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn add_receiver(&self, receiver: InboundReceiver) {
        self.receivers
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .push(receiver);
    }

    /// Returns false if the delivery was unknown or already acknowledged.
    pub fn acknowledge(&self, delivery_id: &str) -> bool {
        self.unacked
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(delivery_id)
            .is_some()
    }

    /// Deliveries not yet acknowledged, oldest first.
    pub fn unacknowledged(&self) -> Vec<String> {
        let unacked = self.unacked.lock().unwrap_or_else(PoisonError::into_inner);
        let mut ids: Vec<_> = unacked.iter().collect();
        ids.sort_by_key(|(_, at)| **at);
        ids.into_iter().map(|(id, _)| id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use serde_json::json;

    use super::*;

    #[test]
    fn test_inbound_queue_is_fifo() {
        let queue = InboundQueue::new();
        queue.push(Inbound::new(json!({"n": 1})));
        queue.push(Inbound::new(json!({"n": 2})));

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.pop().unwrap().body["n"], 1);
        assert_eq!(queue.pop().unwrap().body["n"], 2);
        assert!(queue.pop().is_none());
        assert!(queue.is_empty());
    }

    #[test]
    fn test_acknowledge_tracks_unacked_deliveries() {
        let queue = InboundQueue::new();
        let first = Inbound::new(json!({}));
        let second = Inbound::new(json!({}));
        let (first_id, second_id) = (first.delivery_id.clone(), second.delivery_id.clone());
        queue.push(first);
        queue.push(second);

        assert_eq!(queue.unacknowledged().len(), 2);
        assert!(queue.acknowledge(&first_id));
        assert!(!queue.acknowledge(&first_id));
        assert_eq!(queue.unacknowledged(), vec![second_id]);
    }

    #[test]
    fn test_receivers_see_every_delivery() {
        let queue = InboundQueue::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&seen);
        queue.add_receiver(Arc::new(move |_inbound: &Inbound| {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        queue.push(Inbound::new(json!({})));
        queue.push(Inbound::new(json!({})));

        assert_eq!(seen.load(Ordering::SeqCst), 2);
        // Receivers observe but do not consume.
        assert_eq!(queue.len(), 2);
    }
}
