//! In-process transport.
//!
//! Agents sharing a [`MemoryNetwork`] exchange messages through each other's
//! inbound buffers with the same retry semantics as the HTTP transport. The
//! network records every delivery attempt so tests can assert on traffic.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Instant;

use async_trait::async_trait;
use serde_json::json;

use crate::error::{DeliveryError, TransportError};
use crate::protocol::{Message, MessageType};
use crate::transport::retry::{AttemptError, RetryPolicy, deliver_with_retry};
use crate::transport::{Inbound, InboundQueue, InboundReceiver, Transport};

/// One send attempt observed by the network.
#[derive(Debug, Clone)]
pub struct DeliveryAttempt {
    pub url: String,
    pub message: Message,
    pub delivered: bool,
    pub at: Instant,
}

#[derive(Default)]
struct NetworkState {
    endpoints: RwLock<HashMap<String, Arc<InboundQueue>>>,
    /// Remaining injected failures per URL.
    failures: Mutex<HashMap<String, u32>>,
    attempts: Mutex<Vec<DeliveryAttempt>>,
}

/// Shared medium connecting in-memory transports.
#[derive(Clone, Default)]
pub struct MemoryNetwork {
    state: Arc<NetworkState>,
}

impl MemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a transport reachable at `memory://{name}` once started.
    pub fn transport(&self, name: &str) -> MemoryTransport {
        MemoryTransport {
            network: self.clone(),
            url: format!("memory://{}", name),
            inbound: Arc::new(InboundQueue::new()),
            policy: RetryPolicy::none(),
        }
    }

    /// Make the next `count` attempts to `url` fail with a 503.
    pub fn fail_next(&self, url: &str, count: u32) {
        self.state
            .failures
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(normalize(url), count);
    }

    /// Every attempt made so far, in order.
    pub fn attempts(&self) -> Vec<DeliveryAttempt> {
        self.state
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Attempts addressed to `url`.
    pub fn attempts_to(&self, url: &str) -> Vec<DeliveryAttempt> {
        let url = normalize(url);
        self.attempts()
            .into_iter()
            .filter(|a| a.url == url)
            .collect()
    }

    /// Successful deliveries of the given type addressed to `url`.
    pub fn delivered_to(&self, url: &str, kind: MessageType) -> Vec<Message> {
        self.attempts_to(url)
            .into_iter()
            .filter(|a| a.delivered && a.message.message_type() == kind)
            .map(|a| a.message)
            .collect()
    }

    fn bind(&self, url: &str, inbound: Arc<InboundQueue>) {
        self.state
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(url.to_string(), inbound);
    }

    fn unbind(&self, url: &str) {
        self.state
            .endpoints
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(url);
    }

    fn deliver(&self, url: &str, message: Message) -> Result<serde_json::Value, AttemptError> {
        let url = normalize(url);
        let injected = {
            let mut failures = self
                .state
                .failures
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match failures.get_mut(&url) {
                Some(remaining) if *remaining > 0 => {
                    *remaining -= 1;
                    true
                }
                _ => false,
            }
        };

        let endpoint = self
            .state
            .endpoints
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&url)
            .cloned();

        let outcome = match (injected, endpoint) {
            (true, _) => Err(AttemptError {
                status: Some(503),
                reason: "injected failure".to_string(),
            }),
            (false, None) => Err(AttemptError {
                status: None,
                reason: format!("no endpoint bound at {}", url),
            }),
            (false, Some(inbound)) => {
                let delivery = Inbound::new(message.to_value());
                let delivery_id = delivery.delivery_id.clone();
                inbound.push(delivery);
                Ok(json!({"status": "ok", "delivery_id": delivery_id}))
            }
        };

        self.state
            .attempts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(DeliveryAttempt {
                url,
                message,
                delivered: outcome.is_ok(),
                at: Instant::now(),
            });

        outcome
    }
}

fn normalize(url: &str) -> String {
    let url = url.trim_end_matches('/');
    url.strip_suffix("/message").unwrap_or(url).to_string()
}

/// Transport backed by a [`MemoryNetwork`].
pub struct MemoryTransport {
    network: MemoryNetwork,
    url: String,
    inbound: Arc<InboundQueue>,
    policy: RetryPolicy,
}

impl MemoryTransport {
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Buffer a raw delivery directly, bypassing the network.
    pub fn inject(&self, body: serde_json::Value) -> String {
        let delivery = Inbound::new(body);
        let id = delivery.delivery_id.clone();
        self.inbound.push(delivery);
        id
    }

    pub fn unacknowledged(&self) -> Vec<String> {
        self.inbound.unacknowledged()
    }
}

#[async_trait]
impl Transport for MemoryTransport {
    fn url(&self) -> String {
        self.url.clone()
    }

    async fn start(&self) -> Result<(), TransportError> {
        self.network.bind(&self.url, Arc::clone(&self.inbound));
        Ok(())
    }

    async fn send(
        &self,
        url: &str,
        message: &Message,
    ) -> Result<serde_json::Value, DeliveryError> {
        deliver_with_retry(&self.policy, url, message, |copy| {
            let outcome = self.network.deliver(url, copy);
            async move { outcome }
        })
        .await
    }

    fn receive(&self) -> Option<Inbound> {
        self.inbound.pop()
    }

    fn register_receiver(&self, receiver: InboundReceiver) {
        self.inbound.add_receiver(receiver);
    }

    async fn acknowledge(&self, delivery_id: &str) -> Result<(), TransportError> {
        if self.inbound.acknowledge(delivery_id) {
            Ok(())
        } else {
            Err(TransportError::UnknownDelivery(delivery_id.to_string()))
        }
    }

    async fn shutdown(&self) -> Result<(), TransportError> {
        self.network.unbind(&self.url);
        Ok(())
    }
}
