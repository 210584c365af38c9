//! Duplicate suppression for inbound messages.
//!
//! Tasks are keyed by `(sender, task_id)`, other messages by `message_id`.
//! A message with neither is never deduplicated.
//!
//! `should_process` is an atomic check-and-claim: the first caller for a key
//! records an in-flight claim and gets `true`; every later caller gets
//! `false` until the claim is released. Eviction only touches completed
//! records, so a claim is never dropped mid-flight.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use tokio::sync::Mutex;

use crate::protocol::{Message, MessageBody};

/// Identity of a message for duplicate detection.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum IdempotencyKey {
    Task { sender: String, task_id: String },
    Message(String),
}

impl IdempotencyKey {
    pub fn task(sender: impl Into<String>, task_id: impl Into<String>) -> Self {
        IdempotencyKey::Task {
            sender: sender.into(),
            task_id: task_id.into(),
        }
    }

    /// Key for a message, or `None` if it cannot be deduplicated.
    pub fn for_message(message: &Message) -> Option<Self> {
        match &message.body {
            MessageBody::Task(task) => Some(Self::task(&message.sender, &task.task_id)),
            _ => message.message_id.clone().map(IdempotencyKey::Message),
        }
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            IdempotencyKey::Task { sender, task_id } => write!(f, "{}/{}", sender, task_id),
            IdempotencyKey::Message(id) => write!(f, "msg:{}", id),
        }
    }
}

/// Processing state of a key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordState {
    InFlight,
    Completed,
}

#[derive(Debug, Clone)]
struct ProcessedRecord {
    state: RecordState,
    last_seen: DateTime<Utc>,
}

/// Per-agent record of processed messages.
pub struct IdempotencyTracker {
    records: Mutex<HashMap<IdempotencyKey, ProcessedRecord>>,
}

impl IdempotencyTracker {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
        }
    }

    /// Claim `key` for processing.
    ///
    /// Returns `true` exactly once per key until the claim is released or the
    /// completed record is evicted.
    pub async fn should_process(&self, key: &IdempotencyKey) -> bool {
        let mut records = self.records.lock().await;
        let now = Utc::now();
        match records.get_mut(key) {
            Some(record) => {
                record.last_seen = now;
                false
            }
            None => {
                records.insert(
                    key.clone(),
                    ProcessedRecord {
                        state: RecordState::InFlight,
                        last_seen: now,
                    },
                );
                true
            }
        }
    }

    /// Record `key` as completed. Recording twice is a no-op.
    pub async fn mark_completed(&self, key: &IdempotencyKey) {
        let mut records = self.records.lock().await;
        let record = records.entry(key.clone()).or_insert(ProcessedRecord {
            state: RecordState::InFlight,
            last_seen: Utc::now(),
        });
        if record.state != RecordState::Completed {
            record.state = RecordState::Completed;
            record.last_seen = Utc::now();
        }
    }

    /// Drop an in-flight claim so the key can be processed again.
    ///
    /// Completed records are kept; returns whether a claim was released.
    pub async fn release(&self, key: &IdempotencyKey) -> bool {
        let mut records = self.records.lock().await;
        match records.get(key) {
            Some(record) if record.state == RecordState::InFlight => {
                records.remove(key);
                true
            }
            _ => false,
        }
    }

    /// Remove completed records not seen within `retention`.
    ///
    /// Returns the number of records evicted.
    pub async fn evict_older_than(&self, retention: Duration) -> usize {
        let cutoff = TimeDelta::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window));
        let Some(cutoff) = cutoff else {
            return 0;
        };

        let mut records = self.records.lock().await;
        let before = records.len();
        records.retain(|_, record| {
            record.state == RecordState::InFlight || record.last_seen >= cutoff
        });
        let evicted = before - records.len();

        if evicted > 0 {
            tracing::debug!(
                "Evicted {} processed-message record(s) older than {}s",
                evicted,
                retention.as_secs()
            );
        }
        evicted
    }

    pub async fn state(&self, key: &IdempotencyKey) -> Option<RecordState> {
        self.records.lock().await.get(key).map(|r| r.state)
    }

    pub async fn len(&self) -> usize {
        self.records.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.lock().await.is_empty()
    }
}

impl Default for IdempotencyTracker {
    fn default() -> Self {
        Self::new()
    }
}
