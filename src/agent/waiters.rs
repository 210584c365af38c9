//! Local waiters for task results.
//!
//! A task submitted with `reply_to` pointing at this agent gets a waiter keyed
//! by `task_id`; the matching `task_result` resolves it.

use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::oneshot;

use crate::error::{AgentError, Result};
use crate::protocol::TaskResultMessage;

/// Pending result of a submitted task.
#[derive(Debug)]
pub struct PendingResult {
    task_id: String,
    rx: oneshot::Receiver<TaskResultMessage>,
}

impl PendingResult {
    pub fn task_id(&self) -> &str {
        &self.task_id
    }

    /// Wait for the result, optionally bounded by `timeout`.
    pub async fn wait(self, timeout: Option<Duration>) -> Result<TaskResultMessage> {
        let task_id = self.task_id;
        let received = match timeout {
            Some(limit) => tokio::time::timeout(limit, self.rx)
                .await
                .map_err(|_| AgentError::ResultTimeout {
                    task_id: task_id.clone(),
                })?,
            None => self.rx.await,
        };
        received.map_err(|_| AgentError::WaiterDropped { task_id })
    }
}

#[derive(Default)]
pub struct ResultWaiters {
    pending: Mutex<HashMap<String, oneshot::Sender<TaskResultMessage>>>,
}

impl ResultWaiters {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter, replacing any previous one for the same task.
    pub fn register(&self, task_id: &str) -> PendingResult {
        let (tx, rx) = oneshot::channel();
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(task_id.to_string(), tx);
        PendingResult {
            task_id: task_id.to_string(),
            rx,
        }
    }

    /// Hand a result to its waiter. Returns false if nobody was waiting.
    pub fn resolve(&self, result: TaskResultMessage) -> bool {
        let waiter = self
            .pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&result.task_id);
        match waiter {
            Some(tx) => tx.send(result).is_ok(),
            None => false,
        }
    }

    pub fn cancel(&self, task_id: &str) {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(task_id);
    }

    pub fn len(&self) -> usize {
        self.pending
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
