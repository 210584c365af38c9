//! Error types for the messaging core.

use std::time::Duration;

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Invalid value for {key}: {message}")]
    InvalidValue { key: String, message: String },

    #[error("Missing required configuration: {key}")]
    MissingRequired { key: String },
}

/// A malformed inbound message. The message is dropped; the loop continues.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("Message is not a JSON object")]
    NotAnObject,

    #[error("Missing required field: {0}")]
    MissingField(&'static str),

    #[error("Field {field} is invalid: {reason}")]
    InvalidField { field: &'static str, reason: String },

    #[error("Unknown message type: {0}")]
    UnknownType(String),

    #[error("Malformed {kind} payload: {reason}")]
    Payload { kind: &'static str, reason: String },
}

/// Send failure after exhausting every retry.
#[derive(Debug, Clone, thiserror::Error)]
#[error("Delivery to {url} failed after {attempts} attempt(s) (last status: {}): {reason}", status_label(.last_status))]
pub struct DeliveryError {
    pub url: String,
    /// HTTP status of the last attempt, if the endpoint answered at all.
    pub last_status: Option<u16>,
    pub attempts: u32,
    pub reason: String,
}

fn status_label(status: &Option<u16>) -> String {
    status
        .map(|s| s.to_string())
        .unwrap_or_else(|| "none".to_string())
}

/// Failure reported by a task executor.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ExecutionError {
    #[error("{reason}")]
    Failed { reason: String },

    #[error("Task execution timed out after {0:?}")]
    Timeout(Duration),
}

impl ExecutionError {
    pub fn failed(reason: impl Into<String>) -> Self {
        ExecutionError::Failed {
            reason: reason.into(),
        }
    }
}

/// Task queue errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("Task {sender}/{task_id} is already tracked by the queue")]
    DuplicateTask { sender: String, task_id: String },

    #[error("Task {sender}/{task_id} is not executing")]
    NotExecuting { sender: String, task_id: String },
}

/// Registry errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RegistryError {
    #[error("Invalid registration: {reason}")]
    InvalidRegistration { reason: String },

    #[error("Agent {name} is not registered")]
    NotFound { name: String },
}

/// Transport-level errors other than delivery failures.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("Transport failed to start: {reason}")]
    StartupFailed { reason: String },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },

    #[error("Unknown delivery: {0}")]
    UnknownDelivery(String),
}

/// Errors surfaced by the agent processing loop's public API.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    #[error("Agent {name} is already running")]
    AlreadyRunning { name: String },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("Delivery error: {0}")]
    Delivery(#[from] DeliveryError),

    #[error("Registry error: {0}")]
    Registry(#[from] RegistryError),

    #[error("Timed out waiting for result of task {task_id}")]
    ResultTimeout { task_id: String },

    #[error("Result waiter for task {task_id} was dropped")]
    WaiterDropped { task_id: String },
}

/// Result type for agent operations.
pub type Result<T> = std::result::Result<T, AgentError>;
