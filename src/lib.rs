//! Messaging core for agents exchanging tasks and results.
//!
//! Agents built on different frameworks share one wire protocol
//! ([`protocol`]), deliver messages point-to-point with bounded retries
//! ([`transport`]), and run tasks at most once per `(sender, task_id)` through
//! a concurrent processing loop ([`agent`]).

pub mod agent;
pub mod config;
pub mod error;
pub mod executor;
pub mod idempotency;
pub mod protocol;
pub mod queue;
pub mod registry;
pub mod transport;

pub use agent::{Agent, AgentDeps, PendingResult, RunState};
pub use config::Config;
pub use error::{AgentError, DeliveryError, ExecutionError, ValidationError};
pub use executor::{EchoExecutor, FnExecutor, TaskExecutor};
pub use protocol::{Message, MessageBody, TaskMessage, TaskResultMessage};
pub use registry::{InMemoryRegistry, Registry};
pub use transport::{HttpTransport, MemoryNetwork, Transport};
