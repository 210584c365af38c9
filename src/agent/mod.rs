//! Agent processing loop.
//!
//! An agent owns a task queue and an idempotency tracker and runs three
//! background activities over them:
//! - Message intake: drains the transport, validates and dispatches messages
//! - Task execution: pops ready tasks, runs the executor, routes results
//! - Maintenance: evicts old records and fails tasks with unsatisfiable
//!   dependencies
//!
//! The queue and tracker are the only state the activities share.

mod intake;
mod processing;
mod state;
mod waiters;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::config::{AgentConfig, RetentionConfig};
use crate::error::{AgentError, Result};
use crate::executor::TaskExecutor;
use crate::idempotency::IdempotencyTracker;
use crate::protocol::{ControlCommand, Message, RegisterMessage, TaskMessage};
use crate::queue::{DeliveryStatus, TaskKey, TaskQueue, TaskState};
use crate::registry::Registry;
use crate::transport::Transport;

pub use state::RunState;
pub use waiters::{PendingResult, ResultWaiters};

use state::RunControl;

/// Collaborators injected into an agent.
pub struct AgentDeps {
    pub transport: Arc<dyn Transport>,
    pub executor: Arc<dyn TaskExecutor>,
    /// Registry to join on `run()` and to forward `register` messages to.
    pub registry: Option<Arc<dyn Registry>>,
}

/// State shared by the agent's background activities.
pub(crate) struct AgentCore {
    config: AgentConfig,
    retention: RetentionConfig,
    transport: Arc<dyn Transport>,
    executor: Arc<dyn TaskExecutor>,
    registry: Option<Arc<dyn Registry>>,
    queue: TaskQueue,
    tracker: IdempotencyTracker,
    waiters: ResultWaiters,
    run: RunControl,
}

impl AgentCore {
    fn registration(&self) -> RegisterMessage {
        RegisterMessage {
            agent_name: self.config.name.clone(),
            agent_url: self.transport.url(),
            capabilities: self.config.capabilities.iter().cloned().collect(),
        }
    }

    /// Leave `paused`, restarting dependency waits so paused time is not
    /// counted against `dependency_timeout`.
    async fn resume(&self) -> bool {
        if self.run.current() != RunState::Paused {
            return false;
        }
        self.queue.restart_dependency_clocks().await;
        self.run.apply(ControlCommand::Resume)
    }

    /// Acknowledge a delivery, logging failures.
    async fn acknowledge(&self, delivery_id: &str) {
        if let Err(e) = self.transport.acknowledge(delivery_id).await {
            tracing::debug!(delivery_id = %delivery_id, error = %e, "Acknowledge failed");
        }
    }
}

/// A messaging agent.
pub struct Agent {
    core: Arc<AgentCore>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl Agent {
    pub fn new(config: AgentConfig, retention: RetentionConfig, deps: AgentDeps) -> Self {
        Self {
            core: Arc::new(AgentCore {
                config,
                retention,
                transport: deps.transport,
                executor: deps.executor,
                registry: deps.registry,
                queue: TaskQueue::new(),
                tracker: IdempotencyTracker::new(),
                waiters: ResultWaiters::new(),
                run: RunControl::new(),
            }),
            handles: Mutex::new(Vec::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.config.name
    }

    /// Canonical address of this agent's transport.
    pub fn url(&self) -> String {
        self.core.transport.url()
    }

    pub fn state(&self) -> RunState {
        self.core.run.current()
    }

    /// Start the transport and the background activities.
    ///
    /// Returns once the agent is running. A transport that fails to start
    /// leaves the agent stopped.
    pub async fn run(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        if self.core.run.current() != RunState::Stopped {
            return Err(AgentError::AlreadyRunning {
                name: self.core.config.name.clone(),
            });
        }
        // Loops from a run that was halted by a remote stop command.
        for handle in handles.drain(..) {
            let _ = handle.await;
        }

        self.core.transport.start().await?;

        if !self.core.run.start() {
            return Err(AgentError::AlreadyRunning {
                name: self.core.config.name.clone(),
            });
        }

        if let Some(registry) = &self.core.registry {
            match registry.register(self.core.registration()).await {
                Ok(ack) => tracing::debug!(agent = %ack.agent_name, "Self-registered"),
                Err(e) => tracing::warn!(error = %e, "Self-registration failed"),
            }
        }

        handles.push(tokio::spawn(intake::run_intake(
            Arc::clone(&self.core),
            self.core.run.subscribe(),
        )));
        handles.push(tokio::spawn(processing::run_processing(
            Arc::clone(&self.core),
            self.core.run.subscribe(),
        )));
        handles.push(tokio::spawn(processing::run_maintenance(
            Arc::clone(&self.core),
            self.core.run.subscribe(),
        )));

        tracing::info!(
            agent = %self.core.config.name,
            url = %self.core.transport.url(),
            "Agent running"
        );
        Ok(())
    }

    /// Halt both activities, deregister and shut the transport down.
    ///
    /// A task that was executing goes back to the head of the queue. Calling
    /// `stop()` on a stopped agent is a no-op.
    pub async fn stop(&self) -> Result<()> {
        let mut handles = self.handles.lock().await;
        let was_running = self.core.run.stop();
        if !was_running && handles.is_empty() {
            return Ok(());
        }

        for handle in handles.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Agent activity panicked");
            }
        }

        if let Some(registry) = &self.core.registry {
            if let Err(e) = registry.deregister(&self.core.config.name).await {
                tracing::debug!(error = %e, "Deregistration failed");
            }
        }
        self.core.transport.shutdown().await?;

        tracing::info!(agent = %self.core.config.name, "Agent stopped");
        Ok(())
    }

    /// Resolves once the agent reaches `stopped`, e.g. after a remote stop
    /// command.
    pub async fn stopped(&self) {
        let mut rx = self.core.run.subscribe();
        state::stopped(&mut rx).await;
    }

    pub fn pause(&self) -> bool {
        self.core.run.apply(ControlCommand::Pause)
    }

    pub async fn resume(&self) -> bool {
        self.core.resume().await
    }

    /// Send a task to `url` and wait for its result on this agent.
    ///
    /// `reply_to` is set to this agent's address.
    pub async fn submit_task(&self, url: &str, task: TaskMessage) -> Result<PendingResult> {
        let task = task.with_reply_to(self.core.transport.url());
        let task_id = task.task_id.clone();
        let pending = self.core.waiters.register(&task_id);

        let message = Message::task(&self.core.config.name, task);
        if let Err(e) = self.core.transport.send(url, &message).await {
            self.core.waiters.cancel(&task_id);
            return Err(e.into());
        }

        tracing::debug!(task_id = %task_id, url = %url, "Task submitted");
        Ok(pending)
    }

    pub async fn send_control(&self, url: &str, command: ControlCommand) -> Result<Value> {
        let message = Message::control(&self.core.config.name, command);
        Ok(self.core.transport.send(url, &message).await?)
    }

    /// Announce this agent to a remote registry endpoint.
    pub async fn register_with(&self, url: &str) -> Result<Value> {
        let message = Message::register(&self.core.config.name, self.core.registration());
        Ok(self.core.transport.send(url, &message).await?)
    }

    /// State of the task `task_id` submitted by `sender`.
    pub async fn task_state(&self, sender: &str, task_id: &str) -> Option<TaskState> {
        self.core.queue.state_of(&TaskKey::new(sender, task_id)).await
    }

    /// What happened to the result message of a finished task.
    pub async fn delivery_status(&self, sender: &str, task_id: &str) -> Option<DeliveryStatus> {
        self.core
            .queue
            .finished(&TaskKey::new(sender, task_id))
            .await
            .map(|f| f.delivery)
    }

    /// Queued plus executing tasks.
    pub async fn pending_tasks(&self) -> usize {
        self.core.queue.len().await
    }
}
