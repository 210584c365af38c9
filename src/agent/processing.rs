//! Task execution and maintenance activities.

use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::sync::watch;

use crate::agent::AgentCore;
use crate::agent::state::{self, RunState, observed};
use crate::error::ExecutionError;
use crate::protocol::{Message, TaskResultMessage};
use crate::queue::{DeliveryStatus, Task, TaskOutcome, Unsatisfiable};

/// Pop and execute ready tasks until the agent stops.
///
/// Nothing is dequeued while paused. When no task is ready the loop waits for
/// a queue notification, a state change, or `idle_poll`, whichever is first.
pub(crate) async fn run_processing(core: Arc<AgentCore>, mut state_rx: watch::Receiver<RunState>) {
    tracing::debug!(agent = %core.config.name, "Processing loop started");

    loop {
        match observed(&state_rx) {
            RunState::Stopped => break,
            RunState::Paused => {
                if state_rx.changed().await.is_err() {
                    break;
                }
                continue;
            }
            RunState::Running => {}
        }

        let Some(task) = core.queue.pop_ready().await else {
            tokio::select! {
                _ = core.queue.notified() => {}
                _ = tokio::time::sleep(core.config.idle_poll) => {}
                changed = state_rx.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
            }
            continue;
        };

        // Paused or stopped between the state check and the pop.
        if observed(&state_rx) != RunState::Running {
            core.return_to_queue(&task).await;
            continue;
        }

        core.execute_task(task, &mut state_rx).await;
    }

    tracing::debug!(agent = %core.config.name, "Processing loop exited");
}

/// Periodically evict expired records and fail tasks that can never run.
pub(crate) async fn run_maintenance(core: Arc<AgentCore>, mut state_rx: watch::Receiver<RunState>) {
    let mut interval = tokio::time::interval(core.retention.sweep_interval);
    // Don't sweep immediately on startup
    interval.tick().await;

    loop {
        tokio::select! {
            _ = interval.tick() => core.sweep().await,
            _ = state::stopped(&mut state_rx) => break,
        }
    }
}

impl AgentCore {
    async fn execute_task(&self, task: Task, state_rx: &mut watch::Receiver<RunState>) {
        tracing::info!(task_id = %task.task_id, sender = %task.sender, "Executing task");

        let result = tokio::select! {
            result = self.invoke_executor(&task) => result,
            _ = state::stopped(state_rx) => {
                tracing::warn!(task_id = %task.task_id, "Stopped during execution; task requeued");
                self.return_to_queue(&task).await;
                return;
            }
        };

        self.finish_task(task, result).await;
    }

    async fn invoke_executor(&self, task: &Task) -> Result<Value, ExecutionError> {
        let call = self
            .executor
            .execute(&task.description, task.previous_result.as_deref());
        match self.config.execution_timeout {
            Some(limit) => tokio::time::timeout(limit, call)
                .await
                .unwrap_or(Err(ExecutionError::Timeout(limit))),
            None => call.await,
        }
    }

    async fn return_to_queue(&self, task: &Task) {
        if let Err(e) = self.queue.requeue(&task.key()).await {
            tracing::error!(task_id = %task.task_id, error = %e, "Failed to requeue task");
        }
    }

    /// Record the outcome, reply, mark the task processed and acknowledge
    /// its delivery.
    async fn finish_task(&self, task: Task, result: Result<Value, ExecutionError>) {
        let (outcome, reply) = match result {
            Ok(value) => {
                tracing::info!(task_id = %task.task_id, "Task completed");
                (
                    TaskOutcome::Completed(value.clone()),
                    TaskResultMessage::success(&task.task_id, value),
                )
            }
            Err(e) => {
                tracing::warn!(task_id = %task.task_id, error = %e, "Task failed");
                (
                    TaskOutcome::Failed(e.to_string()),
                    TaskResultMessage::failure(&task.task_id, e.to_string()),
                )
            }
        };
        let failed = matches!(outcome, TaskOutcome::Failed(_));

        match self.queue.ack(&task.key(), outcome).await {
            Ok(unblocked) if !unblocked.is_empty() => {
                tracing::debug!(
                    task_id = %task.task_id,
                    unblocked = ?unblocked,
                    "Dependents ready"
                );
            }
            Ok(_) => {}
            Err(e) => tracing::error!(task_id = %task.task_id, error = %e, "Queue ack failed"),
        }

        self.close_task(&task, reply).await;

        if failed {
            self.fail_unsatisfiable(None).await;
        }
    }

    /// Send the result if requested, then mark the task processed.
    async fn close_task(&self, task: &Task, reply: TaskResultMessage) {
        if let Some(url) = task.reply_to.as_deref() {
            let reply = reply.in_reply_to(task.original_message_id.clone());
            let message = Message::task_result(&self.config.name, reply);
            let delivery = match self.transport.send(url, &message).await {
                Ok(_) => DeliveryStatus::Delivered,
                Err(e) => {
                    // The task stays completed; the remote never learns.
                    tracing::warn!(
                        task_id = %task.task_id,
                        url = %url,
                        error = %e,
                        "Result delivery failed"
                    );
                    DeliveryStatus::Failed(e.to_string())
                }
            };
            self.queue.set_delivery(&task.key(), delivery).await;
        }

        self.tracker.mark_completed(&task.idempotency_key()).await;
        if let Some(delivery_id) = &task.delivery_id {
            self.acknowledge(delivery_id).await;
        }
    }

    /// Fail queued tasks whose dependencies failed, or, with a `timeout`,
    /// never arrived.
    async fn fail_unsatisfiable(&self, timeout: Option<Duration>) {
        let stalled = self.queue.take_unsatisfiable(timeout).await;
        for Unsatisfiable { task, reason } in stalled {
            tracing::warn!(task_id = %task.task_id, reason = %reason, "Task cannot run");
            let reply = TaskResultMessage::failure(&task.task_id, reason.to_string());
            self.close_task(&task, reply).await;
        }
    }

    async fn sweep(&self) {
        let records = self.tracker.evict_older_than(self.retention.window).await;
        let tasks = self.queue.evict_finished_older_than(self.retention.window).await;
        if records > 0 || tasks > 0 {
            tracing::debug!(records, tasks, "Evicted expired entries");
        }
        // Dependencies cannot run while paused.
        let timeout = match self.run.current() {
            RunState::Running => Some(self.config.dependency_timeout),
            RunState::Paused | RunState::Stopped => None,
        };
        self.fail_unsatisfiable(timeout).await;
    }
}
