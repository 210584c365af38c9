//! Message intake: drain the transport and dispatch by message type.

use std::sync::Arc;

use tokio::sync::watch;

use crate::agent::AgentCore;
use crate::agent::state::{RunState, observed};
use crate::idempotency::IdempotencyKey;
use crate::protocol::{
    ControlCommand, ControlMessage, Message, MessageBody, RegisterMessage, TaskMessage,
    TaskResultMessage,
};
use crate::queue::Task;
use crate::transport::Inbound;

/// Poll the transport until the agent stops.
///
/// Intake keeps running while paused so arrivals are still buffered.
pub(crate) async fn run_intake(core: Arc<AgentCore>, mut state_rx: watch::Receiver<RunState>) {
    tracing::debug!(agent = %core.config.name, "Intake loop started");

    while observed(&state_rx) != RunState::Stopped {
        match core.transport.receive() {
            Some(inbound) => core.handle_incoming_message(inbound).await,
            None => {
                tokio::select! {
                    _ = tokio::time::sleep(core.config.idle_poll) => {}
                    changed = state_rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }
        }
    }

    tracing::debug!(agent = %core.config.name, "Intake loop exited");
}

impl AgentCore {
    /// Validate one delivery and route it. Never fails: bad input is logged
    /// and dropped.
    pub(crate) async fn handle_incoming_message(&self, inbound: Inbound) {
        let delivery_id = inbound.delivery_id;
        let message = match Message::from_value(inbound.body) {
            Ok(message) => message,
            Err(e) => {
                tracing::warn!(
                    delivery_id = %delivery_id,
                    error = %e,
                    "Dropping malformed message"
                );
                self.acknowledge(&delivery_id).await;
                return;
            }
        };

        tracing::debug!(
            sender = %message.sender,
            message_type = %message.message_type(),
            retry_count = message.metadata.retry_count,
            "Message received"
        );

        if let MessageBody::Task(task) = &message.body {
            self.admit_task(&message, task, delivery_id).await;
            return;
        }

        let key = IdempotencyKey::for_message(&message);
        if let Some(key) = &key {
            if !self.tracker.should_process(key).await {
                tracing::warn!(key = %key, "Duplicate message ignored");
                self.acknowledge(&delivery_id).await;
                return;
            }
        }

        match &message.body {
            MessageBody::TaskResult(result) => self.route_result(&message.sender, result),
            MessageBody::Control(control) => self.apply_control(&message.sender, control).await,
            MessageBody::Register(register) => self.forward_registration(register).await,
            MessageBody::Task(_) => {}
        }

        if let Some(key) = &key {
            self.tracker.mark_completed(key).await;
        }
        self.acknowledge(&delivery_id).await;
    }

    async fn admit_task(&self, message: &Message, payload: &TaskMessage, delivery_id: String) {
        let key = IdempotencyKey::task(&message.sender, &payload.task_id);
        if !self.tracker.should_process(&key).await {
            tracing::warn!(
                task_id = %payload.task_id,
                sender = %message.sender,
                retry_count = message.metadata.retry_count,
                "Duplicate task ignored"
            );
            self.acknowledge(&delivery_id).await;
            return;
        }

        let task = Task::from_message(message, payload).with_delivery(&delivery_id);
        if let Err(e) = self.queue.push(task).await {
            tracing::warn!(
                task_id = %payload.task_id,
                sender = %message.sender,
                error = %e,
                "Task rejected"
            );
            self.tracker.release(&key).await;
            if let Some(url) = payload.reply_to.as_deref() {
                let reply = TaskResultMessage::failure(&payload.task_id, e.to_string())
                    .in_reply_to(message.message_id.clone());
                self.reply_rejection(url, reply).await;
            }
            self.acknowledge(&delivery_id).await;
        }
    }

    async fn reply_rejection(&self, url: &str, reply: TaskResultMessage) {
        let task_id = reply.task_id.clone();
        let message = Message::task_result(&self.config.name, reply);
        if let Err(e) = self.transport.send(url, &message).await {
            tracing::warn!(task_id = %task_id, url = %url, error = %e, "Rejection delivery failed");
        }
    }

    fn route_result(&self, sender: &str, result: &TaskResultMessage) {
        if self.waiters.resolve(result.clone()) {
            tracing::debug!(
                task_id = %result.task_id,
                sender = %sender,
                "Result delivered to waiter"
            );
        } else {
            tracing::info!(
                task_id = %result.task_id,
                sender = %sender,
                status = ?result.status,
                "Result received with no local waiter"
            );
        }
    }

    async fn apply_control(&self, sender: &str, control: &ControlMessage) {
        let changed = match control.command {
            ControlCommand::Resume => self.resume().await,
            command => self.run.apply(command),
        };
        tracing::info!(
            sender = %sender,
            command = ?control.command,
            state = %self.run.current(),
            changed,
            "Control command applied"
        );
    }

    async fn forward_registration(&self, register: &RegisterMessage) {
        let Some(registry) = &self.registry else {
            tracing::debug!(
                agent = %register.agent_name,
                "No registry; ignoring registration"
            );
            return;
        };
        match registry.register(register.clone()).await {
            Ok(ack) => tracing::info!(
                agent = %ack.agent_name,
                created = ack.created,
                "Registration accepted"
            ),
            Err(e) => tracing::warn!(
                agent = %register.agent_name,
                error = %e,
                "Registration rejected"
            ),
        }
    }
}
