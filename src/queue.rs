//! Ordered buffer of tasks awaiting execution.
//!
//! The queue is the single point of mutation shared by the intake path
//! (`push`) and the execution path (`pop_ready`/`ack`). Tasks leave in
//! arrival order unless their `depends_on` set holds them back; a task is
//! ready once every dependency has *completed*.
//!
//! Task ids are only unique per sender, so tasks are identified by
//! [`TaskKey`] and `depends_on` names tasks of the same sender.
//!
//! ```text
//! received ──► queued ──► (blocked)* ──► executing ──► completed | failed
//!                 ▲                          │
//!                 └──────── requeue ─────────┘
//! ```

use std::collections::{BTreeSet, HashMap, VecDeque};
use std::fmt;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use tokio::sync::futures::Notified;
use tokio::sync::{Mutex, Notify};

use crate::error::QueueError;
use crate::idempotency::IdempotencyKey;
use crate::protocol::{Message, TaskMessage};

/// Identity of a task: the submitting agent plus its task id.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TaskKey {
    pub sender: String,
    pub task_id: String,
}

impl TaskKey {
    pub fn new(sender: impl Into<String>, task_id: impl Into<String>) -> Self {
        Self {
            sender: sender.into(),
            task_id: task_id.into(),
        }
    }
}

impl fmt::Display for TaskKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.sender, self.task_id)
    }
}

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Received,
    Queued,
    Blocked,
    Executing,
    Completed,
    Failed,
}

impl TaskState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskState::Completed | TaskState::Failed)
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TaskState::Received => "received",
            TaskState::Queued => "queued",
            TaskState::Blocked => "blocked",
            TaskState::Executing => "executing",
            TaskState::Completed => "completed",
            TaskState::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// A unit of work owned by the processing loop until it is terminal.
#[derive(Debug, Clone)]
pub struct Task {
    pub task_id: String,
    /// Agent that submitted the task.
    pub sender: String,
    pub description: String,
    pub previous_result: Option<String>,
    pub reply_to: Option<String>,
    /// Task ids of the same sender that must complete first.
    pub depends_on: BTreeSet<String>,
    /// `message_id` of the task message, echoed in the result.
    pub original_message_id: Option<String>,
    /// Transport delivery to acknowledge once the task is handled.
    pub delivery_id: Option<String>,
    pub priority: i64,
    pub state: TaskState,
    pub received_at: DateTime<Utc>,
    pub queued_at: Option<DateTime<Utc>>,
    /// Start of the current wait for missing dependencies.
    pub waiting_since: Option<DateTime<Utc>>,
}

impl Task {
    pub fn new(
        sender: impl Into<String>,
        task_id: impl Into<String>,
        description: impl Into<String>,
    ) -> Self {
        Self {
            task_id: task_id.into(),
            sender: sender.into(),
            description: description.into(),
            previous_result: None,
            reply_to: None,
            depends_on: BTreeSet::new(),
            original_message_id: None,
            delivery_id: None,
            priority: 0,
            state: TaskState::Received,
            received_at: Utc::now(),
            queued_at: None,
            waiting_since: None,
        }
    }

    /// Build a task from a validated task message.
    pub fn from_message(message: &Message, payload: &TaskMessage) -> Self {
        Self {
            previous_result: payload.previous_result.clone(),
            reply_to: payload.reply_to.clone(),
            depends_on: payload.depends_on.clone(),
            original_message_id: message.message_id.clone(),
            priority: message.metadata.priority,
            ..Self::new(&message.sender, &payload.task_id, &payload.description)
        }
    }

    pub fn with_dependencies<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(task_ids.into_iter().map(Into::into));
        self
    }

    pub fn with_delivery(mut self, delivery_id: impl Into<String>) -> Self {
        self.delivery_id = Some(delivery_id.into());
        self
    }

    pub fn key(&self) -> TaskKey {
        TaskKey::new(&self.sender, &self.task_id)
    }

    fn dependency_keys(&self) -> impl Iterator<Item = TaskKey> + '_ {
        self.depends_on
            .iter()
            .map(|dep| TaskKey::new(&self.sender, dep))
    }

    pub fn idempotency_key(&self) -> IdempotencyKey {
        IdempotencyKey::task(&self.sender, &self.task_id)
    }
}

/// Terminal result of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum TaskOutcome {
    Completed(Value),
    Failed(String),
}

impl TaskOutcome {
    fn state(&self) -> TaskState {
        match self {
            TaskOutcome::Completed(_) => TaskState::Completed,
            TaskOutcome::Failed(_) => TaskState::Failed,
        }
    }
}

/// Fate of a task's result message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryStatus {
    /// The task had no `reply_to`.
    NotRequested,
    Pending,
    Delivered,
    Failed(String),
}

/// A task that reached a terminal state, kept for the retention window.
#[derive(Debug, Clone)]
pub struct FinishedTask {
    pub task: Task,
    pub outcome: TaskOutcome,
    pub delivery: DeliveryStatus,
    pub finished_at: DateTime<Utc>,
}

/// Why a queued task can never become ready.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BlockReason {
    DependencyFailed { task_id: String },
    DependencyTimeout { missing: Vec<String> },
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::DependencyFailed { task_id } => {
                write!(f, "dependency {} failed", task_id)
            }
            BlockReason::DependencyTimeout { missing } => {
                write!(f, "timed out waiting for dependencies: {}", missing.join(", "))
            }
        }
    }
}

/// A task removed from the queue because its dependencies cannot resolve.
#[derive(Debug, Clone)]
pub struct Unsatisfiable {
    pub task: Task,
    pub reason: BlockReason,
}

#[derive(Default)]
struct QueueState {
    pending: VecDeque<Task>,
    executing: HashMap<TaskKey, Task>,
    finished: HashMap<TaskKey, FinishedTask>,
}

impl QueueState {
    fn is_live(&self, key: &TaskKey) -> bool {
        self.executing.contains_key(key) || self.pending.iter().any(|t| t.key() == *key)
    }

    fn finished_state(&self, key: &TaskKey) -> Option<TaskState> {
        self.finished.get(key).map(|f| f.task.state)
    }

    fn is_completed(&self, key: &TaskKey) -> bool {
        self.finished_state(key) == Some(TaskState::Completed)
    }

    fn is_ready(&self, task: &Task) -> bool {
        task.dependency_keys().all(|dep| self.is_completed(&dep))
    }

    /// Dependencies that have not completed, by task id.
    fn missing(&self, task: &Task) -> Vec<String> {
        task.dependency_keys()
            .filter(|dep| !self.is_completed(dep))
            .map(|dep| dep.task_id)
            .collect()
    }

    /// Whether some missing dependency is queued or executing.
    fn waits_on_live(&self, task: &Task) -> bool {
        task.dependency_keys()
            .any(|dep| !self.is_completed(&dep) && self.is_live(&dep))
    }

    fn failed_dependency(&self, task: &Task) -> Option<String> {
        task.dependency_keys()
            .find(|dep| {
                self.finished_state(dep) == Some(TaskState::Failed) && !self.is_live(dep)
            })
            .map(|dep| dep.task_id)
    }

    /// Single string result of the only dependency, for chained tasks.
    fn chained_input(&self, task: &Task) -> Option<String> {
        if task.depends_on.len() != 1 {
            return None;
        }
        let dep = task.dependency_keys().next()?;
        match &self.finished.get(&dep)?.outcome {
            TaskOutcome::Completed(Value::String(s)) => Some(s.clone()),
            _ => None,
        }
    }

    fn finish(&mut self, mut task: Task, outcome: TaskOutcome) {
        task.state = outcome.state();
        let delivery = if task.reply_to.is_some() {
            DeliveryStatus::Pending
        } else {
            DeliveryStatus::NotRequested
        };
        self.finished.insert(
            task.key(),
            FinishedTask {
                task,
                outcome,
                delivery,
                finished_at: Utc::now(),
            },
        );
    }

    fn remove_executing(&mut self, key: &TaskKey) -> Result<Task, QueueError> {
        self.executing
            .remove(key)
            .ok_or_else(|| QueueError::NotExecuting {
                sender: key.sender.clone(),
                task_id: key.task_id.clone(),
            })
    }
}

/// Thread-safe FIFO of tasks with dependency-aware readiness.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl TaskQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    /// Append a task to the tail.
    ///
    /// Fails if a task with the same key is already queued or executing.
    pub async fn push(&self, mut task: Task) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        if state.is_live(&task.key()) {
            return Err(QueueError::DuplicateTask {
                sender: task.sender,
                task_id: task.task_id,
            });
        }

        let now = Utc::now();
        task.state = TaskState::Queued;
        task.queued_at = Some(now);
        task.waiting_since = Some(now);
        tracing::debug!(
            task = %task.key(),
            depends_on = ?task.depends_on,
            "Task queued"
        );
        state.pending.push_back(task);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Take the oldest task whose dependencies have all completed.
    ///
    /// `None` means nothing is ready, which is not the same as empty: blocked
    /// tasks stay queued and are marked `Blocked`.
    pub async fn pop_ready(&self) -> Option<Task> {
        let mut state = self.state.lock().await;

        let mut ready_at = None;
        for idx in 0..state.pending.len() {
            if state.is_ready(&state.pending[idx]) {
                ready_at = Some(idx);
                break;
            }
            state.pending[idx].state = TaskState::Blocked;
        }

        let mut task = state.pending.remove(ready_at?)?;
        if task.previous_result.is_none() {
            task.previous_result = state.chained_input(&task);
        }
        task.state = TaskState::Executing;
        state.executing.insert(task.key(), task.clone());
        Some(task)
    }

    /// Record the outcome of an executing task.
    ///
    /// Returns the keys of queued tasks that became ready as a result.
    pub async fn ack(
        &self,
        key: &TaskKey,
        outcome: TaskOutcome,
    ) -> Result<Vec<TaskKey>, QueueError> {
        let mut state = self.state.lock().await;
        let task = state.remove_executing(key)?;

        let completed = matches!(outcome, TaskOutcome::Completed(_));
        state.finish(task, outcome);

        let mut unblocked = Vec::new();
        if completed {
            let ready: Vec<bool> = state
                .pending
                .iter()
                .map(|t| {
                    t.sender == key.sender
                        && t.depends_on.contains(&key.task_id)
                        && state.is_ready(t)
                })
                .collect();
            for (task, ready) in state.pending.iter_mut().zip(ready) {
                if ready {
                    task.state = TaskState::Queued;
                    unblocked.push(task.key());
                }
            }
        }
        drop(state);

        if !unblocked.is_empty() {
            tracing::debug!(task = %key, unblocked = ?unblocked, "Dependencies resolved");
            self.notify.notify_one();
        }
        Ok(unblocked)
    }

    /// Return an executing task to the head of the queue.
    ///
    /// Used when execution is abandoned; the task becomes `Queued` again.
    pub async fn requeue(&self, key: &TaskKey) -> Result<(), QueueError> {
        let mut state = self.state.lock().await;
        let mut task = state.remove_executing(key)?;
        task.state = TaskState::Queued;
        task.waiting_since = Some(Utc::now());
        state.pending.push_front(task);
        drop(state);

        self.notify.notify_one();
        Ok(())
    }

    /// Remove queued tasks that can never become ready and finish them as
    /// failed.
    ///
    /// A task is unsatisfiable if one of its dependencies failed, or, when
    /// `timeout` is given, if it has waited longer than `timeout` for
    /// dependencies that are neither completed nor queued nor executing. A
    /// task whose dependency is still live has its wait restarted.
    /// Failures cascade: dependents of a removed task are removed in the same
    /// call.
    pub async fn take_unsatisfiable(&self, timeout: Option<Duration>) -> Vec<Unsatisfiable> {
        let now = Utc::now();
        let deadline = timeout.and_then(|t| TimeDelta::from_std(t).ok());
        let mut state = self.state.lock().await;

        let live: Vec<bool> = state.pending.iter().map(|t| state.waits_on_live(t)).collect();
        for (task, live) in state.pending.iter_mut().zip(live) {
            if live {
                task.waiting_since = Some(now);
            }
        }

        let mut removed = Vec::new();
        loop {
            let mut found = None;
            for (idx, task) in state.pending.iter().enumerate() {
                if let Some(dep) = state.failed_dependency(task) {
                    found = Some((idx, BlockReason::DependencyFailed { task_id: dep }));
                    break;
                }
                let waited = task
                    .waiting_since
                    .map(|at| now - at)
                    .unwrap_or(TimeDelta::zero());
                let expired = deadline.is_some_and(|limit| waited >= limit);
                if expired && !state.is_ready(task) && !state.waits_on_live(task) {
                    let missing = state.missing(task);
                    found = Some((idx, BlockReason::DependencyTimeout { missing }));
                    break;
                }
            }

            let Some((idx, reason)) = found else {
                break;
            };
            let Some(mut task) = state.pending.remove(idx) else {
                break;
            };
            state.finish(task.clone(), TaskOutcome::Failed(reason.to_string()));
            task.state = TaskState::Failed;
            removed.push(Unsatisfiable { task, reason });
        }

        removed
    }

    /// Restart the dependency wait of every queued task.
    ///
    /// Called on resume so time spent paused does not count.
    pub async fn restart_dependency_clocks(&self) {
        let now = Utc::now();
        for task in self.state.lock().await.pending.iter_mut() {
            task.waiting_since = Some(now);
        }
    }

    /// Record what happened to a finished task's result message.
    pub async fn set_delivery(&self, key: &TaskKey, delivery: DeliveryStatus) {
        if let Some(finished) = self.state.lock().await.finished.get_mut(key) {
            finished.delivery = delivery;
        }
    }

    /// Drop finished tasks older than `retention`.
    pub async fn evict_finished_older_than(&self, retention: Duration) -> usize {
        let Some(cutoff) = TimeDelta::from_std(retention)
            .ok()
            .and_then(|window| Utc::now().checked_sub_signed(window))
        else {
            return 0;
        };

        let mut state = self.state.lock().await;
        let before = state.finished.len();
        state.finished.retain(|_, f| f.finished_at >= cutoff);
        before - state.finished.len()
    }

    pub async fn state_of(&self, key: &TaskKey) -> Option<TaskState> {
        let state = self.state.lock().await;
        if let Some(task) = state.executing.get(key) {
            return Some(task.state);
        }
        if let Some(task) = state.pending.iter().find(|t| t.key() == *key) {
            return Some(task.state);
        }
        state.finished_state(key)
    }

    pub async fn finished(&self, key: &TaskKey) -> Option<FinishedTask> {
        self.state.lock().await.finished.get(key).cloned()
    }

    /// Ids of queued tasks in queue order.
    pub async fn pending_ids(&self) -> Vec<String> {
        self.state
            .lock()
            .await
            .pending
            .iter()
            .map(|t| t.task_id.clone())
            .collect()
    }

    pub async fn pending_len(&self) -> usize {
        self.state.lock().await.pending.len()
    }

    pub async fn executing_len(&self) -> usize {
        self.state.lock().await.executing.len()
    }

    /// Queued plus executing tasks.
    pub async fn len(&self) -> usize {
        let state = self.state.lock().await;
        state.pending.len() + state.executing.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Resolves after the next push, unblock or requeue.
    pub fn notified(&self) -> Notified<'_> {
        self.notify.notified()
    }
}

impl Default for TaskQueue {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;

    fn task(id: &str) -> Task {
        Task::new("tester", id, format!("work for {}", id))
    }

    fn key(id: &str) -> TaskKey {
        TaskKey::new("tester", id)
    }

    const HOUR: Option<Duration> = Some(Duration::from_secs(3600));

    #[tokio::test]
    async fn test_fifo_without_dependencies() {
        let queue = TaskQueue::new();
        for id in ["a", "b", "c"] {
            queue.push(task(id)).await.unwrap();
        }

        let order: Vec<_> = [
            queue.pop_ready().await.unwrap(),
            queue.pop_ready().await.unwrap(),
            queue.pop_ready().await.unwrap(),
        ]
        .into_iter()
        .map(|t| t.task_id)
        .collect();
        assert_eq!(order, vec!["a", "b", "c"]);
        assert!(queue.pop_ready().await.is_none());
    }

    #[tokio::test]
    async fn test_dependent_waits_for_dependency_ack() {
        let queue = TaskQueue::new();
        queue.push(task("t2").with_dependencies(["t1"])).await.unwrap();

        // Dependent arrived first and nothing else is queued.
        assert!(queue.pop_ready().await.is_none());
        assert_eq!(queue.state_of(&key("t2")).await, Some(TaskState::Blocked));
        assert!(!queue.is_empty().await);

        queue.push(task("t1")).await.unwrap();
        let t1 = queue.pop_ready().await.unwrap();
        assert_eq!(t1.task_id, "t1");
        assert!(queue.pop_ready().await.is_none());

        let unblocked = queue
            .ack(&key("t1"), TaskOutcome::Completed(json!("R1")))
            .await
            .unwrap();
        assert_eq!(unblocked, vec![key("t2")]);

        let t2 = queue.pop_ready().await.unwrap();
        assert_eq!(t2.task_id, "t2");
        // Single completed dependency feeds the chained input.
        assert_eq!(t2.previous_result.as_deref(), Some("R1"));
    }

    #[tokio::test]
    async fn test_ready_task_skips_ahead_of_blocked_one() {
        let queue = TaskQueue::new();
        queue.push(task("late").with_dependencies(["missing"])).await.unwrap();
        queue.push(task("free")).await.unwrap();

        assert_eq!(queue.pop_ready().await.unwrap().task_id, "free");
        assert_eq!(queue.pending_ids().await, vec!["late"]);
    }

    #[tokio::test]
    async fn test_same_task_id_from_two_senders() {
        let queue = TaskQueue::new();
        queue.push(Task::new("alice", "t1", "a1")).await.unwrap();
        queue
            .push(Task::new("alice", "t2", "a2").with_dependencies(["t1"]))
            .await
            .unwrap();
        queue.push(Task::new("bob", "t1", "b1")).await.unwrap();
        assert_eq!(queue.len().await, 3);

        // Take alice/t1 out of the way without completing it.
        let alice_t1 = queue.pop_ready().await.unwrap();
        assert_eq!(alice_t1.key(), TaskKey::new("alice", "t1"));

        let bob_t1 = queue.pop_ready().await.unwrap();
        assert_eq!(bob_t1.key(), TaskKey::new("bob", "t1"));
        let unblocked = queue
            .ack(&bob_t1.key(), TaskOutcome::Completed(json!("bob's")))
            .await
            .unwrap();
        assert!(unblocked.is_empty());

        // bob/t1 completing does not satisfy alice/t2.
        assert!(queue.pop_ready().await.is_none());
        assert_eq!(
            queue.state_of(&TaskKey::new("alice", "t2")).await,
            Some(TaskState::Blocked)
        );

        queue
            .ack(&alice_t1.key(), TaskOutcome::Completed(json!("alice's")))
            .await
            .unwrap();
        let alice_t2 = queue.pop_ready().await.unwrap();
        assert_eq!(alice_t2.previous_result.as_deref(), Some("alice's"));

        let bob_record = queue.finished(&TaskKey::new("bob", "t1")).await.unwrap();
        assert_eq!(bob_record.outcome, TaskOutcome::Completed(json!("bob's")));
    }

    #[tokio::test]
    async fn test_failed_dependency_does_not_satisfy() {
        let queue = TaskQueue::new();
        queue.push(task("t1")).await.unwrap();
        queue.push(task("t2").with_dependencies(["t1"])).await.unwrap();

        queue.pop_ready().await.unwrap();
        let unblocked = queue
            .ack(&key("t1"), TaskOutcome::Failed("boom".to_string()))
            .await
            .unwrap();
        assert!(unblocked.is_empty());
        assert!(queue.pop_ready().await.is_none());

        let removed = queue.take_unsatisfiable(None).await;
        assert_eq!(removed.len(), 1);
        assert_eq!(removed[0].task.task_id, "t2");
        assert_eq!(
            removed[0].reason,
            BlockReason::DependencyFailed {
                task_id: "t1".to_string()
            }
        );
        assert_eq!(queue.state_of(&key("t2")).await, Some(TaskState::Failed));
    }

    #[tokio::test]
    async fn test_dependency_timeout_cascades() {
        let queue = TaskQueue::new();
        queue.push(task("b").with_dependencies(["ghost"])).await.unwrap();
        queue.push(task("c").with_dependencies(["b"])).await.unwrap();

        assert!(queue.take_unsatisfiable(HOUR).await.is_empty());
        // Without a timeout only failed dependencies count.
        assert!(queue.take_unsatisfiable(None).await.is_empty());

        let removed = queue.take_unsatisfiable(Some(Duration::ZERO)).await;
        let ids: Vec<_> = removed.iter().map(|u| u.task.task_id.as_str()).collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(
            removed[0].reason,
            BlockReason::DependencyTimeout {
                missing: vec!["ghost".to_string()]
            }
        );
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_live_dependency_never_times_out() {
        let queue = TaskQueue::new();
        queue.push(task("t1")).await.unwrap();
        queue.push(task("t2").with_dependencies(["t1"])).await.unwrap();

        // Dependency queued.
        assert!(queue.take_unsatisfiable(Some(Duration::ZERO)).await.is_empty());
        assert_eq!(queue.pending_ids().await, vec!["t1", "t2"]);

        // Dependency executing.
        queue.pop_ready().await.unwrap();
        assert!(queue.take_unsatisfiable(Some(Duration::ZERO)).await.is_empty());

        queue.ack(&key("t1"), TaskOutcome::Completed(json!("ok"))).await.unwrap();
        assert_eq!(queue.pop_ready().await.unwrap().task_id, "t2");
    }

    #[tokio::test]
    async fn test_restarted_clock_resets_wait() {
        let queue = TaskQueue::new();
        queue.push(task("b").with_dependencies(["ghost"])).await.unwrap();
        {
            let mut state = queue.state.lock().await;
            state.pending[0].waiting_since = Some(Utc::now() - TimeDelta::hours(2));
        }

        queue.restart_dependency_clocks().await;
        assert!(queue.take_unsatisfiable(HOUR).await.is_empty());
        assert_eq!(queue.pending_ids().await, vec!["b"]);
    }

    #[tokio::test]
    async fn test_duplicate_live_task_rejected() {
        let queue = TaskQueue::new();
        queue.push(task("t1")).await.unwrap();
        assert_eq!(
            queue.push(task("t1")).await,
            Err(QueueError::DuplicateTask {
                sender: "tester".to_string(),
                task_id: "t1".to_string()
            })
        );

        queue.pop_ready().await.unwrap();
        assert!(queue.push(task("t1")).await.is_err());

        queue.ack(&key("t1"), TaskOutcome::Completed(json!(1))).await.unwrap();
        assert!(queue.push(task("t1")).await.is_ok());
    }

    #[tokio::test]
    async fn test_ack_requires_executing_task() {
        let queue = TaskQueue::new();
        queue.push(task("t1")).await.unwrap();
        assert!(matches!(
            queue.ack(&key("t1"), TaskOutcome::Completed(json!(null))).await,
            Err(QueueError::NotExecuting { .. })
        ));
    }

    #[tokio::test]
    async fn test_requeue_returns_task_to_head() {
        let queue = TaskQueue::new();
        queue.push(task("a")).await.unwrap();
        queue.push(task("b")).await.unwrap();

        let a = queue.pop_ready().await.unwrap();
        assert_eq!(queue.state_of(&key("a")).await, Some(TaskState::Executing));
        queue.requeue(&a.key()).await.unwrap();

        assert_eq!(queue.state_of(&key("a")).await, Some(TaskState::Queued));
        assert_eq!(queue.pending_ids().await, vec!["a", "b"]);
    }

    #[tokio::test]
    async fn test_delivery_status_and_eviction() {
        let queue = TaskQueue::new();
        let mut t = task("t1");
        t.reply_to = Some("http://127.0.0.1:9".to_string());
        queue.push(t).await.unwrap();
        queue.pop_ready().await.unwrap();
        queue.ack(&key("t1"), TaskOutcome::Completed(json!("R"))).await.unwrap();

        assert_eq!(
            queue.finished(&key("t1")).await.unwrap().delivery,
            DeliveryStatus::Pending
        );
        queue
            .set_delivery(&key("t1"), DeliveryStatus::Failed("unreachable".to_string()))
            .await;
        let finished = queue.finished(&key("t1")).await.unwrap();
        assert_eq!(finished.task.state, TaskState::Completed);
        assert!(matches!(finished.delivery, DeliveryStatus::Failed(_)));

        assert_eq!(queue.evict_finished_older_than(Duration::from_secs(60)).await, 0);
        {
            let mut state = queue.state.lock().await;
            state.finished.get_mut(&key("t1")).unwrap().finished_at =
                Utc::now() - TimeDelta::hours(2);
        }
        assert_eq!(queue.evict_finished_older_than(Duration::from_secs(60)).await, 1);
        assert!(queue.finished(&key("t1")).await.is_none());
    }

    #[tokio::test]
    async fn test_push_wakes_waiter() {
        let queue = std::sync::Arc::new(TaskQueue::new());
        let waiter = {
            let queue = std::sync::Arc::clone(&queue);
            tokio::spawn(async move {
                queue.notified().await;
                queue.pop_ready().await.map(|t| t.task_id)
            })
        };
        tokio::task::yield_now().await;
        queue.push(task("wake")).await.unwrap();

        let popped = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(popped.as_deref(), Some("wake"));
    }
}
