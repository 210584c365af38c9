//! Wire schema for messages exchanged between agents.
//!
//! Every message is a JSON object with four mandatory fields and two
//! optional ones:
//!
//! ```json
//! {
//!   "type": "task",
//!   "sender": "researcher",
//!   "timestamp": "2025-03-01T12:00:00Z",
//!   "payload": { "task_id": "t1", "description": "summarize", "reply_to": "http://127.0.0.1:8001" },
//!   "metadata": { "priority": 0, "retry_count": 0 },
//!   "message_id": "6f1c..."
//! }
//! ```
//!
//! Parsing is two-stage: the envelope is checked first, then `payload` is
//! decoded according to `type`. Unknown types are rejected.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, NaiveDateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use uuid::Uuid;

use crate::error::ValidationError;

/// Discriminant of the `type` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageType {
    Task,
    TaskResult,
    Register,
    Control,
}

impl MessageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageType::Task => "task",
            MessageType::TaskResult => "task_result",
            MessageType::Register => "register",
            MessageType::Control => "control",
        }
    }
}

impl fmt::Display for MessageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MessageType {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(MessageType::Task),
            "task_result" => Ok(MessageType::TaskResult),
            "register" => Ok(MessageType::Register),
            "control" => Ok(MessageType::Control),
            other => Err(ValidationError::UnknownType(other.to_string())),
        }
    }
}

/// Optional per-message metadata.
///
/// `priority` and `retry_count` are recognized; any other keys are kept
/// verbatim so they survive a relay hop.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Metadata {
    #[serde(default)]
    pub priority: i64,
    /// Number of retransmissions that preceded this copy of the message.
    #[serde(default)]
    pub retry_count: u32,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// Payload of a `task` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskMessage {
    /// Unique per originating agent, not globally.
    pub task_id: String,
    /// Opaque task specification handed to the executor.
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous_result: Option<String>,
    /// Where the result should be sent. Absent means fire-and-forget.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reply_to: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub depends_on: BTreeSet<String>,
}

impl TaskMessage {
    pub fn new(task_id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            description: description.into(),
            previous_result: None,
            reply_to: None,
            depends_on: BTreeSet::new(),
        }
    }

    pub fn with_reply_to(mut self, url: impl Into<String>) -> Self {
        self.reply_to = Some(url.into());
        self
    }

    pub fn with_previous_result(mut self, result: impl Into<String>) -> Self {
        self.previous_result = Some(result.into());
        self
    }

    pub fn depends_on<I, S>(mut self, task_ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on.extend(task_ids.into_iter().map(Into::into));
        self
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("task_id", &self.task_id)?;
        require_non_empty("description", &self.description)?;
        if let Some(url) = &self.reply_to {
            validate_url("reply_to", url)?;
        }
        if self.depends_on.contains(&self.task_id) {
            return Err(ValidationError::InvalidField {
                field: "depends_on",
                reason: format!("task {} depends on itself", self.task_id),
            });
        }
        Ok(())
    }
}

/// Outcome flag of a `task_result` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResultStatus {
    Success,
    Error,
}

/// Payload of a `task_result` message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResultMessage {
    pub task_id: String,
    #[serde(default)]
    pub result: Value,
    pub status: ResultStatus,
    /// Present iff `status` is `error`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// `message_id` of the task message this result answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub original_message_id: Option<String>,
}

impl TaskResultMessage {
    pub fn success(task_id: impl Into<String>, result: Value) -> Self {
        Self {
            task_id: task_id.into(),
            result,
            status: ResultStatus::Success,
            error: None,
            original_message_id: None,
        }
    }

    pub fn failure(task_id: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            task_id: task_id.into(),
            result: Value::Null,
            status: ResultStatus::Error,
            error: Some(error.into()),
            original_message_id: None,
        }
    }

    pub fn in_reply_to(mut self, message_id: Option<String>) -> Self {
        self.original_message_id = message_id;
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == ResultStatus::Success
    }

    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("task_id", &self.task_id)?;
        match (self.status, &self.error) {
            (ResultStatus::Error, None) => Err(ValidationError::InvalidField {
                field: "error",
                reason: "required when status is error".to_string(),
            }),
            (ResultStatus::Success, Some(_)) => Err(ValidationError::InvalidField {
                field: "error",
                reason: "only allowed when status is error".to_string(),
            }),
            _ => Ok(()),
        }
    }
}

/// Run-state command carried by a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlCommand {
    Stop,
    Pause,
    Resume,
}

/// Payload of a `control` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControlMessage {
    pub command: ControlCommand,
}

/// Payload of a `register` message.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterMessage {
    pub agent_name: String,
    pub agent_url: String,
    #[serde(default)]
    pub capabilities: BTreeSet<String>,
}

impl RegisterMessage {
    fn validate(&self) -> Result<(), ValidationError> {
        require_non_empty("agent_name", &self.agent_name)?;
        validate_url("agent_url", &self.agent_url)
    }
}

/// Typed payload, one variant per message type.
#[derive(Debug, Clone, PartialEq)]
pub enum MessageBody {
    Task(TaskMessage),
    TaskResult(TaskResultMessage),
    Register(RegisterMessage),
    Control(ControlMessage),
}

impl MessageBody {
    pub fn message_type(&self) -> MessageType {
        match self {
            MessageBody::Task(_) => MessageType::Task,
            MessageBody::TaskResult(_) => MessageType::TaskResult,
            MessageBody::Register(_) => MessageType::Register,
            MessageBody::Control(_) => MessageType::Control,
        }
    }

    fn from_payload(kind: MessageType, payload: Value) -> Result<Self, ValidationError> {
        if !payload.is_object() {
            return Err(ValidationError::Payload {
                kind: kind.as_str(),
                reason: "payload must be an object".to_string(),
            });
        }
        let malformed = |e: serde_json::Error| ValidationError::Payload {
            kind: kind.as_str(),
            reason: e.to_string(),
        };
        let body = match kind {
            MessageType::Task => {
                MessageBody::Task(serde_json::from_value(payload).map_err(malformed)?)
            }
            MessageType::TaskResult => {
                MessageBody::TaskResult(serde_json::from_value(payload).map_err(malformed)?)
            }
            MessageType::Register => {
                MessageBody::Register(serde_json::from_value(payload).map_err(malformed)?)
            }
            MessageType::Control => {
                MessageBody::Control(serde_json::from_value(payload).map_err(malformed)?)
            }
        };
        body.validate()?;
        Ok(body)
    }

    fn validate(&self) -> Result<(), ValidationError> {
        match self {
            MessageBody::Task(task) => task.validate(),
            MessageBody::TaskResult(result) => result.validate(),
            MessageBody::Register(register) => register.validate(),
            MessageBody::Control(_) => Ok(()),
        }
    }

    fn to_payload(&self) -> Value {
        // Payload structs only contain strings, sets and JSON values, so
        // serialization cannot fail.
        let payload = match self {
            MessageBody::Task(task) => serde_json::to_value(task),
            MessageBody::TaskResult(result) => serde_json::to_value(result),
            MessageBody::Register(register) => serde_json::to_value(register),
            MessageBody::Control(control) => serde_json::to_value(control),
        };
        payload.unwrap_or(Value::Null)
    }
}

/// An immutable record exchanged between agents.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "Value", into = "Value")]
pub struct Message {
    pub sender: String,
    pub timestamp: DateTime<Utc>,
    /// Sender-assigned identifier, used for deduplication of non-task
    /// messages and echoed in results.
    pub message_id: Option<String>,
    pub metadata: Metadata,
    pub body: MessageBody,
}

impl Message {
    /// Create a message stamped with the current time and a fresh id.
    pub fn new(sender: impl Into<String>, body: MessageBody) -> Self {
        Self {
            sender: sender.into(),
            timestamp: Utc::now(),
            message_id: Some(Uuid::new_v4().to_string()),
            metadata: Metadata::default(),
            body,
        }
    }

    pub fn task(sender: impl Into<String>, task: TaskMessage) -> Self {
        Self::new(sender, MessageBody::Task(task))
    }

    pub fn task_result(sender: impl Into<String>, result: TaskResultMessage) -> Self {
        Self::new(sender, MessageBody::TaskResult(result))
    }

    pub fn control(sender: impl Into<String>, command: ControlCommand) -> Self {
        Self::new(sender, MessageBody::Control(ControlMessage { command }))
    }

    pub fn register(sender: impl Into<String>, register: RegisterMessage) -> Self {
        Self::new(sender, MessageBody::Register(register))
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.metadata.priority = priority;
        self
    }

    pub fn message_type(&self) -> MessageType {
        self.body.message_type()
    }

    pub fn as_task(&self) -> Option<&TaskMessage> {
        match &self.body {
            MessageBody::Task(task) => Some(task),
            _ => None,
        }
    }

    /// Parse and validate a message from its JSON representation.
    pub fn from_value(value: Value) -> Result<Self, ValidationError> {
        let Value::Object(mut obj) = value else {
            return Err(ValidationError::NotAnObject);
        };

        let kind: MessageType = take_string(&mut obj, "type")?.parse()?;
        let sender = take_string(&mut obj, "sender")?;
        require_non_empty("sender", &sender)?;
        let timestamp = parse_timestamp(&take_string(&mut obj, "timestamp")?)?;
        let payload = obj
            .remove("payload")
            .ok_or(ValidationError::MissingField("payload"))?;

        let metadata = match obj.remove("metadata") {
            None | Some(Value::Null) => Metadata::default(),
            Some(value) if value.is_object() => {
                serde_json::from_value(value).map_err(|e| ValidationError::InvalidField {
                    field: "metadata",
                    reason: e.to_string(),
                })?
            }
            Some(_) => {
                return Err(ValidationError::InvalidField {
                    field: "metadata",
                    reason: "must be an object".to_string(),
                });
            }
        };

        let message_id = match obj.remove("message_id") {
            None | Some(Value::Null) => None,
            Some(Value::String(id)) => Some(id),
            Some(_) => {
                return Err(ValidationError::InvalidField {
                    field: "message_id",
                    reason: "must be a string".to_string(),
                });
            }
        };

        Ok(Self {
            sender,
            timestamp,
            message_id,
            metadata,
            body: MessageBody::from_payload(kind, payload)?,
        })
    }

    /// Parse and validate a message from a JSON string.
    pub fn from_json(raw: &str) -> Result<Self, ValidationError> {
        let value: Value = serde_json::from_str(raw).map_err(|e| ValidationError::InvalidField {
            field: "body",
            reason: e.to_string(),
        })?;
        Self::from_value(value)
    }

    /// JSON representation as sent on the wire.
    pub fn to_value(&self) -> Value {
        let mut obj = Map::new();
        obj.insert("type".into(), Value::from(self.message_type().as_str()));
        obj.insert("sender".into(), Value::from(self.sender.clone()));
        obj.insert(
            "timestamp".into(),
            Value::from(self.timestamp.to_rfc3339_opts(SecondsFormat::AutoSi, true)),
        );
        obj.insert("payload".into(), self.body.to_payload());
        obj.insert(
            "metadata".into(),
            serde_json::to_value(&self.metadata).unwrap_or(Value::Null),
        );
        if let Some(id) = &self.message_id {
            obj.insert("message_id".into(), Value::from(id.clone()));
        }
        Value::Object(obj)
    }
}

impl TryFrom<Value> for Message {
    type Error = ValidationError;

    fn try_from(value: Value) -> Result<Self, Self::Error> {
        Message::from_value(value)
    }
}

impl From<Message> for Value {
    fn from(message: Message) -> Self {
        message.to_value()
    }
}

fn take_string(
    obj: &mut Map<String, Value>,
    field: &'static str,
) -> Result<String, ValidationError> {
    match obj.remove(field) {
        Some(Value::String(s)) => Ok(s),
        None | Some(Value::Null) => Err(ValidationError::MissingField(field)),
        Some(_) => Err(ValidationError::InvalidField {
            field,
            reason: "must be a string".to_string(),
        }),
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), ValidationError> {
    if value.trim().is_empty() {
        return Err(ValidationError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        });
    }
    Ok(())
}

fn validate_url(field: &'static str, url: &str) -> Result<(), ValidationError> {
    reqwest::Url::parse(url)
        .map(|_| ())
        .map_err(|e| ValidationError::InvalidField {
            field,
            reason: format!("invalid URL {url}: {e}"),
        })
}

/// Accepts RFC 3339 timestamps and offset-less ISO-8601 ones (read as UTC).
fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>, ValidationError> {
    if let Ok(ts) = DateTime::parse_from_rfc3339(raw) {
        return Ok(ts.with_timezone(&Utc));
    }
    NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .map_err(|e| ValidationError::InvalidField {
            field: "timestamp",
            reason: format!("not ISO-8601: {e}"),
        })
}
