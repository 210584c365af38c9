//! Shared message protocol.

mod message;

pub use message::{
    ControlCommand, ControlMessage, Message, MessageBody, MessageType, Metadata, RegisterMessage,
    ResultStatus, TaskMessage, TaskResultMessage,
};
