//! Task executor trait and simple implementations.
//!
//! The executor is the framework adapter: it turns a task description (and
//! optional chained input) into a result. The processing loop treats it as an
//! opaque, possibly slow, possibly failing call.

use std::future::Future;
use std::pin::Pin;

use async_trait::async_trait;
use serde_json::Value;

use crate::error::ExecutionError;

/// Capability that runs a single task.
#[async_trait]
pub trait TaskExecutor: Send + Sync {
    /// Execute `description`, optionally continuing from `previous_result`.
    async fn execute(
        &self,
        description: &str,
        previous_result: Option<&str>,
    ) -> Result<Value, ExecutionError>;
}

type BoxedExecution = Pin<Box<dyn Future<Output = Result<Value, ExecutionError>> + Send>>;

/// Executor backed by an async closure.
///
/// The closure receives owned copies of the inputs so the returned future can
/// be `'static`.
pub struct FnExecutor {
    func: Box<dyn Fn(String, Option<String>) -> BoxedExecution + Send + Sync>,
}

impl FnExecutor {
    pub fn new<F, Fut>(func: F) -> Self
    where
        F: Fn(String, Option<String>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, ExecutionError>> + Send + 'static,
    {
        Self {
            func: Box::new(move |description, previous| Box::pin(func(description, previous))),
        }
    }
}

#[async_trait]
impl TaskExecutor for FnExecutor {
    async fn execute(
        &self,
        description: &str,
        previous_result: Option<&str>,
    ) -> Result<Value, ExecutionError> {
        (self.func)(description.to_string(), previous_result.map(String::from)).await
    }
}

/// Returns the description, prefixed with the chained input if any.
#[derive(Debug, Default, Clone, Copy)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        description: &str,
        previous_result: Option<&str>,
    ) -> Result<Value, ExecutionError> {
        let text = match previous_result {
            Some(previous) => format!("{}\n{}", previous, description),
            None => description.to_string(),
        };
        Ok(Value::String(text))
    }
}
