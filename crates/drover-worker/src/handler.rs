use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use drover_core::{Job, QueueError};
use parking_lot::RwLock;
use thiserror::Error;

/// Why a dispatched job failed. Routed to the error policy, never fatal to
/// the worker.
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("handler failed: {0}")]
    Handler(String),

    #[error("no handler registered for task type {0:?}")]
    NoHandler(String),

    #[error("no foreign-job handler is configured")]
    NoForeignHandler,

    #[error(transparent)]
    Queue(#[from] QueueError),
}

pub type HandlerResult = Result<(), String>;

/// Runs one kind of task. Implementations may block for as long as they
/// need; the worker imposes no timeout on a dispatched job.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn run(&self, job: &Job, args: &serde_json::Value) -> HandlerResult;
}

/// Registry of task handlers by task type
pub struct TaskHandlerRegistry {
    handlers: Arc<RwLock<HashMap<String, Arc<dyn TaskHandler>>>>,
}

impl TaskHandlerRegistry {
    pub fn new() -> Self {
        TaskHandlerRegistry {
            handlers: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Register a handler for a task type
    pub fn register<H: TaskHandler + 'static>(&self, task_type: impl Into<String>, handler: H) {
        let mut handlers = self.handlers.write();
        handlers.insert(task_type.into(), Arc::new(handler));
    }

    /// Get the handler for a task type
    pub fn get(&self, task_type: &str) -> Option<Arc<dyn TaskHandler>> {
        let handlers = self.handlers.read();
        handlers.get(task_type).cloned()
    }

    pub fn has_handler(&self, task_type: &str) -> bool {
        let handlers = self.handlers.read();
        handlers.contains_key(task_type)
    }

    /// All registered task types
    pub fn task_types(&self) -> Vec<String> {
        let handlers = self.handlers.read();
        handlers.keys().cloned().collect()
    }
}

impl Default for TaskHandlerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Handler that accepts every job without doing anything
pub struct NoopHandler;

#[async_trait]
impl TaskHandler for NoopHandler {
    async fn run(&self, _job: &Job, _args: &serde_json::Value) -> HandlerResult {
        Ok(())
    }
}

/// Handler that simulates work
pub struct SleepHandler {
    duration_ms: u64,
}

impl SleepHandler {
    pub fn new(duration_ms: u64) -> Self {
        SleepHandler { duration_ms }
    }
}

#[async_trait]
impl TaskHandler for SleepHandler {
    async fn run(&self, _job: &Job, args: &serde_json::Value) -> HandlerResult {
        let millis = args
            .get("millis")
            .and_then(|v| v.as_u64())
            .unwrap_or(self.duration_ms);
        tokio::time::sleep(std::time::Duration::from_millis(millis)).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use drover_core::JobStats;

    fn job(body: &str) -> Job {
        Job::new(
            1,
            "127.0.0.1:11300".to_string(),
            body.as_bytes().to_vec(),
            JobStats::default(),
        )
    }

    #[tokio::test]
    async fn noop_handler_accepts_jobs() {
        let handler = NoopHandler;
        let job = job(r#"{"kind": "task", "task_type": "noop"}"#);
        assert!(handler.run(&job, &serde_json::Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn registry_lookup() {
        let registry = TaskHandlerRegistry::new();
        registry.register("noop", NoopHandler);

        assert!(registry.has_handler("noop"));
        assert!(!registry.has_handler("unknown"));

        let handler = registry.get("noop").unwrap();
        let job = job(r#"{"kind": "task", "task_type": "noop"}"#);
        assert!(handler.run(&job, &serde_json::Value::Null).await.is_ok());
    }

    #[tokio::test]
    async fn sleep_handler_reads_args() {
        let handler = SleepHandler::new(1);
        let job = job(r#"{"kind": "task", "task_type": "sleep"}"#);
        let args = serde_json::json!({ "millis": 1 });
        assert!(handler.run(&job, &args).await.is_ok());
    }
}
