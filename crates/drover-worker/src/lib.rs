pub mod config;
pub mod daemon;
pub mod handler;
pub mod hint;
pub mod hooks;
pub mod worker;

pub use config::WorkerConfig;
pub use handler::{TaskHandler, TaskHandlerRegistry};
pub use hooks::{FailureAction, Hooks};
pub use worker::{Exit, Signals, Worker};
