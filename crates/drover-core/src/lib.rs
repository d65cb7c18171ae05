mod client;
mod error;
mod job;

pub use client::{QueueClient, Reservation};
pub use error::{QueueError, Result};
pub use job::{ConnectionId, Job, JobId, JobStats, Payload, TaskPayload};
