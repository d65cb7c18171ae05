use std::time::Duration;

use async_trait::async_trait;

use crate::error::QueueError;
use crate::job::{ConnectionId, Job};

/// Outcome of a single reservation attempt. Connection-level failures are
/// reported through `Err` on the `reserve` call itself.
#[derive(Debug)]
pub enum Reservation {
    /// A job was reserved; this worker owns it until it deletes, releases
    /// or decays it
    Job(Box<Job>),

    /// The timeout elapsed with no job available. Expected when the queue
    /// is empty.
    TimedOut,

    /// The queue is about to reclaim a reservation held by this client;
    /// the caller should finish or release outstanding work and retry
    /// immediately
    DeadlineSoon,
}

/// The queue contract the worker consumes. `drover-queue` implements it
/// over TCP; tests script it.
#[async_trait]
pub trait QueueClient: Send {
    /// Ensure connectivity to every configured backend, dialing any that
    /// are missing. Called once per loop iteration.
    async fn connect(&mut self) -> Result<(), QueueError>;

    /// Subscribe to a topic so reservations only return its jobs
    async fn watch(&mut self, topic: &str) -> Result<(), QueueError>;

    /// Reserve one job, preferring `preferred` when it names an open
    /// connection, blocking at most `timeout`.
    async fn reserve(
        &mut self,
        preferred: Option<&ConnectionId>,
        timeout: Duration,
    ) -> Result<Reservation, QueueError>;

    /// Remove the job from the queue for good
    async fn delete(&mut self, job: &Job) -> Result<(), QueueError>;

    /// Return the job to the queue for immediate retry by any worker
    async fn release(&mut self, job: &Job) -> Result<(), QueueError>;

    /// Return the job to the queue with an increased retry delay
    async fn decay(&mut self, job: &Job) -> Result<(), QueueError>;
}
