use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use drover_core::{Job, Payload, QueueClient, QueueError, Reservation, TaskPayload};
use futures::future::BoxFuture;
use thiserror::Error;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::WorkerConfig;
use crate::daemon;
use crate::handler::{DispatchError, TaskHandlerRegistry};
use crate::hint::ConnectionHint;
use crate::hooks::{FailureAction, Hooks};

#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("interrupted")]
    Interrupted,
}

/// How the main loop ended
#[derive(Debug, PartialEq, Eq)]
pub enum Exit {
    /// Stop flag observed (or interrupt); the worker has drained
    Stopped,
    /// A new deployment appeared at the watched symlink; the caller should
    /// re-exec from this directory
    Redeploy(PathBuf),
}

/// Stop/interrupt state shared with the signal handlers. The stop flag is
/// set exactly once, never by the loop itself.
#[derive(Clone, Default)]
pub struct Signals {
    stop: Arc<AtomicBool>,
    wake: Arc<Notify>,
    interrupt: Arc<Notify>,
}

impl Signals {
    pub fn new() -> Self {
        Self::default()
    }

    /// Graceful stop: the in-flight job finishes, then the loop exits
    pub fn request_stop(&self) {
        self.stop.store(true, Ordering::SeqCst);
        self.wake.notify_waiters();
    }

    /// Abort the in-flight dispatch, release its job, stop the loop
    pub fn request_interrupt(&self) {
        self.interrupt.notify_one();
        self.request_stop();
    }

    pub fn stop_requested(&self) -> bool {
        self.stop.load(Ordering::SeqCst)
    }

    /// Resolves once a stop has been requested; wakes backoff sleeps
    async fn stopped(&self) {
        let notified = self.wake.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        if self.stop_requested() {
            return;
        }
        notified.await;
    }

    /// Wire SIGTERM to graceful stop and SIGINT to interrupt
    pub fn install(&self) -> std::io::Result<()> {
        use tokio::signal::unix::{signal, SignalKind};

        let mut term = signal(SignalKind::terminate())?;
        let signals = self.clone();
        tokio::spawn(async move {
            if term.recv().await.is_some() {
                info!("received SIGTERM, stopping after the current job");
                signals.request_stop();
            }
        });

        let mut int = signal(SignalKind::interrupt())?;
        let signals = self.clone();
        tokio::spawn(async move {
            if int.recv().await.is_some() {
                info!("received SIGINT, interrupting");
                signals.request_interrupt();
            }
        });

        Ok(())
    }
}

/// Default disposition for a failed job: an old job's failure is probably
/// permanent, a young one may have hit transient lag in a dependent store
/// and is retried quietly. Jobs deleted up front are left alone.
pub fn default_failure_action(job: &Job, max_age: Duration) -> FailureAction {
    if let Payload::Task(task) = &job.payload {
        if task.delete_first {
            return FailureAction::Ignore;
        }
    }
    if job.age() >= max_age {
        FailureAction::Delete
    } else {
        FailureAction::Decay
    }
}

/// Sequential job consumer: reserve, dispatch, handle the outcome, check
/// the stop flag, repeat. One in-flight job at a time; concurrency comes
/// from running more worker processes.
pub struct Worker<Q: QueueClient> {
    config: WorkerConfig,
    queue: Q,
    registry: Arc<TaskHandlerRegistry>,
    hooks: Hooks,
    hint: ConnectionHint,
    signals: Signals,
}

impl<Q: QueueClient> Worker<Q> {
    pub fn new(config: WorkerConfig, queue: Q, registry: TaskHandlerRegistry) -> Self {
        let hint = ConnectionHint::new(config.brief_reserve());
        Worker {
            config,
            queue,
            registry: Arc::new(registry),
            hooks: Hooks::default(),
            hint,
            signals: Signals::new(),
        }
    }

    pub fn with_hooks(mut self, hooks: Hooks) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn with_signals(mut self, signals: Signals) -> Self {
        self.signals = signals;
        self
    }

    /// Handle for wiring signal handlers (or tests) to this worker
    pub fn signals(&self) -> Signals {
        self.signals.clone()
    }

    /// Run until stopped. Whatever path ends the loop, the drain hook runs
    /// exactly once before this returns.
    pub async fn run(&mut self) -> Exit {
        info!(pid = std::process::id(), "worker started");
        let outcome = self.main_loop().await;
        let exit = match outcome {
            Ok(exit) => exit,
            Err(WorkerError::Interrupted) => {
                warn!("interrupted, shutting down");
                Exit::Stopped
            }
        };
        self.drain();
        exit
    }

    async fn main_loop(&mut self) -> Result<Exit, WorkerError> {
        if let Some(topic) = self.config.topic.clone() {
            // The topic is also applied as connections are (re)dialed, so a
            // failure here is transient like any other connection error.
            if let Err(err) = self.queue.watch(&topic).await {
                warn!(topic = %topic, error = %err, "failed to watch topic at startup");
            }
        }

        loop {
            if let Some(job) = self.reserve_once().await {
                self.dispatch(*job).await?;
            }

            if self.signals.stop_requested() {
                return Ok(Exit::Stopped);
            }

            if let Some(link) = &self.config.check_symlink {
                if let Some(target) = daemon::redeploy_target(link) {
                    info!(target = %target.display(), "new deployment detected");
                    return Ok(Exit::Redeploy(target));
                }
            }
        }
    }

    /// One reservation attempt. Classifies the outcome; only a reserved job
    /// comes back, every other case is handled here.
    async fn reserve_once(&mut self) -> Option<Box<Job>> {
        if let Err(err) = self.queue.connect().await {
            self.reserve_failed(err).await;
            return None;
        }

        for hook in &self.hooks.before_reserve {
            hook();
        }

        let started = Instant::now();
        let outcome = self
            .queue
            .reserve(self.hint.preferred(), self.config.reserve_timeout())
            .await;
        let elapsed = started.elapsed();

        match outcome {
            Ok(Reservation::Job(job)) => {
                self.hint.observe(elapsed, Some(&job.conn));
                Some(job)
            }
            Ok(Reservation::TimedOut) => {
                // Expected when the queue is empty
                self.hint.observe(elapsed, None);
                None
            }
            Ok(Reservation::DeadlineSoon) => {
                self.hint.observe(elapsed, None);
                info!("reservation deadline soon, retrying; clean up in a before-reserve hook");
                None
            }
            Err(err) => {
                self.reserve_failed(err).await;
                None
            }
        }
    }

    /// Transient path: clear the hint, log, back off, keep running. A stop
    /// request cuts the backoff short.
    async fn reserve_failed(&mut self, err: QueueError) {
        self.hint.clear();
        let backoff = self.config.error_backoff();
        warn!(
            error = %err,
            backoff_secs = backoff.as_secs(),
            "failed to get a job, backing off"
        );
        tokio::select! {
            _ = tokio::time::sleep(backoff) => {}
            _ = self.signals.stopped() => {}
        }
    }

    async fn dispatch(&mut self, job: Job) -> Result<(), WorkerError> {
        info!(
            id = job.id,
            conn = %job.conn,
            age_secs = job.stats.age,
            releases = job.stats.releases,
            "reserved job"
        );
        debug!(body = %String::from_utf8_lossy(&job.body), "job body");

        if let Some(filter) = &self.hooks.before_dispatch {
            filter(&job);
        }

        let started = Instant::now();
        let interrupt = self.signals.interrupt.clone();
        let outcome = {
            let Worker {
                queue,
                registry,
                hooks,
                ..
            } = self;
            tokio::select! {
                result = execute(queue, registry.as_ref(), hooks, &job) => Some(result),
                _ = interrupt.notified() => None,
            }
        };
        let duration_ms = started.elapsed().as_millis() as u64;

        match outcome {
            None => {
                warn!(id = job.id, "interrupted mid-dispatch, releasing job");
                // Best-effort: the reservation lapses on its own if this
                // fails.
                if let Err(err) = self.queue.release(&job).await {
                    debug!(id = job.id, error = %err, "failed to release interrupted job");
                }
                Err(WorkerError::Interrupted)
            }
            Some(Ok(())) => {
                info!(id = job.id, duration_ms, "job finished");
                Ok(())
            }
            Some(Err(err)) => {
                debug!(id = job.id, duration_ms, "dispatch finished with error");
                self.handle_failure(&job, &err).await;
                Ok(())
            }
        }
    }

    async fn handle_failure(&mut self, job: &Job, err: &DispatchError) {
        error!(id = job.id, conn = %job.conn, error = %err, "job failed");
        let action = match &self.hooks.on_error {
            Some(hook) => hook(job, err),
            None => default_failure_action(job, self.config.max_failed_job_age()),
        };
        // A secondary failure while disposing of the job must not take the
        // worker down; the reservation lapses and the queue retries.
        match action {
            FailureAction::Delete => {
                if let Err(err) = self.queue.delete(job).await {
                    debug!(id = job.id, error = %err, "failed to delete failed job");
                }
            }
            FailureAction::Decay => {
                if let Err(err) = self.queue.decay(job).await {
                    debug!(id = job.id, error = %err, "failed to decay failed job");
                }
            }
            FailureAction::Ignore => {}
        }
    }

    fn drain(&mut self) {
        info!("draining, letting scheduled work finish");
        if let Some(hook) = self.hooks.on_drain.take() {
            hook();
        }
    }
}

async fn execute<Q: QueueClient>(
    queue: &mut Q,
    registry: &TaskHandlerRegistry,
    hooks: &Hooks,
    job: &Job,
) -> Result<(), DispatchError> {
    match &job.payload {
        Payload::Task(task) => {
            let inner: BoxFuture<'_, Result<(), DispatchError>> =
                Box::pin(run_task(queue, registry, job, task));
            match &hooks.around_dispatch {
                Some(wrap) => wrap.wrap(job, inner).await,
                None => inner.await,
            }
        }
        Payload::Foreign => match &hooks.foreign {
            Some(handler) => handler.run(job).await,
            None => Err(DispatchError::NoForeignHandler),
        },
    }
}

/// Native dispatch: deletion is part of normal completion, before the
/// handler when the payload asks for delete-first, after it otherwise.
async fn run_task<Q: QueueClient>(
    queue: &mut Q,
    registry: &TaskHandlerRegistry,
    job: &Job,
    task: &TaskPayload,
) -> Result<(), DispatchError> {
    let handler = registry
        .get(&task.task_type)
        .ok_or_else(|| DispatchError::NoHandler(task.task_type.clone()))?;
    if task.delete_first {
        queue.delete(job).await?;
    }
    handler
        .run(job, &task.args)
        .await
        .map_err(DispatchError::Handler)?;
    if !task.delete_first {
        queue.delete(job).await?;
    }
    Ok(())
}
