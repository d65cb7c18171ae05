use async_trait::async_trait;
use drover_core::Job;
use futures::future::BoxFuture;

use crate::handler::DispatchError;

/// What the dispatcher should do with a job whose handler failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureAction {
    /// The failure is permanent; remove the job from the queue
    Delete,
    /// Retry later with an increased delay
    Decay,
    /// Leave the job alone (already deleted, or the hook disposed of it)
    Ignore,
}

pub type ReserveHook = Box<dyn Fn() + Send + Sync>;
pub type JobFilter = Box<dyn Fn(&Job) + Send + Sync>;
pub type ErrorHook = Box<dyn Fn(&Job, &DispatchError) -> FailureAction + Send + Sync>;
pub type DrainHook = Box<dyn FnOnce() + Send>;

/// Wraps handler execution. The default is to run `inner` unchanged;
/// applications use this to put timing, transactions or retries around
/// every job.
#[async_trait]
pub trait DispatchWrap: Send + Sync {
    async fn wrap(
        &self,
        job: &Job,
        inner: BoxFuture<'_, Result<(), DispatchError>>,
    ) -> Result<(), DispatchError>;
}

/// Runs jobs whose payload this worker does not natively understand
#[async_trait]
pub trait ForeignJobHandler: Send + Sync {
    async fn run(&self, job: &Job) -> Result<(), DispatchError>;
}

/// Application extension points, all optional. Built once at startup and
/// handed to the worker by value; there is no global registry and no
/// shared state between worker instances.
#[derive(Default)]
pub struct Hooks {
    /// Run before every reservation attempt
    pub(crate) before_reserve: Vec<ReserveHook>,

    /// Observes a job after reservation, before its handler runs
    pub(crate) before_dispatch: Option<JobFilter>,

    /// Wraps execution of the handler
    pub(crate) around_dispatch: Option<Box<dyn DispatchWrap>>,

    /// Decides the disposition of a failed job; defaults to the age-based
    /// delete-or-decay policy
    pub(crate) on_error: Option<ErrorHook>,

    /// Receives jobs with a foreign payload
    pub(crate) foreign: Option<Box<dyn ForeignJobHandler>>,

    /// Run exactly once after the loop exits, on every exit path
    pub(crate) on_drain: Option<DrainHook>,
}

impl Hooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn before_reserve(mut self, hook: impl Fn() + Send + Sync + 'static) -> Self {
        self.before_reserve.push(Box::new(hook));
        self
    }

    pub fn before_dispatch(mut self, filter: impl Fn(&Job) + Send + Sync + 'static) -> Self {
        self.before_dispatch = Some(Box::new(filter));
        self
    }

    pub fn around_dispatch(mut self, wrap: impl DispatchWrap + 'static) -> Self {
        self.around_dispatch = Some(Box::new(wrap));
        self
    }

    pub fn on_error(
        mut self,
        hook: impl Fn(&Job, &DispatchError) -> FailureAction + Send + Sync + 'static,
    ) -> Self {
        self.on_error = Some(Box::new(hook));
        self
    }

    pub fn foreign(mut self, handler: impl ForeignJobHandler + 'static) -> Self {
        self.foreign = Some(Box::new(handler));
        self
    }

    pub fn on_drain(mut self, hook: impl FnOnce() + Send + 'static) -> Self {
        self.on_drain = Some(Box::new(hook));
        self
    }
}
