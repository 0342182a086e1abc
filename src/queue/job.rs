//! Per-request state machine and the handle callers observe it through

use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use uuid::Uuid;

use crate::client::types::{GeneratedImage, GenerationRequest, GenerationResult};
use crate::error::AppError;

/// Lifecycle of one submitted request.
///
/// `Queued -> Dispatched -> {Succeeded, Failed}`, `Queued -> Cancelled`, and
/// `Queued -> Failed` when a pre-send check fails. Terminal states are final.
#[derive(Debug, Clone)]
pub enum JobState {
    Queued,
    Dispatched,
    Succeeded(Arc<Vec<GeneratedImage>>),
    Failed(Arc<AppError>),
    Cancelled,
}

impl JobState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Succeeded(_) | Self::Failed(_) | Self::Cancelled)
    }

    pub fn label(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Dispatched => "dispatched",
            Self::Succeeded(_) => "succeeded",
            Self::Failed(_) => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

/// Per-dispatcher job counts, kept current by every state transition.
///
/// `queued` is a gauge of jobs still in `Queued`; slots in it are reserved
/// before the jobs exist, so capacity checks cannot race.
#[derive(Debug, Default)]
pub(crate) struct JobCounters {
    pub(crate) queued: AtomicU64,
    pub(crate) dispatched: AtomicU64,
    pub(crate) succeeded: AtomicU64,
    pub(crate) failed: AtomicU64,
    pub(crate) cancelled: AtomicU64,
}

impl JobCounters {
    /// Reserve `count` queue slots if that keeps the gauge within `max`
    pub(crate) fn reserve(&self, count: u64, max: u64) -> bool {
        self.queued
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |queued| {
                queued.checked_add(count).filter(|total| *total <= max)
            })
            .is_ok()
    }

    fn record(&self, from: &JobState, to: &JobState) {
        if matches!(from, JobState::Queued) {
            self.queued.fetch_sub(1, Ordering::AcqRel);
        }
        let counter = match to {
            JobState::Queued => return,
            JobState::Dispatched => &self.dispatched,
            JobState::Succeeded(_) => &self.succeeded,
            JobState::Failed(_) => &self.failed,
            JobState::Cancelled => &self.cancelled,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }
}

struct JobInner {
    id: Uuid,
    request: GenerationRequest,
    submitted_at: DateTime<Utc>,
    state: watch::Sender<JobState>,
    counters: Arc<JobCounters>,
}

/// Handle returned on submission.
///
/// Poll with [`JobHandle::state`], subscribe with [`JobHandle::subscribe`],
/// or await the outcome with [`JobHandle::wait`].
#[derive(Clone)]
pub struct JobHandle {
    inner: Arc<JobInner>,
}

impl std::fmt::Debug for JobHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle")
            .field("id", &self.inner.id)
            .field("state", &self.state().label())
            .finish()
    }
}

impl JobHandle {
    /// A queued job occupying a slot already reserved in `counters`
    pub(crate) fn new(request: GenerationRequest, counters: Arc<JobCounters>) -> Self {
        let (state, _) = watch::channel(JobState::Queued);
        Self {
            inner: Arc::new(JobInner {
                id: Uuid::new_v4(),
                request,
                submitted_at: Utc::now(),
                state,
                counters,
            }),
        }
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    pub fn request(&self) -> &GenerationRequest {
        &self.inner.request
    }

    pub fn submitted_at(&self) -> DateTime<Utc> {
        self.inner.submitted_at
    }

    /// Current state snapshot
    pub fn state(&self) -> JobState {
        self.inner.state.borrow().clone()
    }

    /// Receiver notified on every state change
    pub fn subscribe(&self) -> watch::Receiver<JobState> {
        self.inner.state.subscribe()
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self) -> JobState {
        let mut rx = self.subscribe();
        let result = rx.wait_for(|state| state.is_terminal()).await;
        match result {
            Ok(state) => state.clone(),
            Err(_) => self.state(),
        }
    }

    /// Cancel the job if it has not been dispatched yet.
    ///
    /// Returns `true` if this call moved the job to `Cancelled`.
    pub fn cancel(&self) -> bool {
        self.transition(|state| matches!(state, JobState::Queued).then_some(JobState::Cancelled))
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(*self.inner.state.borrow(), JobState::Cancelled)
    }

    /// `Queued -> Dispatched`; fails if the job was cancelled meanwhile
    pub(crate) fn mark_dispatched(&self) -> bool {
        self.transition(|state| matches!(state, JobState::Queued).then_some(JobState::Dispatched))
    }

    /// `Queued -> Failed` for errors found before anything was sent
    pub(crate) fn reject(&self, error: AppError) -> bool {
        let mut error = Some(error);
        self.transition(|state| match state {
            JobState::Queued => error.take().map(|e| JobState::Failed(Arc::new(e))),
            _ => None,
        })
    }

    /// `Dispatched -> Succeeded | Failed`
    pub(crate) fn finish(&self, result: GenerationResult) -> bool {
        let mut result = Some(result);
        self.transition(|state| match state {
            JobState::Dispatched => result.take().map(|r| match r {
                Ok(images) => JobState::Succeeded(Arc::new(images)),
                Err(e) => JobState::Failed(Arc::new(e)),
            }),
            _ => None,
        })
    }

    /// Apply `next` atomically with respect to every other transition
    fn transition<F>(&self, mut next: F) -> bool
    where
        F: FnMut(&JobState) -> Option<JobState>,
    {
        let counters = &self.inner.counters;
        self.inner.state.send_if_modified(|state| match next(state) {
            Some(new_state) => {
                counters.record(state, &new_state);
                *state = new_state;
                true
            }
            None => false,
        })
    }
}
