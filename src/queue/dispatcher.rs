//! Rate-limited dispatcher for image generation requests

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::{sleep_until, timeout, Instant};
use tracing::{debug, info, warn};

use crate::client::traits::ImageGenerator;
use crate::client::types::GenerationRequest;
use crate::error::{AppError, Result};
use crate::queue::job::{JobCounters, JobHandle};
use crate::queue::rate_budget::{RateBudget, SharedBudget};

/// Configuration for the dispatcher
#[derive(Debug, Clone)]
pub struct DispatcherConfig {
    /// Maximum dispatches per window
    pub rpm: u32,
    /// Length of the rate window
    pub window: Duration,
    /// Extra wait after a window slot frees up
    pub margin: Duration,
    /// Upper bound for one provider call
    pub call_timeout: Duration,
    /// Maximum number of jobs waiting for a slot
    pub max_queue_size: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            rpm: 3,
            window: Duration::from_secs(60),
            margin: Duration::from_secs(1),
            call_timeout: Duration::from_secs(120),
            max_queue_size: 1000,
        }
    }
}

/// Dispatcher statistics
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub queued: u64,
    pub dispatched: u64,
    pub succeeded: u64,
    pub failed: u64,
    pub cancelled: u64,
    pub rpm: u32,
}

/// Outcome of offering the queue head to the rate budget
enum Admission {
    Wait(Instant),
    Dispatched { job: JobHandle, in_window: usize },
    Cancelled,
    Empty,
}

/// FIFO dispatcher that keeps calls to the generator within `rpm` per window.
///
/// Submission never waits. A single scheduling task owns the queue; each call
/// that clears the budget runs on its own task so the next job's wait
/// overlaps in-flight calls. The budget may be shared with other dispatchers,
/// in which case their calls count against each other.
pub struct Dispatcher {
    job_tx: mpsc::UnboundedSender<JobHandle>,
    config: DispatcherConfig,
    counters: Arc<JobCounters>,
}

impl Dispatcher {
    /// Create a dispatcher with a budget of its own
    pub fn new(generator: Arc<dyn ImageGenerator>, config: DispatcherConfig) -> Self {
        let budget = RateBudget::shared(config.rpm, config.window);
        Self::with_budget(generator, config, budget)
    }

    /// Create a dispatcher drawing on an existing budget and start its
    /// scheduling task on the current runtime. The budget's allowance is set
    /// to `config.rpm`.
    pub fn with_budget(
        generator: Arc<dyn ImageGenerator>,
        config: DispatcherConfig,
        budget: SharedBudget,
    ) -> Self {
        budget.lock().set_allowance(config.rpm);

        let (job_tx, job_rx) = mpsc::unbounded_channel();
        let counters = Arc::new(JobCounters::default());

        tokio::spawn(Self::schedule(job_rx, generator, budget, config.clone()));

        Self {
            job_tx,
            config,
            counters,
        }
    }

    /// Enqueue a request and return its handle
    pub fn submit(&self, request: GenerationRequest) -> Result<JobHandle> {
        self.submit_all(vec![request])?
            .pop()
            .ok_or_else(|| AppError::Internal("Submission produced no job".to_string()))
    }

    /// Enqueue a batch of requests. Either every request is queued, in
    /// order, or none is.
    pub fn submit_all(&self, requests: Vec<GenerationRequest>) -> Result<Vec<JobHandle>> {
        for request in &requests {
            request.validate()?;
        }

        let count = requests.len() as u64;
        if !self.counters.reserve(count, self.config.max_queue_size as u64) {
            return Err(AppError::QueueFull);
        }

        let handles: Vec<JobHandle> = requests
            .into_iter()
            .map(|request| JobHandle::new(request, self.counters.clone()))
            .collect();

        for handle in &handles {
            if self.job_tx.send(handle.clone()).is_err() {
                for handle in &handles {
                    handle.cancel();
                }
                return Err(AppError::Internal("Dispatcher has shut down".to_string()));
            }
        }

        debug!(
            count,
            queued = self.counters.queued.load(Ordering::Relaxed),
            "Requests queued"
        );
        Ok(handles)
    }

    pub fn stats(&self) -> DispatcherStats {
        let c = &self.counters;
        DispatcherStats {
            queued: c.queued.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            succeeded: c.succeeded.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rpm: self.config.rpm,
        }
    }

    /// Scheduling loop. Exits once the intake is closed and the queue drained.
    async fn schedule(
        mut job_rx: mpsc::UnboundedReceiver<JobHandle>,
        generator: Arc<dyn ImageGenerator>,
        budget: SharedBudget,
        config: DispatcherConfig,
    ) {
        let mut pending: VecDeque<JobHandle> = VecDeque::new();
        let mut intake_open = true;

        loop {
            if pending.is_empty() {
                if !intake_open {
                    break;
                }
                match job_rx.recv().await {
                    Some(job) => pending.push_back(job),
                    None => break,
                }
            }
            while let Ok(job) = job_rx.try_recv() {
                pending.push_back(job);
            }

            let Some(head) = pending.front() else {
                continue;
            };

            if head.is_cancelled() {
                if let Some(job) = pending.pop_front() {
                    debug!(job_id = %job.id(), "Skipping cancelled request");
                }
                continue;
            }

            if let Err(e) = generator.check(head.request()) {
                if let Some(job) = pending.pop_front() {
                    if job.reject(e) {
                        warn!(job_id = %job.id(), "Request rejected before sending");
                    }
                }
                continue;
            }

            let now = Instant::now();
            match admit(&budget, &mut pending, now) {
                Admission::Wait(slot) => {
                    let wake_at = slot + config.margin;
                    debug!(
                        waiting_ms = wake_at.saturating_duration_since(now).as_millis() as u64,
                        queued = pending.len(),
                        "Waiting for rate budget"
                    );

                    if intake_open {
                        tokio::select! {
                            _ = sleep_until(wake_at) => {}
                            job = job_rx.recv() => match job {
                                Some(job) => pending.push_back(job),
                                None => intake_open = false,
                            },
                        }
                    } else {
                        sleep_until(wake_at).await;
                    }
                }
                Admission::Dispatched { job, in_window } => {
                    info!(
                        job_id = %job.id(),
                        generator = generator.name(),
                        in_window,
                        "Dispatching request"
                    );

                    tokio::spawn(Self::execute(job, generator.clone(), config.call_timeout));
                }
                Admission::Cancelled | Admission::Empty => {}
            }
        }

        debug!("Dispatcher stopped");
    }

    /// Run one provider call and publish its outcome on the handle
    async fn execute(job: JobHandle, generator: Arc<dyn ImageGenerator>, call_timeout: Duration) {
        let result = match timeout(call_timeout, generator.generate(job.request())).await {
            Ok(result) => result,
            Err(_) => Err(AppError::Timeout(format!(
                "Request to {} timed out after {}s",
                generator.name(),
                call_timeout.as_secs()
            ))),
        };

        match &result {
            Ok(images) => {
                info!(job_id = %job.id(), images = images.len(), "Request succeeded");
            }
            Err(e) => {
                warn!(job_id = %job.id(), error = %e, "Request failed");
            }
        }

        job.finish(result);
    }
}

/// Check the budget and, if a slot is free, move the queue head to
/// `Dispatched` and record it. Both happen under the budget lock so
/// dispatchers sharing a budget cannot overbook it.
fn admit(
    budget: &Mutex<RateBudget>,
    pending: &mut VecDeque<JobHandle>,
    now: Instant,
) -> Admission {
    let mut budget = budget.lock();
    if let Some(slot) = budget.next_slot(now) {
        return Admission::Wait(slot);
    }

    let Some(job) = pending.pop_front() else {
        return Admission::Empty;
    };
    if !job.mark_dispatched() {
        return Admission::Cancelled;
    }

    budget.record(now);
    Admission::Dispatched {
        in_window: budget.in_window(now),
        job,
    }
}
