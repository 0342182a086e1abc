//! DALL-E Studio
//!
//! A local front-end for an Azure OpenAI DALL-E 3 deployment: prompts are
//! queued behind a requests-per-minute budget, dispatched concurrently, and
//! the resulting images can be inspected and saved.

pub mod api;
pub mod client;
pub mod config;
pub mod error;
pub mod queue;
pub mod response;
pub mod session;

pub use error::{AppError, Result};

use chrono::Utc;
use dashmap::DashMap;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{debug, info};
use uuid::Uuid;

use client::traits::ClientConfig;
use client::types::GenerationRequest;
use queue::{DispatcherConfig, JobHandle, RateBudget, SharedBudget};
use response::ImageStore;
use session::Session;

/// A submitted job as the UI sees it
#[derive(Clone)]
pub struct JobRecord {
    pub handle: JobHandle,
    /// Microsecond stamp used in saved file names
    pub stamp: i64,
    pub session_id: Uuid,
}

/// Application state shared across all handlers
pub struct AppState {
    pub settings: Arc<config::Settings>,
    pub session: RwLock<Option<Arc<Session>>>,
    pub jobs: DashMap<Uuid, JobRecord>,
    pub store: ImageStore,
    /// Outlives sessions, so reconnecting cannot reset the provider budget
    budget: SharedBudget,
}

impl AppState {
    pub fn new(settings: config::Settings) -> Self {
        let store = ImageStore::new(settings.save_dir.clone());
        let budget = RateBudget::shared(
            settings.connection.rpm,
            DispatcherConfig::default().window,
        );
        Self {
            settings: Arc::new(settings),
            session: RwLock::new(None),
            jobs: DashMap::new(),
            store,
            budget,
        }
    }

    /// The process-wide rate budget every session dispatches against
    pub fn budget(&self) -> SharedBudget {
        self.budget.clone()
    }

    /// Connect to a deployment, replacing any previous session
    pub fn connect(&self, client_config: ClientConfig, rpm: u32) -> Result<Arc<Session>> {
        let session = Session::connect(client_config, rpm, &self.settings, self.budget())?;
        Ok(self.install_session(session))
    }

    /// Make `session` the active one. Jobs still queued on the old session
    /// are cancelled.
    pub fn install_session(&self, session: Session) -> Arc<Session> {
        let session = Arc::new(session);
        let previous = self.session.write().replace(session.clone());
        if let Some(previous) = previous {
            self.cancel_queued(previous.id());
        }
        info!(session_id = %session.id(), "Session opened");
        session
    }

    /// Close the active session; returns false if there was none
    pub fn close_session(&self) -> bool {
        let previous = self.session.write().take();
        match previous {
            Some(previous) => {
                let cancelled = self.cancel_queued(previous.id());
                info!(session_id = %previous.id(), cancelled, "Session closed");
                true
            }
            None => false,
        }
    }

    pub fn current_session(&self) -> Result<Arc<Session>> {
        self.session.read().clone().ok_or(AppError::NoSession)
    }

    /// Validate, fan out into single-image requests and submit them all.
    /// Nothing is queued unless every part fits.
    pub fn submit(&self, request: GenerationRequest) -> Result<Vec<JobRecord>> {
        request.validate()?;
        let session = self.current_session()?;
        let handles = session.dispatcher().submit_all(request.fan_out())?;
        let base_stamp = Utc::now().timestamp_micros();

        let records: Vec<JobRecord> = handles
            .into_iter()
            .enumerate()
            .map(|(i, handle)| JobRecord {
                handle,
                stamp: base_stamp + i as i64,
                session_id: session.id(),
            })
            .collect();
        for record in &records {
            self.jobs.insert(record.handle.id(), record.clone());
        }

        self.evict_finished();
        Ok(records)
    }

    pub fn job(&self, id: Uuid) -> Result<JobRecord> {
        self.jobs
            .get(&id)
            .map(|entry| entry.value().clone())
            .ok_or_else(|| AppError::JobNotFound(id.to_string()))
    }

    /// Forget the oldest finished jobs while the registry exceeds `max_jobs`.
    /// Jobs still queued or in flight are always kept.
    fn evict_finished(&self) {
        let excess = self.jobs.len().saturating_sub(self.settings.max_jobs);
        if excess == 0 {
            return;
        }

        let mut finished: Vec<(i64, Uuid)> = self
            .jobs
            .iter()
            .filter(|entry| entry.value().handle.state().is_terminal())
            .map(|entry| (entry.value().stamp, *entry.key()))
            .collect();
        finished.sort_unstable();

        let evicted = finished
            .into_iter()
            .take(excess)
            .filter(|(_, id)| self.jobs.remove(id).is_some())
            .count();
        debug!(evicted, remaining = self.jobs.len(), "Evicted finished jobs");
    }

    fn cancel_queued(&self, session_id: Uuid) -> usize {
        self.jobs
            .iter()
            .filter(|entry| entry.value().session_id == session_id)
            .filter(|entry| entry.value().handle.cancel())
            .count()
    }
}
