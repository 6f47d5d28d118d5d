use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use super::events::{PipelineEvent, PipelineEventKind};
use super::{DownloadLink, PipelineError, PipelineStatus};
use crate::github::client::WorkflowClient;
use crate::ratelimit::{DebugInfo, RateLimiter, RunDecision, format_remaining};
use crate::sheets::client::ResultSource;
use crate::sheets::models::Article;

const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Copy)]
enum FetchOrigin {
    Scheduled,
    Manual,
}

struct Session {
    status: PipelineStatus,
    /// Set while a trigger request is in flight so a second request cannot
    /// slip past the limiter before the start is recorded.
    triggering: bool,
    articles: Vec<Article>,
    last_run_time: Option<DateTime<Utc>>,
}

struct Inner {
    limiter: RateLimiter,
    workflow: Arc<dyn WorkflowClient>,
    results: Arc<dyn ResultSource>,
    fetch_window: Duration,
    session: Mutex<Session>,
    pending: Mutex<Option<JoinHandle<()>>>,
    events_tx: broadcast::Sender<PipelineEvent>,
}

/// Drives one pipeline run from request to results.
///
/// The external job gives no completion signal, so after a successful
/// trigger a single fetch is scheduled `fetch_window` later. The operator
/// can fetch earlier with [`request_view_results`](Self::request_view_results),
/// which cancels the scheduled one. Dropping the coordinator cancels it too.
pub struct PipelineCoordinator {
    inner: Arc<Inner>,
}

impl PipelineCoordinator {
    pub fn new(
        limiter: RateLimiter,
        workflow: Arc<dyn WorkflowClient>,
        results: Arc<dyn ResultSource>,
        fetch_window: Duration,
    ) -> Self {
        let status = if limiter.get_state().is_some_and(|s| s.is_running) {
            PipelineStatus::Running
        } else {
            PipelineStatus::Idle
        };
        let (events_tx, _) = broadcast::channel(EVENT_BUFFER);

        Self {
            inner: Arc::new(Inner {
                limiter,
                workflow,
                results,
                fetch_window,
                session: Mutex::new(Session {
                    status,
                    triggering: false,
                    articles: Vec::new(),
                    last_run_time: None,
                }),
                pending: Mutex::new(None),
                events_tx,
            }),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<PipelineEvent> {
        self.inner.events_tx.subscribe()
    }

    pub fn current_status(&self) -> PipelineStatus {
        lock(&self.inner.session).status
    }

    pub fn articles(&self) -> Vec<Article> {
        lock(&self.inner.session).articles.clone()
    }

    pub fn last_run_time(&self) -> Option<DateTime<Utc>> {
        lock(&self.inner.session).last_run_time
    }

    pub fn run_decision(&self) -> RunDecision {
        self.inner.limiter.can_run_pipeline()
    }

    pub fn remaining_time(&self) -> String {
        self.inner.limiter.format_remaining_time()
    }

    pub fn debug_info(&self) -> DebugInfo {
        self.inner.limiter.debug_info()
    }

    pub fn fetch_window(&self) -> Duration {
        self.inner.fetch_window
    }

    #[cfg(test)]
    pub fn has_pending_fetch(&self) -> bool {
        lock(&self.inner.pending).as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Check the cooldown, trigger the workflow and schedule the result fetch.
    pub async fn request_run(&self) -> Result<(), PipelineError> {
        let inner = &self.inner;
        {
            let mut session = lock(&inner.session);
            if session.triggering {
                return Err(PipelineError::AlreadyRunning);
            }

            let decision = inner.limiter.can_run_pipeline();
            if !decision.can_run {
                let err = if inner.limiter.get_state().is_some_and(|s| s.is_running) {
                    PipelineError::AlreadyRunning
                } else {
                    PipelineError::RateLimited {
                        reason: decision.reason.clone(),
                        remaining: format_remaining(&decision),
                    }
                };
                tracing::info!(reason = %decision.reason, "Run request denied");
                inner.emit(PipelineEventKind::RunDenied, err.to_string());
                return Err(err);
            }

            session.triggering = true;
            session.status = PipelineStatus::Running;
            session.articles.clear();
            session.last_run_time = None;
        }
        let mut guard = TriggerGuard {
            session: &inner.session,
            accepted: false,
        };
        inner.emit(PipelineEventKind::RunRequested, "Triggering pipeline");

        match inner.workflow.trigger_workflow().await {
            Ok(()) => {
                inner.limiter.record_pipeline_start();
                let fetch_at = self.schedule_fetch();
                guard.accepted = true;
                drop(guard);

                inner.emit(PipelineEventKind::RunTriggered, "Pipeline triggered");
                inner.emit(
                    PipelineEventKind::FetchScheduled,
                    format!("Results will be fetched at {}", fetch_at.format("%H:%M:%S UTC")),
                );
                Ok(())
            }
            Err(e) => {
                drop(guard);
                tracing::warn!(error = %e, "Pipeline trigger failed");
                inner.emit(PipelineEventKind::TriggerFailed, e.to_string());
                Err(e.into())
            }
        }
    }

    /// Fetch results now, cancelling any scheduled fetch.
    pub async fn request_view_results(&self) -> Result<Vec<Article>, PipelineError> {
        self.cancel_pending();
        self.inner.load_results(FetchOrigin::Manual).await
    }

    /// Link to the latest report: the metadata sheet first, then the newest
    /// successful workflow artifact.
    pub async fn request_download(&self) -> Result<DownloadLink, PipelineError> {
        match self.inner.results.latest_report_link().await {
            Ok(Some(link)) => return Ok(DownloadLink::Report(link)),
            Ok(None) => tracing::info!("No report link in metadata sheet"),
            Err(e) => tracing::warn!(error = %e, "Failed to read report link"),
        }

        match self.inner.workflow.latest_artifact().await {
            Ok(Some(artifact)) => Ok(DownloadLink::Artifact(artifact)),
            Ok(None) => Err(PipelineError::NoDownload),
            Err(e) => {
                tracing::warn!(error = %e, "Failed to look up workflow artifact");
                Err(PipelineError::NoDownload)
            }
        }
    }

    /// Leave the complete view. Persisted run state is not touched.
    pub fn clear_for_retry(&self) -> bool {
        let mut session = lock(&self.inner.session);
        if session.status != PipelineStatus::Complete {
            return false;
        }
        session.status = PipelineStatus::Idle;
        session.articles.clear();
        session.last_run_time = None;
        true
    }

    /// Repair a persisted run stuck in "running".
    pub fn manual_clear_running(&self) -> bool {
        let cleared = self.inner.limiter.manual_clear_running();
        if cleared {
            self.inner
                .emit(PipelineEventKind::RunCleared, "Cleared stuck running state");
        }
        cleared
    }

    pub fn reset(&self) {
        self.inner.limiter.clear_all();
        self.inner
            .emit(PipelineEventKind::Reset, "Rate limit data cleared");
    }

    /// Block until the scheduled fetch (if any) has run.
    pub async fn wait_for_scheduled_fetch(&self) {
        let handle = lock(&self.inner.pending).take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                if !e.is_cancelled() {
                    tracing::error!(error = %e, "Scheduled fetch task failed");
                }
            }
        }
    }

    fn schedule_fetch(&self) -> DateTime<Utc> {
        let inner = Arc::clone(&self.inner);
        let window = self.inner.fetch_window;

        let handle = tokio::spawn(async move {
            tokio::time::sleep(window).await;
            // Stays in `pending` until done so a manual view can still abort it
            if let Err(e) = inner.load_results(FetchOrigin::Scheduled).await {
                tracing::warn!(error = %e, "Scheduled fetch did not complete the run");
            }
        });

        if let Some(previous) = lock(&self.inner.pending).replace(handle) {
            previous.abort();
        }

        let fetch_at = Utc::now()
            + chrono::Duration::from_std(window).unwrap_or_else(|_| chrono::Duration::zero());
        tracing::info!(window_secs = window.as_secs(), fetch_at = %fetch_at, "Scheduled result fetch");
        fetch_at
    }

    fn cancel_pending(&self) {
        if let Some(handle) = lock(&self.inner.pending).take() {
            if !handle.is_finished() {
                handle.abort();
                tracing::debug!("Cancelled scheduled fetch");
            }
        }
    }
}

impl Drop for PipelineCoordinator {
    fn drop(&mut self) {
        self.cancel_pending();
    }
}

/// Releases the in-flight trigger flag however `request_run` ends, including
/// when its future is dropped mid-request. Unless the trigger was accepted the
/// session falls back to idle.
struct TriggerGuard<'a> {
    session: &'a Mutex<Session>,
    accepted: bool,
}

impl Drop for TriggerGuard<'_> {
    fn drop(&mut self) {
        let mut session = lock(self.session);
        session.triggering = false;
        if !self.accepted {
            session.status = PipelineStatus::Idle;
        }
    }
}

impl Inner {
    fn emit(&self, kind: PipelineEventKind, message: impl Into<String>) {
        let _ = self.events_tx.send(PipelineEvent {
            timestamp: Utc::now(),
            kind,
            message: message.into(),
        });
    }

    fn set_status(&self, status: PipelineStatus) {
        lock(&self.session).status = status;
    }

    async fn load_results(&self, origin: FetchOrigin) -> Result<Vec<Article>, PipelineError> {
        tracing::info!(origin = ?origin, "Fetching results");

        match self.results.fetch_articles().await {
            Ok(articles) if !articles.is_empty() => {
                // Viewing old results must not restart the cooldown
                if self.limiter.get_state().is_some_and(|s| s.is_running) {
                    self.limiter.record_pipeline_complete();
                }

                let last_run_time = articles.iter().map(|a| a.collected_date).max();
                {
                    let mut session = lock(&self.session);
                    session.status = PipelineStatus::Complete;
                    session.articles = articles.clone();
                    session.last_run_time = last_run_time;
                }

                tracing::info!(count = articles.len(), origin = ?origin, "Results loaded");
                self.emit(
                    PipelineEventKind::ResultsLoaded,
                    format!("Loaded {} articles", articles.len()),
                );
                Ok(articles)
            }
            Ok(_) => {
                // Persisted state stays "running": the job may simply be slow
                self.set_status(PipelineStatus::Idle);
                tracing::warn!(origin = ?origin, "No results found");
                self.emit(
                    PipelineEventKind::ResultsEmpty,
                    "No results yet; retry later or clear the running state",
                );
                Err(PipelineError::NoResults)
            }
            Err(e) => {
                self.set_status(PipelineStatus::Idle);
                tracing::error!(error = %e, origin = ?origin, "Failed to fetch results");
                let message = format!("{e:#}");
                self.emit(PipelineEventKind::FetchFailed, message.clone());
                Err(PipelineError::Fetch(message))
            }
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
