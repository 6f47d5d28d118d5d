use chrono::{DateTime, Utc};
use serde::Serialize;

#[derive(Debug, Clone, Serialize)]
pub struct PipelineEvent {
    pub timestamp: DateTime<Utc>,
    pub kind: PipelineEventKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineEventKind {
    RunRequested,
    RunDenied,
    RunTriggered,
    TriggerFailed,
    FetchScheduled,
    ResultsLoaded,
    ResultsEmpty,
    FetchFailed,
    RunCleared,
    Reset,
}

impl PipelineEventKind {
    /// Whether the operator should treat this as a problem.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            PipelineEventKind::RunDenied
                | PipelineEventKind::TriggerFailed
                | PipelineEventKind::ResultsEmpty
                | PipelineEventKind::FetchFailed
        )
    }
}
