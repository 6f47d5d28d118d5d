pub mod coordinator;
pub mod events;

use serde::Serialize;

use crate::github::client::TriggerError;
use crate::github::models::ArtifactLink;
use crate::sheets::models::ReportLink;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PipelineStatus {
    Idle,
    Running,
    Complete,
}

impl std::fmt::Display for PipelineStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PipelineStatus::Idle => write!(f, "idle"),
            PipelineStatus::Running => write!(f, "running"),
            PipelineStatus::Complete => write!(f, "complete"),
        }
    }
}

/// Everything the coordinator boundary can report back. None of these are
/// fatal; each one is meant to be shown to the operator.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("{reason} (available: {remaining})")]
    RateLimited { reason: String, remaining: String },

    #[error("pipeline is currently running")]
    AlreadyRunning,

    #[error("failed to trigger pipeline: {0}")]
    Trigger(#[from] TriggerError),

    #[error("failed to fetch results: {0}")]
    Fetch(String),

    #[error("no results available yet; the pipeline may still be running")]
    NoResults,

    #[error("no report available for download")]
    NoDownload,
}

/// Where the latest report can be downloaded from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "source", rename_all = "snake_case")]
pub enum DownloadLink {
    Report(ReportLink),
    Artifact(ArtifactLink),
}

impl DownloadLink {
    pub fn url(&self) -> &str {
        match self {
            DownloadLink::Report(link) => &link.download_link,
            DownloadLink::Artifact(link) => &link.download_url,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rate_limited_displays_reason_and_wait() {
        let err = PipelineError::RateLimited {
            reason: "Please wait 3 more minutes before running again".into(),
            remaining: "2m 10s".into(),
        };
        assert_eq!(
            err.to_string(),
            "Please wait 3 more minutes before running again (available: 2m 10s)"
        );
    }

    #[test]
    fn trigger_error_converts_via_from() {
        let err: PipelineError = TriggerError::Rejected {
            status: 401,
            message: "Bad credentials".into(),
        }
        .into();
        assert_eq!(err.to_string(), "failed to trigger pipeline: Bad credentials");
        assert!(matches!(err, PipelineError::Trigger(_)));
    }

    #[test]
    fn download_link_url() {
        let link = DownloadLink::Report(ReportLink {
            download_link: "https://drive.example/dl".into(),
            view_link: "https://drive.example/view".into(),
            updated_at: None,
        });
        assert_eq!(link.url(), "https://drive.example/dl");
    }

    #[test]
    fn status_display() {
        assert_eq!(PipelineStatus::Idle.to_string(), "idle");
        assert_eq!(PipelineStatus::Running.to_string(), "running");
        assert_eq!(PipelineStatus::Complete.to_string(), "complete");
    }
}
