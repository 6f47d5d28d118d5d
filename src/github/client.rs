use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode};

use super::models::{
    ArtifactLink, ArtifactList, DispatchRequest, ROUNDUP_ARTIFACT_PREFIX, WorkflowRun,
    WorkflowRunList,
};
use crate::config::GithubSettings;

const USER_AGENT: &str = "roundup-bot";
const GITHUB_API: &str = "https://api.github.com";
const API_VERSION: &str = "2022-11-28";

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TriggerError {
    #[error("{0} not configured")]
    NotConfigured(&'static str),

    #[error("{message}")]
    Rejected { status: u16, message: String },

    #[error("request failed: {0}")]
    Transport(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunStatusSummary {
    pub status: Option<String>,
    pub conclusion: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

/// The automation platform that runs the collect-and-summarize job.
///
/// Triggering is fire-and-forget: acceptance says nothing about progress.
#[async_trait]
pub trait WorkflowClient: Send + Sync {
    async fn trigger_workflow(&self) -> Result<(), TriggerError>;
    async fn list_workflow_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>>;
    async fn latest_artifact(&self) -> Result<Option<ArtifactLink>>;

    async fn latest_run_status(&self) -> Result<Option<RunStatusSummary>> {
        let runs = self.list_workflow_runs(1).await?;
        Ok(runs.into_iter().next().map(|run| RunStatusSummary {
            status: run.status,
            conclusion: run.conclusion,
            created_at: run.created_at,
            updated_at: run.updated_at,
        }))
    }
}

pub struct HttpGithubClient {
    client: Client,
    settings: GithubSettings,
}

impl HttpGithubClient {
    pub fn new(client: Client, settings: GithubSettings) -> Self {
        if settings.owner.is_none() || settings.repo.is_none() {
            tracing::warn!("GitHub owner/repo not configured");
        }
        Self { client, settings }
    }

    fn repo_url(&self) -> Result<String, TriggerError> {
        let owner = self
            .settings
            .owner
            .as_deref()
            .ok_or(TriggerError::NotConfigured("GitHub owner/repo"))?;
        let repo = self
            .settings
            .repo
            .as_deref()
            .ok_or(TriggerError::NotConfigured("GitHub owner/repo"))?;
        Ok(format!("{GITHUB_API}/repos/{owner}/{repo}"))
    }

    fn with_headers(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header("User-Agent", USER_AGENT)
            .header("Accept", "application/vnd.github+json")
            .header("X-GitHub-Api-Version", API_VERSION);
        match self.settings.token.as_deref() {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, url: &str, what: &str) -> Result<T> {
        let resp = self
            .with_headers(self.client.get(url))
            .send()
            .await
            .with_context(|| format!("failed to fetch {what}"))?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("GitHub API error {status} fetching {what}: {body}");
        }

        resp.json().await.with_context(|| format!("failed to parse {what}"))
    }
}

#[async_trait]
impl WorkflowClient for HttpGithubClient {
    async fn trigger_workflow(&self) -> Result<(), TriggerError> {
        if self.settings.token.is_none() {
            tracing::error!("GitHub token not configured");
            return Err(TriggerError::NotConfigured("GitHub token"));
        }
        let repo_url = self.repo_url().inspect_err(|_| {
            tracing::error!("GitHub owner/repo not configured");
        })?;

        let url = format!(
            "{repo_url}/actions/workflows/{}/dispatches",
            self.settings.workflow
        );
        let payload = DispatchRequest::new(&self.settings.git_ref, self.settings.test_mode);
        tracing::info!(url = %url, git_ref = %payload.git_ref, "Triggering workflow");

        let resp = self
            .with_headers(self.client.post(&url))
            .json(&payload)
            .send()
            .await
            .map_err(|e| {
                tracing::error!(error = %e, "Error triggering workflow");
                TriggerError::Transport(e.to_string())
            })?;

        let status = resp.status();
        if status == StatusCode::NO_CONTENT {
            tracing::info!("Workflow triggered");
            return Ok(());
        }

        let body = resp.text().await.unwrap_or_default();
        tracing::error!(status = status.as_u16(), body = %body, "GitHub rejected workflow dispatch");
        Err(TriggerError::Rejected {
            status: status.as_u16(),
            message: error_message(status.as_u16(), &body),
        })
    }

    async fn list_workflow_runs(&self, limit: usize) -> Result<Vec<WorkflowRun>> {
        let repo_url = self.repo_url()?;
        let url = format!("{repo_url}/actions/runs?per_page={limit}");
        let list: WorkflowRunList = self.get_json(&url, "workflow runs").await?;
        Ok(list.workflow_runs)
    }

    async fn latest_artifact(&self) -> Result<Option<ArtifactLink>> {
        let runs = self.list_workflow_runs(5).await?;
        let Some(run) = runs.into_iter().find(WorkflowRun::is_successful_roundup) else {
            tracing::info!("No successful roundup runs found");
            return Ok(None);
        };

        let url = format!("{}/actions/runs/{}/artifacts", self.repo_url()?, run.id);
        let list: ArtifactList = self.get_json(&url, "run artifacts").await?;
        Ok(pick_artifact(list, run.run_number))
    }
}

/// Best-effort human-readable message from a GitHub error body.
pub fn error_message(status: u16, body: &str) -> String {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|json| json.get("message")?.as_str().map(String::from))
        .filter(|m| !m.is_empty())
        .unwrap_or_else(|| format!("HTTP {status}"))
}

fn pick_artifact(list: ArtifactList, run_number: u64) -> Option<ArtifactLink> {
    list.artifacts
        .into_iter()
        .find(|a| a.name.starts_with(ROUNDUP_ARTIFACT_PREFIX))
        .map(|a| ArtifactLink {
            download_url: a.archive_download_url,
            name: a.name,
            run_number,
            created_at: a.created_at,
        })
}
