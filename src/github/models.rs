use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

pub const ROUNDUP_WORKFLOW_NAME: &str = "Collect & Summarize Articles";
pub const ROUNDUP_ARTIFACT_PREFIX: &str = "Reading-Roundup-";

#[derive(Debug, Clone, Serialize)]
pub struct DispatchRequest {
    #[serde(rename = "ref")]
    pub git_ref: String,
    pub inputs: DispatchInputs,
}

#[derive(Debug, Clone, Serialize)]
pub struct DispatchInputs {
    /// The workflow reads this as a string input.
    pub test_mode: String,
}

impl DispatchRequest {
    pub fn new(git_ref: &str, test_mode: bool) -> Self {
        Self {
            git_ref: git_ref.to_string(),
            inputs: DispatchInputs {
                test_mode: test_mode.to_string(),
            },
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRunList {
    #[serde(default)]
    pub workflow_runs: Vec<WorkflowRun>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub run_number: u64,
    /// queued, in_progress, completed
    #[serde(default)]
    pub status: Option<String>,
    /// success, failure, cancelled, ...
    #[serde(default)]
    pub conclusion: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl WorkflowRun {
    pub fn is_active(&self) -> bool {
        matches!(self.status.as_deref(), Some("in_progress") | Some("queued"))
    }

    pub fn is_successful_roundup(&self) -> bool {
        self.conclusion.as_deref() == Some("success")
            && self.name.as_deref() == Some(ROUNDUP_WORKFLOW_NAME)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactList {
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Artifact {
    pub name: String,
    pub archive_download_url: String,
    #[serde(default)]
    pub created_at: Option<DateTime<Utc>>,
}

/// Download pointer for a report produced by a successful workflow run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArtifactLink {
    pub download_url: String,
    pub name: String,
    pub run_number: u64,
    pub created_at: Option<DateTime<Utc>>,
}
