use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Deserialize)]
pub(super) struct ValueRange {
    #[serde(default)]
    pub values: Vec<Vec<String>>,
}

/// One summarized article, as written to the results sheet by the workflow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Article {
    pub id: String,
    pub title: String,
    pub url: String,
    pub publication: String,
    pub journalist: String,
    pub summary: String,
    pub collected_date: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ReportLink {
    pub download_link: String,
    pub view_link: String,
    /// Raw timestamp cell; the sheet stores local wall-clock time.
    pub updated_at: Option<String>,
}
