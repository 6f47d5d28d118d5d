use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use percent_encoding::{NON_ALPHANUMERIC, utf8_percent_encode};
use reqwest::Client;

use super::models::{Article, ReportLink, ValueRange};
use crate::config::SheetsSettings;

const SHEETS_API: &str = "https://sheets.googleapis.com/v4/spreadsheets";
const ARTICLES_RANGE: &str = "Articles!A2:G1000";
const METADATA_RANGE: &str = "Metadata!A:C";
const LATEST_PDF_KEY: &str = "latest_pdf";
const LATEST_PDF_VIEW_KEY: &str = "latest_pdf_view";
const READONLY_SCOPE: &str = "https://www.googleapis.com/auth/spreadsheets.readonly";

/// Read-only access to the spreadsheet the workflow writes its results to.
#[async_trait]
pub trait ResultSource: Send + Sync {
    async fn fetch_articles(&self) -> Result<Vec<Article>>;
    async fn latest_report_link(&self) -> Result<Option<ReportLink>>;
}

pub struct HttpSheetsClient {
    client: Client,
    settings: SheetsSettings,
}

impl HttpSheetsClient {
    pub fn new(client: Client, settings: SheetsSettings) -> Self {
        let has_auth =
            settings.api_key.is_some() || settings.service_account_key_path.is_some();
        if settings.spreadsheet_id.is_none() || !has_auth {
            tracing::warn!("Google Sheets credentials not configured");
        }
        Self { client, settings }
    }

    fn range_url(&self, range: &str) -> Result<String> {
        let Some(sheet_id) = self.settings.spreadsheet_id.as_deref() else {
            anyhow::bail!("Google Sheets not configured: missing spreadsheet id");
        };
        if self.settings.api_key.is_none() && self.settings.service_account_key_path.is_none() {
            anyhow::bail!("Google Sheets not configured: missing API key or service account");
        }
        let range = utf8_percent_encode(range, NON_ALPHANUMERIC);
        Ok(format!("{SHEETS_API}/{sheet_id}/values/{range}"))
    }

    async fn get_range(&self, url: &str) -> Result<reqwest::Response> {
        let mut request = self.client.get(url);

        if let Some(key_path) = &self.settings.service_account_key_path {
            use gcp_auth::TokenProvider;
            let sa = gcp_auth::CustomServiceAccount::from_file(key_path)
                .context("Failed to load service account key file")?;
            let token = sa
                .token(&[READONLY_SCOPE])
                .await
                .context("Failed to get Google access token")?;
            request = request.bearer_auth(token.as_str());
        } else if let Some(key) = &self.settings.api_key {
            request = request.query(&[("key", key)]);
        }

        request.send().await.context("Failed to fetch Google Sheets")
    }
}

#[async_trait]
impl ResultSource for HttpSheetsClient {
    async fn fetch_articles(&self) -> Result<Vec<Article>> {
        let url = self.range_url(ARTICLES_RANGE)?;
        let resp = self.get_range(&url).await?;
        if !resp.status().is_success() {
            let status = resp.status();
            let body = resp.text().await.unwrap_or_default();
            anyhow::bail!("Google Sheets API returned {status}: {body}");
        }

        let sheet: ValueRange = resp.json().await.context("Failed to parse Sheets response")?;
        let articles = parse_articles(&sheet.values, Utc::now());
        tracing::info!(count = articles.len(), "Fetched articles from Google Sheets");
        Ok(articles)
    }

    async fn latest_report_link(&self) -> Result<Option<ReportLink>> {
        let url = self.range_url(METADATA_RANGE)?;
        let resp = self.get_range(&url).await?;
        if !resp.status().is_success() {
            // The metadata sheet only exists once a report has been published
            tracing::debug!(status = %resp.status(), "Metadata sheet unavailable");
            return Ok(None);
        }

        let sheet: ValueRange = resp.json().await.context("Failed to parse Sheets response")?;
        Ok(find_report_link(&sheet.values))
    }
}

/// Map rows positionally onto articles. Missing cells get placeholders
/// instead of dropping the row, so `article-<index>` is the sheet row offset.
///
/// A missing or unreadable collected date falls back to `now`.
fn parse_articles(values: &[Vec<String>], now: DateTime<Utc>) -> Vec<Article> {
    values
        .iter()
        .enumerate()
        .map(|(index, row)| {
            let cell = |i: usize| row.get(i).map(|s| s.trim()).filter(|s| !s.is_empty());
            let text = |i: usize, default: &str| cell(i).unwrap_or(default).to_string();

            Article {
                id: cell(0)
                    .map(String::from)
                    .unwrap_or_else(|| format!("article-{index}")),
                title: text(1, "Untitled"),
                url: text(2, "#"),
                publication: text(3, "Unknown"),
                journalist: text(4, "Unknown"),
                summary: text(5, "No summary available"),
                collected_date: match cell(6) {
                    Some(raw) => parse_date(raw).unwrap_or_else(|| {
                        tracing::warn!(row = index, value = raw, "Unrecognised collected date");
                        now
                    }),
                    None => now,
                },
            }
        })
        .collect()
}

fn find_report_link(values: &[Vec<String>]) -> Option<ReportLink> {
    let row_for = |key: &str| values.iter().find(|row| row.first().map(String::as_str) == Some(key));
    let value_at = |row: &Vec<String>, i: usize| row.get(i).filter(|s| !s.is_empty()).cloned();

    let pdf_row = row_for(LATEST_PDF_KEY)?;
    let download_link = value_at(pdf_row, 1)?;
    let view_link = row_for(LATEST_PDF_VIEW_KEY)
        .and_then(|row| value_at(row, 1))
        .unwrap_or_else(|| download_link.clone());

    Some(ReportLink {
        download_link,
        view_link,
        updated_at: value_at(pdf_row, 2),
    })
}

fn parse_date(s: &str) -> Option<DateTime<Utc>> {
    // Try ISO 8601 first, then the formats the workflow and Sheets produce
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Some(dt.with_timezone(&Utc));
    }
    for fmt in &["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S", "%m/%d/%Y %H:%M:%S"] {
        if let Ok(ndt) = NaiveDateTime::parse_from_str(s, fmt) {
            return Some(ndt.and_utc());
        }
    }
    for fmt in &["%Y-%m-%d", "%m/%d/%Y", "%d/%m/%Y", "%b %d, %Y"] {
        if let Ok(nd) = NaiveDate::parse_from_str(s, fmt) {
            return nd.and_hms_opt(0, 0, 0).map(|ndt| ndt.and_utc());
        }
    }
    None
}
