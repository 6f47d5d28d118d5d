use std::path::PathBuf;
use std::time::Duration;

const DEFAULT_WORKFLOW: &str = "collect-articles.yml";
const DEFAULT_REF: &str = "master";
const DEFAULT_FETCH_WINDOW_SECS: u64 = 600;

/// Workflow dispatch target. Every field is optional so a missing value can
/// surface as a configuration failure at call time instead of at startup.
#[derive(Debug, Clone, Default)]
pub struct GithubSettings {
    pub owner: Option<String>,
    pub repo: Option<String>,
    pub token: Option<String>,
    pub workflow: String,
    pub git_ref: String,
    pub test_mode: bool,
}

#[derive(Debug, Clone, Default)]
pub struct SheetsSettings {
    pub spreadsheet_id: Option<String>,
    pub api_key: Option<String>,
    pub service_account_key_path: Option<PathBuf>,
}

/// Application configuration loaded from environment variables.
pub struct Config {
    pub github: GithubSettings,
    pub sheets: SheetsSettings,
    pub fetch_window: Duration,
    pub stale_after: Option<Duration>,
    pub data_dir: PathBuf,
    pub sentry_dsn: Option<String>,
    pub environment: String,
}

/// Raw string values as they come from the environment.
#[derive(Default)]
pub struct RawConfig<'a> {
    pub github_owner: Option<&'a str>,
    pub github_repo: Option<&'a str>,
    pub github_token: Option<&'a str>,
    pub github_workflow: Option<&'a str>,
    pub github_ref: Option<&'a str>,
    pub test_mode: Option<&'a str>,
    pub sheet_id: Option<&'a str>,
    pub api_key: Option<&'a str>,
    pub service_account_key: Option<&'a str>,
    pub fetch_window_secs: Option<&'a str>,
    pub stale_after_mins: Option<&'a str>,
    pub data_dir: Option<&'a str>,
    pub sentry_dsn: Option<&'a str>,
    pub environment: Option<&'a str>,
}

impl Config {
    pub fn from_env() -> Self {
        let var = |name: &str| std::env::var(name).ok();
        let github_owner = var("GITHUB_OWNER");
        let github_repo = var("GITHUB_REPO");
        let github_token = var("GITHUB_TOKEN");
        let github_workflow = var("GITHUB_WORKFLOW");
        let github_ref = var("GITHUB_REF");
        let test_mode = var("ROUNDUP_TEST_MODE");
        let sheet_id = var("GOOGLE_SHEET_ID");
        let api_key = var("GOOGLE_API_KEY");
        let service_account_key = var("GOOGLE_SERVICE_ACCOUNT_KEY");
        let fetch_window_secs = var("ROUNDUP_FETCH_WINDOW_SECS");
        let stale_after_mins = var("ROUNDUP_STALE_AFTER_MINS");
        let data_dir = var("ROUNDUP_DATA_DIR");
        let sentry_dsn = var("SENTRY_DSN");
        let environment = var("ENVIRONMENT");

        Self::from_raw_values(RawConfig {
            github_owner: github_owner.as_deref(),
            github_repo: github_repo.as_deref(),
            github_token: github_token.as_deref(),
            github_workflow: github_workflow.as_deref(),
            github_ref: github_ref.as_deref(),
            test_mode: test_mode.as_deref(),
            sheet_id: sheet_id.as_deref(),
            api_key: api_key.as_deref(),
            service_account_key: service_account_key.as_deref(),
            fetch_window_secs: fetch_window_secs.as_deref(),
            stale_after_mins: stale_after_mins.as_deref(),
            data_dir: data_dir.as_deref(),
            sentry_dsn: sentry_dsn.as_deref(),
            environment: environment.as_deref(),
        })
    }

    /// Build a Config from raw string values (as they would come from env vars).
    /// Used directly in tests to avoid mutating process-global environment.
    pub fn from_raw_values(raw: RawConfig<'_>) -> Self {
        let github = GithubSettings {
            owner: non_empty(raw.github_owner),
            repo: non_empty(raw.github_repo),
            token: non_empty(raw.github_token),
            workflow: non_empty(raw.github_workflow).unwrap_or_else(|| DEFAULT_WORKFLOW.to_string()),
            git_ref: non_empty(raw.github_ref).unwrap_or_else(|| DEFAULT_REF.to_string()),
            test_mode: raw.test_mode.is_some_and(parse_flag),
        };

        let sheets = SheetsSettings {
            spreadsheet_id: non_empty(raw.sheet_id),
            api_key: non_empty(raw.api_key),
            service_account_key_path: non_empty(raw.service_account_key).map(PathBuf::from),
        };

        let fetch_window = raw
            .fetch_window_secs
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(DEFAULT_FETCH_WINDOW_SECS));

        let stale_after = raw
            .stale_after_mins
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|mins| *mins > 0)
            .map(|mins| Duration::from_secs(mins * 60));

        let data_dir = non_empty(raw.data_dir)
            .map(PathBuf::from)
            .unwrap_or_else(default_data_dir);

        let environment = non_empty(raw.environment).unwrap_or_else(|| "local".to_string());

        Config {
            github,
            sheets,
            fetch_window,
            stale_after,
            data_dir,
            sentry_dsn: non_empty(raw.sentry_dsn),
            environment,
        }
    }
}

fn non_empty(value: Option<&str>) -> Option<String> {
    value.map(str::trim).filter(|s| !s.is_empty()).map(String::from)
}

fn parse_flag(value: &str) -> bool {
    matches!(value.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on")
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".roundup")
}
