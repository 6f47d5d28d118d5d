pub mod store;

use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use store::StateStore;

pub const COOLDOWN_MINUTES: i64 = 30;
pub const STORAGE_KEY: &str = "pipeline_rate_limit";

/// Persisted run-state. Always written whole; never patched field by field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRecord {
    pub last_run_start: Option<DateTime<Utc>>,
    pub is_running: bool,
    pub last_run_complete: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunDecision {
    pub can_run: bool,
    pub reason: String,
    pub next_available_time: Option<DateTime<Utc>>,
    pub time_remaining_ms: Option<u64>,
}

impl RunDecision {
    fn allow(reason: &str) -> Self {
        Self {
            can_run: true,
            reason: reason.to_string(),
            next_available_time: None,
            time_remaining_ms: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DebugInfo {
    pub state: Option<RateLimitRecord>,
    pub check: RunDecision,
    pub current_time: DateTime<Utc>,
    pub cooldown_minutes: i64,
}

pub fn cooldown() -> Duration {
    Duration::minutes(COOLDOWN_MINUTES)
}

/// Cooldown decision for a record at a given instant.
pub fn decide(record: Option<&RateLimitRecord>, now: DateTime<Utc>) -> RunDecision {
    let Some(record) = record else {
        return RunDecision::allow("No previous runs");
    };

    if record.is_running {
        return RunDecision {
            can_run: false,
            reason: "Pipeline is currently running".to_string(),
            next_available_time: None,
            time_remaining_ms: None,
        };
    }

    let Some(last_relevant) = record.last_run_complete.or(record.last_run_start) else {
        return RunDecision::allow("No valid previous run time");
    };

    let remaining = cooldown() - (now - last_relevant);
    let remaining_ms = remaining.num_milliseconds();
    if remaining_ms > 0 {
        // Minutes in the reason round up; format_remaining_time truncates.
        let minutes = (remaining_ms + 59_999) / 60_000;
        let plural = if minutes != 1 { "s" } else { "" };
        return RunDecision {
            can_run: false,
            reason: format!("Please wait {minutes} more minute{plural} before running again"),
            next_available_time: Some(last_relevant + cooldown()),
            time_remaining_ms: Some(remaining_ms as u64),
        };
    }

    RunDecision::allow("Cooldown period completed")
}

/// Human-readable wait for a decision, truncated to whole units.
pub fn format_remaining(decision: &RunDecision) -> String {
    if decision.can_run {
        return "Available now".to_string();
    }

    let Some(ms) = decision.time_remaining_ms.filter(|ms| *ms > 0) else {
        return "Calculating...".to_string();
    };

    let minutes = ms / 60_000;
    let seconds = (ms % 60_000) / 1000;
    if minutes > 0 {
        format!("{minutes}m {seconds}s")
    } else {
        format!("{seconds}s")
    }
}

/// Client-side guard against overlapping or too-frequent pipeline runs.
///
/// All storage failures are logged and treated as "no record"; nothing here
/// returns an error to the caller.
pub struct RateLimiter {
    store: Arc<dyn StateStore>,
    clock: Arc<dyn Clock>,
    stale_after: Option<Duration>,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn StateStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            stale_after: None,
        }
    }

    /// Treat a running record older than `after` as abandoned and clear it
    /// on the next check.
    pub fn with_stale_after(mut self, after: Option<std::time::Duration>) -> Self {
        self.stale_after = after.and_then(|d| Duration::from_std(d).ok());
        self
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn get_state(&self) -> Option<RateLimitRecord> {
        let raw = match self.store.get(STORAGE_KEY) {
            Ok(Some(raw)) => raw,
            Ok(None) => return None,
            Err(e) => {
                tracing::error!(error = %e, "Failed to read rate limit state");
                return None;
            }
        };

        match serde_json::from_str(&raw) {
            Ok(record) => Some(record),
            Err(e) => {
                tracing::warn!(error = %e, "Ignoring unparseable rate limit state");
                None
            }
        }
    }

    pub fn save_state(&self, record: &RateLimitRecord) {
        let result = serde_json::to_string(record)
            .map_err(anyhow::Error::from)
            .and_then(|json| self.store.set(STORAGE_KEY, &json));
        if let Err(e) = result {
            tracing::error!(error = %e, "Failed to save rate limit state");
        }
    }

    pub fn record_pipeline_start(&self) {
        let now = self.now();
        self.save_state(&RateLimitRecord {
            last_run_start: Some(now),
            is_running: true,
            last_run_complete: None,
        });
        tracing::info!(at = %now, "Pipeline start recorded");
    }

    pub fn record_pipeline_complete(&self) {
        let Some(state) = self.get_state() else {
            return;
        };

        let now = self.now();
        self.save_state(&RateLimitRecord {
            last_run_start: state.last_run_start,
            is_running: false,
            last_run_complete: Some(now),
        });
        tracing::info!(at = %now, "Pipeline completion recorded");
    }

    pub fn can_run_pipeline(&self) -> RunDecision {
        self.expire_stale_run();
        decide(self.get_state().as_ref(), self.now())
    }

    pub fn format_remaining_time(&self) -> String {
        format_remaining(&self.can_run_pipeline())
    }

    /// Operator recovery for a run stuck in "running". Returns whether the
    /// record was changed. Does not check that the external job finished.
    pub fn manual_clear_running(&self) -> bool {
        match self.get_state() {
            Some(state) if state.is_running => {
                self.save_state(&RateLimitRecord {
                    is_running: false,
                    last_run_complete: Some(self.now()),
                    ..state
                });
                tracing::info!("Manually cleared running state");
                true
            }
            _ => false,
        }
    }

    pub fn clear_all(&self) {
        match self.store.remove(STORAGE_KEY) {
            Ok(()) => tracing::info!("Rate limit data cleared"),
            Err(e) => tracing::error!(error = %e, "Failed to clear rate limit state"),
        }
    }

    pub fn debug_info(&self) -> DebugInfo {
        let check = self.can_run_pipeline();
        DebugInfo {
            state: self.get_state(),
            check,
            current_time: self.now(),
            cooldown_minutes: COOLDOWN_MINUTES,
        }
    }

    fn expire_stale_run(&self) {
        let Some(limit) = self.stale_after else {
            return;
        };
        let Some(state) = self.get_state() else {
            return;
        };
        if !state.is_running {
            return;
        }
        let Some(started) = state.last_run_start else {
            return;
        };

        let age = self.now() - started;
        if age > limit {
            tracing::warn!(
                started = %started,
                age_mins = age.num_minutes(),
                "Running flag outlived stale limit, clearing"
            );
            self.manual_clear_running();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use super::store::MemoryStateStore;

    fn t0() -> DateTime<Utc> {
        "2025-03-10T09:00:00Z".parse().unwrap()
    }

    fn limiter() -> (RateLimiter, Arc<ManualClock>, Arc<MemoryStateStore>) {
        let clock = Arc::new(ManualClock::new(t0()));
        let store = Arc::new(MemoryStateStore::new());
        let limiter = RateLimiter::new(store.clone(), clock.clone());
        (limiter, clock, store)
    }

    #[test]
    fn test_empty_store_can_run() {
        let (limiter, _, _) = limiter();
        let decision = limiter.can_run_pipeline();
        assert!(decision.can_run);
        assert_eq!(decision.reason, "No previous runs");
        assert!(decision.next_available_time.is_none());
    }

    #[test]
    fn test_running_blocks_regardless_of_elapsed_time() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();

        let decision = limiter.can_run_pipeline();
        assert!(!decision.can_run);
        assert_eq!(decision.reason, "Pipeline is currently running");
        assert!(decision.next_available_time.is_none());
        assert!(decision.time_remaining_ms.is_none());

        clock.advance(Duration::days(3));
        assert!(!limiter.can_run_pipeline().can_run);
        assert_eq!(limiter.format_remaining_time(), "Calculating...");
    }

    #[test]
    fn test_cooldown_after_complete() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        clock.advance(Duration::minutes(8));
        limiter.record_pipeline_complete();
        let completed_at = clock.now();

        clock.advance(Duration::minutes(29));
        let decision = limiter.can_run_pipeline();
        assert!(!decision.can_run);
        assert_eq!(decision.time_remaining_ms, Some(60_000));
        assert_eq!(
            decision.next_available_time,
            Some(completed_at + Duration::minutes(30))
        );
        assert_eq!(decision.reason, "Please wait 1 more minute before running again");

        clock.advance(Duration::minutes(1));
        let decision = limiter.can_run_pipeline();
        assert!(decision.can_run);
        assert_eq!(decision.reason, "Cooldown period completed");
    }

    #[test]
    fn test_complete_preserves_start_and_is_noop_without_record() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_complete();
        assert!(limiter.get_state().is_none());

        limiter.record_pipeline_start();
        clock.advance(Duration::minutes(5));
        limiter.record_pipeline_complete();

        let state = limiter.get_state().unwrap();
        assert_eq!(state.last_run_start, Some(t0()));
        assert!(!state.is_running);
        assert_eq!(state.last_run_complete, Some(t0() + Duration::minutes(5)));
    }

    #[test]
    fn test_start_resets_previous_completion() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        limiter.record_pipeline_complete();
        clock.advance(Duration::hours(1));
        limiter.record_pipeline_start();

        let state = limiter.get_state().unwrap();
        assert!(state.is_running);
        assert!(state.last_run_complete.is_none());
        assert_eq!(state.last_run_start, Some(t0() + Duration::hours(1)));
    }

    #[test]
    fn test_cooldown_falls_back_to_start_time() {
        let (limiter, clock, _) = limiter();
        limiter.save_state(&RateLimitRecord {
            last_run_start: Some(t0()),
            is_running: false,
            last_run_complete: None,
        });
        clock.advance(Duration::minutes(10));
        let decision = limiter.can_run_pipeline();
        assert!(!decision.can_run);
        assert_eq!(decision.time_remaining_ms, Some(20 * 60_000));
        assert_eq!(decision.reason, "Please wait 20 more minutes before running again");
    }

    #[test]
    fn test_record_without_any_time_can_run() {
        let (limiter, _, _) = limiter();
        limiter.save_state(&RateLimitRecord {
            last_run_start: None,
            is_running: false,
            last_run_complete: None,
        });
        let decision = limiter.can_run_pipeline();
        assert!(decision.can_run);
        assert_eq!(decision.reason, "No valid previous run time");
    }

    #[test]
    fn test_minutes_ceiling_vs_format_floor() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        limiter.record_pipeline_complete();
        // 14m 30.5s remaining
        clock.advance(Duration::minutes(15) + Duration::milliseconds(29_500));

        let decision = limiter.can_run_pipeline();
        assert_eq!(decision.time_remaining_ms, Some(14 * 60_000 + 30_500));
        assert_eq!(decision.reason, "Please wait 15 more minutes before running again");
        assert_eq!(limiter.format_remaining_time(), "14m 30s");
    }

    #[test]
    fn test_format_seconds_only_under_a_minute() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        limiter.record_pipeline_complete();
        clock.advance(Duration::minutes(29) + Duration::milliseconds(15_200));
        assert_eq!(limiter.format_remaining_time(), "44s");
    }

    #[test]
    fn test_format_never_negative_and_available_at_boundary() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        limiter.record_pipeline_complete();

        clock.advance(Duration::minutes(30) - Duration::milliseconds(1));
        let text = limiter.format_remaining_time();
        assert_eq!(text, "0s");
        assert!(!text.contains('-'));

        clock.advance(Duration::milliseconds(1));
        assert_eq!(limiter.format_remaining_time(), "Available now");

        clock.advance(Duration::hours(5));
        assert_eq!(limiter.format_remaining_time(), "Available now");
    }

    #[test]
    fn test_manual_clear_running_starts_cooldown() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        clock.advance(Duration::hours(2));

        assert!(limiter.manual_clear_running());
        let state = limiter.get_state().unwrap();
        assert!(!state.is_running);
        assert_eq!(state.last_run_start, Some(t0()));
        assert_eq!(state.last_run_complete, Some(clock.now()));

        let decision = limiter.can_run_pipeline();
        assert!(!decision.can_run);
        assert_eq!(decision.time_remaining_ms, Some(30 * 60_000));
    }

    #[test]
    fn test_manual_clear_when_not_running_is_noop() {
        let (limiter, clock, _) = limiter();
        limiter.record_pipeline_start();
        limiter.record_pipeline_complete();
        let before = limiter.get_state();

        clock.advance(Duration::minutes(3));
        assert!(!limiter.manual_clear_running());
        assert_eq!(limiter.get_state(), before);

        limiter.clear_all();
        assert!(!limiter.manual_clear_running());
        assert!(limiter.get_state().is_none());
    }

    #[test]
    fn test_save_then_get_round_trips() {
        let (limiter, _, _) = limiter();
        let record = RateLimitRecord {
            last_run_start: Some(t0() + Duration::nanoseconds(123_456_789)),
            is_running: false,
            last_run_complete: Some(t0() + Duration::minutes(9)),
        };
        limiter.save_state(&record);
        assert_eq!(limiter.get_state(), Some(record));
    }

    #[test]
    fn test_corrupt_state_is_treated_as_absent() {
        let (limiter, _, store) = limiter();
        store.set(STORAGE_KEY, "{not json").unwrap();
        assert!(limiter.get_state().is_none());
        assert!(limiter.can_run_pipeline().can_run);
    }

    #[test]
    fn test_record_uses_camel_case_keys() {
        let (limiter, _, store) = limiter();
        limiter.record_pipeline_start();
        let raw = store.get(STORAGE_KEY).unwrap().unwrap();
        let value: serde_json::Value = serde_json::from_str(&raw).unwrap();
        assert_eq!(value["isRunning"], true);
        assert!(value["lastRunStart"].is_string());
        assert!(value["lastRunComplete"].is_null());
    }

    #[test]
    fn test_clear_all_removes_record() {
        let (limiter, _, _) = limiter();
        limiter.record_pipeline_start();
        limiter.clear_all();
        assert!(limiter.get_state().is_none());
        assert!(limiter.can_run_pipeline().can_run);
    }

    #[test]
    fn test_stale_run_expires_when_configured() {
        let (limiter, clock, _) = limiter();
        let limiter = limiter.with_stale_after(Some(std::time::Duration::from_secs(60 * 60)));
        limiter.record_pipeline_start();

        clock.advance(Duration::minutes(59));
        assert_eq!(limiter.can_run_pipeline().reason, "Pipeline is currently running");

        clock.advance(Duration::minutes(2));
        let decision = limiter.can_run_pipeline();
        let state = limiter.get_state().unwrap();
        assert!(!state.is_running);
        assert_eq!(state.last_run_complete, Some(clock.now()));
        // The repair starts a fresh cooldown
        assert!(!decision.can_run);
        assert_eq!(decision.time_remaining_ms, Some(30 * 60_000));
    }

    #[test]
    fn test_debug_info() {
        let (limiter, _, _) = limiter();
        limiter.record_pipeline_start();
        let info = limiter.debug_info();
        assert_eq!(info.cooldown_minutes, 30);
        assert!(info.state.unwrap().is_running);
        assert!(!info.check.can_run);
        assert_eq!(info.current_time, t0());
    }
}
