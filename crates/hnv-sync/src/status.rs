use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hnv_core::{RefreshRun, RunOutcome, Severity};
use hnv_storage::{Store, StoreCounts, StoreError};
use serde::Serialize;

/// Freshness and last-outcome summary for health checks and the status endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SystemStatus {
    /// `ok`, `degraded`, `failed`, or `no_data` before the first finished run.
    pub status: &'static str,
    pub last_run_id: Option<i64>,
    pub last_run_outcome: Option<RunOutcome>,
    pub last_run_started_at: Option<DateTime<Utc>>,
    pub last_run_finished_at: Option<DateTime<Utc>>,
    pub error_counts_by_severity: BTreeMap<String, usize>,
    pub stories_refreshed: u32,
    pub comments_refreshed: u32,
    pub refresh_in_progress: bool,
    pub stale: bool,
    pub totals: StoreCounts,
}

impl SystemStatus {
    pub fn from_parts(
        last_run: Option<&RefreshRun>,
        totals: StoreCounts,
        refresh_in_progress: bool,
        refresh_interval: Duration,
        now: DateTime<Utc>,
    ) -> Self {
        let error_counts_by_severity = match last_run {
            Some(run) => run.error_counts(),
            None => Severity::ALL
                .iter()
                .map(|s| (s.as_str().to_string(), 0))
                .collect(),
        };
        let outcome = last_run.and_then(|r| r.outcome);
        let finished_at = last_run.and_then(|r| r.finished_at);

        // stale once two refresh intervals pass without a finished run
        let max_age = refresh_interval
            .checked_mul(2)
            .and_then(|d| chrono::Duration::from_std(d).ok())
            .unwrap_or_else(|| chrono::Duration::hours(2));
        let stale = finished_at.map_or(true, |at| now - at > max_age);

        Self {
            status: match outcome {
                Some(RunOutcome::Success) => "ok",
                Some(RunOutcome::Degraded) => "degraded",
                Some(RunOutcome::Failed) => "failed",
                None => "no_data",
            },
            last_run_id: last_run.map(|r| r.id),
            last_run_outcome: outcome,
            last_run_started_at: last_run.map(|r| r.started_at),
            last_run_finished_at: finished_at,
            error_counts_by_severity,
            stories_refreshed: last_run.map_or(0, |r| r.stories_refreshed),
            comments_refreshed: last_run.map_or(0, |r| r.comments_refreshed),
            refresh_in_progress,
            stale,
            totals,
        }
    }
}

/// Read the latest finalized run and store totals into a [`SystemStatus`].
pub async fn system_status(
    store: &Store,
    refresh_in_progress: bool,
    refresh_interval: Duration,
    now: DateTime<Utc>,
) -> Result<SystemStatus, StoreError> {
    let last_run = store.latest_run().await?;
    let totals = store.counts().await?;
    Ok(SystemStatus::from_parts(
        last_run.as_ref(),
        totals,
        refresh_in_progress,
        refresh_interval,
        now,
    ))
}
