use std::sync::Arc;

use anyhow::{Context, Result};
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, warn};

use crate::{run_backup, HnvConfig, RefreshError, Refresher};

/// Scheduler with a repeating refresh job and a cron-driven backup job. Not started.
pub async fn build_scheduler(refresher: Arc<Refresher>, config: &HnvConfig) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;

    let interval = config.refresh_interval();
    let for_refresh = Arc::clone(&refresher);
    let refresh_job = Job::new_repeated_async(interval, move |_uuid, _l| {
        let refresher = Arc::clone(&for_refresh);
        Box::pin(async move {
            scheduled_refresh(&refresher).await;
        })
    })
    .context("creating refresh job")?;
    sched.add(refresh_job).await.context("adding refresh job")?;

    let backup_dir = config.backup_dir();
    let keep = config.backup_keep;
    let for_backup = Arc::clone(&refresher);
    let backup_job = Job::new_async(config.backup_cron.as_str(), move |_uuid, _l| {
        let refresher = Arc::clone(&for_backup);
        let backup_dir = backup_dir.clone();
        Box::pin(async move {
            match run_backup(refresher.store(), &backup_dir, keep).await {
                Ok(record) => info!(file = %record.filename, "scheduled backup done"),
                Err(err) => error!(error = %format!("{err:#}"), "scheduled backup failed"),
            }
        })
    })
    .with_context(|| format!("creating backup job for cron {}", config.backup_cron))?;
    sched.add(backup_job).await.context("adding backup job")?;

    info!(
        refresh_every_secs = interval.as_secs(),
        backup_cron = %config.backup_cron,
        "scheduler configured"
    );
    Ok(sched)
}

async fn scheduled_refresh(refresher: &Refresher) {
    match refresher.run_cycle().await {
        Ok(run) => info!(run_id = run.id, outcome = ?run.outcome, "scheduled refresh done"),
        Err(RefreshError::AlreadyRunning { started_at }) => {
            warn!(%started_at, "skipping scheduled refresh; previous cycle still running")
        }
        Err(err) => error!(error = %err, "scheduled refresh failed"),
    }
}
