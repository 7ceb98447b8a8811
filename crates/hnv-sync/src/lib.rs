//! Refresh orchestration, configuration, status reporting and scheduling.

mod config;
mod schedule;
mod status;

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::path::Path;
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::Context;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use hnv_adapters::{normalize_item, normalize_user, Entity, HnApi, NormalizeContext};
use hnv_core::{
    classify_outcome, ErrorRecord, FetchFailure, ItemId, ItemKind, KnownParent, RefreshRun,
    Severity, Story, User,
};
use hnv_storage::{cleanup_old_backups, create_backup, BackupRecord, Store, StoreError};
use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info, info_span, warn, Instrument};

pub use config::HnvConfig;
pub use schedule::build_scheduler;
pub use status::{system_status, SystemStatus};

pub const CRATE_NAME: &str = "hnv-sync";

type Fetched<K> = Vec<(K, Result<serde_json::Value, FetchFailure>)>;

/// Limits that shape one refresh cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RefreshSettings {
    pub top_story_count: usize,
    /// Top-level comments fetched per story, in upstream order.
    pub top_comment_limit: usize,
    /// Replies fetched per comment.
    pub reply_limit: usize,
    /// Deepest comment depth fetched; top-level comments are depth 0.
    pub comment_max_depth: u32,
    pub max_fan_out: usize,
}

impl Default for RefreshSettings {
    fn default() -> Self {
        HnvConfig::default().refresh_settings()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum RefreshState {
    Idle,
    Running {
        started_at: DateTime<Utc>,
        run_id: Option<i64>,
    },
}

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("a refresh cycle is already running (started {started_at})")]
    AlreadyRunning { started_at: DateTime<Utc> },
    /// P0: the store failed and the cycle stopped writing.
    #[error("store failure during refresh run {run_id:?}: {source}")]
    Store {
        run_id: Option<i64>,
        #[source]
        source: StoreError,
    },
}

/// Drives refresh cycles against one API and one store.
///
/// At most one cycle runs at a time per `Refresher`; overlapping cycles from other
/// processes sharing the store file are not detected.
pub struct Refresher {
    api: Arc<dyn HnApi>,
    store: Store,
    settings: RefreshSettings,
    state: Mutex<RefreshState>,
}

struct RunningGuard<'a> {
    state: &'a Mutex<RefreshState>,
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) = RefreshState::Idle;
    }
}

/// Transient working set of one cycle. Dropped once the run is finalized.
struct Cycle {
    run_id: i64,
    seen_at: DateTime<Utc>,
    errors: Vec<ErrorRecord>,
    stories: Vec<Story>,
    comments_refreshed: u32,
    authors: Vec<String>,
    known: HashMap<ItemId, KnownParent>,
}

impl Cycle {
    fn record(
        &mut self,
        severity: Severity,
        kind: ItemKind,
        item_id: Option<String>,
        message: impl Into<String>,
    ) {
        let record = ErrorRecord::new(severity, kind, item_id, message);
        error!(run_id = self.run_id, "{}", record.log_line());
        self.errors.push(record);
    }

    fn note_author(&mut self, author: &str) {
        if !author.is_empty() {
            self.authors.push(author.to_string());
        }
    }
}

impl Refresher {
    pub fn new(api: Arc<dyn HnApi>, store: Store, mut settings: RefreshSettings) -> Self {
        // zero would stall every buffered fetch
        settings.max_fan_out = settings.max_fan_out.max(1);
        Self {
            api,
            store,
            settings,
            state: Mutex::new(RefreshState::Idle),
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn settings(&self) -> &RefreshSettings {
        &self.settings
    }

    pub fn state(&self) -> RefreshState {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn is_running(&self) -> bool {
        matches!(self.state(), RefreshState::Running { .. })
    }

    fn enter(&self, started_at: DateTime<Utc>) -> Result<RunningGuard<'_>, RefreshError> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if let RefreshState::Running { started_at, .. } = *state {
            return Err(RefreshError::AlreadyRunning { started_at });
        }
        *state = RefreshState::Running {
            started_at,
            run_id: None,
        };
        Ok(RunningGuard { state: &self.state })
    }

    fn set_run_id(&self, run_id: i64) {
        if let RefreshState::Running { run_id: slot, .. } =
            &mut *self.state.lock().unwrap_or_else(PoisonError::into_inner)
        {
            *slot = Some(run_id);
        }
    }

    fn store_failure(&self, run_id: Option<i64>, source: StoreError) -> RefreshError {
        let record = ErrorRecord::new(Severity::P0, ItemKind::Store, None, source.to_string());
        error!(run_id, "{}", record.log_line());
        RefreshError::Store { run_id, source }
    }

    /// Run one complete cycle and return its finalized ledger entry.
    ///
    /// P1 failures still produce a `failed` entry. A P0 store failure stops all writes,
    /// including the ledger update; the next cycle closes that run as failed.
    pub async fn run_cycle(&self) -> Result<RefreshRun, RefreshError> {
        let started_at = Utc::now();
        let _guard = self.enter(started_at)?;

        let run = self
            .store
            .begin_run(started_at)
            .await
            .map_err(|e| self.store_failure(None, e))?;
        self.set_run_id(run.id);

        let mut cycle = Cycle {
            run_id: run.id,
            seen_at: started_at,
            errors: Vec::new(),
            stories: Vec::new(),
            comments_refreshed: 0,
            authors: Vec::new(),
            known: HashMap::new(),
        };

        let span = info_span!("refresh_cycle", run_id = run.id);
        self.drive(&mut cycle)
            .instrument(span)
            .await
            .map_err(|e| self.store_failure(Some(run.id), e))?;

        let outcome = classify_outcome(&cycle.errors, cycle.stories.len());
        let finished = self
            .store
            .finish_run(
                run.id,
                Utc::now(),
                outcome,
                cycle.stories.len() as u32,
                cycle.comments_refreshed,
                &cycle.errors,
            )
            .await
            .map_err(|e| self.store_failure(Some(run.id), e))?;

        info!(
            run_id = finished.id,
            outcome = %outcome,
            stories = finished.stories_refreshed,
            comments = finished.comments_refreshed,
            errors = finished.errors.len(),
            "refresh cycle finished"
        );
        Ok(finished)
    }

    async fn drive(&self, cycle: &mut Cycle) -> Result<(), StoreError> {
        let limit = self.settings.top_story_count;
        let ids = match with_retry(|| self.api.fetch_top_story_ids(limit)).await {
            Ok(ids) if ids.is_empty() => {
                let message = "upstream returned an empty top list";
                cycle.record(Severity::P1, ItemKind::TopStories, None, message);
                return Ok(());
            }
            Ok(ids) => ids,
            Err(failure) => {
                cycle.record(Severity::P1, ItemKind::TopStories, None, failure.to_string());
                return Ok(());
            }
        };

        let cleared = self.store.clear_ranks().await?;
        debug!(cleared, "cleared previous ranks");

        self.refresh_stories(cycle, &ids).await?;
        self.refresh_comments(cycle).await?;
        self.refresh_users(cycle).await?;
        Ok(())
    }

    async fn refresh_stories(&self, cycle: &mut Cycle, ids: &[ItemId]) -> Result<(), StoreError> {
        let fetched: Fetched<ItemId> = stream::iter(ids.iter().copied())
            .map(|id| async move { (id, with_retry(|| self.api.fetch_item(id)).await) })
            .buffered(self.settings.max_fan_out)
            .collect()
            .await;

        for (position, (id, result)) in fetched.into_iter().enumerate() {
            let item_id = Some(id.to_string());
            let raw = match result {
                Ok(raw) => raw,
                Err(failure) => {
                    cycle.record(Severity::P2, ItemKind::Story, item_id, failure.to_string());
                    continue;
                }
            };
            // a comment id in the top list still needs its parent to keep its place in the tree
            let parent = self.resolve_parent(cycle, &raw).await?;
            let ctx = NormalizeContext::new(cycle.seen_at).with_parent(parent);
            let normalized = match normalize_item(&raw, &ctx) {
                Ok(normalized) => normalized,
                Err(rejection) => {
                    let failure = rejection.into_failure(&format!("item {id}"));
                    cycle.record(Severity::P2, ItemKind::Story, item_id, failure.to_string());
                    continue;
                }
            };
            if !normalized.is_clean() {
                warn!(id, field_errors = ?normalized.field_errors, "story had unusable fields");
            }

            match normalized.entity {
                Entity::Story(mut story) => {
                    story.rank = Some(position as u32 + 1);
                    self.store.upsert_story(&story).await?;
                    cycle.note_author(&story.author);
                    cycle.known.insert(story.id, KnownParent::story(story.id));
                    cycle.stories.push(story);
                }
                other => {
                    let kind = other.type_name().to_string();
                    self.persist_stray(cycle, other).await?;
                    cycle.record(
                        Severity::P2,
                        ItemKind::Story,
                        item_id,
                        format!("top list entry is a {kind}, not a story"),
                    );
                }
            }
        }
        Ok(())
    }

    /// Breadth-first walk of every refreshed story's thread, one depth level per round.
    async fn refresh_comments(&self, cycle: &mut Cycle) -> Result<(), StoreError> {
        let mut visited: HashSet<ItemId> = HashSet::new();
        let mut level: Vec<ItemId> = cycle
            .stories
            .iter()
            .flat_map(|s| s.comment_ids.iter().take(self.settings.top_comment_limit).copied())
            .collect();

        while !level.is_empty() {
            level.retain(|id| visited.insert(*id));
            let fetched: Fetched<ItemId> = stream::iter(level.iter().copied())
                .map(|id| async move { (id, with_retry(|| self.api.fetch_item(id)).await) })
                .buffered(self.settings.max_fan_out)
                .collect()
                .await;

            let mut next = Vec::new();
            for (id, result) in fetched {
                let item_id = Some(id.to_string());
                let raw = match result {
                    Ok(raw) => raw,
                    Err(failure) => {
                        cycle.record(Severity::P3, ItemKind::Comment, item_id, failure.to_string());
                        continue;
                    }
                };

                let parent = self.resolve_parent(cycle, &raw).await?;
                let ctx = NormalizeContext::new(cycle.seen_at).with_parent(parent);
                let normalized = match normalize_item(&raw, &ctx) {
                    Ok(normalized) => normalized,
                    Err(rejection) => {
                        let failure = rejection.into_failure(&format!("item {id}"));
                        cycle.record(Severity::P3, ItemKind::Comment, item_id, failure.to_string());
                        continue;
                    }
                };

                let comment = match normalized.entity {
                    Entity::Comment(comment) => comment,
                    other => {
                        let kind = other.type_name().to_string();
                        self.persist_stray(cycle, other).await?;
                        cycle.record(
                            Severity::P3,
                            ItemKind::Comment,
                            item_id,
                            format!("expected a comment, got a {kind}"),
                        );
                        continue;
                    }
                };

                self.store.upsert_comment(&comment).await?;
                cycle.comments_refreshed += 1;
                cycle.note_author(&comment.author);
                if comment.is_orphaned() {
                    warn!(id, parent = ?comment.parent.id(), "stored orphaned comment");
                    continue;
                }
                let as_parent = KnownParent::comment(comment.id, comment.depth, comment.story_id);
                cycle.known.insert(comment.id, as_parent);
                if comment.depth < self.settings.comment_max_depth {
                    next.extend(comment.child_ids.iter().take(self.settings.reply_limit).copied());
                }
            }
            level = next;
        }
        Ok(())
    }

    /// Fetch profiles for authors the store has never seen. Existing profiles are left alone.
    async fn refresh_users(&self, cycle: &mut Cycle) -> Result<(), StoreError> {
        let mut seen = HashSet::new();
        let mut missing = Vec::new();
        for handle in std::mem::take(&mut cycle.authors) {
            if seen.insert(handle.clone()) && !self.store.has_user(&handle).await? {
                missing.push(handle);
            }
        }

        let fetched: Fetched<String> = stream::iter(missing)
            .map(|handle| async move {
                let result = with_retry(|| self.api.fetch_user(&handle)).await;
                (handle, result)
            })
            .buffered(self.settings.max_fan_out)
            .collect()
            .await;

        for (handle, result) in fetched {
            let user = result.and_then(|raw| {
                normalize_user(&raw, cycle.seen_at, false)
                    .map(|n| n.entity)
                    .map_err(|r| r.into_failure(&format!("user {handle}")))
            });
            match user {
                Ok(user) => self.store.upsert_user(&user).await?,
                Err(failure) => {
                    cycle.record(Severity::P3, ItemKind::User, Some(handle), failure.to_string())
                }
            }
        }
        Ok(())
    }

    /// Parent named by a raw item, from this cycle's working set or the store.
    async fn resolve_parent(
        &self,
        cycle: &Cycle,
        raw: &serde_json::Value,
    ) -> Result<Option<KnownParent>, StoreError> {
        let Some(pid) = raw.get("parent").and_then(serde_json::Value::as_i64) else {
            return Ok(None);
        };
        match cycle.known.get(&pid) {
            Some(parent) => Ok(Some(*parent)),
            None => self.store.parent_info(pid).await,
        }
    }

    /// Store a non-story, non-comment entity that turned up where a story or comment was expected.
    async fn persist_stray(&self, cycle: &mut Cycle, entity: Entity) -> Result<(), StoreError> {
        match entity {
            Entity::Unknown(item) => self.store.upsert_unknown(&item).await,
            Entity::Comment(comment) => {
                if comment.is_orphaned() {
                    let stored = self.store.get_comment(comment.id).await?;
                    if stored.is_some_and(|c| !c.is_orphaned()) {
                        debug!(id = comment.id, "keeping stored parent for unresolved comment");
                        return Ok(());
                    }
                }
                self.store.upsert_comment(&comment).await?;
                cycle.comments_refreshed += 1;
                Ok(())
            }
            // never overwrite a ranked story from outside the top list
            Entity::Story(story) => {
                debug!(id = story.id, "not storing story found outside the top list");
                Ok(())
            }
        }
    }

    /// Fetch one profile including its submissions and store it.
    pub async fn refresh_user(&self, handle: &str) -> anyhow::Result<User> {
        let raw = with_retry(|| self.api.fetch_user(handle))
            .await
            .with_context(|| format!("fetching user {handle}"))?;
        let normalized = normalize_user(&raw, Utc::now(), true)
            .map_err(|r| r.into_failure(&format!("user {handle}")))?;
        self.store
            .upsert_user(&normalized.entity)
            .await
            .with_context(|| format!("storing user {handle}"))?;
        Ok(normalized.entity)
    }
}

/// One immediate retry for transient failures; deterministic ones return at once.
pub async fn with_retry<T, F, Fut>(mut op: F) -> Result<T, FetchFailure>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, FetchFailure>>,
{
    match op().await {
        Err(failure) if failure.is_retryable() => {
            debug!(%failure, "retrying once");
            op().await
        }
        other => other,
    }
}

/// Checkpoint the store, copy it into `backup_dir` and apply retention.
pub async fn run_backup(
    store: &Store,
    backup_dir: &Path,
    keep: usize,
) -> anyhow::Result<BackupRecord> {
    let db_path = store
        .path()
        .context("in-memory stores cannot be backed up")?
        .to_path_buf();
    store.checkpoint().await.context("checkpointing store before backup")?;
    let record = create_backup(&db_path, backup_dir, Utc::now()).await?;
    let removed = cleanup_old_backups(backup_dir, keep).await?;
    if !removed.is_empty() {
        info!(removed = removed.len(), keep, "applied backup retention");
    }
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn transient_failures_are_retried_once() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchFailure::Timeout("t".into())) }
        })
        .await;
        assert!(matches!(result, Err(FetchFailure::Timeout(_))));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn deterministic_failures_are_not_retried() {
        let calls = AtomicUsize::new(0);
        let result: Result<(), _> = with_retry(|| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err(FetchFailure::NotFound("n".into())) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn retry_recovers_from_a_single_blip() {
        let calls = AtomicUsize::new(0);
        let result = with_retry(|| {
            let attempt = calls.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt == 0 {
                    Err(FetchFailure::Unavailable("blip".into()))
                } else {
                    Ok(42)
                }
            }
        })
        .await;
        assert_eq!(result, Ok(42));
    }
}
