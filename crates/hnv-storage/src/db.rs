//! SQLite-backed store: entity upserts, the refresh-run ledger and read queries.
//!
//! Every upsert is a single statement and commits on its own, so a crash mid-cycle
//! keeps whatever was already written. Readers see old or new rows, never partial ones.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use hnv_core::{
    Comment, ErrorRecord, ItemId, ItemKind, KnownParent, ParentRef, RefreshRun, RunOutcome,
    Severity, Story, UnknownItem, User,
};
use serde::Serialize;
use sqlx::sqlite::{
    SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions, SqliteRow,
    SqliteSynchronous,
};
use sqlx::Row;
use thiserror::Error;
use tracing::{info, warn};

/// Ledger message attached to runs closed by a later `begin_run`.
pub const ABANDONED_RUN_MESSAGE: &str = "run abandoned before finalization";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("migration failed: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("JSON column error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("corrupt row in {table}: {message}")]
    Corrupt { table: &'static str, message: String },
    #[error("refresh run {0} not found")]
    RunNotFound(i64),
    #[error("refresh run {0} is already finalized")]
    RunAlreadyFinished(i64),
}

impl StoreError {
    fn corrupt(table: &'static str, message: impl ToString) -> Self {
        Self::Corrupt {
            table,
            message: message.to_string(),
        }
    }
}

pub type StoreResult<T> = Result<T, StoreError>;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreCounts {
    pub stories: i64,
    pub ranked_stories: i64,
    pub comments: i64,
    pub orphaned_comments: i64,
    pub users: i64,
    pub unknown_items: i64,
}

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
    path: Option<PathBuf>,
}

impl Store {
    /// Open (creating if missing) the store file and apply migrations.
    pub async fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .synchronous(SqliteSynchronous::Normal)
            .foreign_keys(true)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(4)
            .connect_with(opts)
            .await?;

        let store = Self {
            pool,
            path: Some(path.to_path_buf()),
        };
        store.migrate().await?;
        info!(path = %path.display(), "store opened");
        Ok(store)
    }

    /// Private in-memory store, mainly for tests.
    pub async fn open_in_memory() -> StoreResult<Self> {
        let opts = SqliteConnectOptions::from_str("sqlite::memory:")?.foreign_keys(true);
        // One connection that never expires: each connection would otherwise get its own database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(opts)
            .await?;
        let store = Self { pool, path: None };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> StoreResult<()> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub async fn health_check(&self) -> StoreResult<()> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }

    /// Fold the WAL back into the main file so a plain file copy is complete.
    pub async fn checkpoint(&self) -> StoreResult<()> {
        sqlx::query("PRAGMA wal_checkpoint(TRUNCATE)")
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn upsert_story(&self, story: &Story) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO stories (id, item_type, title, author, score, submitted_at, url, text,
                                 descendants, comment_ids, rank, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                item_type    = excluded.item_type,
                title        = excluded.title,
                author       = excluded.author,
                score        = excluded.score,
                submitted_at = excluded.submitted_at,
                url          = excluded.url,
                text         = excluded.text,
                descendants  = excluded.descendants,
                comment_ids  = excluded.comment_ids,
                rank         = excluded.rank,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(story.id)
        .bind(&story.item_type)
        .bind(&story.title)
        .bind(&story.author)
        .bind(story.score)
        .bind(story.submitted_at)
        .bind(&story.url)
        .bind(&story.text)
        .bind(story.descendants)
        .bind(serde_json::to_string(&story.comment_ids)?)
        .bind(story.rank.map(i64::from))
        .bind(story.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_comment(&self, comment: &Comment) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO comments (id, parent_kind, parent_id, story_id, author, text, submitted_at,
                                  depth, child_ids, deleted, dead, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                parent_kind  = excluded.parent_kind,
                parent_id    = excluded.parent_id,
                story_id     = excluded.story_id,
                author       = excluded.author,
                text         = excluded.text,
                submitted_at = excluded.submitted_at,
                depth        = excluded.depth,
                child_ids    = excluded.child_ids,
                deleted      = excluded.deleted,
                dead         = excluded.dead,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(comment.id)
        .bind(comment.parent.kind_str())
        .bind(comment.parent.id())
        .bind(comment.story_id)
        .bind(&comment.author)
        .bind(&comment.text)
        .bind(comment.submitted_at)
        .bind(i64::from(comment.depth))
        .bind(serde_json::to_string(&comment.child_ids)?)
        .bind(comment.deleted)
        .bind(comment.dead)
        .bind(comment.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Upsert a profile. A `None` submission list keeps whatever was stored before.
    pub async fn upsert_user(&self, user: &User) -> StoreResult<()> {
        let submitted = user
            .submitted
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        sqlx::query(
            r#"
            INSERT INTO users (handle, about, karma, created_at, submitted, last_seen_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT (handle) DO UPDATE SET
                about        = excluded.about,
                karma        = excluded.karma,
                created_at   = excluded.created_at,
                submitted    = COALESCE(excluded.submitted, users.submitted),
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(&user.handle)
        .bind(&user.about)
        .bind(user.karma)
        .bind(user.created_at)
        .bind(submitted)
        .bind(user.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn upsert_unknown(&self, item: &UnknownItem) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO unknown_items (id, item_type, raw_json, last_seen_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT (id) DO UPDATE SET
                item_type    = excluded.item_type,
                raw_json     = excluded.raw_json,
                last_seen_at = excluded.last_seen_at
            "#,
        )
        .bind(item.id)
        .bind(&item.item_type)
        .bind(serde_json::to_string(&item.raw)?)
        .bind(item.last_seen_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Drop every story out of the top list. Rows stay; only `rank` is cleared.
    pub async fn clear_ranks(&self) -> StoreResult<u64> {
        let result = sqlx::query("UPDATE stories SET rank = NULL WHERE rank IS NOT NULL")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    /// Returns `false` when the user is not stored.
    pub async fn set_user_submitted(&self, handle: &str, submitted: &[ItemId]) -> StoreResult<bool> {
        let result = sqlx::query("UPDATE users SET submitted = ? WHERE handle = ?")
            .bind(serde_json::to_string(submitted)?)
            .bind(handle)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected() > 0)
    }

    /// Open a new ledger entry.
    ///
    /// Runs left unfinished by a crash or a store failure are closed as failed first, each
    /// with a P0 `store` record so status counts reflect the abort.
    pub async fn begin_run(&self, started_at: DateTime<Utc>) -> StoreResult<RefreshRun> {
        let mut tx = self.pool.begin().await?;
        sqlx::query(
            r#"
            INSERT INTO refresh_run_errors (run_id, seq, severity, item_kind, item_id, message)
            SELECT r.id,
                   (SELECT COUNT(*) FROM refresh_run_errors e WHERE e.run_id = r.id),
                   ?, ?, NULL, ?
              FROM refresh_runs r
             WHERE r.finished_at IS NULL
            "#,
        )
        .bind(Severity::P0.as_str())
        .bind(ItemKind::Store.as_str())
        .bind(ABANDONED_RUN_MESSAGE)
        .execute(&mut *tx)
        .await?;
        let abandoned = sqlx::query(
            "UPDATE refresh_runs SET finished_at = ?, outcome = 'failed' WHERE finished_at IS NULL",
        )
        .bind(started_at)
        .execute(&mut *tx)
        .await?
        .rows_affected();
        if abandoned > 0 {
            warn!(abandoned, "closed unfinished refresh runs as failed");
        }

        let id = sqlx::query("INSERT INTO refresh_runs (started_at) VALUES (?)")
            .bind(started_at)
            .execute(&mut *tx)
            .await?
            .last_insert_rowid();
        tx.commit().await?;

        Ok(RefreshRun {
            id,
            started_at,
            finished_at: None,
            outcome: None,
            stories_refreshed: 0,
            comments_refreshed: 0,
            errors: Vec::new(),
        })
    }

    /// Finalize a run with its outcome and error records in one transaction.
    pub async fn finish_run(
        &self,
        run_id: i64,
        finished_at: DateTime<Utc>,
        outcome: RunOutcome,
        stories_refreshed: u32,
        comments_refreshed: u32,
        errors: &[ErrorRecord],
    ) -> StoreResult<RefreshRun> {
        let mut tx = self.pool.begin().await?;
        let updated = sqlx::query(
            r#"
            UPDATE refresh_runs
               SET finished_at = ?, outcome = ?, stories_refreshed = ?, comments_refreshed = ?
             WHERE id = ? AND finished_at IS NULL
            "#,
        )
        .bind(finished_at)
        .bind(outcome.as_str())
        .bind(i64::from(stories_refreshed))
        .bind(i64::from(comments_refreshed))
        .bind(run_id)
        .execute(&mut *tx)
        .await?
        .rows_affected();

        if updated == 0 {
            let exists: Option<i64> = sqlx::query_scalar("SELECT id FROM refresh_runs WHERE id = ?")
                .bind(run_id)
                .fetch_optional(&mut *tx)
                .await?;
            tx.rollback().await?;
            return Err(match exists {
                Some(_) => StoreError::RunAlreadyFinished(run_id),
                None => StoreError::RunNotFound(run_id),
            });
        }

        for (seq, record) in errors.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO refresh_run_errors (run_id, seq, severity, item_kind, item_id, message)
                VALUES (?, ?, ?, ?, ?, ?)
                "#,
            )
            .bind(run_id)
            .bind(seq as i64)
            .bind(record.severity.as_str())
            .bind(record.kind.as_str())
            .bind(&record.item_id)
            .bind(&record.message)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;

        self.get_run(run_id)
            .await?
            .ok_or(StoreError::RunNotFound(run_id))
    }

    pub async fn get_run(&self, run_id: i64) -> StoreResult<Option<RefreshRun>> {
        let row = sqlx::query("SELECT * FROM refresh_runs WHERE id = ?")
            .bind(run_id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_run(&row).await?)),
            None => Ok(None),
        }
    }

    /// Most recent finalized run.
    pub async fn latest_run(&self) -> StoreResult<Option<RefreshRun>> {
        let row = sqlx::query(
            "SELECT * FROM refresh_runs WHERE finished_at IS NOT NULL ORDER BY id DESC LIMIT 1",
        )
        .fetch_optional(&self.pool)
        .await?;
        match row {
            Some(row) => Ok(Some(self.hydrate_run(&row).await?)),
            None => Ok(None),
        }
    }

    /// Ledger entries newest-first, including a run still in progress.
    pub async fn list_runs(&self, limit: u32) -> StoreResult<Vec<RefreshRun>> {
        let rows = sqlx::query("SELECT * FROM refresh_runs ORDER BY id DESC LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        let mut runs = Vec::with_capacity(rows.len());
        for row in &rows {
            runs.push(self.hydrate_run(row).await?);
        }
        Ok(runs)
    }

    async fn hydrate_run(&self, row: &SqliteRow) -> StoreResult<RefreshRun> {
        let id: i64 = row.try_get("id")?;
        let outcome = row
            .try_get::<Option<String>, _>("outcome")?
            .map(|s| RunOutcome::from_str(&s))
            .transpose()
            .map_err(|e| StoreError::corrupt("refresh_runs", e))?;

        let error_rows = sqlx::query(
            "SELECT severity, item_kind, item_id, message FROM refresh_run_errors WHERE run_id = ? ORDER BY seq",
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await?;
        let mut errors = Vec::with_capacity(error_rows.len());
        for err_row in error_rows {
            let severity: String = err_row.try_get("severity")?;
            let kind: String = err_row.try_get("item_kind")?;
            errors.push(ErrorRecord {
                severity: Severity::from_str(&severity)
                    .map_err(|e| StoreError::corrupt("refresh_run_errors", e))?,
                kind: ItemKind::from_str(&kind)
                    .map_err(|e| StoreError::corrupt("refresh_run_errors", e))?,
                item_id: err_row.try_get("item_id")?,
                message: err_row.try_get("message")?,
            });
        }

        Ok(RefreshRun {
            id,
            started_at: row.try_get("started_at")?,
            finished_at: row.try_get("finished_at")?,
            outcome,
            stories_refreshed: to_u32(row.try_get("stories_refreshed")?, "refresh_runs")?,
            comments_refreshed: to_u32(row.try_get("comments_refreshed")?, "refresh_runs")?,
            errors,
        })
    }

    /// Stories currently in the top list, by rank.
    pub async fn top_stories(&self, limit: u32) -> StoreResult<Vec<Story>> {
        let rows = sqlx::query("SELECT * FROM stories WHERE rank IS NOT NULL ORDER BY rank LIMIT ?")
            .bind(i64::from(limit))
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(story_from_row).collect()
    }

    pub async fn all_stories(&self) -> StoreResult<Vec<Story>> {
        let rows = sqlx::query("SELECT * FROM stories ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(story_from_row).collect()
    }

    pub async fn get_story(&self, id: ItemId) -> StoreResult<Option<Story>> {
        let row = sqlx::query("SELECT * FROM stories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(story_from_row).transpose()
    }

    pub async fn get_comment(&self, id: ItemId) -> StoreResult<Option<Comment>> {
        let row = sqlx::query("SELECT * FROM comments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(comment_from_row).transpose()
    }

    /// Every comment in a story's thread, shallowest first.
    pub async fn comments_for_story(&self, story_id: ItemId) -> StoreResult<Vec<Comment>> {
        let rows = sqlx::query("SELECT * FROM comments WHERE story_id = ? ORDER BY depth, id")
            .bind(story_id)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(comment_from_row).collect()
    }

    /// Direct children of a story in upstream order.
    pub async fn top_level_comments(&self, story_id: ItemId, limit: usize) -> StoreResult<Vec<Comment>> {
        let Some(story) = self.get_story(story_id).await? else {
            return Ok(Vec::new());
        };
        let rows = sqlx::query("SELECT * FROM comments WHERE parent_kind = 'story' AND parent_id = ?")
            .bind(story_id)
            .fetch_all(&self.pool)
            .await?;
        let mut by_id: HashMap<ItemId, Comment> = rows
            .iter()
            .map(comment_from_row)
            .map(|c| c.map(|c| (c.id, c)))
            .collect::<StoreResult<_>>()?;
        Ok(story
            .comment_ids
            .iter()
            .filter_map(|id| by_id.remove(id))
            .take(limit)
            .collect())
    }

    pub async fn all_comments(&self) -> StoreResult<Vec<Comment>> {
        let rows = sqlx::query("SELECT * FROM comments ORDER BY id")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(comment_from_row).collect()
    }

    pub async fn get_user(&self, handle: &str) -> StoreResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(user_from_row).transpose()
    }

    pub async fn has_user(&self, handle: &str) -> StoreResult<bool> {
        let found: Option<i64> = sqlx::query_scalar("SELECT 1 FROM users WHERE handle = ?")
            .bind(handle)
            .fetch_optional(&self.pool)
            .await?;
        Ok(found.is_some())
    }

    pub async fn all_users(&self) -> StoreResult<Vec<User>> {
        let rows = sqlx::query("SELECT * FROM users ORDER BY handle")
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(user_from_row).collect()
    }

    pub async fn get_unknown(&self, id: ItemId) -> StoreResult<Option<UnknownItem>> {
        let row = sqlx::query("SELECT * FROM unknown_items WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => {
                let raw: String = row.try_get("raw_json")?;
                Ok(Some(UnknownItem {
                    id: row.try_get("id")?,
                    item_type: row.try_get("item_type")?,
                    raw: serde_json::from_str(&raw)?,
                    last_seen_at: row.try_get("last_seen_at")?,
                }))
            }
            None => Ok(None),
        }
    }

    /// Resolve a persisted story or comment as a potential parent.
    pub async fn parent_info(&self, id: ItemId) -> StoreResult<Option<KnownParent>> {
        let story: Option<i64> = sqlx::query_scalar("SELECT id FROM stories WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        if story.is_some() {
            return Ok(Some(KnownParent::story(id)));
        }

        let row = sqlx::query("SELECT depth, story_id FROM comments WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => Ok(Some(KnownParent::comment(
                id,
                to_u32(row.try_get("depth")?, "comments")?,
                row.try_get("story_id")?,
            ))),
            None => Ok(None),
        }
    }

    pub async fn counts(&self) -> StoreResult<StoreCounts> {
        let row = sqlx::query(
            r#"
            SELECT
                (SELECT COUNT(*) FROM stories)                                  AS stories,
                (SELECT COUNT(*) FROM stories WHERE rank IS NOT NULL)           AS ranked_stories,
                (SELECT COUNT(*) FROM comments)                                 AS comments,
                (SELECT COUNT(*) FROM comments WHERE parent_kind = 'orphan')    AS orphaned_comments,
                (SELECT COUNT(*) FROM users)                                    AS users,
                (SELECT COUNT(*) FROM unknown_items)                            AS unknown_items
            "#,
        )
        .fetch_one(&self.pool)
        .await?;
        Ok(StoreCounts {
            stories: row.try_get("stories")?,
            ranked_stories: row.try_get("ranked_stories")?,
            comments: row.try_get("comments")?,
            orphaned_comments: row.try_get("orphaned_comments")?,
            users: row.try_get("users")?,
            unknown_items: row.try_get("unknown_items")?,
        })
    }
}

fn to_u32(value: i64, table: &'static str) -> StoreResult<u32> {
    u32::try_from(value).map_err(|_| StoreError::corrupt(table, format!("{value} out of range")))
}

fn id_list(raw: &str, table: &'static str) -> StoreResult<Vec<ItemId>> {
    serde_json::from_str(raw).map_err(|e| StoreError::corrupt(table, e))
}

fn story_from_row(row: &SqliteRow) -> StoreResult<Story> {
    let comment_ids: String = row.try_get("comment_ids")?;
    let rank: Option<i64> = row.try_get("rank")?;
    Ok(Story {
        id: row.try_get("id")?,
        item_type: row.try_get("item_type")?,
        title: row.try_get("title")?,
        author: row.try_get("author")?,
        score: row.try_get("score")?,
        submitted_at: row.try_get("submitted_at")?,
        url: row.try_get("url")?,
        text: row.try_get("text")?,
        descendants: row.try_get("descendants")?,
        comment_ids: id_list(&comment_ids, "stories")?,
        rank: rank.map(|r| to_u32(r, "stories")).transpose()?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn comment_from_row(row: &SqliteRow) -> StoreResult<Comment> {
    let parent_kind: String = row.try_get("parent_kind")?;
    let parent_id: Option<i64> = row.try_get("parent_id")?;
    let child_ids: String = row.try_get("child_ids")?;
    Ok(Comment {
        id: row.try_get("id")?,
        parent: ParentRef::from_parts(&parent_kind, parent_id)
            .map_err(|e| StoreError::corrupt("comments", e))?,
        story_id: row.try_get("story_id")?,
        author: row.try_get("author")?,
        text: row.try_get("text")?,
        submitted_at: row.try_get("submitted_at")?,
        depth: to_u32(row.try_get("depth")?, "comments")?,
        child_ids: id_list(&child_ids, "comments")?,
        deleted: row.try_get("deleted")?,
        dead: row.try_get("dead")?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

fn user_from_row(row: &SqliteRow) -> StoreResult<User> {
    let submitted: Option<String> = row.try_get("submitted")?;
    Ok(User {
        handle: row.try_get("handle")?,
        about: row.try_get("about")?,
        karma: row.try_get("karma")?,
        created_at: row.try_get("created_at")?,
        submitted: submitted.map(|s| id_list(&s, "users")).transpose()?,
        last_seen_at: row.try_get("last_seen_at")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tempfile::tempdir;

    fn ts(hour: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, hour, 0, 0).single().unwrap()
    }

    fn story(id: ItemId, rank: Option<u32>, seen: DateTime<Utc>) -> Story {
        Story {
            id,
            item_type: "story".into(),
            title: format!("Story {id}"),
            author: "pg".into(),
            score: 100,
            submitted_at: Some(ts(1)),
            url: Some(format!("https://example.com/{id}")),
            text: None,
            descendants: 2,
            comment_ids: vec![id * 10, id * 10 + 1],
            rank,
            last_seen_at: seen,
        }
    }

    fn comment(id: ItemId, parent: ParentRef, story_id: Option<ItemId>, depth: u32) -> Comment {
        Comment {
            id,
            parent,
            story_id,
            author: "dang".into(),
            text: format!("comment {id}"),
            submitted_at: Some(ts(2)),
            depth,
            child_ids: vec![],
            deleted: false,
            dead: false,
            last_seen_at: ts(3),
        }
    }

    #[tokio::test]
    async fn re_upserting_identical_story_only_moves_last_seen_at() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(1, Some(1), ts(4))).await.unwrap();
        let first = store.get_story(1).await.unwrap().unwrap();

        store.upsert_story(&story(1, Some(1), ts(5))).await.unwrap();
        let second = store.get_story(1).await.unwrap().unwrap();

        assert_eq!(second.last_seen_at, ts(5));
        assert_eq!(
            Story {
                last_seen_at: first.last_seen_at,
                ..second
            },
            first
        );
        assert_eq!(store.counts().await.unwrap().stories, 1);
    }

    #[tokio::test]
    async fn clear_ranks_keeps_rows() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(1, Some(1), ts(4))).await.unwrap();
        store.upsert_story(&story(2, Some(2), ts(4))).await.unwrap();

        assert_eq!(store.clear_ranks().await.unwrap(), 2);
        assert!(store.top_stories(10).await.unwrap().is_empty());
        let all = store.all_stories().await.unwrap();
        assert_eq!(all.len(), 2);
        assert!(all.iter().all(|s| s.rank.is_none()));
    }

    #[tokio::test]
    async fn top_stories_are_ordered_by_rank() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(7, Some(2), ts(4))).await.unwrap();
        store.upsert_story(&story(8, Some(1), ts(4))).await.unwrap();
        store.upsert_story(&story(9, None, ts(4))).await.unwrap();

        let ids: Vec<_> = store.top_stories(5).await.unwrap().iter().map(|s| s.id).collect();
        assert_eq!(ids, vec![8, 7]);
    }

    #[tokio::test]
    async fn comments_keep_parent_variants_and_order() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(1, Some(1), ts(4))).await.unwrap();
        store
            .upsert_comment(&comment(11, ParentRef::Story(1), Some(1), 0))
            .await
            .unwrap();
        store
            .upsert_comment(&comment(10, ParentRef::Story(1), Some(1), 0))
            .await
            .unwrap();
        store
            .upsert_comment(&comment(100, ParentRef::Comment(10), Some(1), 1))
            .await
            .unwrap();
        store
            .upsert_comment(&comment(500, ParentRef::Orphaned(Some(499)), None, 0))
            .await
            .unwrap();

        let top: Vec<_> = store
            .top_level_comments(1, 10)
            .await
            .unwrap()
            .iter()
            .map(|c| c.id)
            .collect();
        assert_eq!(top, vec![10, 11]);

        let thread = store.comments_for_story(1).await.unwrap();
        assert_eq!(thread.len(), 3);
        assert_eq!(thread.last().unwrap().parent, ParentRef::Comment(10));

        let orphan = store.get_comment(500).await.unwrap().unwrap();
        assert!(orphan.is_orphaned());
        assert_eq!(orphan.parent.id(), Some(499));
        assert_eq!(store.counts().await.unwrap().orphaned_comments, 1);
    }

    #[tokio::test]
    async fn parent_info_resolves_stories_and_comments() {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(1, Some(1), ts(4))).await.unwrap();
        store
            .upsert_comment(&comment(10, ParentRef::Story(1), Some(1), 0))
            .await
            .unwrap();

        assert_eq!(store.parent_info(1).await.unwrap(), Some(KnownParent::story(1)));
        let parent = store.parent_info(10).await.unwrap().unwrap();
        assert_eq!(parent, KnownParent::comment(10, 0, Some(1)));
        assert_eq!(parent.child_depth(), 1);
        assert_eq!(store.parent_info(42).await.unwrap(), None);
    }

    #[tokio::test]
    async fn user_submissions_are_lazy_and_survive_refreshes() {
        let store = Store::open_in_memory().await.unwrap();
        let mut user = User {
            handle: "pg".into(),
            about: "YC".into(),
            karma: 10,
            created_at: Some(ts(0)),
            submitted: None,
            last_seen_at: ts(1),
        };
        store.upsert_user(&user).await.unwrap();
        assert!(store.has_user("pg").await.unwrap());
        assert_eq!(store.get_user("pg").await.unwrap().unwrap().submitted, None);

        assert!(store.set_user_submitted("pg", &[1, 2, 3]).await.unwrap());
        assert!(!store.set_user_submitted("nobody", &[1]).await.unwrap());

        user.karma = 11;
        store.upsert_user(&user).await.unwrap();
        let stored = store.get_user("pg").await.unwrap().unwrap();
        assert_eq!(stored.karma, 11);
        assert_eq!(stored.submitted, Some(vec![1, 2, 3]));
    }

    #[tokio::test]
    async fn unknown_items_keep_raw_payload() {
        let store = Store::open_in_memory().await.unwrap();
        let raw = serde_json::json!({"id": 77, "type": "pollopt", "score": 3});
        store
            .upsert_unknown(&UnknownItem {
                id: 77,
                item_type: "pollopt".into(),
                raw: raw.clone(),
                last_seen_at: ts(1),
            })
            .await
            .unwrap();
        let item = store.get_unknown(77).await.unwrap().unwrap();
        assert_eq!(item.raw, raw);
        assert_eq!(store.counts().await.unwrap().unknown_items, 1);
    }

    #[tokio::test]
    async fn run_ledger_is_append_only_and_newest_first() {
        let store = Store::open_in_memory().await.unwrap();
        let first = store.begin_run(ts(1)).await.unwrap();
        let errors = vec![ErrorRecord::new(
            Severity::P3,
            ItemKind::Comment,
            Some("9".into()),
            "not found",
        )];
        let finished = store
            .finish_run(first.id, ts(2), RunOutcome::Degraded, 5, 40, &errors)
            .await
            .unwrap();
        assert_eq!(finished.outcome, Some(RunOutcome::Degraded));
        assert_eq!(finished.errors, errors);
        assert_eq!(finished.error_counts()["P3"], 1);

        let again = store
            .finish_run(first.id, ts(3), RunOutcome::Success, 5, 40, &[])
            .await;
        assert!(matches!(again, Err(StoreError::RunAlreadyFinished(id)) if id == first.id));
        assert!(matches!(
            store.finish_run(999, ts(3), RunOutcome::Success, 0, 0, &[]).await,
            Err(StoreError::RunNotFound(999))
        ));

        let second = store.begin_run(ts(4)).await.unwrap();
        assert!(second.id > first.id);

        // still running: latest_run reports the last finalized one
        assert_eq!(store.latest_run().await.unwrap().unwrap().id, first.id);
        let ids: Vec<_> = store.list_runs(10).await.unwrap().iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![second.id, first.id]);
    }

    #[tokio::test]
    async fn begin_run_closes_abandoned_runs_as_failed() {
        let store = Store::open_in_memory().await.unwrap();
        let crashed = store.begin_run(ts(1)).await.unwrap();
        let next = store.begin_run(ts(2)).await.unwrap();

        let closed = store.get_run(crashed.id).await.unwrap().unwrap();
        assert_eq!(closed.outcome, Some(RunOutcome::Failed));
        assert_eq!(closed.finished_at, Some(ts(2)));
        assert_eq!(closed.error_counts()["P0"], 1);
        assert_eq!(closed.errors[0].kind, ItemKind::Store);
        assert_eq!(closed.errors[0].message, ABANDONED_RUN_MESSAGE);
        let next = store.get_run(next.id).await.unwrap().unwrap();
        assert!(!next.is_finished());
        assert!(next.errors.is_empty());
    }

    #[tokio::test]
    async fn file_store_persists_across_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested/hackernews.db");
        {
            let store = Store::open(&path).await.unwrap();
            store.upsert_story(&story(3, Some(1), ts(4))).await.unwrap();
            store.checkpoint().await.unwrap();
            store.pool().close().await;
        }
        let store = Store::open(&path).await.unwrap();
        store.health_check().await.unwrap();
        assert_eq!(store.get_story(3).await.unwrap().unwrap().rank, Some(1));
        assert_eq!(store.path(), Some(path.as_path()));
    }
}
