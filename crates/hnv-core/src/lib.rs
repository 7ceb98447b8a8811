//! Core domain model, severity taxonomy and run-ledger types for HNV.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const CRATE_NAME: &str = "hnv-core";

/// Upstream-assigned item id (stories, comments and unknown items share one id space).
pub type ItemId = i64;

/// Story-shaped item (upstream types `story`, `job`, `poll`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Story {
    pub id: ItemId,
    pub item_type: String,
    pub title: String,
    pub author: String,
    pub score: i64,
    pub submitted_at: Option<DateTime<Utc>>,
    pub url: Option<String>,
    pub text: Option<String>,
    pub descendants: i64,
    /// Top-level comment ids in upstream order.
    pub comment_ids: Vec<ItemId>,
    /// 1-based position in the current top list; `None` once the story drops out.
    pub rank: Option<u32>,
    pub last_seen_at: DateTime<Utc>,
}

/// Where a comment hangs in the tree.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", content = "id", rename_all = "snake_case")]
pub enum ParentRef {
    Story(ItemId),
    Comment(ItemId),
    /// Parent could not be resolved when the comment was normalized. Keeps the
    /// upstream parent id when one was supplied.
    Orphaned(Option<ItemId>),
}

impl ParentRef {
    pub fn kind_str(&self) -> &'static str {
        match self {
            ParentRef::Story(_) => "story",
            ParentRef::Comment(_) => "comment",
            ParentRef::Orphaned(_) => "orphan",
        }
    }

    pub fn id(&self) -> Option<ItemId> {
        match self {
            ParentRef::Story(id) | ParentRef::Comment(id) => Some(*id),
            ParentRef::Orphaned(id) => *id,
        }
    }

    /// Rebuild from the persisted `(parent_kind, parent_id)` column pair.
    pub fn from_parts(kind: &str, id: Option<ItemId>) -> Result<Self, ParseError> {
        match (kind, id) {
            ("story", Some(id)) => Ok(ParentRef::Story(id)),
            ("comment", Some(id)) => Ok(ParentRef::Comment(id)),
            ("orphan", id) => Ok(ParentRef::Orphaned(id)),
            _ => Err(ParseError::new("parent reference", kind)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ParentKind {
    Story,
    Comment,
}

/// A parent that is already known (persisted or fetched earlier in the cycle).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KnownParent {
    pub kind: ParentKind,
    pub id: ItemId,
    /// Depth of the parent itself; meaningless for stories.
    pub depth: u32,
    pub story_id: Option<ItemId>,
}

impl KnownParent {
    pub fn story(id: ItemId) -> Self {
        Self {
            kind: ParentKind::Story,
            id,
            depth: 0,
            story_id: Some(id),
        }
    }

    pub fn comment(id: ItemId, depth: u32, story_id: Option<ItemId>) -> Self {
        Self {
            kind: ParentKind::Comment,
            id,
            depth,
            story_id,
        }
    }

    pub fn parent_ref(&self) -> ParentRef {
        match self.kind {
            ParentKind::Story => ParentRef::Story(self.id),
            ParentKind::Comment => ParentRef::Comment(self.id),
        }
    }

    /// Depth of a direct child: top-level comments sit at depth 0.
    pub fn child_depth(&self) -> u32 {
        match self.kind {
            ParentKind::Story => 0,
            ParentKind::Comment => self.depth + 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Comment {
    pub id: ItemId,
    pub parent: ParentRef,
    /// Root story of the thread; `None` for orphans.
    pub story_id: Option<ItemId>,
    pub author: String,
    pub text: String,
    pub submitted_at: Option<DateTime<Utc>>,
    pub depth: u32,
    pub child_ids: Vec<ItemId>,
    pub deleted: bool,
    pub dead: bool,
    pub last_seen_at: DateTime<Utc>,
}

impl Comment {
    pub fn is_orphaned(&self) -> bool {
        matches!(self.parent, ParentRef::Orphaned(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    pub handle: String,
    pub about: String,
    pub karma: i64,
    pub created_at: Option<DateTime<Utc>>,
    /// Lazily populated; `None` means "never fetched", not "no submissions".
    pub submitted: Option<Vec<ItemId>>,
    pub last_seen_at: DateTime<Utc>,
}

/// Item with an upstream type this build does not model, kept verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UnknownItem {
    pub id: ItemId,
    pub item_type: String,
    pub raw: serde_json::Value,
    pub last_seen_at: DateTime<Utc>,
}

/// Operational criticality of a failure. `P0` is the most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Severity {
    /// Data-store access or corruption.
    P0,
    /// Top-level fetch or environment failure.
    P1,
    /// Per-story fetch failure.
    P2,
    /// Per-comment or per-user fetch failure.
    P3,
}

impl Severity {
    pub const ALL: [Severity; 4] = [Severity::P0, Severity::P1, Severity::P2, Severity::P3];

    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::P0 => "P0",
            Severity::P1 => "P1",
            Severity::P2 => "P2",
            Severity::P3 => "P3",
        }
    }

    /// P0 and P1 fail the cycle regardless of anything else.
    pub fn is_cycle_fatal(&self) -> bool {
        matches!(self, Severity::P0 | Severity::P1)
    }
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Severity {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "P0" => Ok(Severity::P0),
            "P1" => Ok(Severity::P1),
            "P2" => Ok(Severity::P2),
            "P3" => Ok(Severity::P3),
            other => Err(ParseError::new("severity", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ItemKind {
    TopStories,
    Story,
    Comment,
    User,
    Store,
}

impl ItemKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemKind::TopStories => "top_stories",
            ItemKind::Story => "story",
            ItemKind::Comment => "comment",
            ItemKind::User => "user",
            ItemKind::Store => "store",
        }
    }
}

impl fmt::Display for ItemKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ItemKind {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "top_stories" => Ok(ItemKind::TopStories),
            "story" => Ok(ItemKind::Story),
            "comment" => Ok(ItemKind::Comment),
            "user" => Ok(ItemKind::User),
            "store" => Ok(ItemKind::Store),
            other => Err(ParseError::new("item kind", other)),
        }
    }
}

/// One failure observed during a refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorRecord {
    pub severity: Severity,
    pub kind: ItemKind,
    pub item_id: Option<String>,
    pub message: String,
}

impl ErrorRecord {
    pub fn new(
        severity: Severity,
        kind: ItemKind,
        item_id: Option<String>,
        message: impl Into<String>,
    ) -> Self {
        Self {
            severity,
            kind,
            item_id,
            message: message.into(),
        }
    }

    /// Stable runbook line: `ERROR:refresh-<component>:P<n>: <message>`.
    pub fn log_line(&self) -> String {
        match &self.item_id {
            Some(id) => format!(
                "ERROR:refresh-{}:{}: {} {}: {}",
                self.kind, self.severity, self.kind, id, self.message
            ),
            None => format!("ERROR:refresh-{}:{}: {}", self.kind, self.severity, self.message),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunOutcome {
    Success,
    Degraded,
    Failed,
}

impl RunOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunOutcome::Success => "success",
            RunOutcome::Degraded => "degraded",
            RunOutcome::Failed => "failed",
        }
    }
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunOutcome {
    type Err = ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(RunOutcome::Success),
            "degraded" => Ok(RunOutcome::Degraded),
            "failed" => Ok(RunOutcome::Failed),
            other => Err(ParseError::new("run outcome", other)),
        }
    }
}

/// Outcome of a cycle from its error records and the number of stories that made it
/// into the store.
pub fn classify_outcome(errors: &[ErrorRecord], stories_succeeded: usize) -> RunOutcome {
    if errors.iter().any(|e| e.severity.is_cycle_fatal()) || stories_succeeded == 0 {
        RunOutcome::Failed
    } else if errors.is_empty() {
        RunOutcome::Success
    } else {
        RunOutcome::Degraded
    }
}

/// Ledger entry for one refresh cycle.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefreshRun {
    pub id: i64,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub outcome: Option<RunOutcome>,
    pub stories_refreshed: u32,
    pub comments_refreshed: u32,
    pub errors: Vec<ErrorRecord>,
}

impl RefreshRun {
    pub fn is_finished(&self) -> bool {
        self.finished_at.is_some()
    }

    /// Error counts keyed by severity label, with every severity present.
    pub fn error_counts(&self) -> BTreeMap<String, usize> {
        let mut counts: BTreeMap<String, usize> = Severity::ALL
            .iter()
            .map(|s| (s.as_str().to_string(), 0))
            .collect();
        for record in &self.errors {
            *counts.entry(record.severity.as_str().to_string()).or_default() += 1;
        }
        counts
    }
}

/// Classified failure of one upstream request.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FetchFailure {
    #[error("upstream unavailable: {0}")]
    Unavailable(String),
    #[error("request timed out: {0}")]
    Timeout(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("malformed response: {0}")]
    MalformedResponse(String),
}

impl FetchFailure {
    /// Transient failures are worth one immediate retry; the rest are deterministic.
    pub fn is_retryable(&self) -> bool {
        matches!(self, FetchFailure::Unavailable(_) | FetchFailure::Timeout(_))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown {what}: {value:?}")]
pub struct ParseError {
    pub what: &'static str,
    pub value: String,
}

impl ParseError {
    pub fn new(what: &'static str, value: impl Into<String>) -> Self {
        Self {
            what,
            value: value.into(),
        }
    }
}
