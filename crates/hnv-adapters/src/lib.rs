//! Upstream API client contract plus the raw-item normalizer.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use hnv_core::{Comment, FetchFailure, ItemId, KnownParent, ParentRef, Story, UnknownItem, User};
use hnv_storage::{HttpClientConfig, HttpFetcher};
use serde::Serialize;
use serde_json::{Map, Value as JsonValue};
use thiserror::Error;
use tracing::debug;

pub const CRATE_NAME: &str = "hnv-adapters";

pub const DEFAULT_API_BASE_URL: &str = "https://hacker-news.firebaseio.com/v0";

/// Item types stored as stories.
pub const STORY_TYPES: [&str; 3] = ["story", "job", "poll"];

/// Read-only view of the upstream news API.
///
/// Implementations never retry and never panic on bad payloads: every failure comes back
/// as a classified [`FetchFailure`].
#[async_trait]
pub trait HnApi: Send + Sync {
    /// Current top list, in upstream order, truncated to `limit`.
    async fn fetch_top_story_ids(&self, limit: usize) -> Result<Vec<ItemId>, FetchFailure>;

    /// Raw item payload. A missing item is `NotFound`.
    async fn fetch_item(&self, id: ItemId) -> Result<JsonValue, FetchFailure>;

    async fn fetch_user(&self, handle: &str) -> Result<JsonValue, FetchFailure>;
}

#[derive(Debug)]
pub struct HttpHnApi {
    http: HttpFetcher,
    base_url: String,
}

impl HttpHnApi {
    pub fn new(base_url: impl Into<String>, config: HttpClientConfig) -> Result<Self> {
        Ok(Self {
            http: HttpFetcher::new(config)?,
            base_url: base_url.into().trim_end_matches('/').to_string(),
        })
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn fetch_present(&self, url: String) -> Result<JsonValue, FetchFailure> {
        match self.http.fetch_json(&url).await? {
            // the upstream answers unknown ids with a literal `null`
            JsonValue::Null => Err(FetchFailure::NotFound(url)),
            value => Ok(value),
        }
    }
}

#[async_trait]
impl HnApi for HttpHnApi {
    async fn fetch_top_story_ids(&self, limit: usize) -> Result<Vec<ItemId>, FetchFailure> {
        let url = format!("{}/topstories.json", self.base_url);
        let value = self.http.fetch_json(&url).await?;
        let ids = value
            .as_array()
            .ok_or_else(|| FetchFailure::MalformedResponse(format!("{url}: expected an id array")))?;
        let ids = ids
            .iter()
            .take(limit)
            .map(|v| {
                v.as_i64()
                    .ok_or_else(|| FetchFailure::MalformedResponse(format!("{url}: bad id {v}")))
            })
            .collect::<Result<Vec<_>, _>>()?;
        debug!(count = ids.len(), "fetched top story ids");
        Ok(ids)
    }

    async fn fetch_item(&self, id: ItemId) -> Result<JsonValue, FetchFailure> {
        self.fetch_present(format!("{}/item/{id}.json", self.base_url))
            .await
    }

    async fn fetch_user(&self, handle: &str) -> Result<JsonValue, FetchFailure> {
        self.fetch_present(format!("{}/user/{handle}.json", self.base_url))
            .await
    }
}

/// Whole-record rejection: the payload lacks something no default can stand in for.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Rejection {
    #[error("record is not a JSON object")]
    NotAnObject,
    #[error("missing required field `{0}`")]
    MissingField(&'static str),
    #[error("required field `{0}` has the wrong type")]
    InvalidField(&'static str),
}

impl Rejection {
    pub fn into_failure(self, what: &str) -> FetchFailure {
        FetchFailure::MalformedResponse(format!("{what}: {self}"))
    }
}

/// An optional field that was present but unusable and got replaced by its default.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    pub field: &'static str,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Normalized<T> {
    pub entity: T,
    pub field_errors: Vec<FieldError>,
}

impl<T> Normalized<T> {
    pub fn is_clean(&self) -> bool {
        self.field_errors.is_empty()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Entity {
    Story(Story),
    Comment(Comment),
    Unknown(UnknownItem),
}

impl Entity {
    pub fn id(&self) -> ItemId {
        match self {
            Entity::Story(s) => s.id,
            Entity::Comment(c) => c.id,
            Entity::Unknown(u) => u.id,
        }
    }

    pub fn type_name(&self) -> &str {
        match self {
            Entity::Story(s) => &s.item_type,
            Entity::Comment(_) => "comment",
            Entity::Unknown(u) => &u.item_type,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NormalizeContext {
    pub seen_at: DateTime<Utc>,
    /// The comment's parent, if the caller could resolve the id the payload names.
    pub parent: Option<KnownParent>,
}

impl NormalizeContext {
    pub fn new(seen_at: DateTime<Utc>) -> Self {
        Self {
            seen_at,
            parent: None,
        }
    }

    pub fn with_parent(mut self, parent: Option<KnownParent>) -> Self {
        self.parent = parent;
        self
    }
}

struct Fields<'a> {
    obj: &'a Map<String, JsonValue>,
    errors: Vec<FieldError>,
}

impl<'a> Fields<'a> {
    fn new(raw: &'a JsonValue) -> Result<Self, Rejection> {
        let obj = raw.as_object().ok_or(Rejection::NotAnObject)?;
        Ok(Self {
            obj,
            errors: Vec::new(),
        })
    }

    fn present(&self, key: &str) -> Option<&'a JsonValue> {
        self.obj.get(key).filter(|v| !v.is_null())
    }

    fn invalid(&mut self, field: &'static str, value: &JsonValue) {
        self.errors.push(FieldError {
            field,
            message: format!("unexpected value {value}"),
        });
    }

    fn required_id(&self) -> Result<ItemId, Rejection> {
        self.present("id")
            .ok_or(Rejection::MissingField("id"))?
            .as_i64()
            .ok_or(Rejection::InvalidField("id"))
    }

    fn required_str(&self, field: &'static str) -> Result<String, Rejection> {
        self.present(field)
            .ok_or(Rejection::MissingField(field))?
            .as_str()
            .map(str::to_string)
            .ok_or(Rejection::InvalidField(field))
    }

    fn opt_str(&mut self, field: &'static str) -> Option<String> {
        let value = self.present(field)?;
        match value.as_str() {
            Some(s) => Some(s.to_string()),
            None => {
                self.invalid(field, value);
                None
            }
        }
    }

    fn str_or_empty(&mut self, field: &'static str) -> String {
        self.opt_str(field).unwrap_or_default()
    }

    fn int(&mut self, field: &'static str) -> i64 {
        let Some(value) = self.present(field) else {
            return 0;
        };
        match value.as_i64() {
            Some(n) => n,
            None => {
                self.invalid(field, value);
                0
            }
        }
    }

    fn opt_int(&mut self, field: &'static str) -> Option<i64> {
        let value = self.present(field)?;
        let n = value.as_i64();
        if n.is_none() {
            self.invalid(field, value);
        }
        n
    }

    fn flag(&mut self, field: &'static str) -> bool {
        let Some(value) = self.present(field) else {
            return false;
        };
        match value.as_bool() {
            Some(b) => b,
            None => {
                self.invalid(field, value);
                false
            }
        }
    }

    fn unix_time(&mut self, field: &'static str) -> Option<DateTime<Utc>> {
        let secs = self.opt_int(field)?;
        let time = DateTime::from_timestamp(secs, 0);
        if time.is_none() {
            self.errors.push(FieldError {
                field,
                message: format!("timestamp {secs} out of range"),
            });
        }
        time
    }

    fn ids(&mut self, field: &'static str) -> Vec<ItemId> {
        let Some(value) = self.present(field) else {
            return Vec::new();
        };
        let Some(items) = value.as_array() else {
            self.invalid(field, value);
            return Vec::new();
        };
        let ids: Vec<ItemId> = items.iter().filter_map(JsonValue::as_i64).collect();
        if ids.len() != items.len() {
            self.errors.push(FieldError {
                field,
                message: format!("dropped {} non-integer ids", items.len() - ids.len()),
            });
        }
        ids
    }

    fn finish<T>(self, entity: T) -> Normalized<T> {
        Normalized {
            entity,
            field_errors: self.errors,
        }
    }
}

/// Convert a raw item payload into a story, comment or unknown entity.
///
/// Only a missing/invalid `id` or `type` rejects the record. Stories are produced without a
/// rank; the caller assigns it.
pub fn normalize_item(raw: &JsonValue, ctx: &NormalizeContext) -> Result<Normalized<Entity>, Rejection> {
    let mut fields = Fields::new(raw)?;
    let id = fields.required_id()?;
    let item_type = fields.required_str("type")?;

    if STORY_TYPES.contains(&item_type.as_str()) {
        let story = Story {
            id,
            title: fields.str_or_empty("title"),
            author: fields.str_or_empty("by"),
            score: fields.int("score"),
            submitted_at: fields.unix_time("time"),
            url: fields.opt_str("url"),
            text: fields.opt_str("text"),
            descendants: fields.int("descendants"),
            comment_ids: fields.ids("kids"),
            rank: None,
            last_seen_at: ctx.seen_at,
            item_type,
        };
        return Ok(fields.finish(Entity::Story(story)));
    }

    if item_type == "comment" {
        let upstream_parent = fields.opt_int("parent");
        let (parent, depth, story_id) = match (upstream_parent, ctx.parent) {
            (Some(pid), Some(known)) if known.id == pid => {
                (known.parent_ref(), known.child_depth(), known.story_id)
            }
            (pid, _) => (ParentRef::Orphaned(pid), 0, None),
        };
        let comment = Comment {
            id,
            parent,
            story_id,
            author: fields.str_or_empty("by"),
            text: fields.str_or_empty("text"),
            submitted_at: fields.unix_time("time"),
            depth,
            child_ids: fields.ids("kids"),
            deleted: fields.flag("deleted"),
            dead: fields.flag("dead"),
            last_seen_at: ctx.seen_at,
        };
        return Ok(fields.finish(Entity::Comment(comment)));
    }

    let unknown = UnknownItem {
        id,
        item_type,
        raw: raw.clone(),
        last_seen_at: ctx.seen_at,
    };
    Ok(fields.finish(Entity::Unknown(unknown)))
}

/// Convert a raw user payload. Submissions are kept only when `with_submitted` is set, so
/// routine refreshes leave the stored list alone.
pub fn normalize_user(
    raw: &JsonValue,
    seen_at: DateTime<Utc>,
    with_submitted: bool,
) -> Result<Normalized<User>, Rejection> {
    let mut fields = Fields::new(raw)?;
    let handle = fields.required_str("id")?;
    let user = User {
        handle,
        about: fields.str_or_empty("about"),
        karma: fields.int("karma"),
        created_at: fields.unix_time("created"),
        submitted: with_submitted.then(|| fields.ids("submitted")),
        last_seen_at: seen_at,
    };
    Ok(fields.finish(user))
}
