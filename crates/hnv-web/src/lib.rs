//! Read-mostly JSON API over the store, plus a manual refresh trigger.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path as AxumPath, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use hnv_core::{Comment, ItemId, Story};
use hnv_storage::{Store, StoreError};
use hnv_sync::{system_status, HnvConfig, RefreshError, Refresher};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::net::TcpListener;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::{error, info, warn};

pub const CRATE_NAME: &str = "hnv-web";

const TOP_LIMIT_DEFAULT: u32 = 5;
const TOP_LIMIT_MAX: u32 = 10;
const COMMENTS_LIMIT_DEFAULT: u32 = 10;
const COMMENTS_LIMIT_MAX: u32 = 20;

#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    /// Present when this process may start refresh cycles on request.
    pub refresher: Option<Arc<Refresher>>,
    pub comment_max_depth: u32,
    pub refresh_interval: Duration,
}

impl AppState {
    pub fn new(store: Store, config: &HnvConfig) -> Self {
        Self {
            store,
            refresher: None,
            comment_max_depth: config.comment_max_depth,
            refresh_interval: config.refresh_interval(),
        }
    }

    pub fn with_refresher(mut self, refresher: Arc<Refresher>) -> Self {
        self.refresher = Some(refresher);
        self
    }
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    detail: String,
}

impl ApiError {
    fn new(status: StatusCode, detail: impl Into<String>) -> Self {
        Self {
            status,
            detail: detail.into(),
        }
    }

    fn not_found(detail: &str) -> Self {
        Self::new(StatusCode::NOT_FOUND, detail)
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        error!(error = %err, "store query failed");
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "store unavailable")
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "detail": self.detail }))).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

#[derive(Debug, Default, Deserialize)]
struct LimitQuery {
    limit: Option<u32>,
}

impl LimitQuery {
    fn resolve(&self, default: u32, max: u32) -> Result<u32, ApiError> {
        match self.limit {
            None => Ok(default),
            Some(n) if (1..=max).contains(&n) => Ok(n),
            Some(n) => Err(ApiError::new(
                StatusCode::UNPROCESSABLE_ENTITY,
                format!("limit must be between 1 and {max}, got {n}"),
            )),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
struct DepthQuery {
    depth: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommentNode {
    #[serde(flatten)]
    pub comment: Comment,
    pub replies: Vec<CommentNode>,
}

#[derive(Debug, Clone, Serialize)]
struct StoryDetail {
    #[serde(flatten)]
    story: Story,
    comments: Vec<CommentNode>,
}

/// Arrange a story's stored comments as a tree in upstream order, down to `max_depth`.
///
/// Orphans and comments whose parent was never stored are left out.
pub fn build_comment_tree(story: &Story, comments: Vec<Comment>, max_depth: u32) -> Vec<CommentNode> {
    let mut by_id: HashMap<ItemId, Comment> = comments
        .into_iter()
        .filter(|c| !c.is_orphaned())
        .map(|c| (c.id, c))
        .collect();
    attach_children(story.id, &story.comment_ids, &mut by_id, 0, max_depth)
}

fn attach_children(
    parent_id: ItemId,
    child_ids: &[ItemId],
    by_id: &mut HashMap<ItemId, Comment>,
    depth: u32,
    max_depth: u32,
) -> Vec<CommentNode> {
    if depth > max_depth {
        return Vec::new();
    }
    let mut nodes = Vec::new();
    for id in child_ids {
        // removing as we go also guards against cycles in bad data
        let Some(comment) = by_id.remove(id) else {
            continue;
        };
        if comment.parent.id() != Some(parent_id) {
            continue;
        }
        let replies = attach_children(comment.id, &comment.child_ids, by_id, depth + 1, max_depth);
        nodes.push(CommentNode { comment, replies });
    }
    nodes
}

pub fn app(state: AppState) -> Router {
    Router::new()
        .route("/", get(index_handler))
        .route("/health", get(health_handler))
        .route("/api/stories/top", get(top_stories_handler))
        .route("/api/stories/{id}", get(story_detail_handler))
        .route("/api/stories/{id}/comments", get(story_comments_handler))
        .route("/api/users/{handle}", get(user_handler))
        .route("/api/system/status", get(status_handler))
        .route("/api/system/refresh", post(refresh_handler))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::very_permissive())
        .with_state(Arc::new(state))
}

/// Serve on `0.0.0.0:port` until Ctrl-C.
pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!(addr = %listener.local_addr()?, "serving API");
    axum::serve(listener, app(state))
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
        })
        .await?;
    Ok(())
}

async fn index_handler() -> Json<serde_json::Value> {
    Json(json!({ "message": "Welcome to the HackerNews Viewer API" }))
}

async fn health_handler() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

async fn top_stories_handler(
    State(state): State<Arc<AppState>>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Story>> {
    let limit = query.resolve(TOP_LIMIT_DEFAULT, TOP_LIMIT_MAX)?;
    Ok(Json(state.store.top_stories(limit).await?))
}

async fn story_detail_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<ItemId>,
    Query(query): Query<DepthQuery>,
) -> ApiResult<StoryDetail> {
    let story = state
        .store
        .get_story(id)
        .await?
        .ok_or_else(|| ApiError::not_found("Story not found"))?;
    let depth = query
        .depth
        .unwrap_or(state.comment_max_depth)
        .min(state.comment_max_depth);
    let comments = state.store.comments_for_story(id).await?;
    let comments = build_comment_tree(&story, comments, depth);
    Ok(Json(StoryDetail { story, comments }))
}

async fn story_comments_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(id): AxumPath<ItemId>,
    Query(query): Query<LimitQuery>,
) -> ApiResult<Vec<Comment>> {
    let limit = query.resolve(COMMENTS_LIMIT_DEFAULT, COMMENTS_LIMIT_MAX)?;
    if state.store.get_story(id).await?.is_none() {
        return Err(ApiError::not_found("Story not found"));
    }
    Ok(Json(state.store.top_level_comments(id, limit as usize).await?))
}

async fn user_handler(
    State(state): State<Arc<AppState>>,
    AxumPath(handle): AxumPath<String>,
) -> ApiResult<hnv_core::User> {
    let user = state
        .store
        .get_user(&handle)
        .await?
        .ok_or_else(|| ApiError::not_found("User not found"))?;
    Ok(Json(user))
}

async fn status_handler(State(state): State<Arc<AppState>>) -> ApiResult<hnv_sync::SystemStatus> {
    let running = state.refresher.as_ref().is_some_and(|r| r.is_running());
    let status = system_status(&state.store, running, state.refresh_interval, Utc::now()).await?;
    Ok(Json(status))
}

async fn refresh_handler(State(state): State<Arc<AppState>>) -> Response {
    let Some(refresher) = state.refresher.clone() else {
        return ApiError::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "refresh is not enabled on this server",
        )
        .into_response();
    };
    if refresher.is_running() {
        return ApiError::new(StatusCode::CONFLICT, "a refresh cycle is already running")
            .into_response();
    }

    tokio::spawn(async move {
        match refresher.run_cycle().await {
            Ok(run) => info!(run_id = run.id, outcome = ?run.outcome, "manual refresh done"),
            Err(RefreshError::AlreadyRunning { .. }) => warn!("manual refresh lost the race to another cycle"),
            Err(err) => error!(error = %err, "manual refresh failed"),
        }
    });
    (StatusCode::ACCEPTED, Json(json!({ "status": "refresh_started" }))).into_response()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use axum::body::Body;
    use chrono::{DateTime, TimeZone};
    use hnv_adapters::HnApi;
    use hnv_core::{FetchFailure, ParentRef, RunOutcome, User};
    use http_body_util::BodyExt;
    use serde_json::Value;
    use tokio::sync::Notify;
    use tower::ServiceExt;

    fn ts() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).single().unwrap()
    }

    fn story(id: ItemId, rank: Option<u32>, comment_ids: Vec<ItemId>) -> Story {
        Story {
            id,
            item_type: "story".into(),
            title: format!("Story {id}"),
            author: "pg".into(),
            score: 1,
            submitted_at: Some(ts()),
            url: None,
            text: None,
            descendants: comment_ids.len() as i64,
            comment_ids,
            rank,
            last_seen_at: ts(),
        }
    }

    fn comment(id: ItemId, parent: ParentRef, depth: u32, child_ids: Vec<ItemId>) -> Comment {
        Comment {
            id,
            parent,
            story_id: Some(1),
            author: "a".into(),
            text: format!("c{id}"),
            submitted_at: Some(ts()),
            depth,
            child_ids,
            deleted: false,
            dead: false,
            last_seen_at: ts(),
        }
    }

    /// Story 1 (rank 1) with thread 10 -> 100 -> 1000 and sibling 11; story 2 unranked.
    async fn seeded_store() -> Store {
        let store = Store::open_in_memory().await.unwrap();
        store.upsert_story(&story(1, Some(1), vec![11, 10])).await.unwrap();
        store.upsert_story(&story(2, None, vec![])).await.unwrap();
        store.upsert_story(&story(3, Some(2), vec![])).await.unwrap();
        for c in [
            comment(10, ParentRef::Story(1), 0, vec![100]),
            comment(11, ParentRef::Story(1), 0, vec![]),
            comment(100, ParentRef::Comment(10), 1, vec![1000]),
            comment(1000, ParentRef::Comment(100), 2, vec![]),
        ] {
            store.upsert_comment(&c).await.unwrap();
        }
        store
            .upsert_user(&User {
                handle: "pg".into(),
                about: "".into(),
                karma: 10,
                created_at: None,
                submitted: None,
                last_seen_at: ts(),
            })
            .await
            .unwrap();
        store
    }

    async fn test_app(store: Store) -> Router {
        app(AppState::new(store, &HnvConfig::default()))
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(axum::http::Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let body = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&body).unwrap_or(Value::Null))
    }

    async fn post(app: Router, uri: &str) -> StatusCode {
        app.oneshot(
            axum::http::Request::builder()
                .method("POST")
                .uri(uri)
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap()
        .status()
    }

    #[tokio::test]
    async fn health_and_index_respond() {
        let app = test_app(Store::open_in_memory().await.unwrap()).await;
        let (status, body) = get_json(app.clone(), "/health").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
        let (status, body) = get_json(app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["message"].as_str().unwrap().contains("HackerNews"));
    }

    #[tokio::test]
    async fn top_stories_only_lists_ranked_stories_and_validates_limit() {
        let app = test_app(seeded_store().await).await;
        let (status, body) = get_json(app.clone(), "/api/stories/top").await;
        assert_eq!(status, StatusCode::OK);
        let ids: Vec<_> = body.as_array().unwrap().iter().map(|s| s["id"].as_i64().unwrap()).collect();
        assert_eq!(ids, vec![1, 3]);

        let (status, body) = get_json(app.clone(), "/api/stories/top?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().unwrap().len(), 1);

        let (status, _) = get_json(app.clone(), "/api/stories/top?limit=11").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = get_json(app, "/api/stories/top?limit=0").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    }

    #[tokio::test]
    async fn story_detail_nests_comments_to_the_requested_depth() {
        let app = test_app(seeded_store().await).await;
        let (status, body) = get_json(app.clone(), "/api/stories/1").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["title"], "Story 1");
        let roots = body["comments"].as_array().unwrap();
        assert_eq!(roots.len(), 2);
        assert_eq!(roots[0]["id"], 11, "upstream order");
        assert_eq!(roots[1]["replies"][0]["replies"][0]["id"], 1000);

        let (_, body) = get_json(app.clone(), "/api/stories/1?depth=0").await;
        assert!(body["comments"][1]["replies"].as_array().unwrap().is_empty());

        let (status, body) = get_json(app, "/api/stories/404").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["detail"], "Story not found");
    }

    #[tokio::test]
    async fn unranked_story_stays_readable() {
        let app = test_app(seeded_store().await).await;
        let (status, body) = get_json(app, "/api/stories/2").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body["rank"].is_null());
    }

    #[tokio::test]
    async fn story_comments_lists_top_level_only() {
        let app = test_app(seeded_store().await).await;
        let (status, body) = get_json(app.clone(), "/api/stories/1/comments?limit=1").await;
        assert_eq!(status, StatusCode::OK);
        let comments = body.as_array().unwrap();
        assert_eq!(comments.len(), 1);
        assert_eq!(comments[0]["id"], 11);
        assert_eq!(comments[0]["parent"]["kind"], "story");

        let (status, _) = get_json(app.clone(), "/api/stories/1/comments?limit=21").await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        let (status, _) = get_json(app, "/api/stories/9/comments").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn users_are_served_or_404() {
        let app = test_app(seeded_store().await).await;
        let (status, body) = get_json(app.clone(), "/api/users/pg").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["karma"], 10);
        let (status, _) = get_json(app, "/api/users/nobody").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_reports_last_run_and_counts() {
        let store = seeded_store().await;
        let run = store.begin_run(ts()).await.unwrap();
        store
            .finish_run(run.id, Utc::now(), RunOutcome::Degraded, 2, 4, &[])
            .await
            .unwrap();
        let (status, body) = get_json(test_app(store).await, "/api/system/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["last_run_outcome"], "degraded");
        assert_eq!(body["error_counts_by_severity"]["P0"], 0);
        assert_eq!(body["totals"]["comments"], 4);
        assert_eq!(body["stale"], false);
        assert_eq!(body["refresh_in_progress"], false);
    }

    #[test]
    fn comment_tree_skips_orphans_and_foreign_children() {
        let s = story(1, Some(1), vec![10, 20]);
        let comments = vec![
            comment(10, ParentRef::Story(1), 0, vec![]),
            // listed by the story but claims another parent
            comment(20, ParentRef::Comment(99), 1, vec![]),
            comment(30, ParentRef::Orphaned(Some(1)), 0, vec![]),
        ];
        let tree = build_comment_tree(&s, comments, 2);
        assert_eq!(tree.len(), 1);
        assert_eq!(tree[0].comment.id, 10);
    }

    struct GatedApi {
        gate: Arc<Notify>,
    }

    #[async_trait]
    impl HnApi for GatedApi {
        async fn fetch_top_story_ids(&self, _limit: usize) -> Result<Vec<ItemId>, FetchFailure> {
            self.gate.notified().await;
            Err(FetchFailure::MalformedResponse("not a list".into()))
        }

        async fn fetch_item(&self, id: ItemId) -> Result<Value, FetchFailure> {
            Err(FetchFailure::NotFound(id.to_string()))
        }

        async fn fetch_user(&self, handle: &str) -> Result<Value, FetchFailure> {
            Err(FetchFailure::NotFound(handle.to_string()))
        }
    }

    #[tokio::test]
    async fn refresh_trigger_needs_a_refresher() {
        let app = test_app(Store::open_in_memory().await.unwrap()).await;
        assert_eq!(post(app, "/api/system/refresh").await, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn refresh_trigger_accepts_then_reports_conflict() {
        let store = Store::open_in_memory().await.unwrap();
        let gate = Arc::new(Notify::new());
        let api = Arc::new(GatedApi { gate: gate.clone() });
        let refresher = Arc::new(Refresher::new(api, store.clone(), Default::default()));
        let app = app(AppState::new(store.clone(), &HnvConfig::default()).with_refresher(refresher.clone()));

        assert_eq!(post(app.clone(), "/api/system/refresh").await, StatusCode::ACCEPTED);
        while !refresher.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(post(app.clone(), "/api/system/refresh").await, StatusCode::CONFLICT);

        let (_, body) = get_json(app, "/api/system/status").await;
        assert_eq!(body["refresh_in_progress"], true);

        gate.notify_one();
        while refresher.is_running() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let run = store.latest_run().await.unwrap().unwrap();
        assert_eq!(run.outcome, Some(RunOutcome::Failed));
    }
}
