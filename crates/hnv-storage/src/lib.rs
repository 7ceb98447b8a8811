//! Relational store, store-file backups and HTTP fetch utilities for HNV.

mod backup;
mod db;

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use hnv_core::FetchFailure;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};

pub use backup::{
    backup_filename, cleanup_old_backups, create_backup, list_backups, BackupError, BackupRecord,
};
pub use db::{Store, StoreCounts, StoreError, StoreResult, ABANDONED_RUN_MESSAGE};

pub const CRATE_NAME: &str = "hnv-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Map a non-success HTTP status onto the client failure taxonomy.
pub fn classify_status(status: StatusCode, url: &str) -> FetchFailure {
    match status {
        StatusCode::NOT_FOUND | StatusCode::GONE => FetchFailure::NotFound(url.to_string()),
        StatusCode::REQUEST_TIMEOUT | StatusCode::GATEWAY_TIMEOUT => {
            FetchFailure::Timeout(format!("http status {} for {url}", status.as_u16()))
        }
        _ => FetchFailure::Unavailable(format!("http status {} for {url}", status.as_u16())),
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error, url: &str) -> FetchFailure {
    if err.is_timeout() {
        FetchFailure::Timeout(url.to_string())
    } else if err.is_decode() {
        FetchFailure::MalformedResponse(format!("{url}: {err}"))
    } else {
        FetchFailure::Unavailable(format!("{url}: {err}"))
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    /// Upper bound on requests in flight at once.
    pub max_fan_out: usize,
    pub token_bucket: Option<TokenBucketConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(10),
            user_agent: None,
            max_fan_out: 8,
            token_bucket: None,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

impl TokenBucketConfig {
    /// Bucket allowing roughly `rps` requests per second with a one-second burst.
    pub fn per_second(rps: u32) -> Self {
        let rps = rps.max(1);
        Self {
            capacity: rps,
            refill_every: Duration::from_secs(1) / rps,
        }
    }
}

#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            // a zero interval would never refill
            refill_every: refill_every.max(Duration::from_nanos(1)),
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = elapsed.as_nanos() / self.refill_every.as_nanos();
                let refills = u32::try_from(refills).unwrap_or(u32::MAX);
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

/// Shared HTTP client with a fixed per-request timeout and bounded fan-out.
///
/// Never retries: callers decide whether a classified failure deserves another attempt.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    fan_out: Arc<Semaphore>,
    token_bucket: Option<Arc<SimpleTokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let token_bucket = config
            .token_bucket
            .map(|c| Arc::new(SimpleTokenBucket::new(c.capacity, c.refill_every)));

        Ok(Self {
            client,
            fan_out: Arc::new(Semaphore::new(config.max_fan_out.max(1))),
            token_bucket,
        })
    }

    /// GET `url` and parse the body as JSON.
    pub async fn fetch_json(&self, url: &str) -> Result<serde_json::Value, FetchFailure> {
        let _permit = self
            .fan_out
            .acquire()
            .await
            .map_err(|_| FetchFailure::Unavailable("fetcher is shutting down".to_string()))?;

        if let Some(bucket) = &self.token_bucket {
            bucket.take().await;
        }

        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err, url))?;

            let status = resp.status();
            if !status.is_success() {
                return Err(classify_status(status, url));
            }

            let body = resp
                .bytes()
                .await
                .map_err(|err| classify_reqwest_error(&err, url))?;
            debug!(bytes = body.len(), "fetched");
            serde_json::from_slice(&body)
                .map_err(|err| FetchFailure::MalformedResponse(format!("{url}: {err}")))
        }
        .instrument(span)
        .await
    }
}
