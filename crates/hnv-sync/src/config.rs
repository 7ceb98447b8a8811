use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use hnv_adapters::DEFAULT_API_BASE_URL;
use hnv_storage::{HttpClientConfig, TokenBucketConfig};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::RefreshSettings;

const DEFAULT_CONFIG_FILE: &str = "hnv.yaml";

/// Runtime configuration: defaults, then an optional YAML file, then `HNV_*` env vars.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct HnvConfig {
    pub data_dir: PathBuf,
    /// Defaults to `<data_dir>/hackernews.db`.
    pub database_path: Option<PathBuf>,
    /// Defaults to `<data_dir>/backups`.
    pub backup_dir: Option<PathBuf>,
    pub api_base_url: String,
    pub refresh_interval_secs: u64,
    pub backup_cron: String,
    pub backup_keep: usize,
    pub fetch_timeout_secs: u64,
    pub max_fan_out: usize,
    pub requests_per_second: Option<u32>,
    pub top_story_count: usize,
    pub top_comment_limit: usize,
    pub reply_limit: usize,
    pub comment_max_depth: u32,
    pub user_agent: String,
    pub web_port: u16,
}

impl Default for HnvConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            database_path: None,
            backup_dir: None,
            api_base_url: DEFAULT_API_BASE_URL.to_string(),
            refresh_interval_secs: 3600,
            backup_cron: "0 0 3 * * *".to_string(),
            backup_keep: 10,
            fetch_timeout_secs: 10,
            max_fan_out: 8,
            requests_per_second: None,
            top_story_count: 5,
            top_comment_limit: 10,
            reply_limit: 5,
            comment_max_depth: 2,
            user_agent: "hnv-refresh/0.1".to_string(),
            web_port: 8000,
        }
    }
}

impl HnvConfig {
    /// Load `.env`, then `HNV_CONFIG_FILE` (or `./hnv.yaml` when present), then env overrides.
    pub fn load() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match std::env::var("HNV_CONFIG_FILE") {
            Ok(path) => Some(PathBuf::from(path)),
            Err(_) => Some(PathBuf::from(DEFAULT_CONFIG_FILE)).filter(|p| p.exists()),
        };
        let mut config = match file {
            Some(path) => Self::from_yaml_file(&path)?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = Self::from_yaml_str(&text)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!(path = %path.display(), "loaded config file");
        Ok(config)
    }

    pub fn from_yaml_str(text: &str) -> Result<Self> {
        if text.trim().is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_yaml::from_str(text)?)
    }

    /// Apply `HNV_*` overrides from `lookup`. Unparseable values keep the current setting.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("HNV_DATA_DIR") {
            self.data_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("HNV_DATABASE_PATH") {
            self.database_path = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HNV_BACKUP_DIR") {
            self.backup_dir = Some(PathBuf::from(v));
        }
        if let Some(v) = lookup("HNV_API_BASE_URL") {
            self.api_base_url = v;
        }
        if let Some(v) = lookup("HNV_BACKUP_CRON") {
            self.backup_cron = v;
        }
        if let Some(v) = lookup("HNV_USER_AGENT") {
            self.user_agent = v;
        }
        override_parsed(&lookup, "HNV_REFRESH_INTERVAL_SECS", &mut self.refresh_interval_secs);
        override_parsed(&lookup, "HNV_BACKUP_KEEP", &mut self.backup_keep);
        override_parsed(&lookup, "HNV_FETCH_TIMEOUT_SECS", &mut self.fetch_timeout_secs);
        override_parsed(&lookup, "HNV_MAX_FAN_OUT", &mut self.max_fan_out);
        override_parsed(&lookup, "HNV_TOP_STORY_COUNT", &mut self.top_story_count);
        override_parsed(&lookup, "HNV_TOP_COMMENT_LIMIT", &mut self.top_comment_limit);
        override_parsed(&lookup, "HNV_REPLY_LIMIT", &mut self.reply_limit);
        override_parsed(&lookup, "HNV_COMMENT_MAX_DEPTH", &mut self.comment_max_depth);
        override_parsed(&lookup, "HNV_WEB_PORT", &mut self.web_port);

        if let Some(v) = lookup("HNV_REQUESTS_PER_SECOND") {
            match v.parse::<u32>() {
                Ok(0) => self.requests_per_second = None,
                Ok(rps) => self.requests_per_second = Some(rps),
                Err(_) => {
                    warn!(key = "HNV_REQUESTS_PER_SECOND", value = %v, "ignoring invalid value")
                }
            }
        }
    }

    pub fn database_path(&self) -> PathBuf {
        self.database_path
            .clone()
            .unwrap_or_else(|| self.data_dir.join("hackernews.db"))
    }

    pub fn backup_dir(&self) -> PathBuf {
        self.backup_dir
            .clone()
            .unwrap_or_else(|| self.data_dir.join("backups"))
    }

    pub fn refresh_interval(&self) -> Duration {
        Duration::from_secs(self.refresh_interval_secs.max(1))
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.fetch_timeout_secs.max(1)),
            user_agent: Some(self.user_agent.clone()),
            max_fan_out: self.max_fan_out.max(1),
            token_bucket: self.requests_per_second.map(TokenBucketConfig::per_second),
        }
    }

    pub fn refresh_settings(&self) -> RefreshSettings {
        RefreshSettings {
            top_story_count: self.top_story_count,
            top_comment_limit: self.top_comment_limit,
            reply_limit: self.reply_limit,
            comment_max_depth: self.comment_max_depth,
            max_fan_out: self.max_fan_out.max(1),
        }
    }
}

fn override_parsed<T, F>(lookup: &F, key: &'static str, target: &mut T)
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    let Some(raw) = lookup(key) else {
        return;
    };
    match raw.trim().parse() {
        Ok(value) => *target = value,
        Err(_) => warn!(key, value = %raw, "ignoring invalid value"),
    }
}
