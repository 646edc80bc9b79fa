use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::categorize::RuleSpec;

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub crawler: CrawlerConfig,
    #[serde(default)]
    pub categorizer: CategorizerConfig,
    #[serde(default)]
    pub relationships: RelationshipConfig,
    #[serde(default)]
    pub domains: Vec<DomainOverride>,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum RobotsPolicy {
    /// Missing or unreachable robots data allows the crawl.
    #[default]
    FailOpen,
    /// Missing or unreachable robots data blocks the domain.
    FailClosed,
}

#[derive(Debug, Deserialize, Serialize, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum PriorityScoring {
    #[default]
    Additive,
    Multiplicative,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CrawlerConfig {
    #[serde(default = "default_user_agent")]
    pub user_agent: String,
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,
    #[serde(default = "default_fetch_timeout_secs")]
    pub fetch_timeout_secs: u64,
    #[serde(default = "default_retry_ceiling")]
    pub retry_ceiling: i64,
    #[serde(default = "default_retry_priority_penalty")]
    pub retry_priority_penalty: i64,
    #[serde(default = "default_crawl_delay_secs")]
    pub default_crawl_delay_secs: f64,
    #[serde(default = "default_max_depth")]
    pub default_max_depth: i64,
    #[serde(default)]
    pub robots_policy: RobotsPolicy,
    #[serde(default = "default_true")]
    pub respect_robots: bool,
    /// Only follow links whose domain matches one of the session seeds.
    #[serde(default = "default_true")]
    pub same_domain_only: bool,
    #[serde(default)]
    pub max_pages: Option<u64>,
    #[serde(default)]
    pub priority_scoring: PriorityScoring,
    #[serde(default = "default_high_value_keywords")]
    pub high_value_keywords: Vec<String>,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: default_user_agent(),
            concurrency: default_concurrency(),
            fetch_timeout_secs: default_fetch_timeout_secs(),
            retry_ceiling: default_retry_ceiling(),
            retry_priority_penalty: default_retry_priority_penalty(),
            default_crawl_delay_secs: default_crawl_delay_secs(),
            default_max_depth: default_max_depth(),
            robots_policy: RobotsPolicy::default(),
            respect_robots: true,
            same_domain_only: true,
            max_pages: None,
            priority_scoring: PriorityScoring::default(),
            high_value_keywords: default_high_value_keywords(),
        }
    }
}

fn default_user_agent() -> String {
    format!("crawl-harness/{}", env!("CARGO_PKG_VERSION"))
}
fn default_concurrency() -> usize {
    4
}
fn default_fetch_timeout_secs() -> u64 {
    30
}
fn default_retry_ceiling() -> i64 {
    3
}
fn default_retry_priority_penalty() -> i64 {
    2
}
fn default_crawl_delay_secs() -> f64 {
    1.0
}
fn default_max_depth() -> i64 {
    3
}
fn default_true() -> bool {
    true
}
fn default_high_value_keywords() -> Vec<String> {
    [
        "docs",
        "guide",
        "tutorial",
        "reference",
        "learn",
        "getting-started",
        "api",
        "handbook",
        "book",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct CategorizerConfig {
    #[serde(default = "default_min_segment_chars")]
    pub min_segment_chars: usize,
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_true")]
    pub use_builtin_rules: bool,
    #[serde(default)]
    pub rules: Vec<RuleSpec>,
}

impl Default for CategorizerConfig {
    fn default() -> Self {
        Self {
            min_segment_chars: default_min_segment_chars(),
            language: default_language(),
            use_builtin_rules: true,
            rules: Vec::new(),
        }
    }
}

fn default_min_segment_chars() -> usize {
    20
}
fn default_language() -> String {
    "en".to_string()
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct RelationshipConfig {
    #[serde(default = "default_min_strength")]
    pub min_strength: f64,
    #[serde(default = "default_similar_threshold")]
    pub similar_threshold: f64,
    #[serde(default = "default_max_candidates")]
    pub max_candidates: i64,
}

impl Default for RelationshipConfig {
    fn default() -> Self {
        Self {
            min_strength: default_min_strength(),
            similar_threshold: default_similar_threshold(),
            max_candidates: default_max_candidates(),
        }
    }
}

fn default_min_strength() -> f64 {
    0.2
}
fn default_similar_threshold() -> f64 {
    0.5
}
fn default_max_candidates() -> i64 {
    200
}

/// Per-domain overrides applied to the domain policy store at startup.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct DomainOverride {
    pub domain: String,
    #[serde(default)]
    pub crawl_delay_secs: Option<f64>,
    #[serde(default)]
    pub max_depth: Option<i64>,
    #[serde(default)]
    pub allowed_paths: Vec<String>,
    #[serde(default)]
    pub blocked_paths: Vec<String>,
    #[serde(default)]
    pub content_filters: Vec<String>,
    #[serde(default)]
    pub priority_boost: Option<f64>,
}

impl Config {
    /// Minimal configuration rooted at a database path.
    pub fn with_db_path(path: impl Into<PathBuf>) -> Self {
        Self {
            db: DbConfig { path: path.into() },
            crawler: CrawlerConfig::default(),
            categorizer: CategorizerConfig::default(),
            relationships: RelationshipConfig::default(),
            domains: Vec::new(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !(1..=64).contains(&self.crawler.concurrency) {
            anyhow::bail!("crawler.concurrency must be in [1, 64]");
        }
        if self.crawler.fetch_timeout_secs == 0 {
            anyhow::bail!("crawler.fetch_timeout_secs must be > 0");
        }
        if self.crawler.retry_ceiling < 0 {
            anyhow::bail!("crawler.retry_ceiling must be >= 0");
        }
        if self.crawler.default_crawl_delay_secs < 0.0 {
            anyhow::bail!("crawler.default_crawl_delay_secs must be >= 0");
        }
        if self.crawler.default_max_depth < 0 {
            anyhow::bail!("crawler.default_max_depth must be >= 0");
        }
        if !(0.0..=1.0).contains(&self.relationships.min_strength) {
            anyhow::bail!("relationships.min_strength must be in [0.0, 1.0]");
        }
        if !(0.0..=1.0).contains(&self.relationships.similar_threshold) {
            anyhow::bail!("relationships.similar_threshold must be in [0.0, 1.0]");
        }
        if self.relationships.max_candidates < 1 {
            anyhow::bail!("relationships.max_candidates must be >= 1");
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    config.validate()?;

    Ok(config)
}
