//! Per-domain crawl rules.
//!
//! The [`DomainPolicyStore`] owns the `domain_rules` table. [`resolve`]
//! never reports a missing domain: an unseen domain gets a default rule that
//! is persisted on first sight. [`is_allowed`] evaluates path allow/block
//! globs and the cached robots snapshot.
//!
//! Robots data missing or unreachable is resolved by
//! [`RobotsPolicy`]: `fail_open` (default) admits the URL, `fail_closed`
//! rejects it.
//!
//! [`resolve`]: DomainPolicyStore::resolve
//! [`is_allowed`]: DomainPolicyStore::is_allowed

use anyhow::Result;
use chrono::Utc;
use globset::{Glob, GlobSet, GlobSetBuilder};
use sqlx::{Row, SqlitePool};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::config::{CrawlerConfig, DomainOverride, RobotsPolicy};
use crate::db::{from_millis, to_millis};
use crate::error::CrawlError;
use crate::models::DomainRule;
use crate::robots::RobotsTxt;
use crate::url_utils::split_url;

/// Prefix-or-glob path matcher.
#[derive(Debug)]
struct PathMatcher {
    globs: GlobSet,
    prefixes: Vec<String>,
}

impl PathMatcher {
    fn compile(patterns: &[String]) -> Result<Option<Self>, CrawlError> {
        if patterns.is_empty() {
            return Ok(None);
        }
        let mut builder = GlobSetBuilder::new();
        let mut prefixes = Vec::new();
        for pattern in patterns {
            if pattern.contains(['*', '?', '[', '{']) {
                let glob = Glob::new(pattern).map_err(|e| {
                    CrawlError::Configuration(format!("bad path pattern '{}': {}", pattern, e))
                })?;
                builder.add(glob);
            } else {
                prefixes.push(pattern.clone());
            }
        }
        let globs = builder
            .build()
            .map_err(|e| CrawlError::Configuration(e.to_string()))?;
        Ok(Some(Self { globs, prefixes }))
    }

    fn is_match(&self, path: &str) -> bool {
        self.prefixes.iter().any(|p| path.starts_with(p.as_str())) || self.globs.is_match(path)
    }
}

#[derive(Debug)]
struct CompiledRule {
    rule: DomainRule,
    allowed: Option<PathMatcher>,
    blocked: Option<PathMatcher>,
    robots: Option<RobotsTxt>,
}

impl CompiledRule {
    fn compile(rule: DomainRule) -> Self {
        // Rules are validated before they are saved; a pattern that still
        // fails here is dropped rather than blocking the domain.
        let allowed = PathMatcher::compile(&rule.allowed_paths).unwrap_or_else(|e| {
            tracing::warn!(domain = %rule.domain, error = %e, "ignoring allowed_paths");
            None
        });
        let blocked = PathMatcher::compile(&rule.blocked_paths).unwrap_or_else(|e| {
            tracing::warn!(domain = %rule.domain, error = %e, "ignoring blocked_paths");
            None
        });
        let robots = rule.robots_txt.as_deref().map(RobotsTxt::parse);
        Self {
            rule,
            allowed,
            blocked,
            robots,
        }
    }
}

pub struct DomainPolicyStore {
    pool: SqlitePool,
    default_crawl_delay_secs: f64,
    default_max_depth: i64,
    user_agent: String,
    respect_robots: bool,
    robots_policy: RobotsPolicy,
    cache: Mutex<HashMap<String, Arc<CompiledRule>>>,
}

impl DomainPolicyStore {
    pub fn new(pool: SqlitePool, crawler: &CrawlerConfig) -> Self {
        Self {
            pool,
            default_crawl_delay_secs: crawler.default_crawl_delay_secs,
            default_max_depth: crawler.default_max_depth,
            user_agent: crawler.user_agent.clone(),
            respect_robots: crawler.respect_robots,
            robots_policy: crawler.robots_policy,
            cache: Mutex::new(HashMap::new()),
        }
    }

    pub fn user_agent(&self) -> &str {
        &self.user_agent
    }

    fn cached(&self, domain: &str) -> Option<Arc<CompiledRule>> {
        let cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.get(domain).cloned()
    }

    fn remember(&self, rule: DomainRule) -> Arc<CompiledRule> {
        let compiled = Arc::new(CompiledRule::compile(rule));
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        cache.insert(compiled.rule.domain.clone(), Arc::clone(&compiled));
        compiled
    }

    /// Rule for `domain`, creating and persisting defaults on first sight.
    pub async fn resolve(&self, domain: &str) -> Result<DomainRule> {
        if let Some(compiled) = self.cached(domain) {
            return Ok(compiled.rule.clone());
        }

        if let Some(rule) = self.load(domain).await? {
            return Ok(self.remember(rule).rule.clone());
        }

        let rule = DomainRule::with_defaults(
            domain,
            self.default_crawl_delay_secs,
            self.default_max_depth,
        );
        sqlx::query(
            r#"
            INSERT INTO domain_rules (domain, crawl_delay_secs, max_depth, updated_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(domain) DO NOTHING
            "#,
        )
        .bind(&rule.domain)
        .bind(rule.crawl_delay_secs)
        .bind(rule.max_depth)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        // A concurrent resolve may have won the insert; re-read the row.
        let rule = self.load(domain).await?.unwrap_or(rule);
        tracing::debug!(domain, "created default domain rule");
        Ok(self.remember(rule).rule.clone())
    }

    async fn load(&self, domain: &str) -> Result<Option<DomainRule>> {
        let row = sqlx::query(
            r#"
            SELECT domain, robots_txt, robots_fetched_at, crawl_delay_secs, max_depth,
                   allowed_paths_json, blocked_paths_json, content_filters_json, priority_boost
            FROM domain_rules WHERE domain = ?
            "#,
        )
        .bind(domain)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let list = |col: &str| -> Vec<String> {
                let raw: String = row.get(col);
                serde_json::from_str(&raw).unwrap_or_default()
            };
            DomainRule {
                domain: row.get("domain"),
                robots_txt: row.get("robots_txt"),
                robots_fetched_at: row
                    .get::<Option<i64>, _>("robots_fetched_at")
                    .map(from_millis),
                crawl_delay_secs: row.get("crawl_delay_secs"),
                max_depth: row.get("max_depth"),
                allowed_paths: list("allowed_paths_json"),
                blocked_paths: list("blocked_paths_json"),
                content_filters: list("content_filters_json"),
                priority_boost: row.get("priority_boost"),
            }
        }))
    }

    /// Persist a full rule, replacing any stored version.
    pub async fn save(&self, rule: &DomainRule) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO domain_rules (domain, robots_txt, robots_fetched_at, crawl_delay_secs,
                max_depth, allowed_paths_json, blocked_paths_json, content_filters_json,
                priority_boost, updated_at)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(domain) DO UPDATE SET
                robots_txt = excluded.robots_txt,
                robots_fetched_at = excluded.robots_fetched_at,
                crawl_delay_secs = excluded.crawl_delay_secs,
                max_depth = excluded.max_depth,
                allowed_paths_json = excluded.allowed_paths_json,
                blocked_paths_json = excluded.blocked_paths_json,
                content_filters_json = excluded.content_filters_json,
                priority_boost = excluded.priority_boost,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&rule.domain)
        .bind(&rule.robots_txt)
        .bind(rule.robots_fetched_at.map(to_millis))
        .bind(rule.crawl_delay_secs)
        .bind(rule.max_depth)
        .bind(serde_json::to_string(&rule.allowed_paths)?)
        .bind(serde_json::to_string(&rule.blocked_paths)?)
        .bind(serde_json::to_string(&rule.content_filters)?)
        .bind(rule.priority_boost)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        self.remember(rule.clone());
        Ok(())
    }

    /// Apply `[[domains]]` overrides. Malformed entries are logged and skipped.
    pub async fn apply_overrides(&self, overrides: &[DomainOverride]) -> Result<usize> {
        let mut applied = 0;
        for o in overrides {
            if let Err(e) = validate_override(o) {
                tracing::warn!(domain = %o.domain, error = %e, "ignoring domain override");
                continue;
            }
            let mut rule = self.resolve(&o.domain.to_ascii_lowercase()).await?;
            if let Some(delay) = o.crawl_delay_secs {
                rule.crawl_delay_secs = delay;
            }
            if let Some(depth) = o.max_depth {
                rule.max_depth = depth;
            }
            if let Some(boost) = o.priority_boost {
                rule.priority_boost = boost;
            }
            rule.allowed_paths = o.allowed_paths.clone();
            rule.blocked_paths = o.blocked_paths.clone();
            rule.content_filters = o.content_filters.clone();
            self.save(&rule).await?;
            applied += 1;
        }
        Ok(applied)
    }

    pub fn respects_robots(&self) -> bool {
        self.respect_robots
    }

    /// Whether robots data for this rule has not been requested yet.
    pub fn needs_robots(&self, rule: &DomainRule) -> bool {
        self.respect_robots && rule.robots_fetched_at.is_none()
    }

    /// Snapshot the outcome of a robots.txt fetch.
    ///
    /// `Some(body)` is a usable file (an empty body allows everything);
    /// `None` means robots data was unreachable. A `Crawl-delay` directive
    /// only ever raises the stored delay.
    pub async fn record_robots(&self, domain: &str, body: Option<String>) -> Result<DomainRule> {
        let mut rule = self.resolve(domain).await?;
        rule.robots_fetched_at = Some(Utc::now());
        if let Some(ref content) = body {
            let robots = RobotsTxt::parse(content);
            if let Some(delay) = robots.crawl_delay(&self.user_agent) {
                if delay > rule.crawl_delay_secs {
                    tracing::info!(domain, delay, "robots crawl-delay raises domain delay");
                    rule.crawl_delay_secs = delay;
                }
            }
        }
        rule.robots_txt = body;
        self.save(&rule).await?;
        Ok(rule)
    }

    /// Admission decision with a reason on rejection.
    pub fn check(&self, url: &str, rule: &DomainRule) -> Result<(), CrawlError> {
        let reject = |reason: &str| CrawlError::PolicyRejection {
            url: url.to_string(),
            reason: reason.to_string(),
        };

        let Some((_, path)) = split_url(url) else {
            return Err(reject("unparseable url"));
        };

        let compiled = match self.cached(&rule.domain) {
            Some(c) => c,
            None => self.remember(rule.clone()),
        };

        if let Some(ref blocked) = compiled.blocked {
            if blocked.is_match(&path) {
                return Err(reject("blocked path"));
            }
        }
        if let Some(ref allowed) = compiled.allowed {
            if !allowed.is_match(&path) {
                return Err(reject("path not in allow list"));
            }
        }

        if self.respect_robots {
            match compiled.robots {
                Some(ref robots) => {
                    if !robots.is_path_allowed(&path, &self.user_agent) {
                        return Err(reject("disallowed by robots.txt"));
                    }
                }
                None => {
                    if self.robots_policy == RobotsPolicy::FailClosed {
                        return Err(reject("robots data unavailable"));
                    }
                }
            }
        }

        Ok(())
    }

    pub fn is_allowed(&self, url: &str, rule: &DomainRule) -> bool {
        self.check(url, rule).is_ok()
    }
}

fn validate_override(o: &DomainOverride) -> Result<(), CrawlError> {
    if o.domain.trim().is_empty() {
        return Err(CrawlError::Configuration("empty domain".to_string()));
    }
    if matches!(o.crawl_delay_secs, Some(d) if d < 0.0 || !d.is_finite()) {
        return Err(CrawlError::Configuration("crawl_delay_secs must be >= 0".to_string()));
    }
    if matches!(o.max_depth, Some(d) if d < 0) {
        return Err(CrawlError::Configuration("max_depth must be >= 0".to_string()));
    }
    if matches!(o.priority_boost, Some(b) if b <= 0.0 || !b.is_finite()) {
        return Err(CrawlError::Configuration("priority_boost must be > 0".to_string()));
    }
    PathMatcher::compile(&o.allowed_paths)?;
    PathMatcher::compile(&o.blocked_paths)?;
    Ok(())
}
