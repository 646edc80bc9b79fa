//! Persistent URL frontier.
//!
//! The frontier exclusively owns [`FrontierEntry`] lifecycle. Admission goes
//! through [`Frontier::enqueue`] (duplicate, depth and domain-policy checks);
//! dispatch goes through [`Frontier::dequeue_next`], the single critical
//! section in which an entry moves `pending → in_progress` and the domain's
//! last-dispatch instant is recorded. No two workers can receive the same
//! URL, or the same domain inside its crawl-delay window.
//!
//! Selection order is lowest numeric priority first, then discovery order.

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{Mutex, Notify};
use url::Url;

use crate::config::{CrawlerConfig, PriorityScoring};
use crate::db::{from_millis, to_millis};
use crate::domain_policy::DomainPolicyStore;
use crate::error::CrawlError;
use crate::models::{
    DomainRule, FrontierEntry, FrontierEvent, FrontierStatus, BASE_PRIORITY, MAX_PRIORITY,
    MIN_PRIORITY,
};
use crate::url_utils::{domain_of, normalize_url};

/// Result of an admission attempt. Only `Enqueued` creates an entry.
#[derive(Debug, Clone, PartialEq)]
pub enum EnqueueOutcome {
    Enqueued { priority: i64 },
    Duplicate,
    TooDeep,
    Rejected(String),
}

impl EnqueueOutcome {
    pub fn is_enqueued(&self) -> bool {
        matches!(self, Self::Enqueued { .. })
    }
}

/// Entry counts per status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FrontierCounts {
    pub pending: i64,
    pub in_progress: i64,
    pub completed: i64,
    pub failed: i64,
    pub skipped: i64,
}

const ENTRY_COLUMNS: &str = "url, priority, status, discovered_from, depth, domain, \
    estimated_importance, last_attempt_at, retry_count, retry_ceiling, robots_allowed, \
    last_error, last_status_code";

/// When a domain was last contacted and how long it must then rest.
#[derive(Debug, Clone, Copy)]
struct DomainPacing {
    at: Instant,
    delay: Duration,
}

impl DomainPacing {
    fn remaining(&self, now: Instant) -> Option<Duration> {
        let elapsed = now.duration_since(self.at);
        (elapsed < self.delay).then(|| self.delay - elapsed)
    }
}

pub struct Frontier {
    pool: SqlitePool,
    policy: Arc<DomainPolicyStore>,
    retry_ceiling: i64,
    retry_penalty: i64,
    scoring: PriorityScoring,
    high_value_keywords: Vec<String>,
    /// Pacing state per domain. Holding this lock is the dequeue critical section.
    last_dispatch: Mutex<HashMap<String, DomainPacing>>,
    work_available: Notify,
}

impl Frontier {
    pub fn new(pool: SqlitePool, policy: Arc<DomainPolicyStore>, crawler: &CrawlerConfig) -> Self {
        Self {
            pool,
            policy,
            retry_ceiling: crawler.retry_ceiling,
            retry_penalty: crawler.retry_priority_penalty,
            scoring: crawler.priority_scoring,
            high_value_keywords: crawler
                .high_value_keywords
                .iter()
                .map(|k| k.to_lowercase())
                .collect(),
            last_dispatch: Mutex::new(HashMap::new()),
            work_available: Notify::new(),
        }
    }

    pub fn policy(&self) -> &Arc<DomainPolicyStore> {
        &self.policy
    }

    /// Admit a discovered URL.
    pub async fn enqueue(
        &self,
        url: &str,
        discovered_from: Option<&str>,
        depth: i64,
        rule: &DomainRule,
    ) -> Result<EnqueueOutcome> {
        self.admit(url, discovered_from, depth, rule, None).await
    }

    /// Admit a session seed at depth 0 with an explicit priority.
    pub async fn enqueue_seed(&self, url: &str, priority: i64) -> Result<EnqueueOutcome> {
        let Some(parsed) = normalize_url(url) else {
            return Ok(EnqueueOutcome::Rejected("unparseable url".to_string()));
        };
        let Some(domain) = domain_of(&parsed) else {
            return Ok(EnqueueOutcome::Rejected("url has no host".to_string()));
        };
        let rule = self.policy.resolve(&domain).await?;
        self.admit(parsed.as_str(), None, 0, &rule, Some(priority))
            .await
    }

    async fn admit(
        &self,
        url: &str,
        discovered_from: Option<&str>,
        depth: i64,
        rule: &DomainRule,
        priority_override: Option<i64>,
    ) -> Result<EnqueueOutcome> {
        let Some(parsed) = normalize_url(url) else {
            return Ok(EnqueueOutcome::Rejected("unparseable url".to_string()));
        };
        let Some(domain) = domain_of(&parsed) else {
            return Ok(EnqueueOutcome::Rejected("url has no host".to_string()));
        };
        if domain != rule.domain {
            return Ok(EnqueueOutcome::Rejected(format!(
                "rule for {} does not cover {}",
                rule.domain, domain
            )));
        }

        if depth < 0 || depth > rule.max_depth {
            tracing::debug!(url = %parsed, depth, max_depth = rule.max_depth, "skipped: too deep");
            return Ok(EnqueueOutcome::TooDeep);
        }

        if let Err(e) = self.policy.check(parsed.as_str(), rule) {
            tracing::info!(url = %parsed, error = %e, "skipped");
            return Ok(EnqueueOutcome::Rejected(e.to_string()));
        }

        let importance = estimate_importance(&parsed, &self.high_value_keywords);
        let priority = priority_override
            .map(|p| p.clamp(MIN_PRIORITY, MAX_PRIORITY))
            .unwrap_or_else(|| score_priority(importance, rule.priority_boost, self.scoring));

        let result = sqlx::query(
            r#"
            INSERT INTO frontier (url, priority, status, discovered_from, depth, domain,
                estimated_importance, retry_count, retry_ceiling, robots_allowed, discovered_at)
            VALUES (?, ?, 'pending', ?, ?, ?, ?, 0, ?, 1, ?)
            ON CONFLICT(url) DO NOTHING
            "#,
        )
        .bind(parsed.as_str())
        .bind(priority)
        .bind(discovered_from)
        .bind(depth)
        .bind(&domain)
        .bind(importance)
        .bind(self.retry_ceiling)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Ok(EnqueueOutcome::Duplicate);
        }

        tracing::debug!(url = %parsed, depth, priority, "enqueued");
        self.work_available.notify_waiters();
        Ok(EnqueueOutcome::Enqueued { priority })
    }

    /// Take the best pending entry whose domain is outside its delay window.
    pub async fn dequeue_next(&self) -> Result<Option<FrontierEntry>> {
        let mut last_dispatch = self.last_dispatch.lock().await;

        let now = Instant::now();
        let paced: Vec<String> = last_dispatch
            .iter()
            .filter(|(_, pacing)| pacing.remaining(now).is_some())
            .map(|(domain, _)| domain.clone())
            .collect();

        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM frontier WHERE status = 'pending'",
            ENTRY_COLUMNS
        ));
        if !paced.is_empty() {
            qb.push(" AND domain NOT IN (");
            let mut separated = qb.separated(", ");
            for domain in &paced {
                separated.push_bind(domain.clone());
            }
            separated.push_unseparated(")");
        }
        qb.push(" ORDER BY priority ASC, rowid ASC LIMIT 1");

        let Some(row) = qb.build().fetch_optional(&self.pool).await? else {
            return Ok(None);
        };
        let mut entry = entry_from_row(&row)?;
        let delay = self.policy.resolve(&entry.domain).await?.crawl_delay();
        let next = entry
            .status
            .transition(FrontierEvent::Dispatch, entry.retry_count, entry.retry_ceiling)?;

        let stamp = Utc::now();
        let result = sqlx::query(
            "UPDATE frontier SET status = ?, last_attempt_at = ? WHERE url = ? AND status = 'pending'",
        )
        .bind(next.as_str())
        .bind(to_millis(stamp))
        .bind(&entry.url)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Ok(None);
        }

        // Recorded after the stamp so stamps are never closer than the delay.
        last_dispatch.insert(
            entry.domain.clone(),
            DomainPacing {
                at: Instant::now(),
                delay,
            },
        );
        entry.status = next;
        entry.last_attempt_at = Some(stamp);
        Ok(Some(entry))
    }

    /// Time until the earliest paced domain opens again, if any is paced.
    pub async fn next_ready_in(&self) -> Result<Option<Duration>> {
        let last_dispatch = self.last_dispatch.lock().await;
        let now = Instant::now();
        Ok(last_dispatch
            .values()
            .filter_map(|pacing| pacing.remaining(now))
            .min())
    }

    /// Claim a fetch slot for `domain` outside the frontier, such as a
    /// robots.txt request. Waits until the domain's delay window has passed,
    /// then records the contact so page dispatches keep their distance.
    pub async fn reserve_domain(&self, domain: &str, delay: Duration) {
        loop {
            let wait = {
                let mut last_dispatch = self.last_dispatch.lock().await;
                let now = Instant::now();
                match last_dispatch.get(domain).and_then(|p| p.remaining(now)) {
                    Some(remaining) => remaining,
                    None => {
                        last_dispatch.insert(domain.to_string(), DomainPacing { at: now, delay });
                        return;
                    }
                }
            };
            tokio::time::sleep(wait).await;
        }
    }

    /// Restart the domain's delay window once a fetch has returned, with
    /// the delay currently in force.
    pub async fn record_fetch_done(&self, domain: &str, delay: Duration) {
        let mut last_dispatch = self.last_dispatch.lock().await;
        let now = Instant::now();
        let pacing = last_dispatch
            .entry(domain.to_string())
            .or_insert(DomainPacing { at: now, delay });
        pacing.at = pacing.at.max(now);
        pacing.delay = delay;
        drop(last_dispatch);
        self.work_available.notify_waiters();
    }

    /// Wait until work may be available or `max_wait` elapses.
    pub async fn wait_for_work(&self, max_wait: Duration) {
        let _ = tokio::time::timeout(max_wait, self.work_available.notified()).await;
    }

    pub async fn mark_completed(&self, url: &str) -> Result<()> {
        self.apply_terminal(url, FrontierEvent::Complete, None).await
    }

    pub async fn mark_skipped(&self, url: &str, reason: &str) -> Result<()> {
        tracing::info!(url, reason, "skipped");
        self.apply_terminal(url, FrontierEvent::Skip, Some(reason)).await
    }

    async fn apply_terminal(
        &self,
        url: &str,
        event: FrontierEvent,
        note: Option<&str>,
    ) -> Result<()> {
        let entry = self.require(url).await?;
        let next = entry
            .status
            .transition(event, entry.retry_count, entry.retry_ceiling)?;
        let robots_allowed =
            !(event == FrontierEvent::Skip && note.is_some_and(|n| n.contains("robots")));
        let result = sqlx::query(
            r#"
            UPDATE frontier
            SET status = ?, last_error = COALESCE(?, last_error), robots_allowed = ?
            WHERE url = ? AND status = ?
            "#,
        )
        .bind(next.as_str())
        .bind(note)
        .bind(robots_allowed)
        .bind(url)
        .bind(entry.status.as_str())
        .execute(&self.pool)
        .await?;
        if result.rows_affected() != 1 {
            return Err(CrawlError::InvalidTransition {
                from: entry.status.as_str(),
                event: format!("{:?} (entry changed concurrently)", event),
            }
            .into());
        }
        self.work_available.notify_waiters();
        Ok(())
    }

    /// Record a failed attempt. Returns the resulting status: `Pending` while
    /// retries remain (with a priority penalty), `Failed` once exhausted.
    pub async fn mark_failed(&self, url: &str, error: &CrawlError) -> Result<FrontierStatus> {
        let entry = self.require(url).await?;
        let attempts = entry.retry_count + 1;
        let next = entry
            .status
            .transition(FrontierEvent::Fail, attempts, entry.retry_ceiling)?;
        let stored_count = attempts.min(entry.retry_ceiling);
        let priority = match next {
            FrontierStatus::Pending => (entry.priority + self.retry_penalty).min(MAX_PRIORITY),
            _ => entry.priority,
        };

        sqlx::query(
            r#"
            UPDATE frontier
            SET status = ?, retry_count = ?, priority = ?, last_error = ?, last_status_code = ?
            WHERE url = ? AND status = 'in_progress'
            "#,
        )
        .bind(next.as_str())
        .bind(stored_count)
        .bind(priority)
        .bind(error.to_string())
        .bind(error.status_code().map(i64::from))
        .bind(url)
        .execute(&self.pool)
        .await?;

        match next {
            FrontierStatus::Pending => tracing::warn!(
                url,
                retry_count = stored_count,
                error = %error,
                "fetch failed, will retry"
            ),
            _ => tracing::warn!(
                url,
                retry_count = stored_count,
                error = %error,
                "fetch failed permanently"
            ),
        }
        self.work_available.notify_waiters();
        Ok(next)
    }

    /// Return entries left in progress by an interrupted session to pending.
    ///
    /// Callers must ensure no worker of this process holds one of them.
    pub async fn recover_in_progress(&self) -> Result<u64> {
        let stale = self
            .entries_by_status(Some(FrontierStatus::InProgress), i64::MAX)
            .await?;
        let mut recovered = 0;
        for entry in stale {
            let next = entry.status.transition(
                FrontierEvent::Recover,
                entry.retry_count,
                entry.retry_ceiling,
            )?;
            let result = sqlx::query("UPDATE frontier SET status = ? WHERE url = ? AND status = ?")
                .bind(next.as_str())
                .bind(&entry.url)
                .bind(entry.status.as_str())
                .execute(&self.pool)
                .await?;
            recovered += result.rows_affected();
        }
        if recovered > 0 {
            tracing::info!(recovered, "returned in-progress entries to pending");
            self.work_available.notify_waiters();
        }
        Ok(recovered)
    }

    pub async fn get(&self, url: &str) -> Result<Option<FrontierEntry>> {
        let row = sqlx::query(&format!("SELECT {} FROM frontier WHERE url = ?", ENTRY_COLUMNS))
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(entry_from_row).transpose()
    }

    async fn require(&self, url: &str) -> Result<FrontierEntry> {
        self.get(url)
            .await?
            .with_context(|| format!("frontier entry not found: {}", url))
    }

    pub async fn entries_by_status(
        &self,
        status: Option<FrontierStatus>,
        limit: i64,
    ) -> Result<Vec<FrontierEntry>> {
        let rows = match status {
            Some(status) => {
                sqlx::query(&format!(
                    "SELECT {} FROM frontier WHERE status = ? ORDER BY priority ASC, rowid ASC LIMIT ?",
                    ENTRY_COLUMNS
                ))
                .bind(status.as_str())
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(&format!(
                    "SELECT {} FROM frontier ORDER BY priority ASC, rowid ASC LIMIT ?",
                    ENTRY_COLUMNS
                ))
                .bind(limit)
                .fetch_all(&self.pool)
                .await?
            }
        };
        rows.iter().map(entry_from_row).collect()
    }

    pub async fn counts(&self) -> Result<FrontierCounts> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM frontier GROUP BY status")
            .fetch_all(&self.pool)
            .await?;
        let mut counts = FrontierCounts::default();
        for row in rows {
            let status: String = row.get("status");
            let n: i64 = row.get("n");
            match status.parse::<FrontierStatus>()? {
                FrontierStatus::Pending => counts.pending = n,
                FrontierStatus::InProgress => counts.in_progress = n,
                FrontierStatus::Completed => counts.completed = n,
                FrontierStatus::Failed => counts.failed = n,
                FrontierStatus::Skipped => counts.skipped = n,
            }
        }
        Ok(counts)
    }
}

fn entry_from_row(row: &SqliteRow) -> Result<FrontierEntry> {
    let status: String = row.get("status");
    Ok(FrontierEntry {
        url: row.get("url"),
        priority: row.get("priority"),
        status: status.parse()?,
        discovered_from: row.get("discovered_from"),
        depth: row.get("depth"),
        domain: row.get("domain"),
        estimated_importance: row.get("estimated_importance"),
        last_attempt_at: row.get::<Option<i64>, _>("last_attempt_at").map(from_millis),
        retry_count: row.get("retry_count"),
        retry_ceiling: row.get("retry_ceiling"),
        robots_allowed: row.get("robots_allowed"),
        last_error: row.get("last_error"),
        last_status_code: row
            .get::<Option<i64>, _>("last_status_code")
            .and_then(|c| u16::try_from(c).ok()),
    })
}

/// Heuristic value of a URL in [0, 1]: shallow paths and high-value
/// keywords score higher, query strings slightly lower.
pub fn estimate_importance(url: &Url, high_value_keywords: &[String]) -> f64 {
    let segments = url
        .path_segments()
        .map(|s| s.filter(|seg| !seg.is_empty()).count())
        .unwrap_or(0);
    let path = url.path().to_lowercase();

    let mut score = 0.1 + 0.5 / (1.0 + segments as f64);
    if high_value_keywords.iter().any(|k| path.contains(k.as_str())) {
        score += 0.4;
    }
    if url.query().is_some() {
        score -= 0.1;
    }
    score.clamp(0.0, 1.0)
}

/// Map estimated importance and the domain boost onto the 1..=10 scale.
///
/// Additive: `5 - 4·importance - 2·(boost - 1)`.
/// Multiplicative: `5 · (1 - 0.6·importance) / boost`.
pub fn score_priority(importance: f64, boost: f64, scoring: PriorityScoring) -> i64 {
    let base = BASE_PRIORITY as f64;
    let boost = if boost.is_finite() && boost > 0.0 { boost } else { 1.0 };
    let raw = match scoring {
        PriorityScoring::Additive => base - 4.0 * importance - 2.0 * (boost - 1.0),
        PriorityScoring::Multiplicative => base * (1.0 - 0.6 * importance) / boost,
    };
    (raw.round() as i64).clamp(MIN_PRIORITY, MAX_PRIORITY)
}
