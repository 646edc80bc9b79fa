//! Crawl session lifecycle and counters.
//!
//! Components report progress through [`SessionHandle::tick`], a lock-free
//! atomic increment that never blocks or fails. Counters reach the
//! `sessions` table on [`SessionTracker::flush`], which only ever raises
//! stored values, so persisted counters are monotonically non-decreasing.
//!
//! Status transitions are guarded:
//!
//! ```text
//! running ⇄ paused
//! running | paused → completed | stopped   (sets ended_at)
//! ```

use anyhow::{bail, Context, Result};
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use uuid::Uuid;

use crate::db::{from_millis, to_millis};
use crate::models::{CrawlSession, SessionCounters, SessionStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    Discovered,
    Crawled,
    Extracted,
    Relationship,
    Error,
}

#[derive(Debug, Default)]
struct Counters {
    discovered: AtomicU64,
    crawled: AtomicU64,
    extracted: AtomicU64,
    relationships: AtomicU64,
    errors: AtomicU64,
}

/// Cheap, cloneable reference to a running session's counters.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    id: String,
    counters: Arc<Counters>,
}

impl SessionHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tick(&self, event: SessionEvent) {
        self.tick_by(event, 1);
    }

    pub fn tick_by(&self, event: SessionEvent, n: u64) {
        let counter = match event {
            SessionEvent::Discovered => &self.counters.discovered,
            SessionEvent::Crawled => &self.counters.crawled,
            SessionEvent::Extracted => &self.counters.extracted,
            SessionEvent::Relationship => &self.counters.relationships,
            SessionEvent::Error => &self.counters.errors,
        };
        counter.fetch_add(n, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> SessionCounters {
        SessionCounters {
            discovered: self.counters.discovered.load(Ordering::Relaxed),
            crawled: self.counters.crawled.load(Ordering::Relaxed),
            extracted: self.counters.extracted.load(Ordering::Relaxed),
            relationships: self.counters.relationships.load(Ordering::Relaxed),
            errors: self.counters.errors.load(Ordering::Relaxed),
        }
    }
}

fn transition_allowed(from: SessionStatus, to: SessionStatus) -> bool {
    use SessionStatus as S;
    matches!(
        (from, to),
        (S::Running, S::Paused)
            | (S::Paused, S::Running)
            | (S::Running | S::Paused, S::Completed | S::Stopped)
    )
}

#[derive(Clone)]
pub struct SessionTracker {
    pool: SqlitePool,
}

impl SessionTracker {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create a running session with zeroed counters.
    pub async fn start(&self, name: &str, config: serde_json::Value) -> Result<SessionHandle> {
        let id = Uuid::new_v4().to_string();
        sqlx::query(
            r#"
            INSERT INTO sessions (id, name, started_at, status, config_json)
            VALUES (?, ?, ?, 'running', ?)
            "#,
        )
        .bind(&id)
        .bind(name)
        .bind(to_millis(Utc::now()))
        .bind(config.to_string())
        .execute(&self.pool)
        .await?;

        tracing::info!(session = %id, name, "session started");
        Ok(SessionHandle {
            id,
            counters: Arc::new(Counters::default()),
        })
    }

    /// Persist in-memory counters. Stored counters never decrease.
    pub async fn flush(&self, handle: &SessionHandle) -> Result<()> {
        let c = handle.snapshot();
        sqlx::query(
            r#"
            UPDATE sessions SET
                discovered = MAX(discovered, ?),
                crawled = MAX(crawled, ?),
                extracted = MAX(extracted, ?),
                relationships = MAX(relationships, ?),
                errors = MAX(errors, ?)
            WHERE id = ?
            "#,
        )
        .bind(c.discovered as i64)
        .bind(c.crawled as i64)
        .bind(c.extracted as i64)
        .bind(c.relationships as i64)
        .bind(c.errors as i64)
        .bind(&handle.id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn pause(&self, id: &str) -> Result<CrawlSession> {
        self.set_status(id, SessionStatus::Paused).await
    }

    pub async fn resume(&self, id: &str) -> Result<CrawlSession> {
        self.set_status(id, SessionStatus::Running).await
    }

    /// Flush counters and move to a final status.
    pub async fn finish(&self, handle: &SessionHandle, status: SessionStatus) -> Result<CrawlSession> {
        if !status.is_finished() {
            bail!("'{}' is not a final session status", status);
        }
        self.flush(handle).await?;
        self.set_status(&handle.id, status).await
    }

    /// Apply a guarded status change. Finishing a session stamps `ended_at`.
    pub async fn set_status(&self, id: &str, status: SessionStatus) -> Result<CrawlSession> {
        let current = self
            .get(id)
            .await?
            .with_context(|| format!("session not found: {}", id))?;
        if current.status == status {
            return Ok(current);
        }
        if !transition_allowed(current.status, status) {
            bail!(
                "session {} cannot move from {} to {}",
                id,
                current.status,
                status
            );
        }

        let ended_at = status.is_finished().then(|| to_millis(Utc::now()));
        let result = sqlx::query("UPDATE sessions SET status = ?, ended_at = ? WHERE id = ? AND status = ?")
            .bind(status.as_str())
            .bind(ended_at)
            .bind(id)
            .bind(current.status.as_str())
            .execute(&self.pool)
            .await?;
        if result.rows_affected() != 1 {
            bail!("session {} changed status concurrently", id);
        }

        tracing::info!(session = id, from = %current.status, to = %status, "session status changed");
        self.get(id)
            .await?
            .with_context(|| format!("session not found: {}", id))
    }

    pub async fn get(&self, id: &str) -> Result<Option<CrawlSession>> {
        let row = sqlx::query("SELECT * FROM sessions WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;
        row.as_ref().map(session_from_row).transpose()
    }

    /// Most recent sessions first.
    pub async fn list(&self, limit: i64) -> Result<Vec<CrawlSession>> {
        let rows = sqlx::query("SELECT * FROM sessions ORDER BY started_at DESC, rowid DESC LIMIT ?")
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(session_from_row).collect()
    }
}

fn session_from_row(row: &SqliteRow) -> Result<CrawlSession> {
    let status: String = row.get("status");
    let config: String = row.get("config_json");
    let count = |col: &str| row.get::<i64, _>(col).max(0) as u64;
    Ok(CrawlSession {
        id: row.get("id"),
        name: row.get("name"),
        started_at: from_millis(row.get("started_at")),
        ended_at: row.get::<Option<i64>, _>("ended_at").map(from_millis),
        status: status.parse()?,
        counters: SessionCounters {
            discovered: count("discovered"),
            crawled: count("crawled"),
            extracted: count("extracted"),
            relationships: count("relationships"),
            errors: count("errors"),
        },
        config: serde_json::from_str(&config).unwrap_or(serde_json::Value::Null),
    })
}
