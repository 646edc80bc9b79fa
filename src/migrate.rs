use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

/// Create every table and index on an open pool. Idempotent.
pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Pages, keyed by URL
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS pages (
            url TEXT PRIMARY KEY,
            title TEXT,
            text TEXT NOT NULL DEFAULT '',
            raw_html TEXT,
            content_type TEXT,
            status_code INTEGER NOT NULL,
            latency_ms INTEGER NOT NULL DEFAULT 0,
            depth INTEGER NOT NULL CHECK (depth >= 0),
            parent_url TEXT,
            domain TEXT NOT NULL,
            path TEXT NOT NULL,
            metadata_json TEXT NOT NULL DEFAULT '{}',
            first_crawled_at INTEGER NOT NULL,
            last_crawled_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Learning bits, keyed by normalized content hash
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_bits (
            content_hash TEXT PRIMARY KEY,
            page_url TEXT NOT NULL,
            content_type TEXT NOT NULL,
            category TEXT NOT NULL,
            subcategory TEXT,
            body TEXT NOT NULL,
            context TEXT NOT NULL DEFAULT '',
            importance REAL NOT NULL CHECK (importance >= 0.0 AND importance <= 1.0),
            confidence REAL NOT NULL CHECK (confidence >= 0.0 AND confidence <= 1.0),
            source_url TEXT NOT NULL,
            reference_count INTEGER NOT NULL DEFAULT 1,
            cross_references_json TEXT NOT NULL DEFAULT '[]',
            tags_json TEXT NOT NULL DEFAULT '[]',
            language TEXT NOT NULL DEFAULT 'en',
            created_at INTEGER NOT NULL,
            last_referenced_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Every page a bit was derived from
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS learning_bit_sources (
            bit_hash TEXT NOT NULL,
            page_url TEXT NOT NULL,
            first_seen_at INTEGER NOT NULL,
            PRIMARY KEY (bit_hash, page_url),
            FOREIGN KEY (bit_hash) REFERENCES learning_bits(content_hash)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS relationships (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            source_hash TEXT NOT NULL,
            target_hash TEXT NOT NULL,
            relationship_type TEXT NOT NULL,
            strength REAL NOT NULL CHECK (strength >= 0.0 AND strength <= 1.0),
            bidirectional INTEGER NOT NULL DEFAULT 0,
            created_at INTEGER NOT NULL,
            CHECK (source_hash <> target_hash),
            UNIQUE(source_hash, target_hash, relationship_type)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS frontier (
            url TEXT PRIMARY KEY,
            priority INTEGER NOT NULL CHECK (priority >= 1 AND priority <= 10),
            status TEXT NOT NULL DEFAULT 'pending',
            discovered_from TEXT,
            depth INTEGER NOT NULL CHECK (depth >= 0),
            domain TEXT NOT NULL,
            estimated_importance REAL NOT NULL DEFAULT 0.0,
            last_attempt_at INTEGER,
            retry_count INTEGER NOT NULL DEFAULT 0,
            retry_ceiling INTEGER NOT NULL,
            robots_allowed INTEGER NOT NULL DEFAULT 1,
            last_error TEXT,
            last_status_code INTEGER,
            discovered_at INTEGER NOT NULL,
            CHECK (retry_count <= retry_ceiling)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS domain_rules (
            domain TEXT PRIMARY KEY,
            robots_txt TEXT,
            robots_fetched_at INTEGER,
            crawl_delay_secs REAL NOT NULL DEFAULT 1.0 CHECK (crawl_delay_secs >= 0.0),
            max_depth INTEGER NOT NULL DEFAULT 3 CHECK (max_depth >= 0),
            allowed_paths_json TEXT NOT NULL DEFAULT '[]',
            blocked_paths_json TEXT NOT NULL DEFAULT '[]',
            content_filters_json TEXT NOT NULL DEFAULT '[]',
            priority_boost REAL NOT NULL DEFAULT 1.0,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sessions (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            started_at INTEGER NOT NULL,
            ended_at INTEGER,
            status TEXT NOT NULL,
            discovered INTEGER NOT NULL DEFAULT 0,
            crawled INTEGER NOT NULL DEFAULT 0,
            extracted INTEGER NOT NULL DEFAULT 0,
            relationships INTEGER NOT NULL DEFAULT 0,
            errors INTEGER NOT NULL DEFAULT 0,
            config_json TEXT NOT NULL DEFAULT '{}'
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS categorization_rules (
            name TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            category TEXT,
            priority INTEGER NOT NULL DEFAULT 0,
            enabled INTEGER NOT NULL DEFAULT 1,
            spec_json TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // Secondary indexes
    for ddl in [
        "CREATE INDEX IF NOT EXISTS idx_pages_domain ON pages(domain)",
        "CREATE INDEX IF NOT EXISTS idx_bits_category ON learning_bits(category, subcategory)",
        "CREATE INDEX IF NOT EXISTS idx_bits_importance ON learning_bits(importance DESC)",
        "CREATE INDEX IF NOT EXISTS idx_bit_sources_page ON learning_bit_sources(page_url)",
        "CREATE INDEX IF NOT EXISTS idx_relationships_target ON relationships(target_hash)",
        "CREATE INDEX IF NOT EXISTS idx_frontier_status_priority ON frontier(status, priority)",
        "CREATE INDEX IF NOT EXISTS idx_frontier_domain ON frontier(domain)",
        "CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status)",
        "CREATE INDEX IF NOT EXISTS idx_rules_priority ON categorization_rules(priority DESC)",
    ] {
        sqlx::query(ddl).execute(pool).await?;
    }

    Ok(())
}
