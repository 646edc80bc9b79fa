//! Learning bit store and content-hash deduplication.
//!
//! The store exclusively owns bit identity. A bit's key is the SHA-256 of
//! its normalized body (whitespace collapsed, lowercased), so a given
//! content string is stored at most once no matter how many pages or
//! sessions re-derive it. The check-and-insert is one `INSERT … ON CONFLICT
//! DO UPDATE … RETURNING` statement; concurrent ingestion of the same text
//! converges on a single row with the reference count equal to the number
//! of ingestions.
//!
//! Stored bits are immutable apart from `reference_count`,
//! `last_referenced_at` and the cross-reference list.

use anyhow::Result;
use chrono::Utc;
use sha2::{Digest, Sha256};
use sqlx::sqlite::SqliteRow;
use sqlx::{QueryBuilder, Row, Sqlite, SqlitePool};
use std::collections::BTreeSet;

use crate::db::{from_millis, to_millis};
use crate::models::{BitFilters, CandidateBit, LearningBit};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Created { content_hash: String },
    Duplicate { content_hash: String, reference_count: i64 },
}

impl IngestOutcome {
    pub fn content_hash(&self) -> &str {
        match self {
            Self::Created { content_hash } | Self::Duplicate { content_hash, .. } => content_hash,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, Self::Created { .. })
    }
}

const BIT_COLUMNS: &str = "content_hash, page_url, content_type, category, subcategory, body, \
    context, importance, confidence, source_url, reference_count, cross_references_json, \
    tags_json, language, created_at, last_referenced_at";

/// Canonical form used for hashing: whitespace runs collapsed, lowercase.
pub fn normalize(body: &str) -> String {
    body.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub fn content_hash(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(normalize(body).as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Clone)]
pub struct LearningBitStore {
    pool: SqlitePool,
}

impl LearningBitStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Store a candidate, or count a repeat of content already stored.
    pub async fn ingest(&self, candidate: &CandidateBit, page_url: &str) -> Result<IngestOutcome> {
        let hash = content_hash(&candidate.body);
        let now = to_millis(Utc::now());
        let tags: Vec<&String> = candidate.tags.iter().collect();

        let mut tx = self.pool.begin().await?;

        let reference_count: i64 = sqlx::query_scalar(&format!(
            r#"
            INSERT INTO learning_bits ({})
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, 1, '[]', ?, ?, ?, ?)
            ON CONFLICT(content_hash) DO UPDATE SET
                reference_count = reference_count + 1,
                last_referenced_at = excluded.last_referenced_at
            RETURNING reference_count
            "#,
            BIT_COLUMNS
        ))
        .bind(&hash)
        .bind(page_url)
        .bind(candidate.content_type.as_str())
        .bind(&candidate.category)
        .bind(&candidate.subcategory)
        .bind(&candidate.body)
        .bind(&candidate.context)
        .bind(candidate.importance.clamp(0.0, 1.0))
        .bind(candidate.confidence.clamp(0.0, 1.0))
        .bind(page_url)
        .bind(serde_json::to_string(&tags)?)
        .bind(&candidate.language)
        .bind(now)
        .bind(now)
        .fetch_one(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            INSERT INTO learning_bit_sources (bit_hash, page_url, first_seen_at)
            VALUES (?, ?, ?)
            ON CONFLICT(bit_hash, page_url) DO NOTHING
            "#,
        )
        .bind(&hash)
        .bind(page_url)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if reference_count == 1 {
            tracing::debug!(hash = %hash, page = page_url, "learning bit created");
            Ok(IngestOutcome::Created { content_hash: hash })
        } else {
            tracing::debug!(hash = %hash, page = page_url, reference_count, "duplicate learning bit");
            Ok(IngestOutcome::Duplicate {
                content_hash: hash,
                reference_count,
            })
        }
    }

    pub async fn get(&self, content_hash: &str) -> Result<Option<LearningBit>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM learning_bits WHERE content_hash = ?",
            BIT_COLUMNS
        ))
        .bind(content_hash)
        .fetch_optional(&self.pool)
        .await?;
        row.as_ref().map(bit_from_row).transpose()
    }

    /// Bits matching every set filter, most important first.
    pub async fn query(&self, filters: &BitFilters) -> Result<Vec<LearningBit>> {
        let mut qb: QueryBuilder<Sqlite> = QueryBuilder::new(format!(
            "SELECT {} FROM learning_bits WHERE 1 = 1",
            BIT_COLUMNS
        ));
        if let Some(ref category) = filters.category {
            qb.push(" AND category = ").push_bind(category.clone());
        }
        if let Some(ref subcategory) = filters.subcategory {
            qb.push(" AND subcategory = ").push_bind(subcategory.clone());
        }
        if let Some(content_type) = filters.content_type {
            qb.push(" AND content_type = ").push_bind(content_type.as_str());
        }
        if let Some(min) = filters.min_importance {
            qb.push(" AND importance >= ").push_bind(min);
        }
        qb.push(" ORDER BY importance DESC, created_at ASC, content_hash ASC");
        if let Some(limit) = filters.limit {
            qb.push(" LIMIT ").push_bind(limit);
        }

        let rows = qb.build().fetch_all(&self.pool).await?;
        rows.iter().map(bit_from_row).collect()
    }

    /// Every page the bit has been derived from, in first-seen order.
    pub async fn sources_for(&self, content_hash: &str) -> Result<Vec<String>> {
        let urls = sqlx::query_scalar(
            "SELECT page_url FROM learning_bit_sources WHERE bit_hash = ? ORDER BY first_seen_at ASC, page_url ASC",
        )
        .bind(content_hash)
        .fetch_all(&self.pool)
        .await?;
        Ok(urls)
    }

    /// Append `other` to the bit's cross-reference list if not already present.
    pub async fn add_cross_reference(&self, content_hash: &str, other: &str) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE learning_bits
            SET cross_references_json = json_insert(cross_references_json, '$[#]', ?)
            WHERE content_hash = ?
              AND NOT EXISTS (SELECT 1 FROM json_each(cross_references_json) WHERE value = ?)
            "#,
        )
        .bind(other)
        .bind(content_hash)
        .bind(other)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    pub async fn count(&self) -> Result<i64> {
        let n = sqlx::query_scalar("SELECT COUNT(*) FROM learning_bits")
            .fetch_one(&self.pool)
            .await?;
        Ok(n)
    }
}

pub(crate) fn bit_from_row(row: &SqliteRow) -> Result<LearningBit> {
    let content_type: String = row.get("content_type");
    let cross_refs: String = row.get("cross_references_json");
    let tags: String = row.get("tags_json");
    Ok(LearningBit {
        content_hash: row.get("content_hash"),
        page_url: row.get("page_url"),
        content_type: content_type.parse()?,
        category: row.get("category"),
        subcategory: row.get("subcategory"),
        body: row.get("body"),
        context: row.get("context"),
        importance: row.get("importance"),
        confidence: row.get("confidence"),
        source_url: row.get("source_url"),
        reference_count: row.get("reference_count"),
        cross_references: serde_json::from_str(&cross_refs)?,
        tags: serde_json::from_str::<BTreeSet<String>>(&tags)?,
        language: row.get("language"),
        created_at: from_millis(row.get("created_at")),
        last_referenced_at: from_millis(row.get("last_referenced_at")),
    })
}
