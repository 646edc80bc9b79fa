//! Relationship inference between learning bits.
//!
//! [`link_candidates`] is a pure function: given a newly created bit and the
//! existing bits that share its category or tags, it scores lexical overlap
//! and infers a relationship type. [`RelationshipBuilder`] gathers the
//! candidates from the store, persists the edges and records cross
//! references. Edges are additive: existing edges are never rewritten or
//! deleted, and a bidirectional edge is stored once.

use anyhow::Result;
use chrono::Utc;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;

use crate::bits::{bit_from_row, LearningBitStore};
use crate::config::RelationshipConfig;
use crate::db::to_millis;
use crate::models::{ContentType, LearningBit, Relationship, RelationshipType};

const STOPWORDS: &[&str] = &[
    "a", "an", "and", "are", "as", "at", "be", "by", "can", "for", "from", "has", "have", "in",
    "into", "is", "it", "its", "of", "on", "or", "that", "the", "this", "to", "was", "were",
    "will", "with", "you", "your",
];

const NEGATION_CUES: &[&str] = &["not", "never", "avoid", "instead", "unlike", "don't", "without"];

const CONTAINMENT_THRESHOLD: f64 = 0.8;

fn content_tokens(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !(c.is_alphanumeric() || c == '\''))
        .filter(|t| t.len() > 1 && !STOPWORDS.contains(t))
        .map(str::to_string)
        .collect()
}

fn has_negation(tokens: &HashSet<String>) -> bool {
    NEGATION_CUES.iter().any(|cue| tokens.contains(*cue))
}

fn is_explanatory(ct: ContentType) -> bool {
    matches!(ct, ContentType::Concept | ContentType::Definition)
}

/// Infer edges from `new_bit` to each related bit in `existing`.
///
/// Only bits sharing the category or at least one tag are considered; an
/// edge is emitted when the Jaccard overlap of content tokens reaches
/// `config.min_strength`.
pub fn link_candidates(
    new_bit: &LearningBit,
    existing: &[LearningBit],
    config: &RelationshipConfig,
) -> Vec<Relationship> {
    let new_tokens = content_tokens(&new_bit.body);
    if new_tokens.is_empty() {
        return Vec::new();
    }
    let new_negated = has_negation(&new_tokens);

    let mut edges = Vec::new();
    for other in existing {
        if other.content_hash == new_bit.content_hash {
            continue;
        }
        let shares_category = other.category == new_bit.category;
        let shares_tag = !other.tags.is_disjoint(&new_bit.tags);
        if !shares_category && !shares_tag {
            continue;
        }

        let other_tokens = content_tokens(&other.body);
        if other_tokens.is_empty() {
            continue;
        }
        let shared = new_tokens.intersection(&other_tokens).count() as f64;
        let union = new_tokens.union(&other_tokens).count() as f64;
        let strength = (shared / union).clamp(0.0, 1.0);
        if strength < config.min_strength {
            continue;
        }

        let same_subcategory =
            new_bit.subcategory.is_some() && new_bit.subcategory == other.subcategory;
        // Fraction of the existing bit's vocabulary the new bit repeats.
        let containment = shared / other_tokens.len() as f64;

        let (relationship_type, bidirectional) = if new_bit.content_type == ContentType::Example
            && is_explanatory(other.content_type)
            && same_subcategory
        {
            (RelationshipType::Implements, false)
        } else if new_bit.content_type == ContentType::Procedure
            && is_explanatory(other.content_type)
        {
            // The explanation comes first.
            (RelationshipType::Prerequisite, false)
        } else if new_negated != has_negation(&other_tokens) && shared >= 2.0 {
            (RelationshipType::Opposite, true)
        } else if containment >= CONTAINMENT_THRESHOLD && new_tokens.len() > other_tokens.len() {
            (RelationshipType::Extends, false)
        } else if new_bit.content_type == other.content_type
            && strength >= config.similar_threshold
        {
            (RelationshipType::Similar, true)
        } else {
            (RelationshipType::Related, true)
        };

        let (source_hash, target_hash) = if relationship_type == RelationshipType::Prerequisite {
            (other.content_hash.clone(), new_bit.content_hash.clone())
        } else {
            (new_bit.content_hash.clone(), other.content_hash.clone())
        };

        edges.push(Relationship {
            source_hash,
            target_hash,
            relationship_type,
            strength,
            bidirectional,
        });
    }
    edges
}

pub struct RelationshipBuilder {
    pool: SqlitePool,
    bits: LearningBitStore,
    config: RelationshipConfig,
}

impl RelationshipBuilder {
    pub fn new(pool: SqlitePool, bits: LearningBitStore, config: RelationshipConfig) -> Self {
        Self { pool, bits, config }
    }

    /// Link a newly created bit to existing bits. Returns the number of new
    /// edges stored.
    pub async fn link_new_bit(&self, content_hash: &str) -> Result<u64> {
        let Some(bit) = self.bits.get(content_hash).await? else {
            return Ok(0);
        };
        let candidates = self.candidates_for(&bit).await?;
        let edges = link_candidates(&bit, &candidates, &self.config);

        let mut stored = 0;
        for edge in &edges {
            if self.persist(edge).await? {
                stored += 1;
                self.bits
                    .add_cross_reference(&edge.source_hash, &edge.target_hash)
                    .await?;
                self.bits
                    .add_cross_reference(&edge.target_hash, &edge.source_hash)
                    .await?;
                tracing::debug!(
                    source = %edge.source_hash,
                    target = %edge.target_hash,
                    kind = %edge.relationship_type,
                    strength = edge.strength,
                    "relationship added"
                );
            }
        }
        Ok(stored)
    }

    /// Bits sharing the category or a tag, most recently referenced first.
    async fn candidates_for(&self, bit: &LearningBit) -> Result<Vec<LearningBit>> {
        let tags: Vec<&String> = bit.tags.iter().collect();
        let rows = sqlx::query(
            r#"
            SELECT b.* FROM learning_bits b
            WHERE b.content_hash <> ?
              AND (b.category = ?
                   OR EXISTS (
                       SELECT 1 FROM json_each(b.tags_json) t
                       WHERE t.value IN (SELECT value FROM json_each(?))
                   ))
            ORDER BY b.last_referenced_at DESC
            LIMIT ?
            "#,
        )
        .bind(&bit.content_hash)
        .bind(&bit.category)
        .bind(serde_json::to_string(&tags)?)
        .bind(self.config.max_candidates)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(bit_from_row).collect()
    }

    /// Insert unless the edge, or the stored form of a bidirectional
    /// inverse, already exists.
    async fn persist(&self, edge: &Relationship) -> Result<bool> {
        if edge.bidirectional {
            let inverse: Option<i64> = sqlx::query_scalar(
                r#"
                SELECT id FROM relationships
                WHERE source_hash = ? AND target_hash = ? AND relationship_type = ?
                "#,
            )
            .bind(&edge.target_hash)
            .bind(&edge.source_hash)
            .bind(edge.relationship_type.as_str())
            .fetch_optional(&self.pool)
            .await?;
            if inverse.is_some() {
                return Ok(false);
            }
        }

        let result = sqlx::query(
            r#"
            INSERT INTO relationships (source_hash, target_hash, relationship_type, strength,
                bidirectional, created_at)
            VALUES (?, ?, ?, ?, ?, ?)
            ON CONFLICT(source_hash, target_hash, relationship_type) DO NOTHING
            "#,
        )
        .bind(&edge.source_hash)
        .bind(&edge.target_hash)
        .bind(edge.relationship_type.as_str())
        .bind(edge.strength)
        .bind(edge.bidirectional)
        .bind(to_millis(Utc::now()))
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    /// Edges touching a bit, outgoing and incoming. Bidirectional edges are
    /// reported from the requested bit's side.
    pub async fn relationships_for(&self, content_hash: &str) -> Result<Vec<Relationship>> {
        let rows = sqlx::query(
            r#"
            SELECT source_hash, target_hash, relationship_type, strength, bidirectional
            FROM relationships
            WHERE source_hash = ? OR target_hash = ?
            ORDER BY strength DESC, id ASC
            "#,
        )
        .bind(content_hash)
        .bind(content_hash)
        .fetch_all(&self.pool)
        .await?;

        let mut edges = Vec::with_capacity(rows.len());
        for row in rows {
            let kind: String = row.get("relationship_type");
            let mut edge = Relationship {
                source_hash: row.get("source_hash"),
                target_hash: row.get("target_hash"),
                relationship_type: kind.parse()?,
                strength: row.get("strength"),
                bidirectional: row.get("bidirectional"),
            };
            if edge.bidirectional && edge.target_hash == content_hash {
                std::mem::swap(&mut edge.source_hash, &mut edge.target_hash);
            }
            edges.push(edge);
        }
        Ok(edges)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bits::content_hash;
    use crate::db::test_support::temp_pool;
    use crate::models::CandidateBit;
    use std::collections::BTreeSet;

    fn bit(body: &str, ct: ContentType, category: &str, sub: Option<&str>) -> LearningBit {
        LearningBit {
            content_hash: content_hash(body),
            page_url: "https://e.com/".to_string(),
            content_type: ct,
            category: category.to_string(),
            subcategory: sub.map(str::to_string),
            body: body.to_string(),
            context: String::new(),
            importance: 0.5,
            confidence: 0.5,
            source_url: "https://e.com/".to_string(),
            reference_count: 1,
            cross_references: Vec::new(),
            tags: BTreeSet::new(),
            language: "en".to_string(),
            created_at: Utc::now(),
            last_referenced_at: Utc::now(),
        }
    }

    fn config() -> RelationshipConfig {
        RelationshipConfig::default()
    }

    #[test]
    fn test_example_implements_definition() {
        let def = bit(
            "A future is a value that completes asynchronously.",
            ContentType::Definition,
            "programming",
            Some("concurrency"),
        );
        let ex = bit(
            "Example: await a future value that completes asynchronously.",
            ContentType::Example,
            "programming",
            Some("concurrency"),
        );
        let edges = link_candidates(&ex, &[def.clone()], &config());
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship_type, RelationshipType::Implements);
        assert_eq!(edges[0].source_hash, ex.content_hash);
        assert_eq!(edges[0].target_hash, def.content_hash);
        assert!(!edges[0].bidirectional);
    }

    #[test]
    fn test_symmetric_overlap_is_similar() {
        let a = bit("tokio runtime schedules tasks across worker threads", ContentType::Concept, "programming", None);
        let b = bit("tokio runtime schedules many tasks across worker threads", ContentType::Concept, "programming", None);
        let edges = link_candidates(&a, &[b], &config());
        assert_eq!(edges.len(), 1);
        assert_eq!(edges[0].relationship_type, RelationshipType::Similar);
        assert!(edges[0].bidirectional);
        assert!((0.0..=1.0).contains(&edges[0].strength));
    }

    #[test]
    fn test_unrelated_or_other_category_yields_nothing() {
        let a = bit("tokio runtime schedules tasks", ContentType::Concept, "programming", None);
        let b = bit("bake bread at high heat", ContentType::Concept, "programming", None);
        let c = bit("tokio runtime schedules tasks quickly", ContentType::Concept, "cooking", None);
        assert!(link_candidates(&a, &[b, c, a.clone()], &config()).is_empty());
    }

    #[test]
    fn test_procedure_depends_on_concept() {
        let concept = bit("cargo workspaces share one lockfile", ContentType::Concept, "programming", None);
        let steps = bit("- create cargo workspaces\n- share one lockfile", ContentType::Procedure, "programming", None);
        let edges = link_candidates(&steps, &[concept.clone()], &config());
        assert_eq!(edges[0].relationship_type, RelationshipType::Prerequisite);
        assert_eq!(edges[0].source_hash, concept.content_hash);
    }

    #[tokio::test]
    async fn test_builder_persists_once_and_records_cross_references() {
        let (_tmp, config, pool) = temp_pool().await;
        let bits = LearningBitStore::new(pool.clone());
        let builder = RelationshipBuilder::new(pool.clone(), bits.clone(), config.relationships.clone());

        let mk = |body: &str| CandidateBit {
            content_type: ContentType::Concept,
            category: "programming".to_string(),
            subcategory: None,
            body: body.to_string(),
            context: String::new(),
            importance: 0.5,
            confidence: 0.5,
            tags: BTreeSet::new(),
            language: "en".to_string(),
            position: 0,
        };
        let a = bits
            .ingest(&mk("tokio runtime schedules tasks across worker threads"), "https://e.com/a")
            .await
            .unwrap();
        let b = bits
            .ingest(&mk("tokio runtime schedules jobs across worker threads"), "https://e.com/b")
            .await
            .unwrap();

        assert_eq!(builder.link_new_bit(b.content_hash()).await.unwrap(), 1);
        // The inverse of the stored bidirectional edge is not stored again.
        assert_eq!(builder.link_new_bit(a.content_hash()).await.unwrap(), 0);

        let from_a = builder.relationships_for(a.content_hash()).await.unwrap();
        assert_eq!(from_a.len(), 1);
        assert_eq!(from_a[0].source_hash, a.content_hash());

        let stored_a = bits.get(a.content_hash()).await.unwrap().unwrap();
        assert_eq!(stored_a.cross_references, vec![b.content_hash().to_string()]);
    }
}
