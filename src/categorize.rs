//! Rule-driven categorization of page text into candidate learning bits.
//!
//! Rules are data ([`RuleSpec`]), not code branches: a tagged variant
//! (`keyword`, `pattern`, `structural`, `semantic`) plus the category,
//! subcategory, content type and boosts it contributes. One interpreter,
//! [`Categorizer::categorize`], evaluates every enabled rule against every
//! segment in descending rule priority.
//!
//! A rule may assign a topic (category/subcategory), a content type, or
//! both. The highest-priority matching rule with a category decides the
//! topic; the highest-priority matching rule with a content type decides
//! the kind. Segments no rule matches still become bits, classified as
//! `general` / `concept` with low confidence.

use anyhow::Result;
use chrono::Utc;
use regex::Regex;
use serde::{Deserialize, Serialize};
use sqlx::{Row, SqlitePool};
use std::cmp::Ordering;
use std::collections::{BTreeSet, HashSet};

use crate::config::CategorizerConfig;
use crate::db::to_millis;
use crate::error::CrawlError;
use crate::models::{CandidateBit, ContentType, Page};
use crate::segment::{segment_text, Segment};

pub const FALLBACK_CATEGORY: &str = "general";
const FALLBACK_CONFIDENCE: f64 = 0.2;
const MATCHED_BASE_CONFIDENCE: f64 = 0.35;
const CONTEXT_EXCERPT_CHARS: usize = 160;

/// Structural cues a rule can test for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StructuralMarker {
    CodeBlock,
    List,
    NumberedList,
    FollowsHeading,
    Question,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum MatcherSpec {
    Keyword { keywords: Vec<String> },
    Pattern { pattern: String },
    Structural { marker: StructuralMarker },
    /// Lexical stand-in for semantic matching: at least half of the hints
    /// must occur in the segment.
    Semantic { hints: Vec<String> },
}

impl MatcherSpec {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Keyword { .. } => "keyword",
            Self::Pattern { .. } => "pattern",
            Self::Structural { .. } => "structural",
            Self::Semantic { .. } => "semantic",
        }
    }
}

/// One categorization rule as configured and persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleSpec {
    pub name: String,
    #[serde(flatten)]
    pub matcher: MatcherSpec,
    #[serde(default)]
    pub category: Option<String>,
    #[serde(default)]
    pub subcategory: Option<String>,
    #[serde(default)]
    pub content_type: Option<ContentType>,
    #[serde(default = "default_confidence_boost")]
    pub confidence_boost: f64,
    #[serde(default)]
    pub importance_boost: f64,
    #[serde(default)]
    pub priority: i64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

fn default_confidence_boost() -> f64 {
    0.2
}
fn default_enabled() -> bool {
    true
}

#[derive(Debug)]
enum Matcher {
    Keyword(Vec<String>),
    Pattern(Regex),
    Structural(StructuralMarker),
    Semantic(Vec<String>),
}

#[derive(Debug)]
struct CompiledRule {
    spec: RuleSpec,
    matcher: Matcher,
}

impl CompiledRule {
    fn compile(spec: RuleSpec) -> Result<Self, CrawlError> {
        let bad = |msg: &str| CrawlError::Configuration(format!("rule '{}': {}", spec.name, msg));

        if spec.name.trim().is_empty() {
            return Err(CrawlError::Configuration("rule without a name".to_string()));
        }
        if spec.category.is_none() && spec.content_type.is_none() {
            return Err(bad("assigns neither a category nor a content type"));
        }
        if !(0.0..=1.0).contains(&spec.confidence_boost) {
            return Err(bad("confidence_boost must be in [0, 1]"));
        }
        if !(0.0..=1.0).contains(&spec.importance_boost) {
            return Err(bad("importance_boost must be in [0, 1]"));
        }

        let lowered = |terms: &[String]| -> Vec<String> {
            terms
                .iter()
                .map(|t| t.trim().to_lowercase())
                .filter(|t| !t.is_empty())
                .collect()
        };

        let matcher = match &spec.matcher {
            MatcherSpec::Keyword { keywords } => {
                let keywords = lowered(keywords);
                if keywords.is_empty() {
                    return Err(bad("no keywords"));
                }
                Matcher::Keyword(keywords)
            }
            MatcherSpec::Pattern { pattern } => Matcher::Pattern(
                Regex::new(pattern).map_err(|e| bad(&format!("invalid pattern: {}", e)))?,
            ),
            MatcherSpec::Structural { marker } => Matcher::Structural(*marker),
            MatcherSpec::Semantic { hints } => {
                let hints = lowered(hints);
                if hints.is_empty() {
                    return Err(bad("no hints"));
                }
                Matcher::Semantic(hints)
            }
        };

        Ok(Self { spec, matcher })
    }

    /// Matched terms (possibly empty) when the rule fires, `None` otherwise.
    fn evaluate(&self, segment: &Segment, lower: &str, tokens: &HashSet<String>) -> Option<Vec<String>> {
        match &self.matcher {
            Matcher::Keyword(keywords) => {
                let hits: Vec<String> = keywords
                    .iter()
                    .filter(|k| term_present(k, lower, tokens))
                    .cloned()
                    .collect();
                (!hits.is_empty()).then_some(hits)
            }
            Matcher::Pattern(regex) => regex.is_match(&segment.text).then(Vec::new),
            Matcher::Structural(marker) => {
                let hit = match marker {
                    StructuralMarker::CodeBlock => segment.has_code,
                    StructuralMarker::List => segment.is_list,
                    StructuralMarker::NumberedList => segment
                        .text
                        .lines()
                        .filter(|l| {
                            let digits = l.chars().take_while(|c| c.is_ascii_digit()).count();
                            digits > 0 && l[digits..].starts_with(". ")
                        })
                        .count()
                        >= 2,
                    StructuralMarker::FollowsHeading => segment.follows_heading,
                    StructuralMarker::Question => segment.text.trim_end().ends_with('?'),
                };
                hit.then(Vec::new)
            }
            Matcher::Semantic(hints) => {
                let hits: Vec<String> = hints
                    .iter()
                    .filter(|h| term_present(h, lower, tokens))
                    .cloned()
                    .collect();
                (hits.len() * 2 >= hints.len()).then_some(hits)
            }
        }
    }
}

/// Multi-word or punctuated terms match as substrings; single words must
/// match a whole token so `tip` does not fire on `multiple`.
fn term_present(term: &str, lower: &str, tokens: &HashSet<String>) -> bool {
    if term.chars().all(char::is_alphanumeric) {
        tokens.contains(term)
    } else {
        lower.contains(term)
    }
}

fn tokenize(lower: &str) -> HashSet<String> {
    lower
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| !t.is_empty())
        .map(str::to_string)
        .collect()
}

pub struct Categorizer {
    rules: Vec<CompiledRule>,
    min_segment_chars: usize,
    language: String,
}

impl Categorizer {
    /// Compile `rules`; invalid or disabled rules are logged and dropped.
    pub fn new(rules: Vec<RuleSpec>, config: &CategorizerConfig) -> Self {
        let mut compiled: Vec<CompiledRule> = rules
            .into_iter()
            .filter(|r| r.enabled)
            .filter_map(|spec| match CompiledRule::compile(spec) {
                Ok(rule) => Some(rule),
                Err(e) => {
                    tracing::warn!(error = %e, "ignoring categorization rule");
                    None
                }
            })
            .collect();
        compiled.sort_by(|a, b| {
            b.spec
                .priority
                .cmp(&a.spec.priority)
                .then_with(|| a.spec.name.cmp(&b.spec.name))
        });

        Self {
            rules: compiled,
            min_segment_chars: config.min_segment_chars,
            language: config.language.clone(),
        }
    }

    /// Categorizer over the rules persisted in `categorization_rules`.
    pub async fn from_store(pool: &SqlitePool, config: &CategorizerConfig) -> Result<Self> {
        Ok(Self::new(load_rules(pool).await?, config))
    }

    pub fn rule_count(&self) -> usize {
        self.rules.len()
    }

    /// Candidate bits for a page, by descending importance then text position.
    /// Pages without text yield nothing.
    pub fn categorize(&self, page: &Page) -> Vec<CandidateBit> {
        self.categorize_text(&page.text)
    }

    pub fn categorize_text(&self, text: &str) -> Vec<CandidateBit> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let segments: Vec<Segment> = segment_text(text)
            .into_iter()
            .filter(|s| s.text.chars().count() >= self.min_segment_chars)
            .collect();

        let mut bits: Vec<CandidateBit> = segments
            .iter()
            .enumerate()
            .map(|(i, seg)| {
                let previous = i.checked_sub(1).and_then(|p| segments.get(p));
                self.classify(seg, previous)
            })
            .collect();

        bits.sort_by(|a, b| {
            b.importance
                .partial_cmp(&a.importance)
                .unwrap_or(Ordering::Equal)
                .then(a.position.cmp(&b.position))
        });
        bits
    }

    fn classify(&self, segment: &Segment, previous: Option<&Segment>) -> CandidateBit {
        let lower = segment.text.to_lowercase();
        let tokens = tokenize(&lower);

        let mut topic: Option<&RuleSpec> = None;
        let mut kind: Option<ContentType> = None;
        let mut confidence = MATCHED_BASE_CONFIDENCE;
        let mut rule_importance = 0.0;
        let mut tags = BTreeSet::new();
        let mut matched_any = false;

        for rule in &self.rules {
            let Some(hits) = rule.evaluate(segment, &lower, &tokens) else {
                continue;
            };
            matched_any = true;
            if topic.is_none() && rule.spec.category.is_some() {
                topic = Some(&rule.spec);
            }
            if kind.is_none() {
                kind = rule.spec.content_type;
            }
            confidence += rule.spec.confidence_boost;
            rule_importance += rule.spec.importance_boost;
            tags.insert(rule.spec.name.clone());
            tags.extend(hits);
        }

        let (category, subcategory) = match topic {
            Some(spec) => (
                spec.category.clone().unwrap_or_else(|| FALLBACK_CATEGORY.to_string()),
                spec.subcategory.clone(),
            ),
            None => (FALLBACK_CATEGORY.to_string(), None),
        };
        let confidence = if matched_any {
            confidence.clamp(0.0, 1.0)
        } else {
            FALLBACK_CONFIDENCE
        };

        CandidateBit {
            content_type: kind.unwrap_or_else(|| infer_content_type(segment)),
            category,
            subcategory,
            body: segment.text.clone(),
            context: build_context(segment, previous),
            importance: structural_importance(segment, rule_importance),
            confidence,
            tags,
            language: self.language.clone(),
            position: segment.position,
        }
    }
}

fn infer_content_type(segment: &Segment) -> ContentType {
    if segment.has_code {
        ContentType::Example
    } else if segment.is_list {
        ContentType::Procedure
    } else {
        ContentType::Concept
    }
}

/// Length, heading and code markers plus rule boosts, clamped to [0, 1].
fn structural_importance(segment: &Segment, rule_boosts: f64) -> f64 {
    let chars = segment.text.chars().count() as f64;
    let mut score = 0.1 + (chars / 600.0).min(1.0) * 0.3;
    if segment.follows_heading {
        score += 0.15;
    }
    if segment.has_code {
        score += 0.15;
    }
    if segment.is_list {
        score += 0.05;
    }
    (score + rule_boosts).clamp(0.0, 1.0)
}

fn build_context(segment: &Segment, previous: Option<&Segment>) -> String {
    let mut parts = Vec::new();
    if let Some(ref heading) = segment.heading {
        parts.push(heading.clone());
    }
    if let Some(prev) = previous {
        let excerpt: String = prev.text.chars().take(CONTEXT_EXCERPT_CHARS).collect();
        parts.push(excerpt);
    }
    parts.join("\n")
}

fn keyword_rule(
    name: &str,
    keywords: &[&str],
    category: Option<(&str, Option<&str>)>,
    content_type: Option<ContentType>,
    priority: i64,
) -> RuleSpec {
    RuleSpec {
        name: name.to_string(),
        matcher: MatcherSpec::Keyword {
            keywords: keywords.iter().map(|k| k.to_string()).collect(),
        },
        category: category.map(|(c, _)| c.to_string()),
        subcategory: category.and_then(|(_, s)| s.map(str::to_string)),
        content_type,
        confidence_boost: 0.2,
        importance_boost: 0.05,
        priority,
        enabled: true,
    }
}

/// Default rule set seeded into a fresh database.
pub fn builtin_rules() -> Vec<RuleSpec> {
    let mut rules = vec![
        // Content-type rules
        keyword_rule(
            "warning-markers",
            &["warning", "caution", "danger", "never", "avoid", "deprecated", "do not", "don't"],
            None,
            Some(ContentType::Warning),
            60,
        ),
        RuleSpec {
            name: "definition-phrase".to_string(),
            matcher: MatcherSpec::Pattern {
                pattern: r"(?i)^[^.\n]{1,80}?\b(is an?|refers to|is defined as|means)\b"
                    .to_string(),
            },
            category: None,
            subcategory: None,
            content_type: Some(ContentType::Definition),
            confidence_boost: 0.3,
            importance_boost: 0.15,
            priority: 50,
            enabled: true,
        },
        keyword_rule(
            "example-markers",
            &["for example", "e.g.", "example", "for instance"],
            None,
            Some(ContentType::Example),
            45,
        ),
        RuleSpec {
            name: "code-example".to_string(),
            matcher: MatcherSpec::Structural {
                marker: StructuralMarker::CodeBlock,
            },
            category: None,
            subcategory: None,
            content_type: Some(ContentType::Example),
            confidence_boost: 0.2,
            importance_boost: 0.1,
            priority: 44,
            enabled: true,
        },
        RuleSpec {
            name: "numbered-steps".to_string(),
            matcher: MatcherSpec::Structural {
                marker: StructuralMarker::NumberedList,
            },
            category: None,
            subcategory: None,
            content_type: Some(ContentType::Procedure),
            confidence_boost: 0.25,
            importance_boost: 0.1,
            priority: 42,
            enabled: true,
        },
        keyword_rule(
            "procedure-markers",
            &["step", "steps", "how to", "install", "set up", "configure"],
            None,
            Some(ContentType::Procedure),
            41,
        ),
        keyword_rule(
            "tip-markers",
            &["tip", "hint", "best practice", "recommended", "prefer"],
            None,
            Some(ContentType::Tip),
            40,
        ),
        // Topic rules
        keyword_rule(
            "programming-concurrency",
            &["async", "await", "future", "futures", "tokio", "concurrency", "thread", "threads"],
            Some(("programming", Some("concurrency"))),
            None,
            31,
        ),
        keyword_rule(
            "programming-rust",
            &["rust", "cargo", "crate", "borrow", "ownership", "trait", "lifetime"],
            Some(("programming", Some("rust"))),
            None,
            30,
        ),
        keyword_rule(
            "programming-python",
            &["python", "pip", "django", "pandas"],
            Some(("programming", Some("python"))),
            None,
            30,
        ),
        keyword_rule(
            "programming-javascript",
            &["javascript", "typescript", "npm", "node.js", "react"],
            Some(("programming", Some("javascript"))),
            None,
            30,
        ),
        keyword_rule(
            "security",
            &["security", "authentication", "encryption", "tls", "vulnerability", "password"],
            Some(("security", None)),
            None,
            29,
        ),
        keyword_rule(
            "data-storage",
            &["database", "sql", "query", "schema", "index"],
            Some(("data", Some("databases"))),
            None,
            28,
        ),
        keyword_rule(
            "devops",
            &["docker", "kubernetes", "deploy", "deployment", "container", "ci/cd"],
            Some(("devops", None)),
            None,
            27,
        ),
        keyword_rule(
            "web",
            &["http", "html", "css", "browser", "url", "rest api"],
            Some(("web", None)),
            None,
            26,
        ),
        RuleSpec {
            name: "machine-learning".to_string(),
            matcher: MatcherSpec::Semantic {
                hints: ["model", "training", "dataset", "neural"]
                    .iter()
                    .map(|h| h.to_string())
                    .collect(),
            },
            category: Some("machine-learning".to_string()),
            subcategory: None,
            content_type: None,
            confidence_boost: 0.15,
            importance_boost: 0.05,
            priority: 25,
            enabled: true,
        },
        RuleSpec {
            name: "api-signature".to_string(),
            matcher: MatcherSpec::Pattern {
                pattern: r"\b(fn|def|function)\s+\w+\s*\(".to_string(),
            },
            category: Some("programming".to_string()),
            subcategory: Some("api".to_string()),
            content_type: None,
            confidence_boost: 0.15,
            importance_boost: 0.05,
            priority: 20,
            enabled: true,
        },
    ];
    rules.sort_by(|a, b| b.priority.cmp(&a.priority));
    rules
}

/// Seed built-in rules (existing rows win) and upsert configured rules.
pub async fn seed_rules(pool: &SqlitePool, config: &CategorizerConfig) -> Result<()> {
    if config.use_builtin_rules {
        for rule in builtin_rules() {
            save_rule(pool, &rule, false).await?;
        }
    }
    for rule in &config.rules {
        save_rule(pool, rule, true).await?;
    }
    Ok(())
}

pub async fn save_rule(pool: &SqlitePool, rule: &RuleSpec, overwrite: bool) -> Result<()> {
    let sql = if overwrite {
        r#"
        INSERT INTO categorization_rules (name, kind, category, priority, enabled, spec_json, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO UPDATE SET
            kind = excluded.kind,
            category = excluded.category,
            priority = excluded.priority,
            enabled = excluded.enabled,
            spec_json = excluded.spec_json,
            updated_at = excluded.updated_at
        "#
    } else {
        r#"
        INSERT INTO categorization_rules (name, kind, category, priority, enabled, spec_json, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(name) DO NOTHING
        "#
    };
    sqlx::query(sql)
        .bind(&rule.name)
        .bind(rule.matcher.kind())
        .bind(&rule.category)
        .bind(rule.priority)
        .bind(rule.enabled)
        .bind(serde_json::to_string(rule)?)
        .bind(to_millis(Utc::now()))
        .execute(pool)
        .await?;
    Ok(())
}

/// Enabled rules in descending priority. Unreadable rows are logged and skipped.
pub async fn load_rules(pool: &SqlitePool) -> Result<Vec<RuleSpec>> {
    let rows = sqlx::query(
        "SELECT name, spec_json FROM categorization_rules WHERE enabled = 1 ORDER BY priority DESC, name ASC",
    )
    .fetch_all(pool)
    .await?;

    let mut rules = Vec::with_capacity(rows.len());
    for row in rows {
        let name: String = row.get("name");
        let raw: String = row.get("spec_json");
        match serde_json::from_str::<RuleSpec>(&raw) {
            Ok(rule) => rules.push(rule),
            Err(e) => tracing::warn!(rule = %name, error = %e, "ignoring unreadable rule"),
        }
    }
    Ok(rules)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;

    fn categorizer() -> Categorizer {
        let config = CategorizerConfig {
            min_segment_chars: 10,
            ..CategorizerConfig::default()
        };
        Categorizer::new(builtin_rules(), &config)
    }

    #[test]
    fn test_topic_and_kind_from_rules() {
        let bits = categorizer().categorize_text("Use async for I/O-bound tasks.");
        assert_eq!(bits.len(), 1);
        let bit = &bits[0];
        assert_eq!(bit.category, "programming");
        assert_eq!(bit.subcategory.as_deref(), Some("concurrency"));
        assert_eq!(bit.content_type, ContentType::Concept);
        assert!(bit.tags.contains("programming-concurrency"));
        assert!(bit.tags.contains("async"));
        assert!(bit.confidence > FALLBACK_CONFIDENCE);
    }

    #[test]
    fn test_unmatched_segment_falls_back() {
        let bits = categorizer().categorize_text("The weather was pleasant all afternoon long.");
        assert_eq!(bits.len(), 1);
        assert_eq!(bits[0].category, FALLBACK_CATEGORY);
        assert_eq!(bits[0].content_type, ContentType::Concept);
        assert!((bits[0].confidence - FALLBACK_CONFIDENCE).abs() < f64::EPSILON);
    }

    #[test]
    fn test_warning_beats_tip_and_scores_stay_bounded() {
        let text = "Warning: never block inside async code, a tip many learn too late.";
        let bit = &categorizer().categorize_text(text)[0];
        assert_eq!(bit.content_type, ContentType::Warning);
        assert!((0.0..=1.0).contains(&bit.importance));
        assert!((0.0..=1.0).contains(&bit.confidence));
    }

    #[test]
    fn test_definition_and_whole_word_keywords() {
        let bit = &categorizer()
            .categorize_text("Ownership is a set of rules that govern memory in Rust.")[0];
        assert_eq!(bit.content_type, ContentType::Definition);
        assert_eq!(bit.subcategory.as_deref(), Some("rust"));

        // "multiple" must not trigger the "tip" keyword.
        let bit = &categorizer().categorize_text("Multiple readers share the same buffer safely.")[0];
        assert_ne!(bit.content_type, ContentType::Tip);
    }

    #[test]
    fn test_ordering_by_importance_then_position() {
        let text = "# Guide\n\nShort intro line here.\n\nAnother plain line here.\n\nFor example:\n\n```\nlet v = vec![1, 2, 3];\n```";
        let bits = categorizer().categorize_text(text);
        assert_eq!(bits.len(), 3);
        assert_eq!(bits[0].content_type, ContentType::Example);
        for pair in bits.windows(2) {
            assert!(
                pair[0].importance > pair[1].importance
                    || (pair[0].importance == pair[1].importance
                        && pair[0].position < pair[1].position)
            );
        }
        assert!(bits.iter().any(|b| b.context.contains("Guide")));
    }

    #[test]
    fn test_default_config_keeps_one_sentence_bits() {
        let c = Categorizer::new(builtin_rules(), &CategorizerConfig::default());
        let bits = c.categorize_text("Use async for I/O-bound tasks.\n\nSee below.");
        assert_eq!(bits.len(), 1);
        assert_eq!(bits[0].body, "Use async for I/O-bound tasks.");
    }

    #[test]
    fn test_empty_text_yields_nothing() {
        assert!(categorizer().categorize_text("   ").is_empty());
    }

    #[test]
    fn test_invalid_rules_are_dropped() {
        let mut rules = builtin_rules();
        let count = rules.len();
        rules.push(RuleSpec {
            name: "broken".to_string(),
            matcher: MatcherSpec::Pattern {
                pattern: "([unclosed".to_string(),
            },
            category: Some("x".to_string()),
            subcategory: None,
            content_type: None,
            confidence_boost: 0.2,
            importance_boost: 0.0,
            priority: 99,
            enabled: true,
        });
        let c = Categorizer::new(rules, &CategorizerConfig::default());
        assert_eq!(c.rule_count(), count);
    }

    #[tokio::test]
    async fn test_rules_round_trip_through_store() {
        let (_tmp, config, pool) = temp_pool().await;
        let mut categorizer_config = config.categorizer.clone();
        categorizer_config.rules.push(RuleSpec {
            name: "warning-markers".to_string(),
            matcher: MatcherSpec::Keyword {
                keywords: vec!["beware".to_string()],
            },
            category: None,
            subcategory: None,
            content_type: Some(ContentType::Warning),
            confidence_boost: 0.2,
            importance_boost: 0.0,
            priority: 60,
            enabled: true,
        });
        seed_rules(&pool, &categorizer_config).await.unwrap();
        seed_rules(&pool, &categorizer_config).await.unwrap();

        let rules = load_rules(&pool).await.unwrap();
        assert_eq!(rules.len(), builtin_rules().len());
        let warning = rules.iter().find(|r| r.name == "warning-markers").unwrap();
        assert_eq!(
            warning.matcher,
            MatcherSpec::Keyword {
                keywords: vec!["beware".to_string()]
            }
        );
    }
}
