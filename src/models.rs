//! Core data models used throughout the crawl core.
//!
//! These types represent the pages, learning bits, relationships, frontier
//! entries, domain rules, and sessions that flow through the crawl pipeline.
//! Every enum round-trips through a lowercase string so it can be stored in
//! a plain SQLite `TEXT` column.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use crate::error::CrawlError;

/// Default frontier priority (1 highest … 10 lowest).
pub const BASE_PRIORITY: i64 = 5;
pub const MIN_PRIORITY: i64 = 1;
pub const MAX_PRIORITY: i64 = 10;

macro_rules! string_enum {
    ($name:ident { $($variant:ident => $text:literal),+ $(,)? }) => {
        impl $name {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $(Self::$variant => $text,)+
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $name {
            type Err = CrawlError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $($text => Ok(Self::$variant),)+
                    other => Err(CrawlError::Configuration(format!(
                        "unknown {} value: '{}'",
                        stringify!($name),
                        other
                    ))),
                }
            }
        }
    };
}

/// Kind of knowledge a learning bit carries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ContentType {
    Concept,
    Example,
    Definition,
    Procedure,
    Warning,
    Tip,
}

string_enum!(ContentType {
    Concept => "concept",
    Example => "example",
    Definition => "definition",
    Procedure => "procedure",
    Warning => "warning",
    Tip => "tip",
});

/// Lifecycle state of a [`FrontierEntry`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrontierStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
    Skipped,
}

string_enum!(FrontierStatus {
    Pending => "pending",
    InProgress => "in_progress",
    Completed => "completed",
    Failed => "failed",
    Skipped => "skipped",
});

/// Events that drive a frontier entry through its state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrontierEvent {
    /// A worker took the entry.
    Dispatch,
    Complete,
    /// Transport error, timeout, or non-2xx status.
    Fail,
    Skip,
    /// Stale in-progress entry found at session start.
    Recover,
}

impl FrontierStatus {
    /// Apply `event` to this status.
    ///
    /// `retry_count` is the count *after* the failure being applied has been
    /// recorded. A failure returns the entry to [`FrontierStatus::Pending`]
    /// while `retry_count < ceiling`, otherwise it becomes terminal.
    pub fn transition(
        self,
        event: FrontierEvent,
        retry_count: i64,
        ceiling: i64,
    ) -> Result<FrontierStatus, CrawlError> {
        use FrontierEvent as E;
        use FrontierStatus as S;

        match (self, event) {
            (S::Pending, E::Dispatch) => Ok(S::InProgress),
            (S::Pending, E::Skip) => Ok(S::Skipped),
            (S::InProgress, E::Complete) => Ok(S::Completed),
            (S::InProgress, E::Skip) => Ok(S::Skipped),
            (S::InProgress, E::Recover) => Ok(S::Pending),
            (S::InProgress, E::Fail) if retry_count < ceiling => Ok(S::Pending),
            (S::InProgress, E::Fail) => Ok(S::Failed),
            (from, event) => Err(CrawlError::InvalidTransition {
                from: from.as_str(),
                event: format!("{:?}", event),
            }),
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// Lifecycle state of a [`CrawlSession`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    Completed,
    Paused,
    Stopped,
}

string_enum!(SessionStatus {
    Running => "running",
    Completed => "completed",
    Paused => "paused",
    Stopped => "stopped",
});

impl SessionStatus {
    pub fn is_finished(self) -> bool {
        matches!(self, Self::Completed | Self::Stopped)
    }
}

/// Semantic link type between two learning bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelationshipType {
    /// Source must be understood before target.
    Prerequisite,
    Related,
    /// Source is a concrete instance of target.
    Implements,
    /// Source builds on target.
    Extends,
    Similar,
    Opposite,
}

string_enum!(RelationshipType {
    Prerequisite => "prerequisite",
    Related => "related",
    Implements => "implements",
    Extends => "extends",
    Similar => "similar",
    Opposite => "opposite",
});

/// A fetched page, keyed by URL.
#[derive(Debug, Clone, Serialize)]
pub struct Page {
    pub url: String,
    pub title: Option<String>,
    pub text: String,
    pub raw_html: Option<String>,
    pub content_type: Option<String>,
    pub status_code: u16,
    pub latency_ms: u64,
    pub depth: i64,
    pub parent_url: Option<String>,
    pub domain: String,
    pub path: String,
    pub metadata: serde_json::Value,
    pub first_crawled_at: DateTime<Utc>,
    pub last_crawled_at: DateTime<Utc>,
}

/// A categorized unit of knowledge before deduplication.
#[derive(Debug, Clone, PartialEq)]
pub struct CandidateBit {
    pub content_type: ContentType,
    pub category: String,
    pub subcategory: Option<String>,
    pub body: String,
    pub context: String,
    pub importance: f64,
    pub confidence: f64,
    pub tags: BTreeSet<String>,
    pub language: String,
    /// Offset of the segment in the page text, used for stable ordering.
    pub position: usize,
}

/// A deduplicated learning bit as stored.
#[derive(Debug, Clone, Serialize)]
pub struct LearningBit {
    pub content_hash: String,
    pub page_url: String,
    pub content_type: ContentType,
    pub category: String,
    pub subcategory: Option<String>,
    pub body: String,
    pub context: String,
    pub importance: f64,
    pub confidence: f64,
    pub source_url: String,
    pub reference_count: i64,
    pub cross_references: Vec<String>,
    pub tags: BTreeSet<String>,
    pub language: String,
    pub created_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
}

/// A directed (or bidirectional) edge between two learning bits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Relationship {
    pub source_hash: String,
    pub target_hash: String,
    pub relationship_type: RelationshipType,
    pub strength: f64,
    pub bidirectional: bool,
}

/// A URL waiting in (or retired from) the frontier.
#[derive(Debug, Clone, Serialize)]
pub struct FrontierEntry {
    pub url: String,
    pub priority: i64,
    pub status: FrontierStatus,
    pub discovered_from: Option<String>,
    pub depth: i64,
    pub domain: String,
    pub estimated_importance: f64,
    pub last_attempt_at: Option<DateTime<Utc>>,
    pub retry_count: i64,
    pub retry_ceiling: i64,
    pub robots_allowed: bool,
    pub last_error: Option<String>,
    pub last_status_code: Option<u16>,
}

/// Per-domain crawl rules.
#[derive(Debug, Clone, Serialize)]
pub struct DomainRule {
    pub domain: String,
    pub robots_txt: Option<String>,
    pub robots_fetched_at: Option<DateTime<Utc>>,
    pub crawl_delay_secs: f64,
    pub max_depth: i64,
    pub allowed_paths: Vec<String>,
    pub blocked_paths: Vec<String>,
    pub content_filters: Vec<String>,
    pub priority_boost: f64,
}

impl DomainRule {
    pub fn with_defaults(domain: &str, crawl_delay_secs: f64, max_depth: i64) -> Self {
        Self {
            domain: domain.to_string(),
            robots_txt: None,
            robots_fetched_at: None,
            crawl_delay_secs,
            max_depth,
            allowed_paths: Vec::new(),
            blocked_paths: Vec::new(),
            content_filters: Vec::new(),
            priority_boost: 1.0,
        }
    }

    /// Minimum spacing between two fetches to this domain.
    pub fn crawl_delay(&self) -> Duration {
        Duration::try_from_secs_f64(self.crawl_delay_secs.max(0.0)).unwrap_or(Duration::ZERO)
    }
}

/// One bounded crawl run.
#[derive(Debug, Clone, Serialize)]
pub struct CrawlSession {
    pub id: String,
    pub name: String,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub status: SessionStatus,
    pub counters: SessionCounters,
    pub config: serde_json::Value,
}

/// Running totals for a session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct SessionCounters {
    pub discovered: u64,
    pub crawled: u64,
    pub extracted: u64,
    pub relationships: u64,
    pub errors: u64,
}

/// Filters for learning-bit queries. Unset fields match everything.
#[derive(Debug, Clone, Default)]
pub struct BitFilters {
    pub category: Option<String>,
    pub subcategory: Option<String>,
    pub content_type: Option<ContentType>,
    pub min_importance: Option<f64>,
    pub limit: Option<i64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_state_machine() {
        let s = FrontierStatus::Pending;
        let s = s.transition(FrontierEvent::Dispatch, 0, 3).unwrap();
        assert_eq!(s, FrontierStatus::InProgress);
        assert_eq!(
            s.transition(FrontierEvent::Fail, 1, 3).unwrap(),
            FrontierStatus::Pending
        );
        assert_eq!(
            s.transition(FrontierEvent::Fail, 3, 3).unwrap(),
            FrontierStatus::Failed
        );
    }

    #[test]
    fn test_illegal_transitions_rejected() {
        assert!(FrontierStatus::Completed
            .transition(FrontierEvent::Dispatch, 0, 3)
            .is_err());
        assert!(FrontierStatus::Failed
            .transition(FrontierEvent::Recover, 3, 3)
            .is_err());
        assert!(FrontierStatus::Pending
            .transition(FrontierEvent::Complete, 0, 3)
            .is_err());
    }

    #[test]
    fn test_enum_strings_round_trip() {
        for ct in [
            ContentType::Concept,
            ContentType::Example,
            ContentType::Definition,
            ContentType::Procedure,
            ContentType::Warning,
            ContentType::Tip,
        ] {
            assert_eq!(ct.as_str().parse::<ContentType>().unwrap(), ct);
        }
        assert_eq!(
            "in_progress".parse::<FrontierStatus>().unwrap(),
            FrontierStatus::InProgress
        );
        assert!("bogus".parse::<SessionStatus>().is_err());
    }
}
