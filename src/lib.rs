//! # Crawl Harness
//!
//! A single-process, breadth-first crawl core that turns documentation
//! sites into deduplicated, categorized and cross-linked "learning bits".
//!
//! Crawling is polite: per-domain pacing, robots directives, depth limits
//! and path rules are enforced before a URL is admitted or fetched, and
//! failing URLs are retried a bounded number of times.
//!
//! ## Architecture
//!
//! ```text
//! seed ─▶ Frontier ─▶ Dispatcher ─▶ Pipeline ─▶ Categorizer ─▶ Bit Store ─▶ Relationships
//!            ▲  (domain policy)        │
//!            └──────── links ──────────┘
//! ```
//!
//! All state lives in one SQLite database (WAL mode). The frontier's dequeue
//! and the bit store's hash-keyed upsert are the two serialization points
//! for concurrent workers.
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types and the frontier state machine |
//! | [`error`] | Crawl error taxonomy |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`logging`] | Tracing subscriber setup |
//! | [`robots`] | robots.txt parsing |
//! | [`url_utils`] | URL normalization and link resolution |
//! | [`domain_policy`] | Per-domain rules and admission checks |
//! | [`frontier`] | Persistent priority queue with pacing and retries |
//! | [`fetch`] | Fetch capability and the HTTP implementation |
//! | [`extract`] | Extraction capability and the HTML implementation |
//! | [`segment`] | Page text segmentation |
//! | [`pipeline`] | Page storage and link discovery |
//! | [`categorize`] | Rule-driven categorization |
//! | [`bits`] | Learning bit store and deduplication |
//! | [`relationships`] | Relationship inference |
//! | [`session`] | Session lifecycle and counters |
//! | [`dispatcher`] | Worker pool driving a session |
//! | [`crawler`] | Session control and query surface |
//! | [`query`] | Read-only CLI commands |

pub mod bits;
pub mod categorize;
pub mod config;
pub mod crawler;
pub mod db;
pub mod dispatcher;
pub mod domain_policy;
pub mod error;
pub mod extract;
pub mod fetch;
pub mod frontier;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod query;
pub mod relationships;
pub mod robots;
pub mod segment;
pub mod session;
pub mod url_utils;
