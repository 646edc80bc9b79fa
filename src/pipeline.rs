//! Content pipeline: fetched response → stored page → discovered links.
//!
//! The pipeline exclusively creates [`Page`] records. A page is upserted by
//! URL, so a re-crawl refreshes content and `last_crawled_at` while keeping
//! `first_crawled_at`. Outbound links are resolved against the page URL and
//! offered to the frontier at `depth + 1`; the frontier applies the domain
//! policy.
//!
//! Pages are stored even when they carry no usable text (redirect stubs,
//! filtered content types, extraction failures). Such pages are flagged as
//! not categorizable.

use anyhow::Result;
use chrono::Utc;
use serde_json::json;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::collections::HashSet;
use std::sync::Arc;
use url::Url;

use crate::db::{from_millis, to_millis};
use crate::error::CrawlError;
use crate::extract::{Extraction, Extractor};
use crate::fetch::FetchResponse;
use crate::frontier::{EnqueueOutcome, Frontier};
use crate::models::{DomainRule, Page};
use crate::session::{SessionEvent, SessionHandle};
use crate::url_utils::{domain_of, looks_crawlable, normalize_url, resolve_link};

/// What processing produced.
#[derive(Debug, Clone)]
pub struct ProcessedPage {
    pub page: Page,
    /// Links newly admitted to the frontier.
    pub links_enqueued: u64,
    /// False when the page has no text for the categorizer.
    pub categorizable: bool,
}

pub struct ContentPipeline {
    pool: SqlitePool,
    frontier: Arc<Frontier>,
    extractor: Arc<dyn Extractor>,
    /// Domains links may point into; `None` follows links anywhere.
    link_scope: Option<HashSet<String>>,
    session: SessionHandle,
}

impl ContentPipeline {
    pub fn new(
        pool: SqlitePool,
        frontier: Arc<Frontier>,
        extractor: Arc<dyn Extractor>,
        link_scope: Option<HashSet<String>>,
        session: SessionHandle,
    ) -> Self {
        Self {
            pool,
            frontier,
            extractor,
            link_scope,
            session,
        }
    }

    /// Extract, store and fan out links for one successful fetch.
    pub async fn process(
        &self,
        url: &str,
        response: &FetchResponse,
        depth: i64,
        parent_url: Option<&str>,
    ) -> Result<ProcessedPage> {
        let parsed = normalize_url(url).ok_or_else(|| CrawlError::PolicyRejection {
            url: url.to_string(),
            reason: "unparseable url".to_string(),
        })?;
        let domain = domain_of(&parsed).unwrap_or_default();
        let rule = self.frontier.policy().resolve(&domain).await?;

        let filtered = !accepts_content_type(&rule, response.content_type());
        let extraction = if filtered {
            tracing::info!(url, content_type = ?response.content_type(), "content type filtered");
            Extraction::default()
        } else {
            match self.extractor.extract(&response.body).await {
                Ok(extraction) => extraction,
                Err(e) => {
                    tracing::warn!(url, error = %e, "extraction failed");
                    Extraction::default()
                }
            }
        };

        let categorizable = !extraction.main_text.trim().is_empty();
        if !categorizable && !filtered {
            let failure = CrawlError::ExtractionFailure {
                url: url.to_string(),
            };
            tracing::info!(url, error = %failure, "page stored without text");
        }

        let now = Utc::now();
        let mut page = Page {
            url: parsed.to_string(),
            title: extraction.title.clone(),
            text: extraction.main_text.clone(),
            raw_html: (!filtered).then(|| response.body.clone()),
            content_type: response.content_type().map(str::to_string),
            status_code: response.status,
            latency_ms: response.elapsed_ms,
            depth,
            parent_url: parent_url.map(str::to_string),
            domain: domain.clone(),
            path: parsed.path().to_string(),
            metadata: json!({
                "headers": response.headers,
                "latency_ms": response.elapsed_ms,
                "robots": robots_note(&rule),
                "content_filtered": filtered,
                "outbound_links": extraction.links.len(),
            }),
            first_crawled_at: now,
            last_crawled_at: now,
        };
        page.first_crawled_at = upsert_page(&self.pool, &page).await?;

        let links_enqueued = self.enqueue_links(&parsed, &extraction.links, depth).await?;

        tracing::debug!(url = %page.url, depth, links = links_enqueued, "page processed");
        Ok(ProcessedPage {
            page,
            links_enqueued,
            categorizable,
        })
    }

    async fn enqueue_links(&self, base: &Url, links: &[String], depth: i64) -> Result<u64> {
        let mut enqueued = 0;
        let mut seen = HashSet::new();
        for link in links {
            let Some(target) = resolve_link(link, base) else {
                continue;
            };
            if !looks_crawlable(&target) || !seen.insert(target.to_string()) {
                continue;
            }
            let Some(domain) = domain_of(&target) else {
                continue;
            };
            if let Some(ref scope) = self.link_scope {
                if !scope.contains(&domain) {
                    tracing::trace!(url = %target, "link outside crawl scope");
                    continue;
                }
            }

            let rule = self.frontier.policy().resolve(&domain).await?;
            let outcome = self
                .frontier
                .enqueue(target.as_str(), Some(base.as_str()), depth + 1, &rule)
                .await?;
            if let EnqueueOutcome::Enqueued { .. } = outcome {
                enqueued += 1;
                self.session.tick(SessionEvent::Discovered);
            }
        }
        Ok(enqueued)
    }
}

/// An empty filter list accepts everything; otherwise the response's
/// content type must start with one of the filters.
fn accepts_content_type(rule: &DomainRule, content_type: Option<&str>) -> bool {
    if rule.content_filters.is_empty() {
        return true;
    }
    let Some(ct) = content_type else {
        return false;
    };
    let ct = ct.trim().to_ascii_lowercase();
    rule.content_filters
        .iter()
        .any(|f| ct.starts_with(&f.trim().to_ascii_lowercase()))
}

fn robots_note(rule: &DomainRule) -> &'static str {
    match (&rule.robots_txt, rule.robots_fetched_at) {
        (Some(_), _) => "snapshot",
        (None, Some(_)) => "unavailable",
        (None, None) => "not_fetched",
    }
}

/// Insert or refresh a page. Returns the stored `first_crawled_at`.
async fn upsert_page(pool: &SqlitePool, page: &Page) -> Result<chrono::DateTime<Utc>> {
    let first: i64 = sqlx::query_scalar(
        r#"
        INSERT INTO pages (url, title, text, raw_html, content_type, status_code, latency_ms,
            depth, parent_url, domain, path, metadata_json, first_crawled_at, last_crawled_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(url) DO UPDATE SET
            title = excluded.title,
            text = excluded.text,
            raw_html = excluded.raw_html,
            content_type = excluded.content_type,
            status_code = excluded.status_code,
            latency_ms = excluded.latency_ms,
            metadata_json = excluded.metadata_json,
            last_crawled_at = excluded.last_crawled_at
        RETURNING first_crawled_at
        "#,
    )
    .bind(&page.url)
    .bind(&page.title)
    .bind(&page.text)
    .bind(&page.raw_html)
    .bind(&page.content_type)
    .bind(i64::from(page.status_code))
    .bind(page.latency_ms as i64)
    .bind(page.depth)
    .bind(&page.parent_url)
    .bind(&page.domain)
    .bind(&page.path)
    .bind(page.metadata.to_string())
    .bind(to_millis(page.first_crawled_at))
    .bind(to_millis(page.last_crawled_at))
    .fetch_one(pool)
    .await?;
    Ok(from_millis(first))
}

pub async fn get_page(pool: &SqlitePool, url: &str) -> Result<Option<Page>> {
    let key = normalize_url(url)
        .map(|u| u.to_string())
        .unwrap_or_else(|| url.to_string());
    let row = sqlx::query("SELECT * FROM pages WHERE url = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    row.as_ref().map(page_from_row).transpose()
}

fn page_from_row(row: &SqliteRow) -> Result<Page> {
    let metadata: String = row.get("metadata_json");
    Ok(Page {
        url: row.get("url"),
        title: row.get("title"),
        text: row.get("text"),
        raw_html: row.get("raw_html"),
        content_type: row.get("content_type"),
        status_code: u16::try_from(row.get::<i64, _>("status_code")).unwrap_or_default(),
        latency_ms: row.get::<i64, _>("latency_ms").max(0) as u64,
        depth: row.get("depth"),
        parent_url: row.get("parent_url"),
        domain: row.get("domain"),
        path: row.get("path"),
        metadata: serde_json::from_str(&metadata)?,
        first_crawled_at: from_millis(row.get("first_crawled_at")),
        last_crawled_at: from_millis(row.get("last_crawled_at")),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_support::temp_pool;
    use crate::domain_policy::DomainPolicyStore;
    use crate::extract::HtmlExtractor;
    use crate::models::FrontierStatus;
    use crate::session::SessionTracker;
    use std::collections::BTreeMap;

    fn html_response(body: &str, content_type: &str) -> FetchResponse {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), content_type.to_string());
        FetchResponse {
            status: 200,
            headers,
            body: body.to_string(),
            elapsed_ms: 12,
        }
    }

    async fn setup(
        scope: Option<HashSet<String>>,
    ) -> (tempfile::TempDir, SqlitePool, Arc<Frontier>, SessionHandle, ContentPipeline) {
        let (tmp, config, pool) = temp_pool().await;
        let policy = Arc::new(DomainPolicyStore::new(pool.clone(), &config.crawler));
        let frontier = Arc::new(Frontier::new(pool.clone(), policy, &config.crawler));
        let session = SessionTracker::new(pool.clone())
            .start("test", serde_json::Value::Null)
            .await
            .unwrap();
        let pipeline = ContentPipeline::new(
            pool.clone(),
            frontier.clone(),
            Arc::new(HtmlExtractor),
            scope,
            session.clone(),
        );
        (tmp, pool, frontier, session, pipeline)
    }

    #[tokio::test]
    async fn test_process_stores_page_and_enqueues_links_one_level_deeper() {
        let scope = Some(["example.com".to_string()].into_iter().collect());
        let (_tmp, pool, frontier, session, pipeline) = setup(scope).await;
        let html = r#"<html><head><title>Home</title></head><body>
            <p>Welcome to the documentation home page.</p>
            <a href="/docs">Docs</a>
            <a href="https://elsewhere.org/x">Elsewhere</a>
            <a href="/logo.png">Logo</a>
        </body></html>"#;

        let out = pipeline
            .process("https://example.com/", &html_response(html, "text/html"), 1, None)
            .await
            .unwrap();
        assert!(out.categorizable);
        assert_eq!(out.links_enqueued, 1);
        assert_eq!(session.snapshot().discovered, 1);

        let docs = frontier.get("https://example.com/docs").await.unwrap().unwrap();
        assert_eq!(docs.depth, 2);
        assert_eq!(docs.status, FrontierStatus::Pending);
        assert_eq!(docs.discovered_from.as_deref(), Some("https://example.com/"));

        let stored = get_page(&pool, "https://example.com/").await.unwrap().unwrap();
        assert_eq!(stored.title.as_deref(), Some("Home"));
        assert_eq!(stored.domain, "example.com");
        assert_eq!(stored.metadata["latency_ms"], 12);
    }

    #[tokio::test]
    async fn test_recrawl_keeps_first_crawled_at() {
        let (_tmp, pool, _frontier, _session, pipeline) = setup(None).await;
        let url = "https://example.com/page";
        let first = pipeline
            .process(url, &html_response("<p>version one of the page</p>", "text/html"), 0, None)
            .await
            .unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        let second = pipeline
            .process(url, &html_response("<p>version two of the page</p>", "text/html"), 0, None)
            .await
            .unwrap();

        assert_eq!(second.page.first_crawled_at, first.page.first_crawled_at);
        let stored = get_page(&pool, url).await.unwrap().unwrap();
        assert_eq!(stored.text, "version two of the page");
        assert!(stored.last_crawled_at >= stored.first_crawled_at);
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM pages")
            .fetch_one(&pool)
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_empty_text_is_stored_but_not_categorizable() {
        let (_tmp, pool, _frontier, _session, pipeline) = setup(None).await;
        let out = pipeline
            .process("https://example.com/empty", &html_response("<html></html>", "text/html"), 0, None)
            .await
            .unwrap();
        assert!(!out.categorizable);
        assert!(get_page(&pool, "https://example.com/empty").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_content_filters_skip_body() {
        let (_tmp, pool, frontier, _session, pipeline) = setup(None).await;
        let mut rule = frontier.policy().resolve("example.com").await.unwrap();
        rule.content_filters = vec!["text/html".to_string()];
        frontier.policy().save(&rule).await.unwrap();

        let out = pipeline
            .process(
                "https://example.com/data.json",
                &html_response("{\"a\": 1}", "application/json"),
                0,
                None,
            )
            .await
            .unwrap();
        assert!(!out.categorizable);
        let stored = get_page(&pool, "https://example.com/data.json").await.unwrap().unwrap();
        assert!(stored.raw_html.is_none());
        assert_eq!(stored.metadata["content_filtered"], true);
    }
}
