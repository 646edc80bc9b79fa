//! End-to-end crawl scenarios against in-memory fetch and extraction
//! capabilities.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::{Duration, Instant};
use tempfile::TempDir;

use crawl_harness::config::{Config, DomainOverride};
use crawl_harness::crawler::Crawler;
use crawl_harness::error::CrawlError;
use crawl_harness::extract::{Extraction, Extractor, HtmlExtractor};
use crawl_harness::fetch::{FetchResponse, Fetcher};
use crawl_harness::frontier::Frontier;
use crawl_harness::models::{BitFilters, FrontierStatus, SessionStatus};

/// Serves fixed responses; unknown robots.txt is a 404, any other unknown
/// URL is a transport error.
#[derive(Default)]
struct StaticSite {
    pages: HashMap<String, (u16, String)>,
    latency: Duration,
    calls: Mutex<Vec<(String, Instant)>>,
}

impl StaticSite {
    fn with_page(mut self, url: &str, body: &str) -> Self {
        self.pages.insert(url.to_string(), (200, body.to_string()));
        self
    }

    fn calls_to(&self, url: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|(u, _)| u == url).count()
    }

    /// Call instants for every URL starting with `prefix`, in call order.
    fn call_times(&self, prefix: &str) -> Vec<Instant> {
        self.calls
            .lock()
            .unwrap()
            .iter()
            .filter(|(u, _)| u.starts_with(prefix))
            .map(|(_, at)| *at)
            .collect()
    }
}

#[async_trait]
impl Fetcher for StaticSite {
    async fn fetch(&self, url: &str, _timeout: Duration) -> Result<FetchResponse, CrawlError> {
        self.calls
            .lock()
            .unwrap()
            .push((url.to_string(), Instant::now()));
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }
        let mut headers = std::collections::BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html".to_string());
        match self.pages.get(url) {
            Some((status, body)) => Ok(FetchResponse {
                status: *status,
                headers,
                body: body.clone(),
                elapsed_ms: self.latency.as_millis() as u64,
            }),
            None if url.ends_with("/robots.txt") => Ok(FetchResponse {
                status: 404,
                headers,
                body: String::new(),
                elapsed_ms: 0,
            }),
            None => Err(CrawlError::Transport {
                url: url.to_string(),
                message: "connection refused".to_string(),
            }),
        }
    }
}

/// Skips each URL in the frontier while its fetch is in flight, as an
/// operator would from another process.
struct SkippingSite {
    site: StaticSite,
    frontier: OnceLock<Arc<Frontier>>,
}

#[async_trait]
impl Fetcher for SkippingSite {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchResponse, CrawlError> {
        if let Some(frontier) = self.frontier.get() {
            frontier.mark_skipped(url, "skipped by operator").await.unwrap();
        }
        self.site.fetch(url, timeout).await
    }
}

/// Plain-text pages: `link: <href>` lines are links, everything else is text.
struct LineExtractor;

#[async_trait]
impl Extractor for LineExtractor {
    async fn extract(&self, body: &str) -> Result<Extraction, CrawlError> {
        let mut links = Vec::new();
        let mut text = Vec::new();
        for line in body.lines() {
            match line.strip_prefix("link: ") {
                Some(href) => links.push(href.to_string()),
                None => text.push(line),
            }
        }
        Ok(Extraction {
            title: None,
            main_text: text.join("\n"),
            links,
        })
    }
}

fn test_config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("crawl.sqlite"));
    config.crawler.default_crawl_delay_secs = 0.0;
    config.crawler.fetch_timeout_secs = 5;
    config
}

#[tokio::test]
async fn test_seed_page_is_stored_linked_and_categorized() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.max_pages = Some(1);

    let body = "Rust ownership is a set of rules that govern how a program manages memory. \
        Every value has a single owner, and when the owner goes out of scope the value is \
        dropped. Borrowing lets code use a value without taking ownership, and the borrow \
        checker enforces these rules at compile time so memory bugs never reach production.";
    let html = format!(
        "<html><head><title>Ownership</title></head><body><p>{}</p><a href=\"/docs\">Docs</a></body></html>",
        body
    );
    let site = Arc::new(StaticSite::default().with_page("https://example.com/", &html));
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(HtmlExtractor))
        .await
        .unwrap();

    let run = crawler
        .start_session("seed", &["https://example.com/".to_string()])
        .await
        .unwrap();
    let session = run.wait().await.unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert!(session.ended_at.is_some());
    assert_eq!(session.counters.discovered, 2);
    assert_eq!(session.counters.crawled, 1);
    assert!(session.counters.extracted >= 1);
    assert_eq!(session.counters.errors, 0);

    let page = crawler.get_page("https://example.com/").await.unwrap().unwrap();
    assert_eq!(page.title.as_deref(), Some("Ownership"));
    assert_eq!(page.depth, 0);

    let docs = crawler
        .frontier()
        .get("https://example.com/docs")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(docs.depth, 1);
    assert_eq!(docs.status, FrontierStatus::Pending);
    assert_eq!(site.calls_to("https://example.com/docs"), 0);

    let bits = crawler
        .query_learning_bits(&BitFilters::default())
        .await
        .unwrap();
    assert!(!bits.is_empty());
    assert!(bits.iter().all(|b| b.page_url == "https://example.com/"));
    assert!(bits
        .iter()
        .all(|b| (0.0..=1.0).contains(&b.importance) && (0.0..=1.0).contains(&b.confidence)));
}

#[tokio::test]
async fn test_concurrent_duplicate_bits_converge() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.concurrency = 2;

    let html = "<html><body><p>Use async for I/O-bound tasks.</p></body></html>";
    let site = Arc::new(
        StaticSite {
            latency: Duration::from_millis(20),
            ..StaticSite::default()
        }
        .with_page("https://a.example/", html)
        .with_page("https://b.example/", html),
    );
    let crawler = Crawler::with_capabilities(config, site, Arc::new(HtmlExtractor))
        .await
        .unwrap();

    let session = crawler
        .start_session(
            "dup",
            &[
                "https://a.example/".to_string(),
                "https://b.example/".to_string(),
            ],
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(session.counters.crawled, 2);

    let bits = crawler
        .query_learning_bits(&BitFilters::default())
        .await
        .unwrap();
    assert_eq!(bits.len(), 1);
    assert_eq!(bits[0].body, "Use async for I/O-bound tasks.");
    assert_eq!(bits[0].reference_count, 2);

    let mut sources = crawler
        .learning_bit_sources(&bits[0].content_hash)
        .await
        .unwrap();
    sources.sort();
    assert_eq!(sources, vec!["https://a.example/", "https://b.example/"]);
}

#[tokio::test]
async fn test_crawl_delay_spaces_dispatches() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.concurrency = 3;
    config.crawler.respect_robots = false;
    config.domains.push(DomainOverride {
        domain: "slow.example".to_string(),
        crawl_delay_secs: Some(2.0),
        max_depth: None,
        allowed_paths: vec![],
        blocked_paths: vec![],
        content_filters: vec![],
        priority_boost: None,
    });

    let urls = ["https://slow.example/a", "https://slow.example/b", "https://slow.example/c"];
    let mut site = StaticSite::default();
    for url in urls {
        site = site.with_page(url, "A short page about pacing.");
    }
    let crawler = Crawler::with_capabilities(config, Arc::new(site), Arc::new(LineExtractor))
        .await
        .unwrap();

    let seeds: Vec<String> = urls.iter().map(|u| u.to_string()).collect();
    let session = crawler
        .start_session("paced", &seeds)
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(session.counters.crawled, 3);

    let mut stamps: Vec<i64> = crawler
        .frontier_entries(Some(FrontierStatus::Completed), 10)
        .await
        .unwrap()
        .iter()
        .map(|e| e.last_attempt_at.unwrap().timestamp_millis())
        .collect();
    stamps.sort();
    assert_eq!(stamps.len(), 3);
    for pair in stamps.windows(2) {
        assert!(
            pair[1] - pair[0] >= 2000,
            "dispatches {}ms apart",
            pair[1] - pair[0]
        );
    }
}

#[tokio::test]
async fn test_crawl_delay_covers_robots_requests() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.concurrency = 3;
    config.domains.push(DomainOverride {
        domain: "slow.example".to_string(),
        crawl_delay_secs: Some(2.0),
        max_depth: None,
        allowed_paths: vec![],
        blocked_paths: vec![],
        content_filters: vec![],
        priority_boost: None,
    });

    let site = Arc::new(
        StaticSite::default()
            .with_page("https://slow.example/robots.txt", "User-agent: *\nAllow: /\n")
            .with_page("https://slow.example/a", "A short page about pacing.")
            .with_page("https://slow.example/b", "Another page about pacing."),
    );
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(LineExtractor))
        .await
        .unwrap();

    let session = crawler
        .start_session(
            "paced-robots",
            &[
                "https://slow.example/a".to_string(),
                "https://slow.example/b".to_string(),
            ],
        )
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(session.counters.crawled, 2);
    assert_eq!(site.calls_to("https://slow.example/robots.txt"), 1);

    let times = site.call_times("https://slow.example/");
    assert_eq!(times.len(), 3);
    for pair in times.windows(2) {
        let gap = pair[1].duration_since(pair[0]);
        assert!(gap >= Duration::from_secs(2), "requests {:?} apart", gap);
    }
}

#[tokio::test]
async fn test_second_session_is_refused_while_one_runs() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.respect_robots = false;

    let url = "https://a.example/x";
    let site = Arc::new(
        StaticSite {
            latency: Duration::from_millis(500),
            ..StaticSite::default()
        }
        .with_page(url, "A page that takes a while."),
    );
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(LineExtractor))
        .await
        .unwrap();

    let run = crawler
        .start_session("one", &[url.to_string()])
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    let err = crawler.start_session("two", &[]).await.unwrap_err();
    assert!(err.to_string().contains("still running"));

    let session = run.wait().await.unwrap();
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.counters.crawled, 1);
    assert_eq!(site.calls_to(url), 1);

    // Once the first finishes, a new session starts and finds nothing to redo.
    crawler
        .start_session("three", &[])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(site.calls_to(url), 1);
    let entry = crawler.frontier().get(url).await.unwrap().unwrap();
    assert_eq!(entry.status, FrontierStatus::Completed);
}

#[tokio::test]
async fn test_entry_skipped_during_fetch_does_not_end_session() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.respect_robots = false;

    let url = "https://moved.example/";
    let site = Arc::new(SkippingSite {
        site: StaticSite::default().with_page(url, "A page the operator skipped."),
        frontier: OnceLock::new(),
    });
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(LineExtractor))
        .await
        .unwrap();
    assert!(site.frontier.set(crawler.frontier().clone()).is_ok());

    let session = crawler
        .start_session("stale", &[url.to_string()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.counters.crawled, 0);
    assert_eq!(session.counters.errors, 1);
    let entry = crawler.frontier().get(url).await.unwrap().unwrap();
    assert_eq!(entry.status, FrontierStatus::Skipped);
}

#[tokio::test]
async fn test_failing_url_is_retried_up_to_ceiling() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.retry_ceiling = 3;
    config.crawler.respect_robots = false;

    let site = Arc::new(StaticSite::default());
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(LineExtractor))
        .await
        .unwrap();

    let url = "https://flaky.example/";
    let session = crawler
        .start_session("retry", &[url.to_string()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(site.calls_to(url), 3);
    assert_eq!(session.counters.errors, 3);
    assert_eq!(session.counters.crawled, 0);
    assert_eq!(session.status, SessionStatus::Completed);

    let entry = crawler.frontier().get(url).await.unwrap().unwrap();
    assert_eq!(entry.status, FrontierStatus::Failed);
    assert_eq!(entry.retry_count, 3);
    assert!(entry.last_error.unwrap().contains("connection refused"));

    // A later session does not pick the failed entry up again.
    crawler
        .start_session("again", &[])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(site.calls_to(url), 3);
}

#[tokio::test]
async fn test_links_beyond_max_depth_are_not_enqueued() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.default_max_depth = 1;
    config.crawler.respect_robots = false;

    let site = StaticSite::default()
        .with_page("https://deep.example/", "Root page text.\nlink: /one")
        .with_page("https://deep.example/one", "Level one text.\nlink: /two");
    let crawler = Crawler::with_capabilities(config, Arc::new(site), Arc::new(LineExtractor))
        .await
        .unwrap();

    let session = crawler
        .start_session("depth", &["https://deep.example/".to_string()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();
    assert_eq!(session.counters.crawled, 2);
    assert_eq!(session.counters.discovered, 2);

    let one = crawler.frontier().get("https://deep.example/one").await.unwrap().unwrap();
    assert_eq!(one.depth, 1);
    assert!(crawler.frontier().get("https://deep.example/two").await.unwrap().is_none());
}

#[tokio::test]
async fn test_robots_disallow_blocks_links() {
    let tmp = TempDir::new().unwrap();
    let config = test_config(&tmp);

    let site = StaticSite::default()
        .with_page("https://polite.example/robots.txt", "User-agent: *\nDisallow: /private/\n")
        .with_page(
            "https://polite.example/",
            "Public page text.\nlink: /private/secret\nlink: /public",
        )
        .with_page("https://polite.example/public", "Public text.");
    let site = Arc::new(site);
    let crawler = Crawler::with_capabilities(config, site.clone(), Arc::new(LineExtractor))
        .await
        .unwrap();

    crawler
        .start_session("robots", &["https://polite.example/".to_string()])
        .await
        .unwrap()
        .wait()
        .await
        .unwrap();

    assert_eq!(site.calls_to("https://polite.example/private/secret"), 0);
    assert!(crawler
        .frontier()
        .get("https://polite.example/private/secret")
        .await
        .unwrap()
        .is_none());
    assert_eq!(site.calls_to("https://polite.example/public"), 1);
}

#[tokio::test]
async fn test_pause_resume_and_stop() {
    let tmp = TempDir::new().unwrap();
    let mut config = test_config(&tmp);
    config.crawler.respect_robots = false;
    config.crawler.concurrency = 1;

    let mut site = StaticSite {
        latency: Duration::from_millis(50),
        ..StaticSite::default()
    };
    let links: String = (0..20).map(|i| format!("link: /p{}\n", i)).collect();
    site = site.with_page("https://big.example/", &format!("Index page.\n{}", links));
    for i in 0..20 {
        site = site.with_page(&format!("https://big.example/p{}", i), "Leaf page.");
    }
    let crawler = Crawler::with_capabilities(config, Arc::new(site), Arc::new(LineExtractor))
        .await
        .unwrap();

    let run = crawler
        .start_session("control", &["https://big.example/".to_string()])
        .await
        .unwrap();
    let id = run.id.clone();

    let paused = crawler.pause_session(&id).await.unwrap();
    assert_eq!(paused.status, SessionStatus::Paused);
    assert!(paused.ended_at.is_none());
    let resumed = crawler.resume_session(&id).await.unwrap();
    assert_eq!(resumed.status, SessionStatus::Running);

    tokio::time::sleep(Duration::from_millis(120)).await;
    crawler.stop_session(&id).await.unwrap();
    let session = run.wait().await.unwrap();

    assert_eq!(session.status, SessionStatus::Stopped);
    assert!(session.ended_at.is_some());
    assert!(session.counters.crawled < 21);

    let counts = crawler.frontier_counts().await.unwrap();
    assert_eq!(counts.in_progress, 0);
    assert!(counts.pending > 0);

    let status = crawler.get_session_status(&id).await.unwrap();
    assert_eq!(status.counters.crawled, session.counters.crawled);
}
