//! Fetch dispatcher: the bounded worker pool that drives a session.
//!
//! `concurrency` workers loop over [`Frontier::dequeue_next`]. When nothing
//! is eligible they idle until the earliest pacing window opens or new work
//! is enqueued. A worker carries one entry through fetch → pipeline →
//! categorize → ingest → link, then marks it completed (or failed, or
//! skipped).
//!
//! Control arrives on a [`watch`] channel. `Paused` parks workers between
//! entries; `Stopping` prevents new dequeues while in-flight fetches run to
//! completion or time out. Per-URL failures only touch that URL's frontier
//! entry; a store error ends the run.

use anyhow::Result;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use url::Url;

use crate::bits::LearningBitStore;
use crate::categorize::Categorizer;
use crate::error::CrawlError;
use crate::fetch::{FetchResponse, Fetcher};
use crate::frontier::Frontier;
use crate::models::{DomainRule, FrontierEntry};
use crate::pipeline::ContentPipeline;
use crate::relationships::RelationshipBuilder;
use crate::session::{SessionEvent, SessionHandle, SessionTracker};
use crate::url_utils::{domain_of, normalize_url, robots_url};

/// Upper bound on a single idle wait, so control changes and drained
/// frontiers are noticed promptly.
const IDLE_POLL: Duration = Duration::from_millis(250);

/// Slack on top of the fetcher's own timeout before the call is abandoned.
const TIMEOUT_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Running,
    Paused,
    Stopping,
}

/// Why a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RunOutcome {
    /// No pending entries and nothing in flight.
    Drained,
    /// The session's page budget was used up.
    PageLimit,
    Stopped,
}

pub struct Dispatcher {
    frontier: Arc<Frontier>,
    fetcher: Arc<dyn Fetcher>,
    pipeline: ContentPipeline,
    categorizer: Arc<Categorizer>,
    bits: LearningBitStore,
    relationships: RelationshipBuilder,
    tracker: SessionTracker,
    session: SessionHandle,
    concurrency: usize,
    fetch_timeout: Duration,
    max_pages: Option<u64>,
    /// Domains whose robots.txt was fetched during this run.
    robots_seen: Mutex<HashSet<String>>,
    in_flight: AtomicUsize,
    dispatched: AtomicU64,
}

pub struct DispatcherParts {
    pub frontier: Arc<Frontier>,
    pub fetcher: Arc<dyn Fetcher>,
    pub pipeline: ContentPipeline,
    pub categorizer: Arc<Categorizer>,
    pub bits: LearningBitStore,
    pub relationships: RelationshipBuilder,
    pub tracker: SessionTracker,
    pub session: SessionHandle,
}

impl Dispatcher {
    pub fn new(
        parts: DispatcherParts,
        concurrency: usize,
        fetch_timeout: Duration,
        max_pages: Option<u64>,
    ) -> Self {
        Self {
            frontier: parts.frontier,
            fetcher: parts.fetcher,
            pipeline: parts.pipeline,
            categorizer: parts.categorizer,
            bits: parts.bits,
            relationships: parts.relationships,
            tracker: parts.tracker,
            session: parts.session,
            concurrency: concurrency.max(1),
            fetch_timeout,
            max_pages,
            robots_seen: Mutex::new(HashSet::new()),
            in_flight: AtomicUsize::new(0),
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn session(&self) -> &SessionHandle {
        &self.session
    }

    /// Run workers until the frontier drains, the page budget is spent, or
    /// a stop is signalled.
    pub async fn run(self: Arc<Self>, control: watch::Receiver<RunState>) -> Result<RunOutcome> {
        let mut workers = JoinSet::new();
        for worker in 0..self.concurrency {
            let this = Arc::clone(&self);
            let control = control.clone();
            workers.spawn(async move { this.worker_loop(worker, control).await });
        }

        let mut outcome = RunOutcome::Drained;
        while let Some(joined) = workers.join_next().await {
            let result = joined.map_err(|e| anyhow::anyhow!("worker panicked: {}", e))?;
            match result {
                Ok(o) => outcome = outcome.max(o),
                Err(e) => {
                    // Store failure: stop the remaining workers.
                    workers.abort_all();
                    self.tracker.flush(&self.session).await.ok();
                    return Err(e);
                }
            }
        }

        self.tracker.flush(&self.session).await?;
        Ok(outcome)
    }

    async fn worker_loop(
        &self,
        worker: usize,
        mut control: watch::Receiver<RunState>,
    ) -> Result<RunOutcome> {
        loop {
            let state = *control.borrow_and_update();
            match state {
                RunState::Stopping => return Ok(RunOutcome::Stopped),
                RunState::Paused => {
                    if control.changed().await.is_err() {
                        return Ok(RunOutcome::Stopped);
                    }
                    continue;
                }
                RunState::Running => {}
            }

            let reserved = self.dispatched.fetch_add(1, Ordering::SeqCst);
            if self.max_pages.is_some_and(|max| reserved >= max) {
                self.dispatched.fetch_sub(1, Ordering::SeqCst);
                tracing::info!(worker, "page budget reached");
                return Ok(RunOutcome::PageLimit);
            }

            // Counted before dequeue so an idle worker never sees an entry
            // that is in progress but not yet in flight.
            self.in_flight.fetch_add(1, Ordering::SeqCst);
            let next = self.frontier.dequeue_next().await;
            let entry = match next {
                Ok(Some(entry)) => entry,
                Ok(None) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    self.dispatched.fetch_sub(1, Ordering::SeqCst);
                    if self.is_drained().await? {
                        return Ok(RunOutcome::Drained);
                    }
                    let wait = self
                        .frontier
                        .next_ready_in()
                        .await?
                        .map_or(IDLE_POLL, |d| d.min(IDLE_POLL));
                    tokio::select! {
                        _ = self.frontier.wait_for_work(wait) => {}
                        changed = control.changed() => {
                            if changed.is_err() {
                                return Ok(RunOutcome::Stopped);
                            }
                        }
                    }
                    continue;
                }
                Err(e) => {
                    self.in_flight.fetch_sub(1, Ordering::SeqCst);
                    return Err(e);
                }
            };

            let result = self.handle(worker, &entry).await;
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            result?;
            self.tracker.flush(&self.session).await?;
        }
    }

    async fn is_drained(&self) -> Result<bool> {
        if self.in_flight.load(Ordering::SeqCst) > 0 {
            return Ok(false);
        }
        Ok(self.frontier.counts().await?.pending == 0)
    }

    async fn handle(&self, worker: usize, entry: &FrontierEntry) -> Result<()> {
        let policy = self.frontier.policy();
        let (rule, robots_fetched) = self.ensure_robots(&entry.domain, &entry.url).await?;
        if let Err(rejection) = policy.check(&entry.url, &rule) {
            let reason = match rejection {
                CrawlError::PolicyRejection { ref reason, .. } => reason.clone(),
                ref other => other.to_string(),
            };
            if per_url(&entry.url, self.frontier.mark_skipped(&entry.url, &reason).await)?.is_none() {
                self.session.tick(SessionEvent::Error);
            }
            return Ok(());
        }
        if robots_fetched {
            // The robots request used this dispatch's slot.
            self.frontier
                .reserve_domain(&entry.domain, rule.crawl_delay())
                .await;
        }

        tracing::debug!(worker, url = %entry.url, depth = entry.depth, "fetching");
        let fetched = self.fetch(&entry.url).await;
        self.frontier
            .record_fetch_done(&entry.domain, rule.crawl_delay())
            .await;
        match fetched {
            Ok(response) if response.is_success() => self.complete(entry, &response).await,
            Ok(response) => {
                let error = CrawlError::HttpStatus {
                    url: entry.url.clone(),
                    status: response.status,
                };
                self.fail(entry, &error).await
            }
            Err(error) => self.fail(entry, &error).await,
        }
    }

    async fn fetch(&self, url: &str) -> Result<FetchResponse, CrawlError> {
        let timed_out = CrawlError::Timeout {
            url: url.to_string(),
            secs: self.fetch_timeout.as_secs(),
        };
        match tokio::time::timeout(
            self.fetch_timeout + TIMEOUT_GRACE,
            self.fetcher.fetch(url, self.fetch_timeout),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(timed_out),
        }
    }

    async fn complete(&self, entry: &FrontierEntry, response: &FetchResponse) -> Result<()> {
        let processed = self
            .pipeline
            .process(
                &entry.url,
                response,
                entry.depth,
                entry.discovered_from.as_deref(),
            )
            .await;
        let Some(processed) = per_url(&entry.url, processed)? else {
            return self.abandon(entry).await;
        };

        if processed.categorizable {
            for candidate in self.categorizer.categorize(&processed.page) {
                let outcome = self.bits.ingest(&candidate, &processed.page.url).await?;
                self.session.tick(SessionEvent::Extracted);
                if outcome.is_created() {
                    let linked = self
                        .relationships
                        .link_new_bit(outcome.content_hash())
                        .await?;
                    self.session.tick_by(SessionEvent::Relationship, linked);
                }
            }
        }

        if per_url(&entry.url, self.frontier.mark_completed(&entry.url).await)?.is_none() {
            self.session.tick(SessionEvent::Error);
            return Ok(());
        }
        self.session.tick(SessionEvent::Crawled);
        tracing::info!(url = %entry.url, status = response.status, depth = entry.depth, "crawled");
        Ok(())
    }

    async fn fail(&self, entry: &FrontierEntry, error: &CrawlError) -> Result<()> {
        self.session.tick(SessionEvent::Error);
        per_url(&entry.url, self.frontier.mark_failed(&entry.url, error).await)?;
        Ok(())
    }

    /// A fetched page the pipeline could not process is not retried.
    async fn abandon(&self, entry: &FrontierEntry) -> Result<()> {
        self.session.tick(SessionEvent::Error);
        let reason = CrawlError::ExtractionFailure {
            url: entry.url.clone(),
        }
        .to_string();
        per_url(&entry.url, self.frontier.mark_skipped(&entry.url, &reason).await)?;
        Ok(())
    }

    /// Fetch and snapshot robots.txt on first contact with a domain this run.
    /// Returns the current rule and whether a robots request was made.
    ///
    /// The request is paced like a page fetch. 2xx stores the file; other
    /// 4xx means no restrictions; 5xx and transport errors record robots
    /// data as unavailable.
    pub async fn ensure_robots(&self, domain: &str, url: &str) -> Result<(DomainRule, bool)> {
        let policy = self.frontier.policy();
        let rule = policy.resolve(domain).await?;
        if !policy.respects_robots() {
            return Ok((rule, false));
        }
        {
            let mut seen = self.robots_seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(domain.to_string()) && !policy.needs_robots(&rule) {
                return Ok((rule, false));
            }
        }

        let Some(robots) = normalize_url(url).as_ref().and_then(robots_url) else {
            return Ok((rule, false));
        };
        self.frontier.reserve_domain(domain, rule.crawl_delay()).await;
        let fetched = self.fetch(&robots).await;
        let body = match fetched {
            Ok(r) if r.is_success() => Some(r.body),
            Ok(r) if (400..500).contains(&r.status) => Some(String::new()),
            Ok(r) => {
                tracing::warn!(domain, status = r.status, "robots.txt unavailable");
                None
            }
            Err(e) => {
                tracing::warn!(domain, error = %e, "robots.txt unavailable");
                None
            }
        };
        let rule = policy.record_robots(domain, body).await?;
        self.frontier
            .record_fetch_done(domain, rule.crawl_delay())
            .await;
        Ok((rule, true))
    }

    /// Robots check for a URL that is not yet in the frontier (session seeds).
    pub async fn prepare_seed(&self, url: &Url) -> Result<()> {
        if let Some(domain) = domain_of(url) {
            self.ensure_robots(&domain, url.as_str()).await?;
        }
        Ok(())
    }
}

/// Per-URL failures leave the run going: a non-store [`CrawlError`] is
/// logged and yields `None`. Anything else is fatal to the run.
fn per_url<T>(url: &str, result: Result<T>) -> Result<Option<T>> {
    match result {
        Ok(value) => Ok(Some(value)),
        Err(e) => match e.downcast_ref::<CrawlError>() {
            Some(CrawlError::Store(_)) | None => Err(e),
            Some(err) => {
                tracing::warn!(url, error = %err, "giving up on entry");
                Ok(None)
            }
        },
    }
}
