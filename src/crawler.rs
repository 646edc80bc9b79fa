//! Session control and query surface.
//!
//! [`Crawler`] wires the stores together once per database and exposes the
//! host-facing operations: start/pause/resume/stop a session, read its
//! status, and query learning bits, pages and relationships. Each started
//! session runs on its own task; [`SessionRun::wait`] joins it.

use anyhow::{bail, Context, Result};
use serde_json::json;
use sqlx::SqlitePool;
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::bits::LearningBitStore;
use crate::categorize::{seed_rules, Categorizer};
use crate::config::Config;
use crate::db;
use crate::dispatcher::{Dispatcher, DispatcherParts, RunOutcome, RunState};
use crate::domain_policy::DomainPolicyStore;
use crate::extract::{Extractor, HtmlExtractor};
use crate::fetch::{Fetcher, HttpFetcher};
use crate::frontier::{EnqueueOutcome, Frontier, FrontierCounts};
use crate::migrate::migrate_pool;
use crate::models::{
    BitFilters, CrawlSession, FrontierEntry, FrontierStatus, LearningBit, Page, Relationship,
    SessionStatus, BASE_PRIORITY,
};
use crate::pipeline::{get_page, ContentPipeline};
use crate::relationships::RelationshipBuilder;
use crate::session::{SessionEvent, SessionHandle, SessionTracker};
use crate::url_utils::{domain_of, normalize_url};

struct ActiveSession {
    control: watch::Sender<RunState>,
    handle: SessionHandle,
}

type ActiveSessions = Arc<Mutex<HashMap<String, ActiveSession>>>;

/// A session running in the background.
#[derive(Debug)]
pub struct SessionRun {
    pub id: String,
    task: JoinHandle<Result<CrawlSession>>,
}

impl SessionRun {
    /// Wait for the session to finish and return its final record.
    pub async fn wait(self) -> Result<CrawlSession> {
        self.task
            .await
            .map_err(|e| anyhow::anyhow!("session task failed: {}", e))?
    }
}

pub struct Crawler {
    config: Config,
    pool: SqlitePool,
    frontier: Arc<Frontier>,
    bits: LearningBitStore,
    tracker: SessionTracker,
    fetcher: Arc<dyn Fetcher>,
    extractor: Arc<dyn Extractor>,
    active: ActiveSessions,
    /// Held while a session starts, so at most one runs at a time.
    start_gate: tokio::sync::Mutex<()>,
}

impl Crawler {
    /// Open the database with the default HTTP fetcher and HTML extractor.
    pub async fn open(config: Config) -> Result<Self> {
        let fetcher = Arc::new(HttpFetcher::new(&config.crawler)?);
        Self::with_capabilities(config, fetcher, Arc::new(HtmlExtractor)).await
    }

    /// Open the database with caller-supplied fetch and extraction capabilities.
    pub async fn with_capabilities(
        config: Config,
        fetcher: Arc<dyn Fetcher>,
        extractor: Arc<dyn Extractor>,
    ) -> Result<Self> {
        config.validate()?;
        let pool = db::connect(&config).await?;
        migrate_pool(&pool).await?;
        seed_rules(&pool, &config.categorizer).await?;

        let policy = Arc::new(DomainPolicyStore::new(pool.clone(), &config.crawler));
        policy.apply_overrides(&config.domains).await?;
        let frontier = Arc::new(Frontier::new(pool.clone(), policy, &config.crawler));

        Ok(Self {
            bits: LearningBitStore::new(pool.clone()),
            tracker: SessionTracker::new(pool.clone()),
            config,
            pool,
            frontier,
            fetcher,
            extractor,
            active: Arc::new(Mutex::new(HashMap::new())),
            start_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn frontier(&self) -> &Arc<Frontier> {
        &self.frontier
    }

    /// Start a session over `seeds` and run it in the background.
    ///
    /// Only one session runs at a time; starting another while one is
    /// active is an error. Entries left in progress by an interrupted
    /// session are returned to pending first. Robots data for each seed
    /// domain is fetched before the seed is admitted.
    pub async fn start_session(&self, name: &str, seeds: &[String]) -> Result<SessionRun> {
        let _gate = self.start_gate.lock().await;
        let running: Option<String> = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.keys().next().cloned()
        };
        if let Some(id) = running {
            bail!("session {} is still running; stop it before starting another", id);
        }

        let seed_urls: Vec<url::Url> = seeds
            .iter()
            .filter_map(|s| {
                let parsed = normalize_url(s);
                if parsed.is_none() {
                    tracing::warn!(url = %s, "ignoring unparseable seed");
                }
                parsed
            })
            .collect();
        if seed_urls.is_empty() && seeds.iter().any(|s| !s.trim().is_empty()) {
            bail!("no valid seed URLs");
        }

        self.frontier.recover_in_progress().await?;

        let session_config = json!({
            "seeds": seed_urls.iter().map(|u| u.as_str()).collect::<Vec<_>>(),
            "crawler": self.config.crawler,
            "relationships": self.config.relationships,
        });
        let handle = self.tracker.start(name, session_config).await?;

        let link_scope: Option<HashSet<String>> = self
            .config
            .crawler
            .same_domain_only
            .then(|| seed_urls.iter().filter_map(domain_of).collect());

        let categorizer = Arc::new(Categorizer::from_store(&self.pool, &self.config.categorizer).await?);
        let pipeline = ContentPipeline::new(
            self.pool.clone(),
            Arc::clone(&self.frontier),
            Arc::clone(&self.extractor),
            link_scope,
            handle.clone(),
        );
        let dispatcher = Arc::new(Dispatcher::new(
            DispatcherParts {
                frontier: Arc::clone(&self.frontier),
                fetcher: Arc::clone(&self.fetcher),
                pipeline,
                categorizer,
                bits: self.bits.clone(),
                relationships: RelationshipBuilder::new(
                    self.pool.clone(),
                    self.bits.clone(),
                    self.config.relationships.clone(),
                ),
                tracker: self.tracker.clone(),
                session: handle.clone(),
            },
            self.config.crawler.concurrency,
            Duration::from_secs(self.config.crawler.fetch_timeout_secs),
            self.config.crawler.max_pages,
        ));

        for seed in &seed_urls {
            dispatcher.prepare_seed(seed).await?;
            match self.frontier.enqueue_seed(seed.as_str(), BASE_PRIORITY).await? {
                EnqueueOutcome::Enqueued { .. } => handle.tick(SessionEvent::Discovered),
                EnqueueOutcome::Duplicate => {
                    tracing::info!(url = %seed, "seed already in frontier")
                }
                other => tracing::warn!(url = %seed, outcome = ?other, "seed not admitted"),
            }
        }
        self.tracker.flush(&handle).await?;

        let (control, receiver) = watch::channel(RunState::Running);
        let id = handle.id().to_string();
        {
            let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.insert(
                id.clone(),
                ActiveSession {
                    control,
                    handle: handle.clone(),
                },
            );
        }

        let tracker = self.tracker.clone();
        let active = Arc::clone(&self.active);
        let task = tokio::spawn(async move {
            let outcome = dispatcher.run(receiver).await;
            active
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(handle.id());

            let status = match outcome {
                Ok(RunOutcome::Stopped) | Err(_) => SessionStatus::Stopped,
                Ok(RunOutcome::Drained | RunOutcome::PageLimit) => SessionStatus::Completed,
            };
            let finished = tracker.finish(&handle, status).await;
            match outcome {
                Ok(o) => {
                    let session = finished?;
                    tracing::info!(
                        session = %session.id,
                        outcome = ?o,
                        crawled = session.counters.crawled,
                        extracted = session.counters.extracted,
                        errors = session.counters.errors,
                        "session finished"
                    );
                    Ok(session)
                }
                Err(e) => {
                    tracing::error!(session = handle.id(), error = %e, "session aborted");
                    Err(e.context("crawl session aborted"))
                }
            }
        });

        Ok(SessionRun { id, task })
    }

    fn signal(&self, id: &str, state: RunState) -> bool {
        let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        match active.get(id) {
            Some(session) => {
                session.control.send_replace(state);
                true
            }
            None => false,
        }
    }

    pub async fn pause_session(&self, id: &str) -> Result<CrawlSession> {
        let session = self.tracker.pause(id).await?;
        self.signal(id, RunState::Paused);
        Ok(session)
    }

    pub async fn resume_session(&self, id: &str) -> Result<CrawlSession> {
        let session = self.tracker.resume(id).await?;
        self.signal(id, RunState::Running);
        Ok(session)
    }

    /// Stop a session. A session running in this process stops taking new
    /// work and finishes as `stopped` once in-flight fetches settle; any
    /// other unfinished session is marked stopped directly.
    pub async fn stop_session(&self, id: &str) -> Result<CrawlSession> {
        if self.signal(id, RunState::Stopping) {
            tracing::info!(session = id, "stop requested");
            return self.get_session_status(id).await;
        }
        let session = self
            .tracker
            .get(id)
            .await?
            .with_context(|| format!("session not found: {}", id))?;
        if session.status.is_finished() {
            return Ok(session);
        }
        self.tracker.set_status(id, SessionStatus::Stopped).await
    }

    /// Current record, with live counters for a session running here.
    pub async fn get_session_status(&self, id: &str) -> Result<CrawlSession> {
        let handle = {
            let active = self.active.lock().unwrap_or_else(|e| e.into_inner());
            active.get(id).map(|s| s.handle.clone())
        };
        if let Some(handle) = handle {
            self.tracker.flush(&handle).await?;
        }
        self.tracker
            .get(id)
            .await?
            .with_context(|| format!("session not found: {}", id))
    }

    pub async fn list_sessions(&self, limit: i64) -> Result<Vec<CrawlSession>> {
        self.tracker.list(limit).await
    }

    pub async fn query_learning_bits(&self, filters: &BitFilters) -> Result<Vec<LearningBit>> {
        self.bits.query(filters).await
    }

    pub async fn learning_bit_sources(&self, content_hash: &str) -> Result<Vec<String>> {
        self.bits.sources_for(content_hash).await
    }

    pub async fn get_page(&self, url: &str) -> Result<Option<Page>> {
        get_page(&self.pool, url).await
    }

    pub async fn relationships_for(&self, content_hash: &str) -> Result<Vec<Relationship>> {
        RelationshipBuilder::new(
            self.pool.clone(),
            self.bits.clone(),
            self.config.relationships.clone(),
        )
        .relationships_for(content_hash)
        .await
    }

    pub async fn frontier_entries(
        &self,
        status: Option<FrontierStatus>,
        limit: i64,
    ) -> Result<Vec<FrontierEntry>> {
        self.frontier.entries_by_status(status, limit).await
    }

    pub async fn frontier_counts(&self) -> Result<FrontierCounts> {
        self.frontier.counts().await
    }

    pub async fn close(self) {
        self.pool.close().await;
    }
}
