//! Read-only CLI commands over the crawl database.
//!
//! Each `run_*` function backs one `crawl` subcommand and prints to stdout.
//! `--json` output is one pretty-printed JSON document so scripts can pipe
//! it straight into `jq`.

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};

use crate::crawler::Crawler;
use crate::models::{BitFilters, CrawlSession, FrontierStatus};

fn format_ts(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
    if flat.chars().count() <= max_chars {
        return flat;
    }
    let cut: String = flat.chars().take(max_chars).collect();
    format!("{}…", cut)
}

pub fn print_session(session: &CrawlSession) {
    println!("--- Session ---");
    println!("id:            {}", session.id);
    println!("name:          {}", session.name);
    println!("status:        {}", session.status);
    println!("started_at:    {}", format_ts(session.started_at));
    if let Some(ended) = session.ended_at {
        println!("ended_at:      {}", format_ts(ended));
    }
    println!("discovered:    {}", session.counters.discovered);
    println!("crawled:       {}", session.counters.crawled);
    println!("extracted:     {}", session.counters.extracted);
    println!("relationships: {}", session.counters.relationships);
    println!("errors:        {}", session.counters.errors);
}

pub async fn run_status(crawler: &Crawler, id: &str, json: bool) -> Result<()> {
    let session = crawler.get_session_status(id).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&session)?);
    } else {
        print_session(&session);
    }
    Ok(())
}

pub async fn run_sessions(crawler: &Crawler, limit: i64) -> Result<()> {
    let sessions = crawler.list_sessions(limit).await?;
    if sessions.is_empty() {
        println!("No sessions.");
        return Ok(());
    }
    println!(
        "{:<36}  {:<10}  {:<20}  {:>8}  {:>9}  {:>6}  NAME",
        "ID", "STATUS", "STARTED", "CRAWLED", "EXTRACTED", "ERRORS"
    );
    for s in &sessions {
        println!(
            "{:<36}  {:<10}  {:<20}  {:>8}  {:>9}  {:>6}  {}",
            s.id,
            s.status.as_str(),
            format_ts(s.started_at),
            s.counters.crawled,
            s.counters.extracted,
            s.counters.errors,
            s.name
        );
    }
    Ok(())
}

pub async fn run_bits(crawler: &Crawler, filters: &BitFilters, json: bool) -> Result<()> {
    if let Some(min) = filters.min_importance {
        if !(0.0..=1.0).contains(&min) {
            bail!("--min-importance must be in [0.0, 1.0]");
        }
    }
    let bits = crawler.query_learning_bits(filters).await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&bits)?);
        return Ok(());
    }
    if bits.is_empty() {
        println!("No learning bits.");
        return Ok(());
    }
    for bit in &bits {
        let topic = match bit.subcategory {
            Some(ref sub) => format!("{}/{}", bit.category, sub),
            None => bit.category.clone(),
        };
        println!(
            "{:.2}  {:<10} {}  (refs {}, {})",
            bit.importance,
            bit.content_type.as_str(),
            topic,
            bit.reference_count,
            &bit.content_hash[..12.min(bit.content_hash.len())]
        );
        println!("    {}", excerpt(&bit.body, 100));
    }
    Ok(())
}

pub async fn run_page(crawler: &Crawler, url: &str, json: bool) -> Result<()> {
    let Some(page) = crawler.get_page(url).await? else {
        bail!("page not found: {}", url);
    };
    if json {
        println!("{}", serde_json::to_string_pretty(&page)?);
        return Ok(());
    }
    println!("--- Page ---");
    println!("url:          {}", page.url);
    println!("title:        {}", page.title.as_deref().unwrap_or("(untitled)"));
    println!("status:       {}", page.status_code);
    println!("depth:        {}", page.depth);
    if let Some(ref parent) = page.parent_url {
        println!("parent:       {}", parent);
    }
    println!("latency_ms:   {}", page.latency_ms);
    println!("first_crawl:  {}", format_ts(page.first_crawled_at));
    println!("last_crawl:   {}", format_ts(page.last_crawled_at));
    println!();
    println!("--- Text ---");
    println!("{}", page.text);
    Ok(())
}

pub async fn run_frontier(
    crawler: &Crawler,
    status: Option<FrontierStatus>,
    limit: i64,
) -> Result<()> {
    let counts = crawler.frontier_counts().await?;
    println!(
        "pending {}  in_progress {}  completed {}  failed {}  skipped {}",
        counts.pending, counts.in_progress, counts.completed, counts.failed, counts.skipped
    );
    println!();
    for entry in crawler.frontier_entries(status, limit).await? {
        print!(
            "[{:>2}] {:<11} d{} r{}/{}  {}",
            entry.priority,
            entry.status.as_str(),
            entry.depth,
            entry.retry_count,
            entry.retry_ceiling,
            entry.url
        );
        match entry.last_error {
            Some(ref err) => println!("  ({})", err),
            None => println!(),
        }
    }
    Ok(())
}

pub async fn run_related(crawler: &Crawler, content_hash: &str) -> Result<()> {
    let edges = crawler.relationships_for(content_hash).await?;
    if edges.is_empty() {
        println!("No relationships for {}", content_hash);
        return Ok(());
    }
    for edge in &edges {
        let arrow = if edge.bidirectional { "<->" } else { "->" };
        println!(
            "{} {} {}  {:<12} {:.2}",
            edge.source_hash, arrow, edge.target_hash, edge.relationship_type.as_str(), edge.strength
        );
    }
    Ok(())
}
