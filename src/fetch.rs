//! HTTP fetch capability.
//!
//! The crawl core only depends on the [`Fetcher`] trait; [`HttpFetcher`] is
//! the default `reqwest` implementation. Tests plug in in-memory fetchers.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use crate::config::CrawlerConfig;
use crate::error::CrawlError;

/// Bodies beyond this size are truncated.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// What a fetch returns when the transport succeeded (any status code).
#[derive(Debug, Clone)]
pub struct FetchResponse {
    pub status: u16,
    /// Lowercased header names.
    pub headers: BTreeMap<String, String>,
    pub body: String,
    pub elapsed_ms: u64,
}

impl FetchResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    pub fn content_type(&self) -> Option<&str> {
        self.headers.get("content-type").map(String::as_str)
    }
}

/// Given a URL, return status, headers, body and latency, or a transport error.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchResponse, CrawlError>;
}

pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(crawler: &CrawlerConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(&crawler.user_agent)
            .timeout(Duration::from_secs(crawler.fetch_timeout_secs))
            .connect_timeout(Duration::from_secs(10))
            .redirect(reqwest::redirect::Policy::limited(5))
            .build()?;
        Ok(Self { client })
    }
}

#[async_trait]
impl Fetcher for HttpFetcher {
    async fn fetch(&self, url: &str, timeout: Duration) -> Result<FetchResponse, CrawlError> {
        let started = Instant::now();
        let response = self
            .client
            .get(url)
            .timeout(timeout)
            .send()
            .await
            .map_err(|e| transport_error(url, timeout, e))?;

        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_ascii_lowercase(), v.to_string()))
            })
            .collect();

        let bytes = response
            .bytes()
            .await
            .map_err(|e| transport_error(url, timeout, e))?;
        let bytes = &bytes[..bytes.len().min(MAX_BODY_BYTES)];
        let body = String::from_utf8_lossy(bytes).into_owned();

        Ok(FetchResponse {
            status,
            headers,
            body,
            elapsed_ms: started.elapsed().as_millis() as u64,
        })
    }
}

fn transport_error(url: &str, timeout: Duration, e: reqwest::Error) -> CrawlError {
    if e.is_timeout() {
        CrawlError::Timeout {
            url: url.to_string(),
            secs: timeout.as_secs(),
        }
    } else {
        CrawlError::Transport {
            url: url.to_string(),
            message: e.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_range_and_content_type() {
        let mut headers = BTreeMap::new();
        headers.insert("content-type".to_string(), "text/html; charset=utf-8".to_string());
        let ok = FetchResponse {
            status: 204,
            headers,
            body: String::new(),
            elapsed_ms: 3,
        };
        assert!(ok.is_success());
        assert_eq!(ok.content_type(), Some("text/html; charset=utf-8"));

        let redirect = FetchResponse {
            status: 301,
            ..ok.clone()
        };
        assert!(!redirect.is_success());
    }

    #[test]
    fn test_http_fetcher_builds_from_defaults() {
        assert!(HttpFetcher::new(&CrawlerConfig::default()).is_ok());
    }
}
