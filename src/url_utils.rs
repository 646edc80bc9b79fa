//! URL helpers shared by the frontier, domain policy, and pipeline.

use url::Url;

/// Parse and canonicalize a crawlable URL: http(s) only, fragment removed.
pub fn normalize_url(raw: &str) -> Option<Url> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;
    url.set_fragment(None);
    Some(url)
}

/// Lowercased host of a URL. Deterministic for a given URL.
pub fn domain_of(url: &Url) -> Option<String> {
    url.host_str().map(|h| h.to_ascii_lowercase())
}

/// Domain and path of a raw URL string.
pub fn split_url(raw: &str) -> Option<(String, String)> {
    let url = normalize_url(raw)?;
    let domain = domain_of(&url)?;
    Some((domain, url.path().to_string()))
}

pub fn resolve_link(link: &str, base: &Url) -> Option<Url> {
    let joined = base.join(link.trim()).ok()?;
    normalize_url(joined.as_str())
}

pub fn robots_url(url: &Url) -> Option<String> {
    let host = url.host_str()?;
    match url.port() {
        Some(port) => Some(format!("{}://{}:{}/robots.txt", url.scheme(), host, port)),
        None => Some(format!("{}://{}/robots.txt", url.scheme(), host)),
    }
}

/// Skip binaries and static assets that never carry learnable text.
pub fn looks_crawlable(url: &Url) -> bool {
    const SKIPPED_EXTENSIONS: &[&str] = &[
        ".pdf", ".jpg", ".jpeg", ".png", ".gif", ".svg", ".webp", ".ico", ".css", ".js",
        ".zip", ".mp4", ".mov", ".mp3", ".wav", ".tar", ".gz", ".tgz", ".7z", ".exe", ".dmg",
        ".iso", ".woff", ".woff2",
    ];
    let path = url.path().to_ascii_lowercase();
    !SKIPPED_EXTENSIONS.iter().any(|ext| path.ends_with(ext))
}
