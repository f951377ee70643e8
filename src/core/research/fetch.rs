//! Polite page fetching: url normalisation, private-target refusal,
//! robots.txt honouring, per-domain backoff and one-at-a-time domain
//! gating, page caching, and heuristic visible-text extraction.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use reqwest::Client;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::core::cache::{ArtifactCache, Purpose};
use crate::core::limiter::{FetchDecision, Limiter};
use crate::core::signal::{CancelSignal, Deadline};
use crate::error::{EngineError, Result};

const USER_AGENT: &str = "Mozilla/5.0 (compatible; crewd-research/0.4)";

#[derive(Debug, Clone)]
pub struct FetchedPage {
    pub url: String,
    pub text: String,
}

/// Fetch boundary so the research pipeline can run against a stub in tests.
#[async_trait]
pub trait Fetcher: Send + Sync {
    async fn fetch_clean(
        &self,
        url: &str,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<FetchedPage>;
}

pub struct PageFetcher {
    client: Client,
    limiter: Arc<Limiter>,
    cache: Arc<ArtifactCache>,
    timeout: Duration,
    char_cap: usize,
}

impl PageFetcher {
    pub fn new(
        limiter: Arc<Limiter>,
        cache: Arc<ArtifactCache>,
        timeout: Duration,
        char_cap: usize,
    ) -> Self {
        Self {
            client: Client::new(),
            limiter,
            cache,
            timeout,
            char_cap,
        }
    }

    async fn robots_allows(
        &self,
        scheme_host: &str,
        domain: &str,
        path: &str,
        deadline: Deadline,
    ) -> bool {
        let robots_url = format!("{scheme_host}/robots.txt");
        let cache_key = format!("robots:{domain}");
        let body = match self.cache.get(Purpose::Page, &cache_key).await {
            Some(cached) => cached,
            None => {
                let fetched = self
                    .client
                    .get(&robots_url)
                    .timeout(deadline.clamp(self.timeout))
                    .header("User-Agent", USER_AGENT)
                    .send()
                    .await;
                let body = match fetched {
                    Ok(resp) if resp.status().is_success() => {
                        resp.text().await.unwrap_or_default()
                    }
                    // No readable robots file means no restrictions.
                    _ => String::new(),
                };
                self.cache
                    .put_with_ttl(
                        Purpose::Page,
                        &cache_key,
                        body.clone(),
                        Duration::from_secs(86_400),
                    )
                    .await;
                body
            }
        };
        robots_txt_allows(&body, path)
    }
}

#[async_trait]
impl Fetcher for PageFetcher {
    async fn fetch_clean(
        &self,
        url: &str,
        cancel: &CancelSignal,
        deadline: Deadline,
    ) -> Result<FetchedPage> {
        cancel.check()?;
        deadline.check()?;

        let normalized = normalize_url(url)
            .ok_or_else(|| EngineError::BadRequest(format!("unfetchable url: {url}")))?;
        let domain = domain_of(&normalized)
            .ok_or_else(|| EngineError::BadRequest(format!("no host in url: {url}")))?;
        check_private_target(&domain)?;

        if let Some(cached) = self.cache.get(Purpose::Page, &normalized).await {
            debug!(url = %normalized, "page cache hit");
            return Ok(FetchedPage {
                url: normalized,
                text: cached,
            });
        }

        match self.limiter.can_fetch(&domain).await {
            FetchDecision::Allowed => {}
            FetchDecision::RetryAfter(retry_after) => {
                return Err(EngineError::Throttled { retry_after });
            }
        }

        // One fetch per domain at a time, so backoff state settles.
        let gate = self.limiter.domain_slot(&domain).await;
        let _slot = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            permit = gate.acquire_owned() => {
                permit.map_err(|_| EngineError::Internal("domain gate closed".into()))?
            }
        };

        let scheme_host = scheme_host_of(&normalized)
            .ok_or_else(|| EngineError::BadRequest(format!("no scheme in url: {url}")))?;
        let path = normalized
            .strip_prefix(&scheme_host)
            .unwrap_or("/")
            .to_string();
        if !self.robots_allows(&scheme_host, &domain, &path, deadline).await {
            self.limiter.block_domain(&domain).await;
            return Err(EngineError::BadRequest(format!(
                "robots.txt disallows {normalized}"
            )));
        }

        let request = self
            .client
            .get(&normalized)
            .timeout(deadline.clamp(self.timeout))
            .header("User-Agent", USER_AGENT);

        let outcome = tokio::select! {
            _ = cancel.cancelled() => return Err(EngineError::Cancelled),
            resp = request.send() => resp,
        };

        let response = match outcome {
            Ok(r) => r,
            Err(e) => {
                let reason = if e.is_timeout() { "timeout" } else { "network" };
                self.limiter.record_fetch_failure(&domain, reason).await;
                warn!(url = %normalized, "fetch failed: {e}");
                return Err(if e.is_timeout() {
                    EngineError::Timeout
                } else {
                    EngineError::Provider(format!("fetch failed: {e}"))
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            self.limiter
                .record_fetch_failure(&domain, status.as_str())
                .await;
            return Err(EngineError::Provider(format!("fetch {status}")));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                self.limiter.record_fetch_failure(&domain, "body read").await;
                return Err(EngineError::Provider(format!("body read failed: {e}")));
            }
        };

        self.limiter.record_fetch_success(&domain).await;
        let mut text = extract_visible_text(&body);
        if text.len() > self.char_cap {
            text.truncate(floor_char_boundary(&text, self.char_cap));
        }
        self.cache.put(Purpose::Page, &normalized, text.clone()).await;
        Ok(FetchedPage {
            url: normalized,
            text,
        })
    }
}

fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
    while idx > 0 && !s.is_char_boundary(idx) {
        idx -= 1;
    }
    idx
}

/// Canonical form used for dedup and caching: scheme + host + path, query
/// and fragment (tracking params included) stripped, trailing slash
/// trimmed off non-root paths.
pub fn normalize_url(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    if scheme != "http" && scheme != "https" {
        return None;
    }
    let rest = rest.split(['?', '#']).next().unwrap_or(rest);
    let (host, path) = match rest.split_once('/') {
        Some((h, p)) => (h, format!("/{p}")),
        None => (rest, "/".to_string()),
    };
    if host.is_empty() {
        return None;
    }
    let path = if path.len() > 1 {
        path.trim_end_matches('/').to_string()
    } else {
        path
    };
    Some(format!("{scheme}://{}{path}", host.to_lowercase()))
}

/// Host with any port stripped.
pub fn domain_of(url: &str) -> Option<String> {
    let rest = url.split_once("://")?.1;
    let host_port = rest.split('/').next()?;
    let host = if host_port.starts_with('[') {
        host_port.split(']').next().map(|h| format!("{h}]"))?
    } else {
        host_port.split(':').next()?.to_string()
    };
    if host.is_empty() { None } else { Some(host) }
}

fn scheme_host_of(url: &str) -> Option<String> {
    let (scheme, rest) = url.split_once("://")?;
    let host = rest.split('/').next()?;
    Some(format!("{scheme}://{host}"))
}

/// Refuse loopback, unspecified, link-local, and private-range targets
/// before any network I/O happens.
fn check_private_target(domain: &str) -> Result<()> {
    let bare = domain.trim_start_matches('[').trim_end_matches(']');
    if matches!(bare, "localhost" | "ip6-localhost" | "metadata.google.internal") {
        return Err(EngineError::BadRequest(format!(
            "refusing to fetch private target {domain}"
        )));
    }
    if let Ok(ip) = bare.parse::<IpAddr>() {
        let private = match ip {
            IpAddr::V4(v4) => {
                v4.is_loopback()
                    || v4.is_unspecified()
                    || v4.is_private()
                    || v4.is_link_local()
            }
            IpAddr::V6(v6) => v6.is_loopback() || v6.is_unspecified(),
        };
        if private {
            return Err(EngineError::BadRequest(format!(
                "refusing to fetch private address {domain}"
            )));
        }
    }
    Ok(())
}

/// Case-insensitive substring search returning a byte offset in `haystack`.
/// `needle` must be ASCII.
fn find_ci(haystack: &str, needle: &str) -> Option<usize> {
    let needle = needle.as_bytes();
    haystack
        .as_bytes()
        .windows(needle.len())
        .position(|w| w.eq_ignore_ascii_case(needle))
}

/// Minimal robots.txt evaluation for `User-agent: *` groups: the path is
/// allowed unless a matching Disallow prefix applies.
pub fn robots_txt_allows(robots: &str, path: &str) -> bool {
    let mut in_star_group = false;
    let mut disallowed = false;
    for line in robots.lines() {
        let line = line.split('#').next().unwrap_or("").trim();
        if line.is_empty() {
            continue;
        }
        let Some((field, value)) = line.split_once(':') else {
            continue;
        };
        let field = field.trim().to_ascii_lowercase();
        let value = value.trim();
        match field.as_str() {
            "user-agent" => in_star_group = value == "*",
            "disallow" if in_star_group => {
                if !value.is_empty() && path.starts_with(value) {
                    disallowed = true;
                }
            }
            "allow" if in_star_group => {
                if !value.is_empty() && path.starts_with(value) {
                    return true;
                }
            }
            _ => {}
        }
    }
    !disallowed
}

/// Strip markup down to visible text: script/style/nav/header/footer
/// subtrees dropped, tags removed, entities unescaped, whitespace
/// collapsed.
pub fn extract_visible_text(html: &str) -> String {
    let mut out = String::with_capacity(html.len() / 4);
    let mut rest = html;
    let skip_tags = ["script", "style", "nav", "header", "footer", "noscript"];

    'outer: while let Some(open) = rest.find('<') {
        out.push_str(&rest[..open]);
        rest = &rest[open..];

        let head: String = rest.chars().take(12).collect::<String>().to_lowercase();
        for tag in skip_tags {
            if head.starts_with(&format!("<{tag}")) {
                match find_ci(rest, &format!("</{tag}")) {
                    Some(end) => {
                        let after = rest[end..].find('>').map(|i| end + i + 1).unwrap_or(rest.len());
                        rest = &rest[after..];
                    }
                    None => rest = "",
                }
                continue 'outer;
            }
        }

        match rest.find('>') {
            Some(end) => {
                // Block-level boundaries become whitespace so words don't fuse.
                out.push(' ');
                rest = &rest[end + 1..];
            }
            None => break,
        }
    }
    out.push_str(rest);

    let unescaped = out
        .replace("&nbsp;", " ")
        .replace("&amp;", "&")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'");

    unescaped.split_whitespace().collect::<Vec<_>>().join(" ")
}
