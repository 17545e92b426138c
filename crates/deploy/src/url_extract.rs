//! Working out where a deployed worker is reachable.
//!
//! Strategies run in order and the first one producing a URL wins.

use regex::Regex;
use url::Url;

const URL_PATTERN: &str = r#"https?://[^\s'"<>()\[\]]+"#;
const ANNOUNCEMENT_PATTERN: &str = r"(?i)\b(published|deployed|available at)\b";
const URL_KEYWORDS: &[&str] = &["workers.dev", "https://"];

/// Inputs available after a deploy command finished.
#[derive(Debug, Clone, Copy)]
pub struct UrlSources<'a> {
    /// Buffered command output.
    pub output: &'a [String],
    /// Routes declared by the manifest.
    pub routes: &'a [String],
    pub worker: &'a str,
    pub environment: &'a str,
    pub subdomain: &'a str,
}

type Strategy = fn(&UrlSources<'_>) -> Option<String>;

const STRATEGIES: &[(&str, Strategy)] = &[
    ("announcement", from_announcement),
    ("route", from_first_route),
    ("default subdomain", from_default_subdomain),
    ("keyword scan", from_keywords),
];

/// The service URL, or `None` when no strategy found one.
///
/// Candidates that do not parse as an absolute URL with a host are passed over.
pub fn extract_url(sources: &UrlSources<'_>) -> Option<String> {
    STRATEGIES.iter().find_map(|(name, strategy)| {
        let url = strategy(sources)?;
        if !has_host(&url) {
            tracing::debug!(strategy = name, %url, "Ignoring malformed URL candidate");
            return None;
        }
        tracing::debug!(strategy = name, %url, "Service URL extracted");
        Some(url)
    })
}

fn has_host(candidate: &str) -> bool {
    Url::parse(candidate).is_ok_and(|url| url.host_str().is_some_and(|host| !host.is_empty()))
}

fn first_url(text: &str) -> Option<String> {
    let re = Regex::new(URL_PATTERN).ok()?;
    re.find(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
}

/// An `https` URL whose host names the default subdomain, the worker or the environment.
pub fn is_deployment_url(candidate: &str, sources: &UrlSources<'_>) -> bool {
    let Ok(url) = Url::parse(candidate) else {
        return false;
    };
    if url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str().map(str::to_ascii_lowercase) else {
        return false;
    };
    [sources.subdomain.trim_matches('.'), sources.worker, sources.environment]
        .iter()
        .filter(|token| !token.is_empty())
        .any(|token| host.contains(&token.to_ascii_lowercase()))
}

fn all_urls(text: &str) -> Vec<String> {
    let Ok(re) = Regex::new(URL_PATTERN) else {
        return Vec::new();
    };
    re.find_iter(text)
        .map(|m| m.as_str().trim_end_matches(['.', ',', ';', ':']).to_string())
        .collect()
}

/// The first deployment URL on or after a line announcing the deployment.
fn from_announcement(sources: &UrlSources<'_>) -> Option<String> {
    let announcement = Regex::new(ANNOUNCEMENT_PATTERN).ok()?;
    let start = sources
        .output
        .iter()
        .position(|line| announcement.is_match(line))?;
    sources.output[start..]
        .iter()
        .flat_map(|line| all_urls(line))
        .find(|url| {
            let plausible = is_deployment_url(url, sources);
            if !plausible {
                tracing::debug!(%url, "Skipping announced URL that does not name the deployment");
            }
            plausible
        })
}

fn from_first_route(sources: &UrlSources<'_>) -> Option<String> {
    let route = sources.routes.first()?;
    let host_path = route.trim_end_matches('*').trim_end_matches('/');
    if host_path.is_empty() || host_path.contains('*') {
        return None;
    }
    if host_path.starts_with("http://") || host_path.starts_with("https://") {
        Some(host_path.to_string())
    } else {
        Some(format!("https://{}", host_path))
    }
}

fn from_default_subdomain(sources: &UrlSources<'_>) -> Option<String> {
    let subdomain = sources.subdomain.trim_matches('.');
    if sources.worker.is_empty() || subdomain.is_empty() {
        return None;
    }
    Some(format!("https://{}.{}", sources.worker, subdomain))
}

fn from_keywords(sources: &UrlSources<'_>) -> Option<String> {
    URL_KEYWORDS.iter().find_map(|keyword| {
        sources
            .output
            .iter()
            .filter(|line| line.contains(keyword))
            .find_map(|line| first_url(line))
    })
}
