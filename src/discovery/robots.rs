//! robots.txt cache.
//!
//! One robots.txt per origin (`scheme://host[:port]`) is fetched the first time the
//! origin is seen and kept for the rest of the run. A missing or unreachable
//! robots.txt allows everything. Rules are evaluated with the `robotstxt` matcher
//! using the configured agent token.

use robotstxt::DefaultMatcher;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument};
use url::Url;

use crate::fetcher::PageFetcher;
use crate::models::FetchOutcome;

/// Origin of a URL, e.g. `https://www.bbc.co.uk` or `http://127.0.0.1:8080`.
pub fn origin_of(url: &str) -> Option<String> {
    let parsed = Url::parse(url).ok()?;
    parsed.host_str()?;
    Some(parsed.origin().ascii_serialization())
}

#[derive(Debug)]
pub struct RobotsCache {
    fetcher: Arc<dyn PageFetcher>,
    agent: String,
    /// One cell per origin, filled by the first caller. `None` means no usable
    /// robots.txt: allow all.
    entries: Mutex<HashMap<String, Arc<OnceCell<Option<String>>>>>,
}

impl RobotsCache {
    pub fn new(fetcher: Arc<dyn PageFetcher>, agent: impl Into<String>) -> Self {
        Self {
            fetcher,
            agent: agent.into(),
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn cell(&self, origin: &str) -> Arc<OnceCell<Option<String>>> {
        let mut entries = self.entries.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(entries.entry(origin.to_string()).or_default())
    }

    /// robots.txt body for `origin`, fetched at most once per run.
    async fn body(&self, origin: &str) -> Option<String> {
        self.cell(origin)
            .get_or_init(|| async {
                let robots_url = format!("{origin}/robots.txt");
                match self.fetcher.fetch(&robots_url).await {
                    FetchOutcome::Success(doc) => Some(doc.body),
                    other => {
                        debug!(%robots_url, outcome = other.label(), "No usable robots.txt, allowing all");
                        None
                    }
                }
            })
            .await
            .clone()
    }

    /// Fetch robots.txt for `origin` unless it is already cached.
    #[instrument(level = "debug", skip(self))]
    pub async fn prefetch(&self, origin: &str) {
        self.body(origin).await;
    }

    /// Whether the configured agent may fetch `url`.
    pub async fn is_allowed(&self, url: &str) -> bool {
        let Some(origin) = origin_of(url) else {
            return false;
        };
        let Some(body) = self.body(&origin).await else {
            return true;
        };
        let mut matcher = DefaultMatcher::default();
        let allowed = matcher.one_agent_allowed_by_robots(&body, &self.agent, url);
        if !allowed {
            info!(%url, agent = %self.agent, "Disallowed by robots.txt");
        }
        allowed
    }

    /// `Sitemap:` declarations in the robots.txt of `origin`.
    pub async fn sitemaps(&self, origin: &str) -> Vec<String> {
        self.body(origin).await.map(|body| sitemap_lines(&body)).unwrap_or_default()
    }
}

fn sitemap_lines(body: &str) -> Vec<String> {
    body.lines()
        .filter_map(|line| {
            let (key, value) = line.split_once(':')?;
            if key.trim().eq_ignore_ascii_case("sitemap") {
                let value = value.trim();
                (!value.is_empty()).then(|| value.to_string())
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fetcher::testing::{FakeResponse, FakeWeb};

    const ROBOTS: &str = "User-agent: *\nDisallow: /private/\n\nSitemap: https://news.example/sitemap.xml\nsitemap: https://news.example/news-sitemap.xml\n";

    #[test]
    fn test_origin_of() {
        assert_eq!(origin_of("https://news.example/a/b?c=1").as_deref(), Some("https://news.example"));
        assert_eq!(origin_of("http://127.0.0.1:8080/x").as_deref(), Some("http://127.0.0.1:8080"));
        assert!(origin_of("not a url").is_none());
    }

    #[test]
    fn test_sitemap_lines_case_insensitive() {
        assert_eq!(
            sitemap_lines(ROBOTS),
            vec![
                "https://news.example/sitemap.xml".to_string(),
                "https://news.example/news-sitemap.xml".to_string()
            ]
        );
    }

    #[tokio::test]
    async fn test_disallowed_path_is_rejected() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://news.example/robots.txt", FakeResponse::html(ROBOTS));
        let cache = RobotsCache::new(web.clone(), "Mozilla");

        assert!(cache.is_allowed("https://news.example/news/story").await);
        assert!(!cache.is_allowed("https://news.example/private/story").await);
        assert_eq!(web.hits("https://news.example/robots.txt"), 1);
    }

    #[tokio::test]
    async fn test_concurrent_checks_fetch_robots_once() {
        let web = Arc::new(FakeWeb::with_latency(std::time::Duration::from_millis(50)));
        web.route("https://news.example/robots.txt", FakeResponse::html(ROBOTS));
        let cache = Arc::new(RobotsCache::new(web.clone(), "Mozilla"));

        let checks = (0..8).map(|i| {
            let cache = Arc::clone(&cache);
            tokio::spawn(async move { cache.is_allowed(&format!("https://news.example/news/{i}")).await })
        });
        for check in futures::future::join_all(checks).await {
            assert!(check.unwrap());
        }
        assert_eq!(web.hits("https://news.example/robots.txt"), 1);
    }

    #[tokio::test]
    async fn test_missing_robots_allows_everything() {
        let web = Arc::new(FakeWeb::new());
        let cache = RobotsCache::new(web.clone(), "Mozilla");
        assert!(cache.is_allowed("https://open.example/private/story").await);
        assert!(cache.sitemaps("https://open.example").await.is_empty());
    }

    #[tokio::test]
    async fn test_unreachable_robots_allows_everything() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://down.example/robots.txt", FakeResponse::status(503));
        let cache = RobotsCache::new(web, "Mozilla");
        assert!(cache.is_allowed("https://down.example/anything").await);
    }
}
