//! Discovery: which documents to read and what article URLs they list.
//!
//! The discovery pass:
//! 1. **Plan**: each source's configured feeds and sitemaps, plus (when the source
//!    enables `discover`) `Sitemap:` lines from its robots.txt and feed `<link>`
//!    tags on its homepage
//! 2. **Read**: every document concurrently through the [`reader`], nested sitemap
//!    failures isolated per document
//! 3. **Aggregate/admit**: see [`aggregator`]

pub mod aggregator;
pub mod reader;
pub mod robots;

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use scraper::{Html, Selector};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use url::Url;

use crate::config::{PipelineConfig, SourceConfig};
use crate::fetcher::PageFetcher;
use crate::models::{CandidateUrl, DocumentKind, DocumentRef, FetchOutcome};
use reader::DocumentReader;
use robots::{RobotsCache, origin_of};

const FEED_TYPES: &[&str] = &["application/rss+xml", "application/atom+xml"];

/// Feed URLs advertised by `<link rel="alternate">` tags in a homepage.
fn feed_links(base: &str, body: &str) -> Vec<String> {
    let Ok(base) = Url::parse(base) else {
        return Vec::new();
    };
    let selector = Selector::parse(r#"link[rel="alternate"][href]"#).expect("static selector");
    let html = Html::parse_document(body);
    html.select(&selector)
        .filter(|el| {
            el.value()
                .attr("type")
                .is_some_and(|t| FEED_TYPES.contains(&t.trim().to_ascii_lowercase().as_str()))
        })
        .filter_map(|el| el.value().attr("href"))
        .filter_map(|href| base.join(href.trim()).ok())
        .map(|u| u.to_string())
        .collect()
}

/// Documents found by looking at a source's robots.txt and homepage.
#[instrument(level = "info", skip_all, fields(site = %source.site))]
async fn autodiscover(source: &SourceConfig, fetcher: &dyn PageFetcher, robots: &RobotsCache) -> Vec<DocumentRef> {
    let Some(homepage) = source.homepage.as_deref() else {
        warn!("discover is enabled but no homepage is configured");
        return Vec::new();
    };
    let mut found = Vec::new();

    if let Some(origin) = origin_of(homepage) {
        for sitemap in robots.sitemaps(&origin).await {
            found.push(DocumentRef::new(sitemap, DocumentKind::Sitemap, source.site.clone()));
        }
    }

    match fetcher.fetch(homepage).await {
        FetchOutcome::Success(page) => {
            for feed in feed_links(&page.final_url, &page.body) {
                found.push(DocumentRef::new(feed, DocumentKind::Feed, source.site.clone()));
            }
        }
        other => warn!(%homepage, outcome = other.label(), "Homepage unavailable for feed discovery"),
    }

    info!(count = found.len(), "Autodiscovered documents");
    found
}

/// Every discovery document for this run, unique by URL.
pub async fn plan_documents(config: &PipelineConfig, fetcher: &dyn PageFetcher, robots: &RobotsCache) -> Vec<DocumentRef> {
    let mut documents = Vec::new();
    for source in &config.sources {
        documents.extend(source.documents());
        if source.discover {
            documents.extend(autodiscover(source, fetcher, robots).await);
        }
    }
    documents.into_iter().unique_by(|d| d.url.clone()).collect()
}

/// What the read step produced.
#[derive(Debug, Default)]
pub struct Discovery {
    /// One batch of candidates per top-level document.
    pub batches: Vec<Vec<CandidateUrl>>,
    pub documents_read: usize,
    pub documents_failed: usize,
}

impl Discovery {
    pub fn candidate_count(&self) -> usize {
        self.batches.iter().map(Vec::len).sum()
    }
}

/// Read all documents, at most `concurrency` at a time.
#[instrument(level = "info", skip_all, fields(documents = documents.len()))]
pub async fn read_all(reader: Arc<DocumentReader>, documents: Vec<DocumentRef>, concurrency: usize) -> Discovery {
    let results: Vec<_> = stream::iter(documents)
        .map(|doc| {
            let reader = Arc::clone(&reader);
            async move {
                let result = reader.read(&doc).await;
                (doc, result)
            }
        })
        .buffer_unordered(concurrency.max(1))
        .collect()
        .await;

    let mut discovery = Discovery::default();
    for (doc, result) in results {
        match result {
            Ok(report) => {
                discovery.documents_read += 1;
                discovery.documents_failed += report.failures.len();
                discovery.batches.push(report.candidates);
            }
            Err(e) => {
                warn!(url = %doc.url, kind = %doc.kind, error = %e, "Discovery document skipped");
                discovery.documents_failed += 1;
            }
        }
    }
    info!(
        read = discovery.documents_read,
        failed = discovery.documents_failed,
        candidates = discovery.candidate_count(),
        "Discovery finished"
    );
    discovery
}
