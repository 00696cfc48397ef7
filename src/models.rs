//! Data models passed between pipeline stages.
//!
//! This module defines the values that flow left to right through the pipeline:
//! - [`DocumentRef`]: a feed or sitemap to read
//! - [`CandidateUrl`]: an article URL discovered but not yet fetched
//! - [`FetchTask`]: an admitted candidate waiting for, or holding, a fetch slot
//! - [`FetchOutcome`] / [`RawDocument`]: the classified result of one fetch
//! - [`ArticleRecord`]: the canonical record keyed by normalized URL
//! - [`PersistResult`]: the terminal outcome of the pipeline for one URL
//!
//! Every value is owned by exactly one stage at a time. Stages hand values over by
//! moving them through channels, never by sharing them.

use crate::error::{PermanentReason, StorageError, TransientReason};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use tokio::time::Instant;

/// Declared kind of a discovery document.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DocumentKind {
    /// RSS 2.0 or Atom syndication feed.
    Feed,
    /// `<sitemapindex>` pointing at further sitemaps.
    SitemapIndex,
    /// `<urlset>` listing page URLs.
    Sitemap,
}

impl fmt::Display for DocumentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DocumentKind::Feed => write!(f, "feed"),
            DocumentKind::SitemapIndex => write!(f, "sitemap_index"),
            DocumentKind::Sitemap => write!(f, "sitemap"),
        }
    }
}

/// Location of one discovery document plus its declared kind.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DocumentRef {
    pub url: String,
    pub kind: DocumentKind,
    pub source_site: String,
    /// Sitemap recursion level; top-level documents are at depth 0.
    pub depth: usize,
}

impl DocumentRef {
    pub fn new(url: impl Into<String>, kind: DocumentKind, source_site: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind,
            source_site: source_site.into(),
            depth: 0,
        }
    }

    /// A nested sitemap referenced from this index.
    pub fn child(&self, url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            kind: DocumentKind::Sitemap,
            source_site: self.source_site.clone(),
            depth: self.depth + 1,
        }
    }
}

/// An article URL discovered by the Reader.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateUrl {
    /// Normalized URL; the article's identity.
    pub url: String,
    pub source_site: String,
    pub discovered_at: DateTime<Utc>,
    pub hint_title: Option<String>,
    pub hint_date: Option<DateTime<Utc>>,
}

/// An admitted candidate travelling through the rate limiter and fetch workers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchTask {
    pub url: String,
    pub source_site: String,
    /// Number of retries already spent; never exceeds the configured maximum.
    pub attempt: u32,
    /// Earliest moment the task may be handed to the limiter again.
    pub not_before: Instant,
    pub hint_date: Option<DateTime<Utc>>,
}

impl FetchTask {
    pub fn from_candidate(candidate: CandidateUrl) -> Self {
        Self {
            url: candidate.url,
            source_site: candidate.source_site,
            attempt: 0,
            not_before: Instant::now(),
            hint_date: candidate.hint_date,
        }
    }

    /// Rate-limiting key: the host of the task URL.
    pub fn domain(&self) -> String {
        domain_of(&self.url)
    }
}

/// Host part of a URL, used as the per-publisher rate limiting key.
pub fn domain_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(|h| h.to_string()))
        .unwrap_or_default()
}

/// A successfully fetched response body.
#[derive(Debug, Clone)]
pub struct RawDocument {
    /// URL that was requested.
    pub url: String,
    /// URL after redirects.
    pub final_url: String,
    pub status: u16,
    pub content_type: Option<String>,
    pub body: String,
    pub elapsed: Duration,
}

impl RawDocument {
    /// Whether the response declares (or defaults to) an HTML body.
    pub fn is_html(&self) -> bool {
        match &self.content_type {
            None => true,
            Some(ct) => {
                let ct = ct.to_ascii_lowercase();
                ct.contains("html") || ct.starts_with("text/plain")
            }
        }
    }
}

/// Classified result of one fetch.
#[derive(Debug, Clone)]
pub enum FetchOutcome {
    Success(RawDocument),
    TransientFailure(TransientReason),
    PermanentFailure(PermanentReason),
}

impl FetchOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            FetchOutcome::Success(_) => "success",
            FetchOutcome::TransientFailure(_) => "transient_failure",
            FetchOutcome::PermanentFailure(_) => "permanent_failure",
        }
    }
}

/// The canonical, deduplicated representation of one article.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArticleRecord {
    /// Normalized URL; unique key in the store.
    pub url: String,
    pub title: String,
    pub publication_date: Option<DateTime<Utc>>,
    pub summary: Option<String>,
    pub source_site: String,
    pub extracted_at: DateTime<Utc>,
}

/// Terminal outcome of persisting one article record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PersistResult {
    Inserted,
    DuplicateIgnored,
    StorageError(StorageError),
}
