//! Feed and sitemap reader.
//!
//! Turns one discovery document into candidate article URLs:
//!
//! | Root element | Entries | Link | Title | Date |
//! |--------------|---------|------|-------|------|
//! | `<rss>` / `<rdf:RDF>` | `<item>` | `<link>` | `<title>` | `<pubDate>`, `<dc:date>` |
//! | `<feed>` (Atom) | `<entry>` | `<link href>` | `<title>` | `<published>`, `<updated>` |
//! | `<urlset>` | `<url>` | `<loc>` | `<news:title>` | `<news:publication_date>`, `<lastmod>` |
//! | `<sitemapindex>` | `<sitemap>` | `<loc>` | | |
//!
//! The root element decides how a document is read, whatever kind it was declared
//! as. Sitemap indexes are followed recursively up to the configured depth; a
//! failing nested sitemap is reported but never aborts its siblings.

use chrono::Utc;
use futures::future::BoxFuture;
use once_cell::sync::Lazy;
use quick_xml::Reader;
use quick_xml::escape::{resolve_predefined_entity, unescape};
use quick_xml::events::{BytesStart, Event};
use regex::Regex;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::ReadError;
use crate::fetcher::PageFetcher;
use crate::models::{CandidateUrl, DocumentKind, DocumentRef, FetchOutcome};
use crate::normalize::resolve_and_normalize;
use crate::utils::parse_published;

const NEWS_PATTERNS: &[&str] = &[
    "/news/",
    "/article/",
    "/story/",
    "/post/",
    "/blog/",
    "/press-release/",
    "/announcement/",
    "/update/",
];

const EXCLUDED_PATTERNS: &[&str] = &[
    "/category/",
    "/tag/",
    "/author/",
    "/search/",
    "/page/",
    "/contact/",
    "/about/",
    "/privacy/",
    "/terms/",
];

const EXCLUDED_EXTENSIONS: &[&str] = &[".pdf", ".jpg", ".jpeg", ".png", ".gif", ".css", ".js"];

static YEAR_SEGMENT: Lazy<Regex> = Lazy::new(|| Regex::new(r"/20\d{2}/").expect("static regex"));

/// Whether a sitemap URL looks like an individual article rather than a section,
/// tag listing or static asset.
pub fn looks_like_news_url(url: &str) -> bool {
    let lower = url.to_ascii_lowercase();
    if EXCLUDED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return false;
    }
    let path = lower.split(['?', '#']).next().unwrap_or(&lower);
    if EXCLUDED_EXTENSIONS.iter().any(|ext| path.ends_with(ext)) {
        return false;
    }
    NEWS_PATTERNS.iter().any(|p| lower.contains(p)) || YEAR_SEGMENT.is_match(&lower)
}

/// Result of reading one document, including any nested sitemaps.
#[derive(Debug, Default)]
pub struct ReadReport {
    pub candidates: Vec<CandidateUrl>,
    /// Nested documents that could not be read, with their URL.
    pub failures: Vec<(String, ReadError)>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Root {
    Feed,
    UrlSet,
    Index,
}

#[derive(Debug, Default, Clone, PartialEq)]
struct Entry {
    link: Option<String>,
    title: Option<String>,
    date: Option<String>,
    fallback_date: Option<String>,
}

#[derive(Debug, PartialEq)]
struct Parsed {
    root: Root,
    entries: Vec<Entry>,
}

const ENTRY_TAGS: &[&str] = &["item", "entry", "url", "sitemap"];

fn local_name(raw: &[u8]) -> String {
    String::from_utf8_lossy(raw).into_owned()
}

fn root_of(name: &str) -> Result<Root, ReadError> {
    match name {
        "rss" | "feed" | "RDF" => Ok(Root::Feed),
        "urlset" => Ok(Root::UrlSet),
        "sitemapindex" => Ok(Root::Index),
        other => Err(ReadError::Malformed(format!("unrecognised root element <{other}>"))),
    }
}

fn attr_value(e: &BytesStart<'_>, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|attr| {
        if attr.key.local_name().as_ref() != name.as_bytes() {
            return None;
        }
        let raw = String::from_utf8_lossy(&attr.value).into_owned();
        Some(unescape(&raw).map(|v| v.into_owned()).unwrap_or(raw))
    })
}

/// Atom `<link>`: only `rel="alternate"` or no `rel` points at the article.
fn atom_link(e: &BytesStart<'_>) -> Option<String> {
    let rel = attr_value(e, "rel");
    if rel.as_deref().is_some_and(|r| r != "alternate") {
        return None;
    }
    attr_value(e, "href").filter(|h| !h.trim().is_empty())
}

fn malformed(e: impl std::fmt::Display) -> ReadError {
    ReadError::Malformed(e.to_string())
}

/// Parse a feed or sitemap body into its entries.
fn parse_document(body: &str) -> Result<Parsed, ReadError> {
    let mut reader = Reader::from_str(body);
    let mut root: Option<Root> = None;
    let mut depth = 0usize;
    let mut entries = Vec::new();
    let mut current: Option<Entry> = None;
    let mut entry_depth = 0usize;
    let mut text = String::new();

    loop {
        match reader.read_event().map_err(malformed)? {
            Event::Start(e) => {
                let name = local_name(e.local_name().as_ref());
                if root.is_none() {
                    root = Some(root_of(&name)?);
                }
                depth += 1;
                text.clear();
                if current.is_none() && ENTRY_TAGS.contains(&name.as_str()) {
                    current = Some(Entry::default());
                    entry_depth = depth;
                } else if name == "link" {
                    if let Some(entry) = current.as_mut().filter(|en| en.link.is_none()) {
                        entry.link = atom_link(&e);
                    }
                }
            }
            Event::Empty(e) => {
                let name = local_name(e.local_name().as_ref());
                if root.is_none() {
                    root = Some(root_of(&name)?);
                    break;
                }
                if name == "link" {
                    if let Some(entry) = current.as_mut().filter(|en| en.link.is_none()) {
                        entry.link = atom_link(&e);
                    }
                }
            }
            Event::Text(t) => text.push_str(&t.decode().map_err(malformed)?),
            Event::CData(c) => text.push_str(&c.decode().map_err(malformed)?),
            Event::GeneralRef(r) => {
                if let Some(ch) = r.resolve_char_ref().map_err(malformed)? {
                    text.push(ch);
                } else {
                    let name = r.decode().map_err(malformed)?;
                    match resolve_predefined_entity(&name) {
                        Some(resolved) => text.push_str(resolved),
                        None => {
                            text.push('&');
                            text.push_str(&name);
                            text.push(';');
                        }
                    }
                }
            }
            Event::End(e) => {
                let name = local_name(e.local_name().as_ref());
                let closing = depth;
                depth = depth.saturating_sub(1);
                let value = text.trim().to_string();
                text.clear();

                if current.is_some() && closing == entry_depth {
                    entries.extend(current.take());
                    continue;
                }
                let Some(entry) = current.as_mut() else {
                    continue;
                };
                if value.is_empty() {
                    continue;
                }
                match name.as_str() {
                    "link" | "loc" if entry.link.is_none() => entry.link = Some(value),
                    "title" if entry.title.is_none() => entry.title = Some(value),
                    "pubDate" | "published" | "publication_date" | "date" if entry.date.is_none() => {
                        entry.date = Some(value)
                    }
                    "updated" | "lastmod" if entry.fallback_date.is_none() => entry.fallback_date = Some(value),
                    _ => {}
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    let root = root.ok_or_else(|| ReadError::Malformed("empty document".into()))?;
    if depth > 0 {
        return Err(ReadError::Malformed("unexpected end of document".into()));
    }
    Ok(Parsed { root, entries })
}

/// Reads discovery documents through a [`PageFetcher`].
#[derive(Debug, Clone)]
pub struct DocumentReader {
    fetcher: Arc<dyn PageFetcher>,
    max_depth: usize,
    max_urls: usize,
    news_only_sites: HashSet<String>,
}

impl DocumentReader {
    pub fn new(fetcher: Arc<dyn PageFetcher>, config: &PipelineConfig) -> Self {
        Self {
            fetcher,
            max_depth: config.max_sitemap_recursion_depth,
            max_urls: config.max_urls_per_document,
            news_only_sites: config
                .sources
                .iter()
                .filter(|s| s.news_urls_only)
                .map(|s| s.site.clone())
                .collect(),
        }
    }

    /// Fetch and parse one document, following sitemap indexes.
    #[instrument(level = "info", skip_all, fields(url = %doc.url, kind = %doc.kind, depth = doc.depth))]
    pub async fn read(&self, doc: &DocumentRef) -> Result<ReadReport, ReadError> {
        let body = match self.fetcher.fetch(&doc.url).await {
            FetchOutcome::Success(raw) => raw.body,
            FetchOutcome::TransientFailure(reason) => return Err(ReadError::Unreachable(reason.to_string())),
            FetchOutcome::PermanentFailure(reason) => return Err(ReadError::Unreachable(reason.to_string())),
        };
        let parsed = parse_document(&body)?;

        let declared_index = doc.kind == DocumentKind::SitemapIndex;
        if declared_index != (parsed.root == Root::Index) {
            debug!(declared = %doc.kind, actual = ?parsed.root, "Root element overrides declared kind");
        }

        match parsed.root {
            Root::Index => Ok(self.read_index(doc, parsed.entries).await),
            root => {
                let candidates = self.candidates(doc, root, parsed.entries);
                info!(count = candidates.len(), "Read discovery document");
                Ok(ReadReport {
                    candidates,
                    failures: Vec::new(),
                })
            }
        }
    }

    fn read_nested<'a>(&'a self, doc: &'a DocumentRef) -> BoxFuture<'a, Result<ReadReport, ReadError>> {
        Box::pin(self.read(doc))
    }

    async fn read_index(&self, doc: &DocumentRef, entries: Vec<Entry>) -> ReadReport {
        let mut report = ReadReport::default();
        if doc.depth + 1 > self.max_depth {
            info!(
                skipped = entries.len(),
                max_depth = self.max_depth,
                "Sitemap index beyond recursion depth, skipping nested sitemaps"
            );
            return report;
        }
        if entries.len() > self.max_urls {
            info!(
                skipped = entries.len() - self.max_urls,
                max_urls = self.max_urls,
                "Sitemap index lists too many sitemaps, reading the first ones only"
            );
        }
        for entry in entries.into_iter().take(self.max_urls) {
            let Some(child_url) = entry.link.and_then(|l| resolve_and_normalize(&doc.url, &l)) else {
                continue;
            };
            let child = doc.child(child_url);
            match self.read_nested(&child).await {
                Ok(nested) => {
                    report.candidates.extend(nested.candidates);
                    report.failures.extend(nested.failures);
                }
                Err(e) => {
                    warn!(url = %child.url, error = %e, "Nested sitemap failed");
                    report.failures.push((child.url, e));
                }
            }
        }
        report
    }

    fn candidates(&self, doc: &DocumentRef, root: Root, entries: Vec<Entry>) -> Vec<CandidateUrl> {
        let news_only = root == Root::UrlSet && self.news_only_sites.contains(&doc.source_site);
        let discovered_at = Utc::now();
        entries
            .into_iter()
            .filter_map(|entry| {
                let url = resolve_and_normalize(&doc.url, entry.link.as_deref()?)?;
                if news_only && !looks_like_news_url(&url) {
                    return None;
                }
                let hint_date = entry
                    .date
                    .as_deref()
                    .and_then(parse_published)
                    .or_else(|| entry.fallback_date.as_deref().and_then(parse_published));
                Some(CandidateUrl {
                    url,
                    source_site: doc.source_site.clone(),
                    discovered_at,
                    hint_title: entry.title,
                    hint_date,
                })
            })
            .take(self.max_urls)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SourceConfig;
    use crate::fetcher::testing::{FakeResponse, FakeWeb};
    use chrono::Datelike;

    const RSS: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<rss version="2.0">
  <channel>
    <title>Example News</title>
    <link>https://news.example/</link>
    <item>
      <title>Markets rally &amp; bonds slip</title>
      <link>https://news.example/news/markets?utm_source=rss</link>
      <pubDate>Tue, 06 May 2025 14:30:00 GMT</pubDate>
    </item>
    <item>
      <title><![CDATA[Storm <b>warning</b> issued]]></title>
      <link>https://news.example/news/storm/</link>
    </item>
  </channel>
</rss>"#;

    const ATOM: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<feed xmlns="http://www.w3.org/2005/Atom">
  <title>Example Atom</title>
  <link rel="self" href="https://news.example/atom.xml"/>
  <entry>
    <title>Atom story</title>
    <link rel="alternate" href="https://news.example/story/atom-one"/>
    <link rel="enclosure" href="https://news.example/a.mp3"/>
    <updated>2025-05-07T10:00:00Z</updated>
    <published>2025-05-06T09:00:00Z</published>
  </entry>
</feed>"#;

    const URLSET: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9"
        xmlns:news="http://www.google.com/schemas/sitemap-news/0.9">
  <url>
    <loc>https://news.example/2025/05/06/election-results</loc>
    <lastmod>2025-05-06</lastmod>
    <news:news>
      <news:title>Election results</news:title>
      <news:publication_date>2025-05-06T08:00:00Z</news:publication_date>
    </news:news>
  </url>
  <url><loc>https://news.example/category/politics</loc></url>
  <url><loc>https://news.example/about/</loc></url>
  <url><loc>https://news.example/news/report.pdf</loc></url>
</urlset>"#;

    fn index(children: &[&str]) -> String {
        let body: String = children
            .iter()
            .map(|c| format!("<sitemap><loc>{c}</loc></sitemap>"))
            .collect();
        format!(r#"<?xml version="1.0"?><sitemapindex xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{body}</sitemapindex>"#)
    }

    fn leaf(urls: &[&str]) -> String {
        let body: String = urls.iter().map(|u| format!("<url><loc>{u}</loc></url>")).collect();
        format!(r#"<urlset xmlns="http://www.sitemaps.org/schemas/sitemap/0.9">{body}</urlset>"#)
    }

    fn reader(web: Arc<FakeWeb>, news_only: bool) -> DocumentReader {
        let config = PipelineConfig {
            max_sitemap_recursion_depth: 2,
            sources: vec![SourceConfig {
                site: "example".into(),
                news_urls_only: news_only,
                ..SourceConfig::default()
            }],
            ..PipelineConfig::default()
        };
        DocumentReader::new(web, &config)
    }

    #[test]
    fn test_news_url_heuristic() {
        assert!(looks_like_news_url("https://a.example/news/some-story"));
        assert!(looks_like_news_url("https://a.example/2024/11/03/slug"));
        assert!(!looks_like_news_url("https://a.example/tag/news/"));
        assert!(!looks_like_news_url("https://a.example/news/file.PDF"));
        assert!(!looks_like_news_url("https://a.example/shop/item"));
    }

    #[test]
    fn test_parse_rss_entities_and_cdata() {
        let parsed = parse_document(RSS).unwrap();
        assert_eq!(parsed.root, Root::Feed);
        assert_eq!(parsed.entries.len(), 2);
        assert_eq!(parsed.entries[0].title.as_deref(), Some("Markets rally & bonds slip"));
        assert_eq!(parsed.entries[1].title.as_deref(), Some("Storm <b>warning</b> issued"));
    }

    #[test]
    fn test_parse_rejects_unknown_root_and_broken_xml() {
        assert!(matches!(parse_document("<html><body/></html>"), Err(ReadError::Malformed(_))));
        assert!(matches!(
            parse_document("<rss><channel><item></channel></rss>"),
            Err(ReadError::Malformed(_))
        ));
        assert!(matches!(parse_document(""), Err(ReadError::Malformed(_))));
    }

    #[tokio::test]
    async fn test_read_rss_normalizes_links() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://news.example/rss.xml", FakeResponse::xml(RSS));
        let doc = DocumentRef::new("https://news.example/rss.xml", DocumentKind::Feed, "example");

        let report = reader(web, true).read(&doc).await.unwrap();
        let urls: Vec<&str> = report.candidates.iter().map(|c| c.url.as_str()).collect();
        assert_eq!(urls, vec!["https://news.example/news/markets", "https://news.example/news/storm"]);
        assert_eq!(report.candidates[0].hint_date.unwrap().day(), 6);
        assert!(report.candidates[1].hint_date.is_none());
    }

    #[tokio::test]
    async fn test_read_atom_prefers_alternate_link_and_published() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://news.example/atom.xml", FakeResponse::xml(ATOM));
        let doc = DocumentRef::new("https://news.example/atom.xml", DocumentKind::Feed, "example");

        let report = reader(web, true).read(&doc).await.unwrap();
        assert_eq!(report.candidates.len(), 1);
        let c = &report.candidates[0];
        assert_eq!(c.url, "https://news.example/story/atom-one");
        assert_eq!(c.hint_title.as_deref(), Some("Atom story"));
        assert_eq!(c.hint_date.unwrap().day(), 6);
    }

    #[tokio::test]
    async fn test_read_news_sitemap_filters_non_articles() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://news.example/news-sitemap.xml", FakeResponse::xml(URLSET));
        let doc = DocumentRef::new("https://news.example/news-sitemap.xml", DocumentKind::Sitemap, "example");

        let filtered = reader(web.clone(), true).read(&doc).await.unwrap();
        assert_eq!(filtered.candidates.len(), 1);
        assert_eq!(filtered.candidates[0].hint_title.as_deref(), Some("Election results"));

        let unfiltered = reader(web, false).read(&doc).await.unwrap();
        assert_eq!(unfiltered.candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_index_recursion_respects_depth_and_isolates_failures() {
        let web = Arc::new(FakeWeb::new());
        web.route(
            "https://news.example/sitemap.xml",
            FakeResponse::xml(index(&[
                "https://news.example/sitemap-a.xml",
                "https://news.example/sitemap-broken.xml",
                "https://news.example/sitemap-nested.xml",
            ])),
        );
        web.route("https://news.example/sitemap-a.xml", FakeResponse::xml(leaf(&["https://news.example/news/a"])));
        web.route("https://news.example/sitemap-broken.xml", FakeResponse::xml("<urlset><url>"));
        web.route(
            "https://news.example/sitemap-nested.xml",
            FakeResponse::xml(index(&["https://news.example/sitemap-deep.xml"])),
        );
        web.route(
            "https://news.example/sitemap-deep.xml",
            FakeResponse::xml(index(&["https://news.example/sitemap-deeper.xml"])),
        );

        // Declared as a plain sitemap: the root element decides.
        let doc = DocumentRef::new("https://news.example/sitemap.xml", DocumentKind::Sitemap, "example");
        let report = reader(web.clone(), true).read(&doc).await.unwrap();

        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].url, "https://news.example/news/a");
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].0, "https://news.example/sitemap-broken.xml");
        assert_eq!(web.hits("https://news.example/sitemap-deep.xml"), 1);
        assert_eq!(web.hits("https://news.example/sitemap-deeper.xml"), 0);
    }

    #[tokio::test]
    async fn test_unreachable_document() {
        let web = Arc::new(FakeWeb::new());
        web.route("https://news.example/gone.xml", FakeResponse::status(410));
        let doc = DocumentRef::new("https://news.example/gone.xml", DocumentKind::Feed, "example");
        assert!(matches!(reader(web, true).read(&doc).await, Err(ReadError::Unreachable(_))));
    }

    #[tokio::test]
    async fn test_max_urls_per_document() {
        let web = Arc::new(FakeWeb::new());
        let urls: Vec<String> = (0..10).map(|i| format!("https://news.example/news/{i}")).collect();
        let refs: Vec<&str> = urls.iter().map(String::as_str).collect();
        web.route("https://news.example/s.xml", FakeResponse::xml(leaf(&refs)));
        let config = PipelineConfig {
            max_urls_per_document: 4,
            ..PipelineConfig::default()
        };
        let reader = DocumentReader::new(web, &config);
        let doc = DocumentRef::new("https://news.example/s.xml", DocumentKind::Sitemap, "example");
        assert_eq!(reader.read(&doc).await.unwrap().candidates.len(), 4);
    }

    #[tokio::test]
    async fn test_max_urls_limits_nested_sitemaps() {
        let web = Arc::new(FakeWeb::new());
        let children: Vec<String> = (0..5).map(|i| format!("https://news.example/part-{i}.xml")).collect();
        let refs: Vec<&str> = children.iter().map(String::as_str).collect();
        web.route("https://news.example/index.xml", FakeResponse::xml(index(&refs)));
        for (i, child) in children.iter().enumerate() {
            web.route(child, FakeResponse::xml(leaf(&[&format!("https://news.example/news/{i}")])));
        }
        let config = PipelineConfig {
            max_urls_per_document: 2,
            ..PipelineConfig::default()
        };
        let reader = DocumentReader::new(web.clone(), &config);
        let doc = DocumentRef::new("https://news.example/index.xml", DocumentKind::SitemapIndex, "example");

        assert_eq!(reader.read(&doc).await.unwrap().candidates.len(), 2);
        assert_eq!(web.hits("https://news.example/part-1.xml"), 1);
        assert_eq!(web.hits("https://news.example/part-2.xml"), 0);
    }
}
