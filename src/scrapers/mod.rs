//! Article extraction: per-site structural rules with a generic fallback.
//!
//! Extraction is a pure transform from a fetched [`RawDocument`] to an
//! [`ArticleRecord`]. It never fetches anything or follows links.
//!
//! # Supported Sources
//!
//! | Site key | Module | Notes |
//! |----------|--------|-------|
//! | `cnn` | [`cnn`] | Full site and the text-only CNN Lite |
//! | `bbc` | [`bbc`] | BBC News article pages |
//! | `guardian` | [`guardian`] | The Guardian |
//! | `npr` | [`npr`] | NPR, including text.npr.org |
//! | anything else | [`generic`] | Common headline/date/paragraph conventions |
//!
//! # Probing
//!
//! A site's own probes run first, followed by the generic probes, so a site
//! rule set only needs to describe what is special about that publisher.
//!
//! - Title: the first candidate longer than 10 characters wins; failing that, the
//!   first non-empty one. No title at all is [`ExtractionError::NoTitle`].
//! - Date: the first probe whose value parses as a timestamp.
//! - Summary: the first paragraph selector that yields text; its first few
//!   paragraphs longer than 20 characters are joined and truncated.

pub mod bbc;
pub mod cnn;
pub mod generic;
pub mod guardian;
pub mod npr;

use chrono::{DateTime, Utc};
use itertools::Itertools;
use scraper::{ElementRef, Html, Selector};
use std::collections::HashMap;
use tracing::{debug, warn};

use crate::config::PipelineConfig;
use crate::error::ExtractionError;
use crate::models::{ArticleRecord, RawDocument};
use crate::utils::{parse_published, truncate_chars};

const MIN_TITLE_CHARS: usize = 10;
const MIN_PARAGRAPH_CHARS: usize = 20;

/// Where a value is read from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Probe {
    /// Text content of the matching element.
    Text(&'static str),
    /// An attribute of the matching element.
    Attr(&'static str, &'static str),
}

/// Structural rules for one publisher.
#[derive(Debug, Clone, Copy)]
pub struct RuleSet {
    pub site: &'static str,
    pub title: &'static [Probe],
    pub date: &'static [Probe],
    /// Paragraph selectors, most specific first.
    pub summary: &'static [&'static str],
}

#[derive(Debug)]
enum CompiledProbe {
    Text(Selector),
    Attr(Selector, &'static str),
}

impl CompiledProbe {
    fn values<'a>(&'a self, html: &'a Html) -> impl Iterator<Item = String> + 'a {
        let (selector, attr) = match self {
            CompiledProbe::Text(s) => (s, None),
            CompiledProbe::Attr(s, a) => (s, Some(*a)),
        };
        html.select(selector).filter_map(move |el| match attr {
            None => Some(element_text(el)),
            Some(name) => el.value().attr(name).map(collapse_whitespace),
        })
    }
}

#[derive(Debug)]
struct CompiledRules {
    title: Vec<CompiledProbe>,
    date: Vec<CompiledProbe>,
    summary: Vec<Selector>,
}

fn compile_selector(site: &str, css: &str) -> Option<Selector> {
    match Selector::parse(css) {
        Ok(s) => Some(s),
        Err(e) => {
            warn!(%site, selector = css, error = ?e, "Skipping invalid selector");
            None
        }
    }
}

fn compile_probes(site: &str, probes: &[Probe]) -> Vec<CompiledProbe> {
    probes
        .iter()
        .filter_map(|p| match *p {
            Probe::Text(css) => compile_selector(site, css).map(CompiledProbe::Text),
            Probe::Attr(css, attr) => compile_selector(site, css).map(|s| CompiledProbe::Attr(s, attr)),
        })
        .collect()
}

impl CompiledRules {
    /// Site rules followed by the generic ones.
    fn compile(rules: &RuleSet) -> Self {
        let fallback = &generic::RULES;
        let with_fallback = |own: &'static [Probe], base: &'static [Probe]| -> Vec<Probe> {
            if rules.site == fallback.site {
                own.to_vec()
            } else {
                own.iter().chain(base.iter()).copied().collect()
            }
        };
        let summary: Vec<&str> = if rules.site == fallback.site {
            rules.summary.to_vec()
        } else {
            rules.summary.iter().chain(fallback.summary.iter()).copied().collect()
        };
        Self {
            title: compile_probes(rules.site, &with_fallback(rules.title, fallback.title)),
            date: compile_probes(rules.site, &with_fallback(rules.date, fallback.date)),
            summary: summary
                .into_iter()
                .filter_map(|css| compile_selector(rules.site, css))
                .collect(),
        }
    }
}

fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().join(" ")
}

fn element_text(el: ElementRef<'_>) -> String {
    collapse_whitespace(&el.text().join(" "))
}

/// Built-in rule sets, keyed by site.
pub fn builtin_rules() -> Vec<&'static RuleSet> {
    vec![&cnn::RULES, &bbc::RULES, &guardian::RULES, &npr::RULES]
}

/// Registry of compiled rule sets plus the summary limits.
#[derive(Debug)]
pub struct Extractor {
    sites: HashMap<&'static str, CompiledRules>,
    fallback: CompiledRules,
    summary_paragraphs: usize,
    summary_max_chars: usize,
}

impl Extractor {
    pub fn new(config: &PipelineConfig) -> Self {
        let sites = builtin_rules()
            .into_iter()
            .map(|rules| (rules.site, CompiledRules::compile(rules)))
            .collect();
        Self {
            sites,
            fallback: CompiledRules::compile(&generic::RULES),
            summary_paragraphs: config.summary_paragraphs,
            summary_max_chars: config.summary_max_chars,
        }
    }

    /// Site keys with a dedicated rule set.
    pub fn sites(&self) -> Vec<&'static str> {
        self.sites.keys().copied().sorted().collect()
    }

    /// Build the article record for `doc`, fetched for `source_site`.
    pub fn extract(&self, doc: &RawDocument, source_site: &str) -> Result<ArticleRecord, ExtractionError> {
        if !doc.is_html() {
            return Err(ExtractionError::StructuralMismatch(format!(
                "expected HTML, got {}",
                doc.content_type.as_deref().unwrap_or("unknown content type")
            )));
        }
        let rules = self.sites.get(source_site).unwrap_or(&self.fallback);
        let html = Html::parse_document(&doc.body);

        let title = pick_title(&html, &rules.title).ok_or(ExtractionError::NoTitle)?;
        let publication_date = pick_date(&html, &rules.date);
        let summary = self.pick_summary(&html, &rules.summary);
        debug!(url = %doc.url, %source_site, has_date = publication_date.is_some(), has_summary = summary.is_some(), "Extracted article");

        Ok(ArticleRecord {
            url: doc.url.clone(),
            title,
            publication_date,
            summary,
            source_site: source_site.to_string(),
            extracted_at: Utc::now(),
        })
    }

    fn pick_summary(&self, html: &Html, selectors: &[Selector]) -> Option<String> {
        for selector in selectors {
            let parts: Vec<String> = html
                .select(selector)
                .map(element_text)
                .filter(|p| p.chars().count() > MIN_PARAGRAPH_CHARS)
                .take(self.summary_paragraphs)
                .collect();
            if !parts.is_empty() {
                return Some(truncate_chars(&parts.join(" "), self.summary_max_chars));
            }
        }
        None
    }
}

fn pick_title(html: &Html, probes: &[CompiledProbe]) -> Option<String> {
    let mut first_non_empty = None;
    for value in probes.iter().flat_map(|p| p.values(html)) {
        if value.is_empty() {
            continue;
        }
        if value.chars().count() > MIN_TITLE_CHARS {
            return Some(value);
        }
        first_non_empty.get_or_insert(value);
    }
    first_non_empty
}

fn pick_date(html: &Html, probes: &[CompiledProbe]) -> Option<DateTime<Utc>> {
    probes
        .iter()
        .flat_map(|p| p.values(html))
        .find_map(|v| parse_published(&v))
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use chrono::Datelike;

    const ARTICLE: &str = r#"<html><head>
<title>Short</title>
<meta property="article:published_time" content="2025-05-06T14:30:00Z">
</head><body>
<h1>  Council approves
   new transit budget </h1>
<div class="article-body">
  <p>Tiny.</p>
  <p>The city council approved the transit budget on Tuesday evening.</p>
  <p>The vote was seven to two after a long public comment period.</p>
  <p>Construction on the first line is expected to begin next spring.</p>
  <p>Officials said fares would not change this year under the plan.</p>
</div>
</body></html>"#;

    #[test]
    fn test_generic_extraction() {
        let doc = html_doc("https://local.example/news/budget", ARTICLE);
        let record = extractor().extract(&doc, "local").unwrap();
        assert_eq!(record.url, "https://local.example/news/budget");
        assert_eq!(record.title, "Council approves new transit budget");
        assert_eq!(record.source_site, "local");
        assert_eq!(record.publication_date.unwrap().day(), 6);

        let summary = record.summary.unwrap();
        assert!(summary.starts_with("The city council approved"));
        assert!(summary.contains("public comment period."));
        assert!(summary.contains("next spring."));
        assert!(!summary.contains("fares"), "only the first three paragraphs are used");
    }

    #[test]
    fn test_short_titles_fall_back_to_first_non_empty() {
        let doc = html_doc("https://local.example/a", "<html><head><title>Brief</title></head><body><h1></h1></body></html>");
        assert_eq!(extractor().extract(&doc, "local").unwrap().title, "Brief");
    }

    #[test]
    fn test_og_title_used_when_no_headline() {
        let doc = html_doc(
            "https://local.example/a",
            r#"<html><head><meta property="og:title" content="Open graph headline here"></head><body></body></html>"#,
        );
        assert_eq!(extractor().extract(&doc, "local").unwrap().title, "Open graph headline here");
    }

    #[test]
    fn test_no_title_is_an_error() {
        let doc = html_doc("https://local.example/a", "<html><body><p>Nothing to see.</p></body></html>");
        assert_eq!(extractor().extract(&doc, "local"), Err(ExtractionError::NoTitle));
    }

    #[test]
    fn test_non_html_is_structural_mismatch() {
        let mut doc = html_doc("https://local.example/a.pdf", "%PDF-1.7");
        doc.content_type = Some("application/pdf".into());
        assert!(matches!(
            extractor().extract(&doc, "local"),
            Err(ExtractionError::StructuralMismatch(_))
        ));
    }

    #[test]
    fn test_unparsable_date_is_dropped() {
        let doc = html_doc(
            "https://local.example/a",
            r#"<html><body><h1>Headline that is long enough</h1><span class="date">last Tuesday</span></body></html>"#,
        );
        assert!(extractor().extract(&doc, "local").unwrap().publication_date.is_none());
    }

    #[test]
    fn test_summary_truncated() {
        let config = PipelineConfig {
            summary_max_chars: 30,
            ..PipelineConfig::default()
        };
        let doc = html_doc("https://local.example/news/budget", ARTICLE);
        let summary = Extractor::new(&config).extract(&doc, "local").unwrap().summary.unwrap();
        assert_eq!(summary.chars().count(), 33);
        assert!(summary.ends_with("..."));
    }

    #[test]
    fn test_registry_lists_builtin_sites() {
        assert_eq!(extractor().sites(), vec!["bbc", "cnn", "guardian", "npr"]);
    }

    #[test]
    fn test_all_builtin_selectors_compile() {
        for rules in builtin_rules().into_iter().chain([&generic::RULES]) {
            let compiled = CompiledRules::compile(rules);
            let declared = rules.title.len() + if rules.site == "generic" { 0 } else { generic::RULES.title.len() };
            assert_eq!(compiled.title.len(), declared, "{}", rules.site);
        }
    }
}
