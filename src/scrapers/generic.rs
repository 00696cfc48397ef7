//! Fallback rules for publishers without a dedicated rule set.
//!
//! These follow the conventions most news CMSes share: a single `<h1>` headline,
//! `article:published_time` / `<time datetime>` for the date and an article body
//! container of plain paragraphs. Every site-specific rule set falls back to them.

use super::{Probe, RuleSet};

pub static RULES: RuleSet = RuleSet {
    site: "generic",
    title: &[
        Probe::Text("h1"),
        Probe::Text("title"),
        Probe::Text("h1.headline"),
        Probe::Text("h1.title"),
        Probe::Text(".article-title"),
        Probe::Text(".headline"),
        Probe::Attr(r#"meta[property="og:title"]"#, "content"),
        Probe::Attr(r#"meta[name="title"]"#, "content"),
    ],
    date: &[
        Probe::Attr("time[datetime]", "datetime"),
        Probe::Text(".publication-date"),
        Probe::Text(".date"),
        Probe::Attr(r#"meta[property="article:published_time"]"#, "content"),
        Probe::Attr(r#"meta[name="publish-date"]"#, "content"),
        Probe::Attr(r#"meta[name="date"]"#, "content"),
    ],
    summary: &[".article-body p", ".content p", "article p", ".story p", "p"],
};
