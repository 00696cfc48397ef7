//! CNN rules.
//!
//! Covers both the full site and [CNN Lite](https://lite.cnn.com), the text-only
//! edition whose minimal markup puts the headline in `.headline--lite` and the
//! story in `.article--lite`.

use super::{Probe, RuleSet};

pub static RULES: RuleSet = RuleSet {
    site: "cnn",
    title: &[
        Probe::Text(".headline--lite"),
        Probe::Text("h1.headline__text"),
        Probe::Text(r#"h1[data-editable="headlineText"]"#),
    ],
    date: &[
        Probe::Attr(r#"meta[property="article:published_time"]"#, "content"),
        Probe::Attr(r#"meta[name="pubdate"]"#, "content"),
        Probe::Attr(r#"meta[itemprop="datePublished"]"#, "content"),
    ],
    summary: &[".article--lite p", ".article__content p", "p.paragraph"],
};
