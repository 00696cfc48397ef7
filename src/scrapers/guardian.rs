//! The Guardian rules.

use super::{Probe, RuleSet};

pub static RULES: RuleSet = RuleSet {
    site: "guardian",
    title: &[
        Probe::Text(r#"div[data-gu-name="headline"] h1"#),
        Probe::Text(r#"h1[itemprop="headline"]"#),
    ],
    date: &[
        Probe::Attr(r#"meta[property="article:published_time"]"#, "content"),
        Probe::Attr(r#"time[itemprop="datePublished"]"#, "datetime"),
    ],
    summary: &[
        r#"div[data-gu-name="body"] p"#,
        r#"div[itemprop="articleBody"] p"#,
        "#maincontent p",
    ],
};

#[cfg(test)]
mod tests {
    use crate::scrapers::test_support::{extractor, html_doc};

    #[test]
    fn test_guardian_article_skips_standfirst() {
        let body = r#"<html><head>
<meta property="article:published_time" content="2025-03-14T17:02:11.000Z">
</head><body>
<div data-gu-name="headline"><h1>Ministers unveil plan to cut hospital waiting lists</h1></div>
<div data-gu-name="standfirst"><p>Opposition says the plan lacks detail on staffing and funding.</p></div>
<div data-gu-name="body">
  <p>The health secretary set out the plan in the Commons on Friday afternoon.</p>
</div></body></html>"#;
        let doc = html_doc("https://www.theguardian.com/society/2025/mar/14/waiting-lists", body);
        let record = extractor().extract(&doc, "guardian").unwrap();
        assert_eq!(record.title, "Ministers unveil plan to cut hospital waiting lists");
        assert!(record.publication_date.is_some());
        assert_eq!(
            record.summary.as_deref(),
            Some("The health secretary set out the plan in the Commons on Friday afternoon.")
        );
    }
}
