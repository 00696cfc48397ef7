//! BBC News rules.

use super::{Probe, RuleSet};

pub static RULES: RuleSet = RuleSet {
    site: "bbc",
    title: &[
        Probe::Text("h1#main-heading"),
        Probe::Text(r#"[data-component="headline-block"] h1"#),
        Probe::Text(r#"h1[class*="StyledHeading"]"#),
    ],
    date: &[Probe::Attr(r#"time[data-testid="timestamp"]"#, "datetime")],
    summary: &[
        r#"[data-component="text-block"] p"#,
        r#"div[class*="RichTextContainer"] p"#,
    ],
};

#[cfg(test)]
mod tests {
    use crate::scrapers::test_support::{extractor, html_doc};
    use chrono::{Datelike, Timelike};

    #[test]
    fn test_bbc_article() {
        let body = r#"<html><head><title>BBC News</title></head><body>
<header><h1>BBC</h1></header>
<article>
  <div data-component="headline-block"><h1 id="main-heading">Heatwave warning issued for southern England</h1></div>
  <div data-component="byline-block"><time data-testid="timestamp" datetime="2025-07-01T06:15:00.000Z">1 July</time></div>
  <div data-component="text-block"><p>An amber heat-health alert has been issued by the UK Health Security Agency.</p></div>
  <div data-component="text-block"><p>Temperatures are forecast to reach 33C in London on Tuesday.</p></div>
</article></body></html>"#;
        let doc = html_doc("https://www.bbc.co.uk/news/articles/c0abc123", body);
        let record = extractor().extract(&doc, "bbc").unwrap();
        assert_eq!(record.title, "Heatwave warning issued for southern England");
        let date = record.publication_date.unwrap();
        assert_eq!((date.month(), date.day(), date.hour()), (7, 1, 6));
        assert!(record.summary.unwrap().contains("33C in London"));
    }
}
