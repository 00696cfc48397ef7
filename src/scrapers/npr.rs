//! NPR rules.
//!
//! [text.npr.org](https://text.npr.org) serves a text-only page per story with the
//! headline in `.story-title` and the body in `.paragraphs-container`.

use super::{Probe, RuleSet};

pub static RULES: RuleSet = RuleSet {
    site: "npr",
    title: &[
        Probe::Text(".story-title"),
        Probe::Text(".storytitle h1"),
    ],
    date: &[
        Probe::Attr(r#"meta[name="date"]"#, "content"),
        Probe::Attr(".dateblock time", "datetime"),
    ],
    summary: &[".paragraphs-container p", "#storytext p"],
};

#[cfg(test)]
mod tests {
    use crate::scrapers::test_support::{extractor, html_doc};

    #[test]
    fn test_npr_text_page() {
        let body = r#"<html><head><title>NPR : National Public Radio</title></head><body>
<main><article>
  <div class="story-head"><h1 class="story-title">Scientists map the ocean floor near Antarctica</h1></div>
  <div class="paragraphs-container">
    <p>A research vessel spent three months surveying the seabed off the Antarctic coast.</p>
  </div>
</article></main></body></html>"#;
        let doc = html_doc("https://text.npr.org/nx-s1-5000001", body);
        let record = extractor().extract(&doc, "npr").unwrap();
        assert_eq!(record.title, "Scientists map the ocean floor near Antarctica");
        assert!(record.summary.unwrap().starts_with("A research vessel"));
        assert!(record.publication_date.is_none());
    }
}
