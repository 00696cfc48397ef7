//! URL normalization: the identity function for articles.
//!
//! Every URL entering the pipeline goes through [`normalize_url`] at the Reader
//! boundary, so all later identity checks (aggregation, `exists`, the store's
//! uniqueness key) are plain string equality.
//!
//! Rules, applied in order:
//! 1. only absolute `http`/`https` URLs are accepted
//! 2. scheme and host are lowercased, default ports and userinfo dropped
//! 3. the fragment is dropped
//! 4. `utm_*` tracking parameters are removed, other parameters keep their order
//! 5. trailing slashes are removed from non-root paths; path case is preserved

use url::{Url, form_urlencoded};

/// Normalize `raw` into the canonical article key, or `None` if it is not a
/// fetchable http(s) URL.
pub fn normalize_url(raw: &str) -> Option<String> {
    let mut url = Url::parse(raw.trim()).ok()?;
    if !matches!(url.scheme(), "http" | "https") {
        return None;
    }
    url.host_str()?;

    // `Url` already lowercases the scheme and host and elides default ports.
    url.set_fragment(None);
    let _ = url.set_username("");
    let _ = url.set_password(None);

    let query = url.query().map(kept_query).filter(|q| !q.is_empty());
    url.set_query(query.as_deref());

    let path = url.path().to_string();
    if path.len() > 1 && path.ends_with('/') {
        let trimmed = path.trim_end_matches('/');
        url.set_path(if trimmed.is_empty() { "/" } else { trimmed });
    }

    Some(url.to_string())
}

/// Resolve a possibly relative `href` against `base` and normalize it.
pub fn resolve_and_normalize(base: &str, href: &str) -> Option<String> {
    let base = Url::parse(base).ok()?;
    let joined = base.join(href.trim()).ok()?;
    normalize_url(joined.as_str())
}

fn is_tracking_param(name: &str) -> bool {
    name.to_ascii_lowercase().starts_with("utm_")
}

/// The raw query without tracking parameters or empty segments. Kept segments
/// are copied byte for byte so their encoding never changes.
fn kept_query(raw: &str) -> String {
    raw.split('&')
        .filter(|segment| !segment.is_empty())
        .filter(|segment| {
            let name = form_urlencoded::parse(segment.as_bytes())
                .next()
                .map(|(k, _)| k.into_owned())
                .unwrap_or_default();
            !is_tracking_param(&name)
        })
        .collect::<Vec<_>>()
        .join("&")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_host_case_and_trailing_slash_are_equivalent() {
        assert_eq!(
            normalize_url("http://Example.com/a/"),
            normalize_url("http://example.com/a")
        );
        assert_eq!(normalize_url("http://Example.com/a/").as_deref(), Some("http://example.com/a"));
    }

    #[test]
    fn test_default_port_and_fragment_are_dropped() {
        assert_eq!(
            normalize_url("HTTPS://News.Example.com:443/story/1#comments").as_deref(),
            Some("https://news.example.com/story/1")
        );
        assert_eq!(
            normalize_url("http://example.com:8080/a").as_deref(),
            Some("http://example.com:8080/a")
        );
    }

    #[test]
    fn test_root_path_keeps_single_slash() {
        assert_eq!(normalize_url("https://example.com").as_deref(), Some("https://example.com/"));
        assert_eq!(normalize_url("https://example.com//").as_deref(), Some("https://example.com/"));
    }

    #[test]
    fn test_tracking_params_removed_others_kept_in_order() {
        assert_eq!(
            normalize_url("https://example.com/a?id=7&utm_source=rss&page=2&UTM_medium=x").as_deref(),
            Some("https://example.com/a?id=7&page=2")
        );
        assert_eq!(
            normalize_url("https://example.com/a?utm_source=rss").as_deref(),
            Some("https://example.com/a")
        );
    }

    #[test]
    fn test_removing_tracking_params_keeps_query_encoding() {
        let plain = normalize_url("https://example.com/a?q=hello%20world");
        let tracked = normalize_url("https://example.com/a?q=hello%20world&utm_source=rss");
        assert_eq!(plain.as_deref(), Some("https://example.com/a?q=hello%20world"));
        assert_eq!(tracked, plain);
        assert_eq!(
            normalize_url("https://example.com/a?utm%5Fcampaign=x&tag=a+b&").as_deref(),
            Some("https://example.com/a?tag=a+b")
        );
        assert_eq!(normalize_url("https://example.com/a?").as_deref(), Some("https://example.com/a"));
    }

    #[test]
    fn test_path_case_is_preserved() {
        assert_ne!(
            normalize_url("https://example.com/News/A"),
            normalize_url("https://example.com/news/a")
        );
    }

    #[test]
    fn test_non_http_urls_rejected() {
        assert_eq!(normalize_url("ftp://example.com/a"), None);
        assert_eq!(normalize_url("mailto:desk@example.com"), None);
        assert_eq!(normalize_url("/relative/path"), None);
    }

    #[test]
    fn test_resolve_relative_href() {
        assert_eq!(
            resolve_and_normalize("https://lite.cnn.com/", "/2025/05/06/politics/story/").as_deref(),
            Some("https://lite.cnn.com/2025/05/06/politics/story")
        );
    }
}
