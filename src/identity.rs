//! Rotated request identities.
//!
//! Each fetch presents itself as one realistic browser, picked pseudo-randomly
//! from an [`IdentityPool`]. The accompanying header set is derived from the
//! identity's [`BrowserFamily`] and from its own user-agent string (browser
//! version, platform), so a request never carries a Chrome user agent with
//! Firefox headers or the other way around.

use once_cell::sync::Lazy;
use rand::{Rng, rng};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Browser family an identity claims to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BrowserFamily {
    Chrome,
    Edge,
    Firefox,
    Safari,
}

/// Identity as written in the configuration file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdentitySpec {
    pub family: BrowserFamily,
    pub user_agent: String,
}

/// A user agent plus the headers that browser would send alongside it.
#[derive(Debug, Clone)]
pub struct Identity {
    pub family: BrowserFamily,
    pub user_agent: String,
    headers: Vec<(&'static str, String)>,
}

static CHROMIUM_MAJOR: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?:Chrome|Edg)/(\d+)").expect("static regex"));

impl Identity {
    /// Build an identity, rejecting user agents that contradict the family.
    pub fn new(spec: IdentitySpec) -> Result<Self, ConfigError> {
        let ua = spec.user_agent.trim().to_string();
        if !family_matches(spec.family, &ua) {
            return Err(ConfigError::Invalid(format!(
                "user agent does not belong to the {:?} family: {ua}",
                spec.family
            )));
        }
        let headers = family_headers(spec.family, &ua);
        Ok(Self {
            family: spec.family,
            user_agent: ua,
            headers,
        })
    }

    /// Headers to send with this identity, excluding `User-Agent`.
    pub fn headers(&self) -> &[(&'static str, String)] {
        &self.headers
    }
}

fn family_matches(family: BrowserFamily, ua: &str) -> bool {
    match family {
        BrowserFamily::Chrome => ua.contains("Chrome/") && !ua.contains("Edg/"),
        BrowserFamily::Edge => ua.contains("Edg/"),
        BrowserFamily::Firefox => ua.contains("Firefox/"),
        BrowserFamily::Safari => {
            ua.contains("Safari/") && ua.contains("Version/") && !ua.contains("Chrome/")
        }
    }
}

fn platform_of(ua: &str) -> &'static str {
    if ua.contains("Windows") {
        "\"Windows\""
    } else if ua.contains("Macintosh") || ua.contains("Mac OS X") {
        "\"macOS\""
    } else if ua.contains("Android") {
        "\"Android\""
    } else {
        "\"Linux\""
    }
}

fn family_headers(family: BrowserFamily, ua: &str) -> Vec<(&'static str, String)> {
    let navigate = [
        ("Sec-Fetch-Dest", "document"),
        ("Sec-Fetch-Mode", "navigate"),
        ("Sec-Fetch-Site", "none"),
    ];
    let mut headers: Vec<(&'static str, String)> = Vec::new();

    match family {
        BrowserFamily::Chrome | BrowserFamily::Edge => {
            let major = CHROMIUM_MAJOR
                .captures(ua)
                .and_then(|c| c.get(1))
                .map(|m| m.as_str().to_string())
                .unwrap_or_else(|| "126".to_string());
            let brands = if family == BrowserFamily::Edge {
                format!(
                    "\"Microsoft Edge\";v=\"{major}\", \"Chromium\";v=\"{major}\", \"Not-A.Brand\";v=\"8\""
                )
            } else {
                format!(
                    "\"Chromium\";v=\"{major}\", \"Google Chrome\";v=\"{major}\", \"Not-A.Brand\";v=\"8\""
                )
            };
            headers.push((
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,image/avif,image/webp,image/apng,*/*;q=0.8".into(),
            ));
            headers.push(("Accept-Language", "en-US,en;q=0.9".into()));
            headers.push(("sec-ch-ua", brands));
            headers.push(("sec-ch-ua-mobile", "?0".into()));
            headers.push(("sec-ch-ua-platform", platform_of(ua).into()));
            headers.push(("Upgrade-Insecure-Requests", "1".into()));
            headers.extend(navigate.iter().map(|(k, v)| (*k, v.to_string())));
            headers.push(("Sec-Fetch-User", "?1".into()));
        }
        BrowserFamily::Firefox => {
            headers.push((
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            ));
            headers.push(("Accept-Language", "en-US,en;q=0.5".into()));
            headers.push(("Upgrade-Insecure-Requests", "1".into()));
            headers.extend(navigate.iter().map(|(k, v)| (*k, v.to_string())));
            headers.push(("Sec-Fetch-User", "?1".into()));
        }
        BrowserFamily::Safari => {
            headers.push((
                "Accept",
                "text/html,application/xhtml+xml,application/xml;q=0.9,*/*;q=0.8".into(),
            ));
            headers.push(("Accept-Language", "en-US,en;q=0.9".into()));
            headers.extend(navigate.iter().map(|(k, v)| (*k, v.to_string())));
        }
    }
    headers
}

/// Fixed pool of identities, one picked per request.
#[derive(Debug, Clone)]
pub struct IdentityPool {
    identities: Vec<Identity>,
}

impl IdentityPool {
    pub fn new(specs: Vec<IdentitySpec>) -> Result<Self, ConfigError> {
        if specs.is_empty() {
            return Err(ConfigError::Invalid("identity pool is empty".into()));
        }
        let identities = specs
            .into_iter()
            .map(Identity::new)
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { identities })
    }

    /// Pick an identity uniformly at random.
    pub fn pick(&self) -> &Identity {
        let i = rng().random_range(0..self.identities.len());
        &self.identities[i]
    }

    pub fn len(&self) -> usize {
        self.identities.len()
    }
}

/// Built-in pool of current desktop browsers.
pub fn default_identity_specs() -> Vec<IdentitySpec> {
    let identity_spec = |family, ua: &str| IdentitySpec {
        family,
        user_agent: ua.to_string(),
    };
    vec![
        identity_spec(
            BrowserFamily::Chrome,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        ),
        identity_spec(
            BrowserFamily::Chrome,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36",
        ),
        identity_spec(
            BrowserFamily::Chrome,
            "Mozilla/5.0 (X11; Linux x86_64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/125.0.0.0 Safari/537.36",
        ),
        identity_spec(
            BrowserFamily::Edge,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/126.0.0.0 Safari/537.36 Edg/126.0.2592.87",
        ),
        identity_spec(
            BrowserFamily::Firefox,
            "Mozilla/5.0 (Windows NT 10.0; Win64; x64; rv:127.0) Gecko/20100101 Firefox/127.0",
        ),
        identity_spec(
            BrowserFamily::Firefox,
            "Mozilla/5.0 (X11; Ubuntu; Linux x86_64; rv:127.0) Gecko/20100101 Firefox/127.0",
        ),
        identity_spec(
            BrowserFamily::Safari,
            "Mozilla/5.0 (Macintosh; Intel Mac OS X 10_15_7) AppleWebKit/605.1.15 (KHTML, like Gecko) Version/17.5 Safari/605.1.15",
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header<'a>(identity: &'a Identity, name: &str) -> Option<&'a str> {
        identity
            .headers()
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    #[test]
    fn test_default_pool_is_valid() {
        let pool = IdentityPool::new(default_identity_specs()).unwrap();
        assert_eq!(pool.len(), default_identity_specs().len());
    }

    #[test]
    fn test_chrome_headers_follow_user_agent() {
        let specs = default_identity_specs();
        let identity = Identity::new(specs[1].clone()).unwrap();
        assert_eq!(identity.family, BrowserFamily::Chrome);
        let brands = header(&identity, "sec-ch-ua").unwrap();
        assert!(brands.contains("Google Chrome\";v=\"126\""));
        assert_eq!(header(&identity, "sec-ch-ua-platform"), Some("\"macOS\""));
    }

    #[test]
    fn test_edge_brands_name_edge() {
        let edge = default_identity_specs()
            .into_iter()
            .find(|s| s.family == BrowserFamily::Edge)
            .unwrap();
        let identity = Identity::new(edge).unwrap();
        assert!(header(&identity, "sec-ch-ua").unwrap().contains("Microsoft Edge"));
    }

    #[test]
    fn test_firefox_and_safari_never_send_client_hints() {
        for spec in default_identity_specs()
            .into_iter()
            .filter(|s| matches!(s.family, BrowserFamily::Firefox | BrowserFamily::Safari))
        {
            let identity = Identity::new(spec).unwrap();
            assert!(header(&identity, "sec-ch-ua").is_none());
            assert!(header(&identity, "sec-ch-ua-platform").is_none());
        }
    }

    #[test]
    fn test_mismatched_family_rejected() {
        let spec = IdentitySpec {
            family: BrowserFamily::Firefox,
            user_agent: default_identity_specs()[0].user_agent.clone(),
        };
        assert!(Identity::new(spec).is_err());
        assert!(IdentityPool::new(vec![]).is_err());
    }

    #[test]
    fn test_pick_returns_pool_member() {
        let pool = IdentityPool::new(default_identity_specs()).unwrap();
        let agents: Vec<String> = default_identity_specs().into_iter().map(|s| s.user_agent).collect();
        for _ in 0..20 {
            assert!(agents.contains(&pool.pick().user_agent));
        }
    }
}
