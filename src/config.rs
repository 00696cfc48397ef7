//! Run parameters for the ingestion pipeline.
//!
//! Configuration comes from an optional YAML file (see [`PipelineConfig::load`])
//! with command-line overrides applied on top (see [`crate::cli::Cli::apply`]).
//! Everything that shapes crawling behaviour lives here: per-domain politeness,
//! retry budget, sitemap recursion depth, the identity pool and the list of
//! publisher sources. None of it is compiled in.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::ConfigError;
use crate::identity::{IdentityPool, IdentitySpec, default_identity_specs};
use crate::models::{DocumentKind, DocumentRef};

/// One publisher and the discovery documents that list its articles.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SourceConfig {
    /// Short site key, e.g. `bbc`; selects the extraction rule set.
    pub site: String,
    /// Homepage used for feed/sitemap autodiscovery.
    pub homepage: Option<String>,
    /// Look for `Sitemap:` lines in robots.txt and feed `<link>` tags on the homepage.
    pub discover: bool,
    /// Keep only sitemap URLs that look like articles.
    pub news_urls_only: bool,
    pub feeds: Vec<String>,
    pub sitemaps: Vec<String>,
    pub sitemap_indexes: Vec<String>,
}

impl Default for SourceConfig {
    fn default() -> Self {
        Self {
            site: String::new(),
            homepage: None,
            discover: false,
            news_urls_only: true,
            feeds: Vec::new(),
            sitemaps: Vec::new(),
            sitemap_indexes: Vec::new(),
        }
    }
}

impl SourceConfig {
    /// Discovery documents declared directly in the configuration.
    pub fn documents(&self) -> Vec<DocumentRef> {
        let feeds = self
            .feeds
            .iter()
            .map(|u| DocumentRef::new(u.clone(), DocumentKind::Feed, self.site.clone()));
        let sitemaps = self
            .sitemaps
            .iter()
            .map(|u| DocumentRef::new(u.clone(), DocumentKind::Sitemap, self.site.clone()));
        let indexes = self
            .sitemap_indexes
            .iter()
            .map(|u| DocumentRef::new(u.clone(), DocumentKind::SitemapIndex, self.site.clone()));
        feeds.chain(sitemaps).chain(indexes).collect()
    }
}

/// All run parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub max_concurrent_per_domain: usize,
    pub delay_floor_secs: f64,
    pub delay_ceiling_secs: f64,
    pub backoff_multiplier: f64,
    /// Consecutive clean responses needed before the delay decays one step.
    pub decay_after: u32,
    pub slow_response_secs: f64,
    pub max_retries: u32,
    pub retry_base_delay_secs: f64,
    pub max_sitemap_recursion_depth: usize,
    pub max_urls_per_document: usize,
    pub worker_pool_size: usize,
    pub discovery_concurrency: usize,
    pub queue_capacity: usize,
    pub request_timeout_secs: f64,
    pub run_deadline_secs: f64,
    pub robots_agent: String,
    pub summary_paragraphs: usize,
    pub summary_max_chars: usize,
    pub drift_min_samples: usize,
    pub drift_failure_ratio: f64,
    pub identity_pool: Option<Vec<IdentitySpec>>,
    pub sources: Vec<SourceConfig>,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            max_concurrent_per_domain: 1,
            delay_floor_secs: 5.0,
            delay_ceiling_secs: 60.0,
            backoff_multiplier: 2.0,
            decay_after: 3,
            slow_response_secs: 10.0,
            max_retries: 3,
            retry_base_delay_secs: 1.0,
            max_sitemap_recursion_depth: 3,
            max_urls_per_document: 100,
            worker_pool_size: 8,
            discovery_concurrency: 4,
            queue_capacity: 256,
            request_timeout_secs: 20.0,
            run_deadline_secs: 1800.0,
            robots_agent: "Mozilla".to_string(),
            summary_paragraphs: 3,
            summary_max_chars: 500,
            drift_min_samples: 3,
            drift_failure_ratio: 0.5,
            identity_pool: None,
            sources: Vec::new(),
        }
    }
}

impl PipelineConfig {
    /// Load configuration from a YAML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_yaml(&text)
    }

    pub fn from_yaml(text: &str) -> Result<Self, ConfigError> {
        let config: PipelineConfig = serde_yaml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Reject parameter combinations that would stall or flood the pipeline.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::Invalid(msg.to_string()));
        if self.max_concurrent_per_domain == 0 {
            return invalid("max_concurrent_per_domain must be at least 1");
        }
        if self.worker_pool_size == 0 {
            return invalid("worker_pool_size must be at least 1");
        }
        if self.discovery_concurrency == 0 || self.queue_capacity == 0 {
            return invalid("discovery_concurrency and queue_capacity must be at least 1");
        }
        for (name, secs) in [
            ("delay_floor_secs", self.delay_floor_secs),
            ("delay_ceiling_secs", self.delay_ceiling_secs),
            ("slow_response_secs", self.slow_response_secs),
            ("retry_base_delay_secs", self.retry_base_delay_secs),
            ("request_timeout_secs", self.request_timeout_secs),
            ("run_deadline_secs", self.run_deadline_secs),
        ] {
            if Duration::try_from_secs_f64(secs).is_err() {
                return Err(ConfigError::Invalid(format!(
                    "{name} must be a finite, non-negative number of seconds, got {secs}"
                )));
            }
        }
        if !(self.delay_floor_secs <= self.delay_ceiling_secs) {
            return invalid("delay_floor_secs must not exceed delay_ceiling_secs");
        }
        if !(self.backoff_multiplier >= 1.0 && self.backoff_multiplier.is_finite()) {
            return invalid("backoff_multiplier must be a finite number of at least 1.0");
        }
        if self.request_timeout_secs <= 0.0 || self.run_deadline_secs <= 0.0 {
            return invalid("request_timeout_secs and run_deadline_secs must be positive");
        }
        if !(0.0..=1.0).contains(&self.drift_failure_ratio) {
            return invalid("drift_failure_ratio must be between 0 and 1");
        }
        if self.sources.iter().any(|s| s.site.trim().is_empty()) {
            return invalid("every source needs a site key");
        }
        self.identities()?;
        Ok(())
    }

    pub fn identities(&self) -> Result<IdentityPool, ConfigError> {
        let specs = self
            .identity_pool
            .clone()
            .unwrap_or_else(default_identity_specs);
        IdentityPool::new(specs)
    }

    pub fn delay_floor(&self) -> Duration {
        Duration::from_secs_f64(self.delay_floor_secs)
    }

    pub fn delay_ceiling(&self) -> Duration {
        Duration::from_secs_f64(self.delay_ceiling_secs)
    }

    pub fn slow_response(&self) -> Duration {
        Duration::from_secs_f64(self.slow_response_secs)
    }

    pub fn retry_base_delay(&self) -> Duration {
        Duration::from_secs_f64(self.retry_base_delay_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.request_timeout_secs)
    }

    pub fn run_deadline(&self) -> Duration {
        Duration::from_secs_f64(self.run_deadline_secs)
    }
}
