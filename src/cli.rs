//! Command-line interface definitions for news_ingest.
//!
//! This module defines the CLI arguments and options using the `clap` crate.
//! All arguments can be provided via command-line flags or environment variables.
//! Tuning flags override the matching keys of the YAML configuration file.

use clap::Parser;

use crate::config::PipelineConfig;
use crate::error::ConfigError;

/// Command-line arguments for one ingestion run.
///
/// # Examples
///
/// ```sh
/// # Run with a config file, storing into ./news.db
/// news_ingest --config sources.yaml
///
/// # Faster local test run against a scratch database
/// news_ingest -c sources.yaml --database-url sqlite://scratch.db --delay-floor 1 --deadline 120
///
/// # Also write a JSON run report
/// news_ingest -c sources.yaml --report-dir ./reports
/// ```
#[derive(Parser, Debug)]
#[command(author, version, about)]
pub struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "NEWS_INGEST_CONFIG")]
    pub config: Option<String>,

    /// Database connection URL
    #[arg(long, env = "DATABASE_URL", default_value = "sqlite://news.db")]
    pub database_url: String,

    /// Directory for JSON run reports
    #[arg(short, long, env = "NEWS_INGEST_REPORT_DIR")]
    pub report_dir: Option<String>,

    /// Maximum in-flight requests per publisher domain
    #[arg(long, env = "NEWS_INGEST_MAX_CONCURRENT_PER_DOMAIN")]
    pub max_concurrent_per_domain: Option<usize>,

    /// Minimum delay between requests to one domain, in seconds
    #[arg(long, env = "NEWS_INGEST_DELAY_FLOOR")]
    pub delay_floor: Option<f64>,

    /// Maximum backoff delay for one domain, in seconds
    #[arg(long, env = "NEWS_INGEST_DELAY_CEILING")]
    pub delay_ceiling: Option<f64>,

    /// Retries per URL after transient failures
    #[arg(long, env = "NEWS_INGEST_MAX_RETRIES")]
    pub max_retries: Option<u32>,

    /// How deep nested sitemap indexes are followed
    #[arg(long, env = "NEWS_INGEST_MAX_SITEMAP_DEPTH")]
    pub max_sitemap_depth: Option<usize>,

    /// Number of fetch workers
    #[arg(short, long, env = "NEWS_INGEST_WORKERS")]
    pub workers: Option<usize>,

    /// Run deadline in seconds
    #[arg(long, env = "NEWS_INGEST_DEADLINE")]
    pub deadline: Option<f64>,
}

impl Cli {
    /// Load the configuration file (or defaults), apply flag overrides and validate.
    pub fn pipeline_config(&self) -> Result<PipelineConfig, ConfigError> {
        let mut config = match &self.config {
            Some(path) => PipelineConfig::load(path)?,
            None => PipelineConfig::default(),
        };
        self.apply(&mut config);
        config.validate()?;
        Ok(config)
    }

    /// Overwrite config values with the flags that were given.
    pub fn apply(&self, config: &mut PipelineConfig) {
        if let Some(v) = self.max_concurrent_per_domain {
            config.max_concurrent_per_domain = v;
        }
        if let Some(v) = self.delay_floor {
            config.delay_floor_secs = v;
        }
        if let Some(v) = self.delay_ceiling {
            config.delay_ceiling_secs = v;
        }
        if let Some(v) = self.max_retries {
            config.max_retries = v;
        }
        if let Some(v) = self.max_sitemap_depth {
            config.max_sitemap_recursion_depth = v;
        }
        if let Some(v) = self.workers {
            config.worker_pool_size = v;
        }
        if let Some(v) = self.deadline {
            config.run_deadline_secs = v;
        }
    }
}
