//! # News Ingest
//!
//! A news ingestion pipeline that discovers article URLs from publisher feeds
//! and sitemaps, fetches the article pages politely, extracts a small record
//! from each one and stores it exactly once in SQLite.
//!
//! ## Features
//!
//! - Reads RSS 2.0 and Atom feeds, sitemaps, news sitemaps and sitemap indexes
//! - Optional autodiscovery from robots.txt `Sitemap:` lines and homepage feed links
//! - Honors robots.txt and keeps per-domain concurrency and delay limits that
//!   back off when a publisher slows down or refuses requests
//! - Retries transient failures with capped exponential backoff
//! - Per-site extraction rules with a generic fallback and drift detection
//! - Writes a JSON run report per run
//!
//! ## Usage
//!
//! ```sh
//! news_ingest -c sources.yaml --database-url sqlite://news.db -r ./reports
//! ```
//!
//! ## Architecture
//!
//! The application follows a pipeline architecture:
//! 1. **Discovery**: Read every feed and sitemap into candidate URLs
//! 2. **Admission**: Drop duplicates, robots.txt disallowed paths and stored URLs
//! 3. **Fetching**: Worker pool gated by the per-domain rate limiter
//! 4. **Extraction**: Build one article record per page
//! 5. **Storage**: Insert-once persistence, duplicates ignored
//! 6. **Output**: Run report stored in the database and optionally as JSON

use clap::Parser;
use std::error::Error;
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use tracing_subscriber::{EnvFilter, fmt as tfmt};

mod cli;
mod config;
mod discovery;
mod error;
mod fetcher;
mod identity;
mod limiter;
mod models;
mod normalize;
mod outputs;
mod pipeline;
mod scrapers;
mod store;
mod utils;

use cli::Cli;
use fetcher::HttpFetcher;
use outputs::json;
use pipeline::Pipeline;
use store::ArticleStore;
use utils::ensure_writable_dir;

#[tokio::main]
#[instrument]
async fn main() -> Result<(), Box<dyn Error>> {
    // --- Tracing init ---
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    tfmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::UtcTime::rfc_3339())
        .init();

    let start_time = std::time::Instant::now();
    info!("news_ingest starting up");

    // Parse CLI
    let args = Cli::parse();
    debug!(?args.config, %args.database_url, ?args.report_dir, "Parsed CLI arguments");

    let config = match args.pipeline_config() {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Configuration rejected");
            return Err(e.into());
        }
    };
    info!(
        sources = config.sources.len(),
        workers = config.worker_pool_size,
        per_domain = config.max_concurrent_per_domain,
        deadline_secs = config.run_deadline_secs,
        "Configuration loaded"
    );
    if config.sources.is_empty() {
        warn!("No sources configured; the run will discover nothing");
    }

    // Early check: ensure the report dir is writable
    if let Some(dir) = args.report_dir.as_deref() {
        if let Err(e) = ensure_writable_dir(dir).await {
            error!(
                path = %dir,
                error = %e,
                "Report directory is not writable (fix perms or choose a different path)"
            );
            return Err(e);
        }
    }

    // ---- Storage ----
    let store = Arc::new(ArticleStore::connect(&args.database_url).await?);
    if let Err(e) = store.migrate().await {
        error!(error = %e, "Schema migration failed");
        store.close().await;
        return Err(e.into());
    }

    let fetcher = match HttpFetcher::new(&config) {
        Ok(fetcher) => Arc::new(fetcher),
        Err(e) => {
            store.close().await;
            return Err(e.into());
        }
    };

    // ---- Run ----
    let pipeline = Pipeline::new(config, fetcher, Arc::clone(&store));
    let result = pipeline.run().await;
    store.close().await;

    let report = match result {
        Ok(report) => report,
        Err(e) => {
            error!(error = %e, "Run aborted");
            return Err(e.into());
        }
    };

    if !report.drifting_sites.is_empty() {
        warn!(sites = ?report.drifting_sites, "Extraction rules may be out of date");
    }

    // ---- Report output ----
    if let Some(dir) = args.report_dir.as_deref() {
        match json::write_report(&report, dir).await {
            Ok(path) => info!(path = %path.display(), "Run report written"),
            Err(e) => error!(error = %e, "Failed to write run report"),
        }
    }

    let elapsed = start_time.elapsed();
    info!(
        ?elapsed,
        secs = elapsed.as_secs(),
        millis = elapsed.subsec_millis(),
        run_id = %report.run_id,
        inserted = report.inserted,
        duplicates = report.duplicates,
        permanent_failures = report.permanent_failures,
        deadline_reached = report.deadline_reached,
        "Execution complete"
    );

    Ok(())
}
