//! Discovery aggregation and admission.
//!
//! [`aggregate`] merges the candidates of every discovery document into one lazy
//! sequence, unique by normalized URL with first-seen metadata winning.
//! [`Admitter::admit`] then decides, per candidate, whether a fetch task is
//! created: robots.txt is consulted first, then the store's `exists` pre-filter.
//! Nothing is remembered between runs; an interrupted run re-invoked later simply
//! finds the already-stored URLs in the store.

use futures::stream::{self, StreamExt};
use itertools::Itertools;
use std::sync::Arc;
use tracing::{debug, info, instrument};

use crate::discovery::robots::{RobotsCache, origin_of};
use crate::error::StorageError;
use crate::models::{CandidateUrl, FetchTask};
use crate::store::ArticleStore;

/// Merge candidate batches, keeping the first occurrence of each URL.
pub fn aggregate<I, B>(batches: I) -> impl Iterator<Item = CandidateUrl>
where
    I: IntoIterator<Item = B>,
    B: IntoIterator<Item = CandidateUrl>,
{
    batches.into_iter().flatten().unique_by(|c| c.url.clone())
}

/// Distinct origins across all batches, for robots.txt prefetching.
pub fn origins<'a>(batches: impl IntoIterator<Item = &'a Vec<CandidateUrl>>) -> Vec<String> {
    batches
        .into_iter()
        .flatten()
        .filter_map(|c| origin_of(&c.url))
        .unique()
        .collect()
}

/// Admission decision for one candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Admission {
    New(FetchTask),
    AlreadyStored,
    RobotsDisallowed,
}

#[derive(Debug, Clone)]
pub struct Admitter {
    robots: Arc<RobotsCache>,
    store: Arc<ArticleStore>,
}

impl Admitter {
    pub fn new(robots: Arc<RobotsCache>, store: Arc<ArticleStore>) -> Self {
        Self { robots, store }
    }

    /// Load robots.txt for every origin up front, `concurrency` at a time.
    #[instrument(level = "info", skip_all, fields(origins = origins.len()))]
    pub async fn prefetch_robots(&self, origins: Vec<String>, concurrency: usize) {
        stream::iter(origins)
            .for_each_concurrent(concurrency.max(1), |origin| {
                let robots = Arc::clone(&self.robots);
                async move { robots.prefetch(&origin).await }
            })
            .await;
        info!("robots.txt cache warmed");
    }

    pub async fn admit(&self, candidate: CandidateUrl) -> Result<Admission, StorageError> {
        if !self.robots.is_allowed(&candidate.url).await {
            return Ok(Admission::RobotsDisallowed);
        }
        if self.store.exists(&candidate.url).await? {
            debug!(url = %candidate.url, "Already stored");
            return Ok(Admission::AlreadyStored);
        }
        Ok(Admission::New(FetchTask::from_candidate(candidate)))
    }
}
