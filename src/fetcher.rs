//! HTTP fetching with rotated identities and response classification.
//!
//! This module provides the network seam of the pipeline:
//! - [`PageFetcher`]: core trait, one GET in and one classified [`FetchOutcome`] out
//! - [`HttpFetcher`]: `reqwest` implementation presenting a random browser identity
//!   from the [`IdentityPool`] on every request
//! - [`retry_backoff`]: delay before a transiently failed task is re-admitted
//!
//! # Classification
//!
//! | Response | Outcome |
//! |----------|---------|
//! | 2xx | `Success` |
//! | 429 | `TransientFailure(RateLimited)` |
//! | 5xx | `TransientFailure(ServerError)` |
//! | timeout | `TransientFailure(Timeout)` |
//! | connect/read error | `TransientFailure(Connection)` |
//! | 401, 403 | `PermanentFailure(Forbidden)` |
//! | any other status | `PermanentFailure(ClientError)` |
//!
//! The fetcher never retries on its own. Retries go back through the domain rate
//! limiter so that a struggling publisher is not hit again before its cooldown.

use async_trait::async_trait;
use rand::{Rng, rng};
use reqwest::header::USER_AGENT;
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, instrument, warn};

use crate::config::PipelineConfig;
use crate::error::{PermanentReason, PipelineError, TransientReason};
use crate::identity::IdentityPool;
use crate::models::{FetchOutcome, RawDocument};

/// Anything that can GET a URL and classify the response.
///
/// Implemented by [`HttpFetcher`] for real traffic and by in-memory fakes in tests.
#[async_trait]
pub trait PageFetcher: Send + Sync + fmt::Debug {
    async fn fetch(&self, url: &str) -> FetchOutcome;
}

/// Map a non-success HTTP status to its failure outcome.
///
/// Returns `None` for 2xx statuses.
pub fn failure_for_status(status: u16) -> Option<FetchOutcome> {
    match status {
        200..=299 => None,
        429 => Some(FetchOutcome::TransientFailure(TransientReason::RateLimited)),
        500..=599 => Some(FetchOutcome::TransientFailure(TransientReason::ServerError(status))),
        401 | 403 => Some(FetchOutcome::PermanentFailure(PermanentReason::Forbidden)),
        other => Some(FetchOutcome::PermanentFailure(PermanentReason::ClientError(other))),
    }
}

fn failure_for_error(e: &reqwest::Error) -> FetchOutcome {
    if e.is_timeout() {
        FetchOutcome::TransientFailure(TransientReason::Timeout)
    } else {
        FetchOutcome::TransientFailure(TransientReason::Connection(e.to_string()))
    }
}

/// Delay before retry number `attempt` (1-based) of a transiently failed task.
///
/// ```text
/// delay = min(base * 2^(attempt-1), ceiling) + random_jitter(0..250ms)
/// ```
pub fn retry_backoff(base: Duration, attempt: u32, ceiling: Duration) -> Duration {
    let exp = attempt.saturating_sub(1).min(16);
    let delay = base.saturating_mul(1 << exp).min(ceiling);
    let jitter_ms: u64 = rng().random_range(0..=250);
    delay + Duration::from_millis(jitter_ms)
}

/// `reqwest`-backed fetcher with identity rotation.
pub struct HttpFetcher {
    client: reqwest::Client,
    identities: IdentityPool,
}

impl fmt::Debug for HttpFetcher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpFetcher")
            .field("identities", &self.identities.len())
            .finish()
    }
}

impl HttpFetcher {
    /// Build a fetcher from the run configuration.
    ///
    /// The client enforces the per-request timeout and follows up to 10 redirects.
    pub fn new(config: &PipelineConfig) -> Result<Self, PipelineError> {
        let identities = config.identities()?;
        let client = reqwest::Client::builder()
            .timeout(config.request_timeout())
            .redirect(reqwest::redirect::Policy::limited(10))
            .build()?;
        Ok(Self { client, identities })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    #[instrument(level = "debug", skip(self))]
    async fn fetch(&self, url: &str) -> FetchOutcome {
        let identity = self.identities.pick();
        let mut request = self.client.get(url).header(USER_AGENT, &identity.user_agent);
        for (name, value) in identity.headers() {
            request = request.header(*name, value);
        }

        let t0 = Instant::now();
        let response = match request.send().await {
            Ok(r) => r,
            Err(e) => {
                warn!(error = %e, elapsed_ms = t0.elapsed().as_millis() as u64, "Request failed");
                return failure_for_error(&e);
            }
        };

        let status = response.status().as_u16();
        if let Some(failure) = failure_for_status(status) {
            debug!(status, outcome = failure.label(), "Non-success response");
            return failure;
        }

        let final_url = response.url().to_string();
        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        match response.text().await {
            Ok(body) => {
                let elapsed = t0.elapsed();
                debug!(status, bytes = body.len(), elapsed_ms = elapsed.as_millis() as u64, family = ?identity.family, "Fetched");
                FetchOutcome::Success(RawDocument {
                    url: url.to_string(),
                    final_url,
                    status,
                    content_type,
                    body,
                    elapsed,
                })
            }
            Err(e) => {
                warn!(error = %e, "Failed reading response body");
                failure_for_error(&e)
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! In-memory web used by pipeline, reader and robots tests.

    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    pub enum FakeResponse {
        Page {
            status: u16,
            content_type: &'static str,
            body: String,
        },
        Timeout,
    }

    impl FakeResponse {
        pub fn html(body: impl Into<String>) -> Self {
            FakeResponse::Page {
                status: 200,
                content_type: "text/html; charset=utf-8",
                body: body.into(),
            }
        }

        pub fn xml(body: impl Into<String>) -> Self {
            FakeResponse::Page {
                status: 200,
                content_type: "application/xml",
                body: body.into(),
            }
        }

        pub fn status(status: u16) -> Self {
            FakeResponse::Page {
                status,
                content_type: "text/html",
                body: String::new(),
            }
        }
    }

    /// Scripted responses per URL. The last scripted response repeats forever;
    /// unknown URLs answer 404.
    #[derive(Debug, Default)]
    pub struct FakeWeb {
        routes: Mutex<HashMap<String, VecDeque<FakeResponse>>>,
        hits: Mutex<HashMap<String, usize>>,
        in_flight: Mutex<HashMap<String, usize>>,
        max_in_flight: Mutex<HashMap<String, usize>>,
        latency: Duration,
    }

    impl FakeWeb {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn with_latency(latency: Duration) -> Self {
            Self {
                latency,
                ..Self::default()
            }
        }

        pub fn route(&self, url: &str, response: FakeResponse) {
            self.script(url, vec![response]);
        }

        pub fn script(&self, url: &str, responses: Vec<FakeResponse>) {
            self.routes
                .lock()
                .unwrap()
                .insert(url.to_string(), responses.into_iter().collect());
        }

        pub fn hits(&self, url: &str) -> usize {
            self.hits.lock().unwrap().get(url).copied().unwrap_or(0)
        }

        pub fn max_in_flight(&self, host: &str) -> usize {
            self.max_in_flight.lock().unwrap().get(host).copied().unwrap_or(0)
        }

        fn next_response(&self, url: &str) -> Option<FakeResponse> {
            let mut routes = self.routes.lock().unwrap();
            let queue = routes.get_mut(url)?;
            if queue.len() > 1 {
                queue.pop_front()
            } else {
                queue.front().cloned()
            }
        }
    }

    #[async_trait]
    impl PageFetcher for FakeWeb {
        async fn fetch(&self, url: &str) -> FetchOutcome {
            let host = crate::models::domain_of(url);
            *self.hits.lock().unwrap().entry(url.to_string()).or_default() += 1;
            {
                let mut in_flight = self.in_flight.lock().unwrap();
                let n = in_flight.entry(host.clone()).or_default();
                *n += 1;
                let mut max = self.max_in_flight.lock().unwrap();
                let m = max.entry(host.clone()).or_default();
                *m = (*m).max(*n);
            }

            if !self.latency.is_zero() {
                tokio::time::sleep(self.latency).await;
            }

            let outcome = match self.next_response(url) {
                None => FetchOutcome::PermanentFailure(PermanentReason::ClientError(404)),
                Some(FakeResponse::Timeout) => FetchOutcome::TransientFailure(TransientReason::Timeout),
                Some(FakeResponse::Page {
                    status,
                    content_type,
                    body,
                }) => match failure_for_status(status) {
                    Some(failure) => failure,
                    None => FetchOutcome::Success(RawDocument {
                        url: url.to_string(),
                        final_url: url.to_string(),
                        status,
                        content_type: Some(content_type.to_string()),
                        body,
                        elapsed: self.latency,
                    }),
                },
            };

            *self.in_flight.lock().unwrap().entry(host).or_default() -= 1;
            outcome
        }
    }
}
