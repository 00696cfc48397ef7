//! Per-domain admission control.
//!
//! Every fetch must be admitted by the [`DomainRateLimiter`] first. For each
//! publisher domain the limiter keeps:
//! - an in-flight count bounded by `max_concurrent`
//! - the time of the last admission
//! - an adaptive `current_delay` between `floor` and `ceiling`
//!
//! A task is admitted only when the domain has a free in-flight slot AND
//! `current_delay` has elapsed since the previous admission. Waiters for one
//! domain are served in FIFO order; waiting on one domain never holds up another.
//!
//! # Adaptive delay
//!
//! ```text
//! slow or failed response:   delay = min(delay * multiplier, ceiling)
//! `decay_after` clean ones:  delay = max(delay / multiplier, floor)
//! ```
//!
//! The limiter never drops a task, it only delays it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{Instant, sleep};
use tracing::{debug, info};

use crate::config::PipelineConfig;

/// Growth starting point when the configured floor is zero.
const ZERO_FLOOR_STEP: Duration = Duration::from_millis(500);

/// Tuning for every domain handled by one limiter.
#[derive(Debug, Clone, PartialEq)]
pub struct LimiterSettings {
    pub max_concurrent: usize,
    pub floor: Duration,
    pub ceiling: Duration,
    pub multiplier: f64,
    pub decay_after: u32,
    pub slow_response: Duration,
}

impl From<&PipelineConfig> for LimiterSettings {
    fn from(config: &PipelineConfig) -> Self {
        Self {
            max_concurrent: config.max_concurrent_per_domain.max(1),
            floor: config.delay_floor(),
            ceiling: config.delay_ceiling(),
            multiplier: config.backoff_multiplier,
            decay_after: config.decay_after.max(1),
            slow_response: config.slow_response(),
        }
    }
}

/// What a finished fetch tells the limiter about its domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    Clean,
    Slow,
    Failure,
}

/// Externally visible state of one domain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DomainPhase {
    Idle,
    Admitting { in_flight: usize },
    Cooling(Duration),
}

#[derive(Debug)]
struct DomainState {
    in_flight: usize,
    last_admission: Option<Instant>,
    current_delay: Duration,
    clean_streak: u32,
}

#[derive(Debug)]
struct DomainSlot {
    /// Held by the task at the head of the domain's queue. Tokio's mutex is fair,
    /// so admission order is FIFO.
    gate: tokio::sync::Mutex<()>,
    state: Mutex<DomainState>,
    released: Notify,
}

impl DomainSlot {
    fn state(&self) -> MutexGuard<'_, DomainState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Proof of admission. Dropping it frees the domain's in-flight slot.
#[derive(Debug)]
pub struct AdmissionPermit {
    domain: String,
    slot: Arc<DomainSlot>,
}

impl AdmissionPermit {
    pub fn domain(&self) -> &str {
        &self.domain
    }
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        {
            let mut state = self.slot.state();
            state.in_flight = state.in_flight.saturating_sub(1);
        }
        self.slot.released.notify_one();
    }
}

/// Admission control keyed by publisher domain.
#[derive(Debug)]
pub struct DomainRateLimiter {
    settings: LimiterSettings,
    domains: Mutex<HashMap<String, Arc<DomainSlot>>>,
}

impl DomainRateLimiter {
    pub fn new(settings: LimiterSettings) -> Self {
        Self {
            settings,
            domains: Mutex::new(HashMap::new()),
        }
    }

    pub fn settings(&self) -> &LimiterSettings {
        &self.settings
    }

    fn slot(&self, domain: &str) -> Arc<DomainSlot> {
        let mut domains = self.domains.lock().unwrap_or_else(PoisonError::into_inner);
        Arc::clone(domains.entry(domain.to_string()).or_insert_with(|| {
            Arc::new(DomainSlot {
                gate: tokio::sync::Mutex::new(()),
                state: Mutex::new(DomainState {
                    in_flight: 0,
                    last_admission: None,
                    current_delay: self.settings.floor,
                    clean_streak: 0,
                }),
                released: Notify::new(),
            })
        }))
    }

    /// Wait until `domain` may receive another request, then admit.
    pub async fn acquire(&self, domain: &str) -> AdmissionPermit {
        let slot = self.slot(domain);
        let _turn = slot.gate.lock().await;

        // Only the gate holder increments `in_flight`, so once a slot is seen free
        // it stays free until we take it.
        loop {
            if slot.state().in_flight < self.settings.max_concurrent {
                break;
            }
            slot.released.notified().await;
        }

        // Re-read the delay after every sleep: it may have grown meanwhile.
        loop {
            let wait = {
                let state = slot.state();
                match state.last_admission {
                    Some(last) => (last + state.current_delay).saturating_duration_since(Instant::now()),
                    None => Duration::ZERO,
                }
            };
            if wait.is_zero() {
                break;
            }
            debug!(%domain, wait_ms = wait.as_millis() as u64, "Cooling before admission");
            sleep(wait).await;
        }

        {
            let mut state = slot.state();
            state.in_flight += 1;
            state.last_admission = Some(Instant::now());
        }
        AdmissionPermit {
            domain: domain.to_string(),
            slot: Arc::clone(&slot),
        }
    }

    /// Classify a response latency.
    pub fn classify(&self, elapsed: Duration) -> Observation {
        if elapsed >= self.settings.slow_response {
            Observation::Slow
        } else {
            Observation::Clean
        }
    }

    /// Feed a response observation back into the domain's delay.
    pub fn observe(&self, domain: &str, observation: Observation) -> Duration {
        let slot = self.slot(domain);
        let mut state = slot.state();
        let s = &self.settings;
        let before = state.current_delay;
        match observation {
            Observation::Clean => {
                state.clean_streak += 1;
                if state.clean_streak >= s.decay_after {
                    state.clean_streak = 0;
                    state.current_delay = state.current_delay.div_f64(s.multiplier).max(s.floor);
                }
            }
            Observation::Slow | Observation::Failure => {
                state.clean_streak = 0;
                let grown = if state.current_delay.is_zero() {
                    ZERO_FLOOR_STEP
                } else {
                    state.current_delay.mul_f64(s.multiplier)
                };
                state.current_delay = grown.min(s.ceiling);
            }
        }
        if state.current_delay != before {
            info!(
                %domain,
                ?observation,
                from_ms = before.as_millis() as u64,
                to_ms = state.current_delay.as_millis() as u64,
                "Adjusted domain delay"
            );
        }
        state.current_delay
    }

    pub fn current_delay(&self, domain: &str) -> Duration {
        self.slot(domain).state().current_delay
    }

    pub fn phase(&self, domain: &str) -> DomainPhase {
        let slot = self.slot(domain);
        let state = slot.state();
        if state.in_flight > 0 {
            return DomainPhase::Admitting {
                in_flight: state.in_flight,
            };
        }
        match state.last_admission {
            Some(last) => {
                let remaining = (last + state.current_delay).saturating_duration_since(Instant::now());
                if remaining.is_zero() {
                    DomainPhase::Idle
                } else {
                    DomainPhase::Cooling(remaining)
                }
            }
            None => DomainPhase::Idle,
        }
    }
}
