//! The discovery → fetch → dedup pipeline for one run.
//!
//! ```text
//! plan ─► read_all ─► aggregate ─► admit ──(bounded)──► scheduler
//!                                                         │ one FIFO queue per domain
//!                                                         ▼
//!                                     per-domain feeders ── limiter.acquire
//!                                                         │ (bounded, worker_pool_size)
//!                                                         ▼
//!                                   fetch workers ─► extractor ─(bounded)─► gateway
//!                                         │ transient failure
//!                                         └──────► scheduler (retry, attempt + 1)
//! ```
//!
//! Every stage reports to a collector task that builds the [`RunReport`]. The run
//! ends when discovery is exhausted and no admitted task is left, when the run
//! deadline cancels it, or when the store becomes unreachable.

use chrono::{DateTime, Utc};
use rand::{Rng, rng};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{Mutex, Notify, mpsc};
use tokio::task::JoinSet;
use tokio::time::{Instant, sleep, sleep_until};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::PipelineConfig;
use crate::discovery::aggregator::{Admission, Admitter, aggregate, origins};
use crate::discovery::reader::DocumentReader;
use crate::discovery::robots::RobotsCache;
use crate::discovery::{self, Discovery};
use crate::error::{ExtractionError, PermanentReason, PipelineError, StorageError, TransientReason};
use crate::fetcher::{PageFetcher, retry_backoff};
use crate::limiter::{AdmissionPermit, DomainRateLimiter, LimiterSettings, Observation};
use crate::models::{ArticleRecord, FetchOutcome, FetchTask, PersistResult};
use crate::scrapers::Extractor;
use crate::store::ArticleStore;
use crate::utils::truncate_for_log;

/// Extraction health of one site during a run.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SiteHealth {
    pub extraction_attempts: usize,
    pub extraction_failures: usize,
}

impl SiteHealth {
    pub fn failure_ratio(&self) -> f64 {
        if self.extraction_attempts == 0 {
            0.0
        } else {
            self.extraction_failures as f64 / self.extraction_attempts as f64
        }
    }
}

/// A URL that was given up on during the run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FailedFetch {
    pub url: String,
    pub reason: String,
}

/// Counters and health signals for one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub documents_read: usize,
    pub documents_failed: usize,
    pub candidates_discovered: usize,
    pub candidates_unique: usize,
    pub already_stored: usize,
    pub robots_disallowed: usize,
    pub admitted: usize,
    pub fetched: usize,
    pub retries: usize,
    pub permanent_failures: usize,
    pub extraction_failures: usize,
    pub inserted: usize,
    pub duplicates: usize,
    pub storage_errors: usize,
    pub deadline_reached: bool,
    pub sites: BTreeMap<String, SiteHealth>,
    pub drifting_sites: Vec<String>,
    pub failures: Vec<FailedFetch>,
}

impl RunReport {
    pub fn new(run_id: String) -> Self {
        Self {
            run_id,
            started_at: Utc::now(),
            finished_at: None,
            documents_read: 0,
            documents_failed: 0,
            candidates_discovered: 0,
            candidates_unique: 0,
            already_stored: 0,
            robots_disallowed: 0,
            admitted: 0,
            fetched: 0,
            retries: 0,
            permanent_failures: 0,
            extraction_failures: 0,
            inserted: 0,
            duplicates: 0,
            storage_errors: 0,
            deadline_reached: false,
            sites: BTreeMap::new(),
            drifting_sites: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// Flag sites whose extraction failure ratio suggests their markup changed.
    fn detect_drift(&mut self, min_samples: usize, failure_ratio: f64) {
        self.drifting_sites = self
            .sites
            .iter()
            .filter(|(_, h)| h.extraction_attempts >= min_samples && h.failure_ratio() >= failure_ratio)
            .map(|(site, _)| site.clone())
            .collect();
        for site in &self.drifting_sites {
            let health = &self.sites[site];
            warn!(
                %site,
                attempts = health.extraction_attempts,
                failures = health.extraction_failures,
                "Extraction rules look out of date for site"
            );
        }
    }
}

/// `run_20250506_143000_3fa9c2`
pub fn new_run_id() -> String {
    let suffix: u32 = rng().random_range(0..0x100_0000);
    format!("run_{}_{suffix:06x}", Utc::now().format("%Y%m%d_%H%M%S"))
}

#[derive(Debug)]
enum Event {
    Admitted,
    AlreadyStored,
    RobotsDisallowed,
    AdmissionFailed,
    Fetched,
    Retried,
    GaveUp { url: String, reason: PermanentReason },
    Extracted { site: String },
    ExtractionFailed { site: String },
    Persisted(PersistResult),
}

fn apply(report: &mut RunReport, event: Event) {
    match event {
        Event::Admitted => report.admitted += 1,
        Event::AlreadyStored => report.already_stored += 1,
        Event::RobotsDisallowed => report.robots_disallowed += 1,
        Event::AdmissionFailed => report.storage_errors += 1,
        Event::Fetched => report.fetched += 1,
        Event::Retried => report.retries += 1,
        Event::GaveUp { url, reason } => {
            report.permanent_failures += 1;
            report.failures.push(FailedFetch {
                url,
                reason: reason.to_string(),
            });
        }
        Event::Extracted { site } => report.sites.entry(site).or_default().extraction_attempts += 1,
        Event::ExtractionFailed { site } => {
            report.extraction_failures += 1;
            let health = report.sites.entry(site).or_default();
            health.extraction_attempts += 1;
            health.extraction_failures += 1;
        }
        Event::Persisted(PersistResult::Inserted) => report.inserted += 1,
        Event::Persisted(PersistResult::DuplicateIgnored) => report.duplicates += 1,
        Event::Persisted(PersistResult::StorageError(_)) => report.storage_errors += 1,
    }
}

/// A task that holds its domain's admission permit.
#[derive(Debug)]
struct Admitted {
    task: FetchTask,
    permit: AdmissionPermit,
}

/// Tasks admitted but not yet finished, so the scheduler knows when to stop.
#[derive(Debug, Default)]
struct Outstanding {
    count: AtomicUsize,
    idle: Notify,
}

impl Outstanding {
    fn add(&self) {
        self.count.fetch_add(1, Ordering::SeqCst);
    }

    fn finish(&self) {
        self.count.fetch_sub(1, Ordering::SeqCst);
        self.idle.notify_one();
    }

    fn is_idle(&self) -> bool {
        self.count.load(Ordering::SeqCst) == 0
    }
}

/// Everything a fetch worker needs.
struct WorkerContext {
    fetcher: Arc<dyn PageFetcher>,
    limiter: Arc<DomainRateLimiter>,
    extractor: Arc<Extractor>,
    max_retries: u32,
    retry_base: std::time::Duration,
    retry_ceiling: std::time::Duration,
    retry_tx: mpsc::UnboundedSender<FetchTask>,
    persist_tx: mpsc::Sender<ArticleRecord>,
    events: mpsc::UnboundedSender<Event>,
    outstanding: Arc<Outstanding>,
    cancel: CancellationToken,
}

impl WorkerContext {
    fn emit(&self, event: Event) {
        let _ = self.events.send(event);
    }

    fn observation(&self, outcome: &FetchOutcome) -> Observation {
        match outcome {
            FetchOutcome::Success(doc) => self.limiter.classify(doc.elapsed),
            FetchOutcome::TransientFailure(_) => Observation::Failure,
            FetchOutcome::PermanentFailure(PermanentReason::Forbidden) => Observation::Failure,
            FetchOutcome::PermanentFailure(_) => Observation::Clean,
        }
    }

    async fn handle(&self, task: FetchTask, outcome: FetchOutcome) {
        match outcome {
            FetchOutcome::Success(doc) => {
                self.emit(Event::Fetched);
                match self.extractor.extract(&doc, &task.source_site) {
                    Ok(mut record) => {
                        if record.publication_date.is_none() {
                            record.publication_date = task.hint_date;
                        }
                        self.emit(Event::Extracted {
                            site: task.source_site.clone(),
                        });
                        if self.persist_tx.send(record).await.is_err() {
                            debug!(url = %task.url, "Gateway closed, record dropped");
                        }
                    }
                    Err(e) => self.extraction_failed(&task, e),
                }
                self.outstanding.finish();
            }
            FetchOutcome::TransientFailure(reason) => self.retry_or_give_up(task, reason),
            FetchOutcome::PermanentFailure(reason) => {
                info!(url = %task.url, %reason, "Giving up on URL");
                self.emit(Event::GaveUp { url: task.url, reason });
                self.outstanding.finish();
            }
        }
    }

    fn extraction_failed(&self, task: &FetchTask, error: ExtractionError) {
        warn!(url = %task.url, site = %task.source_site, %error, "Extraction failed");
        self.emit(Event::ExtractionFailed {
            site: task.source_site.clone(),
        });
    }

    fn retry_or_give_up(&self, mut task: FetchTask, reason: TransientReason) {
        if task.attempt >= self.max_retries {
            let reason = PermanentReason::RetriesExhausted(reason);
            info!(url = %task.url, attempts = task.attempt + 1, %reason, "Giving up on URL");
            self.emit(Event::GaveUp { url: task.url, reason });
            self.outstanding.finish();
            return;
        }
        task.attempt += 1;
        let backoff = retry_backoff(self.retry_base, task.attempt, self.retry_ceiling);
        task.not_before = Instant::now() + backoff;
        debug!(url = %task.url, attempt = task.attempt, %reason, backoff_ms = backoff.as_millis() as u64, "Scheduling retry");
        self.emit(Event::Retried);
        if self.retry_tx.send(task).is_err() {
            self.outstanding.finish();
        }
    }
}

#[instrument(level = "debug", skip_all, fields(worker = id))]
async fn run_worker(id: usize, admitted: Arc<Mutex<mpsc::Receiver<Admitted>>>, ctx: Arc<WorkerContext>) {
    loop {
        let next = {
            let mut rx = admitted.lock().await;
            tokio::select! {
                _ = ctx.cancel.cancelled() => None,
                next = rx.recv() => next,
            }
        };
        let Some(Admitted { task, permit }) = next else {
            break;
        };

        let outcome = tokio::select! {
            _ = ctx.cancel.cancelled() => {
                debug!(url = %task.url, "Fetch abandoned at deadline");
                drop(permit);
                ctx.outstanding.finish();
                break;
            }
            outcome = ctx.fetcher.fetch(&task.url) => outcome,
        };
        ctx.limiter.observe(permit.domain(), ctx.observation(&outcome));
        drop(permit);
        ctx.handle(task, outcome).await;
    }
}

/// Hands one domain's tasks to the workers as the limiter admits them.
async fn feed_domain(
    domain: String,
    mut queue: mpsc::UnboundedReceiver<FetchTask>,
    limiter: Arc<DomainRateLimiter>,
    admitted_tx: mpsc::Sender<Admitted>,
    cancel: CancellationToken,
) {
    while let Some(task) = queue.recv().await {
        let admitted = async {
            sleep_until(task.not_before).await;
            limiter.acquire(&domain).await
        };
        let permit = tokio::select! {
            _ = cancel.cancelled() => return,
            permit = admitted => permit,
        };
        let sent = tokio::select! {
            _ = cancel.cancelled() => false,
            sent = admitted_tx.send(Admitted { task, permit }) => sent.is_ok(),
        };
        if !sent {
            return;
        }
    }
}

/// Routes new and retried tasks into per-domain queues until no work is left.
async fn schedule(
    mut intake: mpsc::Receiver<FetchTask>,
    mut retries: mpsc::UnboundedReceiver<FetchTask>,
    admitted_tx: mpsc::Sender<Admitted>,
    limiter: Arc<DomainRateLimiter>,
    outstanding: Arc<Outstanding>,
    cancel: CancellationToken,
) {
    let mut queues: HashMap<String, mpsc::UnboundedSender<FetchTask>> = HashMap::new();
    let mut feeders = JoinSet::new();
    let mut intake_open = true;

    let mut route = |task: FetchTask, feeders: &mut JoinSet<()>| {
        let domain = task.domain();
        let queue = queues.entry(domain.clone()).or_insert_with(|| {
            let (tx, rx) = mpsc::unbounded_channel();
            feeders.spawn(feed_domain(
                domain.clone(),
                rx,
                Arc::clone(&limiter),
                admitted_tx.clone(),
                cancel.clone(),
            ));
            debug!(%domain, "Opened domain queue");
            tx
        });
        let _ = queue.send(task);
    };

    loop {
        if !intake_open && outstanding.is_idle() {
            break;
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            task = intake.recv(), if intake_open => match task {
                Some(task) => route(task, &mut feeders),
                None => intake_open = false,
            },
            Some(task) = retries.recv() => route(task, &mut feeders),
            _ = outstanding.idle.notified() => {}
        }
    }

    drop(route);
    drop(queues);
    drop(admitted_tx);
    while feeders.join_next().await.is_some() {}
}

/// One configured pipeline.
pub struct Pipeline {
    config: PipelineConfig,
    fetcher: Arc<dyn PageFetcher>,
    store: Arc<ArticleStore>,
    limiter: Arc<DomainRateLimiter>,
    extractor: Arc<Extractor>,
}

impl Pipeline {
    pub fn new(config: PipelineConfig, fetcher: Arc<dyn PageFetcher>, store: Arc<ArticleStore>) -> Self {
        let limiter = Arc::new(DomainRateLimiter::new(LimiterSettings::from(&config)));
        let extractor = Arc::new(Extractor::new(&config));
        info!(sites = ?extractor.sites(), "Extraction rules loaded");
        Self {
            config,
            fetcher,
            store,
            limiter,
            extractor,
        }
    }

    pub fn limiter(&self) -> &DomainRateLimiter {
        &self.limiter
    }

    /// Execute one full run.
    ///
    /// # Errors
    ///
    /// [`PipelineError::StorageUnavailable`] when the store connection is lost.
    /// Every other failure is per document or per URL and ends up in the report.
    #[instrument(level = "info", skip_all)]
    pub async fn run(&self) -> Result<RunReport, PipelineError> {
        let mut report = RunReport::new(new_run_id());
        info!(run_id = %report.run_id, sources = self.config.sources.len(), "Pipeline run starting");
        self.store.record_run(&report).await.map_err(|e| {
            error!(error = %e, "Cannot record run start");
            PipelineError::StorageUnavailable(e)
        })?;

        let cancel = CancellationToken::new();
        let deadline = {
            let cancel = cancel.clone();
            let after = self.config.run_deadline();
            tokio::spawn(async move {
                sleep(after).await;
                warn!(deadline_secs = after.as_secs_f64(), "Run deadline reached, cancelling");
                cancel.cancel();
            })
        };

        let robots = Arc::new(RobotsCache::new(Arc::clone(&self.fetcher), self.config.robots_agent.clone()));
        let reader = Arc::new(DocumentReader::new(Arc::clone(&self.fetcher), &self.config));

        let discovery = tokio::select! {
            _ = cancel.cancelled() => Discovery::default(),
            d = async {
                let documents = discovery::plan_documents(&self.config, self.fetcher.as_ref(), &robots).await;
                discovery::read_all(reader, documents, self.config.discovery_concurrency).await
            } => d,
        };
        report.documents_read = discovery.documents_read;
        report.documents_failed = discovery.documents_failed;
        report.candidates_discovered = discovery.candidate_count();

        let admitter = Admitter::new(Arc::clone(&robots), Arc::clone(&self.store));
        tokio::select! {
            _ = cancel.cancelled() => {}
            _ = admitter.prefetch_robots(origins(&discovery.batches), self.config.discovery_concurrency) => {}
        }

        let (fatal, report) = self.fetch_phase(report, discovery, admitter, cancel.clone()).await;
        deadline.abort();

        let mut report = report;
        report.deadline_reached = cancel.is_cancelled() && fatal.is_none();
        report.finished_at = Some(Utc::now());
        report.detect_drift(self.config.drift_min_samples, self.config.drift_failure_ratio);

        if let Some(e) = fatal {
            error!(error = %e, inserted = report.inserted, "Run aborted, storage unavailable");
            return Err(PipelineError::StorageUnavailable(e));
        }
        if let Err(e) = self.store.record_run(&report).await {
            warn!(error = %e, "Could not record run report");
        }
        info!(
            run_id = %report.run_id,
            unique = report.candidates_unique,
            admitted = report.admitted,
            inserted = report.inserted,
            duplicates = report.duplicates,
            failures = report.permanent_failures,
            deadline_reached = report.deadline_reached,
            "Pipeline run finished"
        );
        Ok(report)
    }

    /// Admission, scheduling, fetching and persistence. Returns the fatal storage
    /// error that aborted the phase, if any, and the completed report.
    async fn fetch_phase(
        &self,
        report: RunReport,
        discovery: Discovery,
        admitter: Admitter,
        cancel: CancellationToken,
    ) -> (Option<StorageError>, RunReport) {
        let cfg = &self.config;
        let (events_tx, mut events_rx) = mpsc::unbounded_channel::<Event>();
        let (task_tx, task_rx) = mpsc::channel::<FetchTask>(cfg.queue_capacity);
        let (retry_tx, retry_rx) = mpsc::unbounded_channel::<FetchTask>();
        let (admitted_tx, admitted_rx) = mpsc::channel::<Admitted>(cfg.worker_pool_size);
        let (persist_tx, mut persist_rx) = mpsc::channel::<ArticleRecord>(cfg.worker_pool_size * 2);
        let outstanding = Arc::new(Outstanding::default());
        let run_id = report.run_id.clone();

        let collector = tokio::spawn(async move {
            let mut report = report;
            while let Some(event) = events_rx.recv().await {
                apply(&mut report, event);
            }
            report
        });

        let gateway = {
            let store = Arc::clone(&self.store);
            let events = events_tx.clone();
            let cancel = cancel.clone();
            let run_id = run_id.clone();
            tokio::spawn(async move {
                while let Some(record) = persist_rx.recv().await {
                    let result = store.persist(&record, Some(&run_id)).await;
                    let fatal = match &result {
                        PersistResult::Inserted => {
                            debug!(url = %record.url, "Inserted");
                            None
                        }
                        PersistResult::DuplicateIgnored => {
                            debug!(url = %record.url, "Duplicate ignored");
                            None
                        }
                        PersistResult::StorageError(e) if e.is_fatal() => Some(e.clone()),
                        PersistResult::StorageError(e) => {
                            warn!(url = %record.url, title = %truncate_for_log(&record.title, 80), error = %e, "Record not stored");
                            None
                        }
                    };
                    let _ = events.send(Event::Persisted(result));
                    if fatal.is_some() {
                        cancel.cancel();
                        return fatal;
                    }
                }
                None
            })
        };

        let scheduler = tokio::spawn(schedule(
            task_rx,
            retry_rx,
            admitted_tx,
            Arc::clone(&self.limiter),
            Arc::clone(&outstanding),
            cancel.clone(),
        ));

        let ctx = Arc::new(WorkerContext {
            fetcher: Arc::clone(&self.fetcher),
            limiter: Arc::clone(&self.limiter),
            extractor: Arc::clone(&self.extractor),
            max_retries: cfg.max_retries,
            retry_base: cfg.retry_base_delay(),
            retry_ceiling: cfg.delay_ceiling(),
            retry_tx,
            persist_tx,
            events: events_tx.clone(),
            outstanding: Arc::clone(&outstanding),
            cancel: cancel.clone(),
        });
        let admitted_rx = Arc::new(Mutex::new(admitted_rx));
        let mut workers = JoinSet::new();
        for id in 0..cfg.worker_pool_size {
            workers.spawn(run_worker(id, Arc::clone(&admitted_rx), Arc::clone(&ctx)));
        }
        drop(admitted_rx);
        drop(ctx);

        let mut fatal = None;
        let mut unique = 0usize;
        for candidate in aggregate(discovery.batches) {
            if cancel.is_cancelled() {
                break;
            }
            unique += 1;
            match admitter.admit(candidate).await {
                Ok(Admission::New(task)) => {
                    outstanding.add();
                    let sent = tokio::select! {
                        _ = cancel.cancelled() => false,
                        sent = task_tx.send(task) => sent.is_ok(),
                    };
                    if !sent {
                        outstanding.finish();
                        break;
                    }
                    let _ = events_tx.send(Event::Admitted);
                }
                Ok(Admission::AlreadyStored) => {
                    let _ = events_tx.send(Event::AlreadyStored);
                }
                Ok(Admission::RobotsDisallowed) => {
                    let _ = events_tx.send(Event::RobotsDisallowed);
                }
                Err(e) if e.is_fatal() => {
                    cancel.cancel();
                    fatal = Some(e);
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Admission check failed, candidate skipped");
                    let _ = events_tx.send(Event::AdmissionFailed);
                }
            }
        }
        drop(task_tx);
        drop(events_tx);
        info!(unique, "Admission finished");

        let _ = scheduler.await;
        while workers.join_next().await.is_some() {}
        if let Ok(Some(e)) = gateway.await {
            fatal.get_or_insert(e);
        }
        let mut report = match collector.await {
            Ok(report) => report,
            Err(e) => {
                error!(error = %e, "Report collector failed");
                RunReport::new(run_id)
            }
        };
        report.candidates_unique = unique;
        (fatal, report)
    }
}
