//! Job execution, scheduling and live progress broadcast for Binder.

use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use binder_adapters::{ItemResolver, ResolveError};
use binder_core::{
    CardIdentity, JobKind, JobRecordView, JobStatus, ProgressView, Resolution, TriggerKind,
};
use binder_storage::{BackoffPolicy, FetchError, Store, StoreError};
use chrono::Utc;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::broadcast;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{debug, info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "binder-sync";

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub scheduler_enabled: bool,
    pub pricing_cron: String,
    pub metadata_cron: String,
    pub batch_size: u32,
    pub pricing_stale_after: Duration,
    pub metadata_stale_after: Duration,
    pub pricing_job_timeout: Duration,
    pub metadata_job_timeout: Duration,
    pub pricing_item_timeout: Duration,
    pub metadata_item_timeout: Duration,
    pub pricing_min_interval: Duration,
    pub metadata_min_interval: Duration,
    pub http_timeout: Duration,
    pub user_agent: String,
    pub backoff: BackoffPolicy,
    pub unavailable_streak_limit: u32,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            database_url: "sqlite://binder.db".to_string(),
            scheduler_enabled: false,
            // Daily at 03:00 and Sunday at 02:00, matching how often prices
            // move versus how often card metadata changes.
            pricing_cron: "0 0 3 * * *".to_string(),
            metadata_cron: "0 0 2 * * Sun".to_string(),
            batch_size: 200,
            pricing_stale_after: Duration::from_secs(20 * 60 * 60),
            metadata_stale_after: Duration::from_secs(6 * 24 * 60 * 60),
            pricing_job_timeout: Duration::from_secs(300),
            metadata_job_timeout: Duration::from_secs(600),
            pricing_item_timeout: Duration::from_secs(30),
            metadata_item_timeout: Duration::from_secs(90),
            pricing_min_interval: Duration::from_millis(2000),
            metadata_min_interval: Duration::from_millis(500),
            http_timeout: Duration::from_secs(30),
            user_agent: "binder/0.1 (card collection manager)".to_string(),
            backoff: BackoffPolicy::default(),
            unavailable_streak_limit: 5,
        }
    }
}

fn env_string(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_bool(key: &str) -> bool {
    std::env::var(key)
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
        .unwrap_or(false)
}

fn env_u64(key: &str, default: u64) -> u64 {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            database_url: env_string("DATABASE_URL", &defaults.database_url),
            scheduler_enabled: env_bool("BINDER_SCHEDULER_ENABLED"),
            pricing_cron: env_string("BINDER_PRICING_CRON", &defaults.pricing_cron),
            metadata_cron: env_string("BINDER_METADATA_CRON", &defaults.metadata_cron),
            batch_size: env_u64("BINDER_BATCH_SIZE", defaults.batch_size as u64) as u32,
            pricing_stale_after: Duration::from_secs(env_u64(
                "BINDER_PRICING_STALE_SECS",
                defaults.pricing_stale_after.as_secs(),
            )),
            metadata_stale_after: Duration::from_secs(env_u64(
                "BINDER_METADATA_STALE_SECS",
                defaults.metadata_stale_after.as_secs(),
            )),
            pricing_job_timeout: Duration::from_secs(env_u64(
                "BINDER_PRICING_JOB_TIMEOUT_SECS",
                defaults.pricing_job_timeout.as_secs(),
            )),
            metadata_job_timeout: Duration::from_secs(env_u64(
                "BINDER_METADATA_JOB_TIMEOUT_SECS",
                defaults.metadata_job_timeout.as_secs(),
            )),
            pricing_item_timeout: Duration::from_secs(env_u64(
                "BINDER_PRICING_ITEM_TIMEOUT_SECS",
                defaults.pricing_item_timeout.as_secs(),
            )),
            metadata_item_timeout: Duration::from_secs(env_u64(
                "BINDER_METADATA_ITEM_TIMEOUT_SECS",
                defaults.metadata_item_timeout.as_secs(),
            )),
            pricing_min_interval: Duration::from_millis(env_u64(
                "BINDER_PRICING_MIN_INTERVAL_MS",
                defaults.pricing_min_interval.as_millis() as u64,
            )),
            metadata_min_interval: Duration::from_millis(env_u64(
                "BINDER_METADATA_MIN_INTERVAL_MS",
                defaults.metadata_min_interval.as_millis() as u64,
            )),
            http_timeout: Duration::from_secs(env_u64(
                "BINDER_HTTP_TIMEOUT_SECS",
                defaults.http_timeout.as_secs(),
            )),
            user_agent: env_string("BINDER_USER_AGENT", &defaults.user_agent),
            backoff: defaults.backoff,
            unavailable_streak_limit: env_u64(
                "BINDER_UNAVAILABLE_STREAK",
                defaults.unavailable_streak_limit as u64,
            ) as u32,
        }
    }

    pub fn job_timeout(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Pricing => self.pricing_job_timeout,
            JobKind::Metadata => self.metadata_job_timeout,
        }
    }

    pub fn item_timeout(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Pricing => self.pricing_item_timeout,
            JobKind::Metadata => self.metadata_item_timeout,
        }
    }

    pub fn stale_after(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Pricing => self.pricing_stale_after,
            JobKind::Metadata => self.metadata_stale_after,
        }
    }

    pub fn min_interval(&self, kind: JobKind) -> Duration {
        match kind {
            JobKind::Pricing => self.pricing_min_interval,
            JobKind::Metadata => self.metadata_min_interval,
        }
    }
}

// ---------------------------------------------------------------------------
// Progress broadcast
// ---------------------------------------------------------------------------

/// Fan-out of live job progress. Subscribers come and go freely; when nobody
/// is listening a publish is a no-op, so the broadcaster can never slow or
/// fail a job.
#[derive(Debug, Clone)]
pub struct ProgressBroadcaster {
    tx: broadcast::Sender<ProgressView>,
}

impl Default for ProgressBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressView> {
        self.tx.subscribe()
    }

    pub fn publish(&self, view: &ProgressView) {
        let _ = self.tx.send(view.clone());
    }
}

// ---------------------------------------------------------------------------
// Per-item failure taxonomy
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
enum ItemError {
    #[error("no matching record found for '{name}'")]
    NoMatch { name: String },
    #[error("source reported unavailable")]
    Unavailable,
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl ItemError {
    /// Failures that hint the source itself is down and feed the
    /// short-circuit streak. A served HTTP error or a miss proves the source
    /// is alive, so those reset it.
    fn is_transport_class(&self) -> bool {
        match self {
            Self::Unavailable => true,
            Self::Fetch(err) => err.is_transport_class(),
            _ => false,
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Self::NoMatch { .. } => "no_match",
            Self::Unavailable => "unavailable",
            Self::Fetch(FetchError::Timeout { .. }) => "timeout",
            Self::Fetch(FetchError::Transport { .. }) => "transport",
            Self::Fetch(FetchError::HttpStatus { .. }) => "http_status",
            Self::Store(StoreError::Constraint(_)) => "constraint",
            Self::Store(_) => "storage",
        }
    }
}

fn item_error_from_resolve(err: ResolveError) -> ItemError {
    match err {
        ResolveError::Fetch(err) => ItemError::Fetch(err),
        ResolveError::Store(err) => ItemError::Store(err),
    }
}

// ---------------------------------------------------------------------------
// Sync service
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerOutcome {
    Accepted { job_id: i64 },
    AlreadyRunning,
}

#[derive(Debug, Clone, Serialize)]
pub struct JobRunSummary {
    pub job_id: i64,
    pub kind: JobKind,
    pub status: JobStatus,
    pub items_total: u64,
    pub items_processed: u64,
    pub items_succeeded: u64,
    pub items_failed: u64,
    pub duration_ms: i64,
    pub error_message: Option<String>,
}

/// Owns the store, the two source resolvers and the broadcaster; everything
/// above it (web, cli, scheduler) talks to jobs through this.
pub struct SyncService {
    store: Store,
    config: SyncConfig,
    pricing_resolver: Arc<dyn ItemResolver>,
    metadata_resolver: Arc<dyn ItemResolver>,
    broadcaster: ProgressBroadcaster,
}

impl SyncService {
    pub fn new(
        store: Store,
        config: SyncConfig,
        pricing_resolver: Arc<dyn ItemResolver>,
        metadata_resolver: Arc<dyn ItemResolver>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            config,
            pricing_resolver,
            metadata_resolver,
            broadcaster: ProgressBroadcaster::new(),
        })
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProgressView> {
        self.broadcaster.subscribe()
    }

    fn resolver_for(&self, kind: JobKind) -> &Arc<dyn ItemResolver> {
        match kind {
            JobKind::Pricing => &self.pricing_resolver,
            JobKind::Metadata => &self.metadata_resolver,
        }
    }

    /// Start a job in the background. Returns immediately: callers never
    /// wait for a multi-minute batch. The job record's `running` status is
    /// the lock, so a second trigger of the same kind is rejected here.
    pub async fn trigger(
        self: Arc<Self>,
        kind: JobKind,
        trigger_kind: TriggerKind,
        card_ids: Option<Vec<i64>>,
    ) -> Result<TriggerOutcome> {
        let Some(job_id) = self
            .store
            .create_running_job(kind, trigger_kind, Utc::now())
            .await
            .context("creating job record")?
        else {
            return Ok(TriggerOutcome::AlreadyRunning);
        };

        let service = Arc::clone(&self);
        tokio::spawn(async move {
            let summary = service.run_job(job_id, kind, card_ids).await;
            info!(
                job_id,
                kind = %kind,
                status = %summary.status,
                processed = summary.items_processed,
                succeeded = summary.items_succeeded,
                failed = summary.items_failed,
                duration_ms = summary.duration_ms,
                "job finished"
            );
        });
        Ok(TriggerOutcome::Accepted { job_id })
    }

    /// Run a job to completion on the caller's task (cli one-shot path).
    pub async fn run_now(
        &self,
        kind: JobKind,
        trigger_kind: TriggerKind,
        card_ids: Option<Vec<i64>>,
    ) -> Result<JobRunSummary> {
        let Some(job_id) = self
            .store
            .create_running_job(kind, trigger_kind, Utc::now())
            .await
            .context("creating job record")?
        else {
            anyhow::bail!("a {kind} job is already running");
        };
        Ok(self.run_job(job_id, kind, card_ids).await)
    }

    pub async fn current_progress(&self, kind: JobKind) -> Result<Option<ProgressView>> {
        let record = self
            .store
            .current_running_job(kind)
            .await
            .context("reading running job")?;
        Ok(record.map(|r| progress_from_record(&r)))
    }

    pub async fn recent_history(&self, kind: JobKind, limit: u32) -> Result<Vec<JobRecordView>> {
        self.store
            .recent_jobs(kind, limit)
            .await
            .context("reading job history")
    }

    /// Inline single-item resolve used on the request path when a card is
    /// added or edited. Shares the resolvers (and thus the rate limiters)
    /// with the batch jobs, so the per-source budget holds globally.
    pub async fn resolve_item_now(&self, card_id: i64, kind: JobKind) -> Result<Resolution> {
        let card = self
            .store
            .card_by_id(card_id)
            .await
            .context("loading card")?
            .with_context(|| format!("card {card_id} does not exist"))?;
        let resolution = self
            .resolver_for(kind)
            .resolve(&card)
            .await
            .context("resolving card")?;
        if let Resolution::Resolved(record) = &resolution {
            self.apply_resolution(&card, record)
                .await
                .map_err(|err| anyhow::anyhow!("applying resolution: {err}"))?;
        }
        Ok(resolution)
    }

    async fn apply_resolution(
        &self,
        card: &CardIdentity,
        record: &binder_core::ResolvedRecord,
    ) -> Result<(), ItemError> {
        let now = Utc::now();
        let mut wrote_anything = false;

        if let Some(prices) = &record.prices {
            self.store
                .append_price_snapshot(card.id, now.date_naive(), prices, &record.source)
                .await?;
            self.store.mark_price_synced(card.id, now).await?;
            wrote_anything = true;
        }

        if let Some(details) = &record.details {
            self.store
                .append_info_snapshot(card.id, now, details, &record.source)
                .await?;
            self.store
                .write_info_enrichment(card.id, details, now)
                .await?;
            wrote_anything = true;
        }

        if !wrote_anything {
            return Err(ItemError::Store(StoreError::Constraint(
                "resolved record carried neither prices nor details".to_string(),
            )));
        }
        Ok(())
    }

    async fn process_one(
        &self,
        resolver: &Arc<dyn ItemResolver>,
        card: &CardIdentity,
    ) -> Result<(), ItemError> {
        match resolver.resolve(card).await {
            Ok(Resolution::Resolved(record)) => self.apply_resolution(card, &record).await,
            Ok(Resolution::NotFound) => Err(ItemError::NoMatch {
                name: card.name.clone(),
            }),
            Ok(Resolution::Unavailable) => Err(ItemError::Unavailable),
            Err(err) => Err(item_error_from_resolve(err)),
        }
    }

    /// The batch executor. Every item's effect commits as soon as it is
    /// produced; a later failure or a job timeout never rolls back finished
    /// work. This function finalizes the job record exactly once on every
    /// path and never propagates an error to its caller.
    async fn run_job(
        &self,
        job_id: i64,
        kind: JobKind,
        card_ids: Option<Vec<i64>>,
    ) -> JobRunSummary {
        let run_id = Uuid::new_v4();
        let started = Instant::now();
        let deadline = started + self.config.job_timeout(kind);
        let resolver = self.resolver_for(kind).clone();

        info!(job_id, %run_id, kind = %kind, "job started");

        if !resolver.healthcheck().await {
            warn!(job_id, kind = %kind, source = resolver.source_id(), "source failed healthcheck");
            return self
                .finalize(job_id, kind, started, 0, 0, 0, 0, JobStatus::Failed, Some(
                    format!("{} is unavailable; refresh skipped", resolver.source_id()),
                ))
                .await;
        }

        let work_set = match &card_ids {
            Some(ids) => self.store.cards_by_ids(ids).await,
            None => {
                let stale_before = Utc::now()
                    - chrono::Duration::from_std(self.config.stale_after(kind))
                        .unwrap_or_else(|_| chrono::Duration::hours(20));
                self.store
                    .cards_needing_refresh(kind, stale_before, self.config.batch_size)
                    .await
            }
        };
        let work_set = match work_set {
            Ok(cards) => cards,
            Err(err) => {
                return self
                    .finalize(job_id, kind, started, 0, 0, 0, 0, JobStatus::Failed, Some(
                        format!("failed to load work set: {err}"),
                    ))
                    .await;
            }
        };

        let total = work_set.len() as u64;
        if let Err(err) = self.store.set_job_total(job_id, total).await {
            warn!(job_id, error = %err, "failed to record work set size");
        }
        self.publish_progress(job_id, kind, JobStatus::Running, total, 0, 0, 0);

        let item_timeout = self.config.item_timeout(kind);
        let mut processed = 0u64;
        let mut succeeded = 0u64;
        let mut failed = 0u64;
        let mut failure_streak = 0usize;
        let mut transport_streak = 0u32;
        let mut last_error: Option<String> = None;
        let mut timed_out = false;
        let mut source_down = false;

        for card in &work_set {
            if Instant::now() >= deadline {
                timed_out = true;
                break;
            }

            let outcome = tokio::time::timeout(item_timeout, self.process_one(&resolver, card)).await;
            processed += 1;

            match outcome {
                Ok(Ok(())) => {
                    succeeded += 1;
                    failure_streak = 0;
                    transport_streak = 0;
                    debug!(job_id, card_id = card.id, card_name = %card.name, "item synced");
                }
                Ok(Err(err)) => {
                    failed += 1;
                    failure_streak += 1;
                    if err.is_transport_class() {
                        transport_streak += 1;
                    } else {
                        transport_streak = 0;
                    }
                    last_error = Some(err.to_string());
                    warn!(
                        job_id,
                        card_id = card.id,
                        card_name = %card.name,
                        failure = err.label(),
                        error = %err,
                        "item failed"
                    );
                }
                Err(_elapsed) => {
                    failed += 1;
                    failure_streak += 1;
                    transport_streak += 1;
                    last_error = Some(format!(
                        "timed out after {}s resolving '{}'",
                        item_timeout.as_secs(),
                        card.name
                    ));
                    warn!(job_id, card_id = card.id, card_name = %card.name, "item timed out");
                }
            }

            if let Err(err) = self
                .store
                .update_job_progress(job_id, processed, succeeded, failed)
                .await
            {
                warn!(job_id, error = %err, "failed to persist progress");
            }
            self.publish_progress(job_id, kind, JobStatus::Running, total, processed, succeeded, failed);

            if transport_streak >= self.config.unavailable_streak_limit {
                source_down = true;
                break;
            }
            if failure_streak > 0 {
                tokio::time::sleep(self.config.backoff.delay_for_attempt(failure_streak - 1)).await;
            }
        }

        let (status, message) = if source_down {
            (
                JobStatus::Failed,
                Some(format!(
                    "{} appears to be down: {} consecutive transport failures ({})",
                    resolver.source_id(),
                    transport_streak,
                    last_error.as_deref().unwrap_or("no detail")
                )),
            )
        } else if timed_out {
            (
                JobStatus::Failed,
                Some(format!(
                    "job timed out after {}s; attempted {} of {} items ({} succeeded, {} failed)",
                    self.config.job_timeout(kind).as_secs(),
                    processed,
                    total,
                    succeeded,
                    failed
                )),
            )
        } else if failed == 0 {
            (JobStatus::Succeeded, None)
        } else {
            (
                JobStatus::SucceededWithErrors,
                Some(format!(
                    "{succeeded}/{processed} succeeded, {failed} failed: {}",
                    last_error.as_deref().unwrap_or("see log")
                )),
            )
        };

        self.finalize(job_id, kind, started, total, processed, succeeded, failed, status, message)
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finalize(
        &self,
        job_id: i64,
        kind: JobKind,
        started: Instant,
        total: u64,
        processed: u64,
        succeeded: u64,
        failed: u64,
        status: JobStatus,
        message: Option<String>,
    ) -> JobRunSummary {
        let duration_ms = started.elapsed().as_millis() as i64;
        match self
            .store
            .finalize_job(job_id, status, Utc::now(), duration_ms, message.as_deref())
            .await
        {
            Ok(true) => {}
            Ok(false) => warn!(job_id, "job was already finalized"),
            Err(err) => warn!(job_id, error = %err, "failed to finalize job record"),
        }
        self.publish_progress(job_id, kind, status, total, processed, succeeded, failed);
        JobRunSummary {
            job_id,
            kind,
            status,
            items_total: total,
            items_processed: processed,
            items_succeeded: succeeded,
            items_failed: failed,
            duration_ms,
            error_message: message,
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn publish_progress(
        &self,
        job_id: i64,
        kind: JobKind,
        status: JobStatus,
        total: u64,
        processed: u64,
        succeeded: u64,
        failed: u64,
    ) {
        self.broadcaster.publish(&ProgressView {
            job_id,
            kind,
            status,
            items_total: total,
            items_processed: processed,
            items_succeeded: succeeded,
            items_failed: failed,
        });
    }
}

fn progress_from_record(record: &JobRecordView) -> ProgressView {
    ProgressView {
        job_id: record.id,
        kind: record.kind,
        status: record.status,
        items_total: record.items_total,
        items_processed: record.items_processed,
        items_succeeded: record.items_succeeded,
        items_failed: record.items_failed,
    }
}

// ---------------------------------------------------------------------------
// Scheduler
// ---------------------------------------------------------------------------

/// Build the cron scheduler when enabled: daily pricing, weekly metadata.
/// Each firing goes through `trigger`, so the one-job-per-kind lock applies
/// to scheduled runs exactly as to manual ones.
pub async fn build_scheduler(service: Arc<SyncService>) -> Result<Option<JobScheduler>> {
    if !service.config().scheduler_enabled {
        return Ok(None);
    }

    let scheduler = JobScheduler::new().await.context("creating scheduler")?;
    let jobs = [
        (JobKind::Pricing, service.config().pricing_cron.clone()),
        (JobKind::Metadata, service.config().metadata_cron.clone()),
    ];
    for (kind, cron) in jobs {
        let service = Arc::clone(&service);
        let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
            let service = Arc::clone(&service);
            Box::pin(async move {
                match service.trigger(kind, TriggerKind::Scheduled, None).await {
                    Ok(TriggerOutcome::Accepted { job_id }) => {
                        info!(job_id, kind = %kind, "scheduled job triggered");
                    }
                    Ok(TriggerOutcome::AlreadyRunning) => {
                        warn!(kind = %kind, "previous job still running; skipping scheduled trigger");
                    }
                    Err(err) => {
                        warn!(kind = %kind, error = %err, "scheduled trigger failed");
                    }
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        scheduler.add(job).await.context("adding scheduler job")?;
    }
    Ok(Some(scheduler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use binder_core::{CardDetails, PriceData, ResolvedRecord};
    use binder_storage::NewCard;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::tempdir;

    enum Behavior {
        Prices,
        Details,
        HangOnCall(usize),
        TransportErrors,
        UnavailableEachTime,
        SleepEach(Duration),
        NotFound,
    }

    struct FakeResolver {
        source: &'static str,
        behavior: Behavior,
        healthy: bool,
        calls: AtomicUsize,
    }

    impl FakeResolver {
        fn new(behavior: Behavior) -> Arc<Self> {
            Arc::new(Self {
                source: "fake-source",
                behavior,
                healthy: true,
                calls: AtomicUsize::new(0),
            })
        }

        fn unhealthy() -> Arc<Self> {
            Arc::new(Self {
                source: "fake-source",
                behavior: Behavior::Prices,
                healthy: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn price_record(card: &CardIdentity) -> ResolvedRecord {
            ResolvedRecord {
                source: "fake-source".to_string(),
                external_id: format!("ext-{}", card.id),
                detail_url: None,
                prices: Some(PriceData {
                    ungraded_cents: Some(1000),
                    ..PriceData::default()
                }),
                details: None,
                fetched_at: Utc::now(),
            }
        }

        fn details_record(card: &CardIdentity) -> ResolvedRecord {
            ResolvedRecord {
                source: "fake-source".to_string(),
                external_id: format!("ext-{}", card.id),
                detail_url: None,
                prices: None,
                details: Some(CardDetails {
                    external_id: format!("ext-{}", card.id),
                    hp: Some(50),
                    ..CardDetails::default()
                }),
                fetched_at: Utc::now(),
            }
        }
    }

    #[async_trait]
    impl ItemResolver for FakeResolver {
        fn source_id(&self) -> &'static str {
            self.source
        }

        async fn healthcheck(&self) -> bool {
            self.healthy
        }

        async fn resolve(&self, card: &CardIdentity) -> Result<Resolution, ResolveError> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            match &self.behavior {
                Behavior::Prices => Ok(Resolution::Resolved(Self::price_record(card))),
                Behavior::Details => Ok(Resolution::Resolved(Self::details_record(card))),
                Behavior::HangOnCall(n) if call == *n => {
                    tokio::time::sleep(Duration::from_secs(30)).await;
                    Ok(Resolution::NotFound)
                }
                Behavior::HangOnCall(_) => Ok(Resolution::Resolved(Self::price_record(card))),
                Behavior::TransportErrors => Err(ResolveError::Fetch(FetchError::Transport {
                    url: "https://example.test".to_string(),
                    message: "connection refused".to_string(),
                })),
                Behavior::UnavailableEachTime => Ok(Resolution::Unavailable),
                Behavior::SleepEach(delay) => {
                    tokio::time::sleep(*delay).await;
                    Ok(Resolution::Resolved(Self::price_record(card)))
                }
                Behavior::NotFound => Ok(Resolution::NotFound),
            }
        }
    }

    fn fast_config() -> SyncConfig {
        SyncConfig {
            batch_size: 50,
            pricing_job_timeout: Duration::from_secs(10),
            metadata_job_timeout: Duration::from_secs(10),
            pricing_item_timeout: Duration::from_millis(100),
            metadata_item_timeout: Duration::from_millis(100),
            backoff: BackoffPolicy {
                base_delay: Duration::from_millis(1),
                max_delay: Duration::from_millis(2),
            },
            unavailable_streak_limit: 3,
            ..SyncConfig::default()
        }
    }

    async fn store_with_cards(dir: &tempfile::TempDir, count: usize) -> (Store, Vec<i64>) {
        let url = format!("sqlite://{}", dir.path().join("binder.db").display());
        let store = Store::connect(&url).await.expect("connect");
        let mut ids = Vec::new();
        for i in 0..count {
            let id = store
                .insert_card(&NewCard {
                    name: format!("Card {i}"),
                    set_name: Some("Base Set".to_string()),
                    number: Some(format!("{i}")),
                    ..NewCard::default()
                })
                .await
                .expect("insert card");
            ids.push(id);
        }
        (store, ids)
    }

    fn service_with(
        store: Store,
        config: SyncConfig,
        resolver: Arc<FakeResolver>,
    ) -> Arc<SyncService> {
        SyncService::new(store, config, resolver.clone(), resolver)
    }

    #[tokio::test]
    async fn one_slow_item_does_not_abort_the_batch() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 10).await;
        let service = service_with(store, fast_config(), FakeResolver::new(Behavior::HangOnCall(5)));

        let summary = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::SucceededWithErrors);
        assert_eq!(summary.items_total, 10);
        assert_eq!(summary.items_processed, 10);
        assert_eq!(summary.items_succeeded, 9);
        assert_eq!(summary.items_failed, 1);
        assert_eq!(
            summary.items_processed,
            summary.items_succeeded + summary.items_failed
        );
        assert!(summary.error_message.unwrap().contains("timed out"));
    }

    #[tokio::test]
    async fn job_deadline_finalizes_as_failed_and_excludes_unattempted() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 10).await;
        let config = SyncConfig {
            pricing_job_timeout: Duration::from_millis(120),
            pricing_item_timeout: Duration::from_millis(500),
            ..fast_config()
        };
        let service = service_with(
            store.clone(),
            config,
            FakeResolver::new(Behavior::SleepEach(Duration::from_millis(50))),
        );

        let summary = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert!(summary.items_processed < summary.items_total);
        assert_eq!(
            summary.items_processed,
            summary.items_succeeded + summary.items_failed
        );
        assert!(summary.error_message.unwrap().contains("timed out"));

        let record = store.job_by_id(summary.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.items_total, 10);
    }

    #[tokio::test]
    async fn consecutive_transport_failures_short_circuit_the_job() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 10).await;
        let service = service_with(
            store,
            fast_config(),
            FakeResolver::new(Behavior::TransportErrors),
        );

        let summary = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.items_processed, 3, "stops at the streak limit");
        assert!(summary.error_message.unwrap().contains("appears to be down"));
    }

    #[tokio::test]
    async fn unavailable_resolutions_feed_the_short_circuit() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 8).await;
        let service = service_with(
            store,
            fast_config(),
            FakeResolver::new(Behavior::UnavailableEachTime),
        );

        let summary = service
            .run_now(JobKind::Metadata, TriggerKind::Manual, None)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.items_processed, 3);
        assert_eq!(summary.items_failed, 3);
        assert!(summary.error_message.unwrap().contains("appears to be down"));
    }

    #[tokio::test]
    async fn failed_healthcheck_records_a_failed_job() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 3).await;
        let service = service_with(store.clone(), fast_config(), FakeResolver::unhealthy());

        let summary = service
            .run_now(JobKind::Metadata, TriggerKind::Scheduled, None)
            .await
            .unwrap();

        assert_eq!(summary.status, JobStatus::Failed);
        assert_eq!(summary.items_processed, 0);
        assert!(summary.error_message.unwrap().contains("unavailable"));
        let record = store.job_by_id(summary.job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn second_run_on_fresh_items_is_a_no_op() {
        let dir = tempdir().unwrap();
        let (store, ids) = store_with_cards(&dir, 4).await;
        let resolver = FakeResolver::new(Behavior::Prices);
        let service = service_with(store.clone(), fast_config(), resolver.clone());

        let first = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert_eq!(first.status, JobStatus::Succeeded);
        assert_eq!(first.items_succeeded, 4);

        let snapshots_after_first = store.count_price_snapshots(ids[0]).await.unwrap();

        let second = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert_eq!(second.status, JobStatus::Succeeded);
        assert_eq!(second.items_total, 0, "everything is fresh; nothing selected");
        assert_eq!(
            store.count_price_snapshots(ids[0]).await.unwrap(),
            snapshots_after_first,
            "no write-backs on the second run"
        );
        assert_eq!(resolver.calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn concurrent_trigger_of_same_kind_is_rejected() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 3).await;
        let service = service_with(
            store.clone(),
            fast_config(),
            FakeResolver::new(Behavior::SleepEach(Duration::from_millis(40))),
        );

        let first = Arc::clone(&service)
            .trigger(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert!(matches!(first, TriggerOutcome::Accepted { .. }));

        let second = Arc::clone(&service)
            .trigger(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert_eq!(second, TriggerOutcome::AlreadyRunning);

        // A different kind is not blocked.
        let metadata = Arc::clone(&service)
            .trigger(JobKind::Metadata, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert!(matches!(metadata, TriggerOutcome::Accepted { .. }));

        // Wait for the pricing job to release the lock, then retrigger.
        for _ in 0..100 {
            if service.current_progress(JobKind::Pricing).await.unwrap().is_none() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        let third = Arc::clone(&service)
            .trigger(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert!(matches!(third, TriggerOutcome::Accepted { .. }));
    }

    #[tokio::test]
    async fn progress_events_are_monotonic_and_end_terminal() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 5).await;
        let service = service_with(store, fast_config(), FakeResolver::new(Behavior::Prices));

        let mut rx = service.subscribe();
        let summary = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();

        let mut last_processed = 0u64;
        let mut saw_terminal = false;
        while let Ok(view) = rx.try_recv() {
            assert!(view.items_processed >= last_processed, "counters must not go backwards");
            assert_eq!(view.items_processed, view.items_succeeded + view.items_failed);
            last_processed = view.items_processed;
            if view.status.is_terminal() {
                saw_terminal = true;
                assert_eq!(view.items_processed, summary.items_processed);
            }
        }
        assert!(saw_terminal, "a terminal progress event must be published");
        assert_eq!(last_processed, 5);
    }

    #[tokio::test]
    async fn publishing_without_subscribers_is_harmless() {
        let broadcaster = ProgressBroadcaster::new();
        broadcaster.publish(&ProgressView {
            job_id: 1,
            kind: JobKind::Pricing,
            status: JobStatus::Running,
            items_total: 1,
            items_processed: 0,
            items_succeeded: 0,
            items_failed: 0,
        });
    }

    #[tokio::test]
    async fn no_match_counts_as_item_failure() {
        let dir = tempdir().unwrap();
        let (store, _ids) = store_with_cards(&dir, 2).await;
        let service = service_with(store, fast_config(), FakeResolver::new(Behavior::NotFound));

        let summary = service
            .run_now(JobKind::Pricing, TriggerKind::Manual, None)
            .await
            .unwrap();
        assert_eq!(summary.status, JobStatus::SucceededWithErrors);
        assert_eq!(summary.items_failed, 2);
        assert!(summary.error_message.unwrap().contains("no matching record"));
    }

    #[tokio::test]
    async fn inline_resolve_applies_enrichment_immediately() {
        let dir = tempdir().unwrap();
        let (store, ids) = store_with_cards(&dir, 1).await;
        let service = service_with(store.clone(), fast_config(), FakeResolver::new(Behavior::Details));

        let resolution = service
            .resolve_item_now(ids[0], JobKind::Metadata)
            .await
            .unwrap();
        assert!(matches!(resolution, Resolution::Resolved(_)));

        let selected = store
            .cards_needing_refresh(JobKind::Metadata, Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(selected.is_empty(), "inline resolve marks the card synced");
    }

    #[test]
    fn config_defaults_keep_job_limits_sane() {
        let config = SyncConfig::default();
        assert_eq!(config.pricing_job_timeout, Duration::from_secs(300));
        assert_eq!(config.metadata_job_timeout, Duration::from_secs(600));
        assert_eq!(config.pricing_item_timeout, Duration::from_secs(30));
        assert_eq!(config.batch_size, 200);
        assert_eq!(config.unavailable_streak_limit, 5);
    }
}
