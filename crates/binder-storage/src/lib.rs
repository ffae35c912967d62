//! SQLite persistence + paced HTTP fetch utilities for Binder.

use std::str::FromStr;
use std::time::{Duration, Instant};

use anyhow::Context;
use binder_core::{
    CardDetails, CardIdentity, JobKind, JobRecordView, JobStatus, PriceData, TriggerKind,
};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

pub const CRATE_NAME: &str = "binder-storage";

// ---------------------------------------------------------------------------
// Paced HTTP client
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request timed out for {url}")]
    Timeout { url: String },
    #[error("transport failure for {url}: {message}")]
    Transport { url: String, message: String },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

impl FetchError {
    /// Timeouts and connection-level failures suggest the source itself may
    /// be struggling; a served error status proves the opposite.
    pub fn is_transport_class(&self) -> bool {
        matches!(self, Self::Timeout { .. } | Self::Transport { .. })
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::HttpStatus { status, .. } => Some(*status),
            _ => None,
        }
    }
}

fn classify_reqwest_error(err: reqwest::Error, url: &str) -> FetchError {
    if err.is_timeout() {
        FetchError::Timeout {
            url: url.to_string(),
        }
    } else {
        FetchError::Transport {
            url: url.to_string(),
            message: err.to_string(),
        }
    }
}

/// Serializes callers and enforces a minimum spacing between consecutive
/// passes. Holding the lock across the sleep is the point: concurrent
/// callers queue here instead of racing the external source.
#[derive(Debug)]
pub struct IntervalGate {
    min_interval: Duration,
    last_pass: Mutex<Option<Instant>>,
}

impl IntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_pass: Mutex::new(None),
        }
    }

    pub async fn wait(&self) {
        let mut last = self.last_pass.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[derive(Debug, Clone)]
pub struct PacedClientConfig {
    pub min_interval: Duration,
    pub timeout: Duration,
    pub user_agent: String,
}

impl Default for PacedClientConfig {
    fn default() -> Self {
        Self {
            min_interval: Duration::from_millis(1000),
            timeout: Duration::from_secs(30),
            user_agent: "binder/0.1 (card collection manager)".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct FetchedBody {
    pub status: u16,
    pub final_url: String,
    pub text: String,
}

/// Rate-limited, timeout-protected HTTP GET client for one external source.
/// Every call goes through a single [`IntervalGate`], so one global rate
/// budget is respected no matter how many tasks share the client. Failed
/// calls are never retried here; retry policy belongs to the job executor.
#[derive(Debug)]
pub struct PacedClient {
    client: reqwest::Client,
    gate: IntervalGate,
}

impl PacedClient {
    pub fn new(config: PacedClientConfig) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .user_agent(config.user_agent.clone())
            .build()
            .context("building reqwest client")?;
        Ok(Self {
            client,
            gate: IntervalGate::new(config.min_interval),
        })
    }

    pub async fn get(&self, url: &str) -> Result<FetchedBody, FetchError> {
        self.get_with_query(url, &[]).await
    }

    pub async fn get_with_query(
        &self,
        url: &str,
        query: &[(&str, &str)],
    ) -> Result<FetchedBody, FetchError> {
        self.gate.wait().await;

        let mut request = self.client.get(url);
        if !query.is_empty() {
            request = request.query(query);
        }

        let response = request
            .send()
            .await
            .map_err(|err| classify_reqwest_error(err, url))?;

        let status = response.status();
        let final_url = response.url().to_string();
        if !status.is_success() {
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let text = response
            .text()
            .await
            .map_err(|err| classify_reqwest_error(err, url))?;

        debug!(url, final_url = %final_url, bytes = text.len(), "fetched");
        Ok(FetchedBody {
            status: status.as_u16(),
            final_url,
            text,
        })
    }
}

/// Exponential backoff applied by the executor after failed items.
#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

// ---------------------------------------------------------------------------
// SQLite store
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("storage constraint violated: {0}")]
    Constraint(String),
    #[error(transparent)]
    Database(#[from] sqlx::Error),
}

pub const SOURCE_PRICECHARTING: &str = "pricecharting";
pub const SOURCE_TCGDEX: &str = "tcgdex";

#[derive(Debug, Clone, Default)]
pub struct NewCard {
    pub name: String,
    pub set_id: Option<String>,
    pub set_name: Option<String>,
    pub number: Option<String>,
    pub rarity: Option<String>,
    pub category: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CachedExternalId {
    pub external_id: String,
    pub detail_url: Option<String>,
}

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS cards (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL,
        set_id TEXT,
        set_name TEXT,
        number TEXT,
        rarity TEXT,
        category TEXT,
        hp INTEGER,
        types TEXT,
        artist TEXT,
        flavor_text TEXT,
        evolves_from TEXT,
        image_url TEXT,
        info_id TEXT,
        info_synced_at TEXT,
        price_synced_at TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS external_ids (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        card_id INTEGER NOT NULL REFERENCES cards(id),
        source TEXT NOT NULL,
        external_id TEXT NOT NULL,
        detail_url TEXT,
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        UNIQUE(card_id, source)
    )",
    "CREATE TABLE IF NOT EXISTS price_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        card_id INTEGER NOT NULL REFERENCES cards(id),
        as_of TEXT NOT NULL,
        ungraded_cents INTEGER,
        psa9_cents INTEGER,
        psa10_cents INTEGER,
        bgs10_cents INTEGER,
        source TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS info_snapshots (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        card_id INTEGER NOT NULL REFERENCES cards(id),
        captured_at TEXT NOT NULL,
        source TEXT NOT NULL,
        payload TEXT NOT NULL
    )",
    "CREATE TABLE IF NOT EXISTS job_history (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        kind TEXT NOT NULL,
        trigger_kind TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        items_total INTEGER NOT NULL DEFAULT 0,
        items_processed INTEGER NOT NULL DEFAULT 0,
        items_succeeded INTEGER NOT NULL DEFAULT 0,
        items_failed INTEGER NOT NULL DEFAULT 0,
        duration_ms INTEGER,
        error_message TEXT
    )",
    "CREATE INDEX IF NOT EXISTS idx_job_history_kind_status ON job_history(kind, status)",
    "CREATE INDEX IF NOT EXISTS idx_price_snapshots_card ON price_snapshots(card_id, as_of)",
    "CREATE INDEX IF NOT EXISTS idx_info_snapshots_card ON info_snapshots(card_id)",
];

/// Days of per-card price history kept when a new snapshot lands.
const PRICE_SNAPSHOT_RETENTION_DAYS: i64 = 365;

#[derive(Debug, Clone)]
pub struct Store {
    pool: SqlitePool,
}

impl Store {
    /// Open (creating if missing) the database and apply the schema.
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let options = SqliteConnectOptions::from_str(database_url)
            .with_context(|| format!("parsing database url {database_url}"))?
            .create_if_missing(true)
            .foreign_keys(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await
            .with_context(|| format!("connecting to {database_url}"))?;
        let store = Self { pool };
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> anyhow::Result<()> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .context("applying schema statement")?;
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn ping(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    // -- cards --------------------------------------------------------------

    pub async fn insert_card(&self, card: &NewCard) -> Result<i64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO cards (name, set_id, set_name, number, rarity, category, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?7)",
        )
        .bind(&card.name)
        .bind(&card.set_id)
        .bind(&card.set_name)
        .bind(&card.number)
        .bind(&card.rarity)
        .bind(&card.category)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(result.last_insert_rowid())
    }

    pub async fn card_by_id(&self, card_id: i64) -> Result<Option<CardIdentity>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, set_id, set_name, number, rarity, category FROM cards WHERE id = ?1",
        )
        .bind(card_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| identity_from_row(&r)).transpose()
    }

    pub async fn cards_by_ids(&self, card_ids: &[i64]) -> Result<Vec<CardIdentity>, StoreError> {
        if card_ids.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders = card_ids
            .iter()
            .map(|_| "?")
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT id, name, set_id, set_name, number, rarity, category FROM cards
             WHERE id IN ({placeholders}) ORDER BY id ASC"
        );
        let mut query = sqlx::query(&sql);
        for id in card_ids {
            query = query.bind(id);
        }
        let rows = query.fetch_all(&self.pool).await?;
        rows.iter().map(identity_from_row).collect()
    }

    /// Work set for a refresh job: cards whose last sync for the given kind
    /// is missing or older than `stale_before`, oldest-synced first. The
    /// ordering is stable so reruns walk the inventory the same way.
    pub async fn cards_needing_refresh(
        &self,
        kind: JobKind,
        stale_before: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<CardIdentity>, StoreError> {
        let sql = match kind {
            JobKind::Pricing => {
                "SELECT id, name, set_id, set_name, number, rarity, category FROM cards
                 WHERE price_synced_at IS NULL OR price_synced_at < ?1
                 ORDER BY price_synced_at ASC, id ASC LIMIT ?2"
            }
            JobKind::Metadata => {
                "SELECT id, name, set_id, set_name, number, rarity, category FROM cards
                 WHERE info_id IS NULL OR info_synced_at IS NULL OR info_synced_at < ?1
                 ORDER BY info_synced_at ASC, id ASC LIMIT ?2"
            }
        };
        let rows = sqlx::query(sql)
            .bind(stale_before)
            .bind(limit)
            .fetch_all(&self.pool)
            .await?;
        rows.iter().map(identity_from_row).collect()
    }

    /// Write metadata enrichment back to a card. Only the enrichment column
    /// subset is touched, so identifying fields edited by the user while the
    /// job ran are never clobbered.
    pub async fn write_info_enrichment(
        &self,
        card_id: i64,
        details: &CardDetails,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        if details.external_id.trim().is_empty() {
            return Err(StoreError::Constraint(
                "metadata enrichment requires a non-empty external id".to_string(),
            ));
        }
        let types_json = if details.types.is_empty() {
            None
        } else {
            Some(serde_json::to_string(&details.types).unwrap_or_default())
        };
        sqlx::query(
            "UPDATE cards SET
                hp = ?1, types = ?2, artist = ?3, flavor_text = ?4, evolves_from = ?5,
                image_url = ?6, rarity = COALESCE(?7, rarity),
                info_id = ?8, info_synced_at = ?9, updated_at = ?9
             WHERE id = ?10",
        )
        .bind(details.hp)
        .bind(types_json)
        .bind(&details.artist)
        .bind(&details.flavor_text)
        .bind(&details.evolves_from)
        .bind(&details.image_url)
        .bind(&details.rarity)
        .bind(&details.external_id)
        .bind(synced_at)
        .bind(card_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_price_synced(
        &self,
        card_id: i64,
        synced_at: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        sqlx::query("UPDATE cards SET price_synced_at = ?1, updated_at = ?1 WHERE id = ?2")
            .bind(synced_at)
            .bind(card_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    // -- snapshots ----------------------------------------------------------

    /// Append an immutable price snapshot. A snapshot with no price at all
    /// would be noise in the history, so it is rejected as a constraint
    /// violation and counted as a per-item failure by the caller.
    pub async fn append_price_snapshot(
        &self,
        card_id: i64,
        as_of: NaiveDate,
        prices: &PriceData,
        source: &str,
    ) -> Result<(), StoreError> {
        if prices.is_empty() {
            return Err(StoreError::Constraint(
                "price snapshot requires at least one grade price".to_string(),
            ));
        }
        sqlx::query(
            "INSERT INTO price_snapshots
                (card_id, as_of, ungraded_cents, psa9_cents, psa10_cents, bgs10_cents, source)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        )
        .bind(card_id)
        .bind(as_of)
        .bind(prices.ungraded_cents)
        .bind(prices.psa9_cents)
        .bind(prices.psa10_cents)
        .bind(prices.bgs10_cents)
        .bind(source)
        .execute(&self.pool)
        .await?;

        // Bounded retention sweep, not an update-in-place.
        let cutoff = as_of - chrono::Duration::days(PRICE_SNAPSHOT_RETENTION_DAYS);
        let pruned = sqlx::query("DELETE FROM price_snapshots WHERE card_id = ?1 AND as_of < ?2")
            .bind(card_id)
            .bind(cutoff)
            .execute(&self.pool)
            .await?;
        if pruned.rows_affected() > 0 {
            debug!(card_id, pruned = pruned.rows_affected(), "pruned old price snapshots");
        }
        Ok(())
    }

    pub async fn append_info_snapshot(
        &self,
        card_id: i64,
        captured_at: DateTime<Utc>,
        details: &CardDetails,
        source: &str,
    ) -> Result<(), StoreError> {
        if details.external_id.trim().is_empty() {
            return Err(StoreError::Constraint(
                "metadata snapshot requires a non-empty external id".to_string(),
            ));
        }
        let payload = serde_json::to_string(details)
            .map_err(|err| StoreError::Constraint(format!("unserializable details: {err}")))?;
        sqlx::query(
            "INSERT INTO info_snapshots (card_id, captured_at, source, payload)
             VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(card_id)
        .bind(captured_at)
        .bind(source)
        .bind(payload)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn count_price_snapshots(&self, card_id: i64) -> Result<i64, StoreError> {
        let row = sqlx::query("SELECT COUNT(*) AS n FROM price_snapshots WHERE card_id = ?1")
            .bind(card_id)
            .fetch_one(&self.pool)
            .await?;
        Ok(row.try_get::<i64, _>("n")?)
    }

    // -- external id cache --------------------------------------------------

    pub async fn cached_external_id(
        &self,
        card_id: i64,
        source: &str,
    ) -> Result<Option<CachedExternalId>, StoreError> {
        let row = sqlx::query(
            "SELECT external_id, detail_url FROM external_ids
             WHERE card_id = ?1 AND source = ?2",
        )
        .bind(card_id)
        .bind(source)
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| {
            Ok(CachedExternalId {
                external_id: r.try_get("external_id")?,
                detail_url: r.try_get("detail_url")?,
            })
        })
        .transpose()
    }

    /// Remember a resolved external id so later runs can skip the search.
    /// Entries are only ever inserted or overwritten with fresher data; the
    /// sync path never deletes them.
    pub async fn cache_external_id(
        &self,
        card_id: i64,
        source: &str,
        external_id: &str,
        detail_url: Option<&str>,
    ) -> Result<(), StoreError> {
        if external_id.trim().is_empty() {
            return Err(StoreError::Constraint(
                "external id cache entry requires a non-empty id".to_string(),
            ));
        }
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO external_ids (card_id, source, external_id, detail_url, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?5)
             ON CONFLICT(card_id, source) DO UPDATE SET
                external_id = excluded.external_id,
                detail_url = COALESCE(excluded.detail_url, external_ids.detail_url),
                updated_at = excluded.updated_at",
        )
        .bind(card_id)
        .bind(source)
        .bind(external_id)
        .bind(detail_url)
        .bind(now)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    // -- job history --------------------------------------------------------

    /// Create a job record in `running` state, atomically refusing when one
    /// of the same kind is already running. The status column is the lock:
    /// the conditional insert is a single statement, so two concurrent
    /// triggers can never both succeed.
    pub async fn create_running_job(
        &self,
        kind: JobKind,
        trigger_kind: TriggerKind,
        started_at: DateTime<Utc>,
    ) -> Result<Option<i64>, StoreError> {
        let result = sqlx::query(
            "INSERT INTO job_history (kind, trigger_kind, status, started_at)
             SELECT ?1, ?2, 'running', ?3
             WHERE NOT EXISTS (
                SELECT 1 FROM job_history WHERE kind = ?1 AND status = 'running'
             )",
        )
        .bind(kind.as_str())
        .bind(trigger_kind.as_str())
        .bind(started_at)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Ok(None);
        }
        Ok(Some(result.last_insert_rowid()))
    }

    pub async fn set_job_total(&self, job_id: i64, items_total: u64) -> Result<(), StoreError> {
        sqlx::query("UPDATE job_history SET items_total = ?1 WHERE id = ?2")
            .bind(items_total as i64)
            .bind(job_id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn update_job_progress(
        &self,
        job_id: i64,
        processed: u64,
        succeeded: u64,
        failed: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE job_history SET items_processed = ?1, items_succeeded = ?2, items_failed = ?3
             WHERE id = ?4",
        )
        .bind(processed as i64)
        .bind(succeeded as i64)
        .bind(failed as i64)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Move a job to a terminal status. Returns false when the job was
    /// already finalized; the `status = 'running'` guard makes the terminal
    /// transition happen at most once.
    pub async fn finalize_job(
        &self,
        job_id: i64,
        status: JobStatus,
        finished_at: DateTime<Utc>,
        duration_ms: i64,
        error_message: Option<&str>,
    ) -> Result<bool, StoreError> {
        if !status.is_terminal() {
            return Err(StoreError::Constraint(
                "finalize_job requires a terminal status".to_string(),
            ));
        }
        let result = sqlx::query(
            "UPDATE job_history
             SET status = ?1, finished_at = ?2, duration_ms = ?3, error_message = ?4
             WHERE id = ?5 AND status = 'running'",
        )
        .bind(status.as_str())
        .bind(finished_at)
        .bind(duration_ms)
        .bind(error_message)
        .bind(job_id)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() == 1)
    }

    pub async fn job_by_id(&self, job_id: i64) -> Result<Option<JobRecordView>, StoreError> {
        let row = sqlx::query("SELECT * FROM job_history WHERE id = ?1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await?;
        row.map(|r| job_record_from_row(&r)).transpose()
    }

    pub async fn current_running_job(
        &self,
        kind: JobKind,
    ) -> Result<Option<JobRecordView>, StoreError> {
        let row = sqlx::query(
            "SELECT * FROM job_history WHERE kind = ?1 AND status = 'running'
             ORDER BY started_at DESC LIMIT 1",
        )
        .bind(kind.as_str())
        .fetch_optional(&self.pool)
        .await?;
        row.map(|r| job_record_from_row(&r)).transpose()
    }

    pub async fn recent_jobs(
        &self,
        kind: JobKind,
        limit: u32,
    ) -> Result<Vec<JobRecordView>, StoreError> {
        let rows = sqlx::query(
            "SELECT * FROM job_history WHERE kind = ?1
             ORDER BY started_at DESC, id DESC LIMIT ?2",
        )
        .bind(kind.as_str())
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(job_record_from_row).collect()
    }

    /// Startup reconcile: a process crash can leave `running` rows behind,
    /// which would wedge the one-job-per-kind lock forever. Flip them to
    /// failed before the scheduler starts.
    pub async fn reconcile_interrupted_jobs(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let result = sqlx::query(
            "UPDATE job_history
             SET status = 'failed', finished_at = ?1, error_message = 'interrupted by restart'
             WHERE status = 'running'",
        )
        .bind(now)
        .execute(&self.pool)
        .await?;
        let reconciled = result.rows_affected();
        if reconciled > 0 {
            info!(reconciled, "marked interrupted jobs as failed");
        }
        Ok(reconciled)
    }
}

fn identity_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<CardIdentity, StoreError> {
    Ok(CardIdentity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        set_id: row.try_get("set_id")?,
        set_name: row.try_get("set_name")?,
        number: row.try_get("number")?,
        rarity: row.try_get("rarity")?,
        category: row.try_get("category")?,
    })
}

fn job_record_from_row(row: &sqlx::sqlite::SqliteRow) -> Result<JobRecordView, StoreError> {
    let kind: String = row.try_get("kind")?;
    let trigger_kind: String = row.try_get("trigger_kind")?;
    let status: String = row.try_get("status")?;
    Ok(JobRecordView {
        id: row.try_get("id")?,
        kind: JobKind::parse(&kind)
            .ok_or_else(|| StoreError::Constraint(format!("unknown job kind {kind}")))?,
        trigger_kind: TriggerKind::parse(&trigger_kind)
            .ok_or_else(|| StoreError::Constraint(format!("unknown trigger kind {trigger_kind}")))?,
        status: JobStatus::parse(&status)
            .ok_or_else(|| StoreError::Constraint(format!("unknown job status {status}")))?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        items_total: row.try_get::<i64, _>("items_total")? as u64,
        items_processed: row.try_get::<i64, _>("items_processed")? as u64,
        items_succeeded: row.try_get::<i64, _>("items_succeeded")? as u64,
        items_failed: row.try_get::<i64, _>("items_failed")? as u64,
        duration_ms: row.try_get("duration_ms")?,
        error_message: row.try_get("error_message")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    async fn test_store(dir: &tempfile::TempDir) -> Store {
        let url = format!("sqlite://{}", dir.path().join("binder.db").display());
        Store::connect(&url).await.expect("connect store")
    }

    fn sample_card(name: &str) -> NewCard {
        NewCard {
            name: name.to_string(),
            set_id: Some("base1".to_string()),
            set_name: Some("Base Set".to_string()),
            number: Some("4".to_string()),
            rarity: Some("Holo Rare".to_string()),
            category: Some("Pokemon".to_string()),
        }
    }

    #[tokio::test]
    async fn schema_bootstrap_is_idempotent() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        store.migrate().await.expect("second migrate");
        assert!(store.ping().await);
    }

    #[tokio::test]
    async fn only_one_running_job_per_kind() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let now = Utc::now();

        let first = store
            .create_running_job(JobKind::Pricing, TriggerKind::Manual, now)
            .await
            .expect("first create");
        assert!(first.is_some());

        let second = store
            .create_running_job(JobKind::Pricing, TriggerKind::Scheduled, now)
            .await
            .expect("second create");
        assert!(second.is_none(), "second pricing trigger must be rejected");

        // A different kind is independent.
        let metadata = store
            .create_running_job(JobKind::Metadata, TriggerKind::Manual, now)
            .await
            .expect("metadata create");
        assert!(metadata.is_some());
    }

    #[tokio::test]
    async fn finalize_happens_exactly_once() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let now = Utc::now();
        let job_id = store
            .create_running_job(JobKind::Pricing, TriggerKind::Manual, now)
            .await
            .unwrap()
            .unwrap();

        store.set_job_total(job_id, 5).await.unwrap();
        store.update_job_progress(job_id, 3, 2, 1).await.unwrap();

        let first = store
            .finalize_job(job_id, JobStatus::SucceededWithErrors, Utc::now(), 1234, None)
            .await
            .unwrap();
        assert!(first);
        let second = store
            .finalize_job(job_id, JobStatus::Failed, Utc::now(), 1234, Some("late"))
            .await
            .unwrap();
        assert!(!second, "terminal transition must only happen once");

        let record = store.job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::SucceededWithErrors);
        assert_eq!(record.items_total, 5);
        assert_eq!(record.items_processed, 3);
        assert_eq!(record.items_succeeded, 2);
        assert_eq!(record.items_failed, 1);

        // Lock released: a new job of the same kind may start.
        let next = store
            .create_running_job(JobKind::Pricing, TriggerKind::Manual, Utc::now())
            .await
            .unwrap();
        assert!(next.is_some());
    }

    #[tokio::test]
    async fn reconcile_flips_leftover_running_jobs() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let job_id = store
            .create_running_job(JobKind::Metadata, TriggerKind::Scheduled, Utc::now())
            .await
            .unwrap()
            .unwrap();

        let reconciled = store.reconcile_interrupted_jobs().await.unwrap();
        assert_eq!(reconciled, 1);

        let record = store.job_by_id(job_id).await.unwrap().unwrap();
        assert_eq!(record.status, JobStatus::Failed);
        assert_eq!(record.error_message.as_deref(), Some("interrupted by restart"));
        assert!(store.current_running_job(JobKind::Metadata).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn recent_jobs_lists_newest_first() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        for _ in 0..3 {
            let id = store
                .create_running_job(JobKind::Pricing, TriggerKind::Manual, Utc::now())
                .await
                .unwrap()
                .unwrap();
            store
                .finalize_job(id, JobStatus::Succeeded, Utc::now(), 10, None)
                .await
                .unwrap();
        }
        let jobs = store.recent_jobs(JobKind::Pricing, 2).await.unwrap();
        assert_eq!(jobs.len(), 2);
        assert!(jobs[0].id > jobs[1].id);
    }

    #[tokio::test]
    async fn enrichment_write_back_touches_only_enrichment_columns() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let card_id = store.insert_card(&sample_card("Charizard")).await.unwrap();

        let details = CardDetails {
            external_id: "base1-4".to_string(),
            hp: Some(120),
            types: vec!["Fire".to_string()],
            artist: Some("Mitsuhiro Arita".to_string()),
            rarity: Some("Rare Holo".to_string()),
            ..CardDetails::default()
        };
        store
            .write_info_enrichment(card_id, &details, Utc::now())
            .await
            .unwrap();

        let card = store.card_by_id(card_id).await.unwrap().unwrap();
        assert_eq!(card.name, "Charizard");
        assert_eq!(card.number.as_deref(), Some("4"));
        assert_eq!(card.rarity.as_deref(), Some("Rare Holo"));

        let selected = store
            .cards_needing_refresh(JobKind::Metadata, Utc::now() - chrono::Duration::hours(1), 10)
            .await
            .unwrap();
        assert!(
            selected.is_empty(),
            "freshly enriched card must not be selected again"
        );
    }

    #[tokio::test]
    async fn enrichment_requires_external_id() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let card_id = store.insert_card(&sample_card("Pikachu")).await.unwrap();
        let details = CardDetails::default();
        let err = store
            .write_info_enrichment(card_id, &details, Utc::now())
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));
    }

    #[tokio::test]
    async fn price_snapshot_rejects_empty_and_prunes_old() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let card_id = store.insert_card(&sample_card("Blastoise")).await.unwrap();
        let today = Utc::now().date_naive();

        let err = store
            .append_price_snapshot(card_id, today, &PriceData::default(), SOURCE_PRICECHARTING)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::Constraint(_)));

        let prices = PriceData {
            ungraded_cents: Some(12345),
            psa10_cents: Some(99900),
            ..PriceData::default()
        };
        let two_years_ago = today - chrono::Duration::days(730);
        store
            .append_price_snapshot(card_id, two_years_ago, &prices, SOURCE_PRICECHARTING)
            .await
            .unwrap();
        assert_eq!(store.count_price_snapshots(card_id).await.unwrap(), 1);

        store
            .append_price_snapshot(card_id, today, &prices, SOURCE_PRICECHARTING)
            .await
            .unwrap();
        // The two-year-old snapshot fell out of the retention window.
        assert_eq!(store.count_price_snapshots(card_id).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn external_id_cache_upserts_and_keeps_detail_url() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let card_id = store.insert_card(&sample_card("Mewtwo")).await.unwrap();

        assert!(store
            .cached_external_id(card_id, SOURCE_PRICECHARTING)
            .await
            .unwrap()
            .is_none());

        store
            .cache_external_id(card_id, SOURCE_PRICECHARTING, "12345", Some("https://example.test/game/x"))
            .await
            .unwrap();
        store
            .cache_external_id(card_id, SOURCE_PRICECHARTING, "67890", None)
            .await
            .unwrap();

        let cached = store
            .cached_external_id(card_id, SOURCE_PRICECHARTING)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(cached.external_id, "67890");
        // A later resolve without a detail URL must not erase the known one.
        assert_eq!(cached.detail_url.as_deref(), Some("https://example.test/game/x"));
    }

    #[tokio::test]
    async fn work_set_orders_oldest_synced_first() {
        let dir = tempdir().expect("tempdir");
        let store = test_store(&dir).await;
        let never = store.insert_card(&sample_card("Never Synced")).await.unwrap();
        let old = store.insert_card(&sample_card("Old Sync")).await.unwrap();
        let fresh = store.insert_card(&sample_card("Fresh")).await.unwrap();

        store
            .mark_price_synced(old, Utc::now() - chrono::Duration::days(10))
            .await
            .unwrap();
        store.mark_price_synced(fresh, Utc::now()).await.unwrap();

        let stale_before = Utc::now() - chrono::Duration::hours(20);
        let batch = store
            .cards_needing_refresh(JobKind::Pricing, stale_before, 10)
            .await
            .unwrap();
        let ids: Vec<i64> = batch.iter().map(|c| c.id).collect();
        assert_eq!(ids, vec![never, old], "never-synced first, fresh excluded");
    }

    #[tokio::test]
    async fn interval_gate_enforces_spacing_not_just_average() {
        let gate = IntervalGate::new(Duration::from_millis(100));
        let started = Instant::now();
        gate.wait().await;
        gate.wait().await;
        gate.wait().await;
        // Three passes at 100ms spacing cannot complete before ~200ms.
        assert!(started.elapsed() >= Duration::from_millis(200));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };
        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(8), Duration::from_millis(350));
    }
}
