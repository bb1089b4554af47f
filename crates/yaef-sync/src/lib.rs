//! Merge engine, sync entry points, and the interval scheduler.

use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;
use yaef_adapters::{
    collect_earnings, group_economic_events, parse_economic_page, AdapterError, EarningsSource,
    EconomicPageSource, HttpEarningsSource, HttpEconomicPageSource,
};
use yaef_core::{
    upsert, Decoded, DocumentError, EarningsCalendar, EconomicsCalendar, SchemaGeneration, Upsert,
};
use yaef_storage::{
    HttpClientConfig, HttpFetcher, JsonFileStore, Store, StoreError, DEFAULT_USER_AGENT,
};

pub const EARNINGS_DOCUMENT: &str = "earnings";
pub const ECONOMICS_DOCUMENT: &str = "economics";

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub data_dir: PathBuf,
    pub earnings_url: String,
    pub economic_calendar_url: String,
    pub min_market_cap: u64,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub scheduler_enabled: bool,
    pub sync_interval_secs: u64,
    pub web_port: u16,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            earnings_url: "https://query1.finance.yahoo.com/v1/finance/visualization".to_string(),
            economic_calendar_url: "https://www.forexfactory.com/calendar".to_string(),
            min_market_cap: 500_000_000,
            user_agent: DEFAULT_USER_AGENT.to_string(),
            http_timeout_secs: 20,
            scheduler_enabled: true,
            sync_interval_secs: 6 * 60 * 60,
            web_port: 8000,
        }
    }
}

fn env_or<T: FromStr>(name: &str, default: T) -> T {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
        .unwrap_or(default)
}

impl SyncConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            data_dir: std::env::var("YAEF_DATA_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.data_dir),
            earnings_url: std::env::var("YAEF_EARNINGS_URL").unwrap_or(defaults.earnings_url),
            economic_calendar_url: std::env::var("YAEF_ECONOMIC_CALENDAR_URL")
                .unwrap_or(defaults.economic_calendar_url),
            min_market_cap: env_or("YAEF_MIN_MARKET_CAP", defaults.min_market_cap),
            user_agent: std::env::var("YAEF_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_or("YAEF_HTTP_TIMEOUT_SECS", defaults.http_timeout_secs),
            scheduler_enabled: env_flag("YAEF_SCHEDULER_ENABLED", defaults.scheduler_enabled),
            sync_interval_secs: env_or("YAEF_SYNC_INTERVAL_SECS", defaults.sync_interval_secs),
            web_port: env_or("YAEF_WEB_PORT", defaults.web_port),
        }
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_secs.max(60))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncKind {
    Earnings,
    Economics,
}

impl SyncKind {
    pub fn document_key(self) -> &'static str {
        match self {
            Self::Earnings => EARNINGS_DOCUMENT,
            Self::Economics => ECONOMICS_DOCUMENT,
        }
    }
}

impl fmt::Display for SyncKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.document_key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncTarget {
    Earnings,
    Economics,
    All,
}

impl SyncTarget {
    pub fn kinds(self) -> &'static [SyncKind] {
        match self {
            Self::Earnings => &[SyncKind::Earnings],
            Self::Economics => &[SyncKind::Economics],
            Self::All => &[SyncKind::Earnings, SyncKind::Economics],
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MergeStats {
    pub inserted: usize,
    pub merged: usize,
}

impl MergeStats {
    fn record(&mut self, outcome: Upsert) {
        match outcome {
            Upsert::Inserted => self.inserted += 1,
            Upsert::Merged => self.merged += 1,
            Upsert::Skipped => {}
        }
    }
}

/// Upserts every incoming record into `existing` under the same day and company.
pub fn merge_earnings(existing: &mut EarningsCalendar, incoming: EarningsCalendar) -> MergeStats {
    let mut stats = MergeStats::default();
    for (day, groups) in incoming.into_days() {
        let target = existing.day_mut(day);
        for (company, records) in groups {
            let list = target.entry(company).or_default();
            for record in records {
                stats.record(upsert(list, record));
            }
        }
    }
    stats
}

pub fn merge_economics(existing: &mut EconomicsCalendar, incoming: EconomicsCalendar) -> MergeStats {
    let mut stats = MergeStats::default();
    for (day, events) in incoming.into_days() {
        for event in events {
            stats.record(existing.upsert_event(day, event));
        }
    }
    stats
}

/// Result of one successful sync of one calendar.
#[derive(Debug, Clone, Serialize)]
pub struct SyncOutcome {
    pub kind: SyncKind,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    /// Records (earnings) or rows (economics) received from the source.
    pub fetched: usize,
    /// Received items that could not be placed under a day.
    pub dropped: usize,
    pub inserted: usize,
    pub merged: usize,
    pub migrated_days: usize,
    pub stored_days: usize,
    pub stored_records: usize,
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("{kind} source failed: {source}")]
    Source {
        kind: SyncKind,
        #[source]
        source: AdapterError,
    },
    #[error("{kind} store failed: {source}")]
    Store {
        kind: SyncKind,
        #[source]
        source: StoreError,
    },
    #[error("{kind} document is corrupt: {source}")]
    Document {
        kind: SyncKind,
        #[source]
        source: DocumentError,
    },
    #[error("{kind} source returned no usable records; store left untouched")]
    Empty { kind: SyncKind },
}

impl SyncError {
    pub fn kind(&self) -> SyncKind {
        match self {
            Self::Source { kind, .. }
            | Self::Store { kind, .. }
            | Self::Document { kind, .. }
            | Self::Empty { kind } => *kind,
        }
    }

    pub fn is_empty_result(&self) -> bool {
        matches!(self, Self::Empty { .. })
    }
}

/// Logs a sync result: empty results at `warn`, failures at `error`.
pub fn log_sync_result(kind: SyncKind, result: &Result<SyncOutcome, SyncError>) {
    match result {
        Ok(outcome) => info!(
            kind = %kind,
            run_id = %outcome.run_id,
            fetched = outcome.fetched,
            dropped = outcome.dropped,
            inserted = outcome.inserted,
            merged = outcome.merged,
            days = outcome.stored_days,
            records = outcome.stored_records,
            "sync complete"
        ),
        Err(err) if err.is_empty_result() => warn!(kind = %kind, "{err}"),
        Err(err) => error!(kind = %kind, error = %err, "sync failed"),
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SyncStatus {
    pub kind: SyncKind,
    pub status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<SyncOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Default)]
pub struct SyncReport {
    pub results: Vec<(SyncKind, Result<SyncOutcome, SyncError>)>,
}

impl SyncReport {
    pub fn get(&self, kind: SyncKind) -> Option<&Result<SyncOutcome, SyncError>> {
        self.results
            .iter()
            .find(|(k, _)| *k == kind)
            .map(|(_, result)| result)
    }

    pub fn all_succeeded(&self) -> bool {
        self.results.iter().all(|(_, result)| result.is_ok())
    }

    pub fn log(&self) {
        for (kind, result) in &self.results {
            log_sync_result(*kind, result);
        }
    }

    pub fn statuses(&self) -> Vec<SyncStatus> {
        self.results
            .iter()
            .map(|(kind, result)| match result {
                Ok(outcome) => SyncStatus {
                    kind: *kind,
                    status: "ok",
                    outcome: Some(outcome.clone()),
                    error: None,
                },
                Err(err) => SyncStatus {
                    kind: *kind,
                    status: if err.is_empty_result() { "empty" } else { "error" },
                    outcome: None,
                    error: Some(err.to_string()),
                },
            })
            .collect()
    }
}

struct RunStart {
    kind: SyncKind,
    run_id: Uuid,
    started_at: DateTime<Utc>,
}

impl RunStart {
    fn new(kind: SyncKind) -> Self {
        Self {
            kind,
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
        }
    }
}

/// Fetch, merge into the stored document, and replace it, one calendar at a time.
///
/// Each run is a full read-modify-write of one document. Runs inside one
/// pipeline are serialized; separate processes sharing a store can still
/// lose updates.
pub struct SyncPipeline {
    store: Arc<dyn Store>,
    earnings: Box<dyn EarningsSource>,
    economics: Box<dyn EconomicPageSource>,
    min_market_cap: u64,
    reference_date: Option<NaiveDate>,
    run_lock: Mutex<()>,
}

impl SyncPipeline {
    pub fn new(
        store: Arc<dyn Store>,
        earnings: Box<dyn EarningsSource>,
        economics: Box<dyn EconomicPageSource>,
        min_market_cap: u64,
    ) -> Self {
        Self {
            store,
            earnings,
            economics,
            min_market_cap,
            reference_date: None,
            run_lock: Mutex::new(()),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Result<Self> {
        let http = HttpFetcher::new(config.http_client_config())
            .context("building calendar http client")?;
        let store: Arc<dyn Store> = Arc::new(JsonFileStore::new(config.data_dir.clone()));
        Ok(Self::new(
            store,
            Box::new(HttpEarningsSource::new(http.clone(), &config.earnings_url)),
            Box::new(HttpEconomicPageSource::new(http, &config.economic_calendar_url)),
            config.min_market_cap,
        ))
    }

    /// Pins the date year-less economic calendar dates are resolved against.
    pub fn with_reference_date(mut self, date: NaiveDate) -> Self {
        self.reference_date = Some(date);
        self
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.store)
    }

    fn today(&self) -> NaiveDate {
        self.reference_date
            .unwrap_or_else(|| Utc::now().date_naive())
    }

    pub async fn sync_earnings(&self) -> Result<SyncOutcome, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run = RunStart::new(SyncKind::Earnings);
        let span = info_span!("sync", kind = %run.kind, run_id = %run.run_id);
        self.run_earnings(run).instrument(span).await
    }

    pub async fn sync_economics(&self) -> Result<SyncOutcome, SyncError> {
        let _guard = self.run_lock.lock().await;
        let run = RunStart::new(SyncKind::Economics);
        let span = info_span!("sync", kind = %run.kind, run_id = %run.run_id);
        self.run_economics(run).instrument(span).await
    }

    /// Runs the targeted syncs one after another; a failure in one never skips the next.
    pub async fn run(&self, target: SyncTarget) -> SyncReport {
        let mut report = SyncReport::default();
        for &kind in target.kinds() {
            let result = match kind {
                SyncKind::Earnings => self.sync_earnings().await,
                SyncKind::Economics => self.sync_economics().await,
            };
            report.results.push((kind, result));
        }
        report
    }

    pub async fn sync_all(&self) -> SyncReport {
        self.run(SyncTarget::All).await
    }

    async fn run_earnings(&self, run: RunStart) -> Result<SyncOutcome, SyncError> {
        let kind = run.kind;
        let collection = collect_earnings(self.earnings.as_ref(), self.min_market_cap)
            .await
            .map_err(|source| SyncError::Source { kind, source })?;
        info!(
            source = self.earnings.source_id(),
            pages = collection.pages_fetched,
            records = collection.collected,
            days = collection.calendar.len(),
            "earnings collected"
        );
        if collection.calendar.is_empty() {
            return Err(SyncError::Empty { kind });
        }

        let Decoded {
            document: mut stored,
            migrated_days,
            ..
        } = self.load_earnings().await?;
        let stats = merge_earnings(&mut stored, collection.calendar);
        let bytes = stored
            .to_json_vec()
            .map_err(|source| SyncError::Document { kind, source })?;
        self.replace(kind, &bytes).await?;

        Ok(SyncOutcome {
            kind,
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at: Utc::now(),
            fetched: collection.collected,
            dropped: collection.dropped + collection.skipped_rows,
            inserted: stats.inserted,
            merged: stats.merged,
            migrated_days,
            stored_days: stored.len(),
            stored_records: stored.record_count(),
        })
    }

    async fn run_economics(&self, run: RunStart) -> Result<SyncOutcome, SyncError> {
        let kind = run.kind;
        let source = |source: AdapterError| SyncError::Source { kind, source };
        let page = self.economics.fetch_page().await.map_err(source)?;
        let events = parse_economic_page(&page).map_err(source)?;
        let parsed = events.len();
        let grouped = group_economic_events(events, self.today());
        info!(
            source = self.economics.source_id(),
            rows = parsed,
            days = grouped.calendar.len(),
            dropped = grouped.dropped,
            "economic calendar parsed"
        );
        if grouped.calendar.is_empty() {
            return Err(SyncError::Empty { kind });
        }

        let Decoded {
            document: mut stored,
            ..
        } = self.load_economics().await?;
        let stats = merge_economics(&mut stored, grouped.calendar);
        let bytes = stored
            .to_json_vec()
            .map_err(|source| SyncError::Document { kind, source })?;
        self.replace(kind, &bytes).await?;

        Ok(SyncOutcome {
            kind,
            run_id: run.run_id,
            started_at: run.started_at,
            finished_at: Utc::now(),
            fetched: parsed,
            dropped: grouped.dropped,
            inserted: stats.inserted,
            merged: stats.merged,
            migrated_days: 0,
            stored_days: stored.len(),
            stored_records: stored.event_count(),
        })
    }

    async fn read(&self, kind: SyncKind) -> Result<Option<Vec<u8>>, SyncError> {
        self.store
            .read(kind.document_key())
            .await
            .map_err(|source| SyncError::Store { kind, source })
    }

    async fn replace(&self, kind: SyncKind, bytes: &[u8]) -> Result<(), SyncError> {
        self.store
            .write(kind.document_key(), bytes)
            .await
            .map_err(|source| SyncError::Store { kind, source })
    }

    async fn load_earnings(&self) -> Result<Decoded<EarningsCalendar>, SyncError> {
        let kind = SyncKind::Earnings;
        let Some(bytes) = self.read(kind).await? else {
            return Ok(empty_document(EarningsCalendar::new()));
        };
        let decoded = EarningsCalendar::from_json_slice(&bytes)
            .map_err(|source| SyncError::Document { kind, source })?;
        if decoded.generation != SchemaGeneration::Grouped {
            info!(
                generation = ?decoded.generation,
                migrated_days = decoded.migrated_days,
                "earnings document upgraded from legacy shape"
            );
        }
        Ok(decoded)
    }

    async fn load_economics(&self) -> Result<Decoded<EconomicsCalendar>, SyncError> {
        let kind = SyncKind::Economics;
        let Some(bytes) = self.read(kind).await? else {
            return Ok(empty_document(EconomicsCalendar::new()));
        };
        EconomicsCalendar::from_json_slice(&bytes)
            .map_err(|source| SyncError::Document { kind, source })
    }
}

fn empty_document<T>(document: T) -> Decoded<T> {
    Decoded {
        document,
        generation: SchemaGeneration::Grouped,
        migrated_days: 0,
    }
}

/// Starts a repeated `sync_all` job and kicks off one run immediately in the background.
pub async fn start_scheduler(pipeline: Arc<SyncPipeline>, interval: Duration) -> Result<JobScheduler> {
    let sched = JobScheduler::new().await.context("creating scheduler")?;
    let job_pipeline = Arc::clone(&pipeline);
    let job = Job::new_repeated_async(interval, move |_uuid, _lock| {
        let pipeline = Arc::clone(&job_pipeline);
        Box::pin(async move {
            pipeline.sync_all().await.log();
        })
    })
    .context("creating repeated sync job")?;
    sched.add(job).await.context("adding sync job")?;
    sched.start().await.context("starting scheduler")?;

    tokio::spawn(async move {
        pipeline.sync_all().await.log();
    });
    info!(interval_secs = interval.as_secs(), "sync scheduler started");
    Ok(sched)
}

pub async fn maybe_start_scheduler(
    pipeline: Arc<SyncPipeline>,
    config: &SyncConfig,
) -> Result<Option<JobScheduler>> {
    if !config.scheduler_enabled {
        info!("sync scheduler disabled");
        return Ok(None);
    }
    start_scheduler(pipeline, config.sync_interval()).await.map(Some)
}

pub async fn run_sync_from_env(target: SyncTarget) -> Result<SyncReport> {
    let config = SyncConfig::from_env();
    let pipeline = SyncPipeline::from_config(&config)?;
    Ok(pipeline.run(target).await)
}
