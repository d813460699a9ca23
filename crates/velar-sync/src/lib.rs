//! Sync engine, backoff policy and scheduler loop for Velar.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use sqlx::SqlitePool;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{info, warn};
use uuid::Uuid;
use velar_core::{fingerprint, ErrorCode, FetchMode, Proceso, FUENTE_CPNU};
use velar_fetch::{ActuacionFetcher, FetchError, FetchOutcome, SnapshotFetcher};
use velar_storage as storage;
use velar_storage::RunFinish;

pub const CRATE_NAME: &str = "velar-sync";

/// Jitter ceilings in minutes, spread so many processes failing at once do
/// not all come due in the same instant.
const SUCCESS_JITTER_MAX: i64 = 7;
const FAILURE_JITTER_MAX: i64 = 10;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: String,
    pub snapshot_dir: PathBuf,
    pub batch_size: i64,
    pub check_rows: usize,
    pub baseline_rows: usize,
    pub new_process_window_hours: i64,
    pub interval_minutes: i64,
    pub dry_run: bool,
    /// Passed through to automation front-ends; the engine never reads it.
    pub headless: bool,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Self {
        Self {
            database_url: std::env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite://velar.db".to_string()),
            snapshot_dir: std::env::var("VELAR_SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|_| PathBuf::from("./snapshots")),
            batch_size: env_int("VELAR_BATCH_SIZE", 5),
            check_rows: env_int("VELAR_CHECK_ROWS", 50) as usize,
            baseline_rows: env_int("VELAR_BASELINE_ROWS", 1) as usize,
            new_process_window_hours: env_int("VELAR_NEW_PROCESS_WINDOW_HOURS", 24),
            interval_minutes: env_int("VELAR_INTERVAL_MINUTES", 60),
            dry_run: env_flag("VELAR_DRY_RUN", true),
            headless: env_flag("VELAR_HEADLESS", true),
            scheduler_enabled: env_flag("VELAR_SCHEDULER_ENABLED", false),
            sync_cron: std::env::var("VELAR_SYNC_CRON")
                .unwrap_or_else(|_| "0 0 * * * *".to_string()),
        }
    }
}

fn env_int(name: &str, default: i64) -> i64 {
    std::env::var(name)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_flag(name: &str, default: bool) -> bool {
    std::env::var(name)
        .map(|v| matches!(v.trim(), "1" | "true" | "TRUE" | "True" | "yes" | "YES"))
        .unwrap_or(default)
}

/// Backoff tiers, one per family of failure causes. Kept separate from the
/// jitter so the table is testable on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BackoffTier {
    /// The source site's structure likely changed; retrying soon is useless.
    UiInstability,
    /// Anti-automation detection; back off the longest.
    Softblock,
    /// Transient network or timing failure; retry quickly, escalating.
    Transient,
    /// Everything else, including BAD_INPUT (which will recur until the
    /// radicado is fixed externally, but still gets rescheduled).
    Default,
}

fn tier_for(code: ErrorCode) -> BackoffTier {
    match code {
        ErrorCode::UiSelector | ErrorCode::UiFlow => BackoffTier::UiInstability,
        ErrorCode::Softblock => BackoffTier::Softblock,
        ErrorCode::Timeout | ErrorCode::Network => BackoffTier::Transient,
        _ => BackoffTier::Default,
    }
}

/// Base delay in minutes before the next attempt, given the failure count
/// *after* this failure was counted. Non-decreasing in `fail_count` for any
/// fixed error class.
pub fn backoff_minutes(fail_count: i64, code: ErrorCode) -> i64 {
    match tier_for(code) {
        BackoffTier::UiInstability => {
            if fail_count < 3 {
                360
            } else {
                720
            }
        }
        BackoffTier::Softblock => {
            if fail_count < 2 {
                720
            } else {
                1440
            }
        }
        BackoffTier::Transient => escalating(fail_count, [10, 30, 90], 360),
        BackoffTier::Default => escalating(fail_count, [5, 15, 60], 360),
    }
}

fn escalating(fail_count: i64, steps: [i64; 3], cap: i64) -> i64 {
    match fail_count {
        c if c <= 1 => steps[0],
        2 => steps[1],
        3 => steps[2],
        _ => cap,
    }
}

fn jitter_minutes(max: i64) -> i64 {
    rand::thread_rng().gen_range(0..=max)
}

/// Whether a completed attempt is notify-worthy.
///
/// First syncs only notify for processes registered within the recency
/// window and flagged for it; a baseline seeded onto an old process is not
/// news. Incremental syncs notify whenever something new was stored.
pub fn decide_notified(
    is_momento0: bool,
    notify_first: bool,
    created_at: Option<DateTime<Utc>>,
    rows_inserted: i64,
    now: DateTime<Utc>,
    dry_run: bool,
    new_process_window_hours: i64,
) -> bool {
    if dry_run || rows_inserted <= 0 {
        return false;
    }
    if is_momento0 {
        let within_window = created_at
            .map(|t| now - t <= chrono::Duration::hours(new_process_window_hours))
            .unwrap_or(false);
        return notify_first && within_window;
    }
    true
}

/// Result of one attempt for one process, mirrored into the run ledger.
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: i64,
    pub proceso_id: i64,
    pub radicado: String,
    pub status: String,
    pub used_mode: Option<FetchMode>,
    pub rows_extracted: i64,
    pub rows_inserted: i64,
    pub notified: bool,
    pub is_momento0: bool,
}

impl RunOutcome {
    pub fn is_ok(&self) -> bool {
        self.status == "OK"
    }
}

/// Classified failure of one attempt, carried to the bookkeeping commit.
#[derive(Debug, Clone)]
struct AttemptFailure {
    code: ErrorCode,
    message: String,
    used_mode: Option<FetchMode>,
    rows_extracted: i64,
    screenshot_path: Option<String>,
    html_path: Option<String>,
}

impl From<FetchError> for AttemptFailure {
    fn from(err: FetchError) -> Self {
        Self {
            code: err.code,
            message: err.message,
            used_mode: None,
            rows_extracted: 0,
            screenshot_path: err.screenshot_path,
            html_path: err.html_path,
        }
    }
}

/// Drives one sync attempt per process: fetch, baseline-vs-incremental
/// dedupe, notification decision, ledger finalization and control update.
pub struct SyncEngine {
    pool: SqlitePool,
    config: SyncConfig,
    fetcher: Arc<dyn ActuacionFetcher>,
}

impl SyncEngine {
    pub fn new(pool: SqlitePool, config: SyncConfig, fetcher: Arc<dyn ActuacionFetcher>) -> Self {
        Self { pool, config, fetcher }
    }

    /// One attempt for one process. Classified failures are absorbed into the
    /// returned outcome; only database bookkeeping failures escape as `Err`,
    /// and those are fatal to the whole invocation.
    pub async fn run_one_proceso(&self, proceso: &Proceso) -> Result<RunOutcome> {
        let run_id =
            storage::insert_worker_run_start(&self.pool, proceso.id, FUENTE_CPNU, Utc::now())
                .await?;

        match self.attempt(proceso, run_id).await {
            Ok(outcome) => Ok(outcome),
            Err(failure) => {
                warn!(
                    proceso_id = proceso.id,
                    radicado = %proceso.radicado,
                    code = %failure.code,
                    message = %failure.message,
                    "sync attempt failed"
                );
                self.record_failure(proceso, run_id, &failure).await?;
                Ok(RunOutcome {
                    run_id,
                    proceso_id: proceso.id,
                    radicado: proceso.radicado.clone(),
                    status: failure.code.as_str().to_string(),
                    used_mode: failure.used_mode,
                    rows_extracted: failure.rows_extracted,
                    rows_inserted: 0,
                    notified: false,
                    is_momento0: false,
                })
            }
        }
    }

    async fn attempt(
        &self,
        proceso: &Proceso,
        run_id: i64,
    ) -> std::result::Result<RunOutcome, AttemptFailure> {
        let fetched = self.fetcher.fetch(&proceso.radicado).await.map_err(AttemptFailure::from)?;
        let rows_extracted = fetched.rows.len() as i64;

        self.apply_rows(proceso, run_id, &fetched).await.map_err(|err| AttemptFailure {
            code: ErrorCode::Error,
            message: format!("{err:#}"),
            used_mode: Some(fetched.mode),
            rows_extracted,
            screenshot_path: None,
            html_path: None,
        })
    }

    /// Dedupe + bookkeeping for a successful fetch, all in one transaction
    /// so a mid-flight crash leaves only the auditable RUNNING ledger row.
    async fn apply_rows(
        &self,
        proceso: &Proceso,
        run_id: i64,
        fetched: &FetchOutcome,
    ) -> Result<RunOutcome> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("opening sync transaction")?;

        let existing = storage::count_actuaciones(&mut *tx, proceso.id, FUENTE_CPNU).await?;
        let is_momento0 = existing == 0;
        let mut rows_inserted = 0i64;

        if is_momento0 {
            // Seed only the configured baseline instead of flooding storage
            // on first contact with a long-running case.
            for row in fetched.rows.iter().take(self.config.baseline_rows) {
                let hash = fingerprint(&proceso.radicado, row);
                if storage::insert_actuacion_if_new(
                    &mut *tx, proceso.id, FUENTE_CPNU, &hash, row, now,
                )
                .await?
                {
                    rows_inserted += 1;
                }
            }
        } else {
            let max_stored =
                storage::max_fecha_actuacion(&mut *tx, proceso.id, FUENTE_CPNU).await?;
            for row in fetched.rows.iter().take(self.config.check_rows) {
                // Rows arrive newest-first; an action date older than the
                // stored max means the rest is already known. This is a scan
                // cutoff, not a correctness gate: insertion stays idempotent.
                if let (Some(max_stored), Some(fecha)) = (max_stored, row.fecha_actuacion_date()) {
                    if fecha < max_stored {
                        break;
                    }
                }
                let hash = fingerprint(&proceso.radicado, row);
                if storage::insert_actuacion_if_new(
                    &mut *tx, proceso.id, FUENTE_CPNU, &hash, row, now,
                )
                .await?
                {
                    rows_inserted += 1;
                }
            }
        }

        let notified = decide_notified(
            is_momento0,
            proceso.notify_first_actuacion,
            proceso.created_at,
            rows_inserted,
            now,
            self.config.dry_run,
            self.config.new_process_window_hours,
        );

        let rows_extracted = fetched.rows.len() as i64;
        storage::finish_worker_run(
            &mut *tx,
            run_id,
            &RunFinish {
                status: "OK".into(),
                used_mode: Some(fetched.mode),
                rows_extracted,
                rows_inserted,
                notified,
                error_message: None,
                artifact_screenshot_path: None,
                artifact_html_path: None,
            },
            Utc::now(),
        )
        .await?;
        storage::mark_scheduler_success(
            &mut *tx,
            proceso.id,
            now,
            self.config.interval_minutes + jitter_minutes(SUCCESS_JITTER_MAX),
        )
        .await?;
        tx.commit().await.context("committing sync transaction")?;

        Ok(RunOutcome {
            run_id,
            proceso_id: proceso.id,
            radicado: proceso.radicado.clone(),
            status: "OK".into(),
            used_mode: Some(fetched.mode),
            rows_extracted,
            rows_inserted,
            notified,
            is_momento0,
        })
    }

    /// Second, separate commit that persists the failure classification after
    /// the success-path transaction has been rolled back.
    async fn record_failure(
        &self,
        proceso: &Proceso,
        run_id: i64,
        failure: &AttemptFailure,
    ) -> Result<()> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.context("opening failure transaction")?;

        storage::finish_worker_run(
            &mut *tx,
            run_id,
            &RunFinish {
                status: failure.code.as_str().to_string(),
                used_mode: failure.used_mode,
                rows_extracted: failure.rows_extracted,
                rows_inserted: 0,
                notified: false,
                error_message: Some(failure.message.clone()),
                artifact_screenshot_path: failure.screenshot_path.clone(),
                artifact_html_path: failure.html_path.clone(),
            },
            now,
        )
        .await?;

        let new_fail_count = proceso.fail_count + 1;
        let backoff = backoff_minutes(new_fail_count, failure.code) + jitter_minutes(FAILURE_JITTER_MAX);
        storage::mark_scheduler_failure(
            &mut *tx,
            proceso.id,
            new_fail_count,
            failure.code,
            &failure.message,
            now,
            backoff,
        )
        .await?;
        tx.commit().await.context("committing failure bookkeeping")
    }
}

/// Per-invocation totals, printed by the CLI and logged by the daemon.
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerRunSummary {
    pub invocation_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub due: usize,
    pub succeeded: usize,
    pub failed: usize,
    pub rows_inserted: i64,
    pub notified: usize,
    pub dry_run: bool,
}

/// Top-level loop: ensure control rows exist, pick the due set, run the
/// engine once per process with per-process commit isolation.
pub struct Scheduler {
    pool: SqlitePool,
    config: SyncConfig,
    engine: SyncEngine,
}

impl Scheduler {
    pub fn new(pool: SqlitePool, config: SyncConfig, fetcher: Arc<dyn ActuacionFetcher>) -> Self {
        let engine = SyncEngine::new(pool.clone(), config.clone(), fetcher);
        Self { pool, config, engine }
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    /// Idempotent control-row seeding for every actively tracked process.
    pub async fn bootstrap(&self) -> Result<usize> {
        let ids = storage::active_proceso_ids(&self.pool).await?;
        let now = Utc::now();
        for id in &ids {
            storage::ensure_control_row(&self.pool, *id, now).await?;
        }
        Ok(ids.len())
    }

    pub async fn run_once(&self) -> Result<SchedulerRunSummary> {
        let invocation_id = Uuid::new_v4();
        let started_at = Utc::now();

        self.bootstrap().await?;

        let due = storage::fetch_due_procesos(&self.pool, Utc::now(), self.config.batch_size)
            .await
            .context("reading due procesos")?;

        let mut summary = SchedulerRunSummary {
            invocation_id,
            started_at,
            finished_at: started_at,
            due: due.len(),
            succeeded: 0,
            failed: 0,
            rows_inserted: 0,
            notified: 0,
            dry_run: self.config.dry_run,
        };

        if due.is_empty() {
            info!(%invocation_id, "no hay procesos pendientes");
            summary.finished_at = Utc::now();
            return Ok(summary);
        }

        info!(%invocation_id, due = due.len(), dry_run = self.config.dry_run, "procesos a revisar");
        for proceso in &due {
            info!(proceso_id = proceso.id, radicado = %proceso.radicado, "revisando proceso");
            let outcome = self
                .engine
                .run_one_proceso(proceso)
                .await
                .with_context(|| format!("bookkeeping failed for proceso {}", proceso.id))?;
            if outcome.is_ok() {
                summary.succeeded += 1;
            } else {
                summary.failed += 1;
            }
            summary.rows_inserted += outcome.rows_inserted;
            if outcome.notified {
                summary.notified += 1;
            }
        }

        summary.finished_at = Utc::now();
        info!(
            %invocation_id,
            succeeded = summary.succeeded,
            failed = summary.failed,
            rows_inserted = summary.rows_inserted,
            "ejecución terminada"
        );
        Ok(summary)
    }
}

/// Build a scheduler from environment configuration, with the snapshot-backed
/// fetcher standing in for the external automation.
pub async fn scheduler_from_env() -> Result<Scheduler> {
    let config = SyncConfig::from_env();
    let pool = storage::connect(&config.database_url).await?;
    storage::init_schema(&pool).await?;
    let fetcher = Arc::new(SnapshotFetcher::new(config.snapshot_dir.clone(), config.check_rows));
    Ok(Scheduler::new(pool, config, fetcher))
}

pub async fn run_scheduler_once_from_env() -> Result<SchedulerRunSummary> {
    let scheduler = scheduler_from_env().await?;
    scheduler.run_once().await
}

/// Optional cron daemon wrapping [`Scheduler::run_once`]. Returns `None`
/// when the daemon is disabled by configuration.
pub async fn maybe_build_scheduler(scheduler: Arc<Scheduler>) -> Result<Option<JobScheduler>> {
    if !scheduler.config().scheduler_enabled {
        return Ok(None);
    }

    let cron = scheduler.config().sync_cron.clone();
    let sched = JobScheduler::new().await.context("creating cron scheduler")?;
    let job = Job::new_async(cron.as_str(), move |_uuid, _lock| {
        let scheduler = scheduler.clone();
        Box::pin(async move {
            match scheduler.run_once().await {
                Ok(summary) => info!(
                    invocation_id = %summary.invocation_id,
                    due = summary.due,
                    succeeded = summary.succeeded,
                    failed = summary.failed,
                    "scheduled sync finished"
                ),
                Err(err) => warn!(error = %format!("{err:#}"), "scheduled sync failed"),
            }
        })
    })
    .with_context(|| format!("creating cron job for {cron}"))?;
    sched.add(job).await.context("adding cron job")?;
    Ok(Some(sched))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::collections::VecDeque;
    use tokio::sync::Mutex;
    use velar_core::ActuacionRow;
    use velar_fetch::FetchError;

    const RADICADO_A: &str = "11001310300120240000100";
    const RADICADO_B: &str = "11001310300120240000200";

    /// Test double that replays a script of fetch results in call order.
    struct ScriptedFetcher {
        script: Mutex<VecDeque<std::result::Result<FetchOutcome, FetchError>>>,
    }

    impl ScriptedFetcher {
        fn new(
            script: Vec<std::result::Result<FetchOutcome, FetchError>>,
        ) -> Arc<Self> {
            Arc::new(Self { script: Mutex::new(script.into()) })
        }
    }

    #[async_trait]
    impl ActuacionFetcher for ScriptedFetcher {
        async fn fetch(&self, _radicado: &str) -> std::result::Result<FetchOutcome, FetchError> {
            self.script
                .lock()
                .await
                .pop_front()
                .expect("scripted fetcher exhausted")
        }
    }

    fn row(fecha: &str, actuacion: &str) -> ActuacionRow {
        ActuacionRow {
            fecha_actuacion: fecha.into(),
            actuacion: actuacion.into(),
            fecha_registro: fecha.into(),
            ..ActuacionRow::default()
        }
    }

    fn outcome(rows: Vec<ActuacionRow>) -> std::result::Result<FetchOutcome, FetchError> {
        Ok(FetchOutcome { rows, mode: FetchMode::Recent })
    }

    fn test_config() -> SyncConfig {
        SyncConfig {
            database_url: "sqlite::memory:".into(),
            snapshot_dir: PathBuf::from("./snapshots"),
            batch_size: 5,
            check_rows: 50,
            baseline_rows: 1,
            new_process_window_hours: 24,
            interval_minutes: 60,
            dry_run: false,
            headless: true,
            scheduler_enabled: false,
            sync_cron: "0 0 * * * *".into(),
        }
    }

    async fn test_pool() -> SqlitePool {
        let pool = storage::connect("sqlite::memory:").await.expect("open memory db");
        storage::init_schema(&pool).await.expect("init schema");
        pool
    }

    async fn seed_proceso(pool: &SqlitePool, radicado: &str) -> i64 {
        let id = storage::insert_proceso(pool, radicado, false, true, Some(Utc::now()))
            .await
            .expect("insert proceso");
        storage::ensure_control_row(pool, id, Utc::now()).await.expect("control row");
        id
    }

    fn ts(y: i32, m: u32, d: u32, h: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, 0, 0).single().expect("timestamp")
    }

    #[test]
    fn backoff_matches_documented_table() {
        use ErrorCode::*;
        assert_eq!(backoff_minutes(1, UiSelector), 360);
        assert_eq!(backoff_minutes(2, UiFlow), 360);
        assert_eq!(backoff_minutes(3, UiSelector), 720);
        assert_eq!(backoff_minutes(1, Softblock), 720);
        assert_eq!(backoff_minutes(2, Softblock), 1440);
        assert_eq!(backoff_minutes(1, Timeout), 10);
        assert_eq!(backoff_minutes(2, Network), 30);
        assert_eq!(backoff_minutes(3, Timeout), 90);
        assert_eq!(backoff_minutes(4, Network), 360);
        assert_eq!(backoff_minutes(1, Error), 5);
        assert_eq!(backoff_minutes(2, BadInput), 15);
        assert_eq!(backoff_minutes(3, NoData), 60);
        assert_eq!(backoff_minutes(7, EmptyTable), 360);
    }

    #[test]
    fn backoff_is_monotonic_per_class() {
        use ErrorCode::*;
        for code in [UiSelector, UiFlow, Softblock, Timeout, Network, BadInput, NoData, Error] {
            let mut previous = 0;
            for fail_count in 1..=8 {
                let delay = backoff_minutes(fail_count, code);
                assert!(
                    delay >= previous,
                    "{code} decreased from {previous} to {delay} at fail_count={fail_count}"
                );
                previous = delay;
            }
        }
    }

    #[test]
    fn notification_matrix() {
        let now = ts(2024, 3, 15, 12);
        let one_hour_ago = Some(now - chrono::Duration::hours(1));
        let two_days_ago = Some(now - chrono::Duration::hours(48));

        // dry run suppresses regardless of inserted rows
        assert!(!decide_notified(false, true, one_hour_ago, 3, now, true, 24));
        // first sync on a freshly registered process notifies
        assert!(decide_notified(true, true, one_hour_ago, 1, now, false, 24));
        // first sync on an old process seeds quietly
        assert!(!decide_notified(true, true, two_days_ago, 1, now, false, 24));
        // first sync without the flag never notifies
        assert!(!decide_notified(true, false, one_hour_ago, 1, now, false, 24));
        // incremental with new rows notifies
        assert!(decide_notified(false, false, None, 2, now, false, 24));
        // incremental with nothing new stays quiet
        assert!(!decide_notified(false, true, one_hour_ago, 0, now, false, 24));
    }

    #[tokio::test]
    async fn momento0_seeds_only_the_baseline() {
        let pool = test_pool().await;
        let pid = seed_proceso(&pool, RADICADO_A).await;
        let fetcher = ScriptedFetcher::new(vec![outcome(vec![
            row("2024-03-15", "Auto admite demanda"),
            row("2024-03-12", "Reparto"),
            row("2024-03-01", "Radicación"),
        ])]);
        let engine = SyncEngine::new(pool.clone(), test_config(), fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let outcome = engine.run_one_proceso(&due[0]).await.expect("run");

        assert!(outcome.is_ok());
        assert!(outcome.is_momento0);
        assert_eq!(outcome.rows_extracted, 3);
        assert_eq!(outcome.rows_inserted, 1);
        assert_eq!(
            storage::count_actuaciones(&pool, pid, FUENTE_CPNU).await.expect("count"),
            1
        );

        let run = storage::worker_run(&pool, outcome.run_id)
            .await
            .expect("read run")
            .expect("run exists");
        assert_eq!(run.status, "OK");
        assert_eq!(run.used_mode.as_deref(), Some("RECENT"));
        assert_eq!(run.rows_inserted, Some(1));
    }

    #[tokio::test]
    async fn incremental_scan_stops_at_older_than_stored_max() {
        let pool = test_pool().await;
        let pid = seed_proceso(&pool, RADICADO_A).await;

        // Stored low-water mark: 2024-03-10.
        let seeded = row("2024-03-10", "Auto previo");
        let hash = fingerprint(RADICADO_A, &seeded);
        storage::insert_actuacion_if_new(&pool, pid, FUENTE_CPNU, &hash, &seeded, Utc::now())
            .await
            .expect("seed actuación");

        let fetcher = ScriptedFetcher::new(vec![outcome(vec![
            row("2024-03-15", "Auto admite demanda"),
            row("2024-03-12", "Reparto"),
            row("2024-03-09", "Constancia"),
            row("2024-03-01", "Radicación"),
        ])]);
        let engine = SyncEngine::new(pool.clone(), test_config(), fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let outcome = engine.run_one_proceso(&due[0]).await.expect("run");

        // Only the first two rows are evaluated; the scan stops at 2024-03-09.
        assert!(!outcome.is_momento0);
        assert_eq!(outcome.rows_inserted, 2);
        assert_eq!(
            storage::count_actuaciones(&pool, pid, FUENTE_CPNU).await.expect("count"),
            3
        );
        assert_eq!(
            storage::max_fecha_actuacion(&pool, pid, FUENTE_CPNU).await.expect("max"),
            chrono::NaiveDate::from_ymd_opt(2024, 3, 15),
        );
    }

    #[tokio::test]
    async fn refetching_the_same_rows_inserts_nothing() {
        let pool = test_pool().await;
        let pid = seed_proceso(&pool, RADICADO_A).await;
        let rows = vec![row("2024-03-15", "Auto admite demanda"), row("2024-03-12", "Reparto")];
        let fetcher = ScriptedFetcher::new(vec![outcome(rows.clone()), outcome(rows)]);
        let config = SyncConfig { baseline_rows: 2, ..test_config() };
        let engine = SyncEngine::new(pool.clone(), config, fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let first = engine.run_one_proceso(&due[0]).await.expect("first run");
        assert_eq!(first.rows_inserted, 2);

        let second = engine.run_one_proceso(&due[0]).await.expect("second run");
        assert_eq!(second.rows_inserted, 0);
        assert!(!second.notified);
        assert_eq!(
            storage::count_actuaciones(&pool, pid, FUENTE_CPNU).await.expect("count"),
            2
        );
    }

    #[tokio::test]
    async fn classified_failure_is_recorded_and_backed_off() {
        let pool = test_pool().await;
        let pid = seed_proceso(&pool, RADICADO_A).await;
        let fetcher = ScriptedFetcher::new(vec![Err(FetchError::new(
            ErrorCode::Timeout,
            "page did not settle",
        ))]);
        let engine = SyncEngine::new(pool.clone(), test_config(), fetcher);

        let before = Utc::now();
        let due = storage::fetch_due_procesos(&pool, before, 5).await.expect("due");
        let outcome = engine.run_one_proceso(&due[0]).await.expect("run");

        assert_eq!(outcome.status, "TIMEOUT");
        assert!(!outcome.notified);

        let run = storage::worker_run(&pool, outcome.run_id)
            .await
            .expect("read run")
            .expect("run exists");
        assert_eq!(run.status, "TIMEOUT");
        assert_eq!(run.error_message.as_deref(), Some("page did not settle"));
        assert_eq!(run.notified, Some(false));

        let control = storage::control_row(&pool, pid)
            .await
            .expect("read control")
            .expect("control exists");
        assert_eq!(control.fail_count, 1);
        assert_eq!(control.last_error_code.as_deref(), Some("TIMEOUT"));
        // first TIMEOUT backs off 10 minutes plus at most 10 of jitter
        let cooldown = control.cooldown_until.expect("cooldown set");
        assert!(cooldown >= before + chrono::Duration::minutes(10));
        assert!(cooldown <= Utc::now() + chrono::Duration::minutes(20));
        assert_eq!(control.cooldown_until, control.next_run_at);
    }

    #[tokio::test]
    async fn success_resets_failure_state() {
        let pool = test_pool().await;
        let pid = seed_proceso(&pool, RADICADO_A).await;
        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::new(ErrorCode::Network, "connection reset")),
            outcome(vec![row("2024-03-15", "Auto admite demanda")]),
        ]);
        let engine = SyncEngine::new(pool.clone(), test_config(), fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let proceso = &due[0];
        engine.run_one_proceso(proceso).await.expect("failing run");

        // Re-read so the snapshot carries the bumped fail_count.
        let failed = storage::control_row(&pool, pid).await.expect("read").expect("exists");
        assert_eq!(failed.fail_count, 1);

        let retry = Proceso { fail_count: failed.fail_count, ..proceso.clone() };
        let outcome = engine.run_one_proceso(&retry).await.expect("successful run");
        assert!(outcome.is_ok());

        let control = storage::control_row(&pool, pid).await.expect("read").expect("exists");
        assert_eq!(control.fail_count, 0);
        assert_eq!(control.cooldown_until, None);
        assert_eq!(control.last_error_code, None);
        assert!(control.last_success_at.is_some());
    }

    #[tokio::test]
    async fn one_failing_proceso_does_not_abort_the_rest() {
        let pool = test_pool().await;
        let pid_a = seed_proceso(&pool, RADICADO_A).await;
        let pid_b = seed_proceso(&pool, RADICADO_B).await;

        // Pin the attempt order: A is due earlier, and its fetch blows up.
        sqlx::query("UPDATE vigilancia_control SET next_run_at = ? WHERE proceso_id = ?")
            .bind(Utc::now() - chrono::Duration::minutes(10))
            .bind(pid_a)
            .execute(&pool)
            .await
            .expect("age proceso A");

        let fetcher = ScriptedFetcher::new(vec![
            Err(FetchError::new(ErrorCode::Softblock, "unusual traffic")),
            outcome(vec![row("2024-03-15", "Auto admite demanda")]),
        ]);
        let scheduler = Scheduler::new(pool.clone(), test_config(), fetcher);

        let summary = scheduler.run_once().await.expect("run once");
        assert_eq!(summary.due, 2);
        assert_eq!(summary.failed, 1);
        assert_eq!(summary.succeeded, 1);
        assert_eq!(summary.rows_inserted, 1);

        assert_eq!(storage::count_actuaciones(&pool, pid_b, FUENTE_CPNU).await.expect("count"), 1);
        let control_a = storage::control_row(&pool, pid_a).await.expect("read").expect("exists");
        assert_eq!(control_a.last_error_code.as_deref(), Some("SOFTBLOCK"));
    }

    #[tokio::test]
    async fn run_once_with_nothing_due_reports_zero() {
        let pool = test_pool().await;
        let pid = storage::insert_proceso(&pool, RADICADO_A, false, true, None)
            .await
            .expect("proceso");
        storage::ensure_control_row(&pool, pid, Utc::now()).await.expect("row");
        storage::mark_scheduler_success(&pool, pid, Utc::now(), 60).await.expect("push out");

        let fetcher = ScriptedFetcher::new(vec![]);
        let scheduler = Scheduler::new(pool.clone(), test_config(), fetcher);
        let summary = scheduler.run_once().await.expect("run once");
        assert_eq!(summary.due, 0);
        assert_eq!(summary.succeeded, 0);
        assert_eq!(summary.failed, 0);
    }

    #[tokio::test]
    async fn bootstrap_creates_rows_for_active_procesos_only() {
        let pool = test_pool().await;
        let active = storage::insert_proceso(&pool, RADICADO_A, false, true, None)
            .await
            .expect("proceso");
        let paused = storage::insert_proceso(&pool, RADICADO_B, false, false, None)
            .await
            .expect("proceso");

        let fetcher = ScriptedFetcher::new(vec![]);
        let scheduler = Scheduler::new(pool.clone(), test_config(), fetcher);
        let seeded = scheduler.bootstrap().await.expect("bootstrap");
        assert_eq!(seeded, 1);
        let first = storage::control_row(&pool, active).await.expect("read").expect("row");
        assert!(storage::control_row(&pool, paused).await.expect("read").is_none());

        // A second bootstrap must leave the existing row untouched.
        scheduler.bootstrap().await.expect("second bootstrap");
        let second = storage::control_row(&pool, active).await.expect("read").expect("row");
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn dry_run_inserts_but_never_notifies() {
        let pool = test_pool().await;
        let pid = storage::insert_proceso(&pool, RADICADO_A, true, true, Some(Utc::now()))
            .await
            .expect("proceso");
        storage::ensure_control_row(&pool, pid, Utc::now()).await.expect("row");

        let fetcher = ScriptedFetcher::new(vec![outcome(vec![row(
            "2024-03-15",
            "Auto admite demanda",
        )])]);
        let config = SyncConfig { dry_run: true, ..test_config() };
        let engine = SyncEngine::new(pool.clone(), config, fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let outcome = engine.run_one_proceso(&due[0]).await.expect("run");
        assert_eq!(outcome.rows_inserted, 1);
        assert!(!outcome.notified);
    }

    #[tokio::test]
    async fn fresh_process_first_event_notifies_when_flagged() {
        let pool = test_pool().await;
        let pid = storage::insert_proceso(&pool, RADICADO_A, true, true, Some(Utc::now()))
            .await
            .expect("proceso");
        storage::ensure_control_row(&pool, pid, Utc::now()).await.expect("row");

        let fetcher = ScriptedFetcher::new(vec![outcome(vec![row(
            "2024-03-15",
            "Auto admite demanda",
        )])]);
        let engine = SyncEngine::new(pool.clone(), test_config(), fetcher);

        let due = storage::fetch_due_procesos(&pool, Utc::now(), 5).await.expect("due");
        let outcome = engine.run_one_proceso(&due[0]).await.expect("run");
        assert!(outcome.is_momento0);
        assert!(outcome.notified);

        let run = storage::worker_run(&pool, outcome.run_id)
            .await
            .expect("read run")
            .expect("run exists");
        assert_eq!(run.notified, Some(true));
    }
}
