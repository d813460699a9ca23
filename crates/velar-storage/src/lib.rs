//! SQLite persistence for Velar: control rows, deduplicated actuaciones and
//! the per-attempt run ledger.
//!
//! Every operation takes a [`sqlx::SqliteExecutor`], so the sync engine can
//! run it either against the pool (auto-commit) or inside a transaction. The
//! pool is capped at one connection; the worker is single-writer by design
//! and the UNIQUE constraint on `(proceso_id, fuente, hash)` is what makes
//! repeated insertion of the same event a no-op.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions, SqliteRow};
use sqlx::{Row, SqliteExecutor, SqlitePool};
use tracing::debug;
use velar_core::{ActuacionRow, ErrorCode, FetchMode, Proceso};

pub const CRATE_NAME: &str = "velar-storage";

/// Persisted error messages are truncated to this many characters.
pub const ERROR_MESSAGE_MAX_CHARS: usize = 1500;

const SCHEMA: &[&str] = &[
    "CREATE TABLE IF NOT EXISTS procesos (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        radicado TEXT NOT NULL,
        notify_first_actuacion INTEGER NOT NULL DEFAULT 0,
        vigilancia_activa INTEGER NOT NULL DEFAULT 1,
        created_at TEXT
    )",
    "CREATE TABLE IF NOT EXISTS vigilancia_control (
        proceso_id INTEGER PRIMARY KEY REFERENCES procesos(id),
        next_run_at TEXT,
        cooldown_until TEXT,
        fail_count INTEGER NOT NULL DEFAULT 0,
        last_run_at TEXT,
        last_success_at TEXT,
        last_error_code TEXT,
        last_error_message TEXT
    )",
    "CREATE TABLE IF NOT EXISTS actuaciones (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proceso_id INTEGER NOT NULL REFERENCES procesos(id),
        fuente TEXT NOT NULL,
        hash TEXT NOT NULL,
        fecha_actuacion TEXT,
        actuacion TEXT NOT NULL DEFAULT '',
        anotacion TEXT NOT NULL DEFAULT '',
        fecha_inicia_termino TEXT NOT NULL DEFAULT '',
        fecha_finaliza_termino TEXT NOT NULL DEFAULT '',
        fecha_registro TEXT NOT NULL DEFAULT '',
        raw_row_json TEXT NOT NULL DEFAULT '{}',
        created_at TEXT,
        UNIQUE (proceso_id, fuente, hash)
    )",
    "CREATE TABLE IF NOT EXISTS worker_runs (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        proceso_id INTEGER NOT NULL REFERENCES procesos(id),
        fuente TEXT NOT NULL,
        status TEXT NOT NULL,
        started_at TEXT NOT NULL,
        finished_at TEXT,
        used_mode TEXT,
        rows_extracted INTEGER,
        rows_inserted INTEGER,
        notified INTEGER,
        error_message TEXT,
        artifact_screenshot_path TEXT,
        artifact_html_path TEXT
    )",
];

/// Open (creating if missing) the worker database.
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)
        .with_context(|| format!("parsing database url {database_url}"))?
        .create_if_missing(true)
        .foreign_keys(true)
        .busy_timeout(Duration::from_secs(5));

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .with_context(|| format!("opening database {database_url}"))?;
    Ok(pool)
}

pub async fn init_schema(pool: &SqlitePool) -> Result<()> {
    for statement in SCHEMA {
        sqlx::query(statement)
            .execute(pool)
            .await
            .context("applying schema statement")?;
    }
    debug!("schema ready");
    Ok(())
}

/// Scheduling state for one tracked process.
#[derive(Debug, Clone, PartialEq)]
pub struct ControlRow {
    pub proceso_id: i64,
    pub next_run_at: Option<DateTime<Utc>>,
    pub cooldown_until: Option<DateTime<Utc>>,
    pub fail_count: i64,
    pub last_run_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
    pub last_error_code: Option<String>,
    pub last_error_message: Option<String>,
}

/// One row of the run ledger.
#[derive(Debug, Clone, PartialEq)]
pub struct WorkerRun {
    pub id: i64,
    pub proceso_id: i64,
    pub fuente: String,
    pub status: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
    pub used_mode: Option<String>,
    pub rows_extracted: Option<i64>,
    pub rows_inserted: Option<i64>,
    pub notified: Option<bool>,
    pub error_message: Option<String>,
    pub artifact_screenshot_path: Option<String>,
    pub artifact_html_path: Option<String>,
}

/// Terminal values for a run-ledger row.
#[derive(Debug, Clone, PartialEq)]
pub struct RunFinish {
    pub status: String,
    pub used_mode: Option<FetchMode>,
    pub rows_extracted: i64,
    pub rows_inserted: i64,
    pub notified: bool,
    pub error_message: Option<String>,
    pub artifact_screenshot_path: Option<String>,
    pub artifact_html_path: Option<String>,
}

/// Register a process in the local registry. The registry is owned by the
/// outer system in production; this exists for bootstrap tooling and tests.
pub async fn insert_proceso(
    ex: impl SqliteExecutor<'_>,
    radicado: &str,
    notify_first_actuacion: bool,
    vigilancia_activa: bool,
    created_at: Option<DateTime<Utc>>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO procesos (radicado, notify_first_actuacion, vigilancia_activa, created_at)
         VALUES (?, ?, ?, ?)",
    )
    .bind(radicado)
    .bind(notify_first_actuacion as i64)
    .bind(vigilancia_activa as i64)
    .bind(created_at)
    .execute(ex)
    .await
    .context("inserting proceso")?;
    Ok(result.last_insert_rowid())
}

pub async fn active_proceso_ids(ex: impl SqliteExecutor<'_>) -> Result<Vec<i64>> {
    sqlx::query_scalar::<_, i64>("SELECT id FROM procesos WHERE vigilancia_activa = 1 ORDER BY id")
        .fetch_all(ex)
        .await
        .context("listing active procesos")
}

/// Create the control row for a process if it does not exist yet. A no-op
/// for processes that already have one; existing scheduling state is never
/// overwritten.
pub async fn ensure_control_row(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "INSERT INTO vigilancia_control (proceso_id, next_run_at, fail_count)
         VALUES (?, ?, 0)
         ON CONFLICT (proceso_id) DO NOTHING",
    )
    .bind(proceso_id)
    .bind(now)
    .execute(ex)
    .await
    .with_context(|| format!("ensuring control row for proceso {proceso_id}"))?;
    Ok(())
}

pub async fn control_row(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
) -> Result<Option<ControlRow>> {
    let row = sqlx::query(
        "SELECT proceso_id, next_run_at, cooldown_until, fail_count,
                last_run_at, last_success_at, last_error_code, last_error_message
         FROM vigilancia_control WHERE proceso_id = ?",
    )
    .bind(proceso_id)
    .fetch_optional(ex)
    .await
    .with_context(|| format!("reading control row for proceso {proceso_id}"))?;
    row.map(|r| map_control_row(&r)).transpose()
}

fn map_control_row(row: &SqliteRow) -> Result<ControlRow> {
    Ok(ControlRow {
        proceso_id: row.try_get("proceso_id")?,
        next_run_at: row.try_get("next_run_at")?,
        cooldown_until: row.try_get("cooldown_until")?,
        fail_count: row.try_get("fail_count")?,
        last_run_at: row.try_get("last_run_at")?,
        last_success_at: row.try_get("last_success_at")?,
        last_error_code: row.try_get("last_error_code")?,
        last_error_message: row.try_get("last_error_message")?,
    })
}

/// Actively tracked processes whose cooldown and next-run time have both
/// elapsed, oldest next-run first (never-run rows first of all).
pub async fn fetch_due_procesos(
    ex: impl SqliteExecutor<'_>,
    now: DateTime<Utc>,
    limit: i64,
) -> Result<Vec<Proceso>> {
    let rows = sqlx::query(
        "SELECT p.id AS proceso_id, p.radicado, p.notify_first_actuacion, p.created_at,
                vc.fail_count
         FROM procesos p
         JOIN vigilancia_control vc ON vc.proceso_id = p.id
         WHERE p.vigilancia_activa = 1
           AND (vc.cooldown_until IS NULL OR vc.cooldown_until <= ?)
           AND (vc.next_run_at IS NULL OR vc.next_run_at <= ?)
         ORDER BY COALESCE(vc.next_run_at, '1970-01-01') ASC
         LIMIT ?",
    )
    .bind(now)
    .bind(now)
    .bind(limit)
    .fetch_all(ex)
    .await
    .context("selecting due procesos")?;

    rows.iter()
        .map(|r| {
            Ok(Proceso {
                id: r.try_get("proceso_id")?,
                radicado: r.try_get("radicado")?,
                notify_first_actuacion: r.try_get::<i64, _>("notify_first_actuacion")? != 0,
                created_at: r.try_get("created_at")?,
                fail_count: r.try_get("fail_count")?,
            })
        })
        .collect()
}

pub async fn count_actuaciones(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    fuente: &str,
) -> Result<i64> {
    sqlx::query_scalar::<_, i64>(
        "SELECT COUNT(*) FROM actuaciones WHERE proceso_id = ? AND fuente = ?",
    )
    .bind(proceso_id)
    .bind(fuente)
    .fetch_one(ex)
    .await
    .with_context(|| format!("counting actuaciones for proceso {proceso_id}"))
}

/// Highest stored action date, the incremental low-water mark.
pub async fn max_fecha_actuacion(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    fuente: &str,
) -> Result<Option<NaiveDate>> {
    sqlx::query_scalar::<_, Option<NaiveDate>>(
        "SELECT MAX(fecha_actuacion) FROM actuaciones WHERE proceso_id = ? AND fuente = ?",
    )
    .bind(proceso_id)
    .bind(fuente)
    .fetch_one(ex)
    .await
    .with_context(|| format!("reading max fecha_actuacion for proceso {proceso_id}"))
}

/// Append one actuación unless its fingerprint is already stored for this
/// process and source. Returns whether a row was newly inserted; a duplicate
/// is an expected `false`, not an error.
pub async fn insert_actuacion_if_new(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    fuente: &str,
    hash: &str,
    row: &ActuacionRow,
    now: DateTime<Utc>,
) -> Result<bool> {
    let normalized = row.normalized();
    let result = sqlx::query(
        "INSERT INTO actuaciones
             (proceso_id, fuente, hash, fecha_actuacion, actuacion, anotacion,
              fecha_inicia_termino, fecha_finaliza_termino, fecha_registro,
              raw_row_json, created_at)
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
         ON CONFLICT (proceso_id, fuente, hash) DO NOTHING",
    )
    .bind(proceso_id)
    .bind(fuente)
    .bind(hash)
    .bind(row.fecha_actuacion_date())
    .bind(&normalized.actuacion)
    .bind(&normalized.anotacion)
    .bind(&normalized.fecha_inicia_termino)
    .bind(&normalized.fecha_finaliza_termino)
    .bind(&normalized.fecha_registro)
    .bind(row.to_raw_json())
    .bind(now)
    .execute(ex)
    .await
    .with_context(|| format!("inserting actuación for proceso {proceso_id}"))?;
    Ok(result.rows_affected() == 1)
}

/// Open a run-ledger row with status RUNNING. Committed immediately by the
/// caller so a crash mid-attempt still leaves an auditable row.
pub async fn insert_worker_run_start(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    fuente: &str,
    now: DateTime<Utc>,
) -> Result<i64> {
    let result = sqlx::query(
        "INSERT INTO worker_runs (proceso_id, fuente, status, started_at)
         VALUES (?, ?, 'RUNNING', ?)",
    )
    .bind(proceso_id)
    .bind(fuente)
    .bind(now)
    .execute(ex)
    .await
    .with_context(|| format!("opening worker run for proceso {proceso_id}"))?;
    Ok(result.last_insert_rowid())
}

/// Finalize a run-ledger row exactly once. The error message is truncated to
/// [`ERROR_MESSAGE_MAX_CHARS`] before it is persisted.
pub async fn finish_worker_run(
    ex: impl SqliteExecutor<'_>,
    run_id: i64,
    finish: &RunFinish,
    now: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE worker_runs
         SET finished_at = ?,
             status = ?,
             used_mode = ?,
             rows_extracted = ?,
             rows_inserted = ?,
             notified = ?,
             error_message = ?,
             artifact_screenshot_path = ?,
             artifact_html_path = ?
         WHERE id = ?",
    )
    .bind(now)
    .bind(&finish.status)
    .bind(finish.used_mode.map(|m| m.as_str()))
    .bind(finish.rows_extracted)
    .bind(finish.rows_inserted)
    .bind(finish.notified as i64)
    .bind(finish.error_message.as_deref().map(truncate_message))
    .bind(&finish.artifact_screenshot_path)
    .bind(&finish.artifact_html_path)
    .bind(run_id)
    .execute(ex)
    .await
    .with_context(|| format!("finalizing worker run {run_id}"))?;
    Ok(())
}

pub async fn worker_run(ex: impl SqliteExecutor<'_>, run_id: i64) -> Result<Option<WorkerRun>> {
    let row = sqlx::query(
        "SELECT id, proceso_id, fuente, status, started_at, finished_at, used_mode,
                rows_extracted, rows_inserted, notified, error_message,
                artifact_screenshot_path, artifact_html_path
         FROM worker_runs WHERE id = ?",
    )
    .bind(run_id)
    .fetch_optional(ex)
    .await
    .with_context(|| format!("reading worker run {run_id}"))?;
    row.map(|r| map_worker_run(&r)).transpose()
}

fn map_worker_run(row: &SqliteRow) -> Result<WorkerRun> {
    Ok(WorkerRun {
        id: row.try_get("id")?,
        proceso_id: row.try_get("proceso_id")?,
        fuente: row.try_get("fuente")?,
        status: row.try_get("status")?,
        started_at: row.try_get("started_at")?,
        finished_at: row.try_get("finished_at")?,
        used_mode: row.try_get("used_mode")?,
        rows_extracted: row.try_get("rows_extracted")?,
        rows_inserted: row.try_get("rows_inserted")?,
        notified: row
            .try_get::<Option<i64>, _>("notified")?
            .map(|n| n != 0),
        error_message: row.try_get("error_message")?,
        artifact_screenshot_path: row.try_get("artifact_screenshot_path")?,
        artifact_html_path: row.try_get("artifact_html_path")?,
    })
}

/// Success-path control update: clears failure state and schedules the next
/// regular run. `minutes_until_next` already includes the caller's jitter.
pub async fn mark_scheduler_success(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    now: DateTime<Utc>,
    minutes_until_next: i64,
) -> Result<()> {
    let next_run_at = now + chrono::Duration::minutes(minutes_until_next);
    sqlx::query(
        "UPDATE vigilancia_control
         SET last_run_at = ?,
             last_success_at = ?,
             fail_count = 0,
             cooldown_until = NULL,
             last_error_code = NULL,
             last_error_message = NULL,
             next_run_at = ?
         WHERE proceso_id = ?",
    )
    .bind(now)
    .bind(now)
    .bind(next_run_at)
    .bind(proceso_id)
    .execute(ex)
    .await
    .with_context(|| format!("recording success for proceso {proceso_id}"))?;
    Ok(())
}

/// Failure-path control update: bumps the failure count, records the error
/// class and (truncated) message, and pushes both the cooldown floor and the
/// next run out by `backoff_minutes` (jitter included by the caller).
pub async fn mark_scheduler_failure(
    ex: impl SqliteExecutor<'_>,
    proceso_id: i64,
    new_fail_count: i64,
    error_code: ErrorCode,
    error_message: &str,
    now: DateTime<Utc>,
    backoff_minutes: i64,
) -> Result<()> {
    let until = now + chrono::Duration::minutes(backoff_minutes);
    sqlx::query(
        "UPDATE vigilancia_control
         SET last_run_at = ?,
             fail_count = ?,
             last_error_code = ?,
             last_error_message = ?,
             cooldown_until = ?,
             next_run_at = ?
         WHERE proceso_id = ?",
    )
    .bind(now)
    .bind(new_fail_count)
    .bind(error_code.as_str())
    .bind(truncate_message(error_message))
    .bind(until)
    .bind(until)
    .bind(proceso_id)
    .execute(ex)
    .await
    .with_context(|| format!("recording failure for proceso {proceso_id}"))?;
    Ok(())
}

fn truncate_message(message: &str) -> String {
    message.chars().take(ERROR_MESSAGE_MAX_CHARS).collect()
}
