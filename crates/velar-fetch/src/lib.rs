//! Fetcher boundary contract + snapshot-backed implementation.
//!
//! The browser automation that drives the source website lives outside this
//! repository. Everything it can report crosses this boundary as a
//! [`FetchError`] carrying one of the closed [`ErrorCode`] classes.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use scraper::{ElementRef, Html, Selector};
use thiserror::Error;
use velar_core::{norm_text, ActuacionRow, ErrorCode, FetchMode};

pub const CRATE_NAME: &str = "velar-fetch";

/// Column header that identifies the actuaciones table on the results page.
const FECHA_HEADER: &str = "Fecha de Actuación";

/// Ordered rows (newest first, as the source renders them) plus the query
/// strategy that produced them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchOutcome {
    pub rows: Vec<ActuacionRow>,
    pub mode: FetchMode,
}

/// Classified fetch failure. Artifact paths are filled in by automation
/// front-ends that capture screenshots/page dumps on error; the engine only
/// records them.
#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct FetchError {
    pub code: ErrorCode,
    pub message: String,
    pub screenshot_path: Option<String>,
    pub html_path: Option<String>,
}

impl FetchError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            screenshot_path: None,
            html_path: None,
        }
    }

    pub fn with_artifacts(
        mut self,
        screenshot_path: Option<String>,
        html_path: Option<String>,
    ) -> Self {
        self.screenshot_path = screenshot_path;
        self.html_path = html_path;
        self
    }
}

/// One attempt against the external source for one radicado.
#[async_trait]
pub trait ActuacionFetcher: Send + Sync {
    async fn fetch(&self, radicado: &str) -> Result<FetchOutcome, FetchError>;
}

/// Strip the radicado to digits and require exactly 23 of them, rejecting
/// anything else before the source is ever contacted.
pub fn normalize_radicado(raw: &str) -> Result<String, FetchError> {
    let digits: String = raw.chars().filter(|c| c.is_ascii_digit()).collect();
    if digits.len() != 23 {
        return Err(FetchError::new(
            ErrorCode::BadInput,
            format!("el radicado debe tener 23 dígitos, se recibieron {}", digits.len()),
        ));
    }
    Ok(digits)
}

fn selector(css: &str) -> Result<Selector, FetchError> {
    Selector::parse(css).map_err(|e| FetchError::new(ErrorCode::ExtractionError, e.to_string()))
}

fn element_text(el: ElementRef<'_>) -> String {
    norm_text(&el.text().collect::<String>())
}

fn find_actuaciones_table<'a>(
    document: &'a Html,
    table_sel: &Selector,
    th_sel: &Selector,
) -> Option<ElementRef<'a>> {
    document.select(table_sel).find(|table| {
        table
            .select(th_sel)
            .any(|th| element_text(th).eq_ignore_ascii_case(FECHA_HEADER))
    })
}

fn page_reports_no_results(document: &Html) -> bool {
    let body = norm_text(&document.root_element().text().collect::<String>()).to_lowercase();
    body.contains("la consulta no generó resultados")
        || body.contains("no se encontraron resultados")
}

/// Extract actuaciones rows from a saved results page.
///
/// Classification mirrors what the live automation reports: a page that says
/// it has no results is `NO_DATA`, a page without the actuaciones table is
/// `TABLE_NOT_FOUND`, a table with an empty body is `EMPTY_TABLE`.
pub fn parse_actuaciones_table(
    html: &str,
    max_rows: usize,
) -> Result<Vec<ActuacionRow>, FetchError> {
    let document = Html::parse_document(html);
    let table_sel = selector("table")?;
    let th_sel = selector("th")?;
    let tr_sel = selector("tbody tr")?;
    let td_sel = selector("td")?;

    let Some(table) = find_actuaciones_table(&document, &table_sel, &th_sel) else {
        if page_reports_no_results(&document) {
            return Err(FetchError::new(
                ErrorCode::NoData,
                "la consulta no generó resultados",
            ));
        }
        return Err(FetchError::new(
            ErrorCode::TableNotFound,
            "no se encontró la tabla de actuaciones",
        ));
    };

    let mut rows = Vec::new();
    for tr in table.select(&tr_sel).take(max_rows) {
        let cells: Vec<String> = tr.select(&td_sel).map(element_text).collect();
        let cell = |i: usize| cells.get(i).cloned().unwrap_or_default();
        rows.push(ActuacionRow {
            fecha_actuacion: cell(0),
            actuacion: cell(1),
            anotacion: cell(2),
            fecha_inicia_termino: cell(3),
            fecha_finaliza_termino: cell(4),
            fecha_registro: cell(5),
        });
    }

    if rows.is_empty() {
        return Err(FetchError::new(
            ErrorCode::EmptyTable,
            "la tabla de actuaciones está vacía",
        ));
    }
    Ok(rows)
}

/// Fetcher that reads previously captured result pages from disk, keyed by
/// radicado. Lets the full pipeline run without the external automation; a
/// missing capture is indistinguishable from a no-results query.
#[derive(Debug, Clone)]
pub struct SnapshotFetcher {
    snapshot_dir: PathBuf,
    mode: FetchMode,
    max_rows: usize,
}

impl SnapshotFetcher {
    pub fn new(snapshot_dir: impl Into<PathBuf>, max_rows: usize) -> Self {
        Self {
            snapshot_dir: snapshot_dir.into(),
            mode: FetchMode::Recent,
            max_rows,
        }
    }

    pub fn with_mode(mut self, mode: FetchMode) -> Self {
        self.mode = mode;
        self
    }

    pub fn snapshot_path(&self, radicado: &str) -> PathBuf {
        self.snapshot_dir.join(format!("{radicado}.html"))
    }
}

#[async_trait]
impl ActuacionFetcher for SnapshotFetcher {
    async fn fetch(&self, radicado: &str) -> Result<FetchOutcome, FetchError> {
        let radicado = normalize_radicado(radicado)?;
        let path = self.snapshot_path(&radicado);
        let html = read_snapshot(&path)?;
        let rows = parse_actuaciones_table(&html, self.max_rows)
            .map_err(|e| e.with_artifacts(None, Some(path.display().to_string())))?;
        Ok(FetchOutcome { rows, mode: self.mode })
    }
}

fn read_snapshot(path: &Path) -> Result<String, FetchError> {
    match std::fs::read_to_string(path) {
        Ok(html) => Ok(html),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Err(FetchError::new(
            ErrorCode::NoData,
            format!("sin captura para consultar: {}", path.display()),
        )),
        Err(err) => Err(FetchError::new(
            ErrorCode::Error,
            format!("leyendo captura {}: {err}", path.display()),
        )),
    }
}
