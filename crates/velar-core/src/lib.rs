//! Core domain model, normalization and fingerprint hashing for Velar.

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const CRATE_NAME: &str = "velar-core";

/// Source tag for the single external provider this worker consults.
pub const FUENTE_CPNU: &str = "CPNU";

/// Snapshot of a tracked process as selected by the due-process query.
/// The registry row itself is owned externally; the engine only reads it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proceso {
    pub id: i64,
    pub radicado: String,
    pub notify_first_actuacion: bool,
    pub created_at: Option<DateTime<Utc>>,
    pub fail_count: i64,
}

/// One procedural event row as extracted at the fetch boundary.
/// Fields hold the raw cell text; date parsing happens on demand so an
/// unparseable cell degrades to "no date" instead of an error.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActuacionRow {
    pub fecha_actuacion: String,
    pub actuacion: String,
    pub anotacion: String,
    pub fecha_inicia_termino: String,
    pub fecha_finaliza_termino: String,
    pub fecha_registro: String,
}

impl ActuacionRow {
    /// Parsed action date, used as the incremental low-water mark.
    pub fn fecha_actuacion_date(&self) -> Option<NaiveDate> {
        parse_fecha(&self.fecha_actuacion)
    }

    /// Normalized copy of the row for persistence and auditing.
    pub fn normalized(&self) -> ActuacionRow {
        ActuacionRow {
            fecha_actuacion: norm_text(&self.fecha_actuacion),
            actuacion: norm_text(&self.actuacion),
            anotacion: norm_text(&self.anotacion),
            fecha_inicia_termino: norm_text(&self.fecha_inicia_termino),
            fecha_finaliza_termino: norm_text(&self.fecha_finaliza_termino),
            fecha_registro: norm_text(&self.fecha_registro),
        }
    }

    /// JSON snapshot of the normalized row, stored alongside the canonical
    /// columns for auditing.
    pub fn to_raw_json(&self) -> String {
        serde_json::to_string(&self.normalized())
            .unwrap_or_else(|_| String::from("{}"))
    }
}

/// Parse the date formats the source site emits for "Fecha de Actuación".
pub fn parse_fecha(value: &str) -> Option<NaiveDate> {
    let v = norm_text(value);
    if v.is_empty() {
        return None;
    }
    for fmt in ["%Y-%m-%d", "%d/%m/%Y", "%Y/%m/%d"] {
        if let Ok(d) = NaiveDate::parse_from_str(&v, fmt) {
            return Some(d);
        }
    }
    // Datetime cells show up occasionally; keep the date part.
    for fmt in ["%Y-%m-%d %H:%M:%S", "%Y-%m-%dT%H:%M:%S"] {
        if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(&v, fmt) {
            return Some(dt.date());
        }
    }
    None
}

/// Collapse all whitespace runs (including NBSP) to a single ASCII space and
/// trim. Empty and absent values both normalize to the empty string.
pub fn norm_text(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

const FINGERPRINT_DELIMITER: &str = "|";

/// Stable content identity for one actuación of one radicado.
///
/// Depends only on the radicado and the six semantic fields, each normalized
/// first, so two fetches of the same event hash identically regardless of
/// incidental formatting. SHA-256, hex encoded.
pub fn fingerprint(radicado: &str, row: &ActuacionRow) -> String {
    let parts = [
        norm_text(radicado),
        norm_text(&row.fecha_actuacion),
        norm_text(&row.actuacion),
        norm_text(&row.anotacion),
        norm_text(&row.fecha_inicia_termino),
        norm_text(&row.fecha_finaliza_termino),
        norm_text(&row.fecha_registro),
    ];
    let mut hasher = Sha256::new();
    hasher.update(parts.join(FINGERPRINT_DELIMITER).as_bytes());
    hex::encode(hasher.finalize())
}

/// Which query strategy the source answered with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FetchMode {
    Recent,
    All,
}

impl FetchMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            FetchMode::Recent => "RECENT",
            FetchMode::All => "ALL",
        }
    }
}

impl std::fmt::Display for FetchMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Closed classification for everything that can go wrong at the fetch
/// boundary. Anything the boundary cannot name maps to `Error` before it
/// crosses into the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ErrorCode {
    BadInput,
    Timeout,
    Network,
    TabNotFound,
    NoData,
    EmptyTable,
    TableNotFound,
    ExtractionError,
    UiSelector,
    UiFlow,
    Softblock,
    Error,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::BadInput => "BAD_INPUT",
            ErrorCode::Timeout => "TIMEOUT",
            ErrorCode::Network => "NETWORK",
            ErrorCode::TabNotFound => "TAB_NOT_FOUND",
            ErrorCode::NoData => "NO_DATA",
            ErrorCode::EmptyTable => "EMPTY_TABLE",
            ErrorCode::TableNotFound => "TABLE_NOT_FOUND",
            ErrorCode::ExtractionError => "EXTRACTION_ERROR",
            ErrorCode::UiSelector => "UI_SELECTOR",
            ErrorCode::UiFlow => "UI_FLOW",
            ErrorCode::Softblock => "SOFTBLOCK",
            ErrorCode::Error => "ERROR",
        }
    }

    /// Parse a persisted code. Unknown strings collapse to the catch-all.
    pub fn parse(value: &str) -> ErrorCode {
        match value.trim().to_ascii_uppercase().as_str() {
            "BAD_INPUT" => ErrorCode::BadInput,
            "TIMEOUT" => ErrorCode::Timeout,
            "NETWORK" => ErrorCode::Network,
            "TAB_NOT_FOUND" => ErrorCode::TabNotFound,
            "NO_DATA" => ErrorCode::NoData,
            "EMPTY_TABLE" => ErrorCode::EmptyTable,
            "TABLE_NOT_FOUND" => ErrorCode::TableNotFound,
            "EXTRACTION_ERROR" => ErrorCode::ExtractionError,
            "UI_SELECTOR" => ErrorCode::UiSelector,
            "UI_FLOW" => ErrorCode::UiFlow,
            "SOFTBLOCK" => ErrorCode::Softblock,
            _ => ErrorCode::Error,
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}
