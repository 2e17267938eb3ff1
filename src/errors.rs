//! Error taxonomy for ingestion, reconciliation and metrics.
//!
//! Record-level problems are normally downgraded to [`crate::models::Issue`]s by
//! the caller; an `IngestError` escaping a file parser aborts only that file.

use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, IngestError>;

#[derive(Debug, Error)]
pub enum IngestError {
    /// Unexpected sheet or column layout
    #[error("unexpected layout in {source_name}: {message}")]
    ParseFormat { source_name: String, message: String },

    #[error("no amount found in {0:?}")]
    AmountParse(String),

    #[error("unrecognized date {0:?}")]
    DateParse(String),

    /// No extractable text (or extraction failed / timed out)
    #[error("document {path} is unreadable: {reason}")]
    DocumentUnreadable { path: PathBuf, reason: String },

    #[error("no valuation date found for {0}")]
    ValuationDateUnresolved(PathBuf),

    /// A flow key matches more than one investment
    #[error("{key} matches {candidates} investments")]
    LinkingAmbiguous { key: String, candidates: usize },

    #[error("rate solver did not converge after {iterations} iterations")]
    NoConvergence { iterations: usize },

    #[error("no adapter registered for platform {0}")]
    MissingAdapter(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("workbook error: {0}")]
    Workbook(String),

    #[error("store error: {0}")]
    Store(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl IngestError {
    /// Stable short code used in per-file issue reports.
    pub fn code(&self) -> &'static str {
        match self {
            Self::ParseFormat { .. } => "parse_format",
            Self::AmountParse(_) => "amount_parse",
            Self::DateParse(_) => "date_parse",
            Self::DocumentUnreadable { .. } => "document_unreadable",
            Self::ValuationDateUnresolved(_) => "valuation_date_unresolved",
            Self::LinkingAmbiguous { .. } => "linking_ambiguous",
            Self::NoConvergence { .. } => "no_convergence",
            Self::MissingAdapter(_) => "missing_adapter",
            Self::Config(_) => "config",
            Self::Workbook(_) => "workbook",
            Self::Store(_) => "store",
            Self::Io(_) => "io",
        }
    }

    pub fn format(source_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ParseFormat {
            source_name: source_name.into(),
            message: message.into(),
        }
    }
}

impl From<calamine::Error> for IngestError {
    fn from(err: calamine::Error) -> Self {
        Self::Workbook(err.to_string())
    }
}

impl From<rusqlite::Error> for IngestError {
    fn from(err: rusqlite::Error) -> Self {
        Self::Store(err.to_string())
    }
}

impl From<serde_json::Error> for IngestError {
    fn from(err: serde_json::Error) -> Self {
        Self::Config(err.to_string())
    }
}
