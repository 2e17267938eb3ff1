//! PEA brokerage statements (PDF).
//!
//! Two document kinds come out of the broker: a chronological transaction
//! statement (`releve`, `compte`) and a point-in-time valuation
//! (`evaluation`, `portefeuille`). Each document is handled on its own; an
//! unreadable or undatable document is skipped without touching the others.

pub mod text;
pub mod transactions;
pub mod valuation;

use chrono::{DateTime, Local, NaiveDate};
use std::path::Path;
use std::time::Duration;

use crate::adapters::{AdapterOutput, ParseContext};
use crate::config::ValuationFallback;
use crate::errors::{IngestError, Result};
use crate::models::{CashFlow, Issue, LiquidityBalance, PortfolioPosition};
use crate::normalize::fold_key;

pub use transactions::parse_transactions;
pub use valuation::{parse_valuation, resolve_valuation_date};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentKind {
    Transactions,
    Valuation,
}

impl DocumentKind {
    /// Route a PEA file by the words in its name.
    pub fn from_file_name(name: &str) -> Option<Self> {
        let folded = fold_key(name);
        if ["evaluation", "portefeuille", "positions"].iter().any(|w| folded.contains(w)) {
            Some(Self::Valuation)
        } else if ["releve", "compte", "operations"].iter().any(|w| folded.contains(w)) {
            Some(Self::Transactions)
        } else {
            None
        }
    }
}

/// Everything one statement contributes.
#[derive(Debug, Clone, Default)]
pub struct StatementOutput {
    pub cash_flows: Vec<CashFlow>,
    pub positions: Vec<PortfolioPosition>,
    pub liquidity: Vec<LiquidityBalance>,
    pub issues: Vec<Issue>,
    pub skipped: usize,
}

impl StatementOutput {
    pub fn skip(&mut self, issue: Issue) {
        log::debug!("Skipping statement line: {}", issue.message);
        self.skipped += 1;
        self.issues.push(issue);
    }
}

impl From<StatementOutput> for AdapterOutput {
    fn from(s: StatementOutput) -> Self {
        AdapterOutput {
            cash_flows: s.cash_flows,
            positions: s.positions,
            liquidity: s.liquidity,
            issues: s.issues,
            skipped: s.skipped,
            ..Default::default()
        }
    }
}

fn modified_date(path: &Path) -> Result<NaiveDate> {
    let modified = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Local>::from(modified).date_naive())
}

/// Valuation date for an already-extracted document, applying the configured
/// fallback when neither the name nor the body carries one.
pub fn valuation_date_for(path: &Path, text: &str, ctx: &ParseContext) -> Result<(NaiveDate, Option<Issue>)> {
    let file_name = path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default();
    if let Some(date) = resolve_valuation_date(&file_name, text) {
        return Ok((date, None));
    }
    match ctx.config.statement.valuation_fallback {
        ValuationFallback::Skip => Err(IngestError::ValuationDateUnresolved(path.to_path_buf())),
        ValuationFallback::FileModified => {
            let date = modified_date(path)?;
            log::warn!("No valuation date in {}, using file modification date {}", file_name, date);
            let issue = Issue::warning(
                "valuation_date_estimated",
                format!("valuation date taken from file modification time ({})", date),
            )
            .at(file_name);
            Ok((date, Some(issue)))
        }
    }
}

/// Extract and parse one PEA document.
pub fn process_document(path: &Path, kind: DocumentKind, ctx: &ParseContext) -> Result<StatementOutput> {
    let timeout = Duration::from_secs(ctx.config.statement.extraction_timeout_secs);
    let text = text::extract_text(path, timeout)?;

    match kind {
        DocumentKind::Transactions => Ok(parse_transactions(&text, ctx)),
        DocumentKind::Valuation => {
            let (date, issue) = valuation_date_for(path, &text, ctx)?;
            let mut out = parse_valuation(&text, date, ctx);
            out.issues.extend(issue);
            Ok(out)
        }
    }
}
