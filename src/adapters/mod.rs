//! Spreadsheet platform adapters.
//!
//! Each platform exports a workbook with its own fixed sheet names and column
//! positions. An adapter turns the raw cell grid into raw investments and cash
//! flows, attaching a [`LinkKey`] to every flow so the reconciler can find its
//! investment later. Row-level problems are reported as issues and the row is
//! skipped; a missing required sheet fails the whole file.

pub mod assurance_vie;
pub mod bienpreter;
pub mod homunity;
pub mod lpb;
pub mod pretup;
pub mod workbook;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::HashMap;
use uuid::Uuid;

use crate::config::IngestConfig;
use crate::errors::{IngestError, Result};
use crate::models::{CashFlow, Investment, Issue, LiquidityBalance, Platform, PortfolioPosition};
use crate::normalize::{fold_key, parse_amount, parse_amount_or_zero, parse_date};

// =============================================================================
// Raw tables
// =============================================================================

/// One worksheet as trimmed string cells.
#[derive(Debug, Clone, Default)]
pub struct Sheet {
    pub name: String,
    pub rows: Vec<Vec<String>>,
}

impl Sheet {
    pub fn new(name: &str, rows: Vec<Vec<String>>) -> Self {
        Self { name: name.to_string(), rows }
    }

    /// Non-blank rows with their zero-based index.
    pub fn data_rows(&self) -> impl Iterator<Item = (usize, &[String])> {
        self.rows
            .iter()
            .enumerate()
            .filter(|(_, row)| row.iter().any(|c| !c.trim().is_empty()))
            .map(|(idx, row)| (idx, row.as_slice()))
    }

    /// First of the leading rows whose key cell is one of `anchors`.
    pub fn header_row(&self, anchors: &[&str]) -> Option<usize> {
        self.rows.iter().take(5).position(|row| {
            let folded = fold_key(cell(row, 0));
            !folded.is_empty() && anchors.iter().any(|a| folded == *a)
        })
    }

    /// Column of the `header` row whose label contains one of `labels`.
    pub fn find_column(&self, header: usize, labels: &[&str]) -> Option<usize> {
        self.rows.get(header)?.iter().position(|label| {
            let folded = fold_key(label);
            labels.iter().any(|l| folded.contains(l))
        })
    }

    /// `Sheet!R12` style reference, one-based.
    pub fn reference(&self, row_idx: usize) -> String {
        format!("{}!R{}", self.name, row_idx + 1)
    }
}

/// All sheets of one source file.
#[derive(Debug, Clone, Default)]
pub struct RawTables {
    pub source: String,
    pub sheets: Vec<Sheet>,
}

impl RawTables {
    pub fn new(source: &str, sheets: Vec<Sheet>) -> Self {
        Self { source: source.to_string(), sheets }
    }

    /// Sheet lookup tolerant of accents and case (`Relevé compte` == `releve compte`).
    pub fn sheet(&self, name: &str) -> Option<&Sheet> {
        let wanted = fold_key(name);
        self.sheets.iter().find(|s| fold_key(&s.name) == wanted)
    }

    pub fn require_sheet(&self, name: &str) -> Result<&Sheet> {
        self.sheet(name)
            .ok_or_else(|| IngestError::format(&self.source, format!("missing sheet {:?}", name)))
    }

    pub fn first_sheet(&self) -> Option<&Sheet> {
        self.sheets.first()
    }
}

// =============================================================================
// Row helpers
// =============================================================================

pub(crate) fn cell(row: &[String], col: usize) -> &str {
    row.get(col).map(|c| c.trim()).unwrap_or("")
}

/// True when the key cell is blank or one of the header labels.
pub(crate) fn is_header_or_blank(value: &str, labels: &[&str]) -> bool {
    let folded = fold_key(value);
    folded.is_empty() || labels.iter().any(|l| folded == *l)
}

pub(crate) fn required_date(row: &[String], col: usize) -> Result<NaiveDate> {
    parse_date(cell(row, col))
}

/// Blank cell is `None`; a non-blank unparseable cell is an error.
pub(crate) fn optional_date(row: &[String], col: usize) -> Result<Option<NaiveDate>> {
    let value = cell(row, col);
    if value.is_empty() || value == "-" {
        return Ok(None);
    }
    parse_date(value).map(Some)
}

pub(crate) fn required_amount(row: &[String], col: usize) -> Result<Decimal> {
    parse_amount(cell(row, col))
}

pub(crate) fn amount_or_zero(row: &[String], col: usize) -> Result<Decimal> {
    parse_amount_or_zero(cell(row, col))
}

/// Rates come either as percent (`8.5`, `8,5 %`) or as a fraction (`0.085`).
pub(crate) fn rate_percent(row: &[String], col: usize) -> Option<Decimal> {
    let rate = parse_amount_or_zero(cell(row, col)).ok()?;
    if rate.is_zero() {
        None
    } else if rate.abs() <= Decimal::ONE {
        Some(rate * Decimal::ONE_HUNDRED)
    } else {
        Some(rate)
    }
}

// =============================================================================
// Adapter contract
// =============================================================================

/// Per-call inputs shared by adapters and the statement extractor.
#[derive(Debug, Clone, Copy)]
pub struct ParseContext<'a> {
    pub config: &'a IngestConfig,
    /// Reference date for "elapsed" checks (expected end in the past, ...)
    pub as_of: NaiveDate,
}

impl<'a> ParseContext<'a> {
    pub fn new(config: &'a IngestConfig, as_of: NaiveDate) -> Self {
        Self { config, as_of }
    }
}

/// Everything one file contributes to the batch.
#[derive(Debug, Clone, Default)]
pub struct AdapterOutput {
    pub investments: Vec<Investment>,
    pub cash_flows: Vec<CashFlow>,
    pub positions: Vec<PortfolioPosition>,
    pub liquidity: Vec<LiquidityBalance>,
    /// Remaining capital as stated by the platform, keyed by investment id
    pub reported_remaining: HashMap<Uuid, Decimal>,
    pub issues: Vec<Issue>,
    pub skipped: usize,
}

impl AdapterOutput {
    /// Skip a row and record why.
    pub fn skip(&mut self, issue: Issue) {
        log::debug!("Skipping row: {} ({:?})", issue.message, issue.reference);
        self.skipped += 1;
        self.issues.push(issue);
    }

    pub fn skip_error(&mut self, err: &IngestError, reference: String) {
        self.skip(Issue::from_error(err, crate::models::Severity::Warning).at(reference));
    }

    pub fn merge(&mut self, other: AdapterOutput) {
        self.investments.extend(other.investments);
        self.cash_flows.extend(other.cash_flows);
        self.positions.extend(other.positions);
        self.liquidity.extend(other.liquidity);
        self.reported_remaining.extend(other.reported_remaining);
        self.issues.extend(other.issues);
        self.skipped += other.skipped;
    }
}

/// A platform-specific spreadsheet parser.
pub trait PlatformAdapter: Send + Sync {
    fn platform(&self) -> Platform;

    /// Parse one workbook. Errors abort only this file.
    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput>;
}

/// All registered spreadsheet adapters.
pub fn get_adapters() -> Vec<Box<dyn PlatformAdapter>> {
    vec![
        Box::new(lpb::LpbAdapter::new()),
        Box::new(bienpreter::BienPreterAdapter::new()),
        Box::new(homunity::HomunityAdapter::new()),
        Box::new(pretup::PretUpAdapter::new()),
        Box::new(assurance_vie::AssuranceVieAdapter::new()),
    ]
}

pub fn adapter_for(platform: Platform) -> Option<Box<dyn PlatformAdapter>> {
    get_adapters().into_iter().find(|a| a.platform() == platform)
}

/// Warn once per file about flows that fell through the rule table.
pub(crate) fn log_low_confidence(flows: &[CashFlow], platform: Platform) {
    let low = flows
        .iter()
        .filter(|f| f.confidence == crate::models::Confidence::Low)
        .count();
    if low > 0 {
        log::warn!("{}: {} flow(s) classified as other with low confidence", platform, low);
    }
}
