//! PEA valuation statements: statement date, position table, cash balance.
//!
//! The position table comes out of the text layer as lines whose columns are
//! separated by runs of spaces:
//!
//! ```text
//! FR0010315770  AMUNDI MSCI WORLD UCITS ETF      10     45,20     452,00    35,2 %
//! ```
//!
//! A designation can wrap, leaving the ISIN and part of the name on one line
//! and the figures on the next.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use super::StatementOutput;
use crate::adapters::ParseContext;
use crate::models::{AssetClass, Issue, LiquidityBalance, Platform, PortfolioPosition};
use crate::normalize::{end_of_month, fold_key, month_from_name, parse_amount, parse_date};

// =============================================================================
// Valuation date
// =============================================================================

static FULL_YMD: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})[-_.](\d{2})[-_.](\d{2})").unwrap());
static FULL_DMY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{2})[-_./](\d{2})[-_./](\d{4})").unwrap());
static COMPACT: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?:^|\D)(\d{6}|\d{8})(?:\D|$)").unwrap());
static MONTH_YEAR: Lazy<Regex> = Lazy::new(|| Regex::new(r"([a-z]+)[ _\-]?(\d{4})").unwrap());
static YEAR_MONTH_NAME: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})[ _\-]([a-z]+)").unwrap());
static YEAR_MONTH: Lazy<Regex> = Lazy::new(|| Regex::new(r"(\d{4})[ _\-](\d{2})(?:\D|$)").unwrap());

const DATE_VALUE: &str = r"(\d{1,2}[/.\-]\d{1,2}[/.\-]\d{2,4}|\d{1,2}(?:er)?\s+\p{L}+\.?\s+\d{4})";

/// Labelled dates in the statement body, most specific label first.
static DATE_LABELS: Lazy<Vec<Regex>> = Lazy::new(|| {
    [
        r"(?i)arr[êe]t[ée]\s+au\s*:?\s*",
        r"(?i)[ée]valuation\s+au\s*:?\s*",
        r"(?i)\bdate\s*:\s*",
        r"(?i)\ble\s+",
    ]
    .iter()
    .map(|label| Regex::new(&format!("{}{}", label, DATE_VALUE)).unwrap())
    .collect()
});

fn month_end(year: i32, month: u32) -> Option<NaiveDate> {
    NaiveDate::from_ymd_opt(year, month, 1).map(end_of_month)
}

/// Valuation date encoded in a file name. Month-precision names resolve to
/// the last day of the month.
pub fn date_from_file_name(file_name: &str) -> Option<NaiveDate> {
    let stem = fold_key(file_name.rsplit_once('.').map(|(s, _)| s).unwrap_or(file_name));

    if let Some(c) = FULL_YMD.captures(&stem) {
        if let Some(d) = NaiveDate::from_ymd_opt(c[1].parse().ok()?, c[2].parse().ok()?, c[3].parse().ok()?) {
            return Some(d);
        }
    }
    if let Some(c) = FULL_DMY.captures(&stem) {
        if let Some(d) = NaiveDate::from_ymd_opt(c[3].parse().ok()?, c[2].parse().ok()?, c[1].parse().ok()?) {
            return Some(d);
        }
    }
    for c in COMPACT.captures_iter(&stem) {
        let digits = &c[1];
        let year: i32 = digits[..4].parse().ok()?;
        let month: u32 = digits[4..6].parse().ok()?;
        let resolved = if digits.len() == 8 {
            NaiveDate::from_ymd_opt(year, month, digits[6..].parse().ok()?)
        } else {
            month_end(year, month)
        };
        if resolved.is_some() {
            return resolved;
        }
    }
    for c in MONTH_YEAR.captures_iter(&stem) {
        if let Some(month) = month_from_name(&c[1]) {
            return month_end(c[2].parse().ok()?, month);
        }
    }
    for c in YEAR_MONTH_NAME.captures_iter(&stem) {
        if let Some(month) = month_from_name(&c[2]) {
            return month_end(c[1].parse().ok()?, month);
        }
    }
    let c = YEAR_MONTH.captures(&stem)?;
    month_end(c[1].parse().ok()?, c[2].parse().ok()?)
}

/// Labelled statement date in the document body (`Arrêté au …`, `Le …`).
pub fn date_from_text(text: &str) -> Option<NaiveDate> {
    DATE_LABELS.iter().find_map(|re| {
        re.captures_iter(text)
            .find_map(|c| parse_date(&c[1]).ok())
    })
}

/// File name first, then the body.
pub fn resolve_valuation_date(file_name: &str, text: &str) -> Option<NaiveDate> {
    date_from_file_name(file_name).or_else(|| date_from_text(text))
}

// =============================================================================
// Positions
// =============================================================================

/// Two letters then ten alphanumerics; the check digit is not verified.
pub(crate) static ISIN: Lazy<Regex> = Lazy::new(|| Regex::new(r"\b[A-Z]{2}[A-Z0-9]{10}\b").unwrap());
static COLUMN_GAP: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s{2,}|\t").unwrap());
static NUMERIC_CELL: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[-+(]?\s*\d[\d \x{a0}\x{202f}.,']*\)?\s*(?:€|EUR|%)?$").unwrap()
});
static LEADING_CODE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\d{3}\s+").unwrap());

/// Upper-case words such as `VALORISATION` have the same shape, so a
/// candidate must carry at least one digit after the country code.
pub(crate) fn is_isin(token: &str) -> bool {
    token.len() == 12 && token[2..].bytes().any(|b| b.is_ascii_digit())
}

pub fn extract_isin(text: &str) -> Option<String> {
    ISIN.find_iter(text).map(|m| m.as_str()).find(|t| is_isin(t)).map(str::to_string)
}

/// Keyword heuristic on the designation; anything unrecognised is equity.
pub fn classify_asset(name: &str) -> AssetClass {
    let upper = fold_key(name).to_uppercase();
    let has = |words: &[&str]| words.iter().any(|w| upper.split(|c: char| !c.is_alphanumeric()).any(|t| t == *w));
    if has(&["ETF", "TRACKER", "INDEX", "UCITS"]) {
        AssetClass::Etf
    } else if has(&["FONDS", "FCP", "SICAV", "OPCVM", "FUND"]) {
        AssetClass::Fund
    } else if has(&["BOND", "OBLIGATION", "OBLIGATIONS", "OAT"]) {
        AssetClass::Bond
    } else {
        AssetClass::Equity
    }
}

#[derive(Debug, Default)]
struct TableRow {
    isin: Option<String>,
    text: String,
    numbers: Vec<Decimal>,
    percent: Option<Decimal>,
}

impl TableRow {
    fn from_line(line: &str) -> Self {
        let cells: Vec<&str> = COLUMN_GAP.split(line.trim()).map(str::trim).filter(|c| !c.is_empty()).collect();
        // figures are the numeric cells after the last text cell
        let last_text = cells.iter().rposition(|c| !NUMERIC_CELL.is_match(c));
        let (text_cells, figure_cells) = match last_text {
            Some(idx) => cells.split_at(idx + 1),
            None => cells.split_at(0),
        };

        let mut row = TableRow { isin: extract_isin(line), ..Default::default() };
        for cell in figure_cells {
            let Ok(value) = parse_amount(cell) else { continue };
            if cell.ends_with('%') {
                row.percent = Some(value);
            } else {
                row.numbers.push(value);
            }
        }
        let text = text_cells
            .iter()
            .filter(|c| !NUMERIC_CELL.is_match(c))
            .copied()
            .collect::<Vec<_>>()
            .join(" ");
        let text = match &row.isin {
            Some(isin) => text.replace(isin.as_str(), " "),
            None => text,
        };
        row.text = LEADING_CODE.replace(text.trim(), "").split_whitespace().collect::<Vec<_>>().join(" ");
        row
    }

    fn has_figures(&self) -> bool {
        self.numbers.len() >= 3
    }
}

struct Pending {
    isin: String,
    name: String,
}

fn build_position(
    isin: String,
    name: String,
    row: &TableRow,
    valuation_date: NaiveDate,
) -> Option<PortfolioPosition> {
    let mut numbers = row.numbers.clone();
    let mut share = row.percent;
    if share.is_none() && numbers.len() >= 4 {
        share = numbers.pop();
    }
    let quantity = *numbers.first()?;
    let market_value = *numbers.last()?;
    let current_price = *numbers.get(numbers.len().checked_sub(2)?)?;
    if quantity <= Decimal::ZERO && market_value <= Decimal::ZERO {
        return None;
    }
    let asset_name = if name.is_empty() { format!("Asset {}", isin) } else { name };
    Some(PortfolioPosition {
        platform: Platform::Pea,
        asset_class: classify_asset(&asset_name),
        isin,
        asset_name,
        quantity,
        current_price,
        market_value,
        portfolio_share: share.filter(|s| *s <= Decimal::ONE_HUNDRED),
        valuation_date,
    })
}

/// Position rows of a valuation statement. Only rows carrying an ISIN (on
/// the line itself or on the buffered line above) become positions.
pub fn parse_positions(text: &str, valuation_date: NaiveDate, out: &mut StatementOutput) {
    let mut pending: Option<Pending> = None;
    let emit = |isin: String, name: String, row: &TableRow, out: &mut StatementOutput| {
        match build_position(isin.clone(), name, row, valuation_date) {
            Some(position) => out.positions.push(position),
            None => out.skip(Issue::info("empty_position", format!("{} has no quantity or value", isin))),
        }
    };

    for line in text.lines() {
        let row = TableRow::from_line(line);
        match (row.isin.clone(), row.has_figures()) {
            (Some(isin), true) => {
                if let Some(p) = pending.take() {
                    out.skip(Issue::info("position_incomplete", format!("{} has no figures", p.isin)));
                }
                let name = row.text.clone();
                emit(isin, name, &row, out);
            }
            (Some(isin), false) => {
                if let Some(p) = pending.replace(Pending { isin, name: row.text.clone() }) {
                    out.skip(Issue::info("position_incomplete", format!("{} has no figures", p.isin)));
                }
            }
            (None, true) => {
                // continuation of a wrapped designation; otherwise a subtotal
                if let Some(p) = pending.take() {
                    let name = format!("{} {}", p.name, row.text).trim().to_string();
                    emit(p.isin, name, &row, out);
                }
            }
            (None, false) => {}
        }
    }
    if let Some(p) = pending {
        out.skip(Issue::info("position_incomplete", format!("{} has no figures", p.isin)));
    }
}

// =============================================================================
// Liquidity
// =============================================================================

/// Cash balance following the first configured marker found in the text.
pub fn find_liquidity(text: &str, markers: &[String]) -> Option<Decimal> {
    let lines: Vec<String> = text.lines().map(fold_key).collect();
    for marker in markers {
        let marker = fold_key(marker);
        for (idx, line) in lines.iter().enumerate() {
            let Some(pos) = line.find(&marker) else { continue };
            let tail = &line[pos + marker.len()..];
            // the figure may sit alone on the next line
            let amount = parse_amount(tail)
                .ok()
                .or_else(|| lines.get(idx + 1).and_then(|next| parse_amount(next).ok()));
            if let Some(amount) = amount {
                return Some(amount);
            }
        }
    }
    None
}

/// Positions and cash balance of a valuation statement dated `valuation_date`.
pub fn parse_valuation(text: &str, valuation_date: NaiveDate, ctx: &ParseContext) -> StatementOutput {
    let mut out = StatementOutput::default();
    parse_positions(text, valuation_date, &mut out);

    match find_liquidity(text, &ctx.config.statement.liquidity_markers) {
        Some(amount) => out.liquidity.push(LiquidityBalance {
            platform: Platform::Pea,
            balance_date: valuation_date,
            amount,
        }),
        None => out.issues.push(Issue::info("no_liquidity", "no cash balance marker found")),
    }
    if out.positions.is_empty() {
        out.issues.push(Issue::warning("no_positions", "no position row with an ISIN"));
    }

    log::info!(
        "PEA valuation {}: {} positions, liquidity {:?}",
        valuation_date,
        out.positions.len(),
        out.liquidity.first().map(|l| l.amount)
    );
    out
}
