//! La Première Brique workbook.
//!
//! `Projets`: 0 collect date, 1 project name, 2 status, 3 invested, 4 rate,
//! 5 signature date, 7 latest repayment date, 8 effective repayment date,
//! 9 remaining capital.
//!
//! `Relevé compte`: 0 nature, 1 payment method, 3 amount, 4 status, 5 date.
//! Social-charge and income-tax rows (CSG, CRDS, IR) are booked just before
//! the monthly repayment they apply to and are folded into its tax amount.
//! LPB names the issuer after the project, so links use the project name twice.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::{
    amount_or_zero, cell, is_header_or_blank, optional_date, rate_percent, required_amount,
    required_date, AdapterOutput, ParseContext, PlatformAdapter, RawTables, Sheet,
};
use crate::errors::Result;
use crate::models::{
    CashFlow, FlowType, Investment, InvestmentStatus, Issue, LinkKey, Platform,
};
use crate::normalize::{fold_key, months_between};
use crate::rules::Classification;

/// Tax rows folded into one repayment at most.
const MAX_TAX_ROWS: usize = 2;

pub struct LpbAdapter;

impl LpbAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse_projects(&self, sheet: &Sheet, ctx: &ParseContext, out: &mut AdapterOutput) {
        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 1), &["nom du projet", "projet"]) {
                continue;
            }
            let reference = sheet.reference(idx);
            let name = cell(row, 1);

            let investment_date = match required_date(row, 0) {
                Ok(d) => d,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let invested = match required_amount(row, 3) {
                Ok(a) => a.abs(),
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };

            let mut inv = Investment::new(Platform::Lpb, None, name, name, invested, investment_date);
            inv.annual_rate = rate_percent(row, 4);

            let mut optional = |col: usize| match optional_date(row, col) {
                Ok(value) => value,
                Err(e) => {
                    out.issues.push(Issue::warning(e.code(), e.to_string()).at(reference.clone()));
                    None
                }
            };
            inv.signature_date = optional(5);
            inv.expected_end_date = optional(7);
            inv.actual_end_date = optional(8);

            inv.set_duration(
                inv.expected_end_date
                    .map(|end| months_between(investment_date, end).max(0) as u32),
            );

            let status = fold_key(cell(row, 2));
            let delayed = is_delayed(inv.expected_end_date, inv.actual_end_date, ctx.as_of);
            if status.contains("rembours") {
                inv.transition(InvestmentStatus::Completed);
                inv.is_delayed = delayed;
            } else if delayed {
                inv.transition(InvestmentStatus::Delayed);
            }

            if let Ok(remaining) = amount_or_zero(row, 9) {
                if !cell(row, 9).is_empty() {
                    out.reported_remaining.insert(inv.id, remaining.abs());
                }
            }

            out.investments.push(inv);
        }
    }

    fn parse_account(&self, sheet: &Sheet, ctx: &ParseContext, out: &mut AdapterOutput) {
        let rules = ctx.config.rules_for(Platform::Lpb);
        let mut pending_taxes: Vec<CashFlow> = Vec::new();

        for (idx, row) in sheet.data_rows() {
            let nature = cell(row, 0);
            if is_header_or_blank(nature, &["nature de la transaction", "nature"]) {
                continue;
            }
            let reference = sheet.reference(idx);

            let status = fold_key(cell(row, 4));
            if !status.is_empty() && !status.contains("reussi") {
                out.skip(Issue::info("failed_transaction", format!("{} ({})", nature, cell(row, 4))).at(reference));
                continue;
            }

            let date = match required_date(row, 5) {
                Ok(d) => d,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let amount = match required_amount(row, 3) {
                Ok(a) => a,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };

            let (flow_type, direction, confidence) = match rules.classify(nature, amount) {
                Classification::Ignored => {
                    out.skip(Issue::info("ignored", nature.to_string()).at(reference));
                    continue;
                }
                Classification::Flow { flow_type, direction, confidence } => (flow_type, direction, confidence),
            };

            let mut flow = CashFlow::new(Platform::Lpb, flow_type, direction, amount, date, nature)
                .with_link(project_link(nature));
            flow.confidence = confidence;

            match flow_type {
                FlowType::Tax => {
                    pending_taxes.push(flow);
                    continue;
                }
                FlowType::Repayment => {
                    let keep_from = pending_taxes.len().saturating_sub(MAX_TAX_ROWS);
                    let attached = pending_taxes.split_off(keep_from);
                    out.cash_flows.append(&mut pending_taxes);
                    let tax: Decimal = attached.iter().map(|t| t.gross_amount).sum();
                    if !tax.is_zero() {
                        flow = flow.with_tax(tax);
                    }
                }
                _ => out.cash_flows.append(&mut pending_taxes),
            }
            out.cash_flows.push(flow);
        }

        // tax rows with no repayment after them stay standalone
        out.cash_flows.append(&mut pending_taxes);
    }
}

impl Default for LpbAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// A project is late when it was repaid after its latest date, or when that
/// date has passed without repayment.
fn is_delayed(expected: Option<NaiveDate>, actual: Option<NaiveDate>, as_of: NaiveDate) -> bool {
    match (expected, actual) {
        (Some(exp), Some(act)) => act > exp,
        (Some(exp), None) => as_of > exp,
        _ => false,
    }
}

/// `Remboursement mensualité - Résidence Les Pins` links to `Résidence Les Pins`.
fn project_link(nature: &str) -> LinkKey {
    match nature.split_once(" - ").map(|(_, project)| project.trim()) {
        Some(project) if !project.is_empty() => LinkKey::name(project, project),
        _ => LinkKey::None,
    }
}

impl PlatformAdapter for LpbAdapter {
    fn platform(&self) -> Platform {
        Platform::Lpb
    }

    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput> {
        let projects = tables.require_sheet("Projets")?;
        let account = tables.require_sheet("Relevé compte")?;

        let mut out = AdapterOutput::default();
        self.parse_projects(projects, ctx, &mut out);
        self.parse_account(account, ctx, &mut out);

        super::log_low_confidence(&out.cash_flows, Platform::Lpb);
        log::info!(
            "LPB: {} investments, {} cash flows, {} skipped",
            out.investments.len(),
            out.cash_flows.len(),
            out.skipped
        );
        Ok(out)
    }
}
