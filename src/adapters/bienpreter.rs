//! BienPrêter workbook.
//!
//! `Projets`: 0 contract number, 1 project, 2 company, 3 amount, 4 rate,
//! 5 duration (months), 6 funding date, 7 end date, 10 status or monthly
//! payment (exports differ on this column).
//!
//! `Relevé compte`: 0 operation, 1 contract number, 2 project, 3 date,
//! 4 net amount, 5 capital repaid, 7 gross interest, 8 withheld tax.
//! Repayment rows carry their own capital/interest split, so no estimate is
//! needed; flows link to projects by contract number.

use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;

use super::{
    amount_or_zero, cell, is_header_or_blank, optional_date, rate_percent, required_amount,
    required_date, AdapterOutput, ParseContext, PlatformAdapter, RawTables, Sheet,
};
use crate::errors::Result;
use crate::models::{
    Allocation, CashFlow, FlowType, Investment, InvestmentStatus, InvestmentType, Issue, LinkKey,
    Platform,
};
use crate::normalize::{fold_key, parse_amount};
use crate::rules::Classification;

pub struct BienPreterAdapter;

impl BienPreterAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse_projects(&self, sheet: &Sheet, out: &mut AdapterOutput) {
        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 1), &["projet", "nom du projet"]) {
                continue;
            }
            let reference = sheet.reference(idx);

            let funded = match required_date(row, 6) {
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

            let contract = cell(row, 0);
            let mut inv = Investment::new(
                Platform::BienPreter,
                Some(contract.to_string()),
                cell(row, 1),
                cell(row, 2),
                invested,
                funded,
            );
            inv.investment_type = InvestmentType::Crowdlending;
            inv.annual_rate = rate_percent(row, 4);
            inv.set_duration(parse_amount(cell(row, 5)).ok().and_then(|d| d.trunc().to_u32()));
            match optional_date(row, 7) {
                Ok(end) => inv.expected_end_date = end,
                Err(e) => out.issues.push(Issue::warning(e.code(), e.to_string()).at(reference.clone())),
            }

            // column 10 is either a monthly payment or a status label
            let last = cell(row, 10);
            match parse_amount(last) {
                Ok(payment) if !last.chars().any(char::is_alphabetic) => {
                    inv.monthly_payment = Some(payment.abs())
                }
                _ => {
                    if let Some(status) = map_status(last) {
                        inv.transition(status);
                    }
                }
            }

            out.investments.push(inv);
        }
    }

    fn parse_account(&self, sheet: &Sheet, ctx: &ParseContext, out: &mut AdapterOutput) {
        let rules = ctx.config.rules_for(Platform::BienPreter);

        for (idx, row) in sheet.data_rows() {
            let operation = cell(row, 0);
            if is_header_or_blank(operation, &["operation"]) {
                continue;
            }
            let reference = sheet.reference(idx);

            let date = match required_date(row, 3) {
                Ok(d) => d,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let net = match required_amount(row, 4) {
                Ok(a) => a,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };

            let (flow_type, direction, confidence) = match rules.classify(operation, net) {
                Classification::Ignored => {
                    out.skip(Issue::info("ignored", operation.to_string()).at(reference));
                    continue;
                }
                Classification::Flow { flow_type, direction, confidence } => (flow_type, direction, confidence),
            };

            let project = cell(row, 2);
            let description = if project.is_empty() {
                operation.to_string()
            } else {
                format!("{} - {}", operation, project)
            };
            let contract = cell(row, 1);
            let link = if contract.is_empty() {
                LinkKey::None
            } else {
                LinkKey::Contract { number: contract.to_string() }
            };

            let mut flow = if flow_type == FlowType::Repayment {
                match repayment_flow(row, date, net, &description) {
                    Ok(flow) => flow,
                    Err(e) => {
                        out.skip_error(&e, reference);
                        continue;
                    }
                }
            } else {
                CashFlow::new(Platform::BienPreter, flow_type, direction, net, date, &description)
            };
            flow = flow.with_link(link);
            flow.confidence = confidence;

            if !flow.tax_consistent() {
                out.issues.push(
                    Issue::warning(
                        "tax_inconsistent",
                        format!(
                            "net {} differs from gross {} minus tax {}",
                            flow.net_amount, flow.gross_amount, flow.tax_amount
                        ),
                    )
                    .at(reference),
                );
            }
            out.cash_flows.push(flow);
        }
    }
}

impl Default for BienPreterAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Repayment with the statement's own split. Net stays as reported so a
/// mismatch with gross minus tax can be flagged.
fn repayment_flow(
    row: &[String],
    date: chrono::NaiveDate,
    net: Decimal,
    description: &str,
) -> Result<CashFlow> {
    let capital = amount_or_zero(row, 5)?.abs();
    let interest = amount_or_zero(row, 7)?.abs();
    let tax = amount_or_zero(row, 8)?.abs();
    let net = net.abs();

    if capital.is_zero() && interest.is_zero() {
        // no split on this row; the reconciler estimates it
        let mut flow = CashFlow::new(
            Platform::BienPreter,
            FlowType::Repayment,
            crate::models::FlowDirection::In,
            net + tax,
            date,
            description,
        )
        .with_tax(tax);
        flow.net_amount = net;
        return Ok(flow);
    }

    let mut flow = CashFlow::new(
        Platform::BienPreter,
        FlowType::Repayment,
        crate::models::FlowDirection::In,
        capital + interest,
        date,
        description,
    )
    .with_tax(tax)
    .with_split(capital, interest, Allocation::Schedule);
    flow.net_amount = net;
    Ok(flow)
}

fn map_status(raw: &str) -> Option<InvestmentStatus> {
    let s = fold_key(raw);
    if s.is_empty() || s.contains("en cours") || s.contains("en attente") {
        None
    } else if s.contains("termin") || s.contains("rembours") {
        Some(InvestmentStatus::Completed)
    } else if s.contains("retard") {
        Some(InvestmentStatus::Delayed)
    } else if s.contains("procedure") || s.contains("recouvrement") {
        Some(InvestmentStatus::InProcedure)
    } else if s.contains("defaut") || s.contains("perdu") {
        Some(InvestmentStatus::Defaulted)
    } else {
        None
    }
}

impl PlatformAdapter for BienPreterAdapter {
    fn platform(&self) -> Platform {
        Platform::BienPreter
    }

    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput> {
        let projects = tables.require_sheet("Projets")?;
        let account = tables.require_sheet("Relevé compte")?;

        let mut out = AdapterOutput::default();
        self.parse_projects(projects, &mut out);
        self.parse_account(account, ctx, &mut out);

        super::log_low_confidence(&out.cash_flows, Platform::BienPreter);
        log::info!(
            "BienPrêter: {} investments, {} cash flows, {} skipped",
            out.investments.len(),
            out.cash_flows.len(),
            out.skipped
        );
        Ok(out)
    }
}
