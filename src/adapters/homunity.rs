//! Homunity workbook.
//!
//! `Projets`: 0 subscription date, 1 promoter, 2 project, 3 amount, 4 end
//! date, 5 rate, 6 status.
//!
//! `Relevé compte`: 0 movement type, 1 date, 2 status, 3 signed amount,
//! 4 message. Newer exports add `Promoteur`, `Projet`, `Intérêt net` and
//! `Impôts` columns, located by header. Without them the promoter and
//! project are read from the message tail (`... - <promoter> - <project>`).
//! A project often pays several repayment lines on the same day; those are
//! merged into one flow.

use rust_decimal::Decimal;
use std::collections::HashMap;

use super::{
    amount_or_zero, cell, is_header_or_blank, optional_date, rate_percent, required_amount,
    required_date, AdapterOutput, ParseContext, PlatformAdapter, RawTables, Sheet,
};
use crate::errors::Result;
use crate::models::{
    Allocation, CashFlow, FlowType, Investment, InvestmentStatus, Issue, LinkKey, Platform,
};
use crate::normalize::{fold_key, months_between};
use crate::rules::Classification;

const ACCOUNT_HEADER: [&str; 2] = ["type de mouvement", "type"];

#[derive(Default)]
struct AccountColumns {
    promoter: Option<usize>,
    project: Option<usize>,
    net_interest: Option<usize>,
    tax: Option<usize>,
}

impl AccountColumns {
    /// Optional columns, looked up in the header row only.
    fn locate(sheet: &Sheet) -> Self {
        let Some(header) = sheet.header_row(&ACCOUNT_HEADER) else {
            return Self::default();
        };
        Self {
            promoter: sheet.find_column(header, &["promoteur"]),
            project: sheet.find_column(header, &["projet"]),
            net_interest: sheet.find_column(header, &["interet net", "interets nets"]),
            tax: sheet.find_column(header, &["impot"]),
        }
    }
}

pub struct HomunityAdapter;

impl HomunityAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse_projects(&self, sheet: &Sheet, out: &mut AdapterOutput) {
        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 0), &["date de souscription"]) || cell(row, 2).is_empty() {
                continue;
            }
            let reference = sheet.reference(idx);

            let subscribed = match required_date(row, 0) {
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

            let mut inv = Investment::new(
                Platform::Homunity,
                None,
                cell(row, 2),
                cell(row, 1),
                invested,
                subscribed,
            );
            inv.signature_date = Some(subscribed);
            inv.annual_rate = rate_percent(row, 5);
            match optional_date(row, 4) {
                Ok(end) => inv.expected_end_date = end,
                Err(e) => out.issues.push(Issue::warning(e.code(), e.to_string()).at(reference)),
            }
            inv.set_duration(
                inv.expected_end_date
                    .map(|end| months_between(subscribed, end).max(0) as u32),
            );
            if let Some(status) = map_status(cell(row, 6)) {
                inv.transition(status);
            }

            out.investments.push(inv);
        }
    }

    fn parse_account(&self, sheet: &Sheet, ctx: &ParseContext, out: &mut AdapterOutput) {
        let rules = ctx.config.rules_for(Platform::Homunity);
        let columns = AccountColumns::locate(sheet);
        // (link, date) -> index of the merged repayment in out.cash_flows
        let mut repayments: HashMap<(LinkKey, chrono::NaiveDate), usize> = HashMap::new();

        for (idx, row) in sheet.data_rows() {
            let movement = cell(row, 0);
            if is_header_or_blank(movement, &ACCOUNT_HEADER) {
                continue;
            }
            let reference = sheet.reference(idx);

            let status = fold_key(cell(row, 2));
            if !status.is_empty() && !status.contains("succes") {
                out.skip(Issue::info("failed_transaction", format!("{} ({})", movement, cell(row, 2))).at(reference));
                continue;
            }

            let date = match required_date(row, 1) {
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

            let message = cell(row, 4);
            let text = format!("{} {}", movement, message);
            let (flow_type, direction, confidence) = match rules.classify(&text, amount) {
                Classification::Ignored => {
                    out.skip(Issue::info("ignored", text).at(reference));
                    continue;
                }
                Classification::Flow { flow_type, direction, confidence } => (flow_type, direction, confidence),
            };

            let link = link_for(row, &columns, message);
            let description = if message.is_empty() { movement } else { message };
            let mut flow = CashFlow::new(Platform::Homunity, flow_type, direction, amount, date, description)
                .with_link(link.clone());
            flow.confidence = confidence;

            if flow_type != FlowType::Repayment {
                out.cash_flows.push(flow);
                continue;
            }

            // credited amount is capital plus net interest
            let tax = match columns.tax.map(|c| amount_or_zero(row, c)).transpose() {
                Ok(t) => t.unwrap_or(Decimal::ZERO).abs(),
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let net_interest = match columns.net_interest.map(|c| amount_or_zero(row, c)).transpose() {
                Ok(n) => n.map(|n| n.abs()),
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let credited = amount.abs();
            flow.gross_amount = credited + tax;
            flow.tax_amount = tax;
            flow.net_amount = credited;
            if let Some(net_interest) = net_interest {
                let capital = (credited - net_interest).max(Decimal::ZERO);
                flow = flow.with_split(capital, net_interest + tax, Allocation::Schedule);
            }

            let key = (link, date);
            if !key.0.is_none() {
                if let Some(&pos) = repayments.get(&key) {
                    merge_repayment(&mut out.cash_flows[pos], &flow);
                    continue;
                }
                repayments.insert(key, out.cash_flows.len());
            }
            out.cash_flows.push(flow);
        }
    }
}

impl Default for HomunityAdapter {
    fn default() -> Self {
        Self::new()
    }
}

fn merge_repayment(into: &mut CashFlow, other: &CashFlow) {
    into.gross_amount += other.gross_amount;
    into.net_amount += other.net_amount;
    into.tax_amount += other.tax_amount;
    into.capital_amount += other.capital_amount;
    into.interest_amount += other.interest_amount;
    if into.allocation != other.allocation {
        // a partial split cannot be trusted for the merged amount
        into.allocation = Allocation::NotApplicable;
        into.capital_amount = Decimal::ZERO;
        into.interest_amount = Decimal::ZERO;
    }
}

fn link_for(row: &[String], columns: &AccountColumns, message: &str) -> LinkKey {
    if let (Some(p), Some(j)) = (columns.promoter, columns.project) {
        let (promoter, project) = (cell(row, p), cell(row, j));
        if !promoter.is_empty() && !project.is_empty() {
            return LinkKey::promoter_project(promoter, project);
        }
    }
    let parts: Vec<&str> = message.split(" - ").map(str::trim).collect();
    if parts.len() >= 3 {
        let n = parts.len();
        if !parts[n - 2].is_empty() && !parts[n - 1].is_empty() {
            return LinkKey::promoter_project(parts[n - 2], parts[n - 1]);
        }
    }
    LinkKey::None
}

fn map_status(raw: &str) -> Option<InvestmentStatus> {
    let s = fold_key(raw);
    if s.contains("rembours") || s.contains("termin") {
        Some(InvestmentStatus::Completed)
    } else if s.contains("retard") || s.contains("prolong") {
        Some(InvestmentStatus::Delayed)
    } else if s.contains("procedure") {
        Some(InvestmentStatus::InProcedure)
    } else if s.contains("defaut") {
        Some(InvestmentStatus::Defaulted)
    } else {
        None
    }
}

impl PlatformAdapter for HomunityAdapter {
    fn platform(&self) -> Platform {
        Platform::Homunity
    }

    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput> {
        let projects = tables.require_sheet("Projets")?;
        let account = tables.require_sheet("Relevé compte")?;

        let mut out = AdapterOutput::default();
        self.parse_projects(projects, &mut out);
        self.parse_account(account, ctx, &mut out);

        super::log_low_confidence(&out.cash_flows, Platform::Homunity);
        log::info!(
            "Homunity: {} investments, {} cash flows, {} skipped",
            out.investments.len(),
            out.cash_flows.len(),
            out.skipped
        );
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::IngestConfig;
    use crate::models::FlowDirection;
    use rust_decimal_macros::dec;

    fn projects() -> Sheet {
        sheet(
            "Projets",
            &[
                &["Date de souscription", "Promoteur", "Projet", "Montant", "Fin", "Taux", "Statut"],
                &["01/06/2022", "Kaufman", "Villa Azur", "5 000 €", "01/06/2024", "10%", "En cours"],
                &["01/07/2022", "Nexity", "Quai Ouest", "2000", "01/01/2024", "9", "Remboursé"],
            ],
        )
    }

    fn parse(account: Sheet) -> AdapterOutput {
        let config = IngestConfig::default();
        let tables = RawTables::new("Portefeuille Homunity.xlsx", vec![projects(), account]);
        HomunityAdapter::new().parse(&tables, &ParseContext::new(&config, date(2024, 1, 1))).unwrap()
    }

    #[test]
    fn test_projects() {
        let out = parse(sheet("Relevé compte", &[]));
        assert_eq!(out.investments.len(), 2);
        assert_eq!(out.investments[0].company_name, "Kaufman");
        assert_eq!(out.investments[0].duration_months, Some(24));
        assert_eq!(out.investments[0].annual_rate, Some(dec!(10)));
        assert_eq!(out.investments[1].status, InvestmentStatus::Completed);
    }

    #[test]
    fn test_repayments_aggregate_per_promoter_project_and_day() {
        let out = parse(sheet(
            "Relevé compte",
            &[
                &["Type de mouvement", "Date", "Statut", "Montant", "Message", "Promoteur", "Projet", "Intérêt net", "Impôts"],
                &["Approvisionnement", "01/05/2022", "Succès", "+5 000,00", "Virement", "", "", "", ""],
                &["Transfert", "01/06/2022", "Succès", "-5 000,00", "Investissement Villa Azur", "Kaufman", "Villa Azur", "", ""],
                &["Transfert", "01/12/2022", "Succès", "+100,00", "Remboursement", "Kaufman", "Villa Azur", "70", "30"],
                &["Transfert", "01/12/2022", "Succès", "+1 000,00", "Remboursement", "Kaufman", "Villa Azur", "0", "0"],
                &["Transfert", "02/12/2022", "Échec", "+10,00", "Remboursement", "Kaufman", "Villa Azur", "", ""],
            ],
        ));

        assert_eq!(out.cash_flows.len(), 3);
        assert_eq!(out.cash_flows[0].flow_type, FlowType::Deposit);
        assert_eq!(out.cash_flows[0].flow_direction, FlowDirection::Out);
        assert_eq!(out.cash_flows[1].flow_type, FlowType::Investment);

        let repayment = &out.cash_flows[2];
        assert_eq!(repayment.flow_type, FlowType::Repayment);
        assert_eq!(repayment.net_amount, dec!(1100.00));
        assert_eq!(repayment.tax_amount, dec!(30));
        assert_eq!(repayment.gross_amount, dec!(1130.00));
        assert_eq!(repayment.capital_amount, dec!(1030.00));
        assert_eq!(repayment.interest_amount, dec!(100));
        assert_eq!(repayment.allocation, Allocation::Schedule);
        assert_eq!(repayment.link, LinkKey::promoter_project("Kaufman", "Villa Azur"));
        assert_eq!(out.skipped, 1);
    }

    #[test]
    fn test_link_from_message_tail() {
        let out = parse(sheet(
            "Relevé compte",
            &[&["Transfert", "01/12/2022", "Succès", "+50,00", "Remboursement - Kaufman - Villa Azur"]],
        ));
        let flow = &out.cash_flows[0];
        assert_eq!(flow.link, LinkKey::promoter_project("kaufman", "villa azur"));
        assert_eq!(flow.allocation, Allocation::NotApplicable);
    }
    #[test]
    fn test_message_mentioning_projet_is_not_a_column() {
        let out = parse(sheet(
            "Relevé compte",
            &[
                &["Type de mouvement", "Date", "Statut", "Montant", "Message", "Promoteur"],
                &["Transfert", "01/12/2022", "Succès", "+50,00", "Remboursement projet - Kaufman - Villa Azur", "Kaufman"],
                &["Transfert", "01/12/2022", "Succès", "+20,00", "Remboursement - Nexity - Quai Ouest", "Nexity"],
            ],
        ));
        assert_eq!(out.cash_flows.len(), 2);
        assert_eq!(out.cash_flows[0].link, LinkKey::promoter_project("kaufman", "villa azur"));
        assert_eq!(out.cash_flows[1].link, LinkKey::promoter_project("nexity", "quai ouest"));
    }
}
