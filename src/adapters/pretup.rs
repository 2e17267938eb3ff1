//! PretUp workbook.
//!
//! The offer sheets are the ground truth for investments; the sheet a project
//! appears on gives its status:
//!
//! | sheet                  | status        |
//! |------------------------|---------------|
//! | `Projet Sains - Offres`| active        |
//! | `Procédures - Offres`  | in procedure  |
//! | `Perdu - Offres`       | defaulted     |
//!
//! Offer rows: 0 project, 1 company, 2 offer id, 3 offered amount, 4 remaining
//! capital. The `... - Echéances` sheets are only read for extension markers.
//!
//! `Relevé compte`: 0 date (`dd/mm/yyyy à hh:mm`), 1 type, 3 description,
//! 4 debit, 5 credit, 6 status, 7 installment, 9 capital, 11 CSG/CRDS,
//! 12 flat-rate levy, 13 net interest. Account descriptions name the project,
//! so flows link by mention.

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::Regex;
use rust_decimal::Decimal;

use super::{
    amount_or_zero, cell, is_header_or_blank, required_amount, required_date, AdapterOutput,
    ParseContext, PlatformAdapter, RawTables, Sheet,
};
use crate::errors::{IngestError, Result};
use crate::models::{
    Allocation, CashFlow, FlowDirection, FlowType, Investment, InvestmentStatus, InvestmentType,
    Issue, LinkKey, LiquidityBalance, Platform,
};
use crate::normalize::fold_key;
use crate::rules::Classification;

const OFFER_SHEETS: [(&str, InvestmentStatus); 3] = [
    ("Projet Sains - Offres", InvestmentStatus::Active),
    ("Procédures - Offres", InvestmentStatus::InProcedure),
    ("Perdu - Offres", InvestmentStatus::Defaulted),
];

const EXTENSION_MARKERS: [&str; 3] = ["prolongation", "extension", "report"];

static BALANCE_ROW: Lazy<Regex> = Lazy::new(|| Regex::new(r"solde.*compte").unwrap());

struct Offer {
    project: String,
    company: String,
    id: String,
    amount: Decimal,
    remaining: Option<Decimal>,
    status: InvestmentStatus,
}

pub struct PretUpAdapter;

impl PretUpAdapter {
    pub fn new() -> Self {
        Self
    }

    fn parse_offers(&self, sheet: &Sheet, status: InvestmentStatus, out: &mut AdapterOutput) -> Vec<Offer> {
        let mut offers = Vec::new();
        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 0), &["nom du projet", "projet", "totaux :", "totaux"]) {
                continue;
            }
            let amount = match required_amount(row, 3) {
                Ok(a) => a.abs(),
                Err(e) => {
                    out.skip_error(&e, sheet.reference(idx));
                    continue;
                }
            };
            offers.push(Offer {
                project: cell(row, 0).to_string(),
                company: cell(row, 1).to_string(),
                id: cell(row, 2).to_string(),
                amount,
                remaining: amount_or_zero(row, 4).ok().filter(|_| !cell(row, 4).is_empty()),
                status,
            });
        }
        offers
    }

    /// Folded names of projects with an extension row in a schedule sheet.
    fn extended_projects(&self, tables: &RawTables) -> Vec<String> {
        let mut extended = Vec::new();
        for sheet in tables.sheets.iter().filter(|s| fold_key(&s.name).contains("echeance")) {
            for (_, row) in sheet.data_rows() {
                let text = fold_key(&row.join(" "));
                if EXTENSION_MARKERS.iter().any(|m| text.contains(m)) {
                    let project = fold_key(cell(row, 0));
                    if !project.is_empty() && !extended.contains(&project) {
                        extended.push(project);
                    }
                }
            }
        }
        extended
    }

    fn parse_account(&self, sheet: &Sheet, ctx: &ParseContext, out: &mut AdapterOutput) {
        let rules = ctx.config.rules_for(Platform::PretUp);

        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 0), &["date"]) {
                continue;
            }
            let reference = sheet.reference(idx);
            let kind = cell(row, 1);
            let description = cell(row, 3);

            if fold_key(cell(row, 6)).contains("non abouti") {
                out.skip(Issue::info("failed_transaction", format!("{} {}", kind, description)).at(reference));
                continue;
            }

            let date = match required_date(row, 0) {
                Ok(d) => d,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };

            let text = format!("{} {}", kind, description);
            if BALANCE_ROW.is_match(&fold_key(&text)) {
                match balance_amount(row) {
                    Ok(amount) => out.liquidity.push(LiquidityBalance {
                        platform: Platform::PretUp,
                        balance_date: date,
                        amount,
                    }),
                    Err(e) => out.skip_error(&e, reference),
                }
                continue;
            }

            let debit = amount_or_zero(row, 4);
            let credit = amount_or_zero(row, 5);
            let (debit, credit) = match (debit, credit) {
                (Ok(d), Ok(c)) => (d.abs(), c.abs()),
                (Err(e), _) | (_, Err(e)) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let signed = credit - debit;

            let (flow_type, direction, confidence) = match rules.classify(kind, signed) {
                Classification::Ignored => {
                    out.skip(Issue::info("ignored", text).at(reference));
                    continue;
                }
                Classification::Flow { flow_type, direction, confidence } => (flow_type, direction, confidence),
            };

            let flow = match flow_type {
                FlowType::Repayment if fold_key(kind).contains("anticipe") => {
                    CashFlow::new(Platform::PretUp, flow_type, FlowDirection::In, credit, date, description)
                        .with_split(credit, Decimal::ZERO, Allocation::Schedule)
                }
                FlowType::Repayment => match installment_flow(row, credit, date, description) {
                    Ok(flow) => flow,
                    Err(e) => {
                        out.skip_error(&e, reference);
                        continue;
                    }
                },
                _ => {
                    let amount = match direction {
                        FlowDirection::In => credit.max(signed.abs()),
                        FlowDirection::Out => debit.max(signed.abs()),
                    };
                    CashFlow::new(Platform::PretUp, flow_type, direction, amount, date, description)
                }
            };

            let mut flow = flow.with_link(if description.is_empty() {
                LinkKey::None
            } else {
                LinkKey::Mention { text: fold_key(description) }
            });
            flow.confidence = confidence;
            out.cash_flows.push(flow);
        }
    }
}

impl Default for PretUpAdapter {
    fn default() -> Self {
        Self::new()
    }
}

/// Scheduled installment: gross from the installment column (credit as a
/// fallback), capital from its own column, taxes are CSG/CRDS plus the levy.
fn installment_flow(row: &[String], credit: Decimal, date: NaiveDate, description: &str) -> Result<CashFlow> {
    let installment = amount_or_zero(row, 7)?.abs();
    let gross = if installment.is_zero() { credit } else { installment };
    let tax = amount_or_zero(row, 11)?.abs() + amount_or_zero(row, 12)?.abs();

    let flow = CashFlow::new(Platform::PretUp, FlowType::Repayment, FlowDirection::In, gross, date, description)
        .with_tax(tax);
    if cell(row, 9).is_empty() {
        return Ok(flow);
    }
    let capital = amount_or_zero(row, 9)?.abs().min(gross);
    Ok(flow.with_split(capital, gross - capital, Allocation::Schedule))
}

fn balance_amount(row: &[String]) -> Result<Decimal> {
    [5, 7, 4]
        .iter()
        .find(|c| !cell(row, **c).is_empty())
        .map(|c| required_amount(row, *c))
        .unwrap_or_else(|| Err(IngestError::AmountParse(row.join(" "))))
}

impl PlatformAdapter for PretUpAdapter {
    fn platform(&self) -> Platform {
        Platform::PretUp
    }

    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput> {
        let mut out = AdapterOutput::default();

        let mut offers = Vec::new();
        let mut found_offer_sheet = false;
        for (name, status) in OFFER_SHEETS {
            match tables.sheet(name) {
                Some(sheet) => {
                    found_offer_sheet = true;
                    offers.extend(self.parse_offers(sheet, status, &mut out));
                }
                None => out.issues.push(Issue::info("missing_sheet", format!("no {:?} sheet", name))),
            }
        }
        if !found_offer_sheet {
            return Err(IngestError::format(&tables.source, "no offer sheet"));
        }

        let account = tables.require_sheet("Relevé compte")?;
        self.parse_account(account, ctx, &mut out);

        let extended = self.extended_projects(tables);
        let earliest_flow = out.cash_flows.iter().map(|f| f.transaction_date).min();

        for offer in offers {
            let folded = fold_key(&offer.project);
            // the first subscription naming the project dates the investment
            let subscribed = out
                .cash_flows
                .iter()
                .filter(|f| f.flow_type == FlowType::Investment)
                .filter(|f| matches!(&f.link, LinkKey::Mention { text } if text.contains(&folded)))
                .map(|f| f.transaction_date)
                .min();
            let date = match subscribed.or(earliest_flow) {
                Some(d) => d,
                None => {
                    out.skip(Issue::warning("investment_date_unknown", format!("no date for {}", offer.project)));
                    continue;
                }
            };
            if subscribed.is_none() {
                out.issues.push(Issue::warning(
                    "investment_date_estimated",
                    format!("{} dated from the first account movement", offer.project),
                ));
            }

            let id = if offer.id.is_empty() { None } else { Some(offer.id) };
            let mut inv = Investment::new(Platform::PretUp, id, &offer.project, &offer.company, offer.amount, date);
            inv.investment_type = InvestmentType::Crowdlending;
            inv.asset_class = crate::models::AssetClass::Business;
            inv.transition(offer.status);
            if extended.contains(&folded) {
                inv.is_delayed = true;
                if inv.status == InvestmentStatus::Active {
                    inv.transition(InvestmentStatus::Delayed);
                }
            }
            if let Some(remaining) = offer.remaining {
                out.reported_remaining.insert(inv.id, remaining.abs());
            }
            out.investments.push(inv);
        }

        super::log_low_confidence(&out.cash_flows, Platform::PretUp);
        log::info!(
            "PretUp: {} investments, {} cash flows, {} balances, {} skipped",
            out.investments.len(),
            out.cash_flows.len(),
            out.liquidity.len(),
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
    use rust_decimal_macros::dec;

    fn workbook() -> RawTables {
        RawTables::new(
            "Portefeuille PretUp.xlsx",
            vec![
                sheet(
                    "Projet Sains - Offres",
                    &[
                        &["Nom du Projet", "Entreprise", "N° offre", "Montant offert", "Capital restant"],
                        &["Boulangerie Dupont", "Dupont SARL", "OF-1", "1 000,00", "800,00"],
                        &["Garage Central", "Central Auto", "OF-2", "500", "500"],
                        &["TOTAUX :", "", "", "1500", "1300"],
                    ],
                ),
                sheet(
                    "Perdu - Offres",
                    &[&["Nom du Projet"], &["Atelier Fermé", "Fermé SAS", "OF-3", "300", "300"]],
                ),
                sheet(
                    "Projets Sains - Echéances",
                    &[&["Garage Central", "15/06/2023", "Prolongation de 6 mois"]],
                ),
                sheet(
                    "Relevé compte",
                    &[
                        &["Date", "Type", "", "Description", "Débit", "Crédit", "Statut", "Échéance", "", "Capital", "", "CSG/CRDS", "PF", "Intérêts nets"],
                        &["01/01/2023 à 10:00", "Alimentation", "", "Virement", "", "2000", "Réussi"],
                        &["05/01/2023 à 09:12", "Offre", "", "Offre Boulangerie Dupont", "1000", "", "Réussi"],
                        &["06/01/2023 à 09:12", "Offre", "", "Offre Garage Central", "500", "", "Non abouti"],
                        &["05/02/2023 à 08:00", "Echéance", "", "Echéance Boulangerie Dupont", "", "45,00", "Réussi", "45,00", "", "37,50", "", "1,29", "0,96", "5,25"],
                        &["10/03/2023 à 08:00", "Remboursement anticipé", "", "Boulangerie Dupont", "", "200", "Réussi"],
                        &["31/03/2023 à 23:59", "Solde du compte", "", "", "", "725,50", ""],
                    ],
                ),
            ],
        )
    }

    fn parse() -> AdapterOutput {
        let config = IngestConfig::default();
        PretUpAdapter::new().parse(&workbook(), &ParseContext::new(&config, date(2024, 1, 1))).unwrap()
    }

    #[test]
    fn test_offer_sheets_define_investments() {
        let out = parse();
        assert_eq!(out.investments.len(), 3);
        let dupont = out.investments.iter().find(|i| i.project_name == "Boulangerie Dupont").unwrap();
        assert_eq!(dupont.investment_date, date(2023, 1, 5));
        assert_eq!(dupont.platform_id.as_deref(), Some("OF-1"));
        assert_eq!(out.reported_remaining.get(&dupont.id), Some(&dec!(800.00)));

        let lost = out.investments.iter().find(|i| i.project_name == "Atelier Fermé").unwrap();
        assert_eq!(lost.status, InvestmentStatus::Defaulted);
        assert!(out.issues.iter().any(|i| i.code == "investment_date_estimated"));
        assert!(out.issues.iter().any(|i| i.code == "missing_sheet"));
    }

    #[test]
    fn test_schedule_extension_marks_delay() {
        let out = parse();
        let garage = out.investments.iter().find(|i| i.project_name == "Garage Central").unwrap();
        assert!(garage.is_delayed);
        assert_eq!(garage.status, InvestmentStatus::Delayed);
    }

    #[test]
    fn test_installment_split_and_taxes() {
        let out = parse();
        let installment = out
            .cash_flows
            .iter()
            .find(|f| f.flow_type == FlowType::Repayment && f.transaction_date == date(2023, 2, 5))
            .unwrap();
        assert_eq!(installment.gross_amount, dec!(45.00));
        assert_eq!(installment.capital_amount, dec!(37.50));
        assert_eq!(installment.interest_amount, dec!(7.50));
        assert_eq!(installment.tax_amount, dec!(2.25));
        assert_eq!(installment.net_amount, dec!(42.75));
        assert_eq!(installment.allocation, Allocation::Schedule);

        let early = out.cash_flows.iter().find(|f| f.transaction_date == date(2023, 3, 10)).unwrap();
        assert_eq!(early.capital_amount, dec!(200));
    }

    #[test]
    fn test_failed_rows_and_balance() {
        let out = parse();
        assert_eq!(out.cash_flows.len(), 4);
        assert_eq!(out.skipped, 1);
        assert_eq!(out.liquidity.len(), 1);
        assert_eq!(out.liquidity[0].amount, dec!(725.50));
        assert_eq!(out.liquidity[0].balance_date, date(2023, 3, 31));
    }
}
