//! Life-insurance contract statement.
//!
//! One sheet (`Relevé compte`, or the first sheet of older exports) with
//! 0 date, 1 operation type, 2 amount. There are no underlying projects, so
//! every flow stays at platform level.

use super::{cell, is_header_or_blank, required_amount, required_date, AdapterOutput, ParseContext, PlatformAdapter, RawTables};
use crate::errors::{IngestError, Result};
use crate::models::{CashFlow, Issue, Platform};
use crate::rules::Classification;

pub struct AssuranceVieAdapter;

impl AssuranceVieAdapter {
    pub fn new() -> Self {
        Self
    }
}

impl Default for AssuranceVieAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl PlatformAdapter for AssuranceVieAdapter {
    fn platform(&self) -> Platform {
        Platform::AssuranceVie
    }

    fn parse(&self, tables: &RawTables, ctx: &ParseContext) -> Result<AdapterOutput> {
        let sheet = tables
            .sheet("Relevé compte")
            .or_else(|| tables.first_sheet())
            .ok_or_else(|| IngestError::format(&tables.source, "workbook has no sheet"))?;
        let rules = ctx.config.rules_for(Platform::AssuranceVie);
        let mut out = AdapterOutput::default();

        for (idx, row) in sheet.data_rows() {
            if is_header_or_blank(cell(row, 0), &["date", "date operation", "date d'effet"]) {
                continue;
            }
            let reference = sheet.reference(idx);
            let kind = cell(row, 1);

            let date = match required_date(row, 0) {
                Ok(d) => d,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            let amount = match required_amount(row, 2) {
                Ok(a) => a,
                Err(e) => {
                    out.skip_error(&e, reference);
                    continue;
                }
            };
            if amount.is_zero() {
                out.skip(Issue::info("zero_amount", kind.to_string()).at(reference));
                continue;
            }

            match rules.classify(kind, amount) {
                Classification::Ignored => {
                    out.skip(Issue::info("ignored", kind.to_string()).at(reference));
                }
                Classification::Flow { flow_type, direction, confidence } => {
                    let description = format!("AV - {}", kind);
                    let mut flow = CashFlow::new(Platform::AssuranceVie, flow_type, direction, amount, date, &description);
                    flow.confidence = confidence;
                    out.cash_flows.push(flow);
                }
            }
        }

        super::log_low_confidence(&out.cash_flows, Platform::AssuranceVie);
        log::info!("Assurance Vie: {} cash flows, {} skipped", out.cash_flows.len(), out.skipped);
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::super::test_support::*;
    use super::*;
    use crate::config::IngestConfig;
    use crate::models::{FlowDirection, FlowType};
    use rust_decimal_macros::dec;

    fn parse(tables: RawTables) -> AdapterOutput {
        let config = IngestConfig::default();
        AssuranceVieAdapter::new().parse(&tables, &ParseContext::new(&config, date(2024, 1, 1))).unwrap()
    }

    #[test]
    fn test_statement_rows() {
        let out = parse(RawTables::new(
            "Portefeuille AV Linxea.xlsx",
            vec![sheet(
                "Relevé compte",
                &[
                    &["Date", "Type", "Montant"],
                    &["02/01/2023", "Versement libre", "5 000,00 €"],
                    &["31/12/2023", "Arrêté annuel", "120,00"],
                    &["15/03/2023", "Frais de gestion", "-12,40"],
                    &["20/03/2023", "Distribution dividende", "0"],
                    &["01/06/2023", "Rachat partiel", "-1000"],
                    &["01/07/2023", "Participation aux bénéfices", "85"],
                ],
            )],
        ));

        assert_eq!(out.cash_flows.len(), 4);
        assert_eq!(out.skipped, 2);
        let deposit = &out.cash_flows[0];
        assert_eq!(deposit.flow_type, FlowType::Deposit);
        assert_eq!(deposit.flow_direction, FlowDirection::Out);
        assert_eq!(deposit.gross_amount, dec!(5000.00));
        assert_eq!(deposit.description, "AV - Versement libre");
        assert!(deposit.is_orphan());

        assert_eq!(out.cash_flows[1].flow_type, FlowType::Fee);
        assert_eq!(out.cash_flows[1].gross_amount, dec!(12.40));
        assert_eq!(out.cash_flows[2].flow_type, FlowType::Withdrawal);
        // unmatched stays, direction from its sign
        assert_eq!(out.cash_flows[3].flow_type, FlowType::Other);
        assert_eq!(out.cash_flows[3].flow_direction, FlowDirection::In);
        assert!(out.investments.is_empty());
    }

    #[test]
    fn test_falls_back_to_first_sheet() {
        let out = parse(RawTables::new("av.xlsx", vec![sheet("Feuil1", &[&["05/05/2023", "Versement", "100"]])]));
        assert_eq!(out.cash_flows.len(), 1);
    }

    #[test]
    fn test_empty_workbook_is_a_format_error() {
        let config = IngestConfig::default();
        let err = AssuranceVieAdapter::new()
            .parse(&RawTables::new("av.xlsx", vec![]), &ParseContext::new(&config, date(2024, 1, 1)))
            .unwrap_err();
        assert_eq!(err.code(), "parse_format");
    }
}
