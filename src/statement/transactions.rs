//! PEA transaction statement lines.
//!
//! A movement line starts with its date, then the label, optional
//! `Qté : <n>` / `Cours : <price>` segments and one or two amounts:
//!
//! ```text
//! 15/03/2024 ACH CPT AMUNDI MSCI WORLD Qté : 10 Cours : 45,20   452,00   0,90
//! 02/04/2024 COUPONS TOTALENERGIES                                 34,50
//! ```

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use regex::{Captures, Regex};
use rust_decimal::Decimal;

use super::valuation::{is_isin, ISIN};
use super::StatementOutput;
use crate::adapters::ParseContext;
use crate::errors::IngestError;
use crate::models::{CashFlow, FlowDirection, FlowType, Issue, Platform};
use crate::normalize::{parse_amount, parse_date};
use crate::rules::Classification;

static LINE_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"^\s*(\d{2}/\d{2}/\d{4})").unwrap());
static ANY_DATE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\d{2}/\d{2}/\d{4}").unwrap());
static QUANTITY: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Qt[ée]\s*:\s*([\d,\.]+)").unwrap());
static PRICE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?i)Cours\s*:\s*([\d,\.]+)").unwrap());

/// Numeric tokens, most specific shape first. Alternation order makes a
/// grouped amount win over its trailing digits.
static AMOUNT_TOKENS: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?P<grouped>\d{1,3}(?:[ \x{a0}\x{202f}.]\d{3})+,\d{2})|(?P<decimal>\d+,\d{2})|(?P<integer>\d+)")
        .unwrap()
});
static WHITESPACE: Lazy<Regex> = Lazy::new(|| Regex::new(r"\s+").unwrap());

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum TokenShape {
    Grouped,
    Decimal,
    Integer,
}

#[derive(Debug, Clone)]
struct AmountToken {
    shape: TokenShape,
    value: Decimal,
    start: usize,
    end: usize,
    near_currency: bool,
}

/// Parsed amounts of one line.
#[derive(Debug, Clone, PartialEq)]
pub(crate) struct LineAmounts {
    pub amount: Decimal,
    pub fee: Option<Decimal>,
}

fn is_currency_adjacent(line: &str, start: usize, end: usize) -> bool {
    let after = line[end..].trim_start();
    let before = line[..start].trim_end();
    after.starts_with('€') || after.starts_with("EUR") || before.ends_with('€') || before.ends_with("EUR")
}

fn amount_tokens(line: &str, ceiling: Decimal) -> Vec<AmountToken> {
    let mut tokens = Vec::new();
    for caps in AMOUNT_TOKENS.captures_iter(line) {
        let (shape, m) = if let Some(m) = caps.name("grouped") {
            (TokenShape::Grouped, m)
        } else if let Some(m) = caps.name("decimal") {
            (TokenShape::Decimal, m)
        } else if let Some(m) = caps.name("integer") {
            (TokenShape::Integer, m)
        } else {
            continue;
        };
        // digits glued to letters are references, not amounts
        let glued = line[..m.start()].chars().next_back().is_some_and(char::is_alphanumeric)
            || line[m.end()..].chars().next().is_some_and(char::is_alphabetic);
        if glued {
            continue;
        }
        let Ok(value) = parse_amount(m.as_str()) else { continue };
        if value <= Decimal::ZERO || value > ceiling {
            continue;
        }
        tokens.push(AmountToken {
            shape,
            value,
            start: m.start(),
            end: m.end(),
            near_currency: is_currency_adjacent(line, m.start(), m.end()),
        });
    }
    tokens
}

/// Pick the transaction amount and an optional fee from a cleaned line.
///
/// Shapes are tried in order; within the first shape that has plausible
/// tokens, the currency-adjacent token (if any) or else the rightmost one is
/// the amount. The nearest other token of the same shape is the fee; when it
/// is the larger of the two, the roles swap.
pub(crate) fn pick_amounts(line: &str, ceiling: Decimal) -> Option<LineAmounts> {
    let tokens = amount_tokens(line, ceiling);
    for shape in [TokenShape::Grouped, TokenShape::Decimal, TokenShape::Integer] {
        let same: Vec<&AmountToken> = tokens.iter().filter(|t| t.shape == shape).collect();
        // a grouped amount next to plain decimals (fee) is still one family
        let same: Vec<&AmountToken> = if shape == TokenShape::Grouped && !same.is_empty() {
            tokens.iter().filter(|t| t.shape != TokenShape::Integer).collect()
        } else {
            same
        };
        if same.is_empty() {
            continue;
        }

        let primary_idx = same
            .iter()
            .rposition(|t| t.near_currency)
            .unwrap_or(same.len() - 1);
        let primary = same[primary_idx];
        let secondary = same
            .iter()
            .enumerate()
            .filter(|(i, _)| *i != primary_idx)
            .min_by_key(|(_, t)| t.start.abs_diff(primary.start))
            .map(|(_, t)| t.value);

        return Some(match secondary {
            Some(other) if other > primary.value => LineAmounts { amount: other, fee: Some(primary.value) },
            other => LineAmounts { amount: primary.value, fee: other },
        });
    }
    None
}

/// Label left once date, quantity, price and amounts are removed.
fn clean_description(line: &str) -> String {
    let without_amounts = AMOUNT_TOKENS.replace_all(line, " ");
    let collapsed = WHITESPACE.replace_all(without_amounts.trim(), " ");
    let label = collapsed.trim_end_matches(['€', ' ']).trim_end_matches("EUR").trim();
    if label.is_empty() {
        "Transaction PEA".to_string()
    } else {
        label.to_string()
    }
}

fn capture_amount(re: &Regex, line: &str) -> Option<(Decimal, String)> {
    let caps = re.captures(line)?;
    let value = parse_amount(&caps[1]).ok()?;
    Some((value, caps[0].to_string()))
}

/// One statement line, or `None` when it is not a movement line.
fn parse_line(line: &str, ctx: &ParseContext, out: &mut StatementOutput) -> Option<()> {
    let caps = LINE_DATE.captures(line)?;
    let reference = line.trim().to_string();
    let date: NaiveDate = match parse_date(&caps[1]) {
        Ok(d) => d,
        Err(e) => {
            out.skip(Issue::from_error(&e, crate::models::Severity::Warning).at(reference));
            return Some(());
        }
    };

    let mut rest = ANY_DATE.replace_all(line, " ").to_string();
    let quantity = capture_amount(&QUANTITY, &rest);
    let price = capture_amount(&PRICE, &rest);
    for (_, segment) in quantity.iter().chain(price.iter()) {
        rest = rest.replacen(segment.as_str(), " ", 1);
    }
    let for_amounts = ISIN
        .replace_all(&rest, |c: &Captures| if is_isin(&c[0]) { " ".to_string() } else { c[0].to_string() })
        .to_string();
    let description = clean_description(&rest);

    let rules = ctx.config.rules_for(Platform::Pea);
    let (flow_type, direction, confidence) = match rules.classify(&description, Decimal::ONE) {
        Classification::Ignored => {
            out.skip(Issue::info("ignored", description).at(reference));
            return Some(());
        }
        Classification::Flow { flow_type, direction, confidence } => (flow_type, direction, confidence),
    };

    let Some(amounts) = pick_amounts(&for_amounts, ctx.config.statement.max_amount) else {
        let err = IngestError::AmountParse(reference.clone());
        out.skip(Issue::from_error(&err, crate::models::Severity::Warning).at(reference));
        return Some(());
    };

    let mut flow = CashFlow::new(Platform::Pea, flow_type, direction, amounts.amount, date, &description);
    flow.quantity = quantity.map(|(q, _)| q);
    flow.unit_price = price.map(|(p, _)| p);
    flow.confidence = confidence;
    out.cash_flows.push(flow);

    if let Some(fee) = amounts.fee {
        out.cash_flows.push(CashFlow::new(
            Platform::Pea,
            FlowType::Fee,
            FlowDirection::Out,
            fee,
            date,
            &format!("Frais - {}", description),
        ));
    }
    Some(())
}

/// Movement lines of a transaction statement.
pub fn parse_transactions(text: &str, ctx: &ParseContext) -> StatementOutput {
    let mut out = StatementOutput::default();
    let mut movement_lines = 0;
    for line in text.lines() {
        if parse_line(line, ctx, &mut out).is_some() {
            movement_lines += 1;
        }
    }
    if movement_lines == 0 {
        out.issues.push(Issue::warning("no_movements", "no dated movement line found"));
    }
    crate::adapters::log_low_confidence(&out.cash_flows, Platform::Pea);
    log::info!("PEA statement: {} cash flows from {} movement lines", out.cash_flows.len(), movement_lines);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::IngestConfig;
    use rust_decimal_macros::dec;

    fn ctx(config: &IngestConfig) -> ParseContext<'_> {
        ParseContext::new(config, NaiveDate::from_ymd_opt(2024, 12, 31).unwrap())
    }

    #[test]
    fn test_pick_amounts_prefers_grouped_then_rightmost() {
        let picked = pick_amounts(" ACH CPT AMUNDI   1 452,00   0,90", dec!(10000000)).unwrap();
        assert_eq!(picked.amount, dec!(1452.00));
        assert_eq!(picked.fee, Some(dec!(0.90)));

        let single = pick_amounts(" COUPONS TOTALENERGIES   34,50", dec!(10000000)).unwrap();
        assert_eq!(single, LineAmounts { amount: dec!(34.50), fee: None });

        let integer = pick_amounts(" VERSEMENT 500", dec!(10000000)).unwrap();
        assert_eq!(integer.amount, dec!(500));
    }

    #[test]
    fn test_pick_amounts_ceiling_and_currency() {
        // an implausible value is ignored in favour of the next candidate
        let picked = pick_amounts(" VERSEMENT 99 999 999,00   1 000,00", dec!(10000000)).unwrap();
        assert_eq!(picked.amount, dec!(1000.00));
        let euro = pick_amounts(" 12,00 € frais 250,00", dec!(10000000)).unwrap();
        assert_eq!(euro.amount, dec!(250.00));
        assert_eq!(euro.fee, Some(dec!(12.00)));
        assert!(pick_amounts(" ABC FR0010315770", dec!(10000000)).is_none());
    }

    #[test]
    fn test_parse_statement_lines() {
        let config = IngestConfig::default();
        let text = "RELEVE DE COMPTE PEA\n\
                    Date       Libellé                      Débit     Crédit\n\
                    15/03/2024 ACH CPT AMUNDI MSCI WORLD Qté : 10 Cours : 45,20   452,00   0,90\n\
                    02/04/2024 COUPONS TOTALENERGIES                                 34,50\n\
                    05/04/2024 TTF AMUNDI MSCI WORLD            1,36\n\
                    10/01/2024 INVESTISSEMENT ESPECES          1 500,00\n\
                    11/01/2024 DIVERS SANS MONTANT\n";
        let out = parse_transactions(text, &ctx(&config));

        let purchase = &out.cash_flows[0];
        assert_eq!(purchase.flow_type, FlowType::Purchase);
        assert_eq!(purchase.flow_direction, FlowDirection::Out);
        assert_eq!(purchase.gross_amount, dec!(452.00));
        assert_eq!(purchase.quantity, Some(dec!(10)));
        assert_eq!(purchase.unit_price, Some(dec!(45.20)));
        assert_eq!(purchase.description, "ACH CPT AMUNDI MSCI WORLD");

        let fee = &out.cash_flows[1];
        assert_eq!(fee.flow_type, FlowType::Fee);
        assert_eq!(fee.gross_amount, dec!(0.90));

        assert_eq!(out.cash_flows[2].flow_type, FlowType::Dividend);
        assert_eq!(out.cash_flows[2].gross_amount, dec!(34.50));
        assert_eq!(out.cash_flows[3].flow_type, FlowType::Fee);
        assert_eq!(out.cash_flows[4].flow_type, FlowType::Deposit);
        assert_eq!(out.cash_flows[4].gross_amount, dec!(1500.00));
        assert_eq!(out.cash_flows.len(), 5);

        // the dated line with no amount is reported, not invented
        assert!(out.issues.iter().any(|i| i.code == "amount_parse"));
    }
}
