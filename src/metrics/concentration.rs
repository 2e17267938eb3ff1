//! Issuer concentration (Herfindahl-Hirschman index).

use serde::Serialize;
use std::collections::BTreeMap;

use super::{latest_positions, to_f64, Metric, MetricType, MetricValue};
use crate::config::MetricsConfig;
use crate::models::Dataset;
use crate::normalize::fold_key;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConcentrationLevel {
    Low,
    Moderate,
    High,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Exposure {
    pub issuer: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Concentration {
    pub hhi: f64,
    pub level: ConcentrationLevel,
    pub effective_issuers: f64,
    pub top1_share: f64,
    pub top3_share: f64,
    pub issuer_count: usize,
}

/// Exposure per issuer, largest first.
///
/// Loans are grouped by company (project when the company is blank) and
/// weighted by invested amount; securities come from the latest position
/// snapshot, weighted by market value.
pub fn exposures(data: &Dataset) -> Vec<Exposure> {
    let mut by_issuer: BTreeMap<String, (String, f64)> = BTreeMap::new();
    for inv in &data.investments {
        let name = if inv.company_name.trim().is_empty() { &inv.project_name } else { &inv.company_name };
        let entry = by_issuer
            .entry(format!("{}|{}", inv.platform, fold_key(name)))
            .or_insert_with(|| (name.clone(), 0.0));
        entry.1 += to_f64(inv.invested_amount);
    }

    for p in latest_positions(data) {
        let entry = by_issuer
            .entry(format!("{}|{}", p.platform, p.isin))
            .or_insert_with(|| (p.asset_name.clone(), 0.0));
        entry.1 += to_f64(p.market_value);
    }

    let mut exposures: Vec<Exposure> = by_issuer
        .into_values()
        .filter(|(_, amount)| *amount > 0.0)
        .map(|(issuer, amount)| Exposure { issuer, amount })
        .collect();
    exposures.sort_by(|a, b| b.amount.total_cmp(&a.amount));
    exposures
}

/// `10000 × Σ share²`; `None` when there is nothing to weigh.
pub fn herfindahl(amounts: &[f64]) -> Option<f64> {
    let total: f64 = amounts.iter().sum();
    if total <= 0.0 {
        return None;
    }
    Some(amounts.iter().map(|a| (a / total).powi(2)).sum::<f64>() * 10_000.0)
}

pub fn level(hhi: f64, config: &MetricsConfig) -> ConcentrationLevel {
    if hhi < config.hhi_moderate {
        ConcentrationLevel::Low
    } else if hhi <= config.hhi_high {
        ConcentrationLevel::Moderate
    } else {
        ConcentrationLevel::High
    }
}

pub fn concentration(data: &Dataset, config: &MetricsConfig) -> Option<Concentration> {
    let exposures = exposures(data);
    let amounts: Vec<f64> = exposures.iter().map(|e| e.amount).collect();
    let hhi = herfindahl(&amounts)?;
    let total: f64 = amounts.iter().sum();

    Some(Concentration {
        hhi,
        level: level(hhi, config),
        effective_issuers: 10_000.0 / hhi,
        top1_share: amounts.first().copied().unwrap_or(0.0) / total,
        top3_share: amounts.iter().take(3).sum::<f64>() / total,
        issuer_count: amounts.len(),
    })
}

pub(crate) fn metric(data: &Dataset, config: &MetricsConfig) -> Metric {
    match concentration(data, config) {
        Some(c) => Metric::new(MetricType::Concentration, MetricValue::value(c.hhi))
            .with_payload(serde_json::to_value(&c).unwrap_or_default()),
        None => Metric::new(MetricType::Concentration, MetricValue::not_computed("no exposure")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetClass, Investment, Platform, PortfolioPosition};
    use chrono::NaiveDate;
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn loan(project: &str, company: &str, amount: Decimal) -> Investment {
        Investment::new(Platform::Lpb, None, project, company, amount, date(2023, 1, 1))
    }

    fn position(isin: &str, value: Decimal, on: NaiveDate) -> PortfolioPosition {
        PortfolioPosition {
            platform: Platform::Pea,
            isin: isin.into(),
            asset_name: isin.into(),
            asset_class: AssetClass::Etf,
            quantity: dec!(1),
            current_price: value,
            market_value: value,
            portfolio_share: None,
            valuation_date: on,
        }
    }

    #[test]
    fn test_hhi_four_equal_issuers() {
        let hhi = herfindahl(&[250.0, 250.0, 250.0, 250.0]).unwrap();
        assert!((hhi - 2500.0).abs() < 1e-9);
        assert_eq!(level(hhi, &MetricsConfig::default()), ConcentrationLevel::Moderate);
    }

    #[test]
    fn test_hhi_single_issuer() {
        let hhi = herfindahl(&[1234.0]).unwrap();
        assert!((hhi - 10_000.0).abs() < 1e-9);
        assert_eq!(level(hhi, &MetricsConfig::default()), ConcentrationLevel::High);
        assert_eq!(herfindahl(&[]), None);
    }

    #[test]
    fn test_issuers_group_projects_of_one_company() {
        let data = Dataset {
            investments: vec![
                loan("Tour A", "Promo Sud", dec!(500)),
                loan("Tour B", "PROMO SUD", dec!(500)),
                loan("Villa", "Nord", dec!(1000)),
            ],
            ..Default::default()
        };
        let c = concentration(&data, &MetricsConfig::default()).unwrap();
        assert_eq!(c.issuer_count, 2);
        assert!((c.hhi - 5000.0).abs() < 1e-9);
        assert!((c.effective_issuers - 2.0).abs() < 1e-9);
        assert!((c.top1_share - 0.5).abs() < 1e-9);
        assert!((c.top3_share - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_positions_use_latest_snapshot() {
        let data = Dataset {
            positions: vec![
                position("FR0000000001", dec!(900), date(2023, 12, 31)),
                position("FR0000000001", dec!(100), date(2024, 3, 31)),
                position("FR0000000002", dec!(100), date(2024, 3, 31)),
            ],
            ..Default::default()
        };
        let exposures = exposures(&data);
        assert_eq!(exposures.len(), 2);
        assert!(exposures.iter().all(|e| e.amount == 100.0));
    }
}
