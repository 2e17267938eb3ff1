//! Annualized money-weighted return (XIRR).
//!
//! ```text
//! NPV = Σ CF_i / (1 + r)^t_i = 0,   t_i = days since first flow / 365
//!
//! Newton-Raphson:
//!   r_new = r_old - NPV(r_old) / NPV'(r_old)
//!   NPV'(r) = Σ -t_i × CF_i / (1 + r)^(t_i + 1)
//! ```
//!
//! Flows are signed from the investor's wallet: money put in is negative,
//! money coming back (and the terminal valuation) positive.

use chrono::NaiveDate;
use serde::Serialize;

use super::{latest_liquidity, latest_positions, to_f64};
use crate::config::MetricsConfig;
use crate::errors::{IngestError, Result};
use crate::models::{Dataset, FlowType};

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct RateSolution {
    pub rate: f64,
    pub iterations: usize,
    /// Seed the solver converged from
    pub seed: f64,
}

/// Calculate NPV and its derivative for Newton-Raphson
fn calculate_npv_and_derivative(cash_flows: &[(f64, f64)], rate: f64) -> (f64, f64) {
    let mut npv = 0.0;
    let mut dnpv = 0.0;

    for (cf, years) in cash_flows {
        let discount = (1.0 + rate).powf(*years);
        npv += cf / discount;

        // d/dr [cf / (1+r)^t] = -t * cf / (1+r)^(t+1)
        if discount > 0.0 {
            dnpv -= years * cf / (discount * (1.0 + rate));
        }
    }

    (npv, dnpv)
}

/// One Newton run from `seed`. `Err` carries the iterations spent.
fn newton(series: &[(f64, f64)], seed: f64, config: &MetricsConfig) -> std::result::Result<(f64, usize), usize> {
    let mut rate = seed;
    for iteration in 1..=config.max_iterations {
        let (npv, dnpv) = calculate_npv_and_derivative(series, rate);
        if !npv.is_finite() || !dnpv.is_finite() || dnpv.abs() < config.tolerance {
            return Err(iteration);
        }

        let new_rate = rate - npv / dnpv;
        // leaving the domain counts as divergence, not as a clamp
        if !(new_rate > config.rate_floor && new_rate < config.rate_ceiling) {
            return Err(iteration);
        }
        if (new_rate - rate).abs() < config.tolerance {
            return Ok((new_rate, iteration));
        }
        rate = new_rate;
    }
    Err(config.max_iterations)
}

/// Solve for the annualized rate of a dated series.
///
/// `Ok(None)` for degenerate input (fewer than two flows, or all flows of
/// the same sign). `NoConvergence` when no seed converges.
pub fn xirr(flows: &[(NaiveDate, f64)], config: &MetricsConfig) -> Result<Option<RateSolution>> {
    let nonzero: Vec<&(NaiveDate, f64)> = flows.iter().filter(|(_, a)| *a != 0.0).collect();
    if nonzero.len() < 2 {
        return Ok(None);
    }
    let has_negative = nonzero.iter().any(|(_, a)| *a < 0.0);
    let has_positive = nonzero.iter().any(|(_, a)| *a > 0.0);
    if !(has_negative && has_positive) {
        return Ok(None);
    }

    let Some(first_date) = nonzero.iter().map(|(d, _)| *d).min() else {
        return Ok(None);
    };
    let series: Vec<(f64, f64)> = nonzero
        .iter()
        .map(|(date, amount)| (*amount, (*date - first_date).num_days() as f64 / 365.0))
        .collect();

    let mut seeds = vec![config.primary_seed];
    for seed in &config.fallback_seeds {
        if !seeds.contains(seed) {
            seeds.push(*seed);
        }
    }

    let mut spent = 0;
    for seed in seeds {
        match newton(&series, seed, config) {
            Ok((rate, iterations)) => {
                log::debug!("XIRR converged to {:.6} from seed {} in {} iterations", rate, seed, iterations);
                return Ok(Some(RateSolution { rate, iterations, seed }));
            }
            Err(iterations) => {
                log::debug!("XIRR seed {} failed after {} iterations", seed, iterations);
                spent += iterations;
            }
        }
    }
    Err(IngestError::NoConvergence { iterations: spent })
}

// =============================================================================
// Series construction
// =============================================================================

/// Whether returned flows count before or after withheld taxes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReturnBasis {
    Net,
    Gross,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReturnSeries {
    pub flows: Vec<(NaiveDate, f64)>,
    pub deposited: f64,
    pub returned: f64,
    /// Open capital, latest positions and latest cash balances
    pub terminal_value: f64,
    pub cash: f64,
}

/// Deposits out at gross; withdrawals back at gross; repayments, interest
/// and dividends back at `basis`. Open capital, the latest position snapshot
/// and the latest cash balance of each platform form the terminal flow.
pub fn build_series(data: &Dataset, as_of: NaiveDate, basis: ReturnBasis) -> ReturnSeries {
    let mut series = ReturnSeries::default();
    for flow in &data.cash_flows {
        match flow.flow_type {
            FlowType::Deposit => {
                let amount = to_f64(flow.gross_amount);
                series.deposited += amount;
                series.flows.push((flow.transaction_date, -amount));
            }
            FlowType::Withdrawal => {
                let amount = to_f64(flow.gross_amount);
                series.returned += amount;
                series.flows.push((flow.transaction_date, amount));
            }
            FlowType::Repayment | FlowType::Interest | FlowType::Dividend => {
                let amount = match basis {
                    ReturnBasis::Net => to_f64(flow.net_amount),
                    ReturnBasis::Gross => to_f64(flow.gross_amount),
                };
                series.returned += amount;
                series.flows.push((flow.transaction_date, amount));
            }
            _ => {}
        }
    }

    let open_capital: f64 = data
        .investments
        .iter()
        .filter(|i| i.status.is_open())
        .map(|i| to_f64(i.remaining_capital))
        .sum();
    let market_value: f64 = latest_positions(data).iter().map(|p| to_f64(p.market_value)).sum();
    series.cash = latest_liquidity(data).iter().map(|b| to_f64(b.amount)).sum();
    series.terminal_value = open_capital + market_value + series.cash;
    if series.terminal_value > 0.0 {
        series.flows.push((as_of, series.terminal_value));
    }
    series.flows.sort_by_key(|(d, _)| *d);
    series
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{AssetClass, CashFlow, FlowDirection, Investment, LiquidityBalance, Platform, PortfolioPosition};
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_xirr_simple() {
        // put 1000 in, get 1100 back 365 days later
        let flows = vec![(date(2023, 1, 1), -1000.0), (date(2024, 1, 1), 1100.0)];
        let solution = xirr(&flows, &MetricsConfig::default()).unwrap().unwrap();
        assert!((solution.rate - 0.10).abs() < 1e-4, "rate was {:.6}", solution.rate);
    }

    #[test]
    fn test_xirr_multiple_flows() {
        let flows = vec![
            (date(2023, 1, 1), -1000.0),
            (date(2023, 7, 1), -500.0),
            (date(2024, 1, 1), 1700.0),
        ];
        let solution = xirr(&flows, &MetricsConfig::default()).unwrap().unwrap();
        assert!(solution.rate > 0.0);
        assert!(solution.rate < 0.25);
    }

    #[test]
    fn test_xirr_loss_needs_fallback_seed() {
        // positive seeds overshoot below -99% on the first step
        let flows = vec![(date(2023, 1, 1), -1000.0), (date(2024, 1, 1), 400.0)];
        let solution = xirr(&flows, &MetricsConfig::default()).unwrap().unwrap();
        assert!((solution.rate + 0.6).abs() < 1e-4, "rate was {:.6}", solution.rate);
        assert_eq!(solution.seed, -0.5);
    }

    #[test]
    fn test_degenerate_series_is_undefined() {
        let config = MetricsConfig::default();
        assert_eq!(xirr(&[(date(2023, 1, 1), -1000.0)], &config).unwrap(), None);
        assert_eq!(xirr(&[(date(2023, 1, 1), -1000.0), (date(2023, 6, 1), -10.0)], &config).unwrap(), None);
        assert_eq!(xirr(&[], &config).unwrap(), None);
    }

    #[test]
    fn test_no_convergence_is_reported() {
        let config = MetricsConfig { max_iterations: 1, fallback_seeds: vec![], ..Default::default() };
        let flows = vec![(date(2023, 1, 1), -1000.0), (date(2023, 3, 1), 10.0), (date(2025, 1, 1), 1500.0)];
        let err = xirr(&flows, &config).unwrap_err();
        assert_eq!(err.code(), "no_convergence");
    }

    #[test]
    fn test_build_series() {
        let inv = Investment::new(Platform::Lpb, None, "P", "P", dec!(1000), date(2023, 1, 1));
        let data = Dataset {
            investments: vec![inv],
            cash_flows: vec![
                CashFlow::new(Platform::Lpb, FlowType::Deposit, FlowDirection::Out, dec!(1000), date(2023, 1, 1), "Crédit"),
                CashFlow::new(Platform::Lpb, FlowType::Investment, FlowDirection::Out, dec!(1000), date(2023, 1, 2), "Souscription"),
                CashFlow::new(Platform::Lpb, FlowType::Repayment, FlowDirection::In, dec!(100), date(2023, 7, 1), "Remboursement")
                    .with_tax(dec!(30)),
            ],
            ..Default::default()
        };
        let series = build_series(&data, date(2024, 1, 1), ReturnBasis::Net);
        assert_eq!(series.flows.len(), 3);
        assert_eq!(series.deposited, 1000.0);
        assert_eq!(series.returned, 70.0);
        assert_eq!(series.terminal_value, 1000.0);
        assert_eq!(series.flows[2], (date(2024, 1, 1), 1000.0));
    }
    #[test]
    fn test_deposit_then_withdrawal_series() {
        let data = Dataset {
            cash_flows: vec![
                CashFlow::new(Platform::AssuranceVie, FlowType::Deposit, FlowDirection::Out, dec!(1000), date(2023, 1, 1), "Versement"),
                CashFlow::new(Platform::AssuranceVie, FlowType::Withdrawal, FlowDirection::In, dec!(1100), date(2024, 1, 1), "Rachat"),
            ],
            ..Default::default()
        };
        let series = build_series(&data, date(2024, 1, 1), ReturnBasis::Net);
        assert_eq!(series.flows, vec![(date(2023, 1, 1), -1000.0), (date(2024, 1, 1), 1100.0)]);
        assert_eq!(series.returned, 1100.0);

        let solution = xirr(&series.flows, &MetricsConfig::default()).unwrap().unwrap();
        assert!((solution.rate - 0.10).abs() < 1e-4, "rate was {:.6}", solution.rate);
    }

    #[test]
    fn test_cash_balance_is_part_of_terminal_value() {
        let position = |value, on| PortfolioPosition {
            platform: Platform::Pea,
            isin: "FR0010315770".into(),
            asset_name: "AMUNDI MSCI WORLD".into(),
            asset_class: AssetClass::Etf,
            quantity: dec!(1),
            current_price: value,
            market_value: value,
            portfolio_share: None,
            valuation_date: on,
        };
        let data = Dataset {
            cash_flows: vec![
                CashFlow::new(Platform::Pea, FlowType::Deposit, FlowDirection::Out, dec!(1000), date(2023, 1, 1), "Versement"),
                CashFlow::new(Platform::Pea, FlowType::Purchase, FlowDirection::Out, dec!(500), date(2023, 1, 2), "Achat"),
            ],
            positions: vec![position(dec!(450), date(2023, 6, 30)), position(dec!(500), date(2023, 12, 31))],
            liquidity: vec![
                LiquidityBalance { platform: Platform::Pea, balance_date: date(2023, 6, 30), amount: dec!(900) },
                LiquidityBalance { platform: Platform::Pea, balance_date: date(2023, 12, 31), amount: dec!(500) },
            ],
            ..Default::default()
        };
        let series = build_series(&data, date(2024, 1, 1), ReturnBasis::Net);
        assert_eq!(series.cash, 500.0);
        assert_eq!(series.terminal_value, 1000.0);

        let solution = xirr(&series.flows, &MetricsConfig::default()).unwrap().unwrap();
        assert!(solution.rate.abs() < 1e-6, "rate was {:.6}", solution.rate);
    }

    #[test]
    fn test_gross_basis_ignores_withheld_tax() {
        let data = Dataset {
            cash_flows: vec![
                CashFlow::new(Platform::BienPreter, FlowType::Deposit, FlowDirection::Out, dec!(1000), date(2023, 1, 1), "Dépôt"),
                CashFlow::new(Platform::BienPreter, FlowType::Interest, FlowDirection::In, dec!(100), date(2024, 1, 1), "Intérêts")
                    .with_tax(dec!(30)),
                CashFlow::new(Platform::BienPreter, FlowType::Withdrawal, FlowDirection::In, dec!(1000), date(2024, 1, 1), "Retrait"),
            ],
            ..Default::default()
        };
        let net = build_series(&data, date(2024, 1, 1), ReturnBasis::Net);
        let gross = build_series(&data, date(2024, 1, 1), ReturnBasis::Gross);
        assert_eq!(net.returned, 1070.0);
        assert_eq!(gross.returned, 1100.0);

        let config = MetricsConfig::default();
        let net_rate = xirr(&net.flows, &config).unwrap().unwrap().rate;
        let gross_rate = xirr(&gross.flows, &config).unwrap().unwrap().rate;
        assert!((net_rate - 0.07).abs() < 1e-4, "net rate was {:.6}", net_rate);
        assert!((gross_rate - 0.10).abs() < 1e-4, "gross rate was {:.6}", gross_rate);
    }
}
