//! Financial metrics over the reconciled dataset.
//!
//! Every metric is computed per platform and globally. A scope that lacks the
//! data a metric needs gets an explicit marker instead of a zero, so a cache
//! reader can tell "nothing to measure" from "measured zero".

pub mod concentration;
pub mod duration;
pub mod kpis;
pub mod liquidity;
pub mod maturity;
pub mod reinvestment;
pub mod xirr;

use chrono::NaiveDate;
use rayon::prelude::*;
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

use crate::config::MetricsConfig;
use crate::errors::IngestError;
use crate::models::{Dataset, LiquidityBalance, Platform, PortfolioPosition};
use xirr::ReturnBasis;

/// Average month length used for fractional month counts.
pub(crate) const DAYS_PER_MONTH: f64 = 30.44;

pub(crate) fn to_f64(amount: Decimal) -> f64 {
    amount.to_f64().unwrap_or(0.0)
}

/// Fractional months from `from` to `to`; negative when `to` is earlier.
pub(crate) fn months_until(from: NaiveDate, to: NaiveDate) -> f64 {
    (to - from).num_days() as f64 / DAYS_PER_MONTH
}

/// Positions of the most recent snapshot of each platform.
pub(crate) fn latest_positions(data: &Dataset) -> Vec<&PortfolioPosition> {
    let mut latest: BTreeMap<Platform, NaiveDate> = BTreeMap::new();
    for p in &data.positions {
        let date = latest.entry(p.platform).or_insert(p.valuation_date);
        if p.valuation_date > *date {
            *date = p.valuation_date;
        }
    }
    data.positions
        .iter()
        .filter(|p| latest.get(&p.platform) == Some(&p.valuation_date))
        .collect()
}

/// Most recent cash balance of each platform.
pub(crate) fn latest_liquidity(data: &Dataset) -> Vec<&LiquidityBalance> {
    let mut latest: BTreeMap<Platform, &LiquidityBalance> = BTreeMap::new();
    for b in &data.liquidity {
        let entry = latest.entry(b.platform).or_insert(b);
        if b.balance_date > entry.balance_date {
            *entry = b;
        }
    }
    latest.into_values().collect()
}

// =============================================================================
// Types
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MetricType {
    AnnualizedReturn,
    /// Annualized return before withheld taxes
    GrossAnnualizedReturn,
    Concentration,
    Duration,
    LiquidityProjection,
    ReinvestmentRate,
    MaturityScore,
    TotalInvested,
    OutstandingCapital,
    RepaymentRate,
    GrossInterest,
    NetCashBalance,
    ExpectedInterest,
    StressTest,
    DelayedShare,
}

impl MetricType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::AnnualizedReturn => "annualized_return",
            Self::GrossAnnualizedReturn => "gross_annualized_return",
            Self::Concentration => "concentration",
            Self::Duration => "duration",
            Self::LiquidityProjection => "liquidity_projection",
            Self::ReinvestmentRate => "reinvestment_rate",
            Self::MaturityScore => "maturity_score",
            Self::TotalInvested => "total_invested",
            Self::OutstandingCapital => "outstanding_capital",
            Self::RepaymentRate => "repayment_rate",
            Self::GrossInterest => "gross_interest",
            Self::NetCashBalance => "net_cash_balance",
            Self::ExpectedInterest => "expected_interest",
            Self::StressTest => "stress_test",
            Self::DelayedShare => "delayed_share",
        }
    }
}

impl fmt::Display for MetricType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum MetricValue {
    Value { value: f64 },
    /// The scope lacks the data the metric needs
    NotComputed { reason: String },
    /// The data is there but the metric has no meaning for it
    Undefined { reason: String },
    NoConvergence { iterations: usize },
}

impl MetricValue {
    pub fn value(value: f64) -> Self {
        Self::Value { value }
    }

    pub fn not_computed(reason: &str) -> Self {
        Self::NotComputed { reason: reason.to_string() }
    }

    pub fn undefined(reason: &str) -> Self {
        Self::Undefined { reason: reason.to_string() }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Value { value } => Some(*value),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Metric {
    pub metric_type: MetricType,
    pub value: MetricValue,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payload: Option<serde_json::Value>,
}

impl Metric {
    pub fn new(metric_type: MetricType, value: MetricValue) -> Self {
        Self { metric_type, value, payload: None }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = Some(payload);
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    Global,
    Platform(Platform),
}

impl Scope {
    /// `global` or the platform key.
    pub fn key(&self) -> &'static str {
        match self {
            Self::Global => "global",
            Self::Platform(p) => p.key(),
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        if key == "global" {
            Some(Self::Global)
        } else {
            Platform::from_key(key).map(Self::Platform)
        }
    }
}

impl fmt::Display for Scope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScopeMetrics {
    pub scope: Scope,
    pub metrics: Vec<Metric>,
}

impl ScopeMetrics {
    pub fn get(&self, metric_type: MetricType) -> Option<&Metric> {
        self.metrics.iter().find(|m| m.metric_type == metric_type)
    }
}

// =============================================================================
// Engine
// =============================================================================

pub struct MetricsEngine<'a> {
    config: &'a MetricsConfig,
    as_of: NaiveDate,
}

impl<'a> MetricsEngine<'a> {
    pub fn new(config: &'a MetricsConfig, as_of: NaiveDate) -> Self {
        Self { config, as_of }
    }

    /// Global scope first, then one scope per platform present in the data.
    pub fn compute_all(&self, data: &Dataset) -> Vec<ScopeMetrics> {
        let mut scopes = vec![Scope::Global];
        scopes.extend(data.platforms().into_iter().map(Scope::Platform));

        let results: Vec<ScopeMetrics> = scopes
            .par_iter()
            .map(|scope| match scope {
                Scope::Global => self.compute_scope(*scope, data),
                Scope::Platform(p) => self.compute_scope(*scope, &data.for_platform(*p)),
            })
            .collect();
        log::info!("Computed metrics for {} scopes", results.len());
        results
    }

    pub fn compute_scope(&self, scope: Scope, data: &Dataset) -> ScopeMetrics {
        log::debug!(
            "Computing metrics for {} ({} investments, {} flows, {} positions)",
            scope,
            data.investments.len(),
            data.cash_flows.len(),
            data.positions.len()
        );

        let liquidity = liquidity::project(data, self.as_of, self.config.horizon_months);
        let reinvestment = reinvestment::reinvestment_rate(&data.cash_flows, None);

        let mut metrics = vec![
            self.annualized_return(data, ReturnBasis::Net),
            self.annualized_return(data, ReturnBasis::Gross),
            concentration::metric(data, self.config),
            duration::metric(data, self.as_of),
            liquidity::metric(liquidity.as_ref()),
            reinvestment::metric(reinvestment),
            maturity::metric(data, liquidity.as_ref(), reinvestment, &self.config.maturity_weights),
        ];
        metrics.extend(kpis::compute(data, self.as_of));

        ScopeMetrics { scope, metrics }
    }

    fn annualized_return(&self, data: &Dataset, basis: ReturnBasis) -> Metric {
        let metric_type = match basis {
            ReturnBasis::Net => MetricType::AnnualizedReturn,
            ReturnBasis::Gross => MetricType::GrossAnnualizedReturn,
        };
        let series = xirr::build_series(data, self.as_of, basis);
        let value = match xirr::xirr(&series.flows, self.config) {
            Ok(Some(solution)) => solution,
            Ok(None) => {
                let reason = if series.flows.is_empty() { "no flows" } else { "fewer than two flows of opposite sign" };
                return Metric::new(metric_type, MetricValue::undefined(reason));
            }
            Err(IngestError::NoConvergence { iterations }) => {
                log::warn!("{} did not converge after {} iterations", metric_type, iterations);
                return Metric::new(metric_type, MetricValue::NoConvergence { iterations });
            }
            Err(e) => {
                return Metric::new(metric_type, MetricValue::undefined(&e.to_string()));
            }
        };

        let period_days = series
            .flows
            .first()
            .map(|(d, _)| (self.as_of - *d).num_days())
            .unwrap_or(0);
        let multiple = if series.deposited > 0.0 {
            Some((series.returned + series.terminal_value) / series.deposited)
        } else {
            None
        };
        Metric::new(metric_type, MetricValue::value(value.rate)).with_payload(serde_json::json!({
            "basis": basis,
            "total_deposited": series.deposited,
            "total_returned": series.returned,
            "terminal_value": series.terminal_value,
            "cash": series.cash,
            "multiple": multiple,
            "period_days": period_days,
            "benchmark_rate": self.config.benchmark_rate,
            "benchmark_spread": value.rate - self.config.benchmark_rate,
            "iterations": value.iterations,
            "seed": value.seed,
        }))
    }
}
