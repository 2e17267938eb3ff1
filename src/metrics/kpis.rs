//! Headline indicators of a scope.

use chrono::NaiveDate;
use rust_decimal::Decimal;

use super::concentration::exposures;
use super::{latest_positions, months_until, to_f64, Metric, MetricType, MetricValue};
use crate::models::{Dataset, FlowDirection, FlowType, InvestmentStatus};

fn amount_metric(metric_type: MetricType, amount: Option<f64>, reason: &str) -> Metric {
    match amount {
        Some(value) => Metric::new(metric_type, MetricValue::value(value)),
        None => Metric::new(metric_type, MetricValue::not_computed(reason)),
    }
}

pub fn total_invested(data: &Dataset) -> Option<f64> {
    if data.investments.is_empty() {
        return None;
    }
    Some(data.investments.iter().map(|i| to_f64(i.invested_amount)).sum())
}

/// Open capital on loans plus the latest market value of held securities.
pub fn outstanding_capital(data: &Dataset) -> Option<f64> {
    let positions = latest_positions(data);
    if data.investments.is_empty() && positions.is_empty() {
        return None;
    }
    let open: f64 = data
        .investments
        .iter()
        .filter(|i| i.status.is_open())
        .map(|i| to_f64(i.remaining_capital))
        .sum();
    Some(open + positions.iter().map(|p| to_f64(p.market_value)).sum::<f64>())
}

pub fn repayment_rate(data: &Dataset) -> Option<f64> {
    let invested = total_invested(data)?;
    if invested <= 0.0 {
        return None;
    }
    let repaid: f64 = data.investments.iter().map(|i| to_f64(i.capital_repaid)).sum();
    Some(repaid / invested)
}

/// Interest part of repayments plus interest and dividend payments, before tax.
pub fn gross_interest(data: &Dataset) -> Option<f64> {
    if data.cash_flows.is_empty() {
        return None;
    }
    let total: Decimal = data
        .cash_flows
        .iter()
        .filter(|f| f.flow_direction == FlowDirection::In)
        .map(|f| match f.flow_type {
            FlowType::Repayment => f.interest_amount,
            FlowType::Interest | FlowType::Dividend => f.gross_amount,
            _ => Decimal::ZERO,
        })
        .sum();
    Some(to_f64(total))
}

/// Everything that came back to the wallet minus everything that left it.
pub fn net_cash_balance(data: &Dataset) -> Option<f64> {
    if data.cash_flows.is_empty() {
        return None;
    }
    Some(to_f64(data.cash_flows.iter().map(|f| f.signed_net()).sum()))
}

/// Gross interest still to come on active investments.
///
/// With a known monthly payment: payments left minus the capital they
/// return. Otherwise simple interest at the annual rate until the expected end.
pub fn expected_interest(data: &Dataset, as_of: NaiveDate) -> Option<f64> {
    let mut total = 0.0;
    let mut counted = 0;
    for inv in &data.investments {
        if inv.status != InvestmentStatus::Active {
            continue;
        }
        let Some(end) = inv.expected_end_date.filter(|end| *end > as_of) else {
            continue;
        };
        let remaining = to_f64(inv.remaining_capital);
        if remaining <= 0.0 {
            continue;
        }
        let months = months_until(as_of, end);
        let interest = match (inv.monthly_payment, inv.annual_rate) {
            (Some(payment), _) if payment > Decimal::ZERO => to_f64(payment) * months - remaining,
            (_, Some(rate)) => remaining * to_f64(rate) / 100.0 * months / 12.0,
            _ => continue,
        };
        total += interest.max(0.0);
        counted += 1;
    }
    (counted > 0).then_some(total)
}

/// Loss if the largest issuer of the scope defaulted outright.
pub fn stress_test(data: &Dataset) -> Option<(f64, serde_json::Value)> {
    let exposures = exposures(data);
    let largest = exposures.first()?;
    let total: f64 = exposures.iter().map(|e| e.amount).sum();
    Some((
        largest.amount,
        serde_json::json!({
            "issuer": largest.issuer,
            "share_of_scope": largest.amount / total,
        }),
    ))
}

pub fn delayed_share(data: &Dataset) -> Option<f64> {
    if data.investments.is_empty() {
        return None;
    }
    let delayed = data
        .investments
        .iter()
        .filter(|i| i.is_delayed || i.status == InvestmentStatus::Delayed)
        .count();
    Some(delayed as f64 / data.investments.len() as f64)
}

pub(crate) fn compute(data: &Dataset, as_of: NaiveDate) -> Vec<Metric> {
    let stress = match stress_test(data) {
        Some((loss, payload)) => Metric::new(MetricType::StressTest, MetricValue::value(loss)).with_payload(payload),
        None => Metric::new(MetricType::StressTest, MetricValue::not_computed("no exposure")),
    };
    vec![
        amount_metric(MetricType::TotalInvested, total_invested(data), "no investments"),
        amount_metric(MetricType::OutstandingCapital, outstanding_capital(data), "no investments or positions"),
        amount_metric(MetricType::RepaymentRate, repayment_rate(data), "nothing invested"),
        amount_metric(MetricType::GrossInterest, gross_interest(data), "no cash flows"),
        amount_metric(MetricType::NetCashBalance, net_cash_balance(data), "no cash flows"),
        amount_metric(MetricType::ExpectedInterest, expected_interest(data, as_of), "no active investment with a rate"),
        stress,
        amount_metric(MetricType::DelayedShare, delayed_share(data), "no investments"),
    ]
}
