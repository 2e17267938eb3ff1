//! Share of new investments financed by money already on the platforms.

use chrono::NaiveDate;

use super::{to_f64, Metric, MetricType, MetricValue};
use crate::models::{CashFlow, FlowType};

/// `1 - deposits / newly invested` over an inclusive period (all history when
/// `None`). `None` when nothing was invested in the period. The rate goes
/// negative when more was deposited than invested.
pub fn reinvestment_rate(flows: &[CashFlow], period: Option<(NaiveDate, NaiveDate)>) -> Option<f64> {
    let in_period = |f: &&CashFlow| match period {
        Some((start, end)) => f.transaction_date >= start && f.transaction_date <= end,
        None => true,
    };

    let mut deposited = 0.0;
    let mut invested = 0.0;
    for flow in flows.iter().filter(in_period) {
        match flow.flow_type {
            FlowType::Deposit => deposited += to_f64(flow.gross_amount),
            FlowType::Investment | FlowType::Purchase => invested += to_f64(flow.gross_amount),
            _ => {}
        }
    }

    if invested <= 0.0 {
        return None;
    }
    Some(1.0 - deposited / invested)
}

pub(crate) fn metric(rate: Option<f64>) -> Metric {
    match rate {
        Some(rate) => Metric::new(MetricType::ReinvestmentRate, MetricValue::value(rate)),
        None => Metric::new(MetricType::ReinvestmentRate, MetricValue::not_computed("nothing invested")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{FlowDirection, Platform};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(m: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2023, m, 1).unwrap()
    }

    fn flow(flow_type: FlowType, amount: Decimal, m: u32) -> CashFlow {
        let direction = flow_type.default_direction().unwrap_or(FlowDirection::Out);
        CashFlow::new(Platform::Lpb, flow_type, direction, amount, date(m), "x")
    }

    #[test]
    fn test_reinvestment_rate() {
        let flows = vec![
            flow(FlowType::Deposit, dec!(1000), 1),
            flow(FlowType::Investment, dec!(1000), 1),
            flow(FlowType::Repayment, dec!(600), 6),
            flow(FlowType::Investment, dec!(500), 7),
        ];
        let rate = reinvestment_rate(&flows, None).unwrap();
        assert!((rate - (1.0 - 1000.0 / 1500.0)).abs() < 1e-12);

        // second half of the year only reinvests
        let rate = reinvestment_rate(&flows, Some((date(6), date(12)))).unwrap();
        assert_eq!(rate, 1.0);
    }

    #[test]
    fn test_nothing_invested() {
        let flows = vec![flow(FlowType::Deposit, dec!(1000), 1)];
        assert_eq!(reinvestment_rate(&flows, None), None);
    }
}
