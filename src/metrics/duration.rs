//! Remaining duration of open capital.

use chrono::NaiveDate;
use serde::Serialize;

use super::{months_until, to_f64, Metric, MetricType, MetricValue};
use crate::models::Dataset;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DurationBucket {
    pub label: &'static str,
    pub amount: f64,
    pub share: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DurationProfile {
    /// Remaining months weighted by remaining capital
    pub weighted_months: f64,
    pub buckets: Vec<DurationBucket>,
    /// Open capital without an expected end date
    pub unscheduled_amount: f64,
}

const BUCKETS: [&str; 3] = ["lt_6m", "6_12m", "gt_12m"];

fn bucket_index(months: f64) -> usize {
    if months < 6.0 {
        0
    } else if months <= 12.0 {
        1
    } else {
        2
    }
}

pub fn profile(data: &Dataset, as_of: NaiveDate) -> Option<DurationProfile> {
    let mut amounts = [0.0; 3];
    let mut weighted = 0.0;
    let mut unscheduled = 0.0;

    for inv in data.investments.iter().filter(|i| i.status.is_open()) {
        let capital = to_f64(inv.remaining_capital);
        if capital <= 0.0 {
            continue;
        }
        match inv.expected_end_date {
            Some(end) => {
                // overdue capital counts as due now
                let months = months_until(as_of, end).max(0.0);
                weighted += months * capital;
                amounts[bucket_index(months)] += capital;
            }
            None => unscheduled += capital,
        }
    }

    let total: f64 = amounts.iter().sum();
    if total <= 0.0 {
        return None;
    }
    Some(DurationProfile {
        weighted_months: weighted / total,
        buckets: BUCKETS
            .iter()
            .zip(amounts)
            .map(|(label, amount)| DurationBucket { label, amount, share: amount / total })
            .collect(),
        unscheduled_amount: unscheduled,
    })
}

pub(crate) fn metric(data: &Dataset, as_of: NaiveDate) -> Metric {
    match profile(data, as_of) {
        Some(p) => Metric::new(MetricType::Duration, MetricValue::value(p.weighted_months))
            .with_payload(serde_json::to_value(&p).unwrap_or_default()),
        None => Metric::new(MetricType::Duration, MetricValue::not_computed("no open capital with an end date")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Investment, InvestmentStatus, Platform};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn open(amount: Decimal, end: Option<NaiveDate>) -> Investment {
        let mut inv = Investment::new(Platform::Homunity, None, &format!("P{}", amount), "X", amount, date(2023, 1, 1));
        inv.expected_end_date = end;
        inv
    }

    #[test]
    fn test_weighted_duration_and_buckets() {
        let as_of = date(2024, 1, 1);
        let mut done = open(dec!(5000), Some(date(2030, 1, 1)));
        done.status = InvestmentStatus::Completed;
        let data = Dataset {
            investments: vec![
                open(dec!(1000), Some(date(2023, 6, 1))), // overdue -> 0 months
                open(dec!(1000), Some(date(2025, 1, 1))), // 366 days
                open(dec!(500), None),
                done,
            ],
            ..Default::default()
        };
        let p = profile(&data, as_of).unwrap();
        let expected = (366.0 / 30.44) / 2.0;
        assert!((p.weighted_months - expected).abs() < 1e-9);
        assert_eq!(p.buckets[0].amount, 1000.0);
        assert_eq!(p.buckets[1].amount, 0.0);
        assert_eq!(p.buckets[2].amount, 1000.0);
        assert_eq!(p.unscheduled_amount, 500.0);
    }

    #[test]
    fn test_no_open_capital() {
        assert!(profile(&Dataset::default(), date(2024, 1, 1)).is_none());
    }
}
