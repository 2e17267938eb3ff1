//! Forward projection of capital releases.
//!
//! Each open investment releases its remaining capital, plus the simple
//! interest still to run at its annual rate, in the month of its expected
//! end date. Overdue investments are projected into the current month.

use chrono::{Datelike, NaiveDate};
use serde::Serialize;

use super::{months_until, to_f64, Metric, MetricType, MetricValue};
use crate::models::Dataset;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MonthBucket {
    /// `YYYY-MM`
    pub month: String,
    pub amount: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiquidityProjection {
    pub buckets: Vec<MonthBucket>,
    pub cumulative_6m: f64,
    pub cumulative_12m: f64,
    pub cumulative_24m: f64,
    /// Releases expected after the horizon
    pub beyond_horizon: f64,
    /// Open capital without an expected end date
    pub unscheduled: f64,
}

impl LiquidityProjection {
    /// Total released within the first `months` buckets.
    pub fn released_within(&self, months: usize) -> f64 {
        self.buckets.iter().take(months).map(|b| b.amount).sum()
    }
}

fn month_offset(from: NaiveDate, to: NaiveDate) -> i64 {
    (to.year() - from.year()) as i64 * 12 + to.month() as i64 - from.month() as i64
}

fn month_label(as_of: NaiveDate, offset: u32) -> String {
    let index = as_of.year() * 12 + as_of.month0() as i32 + offset as i32;
    format!("{:04}-{:02}", index.div_euclid(12), index.rem_euclid(12) + 1)
}

/// `None` when no open investment has both capital outstanding and an end date.
pub fn project(data: &Dataset, as_of: NaiveDate, horizon_months: u32) -> Option<LiquidityProjection> {
    let mut amounts = vec![0.0; horizon_months as usize];
    let mut beyond = 0.0;
    let mut unscheduled = 0.0;
    let mut scheduled = 0;

    for inv in data.investments.iter().filter(|i| i.status.is_open()) {
        let capital = to_f64(inv.remaining_capital);
        if capital <= 0.0 {
            continue;
        }
        let Some(end) = inv.expected_end_date else {
            unscheduled += capital;
            continue;
        };
        scheduled += 1;

        let months_left = months_until(as_of, end).max(0.0);
        let interest = inv
            .annual_rate
            .map(|rate| capital * to_f64(rate) / 100.0 * months_left / 12.0)
            .unwrap_or(0.0);
        let offset = month_offset(as_of, end).max(0) as usize;
        match amounts.get_mut(offset) {
            Some(bucket) => *bucket += capital + interest,
            None => beyond += capital + interest,
        }
    }

    if scheduled == 0 {
        return None;
    }

    let buckets: Vec<MonthBucket> = amounts
        .into_iter()
        .enumerate()
        .map(|(i, amount)| MonthBucket { month: month_label(as_of, i as u32), amount })
        .collect();
    let mut projection = LiquidityProjection {
        buckets,
        cumulative_6m: 0.0,
        cumulative_12m: 0.0,
        cumulative_24m: 0.0,
        beyond_horizon: beyond,
        unscheduled,
    };
    projection.cumulative_6m = projection.released_within(6);
    projection.cumulative_12m = projection.released_within(12);
    projection.cumulative_24m = projection.released_within(24);
    Some(projection)
}

pub(crate) fn metric(projection: Option<&LiquidityProjection>) -> Metric {
    match projection {
        Some(p) => Metric::new(MetricType::LiquidityProjection, MetricValue::value(p.cumulative_12m))
            .with_payload(serde_json::to_value(p).unwrap_or_default()),
        None => Metric::new(
            MetricType::LiquidityProjection,
            MetricValue::not_computed("no open capital with an end date"),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Investment, Platform};
    use rust_decimal::Decimal;
    use rust_decimal_macros::dec;

    fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    fn open(name: &str, amount: Decimal, end: NaiveDate) -> Investment {
        let mut inv = Investment::new(Platform::Lpb, None, name, name, amount, date(2023, 1, 1));
        inv.expected_end_date = Some(end);
        inv
    }

    #[test]
    fn test_releases_land_in_end_month() {
        let as_of = date(2024, 1, 15);
        let data = Dataset {
            investments: vec![
                open("late", dec!(1000), date(2023, 11, 30)),
                open("march", dec!(2000), date(2024, 3, 15)),
                open("far", dec!(500), date(2027, 1, 1)),
            ],
            ..Default::default()
        };
        let p = project(&data, as_of, 24).unwrap();
        assert_eq!(p.buckets.len(), 24);
        assert_eq!(p.buckets[0].month, "2024-01");
        assert_eq!(p.buckets[0].amount, 1000.0);
        assert_eq!(p.buckets[2].month, "2024-03");
        assert_eq!(p.buckets[2].amount, 2000.0);
        assert_eq!(p.buckets[23].month, "2025-12");
        assert_eq!(p.beyond_horizon, 500.0);
        assert_eq!(p.cumulative_6m, 3000.0);
        assert_eq!(p.cumulative_24m, 3000.0);
    }

    #[test]
    fn test_interest_is_added_to_release() {
        let as_of = date(2024, 1, 1);
        let mut inv = open("rated", dec!(1000), date(2024, 12, 31));
        inv.annual_rate = Some(dec!(12));
        let data = Dataset { investments: vec![inv], ..Default::default() };
        let p = project(&data, as_of, 12).unwrap();
        let expected = 1000.0 + 1000.0 * 0.12 * (365.0 / 30.44) / 12.0;
        assert!((p.buckets[11].amount - expected).abs() < 1e-9);
        assert!((p.cumulative_12m - expected).abs() < 1e-9);
    }

    #[test]
    fn test_nothing_scheduled() {
        assert!(project(&Dataset::default(), date(2024, 1, 1), 24).is_none());
    }
}
