//! Composite maturity score in [0, 1].

use serde::Serialize;

use super::liquidity::LiquidityProjection;
use super::{to_f64, Metric, MetricType, MetricValue};
use crate::config::MaturityWeights;
use crate::models::Dataset;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct MaturityComponents {
    pub repaid_share: Option<f64>,
    pub near_term_liquidity: Option<f64>,
    pub reinvestment: Option<f64>,
}

impl MaturityComponents {
    pub fn collect(data: &Dataset, projection: Option<&LiquidityProjection>, reinvestment: Option<f64>) -> Self {
        let invested: f64 = data.investments.iter().map(|i| to_f64(i.invested_amount)).sum();
        let repaid: f64 = data.investments.iter().map(|i| to_f64(i.capital_repaid)).sum();
        let outstanding: f64 = data
            .investments
            .iter()
            .filter(|i| i.status.is_open())
            .map(|i| to_f64(i.remaining_capital))
            .sum();

        Self {
            repaid_share: (invested > 0.0).then(|| (repaid / invested).clamp(0.0, 1.0)),
            near_term_liquidity: match projection {
                Some(p) if outstanding > 0.0 => Some((p.cumulative_6m / outstanding).clamp(0.0, 1.0)),
                _ => None,
            },
            reinvestment: reinvestment.map(|r| r.clamp(0.0, 1.0)),
        }
    }

    /// Weighted mean of the available components; `None` when none is.
    pub fn score(&self, weights: &MaturityWeights) -> Option<f64> {
        let parts = [
            (self.repaid_share, weights.repaid_share),
            (self.near_term_liquidity, weights.near_term_liquidity),
            (self.reinvestment, weights.reinvestment),
        ];
        let (sum, total_weight) = parts
            .iter()
            .filter_map(|(value, weight)| value.map(|v| (v, *weight)))
            .filter(|(_, weight)| *weight > 0.0)
            .fold((0.0, 0.0), |(sum, tw), (v, w)| (sum + v * w, tw + w));
        (total_weight > 0.0).then(|| sum / total_weight)
    }
}

pub(crate) fn metric(
    data: &Dataset,
    projection: Option<&LiquidityProjection>,
    reinvestment: Option<f64>,
    weights: &MaturityWeights,
) -> Metric {
    let components = MaturityComponents::collect(data, projection, reinvestment);
    match components.score(weights) {
        Some(score) => Metric::new(MetricType::MaturityScore, MetricValue::value(score))
            .with_payload(serde_json::to_value(&components).unwrap_or_default()),
        None => Metric::new(MetricType::MaturityScore, MetricValue::not_computed("no component available")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_components_are_dropped() {
        let components = MaturityComponents { repaid_share: Some(0.5), near_term_liquidity: None, reinvestment: Some(1.0) };
        let score = components.score(&MaturityWeights::default()).unwrap();
        assert!((score - 0.75).abs() < 1e-12);

        let weights = MaturityWeights { repaid_share: 3.0, near_term_liquidity: 1.0, reinvestment: 1.0 };
        let score = components.score(&weights).unwrap();
        assert!((score - 2.5 / 4.0).abs() < 1e-12);
    }

    #[test]
    fn test_no_components() {
        assert_eq!(MaturityComponents::default().score(&MaturityWeights::default()), None);
    }

    #[test]
    fn test_negative_reinvestment_is_clamped() {
        let components = MaturityComponents::collect(&Dataset::default(), None, Some(-2.0));
        assert_eq!(components.reinvestment, Some(0.0));
        assert_eq!(components.repaid_share, None);
    }
}
