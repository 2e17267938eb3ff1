//! Persistence and metric cache collaborators.
//!
//! Records are keyed by their deterministic ids, so writing the same batch
//! twice leaves the store unchanged. Positions are stored as snapshots: a new
//! snapshot for a (platform, valuation date) replaces the previous one.

mod sqlite;

pub use sqlite::SqliteStore;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::collections::{BTreeMap, HashMap};

use crate::errors::Result;
use crate::metrics::{Metric, Scope};
use crate::models::{Allocation, CashFlow, Dataset, Investment, LiquidityBalance, Platform, PortfolioPosition};

// =============================================================================
// Validation
// =============================================================================

/// Reason an investment cannot be stored, if any.
pub fn validate_investment(inv: &Investment) -> Option<String> {
    if inv.project_name.is_empty() {
        return Some("empty project name".into());
    }
    if inv.invested_amount < Decimal::ZERO {
        return Some(format!("negative invested amount {}", inv.invested_amount));
    }
    if inv.capital_repaid > inv.invested_amount {
        return Some(format!("repaid {} exceeds invested {}", inv.capital_repaid, inv.invested_amount));
    }
    if inv.remaining_capital != inv.invested_amount - inv.capital_repaid {
        return Some("remaining capital does not match invested - repaid".into());
    }
    None
}

/// Reason a cash flow cannot be stored, if any. A net amount that differs
/// from gross minus tax is stored as reported and flagged upstream.
pub fn validate_cash_flow(flow: &CashFlow) -> Option<String> {
    if flow.gross_amount < Decimal::ZERO || flow.tax_amount < Decimal::ZERO {
        return Some("negative amount".into());
    }
    if flow.allocation != Allocation::NotApplicable
        && flow.capital_amount + flow.interest_amount > flow.gross_amount + Decimal::new(1, 2)
    {
        return Some("capital + interest exceed gross".into());
    }
    None
}

fn accepted<'r, T>(records: &'r [T], check: fn(&T) -> Option<String>, describe: fn(&T) -> String) -> Vec<&'r T> {
    records
        .iter()
        .filter(|r| match check(r) {
            Some(reason) => {
                log::warn!("Rejecting {}: {}", describe(r), reason);
                false
            }
            None => true,
        })
        .collect()
}

pub(crate) fn accepted_investments(investments: &[Investment]) -> Vec<&Investment> {
    accepted(investments, validate_investment, |i| i.natural_key())
}

pub(crate) fn accepted_cash_flows(flows: &[CashFlow]) -> Vec<&CashFlow> {
    accepted(flows, validate_cash_flow, |f| f.natural_key(0))
}

/// Positions grouped by snapshot.
pub(crate) fn snapshots(positions: &[PortfolioPosition]) -> BTreeMap<(Platform, NaiveDate), Vec<PortfolioPosition>> {
    let mut groups: BTreeMap<(Platform, NaiveDate), Vec<PortfolioPosition>> = BTreeMap::new();
    for p in positions {
        groups.entry((p.platform, p.valuation_date)).or_default().push(p.clone());
    }
    groups
}

// =============================================================================
// Collaborator traits
// =============================================================================

/// Canonical record storage, one namespace per user.
pub trait RecordStore {
    /// Insert or update by id. Returns how many records were written.
    fn upsert_investments(&mut self, user: &str, investments: &[Investment]) -> Result<usize>;

    fn upsert_cash_flows(&mut self, user: &str, flows: &[CashFlow]) -> Result<usize>;

    /// Replace the snapshot of `platform` at `valuation_date`.
    fn replace_positions(
        &mut self,
        user: &str,
        platform: Platform,
        valuation_date: NaiveDate,
        positions: &[PortfolioPosition],
    ) -> Result<usize>;

    /// Last write wins per (platform, date).
    fn upsert_liquidity(&mut self, user: &str, balances: &[LiquidityBalance]) -> Result<usize>;

    fn load_dataset(&self, user: &str) -> Result<Dataset>;

    /// Write a reconciled dataset.
    fn save_dataset(&mut self, user: &str, dataset: &Dataset) -> Result<()> {
        let investments = self.upsert_investments(user, &dataset.investments)?;
        let flows = self.upsert_cash_flows(user, &dataset.cash_flows)?;
        let mut positions = 0;
        for ((platform, date), snapshot) in snapshots(&dataset.positions) {
            positions += self.replace_positions(user, platform, date, &snapshot)?;
        }
        let liquidity = self.upsert_liquidity(user, &dataset.liquidity)?;
        log::info!(
            "Saved {} investments, {} cash flows, {} positions, {} balances for {}",
            investments,
            flows,
            positions,
            liquidity,
            user
        );
        Ok(())
    }
}

/// Flat KPI map per (user, scope).
pub trait MetricCache {
    /// Replace every cached metric of the scope.
    fn store_metrics(&mut self, user: &str, scope: Scope, metrics: &[Metric]) -> Result<()>;

    fn cached_metrics(&self, user: &str, scope: Scope) -> Result<Vec<Metric>>;
}

// =============================================================================
// In-memory implementation
// =============================================================================

#[derive(Debug, Default)]
struct UserRecords {
    investments: BTreeMap<uuid::Uuid, Investment>,
    cash_flows: BTreeMap<uuid::Uuid, CashFlow>,
    positions: BTreeMap<(Platform, NaiveDate), Vec<PortfolioPosition>>,
    liquidity: BTreeMap<(Platform, NaiveDate), LiquidityBalance>,
}

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: HashMap<String, UserRecords>,
    metrics: HashMap<(String, Scope), Vec<Metric>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn user(&mut self, user: &str) -> &mut UserRecords {
        self.users.entry(user.to_string()).or_default()
    }
}

impl RecordStore for MemoryStore {
    fn upsert_investments(&mut self, user: &str, investments: &[Investment]) -> Result<usize> {
        let accepted = accepted_investments(investments);
        let records = self.user(user);
        for inv in &accepted {
            records.investments.insert(inv.id, (*inv).clone());
        }
        Ok(accepted.len())
    }

    fn upsert_cash_flows(&mut self, user: &str, flows: &[CashFlow]) -> Result<usize> {
        let accepted = accepted_cash_flows(flows);
        let records = self.user(user);
        for flow in &accepted {
            records.cash_flows.insert(flow.id, (*flow).clone());
        }
        Ok(accepted.len())
    }

    fn replace_positions(
        &mut self,
        user: &str,
        platform: Platform,
        valuation_date: NaiveDate,
        positions: &[PortfolioPosition],
    ) -> Result<usize> {
        self.user(user).positions.insert((platform, valuation_date), positions.to_vec());
        Ok(positions.len())
    }

    fn upsert_liquidity(&mut self, user: &str, balances: &[LiquidityBalance]) -> Result<usize> {
        let records = self.user(user);
        for b in balances {
            records.liquidity.insert((b.platform, b.balance_date), b.clone());
        }
        Ok(balances.len())
    }

    fn load_dataset(&self, user: &str) -> Result<Dataset> {
        let Some(records) = self.users.get(user) else {
            return Ok(Dataset::default());
        };
        Ok(Dataset {
            investments: records.investments.values().cloned().collect(),
            cash_flows: records.cash_flows.values().cloned().collect(),
            positions: records.positions.values().flatten().cloned().collect(),
            liquidity: records.liquidity.values().cloned().collect(),
        })
    }
}

impl MetricCache for MemoryStore {
    fn store_metrics(&mut self, user: &str, scope: Scope, metrics: &[Metric]) -> Result<()> {
        self.metrics.insert((user.to_string(), scope), metrics.to_vec());
        Ok(())
    }

    fn cached_metrics(&self, user: &str, scope: Scope) -> Result<Vec<Metric>> {
        Ok(self.metrics.get(&(user.to_string(), scope)).cloned().unwrap_or_default())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::metrics::{MetricType, MetricValue};
    use crate::models::{AssetClass, FlowDirection, FlowType};
    use rust_decimal_macros::dec;

    pub fn date(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    pub fn sample_dataset() -> Dataset {
        let mut inv = Investment::new(Platform::BienPreter, Some("C1".into()), "Atelier", "Martin", dec!(10000), date(2023, 1, 15));
        inv.annual_rate = Some(dec!(9.5));
        inv.set_duration(Some(36));
        inv.expected_end_date = Some(date(2026, 1, 15));

        let mut flow = CashFlow::new(Platform::BienPreter, FlowType::Repayment, FlowDirection::In, dec!(500), date(2023, 7, 15), "Échéance")
            .with_tax(dec!(150))
            .with_split(dec!(0), dec!(500), Allocation::Estimated);
        flow.investment_id = Some(inv.id);

        let position = PortfolioPosition {
            platform: Platform::Pea,
            isin: "FR0010315770".into(),
            asset_name: "AMUNDI MSCI WORLD".into(),
            asset_class: AssetClass::Etf,
            quantity: dec!(12),
            current_price: dec!(450.25),
            market_value: dec!(5403.00),
            portfolio_share: Some(dec!(87.5)),
            valuation_date: date(2024, 3, 31),
        };
        let balance = LiquidityBalance { platform: Platform::Pea, balance_date: date(2024, 3, 31), amount: dec!(771.40) };

        Dataset { investments: vec![inv], cash_flows: vec![flow], positions: vec![position], liquidity: vec![balance] }
    }

    pub fn sample_metrics() -> Vec<Metric> {
        vec![
            Metric::new(MetricType::TotalInvested, MetricValue::value(10000.0)),
            Metric::new(MetricType::AnnualizedReturn, MetricValue::NoConvergence { iterations: 600 }),
            Metric::new(MetricType::Concentration, MetricValue::value(10000.0))
                .with_payload(serde_json::json!({"issuer_count": 1})),
        ]
    }

    #[test]
    fn test_validation_rejects_inconsistent_records() {
        let data = sample_dataset();
        assert_eq!(validate_investment(&data.investments[0]), None);
        assert_eq!(validate_cash_flow(&data.cash_flows[0]), None);

        let mut inv = data.investments[0].clone();
        inv.remaining_capital = dec!(1);
        assert!(validate_investment(&inv).is_some());

        let mut flow = data.cash_flows[0].clone();
        flow.net_amount = dec!(500);
        assert_eq!(validate_cash_flow(&flow), None);
        flow.capital_amount = dec!(100);
        assert!(validate_cash_flow(&flow).is_some());
    }

    #[test]
    fn test_memory_store_round_trip_and_idempotence() {
        let mut store = MemoryStore::new();
        let data = sample_dataset();
        store.save_dataset("alice", &data).unwrap();
        store.save_dataset("alice", &data).unwrap();

        let loaded = store.load_dataset("alice").unwrap();
        assert_eq!(loaded, data);
        assert!(store.load_dataset("bob").unwrap().is_empty());
    }

    #[test]
    fn test_memory_store_replaces_snapshot() {
        let mut store = MemoryStore::new();
        let data = sample_dataset();
        store.save_dataset("alice", &data).unwrap();
        store.replace_positions("alice", Platform::Pea, date(2024, 3, 31), &[]).unwrap();
        assert!(store.load_dataset("alice").unwrap().positions.is_empty());
    }

    #[test]
    fn test_memory_metric_cache() {
        let mut store = MemoryStore::new();
        store.store_metrics("alice", Scope::Global, &sample_metrics()).unwrap();
        assert_eq!(store.cached_metrics("alice", Scope::Global).unwrap(), sample_metrics());
        assert!(store.cached_metrics("alice", Scope::Platform(Platform::Lpb)).unwrap().is_empty());
    }
}
