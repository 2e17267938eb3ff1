//! Normalizer/Reconciler.
//!
//! Runs once per batch after every file has been parsed. It merges the raw
//! output of adapters and statements into the previously stored dataset:
//! upsert by natural key, link flows to investments, split repayments,
//! recompute capital, infer terminal dates and collect data-quality issues.

mod linking;
mod ventilation;

pub use linking::LinkIndex;

use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use uuid::Uuid;

use crate::adapters::AdapterOutput;
use crate::config::IngestConfig;
use crate::models::{
    CashFlow, Confidence, Dataset, Investment, InvestmentStatus, Issue, LiquidityBalance, Platform,
    PortfolioPosition, Severity,
};
use crate::store::{validate_cash_flow, validate_investment};

/// Tolerance when comparing a platform's remaining capital with ours.
const REMAINING_TOLERANCE: Decimal = Decimal::ONE;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DataQuality {
    /// Flows whose link key matched no investment
    pub orphan_flows: usize,
    pub ambiguous_links: usize,
    /// Investments without any linked flow
    pub unlinked_investments: usize,
    pub estimated_allocations: usize,
    pub tax_inconsistencies: usize,
    pub low_confidence_flows: usize,
    /// Records dropped because the store would refuse them
    pub rejected_records: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ReconcileOutcome {
    pub dataset: Dataset,
    pub issues: Vec<Issue>,
    pub quality: DataQuality,
    pub new_investments: usize,
    pub new_cash_flows: usize,
}

pub struct Reconciler<'a> {
    config: &'a IngestConfig,
    as_of: NaiveDate,
}

// =============================================================================
// Helpers
// =============================================================================

/// Give identical rows of one file distinct, stable ids.
fn assign_occurrences(flows: &mut [CashFlow]) {
    let mut seen: HashMap<String, usize> = HashMap::new();
    for flow in flows.iter_mut() {
        let n = seen.entry(flow.natural_key(0)).or_insert(0);
        flow.assign_id(*n);
        *n += 1;
    }
}

/// Incoming fields win; status only moves forward, delay flags stick.
fn merge_investment(current: &mut Investment, incoming: Investment) {
    let target = incoming.status;
    let status = current.status;
    let is_delayed = current.is_delayed || incoming.is_delayed;
    let actual_end_date = incoming.actual_end_date.or(current.actual_end_date);
    *current = Investment { status, is_delayed, actual_end_date, ..incoming };
    current.transition(target);
}

/// Newest snapshot per platform; positions of older snapshots are dropped.
fn supersede_positions(existing: Vec<PortfolioPosition>, incoming: Vec<PortfolioPosition>) -> Vec<PortfolioPosition> {
    let mut latest: BTreeMap<Platform, NaiveDate> = BTreeMap::new();
    for p in existing.iter().chain(incoming.iter()) {
        let date = latest.entry(p.platform).or_insert(p.valuation_date);
        if p.valuation_date > *date {
            *date = p.valuation_date;
        }
    }
    let mut kept: BTreeMap<(Platform, String), PortfolioPosition> = BTreeMap::new();
    for p in existing.into_iter().chain(incoming) {
        if latest.get(&p.platform) == Some(&p.valuation_date) {
            kept.insert((p.platform, p.isin.clone()), p);
        }
    }
    kept.into_values().collect()
}

/// One balance per (platform, date), last write wins.
fn merge_liquidity(existing: Vec<LiquidityBalance>, incoming: Vec<LiquidityBalance>) -> Vec<LiquidityBalance> {
    let mut by_key: BTreeMap<(Platform, NaiveDate), LiquidityBalance> = BTreeMap::new();
    for balance in existing.into_iter().chain(incoming) {
        by_key.insert((balance.platform, balance.balance_date), balance);
    }
    by_key.into_values().collect()
}

/// Reason the store would refuse an incoming record, reported as an error
/// issue so the summary never counts a record that is not stored.
fn rejection(reason: Option<String>, what: &str, reference: String, quality: &mut DataQuality, issues: &mut Vec<Issue>) -> bool {
    let Some(reason) = reason else { return false };
    log::warn!("Rejecting {} {}: {}", what, reference, reason);
    issues.push(Issue::error("invalid_record", format!("{} rejected: {}", what, reason)).at(reference));
    quality.rejected_records += 1;
    true
}

// =============================================================================
// Reconciler
// =============================================================================

impl<'a> Reconciler<'a> {
    pub fn new(config: &'a IngestConfig, as_of: NaiveDate) -> Self {
        Self { config, as_of }
    }

    pub fn reconcile(&self, existing: Dataset, batch: Vec<AdapterOutput>) -> ReconcileOutcome {
        let mut issues = Vec::new();
        let mut quality = DataQuality::default();

        let mut investments = existing.investments;
        let mut inv_slots: HashMap<Uuid, usize> = investments.iter().enumerate().map(|(i, inv)| (inv.id, i)).collect();
        let mut flows = existing.cash_flows;
        let mut flow_ids: HashSet<Uuid> = flows.iter().map(|f| f.id).collect();

        let mut touched: HashSet<Uuid> = HashSet::new();
        let mut reported: HashMap<Uuid, Decimal> = HashMap::new();
        let mut positions = Vec::new();
        let mut liquidity = Vec::new();
        let mut new_investments = 0;
        let mut new_cash_flows = 0;

        for mut output in batch {
            for inv in output.investments {
                if rejection(validate_investment(&inv), "investment", inv.natural_key(), &mut quality, &mut issues) {
                    continue;
                }
                touched.insert(inv.id);
                match inv_slots.get(&inv.id) {
                    Some(&slot) => merge_investment(&mut investments[slot], inv),
                    None => {
                        inv_slots.insert(inv.id, investments.len());
                        investments.push(inv);
                        new_investments += 1;
                    }
                }
            }

            assign_occurrences(&mut output.cash_flows);
            for flow in output.cash_flows {
                if rejection(validate_cash_flow(&flow), "cash flow", flow.natural_key(0), &mut quality, &mut issues) {
                    continue;
                }
                // a stored flow is immutable; only its link may still change
                if flow_ids.insert(flow.id) {
                    flows.push(flow);
                    new_cash_flows += 1;
                }
            }

            reported.extend(output.reported_remaining);
            positions.extend(output.positions);
            liquidity.extend(output.liquidity);
        }

        self.resolve_links(&investments, &mut flows, &mut issues, &mut quality);

        let mut linked: HashMap<Uuid, Vec<usize>> = HashMap::new();
        for (i, flow) in flows.iter().enumerate() {
            if let Some(id) = flow.investment_id {
                linked.entry(id).or_default().push(i);
            }
        }

        for inv in investments.iter_mut() {
            let Some(order) = linked.get_mut(&inv.id) else {
                inv.set_capital_repaid(Decimal::ZERO);
                quality.unlinked_investments += 1;
                if touched.contains(&inv.id) {
                    issues.push(
                        Issue::warning("no_cash_flows", format!("no cash flow linked to {}", inv.project_name))
                            .at(inv.natural_key()),
                    );
                }
                continue;
            };
            order.sort_by_key(|&i| (flows[i].transaction_date, flows[i].id));

            let policy = self.config.allocation_for(inv.platform);
            quality.estimated_allocations += ventilation::ventilate(inv, &mut flows, order, policy);
            self.update_capital(inv, &flows, order, &mut issues);
        }

        for (id, remaining) in &reported {
            let Some(inv) = inv_slots.get(id).map(|&slot| &investments[slot]) else { continue };
            if (inv.remaining_capital - *remaining).abs() > REMAINING_TOLERANCE {
                issues.push(
                    Issue::warning(
                        "remaining_mismatch",
                        format!(
                            "{}: platform reports {} remaining, flows give {}",
                            inv.project_name, remaining, inv.remaining_capital
                        ),
                    )
                    .at(inv.natural_key()),
                );
            }
        }

        quality.tax_inconsistencies = flows.iter().filter(|f| !f.tax_consistent()).count();
        quality.low_confidence_flows = flows.iter().filter(|f| f.confidence == Confidence::Low).count();

        let dataset = Dataset {
            investments,
            cash_flows: flows,
            positions: supersede_positions(existing.positions, positions),
            liquidity: merge_liquidity(existing.liquidity, liquidity),
        };

        log::info!(
            "Reconciled {} investments ({} new), {} cash flows ({} new), {} orphan(s), {} estimated split(s)",
            dataset.investments.len(),
            new_investments,
            dataset.cash_flows.len(),
            new_cash_flows,
            quality.orphan_flows,
            quality.estimated_allocations
        );

        ReconcileOutcome { dataset, issues, quality, new_investments, new_cash_flows }
    }

    fn resolve_links(
        &self,
        investments: &[Investment],
        flows: &mut [CashFlow],
        issues: &mut Vec<Issue>,
        quality: &mut DataQuality,
    ) {
        let index = LinkIndex::build(investments);
        for flow in flows.iter_mut().filter(|f| f.investment_id.is_none() && !f.link.is_none()) {
            match index.resolve(flow.platform, &flow.link) {
                Ok(Some(id)) => flow.investment_id = Some(id),
                Ok(None) => {
                    quality.orphan_flows += 1;
                    issues.push(
                        Issue::info("orphan_flow", format!("no {} investment for {}", flow.platform, flow.link))
                            .at(flow.description.clone()),
                    );
                }
                Err(e) => {
                    quality.ambiguous_links += 1;
                    quality.orphan_flows += 1;
                    issues.push(Issue::from_error(&e, Severity::Warning).at(flow.description.clone()));
                }
            }
        }
    }

    /// Capital from the linked flows, then terminal date and status.
    fn update_capital(&self, inv: &mut Investment, flows: &[CashFlow], order: &[usize], issues: &mut Vec<Issue>) {
        let cent = Decimal::new(1, 2);
        let mut cumulative = Decimal::ZERO;
        let mut terminal = None;
        for &i in order {
            cumulative += ventilation::capital_of(&flows[i]);
            if terminal.is_none() && inv.invested_amount > Decimal::ZERO && cumulative >= inv.invested_amount - cent {
                terminal = Some(flows[i].transaction_date);
            }
        }

        if cumulative > inv.invested_amount + cent {
            issues.push(
                Issue::warning(
                    "capital_exceeds_invested",
                    format!("{}: {} repaid on {} invested", inv.project_name, cumulative, inv.invested_amount),
                )
                .at(inv.natural_key()),
            );
        }
        inv.set_capital_repaid(cumulative);

        if let Some(date) = terminal {
            if inv.actual_end_date.is_none() {
                inv.actual_end_date = Some(date);
            }
            inv.transition(InvestmentStatus::Completed);
        }

        match (inv.actual_end_date, inv.expected_end_date) {
            (Some(actual), Some(expected)) if actual > expected => inv.is_delayed = true,
            (None, Some(expected)) if inv.status.is_open() && expected < self.as_of => inv.is_delayed = true,
            _ => {}
        }
    }
}
