//! Capital/interest split of repayments that arrive without one.

use rust_decimal::Decimal;

use crate::config::AllocationPolicy;
use crate::models::{Allocation, CashFlow, FlowType, Investment};

/// Capital share of each payment under a constant-share schedule:
/// invested / (invested + simple interest over the duration).
fn pro_rata_share(inv: &Investment) -> Option<Decimal> {
    let rate = inv.annual_rate?;
    let months = Decimal::from(inv.duration_months?);
    let interest = inv.invested_amount * rate / Decimal::ONE_HUNDRED * months / Decimal::from(12);
    let total = inv.invested_amount + interest;
    if total <= Decimal::ZERO {
        return None;
    }
    Some(inv.invested_amount / total)
}

/// Capital returned by a flow, whatever its origin.
pub(crate) fn capital_of(flow: &CashFlow) -> Decimal {
    match flow.flow_type {
        FlowType::Repayment => flow.capital_amount,
        FlowType::Sale => flow.gross_amount,
        _ => Decimal::ZERO,
    }
}

fn needs_split(flow: &CashFlow) -> bool {
    flow.flow_type == FlowType::Repayment
        && flow.allocation == Allocation::NotApplicable
        && flow.capital_amount.is_zero()
        && flow.interest_amount.is_zero()
}

/// Split the unallocated repayments of one investment. `order` indexes
/// `flows` in date order. Returns how many flows were estimated.
pub(crate) fn ventilate(inv: &Investment, flows: &mut [CashFlow], order: &[usize], policy: AllocationPolicy) -> usize {
    let share = match policy {
        AllocationPolicy::ProRata => pro_rata_share(inv),
        _ => None,
    };
    let mut attributed = Decimal::ZERO;
    let mut estimated = 0;

    for &i in order {
        let flow = &mut flows[i];
        if !needs_split(flow) {
            attributed += capital_of(flow);
            continue;
        }
        let outstanding = (inv.invested_amount - attributed).max(Decimal::ZERO);
        let gross = flow.gross_amount;
        let capital = match (policy, share) {
            (AllocationPolicy::InterestOnly, _) => Decimal::ZERO,
            (AllocationPolicy::ProRata, Some(share)) => (gross * share).round_dp(2).min(outstanding),
            // bullet, or pro rata without rate/duration: capital comes back in
            // the first payment large enough to cover it
            _ if gross >= outstanding => outstanding,
            _ => Decimal::ZERO,
        };
        flow.capital_amount = capital;
        flow.interest_amount = gross - capital;
        flow.allocation = Allocation::Estimated;
        attributed += capital;
        estimated += 1;
    }
    estimated
}
