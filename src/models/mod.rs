//! Canonical records produced by ingestion and consumed by the metrics engine.
//!
//! Flow directions are seen from the investor's wallet: a deposit onto a
//! platform leaves the wallet (`Out`), a repayment comes back (`In`).

use chrono::NaiveDate;
use once_cell::sync::Lazy;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::normalize::{fold_key, format_amount};

/// Namespace for deterministic record ids (UUID v5 over natural keys).
static RECORD_NAMESPACE: Lazy<Uuid> =
    Lazy::new(|| Uuid::new_v5(&Uuid::NAMESPACE_URL, b"patrimoine:records"));

// =============================================================================
// Enums
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Platform {
    Lpb,
    #[serde(rename = "bienpreter")]
    BienPreter,
    Homunity,
    #[serde(rename = "pretup")]
    PretUp,
    AssuranceVie,
    Pea,
}

impl Platform {
    pub const ALL: [Platform; 6] = [
        Platform::Lpb,
        Platform::BienPreter,
        Platform::Homunity,
        Platform::PretUp,
        Platform::AssuranceVie,
        Platform::Pea,
    ];

    pub fn key(&self) -> &'static str {
        match self {
            Self::Lpb => "lpb",
            Self::BienPreter => "bienpreter",
            Self::Homunity => "homunity",
            Self::PretUp => "pretup",
            Self::AssuranceVie => "assurance_vie",
            Self::Pea => "pea",
        }
    }

    pub fn display_name(&self) -> &'static str {
        match self {
            Self::Lpb => "La Première Brique",
            Self::BienPreter => "BienPrêter",
            Self::Homunity => "Homunity",
            Self::PretUp => "PretUp",
            Self::AssuranceVie => "Assurance Vie",
            Self::Pea => "PEA",
        }
    }

    /// Resolve a short key (`lpb`) exactly. Aliases live in the config.
    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.key() == key)
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentStatus {
    Active,
    Completed,
    Delayed,
    Defaulted,
    InProcedure,
}

impl InvestmentStatus {
    /// Status changes only move forward.
    pub fn can_transition_to(self, next: InvestmentStatus) -> bool {
        use InvestmentStatus::*;
        if self == next {
            return true;
        }
        match self {
            Active => matches!(next, Completed | Delayed | Defaulted | InProcedure),
            Delayed => matches!(next, Completed | Defaulted),
            InProcedure => matches!(next, Completed | Defaulted),
            Completed | Defaulted => false,
        }
    }

    pub fn is_open(self) -> bool {
        matches!(self, Self::Active | Self::Delayed | Self::InProcedure)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowType {
    Deposit,
    Withdrawal,
    Investment,
    Repayment,
    Interest,
    Dividend,
    Fee,
    Sale,
    Purchase,
    Tax,
    Other,
}

impl FlowType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Deposit => "deposit",
            Self::Withdrawal => "withdrawal",
            Self::Investment => "investment",
            Self::Repayment => "repayment",
            Self::Interest => "interest",
            Self::Dividend => "dividend",
            Self::Fee => "fee",
            Self::Sale => "sale",
            Self::Purchase => "purchase",
            Self::Tax => "tax",
            Self::Other => "other",
        }
    }

    /// Natural direction of the flow, when the type alone determines it.
    pub fn default_direction(&self) -> Option<FlowDirection> {
        match self {
            Self::Deposit | Self::Investment | Self::Fee | Self::Purchase | Self::Tax => {
                Some(FlowDirection::Out)
            }
            Self::Withdrawal | Self::Repayment | Self::Interest | Self::Dividend | Self::Sale => {
                Some(FlowDirection::In)
            }
            Self::Other => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FlowDirection {
    In,
    Out,
}

impl FlowDirection {
    pub fn from_sign(amount: Decimal) -> Self {
        if amount.is_sign_negative() {
            Self::Out
        } else {
            Self::In
        }
    }
}

/// How the capital/interest split of a flow was obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Allocation {
    Schedule,
    Estimated,
    NotApplicable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Low,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvestmentType {
    Crowdfunding,
    Crowdlending,
    LifeInsurance,
    Securities,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetClass {
    RealEstate,
    Business,
    Equity,
    Etf,
    Fund,
    Bond,
    Mixed,
}

/// Key an adapter attaches to a raw flow so the reconciler can find its investment.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum LinkKey {
    #[default]
    None,
    /// Folded (company, project) pair, matched exactly.
    Name { company: String, project: String },
    /// Platform contract number, matched against `Investment::platform_id`.
    Contract { number: String },
    /// Folded (promoter, project) tuple.
    PromoterProject { promoter: String, project: String },
    /// Folded free text that must mention exactly one project name.
    Mention { text: String },
}

impl LinkKey {
    pub fn name(company: &str, project: &str) -> Self {
        Self::Name { company: fold_key(company), project: fold_key(project) }
    }

    pub fn promoter_project(promoter: &str, project: &str) -> Self {
        Self::PromoterProject { promoter: fold_key(promoter), project: fold_key(project) }
    }

    pub fn is_none(&self) -> bool {
        matches!(self, Self::None)
    }
}

impl fmt::Display for LinkKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("-"),
            Self::Name { company, project } => write!(f, "{}/{}", company, project),
            Self::Contract { number } => write!(f, "contract {}", number),
            Self::PromoterProject { promoter, project } => write!(f, "{}/{}", promoter, project),
            Self::Mention { text } => write!(f, "\"{}\"", text),
        }
    }
}

// =============================================================================
// Records
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Investment {
    pub id: Uuid,
    pub platform: Platform,
    pub platform_id: Option<String>,
    pub investment_type: InvestmentType,
    pub asset_class: AssetClass,
    pub project_name: String,
    pub company_name: String,
    pub invested_amount: Decimal,
    /// Annual rate in percent
    pub annual_rate: Option<Decimal>,
    pub duration_months: Option<u32>,
    pub capital_repaid: Decimal,
    pub remaining_capital: Decimal,
    pub investment_date: NaiveDate,
    pub signature_date: Option<NaiveDate>,
    pub expected_end_date: Option<NaiveDate>,
    pub actual_end_date: Option<NaiveDate>,
    pub monthly_payment: Option<Decimal>,
    pub status: InvestmentStatus,
    pub is_delayed: bool,
    pub is_short_term: bool,
}

impl Investment {
    pub fn new(
        platform: Platform,
        platform_id: Option<String>,
        project_name: &str,
        company_name: &str,
        invested_amount: Decimal,
        investment_date: NaiveDate,
    ) -> Self {
        let platform_id = platform_id.filter(|id| !id.trim().is_empty());
        let mut investment = Self {
            id: Uuid::nil(),
            platform,
            platform_id,
            investment_type: InvestmentType::Crowdfunding,
            asset_class: AssetClass::RealEstate,
            project_name: project_name.trim().to_string(),
            company_name: company_name.trim().to_string(),
            invested_amount,
            annual_rate: None,
            duration_months: None,
            capital_repaid: Decimal::ZERO,
            remaining_capital: invested_amount,
            investment_date,
            signature_date: None,
            expected_end_date: None,
            actual_end_date: None,
            monthly_payment: None,
            status: InvestmentStatus::Active,
            is_delayed: false,
            is_short_term: false,
        };
        investment.id = Uuid::new_v5(&RECORD_NAMESPACE, investment.natural_key().as_bytes());
        investment
    }

    /// `platform|platform_id|folded project name`
    pub fn natural_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.platform.key(),
            self.platform_id.as_deref().unwrap_or(""),
            fold_key(&self.project_name)
        )
    }

    /// Apply a status change if it moves forward; returns whether it was applied.
    pub fn transition(&mut self, next: InvestmentStatus) -> bool {
        if self.status.can_transition_to(next) {
            self.status = next;
            if next == InvestmentStatus::Delayed {
                self.is_delayed = true;
            }
            true
        } else {
            log::debug!(
                "Refusing status change {:?} -> {:?} for {}",
                self.status,
                next,
                self.project_name
            );
            false
        }
    }

    pub fn set_capital_repaid(&mut self, repaid: Decimal) {
        self.capital_repaid = repaid.max(Decimal::ZERO).min(self.invested_amount);
        self.remaining_capital = (self.invested_amount - self.capital_repaid).max(Decimal::ZERO);
    }

    pub fn set_duration(&mut self, months: Option<u32>) {
        self.duration_months = months;
        self.is_short_term = matches!(months, Some(m) if m < 6);
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CashFlow {
    pub id: Uuid,
    pub platform: Platform,
    pub investment_id: Option<Uuid>,
    #[serde(default)]
    pub link: LinkKey,
    pub flow_type: FlowType,
    pub flow_direction: FlowDirection,
    pub gross_amount: Decimal,
    pub net_amount: Decimal,
    pub tax_amount: Decimal,
    pub capital_amount: Decimal,
    pub interest_amount: Decimal,
    pub allocation: Allocation,
    pub transaction_date: NaiveDate,
    pub description: String,
    pub quantity: Option<Decimal>,
    pub unit_price: Option<Decimal>,
    pub confidence: Confidence,
}

impl CashFlow {
    /// A flow whose net equals its gross; amounts are stored unsigned.
    pub fn new(
        platform: Platform,
        flow_type: FlowType,
        flow_direction: FlowDirection,
        gross_amount: Decimal,
        transaction_date: NaiveDate,
        description: &str,
    ) -> Self {
        let gross = gross_amount.abs();
        let mut flow = Self {
            id: Uuid::nil(),
            platform,
            investment_id: None,
            link: LinkKey::None,
            flow_type,
            flow_direction,
            gross_amount: gross,
            net_amount: gross,
            tax_amount: Decimal::ZERO,
            capital_amount: Decimal::ZERO,
            interest_amount: Decimal::ZERO,
            allocation: Allocation::NotApplicable,
            transaction_date,
            description: description.trim().to_string(),
            quantity: None,
            unit_price: None,
            confidence: Confidence::High,
        };
        flow.assign_id(0);
        flow
    }

    pub fn with_tax(mut self, tax: Decimal) -> Self {
        self.tax_amount = tax.abs();
        self.net_amount = self.gross_amount - self.tax_amount;
        self
    }

    pub fn with_link(mut self, link: LinkKey) -> Self {
        self.link = link;
        self
    }

    /// Record a known capital/interest split.
    pub fn with_split(mut self, capital: Decimal, interest: Decimal, allocation: Allocation) -> Self {
        self.capital_amount = capital.abs();
        self.interest_amount = interest.abs();
        self.allocation = allocation;
        self
    }

    pub fn is_orphan(&self) -> bool {
        self.investment_id.is_none()
    }

    /// Net amount signed from the investor's wallet.
    pub fn signed_net(&self) -> Decimal {
        match self.flow_direction {
            FlowDirection::In => self.net_amount,
            FlowDirection::Out => -self.net_amount,
        }
    }

    /// `net = gross - tax` within a cent.
    pub fn tax_consistent(&self) -> bool {
        (self.net_amount - (self.gross_amount - self.tax_amount)).abs() <= Decimal::new(1, 2)
    }

    pub fn natural_key(&self, occurrence: usize) -> String {
        format!(
            "{}|{}|{}|{}|{}|{}",
            self.platform.key(),
            self.transaction_date,
            self.flow_type.as_str(),
            format_amount(self.gross_amount),
            fold_key(&self.description),
            occurrence
        )
    }

    /// Derive the id from the natural key; `occurrence` separates identical rows.
    pub fn assign_id(&mut self, occurrence: usize) {
        self.id = Uuid::new_v5(&RECORD_NAMESPACE, self.natural_key(occurrence).as_bytes());
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PortfolioPosition {
    pub platform: Platform,
    pub isin: String,
    pub asset_name: String,
    pub asset_class: AssetClass,
    pub quantity: Decimal,
    pub current_price: Decimal,
    pub market_value: Decimal,
    pub portfolio_share: Option<Decimal>,
    pub valuation_date: NaiveDate,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LiquidityBalance {
    pub platform: Platform,
    pub balance_date: NaiveDate,
    pub amount: Decimal,
}

/// The canonical records of one user.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Dataset {
    pub investments: Vec<Investment>,
    pub cash_flows: Vec<CashFlow>,
    pub positions: Vec<PortfolioPosition>,
    pub liquidity: Vec<LiquidityBalance>,
}

impl Dataset {
    pub fn is_empty(&self) -> bool {
        self.investments.is_empty()
            && self.cash_flows.is_empty()
            && self.positions.is_empty()
            && self.liquidity.is_empty()
    }

    /// Records of a single platform.
    pub fn for_platform(&self, platform: Platform) -> Dataset {
        Dataset {
            investments: self.investments.iter().filter(|i| i.platform == platform).cloned().collect(),
            cash_flows: self.cash_flows.iter().filter(|f| f.platform == platform).cloned().collect(),
            positions: self.positions.iter().filter(|p| p.platform == platform).cloned().collect(),
            liquidity: self.liquidity.iter().filter(|l| l.platform == platform).cloned().collect(),
        }
    }

    /// Platforms with at least one record, in key order.
    pub fn platforms(&self) -> Vec<Platform> {
        let mut platforms: Vec<Platform> = self
            .investments
            .iter()
            .map(|i| i.platform)
            .chain(self.cash_flows.iter().map(|f| f.platform))
            .chain(self.positions.iter().map(|p| p.platform))
            .chain(self.liquidity.iter().map(|l| l.platform))
            .collect();
        platforms.sort();
        platforms.dedup();
        platforms
    }
}

// =============================================================================
// Reporting
// =============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Info,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Issue {
    pub severity: Severity,
    pub code: String,
    pub message: String,
    /// Sheet/row, file name or record key the issue refers to
    pub reference: Option<String>,
}

impl Issue {
    pub fn new(severity: Severity, code: &str, message: impl Into<String>) -> Self {
        Self { severity, code: code.to_string(), message: message.into(), reference: None }
    }

    pub fn info(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, code, message)
    }

    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, code, message)
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, code, message)
    }

    pub fn at(mut self, reference: impl Into<String>) -> Self {
        self.reference = Some(reference.into());
        self
    }

    pub fn from_error(err: &crate::errors::IngestError, severity: Severity) -> Self {
        Self::new(severity, err.code(), err.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileCounts {
    pub investments: usize,
    pub cashflows: usize,
    pub positions: usize,
    pub liquidity: usize,
    pub skipped: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileReport {
    pub file: String,
    pub platform: Option<Platform>,
    pub status: FileStatus,
    pub counts: FileCounts,
    pub issues: Vec<Issue>,
}

impl FileReport {
    /// Status follows the worst issue severity.
    pub fn new(file: String, platform: Option<Platform>, counts: FileCounts, issues: Vec<Issue>) -> Self {
        let status = match issues.iter().map(|i| i.severity).max() {
            Some(Severity::Error) => FileStatus::Error,
            Some(Severity::Warning) => FileStatus::Warning,
            _ => FileStatus::Success,
        };
        Self { file, platform, status, counts, issues }
    }
}
