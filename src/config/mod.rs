//! Immutable ingestion configuration.
//!
//! Every table the adapters, the statement extractor and the metrics engine
//! consult (platform aliases, rule tables, allocation policies, solver seeds,
//! thresholds) lives here and is passed down by reference. A JSON file may
//! override any subset of fields; missing fields keep their defaults.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::errors::{IngestError, Result};
use crate::models::Platform;
use crate::normalize::fold_key;
use crate::rules::RuleTable;

/// How a repayment without a schedule entry is split into capital and interest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AllocationPolicy {
    /// Constant share of each payment goes to capital: invested / total repayable
    ProRata,
    /// Payments are interest until the final one, which returns the capital
    Bullet,
    /// Never infer capital; everything is interest
    InterestOnly,
}

/// What to do with a valuation statement whose date cannot be resolved.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValuationFallback {
    Skip,
    /// Use the file modification time, flagged as low confidence
    FileModified,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct StatementConfig {
    pub extraction_timeout_secs: u64,
    /// Transaction amounts above this are treated as misreads
    pub max_amount: Decimal,
    pub liquidity_markers: Vec<String>,
    pub valuation_fallback: ValuationFallback,
}

impl Default for StatementConfig {
    fn default() -> Self {
        Self {
            extraction_timeout_secs: 30,
            max_amount: Decimal::new(10_000_000, 0),
            liquidity_markers: vec![
                "SOLDE LIQUIDITES".into(),
                "TOTAL LIQUIDITES".into(),
                "LIQUIDITES".into(),
                "SOLDE ESPECES".into(),
                "ESPECES DISPONIBLES".into(),
                "SOLDE DISPONIBLE".into(),
            ],
            valuation_fallback: ValuationFallback::Skip,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MaturityWeights {
    pub repaid_share: f64,
    pub near_term_liquidity: f64,
    pub reinvestment: f64,
}

impl Default for MaturityWeights {
    fn default() -> Self {
        Self { repaid_share: 1.0, near_term_liquidity: 1.0, reinvestment: 1.0 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    pub primary_seed: f64,
    pub fallback_seeds: Vec<f64>,
    pub max_iterations: usize,
    pub tolerance: f64,
    pub rate_floor: f64,
    pub rate_ceiling: f64,
    pub horizon_months: u32,
    pub hhi_moderate: f64,
    pub hhi_high: f64,
    pub maturity_weights: MaturityWeights,
    /// Annual rate the portfolio return is compared against
    pub benchmark_rate: f64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            primary_seed: 0.1,
            fallback_seeds: vec![0.01, 0.05, 0.1, 0.2, -0.5],
            max_iterations: 100,
            tolerance: 1e-10,
            rate_floor: -0.99,
            rate_ceiling: 10.0,
            horizon_months: 24,
            hhi_moderate: 1500.0,
            hhi_high: 2500.0,
            maturity_weights: MaturityWeights::default(),
            benchmark_rate: 0.03,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Folded alias -> platform, used to route files by name
    pub platform_aliases: BTreeMap<String, Platform>,
    pub rules: BTreeMap<Platform, RuleTable>,
    pub allocation: BTreeMap<Platform, AllocationPolicy>,
    pub statement: StatementConfig,
    pub metrics: MetricsConfig,
}

impl Default for IngestConfig {
    fn default() -> Self {
        let aliases = [
            ("lpb", Platform::Lpb),
            ("la premiere brique", Platform::Lpb),
            ("bienpreter", Platform::BienPreter),
            ("bien preter", Platform::BienPreter),
            ("homunity", Platform::Homunity),
            ("pretup", Platform::PretUp),
            ("assurance_vie", Platform::AssuranceVie),
            ("assurance vie", Platform::AssuranceVie),
            ("av", Platform::AssuranceVie),
            ("linxea", Platform::AssuranceVie),
            ("pea", Platform::Pea),
        ];
        Self {
            platform_aliases: aliases.iter().map(|(k, p)| (k.to_string(), *p)).collect(),
            rules: Platform::ALL
                .iter()
                .map(|p| (*p, RuleTable::defaults_for(*p)))
                .collect(),
            allocation: [
                (Platform::Lpb, AllocationPolicy::Bullet),
                (Platform::BienPreter, AllocationPolicy::ProRata),
                (Platform::Homunity, AllocationPolicy::Bullet),
                (Platform::PretUp, AllocationPolicy::ProRata),
            ]
            .into_iter()
            .collect(),
            statement: StatementConfig::default(),
            metrics: MetricsConfig::default(),
        }
    }
}

impl IngestConfig {
    /// Default location: `<config dir>/patrimoine/config.json`.
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("patrimoine").join("config.json"))
    }

    /// Load from an explicit file, or from the default location when it
    /// exists, or fall back to built-in defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(p) => p.to_path_buf(),
            None => match Self::default_path().filter(|p| p.exists()) {
                Some(p) => p,
                None => {
                    log::debug!("No configuration file, using defaults");
                    return Ok(Self::default());
                }
            },
        };
        log::info!("Loading configuration from {}", path.display());
        let raw = std::fs::read_to_string(&path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let m = &self.metrics;
        if m.rate_floor <= -1.0 || m.rate_floor >= m.rate_ceiling {
            return Err(IngestError::Config(format!(
                "rate domain ({}, {}) is invalid",
                m.rate_floor, m.rate_ceiling
            )));
        }
        if m.max_iterations == 0 {
            return Err(IngestError::Config("max_iterations must be positive".into()));
        }
        if m.hhi_moderate > m.hhi_high {
            return Err(IngestError::Config("hhi_moderate exceeds hhi_high".into()));
        }
        Ok(())
    }

    /// Rule table for a platform; an empty table classifies everything as `other`.
    pub fn rules_for(&self, platform: Platform) -> &RuleTable {
        static EMPTY: RuleTable = RuleTable { rules: Vec::new() };
        self.rules.get(&platform).unwrap_or(&EMPTY)
    }

    pub fn allocation_for(&self, platform: Platform) -> AllocationPolicy {
        self.allocation
            .get(&platform)
            .copied()
            .unwrap_or(AllocationPolicy::InterestOnly)
    }

    /// Resolve a platform from a free-form name (`"La Première Brique"`, `"AV"`).
    pub fn platform_for_alias(&self, name: &str) -> Option<Platform> {
        let folded = fold_key(name);
        self.platform_aliases.get(&folded).copied()
    }

    /// Guess a platform from a file name, longest alias first.
    pub fn platform_for_file_name(&self, file_name: &str) -> Option<Platform> {
        let folded = fold_key(&file_name.replace(['_', '-', '.'], " "));
        let words: Vec<&str> = folded.split(' ').collect();
        let mut aliases: Vec<(&String, &Platform)> = self.platform_aliases.iter().collect();
        aliases.sort_by_key(|(alias, _)| std::cmp::Reverse(alias.len()));
        aliases
            .into_iter()
            .find(|(alias, _)| {
                let alias = alias.replace('_', " ");
                if alias.contains(' ') {
                    folded.contains(alias.as_str())
                } else {
                    words.contains(&alias.as_str())
                }
            })
            .map(|(_, platform)| *platform)
    }
}
