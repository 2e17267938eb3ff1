//! Description-substring classification tables.
//!
//! Descriptions are folded (diacritics stripped, lower-cased) and padded with
//! one space on each side, so a pattern such as `" ir "` only matches the
//! whole word. The first matching rule wins.

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::models::{Confidence, FlowDirection, FlowType, Platform};
use crate::normalize::fold_key;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum RuleAction {
    Classify {
        flow_type: FlowType,
        /// Defaults to the natural direction of `flow_type`
        #[serde(default)]
        direction: Option<FlowDirection>,
    },
    /// Row is not a cash movement (closing statements, internal arbitrage)
    Ignore,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClassificationRule {
    /// Folded substrings; any one of them selects the rule
    pub contains: Vec<String>,
    #[serde(flatten)]
    pub action: RuleAction,
}

impl ClassificationRule {
    fn classify(patterns: &[&str], flow_type: FlowType) -> Self {
        Self {
            contains: patterns.iter().map(|p| p.to_string()).collect(),
            action: RuleAction::Classify { flow_type, direction: None },
        }
    }

    fn directed(patterns: &[&str], flow_type: FlowType, direction: FlowDirection) -> Self {
        Self {
            contains: patterns.iter().map(|p| p.to_string()).collect(),
            action: RuleAction::Classify { flow_type, direction: Some(direction) },
        }
    }

    fn ignore(patterns: &[&str]) -> Self {
        Self {
            contains: patterns.iter().map(|p| p.to_string()).collect(),
            action: RuleAction::Ignore,
        }
    }

    fn matches(&self, padded: &str) -> bool {
        self.contains.iter().any(|p| padded.contains(p.as_str()))
    }
}

/// Result of classifying one description.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Classification {
    Flow {
        flow_type: FlowType,
        direction: FlowDirection,
        confidence: Confidence,
    },
    Ignored,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RuleTable {
    pub rules: Vec<ClassificationRule>,
}

impl RuleTable {
    pub fn new(rules: Vec<ClassificationRule>) -> Self {
        Self { rules }
    }

    /// Classify a description. `signed_amount` decides the direction of
    /// `other` flows and of rules that leave it open.
    pub fn classify(&self, description: &str, signed_amount: Decimal) -> Classification {
        let padded = format!(" {} ", fold_key(description));
        for rule in &self.rules {
            if !rule.matches(&padded) {
                continue;
            }
            return match &rule.action {
                RuleAction::Ignore => Classification::Ignored,
                RuleAction::Classify { flow_type, direction } => Classification::Flow {
                    flow_type: *flow_type,
                    direction: direction
                        .or_else(|| flow_type.default_direction())
                        .unwrap_or_else(|| FlowDirection::from_sign(signed_amount)),
                    confidence: Confidence::High,
                },
            };
        }

        log::debug!("No classification rule for {:?}, falling back to other", description);
        Classification::Flow {
            flow_type: FlowType::Other,
            direction: FlowDirection::from_sign(signed_amount),
            confidence: Confidence::Low,
        }
    }

    /// Built-in table for a platform.
    pub fn defaults_for(platform: Platform) -> Self {
        use ClassificationRule as R;
        use FlowType::*;
        let rules = match platform {
            Platform::Lpb => vec![
                R::classify(&["remboursement mensualite"], Repayment),
                R::classify(&[" csg", " crds", " ir ", "prelevement", "impot sur le revenu"], Tax),
                R::classify(&["credit du compte"], Deposit),
                R::classify(&["souscription"], Investment),
                R::classify(&["retrait de l'epargne", "retrait"], Withdrawal),
                R::classify(&["remuneration", "code cadeau"], Interest),
                R::directed(&["annulation"], Other, FlowDirection::In),
            ],
            Platform::BienPreter => vec![
                R::classify(&["remboursement"], Repayment),
                R::classify(&["bonus"], Interest),
                R::classify(&["depot"], Deposit),
                R::classify(&["offre acceptee"], Investment),
                R::classify(&["retrait"], Withdrawal),
            ],
            Platform::Homunity => vec![
                R::classify(&["approvisionnement"], Deposit),
                R::classify(&["investissement", "souscription"], Investment),
                R::classify(&["remboursement", "transfert"], Repayment),
                R::classify(&["retrait"], Withdrawal),
            ],
            Platform::PretUp => vec![
                R::classify(&["echeance", "remboursement anticipe"], Repayment),
                R::classify(&["alimentation"], Deposit),
                R::classify(&["offre"], Investment),
                R::classify(&["retrait"], Withdrawal),
            ],
            Platform::AssuranceVie => vec![
                R::classify(&["dividende", "dividend", "coupon"], Dividend),
                R::classify(&["frais", " fee", "commission"], Fee),
                R::ignore(&["arrete", "cloture", "arbitrage", "transfer"]),
                R::classify(&["versement", "depot", "apport"], Deposit),
                R::classify(&["rachat"], Withdrawal),
            ],
            Platform::Pea => vec![
                R::classify(&["coupons", "dividende"], Dividend),
                R::classify(&["ach cpt", "achat"], Purchase),
                R::classify(&["vte cpt", "vente"], Sale),
                R::classify(&[" ttf", "taxe", "frais", "commission"], Fee),
                R::classify(&["investissement especes", "versement"], Deposit),
                R::classify(&["retrait", "rachat"], Withdrawal),
                R::directed(&["regularisation"], Other, FlowDirection::In),
            ],
        };
        Self::new(rules)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn flow_type_of(c: Classification) -> Option<FlowType> {
        match c {
            Classification::Flow { flow_type, .. } => Some(flow_type),
            Classification::Ignored => None,
        }
    }

    #[test]
    fn test_lpb_rules_are_accent_and_case_insensitive() {
        let table = RuleTable::defaults_for(Platform::Lpb);
        assert_eq!(flow_type_of(table.classify("CRÉDIT DU COMPTE", dec!(100))), Some(FlowType::Deposit));
        assert_eq!(flow_type_of(table.classify("Rémunération code cadeau", dec!(10))), Some(FlowType::Interest));
        assert_eq!(flow_type_of(table.classify("Remboursement mensualité - Les Pins", dec!(10))), Some(FlowType::Repayment));
        assert_eq!(flow_type_of(table.classify("IR", dec!(-3))), Some(FlowType::Tax));
        // "ir" inside a word is not the income-tax marker
        assert_eq!(flow_type_of(table.classify("Virement interne", dec!(-3))), Some(FlowType::Other));
    }

    #[test]
    fn test_unmatched_description_is_low_confidence_other() {
        let table = RuleTable::defaults_for(Platform::BienPreter);
        let c = table.classify("Régularisation diverse", dec!(-12.5));
        assert_eq!(
            c,
            Classification::Flow {
                flow_type: FlowType::Other,
                direction: FlowDirection::Out,
                confidence: Confidence::Low
            }
        );
    }

    #[test]
    fn test_ignore_rules() {
        let table = RuleTable::defaults_for(Platform::AssuranceVie);
        assert_eq!(table.classify("Arrêté annuel", dec!(0)), Classification::Ignored);
        assert_eq!(flow_type_of(table.classify("Versement libre", dec!(500))), Some(FlowType::Deposit));
    }

    #[test]
    fn test_pea_rules_give_directions() {
        let table = RuleTable::defaults_for(Platform::Pea);
        match table.classify("ACH CPT AMUNDI MSCI WORLD", dec!(1)) {
            Classification::Flow { flow_type, direction, .. } => {
                assert_eq!(flow_type, FlowType::Purchase);
                assert_eq!(direction, FlowDirection::Out);
            }
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(flow_type_of(table.classify("COUPONS TOTALENERGIES", dec!(1))), Some(FlowType::Dividend));
    }

    #[test]
    fn test_rule_table_deserializes() {
        let json = r#"[{"contains": ["loyer"], "action": "classify", "flow_type": "interest"},
                       {"contains": ["cloture"], "action": "ignore"}]"#;
        let table: RuleTable = serde_json::from_str(json).unwrap();
        assert_eq!(table.rules.len(), 2);
        assert_eq!(flow_type_of(table.classify("Loyer mars", dec!(1))), Some(FlowType::Interest));
    }
}
