//! Link resolution: from the key an adapter attached to a flow to the id of
//! exactly one investment.

use std::collections::HashMap;
use uuid::Uuid;

use crate::errors::{IngestError, Result};
use crate::models::{Investment, LinkKey, Platform};
use crate::normalize::fold_key;

#[derive(Debug, Default)]
pub struct LinkIndex {
    by_name: HashMap<(Platform, String, String), Vec<Uuid>>,
    by_project: HashMap<(Platform, String), Vec<Uuid>>,
    by_contract: HashMap<(Platform, String), Vec<Uuid>>,
    /// Folded project names per platform, for mention matching
    projects: HashMap<Platform, Vec<(String, Uuid)>>,
}

fn push_unique(ids: &mut Vec<Uuid>, id: Uuid) {
    if !ids.contains(&id) {
        ids.push(id);
    }
}

impl LinkIndex {
    pub fn build(investments: &[Investment]) -> Self {
        let mut index = Self::default();
        for inv in investments {
            let company = fold_key(&inv.company_name);
            let project = fold_key(&inv.project_name);
            push_unique(
                index.by_name.entry((inv.platform, company, project.clone())).or_default(),
                inv.id,
            );
            push_unique(index.by_project.entry((inv.platform, project.clone())).or_default(), inv.id);
            if let Some(pid) = &inv.platform_id {
                push_unique(
                    index.by_contract.entry((inv.platform, pid.trim().to_string())).or_default(),
                    inv.id,
                );
            }
            if !project.is_empty() {
                index.projects.entry(inv.platform).or_default().push((project, inv.id));
            }
        }
        index
    }

    fn single(key: &LinkKey, ids: &[Uuid]) -> Result<Option<Uuid>> {
        match ids {
            [] => Ok(None),
            [id] => Ok(Some(*id)),
            _ => Err(IngestError::LinkingAmbiguous { key: key.to_string(), candidates: ids.len() }),
        }
    }

    /// `Ok(None)` when nothing matches, `LinkingAmbiguous` when several do.
    pub fn resolve(&self, platform: Platform, key: &LinkKey) -> Result<Option<Uuid>> {
        match key {
            LinkKey::None => Ok(None),
            LinkKey::Contract { number } => {
                let ids = self.by_contract.get(&(platform, number.trim().to_string()));
                Self::single(key, ids.map(Vec::as_slice).unwrap_or_default())
            }
            LinkKey::Name { company, project } | LinkKey::PromoterProject { promoter: company, project } => {
                let exact = self.by_name.get(&(platform, company.clone(), project.clone()));
                match exact {
                    Some(ids) => Self::single(key, ids),
                    // company spelled differently between the two sheets
                    None => Self::single(
                        key,
                        self.by_project
                            .get(&(platform, project.clone()))
                            .map(Vec::as_slice)
                            .unwrap_or_default(),
                    ),
                }
            }
            LinkKey::Mention { text } => {
                let candidates: Vec<&(String, Uuid)> = self
                    .projects
                    .get(&platform)
                    .map(|p| p.iter().filter(|(name, _)| text.contains(name.as_str())).collect())
                    .unwrap_or_default();
                // "boulangerie" loses against "boulangerie dupont" when both appear
                let mut ids = Vec::new();
                for (name, id) in &candidates {
                    let shadowed = candidates
                        .iter()
                        .any(|(other, _)| other.len() > name.len() && other.contains(name.as_str()));
                    if !shadowed {
                        push_unique(&mut ids, *id);
                    }
                }
                Self::single(key, &ids)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal_macros::dec;

    fn inv(platform: Platform, pid: Option<&str>, project: &str, company: &str) -> Investment {
        Investment::new(
            platform,
            pid.map(str::to_string),
            project,
            company,
            dec!(1000),
            NaiveDate::from_ymd_opt(2023, 1, 1).unwrap(),
        )
    }

    #[test]
    fn test_resolve_by_each_key() {
        let investments = vec![
            inv(Platform::BienPreter, Some("BP-1"), "Atelier", "Martin"),
            inv(Platform::Homunity, None, "Les Terrasses", "Promo Sud"),
            inv(Platform::PretUp, Some("OF-1"), "Boulangerie", "A"),
            inv(Platform::PretUp, Some("OF-2"), "Boulangerie Dupont", "B"),
        ];
        let index = LinkIndex::build(&investments);

        let contract = LinkKey::Contract { number: "BP-1".into() };
        assert_eq!(index.resolve(Platform::BienPreter, &contract).unwrap(), Some(investments[0].id));
        // keys are scoped to their platform
        assert_eq!(index.resolve(Platform::Lpb, &contract).unwrap(), None);

        let tuple = LinkKey::promoter_project("PROMO SUD", "les terrasses");
        assert_eq!(index.resolve(Platform::Homunity, &tuple).unwrap(), Some(investments[1].id));

        let mention = LinkKey::Mention { text: "echeance boulangerie dupont".into() };
        assert_eq!(index.resolve(Platform::PretUp, &mention).unwrap(), Some(investments[3].id));
        let unknown = LinkKey::Mention { text: "echeance garage".into() };
        assert_eq!(index.resolve(Platform::PretUp, &unknown).unwrap(), None);
    }

    #[test]
    fn test_ambiguous_key() {
        let investments = vec![
            inv(Platform::Lpb, None, "Tour A", "Tour A"),
            inv(Platform::Lpb, Some("X"), "Tour A", "Tour A"),
        ];
        let index = LinkIndex::build(&investments);
        let err = index.resolve(Platform::Lpb, &LinkKey::name("Tour A", "Tour A")).unwrap_err();
        assert_eq!(err.code(), "linking_ambiguous");
    }
}
