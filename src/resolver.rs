//! Canonical key selection and alias deduplication.
//!
//! Every entity gets exactly one [CanonicalKey]. The remaining identifiers a record carries
//! become aliases, and the [AliasTable] guarantees that no alias points at two entities: the
//! first claim wins and later claims are recorded as [ResolutionConflict]s.

use std::collections::{BTreeMap, BTreeSet};

use crate::{
    codec::{
        record::{RawCategory, RawPartner, RawPatent, RawRecord},
        ResolutionConflict,
    },
    namespace::{self, identifier_for_resource},
    properties::{
        CanonicalEntity, CanonicalKey, DrugAttributes, EntityData, Identifier,
        PolypeptideAttributes, RelationAttributes, RelationKind,
    },
};

/// Outcome of asking the [AliasTable] to map an identifier to a key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Claim {
    /// The identifier was unknown and now maps to the key.
    Accepted,
    /// The identifier already mapped to the same key, or is the key itself.
    AlreadyHeld,
    /// The identifier belongs to another canonical key, which keeps it.
    Conflict(CanonicalKey),
}

/// alias → canonical key, plus every canonical key handed out so far in this run.
#[derive(Debug, Clone, Default)]
pub struct AliasTable {
    aliases: BTreeMap<Identifier, CanonicalKey>,
    keys: BTreeSet<CanonicalKey>,
}

impl AliasTable {
    pub fn new() -> Self {
        AliasTable::default()
    }

    pub fn register_key(&mut self, key: &CanonicalKey) {
        if !self.keys.contains(key) {
            self.keys.insert(key.clone());
        }
    }

    pub fn is_key(&self, id: &Identifier) -> bool {
        self.keys.contains(&CanonicalKey(id.clone()))
    }

    pub fn claim(&mut self, alias: &Identifier, key: &CanonicalKey) -> Claim {
        if alias == key.as_identifier() {
            return Claim::AlreadyHeld;
        }
        if self.is_key(alias) {
            return Claim::Conflict(CanonicalKey(alias.clone()));
        }
        match self.aliases.get(alias) {
            Some(owner) if owner == key => Claim::AlreadyHeld,
            Some(owner) => Claim::Conflict(owner.clone()),
            None => {
                self.aliases.insert(alias.clone(), key.clone());
                Claim::Accepted
            }
        }
    }

    /// Canonical keys resolve to themselves; aliases resolve to their owner.
    pub fn lookup(&self, id: &Identifier) -> Option<CanonicalKey> {
        if self.is_key(id) {
            return Some(CanonicalKey(id.clone()));
        }
        self.aliases.get(id).cloned()
    }

    pub fn alias_count(&self) -> usize {
        self.aliases.len()
    }

    pub fn key_count(&self) -> usize {
        self.keys.len()
    }
}

/// A relationship as resolved from one record. The target is still an [Identifier] since
/// interaction partners may not have been seen yet.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct PendingRelationship {
    pub source: CanonicalKey,
    pub target: Identifier,
    pub kind: RelationKind,
    pub attributes: RelationAttributes,
    pub record_index: usize,
}

/// Drug-level annotations stored in their own tables.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DrugAnnotations {
    pub groups: BTreeSet<String>,
    pub categories: Vec<RawCategory>,
    pub atc_codes: BTreeSet<String>,
    pub synonyms: BTreeSet<String>,
    pub patents: Vec<RawPatent>,
}

/// Everything the populator needs to commit one record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Resolution {
    pub record_index: usize,
    pub drug: CanonicalEntity,
    pub partners: Vec<CanonicalEntity>,
    pub annotations: DrugAnnotations,
    pub relationships: Vec<PendingRelationship>,
    pub conflicts: Vec<ResolutionConflict>,
    pub warnings: Vec<String>,
}

impl Resolution {
    /// The drug followed by its partners, in insertion order.
    pub fn entities(&self) -> impl Iterator<Item = &CanonicalEntity> {
        std::iter::once(&self.drug).chain(self.partners.iter())
    }
}

#[derive(Debug, Default)]
pub struct IdentifierResolver {
    table: AliasTable,
    conflicts: Vec<ResolutionConflict>,
}

impl IdentifierResolver {
    pub fn new() -> Self {
        IdentifierResolver::default()
    }

    pub fn alias_table(&self) -> &AliasTable {
        &self.table
    }

    /// Every conflict recorded so far in this run, in the order they were found.
    pub fn conflicts(&self) -> &[ResolutionConflict] {
        &self.conflicts
    }

    pub fn resolve_reference(&self, id: &Identifier) -> Option<CanonicalKey> {
        self.table.lookup(id)
    }

    pub fn resolve(&mut self, record: &RawRecord) -> Resolution {
        let index = record.index;
        let mut conflicts = Vec::new();
        let mut warnings = Vec::new();

        let drug_key = drug_key(record);
        self.table.register_key(&drug_key);
        let (candidates, reserved): (Vec<_>, Vec<_>) = drug_aliases(record)
            .into_iter()
            .partition(|id| !namespace::is_partner_key_namespace(&id.namespace));
        for id in reserved {
            warnings.push(format!(
                "{id} listed on {drug_key} identifies a polypeptide; not kept as a drug alias"
            ));
        }
        let aliases = self.claim_all(&drug_key, candidates, index, &mut conflicts);
        let drug = CanonicalEntity {
            key: drug_key.clone(),
            name: record.name.clone(),
            data: EntityData::Drug(DrugAttributes {
                drug_type: record.drug_type.clone(),
                description: record.description.clone(),
                cas_number: record.cas_number.clone(),
                inchi: record.inchi.clone(),
                inchikey: record.inchikey.clone(),
            }),
            aliases,
        };
        tracing::debug!(
            "[IdentifierResolver.resolve] record #{index} -> {} ({} aliases)",
            drug.key,
            drug.aliases.len()
        );

        let mut partners = Vec::new();
        let mut relationships = Vec::new();
        for (position, partner) in record.partners.iter().enumerate() {
            let Some(key) = self.partner_key(partner) else {
                warnings.push(format!(
                    "{} #{position} of {drug_key} has no usable identifier",
                    partner.role.element()
                ));
                continue;
            };
            self.table.register_key(&key);
            let aliases = self.claim_all(&key, partner_aliases(partner), index, &mut conflicts);
            let attributes = PolypeptideAttributes {
                organism: partner.organism.clone().or_else(|| {
                    partner
                        .polypeptides
                        .iter()
                        .find_map(|p| p.organism.clone())
                }),
                gene_name: partner.gene_name().map(str::to_string),
            };
            let Some(data) = EntityData::polypeptide(partner.role.entity_kind(), attributes) else {
                continue;
            };
            let name = partner
                .name
                .clone()
                .or_else(|| partner.polypeptides.iter().find_map(|p| p.name.clone()))
                .unwrap_or_else(|| key.local.clone());
            relationships.push(PendingRelationship {
                source: drug_key.clone(),
                target: key.as_identifier().clone(),
                kind: partner.role.relation_kind(),
                attributes: RelationAttributes {
                    actions: partner.actions.iter().cloned().collect(),
                    known_action: partner.known_action,
                    pubmed_ids: partner.pubmed_ids.iter().cloned().collect(),
                    description: None,
                },
                record_index: index,
            });
            partners.push(CanonicalEntity {
                key,
                name,
                data,
                aliases,
            });
        }

        for interaction in record.interactions.iter() {
            relationships.push(PendingRelationship {
                source: drug_key.clone(),
                target: Identifier::new(namespace::DRUGBANK, interaction.drugbank_id.as_str()),
                kind: RelationKind::DrugInteractsWithDrug,
                attributes: RelationAttributes {
                    description: interaction.description.clone(),
                    ..Default::default()
                },
                record_index: index,
            });
        }

        self.conflicts.extend(conflicts.iter().cloned());
        Resolution {
            record_index: index,
            drug,
            partners,
            annotations: DrugAnnotations {
                groups: record.groups.iter().cloned().collect(),
                categories: record.categories.clone(),
                atc_codes: record.atc_codes.iter().cloned().collect(),
                synonyms: record.synonyms.clone(),
                patents: record.patents.clone(),
            },
            relationships,
            conflicts,
            warnings,
        }
    }

    /// UniProt accession > bio-entity id > name. An identifier that is already known resolves
    /// to the entity that claimed it, so a partner listed once with sequence data and once
    /// without stays one entity.
    fn partner_key(&self, partner: &RawPartner) -> Option<CanonicalKey> {
        if let Some(accession) = partner.uniprot_accession() {
            let id = Identifier::new(namespace::UNIPROT, accession);
            return Some(self.table.lookup(&id).unwrap_or(CanonicalKey(id)));
        }
        let fallback = partner
            .bioentity_id
            .as_deref()
            .map(|id| Identifier::new(namespace::BIOENTITY, id))
            .or_else(|| {
                partner
                    .name
                    .as_deref()
                    .map(|name| Identifier::new(namespace::BIOENTITY_NAME, name))
            })?;
        Some(
            self.table
                .lookup(&fallback)
                .unwrap_or(CanonicalKey(fallback)),
        )
    }

    fn claim_all(
        &mut self,
        key: &CanonicalKey,
        candidates: Vec<Identifier>,
        record_index: usize,
        conflicts: &mut Vec<ResolutionConflict>,
    ) -> BTreeSet<Identifier> {
        let mut accepted = BTreeSet::new();
        for alias in candidates {
            if alias == *key.as_identifier() {
                continue;
            }
            match self.table.claim(&alias, key) {
                Claim::Accepted | Claim::AlreadyHeld => {
                    accepted.insert(alias);
                }
                Claim::Conflict(owner) => {
                    tracing::debug!(
                        "[IdentifierResolver] {alias} already held by {owner}, refused for {key}"
                    );
                    conflicts.push(ResolutionConflict {
                        identifier: alias,
                        kept_key: owner,
                        rejected_key: key.clone(),
                        record_index,
                    });
                }
            }
        }
        accepted
    }
}

/// Primary DrugBank id > first secondary id > name.
fn drug_key(record: &RawRecord) -> CanonicalKey {
    if let Some(primary) = record.primary_id.as_deref() {
        return CanonicalKey::new(namespace::DRUGBANK, primary);
    }
    if let Some(secondary) = record.secondary_ids.first() {
        return CanonicalKey::new(namespace::DRUGBANK, secondary.as_str());
    }
    CanonicalKey::new(namespace::DRUGBANK_NAME, record.name.as_str())
}

fn drug_aliases(record: &RawRecord) -> Vec<Identifier> {
    let mut aliases = record
        .secondary_ids
        .iter()
        .map(|id| Identifier::new(namespace::DRUGBANK, id.as_str()))
        .collect::<Vec<_>>();
    if let Some(cas) = record.cas_number.as_deref() {
        aliases.push(Identifier::new(namespace::CAS, cas));
    }
    if let Some(inchikey) = record.inchikey.as_deref() {
        aliases.push(Identifier::new(namespace::INCHIKEY, inchikey));
    }
    aliases.extend(
        record
            .external_identifiers
            .iter()
            .filter_map(|x| identifier_for_resource(&x.resource, &x.identifier)),
    );
    aliases
}

/// Polypeptide cross references only describe the partner when it is a single chain; a
/// complex would otherwise claim the identifiers of its subunits.
fn partner_aliases(partner: &RawPartner) -> Vec<Identifier> {
    let mut aliases = Vec::new();
    if let Some(id) = partner.bioentity_id.as_deref() {
        aliases.push(Identifier::new(namespace::BIOENTITY, id));
    }
    if let [polypeptide] = partner.polypeptides.as_slice() {
        aliases.extend(
            polypeptide
                .external_identifiers
                .iter()
                .filter_map(|x| identifier_for_resource(&x.resource, &x.identifier))
                .filter(|id| !namespace::is_drug_key_namespace(&id.namespace)),
        );
    }
    aliases
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        codec::record::{RawInteraction, RawPolypeptide, RawXref},
        properties::{EntityKind, PartnerRole},
    };
    use test_log::test;

    fn xref(resource: &str, identifier: &str) -> RawXref {
        RawXref {
            resource: resource.to_string(),
            identifier: identifier.to_string(),
        }
    }

    fn drug(index: usize, primary: &str, xrefs: Vec<RawXref>) -> RawRecord {
        RawRecord {
            index,
            drug_type: "small molecule".to_string(),
            primary_id: Some(primary.to_string()),
            name: format!("Drug {primary}"),
            external_identifiers: xrefs,
            ..Default::default()
        }
    }

    fn target(be: &str, accession: Option<&str>) -> RawPartner {
        let mut partner = RawPartner::new(PartnerRole::Target);
        partner.bioentity_id = Some(be.to_string());
        partner.name = Some(format!("Protein {be}"));
        if let Some(acc) = accession {
            partner.polypeptides.push(RawPolypeptide {
                id: Some(acc.to_string()),
                source: Some("Swiss-Prot".to_string()),
                gene_name: Some("F2".to_string()),
                external_identifiers: vec![
                    xref("HUGO Gene Nomenclature Committee (HGNC)", "HGNC:3535"),
                    xref("UniProtKB", acc),
                ],
                ..Default::default()
            });
        }
        partner
    }

    #[test]
    fn drug_key_precedence() {
        let mut record = drug(0, "DB00001", vec![]);
        record.secondary_ids = vec!["BTD00024".to_string(), "BIOD00024".to_string()];
        assert_eq!(drug_key(&record), CanonicalKey::new("drugbank", "DB00001"));

        record.primary_id = None;
        assert_eq!(drug_key(&record), CanonicalKey::new("drugbank", "BTD00024"));

        record.secondary_ids.clear();
        assert_eq!(
            drug_key(&record),
            CanonicalKey::new("drugbank.name", "Drug DB00001")
        );
    }

    #[test]
    fn first_claim_wins() {
        let mut resolver = IdentifierResolver::new();
        let first = resolver.resolve(&drug(0, "DB1", vec![xref("KEGG Drug", "X1")]));
        let second = resolver.resolve(&drug(1, "DB2", vec![xref("KEGG Drug", "X1")]));

        let x1 = Identifier::new("kegg.drug", "X1");
        assert!(first.drug.aliases.contains(&x1));
        assert!(!second.drug.aliases.contains(&x1));
        assert_eq!(
            second.conflicts,
            vec![ResolutionConflict {
                identifier: x1.clone(),
                kept_key: CanonicalKey::new("drugbank", "DB1"),
                rejected_key: CanonicalKey::new("drugbank", "DB2"),
                record_index: 1,
            }]
        );
        assert_eq!(resolver.conflicts().len(), 1);
        assert_eq!(
            resolver.resolve_reference(&x1),
            Some(CanonicalKey::new("drugbank", "DB1"))
        );
    }

    #[test]
    fn repeated_claims_by_the_same_key_are_not_conflicts() {
        let mut resolver = IdentifierResolver::new();
        let record = drug(0, "DB1", vec![xref("KEGG Drug", "X1"), xref("KEGG Drug", "X1")]);
        let first = resolver.resolve(&record);
        let again = resolver.resolve(&record);
        assert!(first.conflicts.is_empty());
        assert!(again.conflicts.is_empty());
        assert_eq!(first.drug.aliases, again.drug.aliases);
    }

    #[test]
    fn canonical_keys_cannot_be_claimed_as_aliases() {
        let mut resolver = IdentifierResolver::new();
        resolver.resolve(&drug(0, "DB1", vec![]));
        let mut second = drug(1, "DB2", vec![]);
        second.secondary_ids.push("DB1".to_string());
        let resolution = resolver.resolve(&second);
        assert_eq!(resolution.conflicts.len(), 1);
        assert_eq!(
            resolution.conflicts[0].kept_key,
            CanonicalKey::new("drugbank", "DB1")
        );
    }

    #[test]
    fn partners_resolve_to_uniprot_with_hgnc_alias() {
        let mut resolver = IdentifierResolver::new();
        let mut record = drug(0, "DB1", vec![]);
        record.partners.push(target("BE0000048", Some("P00734")));
        let resolution = resolver.resolve(&record);

        let partner = &resolution.partners[0];
        assert_eq!(partner.key, CanonicalKey::new("uniprot", "P00734"));
        assert_eq!(partner.kind(), EntityKind::Protein);
        assert!(partner.aliases.contains(&Identifier::new("hgnc", "3535")));
        assert!(partner
            .aliases
            .contains(&Identifier::new("drugbank.bioentity", "BE0000048")));
        assert_eq!(
            partner.data.as_polypeptide().unwrap().gene_name.as_deref(),
            Some("F2")
        );
        assert_eq!(resolution.relationships.len(), 1);
        assert_eq!(
            resolution.relationships[0].kind,
            RelationKind::DrugTargetsProtein
        );
    }

    #[test]
    fn partner_without_sequence_reuses_known_entity() {
        let mut resolver = IdentifierResolver::new();
        let mut first = drug(0, "DB1", vec![]);
        first.partners.push(target("BE0000048", Some("P00734")));
        resolver.resolve(&first);

        let mut second = drug(1, "DB2", vec![]);
        second.partners.push(target("BE0000048", None));
        let resolution = resolver.resolve(&second);
        assert_eq!(
            resolution.partners[0].key,
            CanonicalKey::new("uniprot", "P00734")
        );
        assert!(resolution.conflicts.is_empty());
    }

    #[test]
    fn complexes_fall_back_to_bioentity_and_skip_subunit_xrefs() {
        let mut partner = target("BE0000001", Some("P14867"));
        partner.polypeptides.push(RawPolypeptide {
            id: Some("P47869".to_string()),
            source: Some("Swiss-Prot".to_string()),
            ..Default::default()
        });
        let mut record = drug(0, "DB1", vec![]);
        record.partners.push(partner);
        let resolution = IdentifierResolver::new().resolve(&record);
        let complex = &resolution.partners[0];
        assert_eq!(
            complex.key,
            CanonicalKey::new("drugbank.bioentity", "BE0000001")
        );
        assert!(complex.aliases.is_empty());
    }

    #[test]
    fn drug_uniprot_xrefs_do_not_shadow_partner_keys() {
        let biotech = drug(0, "DB00100", vec![xref("UniProtKB", "P00734")]);
        let mut targeting = drug(1, "DB00200", vec![]);
        targeting.partners.push(target("BE0000048", Some("P00734")));

        for records in [
            vec![biotech.clone(), targeting.clone()],
            vec![targeting.clone(), biotech.clone()],
        ] {
            let mut resolver = IdentifierResolver::new();
            let resolutions = records
                .iter()
                .map(|r| resolver.resolve(r))
                .collect::<Vec<_>>();
            let uniprot = Identifier::new("uniprot", "P00734");
            let drug_resolution = resolutions
                .iter()
                .find(|r| r.drug.key == CanonicalKey::new("drugbank", "DB00100"))
                .unwrap();
            assert!(!drug_resolution.drug.aliases.contains(&uniprot));
            assert_eq!(drug_resolution.warnings.len(), 1);
            assert!(resolver.conflicts().is_empty());
            assert_eq!(
                resolver.resolve_reference(&uniprot),
                Some(CanonicalKey(uniprot))
            );
        }
    }

    #[test]
    fn interactions_stay_unresolved_identifiers() {
        let mut record = drug(0, "DB1", vec![]);
        record.interactions.push(RawInteraction {
            drugbank_id: "DB9".to_string(),
            name: None,
            description: Some("increases bleeding".to_string()),
        });
        let resolution = IdentifierResolver::new().resolve(&record);
        let interaction = &resolution.relationships[0];
        assert_eq!(interaction.target, Identifier::new("drugbank", "DB9"));
        assert_eq!(interaction.kind, RelationKind::DrugInteractsWithDrug);
        assert_eq!(
            interaction.attributes.description.as_deref(),
            Some("increases bleeding")
        );
    }
}
