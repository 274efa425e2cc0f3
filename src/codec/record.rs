//! Unvalidated snapshots of `<drug>` elements as produced by [`super::RecordParser`].

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::properties::PartnerRole;

/// One drug and everything nested under it, before identity resolution.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawRecord {
    /// Zero-based position of the record among the document's `<drug>` elements.
    pub index: usize,
    pub drug_type: String,
    pub primary_id: Option<String>,
    pub secondary_ids: Vec<String>,
    pub name: String,
    pub description: Option<String>,
    pub cas_number: Option<String>,
    pub inchi: Option<String>,
    pub inchikey: Option<String>,
    pub groups: Vec<String>,
    pub categories: Vec<RawCategory>,
    pub atc_codes: Vec<String>,
    /// English synonyms, international brands and product names.
    pub synonyms: BTreeSet<String>,
    pub patents: Vec<RawPatent>,
    pub external_identifiers: Vec<RawXref>,
    pub partners: Vec<RawPartner>,
    pub interactions: Vec<RawInteraction>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawCategory {
    pub name: String,
    pub mesh_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPatent {
    pub number: String,
    pub country: String,
    pub approved: Option<NaiveDate>,
    pub expires: Option<NaiveDate>,
    pub pediatric_extension: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawXref {
    pub resource: String,
    pub identifier: String,
}

/// A target, enzyme, carrier or transporter entry of a drug.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPartner {
    pub role: PartnerRole,
    /// DrugBank bio-entity id, e.g. `BE0000048`.
    pub bioentity_id: Option<String>,
    pub name: Option<String>,
    pub organism: Option<String>,
    pub known_action: Option<bool>,
    pub actions: Vec<String>,
    pub pubmed_ids: Vec<String>,
    pub polypeptides: Vec<RawPolypeptide>,
}

impl RawPartner {
    pub fn new(role: PartnerRole) -> Self {
        RawPartner {
            role,
            bioentity_id: None,
            name: None,
            organism: None,
            known_action: None,
            actions: Vec::new(),
            pubmed_ids: Vec::new(),
            polypeptides: Vec::new(),
        }
    }

    /// The UniProtKB accession when the partner is a single polypeptide. Complexes and
    /// partners without sequence data have none.
    pub fn uniprot_accession(&self) -> Option<&str> {
        let accessions = self
            .polypeptides
            .iter()
            .flat_map(|p| p.uniprot_accessions())
            .collect::<BTreeSet<&str>>();
        match accessions.len() {
            1 => accessions.into_iter().next(),
            _ => None,
        }
    }

    /// Gene symbol, when all polypeptides agree on one.
    pub fn gene_name(&self) -> Option<&str> {
        let names = self
            .polypeptides
            .iter()
            .filter_map(|p| p.gene_name.as_deref())
            .collect::<BTreeSet<&str>>();
        match names.len() {
            1 => names.into_iter().next(),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawPolypeptide {
    pub id: Option<String>,
    /// `Swiss-Prot` or `TrEMBL` when `id` is a UniProt accession.
    pub source: Option<String>,
    pub name: Option<String>,
    pub gene_name: Option<String>,
    pub organism: Option<String>,
    pub external_identifiers: Vec<RawXref>,
}

impl RawPolypeptide {
    fn uniprot_accessions(&self) -> Vec<&str> {
        let mut accessions = self
            .external_identifiers
            .iter()
            .filter(|x| x.resource == "UniProtKB")
            .map(|x| x.identifier.as_str())
            .collect::<Vec<&str>>();
        if let (Some(id), Some(source)) = (self.id.as_deref(), self.source.as_deref()) {
            if matches!(source, "Swiss-Prot" | "TrEMBL") {
                accessions.push(id);
            }
        }
        accessions
    }
}

/// A `<drug-interaction>` entry pointing at another drug by DrugBank id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RawInteraction {
    pub drugbank_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    fn polypeptide(id: &str, xref: Option<&str>) -> RawPolypeptide {
        RawPolypeptide {
            id: Some(id.to_string()),
            source: Some("Swiss-Prot".to_string()),
            external_identifiers: xref
                .map(|x| {
                    vec![RawXref {
                        resource: "UniProtKB".to_string(),
                        identifier: x.to_string(),
                    }]
                })
                .unwrap_or_default(),
            ..Default::default()
        }
    }

    #[test]
    fn single_polypeptide_has_an_accession() {
        let mut partner = RawPartner::new(PartnerRole::Target);
        partner.polypeptides.push(polypeptide("P00734", Some("P00734")));
        assert_eq!(partner.uniprot_accession(), Some("P00734"));
    }

    #[test]
    fn complexes_have_no_single_accession() {
        let mut partner = RawPartner::new(PartnerRole::Target);
        partner.polypeptides.push(polypeptide("P14867", None));
        partner.polypeptides.push(polypeptide("P47869", None));
        assert_eq!(partner.uniprot_accession(), None);

        let empty = RawPartner::new(PartnerRole::Enzyme);
        assert_eq!(empty.uniprot_accession(), None);
    }
}
