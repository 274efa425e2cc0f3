//! Namespace prefixes for identifiers.
//!
//! The source document names external vocabularies with free-text resource labels
//! (`"HUGO Gene Nomenclature Committee (HGNC)"`, `"KEGG Drug"`, ...). Identifiers are stored
//! with short lower-case prefixes instead so that keys read like `hgnc:3535`.

use once_cell::sync::Lazy;
use regex::Regex;
use std::collections::BTreeMap;

use crate::properties::Identifier;

pub const DRUGBANK: &str = "drugbank";
pub const DRUGBANK_NAME: &str = "drugbank.name";
pub const BIOENTITY: &str = "drugbank.bioentity";
pub const BIOENTITY_NAME: &str = "drugbank.bioentity-name";
pub const UNIPROT: &str = "uniprot";
pub const HGNC: &str = "hgnc";
pub const CAS: &str = "cas";
pub const INCHIKEY: &str = "inchikey";

/// Namespaces drug canonical keys are drawn from.
pub const DRUG_KEY_NAMESPACES: &[&str] = &[DRUGBANK, DRUGBANK_NAME];

/// Namespaces partner canonical keys are drawn from.
pub const PARTNER_KEY_NAMESPACES: &[&str] = &[UNIPROT, BIOENTITY, BIOENTITY_NAME];

static RESOURCE_NAMESPACES: Lazy<BTreeMap<&'static str, &'static str>> = Lazy::new(|| {
    BTreeMap::from([
        ("UniProtKB", UNIPROT),
        ("UniProt Accession", "uniprot.entry-name"),
        ("HUGO Gene Nomenclature Committee (HGNC)", HGNC),
        ("GenBank Protein Database", "genbank.protein"),
        ("GenBank Gene Database", "genbank.gene"),
        ("GenAtlas", "genatlas"),
        ("Guide to Pharmacology", "iuphar"),
        ("IUPHAR", "iuphar"),
        ("PubChem Compound", "pubchem.compound"),
        ("PubChem Substance", "pubchem.substance"),
        ("KEGG Drug", "kegg.drug"),
        ("KEGG Compound", "kegg.compound"),
        ("ChEBI", "chebi"),
        ("ChEMBL", "chembl"),
        ("ChemSpider", "chemspider"),
        ("BindingDB", "bindingdb"),
        ("PharmGKB", "pharmgkb"),
        ("PDB", "pdb"),
        ("PDRhealth", "pdrhealth"),
        ("Therapeutic Targets Database", "ttd"),
        ("Drugs Product Database (DPD)", "dpd"),
        ("RxCUI", "rxnorm"),
        ("Wikipedia", "wikipedia"),
        ("ZINC", "zinc"),
    ])
});

static NON_ALNUM: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^a-z0-9]+").expect("static regex"));

/// Map a resource label to its namespace prefix. Unknown labels are slugified so that
/// identifiers from new vocabularies are still kept rather than dropped.
pub fn namespace_for_resource(resource: &str) -> String {
    let resource = resource.trim();
    if let Some(ns) = RESOURCE_NAMESPACES.get(resource) {
        return ns.to_string();
    }
    let lower = resource.to_lowercase();
    NON_ALNUM
        .replace_all(&lower, "-")
        .trim_matches('-')
        .to_string()
}

/// True when `namespace` holds canonical keys of partners. A drug may not take such an
/// identifier as an alias: it would collide with the partner entity keyed on it.
pub fn is_partner_key_namespace(namespace: &str) -> bool {
    PARTNER_KEY_NAMESPACES.contains(&namespace)
}

pub fn is_drug_key_namespace(namespace: &str) -> bool {
    DRUG_KEY_NAMESPACES.contains(&namespace)
}

/// Build an identifier from a resource label and a raw code. Codes that repeat the
/// namespace (`HGNC:3535`, `CHEBI:4911`) lose the redundant prefix.
pub fn identifier_for_resource(resource: &str, code: &str) -> Option<Identifier> {
    let namespace = namespace_for_resource(resource);
    let local = strip_redundant_prefix(&namespace, code.trim());
    if namespace.is_empty() || local.is_empty() {
        return None;
    }
    Some(Identifier::new(namespace, local))
}

fn strip_redundant_prefix<'a>(namespace: &str, code: &'a str) -> &'a str {
    if let Some((prefix, rest)) = code.split_once(':') {
        if prefix.eq_ignore_ascii_case(namespace) {
            return rest.trim();
        }
    }
    code
}
