pub use enumset::EnumSet;
/// [crate::properties] contains the identity and payload types shared by the resolver, the
/// relational cache and the graph projection.
use enumset::*;
use serde::{Deserialize, Serialize};
use sqlx::{sqlite::SqliteRow, FromRow, Row};
use std::{
    collections::BTreeSet,
    fmt::{Display, Formatter},
    ops::Deref,
    str::FromStr,
};

use crate::error::IngestError;

/// A namespace-qualified identifier such as `drugbank:DB00001` or `uniprot:P00734`.
///
/// The namespace never contains a `:`; the local part may.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier {
    pub namespace: String,
    pub local: String,
}

impl Identifier {
    pub fn new<N: Into<String>, L: Into<String>>(namespace: N, local: L) -> Self {
        Identifier {
            namespace: namespace.into(),
            local: local.into(),
        }
    }
}

impl Display for Identifier {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}:{}", self.namespace, self.local)
    }
}

impl FromStr for Identifier {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once(':') {
            Some((ns, local)) if !ns.is_empty() && !local.is_empty() => {
                Ok(Identifier::new(ns, local))
            }
            _ => Err(IngestError::Serialization(format!(
                "'{s}' is not a namespace-qualified identifier"
            ))),
        }
    }
}

impl TryFrom<&str> for Identifier {
    type Error = IngestError;

    fn try_from(s: &str) -> Result<Self, Self::Error> {
        s.parse()
    }
}

/// The single authoritative identifier of a [CanonicalEntity].
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CanonicalKey(pub Identifier);

impl CanonicalKey {
    pub fn new<N: Into<String>, L: Into<String>>(namespace: N, local: L) -> Self {
        CanonicalKey(Identifier::new(namespace, local))
    }

    pub fn as_identifier(&self) -> &Identifier {
        &self.0
    }
}

impl Deref for CanonicalKey {
    type Target = Identifier;

    fn deref(&self) -> &Identifier {
        &self.0
    }
}

impl From<Identifier> for CanonicalKey {
    fn from(id: Identifier) -> Self {
        CanonicalKey(id)
    }
}

impl Display for CanonicalKey {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for CanonicalKey {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(CanonicalKey(s.parse()?))
    }
}

/// [EntityKind] is the closed set of entity variants stored in the cache.
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u32")]
pub enum EntityKind {
    /// A drug record from the source document.
    Drug,
    /// A polypeptide referenced as a drug target.
    Protein,
    /// A polypeptide that metabolizes drugs.
    Enzyme,
    /// A polypeptide that moves drugs across membranes.
    Transporter,
    /// A polypeptide that binds and carries drugs, e.g. serum albumin.
    Carrier,
}

impl EntityKind {
    pub fn all() -> &'static [EntityKind] {
        &[
            EntityKind::Drug,
            EntityKind::Protein,
            EntityKind::Enzyme,
            EntityKind::Transporter,
            EntityKind::Carrier,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Drug => "drug",
            EntityKind::Protein => "protein",
            EntityKind::Enzyme => "enzyme",
            EntityKind::Transporter => "transporter",
            EntityKind::Carrier => "carrier",
        }
    }

    pub fn is_polypeptide(&self) -> bool {
        !matches!(self, EntityKind::Drug)
    }

    /// Rank used when one polypeptide shows up in several roles. The higher rank wins so the
    /// stored variant does not depend on document order.
    fn polypeptide_rank(&self) -> u8 {
        match self {
            EntityKind::Drug => 0,
            EntityKind::Protein => 1,
            EntityKind::Carrier => 2,
            EntityKind::Transporter => 3,
            EntityKind::Enzyme => 4,
        }
    }
}

impl Display for EntityKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EntityKind::all()
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| IngestError::Serialization(format!("unknown entity kind '{s}'")))
    }
}

/// The relationship vocabulary. Edges in the exported graph carry exactly one of these.
#[derive(Debug, Serialize, Deserialize, PartialOrd, Ord, Hash, EnumSetType)]
#[enumset(repr = "u32")]
pub enum RelationKind {
    DrugTargetsProtein,
    DrugMetabolizedByEnzyme,
    DrugTransportedBy,
    DrugCarriedBy,
    DrugInteractsWithDrug,
}

impl RelationKind {
    pub fn all() -> &'static [RelationKind] {
        &[
            RelationKind::DrugTargetsProtein,
            RelationKind::DrugMetabolizedByEnzyme,
            RelationKind::DrugTransportedBy,
            RelationKind::DrugCarriedBy,
            RelationKind::DrugInteractsWithDrug,
        ]
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RelationKind::DrugTargetsProtein => "drug_targets_protein",
            RelationKind::DrugMetabolizedByEnzyme => "drug_metabolized_by_enzyme",
            RelationKind::DrugTransportedBy => "drug_transported_by",
            RelationKind::DrugCarriedBy => "drug_carried_by",
            RelationKind::DrugInteractsWithDrug => "drug_interacts_with_drug",
        }
    }

    /// Drug to polypeptide relations; the default export filter.
    pub fn drug_protein() -> EnumSet<RelationKind> {
        RelationKind::DrugTargetsProtein
            | RelationKind::DrugMetabolizedByEnzyme
            | RelationKind::DrugTransportedBy
            | RelationKind::DrugCarriedBy
    }
}

impl Display for RelationKind {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for RelationKind {
    type Err = IngestError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        RelationKind::all()
            .iter()
            .find(|kind| kind.as_str() == s)
            .copied()
            .ok_or_else(|| IngestError::Serialization(format!("unknown relation kind '{s}'")))
    }
}

/// Role a polypeptide plays for a drug, taken from the section it is listed under.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum PartnerRole {
    Target,
    Enzyme,
    Carrier,
    Transporter,
}

impl PartnerRole {
    pub fn all() -> &'static [PartnerRole] {
        &[
            PartnerRole::Target,
            PartnerRole::Enzyme,
            PartnerRole::Carrier,
            PartnerRole::Transporter,
        ]
    }

    /// Element name of one partner, e.g. `target` inside `<targets>`.
    pub fn element(&self) -> &'static str {
        match self {
            PartnerRole::Target => "target",
            PartnerRole::Enzyme => "enzyme",
            PartnerRole::Carrier => "carrier",
            PartnerRole::Transporter => "transporter",
        }
    }

    /// Element name of the enclosing list, e.g. `targets`.
    pub fn section(&self) -> &'static str {
        match self {
            PartnerRole::Target => "targets",
            PartnerRole::Enzyme => "enzymes",
            PartnerRole::Carrier => "carriers",
            PartnerRole::Transporter => "transporters",
        }
    }

    pub fn from_section(section: &str) -> Option<PartnerRole> {
        PartnerRole::all()
            .iter()
            .find(|role| role.section() == section)
            .copied()
    }

    pub fn entity_kind(&self) -> EntityKind {
        match self {
            PartnerRole::Target => EntityKind::Protein,
            PartnerRole::Enzyme => EntityKind::Enzyme,
            PartnerRole::Carrier => EntityKind::Carrier,
            PartnerRole::Transporter => EntityKind::Transporter,
        }
    }

    pub fn relation_kind(&self) -> RelationKind {
        match self {
            PartnerRole::Target => RelationKind::DrugTargetsProtein,
            PartnerRole::Enzyme => RelationKind::DrugMetabolizedByEnzyme,
            PartnerRole::Carrier => RelationKind::DrugCarriedBy,
            PartnerRole::Transporter => RelationKind::DrugTransportedBy,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DrugAttributes {
    /// `small molecule` or `biotech`
    pub drug_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cas_number: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inchi: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inchikey: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PolypeptideAttributes {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organism: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gene_name: Option<String>,
}

impl PolypeptideAttributes {
    /// Fill gaps from `other` without overwriting values already known.
    fn merge(mut self, other: &PolypeptideAttributes) -> Self {
        if self.organism.is_none() {
            self.organism = other.organism.clone();
        }
        if self.gene_name.is_none() {
            self.gene_name = other.gene_name.clone();
        }
        self
    }
}

/// Typed payload of a [CanonicalEntity]. Each variant has a fixed attribute schema.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "attributes", rename_all = "snake_case")]
pub enum EntityData {
    Drug(DrugAttributes),
    Protein(PolypeptideAttributes),
    Enzyme(PolypeptideAttributes),
    Transporter(PolypeptideAttributes),
    Carrier(PolypeptideAttributes),
}

impl EntityData {
    pub fn polypeptide(kind: EntityKind, attributes: PolypeptideAttributes) -> Option<Self> {
        match kind {
            EntityKind::Drug => None,
            EntityKind::Protein => Some(EntityData::Protein(attributes)),
            EntityKind::Enzyme => Some(EntityData::Enzyme(attributes)),
            EntityKind::Transporter => Some(EntityData::Transporter(attributes)),
            EntityKind::Carrier => Some(EntityData::Carrier(attributes)),
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            EntityData::Drug(_) => EntityKind::Drug,
            EntityData::Protein(_) => EntityKind::Protein,
            EntityData::Enzyme(_) => EntityKind::Enzyme,
            EntityData::Transporter(_) => EntityKind::Transporter,
            EntityData::Carrier(_) => EntityKind::Carrier,
        }
    }

    pub fn as_polypeptide(&self) -> Option<&PolypeptideAttributes> {
        match self {
            EntityData::Drug(_) => None,
            EntityData::Protein(attrs)
            | EntityData::Enzyme(attrs)
            | EntityData::Transporter(attrs)
            | EntityData::Carrier(attrs) => Some(attrs),
        }
    }

    pub fn as_drug(&self) -> Option<&DrugAttributes> {
        match self {
            EntityData::Drug(attrs) => Some(attrs),
            _ => None,
        }
    }

    /// JSON of the variant's attributes only; the kind is stored in its own column.
    pub fn attributes_json(&self) -> Result<String, IngestError> {
        let json = match self {
            EntityData::Drug(attrs) => serde_json::to_string(attrs)?,
            EntityData::Protein(attrs)
            | EntityData::Enzyme(attrs)
            | EntityData::Transporter(attrs)
            | EntityData::Carrier(attrs) => serde_json::to_string(attrs)?,
        };
        Ok(json)
    }

    pub fn from_parts(kind: EntityKind, attributes: &str) -> Result<Self, IngestError> {
        match kind {
            EntityKind::Drug => Ok(EntityData::Drug(serde_json::from_str(attributes)?)),
            _ => {
                let attrs: PolypeptideAttributes = serde_json::from_str(attributes)?;
                EntityData::polypeptide(kind, attrs).ok_or_else(|| {
                    IngestError::Serialization(format!("{kind} is not a polypeptide kind"))
                })
            }
        }
    }

    /// Combine the stored payload with a newly observed one for the same key.
    ///
    /// Drugs take the newer attributes. Polypeptides keep the highest ranked role and fill
    /// missing attributes. A drug and a polypeptide never share a key; that is an error.
    pub fn merge(&self, incoming: &EntityData) -> Result<EntityData, String> {
        match (self, incoming) {
            (EntityData::Drug(_), EntityData::Drug(new)) => Ok(EntityData::Drug(new.clone())),
            (EntityData::Drug(_), other) | (other, EntityData::Drug(_)) => Err(format!(
                "a drug and a {} cannot share one canonical key",
                other.kind()
            )),
            (existing, new) => {
                let (Some(existing_attrs), Some(new_attrs)) =
                    (existing.as_polypeptide(), new.as_polypeptide())
                else {
                    return Err("polypeptide payload expected".to_string());
                };
                let kind = if new.kind().polypeptide_rank() > existing.kind().polypeptide_rank() {
                    new.kind()
                } else {
                    existing.kind()
                };
                let merged = existing_attrs.clone().merge(new_attrs);
                EntityData::polypeptide(kind, merged)
                    .ok_or_else(|| format!("{kind} is not a polypeptide kind"))
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CanonicalEntity {
    pub key: CanonicalKey,
    pub name: String,
    pub data: EntityData,
    /// Alternate identifiers accepted for this entity. Loaded separately from the aliases
    /// table, so rows read through [FromRow] start with an empty set.
    #[serde(default)]
    pub aliases: BTreeSet<Identifier>,
}

impl CanonicalEntity {
    pub fn kind(&self) -> EntityKind {
        self.data.kind()
    }
}

impl FromRow<'_, SqliteRow> for CanonicalEntity {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let key_str: &str = row.try_get("key")?;
        let kind_str: &str = row.try_get("kind")?;
        let name: String = row.try_get("name")?;
        let attributes: &str = row.try_get("attributes")?;

        let key = CanonicalKey::from_str(key_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let kind = EntityKind::from_str(kind_str).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;
        let data =
            EntityData::from_parts(kind, attributes).map_err(|e| sqlx::Error::Decode(Box::new(e)))?;

        Ok(CanonicalEntity {
            key,
            name,
            data,
            aliases: BTreeSet::new(),
        })
    }
}

/// Attributes carried by a [Relationship]. Sets keep the JSON encoding stable across runs.
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RelationAttributes {
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub actions: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub known_action: Option<bool>,
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub pubmed_ids: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
}

impl RelationAttributes {
    pub fn merge(&self, other: &RelationAttributes) -> RelationAttributes {
        RelationAttributes {
            actions: self.actions.union(&other.actions).cloned().collect(),
            known_action: other.known_action.or(self.known_action),
            pubmed_ids: self.pubmed_ids.union(&other.pubmed_ids).cloned().collect(),
            description: other.description.clone().or_else(|| self.description.clone()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Relationship {
    pub source: CanonicalKey,
    pub target: CanonicalKey,
    pub kind: RelationKind,
    pub attributes: RelationAttributes,
}

impl FromRow<'_, SqliteRow> for Relationship {
    fn from_row(row: &SqliteRow) -> sqlx::Result<Self> {
        let source_str: &str = row.try_get("source")?;
        let target_str: &str = row.try_get("target")?;
        let kind_str: &str = row.try_get("kind")?;
        let attributes_str: &str = row.try_get("attributes")?;

        let decode = |e: IngestError| sqlx::Error::Decode(Box::new(e));
        Ok(Relationship {
            source: CanonicalKey::from_str(source_str).map_err(decode)?,
            target: CanonicalKey::from_str(target_str).map_err(decode)?,
            kind: RelationKind::from_str(kind_str).map_err(decode)?,
            attributes: serde_json::from_str(attributes_str)
                .map_err(|e| sqlx::Error::Decode(Box::new(e)))?,
        })
    }
}
