//! Diagnostic types for identity resolution and record ingestion.
//!
//! Diagnostics are non-fatal. They are collected during an import and returned with the
//! [`crate::manager::ImportReport`] so callers can inspect what was dropped and why without
//! re-parsing the document.

use serde::{Deserialize, Serialize};

use crate::properties::{CanonicalKey, Identifier, RelationKind};

/// An alternate identifier claimed by two different canonical keys.
///
/// The first claim wins. The rejected entity is stored without the identifier among its
/// aliases.
///
/// # Examples
///
/// ```
/// # use drugbank_graph::{codec::ResolutionConflict, properties::{CanonicalKey, Identifier}};
/// // DB00002 listed KEGG D00001 after DB00001 had already claimed it:
/// let conflict = ResolutionConflict {
///     identifier: Identifier::new("kegg.drug", "D00001"),
///     kept_key: CanonicalKey::new("drugbank", "DB00001"),
///     rejected_key: CanonicalKey::new("drugbank", "DB00002"),
///     record_index: 1,
/// };
/// assert_eq!(conflict.identifier.to_string(), "kegg.drug:D00001");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ResolutionConflict {
    /// The contested identifier
    pub identifier: Identifier,
    /// Canonical key that claimed the identifier first
    pub kept_key: CanonicalKey,
    /// Canonical key whose claim was refused
    pub rejected_key: CanonicalKey,
    /// Record during which the refused claim was made
    pub record_index: usize,
}

/// A relationship whose target never appeared in the document.
///
/// Drug interactions may point at drugs that are missing from a partial export. The relation
/// cannot be stored without both endpoints, so it is dropped and reported here.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub source: CanonicalKey,
    pub target: Identifier,
    pub kind: RelationKind,
    pub record_index: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ImportDiagnostic {
    /// An alias was claimed twice; the first-seen mapping was kept.
    ResolutionConflict(ResolutionConflict),

    /// A relationship target could not be resolved after the whole stream was read.
    UnresolvedReference(UnresolvedReference),

    /// A record was skipped because required fields were missing or invalid.
    MalformedRecord { index: usize, message: String },

    /// Anything else worth surfacing, e.g. a partner without identifiers.
    Warning(String),
}

impl ImportDiagnostic {
    pub fn warning(message: impl Into<String>) -> Self {
        Self::Warning(message.into())
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::ResolutionConflict(_))
    }

    pub fn as_conflict(&self) -> Option<&ResolutionConflict> {
        match self {
            Self::ResolutionConflict(conflict) => Some(conflict),
            _ => None,
        }
    }

    pub fn as_unresolved_reference(&self) -> Option<&UnresolvedReference> {
        match self {
            Self::UnresolvedReference(unresolved) => Some(unresolved),
            _ => None,
        }
    }

    pub fn is_malformed_record(&self) -> bool {
        matches!(self, Self::MalformedRecord { .. })
    }
}

impl std::fmt::Display for ImportDiagnostic {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ResolutionConflict(c) => write!(
                f,
                "Identifier {} already belongs to {}; not added to {} (record {})",
                c.identifier, c.kept_key, c.rejected_key, c.record_index
            ),
            Self::UnresolvedReference(u) => write!(
                f,
                "Unresolved {} target {} from {} (record {})",
                u.kind, u.target, u.source, u.record_index
            ),
            Self::MalformedRecord { index, message } => {
                write!(f, "Skipped malformed record #{index}: {message}")
            }
            Self::Warning(msg) => write!(f, "Warning: {msg}"),
        }
    }
}
