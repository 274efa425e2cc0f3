use std::{fmt, io};

use quick_xml::Error as XmlError;
use serde::{Deserialize, Serialize};
use serde_json::Error as JsonError;
use sqlx::Error as SqlxError;
use thiserror::Error;

/// Failures raised while reading the source document.
///
/// Structural and version failures are fatal for the import. A
/// [`ParseError::MalformedRecord`] only concerns one `<drug>` element; what happens next is
/// decided by [`crate::config::MalformedRecordPolicy`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Error)]
pub enum ParseError {
    #[error("XML syntax error at byte {position}: {message}")]
    Xml { position: u64, message: String },
    #[error("Expected root element <{expected}>, found <{found}>")]
    UnexpectedRoot { expected: String, found: String },
    #[error("Root element does not declare a schema version; expected version {expected}")]
    MissingVersion { expected: String },
    #[error("Unsupported schema version {found}; this parser targets version {expected}")]
    UnsupportedVersion { expected: String, found: String },
    #[error("Document ended before the root element was found")]
    EmptyDocument,
    #[error("Malformed record #{index}: {reason}")]
    MalformedRecord { index: usize, reason: String },
    #[error("Source read error: {0}")]
    Io(String),
}

impl ParseError {
    /// Fatal errors end the record stream. Only malformed records are recoverable.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, ParseError::MalformedRecord { .. })
    }
}

impl From<io::Error> for ParseError {
    fn from(x: io::Error) -> Self {
        ParseError::Io(format!("{x}"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
pub enum IngestError {
    #[error("Source document error: {0}")]
    Parse(#[from] ParseError),
    #[error("Schema integrity violation for '{key}' (record {record_index:?}): {detail}")]
    SchemaIntegrity {
        key: String,
        detail: String,
        record_index: Option<usize>,
    },
    #[error("Relationship {source_key} -[{kind}]-> {target_key} references an entity missing from the cache")]
    ProjectionInconsistency {
        source_key: String,
        target_key: String,
        kind: String,
    },
    #[error("Cache/Database error: {0}")]
    Cache(String),
    #[error("Configuration error: {0}")]
    Config(String),
    #[error("File System error: {0}")]
    Io(String),
    #[error("Item Not Found: {0}")]
    NotFound(String),
    #[error("Import pipeline error: {0}")]
    Pipeline(String),
    #[error("(De)Serialization error: {0}")]
    Serialization(String),
}

impl IngestError {
    pub fn integrity<K: fmt::Display, D: Into<String>>(
        key: K,
        detail: D,
        record_index: Option<usize>,
    ) -> Self {
        IngestError::SchemaIntegrity {
            key: key.to_string(),
            detail: detail.into(),
            record_index,
        }
    }
}

impl From<io::Error> for IngestError {
    fn from(x: io::Error) -> Self {
        match x.kind() {
            io::ErrorKind::NotFound => IngestError::NotFound(format!("{x}")),
            _ => IngestError::Io(format!("IOError: {}", x.kind())),
        }
    }
}

impl From<XmlError> for ParseError {
    fn from(x: XmlError) -> Self {
        ParseError::Xml {
            position: 0,
            message: format!("{x}"),
        }
    }
}

impl From<JsonError> for IngestError {
    fn from(src: JsonError) -> IngestError {
        IngestError::Serialization(format!("JSON (de)serialization error: {src}"))
    }
}

impl From<toml::de::Error> for IngestError {
    fn from(src: toml::de::Error) -> IngestError {
        IngestError::Config(format!("Toml deserialization error: {src}"))
    }
}

impl From<toml::ser::Error> for IngestError {
    fn from(src: toml::ser::Error) -> IngestError {
        IngestError::Serialization(format!("Toml serialization error: {src}"))
    }
}

impl From<tokio::task::JoinError> for IngestError {
    fn from(src: tokio::task::JoinError) -> IngestError {
        IngestError::Pipeline(format!("parser task failed: {src}"))
    }
}

impl From<SqlxError> for IngestError {
    fn from(db_error: SqlxError) -> Self {
        // Constraint violations mean two rows disagree about identity; everything else is an
        // operational cache failure.
        if let Some(db_err) = db_error.as_database_error() {
            if matches!(
                db_err.kind(),
                sqlx::error::ErrorKind::UniqueViolation
                    | sqlx::error::ErrorKind::ForeignKeyViolation
                    | sqlx::error::ErrorKind::NotNullViolation
                    | sqlx::error::ErrorKind::CheckViolation
            ) {
                return IngestError::SchemaIntegrity {
                    key: String::new(),
                    detail: format!("constraint violation: {}", db_err.message()),
                    record_index: None,
                };
            }
        }
        IngestError::Cache(format!("database error: {db_error:?}"))
    }
}

impl From<sqlx::migrate::MigrateError> for IngestError {
    fn from(src: sqlx::migrate::MigrateError) -> Self {
        IngestError::Cache(format!("migration error: {src}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_log::test;

    #[test]
    fn malformed_records_are_not_fatal() {
        let err = ParseError::MalformedRecord {
            index: 3,
            reason: "missing name".to_string(),
        };
        assert!(!err.is_fatal());
        assert!(ParseError::EmptyDocument.is_fatal());
        assert!(ParseError::UnsupportedVersion {
            expected: "5.1".to_string(),
            found: "4.0".to_string()
        }
        .is_fatal());
    }

    #[test]
    fn parse_errors_carry_context_into_ingest_errors() {
        let err: IngestError = ParseError::MalformedRecord {
            index: 7,
            reason: "missing primary drugbank-id".to_string(),
        }
        .into();
        let msg = err.to_string();
        assert!(msg.contains("#7"), "{msg}");
        assert!(msg.contains("primary drugbank-id"), "{msg}");
    }

    #[test]
    fn io_not_found_maps_to_not_found() {
        let err: IngestError = io::Error::new(io::ErrorKind::NotFound, "nope").into();
        assert!(matches!(err, IngestError::NotFound(_)));
    }
}
