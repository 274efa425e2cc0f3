//! Reading DrugBank XML into owned records.
//!
//! ## Key Components
//!
//! - [`RecordParser`] - Streaming iterator over the top-level `<drug>` elements of a document
//! - [`RawRecord`] - One unvalidated drug with its partners, interactions and annotations
//! - [`ImportDiagnostic`] - Non-fatal problems found while ingesting records
//!
//! The parser validates the root element and the declared schema version before yielding
//! anything. Records are produced one at a time, so memory use is bounded by the largest
//! single `<drug>` element rather than by the document.
//!
//! ```rust
//! use drugbank_graph::codec::RecordParser;
//!
//! let xml = r#"<drugbank xmlns="http://www.drugbank.ca" version="5.1">
//!   <drug type="small molecule">
//!     <drugbank-id primary="true">DB00945</drugbank-id>
//!     <name>Acetylsalicylic acid</name>
//!   </drug>
//! </drugbank>"#;
//!
//! let records = RecordParser::new(xml.as_bytes())
//!     .unwrap()
//!     .collect::<Result<Vec<_>, _>>()
//!     .unwrap();
//! assert_eq!(records[0].primary_id.as_deref(), Some("DB00945"));
//! ```

pub mod diagnostic;
pub mod parser;
pub mod record;

pub use diagnostic::{ImportDiagnostic, ResolutionConflict, UnresolvedReference};
pub use parser::{RecordParser, DRUGBANK_XML_NAMESPACE, SUPPORTED_SCHEMA_VERSION};
pub use record::{
    RawCategory, RawInteraction, RawPartner, RawPatent, RawPolypeptide, RawRecord, RawXref,
};
