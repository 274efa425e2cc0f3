//! # drugbank-graph
//!
//! Streams a DrugBank XML export into an idempotent SQLite cache and projects that cache into a
//! typed, directed knowledge graph of drugs and the polypeptides they act on.
//!
//! ## Overview
//!
//! The pipeline runs in one direction:
//!
//! ```text
//! XML document -> RawRecord -> Resolution -> cache rows -> KnowledgeGraph
//! ```
//!
//! - **Parse**: [`codec::RecordParser`] reads one `<drug>` at a time and rejects documents of an
//!   unsupported schema version before anything is written.
//! - **Resolve**: [`resolver::IdentifierResolver`] picks one canonical key per entity and keeps
//!   every other identifier as an alias. An alias never belongs to two entities.
//! - **Populate**: [`db::Populator`] commits each record in its own transaction. Re-importing
//!   the same document leaves the cache byte-for-byte unchanged.
//! - **Project**: [`graph::GraphProjector`] turns the cache into a [`graph::KnowledgeGraph`].
//!
//! ## Architecture
//!
//! - **[`manager`]**: the facade most callers need
//! - **[`codec`]**: XML parsing, raw records, import diagnostics
//! - **[`resolver`]**: canonical key precedence and alias deduplication
//! - **[`db`]**: the relational cache, its migrations and lookups
//! - **[`graph`]**: graph projection and node-link JSON export
//! - **[`properties`]**: identifiers, entity variants, the relationship vocabulary
//! - **[`namespace`]**: resource labels to identifier namespaces
//! - **[`config`]**: TOML-loadable import settings
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use drugbank_graph::{config::ImportConfig, manager::Manager, properties::CanonicalKey};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let manager = Manager::open(ImportConfig::new("drugbank_cache.db")).await?;
//!     let report = manager.populate("full database.xml").await?;
//!     println!(
//!         "{} records, {} conflicts",
//!         report.records_committed,
//!         report.conflict_count()
//!     );
//!
//!     let graph = manager.export_graph().await?;
//!     let lepirudin = CanonicalKey::new("drugbank", "DB00001");
//!     for (target, edge) in graph.edges_from(&lepirudin) {
//!         println!("{} -[{}]-> {}", lepirudin, edge.kind, target.key);
//!     }
//!     Ok(())
//! }
//! ```
//!
//! ## Diagnostics
//!
//! Problems that do not stop an import are returned in
//! [`manager::ImportReport::diagnostics`]: alias conflicts, skipped malformed records and
//! interaction references to drugs missing from the document. Fatal problems are
//! [`IngestError`]s.

pub mod codec;
pub mod config;
pub mod db;
pub mod error;
pub mod graph;
pub mod manager;
pub mod namespace;
pub mod properties;
pub mod resolver;

pub use error::*;
