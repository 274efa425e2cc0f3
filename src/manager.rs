//! Facade over the import pipeline and the cache.
//!
//! [`Manager::populate`] streams a document through parse → resolve → populate:
//!
//! ```text
//! spawn_blocking(RecordParser) --mpsc(pipeline_buffer)--> IdentifierResolver --> Populator
//!                                                                                  |
//!                                           pending_relationships (staged per record)
//!                                                                                  |
//!                                       flush_deferred, flush_batch rows per commit
//! ```
//!
//! The parser validates the root element before the pipeline starts, so a document of the
//! wrong schema version never writes a row. There is one consumer, and each record commits
//! before the next one is read from the channel. Relationships to drugs later in the document
//! wait in a staging table rather than in memory.
//!
//! An import merges into whatever the cache already holds. Call [Manager::clear] first, or use
//! [Manager::rebuild], to replace a cache built from a different document.

use enumset::EnumSet;
use serde::{Deserialize, Serialize};
use std::{
    collections::{BTreeMap, BTreeSet},
    io::BufRead,
    path::Path,
};
use tokio::sync::mpsc;

use crate::{
    codec::{ImportDiagnostic, RecordParser, ResolutionConflict, UnresolvedReference},
    config::{ImportConfig, MalformedRecordPolicy},
    db::{db_init, CacheSummary, DbConnection, Populator, UpsertCounts},
    error::{IngestError, ParseError},
    graph::{GraphProjector, KnowledgeGraph},
    namespace,
    properties::{CanonicalEntity, CanonicalKey, Identifier, RelationKind, Relationship},
    resolver::IdentifierResolver,
};

/// Counts and diagnostics of one [Manager::populate] run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImportReport {
    /// Records the parser yielded without error.
    pub records_read: usize,
    pub records_committed: usize,
    pub records_skipped: usize,
    pub entities: UpsertCounts,
    pub aliases: UpsertCounts,
    pub relationships: UpsertCounts,
    pub annotations: UpsertCounts,
    pub conflicts: Vec<ResolutionConflict>,
    pub diagnostics: Vec<ImportDiagnostic>,
}

impl ImportReport {
    pub fn conflict_count(&self) -> usize {
        self.conflicts.len()
    }

    pub fn unresolved_references(&self) -> impl Iterator<Item = &UnresolvedReference> {
        self.diagnostics
            .iter()
            .filter_map(ImportDiagnostic::as_unresolved_reference)
    }

    /// True when the run inserted or updated nothing, e.g. a repeat import.
    pub fn is_unchanged(&self) -> bool {
        self.entities.changed() == 0
            && self.aliases.changed() == 0
            && self.relationships.changed() == 0
            && self.annotations.changed() == 0
    }
}

pub struct Manager {
    config: ImportConfig,
    populator: Populator,
}

impl Manager {
    pub async fn open(config: ImportConfig) -> Result<Self, IngestError> {
        let pool = db_init(&config.cache_path).await?;
        Ok(Manager {
            populator: Populator::new(DbConnection(pool)),
            config,
        })
    }

    pub fn config(&self) -> &ImportConfig {
        &self.config
    }

    pub fn connection(&self) -> &DbConnection {
        self.populator.connection()
    }

    #[tracing::instrument(skip_all, fields(path = ?path.as_ref()))]
    pub async fn populate<P: AsRef<Path>>(&self, path: P) -> Result<ImportReport, IngestError> {
        let path = path.as_ref().to_path_buf();
        let parser = tokio::task::spawn_blocking(move || RecordParser::open(path)).await??;
        self.run(parser).await
    }

    pub async fn populate_reader<R>(&self, reader: R) -> Result<ImportReport, IngestError>
    where
        R: BufRead + Send + 'static,
    {
        let parser = tokio::task::spawn_blocking(move || RecordParser::new(reader)).await??;
        self.run(parser).await
    }

    /// Empty the cache, then import `path`. The result holds exactly that document.
    pub async fn rebuild<P: AsRef<Path>>(&self, path: P) -> Result<ImportReport, IngestError> {
        let path = path.as_ref().to_path_buf();
        // Validate the document before dropping the old contents.
        let parser = tokio::task::spawn_blocking(move || RecordParser::open(path)).await??;
        self.clear().await?;
        self.run(parser).await
    }

    async fn run<R>(&self, parser: RecordParser<R>) -> Result<ImportReport, IngestError>
    where
        R: BufRead + Send + 'static,
    {
        tracing::info!(
            "[Manager.populate] importing DrugBank schema {} into {:?}",
            parser.schema_version(),
            self.config.cache_path
        );
        let (tx, rx) = mpsc::channel(self.config.pipeline_buffer.max(1));
        let producer = tokio::task::spawn_blocking(move || {
            for item in parser {
                let fatal = matches!(&item, Err(e) if e.is_fatal());
                if tx.blocking_send(item).is_err() || fatal {
                    break;
                }
            }
        });

        let mut resolver = IdentifierResolver::new();
        let mut report = ImportReport::default();
        // The receiver is dropped when `consume` returns, which unblocks the producer if the
        // import stopped early.
        let consumed = match self.populator.discard_pending().await {
            Ok(_) => self.consume(rx, &mut resolver, &mut report).await,
            Err(e) => Err(e),
        };
        producer.await?;
        consumed?;

        let flushed = self
            .populator
            .flush_deferred(&resolver, self.config.flush_batch)
            .await?;
        report.relationships.merge(&flushed.relationships);
        report.diagnostics.extend(flushed.diagnostics());

        for conflict in report.conflicts.iter() {
            tracing::warn!("[Manager.populate] {}", ImportDiagnostic::ResolutionConflict(conflict.clone()));
        }
        tracing::info!(
            "[Manager.populate] {} records committed, {} skipped, {} conflicts, {} unresolved references",
            report.records_committed,
            report.records_skipped,
            report.conflict_count(),
            report.unresolved_references().count()
        );
        Ok(report)
    }

    async fn consume(
        &self,
        mut rx: mpsc::Receiver<Result<crate::codec::RawRecord, ParseError>>,
        resolver: &mut IdentifierResolver,
        report: &mut ImportReport,
    ) -> Result<(), IngestError> {
        while let Some(item) = rx.recv().await {
            let record = match item {
                Ok(record) => record,
                Err(ParseError::MalformedRecord { index, reason }) => {
                    match self.config.malformed_records {
                        MalformedRecordPolicy::Skip => {
                            tracing::warn!(
                                "[Manager.populate] skipping malformed record #{index}: {reason}"
                            );
                            report.records_skipped += 1;
                            report.diagnostics.push(ImportDiagnostic::MalformedRecord {
                                index,
                                message: reason,
                            });
                            continue;
                        }
                        MalformedRecordPolicy::Abort => {
                            tracing::error!(
                                "[Manager.populate] aborting on malformed record #{index}: {reason}"
                            );
                            return Err(ParseError::MalformedRecord { index, reason }.into());
                        }
                    }
                }
                Err(fatal) => {
                    tracing::error!("[Manager.populate] {fatal}");
                    return Err(fatal.into());
                }
            };
            report.records_read += 1;

            let resolution = resolver.resolve(&record);
            for warning in resolution.warnings.iter() {
                tracing::warn!("[Manager.populate] {warning}");
                report.diagnostics.push(ImportDiagnostic::warning(warning.clone()));
            }
            let outcome = self.populator.apply(&resolution).await?;
            report.entities.merge(&outcome.entities);
            report.aliases.merge(&outcome.aliases);
            report.relationships.merge(&outcome.relationships);
            report.annotations.merge(&outcome.annotations);
            for conflict in resolution.conflicts.into_iter().chain(outcome.conflicts) {
                report
                    .diagnostics
                    .push(ImportDiagnostic::ResolutionConflict(conflict.clone()));
                report.conflicts.push(conflict);
            }
            report.records_committed += 1;
        }
        Ok(())
    }

    pub async fn export_graph(&self) -> Result<KnowledgeGraph, IngestError> {
        self.project(GraphProjector::new()).await
    }

    /// Project only edges of the given kinds, e.g. [RelationKind::drug_protein].
    pub async fn export_graph_with(
        &self,
        relations: EnumSet<RelationKind>,
    ) -> Result<KnowledgeGraph, IngestError> {
        self.project(GraphProjector::with_relations(relations)).await
    }

    async fn project(&self, projector: GraphProjector) -> Result<KnowledgeGraph, IngestError> {
        let db = self.connection();
        let entities = db.all_entities().await?;
        let relationships = db.all_relationships().await?;
        let graph = projector.project(entities, relationships)?;
        tracing::info!(
            "[Manager.export_graph] {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(graph)
    }

    pub async fn get_entity(
        &self,
        key: &CanonicalKey,
    ) -> Result<Option<CanonicalEntity>, IngestError> {
        self.connection().get_entity(key).await
    }

    /// Map any known identifier, canonical or alias, to its canonical key.
    pub async fn resolve(&self, id: &Identifier) -> Result<Option<CanonicalKey>, IngestError> {
        self.connection().resolve_identifier(id).await
    }

    /// Relationships in which `key` is the source or the target.
    pub async fn relationships_of(
        &self,
        key: &CanonicalKey,
    ) -> Result<Vec<Relationship>, IngestError> {
        let db = self.connection();
        let mut rels = db
            .relationships_from(key)
            .await?
            .into_iter()
            .collect::<BTreeSet<_>>();
        rels.extend(db.relationships_to(key).await?);
        Ok(rels.into_iter().collect())
    }

    pub async fn summarize(&self) -> Result<CacheSummary, IngestError> {
        self.connection().summarize().await
    }

    pub async fn is_populated(&self) -> Result<bool, IngestError> {
        self.connection().is_populated().await
    }

    /// HGNC ids of the polypeptides each drug binds.
    pub async fn drug_to_hgnc_ids(
        &self,
    ) -> Result<BTreeMap<CanonicalKey, BTreeSet<String>>, IngestError> {
        self.connection().drug_to_identifiers(namespace::HGNC).await
    }

    pub async fn hgnc_id_to_drugs(
        &self,
    ) -> Result<BTreeMap<String, BTreeSet<CanonicalKey>>, IngestError> {
        self.connection().identifier_to_drugs(namespace::HGNC).await
    }

    pub async fn cache_digest(&self) -> Result<String, IngestError> {
        self.connection().cache_digest().await
    }

    pub async fn clear(&self) -> Result<(), IngestError> {
        self.connection().clear().await
    }
}
