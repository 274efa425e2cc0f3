use crate::{
    codec::{ImportDiagnostic, ResolutionConflict, UnresolvedReference},
    error::IngestError,
    properties::{
        CanonicalEntity, CanonicalKey, EntityKind, Identifier, RelationAttributes, RelationKind,
        Relationship,
    },
    resolver::{DrugAnnotations, IdentifierResolver, PendingRelationship, Resolution},
};
use futures_core::future::BoxFuture;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::{
    error::BoxDynError,
    migrate::{Migration as SqlxMigration, MigrationSource, MigrationType, Migrator},
    pool::PoolOptions,
    sqlite::{Sqlite, SqliteConnectOptions, SqliteConnection},
    ConnectOptions, Execute, Pool, QueryBuilder, Row,
};
use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
    result::Result,
    str::FromStr,
};

pub const DEFAULT_CACHE_FILE: &str = "drugbank_cache.db";

/// <https://www.sqlite.org/limits.html#max_variable_number>
pub const SQLITE_LIMIT_VARIABLE_NUMBER: usize = 32766;

/// Tables in dependency order: children after their parents.
const TABLES: &[&str] = &[
    "entities",
    "aliases",
    "relationships",
    "drug_groups",
    "drug_categories",
    "drug_atc_codes",
    "drug_synonyms",
    "patents",
    "drug_patents",
    "pending_relationships",
];

/// Ordered full-table dumps feeding [DbConnection::cache_digest]. Non-text columns are cast
/// so every value reads as text.
const DIGEST_QUERIES: &[(&str, &str)] = &[
    (
        "entities",
        "SELECT key, namespace, local_id, kind, name, attributes FROM entities ORDER BY key",
    ),
    (
        "aliases",
        "SELECT alias, namespace, canonical_key FROM aliases ORDER BY alias",
    ),
    (
        "relationships",
        "SELECT source, target, kind, attributes FROM relationships \
         ORDER BY source, target, kind",
    ),
    (
        "drug_groups",
        "SELECT drug_key, name FROM drug_groups ORDER BY drug_key, name",
    ),
    (
        "drug_categories",
        "SELECT drug_key, name, mesh_id FROM drug_categories ORDER BY drug_key, name",
    ),
    (
        "drug_atc_codes",
        "SELECT drug_key, code FROM drug_atc_codes ORDER BY drug_key, code",
    ),
    (
        "drug_synonyms",
        "SELECT drug_key, synonym FROM drug_synonyms ORDER BY drug_key, synonym",
    ),
    (
        "patents",
        "SELECT country, number, approved, expires, CAST(pediatric_extension AS TEXT) \
         FROM patents ORDER BY country, number",
    ),
    (
        "drug_patents",
        "SELECT drug_key, country, number FROM drug_patents ORDER BY drug_key, country, number",
    ),
];

/// What a single upsert did to the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum UpsertOutcome {
    Inserted,
    Updated,
    Unchanged,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpsertCounts {
    pub inserted: usize,
    pub updated: usize,
    pub unchanged: usize,
}

impl UpsertCounts {
    pub fn record(&mut self, outcome: UpsertOutcome) {
        match outcome {
            UpsertOutcome::Inserted => self.inserted += 1,
            UpsertOutcome::Updated => self.updated += 1,
            UpsertOutcome::Unchanged => self.unchanged += 1,
        }
    }

    pub fn merge(&mut self, other: &UpsertCounts) {
        self.inserted += other.inserted;
        self.updated += other.updated;
        self.unchanged += other.unchanged;
    }

    /// Inserted or updated rows. Zero on a re-run of an unchanged document.
    pub fn changed(&self) -> usize {
        self.inserted + self.updated
    }

    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.unchanged
    }
}

/// Result of offering an alias to the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AliasUpsert {
    Stored(UpsertOutcome),
    /// Another entity already owns the identifier and keeps it.
    Conflict(CanonicalKey),
}

/// What [Populator::apply] committed for one record.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ApplyOutcome {
    pub entities: UpsertCounts,
    pub aliases: UpsertCounts,
    pub relationships: UpsertCounts,
    pub annotations: UpsertCounts,
    /// Relationships staged because their target is not in the cache yet.
    pub deferred: usize,
    /// Alias claims refused by the cache, e.g. by rows of an earlier import.
    pub conflicts: Vec<ResolutionConflict>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FlushOutcome {
    pub relationships: UpsertCounts,
    pub unresolved: Vec<UnresolvedReference>,
    /// Transactions committed while flushing.
    pub batches: usize,
}

impl FlushOutcome {
    pub fn diagnostics(&self) -> impl Iterator<Item = ImportDiagnostic> + '_ {
        self.unresolved
            .iter()
            .cloned()
            .map(ImportDiagnostic::UnresolvedReference)
    }
}

/// Row counts of the cache.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheSummary {
    pub entities: BTreeMap<EntityKind, u64>,
    pub relationships: BTreeMap<RelationKind, u64>,
    pub aliases: u64,
    pub drug_groups: u64,
    pub drug_categories: u64,
    pub drug_atc_codes: u64,
    pub drug_synonyms: u64,
    pub patents: u64,
}

impl CacheSummary {
    pub fn entity_count(&self) -> u64 {
        self.entities.values().sum()
    }

    pub fn relationship_count(&self) -> u64 {
        self.relationships.values().sum()
    }

    pub fn entities_of(&self, kind: EntityKind) -> u64 {
        self.entities.get(&kind).copied().unwrap_or(0)
    }

    pub fn relationships_of(&self, kind: RelationKind) -> u64 {
        self.relationships.get(&kind).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct DbConnection(pub Pool<Sqlite>);

impl DbConnection {
    #[tracing::instrument(skip(self))]
    pub async fn get_entity(
        &self,
        key: &CanonicalKey,
    ) -> Result<Option<CanonicalEntity>, IngestError> {
        let mut conn = self.0.acquire().await?;
        let Some(mut entity) = fetch_entity(&mut conn, key).await? else {
            return Ok(None);
        };
        let aliases = sqlx::query_as::<_, (String,)>(
            "SELECT alias FROM aliases WHERE canonical_key = ? ORDER BY alias",
        )
        .bind(key.to_string())
        .fetch_all(&mut *conn)
        .await?;
        for (alias,) in aliases {
            entity.aliases.insert(Identifier::from_str(&alias)?);
        }
        Ok(Some(entity))
    }

    /// Canonical keys resolve to themselves, aliases to their owner.
    #[tracing::instrument(skip(self))]
    pub async fn resolve_identifier(
        &self,
        id: &Identifier,
    ) -> Result<Option<CanonicalKey>, IngestError> {
        let mut conn = self.0.acquire().await?;
        resolve_in(&mut conn, id).await
    }

    #[tracing::instrument(skip(self))]
    pub async fn relationships_from(
        &self,
        key: &CanonicalKey,
    ) -> Result<Vec<Relationship>, IngestError> {
        let rels = sqlx::query_as::<_, Relationship>(
            "SELECT source, target, kind, attributes FROM relationships \
             WHERE source = ? ORDER BY target, kind",
        )
        .bind(key.to_string())
        .fetch_all(&self.0)
        .await?;
        Ok(rels)
    }

    #[tracing::instrument(skip(self))]
    pub async fn relationships_to(
        &self,
        key: &CanonicalKey,
    ) -> Result<Vec<Relationship>, IngestError> {
        let rels = sqlx::query_as::<_, Relationship>(
            "SELECT source, target, kind, attributes FROM relationships \
             WHERE target = ? ORDER BY source, kind",
        )
        .bind(key.to_string())
        .fetch_all(&self.0)
        .await?;
        Ok(rels)
    }

    /// Every entity with its aliases, ordered by key.
    pub async fn all_entities(&self) -> Result<Vec<CanonicalEntity>, IngestError> {
        let mut entities = sqlx::query_as::<_, CanonicalEntity>(
            "SELECT key, kind, name, attributes FROM entities ORDER BY key",
        )
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!(
                "[DbConnection.all_entities] Failed to fetch entities\n\terror: {}",
                e
            );
            e
        })?;
        let mut aliases: BTreeMap<String, BTreeSet<Identifier>> = BTreeMap::new();
        for (alias, owner) in
            sqlx::query_as::<_, (String, String)>("SELECT alias, canonical_key FROM aliases")
                .fetch_all(&self.0)
                .await?
        {
            aliases
                .entry(owner)
                .or_default()
                .insert(Identifier::from_str(&alias)?);
        }
        for entity in entities.iter_mut() {
            if let Some(set) = aliases.remove(&entity.key.to_string()) {
                entity.aliases = set;
            }
        }
        Ok(entities)
    }

    pub async fn all_relationships(&self) -> Result<Vec<Relationship>, IngestError> {
        let rels = sqlx::query_as::<_, Relationship>(
            "SELECT source, target, kind, attributes FROM relationships \
             ORDER BY source, target, kind",
        )
        .fetch_all(&self.0)
        .await
        .map_err(|e| {
            tracing::error!(
                "[DbConnection.all_relationships] Failed to fetch relationships\n\terror: {}",
                e
            );
            e
        })?;
        Ok(rels)
    }

    #[tracing::instrument(skip(self))]
    pub async fn summarize(&self) -> Result<CacheSummary, IngestError> {
        let mut summary = CacheSummary::default();
        for (kind, count) in sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) FROM entities GROUP BY kind",
        )
        .fetch_all(&self.0)
        .await?
        {
            summary
                .entities
                .insert(EntityKind::from_str(&kind)?, count as u64);
        }
        for (kind, count) in sqlx::query_as::<_, (String, i64)>(
            "SELECT kind, COUNT(*) FROM relationships GROUP BY kind",
        )
        .fetch_all(&self.0)
        .await?
        {
            summary
                .relationships
                .insert(RelationKind::from_str(&kind)?, count as u64);
        }
        summary.aliases = self.count("aliases").await?;
        summary.drug_groups = self.count("drug_groups").await?;
        summary.drug_categories = self.count("drug_categories").await?;
        summary.drug_atc_codes = self.count("drug_atc_codes").await?;
        summary.drug_synonyms = self.count("drug_synonyms").await?;
        summary.patents = self.count("patents").await?;
        Ok(summary)
    }

    async fn count(&self, table: &str) -> Result<u64, IngestError> {
        let (count,) = sqlx::query_as::<_, (i64,)>(&format!("SELECT COUNT(*) FROM {table}"))
            .fetch_one(&self.0)
            .await?;
        Ok(count as u64)
    }

    pub async fn is_populated(&self) -> Result<bool, IngestError> {
        Ok(self.count("entities").await? > 0)
    }

    /// For each drug, the local ids in `namespace` of the polypeptides it binds, matched on
    /// either the partner's canonical key or its aliases.
    #[tracing::instrument(skip(self))]
    pub async fn drug_to_identifiers(
        &self,
        namespace: &str,
    ) -> Result<BTreeMap<CanonicalKey, BTreeSet<String>>, IngestError> {
        let mut map: BTreeMap<CanonicalKey, BTreeSet<String>> = BTreeMap::new();
        for (drug, identifier) in self.drug_identifier_pairs(namespace).await? {
            map.entry(drug).or_default().insert(identifier.local);
        }
        Ok(map)
    }

    /// Inverse of [DbConnection::drug_to_identifiers].
    #[tracing::instrument(skip(self))]
    pub async fn identifier_to_drugs(
        &self,
        namespace: &str,
    ) -> Result<BTreeMap<String, BTreeSet<CanonicalKey>>, IngestError> {
        let mut map: BTreeMap<String, BTreeSet<CanonicalKey>> = BTreeMap::new();
        for (drug, identifier) in self.drug_identifier_pairs(namespace).await? {
            map.entry(identifier.local).or_default().insert(drug);
        }
        Ok(map)
    }

    async fn drug_identifier_pairs(
        &self,
        namespace: &str,
    ) -> Result<Vec<(CanonicalKey, Identifier)>, IngestError> {
        let mut qb = QueryBuilder::<Sqlite>::new(
            "SELECT r.source, a.alias FROM relationships r \
             JOIN aliases a ON a.canonical_key = r.target WHERE a.namespace = ",
        );
        qb.push_bind(namespace.to_string());
        qb.push(" AND r.kind IN (");
        push_drug_protein_kinds(&mut qb);
        qb.push(") UNION SELECT r.source, e.key FROM relationships r \
                 JOIN entities e ON e.key = r.target WHERE e.namespace = ");
        qb.push_bind(namespace.to_string());
        qb.push(" AND r.kind IN (");
        push_drug_protein_kinds(&mut qb);
        qb.push(")");
        let query = qb.build_query_as::<(String, String)>();
        let sql = query.sql();
        let rows = query.fetch_all(&self.0).await.map_err(|e| {
            tracing::error!(
                "[DbConnection.drug_identifier_pairs] SQL error processing '{}'\n\terror: {}",
                sql,
                e
            );
            e
        })?;
        rows.into_iter()
            .map(|(drug, id)| Ok((CanonicalKey::from_str(&drug)?, Identifier::from_str(&id)?)))
            .collect()
    }

    /// SHA-256 over ordered dumps of every table, hex encoded. Two caches holding the same
    /// rows have the same digest.
    pub async fn cache_digest(&self) -> Result<String, IngestError> {
        let mut hasher = Sha256::new();
        for (table, sql) in DIGEST_QUERIES {
            hasher.update(table.as_bytes());
            hasher.update(b"\x1e");
            for row in sqlx::query(sql).fetch_all(&self.0).await? {
                for idx in 0..row.len() {
                    let value: Option<String> = row.try_get(idx)?;
                    match value {
                        Some(v) => hasher.update(v.as_bytes()),
                        None => hasher.update(b"\x00"),
                    }
                    hasher.update(b"\x1f");
                }
                hasher.update(b"\x1e");
            }
        }
        Ok(hex::encode(hasher.finalize()))
    }

    /// Delete every row. The schema stays in place.
    pub async fn clear(&self) -> Result<(), IngestError> {
        let mut tx = self.0.begin().await?;
        for table in TABLES.iter().rev() {
            sqlx::query(&format!("DELETE FROM {table}"))
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;
        tracing::info!("[DbConnection.clear] cache emptied");
        Ok(())
    }
}

fn push_drug_protein_kinds(qb: &mut QueryBuilder<'_, Sqlite>) {
    let mut separated = qb.separated(", ");
    for kind in RelationKind::drug_protein() {
        separated.push_bind(kind.as_str());
    }
}

async fn fetch_entity(
    conn: &mut SqliteConnection,
    key: &CanonicalKey,
) -> Result<Option<CanonicalEntity>, IngestError> {
    let entity = sqlx::query_as::<_, CanonicalEntity>(
        "SELECT key, kind, name, attributes FROM entities WHERE key = ?",
    )
    .bind(key.to_string())
    .fetch_optional(&mut *conn)
    .await?;
    Ok(entity)
}

async fn alias_owner(
    conn: &mut SqliteConnection,
    id: &Identifier,
) -> Result<Option<CanonicalKey>, IngestError> {
    let owner = sqlx::query_as::<_, (String,)>("SELECT canonical_key FROM aliases WHERE alias = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    owner
        .map(|(key,)| CanonicalKey::from_str(&key))
        .transpose()
}

async fn entity_exists(conn: &mut SqliteConnection, id: &Identifier) -> Result<bool, IngestError> {
    let row = sqlx::query("SELECT 1 FROM entities WHERE key = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?;
    Ok(row.is_some())
}

async fn resolve_in(
    conn: &mut SqliteConnection,
    id: &Identifier,
) -> Result<Option<CanonicalKey>, IngestError> {
    if entity_exists(conn, id).await? {
        return Ok(Some(CanonicalKey(id.clone())));
    }
    alias_owner(conn, id).await
}

/// Writes resolved records into the cache. One record is one transaction.
#[derive(Debug, Clone)]
pub struct Populator {
    db: DbConnection,
}

impl Populator {
    pub fn new(db: DbConnection) -> Self {
        Populator { db }
    }

    pub fn connection(&self) -> &DbConnection {
        &self.db
    }

    /// Commit one resolved record: entities, aliases, drug annotations, then every
    /// relationship whose target is already cached. The rest is staged in
    /// `pending_relationships` for [Populator::flush_deferred].
    #[tracing::instrument(skip_all, fields(record = resolution.record_index, drug = %resolution.drug.key))]
    pub async fn apply(&self, resolution: &Resolution) -> Result<ApplyOutcome, IngestError> {
        let index = Some(resolution.record_index);
        let mut outcome = ApplyOutcome::default();
        let mut tx = self.db.0.begin().await?;

        for entity in resolution.entities() {
            outcome
                .entities
                .record(Populator::upsert_entity(&mut tx, entity, index).await?);
        }
        for entity in resolution.entities() {
            for alias in entity.aliases.iter() {
                match Populator::upsert_alias(&mut tx, alias, &entity.key).await? {
                    AliasUpsert::Stored(stored) => outcome.aliases.record(stored),
                    AliasUpsert::Conflict(owner) => {
                        outcome.conflicts.push(ResolutionConflict {
                            identifier: alias.clone(),
                            kept_key: owner,
                            rejected_key: entity.key.clone(),
                            record_index: resolution.record_index,
                        });
                    }
                }
            }
        }
        outcome.annotations.record(
            Populator::replace_drug_annotations(&mut tx, &resolution.drug.key, &resolution.annotations)
                .await?,
        );
        let mut deferred = Vec::new();
        for pending in resolution.relationships.iter() {
            match resolve_in(&mut tx, &pending.target).await? {
                Some(target) => {
                    let rel = Relationship {
                        source: pending.source.clone(),
                        target,
                        kind: pending.kind,
                        attributes: pending.attributes.clone(),
                    };
                    outcome
                        .relationships
                        .record(Populator::upsert_relationship(&mut tx, &rel).await?);
                }
                None => deferred.push(pending),
            }
        }
        stage_pending(&mut tx, &deferred).await?;
        outcome.deferred = deferred.len();

        tx.commit().await.map_err(|e| {
            tracing::error!(
                "[Populator.apply] commit failed for record #{}\n\terror: {}",
                resolution.record_index,
                e
            );
            e
        })?;
        tracing::debug!(
            "[Populator.apply] record #{} committed: {} entities, {} aliases, {} relationships, {} deferred",
            resolution.record_index,
            outcome.entities.total(),
            outcome.aliases.total(),
            outcome.relationships.total(),
            outcome.deferred
        );
        Ok(outcome)
    }

    /// Drop relationships staged by an earlier run that did not reach its flush.
    pub async fn discard_pending(&self) -> Result<u64, IngestError> {
        let done = sqlx::query("DELETE FROM pending_relationships")
            .execute(&self.db.0)
            .await?;
        if done.rows_affected() > 0 {
            tracing::info!(
                "[Populator.discard_pending] discarded {} staged relationships",
                done.rows_affected()
            );
        }
        Ok(done.rows_affected())
    }

    /// Retry staged relationships once the whole stream has been committed, `batch_size` rows
    /// per transaction. Targets are looked up through the run's alias table first, then
    /// through the cache. Each batch leaves the staging table as it commits.
    #[tracing::instrument(skip_all, fields(batch_size = batch_size))]
    pub async fn flush_deferred(
        &self,
        resolver: &IdentifierResolver,
        batch_size: usize,
    ) -> Result<FlushOutcome, IngestError> {
        let batch_size = batch_size.max(1);
        let mut outcome = FlushOutcome::default();
        loop {
            let mut tx = self.db.0.begin().await?;
            let rows = sqlx::query_as::<_, PendingRow>(
                "SELECT id, source, target, kind, attributes, record_index \
                 FROM pending_relationships ORDER BY id LIMIT ?",
            )
            .bind(batch_size as i64)
            .fetch_all(&mut *tx)
            .await?;
            let Some(last_id) = rows.last().map(|row| row.0) else {
                break;
            };
            let batch_len = rows.len();
            for row in rows {
                let pending = pending_from_row(row)?;
                let mut target = None;
                if let Some(key) = resolver.resolve_reference(&pending.target) {
                    if entity_exists(&mut tx, key.as_identifier()).await? {
                        target = Some(key);
                    }
                }
                if target.is_none() {
                    target = resolve_in(&mut tx, &pending.target).await?;
                }
                match target {
                    Some(target) => {
                        let rel = Relationship {
                            source: pending.source,
                            target,
                            kind: pending.kind,
                            attributes: pending.attributes,
                        };
                        outcome
                            .relationships
                            .record(Populator::upsert_relationship(&mut tx, &rel).await?);
                    }
                    None => {
                        tracing::debug!(
                            "[Populator.flush_deferred] dropping {} -[{}]-> {}",
                            pending.source,
                            pending.kind,
                            pending.target
                        );
                        outcome.unresolved.push(UnresolvedReference {
                            source: pending.source,
                            target: pending.target,
                            kind: pending.kind,
                            record_index: pending.record_index,
                        });
                    }
                }
            }
            sqlx::query("DELETE FROM pending_relationships WHERE id <= ?")
                .bind(last_id)
                .execute(&mut *tx)
                .await?;
            tx.commit().await?;
            outcome.batches += 1;
            tracing::debug!(
                "[Populator.flush_deferred] batch {} committed ({} rows)",
                outcome.batches,
                batch_len
            );
        }
        Ok(outcome)
    }

    /// Insert or merge an entity.
    ///
    /// Fails with [IngestError::SchemaIntegrity] if the key is already an alias of another
    /// entity, or if a drug and a polypeptide would share the key.
    pub async fn upsert_entity(
        conn: &mut SqliteConnection,
        entity: &CanonicalEntity,
        record_index: Option<usize>,
    ) -> Result<UpsertOutcome, IngestError> {
        if let Some(owner) = alias_owner(conn, entity.key.as_identifier()).await? {
            if owner != entity.key {
                return Err(IngestError::integrity(
                    &entity.key,
                    format!("canonical key is already an alias of {owner}"),
                    record_index,
                ));
            }
        }
        let existing = fetch_entity(conn, &entity.key).await?;
        let (name, data, outcome) = match existing {
            None => (entity.name.clone(), entity.data.clone(), UpsertOutcome::Inserted),
            Some(existing) => {
                let merged = existing
                    .data
                    .merge(&entity.data)
                    .map_err(|detail| IngestError::integrity(&entity.key, detail, record_index))?;
                // Drugs are described by their own record; partners keep the first name seen.
                let name = match entity.kind() {
                    EntityKind::Drug => entity.name.clone(),
                    _ => existing.name.clone(),
                };
                if merged == existing.data && name == existing.name {
                    return Ok(UpsertOutcome::Unchanged);
                }
                (name, merged, UpsertOutcome::Updated)
            }
        };
        sqlx::query(
            "INSERT INTO entities (key, namespace, local_id, kind, name, attributes) \
             VALUES (?, ?, ?, ?, ?, ?) \
             ON CONFLICT(key) DO UPDATE SET kind = excluded.kind, name = excluded.name, \
             attributes = excluded.attributes",
        )
        .bind(entity.key.to_string())
        .bind(entity.key.namespace.clone())
        .bind(entity.key.local.clone())
        .bind(data.kind().as_str())
        .bind(name)
        .bind(data.attributes_json()?)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(
                "[Populator.upsert_entity] failed to write {}\n\terror: {}",
                entity.key,
                e
            );
            match IngestError::from(e) {
                IngestError::SchemaIntegrity { detail, .. } => {
                    IngestError::integrity(&entity.key, detail, record_index)
                }
                other => other,
            }
        })?;
        Ok(outcome)
    }

    pub async fn upsert_alias(
        conn: &mut SqliteConnection,
        alias: &Identifier,
        key: &CanonicalKey,
    ) -> Result<AliasUpsert, IngestError> {
        if alias == key.as_identifier() {
            return Ok(AliasUpsert::Stored(UpsertOutcome::Unchanged));
        }
        if entity_exists(conn, alias).await? {
            return Ok(AliasUpsert::Conflict(CanonicalKey(alias.clone())));
        }
        match alias_owner(conn, alias).await? {
            Some(owner) if owner == *key => Ok(AliasUpsert::Stored(UpsertOutcome::Unchanged)),
            Some(owner) => Ok(AliasUpsert::Conflict(owner)),
            None => {
                sqlx::query("INSERT INTO aliases (alias, namespace, canonical_key) VALUES (?, ?, ?)")
                    .bind(alias.to_string())
                    .bind(alias.namespace.clone())
                    .bind(key.to_string())
                    .execute(&mut *conn)
                    .await?;
                Ok(AliasUpsert::Stored(UpsertOutcome::Inserted))
            }
        }
    }

    /// Insert a relationship, or merge its attributes into the stored one.
    pub async fn upsert_relationship(
        conn: &mut SqliteConnection,
        rel: &Relationship,
    ) -> Result<UpsertOutcome, IngestError> {
        let existing = sqlx::query_as::<_, (String,)>(
            "SELECT attributes FROM relationships WHERE source = ? AND target = ? AND kind = ?",
        )
        .bind(rel.source.to_string())
        .bind(rel.target.to_string())
        .bind(rel.kind.as_str())
        .fetch_optional(&mut *conn)
        .await?;
        let (attributes, outcome) = match existing {
            None => (rel.attributes.clone(), UpsertOutcome::Inserted),
            Some((json,)) => {
                let stored: RelationAttributes = serde_json::from_str(&json)?;
                let merged = stored.merge(&rel.attributes);
                if merged == stored {
                    return Ok(UpsertOutcome::Unchanged);
                }
                (merged, UpsertOutcome::Updated)
            }
        };
        sqlx::query(
            "INSERT INTO relationships (source, target, kind, attributes) VALUES (?, ?, ?, ?) \
             ON CONFLICT(source, target, kind) DO UPDATE SET attributes = excluded.attributes",
        )
        .bind(rel.source.to_string())
        .bind(rel.target.to_string())
        .bind(rel.kind.as_str())
        .bind(serde_json::to_string(&attributes)?)
        .execute(&mut *conn)
        .await
        .map_err(|e| {
            tracing::error!(
                "[Populator.upsert_relationship] failed to write {} -[{}]-> {}\n\terror: {}",
                rel.source,
                rel.kind,
                rel.target,
                e
            );
            e
        })?;
        Ok(outcome)
    }

    /// Replace a drug's groups, categories, ATC codes, synonyms and patent links. Nothing is
    /// written when the stored annotations already match.
    pub async fn replace_drug_annotations(
        conn: &mut SqliteConnection,
        drug: &CanonicalKey,
        annotations: &DrugAnnotations,
    ) -> Result<UpsertOutcome, IngestError> {
        let incoming = AnnotationRows::from(annotations);
        let stored = AnnotationRows::load(conn, drug).await?;
        if incoming == stored {
            return Ok(UpsertOutcome::Unchanged);
        }
        let outcome = match stored.is_empty() {
            true => UpsertOutcome::Inserted,
            false => UpsertOutcome::Updated,
        };
        let drug_key = drug.to_string();
        for table in [
            "drug_groups",
            "drug_categories",
            "drug_atc_codes",
            "drug_synonyms",
            "drug_patents",
        ] {
            sqlx::query(&format!("DELETE FROM {table} WHERE drug_key = ?"))
                .bind(drug_key.clone())
                .execute(&mut *conn)
                .await?;
        }
        insert_pairs(conn, "drug_groups", "name", &drug_key, &incoming.groups).await?;
        insert_pairs(conn, "drug_atc_codes", "code", &drug_key, &incoming.atc_codes).await?;
        insert_pairs(conn, "drug_synonyms", "synonym", &drug_key, &incoming.synonyms).await?;

        let categories = incoming.categories.iter().collect::<Vec<_>>();
        for chunk in categories.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 3) {
            let mut qb = QueryBuilder::<Sqlite>::new(
                "INSERT OR IGNORE INTO drug_categories (drug_key, name, mesh_id) ",
            );
            qb.push_values(chunk.iter(), |mut b, (name, mesh_id)| {
                b.push_bind(drug_key.clone())
                    .push_bind(name.clone())
                    .push_bind(mesh_id.clone());
            });
            qb.build().execute(&mut *conn).await?;
        }

        for (country, number, approved, expires, pediatric) in incoming.patents.iter() {
            sqlx::query(
                "INSERT INTO patents (country, number, approved, expires, pediatric_extension) \
                 VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(country, number) DO UPDATE SET approved = excluded.approved, \
                 expires = excluded.expires, pediatric_extension = excluded.pediatric_extension",
            )
            .bind(country.clone())
            .bind(number.clone())
            .bind(approved.clone())
            .bind(expires.clone())
            .bind(*pediatric)
            .execute(&mut *conn)
            .await?;
            sqlx::query(
                "INSERT OR IGNORE INTO drug_patents (drug_key, country, number) VALUES (?, ?, ?)",
            )
            .bind(drug_key.clone())
            .bind(country.clone())
            .bind(number.clone())
            .execute(&mut *conn)
            .await?;
        }
        Ok(outcome)
    }
}

type PendingRow = (i64, String, String, String, String, i64);

fn pending_from_row(row: PendingRow) -> Result<PendingRelationship, IngestError> {
    let (_, source, target, kind, attributes, record_index) = row;
    Ok(PendingRelationship {
        source: CanonicalKey::from_str(&source)?,
        target: Identifier::from_str(&target)?,
        kind: RelationKind::from_str(&kind)?,
        attributes: serde_json::from_str(&attributes)?,
        record_index: record_index as usize,
    })
}

/// Park relationships whose target has not been committed yet.
async fn stage_pending(
    conn: &mut SqliteConnection,
    pending: &[&PendingRelationship],
) -> Result<(), IngestError> {
    for chunk in pending.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 5) {
        let mut rows = Vec::with_capacity(chunk.len());
        for rel in chunk {
            rows.push((
                rel.source.to_string(),
                rel.target.to_string(),
                rel.kind.as_str(),
                serde_json::to_string(&rel.attributes)?,
                rel.record_index as i64,
            ));
        }
        let mut qb = QueryBuilder::<Sqlite>::new(
            "INSERT INTO pending_relationships (source, target, kind, attributes, record_index) ",
        );
        qb.push_values(rows, |mut b, (source, target, kind, attributes, index)| {
            b.push_bind(source)
                .push_bind(target)
                .push_bind(kind)
                .push_bind(attributes)
                .push_bind(index);
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

async fn insert_pairs(
    conn: &mut SqliteConnection,
    table: &str,
    column: &str,
    drug_key: &str,
    values: &BTreeSet<String>,
) -> Result<(), IngestError> {
    let values = values.iter().collect::<Vec<_>>();
    for chunk in values.chunks(SQLITE_LIMIT_VARIABLE_NUMBER / 2) {
        let mut qb = QueryBuilder::<Sqlite>::new(format!(
            "INSERT OR IGNORE INTO {table} (drug_key, {column}) "
        ));
        qb.push_values(chunk.iter(), |mut b, value| {
            b.push_bind(drug_key.to_string()).push_bind((*value).clone());
        });
        qb.build().execute(&mut *conn).await?;
    }
    Ok(())
}

type PatentRow = (String, String, Option<String>, Option<String>, bool);

/// Normalized, comparable form of a drug's annotation rows.
#[derive(Debug, Default, PartialEq, Eq)]
struct AnnotationRows {
    groups: BTreeSet<String>,
    categories: BTreeSet<(String, Option<String>)>,
    atc_codes: BTreeSet<String>,
    synonyms: BTreeSet<String>,
    patents: BTreeSet<PatentRow>,
}

impl From<&DrugAnnotations> for AnnotationRows {
    fn from(annotations: &DrugAnnotations) -> Self {
        // One row per category name; the first MeSH id listed wins.
        let mut categories = BTreeMap::new();
        for category in annotations.categories.iter() {
            categories
                .entry(category.name.clone())
                .or_insert_with(|| category.mesh_id.clone());
        }
        let mut patents = BTreeMap::new();
        for patent in annotations.patents.iter() {
            patents
                .entry((patent.country.clone(), patent.number.clone()))
                .or_insert_with(|| {
                    (
                        patent.approved.map(|d| d.to_string()),
                        patent.expires.map(|d| d.to_string()),
                        patent.pediatric_extension,
                    )
                });
        }
        AnnotationRows {
            groups: annotations.groups.clone(),
            categories: categories.into_iter().collect(),
            atc_codes: annotations.atc_codes.clone(),
            synonyms: annotations.synonyms.clone(),
            patents: patents
                .into_iter()
                .map(|((country, number), (approved, expires, ped))| {
                    (country, number, approved, expires, ped)
                })
                .collect(),
        }
    }
}

impl AnnotationRows {
    fn is_empty(&self) -> bool {
        self.groups.is_empty()
            && self.categories.is_empty()
            && self.atc_codes.is_empty()
            && self.synonyms.is_empty()
            && self.patents.is_empty()
    }

    async fn load(conn: &mut SqliteConnection, drug: &CanonicalKey) -> Result<Self, IngestError> {
        let key = drug.to_string();
        let strings = |sql: &'static str| {
            sqlx::query_as::<Sqlite, (String,)>(sql).bind(key.clone())
        };
        let groups = strings("SELECT name FROM drug_groups WHERE drug_key = ?")
            .fetch_all(&mut *conn)
            .await?;
        let atc_codes = strings("SELECT code FROM drug_atc_codes WHERE drug_key = ?")
            .fetch_all(&mut *conn)
            .await?;
        let synonyms = strings("SELECT synonym FROM drug_synonyms WHERE drug_key = ?")
            .fetch_all(&mut *conn)
            .await?;
        let categories = sqlx::query_as::<_, (String, Option<String>)>(
            "SELECT name, mesh_id FROM drug_categories WHERE drug_key = ?",
        )
        .bind(key.clone())
        .fetch_all(&mut *conn)
        .await?;
        let patents = sqlx::query_as::<_, PatentRow>(
            "SELECT p.country, p.number, p.approved, p.expires, p.pediatric_extension \
             FROM drug_patents d JOIN patents p ON p.country = d.country AND p.number = d.number \
             WHERE d.drug_key = ?",
        )
        .bind(key.clone())
        .fetch_all(&mut *conn)
        .await?;
        Ok(AnnotationRows {
            groups: groups.into_iter().map(|(g,)| g).collect(),
            categories: categories.into_iter().collect(),
            atc_codes: atc_codes.into_iter().map(|(c,)| c).collect(),
            synonyms: synonyms.into_iter().map(|(s,)| s).collect(),
            patents: patents.into_iter().collect(),
        })
    }
}

/// A migration definition.
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: i64,
    pub description: &'static str,
    pub sql: &'static str,
    pub kind: MigrationType,
}

#[derive(Debug, Clone)]
struct MigrationList(Vec<Migration>);

impl MigrationSource<'static> for MigrationList {
    fn resolve(self) -> BoxFuture<'static, Result<Vec<SqlxMigration>, BoxDynError>> {
        Box::pin(async move {
            let mut migrations = Vec::new();
            for migration in self.0 {
                if matches!(migration.kind, MigrationType::ReversibleUp) {
                    migrations.push(SqlxMigration::new(
                        migration.version,
                        migration.description.into(),
                        migration.kind,
                        migration.sql.into(),
                        false,
                    ));
                }
            }
            Ok(migrations)
        })
    }
}

fn migrations() -> MigrationList {
    MigrationList(vec![
        Migration {
            version: 1,
            description: "create_initial_tables",
            sql: "\
            CREATE TABLE entities (key TEXT PRIMARY KEY NOT NULL, namespace TEXT NOT NULL, \
                local_id TEXT NOT NULL, kind TEXT NOT NULL, name TEXT NOT NULL, attributes TEXT NOT NULL); \
            CREATE TABLE aliases (alias TEXT PRIMARY KEY NOT NULL, namespace TEXT NOT NULL, \
                canonical_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE); \
            CREATE INDEX aliases_by_key ON aliases(canonical_key); \
            CREATE TABLE relationships (source TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                target TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, kind TEXT NOT NULL, \
                attributes TEXT NOT NULL, UNIQUE(source, target, kind)); \
            CREATE INDEX relationships_by_target ON relationships(target); \
            CREATE TABLE drug_groups (drug_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                name TEXT NOT NULL, UNIQUE(drug_key, name)); \
            CREATE TABLE drug_categories (drug_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                name TEXT NOT NULL, mesh_id TEXT, UNIQUE(drug_key, name)); \
            CREATE TABLE drug_atc_codes (drug_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                code TEXT NOT NULL, UNIQUE(drug_key, code)); \
            CREATE TABLE drug_synonyms (drug_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                synonym TEXT NOT NULL, UNIQUE(drug_key, synonym)); \
            CREATE TABLE patents (country TEXT NOT NULL, number TEXT NOT NULL, approved TEXT, expires TEXT, \
                pediatric_extension INTEGER NOT NULL DEFAULT 0, UNIQUE(country, number)); \
            CREATE TABLE drug_patents (drug_key TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                country TEXT NOT NULL, number TEXT NOT NULL, UNIQUE(drug_key, country, number), \
                FOREIGN KEY(country, number) REFERENCES patents(country, number));",
            kind: MigrationType::ReversibleUp,
        },
        Migration {
            version: 2,
            description: "create_pending_relationships",
            sql: "\
            CREATE TABLE pending_relationships (id INTEGER PRIMARY KEY AUTOINCREMENT, \
                source TEXT NOT NULL REFERENCES entities(key) ON DELETE CASCADE, \
                target TEXT NOT NULL, kind TEXT NOT NULL, attributes TEXT NOT NULL, \
                record_index INTEGER NOT NULL);",
            kind: MigrationType::ReversibleUp,
        },
    ])
}

/// Open (creating if needed) the SQLite cache at `db_path` and bring its schema up to date.
pub async fn db_init<P: AsRef<Path>>(db_path: P) -> Result<Pool<Sqlite>, IngestError> {
    let db_path = db_path.as_ref();
    tracing::debug!("Initializing cache db from file: {:?}", db_path);
    let options = SqliteConnectOptions::new()
        .filename(db_path)
        .read_only(false)
        .foreign_keys(true)
        .create_if_missing(true)
        .disable_statement_logging();

    let pool = PoolOptions::<Sqlite>::new()
        .max_connections(4)
        .connect_with(options)
        .await?;

    let migrator = Migrator::new(migrations()).await?;
    migrator.run(&pool).await?;

    let count_res = sqlx::query("SELECT COUNT(*) FROM entities;")
        .fetch_one(&pool)
        .await?;
    let rel_res = sqlx::query("SELECT COUNT(*) FROM relationships;")
        .fetch_one(&pool)
        .await?;
    tracing::info!(
        "DB Connection initialized.\n \
         \tCached entity count:\t{:?} \n \
         \tCached relationship count:\t{:?}",
        count_res.try_get::<i64, usize>(0).ok(),
        rel_res.try_get::<i64, usize>(0).ok()
    );

    Ok(pool)
}
