//! End-to-end imports of the fixture documents under `tests/fixtures/`.

mod common;

use common::{fixture, open_manager, test_config};
use drugbank_graph::{
    config::MalformedRecordPolicy,
    manager::Manager,
    properties::{CanonicalKey, EntityKind, Identifier, RelationKind},
    IngestError, ParseError,
};
use std::collections::{BTreeMap, BTreeSet};
use tempfile::TempDir;

fn drug(id: &str) -> CanonicalKey {
    CanonicalKey::new("drugbank", id)
}

fn protein(accession: &str) -> CanonicalKey {
    CanonicalKey::new("uniprot", accession)
}

#[tokio::test]
async fn test_sample_import_counts() {
    let (_temp_dir, manager) = open_manager().await;
    let report = manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    assert_eq!(report.records_read, 4);
    assert_eq!(report.records_committed, 4);
    assert_eq!(report.records_skipped, 0);
    assert_eq!(report.conflict_count(), 0);

    let summary = manager.summarize().await.unwrap();
    assert_eq!(summary.entity_count(), 10);
    assert_eq!(summary.entities_of(EntityKind::Drug), 4);
    assert_eq!(summary.entities_of(EntityKind::Protein), 2);
    assert_eq!(summary.entities_of(EntityKind::Enzyme), 2);
    assert_eq!(summary.entities_of(EntityKind::Carrier), 1);
    assert_eq!(summary.entities_of(EntityKind::Transporter), 1);

    assert_eq!(summary.relationship_count(), 10);
    assert_eq!(summary.relationships_of(RelationKind::DrugTargetsProtein), 4);
    assert_eq!(
        summary.relationships_of(RelationKind::DrugMetabolizedByEnzyme),
        2
    );
    assert_eq!(summary.relationships_of(RelationKind::DrugCarriedBy), 1);
    assert_eq!(summary.relationships_of(RelationKind::DrugTransportedBy), 1);
    assert_eq!(
        summary.relationships_of(RelationKind::DrugInteractsWithDrug),
        2
    );

    assert_eq!(summary.drug_groups, 6);
    assert_eq!(summary.patents, 1);
    assert!(manager.is_populated().await.unwrap());
}

#[tokio::test]
async fn test_reimport_is_idempotent() {
    let (_temp_dir, manager) = open_manager().await;
    let first = manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    let digest = manager.cache_digest().await.unwrap();
    assert!(!first.is_unchanged());

    let second = manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    assert!(
        second.is_unchanged(),
        "second import should not change any row: {second:?}"
    );
    assert_eq!(manager.cache_digest().await.unwrap(), digest);
    assert_eq!(
        second.unresolved_references().count(),
        first.unresolved_references().count()
    );
}

#[tokio::test]
async fn test_aliases_are_disjoint_from_each_other_and_from_keys() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    manager
        .populate(fixture("conflicting_aliases.xml"))
        .await
        .unwrap();

    let entities = manager.connection().all_entities().await.unwrap();
    let keys = entities
        .iter()
        .map(|e| e.key.as_identifier().clone())
        .collect::<BTreeSet<_>>();
    let mut owners: BTreeMap<Identifier, CanonicalKey> = BTreeMap::new();
    for entity in entities.iter() {
        for alias in entity.aliases.iter() {
            assert!(!keys.contains(alias), "{alias} is both a key and an alias");
            if let Some(previous) = owners.insert(alias.clone(), entity.key.clone()) {
                panic!("{alias} belongs to both {previous} and {}", entity.key);
            }
        }
    }
    assert!(!owners.is_empty());
}

#[tokio::test]
async fn test_every_relationship_endpoint_is_an_entity() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    let db = manager.connection();
    let keys = db
        .all_entities()
        .await
        .unwrap()
        .into_iter()
        .map(|e| e.key)
        .collect::<BTreeSet<_>>();
    for rel in db.all_relationships().await.unwrap() {
        assert!(keys.contains(&rel.source), "dangling source {}", rel.source);
        assert!(keys.contains(&rel.target), "dangling target {}", rel.target);
    }
}

#[tokio::test]
async fn test_first_alias_claim_wins() {
    let (_temp_dir, manager) = open_manager().await;
    let report = manager
        .populate(fixture("conflicting_aliases.xml"))
        .await
        .unwrap();

    let x1 = Identifier::new("kegg.drug", "X1");
    assert_eq!(report.conflict_count(), 1);
    let conflict = &report.conflicts[0];
    assert_eq!(conflict.identifier, x1);
    assert_eq!(conflict.kept_key, drug("DB10001"));
    assert_eq!(conflict.rejected_key, drug("DB10002"));
    assert_eq!(conflict.record_index, 1);
    assert!(report.diagnostics.iter().any(|d| d.is_conflict()));

    assert_eq!(manager.resolve(&x1).await.unwrap(), Some(drug("DB10001")));
    let rejected = manager.get_entity(&drug("DB10002")).await.unwrap().unwrap();
    assert!(!rejected.aliases.contains(&x1));
    assert!(rejected
        .aliases
        .contains(&Identifier::new("chembl", "CHEMBL2")));
}

#[tokio::test]
async fn test_version_mismatch_writes_nothing() {
    let (_temp_dir, manager) = open_manager().await;
    let result = manager.populate(fixture("version_mismatch.xml")).await;
    match result {
        Err(IngestError::Parse(ParseError::UnsupportedVersion { expected, found })) => {
            assert_eq!(expected, "5.1");
            assert_eq!(found, "5.0");
        }
        other => panic!("expected an unsupported version error, got {other:?}"),
    }
    assert!(!manager.is_populated().await.unwrap());
    assert_eq!(manager.summarize().await.unwrap().aliases, 0);
}

#[tokio::test]
async fn test_missing_document_is_not_found() {
    let (_temp_dir, manager) = open_manager().await;
    let result = manager.populate(fixture("absent.xml")).await;
    assert!(
        matches!(
            result,
            Err(IngestError::NotFound(_)) | Err(IngestError::Parse(ParseError::Io(_)))
        ),
        "unexpected result: {result:?}"
    );
}

#[tokio::test]
async fn test_forward_interaction_is_resolved_after_stream() {
    let (_temp_dir, manager) = open_manager().await;
    let report = manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    // DB00001 interacts with DB00006, which appears later in the document.
    let lepirudin = manager.relationships_of(&drug("DB00001")).await.unwrap();
    assert!(lepirudin.iter().any(|rel| rel.source == drug("DB00001")
        && rel.target == drug("DB00006")
        && rel.kind == RelationKind::DrugInteractsWithDrug));

    let unresolved = report.unresolved_references().collect::<Vec<_>>();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].source, drug("DB00001"));
    assert_eq!(unresolved[0].target, Identifier::new("drugbank", "DB99999"));
    assert_eq!(unresolved[0].kind, RelationKind::DrugInteractsWithDrug);
}

#[tokio::test]
async fn test_partner_without_sequence_joins_known_protein() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    let thrombin = manager.get_entity(&protein("P00734")).await.unwrap().unwrap();
    assert_eq!(thrombin.kind(), EntityKind::Protein);
    assert_eq!(thrombin.name, "Prothrombin");
    assert!(thrombin
        .aliases
        .contains(&Identifier::new("drugbank.bioentity", "BE0000048")));

    let sources = manager
        .connection()
        .relationships_to(&protein("P00734"))
        .await
        .unwrap()
        .into_iter()
        .map(|rel| rel.source)
        .collect::<BTreeSet<_>>();
    assert_eq!(
        sources,
        BTreeSet::from([drug("DB00001"), drug("DB00006")])
    );
    assert!(manager
        .get_entity(&CanonicalKey::new("drugbank.bioentity", "BE0000048"))
        .await
        .unwrap()
        .is_none());
}

#[tokio::test]
async fn test_polypeptide_in_two_roles_is_stored_as_enzyme() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    let cox1 = manager.get_entity(&protein("P23219")).await.unwrap().unwrap();
    assert_eq!(cox1.kind(), EntityKind::Enzyme);
    let kinds = manager
        .connection()
        .relationships_to(&protein("P23219"))
        .await
        .unwrap()
        .into_iter()
        .map(|rel| rel.kind)
        .collect::<BTreeSet<_>>();
    assert_eq!(
        kinds,
        BTreeSet::from([
            RelationKind::DrugTargetsProtein,
            RelationKind::DrugMetabolizedByEnzyme
        ])
    );
}

#[tokio::test]
async fn test_lookup_by_alias() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    let cases = [
        (Identifier::new("drugbank", "BTD00024"), drug("DB00001")),
        (Identifier::new("cas", "50-78-2"), drug("DB00945")),
        (
            Identifier::new("inchikey", "BSYNRYMUTXBXSQ-UHFFFAOYSA-N"),
            drug("DB00945"),
        ),
        (Identifier::new("hgnc", "3236"), protein("P00533")),
        (Identifier::new("drugbank", "DB00002"), drug("DB00002")),
    ];
    for (id, expected) in cases {
        assert_eq!(manager.resolve(&id).await.unwrap(), Some(expected), "{id}");
    }
    assert_eq!(
        manager
            .resolve(&Identifier::new("drugbank", "DB99999"))
            .await
            .unwrap(),
        None
    );
}

#[tokio::test]
async fn test_hgnc_lookups() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();

    let by_drug = manager.drug_to_hgnc_ids().await.unwrap();
    assert_eq!(
        by_drug.get(&drug("DB00001")),
        Some(&BTreeSet::from(["3535".to_string()]))
    );
    assert_eq!(
        by_drug.get(&drug("DB00945")),
        Some(&BTreeSet::from([
            "2623".to_string(),
            "399".to_string(),
            "55".to_string(),
            "9604".to_string(),
        ]))
    );

    let by_gene = manager.hgnc_id_to_drugs().await.unwrap();
    assert_eq!(
        by_gene.get("3535"),
        Some(&BTreeSet::from([drug("DB00001"), drug("DB00006")]))
    );
    assert_eq!(
        by_gene.get("3236"),
        Some(&BTreeSet::from([drug("DB00002")]))
    );
}

#[tokio::test]
async fn test_malformed_record_is_skipped_by_default() {
    let (_temp_dir, manager) = open_manager().await;
    let report = manager
        .populate(fixture("malformed_record.xml"))
        .await
        .unwrap();

    assert_eq!(report.records_committed, 2);
    assert_eq!(report.records_skipped, 1);
    assert!(report
        .diagnostics
        .iter()
        .any(|d| d.is_malformed_record()));
    assert!(manager.get_entity(&drug("DB20003")).await.unwrap().is_some());
    assert!(manager.get_entity(&drug("DB20002")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_malformed_record_aborts_when_configured() {
    common::init_logging();
    let temp_dir = TempDir::new().unwrap();
    let config = test_config(&temp_dir).with_malformed_records(MalformedRecordPolicy::Abort);
    let manager = Manager::open(config).await.unwrap();

    let result = manager.populate(fixture("malformed_record.xml")).await;
    assert!(
        matches!(
            result,
            Err(IngestError::Parse(ParseError::MalformedRecord { index: 1, .. }))
        ),
        "unexpected result: {result:?}"
    );
    // Records before the malformed one stay committed.
    assert!(manager.get_entity(&drug("DB20001")).await.unwrap().is_some());
    assert!(manager.get_entity(&drug("DB20003")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_key_already_used_as_alias_aborts_import() {
    let (_temp_dir, manager) = open_manager().await;
    let result = manager.populate(fixture("alias_as_key.xml")).await;
    match result {
        Err(IngestError::SchemaIntegrity {
            key, record_index, ..
        }) => {
            assert_eq!(key, "drugbank:DB30002");
            assert_eq!(record_index, Some(1));
        }
        other => panic!("expected a schema integrity error, got {other:?}"),
    }
    assert!(manager.get_entity(&drug("DB30001")).await.unwrap().is_some());
    assert!(manager.get_entity(&drug("DB30002")).await.unwrap().is_none());
    assert!(manager.get_entity(&drug("DB30003")).await.unwrap().is_none());
}

#[tokio::test]
async fn test_populate_from_reader() {
    let (_temp_dir, manager) = open_manager().await;
    let document = std::fs::read(fixture("conflicting_aliases.xml")).unwrap();
    let report = manager
        .populate_reader(std::io::Cursor::new(document))
        .await
        .unwrap();
    assert_eq!(report.records_committed, 2);
    assert_eq!(manager.summarize().await.unwrap().entity_count(), 2);
}

#[tokio::test]
async fn test_clear_empties_cache() {
    let (_temp_dir, manager) = open_manager().await;
    let empty_digest = manager.cache_digest().await.unwrap();
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    assert_ne!(manager.cache_digest().await.unwrap(), empty_digest);

    manager.clear().await.unwrap();
    assert!(!manager.is_populated().await.unwrap());
    assert_eq!(manager.cache_digest().await.unwrap(), empty_digest);

    let report = manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    assert_eq!(report.records_committed, 4);
}

const BIOTECH_WITH_UNIPROT_XREF: &str = r#"<drug type="biotech">
  <drugbank-id primary="true">DB00100</drugbank-id>
  <name>Recombinant thrombin</name>
  <external-identifiers>
    <external-identifier>
      <resource>UniProtKB</resource>
      <identifier>P00734</identifier>
    </external-identifier>
  </external-identifiers>
</drug>"#;

const THROMBIN_INHIBITOR: &str = r#"<drug type="small molecule">
  <drugbank-id primary="true">DB00200</drugbank-id>
  <name>Thrombin inhibitor</name>
  <targets>
    <target position="1">
      <id>BE0000048</id>
      <name>Prothrombin</name>
      <polypeptide id="P00734" source="Swiss-Prot">
        <name>Prothrombin</name>
        <gene-name>F2</gene-name>
      </polypeptide>
    </target>
  </targets>
</drug>"#;

fn document(records: &[&str]) -> String {
    format!(
        "<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n\
         <drugbank xmlns=\"http://www.drugbank.ca\" version=\"5.1\">\n{}\n</drugbank>\n",
        records.join("\n")
    )
}

#[tokio::test]
async fn test_drug_uniprot_xref_imports_in_either_order() {
    let orders = [
        [BIOTECH_WITH_UNIPROT_XREF, THROMBIN_INHIBITOR],
        [THROMBIN_INHIBITOR, BIOTECH_WITH_UNIPROT_XREF],
    ];
    let mut digests = Vec::new();
    for order in orders {
        let (_temp_dir, manager) = open_manager().await;
        let report = manager
            .populate_reader(std::io::Cursor::new(document(&order)))
            .await
            .unwrap();
        assert_eq!(report.records_committed, 2);
        assert_eq!(report.conflict_count(), 0);

        let thrombin = manager.get_entity(&protein("P00734")).await.unwrap().unwrap();
        assert_eq!(thrombin.kind(), EntityKind::Protein);
        let biotech = manager.get_entity(&drug("DB00100")).await.unwrap().unwrap();
        assert!(!biotech
            .aliases
            .contains(&Identifier::new("uniprot", "P00734")));
        assert_eq!(
            manager
                .resolve(&Identifier::new("uniprot", "P00734"))
                .await
                .unwrap(),
            Some(protein("P00734"))
        );
        digests.push(manager.cache_digest().await.unwrap());
    }
    assert_eq!(digests[0], digests[1]);
}

fn targeting(drug_id: &str, organism: &str, gene: &str) -> String {
    format!(
        r#"<drug type="small molecule">
  <drugbank-id primary="true">{drug_id}</drugbank-id>
  <name>Drug {drug_id}</name>
  <targets>
    <target position="1">
      <id>BE0009999</id>
      <name>Shared target</name>
      <organism>{organism}</organism>
      <polypeptide id="Q99999" source="Swiss-Prot">
        <name>Shared target</name>
        <gene-name>{gene}</gene-name>
        <organism>{organism}</organism>
      </polypeptide>
    </target>
  </targets>
</drug>"#
    )
}

#[tokio::test]
async fn test_first_seen_polypeptide_attributes_are_kept() {
    let (_temp_dir, manager) = open_manager().await;
    let first = targeting("DB40001", "Humans", "G1");
    let second = targeting("DB40002", "Mouse", "G2");
    let xml = document(&[first.as_str(), second.as_str()]);

    manager
        .populate_reader(std::io::Cursor::new(xml.clone()))
        .await
        .unwrap();
    let target = manager.get_entity(&protein("Q99999")).await.unwrap().unwrap();
    let attrs = target.data.as_polypeptide().unwrap();
    assert_eq!(attrs.organism.as_deref(), Some("Humans"));
    assert_eq!(attrs.gene_name.as_deref(), Some("G1"));

    let again = manager
        .populate_reader(std::io::Cursor::new(xml))
        .await
        .unwrap();
    assert!(again.is_unchanged(), "re-import changed rows: {again:?}");
}

fn interacting(drug_id: &str, partners: &[&str]) -> String {
    let interactions = partners
        .iter()
        .map(|partner| {
            format!(
                "    <drug-interaction>\n      <drugbank-id>{partner}</drugbank-id>\n      \
                 <name>Drug {partner}</name>\n    </drug-interaction>"
            )
        })
        .collect::<Vec<_>>()
        .join("\n");
    format!(
        r#"<drug type="small molecule">
  <drugbank-id primary="true">{drug_id}</drugbank-id>
  <name>Drug {drug_id}</name>
  <drug-interactions>
{interactions}
  </drug-interactions>
</drug>"#
    )
}

#[tokio::test]
async fn test_forward_interactions_flush_across_batches() {
    common::init_logging();
    let temp_dir = TempDir::new().unwrap();
    let manager = Manager::open(test_config(&temp_dir).with_flush_batch(2))
        .await
        .unwrap();
    let head = interacting("DB50000", &["DB50001", "DB50002", "DB50003", "DB50004", "DB59999"]);
    let tail = ["DB50001", "DB50002", "DB50003", "DB50004"]
        .iter()
        .map(|id| interacting(id, &[]))
        .collect::<Vec<_>>();
    let mut records = vec![head.as_str()];
    records.extend(tail.iter().map(String::as_str));

    let report = manager
        .populate_reader(std::io::Cursor::new(document(&records)))
        .await
        .unwrap();
    assert_eq!(report.records_committed, 5);
    assert_eq!(report.relationships.inserted, 4);
    let unresolved = report.unresolved_references().collect::<Vec<_>>();
    assert_eq!(unresolved.len(), 1);
    assert_eq!(unresolved[0].target, Identifier::new("drugbank", "DB59999"));
    let targets = manager
        .relationships_of(&drug("DB50000"))
        .await
        .unwrap()
        .into_iter()
        .map(|rel| rel.target)
        .collect::<BTreeSet<_>>();
    assert_eq!(targets.len(), 4);

    let again = manager
        .populate_reader(std::io::Cursor::new(document(&records)))
        .await
        .unwrap();
    assert!(again.is_unchanged(), "re-import changed rows: {again:?}");
    assert_eq!(again.unresolved_references().count(), 1);
}

#[tokio::test]
async fn test_rebuild_replaces_previous_document() {
    let (_temp_dir, manager) = open_manager().await;
    manager
        .populate(fixture("drugbank_sample.xml"))
        .await
        .unwrap();
    manager
        .populate(fixture("conflicting_aliases.xml"))
        .await
        .unwrap();
    let merged = manager.summarize().await.unwrap().entity_count();

    let report = manager
        .rebuild(fixture("conflicting_aliases.xml"))
        .await
        .unwrap();
    assert_eq!(report.records_committed, 2);
    assert!(merged > 2);
    assert_eq!(manager.summarize().await.unwrap().entity_count(), 2);
    assert!(manager.get_entity(&drug("DB00001")).await.unwrap().is_none());

    // A document that fails validation leaves the cache untouched.
    let digest = manager.cache_digest().await.unwrap();
    assert!(manager.rebuild(fixture("version_mismatch.xml")).await.is_err());
    assert_eq!(manager.cache_digest().await.unwrap(), digest);
}
