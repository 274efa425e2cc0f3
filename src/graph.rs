//! Projection of the relational cache into a typed, directed multigraph.
//!
//! - [`GraphProjector`]: pure function from cached entities and relationships to a graph
//! - [`KnowledgeGraph`]: the projected graph, one node per canonical key

use enumset::EnumSet;
use petgraph::{graph::NodeIndex, visit::EdgeRef, Directed, Direction};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{BTreeMap, BTreeSet};

use crate::{
    error::IngestError,
    properties::{
        CanonicalEntity, CanonicalKey, EntityData, EntityKind, Identifier, RelationAttributes,
        RelationKind, Relationship,
    },
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub key: CanonicalKey,
    pub name: String,
    pub data: EntityData,
    pub aliases: BTreeSet<Identifier>,
}

impl GraphNode {
    pub fn kind(&self) -> EntityKind {
        self.data.kind()
    }
}

impl From<CanonicalEntity> for GraphNode {
    fn from(entity: CanonicalEntity) -> Self {
        GraphNode {
            key: entity.key,
            name: entity.name,
            data: entity.data,
            aliases: entity.aliases,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphEdge {
    pub kind: RelationKind,
    pub attributes: RelationAttributes,
}

/// Builds a [KnowledgeGraph] from cache contents.
#[derive(Debug, Clone, Copy)]
pub struct GraphProjector {
    relations: EnumSet<RelationKind>,
}

impl Default for GraphProjector {
    fn default() -> Self {
        GraphProjector {
            relations: EnumSet::all(),
        }
    }
}

impl GraphProjector {
    pub fn new() -> Self {
        GraphProjector::default()
    }

    /// Keep only edges of the given kinds. Every entity still becomes a node.
    pub fn with_relations(relations: EnumSet<RelationKind>) -> Self {
        GraphProjector { relations }
    }

    pub fn relations(&self) -> EnumSet<RelationKind> {
        self.relations
    }

    /// Nodes and edges are added in key order, so equal inputs give identical graphs
    /// regardless of the order rows were read in.
    pub fn project<E, R>(&self, entities: E, relationships: R) -> Result<KnowledgeGraph, IngestError>
    where
        E: IntoIterator<Item = CanonicalEntity>,
        R: IntoIterator<Item = Relationship>,
    {
        let nodes = entities
            .into_iter()
            .map(|entity| (entity.key.clone(), entity))
            .collect::<BTreeMap<CanonicalKey, CanonicalEntity>>();
        let edges = relationships
            .into_iter()
            .filter(|rel| self.relations.contains(rel.kind))
            .collect::<BTreeSet<Relationship>>();

        let mut graph = petgraph::Graph::new();
        let mut key_to_index = BTreeMap::new();
        for (key, entity) in nodes {
            let index = graph.add_node(GraphNode::from(entity));
            key_to_index.insert(key, index);
        }

        for rel in edges {
            let (Some(source_idx), Some(target_idx)) =
                (key_to_index.get(&rel.source), key_to_index.get(&rel.target))
            else {
                tracing::error!(
                    "[GraphProjector.project] {} -[{}]-> {} has a missing endpoint",
                    rel.source,
                    rel.kind,
                    rel.target
                );
                return Err(IngestError::ProjectionInconsistency {
                    source_key: rel.source.to_string(),
                    target_key: rel.target.to_string(),
                    kind: rel.kind.to_string(),
                });
            };
            graph.add_edge(
                *source_idx,
                *target_idx,
                GraphEdge {
                    kind: rel.kind,
                    attributes: rel.attributes,
                },
            );
        }

        tracing::debug!(
            "[GraphProjector.project] {} nodes, {} edges",
            graph.node_count(),
            graph.edge_count()
        );
        Ok(KnowledgeGraph {
            graph,
            key_to_index,
        })
    }
}

/// Directed multigraph keyed by canonical key. Derived from the cache and never written back.
#[derive(Debug, Clone)]
pub struct KnowledgeGraph {
    graph: petgraph::Graph<GraphNode, GraphEdge, Directed>,
    key_to_index: BTreeMap<CanonicalKey, NodeIndex>,
}

impl Default for KnowledgeGraph {
    fn default() -> Self {
        KnowledgeGraph {
            graph: petgraph::Graph::new(),
            key_to_index: BTreeMap::new(),
        }
    }
}

impl KnowledgeGraph {
    pub fn as_graph(&self) -> &petgraph::Graph<GraphNode, GraphEdge, Directed> {
        &self.graph
    }

    pub fn node_count(&self) -> usize {
        self.graph.node_count()
    }

    pub fn edge_count(&self) -> usize {
        self.graph.edge_count()
    }

    pub fn is_empty(&self) -> bool {
        self.graph.node_count() == 0
    }

    pub fn node(&self, key: &CanonicalKey) -> Option<&GraphNode> {
        self.key_to_index.get(key).map(|idx| &self.graph[*idx])
    }

    /// Outgoing edges of `key` with their targets, ordered by target key then kind.
    pub fn edges_from(&self, key: &CanonicalKey) -> Vec<(&GraphNode, &GraphEdge)> {
        self.edges_directed(key, Direction::Outgoing)
    }

    /// Incoming edges of `key` with their sources, ordered by source key then kind.
    pub fn edges_to(&self, key: &CanonicalKey) -> Vec<(&GraphNode, &GraphEdge)> {
        self.edges_directed(key, Direction::Incoming)
    }

    fn edges_directed(
        &self,
        key: &CanonicalKey,
        direction: Direction,
    ) -> Vec<(&GraphNode, &GraphEdge)> {
        let Some(idx) = self.key_to_index.get(key) else {
            return Vec::new();
        };
        let mut edges = self
            .graph
            .edges_directed(*idx, direction)
            .map(|edge| {
                let other = match direction {
                    Direction::Outgoing => edge.target(),
                    Direction::Incoming => edge.source(),
                };
                (&self.graph[other], edge.weight())
            })
            .collect::<Vec<_>>();
        edges.sort_by(|a, b| (&a.0.key, a.1.kind).cmp(&(&b.0.key, b.1.kind)));
        edges
    }

    pub fn node_set(&self) -> BTreeSet<CanonicalKey> {
        self.key_to_index.keys().cloned().collect()
    }

    pub fn edge_set(&self) -> BTreeSet<Relationship> {
        self.graph
            .edge_references()
            .map(|edge| Relationship {
                source: self.graph[edge.source()].key.clone(),
                target: self.graph[edge.target()].key.clone(),
                kind: edge.weight().kind,
                attributes: edge.weight().attributes.clone(),
            })
            .collect()
    }

    pub fn nodes_of(&self, kind: EntityKind) -> impl Iterator<Item = &GraphNode> {
        self.key_to_index
            .values()
            .map(|idx| &self.graph[*idx])
            .filter(move |node| node.kind() == kind)
    }

    /// Node-link JSON: `{"directed", "multigraph", "nodes": [...], "links": [...]}` with nodes
    /// and links in key order.
    pub fn to_node_link_json(&self) -> Value {
        let nodes = self
            .key_to_index
            .values()
            .map(|idx| {
                let node = &self.graph[*idx];
                json!({
                    "id": node.key.to_string(),
                    "kind": node.kind().as_str(),
                    "name": node.name,
                    "attributes": attributes_value(&node.data),
                    "aliases": node.aliases.iter().map(|a| a.to_string()).collect::<Vec<_>>(),
                })
            })
            .collect::<Vec<_>>();
        let links = self
            .edge_set()
            .into_iter()
            .map(|rel| {
                json!({
                    "source": rel.source.to_string(),
                    "target": rel.target.to_string(),
                    "key": rel.kind.as_str(),
                    "attributes": rel.attributes,
                })
            })
            .collect::<Vec<_>>();
        json!({
            "directed": true,
            "multigraph": true,
            "graph": {},
            "nodes": nodes,
            "links": links,
        })
    }
}

fn attributes_value(data: &EntityData) -> Value {
    let value = match data {
        EntityData::Drug(attrs) => serde_json::to_value(attrs),
        EntityData::Protein(attrs)
        | EntityData::Enzyme(attrs)
        | EntityData::Transporter(attrs)
        | EntityData::Carrier(attrs) => serde_json::to_value(attrs),
    };
    value.unwrap_or(Value::Null)
}

impl PartialEq for KnowledgeGraph {
    fn eq(&self, other: &Self) -> bool {
        self.node_set() == other.node_set()
            && self
                .key_to_index
                .keys()
                .all(|key| self.node(key) == other.node(key))
            && self.edge_set() == other.edge_set()
    }
}
