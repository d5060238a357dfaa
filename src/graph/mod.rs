//! Graph Data Model
//!
//! Per-sample graphs with named attributes, and the flat [`GraphTuple`]
//! a batch of them becomes.
//!
//! ## Batching
//!
//! ```text
//! Graph A (3 nodes, 0→1, 1→2)    Graph B (2 nodes, 0→1)
//!            │                           │
//!            └──────── to_graph_tuple ───┘
//!                          │
//!                          ▼
//! node_attr  [5, n]     node_idx  [0, 0, 0, 1, 1]
//! edge_attr  [3, e]     edge_idx  [0, 0, 1]
//! global_attr[2, g]     edges     [[0, 1, 3],
//!                                  [1, 2, 4]]
//! ```
//!
//! Node indices in `edges` are offset by the node count of every preceding
//! graph, so one tuple is a single disconnected graph.
//!
//! ## Submodules
//!
//! - [`tuple`]: the [`GraphTuple`] type and its accessors
//! - [`batch`]: [`to_graph_tuple`], [`to_graph_tuple_with_widths`] and [`cat_gt`]
//! - [`validation`]: [`validate_gt`]

pub mod tuple;
pub mod batch;
pub mod validation;

pub use batch::{cat_gt, to_graph_tuple, to_graph_tuple_with_widths, FeatureWidths};
pub use tuple::{GraphSlice, GraphTuple, GraphTupleShape};
pub use validation::{validate, validate_gt, ValidationError};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{GraphNetError, Result};

/// Named feature vectors attached to a node, an edge or a graph
///
/// The same graph usually carries several keys (input features and targets),
/// and batching picks one of them.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Attributes(BTreeMap<String, Vec<f32>>);

impl Attributes {
    /// Create an empty attribute record
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add or replace one named vector
    pub fn with(mut self, key: impl Into<String>, values: Vec<f32>) -> Self {
        self.insert(key, values);
        self
    }

    /// Add or replace one named vector
    pub fn insert(&mut self, key: impl Into<String>, values: Vec<f32>) {
        self.0.insert(key.into(), values);
    }

    /// Look up a named vector
    pub fn get(&self, key: &str) -> Option<&[f32]> {
        self.0.get(key).map(Vec::as_slice)
    }

    /// Attribute names present on this record
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>> FromIterator<(K, Vec<f32>)> for Attributes {
    fn from_iter<I: IntoIterator<Item = (K, Vec<f32>)>>(iter: I) -> Self {
        Self(iter.into_iter().map(|(k, v)| (k.into(), v)).collect())
    }
}

/// A directed edge between two nodes of the same graph
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Edge {
    /// Source node (local index)
    pub source: usize,
    /// Target node (local index)
    pub target: usize,
    /// Edge attributes
    pub attrs: Attributes,
}

/// A single graph sample: ordered nodes, directed edges, one global record
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Graph {
    nodes: Vec<Attributes>,
    edges: Vec<Edge>,
    global: Attributes,
}

impl Graph {
    /// Create an empty graph
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a node and return its local index
    pub fn add_node(&mut self, attrs: Attributes) -> usize {
        self.nodes.push(attrs);
        self.nodes.len() - 1
    }

    /// Append a directed edge `source → target` and return its local index
    ///
    /// Both endpoints must already exist.
    pub fn add_edge(&mut self, source: usize, target: usize, attrs: Attributes) -> Result<usize> {
        let n = self.nodes.len();
        for (role, node) in [("source", source), ("target", target)] {
            if node >= n {
                return Err(GraphNetError::IndexOutOfRange(format!(
                    "edge {role} {node} does not exist in a graph with {n} nodes"
                )));
            }
        }
        self.edges.push(Edge {
            source,
            target,
            attrs,
        });
        Ok(self.edges.len() - 1)
    }

    /// Replace the graph-level attributes
    pub fn set_global(&mut self, attrs: Attributes) {
        self.global = attrs;
    }

    /// Builder: set the graph-level attributes
    pub fn with_global(mut self, attrs: Attributes) -> Self {
        self.global = attrs;
        self
    }

    pub fn nodes(&self) -> &[Attributes] {
        &self.nodes
    }

    pub fn nodes_mut(&mut self) -> &mut [Attributes] {
        &mut self.nodes
    }

    pub fn edges(&self) -> &[Edge] {
        &self.edges
    }

    pub fn edges_mut(&mut self) -> &mut [Edge] {
        &mut self.edges
    }

    pub fn global(&self) -> &Attributes {
        &self.global
    }

    pub fn global_mut(&mut self) -> &mut Attributes {
        &mut self.global
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn num_edges(&self) -> usize {
        self.edges.len()
    }
}
