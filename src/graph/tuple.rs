//! The batched graph tuple
//!
//! A [`GraphTuple`] is immutable: blocks and models produce new tuples whose
//! attributes are replaced while connectivity and membership tensors are
//! shared (candle tensors are reference counted, so this is cheap).

use std::collections::HashMap;
use std::fmt;

use candle_core::{DType, Device, Tensor};
use serde::{Deserialize, Serialize};

use super::validate_gt;
use crate::primitives::{gather_rows, index_tensor, index_values};
use crate::{GraphNetError, Result};

/// A batch of `B` graphs flattened into concatenated tensors
///
/// | Field | Shape | Meaning |
/// |---|---|---|
/// | `node_attr` | `[N, n]` | node features, graph by graph |
/// | `edge_attr` | `[E, e]` | edge features, graph by graph |
/// | `global_attr` | `[B, g]` | one row per graph |
/// | `edges` | `[2, E]` (u32) | `(source, target)` flat node indices |
/// | `node_idx` | `[N]` (u32) | owning graph of each node |
/// | `edge_idx` | `[E]` (u32) | owning graph of each edge |
#[derive(Debug, Clone)]
pub struct GraphTuple {
    node_attr: Tensor,
    edge_attr: Tensor,
    global_attr: Tensor,
    edges: Tensor,
    node_idx: Tensor,
    edge_idx: Tensor,
}

impl GraphTuple {
    /// Assemble a tuple from its six tensors
    ///
    /// Checks ranks, index dtypes and that row counts agree, then every index
    /// invariant of [`validate_gt`]. A tuple that exists is well formed, and
    /// since attribute replacement never touches the indices, blocks can rely
    /// on that without checking again.
    ///
    /// # Errors
    /// - [`GraphNetError::ShapeMismatch`] for bad ranks, dtypes or row counts
    /// - [`GraphNetError::InvariantViolation`] for bad membership, ordering or edges
    pub fn new(
        node_attr: Tensor,
        edge_attr: Tensor,
        global_attr: Tensor,
        edges: Tensor,
        node_idx: Tensor,
        edge_idx: Tensor,
    ) -> Result<Self> {
        let gt = Self::new_unchecked(node_attr, edge_attr, global_attr, edges, node_idx, edge_idx)?;
        validate_gt(&gt)?;
        Ok(gt)
    }

    /// Shape checks only, for indices that are valid by construction
    pub(crate) fn new_unchecked(
        node_attr: Tensor,
        edge_attr: Tensor,
        global_attr: Tensor,
        edges: Tensor,
        node_idx: Tensor,
        edge_idx: Tensor,
    ) -> Result<Self> {
        let (n, _) = dims2(&node_attr, "node_attr")?;
        let (e, _) = dims2(&edge_attr, "edge_attr")?;
        dims2(&global_attr, "global_attr")?;

        let (two, e_conn) = dims2(&edges, "edges")?;
        if two != 2 {
            return Err(GraphNetError::ShapeMismatch(format!(
                "edges must have shape [2, E], got [{two}, {e_conn}]"
            )));
        }
        for (name, t) in [("edges", &edges), ("node_idx", &node_idx), ("edge_idx", &edge_idx)] {
            if t.dtype() != DType::U32 {
                return Err(GraphNetError::ShapeMismatch(format!(
                    "{name} must be u32, got {:?}",
                    t.dtype()
                )));
            }
        }

        let n_idx = dims1(&node_idx, "node_idx")?;
        let e_idx = dims1(&edge_idx, "edge_idx")?;
        if n_idx != n {
            return Err(GraphNetError::ShapeMismatch(format!(
                "node_idx has {n_idx} entries for {n} nodes"
            )));
        }
        if e_conn != e || e_idx != e {
            return Err(GraphNetError::ShapeMismatch(format!(
                "edge_attr has {e} rows, edges has {e_conn} columns, edge_idx has {e_idx} entries"
            )));
        }

        Ok(Self {
            node_attr,
            edge_attr,
            global_attr,
            edges,
            node_idx,
            edge_idx,
        })
    }

    pub fn node_attr(&self) -> &Tensor {
        &self.node_attr
    }

    pub fn edge_attr(&self) -> &Tensor {
        &self.edge_attr
    }

    pub fn global_attr(&self) -> &Tensor {
        &self.global_attr
    }

    /// Connectivity `[2, E]`: row 0 sources, row 1 targets
    pub fn edges(&self) -> &Tensor {
        &self.edges
    }

    pub fn node_idx(&self) -> &Tensor {
        &self.node_idx
    }

    pub fn edge_idx(&self) -> &Tensor {
        &self.edge_idx
    }

    /// Source node of every edge, `[E]`
    pub fn senders(&self) -> Result<Tensor> {
        Ok(self.edges.get(0)?.contiguous()?)
    }

    /// Target node of every edge, `[E]`
    pub fn receivers(&self) -> Result<Tensor> {
        Ok(self.edges.get(1)?.contiguous()?)
    }

    pub fn num_nodes(&self) -> usize {
        self.node_attr.dims()[0]
    }

    pub fn num_edges(&self) -> usize {
        self.edge_attr.dims()[0]
    }

    /// Number of graphs in the batch (`B`)
    pub fn num_graphs(&self) -> usize {
        self.global_attr.dims()[0]
    }

    pub fn node_width(&self) -> usize {
        self.node_attr.dims()[1]
    }

    pub fn edge_width(&self) -> usize {
        self.edge_attr.dims()[1]
    }

    pub fn global_width(&self) -> usize {
        self.global_attr.dims()[1]
    }

    pub fn device(&self) -> &Device {
        self.node_attr.device()
    }

    /// Same topology, new node attributes (`[N, *]`)
    pub fn with_node_attr(&self, node_attr: Tensor) -> Result<Self> {
        check_rows(&node_attr, self.num_nodes(), "node_attr")?;
        Ok(Self {
            node_attr,
            ..self.clone()
        })
    }

    /// Same topology, new edge attributes (`[E, *]`)
    pub fn with_edge_attr(&self, edge_attr: Tensor) -> Result<Self> {
        check_rows(&edge_attr, self.num_edges(), "edge_attr")?;
        Ok(Self {
            edge_attr,
            ..self.clone()
        })
    }

    /// Same topology, new global attributes (`[B, *]`)
    pub fn with_global_attr(&self, global_attr: Tensor) -> Result<Self> {
        check_rows(&global_attr, self.num_graphs(), "global_attr")?;
        Ok(Self {
            global_attr,
            ..self.clone()
        })
    }

    /// Copy every tensor to `device`
    pub fn to_device(&self, device: &Device) -> Result<Self> {
        Ok(Self {
            node_attr: self.node_attr.to_device(device)?,
            edge_attr: self.edge_attr.to_device(device)?,
            global_attr: self.global_attr.to_device(device)?,
            edges: self.edges.to_device(device)?,
            node_idx: self.node_idx.to_device(device)?,
            edge_idx: self.edge_idx.to_device(device)?,
        })
    }

    /// Counts and feature widths, for logging and debugging
    pub fn shape(&self) -> GraphTupleShape {
        GraphTupleShape {
            num_graphs: self.num_graphs(),
            num_nodes: self.num_nodes(),
            num_edges: self.num_edges(),
            node_width: self.node_width(),
            edge_width: self.edge_width(),
            global_width: self.global_width(),
        }
    }

    /// Undo batching: one [`GraphSlice`] per graph, edges in local indices
    pub fn split(&self) -> Result<Vec<GraphSlice>> {
        let device = self.device().clone();
        let b = self.num_graphs();
        let node_idx = index_values(&self.node_idx)?;
        let edge_idx = index_values(&self.edge_idx)?;
        let senders = index_values(&self.senders()?)?;
        let receivers = index_values(&self.receivers()?)?;

        let mut node_rows: Vec<Vec<u32>> = vec![Vec::new(); b];
        for (flat, &g) in node_idx.iter().enumerate() {
            let rows = node_rows.get_mut(g as usize).ok_or_else(|| {
                GraphNetError::IndexOutOfRange(format!("node {flat} belongs to graph {g} of {b}"))
            })?;
            rows.push(flat as u32);
        }
        let mut edge_rows: Vec<Vec<u32>> = vec![Vec::new(); b];
        for (flat, &g) in edge_idx.iter().enumerate() {
            let rows = edge_rows.get_mut(g as usize).ok_or_else(|| {
                GraphNetError::IndexOutOfRange(format!("edge {flat} belongs to graph {g} of {b}"))
            })?;
            rows.push(flat as u32);
        }

        let mut slices = Vec::with_capacity(b);
        for (g, (nodes, edges)) in node_rows.into_iter().zip(edge_rows).enumerate() {
            let local: HashMap<u32, usize> =
                nodes.iter().enumerate().map(|(i, &flat)| (flat, i)).collect();

            let mut local_edges = Vec::with_capacity(edges.len());
            for &e in &edges {
                let (s, t) = (senders[e as usize], receivers[e as usize]);
                match (local.get(&s), local.get(&t)) {
                    (Some(&s), Some(&t)) => local_edges.push((s, t)),
                    _ => {
                        return Err(GraphNetError::InvariantViolation(format!(
                            "edge {e} of graph {g} connects nodes {s} -> {t} outside the graph"
                        )))
                    }
                }
            }

            slices.push(GraphSlice {
                node_attr: gather_rows(&self.node_attr, &index_tensor(nodes, &device)?, "split nodes")?,
                edge_attr: gather_rows(&self.edge_attr, &index_tensor(edges, &device)?, "split edges")?,
                global_attr: self.global_attr.narrow(0, g, 1)?,
                edges: local_edges,
            });
        }

        Ok(slices)
    }
}

/// One graph recovered from a [`GraphTuple`]
#[derive(Debug, Clone)]
pub struct GraphSlice {
    /// `[n_g, n]`
    pub node_attr: Tensor,
    /// `[e_g, e]`
    pub edge_attr: Tensor,
    /// `[1, g]`
    pub global_attr: Tensor,
    /// `(source, target)` in local node indices
    pub edges: Vec<(usize, usize)>,
}

/// Counts and widths of a [`GraphTuple`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphTupleShape {
    pub num_graphs: usize,
    pub num_nodes: usize,
    pub num_edges: usize,
    pub node_width: usize,
    pub edge_width: usize,
    pub global_width: usize,
}

impl fmt::Display for GraphTupleShape {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "GraphTuple(graphs={}, node_attr=[{}, {}], edge_attr=[{}, {}], global_attr=[{}, {}])",
            self.num_graphs,
            self.num_nodes,
            self.node_width,
            self.num_edges,
            self.edge_width,
            self.num_graphs,
            self.global_width
        )
    }
}

fn dims2(t: &Tensor, name: &str) -> Result<(usize, usize)> {
    t.dims2().map_err(|_| {
        GraphNetError::ShapeMismatch(format!("{name} must be 2D, got shape {:?}", t.dims()))
    })
}

fn dims1(t: &Tensor, name: &str) -> Result<usize> {
    t.dims1().map_err(|_| {
        GraphNetError::ShapeMismatch(format!("{name} must be 1D, got shape {:?}", t.dims()))
    })
}

fn check_rows(t: &Tensor, expected: usize, name: &str) -> Result<()> {
    let (rows, _) = dims2(t, name)?;
    if rows != expected {
        return Err(GraphNetError::ShapeMismatch(format!(
            "{name} has {rows} rows, expected {expected}"
        )));
    }
    Ok(())
}
