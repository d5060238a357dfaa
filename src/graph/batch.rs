//! Batching per-sample graphs into a [`GraphTuple`], and attribute
//! concatenation between tuples sharing one topology.

use std::borrow::Borrow;

use candle_core::{Device, Tensor};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{Attributes, Graph, GraphTuple};
use crate::primitives::{concat_features, index_values};
use crate::{GraphNetError, Result};

/// Feature widths of one attribute key, per entity type
///
/// A batch in which no graph has an edge (or a node) has no row to read the
/// width from. Declaring it keeps the attribute tensor at `[0, w]` so the
/// input width of every block stays the same from batch to batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeatureWidths {
    pub node: Option<usize>,
    pub edge: Option<usize>,
    pub global: Option<usize>,
}

impl FeatureWidths {
    pub fn new(node: usize, edge: usize, global: usize) -> Self {
        Self {
            node: Some(node),
            edge: Some(edge),
            global: Some(global),
        }
    }

    /// Widths of the first node, edge and global record carrying `key`
    ///
    /// Run this over a whole dataset, not a single batch, so that edge widths
    /// are known even for batches without edges.
    pub fn infer<G: Borrow<Graph>>(graphs: &[G], key: &str) -> Self {
        let width = |attrs: &Attributes| attrs.get(key).map(<[f32]>::len);
        Self {
            node: borrowed(graphs).flat_map(Graph::nodes).find_map(width),
            edge: borrowed(graphs).flat_map(Graph::edges).find_map(|e| width(&e.attrs)),
            global: borrowed(graphs).find_map(|g| width(g.global())),
        }
    }
}

fn borrowed<G: Borrow<Graph>>(graphs: &[G]) -> impl Iterator<Item = &Graph> + '_ {
    graphs.iter().map(|g| g.borrow())
}

/// Flatten `graphs` into one [`GraphTuple`] using the attribute `feature_key`
///
/// Nodes and edges are concatenated in graph order, edge endpoints are
/// offset by the node count of the preceding graphs, and every graph
/// contributes exactly one global row. Calling this twice with different
/// keys (say `"features"` and `"target"`) yields input and target tuples with
/// identical topology.
///
/// Widths are read from the batch itself, so a batch with no edges gets a
/// `[0, 0]` edge tensor. Use [`to_graph_tuple_with_widths`] when that can
/// happen and the tuple feeds a model.
///
/// # Errors
/// - [`GraphNetError::Configuration`] for an empty graph list
/// - [`GraphNetError::MissingAttribute`] when a node, edge or graph lacks `feature_key`
/// - [`GraphNetError::ShapeMismatch`] when feature widths differ across the batch
pub fn to_graph_tuple<G: Borrow<Graph>>(
    graphs: &[G],
    feature_key: &str,
    device: &Device,
) -> Result<GraphTuple> {
    to_graph_tuple_with_widths(graphs, feature_key, &FeatureWidths::default(), device)
}

/// [`to_graph_tuple`] with declared widths
///
/// A declared width is used for empty attribute tensors, and every row must
/// match it ([`GraphNetError::ShapeMismatch`] otherwise). Undeclared widths
/// are read from the first row as usual.
pub fn to_graph_tuple_with_widths<G: Borrow<Graph>>(
    graphs: &[G],
    feature_key: &str,
    widths: &FeatureWidths,
    device: &Device,
) -> Result<GraphTuple> {
    if graphs.is_empty() {
        return Err(GraphNetError::Configuration(
            "cannot build a graph tuple from an empty graph list".into(),
        ));
    }

    let mut nodes = FeatureRows::new("node", feature_key, widths.node);
    let mut edge_rows = FeatureRows::new("edge", feature_key, widths.edge);
    let mut globals = FeatureRows::new("global", feature_key, widths.global);

    let mut senders: Vec<u32> = Vec::new();
    let mut receivers: Vec<u32> = Vec::new();
    let mut node_idx: Vec<u32> = Vec::new();
    let mut edge_idx: Vec<u32> = Vec::new();

    let mut offset = 0usize;
    for (g, graph) in borrowed(graphs).enumerate() {
        for (i, attrs) in graph.nodes().iter().enumerate() {
            nodes.push(attrs, || format!("node {i} of graph {g}"))?;
            node_idx.push(g as u32);
        }

        for (i, edge) in graph.edges().iter().enumerate() {
            if edge.source >= graph.num_nodes() || edge.target >= graph.num_nodes() {
                return Err(GraphNetError::IndexOutOfRange(format!(
                    "edge {i} of graph {g} connects {} -> {} but the graph has {} nodes",
                    edge.source,
                    edge.target,
                    graph.num_nodes()
                )));
            }
            edge_rows.push(&edge.attrs, || format!("edge {i} of graph {g}"))?;
            senders.push((offset + edge.source) as u32);
            receivers.push((offset + edge.target) as u32);
            edge_idx.push(g as u32);
        }

        globals.push(graph.global(), || format!("graph {g}"))?;
        offset += graph.num_nodes();
    }

    let num_edges = senders.len();
    senders.extend(receivers);

    let gt = GraphTuple::new_unchecked(
        nodes.into_tensor(device)?,
        edge_rows.into_tensor(device)?,
        globals.into_tensor(device)?,
        Tensor::from_vec(senders, (2, num_edges), device)?,
        Tensor::from_vec(node_idx, offset, device)?,
        Tensor::from_vec(edge_idx, num_edges, device)?,
    )?;

    debug!(key = feature_key, shape = %gt.shape(), "batched graphs");
    Ok(gt)
}

/// Concatenate the attributes of two tuples along the feature dimension
///
/// `a` and `b` must share topology: the same node, edge and graph counts and
/// identical `edges`, `node_idx` and `edge_idx`. The result reuses `a`'s
/// index tensors, so its structure is bit-identical to `a`. This is how the
/// "latent + original encoding" input of an iterative core is built.
pub fn cat_gt(a: &GraphTuple, b: &GraphTuple) -> Result<GraphTuple> {
    let (sa, sb) = (a.shape(), b.shape());
    if (sa.num_nodes, sa.num_edges, sa.num_graphs) != (sb.num_nodes, sb.num_edges, sb.num_graphs)
    {
        return Err(GraphNetError::ShapeMismatch(format!(
            "cannot concatenate {sa} with {sb}: topology differs"
        )));
    }

    for (name, x, y) in [
        ("edges", a.edges(), b.edges()),
        ("node_idx", a.node_idx(), b.node_idx()),
        ("edge_idx", a.edge_idx(), b.edge_idx()),
    ] {
        if x.id() == y.id() {
            continue;
        }
        let same = x.dims() == y.dims()
            && index_values(&x.flatten_all()?)? == index_values(&y.flatten_all()?)?;
        if !same {
            return Err(GraphNetError::InvariantViolation(format!(
                "cannot concatenate graph tuples: {name} differ"
            )));
        }
    }

    // both inputs were validated on construction and share a's indices
    GraphTuple::new_unchecked(
        concat_features(&[a.node_attr(), b.node_attr()])?,
        concat_features(&[a.edge_attr(), b.edge_attr()])?,
        concat_features(&[a.global_attr(), b.global_attr()])?,
        a.edges().clone(),
        a.node_idx().clone(),
        a.edge_idx().clone(),
    )
}

/// Row-major feature buffer with a width declared up front or fixed by the first row
struct FeatureRows<'k> {
    entity: &'static str,
    key: &'k str,
    width: Option<usize>,
    rows: usize,
    values: Vec<f32>,
}

impl<'k> FeatureRows<'k> {
    fn new(entity: &'static str, key: &'k str, width: Option<usize>) -> Self {
        Self {
            entity,
            key,
            width,
            rows: 0,
            values: Vec::new(),
        }
    }

    fn push(&mut self, attrs: &Attributes, location: impl Fn() -> String) -> Result<()> {
        let row = attrs
            .get(self.key)
            .ok_or_else(|| GraphNetError::MissingAttribute {
                entity: location(),
                key: self.key.to_string(),
            })?;

        match self.width {
            Some(w) if w != row.len() => {
                return Err(GraphNetError::ShapeMismatch(format!(
                    "{} '{}' has width {} but {} features have width {}",
                    location(),
                    self.key,
                    row.len(),
                    self.entity,
                    w
                )))
            }
            Some(_) => {}
            None => self.width = Some(row.len()),
        }

        self.values.extend_from_slice(row);
        self.rows += 1;
        Ok(())
    }

    fn into_tensor(self, device: &Device) -> Result<Tensor> {
        let width = self.width.unwrap_or(0);
        Tensor::from_vec(self.values, (self.rows, width), device).map_err(|e| {
            GraphNetError::Tensor(format!("{} feature tensor failed: {}", self.entity, e))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::graph::validate_gt;

    fn attrs(key: &str, values: Vec<f32>) -> Attributes {
        Attributes::new().with(key, values)
    }

    /// Node `i` of a graph gets features `[base + i, 1.0]`, edge `j` gets `[base + j]`
    fn chain(n: usize, base: f32) -> Graph {
        let mut g = Graph::new().with_global(attrs("x", vec![base]).with("y", vec![0.0, 1.0]));
        for i in 0..n {
            g.add_node(attrs("x", vec![base + i as f32, 1.0]).with("y", vec![i as f32]));
        }
        for i in 1..n {
            g.add_edge(i - 1, i, attrs("x", vec![base + (i - 1) as f32]).with("y", vec![1.0, 0.0, 0.0]))
                .unwrap();
        }
        g
    }

    #[test]
    fn test_two_graph_offsets() {
        let graphs = vec![chain(3, 0.0), chain(2, 10.0)];
        let gt = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();

        assert_eq!(gt.num_nodes(), 5);
        assert_eq!(gt.num_edges(), 3);
        assert_eq!(gt.num_graphs(), 2);
        assert_eq!(gt.node_idx().to_vec1::<u32>().unwrap(), vec![0, 0, 0, 1, 1]);
        assert_eq!(gt.edge_idx().to_vec1::<u32>().unwrap(), vec![0, 0, 1]);
        assert_eq!(
            gt.edges().to_vec2::<u32>().unwrap(),
            vec![vec![0, 1, 3], vec![1, 2, 4]]
        );
        validate_gt(&gt).unwrap();
    }

    #[test]
    fn test_round_trip_through_split() {
        let graphs = vec![chain(3, 0.0), chain(2, 10.0)];
        let gt = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();
        let parts = gt.split().unwrap();

        for (graph, part) in graphs.iter().zip(&parts) {
            let nodes: Vec<Vec<f32>> = graph
                .nodes()
                .iter()
                .map(|a| a.get("x").unwrap().to_vec())
                .collect();
            let edges: Vec<Vec<f32>> = graph
                .edges()
                .iter()
                .map(|e| e.attrs.get("x").unwrap().to_vec())
                .collect();
            let topology: Vec<(usize, usize)> =
                graph.edges().iter().map(|e| (e.source, e.target)).collect();

            assert_eq!(part.node_attr.to_vec2::<f32>().unwrap(), nodes);
            assert_eq!(part.edge_attr.to_vec2::<f32>().unwrap(), edges);
            assert_eq!(part.edges, topology);
        }
    }

    #[test]
    fn test_feature_key_selects_targets() {
        let graphs = vec![chain(3, 0.0), chain(4, 1.0)];
        let input = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();
        let target = to_graph_tuple(&graphs, "y", &Device::Cpu).unwrap();

        assert_eq!((input.node_width(), input.edge_width(), input.global_width()), (2, 1, 1));
        assert_eq!((target.node_width(), target.edge_width(), target.global_width()), (1, 3, 2));
        assert_eq!(
            input.edges().to_vec2::<u32>().unwrap(),
            target.edges().to_vec2::<u32>().unwrap()
        );
    }

    #[test]
    fn test_borrowed_graphs() {
        let graphs = vec![chain(2, 0.0), chain(2, 5.0)];
        let refs: Vec<&Graph> = graphs.iter().collect();
        let gt = to_graph_tuple(&refs, "x", &Device::Cpu).unwrap();
        assert_eq!(gt.num_graphs(), 2);
    }

    #[test]
    fn test_graph_without_edges_or_nodes() {
        let graphs = vec![chain(1, 0.0), Graph::new().with_global(attrs("x", vec![3.0])), chain(2, 0.0)];
        let gt = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();

        assert_eq!(gt.num_graphs(), 3);
        assert_eq!(gt.num_edges(), 1);
        assert_eq!(gt.node_idx().to_vec1::<u32>().unwrap(), vec![0, 2, 2]);
        assert_eq!(gt.edges().to_vec2::<u32>().unwrap(), vec![vec![1], vec![2]]);
        validate_gt(&gt).unwrap();
    }

    #[test]
    fn test_no_edges_anywhere() {
        let graphs = vec![chain(1, 0.0), chain(1, 1.0)];
        let gt = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();
        assert_eq!(gt.edge_attr().dims(), &[0, 0]);
        assert_eq!(gt.edges().dims(), &[2, 0]);
        validate_gt(&gt).unwrap();
    }

    #[test]
    fn test_declared_widths_survive_empty_batch() {
        let graphs = vec![chain(1, 0.0), chain(1, 1.0)];
        let widths = FeatureWidths::infer(&[chain(2, 0.0)], "y");
        assert_eq!(widths, FeatureWidths::new(1, 3, 2));

        let gt = to_graph_tuple_with_widths(&graphs, "y", &widths, &Device::Cpu).unwrap();
        assert_eq!(gt.edge_attr().dims(), &[0, 3]);
        assert_eq!((gt.node_width(), gt.global_width()), (1, 2));

        let nodeless = Graph::new().with_global(attrs("y", vec![0.0, 1.0]));
        let gt = to_graph_tuple_with_widths(&[nodeless], "y", &widths, &Device::Cpu).unwrap();
        assert_eq!(gt.node_attr().dims(), &[0, 1]);
        assert_eq!(gt.edge_attr().dims(), &[0, 3]);
    }

    #[test]
    fn test_declared_width_must_match_rows() {
        let widths = FeatureWidths::new(2, 4, 1);
        let err = to_graph_tuple_with_widths(&[chain(2, 0.0)], "x", &widths, &Device::Cpu)
            .unwrap_err();
        assert!(matches!(err, GraphNetError::ShapeMismatch(_)));
    }

    #[test]
    fn test_infer_skips_graphs_without_edges() {
        let graphs = vec![chain(1, 0.0), chain(3, 0.0)];
        let widths = FeatureWidths::infer(&graphs, "x");
        assert_eq!(widths, FeatureWidths::new(2, 1, 1));
        assert_eq!(FeatureWidths::infer(&graphs, "missing"), FeatureWidths::default());
    }

    #[test]
    fn test_missing_attribute() {
        let mut g = chain(2, 0.0);
        g.nodes_mut()[1] = attrs("other", vec![1.0, 1.0]);
        let err = to_graph_tuple(&[g], "x", &Device::Cpu).unwrap_err();
        match err {
            GraphNetError::MissingAttribute { entity, key } => {
                assert_eq!(entity, "node 1 of graph 0");
                assert_eq!(key, "x");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_missing_global_attribute() {
        let g = chain(2, 0.0).with_global(Attributes::new());
        let err = to_graph_tuple(&[g], "x", &Device::Cpu).unwrap_err();
        assert!(matches!(err, GraphNetError::MissingAttribute { .. }));
    }

    #[test]
    fn test_inconsistent_width() {
        let mut wide = chain(2, 0.0);
        wide.nodes_mut()[0] = attrs("x", vec![1.0, 2.0, 3.0]);
        let err = to_graph_tuple(&[chain(2, 0.0), wide], "x", &Device::Cpu).unwrap_err();
        assert!(matches!(err, GraphNetError::ShapeMismatch(_)));
    }

    #[test]
    fn test_empty_batch() {
        let graphs: Vec<Graph> = Vec::new();
        assert!(matches!(
            to_graph_tuple(&graphs, "x", &Device::Cpu),
            Err(GraphNetError::Configuration(_))
        ));
    }

    #[test]
    fn test_cat_gt() {
        let graphs = vec![chain(3, 0.0), chain(2, 10.0)];
        let a = to_graph_tuple(&graphs, "x", &Device::Cpu).unwrap();
        let b = to_graph_tuple(&graphs, "y", &Device::Cpu).unwrap();

        let out = cat_gt(&a, &b).unwrap();
        assert_eq!(out.node_width(), a.node_width() + b.node_width());
        assert_eq!(out.edge_width(), a.edge_width() + b.edge_width());
        assert_eq!(out.global_width(), a.global_width() + b.global_width());
        assert_eq!(out.edges().id(), a.edges().id());
        assert_eq!(out.node_idx().id(), a.node_idx().id());
        assert_eq!(out.edge_idx().id(), a.edge_idx().id());
        assert_eq!(
            out.node_attr().to_vec2::<f32>().unwrap()[3],
            vec![10.0, 1.0, 0.0]
        );
    }

    #[test]
    fn test_cat_gt_topology_mismatch() {
        let a = to_graph_tuple(&[chain(3, 0.0)], "x", &Device::Cpu).unwrap();
        let b = to_graph_tuple(&[chain(2, 0.0)], "x", &Device::Cpu).unwrap();
        assert!(matches!(cat_gt(&a, &b), Err(GraphNetError::ShapeMismatch(_))));

        // same counts, different wiring
        let mut rewired = chain(3, 0.0);
        rewired.edges_mut()[1].target = 0;
        let c = to_graph_tuple(&[rewired], "x", &Device::Cpu).unwrap();
        assert!(matches!(cat_gt(&a, &c), Err(GraphNetError::InvariantViolation(_))));
    }
}
