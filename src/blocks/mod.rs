//! Graph Network Blocks
//!
//! Each block computes new attributes for one entity type of a
//! [`GraphTuple`] and leaves topology untouched.
//!
//! ## Inputs per block
//!
//! | Block | Independent | Message passing |
//! |---|---|---|
//! | [`EdgeBlock`] | `edge` | `edge ‖ node[src] ‖ node[dst] ‖ global[g]` |
//! | [`NodeBlock`] | `node` | `node ‖ agg(edges into node) ‖ global[g]` |
//! | [`GlobalBlock`] | `global` | `global ‖ agg(nodes of g) ‖ agg(edges of g)` |
//!
//! `‖` is column-wise concatenation and `g` is the row's graph. An
//! independent block transforms its own attribute only; the aggregating
//! blocks default to [`Aggregator::Sum`] when none is given.

mod aggregator;
mod mlp;

pub use aggregator::Aggregator;
pub use mlp::{Linear, Mlp, Transform};

use candle_core::{Tensor, Var};
use tracing::trace;

use crate::graph::GraphTuple;
use crate::primitives::{concat_features, gather_rows};
use crate::{GraphNetError, Result};

/// A learnable update of one attribute type
pub trait Block: Send + Sync {
    /// Compute the new attribute tensor (`[rows, out]`) for this block's entity
    fn forward(&self, gt: &GraphTuple) -> Result<Tensor>;

    /// Whether the block reads only its own entity's attributes
    fn is_independent(&self) -> bool;

    fn trainable_vars(&self) -> Vec<Var>;

    fn param_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}

fn check_aggregator(
    block: &str,
    independent: bool,
    aggregators: &[Option<Aggregator>],
) -> Result<()> {
    if independent && aggregators.iter().any(Option::is_some) {
        return Err(GraphNetError::Configuration(format!(
            "independent {block} block cannot take an aggregator"
        )));
    }
    Ok(())
}

// =============================================================================
// Edge block
// =============================================================================

/// Updates edge attributes
pub struct EdgeBlock {
    transform: Box<dyn Transform>,
    independent: bool,
}

impl EdgeBlock {
    pub fn new(transform: impl Transform + 'static, independent: bool) -> Self {
        Self {
            transform: Box::new(transform),
            independent,
        }
    }

    /// Transform edge attributes only
    pub fn independent(transform: impl Transform + 'static) -> Self {
        Self::new(transform, true)
    }

    /// Read the edge, both endpoints and the graph's global row
    pub fn message_passing(transform: impl Transform + 'static) -> Self {
        Self::new(transform, false)
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }
}

impl Block for EdgeBlock {
    fn forward(&self, gt: &GraphTuple) -> Result<Tensor> {
        if self.independent {
            return self.transform.forward(gt.edge_attr());
        }

        let src = gather_rows(gt.node_attr(), &gt.senders()?, "edge sources")?;
        let dst = gather_rows(gt.node_attr(), &gt.receivers()?, "edge targets")?;
        let glob = gather_rows(gt.global_attr(), gt.edge_idx(), "edge graphs")?;
        let xs = concat_features(&[gt.edge_attr(), &src, &dst, &glob])?;

        trace!(block = "edge", input = ?xs.dims(), "gathered edge inputs");
        self.transform.forward(&xs)
    }

    fn is_independent(&self) -> bool {
        self.independent
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.transform.trainable_vars()
    }
}

// =============================================================================
// Node block
// =============================================================================

/// Updates node attributes
pub struct NodeBlock {
    transform: Box<dyn Transform>,
    independent: bool,
    edge_aggregator: Aggregator,
}

impl NodeBlock {
    /// Fails with a configuration error when an aggregator is given to an
    /// independent block
    pub fn new(
        transform: impl Transform + 'static,
        independent: bool,
        edge_aggregator: Option<Aggregator>,
    ) -> Result<Self> {
        check_aggregator("node", independent, &[edge_aggregator])?;
        Ok(Self {
            transform: Box::new(transform),
            independent,
            edge_aggregator: edge_aggregator.unwrap_or_default(),
        })
    }

    /// Transform node attributes only
    pub fn independent(transform: impl Transform + 'static) -> Self {
        Self {
            transform: Box::new(transform),
            independent: true,
            edge_aggregator: Aggregator::default(),
        }
    }

    /// Read the node, its aggregated incoming edges and the graph's global row
    pub fn aggregating(transform: impl Transform + 'static, edge_aggregator: Aggregator) -> Self {
        Self {
            transform: Box::new(transform),
            independent: false,
            edge_aggregator,
        }
    }

    pub fn edge_aggregator(&self) -> Aggregator {
        self.edge_aggregator
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }
}

impl Block for NodeBlock {
    fn forward(&self, gt: &GraphTuple) -> Result<Tensor> {
        if self.independent {
            return self.transform.forward(gt.node_attr());
        }

        // incoming edges are grouped by receiver
        let incoming =
            self.edge_aggregator
                .aggregate(gt.edge_attr(), &gt.receivers()?, gt.num_nodes())?;
        let glob = gather_rows(gt.global_attr(), gt.node_idx(), "node graphs")?;
        let xs = concat_features(&[gt.node_attr(), &incoming, &glob])?;

        trace!(
            block = "node",
            aggregator = %self.edge_aggregator,
            input = ?xs.dims(),
            "gathered node inputs"
        );
        self.transform.forward(&xs)
    }

    fn is_independent(&self) -> bool {
        self.independent
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.transform.trainable_vars()
    }
}

// =============================================================================
// Global block
// =============================================================================

/// Updates global (per-graph) attributes
pub struct GlobalBlock {
    transform: Box<dyn Transform>,
    independent: bool,
    node_aggregator: Aggregator,
    edge_aggregator: Aggregator,
}

impl GlobalBlock {
    /// Fails with a configuration error when an aggregator is given to an
    /// independent block
    pub fn new(
        transform: impl Transform + 'static,
        independent: bool,
        node_aggregator: Option<Aggregator>,
        edge_aggregator: Option<Aggregator>,
    ) -> Result<Self> {
        check_aggregator("global", independent, &[node_aggregator, edge_aggregator])?;
        Ok(Self {
            transform: Box::new(transform),
            independent,
            node_aggregator: node_aggregator.unwrap_or_default(),
            edge_aggregator: edge_aggregator.unwrap_or_default(),
        })
    }

    /// Transform global attributes only
    pub fn independent(transform: impl Transform + 'static) -> Self {
        Self {
            transform: Box::new(transform),
            independent: true,
            node_aggregator: Aggregator::default(),
            edge_aggregator: Aggregator::default(),
        }
    }

    /// Read the global row plus its graph's aggregated nodes and edges
    pub fn aggregating(
        transform: impl Transform + 'static,
        node_aggregator: Aggregator,
        edge_aggregator: Aggregator,
    ) -> Self {
        Self {
            transform: Box::new(transform),
            independent: false,
            node_aggregator,
            edge_aggregator,
        }
    }

    pub fn node_aggregator(&self) -> Aggregator {
        self.node_aggregator
    }

    pub fn edge_aggregator(&self) -> Aggregator {
        self.edge_aggregator
    }

    pub fn transform(&self) -> &dyn Transform {
        self.transform.as_ref()
    }
}

impl Block for GlobalBlock {
    fn forward(&self, gt: &GraphTuple) -> Result<Tensor> {
        if self.independent {
            return self.transform.forward(gt.global_attr());
        }

        let b = gt.num_graphs();
        let nodes = self
            .node_aggregator
            .aggregate(gt.node_attr(), gt.node_idx(), b)?;
        let edges = self
            .edge_aggregator
            .aggregate(gt.edge_attr(), gt.edge_idx(), b)?;
        let xs = concat_features(&[gt.global_attr(), &nodes, &edges])?;

        trace!(block = "global", input = ?xs.dims(), "gathered global inputs");
        self.transform.forward(&xs)
    }

    fn is_independent(&self) -> bool {
        self.independent
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.transform.trainable_vars()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::flex::Flex;
    use crate::graph::{
        to_graph_tuple, to_graph_tuple_with_widths, Attributes, FeatureWidths, Graph,
    };
    use candle_core::Device;

    /// Identity map of a fixed width, for checking what a block gathers
    struct Passthrough(usize);

    impl Transform for Passthrough {
        fn forward(&self, xs: &Tensor) -> Result<Tensor> {
            let width = xs.dim(1)?;
            if width != self.0 {
                return Err(GraphNetError::ShapeMismatch(format!(
                    "expected {}, got {width}",
                    self.0
                )));
            }
            Ok(xs.clone())
        }
        fn input_dim(&self) -> Option<usize> {
            Some(self.0)
        }
        fn output_dim(&self) -> usize {
            self.0
        }
        fn trainable_vars(&self) -> Vec<Var> {
            Vec::new()
        }
    }

    fn attrs(v: &[f32]) -> Attributes {
        Attributes::new().with("x", v.to_vec())
    }

    /// Graph A: 3 nodes with 0→1 and 1→2; graph B: 2 nodes with 0→1
    fn batch() -> GraphTuple {
        let mut a = Graph::new().with_global(attrs(&[100.0]));
        for v in [1.0, 2.0, 3.0] {
            a.add_node(attrs(&[v]));
        }
        a.add_edge(0, 1, attrs(&[10.0])).unwrap();
        a.add_edge(1, 2, attrs(&[20.0])).unwrap();

        let mut b = Graph::new().with_global(attrs(&[200.0]));
        for v in [4.0, 5.0] {
            b.add_node(attrs(&[v]));
        }
        b.add_edge(0, 1, attrs(&[30.0])).unwrap();

        to_graph_tuple(&[a, b], "x", &Device::Cpu).unwrap()
    }

    /// Nodes 1 and 2 with no edges, global 7; widths match `batch()`
    fn edgeless() -> GraphTuple {
        let mut g = Graph::new().with_global(attrs(&[7.0]));
        g.add_node(attrs(&[1.0]));
        g.add_node(attrs(&[2.0]));
        let widths = FeatureWidths::new(1, 1, 1);
        to_graph_tuple_with_widths(&[g], "x", &widths, &Device::Cpu).unwrap()
    }

    #[test]
    fn test_edge_block_gathers_endpoints_and_global() {
        let out = EdgeBlock::message_passing(Passthrough(4))
            .forward(&batch())
            .unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![
                vec![10.0, 1.0, 2.0, 100.0],
                vec![20.0, 2.0, 3.0, 100.0],
                vec![30.0, 4.0, 5.0, 200.0],
            ]
        );
    }

    #[test]
    fn test_node_block_aggregates_incoming() {
        let block = NodeBlock::new(Passthrough(3), false, Some(Aggregator::Sum)).unwrap();
        let out = block.forward(&batch()).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![
                vec![1.0, 0.0, 100.0],
                vec![2.0, 10.0, 100.0],
                vec![3.0, 20.0, 100.0],
                vec![4.0, 0.0, 200.0],
                vec![5.0, 30.0, 200.0],
            ]
        );
    }

    #[test]
    fn test_global_block_aggregates_per_graph() {
        let block = GlobalBlock::aggregating(Passthrough(3), Aggregator::Mean, Aggregator::Sum);
        let out = block.forward(&batch()).unwrap();
        assert_eq!(
            out.to_vec2::<f32>().unwrap(),
            vec![vec![100.0, 2.0, 30.0], vec![200.0, 4.5, 30.0]]
        );
    }

    #[test]
    fn test_independent_blocks_read_own_attribute() {
        let gt = batch();
        let e = EdgeBlock::independent(Passthrough(1)).forward(&gt).unwrap();
        let n = NodeBlock::independent(Passthrough(1)).forward(&gt).unwrap();
        let g = GlobalBlock::independent(Passthrough(1)).forward(&gt).unwrap();
        assert_eq!(e.dims(), &[3, 1]);
        assert_eq!(n.dims(), &[5, 1]);
        assert_eq!(g.to_vec2::<f32>().unwrap(), vec![vec![100.0], vec![200.0]]);
    }

    #[test]
    fn test_edgeless_graph_aggregates_to_zero() {
        let gt = edgeless();
        for agg in [Aggregator::Sum, Aggregator::Mean, Aggregator::Max] {
            let nodes = NodeBlock::aggregating(Passthrough(3), agg).forward(&gt).unwrap();
            assert_eq!(
                nodes.to_vec2::<f32>().unwrap(),
                vec![vec![1.0, 0.0, 7.0], vec![2.0, 0.0, 7.0]]
            );

            let glob = GlobalBlock::aggregating(Passthrough(3), agg, agg)
                .forward(&gt)
                .unwrap()
                .to_vec2::<f32>()
                .unwrap();
            assert_eq!(glob[0][2], 0.0);
        }

        let edges = EdgeBlock::message_passing(Passthrough(4)).forward(&gt).unwrap();
        assert_eq!(edges.dims(), &[0, 4]);
    }

    #[test]
    fn test_inferred_widths_hold_across_edgeless_batches() {
        for batches in [[batch(), edgeless()], [edgeless(), batch()]] {
            let edge = EdgeBlock::message_passing(Flex::mlp(&[4]).unwrap());
            let node = NodeBlock::aggregating(Flex::mlp(&[4]).unwrap(), Aggregator::Mean);
            let glob = GlobalBlock::aggregating(
                Flex::mlp(&[2]).unwrap(),
                Aggregator::Sum,
                Aggregator::Max,
            );

            for gt in &batches {
                assert_eq!(edge.forward(gt).unwrap().dims(), &[gt.num_edges(), 4]);
                assert_eq!(node.forward(gt).unwrap().dims(), &[gt.num_nodes(), 4]);
                assert_eq!(glob.forward(gt).unwrap().dims(), &[gt.num_graphs(), 2]);
            }
        }

        // fixed-width layers see the same input width with or without edges
        let linear = Linear::new(3, 2, &Device::Cpu).unwrap();
        let node = NodeBlock::aggregating(linear, Aggregator::Sum);
        assert_eq!(node.forward(&edgeless()).unwrap().dims(), &[2, 2]);
        assert_eq!(node.forward(&batch()).unwrap().dims(), &[5, 2]);
    }

    #[test]
    fn test_malformed_tuple_never_reaches_a_block() {
        let gt = batch();
        // graph ids out of order would misroute every per-graph aggregate
        let scrambled = GraphTuple::new(
            gt.node_attr().clone(),
            gt.edge_attr().clone(),
            gt.global_attr().clone(),
            gt.edges().clone(),
            Tensor::new(&[1u32, 0, 0, 1, 1], &Device::Cpu).unwrap(),
            gt.edge_idx().clone(),
        );
        assert!(matches!(scrambled, Err(GraphNetError::InvariantViolation(_))));
    }

    #[test]
    fn test_transform_width_mismatch() {
        let err = EdgeBlock::message_passing(Linear::new(3, 2, &Device::Cpu).unwrap())
            .forward(&batch())
            .unwrap_err();
        assert!(matches!(err, GraphNetError::ShapeMismatch(_)));
    }

    #[test]
    fn test_independent_with_aggregator_rejected() {
        assert!(matches!(
            NodeBlock::new(Passthrough(1), true, Some(Aggregator::Mean)),
            Err(GraphNetError::Configuration(_))
        ));
        assert!(matches!(
            GlobalBlock::new(Passthrough(1), true, None, Some(Aggregator::Max)),
            Err(GraphNetError::Configuration(_))
        ));
    }

    #[test]
    fn test_missing_aggregator_defaults_to_sum() {
        let node = NodeBlock::new(Passthrough(3), false, None).unwrap();
        assert_eq!(node.edge_aggregator(), Aggregator::Sum);
        let glob = GlobalBlock::new(Passthrough(3), false, Some(Aggregator::Max), None).unwrap();
        assert_eq!(glob.node_aggregator(), Aggregator::Max);
        assert_eq!(glob.edge_aggregator(), Aggregator::Sum);
    }

    #[test]
    fn test_block_gradients_reach_parameters() {
        let gt = batch();
        let block = NodeBlock::aggregating(Linear::new(3, 2, &Device::Cpu).unwrap(), Aggregator::Mean);
        let loss = block.forward(&gt).unwrap().sqr().unwrap().sum_all().unwrap();
        let grads = loss.backward().unwrap();
        for var in block.trainable_vars() {
            assert!(grads.get(var.as_tensor()).is_some());
        }
        assert_eq!(block.param_count(), 3 * 2 + 2);
    }
}
