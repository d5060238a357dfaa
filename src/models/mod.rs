//! Composite Models
//!
//! Models hold up to one block per attribute type. An absent block passes its
//! attribute through unchanged; topology is never modified.
//!
//! | Model | Each block reads |
//! |---|---|
//! | [`GraphEncoder`] | the input tuple |
//! | [`GraphNetwork`] | edges: input; nodes: new edges; globals: new nodes and edges |
//!
//! [`EncodeProcessDecode`] chains an encoder, a recurrent core network and a
//! decoder.

mod encode_process_decode;

pub use encode_process_decode::{EncodeProcessDecode, EncodeProcessDecodeConfig};

use candle_core::Var;
use tracing::debug;

use crate::blocks::{Block, EdgeBlock, GlobalBlock, NodeBlock};
use crate::graph::GraphTuple;
use crate::Result;

/// The optional edge/node/global blocks shared by both model kinds
struct Blocks {
    edge: Option<EdgeBlock>,
    node: Option<NodeBlock>,
    global: Option<GlobalBlock>,
}

impl Blocks {
    fn is_empty(&self) -> bool {
        self.edge.is_none() && self.node.is_none() && self.global.is_none()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = Vec::new();
        if let Some(b) = &self.edge {
            vars.extend(b.trainable_vars());
        }
        if let Some(b) = &self.node {
            vars.extend(b.trainable_vars());
        }
        if let Some(b) = &self.global {
            vars.extend(b.trainable_vars());
        }
        vars
    }
}

/// Applies each present block to the input tuple, with no cross-attribute dependency
pub struct GraphEncoder {
    blocks: Blocks,
}

impl GraphEncoder {
    pub fn new(
        edge_block: Option<EdgeBlock>,
        node_block: Option<NodeBlock>,
        global_block: Option<GlobalBlock>,
    ) -> Self {
        Self {
            blocks: Blocks {
                edge: edge_block,
                node: node_block,
                global: global_block,
            },
        }
    }

    pub fn forward(&self, gt: &GraphTuple) -> Result<GraphTuple> {
        if self.blocks.is_empty() {
            debug!("graph encoder has no blocks, returning input unchanged");
            return Ok(gt.clone());
        }

        // every block reads the original tuple
        let edge_attr = match &self.blocks.edge {
            Some(b) => Some(b.forward(gt)?),
            None => None,
        };
        let node_attr = match &self.blocks.node {
            Some(b) => Some(b.forward(gt)?),
            None => None,
        };
        let global_attr = match &self.blocks.global {
            Some(b) => Some(b.forward(gt)?),
            None => None,
        };

        let mut out = gt.clone();
        if let Some(t) = edge_attr {
            out = out.with_edge_attr(t)?;
        }
        if let Some(t) = node_attr {
            out = out.with_node_attr(t)?;
        }
        if let Some(t) = global_attr {
            out = out.with_global_attr(t)?;
        }
        Ok(out)
    }

    pub fn edge_block(&self) -> Option<&EdgeBlock> {
        self.blocks.edge.as_ref()
    }

    pub fn node_block(&self) -> Option<&NodeBlock> {
        self.blocks.node.as_ref()
    }

    pub fn global_block(&self) -> Option<&GlobalBlock> {
        self.blocks.global.as_ref()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.blocks.trainable_vars()
    }

    pub fn param_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}

/// One round of message passing: edges, then nodes, then globals
///
/// Nodes see the freshly computed edges; globals see the fresh nodes and
/// edges.
pub struct GraphNetwork {
    blocks: Blocks,
}

impl GraphNetwork {
    pub fn new(
        edge_block: Option<EdgeBlock>,
        node_block: Option<NodeBlock>,
        global_block: Option<GlobalBlock>,
    ) -> Self {
        Self {
            blocks: Blocks {
                edge: edge_block,
                node: node_block,
                global: global_block,
            },
        }
    }

    pub fn forward(&self, gt: &GraphTuple) -> Result<GraphTuple> {
        if self.blocks.is_empty() {
            debug!("graph network has no blocks, returning input unchanged");
            return Ok(gt.clone());
        }

        let mut out = gt.clone();
        if let Some(b) = &self.blocks.edge {
            out = out.with_edge_attr(b.forward(&out)?)?;
        }
        if let Some(b) = &self.blocks.node {
            out = out.with_node_attr(b.forward(&out)?)?;
        }
        if let Some(b) = &self.blocks.global {
            out = out.with_global_attr(b.forward(&out)?)?;
        }
        Ok(out)
    }

    pub fn edge_block(&self) -> Option<&EdgeBlock> {
        self.blocks.edge.as_ref()
    }

    pub fn node_block(&self) -> Option<&NodeBlock> {
        self.blocks.node.as_ref()
    }

    pub fn global_block(&self) -> Option<&GlobalBlock> {
        self.blocks.global.as_ref()
    }

    pub fn trainable_vars(&self) -> Vec<Var> {
        self.blocks.trainable_vars()
    }

    pub fn param_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}
