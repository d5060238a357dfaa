//! # an-graph-nets
//!
//! Graph networks on candle: batched graphs with node, edge and global
//! attributes, processed by learnable update blocks with full gradient flow.
//!
//! ## Overview
//!
//! A batch of variable-size graphs is flattened into one [`GraphTuple`]:
//! concatenated attribute tensors plus connectivity (`edges`) and
//! batch-membership (`node_idx`, `edge_idx`) indices. Blocks read a tuple and
//! produce new attributes; models chain blocks without touching topology.
//!
//! - **Graph**: per-sample graphs with named attributes, batched by [`to_graph_tuple`]
//! - **Blocks**: [`EdgeBlock`], [`NodeBlock`], [`GlobalBlock`] with an [`Aggregator`]
//! - **Flex**: transforms whose input width is inferred on the first call
//! - **Models**: [`GraphEncoder`], [`GraphNetwork`], [`EncodeProcessDecode`]
//! - **Training**: loss over graph tuples and candle optimizer wrappers
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use an_graph_nets::prelude::*;
//!
//! let device = best_device();
//! let input = to_graph_tuple(&graphs, "features", &device)?;
//!
//! let model = GraphNetwork::new(
//!     Some(EdgeBlock::message_passing(Flex::mlp(&[16, 16])?)),
//!     Some(NodeBlock::aggregating(Flex::mlp(&[16, 16])?, Aggregator::Mean)),
//!     None,
//! );
//!
//! let out = model.forward(&input)?;
//! println!("{}", out.shape());
//! ```
//!
//! ## Feature Flags
//!
//! - `metal`: Apple Metal GPU acceleration
//! - `cuda`: NVIDIA CUDA GPU acceleration

pub mod primitives;
pub mod graph;
pub mod blocks;
pub mod flex;
pub mod models;
pub mod data;
pub mod training;

// Re-export candle types for convenience
pub use candle_core::{DType, Device, Tensor, Var};

pub use blocks::{Aggregator, Block, EdgeBlock, GlobalBlock, Linear, Mlp, NodeBlock, Transform};
pub use flex::{Flex, InputDim, TransformSpec};
pub use graph::{
    cat_gt, to_graph_tuple, to_graph_tuple_with_widths, validate_gt, Attributes, FeatureWidths,
    Graph, GraphTuple,
};
pub use models::{EncodeProcessDecode, EncodeProcessDecodeConfig, GraphEncoder, GraphNetwork};

/// Error types for graph network operations
#[derive(Debug, thiserror::Error)]
pub enum GraphNetError {
    #[error("Shape mismatch: {0}")]
    ShapeMismatch(String),

    #[error("Index out of range: {0}")]
    IndexOutOfRange(String),

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Invalid configuration: {0}")]
    Configuration(String),

    #[error("Missing attribute '{key}' on {entity}")]
    MissingAttribute { entity: String, key: String },

    #[error("Tensor operation failed: {0}")]
    Tensor(String),

    #[error("Training error: {0}")]
    Training(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Candle error: {0}")]
    Candle(#[from] candle_core::Error),
}

/// Result type alias for graph network operations
pub type Result<T> = std::result::Result<T, GraphNetError>;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::{DType, Device, Tensor, Var};
    pub use crate::{GraphNetError, Result};

    // Primitives
    pub use crate::primitives::{
        best_device, cpu_device, cuda_available, gpu_available, gpu_disabled, metal_available,
        Activation,
    };

    // Graph data model
    pub use crate::graph::{
        cat_gt, to_graph_tuple, to_graph_tuple_with_widths, validate_gt, Attributes, Edge,
        FeatureWidths, Graph, GraphSlice, GraphTuple, GraphTupleShape,
    };

    // Blocks and transforms
    pub use crate::blocks::{
        Aggregator, Block, EdgeBlock, GlobalBlock, Linear, Mlp, NodeBlock, Transform,
    };
    pub use crate::flex::{Flex, InputDim, TransformSpec};

    // Models
    pub use crate::models::{
        EncodeProcessDecode, EncodeProcessDecodeConfig, GraphEncoder, GraphNetwork,
    };

    // Data loading
    pub use crate::data::{
        random_dataset, random_graph, GraphDataLoader, GraphDataset, RandomGraphConfig,
    };

    // Training utilities
    pub use crate::training::{
        check_gradients_health, compute_grad_norm, safe_optimizer_step, train_step,
        GraphTupleLoss, LearningConfig, LossKind, MetricsTracker, Optimizer, OptimizerKind,
        TrainingResult,
    };
}

#[cfg(test)]
mod tests {
    #[test]
    fn test_prelude_imports() {
        use crate::prelude::*;

        let device = cpu_device();
        assert!(matches!(device, Device::Cpu));
        assert_eq!(Aggregator::default(), Aggregator::Sum);
    }

    #[test]
    fn test_error_display() {
        let err = crate::GraphNetError::MissingAttribute {
            entity: "node 3 of graph 1".into(),
            key: "features".into(),
        };
        assert_eq!(
            err.to_string(),
            "Missing attribute 'features' on node 3 of graph 1"
        );
    }
}
