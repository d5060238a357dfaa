//! Tensor Primitives
//!
//! Device selection, row gathering, feature concatenation, losses and
//! activation functions shared by blocks, models and training.
//!
//! ## Submodules
//!
//! - [`tensor_ops`]: device selection, gather/concat helpers, losses
//! - [`activations`]: the [`Activation`] enum used between MLP layers

mod tensor_ops;
mod activations;

// Re-export all primitives at module level
pub use tensor_ops::*;
pub use activations::*;
