//! Deferred input-width inference
//!
//! Message-passing blocks concatenate several attribute tensors, so the input
//! width of their transform depends on the data. [`Flex`] holds a factory and
//! an output width; the first forward call measures the input width, builds
//! the concrete transform and freezes it.
//!
//! ```text
//! Flex (unresolved)  ──forward([rows, 7])──►  Flex (resolved, in = 7)
//!                                               │
//!                         forward([rows, 7]) ───┤ delegates
//!                         forward([rows, 9]) ───┘ Configuration error
//! ```
//!
//! [`TransformSpec`] is the serializable description of a transform. It
//! compiles to a concrete [`Linear`] / [`Mlp`] when the input width is fixed
//! and to a [`Flex`] when it is deferred.

use std::fmt;

use candle_core::{Device, Tensor, Var};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::blocks::{Linear, Mlp, Transform};
use crate::primitives::Activation;
use crate::{GraphNetError, Result};

/// Input width of a transform: known up front, or inferred from the first batch
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InputDim {
    Fixed(usize),
    #[default]
    Deferred,
}

type Factory = Box<dyn Fn(usize, &Device) -> Result<Box<dyn Transform>> + Send + Sync>;

struct Resolved {
    input_dim: usize,
    module: Box<dyn Transform>,
}

/// A transform whose input width is fixed by its first call
pub struct Flex {
    output_dim: usize,
    factory: Factory,
    state: RwLock<Option<Resolved>>,
}

impl Flex {
    /// Placeholder for the input width of a deferred transform
    pub fn d() -> InputDim {
        InputDim::Deferred
    }

    /// Wrap a factory `(input_dim, device) -> transform` producing `output_dim` columns
    pub fn new<F, T>(output_dim: usize, factory: F) -> Self
    where
        F: Fn(usize, &Device) -> Result<T> + Send + Sync + 'static,
        T: Transform + 'static,
    {
        Self {
            output_dim,
            factory: Box::new(move |input_dim: usize, device: &Device| {
                Ok(Box::new(factory(input_dim, device)?) as Box<dyn Transform>)
            }),
            state: RwLock::new(None),
        }
    }

    /// Deferred MLP; the last entry of `layer_sizes` is the output width
    pub fn mlp(layer_sizes: &[usize]) -> Result<Self> {
        Self::mlp_with(layer_sizes, Activation::default())
    }

    /// Deferred MLP with a chosen activation between layers
    pub fn mlp_with(layer_sizes: &[usize], activation: Activation) -> Result<Self> {
        let output_dim = *layer_sizes.last().ok_or_else(|| {
            GraphNetError::Configuration("MLP needs at least one layer size".into())
        })?;
        let sizes = layer_sizes.to_vec();
        Ok(Self::new(output_dim, move |input_dim, device| {
            Ok(Mlp::new(input_dim, &sizes, device)?.with_activation(activation))
        }))
    }

    /// Deferred linear layer
    pub fn linear(output_dim: usize) -> Self {
        Self::new(output_dim, move |input_dim, device| {
            Linear::new(input_dim, output_dim, device)
        })
    }

    pub fn is_resolved(&self) -> bool {
        self.state.read().is_some()
    }

    pub fn resolved_input_dim(&self) -> Option<usize> {
        self.state.read().as_ref().map(|r| r.input_dim)
    }

    /// Build the concrete transform for `width`, or check `width` against the
    /// one already built
    pub fn resolve(&self, width: usize, device: &Device) -> Result<()> {
        if let Some(resolved) = self.state.read().as_ref() {
            return check_width(resolved.input_dim, width);
        }

        let mut state = self.state.write();
        // another caller may have resolved between the two locks
        if let Some(resolved) = state.as_ref() {
            return check_width(resolved.input_dim, width);
        }

        let module = (self.factory)(width, device)?;
        if module.output_dim() != self.output_dim {
            return Err(GraphNetError::Configuration(format!(
                "flex factory produced output width {}, declared {}",
                module.output_dim(),
                self.output_dim
            )));
        }

        debug!(
            input_dim = width,
            output_dim = self.output_dim,
            params = module.param_count(),
            "resolved flex transform"
        );
        *state = Some(Resolved {
            input_dim: width,
            module,
        });
        Ok(())
    }
}

fn check_width(resolved: usize, width: usize) -> Result<()> {
    if resolved != width {
        return Err(GraphNetError::Configuration(format!(
            "flex transform was resolved for input width {resolved}, got {width}"
        )));
    }
    Ok(())
}

impl Transform for Flex {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (_, width) = xs.dims2().map_err(|_| {
            GraphNetError::ShapeMismatch(format!("flex expects [rows, width], got {:?}", xs.dims()))
        })?;
        self.resolve(width, xs.device())?;

        match self.state.read().as_ref() {
            Some(resolved) => resolved.module.forward(xs),
            None => Err(GraphNetError::Configuration(
                "flex transform is not resolved".into(),
            )),
        }
    }

    fn input_dim(&self) -> Option<usize> {
        self.resolved_input_dim()
    }

    fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Empty until the first forward call
    fn trainable_vars(&self) -> Vec<Var> {
        self.state
            .read()
            .as_ref()
            .map(|r| r.module.trainable_vars())
            .unwrap_or_default()
    }
}

impl fmt::Debug for Flex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flex")
            .field("input_dim", &self.resolved_input_dim())
            .field("output_dim", &self.output_dim)
            .finish()
    }
}

// =============================================================================
// Transform specs
// =============================================================================

/// Serializable description of a transform
///
/// ```json
/// { "type": "mlp", "input_dim": "deferred", "layer_sizes": [16, 16], "activation": "relu" }
/// { "type": "linear", "input_dim": { "fixed": 16 }, "output_dim": 1 }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TransformSpec {
    Linear {
        #[serde(default)]
        input_dim: InputDim,
        output_dim: usize,
    },
    Mlp {
        #[serde(default)]
        input_dim: InputDim,
        layer_sizes: Vec<usize>,
        #[serde(default)]
        activation: Activation,
    },
}

impl TransformSpec {
    /// Deferred MLP spec
    pub fn mlp(layer_sizes: &[usize], activation: Activation) -> Self {
        Self::Mlp {
            input_dim: InputDim::Deferred,
            layer_sizes: layer_sizes.to_vec(),
            activation,
        }
    }

    /// Deferred linear spec
    pub fn linear(output_dim: usize) -> Self {
        Self::Linear {
            input_dim: InputDim::Deferred,
            output_dim,
        }
    }

    pub fn output_dim(&self) -> usize {
        match self {
            Self::Linear { output_dim, .. } => *output_dim,
            Self::Mlp { layer_sizes, .. } => layer_sizes.last().copied().unwrap_or(0),
        }
    }

    /// Compile into a transform; deferred widths become a [`Flex`]
    pub fn build(&self, device: &Device) -> Result<Box<dyn Transform>> {
        let built: Box<dyn Transform> = match self {
            Self::Linear {
                input_dim: InputDim::Fixed(n),
                output_dim,
            } => Box::new(Linear::new(*n, *output_dim, device)?),
            Self::Linear {
                input_dim: InputDim::Deferred,
                output_dim,
            } => Box::new(Flex::linear(*output_dim)),
            Self::Mlp {
                input_dim: InputDim::Fixed(n),
                layer_sizes,
                activation,
            } => Box::new(Mlp::new(*n, layer_sizes, device)?.with_activation(*activation)),
            Self::Mlp {
                input_dim: InputDim::Deferred,
                layer_sizes,
                activation,
            } => Box::new(Flex::mlp_with(layer_sizes, *activation)?),
        };
        Ok(built)
    }
}
