//! Activation Functions
//!
//! Nonlinearities applied between the layers of an [`crate::blocks::Mlp`].

use candle_core::Tensor;
use serde::{Deserialize, Serialize};

use crate::{GraphNetError, Result};

/// Activation applied after every hidden layer of an MLP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    /// max(0, x)
    #[default]
    Relu,
    /// max(αx, x) with α = 0.01
    LeakyRelu,
    /// (e^x - e^(-x)) / (e^x + e^(-x))
    Tanh,
    /// 1 / (1 + e^(-x))
    Sigmoid,
    /// Pass values through unchanged
    Identity,
}

impl Activation {
    /// Apply the activation element-wise
    pub fn apply(&self, tensor: &Tensor) -> Result<Tensor> {
        let out = match self {
            Self::Relu => tensor.relu(),
            Self::LeakyRelu => return leaky_relu(tensor, 0.01),
            Self::Tanh => tensor.tanh(),
            Self::Sigmoid => return sigmoid(tensor),
            Self::Identity => return Ok(tensor.clone()),
        };
        out.map_err(|e| GraphNetError::Tensor(format!("{:?} failed: {}", self, e)))
    }
}

/// Sigmoid activation: σ(x) = 1 / (1 + e^(-x))
pub fn sigmoid(tensor: &Tensor) -> Result<Tensor> {
    let exp_neg = tensor
        .neg()
        .and_then(|t| t.exp())
        .map_err(|e| GraphNetError::Tensor(format!("sigmoid exp failed: {}", e)))?;
    (exp_neg + 1.0)
        .and_then(|t| t.recip())
        .map_err(|e| GraphNetError::Tensor(format!("sigmoid recip failed: {}", e)))
}

/// Leaky ReLU activation: max(αx, x)
pub fn leaky_relu(tensor: &Tensor, negative_slope: f64) -> Result<Tensor> {
    let zeros = tensor.zeros_like()?;
    let positive = tensor.maximum(&zeros)?;
    let negative = tensor.minimum(&zeros)?;

    (positive + (negative * negative_slope)?)
        .map_err(|e| GraphNetError::Tensor(format!("leaky_relu add failed: {}", e)))
}
