//! Learnable feature transforms
//!
//! A [`Transform`] maps a `[rows, in]` feature matrix to `[rows, out]`. Blocks
//! hold one and apply it to the features they gather; [`crate::flex::Flex`]
//! wraps one whose input width is only known at the first call.

use candle_core::{DType, Device, Tensor, Var};

use crate::primitives::Activation;
use crate::{GraphNetError, Result};

/// Row-wise learnable map from `[rows, in]` to `[rows, out]`
pub trait Transform: Send + Sync {
    /// Apply the transform to every row
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    /// Expected input width, or `None` while it has not been inferred yet
    fn input_dim(&self) -> Option<usize>;

    /// Output width
    fn output_dim(&self) -> usize;

    /// Parameters that receive gradients
    fn trainable_vars(&self) -> Vec<Var>;

    /// Total number of scalar parameters
    fn param_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}

impl<T: Transform + ?Sized> Transform for Box<T> {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        (**self).forward(xs)
    }

    fn input_dim(&self) -> Option<usize> {
        (**self).input_dim()
    }

    fn output_dim(&self) -> usize {
        (**self).output_dim()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        (**self).trainable_vars()
    }
}

/// Fully connected layer: `xs @ W + b`
///
/// Cloning shares the underlying parameters.
#[derive(Debug, Clone)]
pub struct Linear {
    /// Weights `[in, out]`
    weight: Var,
    /// Bias `[out]`
    bias: Var,
}

impl Linear {
    /// Xavier-initialized weights and zero bias
    pub fn new(input_dim: usize, output_dim: usize, device: &Device) -> Result<Self> {
        if input_dim == 0 || output_dim == 0 {
            return Err(GraphNetError::Configuration(format!(
                "linear layer needs non-zero widths, got {input_dim} -> {output_dim}"
            )));
        }

        let scale = (2.0f32 / (input_dim + output_dim) as f32).sqrt();
        let weight = Var::from_tensor(
            &Tensor::randn(0.0f32, scale, (input_dim, output_dim), device)
                .map_err(|e| GraphNetError::Tensor(format!("Failed to create weight: {}", e)))?,
        )
        .map_err(|e| GraphNetError::Tensor(format!("Failed to create weight var: {}", e)))?;
        let bias = Var::zeros(output_dim, DType::F32, device)
            .map_err(|e| GraphNetError::Tensor(format!("Failed to create bias var: {}", e)))?;

        Ok(Self { weight, bias })
    }

    /// Build from explicit weights `[in, out]` and bias `[out]`
    pub fn from_tensors(weight: &Tensor, bias: &Tensor) -> Result<Self> {
        let (_, out) = weight.dims2().map_err(|_| {
            GraphNetError::ShapeMismatch(format!("weight must be [in, out], got {:?}", weight.dims()))
        })?;
        if bias.dims() != [out] {
            return Err(GraphNetError::ShapeMismatch(format!(
                "bias must be [{out}], got {:?}",
                bias.dims()
            )));
        }
        Ok(Self {
            weight: Var::from_tensor(weight)?,
            bias: Var::from_tensor(bias)?,
        })
    }

    pub fn weight(&self) -> &Tensor {
        self.weight.as_tensor()
    }

    pub fn bias(&self) -> &Tensor {
        self.bias.as_tensor()
    }
}

impl Transform for Linear {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let (rows, width) = xs.dims2().map_err(|_| {
            GraphNetError::ShapeMismatch(format!("linear expects [rows, width], got {:?}", xs.dims()))
        })?;
        let (input_dim, output_dim) = self.weight.dims2()?;
        if width != input_dim {
            return Err(GraphNetError::ShapeMismatch(format!(
                "linear layer expects width {input_dim}, got {width}"
            )));
        }
        if rows == 0 {
            return Ok(Tensor::zeros((0, output_dim), xs.dtype(), xs.device())?);
        }

        xs.matmul(self.weight.as_tensor())
            .map_err(|e| GraphNetError::Tensor(format!("linear matmul failed: {}", e)))?
            .broadcast_add(self.bias.as_tensor())
            .map_err(|e| GraphNetError::Tensor(format!("linear add bias failed: {}", e)))
    }

    fn input_dim(&self) -> Option<usize> {
        self.weight.dims().first().copied()
    }

    fn output_dim(&self) -> usize {
        self.bias.elem_count()
    }

    fn trainable_vars(&self) -> Vec<Var> {
        vec![self.weight.clone(), self.bias.clone()]
    }
}

/// Stack of [`Linear`] layers with an activation between them
///
/// The last layer stays linear unless [`Mlp::with_activate_final`] is set, so
/// an MLP can produce logits or unbounded regression targets.
#[derive(Debug, Clone)]
pub struct Mlp {
    layers: Vec<Linear>,
    activation: Activation,
    activate_final: bool,
}

impl Mlp {
    /// `input_dim → layer_sizes[0] → … → layer_sizes[last]`, ReLU between layers
    pub fn new(input_dim: usize, layer_sizes: &[usize], device: &Device) -> Result<Self> {
        if layer_sizes.is_empty() {
            return Err(GraphNetError::Configuration(
                "MLP needs at least one layer size".into(),
            ));
        }

        let mut layers = Vec::with_capacity(layer_sizes.len());
        let mut width = input_dim;
        for &size in layer_sizes {
            layers.push(Linear::new(width, size, device)?);
            width = size;
        }

        Ok(Self {
            layers,
            activation: Activation::default(),
            activate_final: false,
        })
    }

    /// Builder: activation applied between layers
    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Builder: also apply the activation after the last layer
    pub fn with_activate_final(mut self, activate_final: bool) -> Self {
        self.activate_final = activate_final;
        self
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }
}

impl Transform for Mlp {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        let last = self.layers.len() - 1;
        let empty = xs.dim(0)? == 0;
        let mut h = xs.clone();
        for (i, layer) in self.layers.iter().enumerate() {
            h = layer.forward(&h)?;
            // zero rows stay zeros of the right width
            if !empty && (i < last || self.activate_final) {
                h = self.activation.apply(&h)?;
            }
        }
        Ok(h)
    }

    fn input_dim(&self) -> Option<usize> {
        self.layers.first().and_then(Transform::input_dim)
    }

    fn output_dim(&self) -> usize {
        self.layers.last().map_or(0, Transform::output_dim)
    }

    fn trainable_vars(&self) -> Vec<Var> {
        self.layers.iter().flat_map(Transform::trainable_vars).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_linear_known_values() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[1.0f32, 0.0], [0.0, 2.0], [1.0, 1.0]], &dev).unwrap();
        let b = Tensor::new(&[0.5f32, -1.0], &dev).unwrap();
        let layer = Linear::from_tensors(&w, &b).unwrap();

        let xs = Tensor::new(&[[1.0f32, 2.0, 3.0]], &dev).unwrap();
        let out = layer.forward(&xs).unwrap().to_vec2::<f32>().unwrap();
        assert_eq!(out, vec![vec![4.5, 6.0]]);
        assert_eq!(layer.input_dim(), Some(3));
        assert_eq!(layer.output_dim(), 2);
    }

    #[test]
    fn test_linear_width_mismatch() {
        let layer = Linear::new(4, 2, &Device::Cpu).unwrap();
        let xs = Tensor::zeros((3, 5), DType::F32, &Device::Cpu).unwrap();
        assert!(matches!(
            layer.forward(&xs),
            Err(GraphNetError::ShapeMismatch(_))
        ));
    }

    #[test]
    fn test_linear_zero_rows() {
        let layer = Linear::new(4, 3, &Device::Cpu).unwrap();
        let xs = Tensor::zeros((0, 4), DType::F32, &Device::Cpu).unwrap();
        assert_eq!(layer.forward(&xs).unwrap().dims(), &[0, 3]);
    }

    #[test]
    fn test_mlp_shapes_and_params() {
        let mlp = Mlp::new(5, &[8, 3], &Device::Cpu).unwrap();
        let xs = Tensor::randn(0.0f32, 1.0, (7, 5), &Device::Cpu).unwrap();
        assert_eq!(mlp.forward(&xs).unwrap().dims(), &[7, 3]);
        assert_eq!(mlp.trainable_vars().len(), 4);
        assert_eq!(mlp.param_count(), 5 * 8 + 8 + 8 * 3 + 3);
    }

    #[test]
    fn test_mlp_final_layer_is_linear() {
        let dev = Device::Cpu;
        let w = Tensor::new(&[[-1.0f32]], &dev).unwrap();
        let b = Tensor::new(&[0.0f32], &dev).unwrap();
        let mlp = Mlp {
            layers: vec![Linear::from_tensors(&w, &b).unwrap()],
            activation: Activation::Relu,
            activate_final: false,
        };
        let xs = Tensor::new(&[[2.0f32]], &dev).unwrap();
        assert_eq!(mlp.forward(&xs).unwrap().to_vec2::<f32>().unwrap(), vec![vec![-2.0]]);

        let clamped = mlp.with_activate_final(true);
        assert_eq!(clamped.forward(&xs).unwrap().to_vec2::<f32>().unwrap(), vec![vec![0.0]]);
    }

    #[test]
    fn test_mlp_requires_layers() {
        assert!(matches!(
            Mlp::new(3, &[], &Device::Cpu),
            Err(GraphNetError::Configuration(_))
        ));
    }

    #[test]
    fn test_clone_shares_parameters() {
        let a = Linear::new(2, 2, &Device::Cpu).unwrap();
        let b = a.clone();
        let zeros = Tensor::zeros((2, 2), DType::F32, &Device::Cpu).unwrap();
        a.trainable_vars()[0].set(&zeros).unwrap();
        assert_eq!(
            b.weight().to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 0.0], vec![0.0, 0.0]]
        );
    }

    #[test]
    fn test_boxed_transform() {
        let boxed: Box<dyn Transform> = Box::new(Mlp::new(2, &[4], &Device::Cpu).unwrap());
        assert_eq!(boxed.input_dim(), Some(2));
        assert_eq!(boxed.output_dim(), 4);
        assert_eq!(boxed.param_count(), 12);
    }
}
