//! Training Infrastructure
//!
//! Losses over graph tuples, candle optimizer wrappers and gradient
//! utilities.
//!
//! ## Overview
//!
//! - **Loss**: [`GraphTupleLoss`] compares selected attributes of a predicted
//!   and a target tuple (MSE or BCE-with-logits)
//! - **Optimizers**: wrapped candle-nn optimizers (AdamW, SGD)
//! - **Gradients**: norm, health check and clipped step
//! - **Metrics**: loss tracking and convergence monitoring
//!
//! ## Example
//!
//! ```ignore
//! use an_graph_nets::prelude::*;
//!
//! let config = LearningConfig::default();
//! let model = EncodeProcessDecode::from_config(&EncodeProcessDecodeConfig::default())?;
//!
//! // deferred transforms create their parameters on the first call
//! model.forward(&first_input, 1)?;
//! let mut optimizer = Optimizer::new(model.trainable_vars(), &config)?;
//!
//! let loss = GraphTupleLoss::new(LossKind::BceWithLogits);
//! let result = train_step(&model, &mut optimizer, &input, &target, &loss, &config, step)?;
//! ```

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};
use candle_nn::optim::{Optimizer as CandleOptimizer, ParamsAdamW};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::graph::GraphTuple;
use crate::models::EncodeProcessDecode;
use crate::primitives::{bce_with_logits, mse_loss};
use crate::{GraphNetError, Result};

// =============================================================================
// Configuration
// =============================================================================

/// Which candle optimizer to use
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OptimizerKind {
    #[default]
    Adam,
    Sgd,
}

/// Configuration for learning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LearningConfig {
    /// Learning rate
    pub learning_rate: f64,

    /// Optimizer choice
    pub optimizer: OptimizerKind,

    /// Weight decay (AdamW only)
    pub weight_decay: f64,

    /// Gradient norm clipping threshold (`None` disables clipping)
    pub grad_clip: Option<f32>,

    /// Message-passing steps per forward pass
    pub num_steps: usize,

    /// Graphs per batch
    pub batch_size: usize,

    /// Passes over the training set
    pub epochs: usize,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            learning_rate: 0.001,
            optimizer: OptimizerKind::Adam,
            weight_decay: 0.0,
            grad_clip: Some(1.0),
            num_steps: 10,
            batch_size: 32,
            epochs: 30,
        }
    }
}

impl LearningConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        serde_json::from_str(json)
            .map_err(|e| GraphNetError::Serialization(format!("invalid learning config: {}", e)))
    }
}

// =============================================================================
// Optimizers
// =============================================================================

/// Wrapper around candle-nn's optimizers
pub enum Optimizer {
    /// Adam with decoupled weight decay
    Adam(candle_nn::optim::AdamW),
    /// Stochastic Gradient Descent
    Sgd(candle_nn::optim::SGD),
}

impl Optimizer {
    /// Optimizer described by `config`
    pub fn new(vars: Vec<Var>, config: &LearningConfig) -> Result<Self> {
        match config.optimizer {
            OptimizerKind::Adam => Self::adam(vars, config.learning_rate, config.weight_decay),
            OptimizerKind::Sgd => Self::sgd(vars, config.learning_rate),
        }
    }

    /// Create an AdamW optimizer
    pub fn adam(vars: Vec<Var>, learning_rate: f64, weight_decay: f64) -> Result<Self> {
        check_vars(&vars)?;
        let params = ParamsAdamW {
            lr: learning_rate,
            weight_decay,
            ..Default::default()
        };
        let inner = <candle_nn::optim::AdamW as CandleOptimizer>::new(vars, params)
            .map_err(|e| GraphNetError::Tensor(format!("AdamW init failed: {}", e)))?;
        Ok(Self::Adam(inner))
    }

    /// Create an SGD optimizer
    pub fn sgd(vars: Vec<Var>, learning_rate: f64) -> Result<Self> {
        check_vars(&vars)?;
        let inner = <candle_nn::optim::SGD as CandleOptimizer>::new(vars, learning_rate)
            .map_err(|e| GraphNetError::Tensor(format!("SGD init failed: {}", e)))?;
        Ok(Self::Sgd(inner))
    }

    /// Take a gradient step
    pub fn step(&mut self, grads: &GradStore) -> Result<()> {
        match self {
            Self::Adam(opt) => CandleOptimizer::step(opt, grads)
                .map_err(|e| GraphNetError::Training(format!("Adam step failed: {}", e))),
            Self::Sgd(opt) => CandleOptimizer::step(opt, grads)
                .map_err(|e| GraphNetError::Training(format!("SGD step failed: {}", e))),
        }
    }

    pub fn learning_rate(&self) -> f64 {
        match self {
            Self::Adam(opt) => opt.learning_rate(),
            Self::Sgd(opt) => opt.learning_rate(),
        }
    }

    pub fn set_learning_rate(&mut self, lr: f64) {
        match self {
            Self::Adam(opt) => opt.set_learning_rate(lr),
            Self::Sgd(opt) => opt.set_learning_rate(lr),
        }
    }
}

fn check_vars(vars: &[Var]) -> Result<()> {
    if vars.is_empty() {
        return Err(GraphNetError::Training(
            "no trainable variables (run one forward pass to resolve deferred transforms)".into(),
        ));
    }
    Ok(())
}

// =============================================================================
// Loss
// =============================================================================

/// Per-attribute loss function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    /// Mean squared error
    #[default]
    Mse,
    /// Binary cross-entropy on logits
    BceWithLogits,
}

impl LossKind {
    pub fn apply(&self, pred: &Tensor, target: &Tensor) -> Result<Tensor> {
        if pred.dims() != target.dims() {
            return Err(GraphNetError::ShapeMismatch(format!(
                "prediction {:?} and target {:?} differ",
                pred.dims(),
                target.dims()
            )));
        }
        match self {
            Self::Mse => mse_loss(pred, target),
            Self::BceWithLogits => bce_with_logits(pred, target),
        }
    }
}

/// Sum of per-attribute losses between a predicted and a target tuple
///
/// Nodes and edges are compared by default; globals are opt-in. Attributes
/// with no rows in the batch are skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphTupleLoss {
    pub kind: LossKind,
    pub nodes: bool,
    pub edges: bool,
    pub globals: bool,
}

impl GraphTupleLoss {
    pub fn new(kind: LossKind) -> Self {
        Self {
            kind,
            nodes: true,
            edges: true,
            globals: false,
        }
    }

    pub fn with_nodes(mut self, on: bool) -> Self {
        self.nodes = on;
        self
    }

    pub fn with_edges(mut self, on: bool) -> Self {
        self.edges = on;
        self
    }

    pub fn with_globals(mut self, on: bool) -> Self {
        self.globals = on;
        self
    }

    /// Scalar loss
    pub fn compute(&self, pred: &GraphTuple, target: &GraphTuple) -> Result<Tensor> {
        let pairs = [
            (self.nodes, pred.node_attr(), target.node_attr()),
            (self.edges, pred.edge_attr(), target.edge_attr()),
            (self.globals, pred.global_attr(), target.global_attr()),
        ];

        let mut total: Option<Tensor> = None;
        for (on, p, t) in pairs {
            if !on || p.dim(0)? == 0 {
                continue;
            }
            let term = self.kind.apply(p, t)?;
            total = Some(match total {
                Some(acc) => (acc + term)?,
                None => term,
            });
        }

        total.ok_or_else(|| {
            GraphNetError::Training("no selected attribute has rows to compare".into())
        })
    }

    /// Mean of the per-step losses over a sequence of outputs
    pub fn compute_steps(&self, outputs: &[GraphTuple], target: &GraphTuple) -> Result<Tensor> {
        if outputs.is_empty() {
            return Err(GraphNetError::Training("no outputs to score".into()));
        }
        let terms = outputs
            .iter()
            .map(|out| self.compute(out, target))
            .collect::<Result<Vec<_>>>()?;
        let stacked = Tensor::stack(&terms, 0)?;
        stacked
            .mean_all()
            .map_err(|e| GraphNetError::Tensor(format!("step loss mean failed: {}", e)))
    }
}

impl Default for GraphTupleLoss {
    fn default() -> Self {
        Self::new(LossKind::default())
    }
}

// =============================================================================
// Metrics
// =============================================================================

/// Result of a training step
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingResult {
    /// Loss before the update
    pub loss: f32,

    /// Graphs in the batch
    pub graphs: usize,

    /// Gradient L2 norm before clipping
    pub grad_norm: f32,

    /// Training step number
    pub step: usize,

    /// The update was skipped (non-finite gradients)
    pub skipped: bool,
}

/// Training metrics tracker
#[derive(Debug, Default)]
pub struct MetricsTracker {
    losses: Vec<f32>,
    best_loss: Option<f32>,
    steps_since_improvement: usize,
    skipped: usize,
}

impl MetricsTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a training result; skipped steps only count towards [`Self::skipped_steps`]
    pub fn record(&mut self, result: &TrainingResult) {
        if result.skipped || !result.loss.is_finite() {
            self.skipped += 1;
            return;
        }
        self.losses.push(result.loss);

        match self.best_loss {
            Some(best) if result.loss >= best => self.steps_since_improvement += 1,
            _ => {
                self.best_loss = Some(result.loss);
                self.steps_since_improvement = 0;
            }
        }
    }

    /// Average loss over the last `n` recorded steps
    pub fn average_loss(&self, n: usize) -> Option<f32> {
        if self.losses.is_empty() || n == 0 {
            return None;
        }
        let start = self.losses.len().saturating_sub(n);
        let slice = &self.losses[start..];
        Some(slice.iter().sum::<f32>() / slice.len() as f32)
    }

    /// No improvement for `patience` steps
    pub fn has_converged(&self, patience: usize) -> bool {
        self.steps_since_improvement >= patience
    }

    pub fn best_loss(&self) -> Option<f32> {
        self.best_loss
    }

    pub fn total_steps(&self) -> usize {
        self.losses.len()
    }

    pub fn skipped_steps(&self) -> usize {
        self.skipped
    }
}

// =============================================================================
// Gradient Utilities
// =============================================================================

/// Total L2 norm of the gradients of `vars`
pub fn compute_grad_norm(grads: &GradStore, vars: &[Var]) -> Result<f32> {
    let mut total_sq_norm = 0.0f32;
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            total_sq_norm += grad.sqr()?.sum_all()?.to_scalar::<f32>()?;
        }
    }
    Ok(total_sq_norm.sqrt())
}

/// Whether every gradient of `vars` is finite
pub fn check_gradients_health(grads: &GradStore, vars: &[Var]) -> Result<bool> {
    for var in vars {
        if let Some(grad) = grads.get(var.as_tensor()) {
            let vals = grad.flatten_all()?.to_vec1::<f32>()?;
            if vals.iter().any(|v| !v.is_finite()) {
                return Ok(false);
            }
        }
    }
    Ok(true)
}

/// Optimizer step with gradient clipping
///
/// Fails with a training error, leaving parameters untouched, when any
/// gradient is NaN or infinite. When the total norm exceeds `max_grad_norm`
/// every gradient is rescaled in place before the step. Returns the norm
/// measured before clipping.
pub fn safe_optimizer_step(
    optimizer: &mut Optimizer,
    grads: &mut GradStore,
    vars: &[Var],
    max_grad_norm: Option<f32>,
) -> Result<f32> {
    if !check_gradients_health(grads, vars)? {
        return Err(GraphNetError::Training(
            "non-finite gradients, step skipped".into(),
        ));
    }

    let norm = compute_grad_norm(grads, vars)?;
    if let Some(max) = max_grad_norm {
        if norm > max && norm > 0.0 {
            let scale = (max / norm) as f64;
            for var in vars {
                if let Some(grad) = grads.get(var.as_tensor()) {
                    let scaled = grad
                        .affine(scale, 0.0)
                        .map_err(|e| GraphNetError::Tensor(format!("gradient scale failed: {}", e)))?;
                    grads.insert(var.as_tensor(), scaled);
                }
            }
        }
    }

    optimizer.step(grads)?;
    Ok(norm)
}

/// One optimization step of an encode-process-decode model
///
/// Runs `config.num_steps` processing steps and scores the last output
/// against `target`. Non-finite gradients skip the update with a warning
/// instead of failing.
pub fn train_step(
    model: &EncodeProcessDecode,
    optimizer: &mut Optimizer,
    input: &GraphTuple,
    target: &GraphTuple,
    loss_fn: &GraphTupleLoss,
    config: &LearningConfig,
    step: usize,
) -> Result<TrainingResult> {
    let outputs = model.forward(input, config.num_steps)?;
    let last = outputs.last().ok_or_else(|| {
        GraphNetError::Configuration("num_steps must be positive for training".into())
    })?;

    let loss = loss_fn.compute(last, target)?;
    let loss_value = loss.to_scalar::<f32>()?;
    let mut grads = loss
        .backward()
        .map_err(|e| GraphNetError::Training(format!("backward failed: {}", e)))?;

    let vars = model.trainable_vars();
    let mut result = TrainingResult {
        loss: loss_value,
        graphs: input.num_graphs(),
        grad_norm: 0.0,
        step,
        skipped: false,
    };

    if !check_gradients_health(&grads, &vars)? {
        warn!(step, loss = loss_value, "non-finite gradients, skipping update");
        result.skipped = true;
        return Ok(result);
    }

    result.grad_norm = safe_optimizer_step(optimizer, &mut grads, &vars, config.grad_clip)?;
    debug!(step, loss = loss_value, grad_norm = result.grad_norm, "training step");
    Ok(result)
}
