//! Encode-process-decode
//!
//! ```text
//!              ┌──────────────────────────────┐
//!              ▼                              │ num_steps times
//! input ─► encoder ─► latent0 ─► cat ─► core ─┴─► decoder ─► (output transform) ─► output[step]
//!                        └───────────▲
//! ```
//!
//! Every core step reads `latent0 ‖ latent`, so the core's input width is
//! twice the latent width and stays fixed across steps.

use std::path::Path;

use candle_core::Var;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};

use super::{GraphEncoder, GraphNetwork};
use crate::blocks::{Aggregator, EdgeBlock, GlobalBlock, NodeBlock};
use crate::flex::Flex;
use crate::graph::{cat_gt, GraphTuple};
use crate::primitives::Activation;
use crate::{GraphNetError, Result};

/// Hyperparameters for [`EncodeProcessDecode::from_config`]
///
/// Every transform is a deferred-width MLP of `hidden_sizes` followed by its
/// output layer, so input widths never need to be declared.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EncodeProcessDecodeConfig {
    /// Width of node, edge and global latents
    pub latent_size: usize,
    /// Hidden layers of every MLP
    pub hidden_sizes: Vec<usize>,
    /// Activation between MLP layers
    pub activation: Activation,
    /// Decoded edge width (`None`: edge latents pass through the decoder)
    pub edge_output_size: Option<usize>,
    /// Decoded node width (`None`: node latents pass through the decoder)
    pub node_output_size: Option<usize>,
    /// Decoded global width (`None`: global latents pass through the decoder)
    pub global_output_size: Option<usize>,
    /// Reduction of incoming edges in the core node block
    pub node_edge_aggregator: Aggregator,
    /// Reduction of nodes in the core global block
    pub global_node_aggregator: Aggregator,
    /// Reduction of edges in the core global block
    pub global_edge_aggregator: Aggregator,
    /// Add a linear output transform after every decoded attribute
    pub output_transform: bool,
}

impl Default for EncodeProcessDecodeConfig {
    fn default() -> Self {
        Self {
            latent_size: 16,
            hidden_sizes: vec![16],
            activation: Activation::Relu,
            edge_output_size: Some(1),
            node_output_size: Some(1),
            global_output_size: None,
            node_edge_aggregator: Aggregator::Mean,
            global_node_aggregator: Aggregator::Mean,
            global_edge_aggregator: Aggregator::Mean,
            output_transform: false,
        }
    }
}

impl EncodeProcessDecodeConfig {
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| GraphNetError::Serialization(format!("invalid model config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path)?;
        Self::from_json_str(&json)
    }

    pub fn to_json_string(&self) -> Result<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| GraphNetError::Serialization(format!("failed to encode model config: {}", e)))
    }

    /// Reject zero widths
    pub fn validate(&self) -> Result<()> {
        if self.latent_size == 0 {
            return Err(GraphNetError::Configuration(
                "latent_size must be positive".into(),
            ));
        }
        if self.hidden_sizes.contains(&0) {
            return Err(GraphNetError::Configuration(
                "hidden_sizes must all be positive".into(),
            ));
        }
        for (name, size) in [
            ("edge_output_size", self.edge_output_size),
            ("node_output_size", self.node_output_size),
            ("global_output_size", self.global_output_size),
        ] {
            if size == Some(0) {
                return Err(GraphNetError::Configuration(format!(
                    "{name} must be positive when set"
                )));
            }
        }
        Ok(())
    }

    fn mlp(&self, output: usize) -> Result<Flex> {
        let mut sizes = self.hidden_sizes.clone();
        sizes.push(output);
        Flex::mlp_with(&sizes, self.activation)
    }
}

/// Encoder, iterated core and decoder over graph tuples
pub struct EncodeProcessDecode {
    encoder: GraphEncoder,
    core: GraphNetwork,
    decoder: GraphEncoder,
    output_transform: Option<GraphEncoder>,
}

impl EncodeProcessDecode {
    /// Assemble from hand-built parts
    ///
    /// The core must produce the same widths as the encoder, since each step
    /// feeds `latent0 ‖ latent` back into it.
    pub fn new(
        encoder: GraphEncoder,
        core: GraphNetwork,
        decoder: GraphEncoder,
        output_transform: Option<GraphEncoder>,
    ) -> Self {
        Self {
            encoder,
            core,
            decoder,
            output_transform,
        }
    }

    /// Build the standard model: independent encoder, full message-passing
    /// core, independent decoder
    pub fn from_config(config: &EncodeProcessDecodeConfig) -> Result<Self> {
        config.validate()?;
        let latent = config.latent_size;

        let encoder = GraphEncoder::new(
            Some(EdgeBlock::independent(config.mlp(latent)?)),
            Some(NodeBlock::independent(config.mlp(latent)?)),
            Some(GlobalBlock::independent(config.mlp(latent)?)),
        );

        let core = GraphNetwork::new(
            Some(EdgeBlock::message_passing(config.mlp(latent)?)),
            Some(NodeBlock::aggregating(
                config.mlp(latent)?,
                config.node_edge_aggregator,
            )),
            Some(GlobalBlock::aggregating(
                config.mlp(latent)?,
                config.global_node_aggregator,
                config.global_edge_aggregator,
            )),
        );

        let decoder = GraphEncoder::new(
            config
                .edge_output_size
                .map(|k| config.mlp(k).map(EdgeBlock::independent))
                .transpose()?,
            config
                .node_output_size
                .map(|k| config.mlp(k).map(NodeBlock::independent))
                .transpose()?,
            config
                .global_output_size
                .map(|k| config.mlp(k).map(GlobalBlock::independent))
                .transpose()?,
        );

        let output_transform = config.output_transform.then(|| {
            GraphEncoder::new(
                config
                    .edge_output_size
                    .map(|k| EdgeBlock::independent(Flex::linear(k))),
                config
                    .node_output_size
                    .map(|k| NodeBlock::independent(Flex::linear(k))),
                config
                    .global_output_size
                    .map(|k| GlobalBlock::independent(Flex::linear(k))),
            )
        });

        debug!(
            latent_size = latent,
            hidden = ?config.hidden_sizes,
            output_transform = config.output_transform,
            "built encode-process-decode model"
        );
        Ok(Self::new(encoder, core, decoder, output_transform))
    }

    /// Run `num_steps` core iterations and return the decoded tuple of every step
    ///
    /// `num_steps == 0` returns an empty list without touching the model.
    pub fn forward(&self, input: &GraphTuple, num_steps: usize) -> Result<Vec<GraphTuple>> {
        if num_steps == 0 {
            debug!("zero processing steps requested");
            return Ok(Vec::new());
        }

        let latent0 = self.encoder.forward(input)?;
        let mut latent = latent0.clone();
        let mut outputs = Vec::with_capacity(num_steps);

        for step in 0..num_steps {
            let core_input = cat_gt(&latent0, &latent)?;
            latent = self.core.forward(&core_input)?;

            let mut decoded = self.decoder.forward(&latent)?;
            if let Some(transform) = &self.output_transform {
                decoded = transform.forward(&decoded)?;
            }

            trace!(step, shape = %decoded.shape(), "processing step");
            outputs.push(decoded);
        }

        Ok(outputs)
    }

    pub fn encoder(&self) -> &GraphEncoder {
        &self.encoder
    }

    pub fn core(&self) -> &GraphNetwork {
        &self.core
    }

    pub fn decoder(&self) -> &GraphEncoder {
        &self.decoder
    }

    pub fn output_transform(&self) -> Option<&GraphEncoder> {
        self.output_transform.as_ref()
    }

    /// All parameters
    ///
    /// Deferred transforms have none until the first forward call, so prime
    /// the model with one batch before handing these to an optimizer.
    pub fn trainable_vars(&self) -> Vec<Var> {
        let mut vars = self.encoder.trainable_vars();
        vars.extend(self.core.trainable_vars());
        vars.extend(self.decoder.trainable_vars());
        if let Some(t) = &self.output_transform {
            vars.extend(t.trainable_vars());
        }
        vars
    }

    pub fn param_count(&self) -> usize {
        self.trainable_vars().iter().map(|v| v.elem_count()).sum()
    }
}
