//! Predictive coding decoder (generator).
//!
//! A chain from a small internal representation to the data space:
//! ```text
//! n₀ ──L₀──▶ f ──▶ n₁ ──L₁──▶ f ──▶ … ──L_{k-1}──▶ n_k
//! ```
//! `n₀` holds the internal state (sampled by its init hook, no energy term of
//! its own); `n_k` is the output node, clamped to the example during
//! training. The activation `f` follows every layer except the last.

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::core::{Fingerprint, Module, PcError, PcResult, ParamStore, Var};
use crate::functional::Scope;
use crate::transform::Bound;
use crate::utils::{Activation, RandomKeyGenerator};

use super::{normal_init, EnergyModel, InitFn, Linear, Node};

/// Decoder architecture.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// Dimension of the internal representation (`internal_dim << output_dim`).
    pub internal_dim: usize,
    pub hidden_dim: usize,
    pub output_dim: usize,
    /// Hidden layers between input and output layers.
    pub num_hidden_layers: usize,
    pub activation: Activation,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            internal_dim: 2,
            hidden_dim: 32,
            output_dim: 16,
            num_hidden_layers: 2,
            activation: Activation::Gelu,
        }
    }
}

impl ModelConfig {
    /// Node dimensions: internal, `num_hidden_layers` × hidden, output.
    pub fn dims(&self) -> Vec<usize> {
        let mut dims = vec![self.internal_dim];
        dims.extend(std::iter::repeat(self.hidden_dim).take(self.num_hidden_layers));
        dims.push(self.output_dim);
        dims
    }
}

#[derive(Debug, Clone)]
pub struct PcDecoder {
    store: ParamStore,
    layers: Vec<Linear>,
    nodes: Vec<Node>,
    activation: Activation,
}

impl PcDecoder {
    /// Build a chain with the given node dimensions.
    ///
    /// Slots are registered in pre-order: `nodes.0`, then `layers.i` followed
    /// by `nodes.{i+1}` for each layer.
    ///
    /// # Errors
    /// `InvalidConfig` if fewer than two dimensions are given or any is zero.
    pub fn with_dims(
        dims: &[usize],
        activation: Activation,
        internal_init: Option<InitFn>,
        rkg: &mut RandomKeyGenerator,
    ) -> PcResult<Self> {
        if dims.len() < 2 {
            return Err(PcError::InvalidConfig(format!(
                "a decoder needs at least 2 node dimensions, got {dims:?}"
            )));
        }

        let mut store = ParamStore::new();
        let mut first = Node::register(&mut store, "nodes.0", dims[0])?.without_prior();
        if let Some(init_fn) = internal_init {
            first = first.with_init_fn(init_fn);
        }
        let mut nodes = vec![first];
        let mut layers = Vec::with_capacity(dims.len() - 1);

        for (i, pair) in dims.windows(2).enumerate() {
            layers.push(Linear::register(
                &mut store,
                &format!("layers.{i}"),
                pair[0],
                pair[1],
                rkg,
            )?);
            nodes.push(Node::register(&mut store, &format!("nodes.{}", i + 1), pair[1])?);
        }

        if let Some(output) = nodes.last() {
            output.freeze(&mut store, true)?;
        }

        Ok(Self {
            store,
            layers,
            nodes,
            activation,
        })
    }

    /// `num_layers` layers whose widths step linearly from `internal_dim` to `output_dim`:
    /// ```text
    /// step = round((output_dim - internal_dim) / num_layers)
    /// dim_i = internal_dim + i · step,   dim_{num_layers} = output_dim
    /// ```
    pub fn new(
        internal_dim: usize,
        output_dim: usize,
        num_layers: usize,
        activation: Activation,
        internal_init: Option<InitFn>,
        rkg: &mut RandomKeyGenerator,
    ) -> PcResult<Self> {
        if num_layers == 0 {
            return Err(PcError::InvalidConfig("num_layers must be at least 1".to_string()));
        }
        let step = ((output_dim as f64 - internal_dim as f64) / num_layers as f64).round() as i64;
        let mut dims = Vec::with_capacity(num_layers + 1);
        for i in 0..num_layers {
            let dim = internal_dim as i64 + step * i as i64;
            if dim <= 0 {
                return Err(PcError::InvalidConfig(format!(
                    "interpolated layer {i} has non-positive width {dim}"
                )));
            }
            dims.push(dim as usize);
        }
        dims.push(output_dim);
        Self::with_dims(&dims, activation, internal_init, rkg)
    }

    /// Internal → hidden × `num_hidden_layers` → output, with a standard-normal internal init.
    pub fn from_config(config: &ModelConfig, rkg: &mut RandomKeyGenerator) -> PcResult<Self> {
        Self::with_dims(&config.dims(), config.activation, Some(normal_init()), rkg)
    }

    pub fn layers(&self) -> &[Linear] {
        &self.layers
    }

    pub fn activation(&self) -> Activation {
        self.activation
    }

    /// Current node dimensions in chain order.
    pub fn dims(&self) -> Vec<usize> {
        self.nodes.iter().map(Node::dim).collect()
    }

    pub fn internal_dim(&self) -> usize {
        self.nodes.first().map(Node::dim).unwrap_or_default()
    }

    pub fn output_dim(&self) -> usize {
        self.nodes.last().map(Node::dim).unwrap_or_default()
    }

    /// Insert a hidden layer (and its node) just before the output layer.
    ///
    /// The new layer is square at the width feeding the output layer. It
    /// copies the last square hidden layer when there is one; otherwise it is
    /// freshly initialized. The new slots are registered at the end of the
    /// store, so partitions taken before the call no longer merge.
    pub fn push_hidden_layer(&mut self, rkg: &mut RandomKeyGenerator) -> PcResult<()> {
        let output_layer = self
            .layers
            .last()
            .ok_or_else(|| PcError::InvalidConfig("decoder has no layers".to_string()))?;
        let width = output_layer.in_dim();

        let template = self
            .layers
            .iter()
            .rev()
            .skip(1)
            .find(|l| l.in_dim() == width && l.out_dim() == width)
            .map(|l| -> PcResult<_> {
                Ok((
                    self.store.get(l.weight_key())?.clone(),
                    self.store.get(l.bias_key())?.clone(),
                ))
            })
            .transpose()?;

        let layer_path = format!("layers.{}", self.layers.len());
        let node_path = format!("nodes.{}", self.nodes.len());
        let layer = Linear::register(&mut self.store, &layer_path, width, width, rkg)?;
        if let Some((weight, bias)) = template {
            self.store.set(layer.weight_key(), weight)?;
            self.store.set(layer.bias_key(), bias)?;
        }
        let node = Node::register(&mut self.store, &node_path, width)?;

        let at = self.layers.len() - 1;
        self.layers.insert(at, layer);
        self.nodes.insert(self.nodes.len() - 1, node);
        info!(layers = self.layers.len(), width, "extended decoder with a hidden layer");
        Ok(())
    }

    /// Number of hidden layers (nodes strictly between input and output).
    pub fn num_hidden_layers(&self) -> usize {
        self.nodes.len().saturating_sub(2)
    }
}

impl Module for PcDecoder {
    fn store(&self) -> &ParamStore {
        &self.store
    }

    fn store_mut(&mut self) -> &mut ParamStore {
        &mut self.store
    }
}

impl Bound for PcDecoder {
    fn fingerprint(&self) -> Fingerprint {
        self.store.fingerprint()
    }
}

impl EnergyModel for PcDecoder {
    fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    fn forward(
        &self,
        cx: &mut Scope,
        example: Option<Var>,
        internal_state: Option<Var>,
    ) -> PcResult<Var> {
        let (first, rest) = self
            .nodes
            .split_first()
            .ok_or_else(|| PcError::InvalidConfig("decoder has no nodes".to_string()))?;

        let seed = match internal_state {
            Some(state) => state,
            None => cx.get(first.x_key())?,
        };
        let mut x = first.call(&self.store, cx, seed)?;

        let last = self.layers.len().saturating_sub(1);
        for (i, (layer, node)) in self.layers.iter().zip(rest).enumerate() {
            let mut h = layer.forward(cx, x)?;
            if i < last {
                h = cx.activate(h, self.activation)?;
            }
            x = node.call(&self.store, cx, h)?;
        }

        let output = rest.last().unwrap_or(first);
        if let Some(example) = example {
            cx.set(output.x_key(), example)?;
        }
        cx.get(output.u_key())
    }
}
