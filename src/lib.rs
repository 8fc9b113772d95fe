//! # pcx
//!
//! Predictive coding training on a small functional substrate.
//!
//! ## Overview
//!
//! A predictive coding model is a chain of nodes, each predicting the next.
//! Inference relaxes the node states `X` toward a minimum of the summed local
//! energies; learning updates the layer weights `W` from the relaxed state.
//! Both are ordinary gradient steps, taken on different partitions of the
//! same parameter store:
//! ```text
//! E(X, W) = Σᵢ ½ ‖xᵢ - uᵢ(X, W)‖²
//! relax:  X ← X - η_x ∂E/∂X        (T times)
//! learn:  W ← W - η_w ∂E/∂W        (once per batch in pc mode, every iteration in ppc mode)
//! ```
//!
//! ## Structure
//!
//! - [`core`]: tensors, errors, the parameter store and the differentiation tape
//! - [`filter`]: predicates over slots
//! - [`partition`]: split a model into target/other maps and merge them back
//! - [`functional`]: pure, traced views of a model
//! - [`transform`]: gradient, vectorizing map, snapshots and control flow
//! - [`optim`]: update rules bound to a partition
//! - [`model`]: nodes, layers and the predictive coding decoder
//! - [`training`]: the relaxation loop, batch and epoch drivers
//! - [`checkpoint`]: weight save/load
//! - [`utils`]: activations and random keys

pub mod checkpoint;
pub mod core;
pub mod filter;
pub mod functional;
pub mod model;
pub mod optim;
pub mod partition;
pub mod training;
pub mod transform;
pub mod utils;

use std::path::Path;

use serde::{Deserialize, Serialize};

pub use crate::core::{PcError, PcResult, Tensor};
pub use filter::Filter;
pub use model::{EnergyModel, ModelConfig, PcDecoder};
pub use optim::{Adam, Decay, Optim, Rule, Schedule, Sgd};
pub use training::{
    get_internal_states_on_batch, test_on_batch, train_on_batch, BatchMetrics, EpochMetrics,
    PcMode, RelaxConfig, Session,
};
pub use utils::{Activation, RandomKeyGenerator};

/// Weight optimizer family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WeightOptimizer {
    /// SGD with momentum; the learning rate is divided by the batch size.
    #[default]
    Sgd,
    /// AdamW with decoupled weight decay.
    Adamw,
}

/// Training configuration for relaxation and weight updates.
///
/// Used by [`Session::from_config`] and the `pcx-train` binary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub pc_mode: PcMode,
    /// Relaxation iterations per batch.
    pub t: usize,
    pub epochs: usize,
    pub batch_size: usize,
    pub optim_x_lr: f32,
    pub optim_x_l2: f32,
    pub optim_w: WeightOptimizer,
    pub optim_w_lr: f32,
    pub optim_w_l2: f32,
    pub optim_w_momentum: f32,
    pub optim_w_nesterov: bool,
    /// Warmup steps of a warmup-cosine schedule for W; 0 keeps the rate constant.
    pub optim_w_warmup_steps: usize,
    /// Step at which the cosine decay reaches its floor.
    pub optim_w_decay_steps: usize,
    /// Epoch metrics average this many trailing batches (0 = all).
    pub use_last_n_batches_to_compute_metrics: usize,
    /// Stop after this many epochs without improvement (0 = never).
    pub early_stop_patience: usize,
    /// Start with one hidden layer and grow to `model.num_hidden_layers`.
    pub extend_hidden_layers: bool,
    pub extend_hidden_layers_every_n_epochs: usize,
    pub seed: u64,
    pub model: ModelConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            pc_mode: PcMode::Ppc,
            t: 20,
            epochs: 20,
            batch_size: 200,
            optim_x_lr: 0.1,
            optim_x_l2: 0.0,
            optim_w: WeightOptimizer::Sgd,
            optim_w_lr: 0.1,
            optim_w_l2: 0.0,
            optim_w_momentum: 0.9,
            optim_w_nesterov: false,
            optim_w_warmup_steps: 0,
            optim_w_decay_steps: 0,
            use_last_n_batches_to_compute_metrics: 0,
            early_stop_patience: 0,
            extend_hidden_layers: false,
            extend_hidden_layers_every_n_epochs: 5,
            seed: 0,
            model: ModelConfig::default(),
        }
    }
}

impl Config {
    /// Read a JSON config; missing fields take their defaults.
    pub fn from_json_file(path: &Path) -> PcResult<Self> {
        let json = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&json)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `InvalidConfig` naming the first offending field.
    pub fn validate(&self) -> PcResult<()> {
        let invalid = |msg: String| Err(PcError::InvalidConfig(msg));
        if self.batch_size == 0 {
            return invalid("batch_size must be positive".to_string());
        }
        for (name, value) in [
            ("optim_x_lr", self.optim_x_lr),
            ("optim_x_l2", self.optim_x_l2),
            ("optim_w_lr", self.optim_w_lr),
            ("optim_w_l2", self.optim_w_l2),
            ("optim_w_momentum", self.optim_w_momentum),
        ] {
            if !value.is_finite() || value < 0.0 {
                return invalid(format!("{name} must be finite and non-negative, got {value}"));
            }
        }
        if self.model.internal_dim == 0 || self.model.output_dim == 0 {
            return invalid("model dimensions must be positive".to_string());
        }
        if self.model.num_hidden_layers > 0 && self.model.hidden_dim == 0 {
            return invalid("hidden_dim must be positive".to_string());
        }
        if self.extend_hidden_layers && self.extend_hidden_layers_every_n_epochs == 0 {
            return invalid("extend_hidden_layers_every_n_epochs must be positive".to_string());
        }
        if self.optim_w_warmup_steps > 0 && self.optim_w_decay_steps < self.optim_w_warmup_steps {
            return invalid("optim_w_decay_steps must not precede the warmup".to_string());
        }
        Ok(())
    }

    pub fn relax(&self) -> RelaxConfig {
        RelaxConfig {
            t: self.t,
            mode: self.pc_mode,
        }
    }

    fn w_schedule(&self, peak: f32) -> Schedule {
        if self.optim_w_warmup_steps == 0 && self.optim_w_decay_steps == 0 {
            return Schedule::Constant(peak);
        }
        Schedule::WarmupCosine {
            init: 0.0,
            peak,
            warmup_steps: self.optim_w_warmup_steps,
            decay_steps: self.optim_w_decay_steps,
            end: 0.0,
        }
    }

    /// Weight update rule. SGD rates are per example, so they are divided by the batch size.
    pub fn w_rule(&self) -> Rule {
        match self.optim_w {
            WeightOptimizer::Sgd => Sgd::new(self.w_schedule(self.optim_w_lr / self.batch_size as f32))
                .momentum(self.optim_w_momentum)
                .nesterov(self.optim_w_nesterov)
                .weight_decay(self.optim_w_l2, Decay::Coupled)
                .into(),
            WeightOptimizer::Adamw => Adam::new(self.w_schedule(self.optim_w_lr))
                .weight_decay(self.optim_w_l2)
                .into(),
        }
    }
}
