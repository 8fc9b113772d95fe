//! Energy-based models.
//!
//! A model is a chain of [`Node`]s joined by parameterized layers. Every value
//! lives in the model's [`ParamStore`](crate::core::ParamStore); nodes and
//! layers hold keys only. Total energy is the sum of the local node energies:
//! ```text
//! E = Σᵢ ½ ‖xᵢ - uᵢ‖²
//! ```
//! Forward passes and energies are traced per example through a
//! [`Scope`]; batching happens one level up, in [`crate::transform::vmap`].

pub mod decoder;
pub mod linear;
pub mod node;

pub use decoder::{ModelConfig, PcDecoder};
pub use linear::Linear;
pub use node::{normal_init, InitFn, Node, NodeInit};

use crate::core::{Module, PcError, PcResult, Tensor, Var};
use crate::functional::Scope;
use crate::utils::RandomKeyGenerator;

/// A model whose inference minimizes a sum of local node energies.
pub trait EnergyModel: Module {
    /// Nodes in chain order (input first, output last).
    fn nodes(&self) -> &[Node];

    /// Traced forward pass for one example.
    ///
    /// `example` clamps the output state; `internal_state` overrides the
    /// prediction fed to the first node (its own state when `None`).
    /// Returns the output prediction.
    fn forward(
        &self,
        cx: &mut Scope,
        example: Option<Var>,
        internal_state: Option<Var>,
    ) -> PcResult<Var>;

    /// Sum of every node's local energy under the current bindings.
    fn energy(&self, cx: &mut Scope) -> PcResult<Var> {
        let mut total: Option<Var> = None;
        for node in self.nodes() {
            let e = node.energy(cx)?;
            total = Some(match total {
                Some(acc) => cx.add(acc, e)?,
                None => e,
            });
        }
        total.ok_or_else(|| PcError::InvalidConfig("model has no nodes".to_string()))
    }

    /// Reset every node to a `[batch, dim]` state and run its init hook.
    fn init_nodes(&mut self, batch: usize, rkg: &mut RandomKeyGenerator) -> PcResult<()> {
        let nodes = self.nodes().to_vec();
        for node in &nodes {
            let mut child = rkg.split();
            node.initialize(self.store_mut(), batch, &mut child)?;
        }
        Ok(())
    }

    /// Prediction slot `u` of the output node.
    fn prediction(&self) -> PcResult<&Tensor> {
        let node = self
            .nodes()
            .last()
            .ok_or_else(|| PcError::InvalidConfig("model has no nodes".to_string()))?;
        self.store().get(node.u_key())
    }

    /// State slot `x` of the input node.
    fn internal_state(&self) -> PcResult<&Tensor> {
        let node = self
            .nodes()
            .first()
            .ok_or_else(|| PcError::InvalidConfig("model has no nodes".to_string()))?;
        self.store().get(node.x_key())
    }
}
