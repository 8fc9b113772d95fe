//! Affine layer `y = W x + b`.

use ndarray::{ArrayD, IxDyn};

use crate::core::{PcError, PcResult, ParamKey, ParamStore, Role, Var};
use crate::functional::Scope;
use crate::utils::RandomKeyGenerator;

#[derive(Debug, Clone)]
pub struct Linear {
    weight: ParamKey,
    bias: ParamKey,
    in_dim: usize,
    out_dim: usize,
}

impl Linear {
    /// Register `{path}.weight` (`[out_dim, in_dim]`) and `{path}.bias` (`[out_dim]`).
    ///
    /// Weights use Xavier/Glorot uniform initialization:
    /// `W ~ U(-limit, limit)` where `limit = sqrt(6 / (fan_in + fan_out))`.
    /// Biases start at zero.
    pub fn register(
        store: &mut ParamStore,
        path: &str,
        in_dim: usize,
        out_dim: usize,
        rkg: &mut RandomKeyGenerator,
    ) -> PcResult<Self> {
        if in_dim == 0 || out_dim == 0 {
            return Err(PcError::InvalidConfig(format!(
                "layer `{path}` has an empty dimension ({in_dim} -> {out_dim})"
            )));
        }
        let limit = (6.0f32 / (in_dim + out_dim) as f32).sqrt();
        let w = rkg.uniform(&[out_dim, in_dim], -limit, limit)?;
        let weight = store.register(format!("{path}.weight"), w, Role::LayerWeight)?;
        let bias = store.register(
            format!("{path}.bias"),
            ArrayD::zeros(IxDyn(&[out_dim])),
            Role::LayerWeight,
        )?;
        Ok(Self {
            weight,
            bias,
            in_dim,
            out_dim,
        })
    }

    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    pub fn out_dim(&self) -> usize {
        self.out_dim
    }

    pub fn weight_key(&self) -> &ParamKey {
        &self.weight
    }

    pub fn bias_key(&self) -> &ParamKey {
        &self.bias
    }

    /// Traced `W x + b` for one example `x: [in_dim]`.
    pub fn forward(&self, cx: &mut Scope, x: Var) -> PcResult<Var> {
        let w = cx.get(&self.weight)?;
        let b = cx.get(&self.bias)?;
        let wx = cx.matvec(w, x)?;
        cx.add(wx, b)
    }
}
