//! Composable transformations over functional views.
//!
//! - [`GradAndValue`]: reverse-mode gradient of a scalar loss with respect to
//!   the target side of a partition
//! - [`vmap`]: vectorizing map over a leading batch axis
//! - [`snapshot`]: functions specialized against bound structural arguments
//! - [`flow`]: cond / switch / scan / while_loop threading the partition as carry
//!
//! ## Gradient contract
//!
//! ```text
//! grad_and_value(P)(f)(M, args) = (∂f₀/∂target, (f(M, args), other'))
//! ```
//! The key set of the gradient map always equals the key set of the target
//! side; a target slot the loss does not depend on receives zeros. Non-finite
//! losses are logged and returned unchanged.

pub mod flow;
pub mod snapshot;
pub mod vmap;

pub use flow::{
    cond, scan, switch, while_loop, Branch, Cond, Iteration, Scan, ScanOutput, ScanOver, ScanStep,
    Switch, WhileLoop,
};
pub use snapshot::{Bound, Snapshot, StalePolicy};
pub use vmap::{vmap, InAxis, OutAxis, Vmap};

use ndarray::ArrayD;
use tracing::warn;

use crate::core::{scalar_value, Module, PcError, PcResult, ParamMap, Tensor};
use crate::filter::Filter;
use crate::functional::{functionalize, Traced};
use crate::partition::{merge_subset, partition, Partition};

/// Gradient-and-value transformation of a traced function.
#[derive(Debug, Clone)]
pub struct GradAndValue<F> {
    filter: Filter,
    f: F,
}

/// Differentiate `f` with respect to the slots selected by `filter`.
///
/// `f` must return the scalar loss as its first output; any further outputs
/// are passed through as auxiliary values.
pub fn grad_and_value<F>(filter: Filter, f: F) -> GradAndValue<F> {
    GradAndValue { filter, f }
}

impl<F> GradAndValue<F> {
    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    /// Pure form: read `params`, return gradients, outputs and the updated
    /// `other` side. Nothing is written to `model`.
    ///
    /// # Errors
    /// `InvalidConfig` if `f` returns no outputs, `ShapeMismatch` if its first
    /// output is not a scalar, `StructuralMismatch` if `params` does not cover
    /// the model.
    pub fn call_pure<M>(
        &self,
        model: &M,
        params: &Partition,
        args: &[Tensor],
    ) -> PcResult<(ParamMap, (Vec<Tensor>, ParamMap))>
    where
        M: Module + ?Sized,
        F: Traced<M>,
    {
        let view = functionalize(model, self.filter.clone());
        let (cx, outs) = view.trace(params, &self.f, args)?;

        let loss = *outs.first().ok_or_else(|| {
            PcError::InvalidConfig("differentiated function returned no outputs".to_string())
        })?;
        let loss_value = scalar_value(cx.value(loss)?)?;
        if !loss_value.is_finite() {
            warn!(loss = loss_value, "non-finite loss under gradient transform");
        }

        let mut adjoints = cx.tape().backward(loss)?;
        let mut grads = ParamMap::new();
        for (key, var) in cx.leaves() {
            let grad = match adjoints.take(*var) {
                Some(g) => g,
                None => ArrayD::zeros(cx.value(*var)?.raw_dim()),
            };
            grads.insert(key.clone(), grad);
        }

        let values = outs
            .iter()
            .map(|v| cx.value(*v).cloned())
            .collect::<PcResult<Vec<_>>>()?;
        let updated = cx.partition()?;
        Ok((grads, (values, updated.other)))
    }

    /// Stateful form: partition `model`, differentiate, and merge the updated
    /// `other` side back. Target-side writes are discarded; the caller applies
    /// gradients through an optimizer.
    pub fn call<M>(&self, model: &mut M, args: &[Tensor]) -> PcResult<(ParamMap, Vec<Tensor>)>
    where
        M: Module + ?Sized,
        F: Traced<M>,
    {
        let params = partition(model, &self.filter)?;
        let (grads, (values, other)) = self.call_pure(model, &params, args)?;
        merge_subset(model.store_mut(), other)?;
        Ok((grads, values))
    }
}
