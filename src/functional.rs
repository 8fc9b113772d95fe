//! Functional views over stateful models.
//!
//! A [`FunctionalView`] pairs a model with a target filter and turns a call on
//! the model into a pure function of its partition:
//! ```text
//! f(target, other, args) -> (result, target', other')
//! ```
//! The caller's tensors are never mutated; every write flows back through the
//! returned partition. Two call styles are offered:
//!
//! - [`FunctionalView::call_traced`]: the function reads and writes slots
//!   through a [`Scope`] that records every operation on a [`Tape`], so the
//!   result can be differentiated with respect to the target side.
//! - [`FunctionalView::call`]: the function mutates a working copy of the
//!   model directly; the copy is re-partitioned afterwards.
//!
//! Writes to `other` slots (e.g. cached predictions) are captured and returned
//! just like writes to the target side.

use std::collections::BTreeMap;

use crate::core::{Module, PcError, PcResult, ParamKey, ParamMap, Tape, Tensor, Var};
use crate::filter::Filter;
use crate::partition::{merged, partition, Partition};
use crate::utils::Activation;

/// Tracing context for one functional call.
///
/// Every slot of the partition is bound to a tape variable: target slots as
/// differentiable leaves, other slots as constants. `set` rebinds a slot to a
/// new variable; the original leaves are kept for differentiation.
#[derive(Debug, Clone)]
pub struct Scope {
    tape: Tape,
    bindings: BTreeMap<ParamKey, Var>,
    leaves: BTreeMap<ParamKey, Var>,
    initializing: bool,
}

impl Scope {
    pub fn new(target: &ParamMap, other: &ParamMap) -> Self {
        let mut tape = Tape::new();
        let mut bindings = BTreeMap::new();
        let mut leaves = BTreeMap::new();
        for (key, value) in target {
            let var = tape.leaf(value.clone());
            bindings.insert(key.clone(), var);
            leaves.insert(key.clone(), var);
        }
        for (key, value) in other {
            bindings.insert(key.clone(), tape.constant(value.clone()));
        }
        Self {
            tape,
            bindings,
            leaves,
            initializing: false,
        }
    }

    /// True while the model is being seeded before relaxation.
    pub fn is_initializing(&self) -> bool {
        self.initializing
    }

    pub fn set_initializing(&mut self, initializing: bool) {
        self.initializing = initializing;
    }

    /// Current variable bound to `key`.
    pub fn get(&self, key: &ParamKey) -> PcResult<Var> {
        self.bindings
            .get(key)
            .copied()
            .ok_or_else(|| PcError::UnknownKey(key.path().to_string()))
    }

    /// Rebind `key` to `var`. The key must be part of the partition.
    pub fn set(&mut self, key: &ParamKey, var: Var) -> PcResult<()> {
        match self.bindings.get_mut(key) {
            Some(slot) => {
                *slot = var;
                Ok(())
            }
            None => Err(PcError::UnknownKey(key.path().to_string())),
        }
    }

    pub fn is_target(&self, key: &ParamKey) -> bool {
        self.leaves.contains_key(key)
    }

    /// Differentiable leaves of the target side.
    pub fn leaves(&self) -> &BTreeMap<ParamKey, Var> {
        &self.leaves
    }

    pub fn bindings(&self) -> &BTreeMap<ParamKey, Var> {
        &self.bindings
    }

    pub fn tape(&self) -> &Tape {
        &self.tape
    }

    pub fn value(&self, var: Var) -> PcResult<&Tensor> {
        self.tape.value(var)
    }

    pub fn constant(&mut self, value: Tensor) -> Var {
        self.tape.constant(value)
    }

    pub fn add(&mut self, a: Var, b: Var) -> PcResult<Var> {
        self.tape.add(a, b)
    }

    pub fn sub(&mut self, a: Var, b: Var) -> PcResult<Var> {
        self.tape.sub(a, b)
    }

    pub fn mul(&mut self, a: Var, b: Var) -> PcResult<Var> {
        self.tape.mul(a, b)
    }

    pub fn scale(&mut self, a: Var, factor: f32) -> PcResult<Var> {
        self.tape.scale(a, factor)
    }

    pub fn matvec(&mut self, w: Var, x: Var) -> PcResult<Var> {
        self.tape.matvec(w, x)
    }

    pub fn activate(&mut self, a: Var, activation: Activation) -> PcResult<Var> {
        self.tape.activate(a, activation)
    }

    pub fn sum(&mut self, a: Var) -> PcResult<Var> {
        self.tape.sum(a)
    }

    pub fn index(&mut self, a: Var, i: usize) -> PcResult<Var> {
        self.tape.index(a, i)
    }

    pub fn stack(&mut self, vars: &[Var]) -> PcResult<Var> {
        self.tape.stack(vars)
    }

    /// Current slot values, split along the original target/other sides.
    pub fn partition(&self) -> PcResult<Partition> {
        let mut parts = Partition::default();
        for (key, var) in &self.bindings {
            let value = self.tape.value(*var)?.clone();
            if self.leaves.contains_key(key) {
                parts.target.insert(key.clone(), value);
            } else {
                parts.other.insert(key.clone(), value);
            }
        }
        Ok(parts)
    }
}

/// A function traced through a [`Scope`].
///
/// `model` supplies structure (which keys exist, activations, dimensions);
/// values are read and written through `cx` only.
pub trait Traced<M: ?Sized> {
    fn trace(&self, model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>>;
}

impl<M: ?Sized, F> Traced<M> for F
where
    F: Fn(&M, &mut Scope, &[Var]) -> PcResult<Vec<Var>>,
{
    fn trace(&self, model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>> {
        self(model, cx, args)
    }
}

pub type TracedFn<M> = fn(&M, &mut Scope, &[Var]) -> PcResult<Vec<Var>>;

/// Pure view of `model` for a fixed target filter.
#[derive(Debug)]
pub struct FunctionalView<'m, M: ?Sized> {
    model: &'m M,
    filter: Filter,
    initializing: bool,
}

/// Build a functional view of `model` whose target side is selected by `filter`.
pub fn functionalize<M: Module + ?Sized>(model: &M, filter: Filter) -> FunctionalView<'_, M> {
    FunctionalView {
        model,
        filter,
        initializing: false,
    }
}

impl<'m, M: Module + ?Sized> FunctionalView<'m, M> {
    /// Trace calls with the initializing flag raised.
    pub fn initializing(mut self, initializing: bool) -> Self {
        self.initializing = initializing;
        self
    }

    pub fn filter(&self) -> &Filter {
        &self.filter
    }

    pub fn model(&self) -> &'m M {
        self.model
    }

    /// Partition the live model with this view's filter.
    pub fn partition(&self) -> PcResult<Partition> {
        partition(self.model, &self.filter)
    }

    /// Trace `f` over `params` and keep the scope for differentiation.
    ///
    /// Arguments enter the tape as constants.
    pub fn trace<F: Traced<M> + ?Sized>(
        &self,
        params: &Partition,
        f: &F,
        args: &[Tensor],
    ) -> PcResult<(Scope, Vec<Var>)> {
        self.check_cover(params)?;
        let mut cx = Scope::new(&params.target, &params.other);
        cx.set_initializing(self.initializing);
        let arg_vars: Vec<Var> = args.iter().map(|a| cx.constant(a.clone())).collect();
        let outs = f.trace(self.model, &mut cx, &arg_vars)?;
        Ok((cx, outs))
    }

    /// Evaluate `f` over `params`, returning its outputs and the updated partition.
    pub fn call_traced<F: Traced<M> + ?Sized>(
        &self,
        params: &Partition,
        f: &F,
        args: &[Tensor],
    ) -> PcResult<(Vec<Tensor>, Partition)> {
        let (cx, outs) = self.trace(params, f, args)?;
        let values = outs
            .iter()
            .map(|v| cx.value(*v).cloned())
            .collect::<PcResult<Vec<_>>>()?;
        Ok((values, cx.partition()?))
    }

    /// Run mutating code on a working copy built from `params`.
    pub fn call<R, F>(&self, params: Partition, f: F) -> PcResult<(R, Partition)>
    where
        M: Clone + Sized,
        F: FnOnce(&mut M) -> PcResult<R>,
    {
        let mut copy = merged(self.model, params.target, params.other)?;
        let result = f(&mut copy)?;
        let parts = partition(&copy, &self.filter)?;
        Ok((result, parts))
    }

    fn check_cover(&self, params: &Partition) -> PcResult<()> {
        let store = self.model.store();
        let missing: Vec<String> = store
            .keys()
            .filter(|k| !params.target.contains_key(k) && !params.other.contains_key(k))
            .map(|k| k.path().to_string())
            .collect();
        let extra: Vec<String> = params
            .target
            .keys()
            .chain(params.other.keys())
            .filter(|k| !store.contains(k))
            .map(|k| k.path().to_string())
            .collect();
        if missing.is_empty() && extra.is_empty() {
            Ok(())
        } else {
            Err(PcError::StructuralMismatch { missing, extra })
        }
    }
}
