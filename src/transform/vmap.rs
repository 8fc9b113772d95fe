//! Vectorizing map.
//!
//! `vmap(mapped, in_axes, out_axes, f)` runs `f` once per example of a leading
//! batch axis. Slots selected by `mapped` carry the batch axis and are sliced
//! per example; every other slot is shared by all examples and must not be
//! written inside `f`. Arguments are sliced or broadcast per `in_axes`, and
//! each output is stacked, summed or averaged per `out_axes`:
//! ```text
//! vmap(node, [Batched], [Sum])(energy)  =  Σ_b energy(x[b], u[b], example[b])
//! ```
//! Slices and reductions are recorded on the tape, so gradients flow back to
//! the batched slots and to the shared ones.

use crate::core::{Module, PcError, PcResult, ParamKey, Var};
use crate::filter::Filter;
use crate::functional::{Scope, Traced};

/// How an argument enters each per-example call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InAxis {
    /// Sliced along axis 0.
    Batched,
    /// Passed whole to every example.
    Broadcast,
}

/// How per-example outputs are combined.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutAxis {
    /// Stacked along a new leading axis.
    Stacked,
    /// Summed elementwise.
    Sum,
    /// Averaged over the batch.
    Mean,
}

#[derive(Debug, Clone)]
pub struct Vmap<F> {
    mapped: Filter,
    in_axes: Vec<InAxis>,
    out_axes: Vec<OutAxis>,
    f: F,
}

pub fn vmap<F>(mapped: Filter, in_axes: Vec<InAxis>, out_axes: Vec<OutAxis>, f: F) -> Vmap<F> {
    Vmap {
        mapped,
        in_axes,
        out_axes,
        f,
    }
}

impl<F> Vmap<F> {
    pub fn mapped(&self) -> &Filter {
        &self.mapped
    }

    fn batch_size(&self, cx: &Scope, mapped: &[(ParamKey, Var)], args: &[Var]) -> PcResult<usize> {
        let mut batch: Option<(usize, String)> = None;
        let mut check = |size: usize, what: String| -> PcResult<()> {
            if let Some((expected, first)) = &batch {
                if *expected != size {
                    return Err(PcError::ShapeMismatch(format!(
                        "batch size {size} of {what} disagrees with {expected} of {first}"
                    )));
                }
                return Ok(());
            }
            batch = Some((size, what));
            Ok(())
        };

        for (key, var) in mapped {
            check(leading_dim(cx, *var, key.path())?, format!("slot `{key}`"))?;
        }
        for (i, (arg, axis)) in args.iter().zip(&self.in_axes).enumerate() {
            if *axis == InAxis::Batched {
                check(leading_dim(cx, *arg, "argument")?, format!("argument {i}"))?;
            }
        }

        batch.map(|(size, _)| size).ok_or_else(|| {
            PcError::InvalidConfig("vmap has no batched slot or argument".to_string())
        })
    }
}

fn leading_dim(cx: &Scope, var: Var, what: &str) -> PcResult<usize> {
    let value = cx.value(var)?;
    value.shape().first().copied().ok_or_else(|| {
        PcError::ShapeMismatch(format!("{what} is 0-d and cannot be batched"))
    })
}

impl<M, F> Traced<M> for Vmap<F>
where
    M: Module + ?Sized,
    F: Traced<M>,
{
    fn trace(&self, model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>> {
        if args.len() != self.in_axes.len() {
            return Err(PcError::InvalidConfig(format!(
                "vmap expects {} arguments, got {}",
                self.in_axes.len(),
                args.len()
            )));
        }

        let mapped: Vec<(ParamKey, Var)> = self
            .mapped
            .select(model.store())?
            .into_iter()
            .map(|key| cx.get(&key).map(|var| (key, var)))
            .collect::<PcResult<_>>()?;
        let shared: Vec<(ParamKey, Var)> = cx
            .bindings()
            .iter()
            .filter(|(key, _)| !mapped.iter().any(|(m, _)| m == *key))
            .map(|(key, var)| (key.clone(), *var))
            .collect();

        let batch = self.batch_size(cx, &mapped, args)?;

        let mut rows: Vec<Vec<Var>> = vec![Vec::with_capacity(batch); mapped.len()];
        let mut written = vec![false; mapped.len()];
        let mut outputs: Vec<Vec<Var>> = vec![Vec::with_capacity(batch); self.out_axes.len()];

        for b in 0..batch {
            let mut sliced = Vec::with_capacity(mapped.len());
            for (key, whole) in &mapped {
                let row = cx.index(*whole, b)?;
                cx.set(key, row)?;
                sliced.push(row);
            }
            let example_args = args
                .iter()
                .zip(&self.in_axes)
                .map(|(arg, axis)| match axis {
                    InAxis::Batched => cx.index(*arg, b),
                    InAxis::Broadcast => Ok(*arg),
                })
                .collect::<PcResult<Vec<_>>>()?;

            let outs = self.f.trace(model, cx, &example_args)?;
            if outs.len() != self.out_axes.len() {
                return Err(PcError::InvalidConfig(format!(
                    "vmapped function returned {} outputs for {} out_axes",
                    outs.len(),
                    self.out_axes.len()
                )));
            }
            for (key, var) in &shared {
                if cx.get(key)? != *var {
                    return Err(PcError::InvalidConfig(format!(
                        "vmapped function wrote shared slot `{key}`"
                    )));
                }
            }

            for (i, (key, _)) in mapped.iter().enumerate() {
                let current = cx.get(key)?;
                written[i] |= current != sliced[i];
                rows[i].push(current);
            }
            for (i, out) in outs.into_iter().enumerate() {
                outputs[i].push(out);
            }
        }

        for (i, (key, whole)) in mapped.iter().enumerate() {
            let restored = if written[i] {
                cx.stack(&rows[i])?
            } else {
                *whole
            };
            cx.set(key, restored)?;
        }

        outputs
            .iter()
            .zip(&self.out_axes)
            .map(|(vars, axis)| reduce(cx, vars, *axis, batch))
            .collect()
    }
}

fn reduce(cx: &mut Scope, vars: &[Var], axis: OutAxis, batch: usize) -> PcResult<Var> {
    match axis {
        OutAxis::Stacked => cx.stack(vars),
        OutAxis::Sum | OutAxis::Mean => {
            let (first, rest) = vars
                .split_first()
                .ok_or_else(|| PcError::InvalidConfig("cannot reduce an empty batch".to_string()))?;
            let mut total = *first;
            for v in rest {
                total = cx.add(total, *v)?;
            }
            if axis == OutAxis::Mean {
                total = cx.scale(total, 1.0 / batch as f32)?;
            }
            Ok(total)
        }
    }
}
