//! Structured control flow over functional views.
//!
//! Each combinator partitions the model with its filter, runs the body on a
//! working copy built from the carried partition, re-partitions the copy and
//! carries the result into the next branch or iteration. The final partition
//! is merged back into the model once the combinator finishes, so a body error
//! leaves the model untouched.
//!
//! `scan` and `while_loop` also carry a list of auxiliary arguments. Output
//! `i` of one iteration feeds argument `map_outputs[i]` of the next (identity
//! when `map_outputs` is shorter than the output list).

use ndarray::Axis;
use tracing::trace;

use crate::core::{Module, PcError, PcResult, Tensor};
use crate::filter::Filter;
use crate::functional::{functionalize, FunctionalView};
use crate::partition::{merge, Partition};

/// Partition `model`, hand the view and partition to `run`, merge the result.
fn thread<M, R>(
    model: &mut M,
    filter: &Filter,
    run: impl FnOnce(&FunctionalView<'_, M>, Partition) -> PcResult<(R, Partition)>,
) -> PcResult<R>
where
    M: Module + Clone,
{
    let (result, parts) = {
        let view = functionalize(&*model, filter.clone());
        let params = view.partition()?;
        run(&view, params)?
    };
    merge(model, parts.target, parts.other)?;
    Ok(result)
}

fn apply_map_outputs(
    args: &mut [Tensor],
    outputs: Vec<Tensor>,
    map_outputs: &[usize],
) -> PcResult<()> {
    let carried = args.len();
    for (i, out) in outputs.into_iter().enumerate() {
        let dest = map_outputs.get(i).copied().unwrap_or(i);
        let slot = args.get_mut(dest).ok_or_else(|| {
            PcError::InvalidConfig(format!(
                "output {i} maps to argument {dest}, but only {carried} arguments are carried"
            ))
        })?;
        *slot = out;
    }
    Ok(())
}

/// Two-way branch.
pub struct Cond<T, E> {
    on_true: T,
    on_false: E,
    filter: Filter,
}

pub fn cond<M, T, E>(on_true: T, on_false: E, filter: Filter) -> Cond<T, E>
where
    T: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
    E: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
{
    Cond {
        on_true,
        on_false,
        filter,
    }
}

impl<T, E> Cond<T, E> {
    pub fn call<M>(&mut self, model: &mut M, pred: bool, args: &[Tensor]) -> PcResult<Vec<Tensor>>
    where
        M: Module + Clone,
        T: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
        E: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
    {
        let on_true = &mut self.on_true;
        let on_false = &mut self.on_false;
        thread(model, &self.filter, |view, params| {
            view.call(params, |m| {
                if pred {
                    on_true(m, args)
                } else {
                    on_false(m, args)
                }
            })
        })
    }
}

pub type Branch<'a, M> = Box<dyn FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>> + 'a>;

/// Multi-way branch over an indexed dispatch table.
pub struct Switch<'a, M> {
    branches: Vec<Branch<'a, M>>,
    filter: Filter,
}

pub fn switch<'a, M>(branches: Vec<Branch<'a, M>>, filter: Filter) -> Switch<'a, M> {
    Switch { branches, filter }
}

impl<'a, M: Module + Clone> Switch<'a, M> {
    pub fn len(&self) -> usize {
        self.branches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.branches.is_empty()
    }

    /// Run branch `index`, clamped into `[0, len - 1]`.
    ///
    /// # Errors
    /// `InvalidConfig` if the table is empty.
    pub fn call(&mut self, model: &mut M, index: usize, args: &[Tensor]) -> PcResult<Vec<Tensor>> {
        let last = self
            .branches
            .len()
            .checked_sub(1)
            .ok_or_else(|| PcError::InvalidConfig("switch has no branches".to_string()))?;
        let branch = &mut self.branches[index.min(last)];
        thread(model, &self.filter, |view, params| {
            view.call(params, |m| branch(m, args))
        })
    }
}

/// Result of one scan iteration.
///
/// The variant says explicitly whether the iteration only emits an output or
/// also updates the carried arguments.
#[derive(Debug, Clone)]
pub enum ScanStep {
    /// Per-iteration output only; carried arguments stay as they are.
    Emit(Tensor),
    /// Updated carried arguments, routed through `map_outputs`, and an optional output.
    Carry {
        args: Vec<Tensor>,
        output: Option<Tensor>,
    },
}

/// What a scan iterates over.
#[derive(Debug, Clone)]
pub enum ScanOver {
    /// `0..n`.
    Length(usize),
    /// Rows of a tensor along axis 0.
    Items(Tensor),
}

/// Per-iteration context handed to the scan body.
#[derive(Debug, Clone)]
pub struct Iteration {
    pub index: usize,
    pub item: Option<Tensor>,
}

#[derive(Debug, Clone)]
pub struct ScanOutput {
    /// Per-iteration outputs stacked along a new axis 0, if the body emitted any.
    pub outputs: Option<Tensor>,
    /// Carried arguments after the last iteration.
    pub args: Vec<Tensor>,
}

pub struct Scan<F> {
    body: F,
    over: ScanOver,
    map_outputs: Vec<usize>,
    filter: Filter,
}

pub fn scan<M, F>(body: F, over: ScanOver, filter: Filter) -> Scan<F>
where
    F: FnMut(&mut M, &Iteration, &[Tensor]) -> PcResult<ScanStep>,
{
    Scan {
        body,
        over,
        map_outputs: Vec::new(),
        filter,
    }
}

impl<F> Scan<F> {
    pub fn with_map_outputs(mut self, map_outputs: Vec<usize>) -> Self {
        self.map_outputs = map_outputs;
        self
    }

    pub fn call<M>(&mut self, model: &mut M, args: Vec<Tensor>) -> PcResult<ScanOutput>
    where
        M: Module + Clone,
        F: FnMut(&mut M, &Iteration, &[Tensor]) -> PcResult<ScanStep>,
    {
        let length = match &self.over {
            ScanOver::Length(n) => *n,
            ScanOver::Items(items) => *items.shape().first().ok_or_else(|| {
                PcError::ShapeMismatch("cannot scan over a 0-d tensor".to_string())
            })?,
        };
        let over = &self.over;
        let body = &mut self.body;
        let map_outputs = &self.map_outputs;

        thread(model, &self.filter, move |view, mut carry| {
            let mut args = args;
            let mut ys: Vec<Tensor> = Vec::with_capacity(length);
            let mut emits: Option<bool> = None;

            for index in 0..length {
                let item = match over {
                    ScanOver::Length(_) => None,
                    ScanOver::Items(items) => Some(items.index_axis(Axis(0), index).to_owned()),
                };
                let it = Iteration { index, item };
                let (step, next) = view.call(carry, |m| body(m, &it, &args))?;
                carry = next;

                let y = match step {
                    ScanStep::Emit(y) => Some(y),
                    ScanStep::Carry { args: outs, output } => {
                        apply_map_outputs(&mut args, outs, map_outputs)?;
                        output
                    }
                };
                match (emits, &y) {
                    (None, _) => emits = Some(y.is_some()),
                    (Some(expected), y) if expected != y.is_some() => {
                        return Err(PcError::InvalidConfig(format!(
                            "scan iteration {index} {} an output unlike the iterations before it",
                            if expected { "omitted" } else { "produced" }
                        )))
                    }
                    _ => {}
                }
                ys.extend(y);
                trace!(index, "scan iteration");
            }

            let outputs = if ys.is_empty() {
                None
            } else {
                let views: Vec<_> = ys.iter().map(|y| y.view()).collect();
                Some(
                    ndarray::stack(Axis(0), &views)
                        .map_err(|e| PcError::ShapeMismatch(format!("scan outputs: {e}")))?,
                )
            };
            Ok((ScanOutput { outputs, args }, carry))
        })
    }
}

pub struct WhileLoop<F, C> {
    body: F,
    cond: C,
    map_outputs: Vec<usize>,
    filter: Filter,
}

pub fn while_loop<M, F, C>(body: F, cond: C, filter: Filter) -> WhileLoop<F, C>
where
    F: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
    C: FnMut(&[Tensor]) -> bool,
{
    WhileLoop {
        body,
        cond,
        map_outputs: Vec::new(),
        filter,
    }
}

impl<F, C> WhileLoop<F, C> {
    pub fn with_map_outputs(mut self, map_outputs: Vec<usize>) -> Self {
        self.map_outputs = map_outputs;
        self
    }

    /// Run `body` while `cond(args)` holds; returns the final carried arguments.
    pub fn call<M>(&mut self, model: &mut M, args: Vec<Tensor>) -> PcResult<Vec<Tensor>>
    where
        M: Module + Clone,
        F: FnMut(&mut M, &[Tensor]) -> PcResult<Vec<Tensor>>,
        C: FnMut(&[Tensor]) -> bool,
    {
        let body = &mut self.body;
        let cond = &mut self.cond;
        let map_outputs = &self.map_outputs;

        thread(model, &self.filter, move |view, mut carry| {
            let mut args = args;
            let mut iterations = 0usize;
            while cond(&args) {
                let (outs, next) = view.call(carry, |m| body(m, &args))?;
                carry = next;
                apply_map_outputs(&mut args, outs, map_outputs)?;
                iterations += 1;
            }
            trace!(iterations, "while_loop finished");
            Ok((args, carry))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::{scalar, ParamStore, Role};
    use ndarray::arr1;

    fn store() -> ParamStore {
        let mut s = ParamStore::new();
        s.register("acc", arr1(&[0.0]).into_dyn(), Role::NodeState)
            .unwrap();
        s
    }

    fn bump(m: &mut ParamStore, by: f32) -> PcResult<f32> {
        let key = m.find("acc").cloned().ok_or_else(|| PcError::UnknownKey("acc".into()))?;
        let value = m.value_mut(&key)?;
        value[[0]] += by;
        Ok(value[[0]])
    }

    #[test]
    fn test_cond_picks_branch() {
        let mut s = store();
        let mut c = cond(
            |m: &mut ParamStore, _: &[Tensor]| Ok(vec![scalar(bump(m, 1.0)?)]),
            |m: &mut ParamStore, _: &[Tensor]| Ok(vec![scalar(bump(m, -1.0)?)]),
            Filter::node(),
        );
        c.call(&mut s, true, &[]).unwrap();
        c.call(&mut s, true, &[]).unwrap();
        let out = c.call(&mut s, false, &[]).unwrap();
        assert_eq!(out[0].sum(), 1.0);
        assert_eq!(acc(&s), 1.0);
    }

    #[test]
    fn test_switch_clamps_index() {
        let mut s = store();
        let branches: Vec<Branch<'_, ParamStore>> = vec![
            Box::new(|m: &mut ParamStore, _: &[Tensor]| -> PcResult<Vec<Tensor>> { Ok(vec![scalar(bump(m, 1.0)?)]) }),
            Box::new(|m: &mut ParamStore, _: &[Tensor]| -> PcResult<Vec<Tensor>> { Ok(vec![scalar(bump(m, 10.0)?)]) }),
        ];
        let mut sw = switch(branches, Filter::all());
        sw.call(&mut s, 7, &[]).unwrap();
        assert_eq!(acc(&s), 10.0);

        let mut empty: Switch<'_, ParamStore> = switch(vec![], Filter::all());
        assert!(matches!(
            empty.call(&mut s, 0, &[]),
            Err(PcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_scan_items_and_carry() {
        let mut s = store();
        let items = arr1(&[1.0, 2.0, 3.0]).into_dyn();
        let mut running = scan(
            |m: &mut ParamStore, it: &Iteration, args: &[Tensor]| {
                let x = it.item.as_ref().map(|t| t.sum()).unwrap_or(0.0);
                bump(m, x)?;
                let total = &args[0] + x;
                Ok(ScanStep::Carry {
                    output: Some(total.clone()),
                    args: vec![total],
                })
            },
            ScanOver::Items(items),
            Filter::node(),
        );
        let out = running.call(&mut s, vec![scalar(0.0)]).unwrap();
        assert_eq!(out.args[0].sum(), 6.0);
        let ys: Vec<f32> = out.outputs.unwrap().iter().copied().collect();
        assert_eq!(ys, vec![1.0, 3.0, 6.0]);
        assert_eq!(acc(&s), 6.0);
    }

    #[test]
    fn test_scan_inconsistent_outputs_rejected() {
        let mut s = store();
        let mut bad = scan(
            |_: &mut ParamStore, it: &Iteration, args: &[Tensor]| {
                if it.index == 0 {
                    Ok(ScanStep::Emit(scalar(0.0)))
                } else {
                    Ok(ScanStep::Carry {
                        args: args.to_vec(),
                        output: None,
                    })
                }
            },
            ScanOver::Length(3),
            Filter::all(),
        );
        assert!(bad.call(&mut s, vec![]).is_err());
        assert_eq!(acc(&s), 0.0);
    }

    #[test]
    fn test_map_outputs_out_of_range() {
        let mut s = store();
        let mut bad = scan(
            |_: &mut ParamStore, _: &Iteration, args: &[Tensor]| {
                Ok(ScanStep::Carry {
                    args: args.to_vec(),
                    output: None,
                })
            },
            ScanOver::Length(1),
            Filter::all(),
        )
        .with_map_outputs(vec![4]);
        assert!(matches!(
            bad.call(&mut s, vec![scalar(0.0)]),
            Err(PcError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_while_loop_counts_down() {
        let mut s = store();
        let mut countdown = while_loop(
            |m: &mut ParamStore, args: &[Tensor]| {
                bump(m, 1.0)?;
                Ok(vec![&args[0] - 1.0])
            },
            |args: &[Tensor]| args[0].sum() > 0.0,
            Filter::node(),
        );
        let out = countdown.call(&mut s, vec![scalar(4.0)]).unwrap();
        assert_eq!(out[0].sum(), 0.0);
        assert_eq!(acc(&s), 4.0);
    }

    fn acc(s: &ParamStore) -> f32 {
        s.get(s.find("acc").unwrap()).unwrap().sum()
    }
}
