//! Tests for the partition / functional / transform substrate on a real decoder.
//!
//! These tests verify:
//! - Partition then merge is the identity, and partitions are disjoint and complete
//! - Gradients are produced exactly for the target partition
//! - Traced gradients agree with finite differences
//! - scan distinguishes emitted outputs from carried updates
//! - Optimizers bound to empty partitions are no-ops

use approx::assert_abs_diff_eq;
use pcx::core::{scalar, scalar_value, Module, ParamMap, Tensor};
use pcx::filter::Filter;
use pcx::functional::functionalize;
use pcx::model::normal_init;
use pcx::optim::Optim;
use pcx::partition::{merge, partition};
use pcx::training::{energy_loss, initialize, w_filter, x_filter};
use pcx::transform::{
    cond, grad_and_value, scan, switch, while_loop, Branch, Iteration, ScanOver, ScanStep,
};
use pcx::{Activation, PcDecoder, PcResult, RandomKeyGenerator, Sgd};

fn decoder(seed: u64) -> PcDecoder {
    let mut rkg = RandomKeyGenerator::new(seed);
    PcDecoder::with_dims(&[2, 4, 3], Activation::Tanh, Some(normal_init()), &mut rkg)
        .expect("valid dims")
}

/// Decoder with nodes initialized for a batch of `batch` random examples.
fn initialized(seed: u64, batch: usize) -> (PcDecoder, Tensor) {
    let mut model = decoder(seed);
    let mut rkg = RandomKeyGenerator::new(seed + 1);
    let examples = rkg.normal(&[batch, 3]);
    initialize(&examples, &mut model, &mut rkg).unwrap();
    (model, examples)
}

fn store_values(model: &PcDecoder) -> ParamMap {
    partition(model, &Filter::all()).unwrap().target
}

fn filters() -> Vec<Filter> {
    vec![
        Filter::all(),
        Filter::nothing(),
        x_filter(),
        w_filter(),
        x_filter() | w_filter(),
        Filter::tag("cache"),
        "role:node & !frozen".parse().unwrap(),
        "path:layers.1".parse().unwrap(),
    ]
}

#[test]
fn test_partition_merge_round_trip() {
    for filter in filters() {
        let (mut model, _) = initialized(0, 2);
        let before = store_values(&model);
        let parts = partition(&model, &filter).unwrap();
        merge(&mut model, parts.target, parts.other).unwrap();
        let after = store_values(&model);
        assert_eq!(before.paths(), after.paths());
        for (key, value) in before.iter() {
            assert_eq!(after.get(key).unwrap(), value, "{filter}: {key} changed");
        }
    }
}

#[test]
fn test_partitions_are_disjoint_and_complete() {
    let model = decoder(0);
    let all: Vec<String> = model.store().keys().map(|k| k.path().to_string()).collect();
    for filter in filters() {
        let parts = partition(&model, &filter).unwrap();
        assert!(parts.target.keys().all(|k| !parts.other.contains_key(k)));
        let mut union: Vec<String> = parts
            .target
            .paths()
            .into_iter()
            .chain(parts.other.paths())
            .collect();
        union.sort();
        let mut expected = all.clone();
        expected.sort();
        assert_eq!(union, expected, "{filter}");
    }
}

#[test]
fn test_gradients_only_for_target() {
    for filter in [x_filter(), w_filter(), x_filter() | w_filter()] {
        let (mut model, examples) = initialized(1, 3);
        let target = partition(&model, &filter).unwrap().target;
        let loss = energy_loss::<PcDecoder>();
        let (grads, values) = grad_and_value(filter.clone(), loss)
            .call(&mut model, &[examples])
            .unwrap();
        assert_eq!(grads.paths(), target.paths(), "{filter}");
        assert!(scalar_value(&values[0]).unwrap() >= 0.0);
    }
}

#[test]
fn test_weight_gradient_matches_finite_differences() {
    let (model, examples) = initialized(2, 2);
    let loss = energy_loss::<PcDecoder>();
    let params = partition(&model, &w_filter()).unwrap();
    let (grads, _) = grad_and_value(w_filter(), loss.clone())
        .call_pure(&model, &params, std::slice::from_ref(&examples))
        .unwrap();

    let energy_at = |m: &PcDecoder| -> f32 {
        let view = functionalize(m, Filter::nothing());
        let params = view.partition().unwrap();
        let (outs, _) = view
            .call_traced(&params, &loss, std::slice::from_ref(&examples))
            .unwrap();
        scalar_value(&outs[0]).unwrap()
    };

    let h = 1e-2;
    for layer in model.layers() {
        let key = layer.weight_key().clone();
        let analytic = grads.get(&key).unwrap();
        for (i, j) in [(0, 0), (1, 1), (2, 0)] {
            if i >= analytic.shape()[0] || j >= analytic.shape()[1] {
                continue;
            }
            let mut plus = model.clone();
            plus.store_mut().value_mut(&key).unwrap()[[i, j]] += h;
            let mut minus = model.clone();
            minus.store_mut().value_mut(&key).unwrap()[[i, j]] -= h;
            let numeric = (energy_at(&plus) - energy_at(&minus)) / (2.0 * h);
            assert_abs_diff_eq!(analytic[[i, j]], numeric, epsilon = 2e-2);
        }
    }
}

#[test]
fn test_scan_emit_vs_carry() {
    // Emit: 5 stacked outputs, carried arguments untouched.
    let (mut model, examples) = initialized(3, 2);
    let relax = grad_and_value(x_filter(), energy_loss::<PcDecoder>());
    let mut optim = Optim::bind_filter(Sgd::new(0.05), &model, &x_filter()).unwrap();
    let mut emit_only = scan(
        |m: &mut PcDecoder, _: &Iteration, args: &[Tensor]| -> PcResult<ScanStep> {
            let (grads, values) = relax.call(m, &args[..1])?;
            optim.step(m, &grads)?;
            Ok(ScanStep::Emit(values[0].clone()))
        },
        ScanOver::Length(5),
        Filter::node(),
    );
    let out = emit_only
        .call(&mut model, vec![examples.clone(), scalar(0.0)])
        .unwrap();
    assert_eq!(out.outputs.as_ref().unwrap().shape(), &[5]);
    assert_eq!(out.args[0], examples);
    assert_eq!(out.args[1], scalar(0.0));
    drop(emit_only);
    assert_eq!(optim.step_count(), 5);

    // Carry: the counter is routed back through `map_outputs`, and outputs still stack.
    let mut counted = scan(
        |_: &mut PcDecoder, it: &Iteration, args: &[Tensor]| -> PcResult<ScanStep> {
            Ok(ScanStep::Carry {
                args: vec![&args[1] + 1.0],
                output: Some(scalar(it.index as f32)),
            })
        },
        ScanOver::Length(5),
        Filter::node(),
    )
    .with_map_outputs(vec![1]);
    let out = counted
        .call(&mut model, vec![examples.clone(), scalar(0.0)])
        .unwrap();
    assert_eq!(out.args[0], examples);
    assert_eq!(out.args[1], scalar(5.0));
    let ys: Vec<f32> = out.outputs.unwrap().iter().copied().collect();
    assert_eq!(ys, vec![0.0, 1.0, 2.0, 3.0, 4.0]);
}

#[test]
fn test_scan_relaxation_matches_loop() {
    let (mut looped, examples) = initialized(4, 2);
    let mut scanned = looped.clone();
    let relax = grad_and_value(x_filter(), energy_loss::<PcDecoder>());
    let args = std::slice::from_ref(&examples);

    let mut optim = Optim::bind_filter(Sgd::new(0.05), &looped, &x_filter()).unwrap();
    for _ in 0..4 {
        let (grads, _) = relax.call(&mut looped, args).unwrap();
        optim.step(&mut looped, &grads).unwrap();
    }

    let mut optim = Optim::bind_filter(Sgd::new(0.05), &scanned, &x_filter()).unwrap();
    scan(
        |m: &mut PcDecoder, _: &Iteration, args: &[Tensor]| -> PcResult<ScanStep> {
            let (grads, _) = relax.call(m, args)?;
            optim.step(m, &grads)?;
            Ok(ScanStep::Carry {
                args: Vec::new(),
                output: None,
            })
        },
        ScanOver::Length(4),
        Filter::node(),
    )
    .call(&mut scanned, vec![examples.clone()])
    .unwrap();

    let a = partition(&looped, &x_filter()).unwrap().target;
    let b = partition(&scanned, &x_filter()).unwrap().target;
    for (key, value) in a.iter() {
        let other = b.get(key).unwrap();
        for (x, y) in value.iter().zip(other.iter()) {
            assert_abs_diff_eq!(x, y, epsilon = 1e-6);
        }
    }
}

#[test]
fn test_cond_switch_and_while_thread_model_state() {
    let (mut model, _) = initialized(5, 1);
    let key = model.layers()[0].bias_key().clone();
    let bump = |by: f32| {
        let key = key.clone();
        move |m: &mut PcDecoder, _: &[Tensor]| -> PcResult<Vec<Tensor>> {
            let bias = m.store_mut().value_mut(&key)?;
            bias[[0]] += by;
            Ok(vec![scalar(bias[[0]])])
        }
    };
    let start = model.store().get(&key).unwrap()[[0]];

    let mut branch = cond(bump(1.0), bump(-1.0), w_filter());
    branch.call(&mut model, true, &[]).unwrap();
    branch.call(&mut model, false, &[]).unwrap();
    branch.call(&mut model, true, &[]).unwrap();
    assert_abs_diff_eq!(model.store().get(&key).unwrap()[[0]], start + 1.0);

    let branches: Vec<Branch<'_, PcDecoder>> = vec![Box::new(bump(10.0)), Box::new(bump(100.0))];
    let mut table = switch(branches, w_filter());
    table.call(&mut model, 1, &[]).unwrap();
    assert_abs_diff_eq!(model.store().get(&key).unwrap()[[0]], start + 101.0);

    let step = bump(0.5);
    let mut countdown = while_loop(
        move |m: &mut PcDecoder, args: &[Tensor]| -> PcResult<Vec<Tensor>> {
            step(m, args)?;
            Ok(vec![&args[0] - 1.0])
        },
        |args: &[Tensor]| args[0].sum() > 0.0,
        w_filter(),
    );
    let out = countdown.call(&mut model, vec![scalar(4.0)]).unwrap();
    assert_eq!(out[0], scalar(0.0));
    assert_abs_diff_eq!(model.store().get(&key).unwrap()[[0]], start + 103.0);
}

#[test]
fn test_empty_optimizer_is_noop() {
    let (mut model, examples) = initialized(6, 2);
    let before = store_values(&model);
    let mut optim = Optim::bind_filter(Sgd::new(1.0), &model, &Filter::nothing()).unwrap();
    assert!(optim.is_empty());

    let (grads, _) = grad_and_value(x_filter(), energy_loss::<PcDecoder>())
        .call(&mut model, &[examples])
        .unwrap();
    let after_grad = store_values(&model);
    for _ in 0..3 {
        optim.step(&mut model, &grads).unwrap();
        optim.step(&mut model, &ParamMap::new()).unwrap();
    }
    assert_eq!(optim.step_count(), 6);
    for (key, value) in after_grad.iter() {
        assert_eq!(store_values(&model).get(key).unwrap(), value);
    }
    assert_eq!(before.len(), after_grad.len());
}

#[test]
fn test_missing_gradient_is_an_error_unless_allowed() {
    let (mut model, _) = initialized(7, 1);
    let mut strict = Optim::bind_filter(Sgd::new(0.1), &model, &x_filter()).unwrap();
    assert!(strict.step(&mut model, &ParamMap::new()).is_err());

    let mut lenient = Optim::bind_filter(Sgd::new(0.1), &model, &x_filter())
        .unwrap()
        .allow_none_grads(true);
    let before = store_values(&model);
    lenient.step(&mut model, &ParamMap::new()).unwrap();
    for (key, value) in before.iter() {
        assert_eq!(store_values(&model).get(key).unwrap(), value);
    }
}

#[test]
fn test_non_finite_values_propagate() {
    let (mut model, mut examples) = initialized(8, 1);
    examples[[0, 0]] = f32::NAN;
    let (grads, values) = grad_and_value(x_filter(), energy_loss::<PcDecoder>())
        .call(&mut model, &[examples])
        .unwrap();
    assert!(scalar_value(&values[0]).unwrap().is_nan());
    assert!(grads.has_non_finite());
}
