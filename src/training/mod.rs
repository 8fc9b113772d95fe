//! Training loops and metrics.
//!
//! One training step on a batch runs a small state machine:
//! ```text
//! Initializing ──▶ Relaxing × T ──▶ Committing (pc only) ──▶ Evaluating ──▶ Done
//! ```
//! - **Initializing**: every node is reset to `[batch, dim]`, init hooks run,
//!   and one initializing forward pass seeds free states with their predictions.
//! - **Relaxing**: `∂E/∂X` (and `∂E/∂W` in ppc mode) is taken and applied by the
//!   X optimizer (and the W optimizer in ppc mode). Iteration `i` always sees
//!   the update of iteration `i-1`.
//! - **Committing**: in pc mode, one W step from the relaxed state.
//! - **Evaluating**: a forward pass with the final state for prediction MSE
//!   and final energy. No optimizer runs here.
//!
//! `T = 0` skips relaxation and evaluates the initialized state.

use std::fmt;
use std::slice;
use std::str::FromStr;

use ndarray::Axis;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::core::{scalar_value, Fingerprint, PcError, PcResult, Tensor, Var};
use crate::filter::Filter;
use crate::functional::{functionalize, Scope, Traced, TracedFn};
use crate::model::{EnergyModel, PcDecoder};
use crate::optim::{Decay, Optim, Rule, Sgd, UpdateRule};
use crate::partition::{merge, partition};
use crate::transform::{grad_and_value, vmap, Bound, InAxis, OutAxis, Vmap};
use crate::utils::RandomKeyGenerator;
use crate::Config;

/// When weights are updated relative to relaxation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PcMode {
    /// One W step per batch, after relaxation.
    Pc,
    /// One W step per relaxation iteration.
    #[default]
    Ppc,
}

impl fmt::Display for PcMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PcMode::Pc => write!(f, "pc"),
            PcMode::Ppc => write!(f, "ppc"),
        }
    }
}

impl FromStr for PcMode {
    type Err = PcError;

    fn from_str(s: &str) -> PcResult<Self> {
        match s {
            "pc" => Ok(PcMode::Pc),
            "ppc" => Ok(PcMode::Ppc),
            other => Err(PcError::InvalidConfig(format!(
                "unknown pc_mode `{other}` (expected `pc` or `ppc`)"
            ))),
        }
    }
}

/// States of one batch step, in the order they are entered.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Initializing,
    Relaxing { iteration: usize },
    Committing,
    Evaluating,
    Done,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelaxConfig {
    /// Relaxation iterations per batch.
    pub t: usize,
    pub mode: PcMode,
}

impl Default for RelaxConfig {
    fn default() -> Self {
        Self {
            t: 20,
            mode: PcMode::default(),
        }
    }
}

/// Metrics for one batch step.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BatchMetrics {
    /// Mean squared error between the final prediction and the examples.
    pub mse: f32,
    /// Total energy before the first relaxation step.
    pub initial_energy: f32,
    /// Total energy of the evaluated state.
    pub final_energy: f32,
    /// Energy seen by each relaxation iteration, before its update.
    pub energies: Vec<f32>,
    pub x_steps: usize,
    pub w_steps: usize,
    #[serde(skip)]
    pub phases: Vec<Phase>,
}

/// Means over a window of batch metrics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct EpochMetrics {
    pub mse: f32,
    pub energy: f32,
    pub batches: usize,
}

impl EpochMetrics {
    /// Average the last `last_n` entries of `batches` (all of them when `last_n == 0`).
    pub fn from_batches(batches: &[BatchMetrics], last_n: usize) -> Self {
        let window = if last_n == 0 || last_n > batches.len() {
            batches
        } else {
            &batches[batches.len() - last_n..]
        };
        if window.is_empty() {
            return Self::default();
        }
        let n = window.len() as f32;
        Self {
            mse: window.iter().map(|m| m.mse).sum::<f32>() / n,
            energy: window.iter().map(|m| m.final_energy).sum::<f32>() / n,
            batches: window.len(),
        }
    }
}

/// Free node states: node slots that are not clamped.
pub fn x_filter() -> Filter {
    Filter::node() & !Filter::frozen(true)
}

/// Layer parameters.
pub fn w_filter() -> Filter {
    Filter::weight()
}

fn example_energy<M: EnergyModel>(model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>> {
    model.forward(cx, args.first().copied(), None)?;
    Ok(vec![model.energy(cx)?])
}

fn example_forward<M: EnergyModel>(model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>> {
    Ok(vec![model.forward(cx, args.first().copied(), None)?])
}

fn example_readout<M: EnergyModel>(model: &M, cx: &mut Scope, args: &[Var]) -> PcResult<Vec<Var>> {
    let prediction = model.forward(cx, args.first().copied(), None)?;
    Ok(vec![model.energy(cx)?, prediction])
}

/// Batch energy: the per-example energy vectorized over node slots and summed.
pub fn energy_loss<M: EnergyModel>() -> Vmap<TracedFn<M>> {
    vmap(
        Filter::node(),
        vec![InAxis::Batched],
        vec![OutAxis::Sum],
        example_energy::<M> as TracedFn<M>,
    )
}

/// Batched forward pass returning the stacked predictions.
pub fn predict<M: EnergyModel>() -> Vmap<TracedFn<M>> {
    vmap(
        Filter::node(),
        vec![InAxis::Batched],
        vec![OutAxis::Stacked],
        example_forward::<M> as TracedFn<M>,
    )
}

fn readout<M: EnergyModel>() -> Vmap<TracedFn<M>> {
    vmap(
        Filter::node(),
        vec![InAxis::Batched],
        vec![OutAxis::Sum, OutAxis::Stacked],
        example_readout::<M> as TracedFn<M>,
    )
}

fn check_examples<M: EnergyModel>(examples: &Tensor, model: &M) -> PcResult<usize> {
    let output_dim = model.nodes().last().map(|n| n.dim()).unwrap_or_default();
    match examples.shape() {
        [batch, dim] if *batch > 0 && *dim == output_dim => Ok(*batch),
        shape => Err(PcError::ShapeMismatch(format!(
            "examples must be [batch > 0, {output_dim}], got {shape:?}"
        ))),
    }
}

/// Reset every node for `examples` and seed free states with a forward pass.
pub fn initialize<M: EnergyModel>(
    examples: &Tensor,
    model: &mut M,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<()> {
    let batch = check_examples(examples, model)?;
    model.init_nodes(batch, rkg)?;

    let forward = predict::<M>();
    let view = functionalize(&*model, Filter::nothing()).initializing(true);
    let params = view.partition()?;
    let (_, updated) = view.call_traced(&params, &forward, slice::from_ref(examples))?;
    merge(model, updated.target, updated.other)
}

/// Forward pass on the current state. Returns `(mse, energy)`.
fn evaluate<M: EnergyModel>(examples: &Tensor, model: &mut M) -> PcResult<(f32, f32)> {
    let read = readout::<M>();
    let view = functionalize(&*model, Filter::nothing());
    let params = view.partition()?;
    let (outs, updated) = view.call_traced(&params, &read, slice::from_ref(examples))?;
    merge(model, updated.target, updated.other)?;

    let energy = scalar_value(&outs[0])?;
    let prediction = &outs[1];
    if prediction.shape() != examples.shape() {
        return Err(PcError::ShapeMismatch(format!(
            "prediction {:?} does not match examples {:?}",
            prediction.shape(),
            examples.shape()
        )));
    }
    let mse = (prediction - examples)
        .mapv(|d| d * d)
        .mean()
        .unwrap_or(f32::NAN);
    Ok((mse, energy))
}

fn run_batch<M, R, S, L>(
    examples: &Tensor,
    model: &mut M,
    optim_x: &mut Optim<R>,
    mut optim_w: Option<&mut Optim<S>>,
    loss: &L,
    relax: &RelaxConfig,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<BatchMetrics>
where
    M: EnergyModel,
    R: UpdateRule,
    S: UpdateRule,
    L: Traced<M>,
{
    let mut metrics = BatchMetrics::default();
    let x_before = optim_x.step_count();
    let w_before = optim_w.as_ref().map_or(0, |o| o.step_count());

    metrics.phases.push(Phase::Initializing);
    initialize(examples, model, rkg)?;
    optim_x.reset(model.store())?;
    let (_, initial_energy) = evaluate(examples, model)?;
    metrics.initial_energy = initial_energy;

    let traced = |m: &M, cx: &mut Scope, args: &[Var]| loss.trace(m, cx, args);
    let co_update = relax.mode == PcMode::Ppc && optim_w.is_some();
    let filter = if co_update {
        x_filter() | w_filter()
    } else {
        x_filter()
    };
    let relax_grad = grad_and_value(filter, traced);
    let args = slice::from_ref(examples);

    for iteration in 0..relax.t {
        metrics.phases.push(Phase::Relaxing { iteration });
        let (grads, values) = relax_grad.call(model, args)?;
        let energy = values.first().map(scalar_value).transpose()?.unwrap_or(f32::NAN);
        optim_x.step(model, &grads)?;
        if co_update {
            if let Some(w) = optim_w.as_deref_mut() {
                w.step(model, &grads)?;
            }
        }
        debug!(iteration, energy, mode = %relax.mode, "relaxation step");
        metrics.energies.push(energy);
    }

    if relax.mode == PcMode::Pc {
        if let Some(w) = optim_w.as_deref_mut() {
            metrics.phases.push(Phase::Committing);
            let (grads, _) = grad_and_value(w_filter(), traced).call(model, args)?;
            w.step(model, &grads)?;
        }
    }

    metrics.phases.push(Phase::Evaluating);
    let (mse, energy) = evaluate(examples, model)?;
    if !energy.is_finite() {
        warn!(energy, "non-finite energy after relaxation");
    }
    metrics.mse = mse;
    metrics.final_energy = energy;
    metrics.x_steps = optim_x.step_count() - x_before;
    metrics.w_steps = optim_w.as_ref().map_or(0, |o| o.step_count()) - w_before;
    metrics.phases.push(Phase::Done);
    Ok(metrics)
}

/// One training step: relax X for `relax.t` iterations and update W per `relax.mode`.
///
/// In pc mode the single W commit runs even when `relax.t == 0`, so the
/// phase trace is `Initializing, Committing, Evaluating, Done` and the
/// reported `final_energy` is measured after that commit. `initial_energy`
/// is always measured on the freshly initialized state.
///
/// `loss` must return the scalar batch energy as its first output
/// ([`energy_loss`] is the usual choice).
pub fn train_on_batch<M, R, S, L>(
    examples: &Tensor,
    model: &mut M,
    optim_x: &mut Optim<R>,
    optim_w: &mut Optim<S>,
    loss: &L,
    relax: &RelaxConfig,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<BatchMetrics>
where
    M: EnergyModel,
    R: UpdateRule,
    S: UpdateRule,
    L: Traced<M>,
{
    run_batch(examples, model, optim_x, Some(optim_w), loss, relax, rkg)
}

/// Relax X only; weights are left untouched.
pub fn test_on_batch<M, R, L>(
    examples: &Tensor,
    model: &mut M,
    optim_x: &mut Optim<R>,
    loss: &L,
    relax: &RelaxConfig,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<BatchMetrics>
where
    M: EnergyModel,
    R: UpdateRule,
    L: Traced<M>,
{
    run_batch(examples, model, optim_x, None::<&mut Optim<R>>, loss, relax, rkg)
}

/// Relax X on `examples` and return the internal representation `[batch, internal_dim]`.
pub fn get_internal_states_on_batch<M, R, L>(
    examples: &Tensor,
    model: &mut M,
    optim_x: &mut Optim<R>,
    loss: &L,
    relax: &RelaxConfig,
    rkg: &mut RandomKeyGenerator,
) -> PcResult<Tensor>
where
    M: EnergyModel,
    R: UpdateRule,
    L: Traced<M>,
{
    test_on_batch(examples, model, optim_x, loss, relax, rkg)?;
    Ok(model.internal_state()?.clone())
}

/// Split `data` (`[n, dim]`) into full batches, optionally shuffled.
///
/// A trailing partial batch is dropped.
pub fn batches(
    data: &Tensor,
    batch_size: usize,
    shuffle: Option<&mut RandomKeyGenerator>,
) -> PcResult<Vec<Tensor>> {
    if batch_size == 0 {
        return Err(PcError::InvalidConfig("batch_size must be positive".to_string()));
    }
    if data.ndim() != 2 {
        return Err(PcError::ShapeMismatch(format!(
            "dataset must be [n, dim], got {:?}",
            data.shape()
        )));
    }
    let mut order: Vec<usize> = (0..data.len_of(Axis(0))).collect();
    if let Some(rkg) = shuffle {
        rkg.shuffle(&mut order);
    }
    Ok(order
        .chunks_exact(batch_size)
        .map(|rows| data.select(Axis(0), rows))
        .collect())
}

/// Stops when a metric has not improved for `patience` consecutive updates.
#[derive(Debug, Clone)]
pub struct EarlyStopping {
    patience: usize,
    best: f32,
    stale: usize,
}

impl EarlyStopping {
    pub fn new(patience: usize) -> Self {
        Self {
            patience,
            best: f32::INFINITY,
            stale: 0,
        }
    }

    /// Record a new value (lower is better). Returns true if it is the best so far.
    pub fn update(&mut self, metric: f32) -> bool {
        if metric < self.best {
            self.best = metric;
            self.stale = 0;
            true
        } else {
            self.stale += 1;
            false
        }
    }

    pub fn best(&self) -> f32 {
        self.best
    }

    pub fn should_stop(&self) -> bool {
        self.patience > 0 && self.stale >= self.patience
    }
}

/// A model together with its optimizers, relaxation settings and random state.
#[derive(Debug, Clone)]
pub struct Session<M: EnergyModel, R: UpdateRule = Rule, S: UpdateRule = Rule> {
    pub model: M,
    pub optim_x: Optim<R>,
    pub optim_w: Optim<S>,
    pub relax: RelaxConfig,
    pub rkg: RandomKeyGenerator,
    loss: Vmap<TracedFn<M>>,
}

impl<M: EnergyModel, R: UpdateRule, S: UpdateRule> Session<M, R, S> {
    /// Bind `x_rule` to the free node states and `w_rule` to the layer weights.
    pub fn new(
        model: M,
        x_rule: R,
        w_rule: S,
        relax: RelaxConfig,
        rkg: RandomKeyGenerator,
    ) -> PcResult<Self> {
        let optim_x = Optim::bind_filter(x_rule, &model, &x_filter())?.allow_none_grads(true);
        let optim_w = Optim::bind_filter(w_rule, &model, &w_filter())?;
        Ok(Self {
            model,
            optim_x,
            optim_w,
            relax,
            rkg,
            loss: energy_loss::<M>(),
        })
    }

    pub fn train_batch(&mut self, examples: &Tensor) -> PcResult<BatchMetrics> {
        train_on_batch(
            examples,
            &mut self.model,
            &mut self.optim_x,
            &mut self.optim_w,
            &self.loss,
            &self.relax,
            &mut self.rkg,
        )
    }

    pub fn test_batch(&mut self, examples: &Tensor) -> PcResult<BatchMetrics> {
        test_on_batch(
            examples,
            &mut self.model,
            &mut self.optim_x,
            &self.loss,
            &self.relax,
            &mut self.rkg,
        )
    }

    pub fn internal_states(&mut self, examples: &Tensor) -> PcResult<Tensor> {
        get_internal_states_on_batch(
            examples,
            &mut self.model,
            &mut self.optim_x,
            &self.loss,
            &self.relax,
            &mut self.rkg,
        )
    }

    /// Train on shuffled full batches of `data`; metrics average the last `last_n` batches.
    pub fn train_epoch(
        &mut self,
        data: &Tensor,
        batch_size: usize,
        last_n: usize,
    ) -> PcResult<EpochMetrics> {
        let mut shuffler = self.rkg.split();
        let mut history = Vec::new();
        for batch in batches(data, batch_size, Some(&mut shuffler))? {
            history.push(self.train_batch(&batch)?);
        }
        let metrics = EpochMetrics::from_batches(&history, last_n);
        info!(mse = metrics.mse, energy = metrics.energy, batches = history.len(), "train epoch");
        Ok(metrics)
    }

    /// Relax X on every full batch of `data` in order.
    pub fn test_epoch(&mut self, data: &Tensor, batch_size: usize) -> PcResult<EpochMetrics> {
        let mut history = Vec::new();
        for batch in batches(data, batch_size, None)? {
            history.push(self.test_batch(&batch)?);
        }
        let metrics = EpochMetrics::from_batches(&history, 0);
        info!(mse = metrics.mse, energy = metrics.energy, batches = history.len(), "test epoch");
        Ok(metrics)
    }

    /// Rebind both optimizers to the current key sets after a structural change.
    pub fn rebind(&mut self) -> PcResult<()> {
        self.optim_x.rebind(&partition(&self.model, &x_filter())?.target);
        self.optim_w.rebind(&partition(&self.model, &w_filter())?.target);
        Ok(())
    }
}

impl<R: UpdateRule, S: UpdateRule> Session<PcDecoder, R, S> {
    /// Add a hidden layer to the decoder and rebind the optimizers.
    pub fn grow(&mut self) -> PcResult<()> {
        self.model.push_hidden_layer(&mut self.rkg)?;
        self.rebind()
    }
}

impl Session<PcDecoder> {
    /// Decoder session as described by `config`.
    ///
    /// With `extend_hidden_layers`, the decoder starts with one hidden layer
    /// and is grown by the caller up to `model.num_hidden_layers`.
    pub fn from_config(config: &Config) -> PcResult<Self> {
        config.validate()?;
        let mut rkg = RandomKeyGenerator::new(config.seed);
        let mut model_config = config.model.clone();
        if config.extend_hidden_layers {
            model_config.num_hidden_layers = model_config.num_hidden_layers.min(1);
        }
        let model = PcDecoder::from_config(&model_config, &mut rkg)?;
        let x_rule: Rule = Sgd::new(config.optim_x_lr)
            .weight_decay(config.optim_x_l2, Decay::Coupled)
            .into();
        Self::new(model, x_rule, config.w_rule(), config.relax(), rkg)
    }
}

impl<M: EnergyModel, R: UpdateRule, S: UpdateRule> Bound for Session<M, R, S> {
    fn fingerprint(&self) -> Fingerprint {
        self.model.store().fingerprint()
    }
}
