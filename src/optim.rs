//! Optimizers scoped to one partition.
//!
//! An [`Optim`] binds an [`UpdateRule`] to the key set of a partition and owns
//! one state record per key. `step` applies gradients to the owned slots of a
//! model in place and ignores everything else.
//!
//! ## Rules
//!
//! SGD with momentum (trace form) and optional Nesterov look-ahead:
//! ```text
//! g' = g + λ·θ                       (coupled decay)
//! t  = g' + μ·t
//! Δ  = nesterov ? g' + μ·t : t
//! θ ← θ - η(k)·Δ - η(k)·λ·θ          (last term only for decoupled decay)
//! ```
//! AdamW with bias correction and decoupled decay:
//! ```text
//! m ← β₁m + (1-β₁)g,  v ← β₂v + (1-β₂)g²
//! θ ← θ - η(k)·(m̂ / (√v̂ + ε) + λ·θ)
//! ```

use std::collections::BTreeMap;
use std::f32::consts::PI;
use std::fmt;

use ndarray::Zip;
use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::core::{Module, PcError, PcResult, ParamKey, ParamMap, ParamStore, Tensor};
use crate::filter::Filter;
use crate::partition::partition;

/// Learning rate as a function of the optimizer step.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Schedule {
    Constant(f32),
    /// Linear warmup from `init` to `peak`, then cosine decay to `end` at `decay_steps`.
    WarmupCosine {
        init: f32,
        peak: f32,
        warmup_steps: usize,
        decay_steps: usize,
        end: f32,
    },
}

impl Schedule {
    pub fn at(&self, step: usize) -> f32 {
        match *self {
            Schedule::Constant(lr) => lr,
            Schedule::WarmupCosine {
                init,
                peak,
                warmup_steps,
                decay_steps,
                end,
            } => {
                if step < warmup_steps {
                    return init + (peak - init) * step as f32 / warmup_steps as f32;
                }
                let span = decay_steps.saturating_sub(warmup_steps).max(1);
                let t = (step - warmup_steps).min(span) as f32 / span as f32;
                end + (peak - end) * 0.5 * (1.0 + (PI * t).cos())
            }
        }
    }
}

impl From<f32> for Schedule {
    fn from(lr: f32) -> Self {
        Schedule::Constant(lr)
    }
}

/// Where weight decay enters the update.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decay {
    /// Added to the gradient before momentum.
    #[default]
    Coupled,
    /// Subtracted from the parameter after the gradient step.
    Decoupled,
}

/// Per-parameter update rule.
pub trait UpdateRule {
    type State: Clone + fmt::Debug;

    /// Fresh state for a parameter of this shape.
    fn init(&self, param: &Tensor) -> Self::State;

    /// True if `state` can be used for `param` (same shape).
    fn fits(&self, state: &Self::State, param: &Tensor) -> bool;

    /// Update `param` in place. `step` counts prior steps of the owning optimizer.
    fn update(
        &self,
        param: &mut Tensor,
        grad: &Tensor,
        state: &mut Self::State,
        step: usize,
    ) -> PcResult<()>;
}

/// Stochastic gradient descent with optional momentum and weight decay.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Sgd {
    pub lr: Schedule,
    pub momentum: f32,
    pub nesterov: bool,
    pub weight_decay: f32,
    pub decay: Decay,
}

impl Sgd {
    pub fn new(lr: impl Into<Schedule>) -> Self {
        Self {
            lr: lr.into(),
            momentum: 0.0,
            nesterov: false,
            weight_decay: 0.0,
            decay: Decay::Coupled,
        }
    }

    pub fn momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn weight_decay(mut self, weight_decay: f32, decay: Decay) -> Self {
        self.weight_decay = weight_decay;
        self.decay = decay;
        self
    }
}

impl UpdateRule for Sgd {
    /// Momentum trace; `None` without momentum.
    type State = Option<Tensor>;

    fn init(&self, param: &Tensor) -> Self::State {
        (self.momentum != 0.0).then(|| Tensor::zeros(param.raw_dim()))
    }

    fn fits(&self, state: &Self::State, param: &Tensor) -> bool {
        match state {
            Some(t) => t.shape() == param.shape(),
            None => self.momentum == 0.0,
        }
    }

    fn update(
        &self,
        param: &mut Tensor,
        grad: &Tensor,
        state: &mut Self::State,
        step: usize,
    ) -> PcResult<()> {
        check_shape(param, grad)?;
        if !self.fits(state, param) {
            *state = self.init(param);
        }
        let lr = self.lr.at(step);

        let mut g = grad.clone();
        if self.weight_decay != 0.0 && self.decay == Decay::Coupled {
            g.scaled_add(self.weight_decay, param);
        }

        let delta = match state {
            Some(t) => {
                *t *= self.momentum;
                *t += &g;
                if self.nesterov {
                    g.scaled_add(self.momentum, &*t);
                    g
                } else {
                    t.clone()
                }
            }
            None => g,
        };

        if self.weight_decay != 0.0 && self.decay == Decay::Decoupled {
            let decay = lr * self.weight_decay;
            param.mapv_inplace(|p| p - decay * p);
        }
        param.scaled_add(-lr, &delta);
        Ok(())
    }
}

/// Adam with decoupled weight decay (AdamW).
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Adam {
    pub lr: Schedule,
    pub beta1: f32,
    pub beta2: f32,
    pub eps: f32,
    pub weight_decay: f32,
}

impl Adam {
    pub fn new(lr: impl Into<Schedule>) -> Self {
        Self {
            lr: lr.into(),
            beta1: 0.9,
            beta2: 0.999,
            eps: 1e-8,
            weight_decay: 0.0,
        }
    }

    pub fn weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

/// First and second moment buffers.
#[derive(Debug, Clone)]
pub struct Moments {
    m: Tensor,
    v: Tensor,
}

impl UpdateRule for Adam {
    type State = Moments;

    fn init(&self, param: &Tensor) -> Moments {
        Moments {
            m: Tensor::zeros(param.raw_dim()),
            v: Tensor::zeros(param.raw_dim()),
        }
    }

    fn fits(&self, state: &Moments, param: &Tensor) -> bool {
        state.m.shape() == param.shape() && state.v.shape() == param.shape()
    }

    fn update(
        &self,
        param: &mut Tensor,
        grad: &Tensor,
        state: &mut Moments,
        step: usize,
    ) -> PcResult<()> {
        check_shape(param, grad)?;
        if !self.fits(state, param) {
            *state = self.init(param);
        }
        let lr = self.lr.at(step);
        let t = (step + 1) as i32;
        let bc1_inv = 1.0 / (1.0 - self.beta1.powi(t));
        let bc2_inv = 1.0 / (1.0 - self.beta2.powi(t));
        let (beta1, beta2, eps, wd) = (self.beta1, self.beta2, self.eps, self.weight_decay);

        Zip::from(param)
            .and(grad)
            .and(&mut state.m)
            .and(&mut state.v)
            .for_each(|p, &g, m, v| {
                *m = beta1 * *m + (1.0 - beta1) * g;
                *v = beta2 * *v + (1.0 - beta2) * g * g;
                let m_hat = *m * bc1_inv;
                let v_hat = *v * bc2_inv;
                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + wd * *p);
            });
        Ok(())
    }
}

/// Either built-in rule, for optimizers chosen at runtime.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Rule {
    Sgd(Sgd),
    Adam(Adam),
}

#[derive(Debug, Clone)]
pub enum RuleState {
    Sgd(Option<Tensor>),
    Adam(Moments),
}

impl UpdateRule for Rule {
    type State = RuleState;

    fn init(&self, param: &Tensor) -> RuleState {
        match self {
            Rule::Sgd(rule) => RuleState::Sgd(rule.init(param)),
            Rule::Adam(rule) => RuleState::Adam(rule.init(param)),
        }
    }

    fn fits(&self, state: &RuleState, param: &Tensor) -> bool {
        match (self, state) {
            (Rule::Sgd(rule), RuleState::Sgd(s)) => rule.fits(s, param),
            (Rule::Adam(rule), RuleState::Adam(s)) => rule.fits(s, param),
            _ => false,
        }
    }

    fn update(
        &self,
        param: &mut Tensor,
        grad: &Tensor,
        state: &mut RuleState,
        step: usize,
    ) -> PcResult<()> {
        match (self, state) {
            (Rule::Sgd(rule), RuleState::Sgd(s)) => rule.update(param, grad, s, step),
            (Rule::Adam(rule), RuleState::Adam(s)) => rule.update(param, grad, s, step),
            (rule, state) => {
                *state = rule.init(param);
                rule.update(param, grad, state, step)
            }
        }
    }
}

impl From<Sgd> for Rule {
    fn from(rule: Sgd) -> Self {
        Rule::Sgd(rule)
    }
}

impl From<Adam> for Rule {
    fn from(rule: Adam) -> Self {
        Rule::Adam(rule)
    }
}

fn check_shape(param: &Tensor, grad: &Tensor) -> PcResult<()> {
    if param.shape() != grad.shape() {
        return Err(PcError::ShapeMismatch(format!(
            "gradient {:?} does not match parameter {:?}",
            grad.shape(),
            param.shape()
        )));
    }
    Ok(())
}

/// Update rule bound to the key set of one partition.
#[derive(Debug, Clone)]
pub struct Optim<R: UpdateRule> {
    rule: R,
    state: BTreeMap<ParamKey, R::State>,
    allow_none_grads: bool,
    steps: usize,
}

impl<R: UpdateRule> Optim<R> {
    /// Bind `rule` to the keys of `params`, creating one state record per key.
    pub fn bind(rule: R, params: &ParamMap) -> Self {
        let state = params
            .iter()
            .map(|(key, value)| (key.clone(), rule.init(value)))
            .collect();
        Self {
            rule,
            state,
            allow_none_grads: false,
            steps: 0,
        }
    }

    /// Bind to the slots of `model` selected by `filter`.
    pub fn bind_filter<M: Module + ?Sized>(rule: R, model: &M, filter: &Filter) -> PcResult<Self> {
        let parts = partition(model, filter)?;
        Ok(Self::bind(rule, &parts.target))
    }

    /// Leave owned keys without an incoming gradient untouched instead of failing.
    pub fn allow_none_grads(mut self, allow: bool) -> Self {
        self.allow_none_grads = allow;
        self
    }

    pub fn rule(&self) -> &R {
        &self.rule
    }

    pub fn keys(&self) -> impl Iterator<Item = &ParamKey> {
        self.state.keys()
    }

    pub fn is_empty(&self) -> bool {
        self.state.is_empty()
    }

    /// Number of `step` calls so far.
    pub fn step_count(&self) -> usize {
        self.steps
    }

    /// Rebind to a new key set. State of keys present in both is kept.
    pub fn rebind(&mut self, params: &ParamMap) {
        let mut state = BTreeMap::new();
        for (key, value) in params {
            let record = self
                .state
                .remove(key)
                .unwrap_or_else(|| self.rule.init(value));
            state.insert(key.clone(), record);
        }
        self.state = state;
    }

    /// Reset every state record to a fresh one shaped like the current values.
    pub fn reset(&mut self, store: &ParamStore) -> PcResult<()> {
        for (key, record) in self.state.iter_mut() {
            *record = self.rule.init(store.get(key)?);
        }
        Ok(())
    }

    /// Apply `grads` to the owned slots of `model`.
    pub fn step<M: Module + ?Sized>(&mut self, model: &mut M, grads: &ParamMap) -> PcResult<()> {
        self.step_store(model.store_mut(), grads)
    }

    /// Apply `grads` to the owned slots of `store`.
    ///
    /// Gradients for keys this optimizer does not own are ignored. Everything
    /// is validated before the first write.
    ///
    /// # Errors
    /// - `StructuralMismatch` if an owned key is no longer in the store
    /// - `MissingGradient` if an owned key has no gradient and `allow_none_grads` is off
    /// - `ShapeMismatch` if a gradient does not match its parameter
    pub fn step_store(&mut self, store: &mut ParamStore, grads: &ParamMap) -> PcResult<()> {
        let stale: Vec<String> = self
            .state
            .keys()
            .filter(|k| !store.contains(k))
            .map(|k| k.path().to_string())
            .collect();
        if !stale.is_empty() {
            return Err(PcError::StructuralMismatch {
                missing: Vec::new(),
                extra: stale,
            });
        }
        for key in self.state.keys() {
            match grads.get(key) {
                Some(grad) => check_shape(store.get(key)?, grad)?,
                None if self.allow_none_grads => {}
                None => return Err(PcError::MissingGradient(key.path().to_string())),
            }
        }

        for (key, record) in self.state.iter_mut() {
            let Some(grad) = grads.get(key) else {
                continue;
            };
            let param = store.value_mut(key)?;
            if !self.rule.fits(record, param) {
                *record = self.rule.init(param);
            }
            self.rule.update(param, grad, record, self.steps)?;
        }

        self.steps += 1;
        trace!(step = self.steps, keys = self.state.len(), "optimizer step");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::Role;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, ArrayD, IxDyn};

    fn store() -> ParamStore {
        let mut s = ParamStore::new();
        s.register("w", arr1(&[1.0, -2.0]).into_dyn(), Role::LayerWeight)
            .unwrap();
        s.register("x", arr1(&[5.0]).into_dyn(), Role::NodeState)
            .unwrap();
        s
    }

    fn grads_for(s: &ParamStore, path: &str, g: &[f32]) -> ParamMap {
        let mut map = ParamMap::new();
        map.insert(s.find(path).unwrap().clone(), arr1(g).into_dyn());
        map
    }

    #[test]
    fn test_plain_sgd_step() {
        let mut s = store();
        let mut opt = Optim::bind_filter(Sgd::new(0.1), &s, &Filter::weight()).unwrap();
        let grads = grads_for(&s, "w", &[1.0, 1.0]);
        opt.step(&mut s, &grads).unwrap();
        let w = s.get(s.find("w").unwrap()).unwrap();
        assert_abs_diff_eq!(w[[0]], 0.9, epsilon = 1e-6);
        assert_abs_diff_eq!(w[[1]], -2.1, epsilon = 1e-6);
        assert_eq!(opt.step_count(), 1);
    }

    #[test]
    fn test_momentum_accumulates() {
        let mut s = store();
        let mut opt = Optim::bind_filter(Sgd::new(1.0).momentum(0.5), &s, &Filter::weight()).unwrap();
        let g = grads_for(&s, "w", &[1.0, 0.0]);
        opt.step(&mut s, &g).unwrap();
        opt.step(&mut s, &g).unwrap();
        // traces 1.0 then 1.5
        let w = s.get(s.find("w").unwrap()).unwrap();
        assert_abs_diff_eq!(w[[0]], 1.0 - 1.0 - 1.5, epsilon = 1e-6);
    }

    #[test]
    fn test_coupled_and_decoupled_decay() {
        let mut a = store();
        let mut coupled =
            Optim::bind_filter(Sgd::new(0.1).weight_decay(0.5, Decay::Coupled), &a, &Filter::weight()).unwrap();
        let grads = grads_for(&a, "w", &[0.0, 0.0]);
        coupled.step(&mut a, &grads).unwrap();
        assert_abs_diff_eq!(a.get(a.find("w").unwrap()).unwrap()[[0]], 0.95, epsilon = 1e-6);

        let mut b = store();
        let mut decoupled =
            Optim::bind_filter(Sgd::new(0.1).weight_decay(0.5, Decay::Decoupled), &b, &Filter::weight()).unwrap();
        let grads = grads_for(&b, "w", &[0.0, 0.0]);
        decoupled.step(&mut b, &grads).unwrap();
        assert_abs_diff_eq!(b.get(b.find("w").unwrap()).unwrap()[[0]], 0.95, epsilon = 1e-6);
    }

    #[test]
    fn test_adam_first_step_is_sign_sized() {
        let mut s = store();
        let mut opt = Optim::bind_filter(Adam::new(0.01), &s, &Filter::weight()).unwrap();
        let grads = grads_for(&s, "w", &[3.0, -0.2]);
        opt.step(&mut s, &grads).unwrap();
        let w = s.get(s.find("w").unwrap()).unwrap();
        assert_abs_diff_eq!(w[[0]], 0.99, epsilon = 1e-5);
        assert_abs_diff_eq!(w[[1]], -1.99, epsilon = 1e-5);
    }

    #[test]
    fn test_empty_partition_is_noop() {
        let mut s = store();
        let before = s.clone();
        let mut opt =
            Optim::bind_filter(Sgd::new(1.0), &s, &(Filter::weight() & Filter::frozen(true))).unwrap();
        assert!(opt.is_empty());
        for _ in 0..5 {
            opt.step(&mut s, &ParamMap::new()).unwrap();
        }
        for (a, b) in s.slots().iter().zip(before.slots()) {
            assert_eq!(a.value(), b.value());
        }
    }

    #[test]
    fn test_missing_gradient() {
        let mut s = store();
        let mut strict = Optim::bind_filter(Sgd::new(1.0), &s, &Filter::all()).unwrap();
        let g = grads_for(&s, "w", &[1.0, 1.0]);
        assert!(matches!(
            strict.step(&mut s, &g),
            Err(PcError::MissingGradient(_))
        ));
        // nothing was written
        assert_eq!(s.get(s.find("w").unwrap()).unwrap()[[0]], 1.0);

        let mut lenient = Optim::bind_filter(Sgd::new(1.0), &s, &Filter::all())
            .unwrap()
            .allow_none_grads(true);
        lenient.step(&mut s, &g).unwrap();
        assert_eq!(s.get(s.find("x").unwrap()).unwrap()[[0]], 5.0);
        assert_eq!(s.get(s.find("w").unwrap()).unwrap()[[0]], 0.0);
    }

    #[test]
    fn test_foreign_gradients_ignored() {
        let mut s = store();
        let mut opt = Optim::bind_filter(Sgd::new(1.0), &s, &Filter::node()).unwrap();
        let mut g = grads_for(&s, "w", &[1.0, 1.0]);
        g.insert(s.find("x").unwrap().clone(), arr1(&[1.0]).into_dyn());
        opt.step(&mut s, &g).unwrap();
        assert_eq!(s.get(s.find("w").unwrap()).unwrap()[[0]], 1.0);
        assert_eq!(s.get(s.find("x").unwrap()).unwrap()[[0]], 4.0);
    }

    #[test]
    fn test_momentum_state_follows_shape_changes() {
        let mut s = store();
        let x = s.find("x").unwrap().clone();
        let mut opt = Optim::bind_filter(Sgd::new(1.0).momentum(0.9), &s, &Filter::node()).unwrap();
        s.set(&x, ArrayD::zeros(IxDyn(&[3]))).unwrap();
        let mut g = ParamMap::new();
        g.insert(x.clone(), ArrayD::ones(IxDyn(&[3])));
        opt.step(&mut s, &g).unwrap();
        assert_eq!(s.get(&x).unwrap().sum(), -3.0);
    }

    #[test]
    fn test_warmup_cosine_schedule() {
        let sched = Schedule::WarmupCosine {
            init: 0.0,
            peak: 1.0,
            warmup_steps: 10,
            decay_steps: 110,
            end: 0.1,
        };
        assert_abs_diff_eq!(sched.at(0), 0.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sched.at(5), 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(sched.at(10), 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(sched.at(60), 0.55, epsilon = 1e-5);
        assert_abs_diff_eq!(sched.at(500), 0.1, epsilon = 1e-6);
    }
}
