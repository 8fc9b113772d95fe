//! Predictive coding node.
//!
//! A node owns two slots:
//! - `x`: current state, relaxed during inference (trainable unless clamped)
//! - `u`: top-down prediction, written on every forward pass (frozen, tagged `cache`)
//!
//! Its local energy is a pure function of those two slots:
//! ```text
//! E = ½ ‖x - u‖²
//! ```

use std::fmt;
use std::sync::Arc;

use ndarray::{ArrayD, IxDyn};

use crate::core::{scalar, PcError, PcResult, ParamKey, ParamStore, Role, Tensor, Var};
use crate::functional::Scope;
use crate::utils::RandomKeyGenerator;

/// Per-batch initialization hook: `init_fn(node, rkg, dim)`.
pub type InitFn =
    Arc<dyn Fn(&mut NodeInit<'_>, &mut RandomKeyGenerator, usize) -> PcResult<()> + Send + Sync>;

/// Write access to one node's slots while it is being initialized.
pub struct NodeInit<'a> {
    store: &'a mut ParamStore,
    node: &'a Node,
    batch: usize,
}

impl NodeInit<'_> {
    pub fn batch(&self) -> usize {
        self.batch
    }

    pub fn dim(&self) -> usize {
        self.node.dim
    }

    /// Shape every slot value must have: `[batch, dim]`.
    pub fn shape(&self) -> [usize; 2] {
        [self.batch, self.node.dim]
    }

    pub fn set_x(&mut self, value: Tensor) -> PcResult<()> {
        self.check(&value)?;
        self.store.set(&self.node.x, value)
    }

    pub fn set_u(&mut self, value: Tensor) -> PcResult<()> {
        self.check(&value)?;
        self.store.set(&self.node.u, value)
    }

    fn check(&self, value: &Tensor) -> PcResult<()> {
        if value.shape() != &self.shape()[..] {
            return Err(PcError::ShapeMismatch(format!(
                "node `{}` expects {:?}, got {:?}",
                self.node.path,
                self.shape(),
                value.shape()
            )));
        }
        Ok(())
    }
}

/// Standard-normal initialization of both `x` and `u`.
pub fn normal_init() -> InitFn {
    Arc::new(sample_normal)
}

fn sample_normal(node: &mut NodeInit<'_>, rkg: &mut RandomKeyGenerator, _dim: usize) -> PcResult<()> {
    let value = rkg.normal(&node.shape());
    node.set_u(value.clone())?;
    node.set_x(value)
}

#[derive(Clone)]
pub struct Node {
    path: String,
    dim: usize,
    x: ParamKey,
    u: ParamKey,
    prior: bool,
    init_fn: Option<InitFn>,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("path", &self.path)
            .field("dim", &self.dim)
            .field("prior", &self.prior)
            .field("init_fn", &self.init_fn.is_some())
            .finish()
    }
}

impl Node {
    /// Register `{path}.x` and `{path}.u` in `store`.
    ///
    /// Values start as `[1, dim]` zeros and are reshaped to the batch by [`Node::initialize`].
    pub fn register(store: &mut ParamStore, path: &str, dim: usize) -> PcResult<Self> {
        if dim == 0 {
            return Err(PcError::InvalidConfig(format!(
                "node `{path}` must have a positive dimension"
            )));
        }
        let zeros = || ArrayD::zeros(IxDyn(&[1, dim]));
        let x = store.register_tagged(format!("{path}.x"), zeros(), Role::NodeState, false, &["x"])?;
        let u = store.register_tagged(
            format!("{path}.u"),
            zeros(),
            Role::NodeState,
            true,
            &["u", "cache"],
        )?;
        Ok(Self {
            path: path.to_string(),
            dim,
            x,
            u,
            prior: true,
            init_fn: None,
        })
    }

    pub fn with_init_fn(mut self, init_fn: InitFn) -> Self {
        self.init_fn = Some(init_fn);
        self
    }

    /// Drop the local energy term (top node of a generator: nothing predicts it).
    pub fn without_prior(mut self) -> Self {
        self.prior = false;
        self
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn dim(&self) -> usize {
        self.dim
    }

    pub fn x_key(&self) -> &ParamKey {
        &self.x
    }

    pub fn u_key(&self) -> &ParamKey {
        &self.u
    }

    pub fn has_prior(&self) -> bool {
        self.prior
    }

    /// Clamp (or release) the state slot.
    pub fn freeze(&self, store: &mut ParamStore, frozen: bool) -> PcResult<()> {
        store.set_frozen(&self.x, frozen)
    }

    pub fn is_frozen(&self, store: &ParamStore) -> PcResult<bool> {
        Ok(store.slot(&self.x)?.frozen())
    }

    /// Record the prediction `u` and return the state.
    ///
    /// While initializing, an unclamped state is seeded with the prediction.
    pub fn call(&self, store: &ParamStore, cx: &mut Scope, u: Var) -> PcResult<Var> {
        cx.set(&self.u, u)?;
        if cx.is_initializing() && !self.is_frozen(store)? {
            cx.set(&self.x, u)?;
        }
        cx.get(&self.x)
    }

    /// Local energy `½‖x - u‖²` of the current bindings.
    pub fn energy(&self, cx: &mut Scope) -> PcResult<Var> {
        if !self.prior {
            return Ok(cx.constant(scalar(0.0)));
        }
        let x = cx.get(&self.x)?;
        let u = cx.get(&self.u)?;
        let err = cx.sub(x, u)?;
        let sq = cx.mul(err, err)?;
        let total = cx.sum(sq)?;
        cx.scale(total, 0.5)
    }

    /// Reset both slots to `[batch, dim]` zeros, then run the init hook.
    pub fn initialize(
        &self,
        store: &mut ParamStore,
        batch: usize,
        rkg: &mut RandomKeyGenerator,
    ) -> PcResult<()> {
        let zeros = ArrayD::zeros(IxDyn(&[batch, self.dim]));
        store.set(&self.x, zeros.clone())?;
        store.set(&self.u, zeros)?;
        if let Some(init_fn) = &self.init_fn {
            let mut handle = NodeInit {
                store,
                node: self,
                batch,
            };
            init_fn(&mut handle, rkg, self.dim)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::partition::partition_store;
    use crate::filter::Filter;
    use approx::assert_abs_diff_eq;
    use ndarray::arr2;

    #[test]
    fn test_register_tags_slots() {
        let mut store = ParamStore::new();
        let node = Node::register(&mut store, "nodes.0", 3).unwrap();
        let x = store.slot(node.x_key()).unwrap();
        let u = store.slot(node.u_key()).unwrap();
        assert!(!x.frozen());
        assert!(u.frozen());
        assert!(u.has_tag("cache"));
        assert_eq!(x.value().shape(), &[1, 3]);
    }

    #[test]
    fn test_energy_is_half_squared_error() {
        let mut store = ParamStore::new();
        let node = Node::register(&mut store, "n", 2).unwrap();
        store.set(node.x_key(), arr2(&[[1.0, 3.0]]).into_dyn()).unwrap();
        store.set(node.u_key(), arr2(&[[0.0, 1.0]]).into_dyn()).unwrap();

        let parts = partition_store(&store, &Filter::all()).unwrap();
        let mut cx = Scope::new(&parts.target, &parts.other);
        let e = node.energy(&mut cx).unwrap();
        assert_abs_diff_eq!(cx.value(e).unwrap().sum(), 2.5, epsilon = 1e-6);
    }

    #[test]
    fn test_initializing_call_seeds_state() {
        let mut store = ParamStore::new();
        let node = Node::register(&mut store, "n", 2).unwrap();
        let parts = partition_store(&store, &Filter::all()).unwrap();
        let mut cx = Scope::new(&parts.target, &parts.other);
        let u = cx.constant(arr2(&[[4.0, 5.0]]).into_dyn());

        cx.set_initializing(true);
        let x = node.call(&store, &mut cx, u).unwrap();
        assert_eq!(x, u);

        node.freeze(&mut store, true).unwrap();
        let mut cx = Scope::new(&parts.target, &parts.other);
        let u = cx.constant(arr2(&[[4.0, 5.0]]).into_dyn());
        cx.set_initializing(true);
        let x = node.call(&store, &mut cx, u).unwrap();
        assert_ne!(x, u);
    }

    #[test]
    fn test_initialize_runs_hook() {
        let mut store = ParamStore::new();
        let node = Node::register(&mut store, "n", 2)
            .unwrap()
            .with_init_fn(normal_init());
        let mut rkg = RandomKeyGenerator::new(0);
        node.initialize(&mut store, 5, &mut rkg).unwrap();
        let x = store.get(node.x_key()).unwrap();
        assert_eq!(x.shape(), &[5, 2]);
        assert_eq!(x, store.get(node.u_key()).unwrap());
        assert!(x.iter().any(|v| *v != 0.0));
    }

    #[test]
    fn test_init_hook_shape_checked() {
        let mut store = ParamStore::new();
        fn flat(node: &mut NodeInit<'_>, _: &mut RandomKeyGenerator, dim: usize) -> PcResult<()> {
            node.set_x(ArrayD::zeros(IxDyn(&[dim])))
        }
        let bad: InitFn = Arc::new(flat);
        let node = Node::register(&mut store, "n", 2).unwrap().with_init_fn(bad);
        let mut rkg = RandomKeyGenerator::new(0);
        assert!(matches!(
            node.initialize(&mut store, 3, &mut rkg),
            Err(PcError::ShapeMismatch(_))
        ));
    }
}
