//! Reverse-mode differentiation tape.
//!
//! Every traced operation appends one entry (op, forward value) to the tape.
//! `backward` walks the entries in reverse, seeding the output with ones and
//! accumulating adjoints into the operands:
//! ```text
//! z = a · b        dL/da += dL/dz · b,   dL/db += dL/dz · a
//! y = W x          dL/dW += dL/dy ⊗ x,   dL/dx += Wᵀ dL/dy
//! s = Σ a          dL/da += dL/ds · 1
//! ```
//! Entries that do not depend on any leaf are never visited.

use ndarray::{Array2, ArrayD, Axis, Ix1, Ix2};

use super::{PcError, PcResult, Tensor};
use crate::utils::Activation;

/// Handle to a value recorded on a [`Tape`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Var(usize);

impl Var {
    pub fn index(&self) -> usize {
        self.0
    }
}

#[derive(Debug, Clone)]
enum Op {
    Leaf,
    Add(Var, Var),
    Sub(Var, Var),
    Mul(Var, Var),
    Scale(Var, f32),
    MatVec(Var, Var),
    Activate(Var, Activation),
    Sum(Var),
    Index(Var, usize),
    Stack(Vec<Var>),
}

#[derive(Debug, Clone)]
struct Entry {
    op: Op,
    value: Tensor,
    requires_grad: bool,
}

/// Wengert list of traced operations.
#[derive(Debug, Clone, Default)]
pub struct Tape {
    entries: Vec<Entry>,
}

impl Tape {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Record a differentiable input.
    pub fn leaf(&mut self, value: Tensor) -> Var {
        self.push(Op::Leaf, value, true)
    }

    /// Record a value that is read but never differentiated.
    pub fn constant(&mut self, value: Tensor) -> Var {
        self.push(Op::Leaf, value, false)
    }

    pub fn value(&self, var: Var) -> PcResult<&Tensor> {
        self.entry(var).map(|e| &e.value)
    }

    pub fn requires_grad(&self, var: Var) -> PcResult<bool> {
        self.entry(var).map(|e| e.requires_grad)
    }

    pub fn add(&mut self, a: Var, b: Var) -> PcResult<Var> {
        let value = {
            let (x, y) = self.same_shape(a, b, "add")?;
            x + y
        };
        Ok(self.push_op(Op::Add(a, b), value, &[a, b]))
    }

    pub fn sub(&mut self, a: Var, b: Var) -> PcResult<Var> {
        let value = {
            let (x, y) = self.same_shape(a, b, "sub")?;
            x - y
        };
        Ok(self.push_op(Op::Sub(a, b), value, &[a, b]))
    }

    /// Elementwise product.
    pub fn mul(&mut self, a: Var, b: Var) -> PcResult<Var> {
        let value = {
            let (x, y) = self.same_shape(a, b, "mul")?;
            x * y
        };
        Ok(self.push_op(Op::Mul(a, b), value, &[a, b]))
    }

    pub fn scale(&mut self, a: Var, factor: f32) -> PcResult<Var> {
        let value = self.value(a)? * factor;
        Ok(self.push_op(Op::Scale(a, factor), value, &[a]))
    }

    /// Matrix-vector product `W x` with `W: [m, n]`, `x: [n]`.
    pub fn matvec(&mut self, w: Var, x: Var) -> PcResult<Var> {
        let value = {
            let wv = as_matrix(self.value(w)?)?;
            let xv = as_vector(self.value(x)?)?;
            if wv.ncols() != xv.len() {
                return Err(PcError::ShapeMismatch(format!(
                    "matvec: weight is {:?}, input has length {}",
                    wv.shape(),
                    xv.len()
                )));
            }
            wv.dot(&xv).into_dyn()
        };
        Ok(self.push_op(Op::MatVec(w, x), value, &[w, x]))
    }

    pub fn activate(&mut self, a: Var, activation: Activation) -> PcResult<Var> {
        let value = self.value(a)?.mapv(|v| activation.apply(v));
        Ok(self.push_op(Op::Activate(a, activation), value, &[a]))
    }

    /// Sum of all elements as a 0-d value.
    pub fn sum(&mut self, a: Var) -> PcResult<Var> {
        let value = super::scalar(self.value(a)?.sum());
        Ok(self.push_op(Op::Sum(a), value, &[a]))
    }

    /// Row `i` along the leading axis.
    pub fn index(&mut self, a: Var, i: usize) -> PcResult<Var> {
        let value = {
            let source = self.value(a)?;
            if source.ndim() == 0 || i >= source.shape()[0] {
                return Err(PcError::ShapeMismatch(format!(
                    "index {i} out of range for shape {:?}",
                    source.shape()
                )));
            }
            source.index_axis(Axis(0), i).to_owned()
        };
        Ok(self.push_op(Op::Index(a, i), value, &[a]))
    }

    /// Stack equally shaped values along a new leading axis.
    pub fn stack(&mut self, vars: &[Var]) -> PcResult<Var> {
        if vars.is_empty() {
            return Err(PcError::ShapeMismatch("cannot stack zero values".to_string()));
        }
        let value = {
            let views = vars
                .iter()
                .map(|v| self.value(*v).map(|t| t.view()))
                .collect::<PcResult<Vec<_>>>()?;
            ndarray::stack(Axis(0), &views)
                .map_err(|e| PcError::ShapeMismatch(format!("stack: {e}")))?
        };
        Ok(self.push_op(Op::Stack(vars.to_vec()), value, vars))
    }

    /// Differentiate a scalar `output` with respect to every leaf.
    ///
    /// # Errors
    /// `ShapeMismatch` if `output` does not hold exactly one element.
    pub fn backward(&self, output: Var) -> PcResult<Gradients> {
        let seed = self.entry(output)?;
        if seed.value.len() != 1 {
            return Err(PcError::ShapeMismatch(format!(
                "backward needs a scalar output, got shape {:?}",
                seed.value.shape()
            )));
        }

        let mut grads: Vec<Option<Tensor>> = vec![None; self.entries.len()];
        grads[output.0] = Some(ArrayD::ones(seed.value.raw_dim()));

        for i in (0..=output.0).rev() {
            let entry = &self.entries[i];
            if !entry.requires_grad || matches!(entry.op, Op::Leaf) {
                continue;
            }
            let Some(grad) = grads[i].take() else {
                continue;
            };

            match &entry.op {
                Op::Leaf => {}
                Op::Add(a, b) => {
                    self.accumulate(&mut grads, *b, grad.clone());
                    self.accumulate(&mut grads, *a, grad);
                }
                Op::Sub(a, b) => {
                    self.accumulate(&mut grads, *b, -&grad);
                    self.accumulate(&mut grads, *a, grad);
                }
                Op::Mul(a, b) => {
                    let da = &grad * &self.entries[b.0].value;
                    let db = &grad * &self.entries[a.0].value;
                    self.accumulate(&mut grads, *a, da);
                    self.accumulate(&mut grads, *b, db);
                }
                Op::Scale(a, factor) => {
                    self.accumulate(&mut grads, *a, grad * *factor);
                }
                Op::MatVec(w, x) => {
                    let wv = as_matrix(&self.entries[w.0].value)?;
                    let xv = as_vector(&self.entries[x.0].value)?;
                    let gv = as_vector(&grad)?;
                    let dw = Array2::from_shape_fn((gv.len(), xv.len()), |(r, c)| gv[r] * xv[c]);
                    let dx = wv.t().dot(&gv);
                    self.accumulate(&mut grads, *w, dw.into_dyn());
                    self.accumulate(&mut grads, *x, dx.into_dyn());
                }
                Op::Activate(a, activation) => {
                    let slope = self.entries[a.0].value.mapv(|v| activation.derivative(v));
                    self.accumulate(&mut grads, *a, grad * slope);
                }
                Op::Sum(a) => {
                    let g = grad.sum();
                    let da = ArrayD::from_elem(self.entries[a.0].value.raw_dim(), g);
                    self.accumulate(&mut grads, *a, da);
                }
                Op::Index(a, row) => {
                    let mut da = ArrayD::zeros(self.entries[a.0].value.raw_dim());
                    da.index_axis_mut(Axis(0), *row).assign(&grad);
                    self.accumulate(&mut grads, *a, da);
                }
                Op::Stack(vars) => {
                    for (row, v) in vars.iter().enumerate() {
                        let dv = grad.index_axis(Axis(0), row).to_owned();
                        self.accumulate(&mut grads, *v, dv);
                    }
                }
            }
        }

        Ok(Gradients { grads })
    }

    fn entry(&self, var: Var) -> PcResult<&Entry> {
        self.entries.get(var.0).ok_or_else(|| {
            PcError::InvalidConfig(format!("variable #{} is not on this tape", var.0))
        })
    }

    fn push(&mut self, op: Op, value: Tensor, requires_grad: bool) -> Var {
        self.entries.push(Entry {
            op,
            value,
            requires_grad,
        });
        Var(self.entries.len() - 1)
    }

    fn push_op(&mut self, op: Op, value: Tensor, inputs: &[Var]) -> Var {
        let requires_grad = inputs
            .iter()
            .any(|v| self.entries.get(v.0).is_some_and(|e| e.requires_grad));
        self.push(op, value, requires_grad)
    }

    fn same_shape(&self, a: Var, b: Var, op: &str) -> PcResult<(&Tensor, &Tensor)> {
        let x = self.value(a)?;
        let y = self.value(b)?;
        if x.shape() != y.shape() {
            return Err(PcError::ShapeMismatch(format!(
                "{op}: {:?} vs {:?}",
                x.shape(),
                y.shape()
            )));
        }
        Ok((x, y))
    }

    fn accumulate(&self, grads: &mut [Option<Tensor>], var: Var, grad: Tensor) {
        if !self.entries[var.0].requires_grad {
            return;
        }
        match &mut grads[var.0] {
            Some(acc) => *acc += &grad,
            slot => *slot = Some(grad),
        }
    }
}

fn as_matrix(t: &Tensor) -> PcResult<ndarray::ArrayView2<'_, f32>> {
    t.view()
        .into_dimensionality::<Ix2>()
        .map_err(|_| PcError::ShapeMismatch(format!("expected a matrix, got {:?}", t.shape())))
}

fn as_vector(t: &Tensor) -> PcResult<ndarray::ArrayView1<'_, f32>> {
    t.view()
        .into_dimensionality::<Ix1>()
        .map_err(|_| PcError::ShapeMismatch(format!("expected a vector, got {:?}", t.shape())))
}

/// Adjoints produced by [`Tape::backward`], indexed by [`Var`].
#[derive(Debug, Clone)]
pub struct Gradients {
    grads: Vec<Option<Tensor>>,
}

impl Gradients {
    /// Gradient of `var`, or `None` when no path reaches it from the output.
    pub fn get(&self, var: Var) -> Option<&Tensor> {
        self.grads.get(var.0).and_then(|g| g.as_ref())
    }

    pub fn take(&mut self, var: Var) -> Option<Tensor> {
        self.grads.get_mut(var.0).and_then(|g| g.take())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;
    use ndarray::{arr1, arr2};

    #[test]
    fn test_squared_error_gradient() {
        // E = 0.5 * Σ (x - u)²  ⇒  dE/dx = x - u
        let mut tape = Tape::new();
        let x = tape.leaf(arr1(&[1.0, 2.0]).into_dyn());
        let u = tape.constant(arr1(&[0.5, 0.0]).into_dyn());
        let e = tape.sub(x, u).unwrap();
        let sq = tape.mul(e, e).unwrap();
        let s = tape.sum(sq).unwrap();
        let out = tape.scale(s, 0.5).unwrap();

        assert_abs_diff_eq!(tape.value(out).unwrap().sum(), 2.125, epsilon = 1e-6);
        let grads = tape.backward(out).unwrap();
        let dx = grads.get(x).unwrap();
        assert_abs_diff_eq!(dx[[0]], 0.5, epsilon = 1e-6);
        assert_abs_diff_eq!(dx[[1]], 2.0, epsilon = 1e-6);
        assert!(grads.get(u).is_none());
    }

    #[test]
    fn test_matvec_gradients() {
        let mut tape = Tape::new();
        let w = tape.leaf(arr2(&[[1.0, 2.0], [3.0, 4.0]]).into_dyn());
        let x = tape.leaf(arr1(&[1.0, -1.0]).into_dyn());
        let y = tape.matvec(w, x).unwrap();
        let out = tape.sum(y).unwrap();

        let grads = tape.backward(out).unwrap();
        let dw = grads.get(w).unwrap();
        assert_eq!(dw.shape(), &[2, 2]);
        assert_abs_diff_eq!(dw[[1, 0]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dw[[1, 1]], -1.0, epsilon = 1e-6);
        let dx = grads.get(x).unwrap();
        assert_abs_diff_eq!(dx[[0]], 4.0, epsilon = 1e-6);
        assert_abs_diff_eq!(dx[[1]], 6.0, epsilon = 1e-6);
    }

    #[test]
    fn test_index_and_stack_route_gradients() {
        let mut tape = Tape::new();
        let batch = tape.leaf(arr2(&[[1.0, 1.0], [2.0, 2.0]]).into_dyn());
        let r0 = tape.index(batch, 0).unwrap();
        let r1 = tape.index(batch, 1).unwrap();
        let r1s = tape.scale(r1, 3.0).unwrap();
        let stacked = tape.stack(&[r0, r1s]).unwrap();
        let out = tape.sum(stacked).unwrap();

        let grads = tape.backward(out).unwrap();
        let d = grads.get(batch).unwrap();
        assert_abs_diff_eq!(d[[0, 1]], 1.0, epsilon = 1e-6);
        assert_abs_diff_eq!(d[[1, 0]], 3.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shared_operand_accumulates() {
        let mut tape = Tape::new();
        let a = tape.leaf(arr1(&[3.0]).into_dyn());
        let b = tape.add(a, a).unwrap();
        let out = tape.sum(b).unwrap();
        let grads = tape.backward(out).unwrap();
        assert_abs_diff_eq!(grads.get(a).unwrap()[[0]], 2.0, epsilon = 1e-6);
    }

    #[test]
    fn test_backward_requires_scalar() {
        let mut tape = Tape::new();
        let a = tape.leaf(arr1(&[1.0, 2.0]).into_dyn());
        assert!(matches!(tape.backward(a), Err(PcError::ShapeMismatch(_))));
    }

    #[test]
    fn test_shape_mismatch_on_add() {
        let mut tape = Tape::new();
        let a = tape.leaf(arr1(&[1.0, 2.0]).into_dyn());
        let b = tape.leaf(arr1(&[1.0]).into_dyn());
        assert!(tape.add(a, b).is_err());
    }
}
