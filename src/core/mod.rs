//! Core types shared by every layer of the crate.
//!
//! - [`Tensor`]: the single value type (`ndarray::ArrayD<f32>`)
//! - [`PcError`] / [`PcResult`]: error taxonomy
//! - [`param`]: tagged slots, stable keys, the parameter store and the [`Module`] trait
//! - [`tape`]: reverse-mode differentiation tape used by gradient transformations
//!
//! ## Values and keys
//!
//! Every learnable value of a model lives in a [`ParamStore`] arena. Slots are
//! registered once at construction and addressed by a [`ParamKey`] that pairs
//! the arena index with a dotted path:
//! ```text
//! #0 nodes.0.x   NodeState   trainable
//! #1 nodes.0.u   NodeState   frozen     {u, cache}
//! #2 layers.0.weight  LayerWeight
//! ```
//! Iteration order is registration order, so repeated partitioning of an
//! unchanged model always yields the same key ordering.

pub mod param;
pub mod tape;

pub use param::{Fingerprint, Module, ParamKey, ParamMap, ParamStore, Role, Slot};
pub use tape::{Gradients, Tape, Var};

use ndarray::ArrayD;
use thiserror::Error;

/// Dense, dynamic-rank `f32` array. Scalars are 0-d arrays.
pub type Tensor = ArrayD<f32>;

/// Error type for all core operations.
#[derive(Debug, Error)]
pub enum PcError {
    /// A filter predicate cannot be evaluated (malformed tag expression).
    #[error("classification error: {0}")]
    Classification(String),
    /// Partition and model disagree on the set of learnable keys.
    #[error("structural mismatch: missing keys {missing:?}, unexpected keys {extra:?}")]
    StructuralMismatch {
        /// Keys the model has but the partition lacks.
        missing: Vec<String>,
        /// Keys the partition carries that the model does not have.
        extra: Vec<String>,
    },
    /// A compiled snapshot's bound structure no longer matches the live model.
    #[error("compiled snapshot is stale: compiled against {expected}, live structure is {found}")]
    CompilationStale {
        expected: Fingerprint,
        found: Fingerprint,
    },
    /// Invalid configuration or call arguments.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// Shape mismatch in tensor operations.
    #[error("shape mismatch: {0}")]
    ShapeMismatch(String),
    /// An optimizer-owned key received no gradient and `allow_none_grads` is off.
    #[error("missing gradient for `{0}`")]
    MissingGradient(String),
    /// A key does not address any slot of the store.
    #[error("unknown parameter key `{0}`")]
    UnknownKey(String),
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type PcResult<T> = Result<T, PcError>;

/// Build a 0-d tensor holding `value`.
pub fn scalar(value: f32) -> Tensor {
    ArrayD::from_elem(ndarray::IxDyn(&[]), value)
}

/// Read the single element of a one-element tensor.
///
/// # Errors
/// `ShapeMismatch` if the tensor holds more or fewer than one element.
pub fn scalar_value(tensor: &Tensor) -> PcResult<f32> {
    if tensor.len() != 1 {
        return Err(PcError::ShapeMismatch(format!(
            "expected a scalar, got shape {:?}",
            tensor.shape()
        )));
    }
    Ok(tensor.sum())
}
