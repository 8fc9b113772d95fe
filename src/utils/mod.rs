//! Math utilities, activation functions, and the splittable random key generator.

use std::fmt;
use std::str::FromStr;

use ndarray::{ArrayD, IxDyn};
use ndarray_rand::rand_distr::{StandardNormal, Uniform};
use ndarray_rand::RandomExt;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};

use crate::core::{PcError, PcResult, Tensor};

/// Activation function: identity (for linear networks).
#[inline]
pub fn identity(x: f32) -> f32 {
    x
}

/// Derivative of identity activation.
#[inline]
pub fn d_identity(_x: f32) -> f32 {
    1.0
}

/// Activation function: tanh.
#[inline]
pub fn tanh(x: f32) -> f32 {
    x.tanh()
}

/// Derivative of tanh activation.
#[inline]
pub fn d_tanh(x: f32) -> f32 {
    let t = x.tanh();
    1.0 - t * t
}

#[inline]
pub fn relu(x: f32) -> f32 {
    x.max(0.0)
}

#[inline]
pub fn d_relu(x: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        0.0
    }
}

/// Activation function: leaky ReLU.
#[inline]
pub fn leaky_relu(x: f32, alpha: f32) -> f32 {
    if x > 0.0 {
        x
    } else {
        alpha * x
    }
}

/// Derivative of leaky ReLU.
#[inline]
pub fn d_leaky_relu(x: f32, alpha: f32) -> f32 {
    if x > 0.0 {
        1.0
    } else {
        alpha
    }
}

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_CUBIC: f32 = 0.044_715;

/// GELU, tanh approximation:
/// ```text
/// gelu(x) = 0.5 x (1 + tanh(√(2/π) (x + 0.044715 x³)))
/// ```
#[inline]
pub fn gelu(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Derivative of the tanh-approximated GELU.
#[inline]
pub fn d_gelu(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_CUBIC * x * x * x);
    let t = inner.tanh();
    let d_inner = SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_CUBIC * x * x);
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * d_inner
}

#[inline]
pub fn sigmoid(x: f32) -> f32 {
    1.0 / (1.0 + (-x).exp())
}

#[inline]
pub fn d_sigmoid(x: f32) -> f32 {
    let s = sigmoid(x);
    s * (1.0 - s)
}

/// Elementwise nonlinearity applied between decoder layers.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Activation {
    Identity,
    Tanh,
    Relu,
    LeakyRelu(f32),
    Gelu,
    Sigmoid,
}

impl Activation {
    #[inline]
    pub fn apply(&self, x: f32) -> f32 {
        match self {
            Activation::Identity => identity(x),
            Activation::Tanh => tanh(x),
            Activation::Relu => relu(x),
            Activation::LeakyRelu(alpha) => leaky_relu(x, *alpha),
            Activation::Gelu => gelu(x),
            Activation::Sigmoid => sigmoid(x),
        }
    }

    #[inline]
    pub fn derivative(&self, x: f32) -> f32 {
        match self {
            Activation::Identity => d_identity(x),
            Activation::Tanh => d_tanh(x),
            Activation::Relu => d_relu(x),
            Activation::LeakyRelu(alpha) => d_leaky_relu(x, *alpha),
            Activation::Gelu => d_gelu(x),
            Activation::Sigmoid => d_sigmoid(x),
        }
    }

    /// Name for debugging and config files.
    pub fn name(&self) -> &'static str {
        match self {
            Activation::Identity => "identity",
            Activation::Tanh => "tanh",
            Activation::Relu => "relu",
            Activation::LeakyRelu(_) => "leaky_relu",
            Activation::Gelu => "gelu",
            Activation::Sigmoid => "sigmoid",
        }
    }
}

impl Default for Activation {
    fn default() -> Self {
        Activation::Gelu
    }
}

impl fmt::Display for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Activation {
    type Err = PcError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "identity" | "linear" => Ok(Activation::Identity),
            "tanh" => Ok(Activation::Tanh),
            "relu" => Ok(Activation::Relu),
            "leaky_relu" => Ok(Activation::LeakyRelu(0.01)),
            "gelu" => Ok(Activation::Gelu),
            "sigmoid" => Ok(Activation::Sigmoid),
            other => Err(PcError::InvalidConfig(format!(
                "unknown activation `{other}`"
            ))),
        }
    }
}

/// Explicit, splittable source of randomness.
///
/// Every consumer receives its own generator; nothing reads global RNG state,
/// so a run is reproducible from its seed alone.
#[derive(Debug, Clone)]
pub struct RandomKeyGenerator {
    rng: StdRng,
}

impl RandomKeyGenerator {
    pub fn new(seed: u64) -> Self {
        Self {
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Derive an independent child generator and advance this one.
    pub fn split(&mut self) -> Self {
        Self::new(self.rng.gen::<u64>())
    }

    /// Standard normal samples of the given shape.
    pub fn normal(&mut self, shape: &[usize]) -> Tensor {
        ArrayD::random_using(IxDyn(shape), StandardNormal, &mut self.rng)
    }

    /// Uniform samples in `[low, high)`.
    pub fn uniform(&mut self, shape: &[usize], low: f32, high: f32) -> PcResult<Tensor> {
        if !(low < high) {
            return Err(PcError::InvalidConfig(format!(
                "uniform range [{low}, {high}) is empty"
            )));
        }
        Ok(ArrayD::random_using(
            IxDyn(shape),
            Uniform::new(low, high),
            &mut self.rng,
        ))
    }

    /// In-place Fisher-Yates shuffle.
    pub fn shuffle<T>(&mut self, items: &mut [T]) {
        for i in (1..items.len()).rev() {
            let j = self.rng.gen_range(0..=i);
            items.swap(i, j);
        }
    }

    pub fn rng(&mut self) -> &mut StdRng {
        &mut self.rng
    }
}
