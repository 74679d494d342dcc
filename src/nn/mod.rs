//! Neural network building blocks for the world model.
//!
//! # Modules
//!
//! - [`gated`]: Gated recurrent cell used by the RSSM and the recurrent
//!   context reducer
//! - [`mlp`]: Small multi-layer perceptron for heads and auxiliary models
//! - [`attention`]: Multi-head self-attention for the context reducers

pub mod attention;
pub mod gated;
pub mod mlp;

pub use attention::{MultiHeadAttention, MultiHeadAttentionConfig};
pub use gated::{GatedCell, GatedCellConfig};
pub use mlp::{Mlp, MlpConfig};

use burn::module::Module;
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;
use serde::{Deserialize, Serialize};

/// Activation applied between hidden layers.
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum Activation {
    /// `x * sigmoid(x)`.
    #[default]
    Silu,
    Relu,
    Tanh,
    /// Identity.
    None,
}

impl Activation {
    pub fn apply<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Activation::Silu => x.clone() * sigmoid(x),
            Activation::Relu => burn::tensor::activation::relu(x),
            Activation::Tanh => x.tanh(),
            Activation::None => x,
        }
    }
}

/// Symmetric log transform: `sign(x) * ln(1 + |x|)`.
///
/// Compresses large-magnitude inputs while staying identity-like near zero.
pub fn symlog<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().sign() * (x.abs() + 1.0).log()
}

/// Inverse of [`symlog`]: `sign(x) * (exp(|x|) - 1)`.
pub fn symexp<B: Backend, const D: usize>(x: Tensor<B, D>) -> Tensor<B, D> {
    x.clone().sign() * (x.abs().exp() - 1.0)
}
