//! Context provider seam.
//!
//! The RSSM consumes a per-timestep context tensor; where it comes from is
//! polymorphic over two capabilities: an upstream signal passed through
//! unchanged, or a learned encoder that reduces the recent-history window to
//! one vector broadcast across the sequence.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::encoder::{CtxEncoder, CtxWindow};

/// Source of the per-timestep context sequence `[batch, time, context]`.
pub enum ContextProvider<'a, B: Backend> {
    /// Use the upstream context signal unchanged.
    Passthrough(Tensor<B, 3>),
    /// Encode the window and broadcast the result across time.
    Learned {
        encoder: &'a CtxEncoder<B>,
        window: CtxWindow<B>,
    },
}

impl<B: Backend> ContextProvider<'_, B> {
    /// Produce the per-timestep context sequence for `steps` timesteps.
    pub fn provide(&self, steps: usize) -> Tensor<B, 3> {
        match self {
            ContextProvider::Passthrough(context) => {
                let [_, t, _] = context.dims();
                assert_eq!(t, steps, "passthrough context length mismatch");
                context.clone()
            }
            ContextProvider::Learned { encoder, window } => {
                let context = encoder.forward(window);
                let [batch, size] = context.dims();
                context.reshape([batch, 1, size]).repeat_dim(1, steps)
            }
        }
    }
}
