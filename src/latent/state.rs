//! The latent state carried through time.
//!
//! A `LatentState` pairs the deterministic recurrent vector with one of two
//! stochastic representations, fixed at construction. States are immutable:
//! every transition builds a new value. Batched episode resets are expressed
//! as field-wise masking plus a masked initial state, never as control flow.

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::latent::stats::StochStats;

/// Multiply a batched value by a per-batch-element weight, broadcast over all
/// trailing dimensions.
pub fn mask<B: Backend, const D: usize>(value: Tensor<B, D>, weight: &Tensor<B, 1>) -> Tensor<B, D> {
    let batch = value.dims()[0];
    assert_eq!(weight.dims()[0], batch, "mask weight batch mismatch");
    let mut shape = [1usize; D];
    shape[0] = batch;
    value * weight.clone().reshape(shape)
}

/// Sampled stochastic component together with its distribution statistics.
#[derive(Debug, Clone)]
pub enum StochState<B: Backend> {
    /// `[batch, vars, classes]` logits and one-hot sample.
    Categorical { logit: Tensor<B, 3>, stoch: Tensor<B, 3> },
    /// `[batch, size]` mean, std, and sample.
    Gaussian { mean: Tensor<B, 2>, std: Tensor<B, 2>, stoch: Tensor<B, 2> },
}

impl<B: Backend> StochState<B> {
    pub fn batch_size(&self) -> usize {
        match self {
            StochState::Categorical { stoch, .. } => stoch.dims()[0],
            StochState::Gaussian { stoch, .. } => stoch.dims()[0],
        }
    }

    /// The sampled value flattened to `[batch, flat_size]`.
    pub fn flat(&self) -> Tensor<B, 2> {
        match self {
            StochState::Categorical { stoch, .. } => {
                let [batch, vars, classes] = stoch.dims();
                stoch.clone().reshape([batch, vars * classes])
            }
            StochState::Gaussian { stoch, .. } => stoch.clone(),
        }
    }

    /// Distribution statistics of this state.
    pub fn stats(&self) -> StochStats<B> {
        match self {
            StochState::Categorical { logit, .. } => StochStats::Categorical { logit: logit.clone() },
            StochState::Gaussian { mean, std, .. } => StochStats::Gaussian {
                mean: mean.clone(),
                std: std.clone(),
            },
        }
    }

    fn mask(&self, weight: &Tensor<B, 1>) -> Self {
        match self {
            StochState::Categorical { logit, stoch } => StochState::Categorical {
                logit: mask(logit.clone(), weight),
                stoch: mask(stoch.clone(), weight),
            },
            StochState::Gaussian { mean, std, stoch } => StochState::Gaussian {
                mean: mask(mean.clone(), weight),
                std: mask(std.clone(), weight),
                stoch: mask(stoch.clone(), weight),
            },
        }
    }

    fn add(&self, other: &Self) -> Self {
        match (self, other) {
            (
                StochState::Categorical { logit: la, stoch: sa },
                StochState::Categorical { logit: lb, stoch: sb },
            ) => StochState::Categorical {
                logit: la.clone() + lb.clone(),
                stoch: sa.clone() + sb.clone(),
            },
            (
                StochState::Gaussian { mean: ma, std: da, stoch: sa },
                StochState::Gaussian { mean: mb, std: db, stoch: sb },
            ) => StochState::Gaussian {
                mean: ma.clone() + mb.clone(),
                std: da.clone() + db.clone(),
                stoch: sa.clone() + sb.clone(),
            },
            _ => panic!("combining mismatched representation modes"),
        }
    }

    pub fn detach(&self) -> Self {
        match self {
            StochState::Categorical { logit, stoch } => StochState::Categorical {
                logit: logit.clone().detach(),
                stoch: stoch.clone().detach(),
            },
            StochState::Gaussian { mean, std, stoch } => StochState::Gaussian {
                mean: mean.clone().detach(),
                std: std.clone().detach(),
                stoch: stoch.clone().detach(),
            },
        }
    }
}

/// Deterministic + stochastic latent state for one batch of trajectories.
#[derive(Debug, Clone)]
pub struct LatentState<B: Backend> {
    /// Deterministic recurrent vector `[batch, deter]`.
    pub deter: Tensor<B, 2>,
    /// Stochastic component with its statistics.
    pub stoch: StochState<B>,
}

impl<B: Backend> LatentState<B> {
    pub fn batch_size(&self) -> usize {
        self.deter.dims()[0]
    }

    /// Feature vector for heads: `[deter, stoch_flat]` plus the context when
    /// one is active.
    pub fn features(&self, context: Option<&Tensor<B, 2>>) -> Tensor<B, 2> {
        let mut parts = vec![self.deter.clone(), self.stoch.flat()];
        if let Some(ctx) = context {
            assert_eq!(ctx.dims()[0], self.batch_size(), "context batch mismatch");
            parts.push(ctx.clone());
        }
        Tensor::cat(parts, 1)
    }

    /// Statistics of the stochastic component.
    pub fn stats(&self) -> StochStats<B> {
        self.stoch.stats()
    }

    /// Field-wise multiply by a per-batch-element weight.
    pub fn mask(&self, weight: &Tensor<B, 1>) -> Self {
        Self {
            deter: mask(self.deter.clone(), weight),
            stoch: self.stoch.mask(weight),
        }
    }

    /// Field-wise sum; used with complementary masks to reset individual
    /// batch elements without branching.
    pub fn add(&self, other: &Self) -> Self {
        assert_eq!(self.batch_size(), other.batch_size(), "state batch mismatch");
        Self {
            deter: self.deter.clone() + other.deter.clone(),
            stoch: self.stoch.add(&other.stoch),
        }
    }

    /// Detach the whole state from the autodiff graph.
    pub fn detach(&self) -> Self {
        Self {
            deter: self.deter.clone().detach(),
            stoch: self.stoch.detach(),
        }
    }
}
