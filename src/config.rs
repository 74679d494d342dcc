//! Shared configuration types for the world model core.
//!
//! Every mode choice is a closed enum selected once at construction and
//! matched exhaustively. Component-local configuration (layer sizes, init)
//! lives next to each module; this module holds the cross-cutting choices and
//! the validation error type.

use std::fmt;

use burn::module::Module;
use serde::{Deserialize, Serialize};

/// Stochastic representation of the latent state, fixed at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LatentSpec {
    /// `vars` categorical variables with `classes` categories each.
    Categorical { vars: usize, classes: usize },
    /// Diagonal Gaussian of dimension `size`.
    Gaussian { size: usize },
}

// `LatentSpec` is a constant (non-parameter) field of the RSSM module. The
// `#[derive(Module)]` const path miscompiles enums with named-field variants
// (it emits `self.vars`-style field access), so the constant `Module` impl is
// written out by hand here; it carries no parameters and is identity under all
// module operations, exactly like the derived impls for the other config enums.
impl<B: burn::tensor::backend::Backend> Module<B> for LatentSpec {
    burn::constant!(module);
}

impl<B: burn::tensor::backend::AutodiffBackend> burn::module::AutodiffModule<B> for LatentSpec {
    burn::constant!(ad_module, LatentSpec);
}

impl burn::module::ModuleDisplayDefault for LatentSpec {
    fn content(&self, content: burn::module::Content) -> Option<burn::module::Content> {
        content.add_formatted(&format!("{:?}", self)).optional()
    }
}

impl burn::module::ModuleDisplay for LatentSpec {}

impl LatentSpec {
    /// Flattened width of the sampled stochastic component.
    pub fn flat_size(&self) -> usize {
        match self {
            LatentSpec::Categorical { vars, classes } => vars * classes,
            LatentSpec::Gaussian { size } => *size,
        }
    }

    /// Width of the raw statistics projection feeding this representation.
    pub fn stats_size(&self) -> usize {
        match self {
            LatentSpec::Categorical { vars, classes } => vars * classes,
            LatentSpec::Gaussian { size } => 2 * size,
        }
    }

    /// Validate the sizes.
    pub fn validate(&self) -> Result<(), ConfigError> {
        match *self {
            LatentSpec::Categorical { vars, classes } => {
                if vars == 0 {
                    return Err(ConfigError::InvalidCount { field: "latent.vars", value: vars });
                }
                if classes == 0 {
                    return Err(ConfigError::InvalidCount {
                        field: "latent.classes",
                        value: classes,
                    });
                }
            }
            LatentSpec::Gaussian { size } => {
                if size == 0 {
                    return Err(ConfigError::InvalidCount { field: "latent.size", value: size });
                }
            }
        }
        Ok(())
    }
}

/// How the initial latent state is produced.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum InitialKind {
    /// All-zero deterministic and stochastic parts.
    Zeros,
    /// Learned deterministic vector (tanh-squashed, batch-broadcast) with the
    /// stochastic part taken as the mode of the prior statistics path.
    #[default]
    Learned,
}

/// Dynamics-loss implementation (gradient stops through the posterior).
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum DynLossImpl {
    /// KL(sg(post) || prior).
    #[default]
    Kl,
    /// Negative prior log-likelihood of the (stopped) posterior sample.
    LogProb,
}

/// Representation-loss implementation (gradient stops through the prior).
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum RepLossImpl {
    /// KL(post || sg(prior)).
    #[default]
    Kl,
    /// KL(post || reference): uniform categorical or standard normal.
    Uniform,
    /// Negative posterior entropy.
    Entropy,
    /// Zero loss.
    None,
}

/// Where an enabled context vector is injected into the RSSM.
///
/// An enabled context is always concatenated at the prior input projection;
/// these flags add the two optional extra injection points.
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextWiring {
    /// Width of the context vector.
    pub size: usize,
    /// Re-inject after the recurrent update, before the prior statistics.
    pub after_deter: bool,
    /// Inject into the posterior statistics input.
    pub posterior: bool,
}

impl ContextWiring {
    /// Context injected only at the prior input projection.
    pub fn input_only(size: usize) -> Self {
        Self { size, after_deter: false, posterior: false }
    }

    /// Context injected at every supported point.
    pub fn everywhere(size: usize) -> Self {
        Self { size, after_deter: true, posterior: true }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.size == 0 {
            return Err(ConfigError::InvalidCount { field: "context.size", value: self.size });
        }
        Ok(())
    }
}

/// Window reducer used by the learned context encoder.
#[derive(Module, Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReducerKind {
    /// Feed-forward network over the flattened window.
    #[default]
    FeedForward,
    /// Gated recurrent scan over the window, reducing to the final state.
    Recurrent,
    /// Single self-attention layer over the window.
    Attention,
    /// Pre-norm transformer block (attention + feed-forward, residuals).
    Transformer,
}

/// Auxiliary representation loss trained into the context encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum AuxLossMode {
    /// Predict the next observation from (prev obs, action, context).
    #[default]
    Forward,
    /// Predict the action from (prev obs, obs, context).
    Inverse,
    /// Sum of both.
    Both,
}

impl AuxLossMode {
    pub fn uses_forward(&self) -> bool {
        matches!(self, AuxLossMode::Forward | AuxLossMode::Both)
    }

    pub fn uses_inverse(&self) -> bool {
        matches!(self, AuxLossMode::Inverse | AuxLossMode::Both)
    }
}

/// Configuration validation error.
///
/// Surfaced immediately at construction; nothing here is recoverable at
/// runtime.
#[derive(Debug, Clone, PartialEq)]
pub enum ConfigError {
    /// A size/count parameter must be positive.
    InvalidCount { field: &'static str, value: usize },
    /// A parameter is outside its valid range.
    OutOfRange { field: &'static str, value: f32, min: f32, max: f32 },
    /// Context-dependent options enabled without a context configuration.
    ContextNotEnabled { field: &'static str },
    /// Two configured sizes that must agree do not.
    Mismatch { field: &'static str, expected: usize, actual: usize },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigError::InvalidCount { field, value } => {
                write!(f, "{} must be > 0, got {}", field, value)
            }
            ConfigError::OutOfRange { field, value, min, max } => {
                write!(f, "{} must be in [{}, {}], got {}", field, min, max, value)
            }
            ConfigError::ContextNotEnabled { field } => {
                write!(f, "{} requires a context configuration", field)
            }
            ConfigError::Mismatch { field, expected, actual } => {
                write!(f, "{} must equal {}, got {}", field, expected, actual)
            }
        }
    }
}

impl std::error::Error for ConfigError {}
