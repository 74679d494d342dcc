//! # World Model RL: Recurrent Latent World Model Core
//!
//! A model-based reinforcement-learning core built around a recurrent
//! stochastic state-space model (RSSM), with imagination rollouts and
//! lambda-return estimation for training an actor and critics purely from
//! model-generated trajectories.
//!
//! ## Architecture Overview
//!
//! ```text
//! real sequences ──► ContextProvider ──► RSSM posterior scan ──► losses
//!                                           │
//!                                 last posterior state
//!                                           │
//!                                           ▼
//!                policy ──► Imagination Roller (prior scan)
//!                                           │
//!                                   ImaginedTrajectory
//!                                           │
//!                                           ▼
//!                          Lambda-Return Estimator ──► advantages
//! ```
//!
//! The RSSM advances a deterministic+stochastic latent state either from
//! observations (`obs_step`, posterior) or from imagination (`img_step`,
//! prior). Dynamics and representation losses form a free-bits-floored KL
//! between the two, with asymmetric gradient stops. An optional context
//! channel conditions the transitions, supplied upstream or produced by a
//! learned window encoder trained with forward/inverse/cross-modal
//! auxiliary objectives.
//!
//! All stochastic operations take an explicit [`LatentRng`] handle; runs are
//! reproducible from a seed.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use world_model_rl::{
//!     LatentRng, LatentSpec, RssmConfig, WorldModelConfig,
//! };
//!
//! let rssm = RssmConfig::new(1024, LatentSpec::Categorical { vars: 32, classes: 32 }, 6, 512);
//! let model = WorldModelConfig::new(rssm).init::<B>(&device)?;
//!
//! let mut rng = LatentRng::seed_from_u64(0);
//! let (model, state, metrics) =
//!     model.train(&batch, state, &decoder, &mut optimizer, 1e-4, &mut rng);
//! let traj = model.imagine(&mut policy, start, 15, &mut rng);
//! ```

pub mod config;
pub mod context;
pub mod imagination;
pub mod latent;
pub mod metrics;
pub mod nn;
pub mod rssm;
pub mod world_model;

// Re-export commonly used types
pub use config::{
    AuxLossMode, ConfigError, ContextWiring, DynLossImpl, InitialKind, LatentSpec, RepLossImpl,
    ReducerKind,
};
pub use context::{ContextProvider, CrossModalConfig, CtxEncoder, CtxEncoderConfig, CtxWindow};
pub use imagination::{lambda_return, score, ImagStart, ImaginedTrajectory, TrajectoryScore};
pub use latent::{LatentRng, LatentState, StochState, StochStats};
pub use metrics::Metrics;
pub use rssm::{flatten_action, Rssm, RssmConfig};
pub use world_model::{
    FeatureDecoder, LossOutput, LossScales, TrainBatch, WorldModel, WorldModelConfig,
    WorldModelState,
};
