//! Latent-state data model: the deterministic+stochastic pair carried through
//! time, its distribution statistics, and the explicit sampling RNG.

pub mod rng;
pub mod state;
pub mod stats;

pub use rng::LatentRng;
pub use state::{mask, LatentState, StochState};
pub use stats::StochStats;
