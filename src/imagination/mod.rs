//! Imagination: policy-driven prior rollouts and bootstrapped return
//! estimation over the resulting trajectories.

pub mod returns;
pub mod roller;

pub use returns::{lambda_return, score, TrajectoryScore};
pub use roller::{imagine, ImagStart, ImaginedTrajectory};
