//! Lambda-return estimation over imagined trajectories.
//!
//! The lambda return is a TD(λ)-style exponentially weighted average of
//! n-step bootstrapped returns, computed in one backward pass:
//! - λ = 0: one-step TD target
//! - λ = 1: Monte Carlo return to the horizon (bootstrapped at the end)
//! - λ ∈ (0, 1): interpolation

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::roller::ImaginedTrajectory;

/// Compute lambda returns over a trajectory.
///
/// # Arguments
///
/// * `reward` - per-step rewards, one per transition `[T]` of `[batch]`
/// * `value` - value estimates for every trajectory step `[T+1]` of `[batch]`
/// * `cont` - continuation flags for every trajectory step `[T+1]` of `[batch]`
/// * `discount` - discount factor
/// * `lambda` - return mixing parameter
///
/// # Returns
///
/// Returns `[T]` of `[batch]`; no return is defined for the final bootstrap
/// step. Length mismatches are contract violations.
pub fn lambda_return<B: Backend>(
    reward: &[Tensor<B, 1>],
    value: &[Tensor<B, 1>],
    cont: &[Tensor<B, 1>],
    discount: f32,
    lambda: f32,
) -> Vec<Tensor<B, 1>> {
    let steps = reward.len();
    assert_eq!(
        value.len(),
        steps + 1,
        "must provide a value for every trajectory step including the bootstrap"
    );
    assert_eq!(cont.len(), steps + 1, "must provide cont for every trajectory step");

    if steps == 0 {
        return Vec::new();
    }

    // disc[t] = cont[t+1] * discount
    let disc: Vec<Tensor<B, 1>> =
        cont[1..].iter().map(|c| c.clone() * discount).collect();

    // interm[t] = reward[t] + disc[t] * value[t+1] * (1 - lambda)
    let interm: Vec<Tensor<B, 1>> = (0..steps)
        .map(|t| reward[t].clone() + disc[t].clone() * value[t + 1].clone() * (1.0 - lambda))
        .collect();

    // Backward recursion seeded with the final value estimate.
    let mut returns = vec![value[steps].clone(); steps];
    let mut next = value[steps].clone();
    for t in (0..steps).rev() {
        next = interm[t].clone() + disc[t].clone() * next * lambda;
        returns[t] = next.clone();
    }

    returns
}

/// Reward, lambda return, and value baseline for a trajectory.
#[derive(Debug, Clone)]
pub struct TrajectoryScore<B: Backend> {
    /// Per-transition rewards `[T]`.
    pub reward: Vec<Tensor<B, 1>>,
    /// Lambda returns `[T]`.
    pub ret: Vec<Tensor<B, 1>>,
    /// Value baseline for the scored steps `[T]`.
    pub base: Vec<Tensor<B, 1>>,
}

/// Score a trajectory: lambda returns from rewards and value estimates, with
/// the per-step value baseline for advantage computation.
///
/// `reward` must have one element fewer than the trajectory (rewards for all
/// but the last step); `value` must cover every step.
pub fn score<B: Backend>(
    traj: &ImaginedTrajectory<B>,
    reward: Vec<Tensor<B, 1>>,
    value: Vec<Tensor<B, 1>>,
    discount: f32,
    lambda: f32,
) -> TrajectoryScore<B> {
    let steps = traj.horizon();
    assert_eq!(reward.len(), steps, "rewards must cover all but the last trajectory step");
    assert_eq!(value.len(), steps + 1, "values must cover every trajectory step");

    let ret = lambda_return(&reward, &value, &traj.cont, discount, lambda);
    let base = value[..steps].to_vec();

    TrajectoryScore { reward, ret, base }
}
