//! Policy-driven imagination rollouts through the RSSM prior.
//!
//! Starting from a real posterior state, the roller repeatedly applies the
//! prior transition under a candidate policy, producing a synthetic
//! trajectory with continuation flags and cumulative discount weights. No
//! observations are involved; this is the sole interface the policy-training
//! code needs.

use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::latent::{LatentRng, LatentState};
use crate::nn::Mlp;
use crate::rssm::Rssm;

/// Starting point for an imagination rollout.
#[derive(Debug, Clone)]
pub struct ImagStart<B: Backend> {
    /// The latent state to roll forward from (usually a posterior).
    pub state: LatentState<B>,
    /// Ground-truth terminal flag of the real starting step `[batch]`.
    pub is_terminal: Tensor<B, 1>,
    /// Context carried through the rollout, when the RSSM is context-wired.
    pub context: Option<Tensor<B, 2>>,
}

/// Trajectory produced by imagination: `horizon + 1` steps of latent states
/// and actions with per-step continuation and discount weight.
#[derive(Debug, Clone)]
pub struct ImaginedTrajectory<B: Backend> {
    pub states: Vec<LatentState<B>>,
    pub actions: Vec<Tensor<B, 2>>,
    /// Context carried unchanged through the rollout, if active.
    pub context: Option<Tensor<B, 2>>,
    /// Continuation per step `[batch]`; index 0 is the ground-truth
    /// `1 - is_terminal` of the real starting state.
    pub cont: Vec<Tensor<B, 1>>,
    /// Cumulative discount weight per step `[batch]`.
    pub weight: Vec<Tensor<B, 1>>,
}

impl<B: Backend> ImaginedTrajectory<B> {
    /// Number of imagined transitions (trajectory length minus one).
    pub fn horizon(&self) -> usize {
        self.states.len() - 1
    }

    pub fn batch_size(&self) -> usize {
        self.states[0].batch_size()
    }

    /// Per-step feature vectors for heads and critics.
    pub fn features(&self) -> Vec<Tensor<B, 2>> {
        self.states
            .iter()
            .map(|s| s.features(self.context.as_ref()))
            .collect()
    }
}

/// Roll the prior transition forward under a policy.
///
/// The first trajectory element is the start state with its policy-chosen
/// action; each further step runs `img_step`, re-attaches the carried
/// context, and queries the policy for the next action. Continuation comes
/// from the learned continuation head (its logit output, taken at the
/// Bernoulli mode) for every step except the first, which is overridden with
/// the ground-truth `1 - is_terminal`. Weights are the running product of
/// `discount * cont`, divided by `discount` so the first weight is exactly
/// the first continuation.
pub fn imagine<B: Backend, P>(
    rssm: &Rssm<B>,
    cont_head: &Mlp<B>,
    policy: &mut P,
    start: ImagStart<B>,
    horizon: usize,
    discount: f32,
    rng: &mut LatentRng,
) -> ImaginedTrajectory<B>
where
    P: FnMut(&LatentState<B>, Option<&Tensor<B, 2>>, &mut LatentRng) -> Tensor<B, 2>,
{
    let batch = start.state.batch_size();
    assert_eq!(start.is_terminal.dims(), [batch], "is_terminal shape mismatch");

    let context = start.context;

    let mut states = Vec::with_capacity(horizon + 1);
    let mut actions = Vec::with_capacity(horizon + 1);
    states.push(start.state);
    actions.push(policy(&states[0], context.as_ref(), rng));

    for _ in 0..horizon {
        let prev = states.last().unwrap();
        let action = actions.last().unwrap().clone();
        let next = rssm.img_step(prev, action, context.as_ref(), rng);
        actions.push(policy(&next, context.as_ref(), rng));
        states.push(next);
    }

    // Continuation over the whole trajectory; step 0 reflects whether the
    // real episode had already terminated.
    let first_cont = Tensor::ones_like(&start.is_terminal) - start.is_terminal;
    let mut cont = Vec::with_capacity(horizon + 1);
    cont.push(first_cont);
    for state in &states[1..] {
        let logit: Tensor<B, 2> = cont_head.forward(state.features(context.as_ref()));
        let prob: Tensor<B, 1> = sigmoid(logit).reshape([batch]);
        cont.push(prob.greater_elem(0.5).float());
    }

    let mut weight = Vec::with_capacity(horizon + 1);
    let mut running = cont[0].clone();
    weight.push(running.clone());
    for c in &cont[1..] {
        running = running * c.clone() * discount;
        weight.push(running.clone());
    }

    ImaginedTrajectory { states, actions, context, cont, weight }
}
