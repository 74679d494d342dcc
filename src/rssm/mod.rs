//! Recurrent stochastic state-space model.
//!
//! The transition core of the world model: a gated recurrent state machine
//! with a stochastic head, advanced either from observations (`obs_step`,
//! posterior) or from imagination (`img_step`, prior). Episode resets inside
//! padded batches are handled by field-wise masking, and the dynamics /
//! representation losses form the KL objective between posterior and prior
//! with asymmetric gradient stops.

use burn::module::{Module, Param};
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::{ConfigError, ContextWiring, DynLossImpl, InitialKind, LatentSpec, RepLossImpl};
use crate::latent::{mask, LatentRng, LatentState, StochState, StochStats};
use crate::nn::{Activation, GatedCell, GatedCellConfig};

/// Flatten a two-dimensional per-step action `[batch, a, b]` to `[batch, a*b]`.
pub fn flatten_action<B: Backend>(action: Tensor<B, 3>) -> Tensor<B, 2> {
    let [batch, rows, cols] = action.dims();
    action.reshape([batch, rows * cols])
}

/// Configuration for [`Rssm`].
#[derive(Debug, Clone)]
pub struct RssmConfig {
    /// Deterministic state width.
    pub deter: usize,
    /// Stochastic representation.
    pub latent: LatentSpec,
    /// Hidden width of the input/output projections.
    pub hidden: usize,
    /// Flattened action width.
    pub action: usize,
    /// Observation embedding width.
    pub embed: usize,
    /// Initial-state strategy.
    pub initial: InitialKind,
    /// Uniform mixing rate for categorical statistics.
    pub unimix: f32,
    /// Soft action clip bound (0 disables).
    pub action_clip: f32,
    /// Scan chunk size; a throughput knob with identical results.
    pub unroll: usize,
    /// Context injection, when a context channel is enabled.
    pub context: Option<ContextWiring>,
    /// Dynamics-loss implementation and free-bits floor.
    pub dyn_impl: DynLossImpl,
    pub dyn_free: f32,
    /// Representation-loss implementation and free-bits floor.
    pub rep_impl: RepLossImpl,
    pub rep_free: f32,
    /// Activation of the hidden projections.
    pub activation: Activation,
}

impl RssmConfig {
    pub fn new(deter: usize, latent: LatentSpec, action: usize, embed: usize) -> Self {
        Self {
            deter,
            latent,
            hidden: deter,
            action,
            embed,
            initial: InitialKind::Learned,
            unimix: 0.01,
            action_clip: 1.0,
            unroll: 1,
            context: None,
            dyn_impl: DynLossImpl::Kl,
            dyn_free: 1.0,
            rep_impl: RepLossImpl::Kl,
            rep_free: 1.0,
            activation: Activation::Silu,
        }
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_initial(mut self, initial: InitialKind) -> Self {
        self.initial = initial;
        self
    }

    pub fn with_unimix(mut self, unimix: f32) -> Self {
        self.unimix = unimix;
        self
    }

    pub fn with_action_clip(mut self, action_clip: f32) -> Self {
        self.action_clip = action_clip;
        self
    }

    pub fn with_unroll(mut self, unroll: usize) -> Self {
        self.unroll = unroll;
        self
    }

    pub fn with_context(mut self, context: ContextWiring) -> Self {
        self.context = Some(context);
        self
    }

    pub fn with_dyn_loss(mut self, impl_: DynLossImpl, free: f32) -> Self {
        self.dyn_impl = impl_;
        self.dyn_free = free;
        self
    }

    pub fn with_rep_loss(mut self, impl_: RepLossImpl, free: f32) -> Self {
        self.rep_impl = impl_;
        self.rep_free = free;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.latent.validate()?;
        if self.deter == 0 {
            return Err(ConfigError::InvalidCount { field: "rssm.deter", value: self.deter });
        }
        if self.hidden == 0 {
            return Err(ConfigError::InvalidCount { field: "rssm.hidden", value: self.hidden });
        }
        if self.action == 0 {
            return Err(ConfigError::InvalidCount { field: "rssm.action", value: self.action });
        }
        if self.embed == 0 {
            return Err(ConfigError::InvalidCount { field: "rssm.embed", value: self.embed });
        }
        if self.unroll == 0 {
            return Err(ConfigError::InvalidCount { field: "rssm.unroll", value: self.unroll });
        }
        if !(0.0..1.0).contains(&self.unimix) {
            return Err(ConfigError::OutOfRange {
                field: "rssm.unimix",
                value: self.unimix,
                min: 0.0,
                max: 1.0,
            });
        }
        if self.action_clip < 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "rssm.action_clip",
                value: self.action_clip,
                min: 0.0,
                max: f32::INFINITY,
            });
        }
        if let Some(ctx) = &self.context {
            ctx.validate()?;
        }
        Ok(())
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<Rssm<B>, ConfigError> {
        self.validate()?;

        let ctx_size = self.context.map(|c| c.size).unwrap_or(0);
        let ctx_after_deter = self.context.map(|c| c.after_deter).unwrap_or(false);
        let ctx_posterior = self.context.map(|c| c.posterior).unwrap_or(false);

        let img_in_width = self.latent.flat_size() + self.action + ctx_size;
        let img_out_width = self.deter + if ctx_after_deter { ctx_size } else { 0 };
        let obs_out_width =
            self.deter + self.embed + if ctx_posterior { ctx_size } else { 0 };

        let initial_deter = match self.initial {
            InitialKind::Zeros => None,
            InitialKind::Learned => {
                Some(Param::from_tensor(Tensor::zeros([self.deter], device)))
            }
        };

        Ok(Rssm {
            img_in: LinearConfig::new(img_in_width, self.hidden).init(device),
            img_in_norm: LayerNormConfig::new(self.hidden).init(device),
            cell: GatedCellConfig::new(self.hidden, self.deter).init(device),
            img_out: LinearConfig::new(img_out_width, self.hidden).init(device),
            img_out_norm: LayerNormConfig::new(self.hidden).init(device),
            obs_out: LinearConfig::new(obs_out_width, self.hidden).init(device),
            obs_out_norm: LayerNormConfig::new(self.hidden).init(device),
            img_stats: LinearConfig::new(self.hidden, self.latent.stats_size()).init(device),
            obs_stats: LinearConfig::new(self.hidden, self.latent.stats_size()).init(device),
            initial_deter,
            latent: self.latent,
            deter: self.deter,
            action: self.action,
            embed: self.embed,
            context: self.context,
            unimix: self.unimix,
            action_clip: self.action_clip,
            unroll: self.unroll,
            dyn_impl: self.dyn_impl,
            dyn_free: self.dyn_free,
            rep_impl: self.rep_impl,
            rep_free: self.rep_free,
            activation: self.activation,
        })
    }
}

/// Recurrent stochastic state-space model.
#[derive(Module, Debug)]
pub struct Rssm<B: Backend> {
    img_in: Linear<B>,
    img_in_norm: LayerNorm<B>,
    cell: GatedCell<B>,
    img_out: Linear<B>,
    img_out_norm: LayerNorm<B>,
    obs_out: Linear<B>,
    obs_out_norm: LayerNorm<B>,
    img_stats: Linear<B>,
    obs_stats: Linear<B>,
    /// Learned initial deterministic state; `None` for the zero initial.
    initial_deter: Option<Param<Tensor<B, 1>>>,
    #[module(skip)]
    latent: LatentSpec,
    #[module(skip)]
    deter: usize,
    #[module(skip)]
    action: usize,
    #[module(skip)]
    embed: usize,
    #[module(skip)]
    context: Option<ContextWiring>,
    #[module(skip)]
    unimix: f32,
    #[module(skip)]
    action_clip: f32,
    #[module(skip)]
    unroll: usize,
    #[module(skip)]
    dyn_impl: DynLossImpl,
    #[module(skip)]
    dyn_free: f32,
    #[module(skip)]
    rep_impl: RepLossImpl,
    #[module(skip)]
    rep_free: f32,
    #[module(skip)]
    activation: Activation,
}

impl<B: Backend> Rssm<B> {
    pub fn latent_spec(&self) -> LatentSpec {
        self.latent
    }

    pub fn deter_size(&self) -> usize {
        self.deter
    }

    pub fn action_size(&self) -> usize {
        self.action
    }

    pub fn context_wiring(&self) -> Option<ContextWiring> {
        self.context
    }

    /// Width of the feature vector `[deter, stoch_flat]` consumed by heads.
    pub fn feature_size(&self) -> usize {
        self.deter + self.latent.flat_size()
    }

    fn device(&self) -> B::Device {
        self.img_in.weight.val().device()
    }

    /// Initial latent state, broadcast over the batch.
    ///
    /// With the learned initial, the deterministic vector is the tanh of a
    /// trained parameter and the stochastic value is the mode of the prior
    /// statistics path; the statistics fields themselves stay at their
    /// zero-information defaults.
    pub fn initial(&self, batch: usize) -> LatentState<B> {
        let device = self.device();
        let zero_stoch = match self.latent {
            LatentSpec::Categorical { vars, classes } => StochState::Categorical {
                logit: Tensor::zeros([batch, vars, classes], &device),
                stoch: Tensor::zeros([batch, vars, classes], &device),
            },
            LatentSpec::Gaussian { size } => StochState::Gaussian {
                mean: Tensor::zeros([batch, size], &device),
                std: Tensor::ones([batch, size], &device),
                stoch: Tensor::zeros([batch, size], &device),
            },
        };

        match &self.initial_deter {
            None => LatentState {
                deter: Tensor::zeros([batch, self.deter], &device),
                stoch: zero_stoch,
            },
            Some(param) => {
                let deter: Tensor<B, 2> = param
                    .val()
                    .tanh()
                    .reshape([1, self.deter])
                    .repeat_dim(0, batch);

                // The prior statistics path expects its context block when
                // post-recurrent injection is enabled; the initial state uses
                // a zero context there.
                let mut x = deter.clone();
                if let Some(ctx) = &self.context {
                    if ctx.after_deter {
                        x = Tensor::cat(vec![x, Tensor::zeros([batch, ctx.size], &device)], 1);
                    }
                }
                let stats = self.prior_stats(x);
                let mode = stats.mode();

                let stoch = match (zero_stoch, mode) {
                    (
                        StochState::Categorical { logit, .. },
                        StochState::Categorical { stoch, .. },
                    ) => StochState::Categorical { logit, stoch },
                    (
                        StochState::Gaussian { mean, std, .. },
                        StochState::Gaussian { stoch, .. },
                    ) => StochState::Gaussian { mean, std, stoch },
                    _ => unreachable!("initial stochastic mode mismatch"),
                };

                LatentState { deter, stoch }
            }
        }
    }

    /// Soft element-wise action clip: scales oversized actions down toward the
    /// bound without saturating, keeping gradients defined everywhere. The
    /// scale factor itself is detached.
    fn clip_action(&self, action: Tensor<B, 2>) -> Tensor<B, 2> {
        if self.action_clip <= 0.0 {
            return action;
        }
        let scale = action.clone().abs().clamp_min(self.action_clip).recip() * self.action_clip;
        action * scale.detach()
    }

    fn check_context(&self, batch: usize, context: Option<&Tensor<B, 2>>) {
        match (&self.context, context) {
            (Some(wiring), Some(ctx)) => {
                assert_eq!(
                    ctx.dims(),
                    [batch, wiring.size],
                    "context shape does not match configured wiring"
                );
            }
            (None, None) => {}
            (Some(_), None) => panic!("context is enabled but was not supplied"),
            (None, Some(_)) => panic!("context supplied but not enabled in configuration"),
        }
    }

    /// Prior statistics from the post-recurrent features (context already
    /// concatenated by the caller when wired).
    fn prior_stats(&self, x: Tensor<B, 2>) -> StochStats<B> {
        let x = self.activation.apply(self.img_out_norm.forward(self.img_out.forward(x)));
        StochStats::from_raw(self.latent, self.unimix, self.img_stats.forward(x))
    }

    /// Prior transition: advance the recurrent state from the previous latent
    /// and action, without an observation.
    pub fn img_step(
        &self,
        prev: &LatentState<B>,
        prev_action: Tensor<B, 2>,
        context: Option<&Tensor<B, 2>>,
        rng: &mut LatentRng,
    ) -> LatentState<B> {
        let batch = prev.batch_size();
        assert_eq!(prev_action.dims(), [batch, self.action], "action shape mismatch");
        self.check_context(batch, context);

        let action = self.clip_action(prev_action);

        let mut parts = vec![prev.stoch.flat(), action];
        if let Some(ctx) = context {
            parts.push(ctx.clone());
        }
        let x = Tensor::cat(parts, 1);
        let x = self.activation.apply(self.img_in_norm.forward(self.img_in.forward(x)));

        let deter = self.cell.step(x, prev.deter.clone());

        let mut y = deter.clone();
        if let (Some(wiring), Some(ctx)) = (&self.context, context) {
            if wiring.after_deter {
                y = Tensor::cat(vec![y, ctx.clone()], 1);
            }
        }
        let stats = self.prior_stats(y);
        let stoch = stats.sample(rng);

        LatentState { deter, stoch }
    }

    /// Posterior transition: reset first steps, run the prior, then correct
    /// the stochastic component with the observation embedding.
    ///
    /// Returns `(posterior, prior)`; the posterior shares the prior's
    /// deterministic state.
    pub fn obs_step(
        &self,
        prev: &LatentState<B>,
        prev_action: Tensor<B, 2>,
        embed: Tensor<B, 2>,
        is_first: Tensor<B, 1>,
        context: Option<&Tensor<B, 2>>,
        rng: &mut LatentRng,
    ) -> (LatentState<B>, LatentState<B>) {
        let batch = prev.batch_size();
        assert_eq!(embed.dims(), [batch, self.embed], "embedding shape mismatch");
        assert_eq!(is_first.dims(), [batch], "is_first shape mismatch");

        // Per-element episode reset: zero the carried state and action where
        // is_first is set, and splice in a fresh initial state there.
        let keep = Tensor::ones_like(&is_first) - is_first.clone();
        let action = mask(prev_action, &keep);
        let prev = prev.mask(&keep).add(&self.initial(batch).mask(&is_first));

        let prior = self.img_step(&prev, action, context, rng);

        let mut parts = vec![prior.deter.clone(), embed];
        if let (Some(wiring), Some(ctx)) = (&self.context, context) {
            if wiring.posterior {
                parts.push(ctx.clone());
            }
        }
        let x = Tensor::cat(parts, 1);
        let x = self.activation.apply(self.obs_out_norm.forward(self.obs_out.forward(x)));
        let stats = StochStats::from_raw(self.latent, self.unimix, self.obs_stats.forward(x));
        let stoch = stats.sample(rng);

        let post = LatentState { deter: prior.deter.clone(), stoch };
        (post, prior)
    }

    /// Scan `obs_step` across a `[batch, time, ..]` sequence.
    ///
    /// Returns the per-timestep posterior and prior sequences. `unroll` only
    /// chunks the iteration; the carry threads through chunk boundaries
    /// unchanged, so results are identical for every chunk size.
    pub fn observe(
        &self,
        embed: Tensor<B, 3>,
        action: Tensor<B, 3>,
        is_first: Tensor<B, 2>,
        state: Option<LatentState<B>>,
        context: Option<&Tensor<B, 3>>,
        rng: &mut LatentRng,
    ) -> (Vec<LatentState<B>>, Vec<LatentState<B>>) {
        let [batch, steps, _] = embed.dims();
        assert_eq!(action.dims(), [batch, steps, self.action], "action sequence shape mismatch");
        assert_eq!(is_first.dims(), [batch, steps], "is_first sequence shape mismatch");

        let mut carry = state.unwrap_or_else(|| self.initial(batch));
        let mut post_seq = Vec::with_capacity(steps);
        let mut prior_seq = Vec::with_capacity(steps);

        let mut start = 0;
        while start < steps {
            let end = (start + self.unroll).min(steps);
            for t in start..end {
                let embed_t: Tensor<B, 2> = embed
                    .clone()
                    .slice([0..batch, t..t + 1, 0..self.embed])
                    .reshape([batch, self.embed]);
                let action_t: Tensor<B, 2> = action
                    .clone()
                    .slice([0..batch, t..t + 1, 0..self.action])
                    .reshape([batch, self.action]);
                let first_t: Tensor<B, 1> = is_first
                    .clone()
                    .slice([0..batch, t..t + 1])
                    .reshape([batch]);
                let ctx_t: Option<Tensor<B, 2>> = context.map(|c| {
                    let size = c.dims()[2];
                    c.clone().slice([0..batch, t..t + 1, 0..size]).reshape([batch, size])
                });

                let (post, prior) =
                    self.obs_step(&carry, action_t, embed_t, first_t, ctx_t.as_ref(), rng);
                carry = post.clone();
                post_seq.push(post);
                prior_seq.push(prior);
            }
            start = end;
        }

        (post_seq, prior_seq)
    }

    /// Scan `img_step` across a `[batch, time, action]` sequence of actions.
    pub fn imagine(
        &self,
        action: Tensor<B, 3>,
        state: Option<LatentState<B>>,
        context: Option<&Tensor<B, 3>>,
        rng: &mut LatentRng,
    ) -> Vec<LatentState<B>> {
        let [batch, steps, width] = action.dims();
        assert_eq!(width, self.action, "action sequence width mismatch");

        let mut carry = state.unwrap_or_else(|| self.initial(batch));
        let mut prior_seq = Vec::with_capacity(steps);

        for t in 0..steps {
            let action_t: Tensor<B, 2> = action
                .clone()
                .slice([0..batch, t..t + 1, 0..self.action])
                .reshape([batch, self.action]);
            let ctx_t: Option<Tensor<B, 2>> = context.map(|c| {
                let size = c.dims()[2];
                c.clone().slice([0..batch, t..t + 1, 0..size]).reshape([batch, size])
            });

            let prior = self.img_step(&carry, action_t, ctx_t.as_ref(), rng);
            carry = prior.clone();
            prior_seq.push(prior);
        }

        prior_seq
    }

    /// Dynamics loss `[batch, time]`: the prior learns to predict the
    /// posterior. Gradient is stopped through the posterior, and the raw
    /// divergence is floored at the free-bits threshold.
    pub fn dyn_loss(&self, post: &[LatentState<B>], prior: &[LatentState<B>]) -> Tensor<B, 2> {
        assert_eq!(post.len(), prior.len(), "posterior/prior sequence length mismatch");
        let per_step: Vec<Tensor<B, 1>> = post
            .iter()
            .zip(prior.iter())
            .map(|(po, pr)| {
                let loss = match self.dyn_impl {
                    DynLossImpl::Kl => po.stats().detach().kl(&pr.stats()),
                    DynLossImpl::LogProb => -pr.stats().log_prob(&po.stoch.detach()),
                };
                self.apply_free(loss, self.dyn_free)
            })
            .collect();
        Tensor::stack(per_step, 1)
    }

    /// Representation loss `[batch, time]`: the posterior learns to stay
    /// predictable. Gradient is stopped through the prior.
    pub fn rep_loss(&self, post: &[LatentState<B>], prior: &[LatentState<B>]) -> Tensor<B, 2> {
        assert_eq!(post.len(), prior.len(), "posterior/prior sequence length mismatch");
        let per_step: Vec<Tensor<B, 1>> = post
            .iter()
            .zip(prior.iter())
            .map(|(po, pr)| {
                let loss = match self.rep_impl {
                    RepLossImpl::Kl => po.stats().kl(&pr.stats().detach()),
                    RepLossImpl::Uniform => po.stats().kl(&po.stats().uniform_like()),
                    RepLossImpl::Entropy => -po.stats().entropy(),
                    RepLossImpl::None => Tensor::zeros([po.batch_size()], &self.device()),
                };
                self.apply_free(loss, self.rep_free)
            })
            .collect();
        Tensor::stack(per_step, 1)
    }

    /// Free-bits floor: below `free` nats the loss is constant and produces
    /// no gradient.
    fn apply_free(&self, loss: Tensor<B, 1>, free: f32) -> Tensor<B, 1> {
        if free > 0.0 {
            loss.clamp_min(free)
        } else {
            loss
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    const CAT: LatentSpec = LatentSpec::Categorical { vars: 4, classes: 6 };
    const GAUSS: LatentSpec = LatentSpec::Gaussian { size: 5 };

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    fn rssm(latent: LatentSpec) -> Rssm<B> {
        RssmConfig::new(16, latent, 3, 8)
            .with_hidden(16)
            .init(&device())
            .unwrap()
    }

    fn assert_close(a: &Tensor<B, 2>, b: &Tensor<B, 2>, tol: f32) {
        let a = a.clone().into_data();
        let b = b.clone().into_data();
        let a = a.as_slice::<f32>().unwrap();
        let b = b.as_slice::<f32>().unwrap();
        assert_eq!(a.len(), b.len());
        for (x, y) in a.iter().zip(b.iter()) {
            assert!((x - y).abs() <= tol, "{} vs {}", x, y);
        }
    }

    #[test]
    fn test_initial_shapes_categorical() {
        let model = rssm(CAT);
        for batch in [1, 2, 7] {
            let state = model.initial(batch);
            assert_eq!(state.deter.dims(), [batch, 16]);
            let StochState::Categorical { logit, stoch } = &state.stoch else {
                panic!("expected categorical state");
            };
            assert_eq!(logit.dims(), [batch, 4, 6]);
            assert_eq!(stoch.dims(), [batch, 4, 6]);
        }
    }

    #[test]
    fn test_initial_shapes_gaussian() {
        let model = rssm(GAUSS);
        let state = model.initial(3);
        assert_eq!(state.deter.dims(), [3, 16]);
        let StochState::Gaussian { mean, std, stoch } = &state.stoch else {
            panic!("expected gaussian state");
        };
        assert_eq!(mean.dims(), [3, 5]);
        assert_eq!(std.dims(), [3, 5]);
        assert_eq!(stoch.dims(), [3, 5]);
    }

    #[test]
    fn test_learned_initial_broadcasts_identical_rows() {
        let model = rssm(CAT);
        let state = model.initial(3);
        let data = state.deter.into_data();
        let rows = data.as_slice::<f32>().unwrap();
        assert_eq!(&rows[0..16], &rows[16..32]);
        assert_eq!(&rows[0..16], &rows[32..48]);
    }

    #[test]
    fn test_img_step_deterministic_given_seed() {
        let model = rssm(CAT);
        let prev = model.initial(2);
        let action: Tensor<B, 2> = Tensor::ones([2, 3], &device());

        let a = model.img_step(&prev, action.clone(), None, &mut LatentRng::seed_from_u64(5));
        let b = model.img_step(&prev, action, None, &mut LatentRng::seed_from_u64(5));

        assert_close(&a.deter, &b.deter, 0.0);
        assert_close(&a.stoch.flat(), &b.stoch.flat(), 0.0);
    }

    #[test]
    fn test_obs_step_full_reset_ignores_prev_state() {
        let model = rssm(CAT);
        let batch = 2;
        let embed: Tensor<B, 2> = Tensor::ones([batch, 8], &device());
        let is_first: Tensor<B, 1> = Tensor::ones([batch], &device());

        // Two different garbage carries; with is_first all set, both the carry
        // and the carried action are zeroed, so outputs must coincide.
        let garbage_a = LatentState {
            deter: Tensor::ones([batch, 16], &device()) * 123.0,
            stoch: StochState::Categorical {
                logit: Tensor::ones([batch, 4, 6], &device()) * -7.0,
                stoch: Tensor::ones([batch, 4, 6], &device()),
            },
        };
        let garbage_b = LatentState {
            deter: Tensor::ones([batch, 16], &device()) * -55.0,
            stoch: StochState::Categorical {
                logit: Tensor::ones([batch, 4, 6], &device()) * 9.0,
                stoch: Tensor::ones([batch, 4, 6], &device()) * 0.5,
            },
        };
        let action_a: Tensor<B, 2> = Tensor::ones([batch, 3], &device()) * 4.0;
        let action_b: Tensor<B, 2> = Tensor::ones([batch, 3], &device()) * -2.0;

        let (post_a, prior_a) = model.obs_step(
            &garbage_a,
            action_a,
            embed.clone(),
            is_first.clone(),
            None,
            &mut LatentRng::seed_from_u64(11),
        );
        let (post_b, prior_b) = model.obs_step(
            &garbage_b,
            action_b,
            embed,
            is_first,
            None,
            &mut LatentRng::seed_from_u64(11),
        );

        assert_close(&post_a.deter, &post_b.deter, 1e-6);
        assert_close(&post_a.stoch.flat(), &post_b.stoch.flat(), 1e-6);
        assert_close(&prior_a.stoch.flat(), &prior_b.stoch.flat(), 1e-6);
    }

    #[test]
    fn test_posterior_shares_prior_deter() {
        let model = rssm(GAUSS);
        let prev = model.initial(2);
        let (post, prior) = model.obs_step(
            &prev,
            Tensor::zeros([2, 3], &device()),
            Tensor::ones([2, 8], &device()),
            Tensor::zeros([2], &device()),
            None,
            &mut LatentRng::seed_from_u64(0),
        );
        assert_close(&post.deter, &prior.deter, 0.0);
    }

    #[test]
    fn test_losses_floored_at_free_bits() {
        let model = rssm(CAT);
        let mut rng = LatentRng::seed_from_u64(1);
        let prev = model.initial(3);
        let prior = model.img_step(&prev, Tensor::zeros([3, 3], &device()), None, &mut rng);
        let post = prior.clone();

        // post == prior: true divergence is zero, loss must equal the floor.
        let dyn_loss = model.dyn_loss(&[post.clone()], &[prior.clone()]);
        let rep_loss = model.rep_loss(&[post], &[prior]);
        for v in dyn_loss.into_data().as_slice::<f32>().unwrap() {
            assert!((v - 1.0).abs() < 1e-6, "dyn loss {} != free floor", v);
        }
        for v in rep_loss.into_data().as_slice::<f32>().unwrap() {
            assert!((v - 1.0).abs() < 1e-6, "rep loss {} != free floor", v);
        }
    }

    #[test]
    fn test_losses_never_below_floor() {
        let model = rssm(GAUSS);
        let mut rng = LatentRng::seed_from_u64(2);
        let embed: Tensor<B, 3> = Tensor::ones([2, 4, 8], &device());
        let action: Tensor<B, 3> = Tensor::ones([2, 4, 3], &device());
        let mut first = vec![0.0f32; 8];
        first[0] = 1.0;
        first[4] = 1.0;
        let is_first: Tensor<B, 2> =
            Tensor::<B, 1>::from_floats(first.as_slice(), &device()).reshape([2, 4]);

        let (post, prior) = model.observe(embed, action, is_first, None, None, &mut rng);
        let dyn_loss = model.dyn_loss(&post, &prior);
        assert_eq!(dyn_loss.dims(), [2, 4]);
        for v in dyn_loss.into_data().as_slice::<f32>().unwrap() {
            assert!(*v >= 1.0 - 1e-6);
        }
    }

    #[test]
    fn test_observe_unroll_chunking_identical() {
        let seed = 77;
        let embed: Tensor<B, 3> = Tensor::ones([2, 5, 8], &device());
        let action: Tensor<B, 3> = Tensor::ones([2, 5, 3], &device()) * 0.3;
        let is_first: Tensor<B, 2> = Tensor::zeros([2, 5], &device());

        // One set of weights, scanned twice with different chunk sizes.
        let model = RssmConfig::new(16, CAT, 3, 8)
            .with_hidden(16)
            .with_unroll(1)
            .init::<B>(&device())
            .unwrap();
        let (post_a, _) = model.observe(
            embed.clone(),
            action.clone(),
            is_first.clone(),
            Some(model.initial(2)),
            None,
            &mut LatentRng::seed_from_u64(seed),
        );
        let chunked = Rssm { unroll: 3, ..model };
        let (post_b, _) = chunked.observe(
            embed.clone(),
            action.clone(),
            is_first.clone(),
            Some(chunked.initial(2)),
            None,
            &mut LatentRng::seed_from_u64(seed),
        );

        assert_eq!(post_a.len(), post_b.len());
        for (a, b) in post_a.iter().zip(post_b.iter()) {
            assert_close(&a.deter, &b.deter, 0.0);
            assert_close(&a.stoch.flat(), &b.stoch.flat(), 0.0);
        }
    }

    #[test]
    fn test_soft_action_clip_scales_down() {
        let model = RssmConfig::new(16, CAT, 3, 8)
            .with_hidden(16)
            .with_action_clip(1.0)
            .init::<B>(&device())
            .unwrap();
        let action: Tensor<B, 2> = Tensor::<B, 1>::from_floats([0.5, -3.0, 10.0], &device())
            .reshape([1, 3]);
        let clipped = model.clip_action(action).into_data();
        let clipped = clipped.as_slice::<f32>().unwrap();
        assert!((clipped[0] - 0.5).abs() < 1e-6); // inside the bound: unchanged
        assert!((clipped[1] + 1.0).abs() < 1e-6); // scaled onto the bound
        assert!((clipped[2] - 1.0).abs() < 1e-6);
    }

    #[test]
    #[should_panic(expected = "context is enabled but was not supplied")]
    fn test_missing_context_panics() {
        let model = RssmConfig::new(16, CAT, 3, 8)
            .with_hidden(16)
            .with_context(ContextWiring::everywhere(4))
            .init::<B>(&device())
            .unwrap();
        let prev = model.initial(1);
        let _ = model.img_step(
            &prev,
            Tensor::zeros([1, 3], &device()),
            None,
            &mut LatentRng::seed_from_u64(0),
        );
    }

    #[test]
    #[should_panic(expected = "context supplied but not enabled")]
    fn test_unexpected_context_panics() {
        let model = rssm(CAT);
        let prev = model.initial(1);
        let ctx: Tensor<B, 2> = Tensor::zeros([1, 4], &device());
        let _ = model.img_step(
            &prev,
            Tensor::zeros([1, 3], &device()),
            Some(&ctx),
            &mut LatentRng::seed_from_u64(0),
        );
    }

    #[test]
    fn test_context_injection_all_points() {
        let model = RssmConfig::new(16, CAT, 3, 8)
            .with_hidden(16)
            .with_context(ContextWiring::everywhere(4))
            .init::<B>(&device())
            .unwrap();
        let prev = model.initial(2);
        let ctx: Tensor<B, 2> = Tensor::ones([2, 4], &device());
        let mut rng = LatentRng::seed_from_u64(3);

        let prior = model.img_step(&prev, Tensor::zeros([2, 3], &device()), Some(&ctx), &mut rng);
        assert_eq!(prior.deter.dims(), [2, 16]);

        let (post, _) = model.obs_step(
            &prev,
            Tensor::zeros([2, 3], &device()),
            Tensor::ones([2, 8], &device()),
            Tensor::zeros([2], &device()),
            Some(&ctx),
            &mut rng,
        );
        assert_eq!(post.stoch.flat().dims(), [2, 24]);
    }

    #[test]
    fn test_config_validation() {
        assert!(RssmConfig::new(0, CAT, 3, 8).validate().is_err());
        assert!(RssmConfig::new(16, CAT, 0, 8).validate().is_err());
        assert!(RssmConfig::new(16, CAT, 3, 8).with_unimix(1.5).validate().is_err());
        assert!(RssmConfig::new(16, CAT, 3, 8).with_unroll(0).validate().is_err());
        assert!(RssmConfig::new(16, CAT, 3, 8)
            .with_context(ContextWiring::input_only(0))
            .validate()
            .is_err());
        assert!(RssmConfig::new(16, CAT, 3, 8).validate().is_ok());
    }

    #[test]
    fn test_flatten_action() {
        let action: Tensor<B, 3> = Tensor::zeros([2, 3, 4], &device());
        assert_eq!(flatten_action(action).dims(), [2, 12]);
    }
}
