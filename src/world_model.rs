//! World model facade: the RSSM plus reward/continuation heads and the
//! optional context channel, behind the contracts the training loop and the
//! actor-critic code consume.
//!
//! Observation encoding and decoding stay upstream: the batch carries
//! precomputed embeddings, and reconstruction likelihoods come through the
//! [`FeatureDecoder`] boundary.

use burn::module::Module;
use burn::optim::{GradientsParams, Optimizer};
use burn::tensor::activation::{log_sigmoid, sigmoid};
use burn::tensor::backend::{AutodiffBackend, Backend};
use burn::tensor::Tensor;

use crate::config::ConfigError;
use crate::context::{ContextProvider, CtxEncoder, CtxEncoderConfig, CtxWindow};
use crate::imagination::roller::{self, ImagStart, ImaginedTrajectory};
use crate::latent::{LatentRng, LatentState};
use crate::metrics::Metrics;
use crate::nn::{Mlp, MlpConfig};
use crate::rssm::{Rssm, RssmConfig};

/// One training batch of real experience, `[batch, time, ..]`.
///
/// Observations are already preprocessed and embedded upstream;
/// `cont = 1 - is_terminal` is computed upstream as well.
#[derive(Debug, Clone)]
pub struct TrainBatch<B: Backend> {
    pub obs: Tensor<B, 3>,
    pub embed: Tensor<B, 3>,
    pub action: Tensor<B, 3>,
    pub reward: Tensor<B, 2>,
    pub is_first: Tensor<B, 2>,
    pub cont: Tensor<B, 2>,
    /// Upstream context signal; required iff the RSSM is context-wired
    /// without a learned encoder.
    pub context: Option<Tensor<B, 3>>,
}

/// Carry threaded between consecutive training batches.
#[derive(Debug, Clone)]
pub struct WorldModelState<B: Backend> {
    pub latent: LatentState<B>,
    pub prev_action: Tensor<B, 2>,
}

/// Black-box decoder boundary: turns per-step features into per-step
/// reconstruction negative log-likelihoods.
pub trait FeatureDecoder<B: Backend> {
    /// Returns `[batch, time]`; one NLL per step, summed over observation
    /// keys.
    fn nll(&self, features: &[Tensor<B, 2>], batch: &TrainBatch<B>) -> Tensor<B, 2>;
}

/// Relative weights of the world-model loss terms.
#[derive(Module, Debug, Clone, Copy)]
pub struct LossScales {
    pub dynamics: f32,
    pub representation: f32,
    pub reward: f32,
    pub cont: f32,
    pub decoder: f32,
    pub context: f32,
}

impl Default for LossScales {
    fn default() -> Self {
        Self {
            dynamics: 0.5,
            representation: 0.1,
            reward: 1.0,
            cont: 1.0,
            decoder: 1.0,
            context: 1.0,
        }
    }
}

/// Configuration for [`WorldModel`].
#[derive(Debug, Clone)]
pub struct WorldModelConfig {
    pub rssm: RssmConfig,
    /// Learned context encoder; `None` means any configured context comes
    /// from the upstream signal.
    pub ctx_encoder: Option<CtxEncoderConfig>,
    pub scales: LossScales,
    /// Hidden width/depth of the reward and continuation heads.
    pub head_hidden: usize,
    pub head_layers: usize,
    /// Imagination discount factor.
    pub discount: f32,
    /// Lambda-return mixing parameter.
    pub return_lambda: f32,
}

impl WorldModelConfig {
    pub fn new(rssm: RssmConfig) -> Self {
        Self {
            rssm,
            ctx_encoder: None,
            scales: LossScales::default(),
            head_hidden: 256,
            head_layers: 2,
            discount: 0.997,
            return_lambda: 0.95,
        }
    }

    pub fn with_ctx_encoder(mut self, ctx_encoder: CtxEncoderConfig) -> Self {
        self.ctx_encoder = Some(ctx_encoder);
        self
    }

    pub fn with_scales(mut self, scales: LossScales) -> Self {
        self.scales = scales;
        self
    }

    pub fn with_heads(mut self, hidden: usize, layers: usize) -> Self {
        self.head_hidden = hidden;
        self.head_layers = layers;
        self
    }

    pub fn with_discount(mut self, discount: f32) -> Self {
        self.discount = discount;
        self
    }

    pub fn with_return_lambda(mut self, return_lambda: f32) -> Self {
        self.return_lambda = return_lambda;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.rssm.validate()?;
        if self.head_hidden == 0 {
            return Err(ConfigError::InvalidCount {
                field: "world_model.head_hidden",
                value: self.head_hidden,
            });
        }
        if !(0.0..=1.0).contains(&self.discount) || self.discount == 0.0 {
            return Err(ConfigError::OutOfRange {
                field: "world_model.discount",
                value: self.discount,
                min: 0.0,
                max: 1.0,
            });
        }
        if !(0.0..=1.0).contains(&self.return_lambda) {
            return Err(ConfigError::OutOfRange {
                field: "world_model.return_lambda",
                value: self.return_lambda,
                min: 0.0,
                max: 1.0,
            });
        }
        if let Some(ctx) = &self.ctx_encoder {
            ctx.validate()?;
            let wiring = self
                .rssm
                .context
                .ok_or(ConfigError::ContextNotEnabled { field: "world_model.ctx_encoder" })?;
            if ctx.context_size != wiring.size {
                return Err(ConfigError::Mismatch {
                    field: "ctx_encoder.context_size",
                    expected: wiring.size,
                    actual: ctx.context_size,
                });
            }
        }
        Ok(())
    }

    /// Initialize the model.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<WorldModel<B>, ConfigError> {
        self.validate()?;

        let rssm = self.rssm.init(device)?;
        let ctx_size = self.rssm.context.map(|c| c.size).unwrap_or(0);
        let head_input = rssm.feature_size() + ctx_size;

        let head = |out| {
            MlpConfig::new(head_input, out)
                .with_hidden(self.head_hidden)
                .with_layers(self.head_layers)
                .init(device)
        };

        let ctx_encoder = match &self.ctx_encoder {
            Some(config) => Some(config.init(device)?),
            None => None,
        };

        Ok(WorldModel {
            rssm,
            reward_head: head(1),
            cont_head: head(1),
            ctx_encoder,
            scales: self.scales,
            discount: self.discount,
            return_lambda: self.return_lambda,
        })
    }
}

/// Per-step loss tensors and latent sequences from one `loss` call.
#[derive(Debug, Clone)]
pub struct LossOutput<B: Backend> {
    pub post: Vec<LatentState<B>>,
    pub prior: Vec<LatentState<B>>,
    pub dyn_loss: Tensor<B, 2>,
    pub rep_loss: Tensor<B, 2>,
    pub reward_loss: Tensor<B, 2>,
    pub cont_loss: Tensor<B, 2>,
    pub decoder_loss: Tensor<B, 2>,
    pub ctx_loss: Option<Tensor<B, 2>>,
}

/// World model: RSSM, reward and continuation heads, optional learned
/// context encoder.
#[derive(Module, Debug)]
pub struct WorldModel<B: Backend> {
    rssm: Rssm<B>,
    reward_head: Mlp<B>,
    cont_head: Mlp<B>,
    ctx_encoder: Option<CtxEncoder<B>>,
    #[module(skip)]
    scales: LossScales,
    #[module(skip)]
    discount: f32,
    #[module(skip)]
    return_lambda: f32,
}

impl<B: Backend> WorldModel<B> {
    pub fn rssm(&self) -> &Rssm<B> {
        &self.rssm
    }

    pub fn discount(&self) -> f32 {
        self.discount
    }

    pub fn return_lambda(&self) -> f32 {
        self.return_lambda
    }

    /// Predicted reward per batch element for one step's features.
    pub fn predict_reward(&self, features: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = features.dims();
        self.reward_head.forward(features).reshape([batch])
    }

    /// Predicted continuation probability for one step's features.
    pub fn predict_cont(&self, features: Tensor<B, 2>) -> Tensor<B, 1> {
        let [batch, _] = features.dims();
        sigmoid(self.cont_head.forward(features)).reshape([batch])
    }

    /// Initial carry: fresh latent state and a zero previous action.
    pub fn initial(&self, batch: usize) -> WorldModelState<B> {
        let latent = self.rssm.initial(batch);
        let device = latent.deter.device();
        WorldModelState {
            latent,
            prev_action: Tensor::zeros([batch, self.rssm.action_size()], &device),
        }
    }

    /// Resolve the per-timestep context sequence for a batch, or `None` when
    /// the model carries no context channel. The learned context is
    /// stop-gradient'd here: only its own auxiliary losses train the encoder.
    fn resolve_context(&self, batch: &TrainBatch<B>, steps: usize) -> Option<Tensor<B, 3>> {
        match (self.rssm.context_wiring(), &self.ctx_encoder) {
            (None, _) => {
                assert!(
                    batch.context.is_none(),
                    "batch carries a context signal but the model is not context-wired"
                );
                None
            }
            (Some(_), Some(encoder)) => {
                let window = CtxWindow {
                    obs: batch.obs.clone(),
                    action: batch.action.clone(),
                    embed: encoder.uses_embed().then(|| batch.embed.clone()),
                };
                let provider = ContextProvider::Learned { encoder, window };
                Some(provider.provide(steps).detach())
            }
            (Some(_), None) => {
                let signal = batch
                    .context
                    .as_ref()
                    .expect("model is context-wired but the batch carries no context signal");
                Some(ContextProvider::Passthrough(signal.clone()).provide(steps))
            }
        }
    }

    /// World-model loss over a batch of real experience.
    ///
    /// Returns the scalar training loss and `(new carry, per-step losses,
    /// metrics)`. The carry advances to the last posterior and last action,
    /// detached from this step's graph.
    pub fn loss<D: FeatureDecoder<B>>(
        &self,
        batch: &TrainBatch<B>,
        state: WorldModelState<B>,
        decoder: &D,
        rng: &mut LatentRng,
    ) -> (Tensor<B, 1>, (WorldModelState<B>, LossOutput<B>, Metrics)) {
        let [batch_size, steps, action_width] = batch.action.dims();
        assert_eq!(batch.reward.dims(), [batch_size, steps], "reward shape mismatch");
        assert_eq!(batch.is_first.dims(), [batch_size, steps], "is_first shape mismatch");
        assert_eq!(batch.cont.dims(), [batch_size, steps], "cont shape mismatch");

        // Shift actions: step t is driven by the action taken before it.
        let prev_actions = Tensor::cat(
            vec![
                state.prev_action.clone().reshape([batch_size, 1, action_width]),
                batch.action.clone().slice([0..batch_size, 0..steps - 1, 0..action_width]),
            ],
            1,
        );

        let ctx_seq = self.resolve_context(batch, steps);

        let (post, prior) = self.rssm.observe(
            batch.embed.clone(),
            prev_actions,
            batch.is_first.clone(),
            Some(state.latent.clone()),
            ctx_seq.as_ref(),
            rng,
        );

        // Per-step head features, with the context attached when active.
        let features: Vec<Tensor<B, 2>> = post
            .iter()
            .enumerate()
            .map(|(t, s)| {
                let ctx_t = ctx_seq.as_ref().map(|c| {
                    let size = c.dims()[2];
                    c.clone().slice([0..batch_size, t..t + 1, 0..size]).reshape([batch_size, size])
                });
                s.features(ctx_t.as_ref())
            })
            .collect();

        let dyn_loss = self.rssm.dyn_loss(&post, &prior);
        let rep_loss = self.rssm.rep_loss(&post, &prior);

        let reward_pred: Tensor<B, 2> = Tensor::stack(
            features.iter().map(|f| self.predict_reward(f.clone())).collect::<Vec<_>>(),
            1,
        );
        let reward_loss = (reward_pred - batch.reward.clone()).powf_scalar(2.0) * 0.5;

        let cont_logit: Tensor<B, 2> = Tensor::stack(
            features
                .iter()
                .map(|f| {
                    let [b, _] = f.dims();
                    self.cont_head.forward(f.clone()).reshape([b])
                })
                .collect::<Vec<_>>(),
            1,
        );
        let cont_loss = -(batch.cont.clone() * log_sigmoid(cont_logit.clone())
            + (Tensor::ones_like(&batch.cont) - batch.cont.clone())
                * log_sigmoid(-cont_logit));

        let decoder_loss = decoder.nll(&features, batch);
        assert_eq!(
            decoder_loss.dims(),
            [batch_size, steps],
            "decoder loss shape does not match the batch"
        );

        let ctx_loss = self.ctx_encoder.as_ref().map(|encoder| {
            let window = CtxWindow {
                obs: batch.obs.clone(),
                action: batch.action.clone(),
                embed: encoder.uses_embed().then(|| batch.embed.clone()),
            };
            encoder.incremental_loss(
                &self.rssm,
                &window,
                &batch.embed,
                &batch.is_first,
                (state.latent.clone(), state.prev_action.clone()),
                rng,
            )
        });

        let mut total: Tensor<B, 2> = dyn_loss.clone() * self.scales.dynamics
            + rep_loss.clone() * self.scales.representation
            + reward_loss.clone() * self.scales.reward
            + cont_loss.clone() * self.scales.cont
            + decoder_loss.clone() * self.scales.decoder;
        if let Some(ctx) = &ctx_loss {
            total = total + ctx.clone() * self.scales.context;
        }
        let model_loss = total.mean();

        // Carry: last posterior and last action, detached from this graph.
        let last_action: Tensor<B, 2> = batch
            .action
            .clone()
            .slice([0..batch_size, steps - 1..steps, 0..action_width])
            .reshape([batch_size, action_width]);
        let next_state = WorldModelState {
            latent: post.last().expect("non-empty sequence").detach(),
            prev_action: last_action.detach(),
        };

        let mut metrics = Metrics::new();
        metrics.tensor(
            "prior_ent",
            Tensor::stack::<2>(prior.iter().map(|s| s.stats().entropy()).collect::<Vec<_>>(), 1),
        );
        metrics.tensor(
            "post_ent",
            Tensor::stack::<2>(post.iter().map(|s| s.stats().entropy()).collect::<Vec<_>>(), 1),
        );
        metrics.tensor("dyn_loss", dyn_loss.clone());
        metrics.tensor("rep_loss", rep_loss.clone());
        metrics.tensor("reward_loss", reward_loss.clone());
        metrics.tensor("cont_loss", cont_loss.clone());
        metrics.tensor("decoder_loss", decoder_loss.clone());
        if let Some(ctx) = &ctx_loss {
            metrics.tensor("ctx_loss", ctx.clone());
        }
        metrics.tensor("model_loss", model_loss.clone());

        let output = LossOutput {
            post,
            prior,
            dyn_loss,
            rep_loss,
            reward_loss,
            cont_loss,
            decoder_loss,
            ctx_loss,
        };

        (model_loss, (next_state, output, metrics))
    }

    /// Roll the prior forward under a policy; the sole interface the
    /// actor-critic training code needs.
    pub fn imagine<P>(
        &self,
        policy: &mut P,
        start: ImagStart<B>,
        horizon: usize,
        rng: &mut LatentRng,
    ) -> ImaginedTrajectory<B>
    where
        P: FnMut(&LatentState<B>, Option<&Tensor<B, 2>>, &mut LatentRng) -> Tensor<B, 2>,
    {
        roller::imagine(&self.rssm, &self.cont_head, policy, start, horizon, self.discount, rng)
    }
}

impl<B: AutodiffBackend> WorldModel<B> {
    /// One gradient step on the world-model loss.
    pub fn train<D, O>(
        self,
        batch: &TrainBatch<B>,
        state: WorldModelState<B>,
        decoder: &D,
        optimizer: &mut O,
        lr: f64,
        rng: &mut LatentRng,
    ) -> (Self, WorldModelState<B>, Metrics)
    where
        D: FeatureDecoder<B>,
        O: Optimizer<Self, B>,
    {
        let (loss, (next_state, _output, metrics)) = self.loss(batch, state, decoder, rng);

        if let Some(value) = metrics.get("model_loss_mean") {
            log::debug!("world model step: loss={:.4}", value);
        }

        let grads = loss.backward();
        let grads = GradientsParams::from_grads(grads, &self);
        let model = optimizer.step(lr, self, grads);

        (model, next_state, metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{ContextWiring, LatentSpec};
    use burn::backend::{Autodiff, NdArray};

    type B = NdArray<f32>;
    type AB = Autodiff<NdArray<f32>>;

    const CAT: LatentSpec = LatentSpec::Categorical { vars: 4, classes: 6 };

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    /// Unit-Gaussian reconstruction of the raw observations from a linear
    /// readout is enough to exercise the boundary in tests.
    struct MseDecoder;

    impl<Bk: Backend> FeatureDecoder<Bk> for MseDecoder {
        fn nll(&self, features: &[Tensor<Bk, 2>], batch: &TrainBatch<Bk>) -> Tensor<Bk, 2> {
            let [batch_size, steps, _] = batch.obs.dims();
            assert_eq!(features.len(), steps);
            // Not a trained decoder; a zero NLL keeps the contract shape
            // without extra parameters.
            Tensor::zeros([batch_size, steps], &batch.obs.device())
        }
    }

    fn small_config() -> WorldModelConfig {
        WorldModelConfig::new(RssmConfig::new(16, CAT, 3, 8).with_hidden(16)).with_heads(16, 1)
    }

    fn batch(batch_size: usize, steps: usize) -> TrainBatch<B> {
        TrainBatch {
            obs: Tensor::ones([batch_size, steps, 5], &device()),
            embed: Tensor::ones([batch_size, steps, 8], &device()),
            action: Tensor::ones([batch_size, steps, 3], &device()) * 0.2,
            reward: Tensor::ones([batch_size, steps], &device()),
            is_first: {
                let mut first = vec![0.0f32; batch_size * steps];
                for b in 0..batch_size {
                    first[b * steps] = 1.0;
                }
                Tensor::<B, 1>::from_floats(first.as_slice(), &device())
                    .reshape([batch_size, steps])
            },
            cont: Tensor::ones([batch_size, steps], &device()),
            context: None,
        }
    }

    #[test]
    fn test_loss_shapes_and_carry() {
        let model = small_config().init::<B>(&device()).unwrap();
        let state = model.initial(2);
        let mut rng = LatentRng::seed_from_u64(0);

        let (loss, (next_state, output, metrics)) =
            model.loss(&batch(2, 4), state, &MseDecoder, &mut rng);

        assert_eq!(loss.dims(), [1]);
        assert_eq!(output.post.len(), 4);
        assert_eq!(output.prior.len(), 4);
        assert_eq!(output.dyn_loss.dims(), [2, 4]);
        assert_eq!(output.reward_loss.dims(), [2, 4]);
        assert!(output.ctx_loss.is_none());
        assert_eq!(next_state.prev_action.dims(), [2, 3]);
        assert!(metrics.get("model_loss_mean").is_some());
        assert!(metrics.get("prior_ent_mean").is_some());
    }

    #[test]
    fn test_loss_deterministic_given_seed() {
        let model = small_config().init::<B>(&device()).unwrap();
        let data = batch(2, 3);

        let (a, _) = model.loss(&data, model.initial(2), &MseDecoder, &mut LatentRng::seed_from_u64(9));
        let (b, _) = model.loss(&data, model.initial(2), &MseDecoder, &mut LatentRng::seed_from_u64(9));

        let a = a.into_data();
        let b = b.into_data();
        assert_eq!(a.as_slice::<f32>().unwrap(), b.as_slice::<f32>().unwrap());
    }

    #[test]
    #[should_panic(expected = "not context-wired")]
    fn test_context_free_model_rejects_context_signal() {
        let model = small_config().init::<B>(&device()).unwrap();
        let mut data = batch(1, 3);
        data.context = Some(Tensor::zeros([1, 3, 4], &device()));
        let _ = model.loss(&data, model.initial(1), &MseDecoder, &mut LatentRng::seed_from_u64(0));
    }

    #[test]
    fn test_passthrough_context_flows() {
        let config = WorldModelConfig::new(
            RssmConfig::new(16, CAT, 3, 8)
                .with_hidden(16)
                .with_context(ContextWiring::everywhere(4)),
        )
        .with_heads(16, 1);
        let model = config.init::<B>(&device()).unwrap();

        let mut data = batch(2, 3);
        data.context = Some(Tensor::ones([2, 3, 4], &device()));

        let (loss, (_, output, _)) =
            model.loss(&data, model.initial(2), &MseDecoder, &mut LatentRng::seed_from_u64(1));
        assert_eq!(loss.dims(), [1]);
        assert!(output.ctx_loss.is_none(), "passthrough context has no auxiliary loss");
    }

    #[test]
    fn test_learned_context_adds_aux_loss() {
        let config = WorldModelConfig::new(
            RssmConfig::new(16, CAT, 3, 8)
                .with_hidden(16)
                .with_context(ContextWiring::everywhere(8)),
        )
        .with_heads(16, 1)
        .with_ctx_encoder(
            CtxEncoderConfig::new(5, 3, 4, 8).with_units(16).with_cross_modal(0.1, CAT.flat_size()),
        );
        let model = config.init::<B>(&device()).unwrap();

        let (_, (_, output, metrics)) = model.loss(
            &batch(2, 4),
            model.initial(2),
            &MseDecoder,
            &mut LatentRng::seed_from_u64(2),
        );
        let ctx_loss = output.ctx_loss.expect("learned context must produce an auxiliary loss");
        assert_eq!(ctx_loss.dims(), [2, 4]);
        assert!(metrics.get("ctx_loss_mean").is_some());
    }

    #[test]
    fn test_ctx_encoder_without_wiring_is_config_error() {
        let config = WorldModelConfig::new(RssmConfig::new(16, CAT, 3, 8).with_hidden(16))
            .with_ctx_encoder(CtxEncoderConfig::new(5, 3, 4, 8));
        assert!(matches!(
            config.validate(),
            Err(ConfigError::ContextNotEnabled { .. })
        ));
    }

    #[test]
    fn test_ctx_size_mismatch_is_config_error() {
        let config = WorldModelConfig::new(
            RssmConfig::new(16, CAT, 3, 8)
                .with_hidden(16)
                .with_context(ContextWiring::everywhere(4)),
        )
        .with_ctx_encoder(CtxEncoderConfig::new(5, 3, 4, 8));
        assert!(matches!(config.validate(), Err(ConfigError::Mismatch { .. })));
    }

    #[test]
    fn test_train_step_runs_on_autodiff_backend() {
        use burn::optim::AdamConfig;

        let model = small_config().init::<AB>(&device()).unwrap();
        let mut optimizer = AdamConfig::new().init();
        let state = model.initial(2);
        let mut rng = LatentRng::seed_from_u64(3);

        let data = TrainBatch::<AB> {
            obs: Tensor::ones([2, 3, 5], &device()),
            embed: Tensor::ones([2, 3, 8], &device()),
            action: Tensor::ones([2, 3, 3], &device()) * 0.2,
            reward: Tensor::ones([2, 3], &device()),
            is_first: Tensor::zeros([2, 3], &device()),
            cont: Tensor::ones([2, 3], &device()),
            context: None,
        };

        let (model, next_state, metrics) =
            model.train(&data, state, &MseDecoder, &mut optimizer, 1e-3, &mut rng);
        assert!(metrics.get("model_loss_mean").is_some());
        assert_eq!(next_state.latent.batch_size(), 2);

        // The updated model still runs.
        let _ = model.loss(&data, next_state, &MseDecoder, &mut rng);
    }

    #[test]
    fn test_imagine_through_facade() {
        let model = small_config().init::<B>(&device()).unwrap();
        let mut rng = LatentRng::seed_from_u64(4);
        let start = ImagStart {
            state: model.rssm().initial(2),
            is_terminal: Tensor::zeros([2], &device()),
            context: None,
        };
        let mut policy = |state: &LatentState<B>,
                          _ctx: Option<&Tensor<B, 2>>,
                          _rng: &mut LatentRng| {
            Tensor::zeros([state.batch_size(), 3], &device())
        };

        let traj = model.imagine(&mut policy, start, 4, &mut rng);
        assert_eq!(traj.horizon(), 4);
    }
}
