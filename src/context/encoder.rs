//! Learned context encoder.
//!
//! Reduces a window of recent observations and actions (optionally
//! embeddings) to a single context vector. The reducer is interchangeable
//! without changing the contract: window in, fixed-size vector out. The
//! encoder is trained only through its auxiliary objectives (a forward
//! and/or inverse dynamics loss, optionally a cross-modal probe loss against
//! the world model's stochastic state), never through the main RSSM loss.

use burn::module::Module;
use burn::nn::{LayerNorm, LayerNormConfig, Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::{AuxLossMode, ConfigError, ReducerKind};
use crate::latent::{LatentRng, LatentState};
use crate::nn::{symlog, Activation, GatedCell, GatedCellConfig, Mlp, MlpConfig, MultiHeadAttention, MultiHeadAttentionConfig};
use crate::rssm::Rssm;

/// Input window for the context encoder: `[batch, window, *]` slices of the
/// recent history.
#[derive(Debug, Clone)]
pub struct CtxWindow<B: Backend> {
    pub obs: Tensor<B, 3>,
    pub action: Tensor<B, 3>,
    /// Observation embeddings, present iff the encoder was configured with an
    /// embedding input.
    pub embed: Option<Tensor<B, 3>>,
}

impl<B: Backend> CtxWindow<B> {
    pub fn batch_size(&self) -> usize {
        self.obs.dims()[0]
    }

    pub fn len(&self) -> usize {
        self.obs.dims()[1]
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// The window truncated to its first `t` steps, left-padded back to the
    /// full length by repeating the earliest element.
    fn prefix_padded(&self, t: usize) -> Self {
        let pad = |x: &Tensor<B, 3>| {
            let [batch, steps, width] = x.dims();
            assert!(t >= 1 && t <= steps);
            let prefix = x.clone().slice([0..batch, 0..t, 0..width]);
            if t == steps {
                return prefix;
            }
            let edge = x.clone().slice([0..batch, 0..1, 0..width]).repeat_dim(1, steps - t);
            Tensor::cat(vec![edge, prefix], 1)
        };
        Self {
            obs: pad(&self.obs),
            action: pad(&self.action),
            embed: self.embed.as_ref().map(pad),
        }
    }
}

/// Cross-modal probe configuration.
#[derive(Debug, Clone, Copy)]
pub struct CrossModalConfig {
    /// Loss weight.
    pub weight: f32,
    /// Flattened width of the world model's stochastic state.
    pub latent_flat: usize,
}

/// Configuration for [`CtxEncoder`].
#[derive(Debug, Clone)]
pub struct CtxEncoderConfig {
    /// Observation width.
    pub obs: usize,
    /// Action width.
    pub action: usize,
    /// Embedding width, when embeddings join the window.
    pub embed: Option<usize>,
    /// Window length.
    pub window: usize,
    /// Output context width.
    pub context_size: usize,
    /// Hidden width of the reducer and auxiliary models.
    pub units: usize,
    /// Hidden layer count of the feed-forward reducer and auxiliary models.
    pub layers: usize,
    /// Attention heads for the attention/transformer reducers.
    pub heads: usize,
    pub reducer: ReducerKind,
    pub aux: AuxLossMode,
    pub cross_modal: Option<CrossModalConfig>,
    /// Apply symlog to the window features.
    pub symlog_inputs: bool,
    pub activation: Activation,
}

impl CtxEncoderConfig {
    pub fn new(obs: usize, action: usize, window: usize, context_size: usize) -> Self {
        Self {
            obs,
            action,
            embed: None,
            window,
            context_size,
            units: 128,
            layers: 2,
            heads: 4,
            reducer: ReducerKind::FeedForward,
            aux: AuxLossMode::Forward,
            cross_modal: None,
            symlog_inputs: false,
            activation: Activation::Silu,
        }
    }

    pub fn with_embed(mut self, embed: usize) -> Self {
        self.embed = Some(embed);
        self
    }

    pub fn with_units(mut self, units: usize) -> Self {
        self.units = units;
        self
    }

    pub fn with_layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_heads(mut self, heads: usize) -> Self {
        self.heads = heads;
        self
    }

    pub fn with_reducer(mut self, reducer: ReducerKind) -> Self {
        self.reducer = reducer;
        self
    }

    pub fn with_aux(mut self, aux: AuxLossMode) -> Self {
        self.aux = aux;
        self
    }

    pub fn with_cross_modal(mut self, weight: f32, latent_flat: usize) -> Self {
        self.cross_modal = Some(CrossModalConfig { weight, latent_flat });
        self
    }

    pub fn with_symlog_inputs(mut self, symlog_inputs: bool) -> Self {
        self.symlog_inputs = symlog_inputs;
        self
    }

    /// Width of one window step's feature vector.
    fn feature_width(&self) -> usize {
        self.obs + self.action + self.embed.unwrap_or(0)
    }

    /// Width of the observation source the auxiliary models predict in:
    /// embeddings when present, raw observations otherwise.
    fn aux_obs_width(&self) -> usize {
        self.embed.unwrap_or(self.obs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.obs == 0 {
            return Err(ConfigError::InvalidCount { field: "ctx.obs", value: self.obs });
        }
        if self.action == 0 {
            return Err(ConfigError::InvalidCount { field: "ctx.action", value: self.action });
        }
        if self.window == 0 {
            return Err(ConfigError::InvalidCount { field: "ctx.window", value: self.window });
        }
        if self.context_size == 0 {
            return Err(ConfigError::InvalidCount {
                field: "ctx.context_size",
                value: self.context_size,
            });
        }
        if self.units == 0 {
            return Err(ConfigError::InvalidCount { field: "ctx.units", value: self.units });
        }
        if let Some(embed) = self.embed {
            if embed == 0 {
                return Err(ConfigError::InvalidCount { field: "ctx.embed", value: embed });
            }
        }
        match self.reducer {
            ReducerKind::Attention | ReducerKind::Transformer => {
                if self.heads == 0 || self.units % self.heads != 0 {
                    return Err(ConfigError::InvalidCount { field: "ctx.heads", value: self.heads });
                }
            }
            ReducerKind::FeedForward | ReducerKind::Recurrent => {}
        }
        if let Some(cm) = &self.cross_modal {
            if cm.latent_flat == 0 {
                return Err(ConfigError::InvalidCount {
                    field: "ctx.cross_modal.latent_flat",
                    value: cm.latent_flat,
                });
            }
        }
        Ok(())
    }

    /// Initialize the encoder.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Result<CtxEncoder<B>, ConfigError> {
        self.validate()?;

        let feature = self.feature_width();
        let aux_obs = self.aux_obs_width();

        let mut feed_forward = None;
        let mut recurrent = None;
        let mut attention = None;
        let mut transformer = None;
        let reduced_width;

        match self.reducer {
            ReducerKind::FeedForward => {
                let mut layers = Vec::with_capacity(self.layers.max(1));
                let mut width = self.window * feature;
                for _ in 0..self.layers.max(1) {
                    layers.push(LinearConfig::new(width, self.units).init(device));
                    width = self.units;
                }
                feed_forward = Some(layers);
                reduced_width = self.units;
            }
            ReducerKind::Recurrent => {
                recurrent = Some(RecurrentReducer {
                    input: LinearConfig::new(feature, self.units).init(device),
                    cell: GatedCellConfig::new(self.units, self.units).init(device),
                    output: LinearConfig::new(self.units, self.units).init(device),
                });
                reduced_width = self.units;
            }
            ReducerKind::Attention => {
                attention = Some(AttentionReducer {
                    proj: LinearConfig::new(feature, self.units).init(device),
                    norm: LayerNormConfig::new(self.units).init(device),
                    attn: MultiHeadAttentionConfig::new(self.units, self.heads).init(device),
                });
                reduced_width = self.window * self.units;
            }
            ReducerKind::Transformer => {
                transformer = Some(TransformerReducer {
                    proj: LinearConfig::new(feature, self.units).init(device),
                    norm1: LayerNormConfig::new(self.units).init(device),
                    attn: MultiHeadAttentionConfig::new(self.units, self.heads).init(device),
                    norm2: LayerNormConfig::new(self.units).init(device),
                    ff1: LinearConfig::new(self.units, self.units).init(device),
                    ff2: LinearConfig::new(self.units, self.units).init(device),
                });
                reduced_width = self.window * self.units;
            }
        }

        let out = LinearConfig::new(reduced_width, self.context_size).init(device);

        let forward_net = self.aux.uses_forward().then(|| {
            MlpConfig::new(aux_obs + self.action + self.context_size, aux_obs)
                .with_hidden(self.units)
                .with_layers(self.layers)
                .with_activation(self.activation)
                .init(device)
        });
        let inverse_net = self.aux.uses_inverse().then(|| {
            MlpConfig::new(2 * aux_obs + self.context_size, self.action)
                .with_hidden(self.units)
                .with_layers(self.layers)
                .with_activation(self.activation)
                .init(device)
        });

        let (probe_latent, probe_context) = match &self.cross_modal {
            Some(cm) => (
                Some(LinearConfig::new(self.context_size, cm.latent_flat).init(device)),
                Some(LinearConfig::new(cm.latent_flat, self.context_size).init(device)),
            ),
            None => (None, None),
        };

        Ok(CtxEncoder {
            feed_forward,
            recurrent,
            attention,
            transformer,
            out,
            forward_net,
            inverse_net,
            probe_latent,
            probe_context,
            reducer: self.reducer,
            units: self.units,
            window: self.window,
            context_size: self.context_size,
            cross_weight: self.cross_modal.map(|c| c.weight).unwrap_or(0.0),
            symlog_inputs: self.symlog_inputs,
            has_embed: self.embed.is_some(),
            activation: self.activation,
        })
    }
}

/// Recurrent window reducer: project, scan a gated cell, project the final
/// state.
#[derive(Module, Debug)]
struct RecurrentReducer<B: Backend> {
    input: Linear<B>,
    cell: GatedCell<B>,
    output: Linear<B>,
}

/// Single self-attention reducer.
#[derive(Module, Debug)]
struct AttentionReducer<B: Backend> {
    proj: Linear<B>,
    norm: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
}

/// Pre-norm transformer block reducer.
#[derive(Module, Debug)]
struct TransformerReducer<B: Backend> {
    proj: Linear<B>,
    norm1: LayerNorm<B>,
    attn: MultiHeadAttention<B>,
    norm2: LayerNorm<B>,
    ff1: Linear<B>,
    ff2: Linear<B>,
}

/// Learned context encoder (see module docs).
#[derive(Module, Debug)]
pub struct CtxEncoder<B: Backend> {
    feed_forward: Option<Vec<Linear<B>>>,
    recurrent: Option<RecurrentReducer<B>>,
    attention: Option<AttentionReducer<B>>,
    transformer: Option<TransformerReducer<B>>,
    out: Linear<B>,
    forward_net: Option<Mlp<B>>,
    inverse_net: Option<Mlp<B>>,
    probe_latent: Option<Linear<B>>,
    probe_context: Option<Linear<B>>,
    #[module(skip)]
    reducer: ReducerKind,
    #[module(skip)]
    units: usize,
    #[module(skip)]
    window: usize,
    #[module(skip)]
    context_size: usize,
    #[module(skip)]
    cross_weight: f32,
    #[module(skip)]
    symlog_inputs: bool,
    #[module(skip)]
    has_embed: bool,
    #[module(skip)]
    activation: Activation,
}

impl<B: Backend> CtxEncoder<B> {
    pub fn context_size(&self) -> usize {
        self.context_size
    }

    pub fn window_len(&self) -> usize {
        self.window
    }

    /// Whether embeddings are part of the encoder's input window.
    pub fn uses_embed(&self) -> bool {
        self.has_embed
    }

    fn window_features(&self, window: &CtxWindow<B>) -> Tensor<B, 3> {
        assert_eq!(
            window.embed.is_some(),
            self.has_embed,
            "window embedding presence does not match configuration"
        );
        let mut parts = vec![window.obs.clone(), window.action.clone()];
        if let Some(embed) = &window.embed {
            parts.push(embed.clone());
        }
        let x = Tensor::cat(parts, 2);
        if self.symlog_inputs {
            symlog(x)
        } else {
            x
        }
    }

    /// Reduce a window to a single context vector `[batch, context_size]`.
    pub fn forward(&self, window: &CtxWindow<B>) -> Tensor<B, 2> {
        let x = self.window_features(window);
        let [batch, steps, feature] = x.dims();
        assert_eq!(steps, self.window, "window length does not match configuration");

        let reduced: Tensor<B, 2> = match self.reducer {
            ReducerKind::FeedForward => {
                let layers = self.feed_forward.as_ref().expect("feed-forward reducer");
                let mut x: Tensor<B, 2> = x.reshape([batch, steps * feature]);
                for layer in layers {
                    x = self.activation.apply(layer.forward(x));
                }
                x
            }
            ReducerKind::Recurrent => {
                let reducer = self.recurrent.as_ref().expect("recurrent reducer");
                let x = reducer.input.forward(x);
                let mut state: Tensor<B, 2> = Tensor::zeros([batch, self.units], &x.device());
                for t in 0..steps {
                    let x_t: Tensor<B, 2> = x
                        .clone()
                        .slice([0..batch, t..t + 1, 0..self.units])
                        .reshape([batch, self.units]);
                    state = reducer.cell.step(x_t, state);
                }
                reducer.output.forward(state)
            }
            ReducerKind::Attention => {
                let reducer = self.attention.as_ref().expect("attention reducer");
                let x = self.activation.apply(reducer.proj.forward(x));
                let x = reducer.norm.forward(x);
                let x = reducer.attn.self_attention(x);
                x.reshape([batch, steps * self.units])
            }
            ReducerKind::Transformer => {
                let reducer = self.transformer.as_ref().expect("transformer reducer");
                let x = self.activation.apply(reducer.proj.forward(x));
                let skip = x.clone();
                let x = reducer.norm1.forward(x);
                let x = reducer.attn.self_attention(x) + skip;
                let skip = x.clone();
                let y = reducer.norm2.forward(x);
                let y = self.activation.apply(reducer.ff1.forward(y));
                let y = self.activation.apply(reducer.ff2.forward(y));
                let x = y + skip;
                x.reshape([batch, steps * self.units])
            }
        };

        self.out.forward(reduced)
    }

    /// Auxiliary representation loss for one window and its context vector.
    ///
    /// Forward: predict the next observation (in the encoder's observation
    /// space) from the previous one, the action, and the context. Inverse:
    /// predict the action from consecutive observations and the context.
    /// Returns `[batch]`, averaged over the window.
    pub fn aux_loss(&self, window: &CtxWindow<B>, context: &Tensor<B, 2>) -> Tensor<B, 1> {
        let obs = match &window.embed {
            Some(embed) => embed.clone(),
            None => window.obs.clone(),
        };
        let [batch, steps, obs_width] = obs.dims();
        assert!(steps >= 2, "auxiliary loss needs at least two window steps");
        let action_width = window.action.dims()[2];

        let prev_obs = obs.clone().slice([0..batch, 0..steps - 1, 0..obs_width]);
        let next_obs = obs.slice([0..batch, 1..steps, 0..obs_width]);
        let ctx: Tensor<B, 3> = context
            .clone()
            .reshape([batch, 1, self.context_size])
            .repeat_dim(1, steps - 1);

        let mut loss: Tensor<B, 2> = Tensor::zeros([batch, steps - 1], &ctx.device());

        if let Some(forward_net) = &self.forward_net {
            let prev_action =
                window.action.clone().slice([0..batch, 0..steps - 1, 0..action_width]);
            let inputs = Tensor::cat(vec![prev_obs.clone(), prev_action, ctx.clone()], 2);
            let pred = forward_net.forward(inputs);
            let err = (pred - next_obs.clone()).powf_scalar(2.0);
            loss = loss + err.mean_dim(2).reshape([batch, steps - 1]);
        }

        if let Some(inverse_net) = &self.inverse_net {
            let next_action = window.action.clone().slice([0..batch, 1..steps, 0..action_width]);
            let inputs = Tensor::cat(vec![prev_obs, next_obs, ctx], 2);
            let pred = inverse_net.forward(inputs);
            let err = (pred - next_action).powf_scalar(2.0);
            loss = loss + err.mean_dim(2).reshape([batch, steps - 1]);
        }

        loss.mean_dim(1).reshape([batch])
    }

    /// Cross-modal probe loss `[batch]`.
    ///
    /// One linear probe reconstructs the stochastic state from the context
    /// (target stopped), the other reconstructs the context from the stopped
    /// stochastic state; both train the encoder side only.
    pub fn cross_modal_loss(
        &self,
        context: &Tensor<B, 2>,
        stoch_flat: &Tensor<B, 2>,
    ) -> Tensor<B, 1> {
        let probe_latent = self.probe_latent.as_ref().expect("cross-modal probes not configured");
        let probe_context = self.probe_context.as_ref().expect("cross-modal probes not configured");
        let [batch, _] = context.dims();

        let latent_pred = probe_latent.forward(context.clone());
        let loss_latent = (latent_pred - stoch_flat.clone().detach()).powf_scalar(2.0);

        let context_pred = probe_context.forward(stoch_flat.clone().detach());
        let loss_context = (context_pred - context.clone()).powf_scalar(2.0);

        loss_latent.mean_dim(1).reshape([batch]) + loss_context.mean_dim(1).reshape([batch])
    }

    /// Incremental auxiliary loss over growing prefixes of a sequence.
    ///
    /// For every prefix length `1..T`, the prefix is left-padded back to the
    /// full window by repeating its earliest element, encoded, and scored
    /// with the auxiliary (and optional cross-modal) objectives, while the
    /// RSSM is stepped alongside under stop-gradient to supply the
    /// cross-modal target. The encoder therefore learns context estimation
    /// from partial histories of every length. Returns `[batch, T]`; the
    /// final column is zero.
    pub fn incremental_loss(
        &self,
        rssm: &Rssm<B>,
        window: &CtxWindow<B>,
        embed_seq: &Tensor<B, 3>,
        is_first: &Tensor<B, 2>,
        state: (LatentState<B>, Tensor<B, 2>),
        rng: &mut LatentRng,
    ) -> Tensor<B, 2> {
        let [batch, steps, _] = window.obs.dims();
        assert!(steps >= 2, "incremental loss needs at least two steps");
        let [_, embed_steps, embed_width] = embed_seq.dims();
        assert_eq!(embed_steps, steps, "embedding sequence length mismatch");
        let action_width = window.action.dims()[2];

        let (mut prev_state, mut prev_action) = state;
        let mut columns: Vec<Tensor<B, 1>> = Vec::with_capacity(steps - 1);

        for t in 1..steps {
            let prefix = window.prefix_padded(t);
            let rolling_ctx = self.forward(&prefix);

            let embed_t: Tensor<B, 2> = embed_seq
                .clone()
                .slice([0..batch, t..t + 1, 0..embed_width])
                .reshape([batch, embed_width]);
            let first_t: Tensor<B, 1> =
                is_first.clone().slice([0..batch, t..t + 1]).reshape([batch]);

            let ctx_stopped = rolling_ctx.clone().detach();
            let (post, _prior) = rssm.obs_step(
                &prev_state.detach(),
                prev_action.clone().detach(),
                embed_t,
                first_t,
                Some(&ctx_stopped),
                rng,
            );

            let mut loss = self.aux_loss(&prefix, &rolling_ctx);
            if self.probe_latent.is_some() {
                let cross = self.cross_modal_loss(&rolling_ctx, &post.stoch.flat());
                loss = loss + cross * self.cross_weight;
            }
            columns.push(loss);

            prev_state = post;
            prev_action = window
                .action
                .clone()
                .slice([0..batch, t..t + 1, 0..action_width])
                .reshape([batch, action_width]);
        }

        columns.push(Tensor::zeros([batch], &window.obs.device()));
        Tensor::stack(columns, 1)
    }
}
