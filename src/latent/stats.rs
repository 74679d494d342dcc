//! Distribution statistics for the stochastic latent component.
//!
//! Categorical statistics carry unimix-smoothed logits per latent variable;
//! Gaussian statistics carry a mean and an analytically bounded standard
//! deviation. Sampling keeps gradients flowing: straight-through for
//! categorical draws, reparameterization for Gaussian draws.

use burn::tensor::activation::{log_softmax, sigmoid, softmax};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use crate::config::LatentSpec;
use crate::latent::rng::LatentRng;
use crate::latent::state::StochState;

const LOG_2PI: f32 = 1.837_877_1;

/// Statistics of the stochastic latent distribution.
#[derive(Debug, Clone)]
pub enum StochStats<B: Backend> {
    /// Per-variable categorical logits `[batch, vars, classes]`.
    Categorical { logit: Tensor<B, 3> },
    /// Diagonal Gaussian `[batch, size]` mean and std.
    Gaussian { mean: Tensor<B, 2>, std: Tensor<B, 2> },
}

impl<B: Backend> StochStats<B> {
    /// Build statistics from a raw projection `[batch, spec.stats_size()]`.
    ///
    /// Categorical logits are unimix-smoothed: softmax probabilities are mixed
    /// with a uniform distribution at weight `unimix`, so every category keeps
    /// at least `unimix / classes` probability mass. Gaussian std is bounded
    /// to `(0.1, 2.1)` via `2 * sigmoid(raw / 2) + 0.1`.
    pub fn from_raw(spec: LatentSpec, unimix: f32, raw: Tensor<B, 2>) -> Self {
        let [batch, width] = raw.dims();
        assert_eq!(width, spec.stats_size(), "stats projection width mismatch");

        match spec {
            LatentSpec::Categorical { vars, classes } => {
                let logit = raw.reshape([batch, vars, classes]);
                let logit = if unimix > 0.0 {
                    let probs = softmax(logit, 2);
                    let uniform = Tensor::ones_like(&probs) / classes as f32;
                    let probs = probs * (1.0 - unimix) + uniform * unimix;
                    probs.log()
                } else {
                    logit
                };
                StochStats::Categorical { logit }
            }
            LatentSpec::Gaussian { size } => {
                let mean = raw.clone().slice([0..batch, 0..size]);
                let raw_std = raw.slice([0..batch, size..2 * size]);
                let std = sigmoid(raw_std / 2.0) * 2.0 + 0.1;
                StochStats::Gaussian { mean, std }
            }
        }
    }

    /// Zero-information reference distribution of the same shape: uniform
    /// categorical, or standard normal.
    pub fn uniform_like(&self) -> Self {
        match self {
            StochStats::Categorical { logit } => StochStats::Categorical {
                logit: Tensor::zeros_like(logit),
            },
            StochStats::Gaussian { mean, std } => StochStats::Gaussian {
                mean: Tensor::zeros_like(mean),
                std: Tensor::ones_like(std),
            },
        }
    }

    pub fn batch_size(&self) -> usize {
        match self {
            StochStats::Categorical { logit } => logit.dims()[0],
            StochStats::Gaussian { mean, .. } => mean.dims()[0],
        }
    }

    /// Detach the statistics from the autodiff graph.
    pub fn detach(&self) -> Self {
        match self {
            StochStats::Categorical { logit } => StochStats::Categorical {
                logit: logit.clone().detach(),
            },
            StochStats::Gaussian { mean, std } => StochStats::Gaussian {
                mean: mean.clone().detach(),
                std: std.clone().detach(),
            },
        }
    }

    /// Draw a stochastic value.
    ///
    /// Categorical: one-hot sample with straight-through gradients through
    /// the class probabilities. Gaussian: `mean + std * eps` with `eps` drawn
    /// from the explicit RNG.
    pub fn sample(&self, rng: &mut LatentRng) -> StochState<B> {
        match self {
            StochStats::Categorical { logit } => {
                let [batch, vars, classes] = logit.dims();
                let probs = softmax(logit.clone(), 2);
                let data = probs.clone().into_data();
                let flat = data.as_slice::<f32>().unwrap();

                let mut one_hot = vec![0.0f32; batch * vars * classes];
                for b in 0..batch {
                    for v in 0..vars {
                        let row = &flat[(b * vars + v) * classes..(b * vars + v + 1) * classes];
                        let draw = rng.uniform();
                        let mut cumsum = 0.0;
                        let mut selected = classes - 1;
                        for (c, p) in row.iter().enumerate() {
                            cumsum += p;
                            if draw < cumsum {
                                selected = c;
                                break;
                            }
                        }
                        one_hot[(b * vars + v) * classes + selected] = 1.0;
                    }
                }

                let device = logit.device();
                let sample: Tensor<B, 3> = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &device)
                    .reshape([batch, vars, classes]);
                // Straight-through: forward value is the one-hot sample,
                // gradient flows through the probabilities.
                let stoch = sample + probs.clone() - probs.detach();
                StochState::Categorical {
                    logit: logit.clone(),
                    stoch,
                }
            }
            StochStats::Gaussian { mean, std } => {
                let [batch, size] = mean.dims();
                let device = mean.device();
                let noise: Tensor<B, 2> =
                    Tensor::<B, 1>::from_floats(rng.normal_vec(batch * size).as_slice(), &device)
                        .reshape([batch, size]);
                let stoch = mean.clone() + std.clone() * noise;
                StochState::Gaussian {
                    mean: mean.clone(),
                    std: std.clone(),
                    stoch,
                }
            }
        }
    }

    /// Most likely value: one-hot argmax (straight-through) or the mean.
    pub fn mode(&self) -> StochState<B> {
        match self {
            StochStats::Categorical { logit } => {
                let [batch, vars, classes] = logit.dims();
                let probs = softmax(logit.clone(), 2);
                let data = probs.clone().into_data();
                let flat = data.as_slice::<f32>().unwrap();

                let mut one_hot = vec![0.0f32; batch * vars * classes];
                for b in 0..batch {
                    for v in 0..vars {
                        let row = &flat[(b * vars + v) * classes..(b * vars + v + 1) * classes];
                        let mut best = 0;
                        for (c, p) in row.iter().enumerate() {
                            if *p > row[best] {
                                best = c;
                            }
                        }
                        one_hot[(b * vars + v) * classes + best] = 1.0;
                    }
                }

                let device = logit.device();
                let sample: Tensor<B, 3> = Tensor::<B, 1>::from_floats(one_hot.as_slice(), &device)
                    .reshape([batch, vars, classes]);
                let stoch = sample + probs.clone() - probs.detach();
                StochState::Categorical {
                    logit: logit.clone(),
                    stoch,
                }
            }
            StochStats::Gaussian { mean, std } => StochState::Gaussian {
                mean: mean.clone(),
                std: std.clone(),
                stoch: mean.clone(),
            },
        }
    }

    /// KL divergence `KL(self || other)`, summed over latent dimensions.
    ///
    /// Returns `[batch]`. Both sides must share the representation mode and
    /// batch shape; a mismatch is a wiring bug.
    pub fn kl(&self, other: &Self) -> Tensor<B, 1> {
        match (self, other) {
            (StochStats::Categorical { logit: p }, StochStats::Categorical { logit: q }) => {
                assert_eq!(p.dims(), q.dims(), "categorical stats shape mismatch");
                let lp = log_softmax(p.clone(), 2);
                let lq = log_softmax(q.clone(), 2);
                let per_class = lp.clone().exp() * (lp - lq);
                let [batch, _, _] = per_class.dims();
                per_class.sum_dim(2).sum_dim(1).reshape([batch])
            }
            (
                StochStats::Gaussian { mean: mp, std: sp },
                StochStats::Gaussian { mean: mq, std: sq },
            ) => {
                assert_eq!(mp.dims(), mq.dims(), "gaussian stats shape mismatch");
                let [batch, _] = mp.dims();
                let var_q = sq.clone().powf_scalar(2.0);
                let term = (sq.clone() / sp.clone()).log()
                    + (sp.clone().powf_scalar(2.0) + (mp.clone() - mq.clone()).powf_scalar(2.0))
                        / (var_q * 2.0)
                    - 0.5;
                term.sum_dim(1).reshape([batch])
            }
            _ => panic!("KL between mismatched representation modes"),
        }
    }

    /// Distribution entropy, summed over latent dimensions. Returns `[batch]`.
    pub fn entropy(&self) -> Tensor<B, 1> {
        match self {
            StochStats::Categorical { logit } => {
                let lp = log_softmax(logit.clone(), 2);
                let [batch, _, _] = lp.dims();
                let neg = lp.clone().exp() * lp;
                -neg.sum_dim(2).sum_dim(1).reshape([batch])
            }
            StochStats::Gaussian { std, .. } => {
                let [batch, _] = std.dims();
                let per_dim = std.clone().log() + (0.5 * (LOG_2PI + 1.0));
                per_dim.sum_dim(1).reshape([batch])
            }
        }
    }

    /// Log-likelihood of a stochastic value under these statistics.
    /// Returns `[batch]`.
    pub fn log_prob(&self, stoch: &StochState<B>) -> Tensor<B, 1> {
        match (self, stoch) {
            (StochStats::Categorical { logit }, StochState::Categorical { stoch, .. }) => {
                let lp = log_softmax(logit.clone(), 2);
                let [batch, _, _] = lp.dims();
                (stoch.clone() * lp).sum_dim(2).sum_dim(1).reshape([batch])
            }
            (StochStats::Gaussian { mean, std }, StochState::Gaussian { stoch, .. }) => {
                let [batch, _] = mean.dims();
                let z = (stoch.clone() - mean.clone()) / std.clone();
                let per_dim = z.powf_scalar(2.0) * (-0.5) - std.clone().log() - 0.5 * LOG_2PI;
                per_dim.sum_dim(1).reshape([batch])
            }
            _ => panic!("log_prob between mismatched representation modes"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    fn device() -> <B as Backend>::Device {
        Default::default()
    }

    const CAT: LatentSpec = LatentSpec::Categorical { vars: 4, classes: 8 };
    const GAUSS: LatentSpec = LatentSpec::Gaussian { size: 6 };

    #[test]
    fn test_unimix_probability_floor() {
        let device = device();
        let unimix = 0.01;
        // Extreme logits that would otherwise kill all but one category.
        let mut raw = vec![0.0f32; 2 * CAT.stats_size()];
        for v in raw.iter_mut().step_by(8) {
            *v = 50.0;
        }
        let raw: Tensor<B, 2> =
            Tensor::<B, 1>::from_floats(raw.as_slice(), &device).reshape([2, CAT.stats_size()]);

        let stats = StochStats::from_raw(CAT, unimix, raw);
        let StochStats::Categorical { logit } = &stats else {
            panic!("expected categorical stats");
        };
        let probs = softmax(logit.clone(), 2).into_data();
        let floor = unimix / 8.0;
        for p in probs.as_slice::<f32>().unwrap() {
            assert!(*p >= floor - 1e-6, "probability {} under unimix floor {}", p, floor);
        }
    }

    #[test]
    fn test_gaussian_std_bounds() {
        let device = device();
        let raw: Tensor<B, 2> = Tensor::<B, 1>::from_floats(
            [
                0.0, 0.0, 0.0, 0.0, 0.0, 0.0, // mean
                -1e6, -10.0, 0.0, 10.0, 1e6, 3.0, // raw std
            ],
            &device,
        )
        .reshape([1, GAUSS.stats_size()]);

        let stats = StochStats::from_raw(GAUSS, 0.0, raw);
        let StochStats::Gaussian { std, .. } = &stats else {
            panic!("expected gaussian stats");
        };
        for s in std.clone().into_data().as_slice::<f32>().unwrap() {
            assert!(*s > 0.1 - 1e-6 && *s < 2.1 + 1e-6, "std {} out of (0.1, 2.1)", s);
        }
    }

    #[test]
    fn test_categorical_sample_is_one_hot_and_seed_deterministic() {
        let device = device();
        let raw: Tensor<B, 2> = Tensor::zeros([3, CAT.stats_size()], &device);
        let stats = StochStats::from_raw(CAT, 0.01, raw);

        let a = stats.sample(&mut LatentRng::seed_from_u64(42));
        let b = stats.sample(&mut LatentRng::seed_from_u64(42));

        let (StochState::Categorical { stoch: sa, .. }, StochState::Categorical { stoch: sb, .. }) =
            (&a, &b)
        else {
            panic!("expected categorical states");
        };

        let da = sa.clone().into_data();
        let db = sb.clone().into_data();
        assert_eq!(da.as_slice::<f32>().unwrap(), db.as_slice::<f32>().unwrap());

        // Every variable's row sums to exactly one active class.
        let flat = da.as_slice::<f32>().unwrap();
        for row in flat.chunks(8) {
            let sum: f32 = row.iter().sum();
            assert!((sum - 1.0).abs() < 1e-6);
            assert!(row.iter().all(|v| *v == 0.0 || *v == 1.0));
        }
    }

    #[test]
    fn test_kl_zero_when_identical() {
        let device = device();
        let raw: Tensor<B, 2> = Tensor::<B, 1>::from_floats(
            (0..2 * CAT.stats_size()).map(|i| i as f32 * 0.1).collect::<Vec<_>>().as_slice(),
            &device,
        )
        .reshape([2, CAT.stats_size()]);
        let stats = StochStats::from_raw(CAT, 0.01, raw);

        let kl = stats.kl(&stats.clone()).into_data();
        for v in kl.as_slice::<f32>().unwrap() {
            assert!(v.abs() < 1e-5, "self-KL should be 0, got {}", v);
        }
    }

    #[test]
    fn test_gaussian_kl_standard_normal_case() {
        let device = device();
        // p = N(1, 1), q = N(0, 1): KL = 0.5 per dimension.
        let p = StochStats::Gaussian {
            mean: Tensor::<B, 2>::ones([1, 4], &device),
            std: Tensor::<B, 2>::ones([1, 4], &device),
        };
        let q = StochStats::Gaussian {
            mean: Tensor::<B, 2>::zeros([1, 4], &device),
            std: Tensor::<B, 2>::ones([1, 4], &device),
        };
        let kl = p.kl(&q).into_data();
        let kl = kl.as_slice::<f32>().unwrap()[0];
        assert!((kl - 2.0).abs() < 1e-5, "expected 4 * 0.5, got {}", kl);
    }

    #[test]
    fn test_entropy_peaks_at_uniform() {
        let device = device();
        let uniform =
            StochStats::from_raw(CAT, 0.0, Tensor::<B, 2>::zeros([1, CAT.stats_size()], &device));

        let mut raw = vec![0.0f32; CAT.stats_size()];
        for v in raw.iter_mut().step_by(8) {
            *v = 10.0;
        }
        let peaked = StochStats::from_raw(
            CAT,
            0.0,
            Tensor::<B, 1>::from_floats(raw.as_slice(), &device).reshape([1, CAT.stats_size()]),
        );

        let hu = uniform.entropy().into_data().as_slice::<f32>().unwrap()[0];
        let hp = peaked.entropy().into_data().as_slice::<f32>().unwrap()[0];
        assert!(hu > hp);
    }

    #[test]
    fn test_gaussian_sample_reparameterized() {
        let device = device();
        let mean: Tensor<B, 2> = Tensor::<B, 2>::ones([2, 6], &device) * 3.0;
        let std: Tensor<B, 2> = Tensor::<B, 2>::ones([2, 6], &device) * 0.01;
        let stats = StochStats::Gaussian { mean, std };

        let state = stats.sample(&mut LatentRng::seed_from_u64(0));
        let StochState::Gaussian { stoch, .. } = state else {
            panic!("expected gaussian state");
        };
        for v in stoch.into_data().as_slice::<f32>().unwrap() {
            assert!((v - 3.0).abs() < 0.1, "sample {} far from tight mean", v);
        }
    }
}
