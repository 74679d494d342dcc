//! Explicit pseudorandom generator handle for stochastic operations.
//!
//! Every sampling operation in the core takes `&mut LatentRng`; nothing draws
//! from thread-local or global state. [`LatentRng::fork`] deterministically
//! splits off an independent stream per call site, so reordering unrelated
//! sampling sites does not perturb each other's draws.

use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use rand_xoshiro::Xoshiro256PlusPlus;

/// Seeded, forkable random generator for latent sampling.
#[derive(Debug, Clone)]
pub struct LatentRng {
    inner: Xoshiro256PlusPlus,
}

impl LatentRng {
    /// Create a generator from a seed.
    pub fn seed_from_u64(seed: u64) -> Self {
        Self {
            inner: Xoshiro256PlusPlus::seed_from_u64(seed),
        }
    }

    /// Split off an independent stream.
    ///
    /// The child takes the current stream; this generator jumps ahead by
    /// 2^128 draws, so parent and child never overlap.
    pub fn fork(&mut self) -> Self {
        let child = self.inner.clone();
        self.inner.jump();
        Self { inner: child }
    }

    /// Uniform draw in `[0, 1)`.
    pub fn uniform(&mut self) -> f32 {
        self.inner.gen::<f32>()
    }

    /// Standard-normal draw.
    pub fn normal(&mut self) -> f32 {
        self.inner.sample(StandardNormal)
    }

    /// `n` standard-normal draws.
    pub fn normal_vec(&mut self, n: usize) -> Vec<f32> {
        (0..n).map(|_| self.normal()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_same_seed_same_stream() {
        let mut a = LatentRng::seed_from_u64(7);
        let mut b = LatentRng::seed_from_u64(7);
        for _ in 0..32 {
            assert_eq!(a.uniform(), b.uniform());
        }
    }

    #[test]
    fn test_fork_streams_diverge() {
        let mut parent = LatentRng::seed_from_u64(7);
        let mut child = parent.fork();

        let parent_draws: Vec<f32> = (0..16).map(|_| parent.uniform()).collect();
        let child_draws: Vec<f32> = (0..16).map(|_| child.uniform()).collect();
        assert_ne!(parent_draws, child_draws);
    }

    #[test]
    fn test_fork_is_deterministic() {
        let mut a = LatentRng::seed_from_u64(3);
        let mut b = LatentRng::seed_from_u64(3);
        let mut fa = a.fork();
        let mut fb = b.fork();
        assert_eq!(fa.uniform(), fb.uniform());
        assert_eq!(a.uniform(), b.uniform());
    }

    #[test]
    fn test_uniform_range() {
        let mut rng = LatentRng::seed_from_u64(11);
        for _ in 0..1000 {
            let u = rng.uniform();
            assert!((0.0..1.0).contains(&u));
        }
    }
}
