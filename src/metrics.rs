//! Flat diagnostics map emitted by training steps.
//!
//! Values are plain scalars so downstream reporting stays decoupled from the
//! tensor backend.

use std::collections::BTreeMap;

use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Name → value diagnostics collected during a training step.
#[derive(Debug, Clone, Default)]
pub struct Metrics {
    values: BTreeMap<String, f32>,
}

impl Metrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a scalar.
    pub fn scalar(&mut self, name: impl Into<String>, value: f32) {
        self.values.insert(name.into(), value);
    }

    /// Record mean/std/min/max summaries of a tensor under `<name>_mean` etc.
    pub fn tensor<B: Backend, const D: usize>(&mut self, name: &str, tensor: Tensor<B, D>) {
        let data = tensor.into_data();
        let values = data.as_slice::<f32>().unwrap();
        if values.is_empty() {
            return;
        }
        let n = values.len() as f32;
        let mean = values.iter().sum::<f32>() / n;
        let var = values.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / n;
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);

        self.scalar(format!("{}_mean", name), mean);
        self.scalar(format!("{}_std", name), var.sqrt());
        self.scalar(format!("{}_min", name), min);
        self.scalar(format!("{}_max", name), max);
    }

    pub fn get(&self, name: &str) -> Option<f32> {
        self.values.get(name).copied()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.values.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    /// Merge another metrics map, prefixing its keys.
    pub fn extend_prefixed(&mut self, prefix: &str, other: Metrics) {
        for (k, v) in other.values {
            self.values.insert(format!("{}_{}", prefix, k), v);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_scalar_roundtrip() {
        let mut m = Metrics::new();
        m.scalar("loss", 1.5);
        assert_eq!(m.get("loss"), Some(1.5));
        assert_eq!(m.get("missing"), None);
    }

    #[test]
    fn test_tensor_summaries() {
        let device = Default::default();
        let t: Tensor<B, 1> = Tensor::from_floats([1.0, 2.0, 3.0, 4.0], &device);

        let mut m = Metrics::new();
        m.tensor("x", t);

        assert_eq!(m.get("x_mean"), Some(2.5));
        assert_eq!(m.get("x_min"), Some(1.0));
        assert_eq!(m.get("x_max"), Some(4.0));
        assert!((m.get("x_std").unwrap() - 1.118).abs() < 1e-3);
    }

    #[test]
    fn test_extend_prefixed() {
        let mut inner = Metrics::new();
        inner.scalar("loss", 0.5);
        let mut outer = Metrics::new();
        outer.extend_prefixed("ctx", inner);
        assert_eq!(outer.get("ctx_loss"), Some(0.5));
    }
}
