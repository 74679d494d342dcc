//! Multi-head self-attention over short temporal windows.
//!
//! The context encoder's attention and transformer reducers use this to relate
//! the steps of a recent-history window before collapsing it to a single
//! context vector.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::softmax;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for [`MultiHeadAttention`].
#[derive(Debug, Clone)]
pub struct MultiHeadAttentionConfig {
    /// Model dimension (must be divisible by `n_heads`).
    pub d_model: usize,
    /// Number of attention heads.
    pub n_heads: usize,
}

impl MultiHeadAttentionConfig {
    pub fn new(d_model: usize, n_heads: usize) -> Self {
        assert!(
            d_model % n_heads == 0,
            "d_model ({}) must be divisible by n_heads ({})",
            d_model,
            n_heads
        );
        Self { d_model, n_heads }
    }

    /// Initialize the attention module.
    pub fn init<B: Backend>(&self, device: &B::Device) -> MultiHeadAttention<B> {
        let proj = |d_in, d_out| LinearConfig::new(d_in, d_out).init(device);
        MultiHeadAttention {
            query: proj(self.d_model, self.d_model),
            key: proj(self.d_model, self.d_model),
            value: proj(self.d_model, self.d_model),
            out: proj(self.d_model, self.d_model),
            n_heads: self.n_heads,
            d_head: self.d_model / self.n_heads,
            d_model: self.d_model,
        }
    }
}

/// Scaled dot-product attention with `n_heads` heads.
#[derive(Module, Debug)]
pub struct MultiHeadAttention<B: Backend> {
    query: Linear<B>,
    key: Linear<B>,
    value: Linear<B>,
    out: Linear<B>,
    #[module(skip)]
    n_heads: usize,
    #[module(skip)]
    d_head: usize,
    #[module(skip)]
    d_model: usize,
}

impl<B: Backend> MultiHeadAttention<B> {
    /// Attention forward pass.
    ///
    /// # Arguments
    /// * `query` - `[batch, seq_q, d_model]`
    /// * `key` - `[batch, seq_k, d_model]`
    /// * `value` - `[batch, seq_k, d_model]`
    ///
    /// # Returns
    /// `[batch, seq_q, d_model]`
    pub fn forward(
        &self,
        query: Tensor<B, 3>,
        key: Tensor<B, 3>,
        value: Tensor<B, 3>,
    ) -> Tensor<B, 3> {
        let [batch, seq_q, _] = query.dims();
        let [_, seq_k, _] = key.dims();

        let split = |x: Tensor<B, 3>, seq: usize| {
            // [batch, seq, d_model] -> [batch, heads, seq, d_head]
            x.reshape([batch, seq, self.n_heads, self.d_head]).swap_dims(1, 2)
        };

        let q = split(self.query.forward(query), seq_q);
        let k = split(self.key.forward(key), seq_k);
        let v = split(self.value.forward(value), seq_k);

        let scale = (self.d_head as f32).sqrt();
        let scores = q.matmul(k.swap_dims(2, 3)) / scale;
        let weights = softmax(scores, 3);

        let attended = weights
            .matmul(v)
            .swap_dims(1, 2)
            .reshape([batch, seq_q, self.d_model]);

        self.out.forward(attended)
    }

    /// Self-attention where query, key, and value are the same window.
    pub fn self_attention(&self, x: Tensor<B, 3>) -> Tensor<B, 3> {
        self.forward(x.clone(), x.clone(), x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type B = NdArray<f32>;

    #[test]
    fn test_self_attention_shape() {
        let device = Default::default();
        let attn = MultiHeadAttentionConfig::new(32, 4).init::<B>(&device);
        let x: Tensor<B, 3> = Tensor::zeros([2, 6, 32], &device);
        assert_eq!(attn.self_attention(x).dims(), [2, 6, 32]);
    }

    #[test]
    fn test_cross_attention_uses_query_length() {
        let device = Default::default();
        let attn = MultiHeadAttentionConfig::new(16, 2).init::<B>(&device);
        let q: Tensor<B, 3> = Tensor::zeros([1, 3, 16], &device);
        let kv: Tensor<B, 3> = Tensor::zeros([1, 8, 16], &device);
        assert_eq!(attn.forward(q, kv.clone(), kv).dims(), [1, 3, 16]);
    }

    #[test]
    #[should_panic(expected = "must be divisible")]
    fn test_invalid_head_count() {
        let _ = MultiHeadAttentionConfig::new(30, 4);
    }
}
