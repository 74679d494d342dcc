//! Gated recurrent cell with a single fused gate projection.
//!
//! This is the recurrent update used by the RSSM transition core and by the
//! recurrent context reducer: reset, candidate, and update gates come from
//! one 3x-width linear over `[state, input]`, and the update gate is
//! pre-biased by -1 before the sigmoid so a freshly initialized cell favors
//! retaining its previous state.
//!
//! ```text
//! r, c, u = split(W [h, x], 3)
//! c = tanh(sigmoid(r) * c)
//! u = sigmoid(u - 1)
//! h' = u * c + (1 - u) * h
//! ```

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::activation::sigmoid;
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

/// Configuration for [`GatedCell`].
#[derive(Debug, Clone)]
pub struct GatedCellConfig {
    /// Input feature size.
    pub d_input: usize,
    /// Recurrent state size.
    pub d_state: usize,
}

impl GatedCellConfig {
    pub fn new(d_input: usize, d_state: usize) -> Self {
        Self { d_input, d_state }
    }

    /// Initialize the cell.
    pub fn init<B: Backend>(&self, device: &B::Device) -> GatedCell<B> {
        let gates = LinearConfig::new(self.d_state + self.d_input, 3 * self.d_state).init(device);
        GatedCell {
            gates,
            d_input: self.d_input,
            d_state: self.d_state,
        }
    }
}

/// Gated recurrent cell (see module docs for the update equations).
#[derive(Module, Debug)]
pub struct GatedCell<B: Backend> {
    gates: Linear<B>,
    #[module(skip)]
    d_input: usize,
    #[module(skip)]
    d_state: usize,
}

impl<B: Backend> GatedCell<B> {
    /// Advance the recurrent state by one step.
    ///
    /// # Arguments
    /// * `input` - Input tensor `[batch, d_input]`
    /// * `state` - Previous state `[batch, d_state]`
    ///
    /// # Returns
    /// New state `[batch, d_state]`.
    pub fn step(&self, input: Tensor<B, 2>, state: Tensor<B, 2>) -> Tensor<B, 2> {
        let [batch, d_input] = input.dims();
        assert_eq!(d_input, self.d_input, "gated cell input width mismatch");
        assert_eq!(state.dims(), [batch, self.d_state], "gated cell state shape mismatch");

        let x = Tensor::cat(vec![state.clone(), input], 1);
        let fused = self.gates.forward(x);

        let reset = fused.clone().slice([0..batch, 0..self.d_state]);
        let cand = fused.clone().slice([0..batch, self.d_state..2 * self.d_state]);
        let update = fused.slice([0..batch, 2 * self.d_state..3 * self.d_state]);

        let reset = sigmoid(reset);
        let cand = (reset * cand).tanh();
        let update = sigmoid(update - 1.0);

        let ones = Tensor::ones_like(&update);
        update.clone() * cand + (ones - update) * state
    }

    pub fn d_state(&self) -> usize {
        self.d_state
    }
}
