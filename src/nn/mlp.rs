//! Small multi-layer perceptron.
//!
//! Used for the reward and continuation heads and for the context encoder's
//! forward/inverse auxiliary models. Hidden layers share one width and
//! activation; the output projection is always linear.

use burn::module::Module;
use burn::nn::{Linear, LinearConfig};
use burn::tensor::backend::Backend;
use burn::tensor::Tensor;

use super::Activation;

/// Configuration for [`Mlp`].
#[derive(Debug, Clone)]
pub struct MlpConfig {
    /// Input feature size.
    pub d_input: usize,
    /// Output size.
    pub d_output: usize,
    /// Hidden layer width.
    pub hidden: usize,
    /// Number of hidden layers (0 = single linear projection).
    pub layers: usize,
    /// Hidden activation.
    pub activation: Activation,
}

impl MlpConfig {
    pub fn new(d_input: usize, d_output: usize) -> Self {
        Self {
            d_input,
            d_output,
            hidden: 256,
            layers: 2,
            activation: Activation::Silu,
        }
    }

    pub fn with_hidden(mut self, hidden: usize) -> Self {
        self.hidden = hidden;
        self
    }

    pub fn with_layers(mut self, layers: usize) -> Self {
        self.layers = layers;
        self
    }

    pub fn with_activation(mut self, activation: Activation) -> Self {
        self.activation = activation;
        self
    }

    /// Initialize the network.
    pub fn init<B: Backend>(&self, device: &B::Device) -> Mlp<B> {
        let mut hidden_layers = Vec::with_capacity(self.layers);
        let mut width = self.d_input;
        for _ in 0..self.layers {
            hidden_layers.push(LinearConfig::new(width, self.hidden).init(device));
            width = self.hidden;
        }
        let output = LinearConfig::new(width, self.d_output).init(device);

        Mlp {
            hidden: hidden_layers,
            output,
            activation: self.activation,
        }
    }
}

/// Multi-layer perceptron with a linear output projection.
#[derive(Module, Debug)]
pub struct Mlp<B: Backend> {
    hidden: Vec<Linear<B>>,
    output: Linear<B>,
    #[module(skip)]
    activation: Activation,
}

impl<B: Backend> Mlp<B> {
    /// Forward pass over the trailing feature dimension.
    pub fn forward<const D: usize>(&self, input: Tensor<B, D>) -> Tensor<B, D> {
        let mut x = input;
        for layer in &self.hidden {
            x = self.activation.apply(layer.forward(x));
        }
        self.output.forward(x)
    }
}
