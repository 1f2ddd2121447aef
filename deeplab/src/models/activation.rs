//! Serializable activation identifiers.

use std::str::FromStr;

use burn::{prelude::*, tensor::activation};

use crate::error::DeepLabError;

/// An activation function referenced by name in a configuration.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Activation {
    /// Softmax over the channel axis (dim 1).
    Softmax,
    Sigmoid,
    Relu,
    Gelu,
    Tanh,
    /// Identity.
    Linear,
}

impl Activation {
    pub const ALL: [Self; 6] = [
        Self::Softmax,
        Self::Sigmoid,
        Self::Relu,
        Self::Gelu,
        Self::Tanh,
        Self::Linear,
    ];

    /// Lowercase identifier.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::Softmax => "softmax",
            Self::Sigmoid => "sigmoid",
            Self::Relu => "relu",
            Self::Gelu => "gelu",
            Self::Tanh => "tanh",
            Self::Linear => "linear",
        }
    }

    /// Apply the activation to a tensor of rank at least 2.
    pub fn forward<B: Backend, const D: usize>(&self, x: Tensor<B, D>) -> Tensor<B, D> {
        match self {
            Self::Softmax => activation::softmax(x, 1),
            Self::Sigmoid => activation::sigmoid(x),
            Self::Relu => activation::relu(x),
            Self::Gelu => activation::gelu(x),
            Self::Tanh => activation::tanh(x),
            Self::Linear => x,
        }
    }
}

impl FromStr for Activation {
    type Err = DeepLabError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        Self::ALL
            .into_iter()
            .find(|activation| activation.name() == lower)
            .ok_or_else(|| DeepLabError::InvalidConfiguration {
                reason: format!("unknown activation '{s}'"),
            })
    }
}
