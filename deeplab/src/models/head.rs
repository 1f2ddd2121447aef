//! Segmentation prediction head.

use burn::{
    module::{Ignored, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d,
    },
    prelude::*,
    tensor::FloatDType,
};

use super::{activation::Activation, pyramid::FeaturePyramid};
use crate::error::{DeepLabError, DeepLabResult};

/// Configuration for [`SegmentationHead`].
#[derive(Config, Debug)]
pub struct SegmentationHeadConfig {
    /// Number of output classes.
    pub num_classes: usize,
    /// Number of conv blocks before the class projection.
    #[config(default = 2)]
    pub convolutions: usize,
    /// Channels of every conv block.
    #[config(default = 256)]
    pub filters: usize,
    /// Activation of the conv blocks.
    #[config(default = "Activation::Relu")]
    pub activations: Activation,
    /// Dropout after every conv block, disabled at 0.
    #[config(default = 0.0)]
    pub dropout: f64,
    #[config(default = 3)]
    pub kernel_size: usize,
    #[config(default = false)]
    pub use_bias: bool,
    /// Output activation.
    #[config(default = "Activation::Softmax")]
    pub activation: Activation,
}

impl SegmentationHeadConfig {
    /// Rejects kernels that cannot keep the feature map size.
    ///
    /// # Errors
    ///
    /// [`DeepLabError::InvalidConfiguration`] when `kernel_size` is zero or
    /// even.
    pub fn validate(&self) -> DeepLabResult<()> {
        if self.kernel_size % 2 == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "segmentation head kernel_size must be odd, got {}",
                    self.kernel_size
                ),
            });
        }
        Ok(())
    }

    /// Build a head that consumes feature maps with `in_channels` channels.
    ///
    /// `kernel_size` is expected to have passed [`SegmentationHeadConfig::validate`].
    pub fn init<B: Backend>(&self, in_channels: usize, device: &Device<B>) -> SegmentationHead<B> {
        let padding = self.kernel_size / 2;

        let mut convs = Vec::with_capacity(self.convolutions);
        let mut norms = Vec::with_capacity(self.convolutions);
        let mut channels = in_channels;
        for _ in 0..self.convolutions {
            convs.push(
                Conv2dConfig::new([channels, self.filters], [self.kernel_size, self.kernel_size])
                    .with_padding(PaddingConfig2d::Explicit(padding, padding))
                    .with_bias(self.use_bias)
                    .init(device),
            );
            norms.push(BatchNormConfig::new(self.filters).init(device));
            channels = self.filters;
        }

        let dropout = (self.dropout > 0.0).then(|| DropoutConfig::new(self.dropout).init());

        let output_conv = Conv2dConfig::new([channels, self.num_classes], [1, 1])
            .with_bias(false)
            .init(device);

        SegmentationHead {
            convs,
            norms,
            dropout,
            output_conv,
            config: Ignored(self.clone()),
        }
    }
}

/// Prediction head for segmentation.
///
/// Takes a [`FeaturePyramid`], picks its finest level and runs
/// `convolutions` conv-norm-activation blocks before projecting to one score
/// map per class.
///
/// # Shapes
///   - input (finest level): `[batch_size, channels, height, width]`
///   - output: `[batch_size, num_classes, height, width]`
///
/// The class projection runs in the backend float type. Its scores are cast
/// to `f32`, so only the output activation is computed in float32.
#[derive(Module, Debug)]
pub struct SegmentationHead<B: Backend> {
    convs: Vec<Conv2d<B>>,
    norms: Vec<BatchNorm<B, 2>>,
    dropout: Option<Dropout>,
    output_conv: Conv2d<B>,
    config: Ignored<SegmentationHeadConfig>,
}

impl<B: Backend> SegmentationHead<B> {
    /// Class probabilities (after the output activation).
    pub fn forward(&self, features: &FeaturePyramid<B>) -> Tensor<B, 4> {
        let logits = self.forward_logits(features);
        self.config.activation.forward(logits)
    }

    /// Class scores before the output activation.
    pub fn forward_logits(&self, features: &FeaturePyramid<B>) -> Tensor<B, 4> {
        let (_, x) = features.finest();
        let mut x = x.clone();

        for (conv, norm) in self.convs.iter().zip(&self.norms) {
            x = conv.forward(x);
            x = norm.forward(x);
            x = self.config.activations.forward(x);
            if let Some(dropout) = &self.dropout {
                x = dropout.forward(x);
            }
        }

        self.output_conv.forward(x).cast(FloatDType::F32)
    }

    /// Ids of the batch norm scale and shift parameters.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        self.norms
            .iter()
            .flat_map(|norm| [norm.gamma.id, norm.beta.id])
            .collect()
    }

    /// Number of conv blocks before the class projection.
    pub fn num_blocks(&self) -> usize {
        self.convs.len()
    }

    pub fn config(&self) -> SegmentationHeadConfig {
        self.config.0.clone()
    }
}
