//! Atrous Spatial Pyramid Pooling (ASPP).
//!
//! Captures multi-scale context with parallel branches over the same feature
//! map: a 1x1 convolution, one dilated 3x3 convolution per dilation rate and
//! an image-level pooling branch. The branches are concatenated and projected
//! back to `num_channels`.

use burn::{
    module::{Ignored, ParamId},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, PaddingConfig2d,
    },
    prelude::*,
};

use super::{
    activation::Activation,
    utils::{resize, Interpolation},
};

/// Configuration for [`SpatialPyramidPooling`].
#[derive(Config, Debug)]
pub struct SpatialPyramidPoolingConfig {
    /// Dilation rate of each 3x3 branch. May be empty.
    pub dilation_rates: Vec<usize>,
    /// Channels of every branch and of the output.
    #[config(default = 256)]
    pub num_channels: usize,
    #[config(default = "Activation::Relu")]
    pub activation: Activation,
    /// Dropout applied after the projection.
    #[config(default = 0.0)]
    pub dropout: f64,
}

impl SpatialPyramidPoolingConfig {
    /// Build the module for an input with `in_channels` channels.
    pub fn init<B: Backend>(
        &self,
        in_channels: usize,
        interpolation: Interpolation,
        device: &Device<B>,
    ) -> SpatialPyramidPooling<B> {
        let mut branches = Vec::with_capacity(self.dilation_rates.len() + 1);
        branches.push(ConvBranch::new(in_channels, self.num_channels, 1, 1, device));
        branches.extend(
            self.dilation_rates
                .iter()
                .map(|&rate| ConvBranch::new(in_channels, self.num_channels, 3, rate, device)),
        );

        let pooling = PoolingBranch {
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            branch: ConvBranch::new(in_channels, self.num_channels, 1, 1, device),
        };

        let concat_channels = self.num_channels * (branches.len() + 1);
        let projection = ConvBranch::new(concat_channels, self.num_channels, 1, 1, device);

        SpatialPyramidPooling {
            branches,
            pooling,
            projection,
            dropout: DropoutConfig::new(self.dropout).init(),
            interpolation: Ignored(interpolation),
            config: Ignored(self.clone()),
        }
    }
}

/// Conv -> BatchNorm, followed by the module activation.
#[derive(Module, Debug)]
pub struct ConvBranch<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> ConvBranch<B> {
    fn new(
        in_channels: usize,
        out_channels: usize,
        kernel_size: usize,
        dilation: usize,
        device: &Device<B>,
    ) -> Self {
        // "same" padding for odd kernels
        let padding = dilation * (kernel_size - 1) / 2;
        let conv = Conv2dConfig::new([in_channels, out_channels], [kernel_size, kernel_size])
            .with_padding(PaddingConfig2d::Explicit(padding, padding))
            .with_dilation([dilation, dilation])
            .with_bias(false)
            .init(device);

        Self {
            conv,
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }

    fn forward(&self, x: Tensor<B, 4>, activation: &Activation) -> Tensor<B, 4> {
        let x = self.conv.forward(x);
        let x = self.bn.forward(x);
        activation.forward(x)
    }

    fn norm_params(&self) -> [ParamId; 2] {
        [self.bn.gamma.id, self.bn.beta.id]
    }
}

/// Image-level features: global average pool, 1x1 conv branch.
#[derive(Module, Debug)]
pub struct PoolingBranch<B: Backend> {
    pool: AdaptiveAvgPool2d,
    branch: ConvBranch<B>,
}

/// Atrous spatial pyramid pooling.
///
/// # Shapes
///   - input: `[batch_size, in_channels, height, width]`
///   - output: `[batch_size, num_channels, height, width]`
#[derive(Module, Debug)]
pub struct SpatialPyramidPooling<B: Backend> {
    /// 1x1 branch followed by one dilated branch per rate.
    branches: Vec<ConvBranch<B>>,
    pooling: PoolingBranch<B>,
    projection: ConvBranch<B>,
    dropout: Dropout,
    interpolation: Ignored<Interpolation>,
    config: Ignored<SpatialPyramidPoolingConfig>,
}

impl<B: Backend> SpatialPyramidPooling<B> {
    pub fn forward(&self, x: Tensor<B, 4>) -> Tensor<B, 4> {
        let [_, _, height, width] = x.dims();
        let activation = &self.config.activation;

        let mut features: Vec<Tensor<B, 4>> = self
            .branches
            .iter()
            .map(|branch| branch.forward(x.clone(), activation))
            .collect();

        let pooled = self.pooling.pool.forward(x);
        let pooled = self.pooling.branch.forward(pooled, activation);
        features.push(resize(pooled, [height, width], &self.interpolation.0));

        let x = Tensor::cat(features, 1);
        let x = self.projection.forward(x, activation);
        self.dropout.forward(x)
    }

    /// Number of parallel branches, including the pooling branch.
    pub fn num_branches(&self) -> usize {
        self.branches.len() + 1
    }

    /// Ids of the batch norm scale and shift parameters of every branch.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        self.branches
            .iter()
            .chain([&self.pooling.branch, &self.projection])
            .flat_map(ConvBranch::norm_params)
            .collect()
    }

    /// Configuration that rebuilds this module.
    pub fn config(&self) -> SpatialPyramidPoolingConfig {
        self.config.0.clone()
    }
}
