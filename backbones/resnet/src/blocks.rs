//! ResNet building blocks: `BasicBlock`, `Bottleneck` and the `LayerBlock`
//! stage that chains them.

use core::f64::consts::SQRT_2;

use burn::{
    module::ParamId,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
    },
    prelude::*,
};

/// Bias-free convolution with "same" padding for odd kernels and Kaiming
/// (fan-out) initialization.
fn conv<B: Backend>(
    channels: [usize; 2],
    kernel: usize,
    stride: usize,
    device: &Device<B>,
) -> Conv2d<B> {
    let padding = kernel / 2;
    Conv2dConfig::new(channels, [kernel, kernel])
        .with_stride([stride, stride])
        .with_padding(PaddingConfig2d::Explicit(padding, padding))
        .with_bias(false)
        .with_initializer(Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        })
        .init(device)
}

/// Ids of the scale and shift parameters of a batch norm layer.
pub(crate) fn norm_param_ids<B: Backend>(norm: &BatchNorm<B, 2>) -> [ParamId; 2] {
    [norm.gamma.id, norm.beta.id]
}

#[derive(Module, Debug)]
pub enum ResidualBlock<B: Backend> {
    /// A bottleneck residual block.
    Bottleneck(Bottleneck<B>),
    /// A basic residual block.
    Basic(BasicBlock<B>),
}

impl<B: Backend> ResidualBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        match self {
            Self::Basic(block) => block.forward(input),
            Self::Bottleneck(block) => block.forward(input),
        }
    }

    pub(crate) fn collect_norm_params(&self, ids: &mut Vec<ParamId>) {
        match self {
            Self::Basic(block) => block.collect_norm_params(ids),
            Self::Bottleneck(block) => block.collect_norm_params(ids),
        }
    }
}

/// ResNet basic residual block implementation.
/// Derived from torchvision.models.resnet.BasicBlock
#[derive(Module, Debug)]
pub struct BasicBlock<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> BasicBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    fn collect_norm_params(&self, ids: &mut Vec<ParamId>) {
        ids.extend(norm_param_ids(&self.bn1));
        ids.extend(norm_param_ids(&self.bn2));
        if let Some(downsample) = &self.downsample {
            ids.extend(norm_param_ids(&downsample.bn));
        }
    }

    /// Create a new BasicBlock.
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        Self {
            conv1: conv([in_channels, out_channels], 3, stride, device),
            bn1: BatchNormConfig::new(out_channels).init(device),
            relu: Relu::new(),
            conv2: conv([out_channels, out_channels], 3, 1, device),
            bn2: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }
}

/// ResNet bottleneck residual block implementation.
/// Derived from torchvision.models.resnet.Bottleneck
///
/// **NOTE:** the stride for downsampling sits on the 3x3 convolution rather
/// than the first 1x1 convolution (ResNet V1.5).
#[derive(Module, Debug)]
pub struct Bottleneck<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    conv2: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv3: Conv2d<B>,
    bn3: BatchNorm<B, 2>,
    downsample: Option<Downsample<B>>,
}

impl<B: Backend> Bottleneck<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let identity = input.clone();

        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv2.forward(out);
        let out = self.bn2.forward(out);
        let out = self.relu.forward(out);
        let out = self.conv3.forward(out);
        let out = self.bn3.forward(out);

        let out = match &self.downsample {
            Some(downsample) => out + downsample.forward(identity),
            None => out + identity,
        };

        self.relu.forward(out)
    }

    fn collect_norm_params(&self, ids: &mut Vec<ParamId>) {
        for norm in [&self.bn1, &self.bn2, &self.bn3] {
            ids.extend(norm_param_ids(norm));
        }
        if let Some(downsample) = &self.downsample {
            ids.extend(norm_param_ids(&downsample.bn));
        }
    }

    /// Create a new Bottleneck.
    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        // expansion = 4
        let width = out_channels / 4;

        let downsample = (stride != 1 || in_channels != out_channels)
            .then(|| Downsample::new(in_channels, out_channels, stride, device));

        Self {
            conv1: conv([in_channels, width], 1, 1, device),
            bn1: BatchNormConfig::new(width).init(device),
            relu: Relu::new(),
            conv2: conv([width, width], 3, stride, device),
            bn2: BatchNormConfig::new(width).init(device),
            conv3: conv([width, out_channels], 1, 1, device),
            bn3: BatchNormConfig::new(out_channels).init(device),
            downsample,
        }
    }
}

/// 1x1 projection on the skip path when resolution or width changes.
#[derive(Module, Debug)]
pub struct Downsample<B: Backend> {
    conv: Conv2d<B>,
    bn: BatchNorm<B, 2>,
}

impl<B: Backend> Downsample<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv.forward(input);
        self.bn.forward(out)
    }

    pub fn new(in_channels: usize, out_channels: usize, stride: usize, device: &Device<B>) -> Self {
        Self {
            conv: conv([in_channels, out_channels], 1, stride, device),
            bn: BatchNormConfig::new(out_channels).init(device),
        }
    }
}

/// Collection of sequential residual blocks.
#[derive(Module, Debug)]
pub struct LayerBlock<B: Backend> {
    blocks: Vec<ResidualBlock<B>>,
}

impl<B: Backend> LayerBlock<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.blocks
            .iter()
            .fold(input, |out, block| block.forward(out))
    }

    /// Create a new LayerBlock. Only the first block is strided.
    pub fn new(
        num_blocks: usize,
        in_channels: usize,
        out_channels: usize,
        stride: usize,
        bottleneck: bool,
        device: &Device<B>,
    ) -> Self {
        let blocks = (0..num_blocks)
            .map(|b| {
                let (in_channels, stride) = if b == 0 {
                    (in_channels, stride)
                } else {
                    (out_channels, 1)
                };
                if bottleneck {
                    ResidualBlock::Bottleneck(Bottleneck::new(
                        in_channels,
                        out_channels,
                        stride,
                        device,
                    ))
                } else {
                    ResidualBlock::Basic(BasicBlock::new(in_channels, out_channels, stride, device))
                }
            })
            .collect();

        Self { blocks }
    }

    /// Scale and shift parameter ids of every batch norm in this stage.
    pub fn collect_norm_params(&self, ids: &mut Vec<ParamId>) {
        for block in &self.blocks {
            block.collect_norm_params(ids);
        }
    }

    /// Number of residual blocks in this stage.
    pub fn len(&self) -> usize {
        self.blocks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }
}
