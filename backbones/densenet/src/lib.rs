//! DenseNet feature extractor for DeepLab.
//!
//! Densely connected convolutional networks (Huang et al., CVPR 2017) without
//! the classification top. The outputs of the four dense blocks are exposed as
//! pyramid levels 2 to 5. Layer hyper-parameters follow the Keras
//! applications DenseNet (growth rate 32, 4x bottleneck, compression 0.5,
//! batch-norm epsilon 1.001e-5).

use burn::{
    module::ParamId,
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{AvgPool2d, AvgPool2dConfig, MaxPool2d, MaxPool2dConfig},
        BatchNorm, BatchNormConfig, PaddingConfig2d, Relu,
    },
    prelude::*,
};

const DENSENET121_BLOCKS: [usize; 4] = [6, 12, 24, 16];
const DENSENET169_BLOCKS: [usize; 4] = [6, 12, 32, 32];
const DENSENET201_BLOCKS: [usize; 4] = [6, 12, 48, 32];

const GROWTH_RATE: usize = 32;
const BN_EPSILON: f64 = 1.001e-5;
const STEM_CHANNELS: usize = 64;

/// Lowest pyramid level produced by the network.
pub const MIN_LEVEL: usize = 2;
/// Highest pyramid level produced by the network.
pub const MAX_LEVEL: usize = 5;

fn batch_norm<B: Backend>(channels: usize, device: &Device<B>) -> BatchNorm<B, 2> {
    BatchNormConfig::new(channels)
        .with_epsilon(BN_EPSILON)
        .init(device)
}

fn norm_param_ids<B: Backend>(norm: &BatchNorm<B, 2>) -> [ParamId; 2] {
    [norm.gamma.id, norm.beta.id]
}

/// DenseNet variants.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum DenseNetVariant {
    DenseNet121,
    DenseNet169,
    DenseNet201,
}

impl DenseNetVariant {
    /// Number of conv blocks in each of the four dense blocks.
    pub const fn blocks(&self) -> [usize; 4] {
        match self {
            Self::DenseNet121 => DENSENET121_BLOCKS,
            Self::DenseNet169 => DENSENET169_BLOCKS,
            Self::DenseNet201 => DENSENET201_BLOCKS,
        }
    }
}

/// DenseNet configuration.
#[derive(Config, Debug)]
pub struct DenseNetConfig {
    /// Network depth.
    pub variant: DenseNetVariant,
    /// Number of image channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl DenseNetConfig {
    /// Channel counts of levels 2 to 5, without building the network.
    pub fn output_channels(&self) -> [usize; 4] {
        let mut channels = STEM_CHANNELS;
        let mut out = [0; 4];
        for (i, blocks) in self.variant.blocks().into_iter().enumerate() {
            if i > 0 {
                // transition compression
                channels /= 2;
            }
            channels += blocks * GROWTH_RATE;
            out[i] = channels;
        }
        out
    }

    /// Initialize the DenseNet feature extractor.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DenseNetBackbone<B> {
        let stem_conv = Conv2dConfig::new([self.in_channels, STEM_CHANNELS], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut channels = STEM_CHANNELS;
        let mut dense_blocks = Vec::with_capacity(4);
        let mut transitions = Vec::with_capacity(3);
        for (i, blocks) in self.variant.blocks().into_iter().enumerate() {
            if i > 0 {
                transitions.push(TransitionBlock::new(channels, channels / 2, device));
                channels /= 2;
            }
            dense_blocks.push(DenseBlock::new(blocks, channels, device));
            channels += blocks * GROWTH_RATE;
        }

        DenseNetBackbone {
            stem_conv,
            stem_bn: batch_norm(STEM_CHANNELS, device),
            stem_pool,
            dense_blocks,
            transitions,
            final_bn: batch_norm(channels, device),
            relu: Relu::new(),
            channels: self.output_channels(),
        }
    }
}

/// DenseNet feature extractor.
#[derive(Module, Debug)]
pub struct DenseNetBackbone<B: Backend> {
    stem_conv: Conv2d<B>,
    stem_bn: BatchNorm<B, 2>,
    stem_pool: MaxPool2d,
    dense_blocks: Vec<DenseBlock<B>>,
    transitions: Vec<TransitionBlock<B>>,
    final_bn: BatchNorm<B, 2>,
    relu: Relu,
    channels: [usize; 4],
}

impl<B: Backend> DenseNetBackbone<B> {
    /// Forward pass returning the feature maps of levels 2, 3, 4 and 5.
    pub fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        let x = self.stem_conv.forward(input);
        let x = self.stem_bn.forward(x);
        let x = self.relu.forward(x);
        let x = self.stem_pool.forward(x);

        let c2 = self.dense_blocks[0].forward(x);
        let c3 = self.dense_blocks[1].forward(self.transitions[0].forward(c2.clone()));
        let c4 = self.dense_blocks[2].forward(self.transitions[1].forward(c3.clone()));
        let c5 = self.dense_blocks[3].forward(self.transitions[2].forward(c4.clone()));
        let c5 = self.relu.forward(self.final_bn.forward(c5));

        [c2, c3, c4, c5]
    }

    /// Feature map at a single `level` (2..=5). Blocks past `level` are not run.
    pub fn forward_level(&self, input: Tensor<B, 4>, level: usize) -> Tensor<B, 4> {
        let x = self.stem_conv.forward(input);
        let x = self.relu.forward(self.stem_bn.forward(x));
        let x = self.stem_pool.forward(x);

        let x = self
            .transitions
            .iter()
            .zip(&self.dense_blocks[1..])
            .take(level.saturating_sub(MIN_LEVEL))
            .fold(self.dense_blocks[0].forward(x), |x, (transition, block)| {
                block.forward(transition.forward(x))
            });

        if level >= MAX_LEVEL {
            self.relu.forward(self.final_bn.forward(x))
        } else {
            x
        }
    }

    /// Ids of the batch norm scale and shift parameters.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        let mut ids = Vec::new();
        ids.extend(norm_param_ids(&self.stem_bn));
        for block in &self.dense_blocks {
            for layer in &block.layers {
                ids.extend(norm_param_ids(&layer.bn1));
                ids.extend(norm_param_ids(&layer.bn2));
            }
        }
        for transition in &self.transitions {
            ids.extend(norm_param_ids(&transition.bn));
        }
        ids.extend(norm_param_ids(&self.final_bn));
        ids
    }

    /// Channel count of levels 2 to 5.
    pub fn output_channels(&self) -> [usize; 4] {
        self.channels
    }

    /// Spatial size `[height, width]` of the feature map at `level` for an
    /// input of size `input_size`.
    ///
    /// The stem (stride-2 conv, stride-2 max pool) maps `s` to `ceil(s / 2)`
    /// twice; every transition's 2x2 average pool maps `s` to `floor(s / 2)`.
    pub fn output_size(input_size: [usize; 2], level: usize) -> [usize; 2] {
        let side = |s: usize| {
            let stem = s.div_ceil(2).div_ceil(2);
            (MIN_LEVEL..level).fold(stem, |s, _| s / 2)
        };
        [side(input_size[0]), side(input_size[1])]
    }
}

/// Stack of conv blocks, each concatenating `GROWTH_RATE` new channels onto
/// its input.
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<ConvBlock<B>>,
}

impl<B: Backend> DenseBlock<B> {
    pub fn new(num_layers: usize, in_channels: usize, device: &Device<B>) -> Self {
        let layers = (0..num_layers)
            .map(|i| ConvBlock::new(in_channels + i * GROWTH_RATE, device))
            .collect();
        Self { layers }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(input, |x, layer| layer.forward(x))
    }
}

/// BN-ReLU-Conv1x1-BN-ReLU-Conv3x3, concatenated with its input.
#[derive(Module, Debug)]
pub struct ConvBlock<B: Backend> {
    bn1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    bn2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    relu: Relu,
}

impl<B: Backend> ConvBlock<B> {
    pub fn new(in_channels: usize, device: &Device<B>) -> Self {
        let bottleneck = 4 * GROWTH_RATE;
        Self {
            bn1: batch_norm(in_channels, device),
            conv1: Conv2dConfig::new([in_channels, bottleneck], [1, 1])
                .with_bias(false)
                .init(device),
            bn2: batch_norm(bottleneck, device),
            conv2: Conv2dConfig::new([bottleneck, GROWTH_RATE], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            relu: Relu::new(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn1.forward(input.clone()));
        let x = self.conv1.forward(x);
        let x = self.relu.forward(self.bn2.forward(x));
        let x = self.conv2.forward(x);
        Tensor::cat(vec![input, x], 1)
    }
}

/// BN-ReLU-Conv1x1 followed by a 2x2 average pool.
#[derive(Module, Debug)]
pub struct TransitionBlock<B: Backend> {
    bn: BatchNorm<B, 2>,
    relu: Relu,
    conv: Conv2d<B>,
    pool: AvgPool2d,
}

impl<B: Backend> TransitionBlock<B> {
    pub fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        Self {
            bn: batch_norm(in_channels, device),
            relu: Relu::new(),
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
        }
    }

    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.relu.forward(self.bn.forward(input));
        let x = self.conv.forward(x);
        self.pool.forward(x)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_output_channels_per_variant() {
        assert_eq!(
            DenseNetConfig::new(DenseNetVariant::DenseNet121).output_channels(),
            [256, 512, 1024, 1024]
        );
        assert_eq!(
            DenseNetConfig::new(DenseNetVariant::DenseNet169).output_channels(),
            [256, 512, 1280, 1664]
        );
        assert_eq!(
            DenseNetConfig::new(DenseNetVariant::DenseNet201).output_channels(),
            [256, 512, 1792, 1920]
        );
    }

    #[test]
    fn test_densenet121_forward() {
        let device = Default::default();
        let model = DenseNetConfig::new(DenseNetVariant::DenseNet121).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let output = model.forward(input);

        assert_eq!(output[0].dims(), [1, 256, 16, 16]);
        assert_eq!(output[1].dims(), [1, 512, 8, 8]);
        assert_eq!(output[2].dims(), [1, 1024, 4, 4]);
        assert_eq!(output[3].dims(), [1, 1024, 2, 2]);
    }

    #[test]
    fn test_forward_level_matches_full_forward() {
        let device = Default::default();
        let model = DenseNetConfig::new(DenseNetVariant::DenseNet121).init::<TestBackend>(&device);
        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 32, 32],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );

        let pyramid = model.forward(input.clone());
        for level in MIN_LEVEL..=MAX_LEVEL {
            model
                .forward_level(input.clone(), level)
                .into_data()
                .assert_approx_eq::<f32>(
                    &pyramid[level - MIN_LEVEL].clone().into_data(),
                    burn::tensor::Tolerance::absolute(1e-5),
                );
        }
    }

    #[test]
    fn test_normalization_params_cover_every_batch_norm() {
        let device = Default::default();
        let model = DenseNetConfig::new(DenseNetVariant::DenseNet121).init::<TestBackend>(&device);

        // stem, 58 conv blocks x 2, 3 transitions, final
        let layers: usize = DenseNetVariant::DenseNet121.blocks().iter().sum();
        assert_eq!(layers, 58);
        assert_eq!(model.normalization_params().len(), 2 * (1 + 2 * layers + 3 + 1));
    }

    #[test]
    fn test_output_size_on_odd_input() {
        // 50 -> 25 -> 13 (stem), then 6, 3, 1
        assert_eq!(
            DenseNetBackbone::<TestBackend>::output_size([50, 50], 2),
            [13, 13]
        );
        assert_eq!(
            DenseNetBackbone::<TestBackend>::output_size([50, 50], 5),
            [1, 1]
        );
    }
}
