//! ResNet feature extractor for DeepLab.
//!
//! This crate provides ResNet models adapted for use as segmentation encoders.
//! The implementation is based on the official torchvision ResNet implementation
//! with the classification top removed. The four residual stages are exposed as
//! pyramid levels 2 to 5, at strides 4, 8, 16 and 32.

use burn::module::ParamId;
use burn::nn::{
    conv::{Conv2d, Conv2dConfig},
    pool::{MaxPool2d, MaxPool2dConfig},
    BatchNorm, BatchNormConfig, Initializer, PaddingConfig2d, Relu,
};
use burn::prelude::*;
use core::f64::consts::SQRT_2;

mod blocks;
pub use blocks::*;
use blocks::norm_param_ids;

// ResNet residual layer block configs
const RESNET18_BLOCKS: [usize; 4] = [2, 2, 2, 2];
const RESNET34_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET50_BLOCKS: [usize; 4] = [3, 4, 6, 3];
const RESNET101_BLOCKS: [usize; 4] = [3, 4, 23, 3];
const RESNET152_BLOCKS: [usize; 4] = [3, 8, 36, 3];

/// Lowest pyramid level produced by the network.
pub const MIN_LEVEL: usize = 2;
/// Highest pyramid level produced by the network.
pub const MAX_LEVEL: usize = 5;

/// ResNet feature extractor.
///
/// Produces the outputs of the four residual stages (`layer1`..`layer4`).
/// Derived from torchvision.models.resnet.ResNet
#[derive(Module, Debug)]
pub struct ResNetBackbone<B: Backend> {
    // Level 2: conv1 + bn1 + relu + maxpool + layer1
    pub conv1_block: Conv1Block<B>,
    pub layer1: LayerBlock<B>,

    // Level 3
    pub layer2: LayerBlock<B>,

    // Level 4
    pub layer3: LayerBlock<B>,

    // Level 5
    pub layer4: LayerBlock<B>,

    expansion: usize,
}

impl<B: Backend> ResNetBackbone<B> {
    /// Forward pass returning the feature maps of levels 2, 3, 4 and 5.
    pub fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        let c2 = self.conv1_block.forward(input);
        let c2 = self.layer1.forward(c2);
        let c3 = self.layer2.forward(c2.clone());
        let c4 = self.layer3.forward(c3.clone());
        let c5 = self.layer4.forward(c4.clone());

        [c2, c3, c4, c5]
    }

    /// Feature map at a single `level` (2..=5). Stages past `level` are not run.
    pub fn forward_level(&self, input: Tensor<B, 4>, level: usize) -> Tensor<B, 4> {
        let x = self.layer1.forward(self.conv1_block.forward(input));
        [&self.layer2, &self.layer3, &self.layer4]
            .into_iter()
            .take(level.saturating_sub(MIN_LEVEL))
            .fold(x, |x, layer| layer.forward(x))
    }

    /// Ids of the batch norm scale and shift parameters.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        let mut ids = norm_param_ids(&self.conv1_block.bn1).to_vec();
        for layer in [&self.layer1, &self.layer2, &self.layer3, &self.layer4] {
            layer.collect_norm_params(&mut ids);
        }
        ids
    }

    /// Channel count of levels 2 to 5.
    pub fn output_channels(&self) -> [usize; 4] {
        let e = self.expansion;
        [64 * e, 128 * e, 256 * e, 512 * e]
    }

    /// Spatial size `[height, width]` of the feature map at `level` for an
    /// input of size `input_size`.
    ///
    /// Every stride-2 stage (stem conv, max pool, first block of layers 2-4)
    /// maps a side of length `s` to `ceil(s / 2)`.
    pub fn output_size(input_size: [usize; 2], level: usize) -> [usize; 2] {
        let halve = |s: usize| (0..level).fold(s, |s, _| s.div_ceil(2));
        [halve(input_size[0]), halve(input_size[1])]
    }

    /// Create ResNet-18 backbone.
    pub fn resnet18(in_channels: usize, device: &Device<B>) -> Self {
        Self::new(RESNET18_BLOCKS, 1, in_channels, device)
    }

    /// Create ResNet-34 backbone.
    pub fn resnet34(in_channels: usize, device: &Device<B>) -> Self {
        Self::new(RESNET34_BLOCKS, 1, in_channels, device)
    }

    /// Create ResNet-50 backbone.
    pub fn resnet50(in_channels: usize, device: &Device<B>) -> Self {
        Self::new(RESNET50_BLOCKS, 4, in_channels, device)
    }

    /// Create ResNet-101 backbone.
    pub fn resnet101(in_channels: usize, device: &Device<B>) -> Self {
        Self::new(RESNET101_BLOCKS, 4, in_channels, device)
    }

    /// Create ResNet-152 backbone.
    pub fn resnet152(in_channels: usize, device: &Device<B>) -> Self {
        Self::new(RESNET152_BLOCKS, 4, in_channels, device)
    }

    fn new(blocks: [usize; 4], expansion: usize, in_channels: usize, device: &Device<B>) -> Self {
        assert!(
            expansion == 1 || expansion == 4,
            "ResNet backbone only supports expansion values [1, 4] for residual blocks"
        );

        // 7x7 conv, 64, stride=2, padding=3
        let conv1_block = Conv1Block::new(in_channels, 64, device);

        let bottleneck = expansion > 1;
        let layer1 = LayerBlock::new(blocks[0], 64, 64 * expansion, 1, bottleneck, device);
        let layer2 = LayerBlock::new(
            blocks[1],
            64 * expansion,
            128 * expansion,
            2,
            bottleneck,
            device,
        );
        let layer3 = LayerBlock::new(
            blocks[2],
            128 * expansion,
            256 * expansion,
            2,
            bottleneck,
            device,
        );
        let layer4 = LayerBlock::new(
            blocks[3],
            256 * expansion,
            512 * expansion,
            2,
            bottleneck,
            device,
        );

        Self {
            conv1_block,
            layer1,
            layer2,
            layer3,
            layer4,
            expansion,
        }
    }
}

/// First conv block: conv1 + bn1 + relu + maxpool
#[derive(Module, Debug)]
pub struct Conv1Block<B: Backend> {
    conv1: Conv2d<B>,
    bn1: BatchNorm<B, 2>,
    relu: Relu,
    maxpool: MaxPool2d,
}

impl<B: Backend> Conv1Block<B> {
    pub fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let out = self.conv1.forward(input);
        let out = self.bn1.forward(out);
        let out = self.relu.forward(out);
        self.maxpool.forward(out)
    }

    /// Create a new Conv1Block.
    pub fn new(in_channels: usize, out_channels: usize, device: &Device<B>) -> Self {
        let initializer = Initializer::KaimingNormal {
            gain: SQRT_2,
            fan_out_only: true,
        };

        let conv1 = Conv2dConfig::new([in_channels, out_channels], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .with_initializer(initializer)
            .init(device);

        let bn1 = BatchNormConfig::new(out_channels).init(device);

        let maxpool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        Self {
            conv1,
            bn1,
            relu: Relu::new(),
            maxpool,
        }
    }
}

/// ResNet variants.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum ResNetVariant {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
}

/// ResNet configuration.
#[derive(Config, Debug)]
pub struct ResNetConfig {
    /// Network depth.
    pub variant: ResNetVariant,
    /// Number of image channels.
    #[config(default = 3)]
    pub in_channels: usize,
}

impl ResNetConfig {
    /// Initialize the ResNet feature extractor.
    pub fn init<B: Backend>(&self, device: &B::Device) -> ResNetBackbone<B> {
        match self.variant {
            ResNetVariant::ResNet18 => ResNetBackbone::resnet18(self.in_channels, device),
            ResNetVariant::ResNet34 => ResNetBackbone::resnet34(self.in_channels, device),
            ResNetVariant::ResNet50 => ResNetBackbone::resnet50(self.in_channels, device),
            ResNetVariant::ResNet101 => ResNetBackbone::resnet101(self.in_channels, device),
            ResNetVariant::ResNet152 => ResNetBackbone::resnet152(self.in_channels, device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_resnet18_forward() {
        let device = Default::default();
        let model = ResNetConfig::new(ResNetVariant::ResNet18).init::<TestBackend>(&device);

        let input = Tensor::<TestBackend, 4>::random(
            [1, 3, 64, 64],
            burn::tensor::Distribution::Normal(0.0, 1.0),
            &device,
        );
        let output = model.forward(input);

        // Check output shapes for ResNet18 (expansion=1)
        assert_eq!(output[0].dims(), [1, 64, 16, 16]); // 64/4
        assert_eq!(output[1].dims(), [1, 128, 8, 8]);
        assert_eq!(output[2].dims(), [1, 256, 4, 4]);
        assert_eq!(output[3].dims(), [1, 512, 2, 2]);
        assert_eq!(model.output_channels(), [64, 128, 256, 512]);
    }

    #[test]
    fn test_forward_level_matches_full_forward() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::resnet18(3, &device);
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
                .assert_eq(&pyramid[level - MIN_LEVEL].clone().into_data(), true);
        }
    }

    #[test]
    fn test_normalization_params_cover_every_batch_norm() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::resnet18(3, &device);

        // stem + 8 basic blocks x 2 + 3 downsample projections
        assert_eq!(model.normalization_params().len(), 2 * (1 + 16 + 3));
    }

    #[test]
    fn test_resnet50_channels() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::resnet50(3, &device);
        assert_eq!(model.output_channels(), [256, 512, 1024, 2048]);
        assert_eq!(model.layer3.len(), 6);
    }

    #[test]
    fn test_output_size_matches_forward_on_odd_input() {
        let device = Default::default();
        let model = ResNetBackbone::<TestBackend>::resnet18(1, &device);

        let input = Tensor::<TestBackend, 4>::zeros([1, 1, 45, 37], &device);
        let output = model.forward(input);

        for (i, feature) in output.iter().enumerate() {
            let [_, _, h, w] = feature.dims();
            assert_eq!(
                ResNetBackbone::<TestBackend>::output_size([45, 37], MIN_LEVEL + i),
                [h, w]
            );
        }
    }

    #[test]
    fn test_output_size_arithmetic() {
        assert_eq!(ResNetBackbone::<TestBackend>::output_size([512, 512], 5), [16, 16]);
        assert_eq!(ResNetBackbone::<TestBackend>::output_size([224, 224], 4), [14, 14]);
        assert_eq!(ResNetBackbone::<TestBackend>::output_size([65, 65], 2), [17, 17]);
    }
}
