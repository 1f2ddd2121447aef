//! Backbone implementations for DeepLab
//!
//! This crate provides a unified interface over the feature extractors that can
//! sit in front of the segmentation head: ResNet and DenseNet. Each backbone
//! produces a pyramid of feature maps at levels 2 to 5 (stride `2^level`) and
//! hands one configured level to the model.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use burn::{
    module::{Ignored, ParamId},
    prelude::*,
};
use thiserror::Error;

pub use densenet::{DenseNetBackbone, DenseNetConfig, DenseNetVariant};
pub use resnet::{ResNetBackbone, ResNetConfig, ResNetVariant};

/// Lowest pyramid level a backbone can expose.
pub const MIN_LEVEL: usize = 2;
/// Highest pyramid level a backbone can expose.
pub const MAX_LEVEL: usize = 5;

/// Errors raised while describing or building a backbone.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum BackboneError {
    /// The backbone description names no known network.
    #[error("unknown backbone '{kind}' - available backbones: {available}")]
    UnknownKind {
        /// The name that failed to parse.
        kind: String,
        /// Comma separated list of accepted names.
        available: String,
    },

    /// The requested pyramid level is not produced by the network.
    #[error("pyramid level {level} is out of range ({MIN_LEVEL}..={MAX_LEVEL})")]
    InvalidLevel {
        /// The requested level.
        level: usize,
    },
}

/// Image input description. Height and width may be left unresolved.
#[derive(Config, Debug, PartialEq, Eq)]
pub struct InputShape {
    /// Image height, `None` when unknown.
    #[config(default = "None")]
    pub height: Option<usize>,
    /// Image width, `None` when unknown.
    #[config(default = "None")]
    pub width: Option<usize>,
    /// Number of image channels.
    #[config(default = 3)]
    pub channels: usize,
}

impl InputShape {
    /// Fully resolved input shape.
    pub const fn fixed(height: usize, width: usize, channels: usize) -> Self {
        Self {
            height: Some(height),
            width: Some(width),
            channels,
        }
    }

    /// `[height, width]` when both are known.
    pub fn spatial(&self) -> Option<[usize; 2]> {
        Some([self.height?, self.width?])
    }
}

/// Supported backbone networks.
#[derive(Clone, Debug, PartialEq, Eq, Hash, burn::serde::Serialize, burn::serde::Deserialize)]
#[serde(crate = "burn::serde")]
pub enum BackboneKind {
    ResNet18,
    ResNet34,
    ResNet50,
    ResNet101,
    ResNet152,
    DenseNet121,
    DenseNet169,
    DenseNet201,
}

impl BackboneKind {
    /// Every supported backbone.
    pub const ALL: [Self; 8] = [
        Self::ResNet18,
        Self::ResNet34,
        Self::ResNet50,
        Self::ResNet101,
        Self::ResNet152,
        Self::DenseNet121,
        Self::DenseNet169,
        Self::DenseNet201,
    ];

    /// Canonical name, identical to the serialized form.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::ResNet18 => "ResNet18",
            Self::ResNet34 => "ResNet34",
            Self::ResNet50 => "ResNet50",
            Self::ResNet101 => "ResNet101",
            Self::ResNet152 => "ResNet152",
            Self::DenseNet121 => "DenseNet121",
            Self::DenseNet169 => "DenseNet169",
            Self::DenseNet201 => "DenseNet201",
        }
    }
}

impl FromStr for BackboneKind {
    type Err = BackboneError;

    /// Case-insensitive; `-` and `_` separators are ignored
    /// (`"resnet_50"` parses as `ResNet50`).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized: String = s
            .chars()
            .filter(|c| *c != '-' && *c != '_')
            .collect::<String>()
            .to_ascii_lowercase();

        Self::ALL
            .into_iter()
            .find(|kind| kind.name().to_ascii_lowercase() == normalized)
            .ok_or_else(|| BackboneError::UnknownKind {
                kind: s.to_owned(),
                available: Self::ALL
                    .iter()
                    .map(Self::name)
                    .collect::<Vec<_>>()
                    .join(", "),
            })
    }
}

impl fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Unified backbone trait.
///
/// Anything that can be composed into a segmentation model must turn an image
/// tensor into a feature tensor and predict the feature shape for a given
/// input shape without running the network.
pub trait Backbone<B: Backend> {
    /// Feature map at the configured pyramid level.
    ///
    /// # Shapes
    /// * `input` - `[batch_size, channels, height, width]`
    /// * returns - `[batch_size, output_channels, height / 2^level, width / 2^level]`
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4>;

    /// Every pyramid level the network produces, keyed by level.
    fn forward_pyramid(&self, input: Tensor<B, 4>) -> BTreeMap<usize, Tensor<B, 4>>;

    /// Channel count of the feature map returned by [`Backbone::forward`].
    fn output_channels(&self) -> usize;

    /// Declared image input shape.
    fn input_shape(&self) -> InputShape;

    /// Shape of the feature map returned by [`Backbone::forward`] for an input
    /// of shape `[batch_size, channels, height, width]`.
    fn compute_output_shape(&self, input_shape: [usize; 4]) -> [usize; 4];
}

/// Configuration of a backbone: which network, which level, which input.
#[derive(Config, Debug)]
pub struct BackboneConfig {
    /// Network to build.
    pub kind: BackboneKind,
    /// Declared input shape.
    #[config(default = "InputShape::new()")]
    pub input_shape: InputShape,
    /// Pyramid level handed to the model.
    #[config(default = 5)]
    pub level: usize,
}

impl BackboneConfig {
    /// Build the backbone.
    ///
    /// # Errors
    ///
    /// Returns [`BackboneError::InvalidLevel`] when `level` is outside 2..=5.
    pub fn init<B: Backend>(&self, device: &Device<B>) -> Result<BackboneWrapper<B>, BackboneError> {
        if !(MIN_LEVEL..=MAX_LEVEL).contains(&self.level) {
            return Err(BackboneError::InvalidLevel { level: self.level });
        }

        let in_channels = self.input_shape.channels;
        let network = match self.kind {
            BackboneKind::ResNet18 => BackboneNetwork::ResNet(ResNetBackbone::resnet18(in_channels, device)),
            BackboneKind::ResNet34 => BackboneNetwork::ResNet(ResNetBackbone::resnet34(in_channels, device)),
            BackboneKind::ResNet50 => BackboneNetwork::ResNet(ResNetBackbone::resnet50(in_channels, device)),
            BackboneKind::ResNet101 => {
                BackboneNetwork::ResNet(ResNetBackbone::resnet101(in_channels, device))
            }
            BackboneKind::ResNet152 => {
                BackboneNetwork::ResNet(ResNetBackbone::resnet152(in_channels, device))
            }
            BackboneKind::DenseNet121 => BackboneNetwork::DenseNet(
                DenseNetConfig::new(DenseNetVariant::DenseNet121)
                    .with_in_channels(in_channels)
                    .init(device),
            ),
            BackboneKind::DenseNet169 => BackboneNetwork::DenseNet(
                DenseNetConfig::new(DenseNetVariant::DenseNet169)
                    .with_in_channels(in_channels)
                    .init(device),
            ),
            BackboneKind::DenseNet201 => BackboneNetwork::DenseNet(
                DenseNetConfig::new(DenseNetVariant::DenseNet201)
                    .with_in_channels(in_channels)
                    .init(device),
            ),
        };

        Ok(BackboneWrapper {
            network,
            kind: Ignored(self.kind.clone()),
            input_shape: Ignored(self.input_shape.clone()),
            level: self.level,
        })
    }
}

/// Enum to wrap different backbone implementations
#[derive(Module, Debug)]
pub enum BackboneNetwork<B: Backend> {
    /// ResNet backbone
    ResNet(ResNetBackbone<B>),
    /// DenseNet backbone
    DenseNet(DenseNetBackbone<B>),
}

impl<B: Backend> BackboneNetwork<B> {
    fn forward(&self, input: Tensor<B, 4>) -> [Tensor<B, 4>; 4] {
        match self {
            Self::ResNet(backbone) => backbone.forward(input),
            Self::DenseNet(backbone) => backbone.forward(input),
        }
    }

    fn forward_level(&self, input: Tensor<B, 4>, level: usize) -> Tensor<B, 4> {
        match self {
            Self::ResNet(backbone) => backbone.forward_level(input, level),
            Self::DenseNet(backbone) => backbone.forward_level(input, level),
        }
    }

    fn normalization_params(&self) -> Vec<ParamId> {
        match self {
            Self::ResNet(backbone) => backbone.normalization_params(),
            Self::DenseNet(backbone) => backbone.normalization_params(),
        }
    }

    fn output_channels(&self) -> [usize; 4] {
        match self {
            Self::ResNet(backbone) => backbone.output_channels(),
            Self::DenseNet(backbone) => backbone.output_channels(),
        }
    }

    fn output_size(&self, input_size: [usize; 2], level: usize) -> [usize; 2] {
        match self {
            Self::ResNet(_) => ResNetBackbone::<B>::output_size(input_size, level),
            Self::DenseNet(_) => DenseNetBackbone::<B>::output_size(input_size, level),
        }
    }
}

/// A built backbone together with its declared input shape and the pyramid
/// level it feeds to the model.
#[derive(Module, Debug)]
pub struct BackboneWrapper<B: Backend> {
    network: BackboneNetwork<B>,
    kind: Ignored<BackboneKind>,
    input_shape: Ignored<InputShape>,
    level: usize,
}

impl<B: Backend> BackboneWrapper<B> {
    /// Which network this is.
    pub fn kind(&self) -> &BackboneKind {
        &self.kind.0
    }

    /// Pyramid level returned by [`Backbone::forward`].
    pub const fn level(&self) -> usize {
        self.level
    }

    /// Ids of the batch norm scale and shift parameters.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        self.network.normalization_params()
    }

    /// Configuration that rebuilds an equivalent (freshly initialized) backbone.
    pub fn config(&self) -> BackboneConfig {
        BackboneConfig::new(self.kind.0.clone())
            .with_input_shape(self.input_shape.0.clone())
            .with_level(self.level)
    }
}

impl<B: Backend> Backbone<B> for BackboneWrapper<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.network.forward_level(input, self.level)
    }

    fn forward_pyramid(&self, input: Tensor<B, 4>) -> BTreeMap<usize, Tensor<B, 4>> {
        (MIN_LEVEL..=MAX_LEVEL)
            .zip(self.network.forward(input))
            .collect()
    }

    fn output_channels(&self) -> usize {
        self.network.output_channels()[self.level - MIN_LEVEL]
    }

    fn input_shape(&self) -> InputShape {
        self.input_shape.0.clone()
    }

    fn compute_output_shape(&self, input_shape: [usize; 4]) -> [usize; 4] {
        let [batch_size, _, height, width] = input_shape;
        let [out_height, out_width] = self.network.output_size([height, width], self.level);
        [batch_size, self.output_channels(), out_height, out_width]
    }
}

/// Factory function to create backbones
pub fn create_backbone<B: Backend>(
    config: &BackboneConfig,
    device: &Device<B>,
) -> Result<BackboneWrapper<B>, BackboneError> {
    config.init(device)
}
