//! DeepLabV3 model composer.
//!
//! Wires a backbone, atrous spatial pyramid pooling and a segmentation head
//! into one module:
//!
//! ```text
//! images -> backbone -> ASPP -> upsample (x factor) -> head -> class scores
//! ```
//!
//! The upsampling factor is `input_size / backbone_output_size` per spatial
//! axis (integer division), so the output resolution equals the input
//! resolution whenever the input is divisible by the backbone output stride.

use std::path::Path;
use std::str::FromStr;

use backbones::{create_backbone, Backbone, BackboneConfig, BackboneKind, BackboneWrapper, InputShape};
use burn::{
    module::{Ignored, ParamId},
    prelude::*,
};
use tracing::{debug, warn};

use super::{
    activation::Activation,
    head::{SegmentationHead, SegmentationHeadConfig},
    pyramid::FeaturePyramid,
    spatial_pyramid::{SpatialPyramidPooling, SpatialPyramidPoolingConfig},
    utils::{upsample, Interpolation},
};
use crate::{
    error::{DeepLabError, DeepLabResult},
    weights::{load_weights_file, WeightsReference},
};

/// Dilation rates of the default spatial pyramid pooling module.
pub const DEFAULT_DILATION_RATES: [usize; 3] = [6, 12, 18];

/// Pyramid level under which the upsampled features are handed to the head.
const HEAD_INPUT_LEVEL: usize = 1;

/// Configuration for the [`DeepLabV3`] model.
#[derive(Config, Debug)]
pub struct DeepLabV3Config {
    /// Number of classes, background included.
    pub num_classes: usize,
    /// Backbone network and the pyramid level it feeds to the model.
    pub backbone: BackboneConfig,
    /// Pooling module, `None` for ASPP with dilation rates 6, 12 and 18.
    #[config(default = "None")]
    pub spatial_pyramid_pooling: Option<SpatialPyramidPoolingConfig>,
    /// Prediction head, `None` for a single 1x1 conv block with dropout 0.2.
    #[config(default = "None")]
    pub segmentation_head: Option<SegmentationHeadConfig>,
    /// Output activation of the default head.
    #[config(default = "Activation::Softmax")]
    pub segmentation_head_activation: Activation,
    /// L2 penalty coefficient added to the training loss.
    #[config(default = 0.0001)]
    pub weight_decay: f64,
    /// Image input shape. Missing height or width are taken from the backbone.
    #[config(default = "InputShape::new()")]
    pub input_shape: InputShape,
    /// Weights loaded after construction.
    #[config(default = "None")]
    pub weights: Option<WeightsReference>,
    #[config(default = "Interpolation::Bilinear")]
    pub interpolation: Interpolation,
}

impl DeepLabV3Config {
    /// Build the backbone from `self.backbone` and compose the model.
    ///
    /// # Errors
    ///
    /// See [`DeepLabV3Config::init_with_backbone`].
    pub fn init<B: Backend>(&self, device: &Device<B>) -> DeepLabResult<DeepLabV3<B>> {
        let weights = self.validate()?;
        let backbone = create_backbone(&self.backbone, device)?;
        self.compose(backbone, None, weights.as_deref(), device)
    }

    /// Compose the model around an already constructed backbone.
    ///
    /// # Errors
    ///
    /// * [`DeepLabError::InvalidConfiguration`] for a zero class count, a
    ///   negative or non-finite weight decay, a head whose class count
    ///   disagrees with `num_classes` or whose kernel size is even, or an
    ///   input channel count the backbone does not accept.
    /// * [`DeepLabError::WeightsNotFound`] when `weights` does not resolve to
    ///   a file. Raised before any module is built.
    /// * [`DeepLabError::UnresolvedInputShape`] when neither the model nor the
    ///   backbone declares the input height and width.
    pub fn init_with_backbone<B: Backend>(
        &self,
        backbone: BackboneWrapper<B>,
        device: &Device<B>,
    ) -> DeepLabResult<DeepLabV3<B>> {
        let weights = self.validate()?;
        self.compose(backbone, None, weights.as_deref(), device)
    }

    /// Compose the model with its input shape taken from `input`
    /// (`[batch_size, channels, height, width]`).
    pub fn init_with_input<B: Backend>(
        &self,
        backbone: BackboneWrapper<B>,
        input: &Tensor<B, 4>,
        device: &Device<B>,
    ) -> DeepLabResult<DeepLabV3<B>> {
        let weights = self.validate()?;
        let [_, channels, height, width] = input.dims();
        self.compose(
            backbone,
            Some(InputShape::fixed(height, width, channels)),
            weights.as_deref(),
            device,
        )
    }

    /// Load a configuration saved as JSON.
    ///
    /// Backbone names are matched case-insensitively.
    ///
    /// # Errors
    ///
    /// [`DeepLabError::InvalidBackbone`] when `backbone.kind` names no known
    /// backbone, [`DeepLabError::InvalidConfiguration`] for any other read or
    /// parse failure.
    pub fn load_json(path: impl AsRef<Path>) -> DeepLabResult<Self> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|e| DeepLabError::InvalidConfiguration {
            reason: format!("failed to read {}: {e}", path.display()),
        })?;
        Self::from_json(&text)
    }

    /// Parse a configuration from a JSON string.
    pub fn from_json(text: &str) -> DeepLabResult<Self> {
        let mut value: serde_json::Value =
            serde_json::from_str(text).map_err(|e| DeepLabError::InvalidConfiguration {
                reason: format!("malformed configuration: {e}"),
            })?;

        if let Some(kind) = value.pointer_mut("/backbone/kind") {
            let name = kind.as_str().ok_or_else(|| DeepLabError::InvalidBackbone {
                backbone: kind.to_string(),
            })?;
            let parsed = BackboneKind::from_str(name)?;
            *kind = serde_json::Value::String(parsed.name().to_string());
        }

        serde_json::from_value(value).map_err(|e| DeepLabError::InvalidConfiguration {
            reason: format!("invalid configuration: {e}"),
        })
    }

    /// Save the configuration as JSON.
    pub fn save_json(&self, path: impl AsRef<Path>) -> DeepLabResult<()> {
        let path = path.as_ref();
        self.save(path).map_err(|e| DeepLabError::InvalidConfiguration {
            reason: format!("failed to write {}: {e}", path.display()),
        })
    }

    /// Head used when `segmentation_head` is unset.
    pub fn default_head(&self) -> SegmentationHeadConfig {
        SegmentationHeadConfig::new(self.num_classes)
            .with_convolutions(1)
            .with_dropout(0.2)
            .with_kernel_size(1)
            .with_activation(self.segmentation_head_activation.clone())
    }

    /// Checks run before any module is built. Returns the resolved weights path.
    fn validate(&self) -> DeepLabResult<Option<std::path::PathBuf>> {
        if self.num_classes == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: "num_classes must be positive".to_string(),
            });
        }
        if !self.weight_decay.is_finite() || self.weight_decay < 0.0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "weight_decay must be a non-negative number, got {}",
                    self.weight_decay
                ),
            });
        }
        if let Some(head) = &self.segmentation_head {
            if head.num_classes != self.num_classes {
                return Err(DeepLabError::InvalidConfiguration {
                    reason: format!(
                        "segmentation head predicts {} classes but num_classes is {}",
                        head.num_classes, self.num_classes
                    ),
                });
            }
            head.validate()?;
        }

        self.weights.as_ref().map(WeightsReference::resolve).transpose()
    }

    /// Fill unresolved height and width from the backbone's declared shape.
    fn resolve_input_shape(&self, backbone_shape: &InputShape) -> DeepLabResult<InputShape> {
        let shape = if self.input_shape.height.is_none() && self.input_shape.width.is_none() {
            backbone_shape.clone()
        } else {
            InputShape {
                height: self.input_shape.height.or(backbone_shape.height),
                width: self.input_shape.width.or(backbone_shape.width),
                channels: self.input_shape.channels,
            }
        };

        if shape.spatial().is_none() {
            return Err(DeepLabError::UnresolvedInputShape {
                input_shape: self.input_shape.to_string(),
                backbone_shape: backbone_shape.to_string(),
            });
        }
        Ok(shape)
    }

    fn compose<B: Backend>(
        &self,
        backbone: BackboneWrapper<B>,
        input_shape: Option<InputShape>,
        weights: Option<&Path>,
        device: &Device<B>,
    ) -> DeepLabResult<DeepLabV3<B>> {
        let input_shape = match input_shape {
            Some(shape) => shape,
            None => self.resolve_input_shape(&backbone.input_shape())?,
        };
        let Some([height, width]) = input_shape.spatial() else {
            return Err(DeepLabError::UnresolvedInputShape {
                input_shape: input_shape.to_string(),
                backbone_shape: backbone.input_shape().to_string(),
            });
        };
        let backbone_channels = backbone.input_shape().channels;
        if input_shape.channels != backbone_channels {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "input has {} channels but backbone {} expects {backbone_channels}",
                    input_shape.channels,
                    backbone.kind()
                ),
            });
        }

        let [_, feature_channels, feature_height, feature_width] =
            backbone.compute_output_shape([1, input_shape.channels, height, width]);
        if feature_height == 0 || feature_width == 0 {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "input {height}x{width} is too small for backbone {}",
                    backbone.kind()
                ),
            });
        }

        let upsample_factor = [height / feature_height, width / feature_width];
        debug!(
            "Input {height}x{width}, backbone features {feature_channels}x{feature_height}x{feature_width}, upsample factor {upsample_factor:?}"
        );
        if feature_height * upsample_factor[0] != height || feature_width * upsample_factor[1] != width {
            warn!(
                "Input {height}x{width} is not a multiple of the backbone output stride; \
                 predictions will be {}x{}",
                feature_height * upsample_factor[0],
                feature_width * upsample_factor[1]
            );
        }

        let pooling_config = self
            .spatial_pyramid_pooling
            .clone()
            .unwrap_or_else(|| SpatialPyramidPoolingConfig::new(DEFAULT_DILATION_RATES.to_vec()));
        let spatial_pyramid_pooling =
            pooling_config.init(feature_channels, self.interpolation.clone(), device);

        let head_config = self
            .segmentation_head
            .clone()
            .unwrap_or_else(|| self.default_head());
        let segmentation_head = head_config.init(pooling_config.num_channels, device);

        let config = DeepLabV3Config {
            backbone: backbone.config(),
            ..self.clone()
        }
            .with_spatial_pyramid_pooling(Some(pooling_config))
            .with_segmentation_head(Some(head_config))
            .with_input_shape(input_shape);

        let model = DeepLabV3 {
            backbone,
            spatial_pyramid_pooling,
            segmentation_head,
            upsample_factor,
            interpolation: Ignored(self.interpolation.clone()),
            config: Ignored(config),
        };

        match weights {
            Some(path) => load_weights_file(model, path, device),
            None => Ok(model),
        }
    }
}

/// DeepLabV3 segmentation model.
///
/// # Shapes
///   - input: `[batch_size, channels, height, width]`
///   - output: `[batch_size, num_classes, height', width']` where
///     `height' = feature_height * factor` (equal to `height` when it is a
///     multiple of the backbone output stride)
#[derive(Module, Debug)]
pub struct DeepLabV3<B: Backend> {
    backbone: BackboneWrapper<B>,
    spatial_pyramid_pooling: SpatialPyramidPooling<B>,
    segmentation_head: SegmentationHead<B>,
    upsample_factor: [usize; 2],
    interpolation: Ignored<Interpolation>,
    config: Ignored<DeepLabV3Config>,
}

impl<B: Backend> DeepLabV3<B> {
    /// Per-pixel class probabilities.
    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.segmentation_head.forward(&self.head_input(images))
    }

    /// Per-pixel class scores before the output activation.
    pub fn forward_logits(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        self.segmentation_head.forward_logits(&self.head_input(images))
    }

    /// Apply the output activation to scores from [`DeepLabV3::forward_logits`].
    pub fn activate(&self, logits: Tensor<B, 4>) -> Tensor<B, 4> {
        self.segmentation_head.config().activation.forward(logits)
    }

    fn head_input(&self, images: Tensor<B, 4>) -> FeaturePyramid<B> {
        let x = self.backbone.forward(images);
        let x = self.spatial_pyramid_pooling.forward(x);
        let x = upsample(x, self.upsample_factor, &self.interpolation);
        FeaturePyramid::single(HEAD_INPUT_LEVEL, x)
    }

    /// Output shape for an input of shape `[batch_size, channels, height, width]`.
    pub fn compute_output_shape(&self, input_shape: [usize; 4]) -> [usize; 4] {
        let [batch_size, _, feature_height, feature_width] =
            self.backbone.compute_output_shape(input_shape);
        [
            batch_size,
            self.num_classes(),
            feature_height * self.upsample_factor[0],
            feature_width * self.upsample_factor[1],
        ]
    }

    /// Ids of every batch norm scale and shift parameter in the model.
    pub fn normalization_params(&self) -> Vec<ParamId> {
        let mut ids = self.backbone.normalization_params();
        ids.extend(self.spatial_pyramid_pooling.normalization_params());
        ids.extend(self.segmentation_head.normalization_params());
        ids
    }

    /// The resolved configuration: pooling, head and input shape filled in.
    pub fn config(&self) -> DeepLabV3Config {
        self.config.0.clone()
    }

    pub fn num_classes(&self) -> usize {
        self.config.num_classes
    }

    pub fn weight_decay(&self) -> f64 {
        self.config.weight_decay
    }

    /// Per-axis `[height, width]` upsampling factor applied after pooling.
    pub fn upsample_factor(&self) -> [usize; 2] {
        self.upsample_factor
    }

    pub fn interpolation(&self) -> &Interpolation {
        &self.interpolation
    }

    pub fn backbone(&self) -> &BackboneWrapper<B> {
        &self.backbone
    }

    pub fn segmentation_head(&self) -> &SegmentationHead<B> {
        &self.segmentation_head
    }

    pub fn spatial_pyramid_pooling(&self) -> &SpatialPyramidPooling<B> {
        &self.spatial_pyramid_pooling
    }
}
