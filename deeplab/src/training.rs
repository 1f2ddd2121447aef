//! Training functionality for DeepLabV3.
//!
//! This module implements the TrainStep and ValidStep traits for the DeepLabV3
//! model, enabling integration with the Burn training framework. The training
//! loss is the per-pixel cross-entropy plus an L2 penalty on the trainable
//! parameters, batch norm scale and shift excluded, scaled by the model's
//! weight decay.

use std::collections::HashSet;

use burn::{
    module::{ModuleVisitor, ParamId},
    nn::loss::CrossEntropyLossConfig,
    prelude::*,
    tensor::backend::AutodiffBackend,
    train::{
        metric::{AccuracyInput, Adaptor, ItemLazy, LossInput},
        TrainOutput, TrainStep, ValidStep,
    },
};

use crate::{metrics::MeanIoUInput, models::utils::resize, DeepLabV3};

/// A batch of images and their class-index masks.
#[derive(Debug, Clone)]
pub struct SegmentationBatch<B: Backend> {
    /// Images `[batch_size, 3, height, width]`
    pub images: Tensor<B, 4>,
    /// Class indices `[batch_size, height, width]`
    pub masks: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationBatch<B> {
    pub const fn new(images: Tensor<B, 4>, masks: Tensor<B, 3, Int>) -> Self {
        Self { images, masks }
    }

    pub fn batch_size(&self) -> usize {
        self.images.dims()[0]
    }
}

/// Output of a training or validation step.
#[derive(Debug, Clone)]
pub struct SegmentationOutput<B: Backend> {
    /// Total loss, weight-decay penalty included for training steps.
    pub loss: Tensor<B, 1>,
    /// Class probabilities `[batch_size, num_classes, height, width]`
    pub output: Tensor<B, 4>,
    /// Class indices `[batch_size, height, width]`
    pub targets: Tensor<B, 3, Int>,
}

impl<B: Backend> SegmentationOutput<B> {
    pub const fn new(loss: Tensor<B, 1>, output: Tensor<B, 4>, targets: Tensor<B, 3, Int>) -> Self {
        Self {
            loss,
            output,
            targets,
        }
    }
}

impl<B: Backend> ItemLazy for SegmentationOutput<B> {
    type ItemSync = Self;

    fn sync(self) -> Self::ItemSync {
        self
    }
}

impl<B: Backend> Adaptor<LossInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> LossInput<B> {
        LossInput::new(self.loss.clone())
    }
}

/// Per-pixel accuracy: every pixel is one sample.
impl<B: Backend> Adaptor<AccuracyInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> AccuracyInput<B> {
        let [batch_size, num_classes, height, width] = self.output.dims();
        let pixels = batch_size * height * width;
        let outputs = self
            .output
            .clone()
            .permute([0, 2, 3, 1])
            .reshape([pixels, num_classes]);
        let targets = self.targets.clone().reshape([pixels]);
        AccuracyInput::new(outputs, targets)
    }
}

impl<B: Backend> Adaptor<MeanIoUInput<B>> for SegmentationOutput<B> {
    fn adapt(&self) -> MeanIoUInput<B> {
        MeanIoUInput::new(self.output.clone(), self.targets.clone())
    }
}

/// Mean cross-entropy over every pixel.
///
/// # Shapes
///   - logits: `[batch_size, num_classes, height, width]`
///   - masks: `[batch_size, height, width]`
pub fn pixel_cross_entropy<B: Backend>(
    logits: Tensor<B, 4>,
    masks: Tensor<B, 3, Int>,
) -> Tensor<B, 1> {
    let [batch_size, num_classes, height, width] = logits.dims();
    let pixels = batch_size * height * width;
    let device = logits.device();

    let logits = logits.permute([0, 2, 3, 1]).reshape([pixels, num_classes]);
    let targets = masks.reshape([pixels]);

    CrossEntropyLossConfig::new()
        .init(&device)
        .forward(logits, targets)
}

/// Sums the squares of every trainable parameter not in `excluded`.
struct L2Penalty<B: Backend> {
    excluded: HashSet<ParamId>,
    sum: Option<Tensor<B, 1>>,
}

impl<B: Backend> ModuleVisitor<B> for L2Penalty<B> {
    fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
        if !tensor.is_require_grad() || self.excluded.contains(&id) {
            return;
        }
        let squares = tensor.clone().powf_scalar(2.0).sum();
        self.sum = Some(match self.sum.take() {
            Some(sum) => sum + squares,
            None => squares,
        });
    }
}

impl<B: Backend> DeepLabV3<B> {
    /// `Σ w²` over the trainable parameters except batch norm scale and
    /// shift, or `None` when no such parameter requires gradients.
    pub fn l2_penalty(&self) -> Option<Tensor<B, 1>> {
        let mut visitor = L2Penalty {
            excluded: self.normalization_params().into_iter().collect(),
            sum: None,
        };
        self.visit(&mut visitor);
        visitor.sum
    }

    /// `loss + weight_decay × Σ w²`. NaNs propagate unmodified.
    pub fn regularized_loss(&self, loss: Tensor<B, 1>) -> Tensor<B, 1> {
        let weight_decay = self.weight_decay();
        if weight_decay == 0.0 {
            return loss;
        }
        match self.l2_penalty() {
            Some(penalty) => loss + penalty.mul_scalar(weight_decay),
            None => loss,
        }
    }

    /// Forward pass with cross-entropy against `batch.masks`.
    ///
    /// Scores are resized to the mask resolution when the input size is not
    /// a multiple of the backbone output stride.
    pub fn forward_segmentation(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        let [_, mask_height, mask_width] = batch.masks.dims();
        let logits = self.forward_logits(batch.images);
        let logits = resize(logits, [mask_height, mask_width], self.interpolation());

        let loss = pixel_cross_entropy(logits.clone(), batch.masks.clone());
        SegmentationOutput::new(loss, self.activate(logits), batch.masks)
    }
}

impl<B: AutodiffBackend> TrainStep<SegmentationBatch<B>, SegmentationOutput<B>> for DeepLabV3<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> TrainOutput<SegmentationOutput<B>> {
        let mut item = self.forward_segmentation(batch);
        item.loss = self.regularized_loss(item.loss);
        TrainOutput::new(self, item.loss.backward(), item)
    }
}

impl<B: Backend> ValidStep<SegmentationBatch<B>, SegmentationOutput<B>> for DeepLabV3<B> {
    fn step(&self, batch: SegmentationBatch<B>) -> SegmentationOutput<B> {
        self.forward_segmentation(batch)
    }
}

#[cfg(test)]
mod tests {
    use backbones::{BackboneConfig, BackboneKind, InputShape};
    use burn::{
        backend::{Autodiff, NdArray},
        tensor::{Distribution, ElementConversion, TensorData},
    };

    use super::*;
    use crate::{
        DeepLabV3Config, Interpolation, SegmentationHeadConfig, SpatialPyramidPoolingConfig,
    };

    type TestBackend = NdArray<f32>;
    type TestAutodiffBackend = Autodiff<TestBackend>;

    fn small_config(weight_decay: f64) -> DeepLabV3Config {
        DeepLabV3Config::new(
            3,
            BackboneConfig::new(BackboneKind::ResNet18)
                .with_level(4)
                .with_input_shape(InputShape::fixed(32, 32, 3)),
        )
        .with_spatial_pyramid_pooling(Some(
            SpatialPyramidPoolingConfig::new(vec![2]).with_num_channels(8),
        ))
        .with_segmentation_head(Some(
            SegmentationHeadConfig::new(3)
                .with_convolutions(1)
                .with_filters(8)
                .with_kernel_size(1),
        ))
        .with_weight_decay(weight_decay)
        .with_interpolation(Interpolation::Nearest)
    }

    fn batch<B: Backend>(device: &B::Device) -> SegmentationBatch<B> {
        let images = Tensor::random([2, 3, 32, 32], Distribution::Normal(0.0, 1.0), device);
        let masks = Tensor::<B, 3, Int>::from_data(
            TensorData::new((0..2 * 32 * 32).map(|i| (i % 3) as i64).collect(), [2, 32, 32]),
            device,
        );
        SegmentationBatch::new(images, masks)
    }

    #[test]
    fn test_pixel_cross_entropy_of_confident_prediction() {
        let device = Default::default();
        // Two pixels, class 1 then class 0, both predicted with large margins.
        let logits = Tensor::<TestBackend, 4>::from_floats(
            [[[[-20.0, 20.0]], [[20.0, -20.0]]]],
            &device,
        );
        let masks = Tensor::<TestBackend, 3, Int>::from_ints([[[1, 0]]], &device);

        let loss = pixel_cross_entropy(logits, masks).into_scalar().elem::<f32>();

        assert!(loss < 1e-6, "loss = {loss}");
    }

    /// Sum of squares over the trainable tensors selected by `keep(id, rank)`.
    struct SquaredSum<F> {
        keep: F,
        sum: f32,
    }

    impl<B: Backend, F: Fn(ParamId, usize) -> bool> ModuleVisitor<B> for SquaredSum<F> {
        fn visit_float<const D: usize>(&mut self, id: ParamId, tensor: &Tensor<B, D>) {
            if tensor.is_require_grad() && (self.keep)(id, D) {
                self.sum += tensor.clone().powf_scalar(2.0).sum().into_scalar().elem::<f32>();
            }
        }
    }

    fn squared_sum<B: Backend>(
        model: &DeepLabV3<B>,
        keep: impl Fn(ParamId, usize) -> bool,
    ) -> f32 {
        let mut visitor = SquaredSum { keep, sum: 0.0 };
        model.visit(&mut visitor);
        visitor.sum
    }

    fn penalty_of<B: Backend>(model: &DeepLabV3<B>) -> f32 {
        model
            .l2_penalty()
            .expect("autodiff parameters require gradients")
            .into_scalar()
            .elem::<f32>()
    }

    #[test]
    fn test_l2_penalty_skips_batch_norm_scale_and_shift() {
        let device = Default::default();
        let model = small_config(1e-4).init::<TestAutodiffBackend>(&device).unwrap();
        let norms = model.normalization_params().into_iter().collect::<HashSet<_>>();

        let everything = squared_sum(&model, |_, _| true);
        let normalization = squared_sum(&model, |id, _| norms.contains(&id));
        let penalty = penalty_of(&model);

        // batch norm scales start at one
        assert!(normalization > 0.0);
        let expected = everything - normalization;
        assert!((penalty - expected).abs() <= expected * 1e-4, "{penalty} vs {expected}");
    }

    #[test]
    fn test_l2_penalty_includes_biases() {
        let device = Default::default();
        let model = small_config(1e-4)
            .with_segmentation_head(Some(
                SegmentationHeadConfig::new(3)
                    .with_convolutions(1)
                    .with_filters(8)
                    .with_kernel_size(1)
                    .with_use_bias(true),
            ))
            .init::<TestAutodiffBackend>(&device)
            .unwrap();
        let norms = model.normalization_params().into_iter().collect::<HashSet<_>>();

        let weights = squared_sum(&model, |_, rank| rank >= 2);
        let biases = squared_sum(&model, |id, rank| rank == 1 && !norms.contains(&id));
        let penalty = penalty_of(&model);

        assert!(biases > 0.0);
        let from_biases = penalty - weights;
        assert!((from_biases - biases).abs() <= biases * 0.05, "{from_biases} vs {biases}");
    }

    #[test]
    fn test_regularized_loss_respects_weight_decay() {
        let device = Default::default();
        let base = Tensor::<TestAutodiffBackend, 1>::from_floats([0.5], &device);

        let without = small_config(0.0).init::<TestAutodiffBackend>(&device).unwrap();
        let with = small_config(1e-2).init::<TestAutodiffBackend>(&device).unwrap();

        let unchanged = without.regularized_loss(base.clone()).into_scalar().elem::<f32>();
        let penalized = with.regularized_loss(base).into_scalar().elem::<f32>();

        assert_eq!(unchanged, 0.5);
        assert!(penalized > 0.5);
    }

    #[test]
    fn test_regularized_loss_propagates_nan() {
        let device = Default::default();
        let model = small_config(1e-4).init::<TestAutodiffBackend>(&device).unwrap();
        let loss = Tensor::<TestAutodiffBackend, 1>::from_floats([f32::NAN], &device);

        assert!(model.regularized_loss(loss).into_scalar().elem::<f32>().is_nan());
    }

    #[test]
    fn test_train_step_produces_gradients() {
        let device = Default::default();
        let model = small_config(1e-4).init::<TestAutodiffBackend>(&device).unwrap();

        let output = TrainStep::step(&model, batch::<TestAutodiffBackend>(&device));

        assert_eq!(output.item.output.dims(), [2, 3, 32, 32]);
        assert_eq!(output.item.targets.dims(), [2, 32, 32]);
        assert!(output.item.loss.into_scalar().elem::<f32>().is_finite());
    }

    #[test]
    fn test_valid_step_output_matches_masks() {
        let device = Default::default();
        let model = small_config(1e-4).init::<TestBackend>(&device).unwrap();

        let output = ValidStep::step(&model, batch::<TestBackend>(&device));

        assert_eq!(output.output.dims(), [2, 3, 32, 32]);
        assert_eq!(output.loss.dims(), [1]);
    }
}
