//! Image preprocessing layers.

use burn::prelude::*;

use crate::error::{DeepLabError, DeepLabResult};

/// ITU-R 601-2 luma weights for R, G and B.
pub const LUMA_WEIGHTS: [f32; 3] = [0.2989, 0.5870, 0.1140];

/// Configuration for [`Grayscale`].
#[derive(Config, Debug)]
pub struct GrayscaleConfig {
    /// 1 for a single luminance channel, 3 to repeat it over RGB.
    #[config(default = 1)]
    pub output_channels: usize,
}

impl GrayscaleConfig {
    /// # Errors
    ///
    /// [`DeepLabError::InvalidConfiguration`] unless `output_channels` is 1 or 3.
    pub fn init(&self) -> DeepLabResult<Grayscale> {
        if !matches!(self.output_channels, 1 | 3) {
            return Err(DeepLabError::InvalidConfiguration {
                reason: format!(
                    "grayscale output_channels must be 1 or 3, got {}",
                    self.output_channels
                ),
            });
        }
        Ok(Grayscale {
            output_channels: self.output_channels,
        })
    }
}

/// Converts RGB images to grayscale.
///
/// # Shapes
///   - input: `[batch_size, 3, height, width]`
///   - output: `[batch_size, output_channels, height, width]`
#[derive(Module, Clone, Debug)]
pub struct Grayscale {
    output_channels: usize,
}

impl Grayscale {
    pub fn forward<B: Backend>(&self, images: Tensor<B, 4>) -> Tensor<B, 4> {
        let weights = Tensor::<B, 1>::from_floats(LUMA_WEIGHTS, &images.device()).reshape([1, 3, 1, 1]);
        let luminance = (images * weights).sum_dim(1);

        if self.output_channels == 3 {
            luminance.repeat_dim(1, 3)
        } else {
            luminance
        }
    }

    pub const fn output_channels(&self) -> usize {
        self.output_channels
    }

    /// Convert the images of a batch; masks are left as they are.
    #[cfg(feature = "train")]
    pub fn forward_batch<B: Backend>(
        &self,
        batch: crate::training::SegmentationBatch<B>,
    ) -> crate::training::SegmentationBatch<B> {
        crate::training::SegmentationBatch::new(self.forward(batch.images), batch.masks)
    }
}
