//! Resizing helpers shared by the pooling module and the model composer.

use burn::{
    prelude::*,
    tensor::module::interpolate,
    tensor::ops::{InterpolateMode, InterpolateOptions},
};

/// Upsampling mode for feature maps.
///
/// Some Burn backends only implement the backward pass of nearest
/// interpolation, so training configurations may need `Nearest`.
#[derive(Config, Debug, PartialEq, Eq)]
pub enum Interpolation {
    Bilinear,
    Nearest,
}

/// Resize `tensor` to `size` (`[height, width]`).
///
/// # Arguments
/// * `tensor` - Input tensor `[batch_size, channels, height, width]`
/// * `size` - Target spatial size
/// * `mode` - Interpolation mode
pub fn resize<B: Backend>(
    tensor: Tensor<B, 4>,
    size: [usize; 2],
    mode: &Interpolation,
) -> Tensor<B, 4> {
    let [_, _, height, width] = tensor.dims();
    if [height, width] == size {
        return tensor;
    }

    let interpolate_mode = match mode {
        Interpolation::Bilinear => InterpolateMode::Bilinear,
        Interpolation::Nearest => InterpolateMode::Nearest,
    };

    interpolate(tensor, size, InterpolateOptions::new(interpolate_mode))
}

/// Resize `tensor` by an integer factor per spatial axis.
pub fn upsample<B: Backend>(
    tensor: Tensor<B, 4>,
    factor: [usize; 2],
    mode: &Interpolation,
) -> Tensor<B, 4> {
    let [_, _, height, width] = tensor.dims();
    resize(tensor, [height * factor[0], width * factor[1]], mode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::backend::NdArray;

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_upsample_scales_each_axis() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::ones([1, 2, 3, 5], &device);

        let y = upsample(x, [4, 2], &Interpolation::Nearest);

        assert_eq!(y.dims(), [1, 2, 12, 10]);
    }

    #[test]
    fn test_resize_is_noop_at_target_size() {
        let device = Default::default();
        let x = Tensor::<TestBackend, 4>::random(
            [1, 1, 4, 4],
            burn::tensor::Distribution::Default,
            &device,
        );

        let y = resize(x.clone(), [4, 4], &Interpolation::Bilinear);

        y.into_data().assert_eq(&x.into_data(), true);
    }
}
