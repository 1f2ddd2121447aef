//! Conversion between image files and model tensors.

use std::path::Path;

use anyhow::{bail, Context, Result};
use burn::tensor::{backend::Backend, Int, Tensor, TensorData};
use deeplab_burn::dataset::{IMAGENET_MEAN, IMAGENET_STD};
use image::{imageops::FilterType, GrayImage};

/// Load an image resized to `[height, width]` as a normalized
/// `[1, 3, height, width]` tensor.
pub fn load_image<B: Backend>(
    path: &Path,
    [height, width]: [u32; 2],
    device: &B::Device,
) -> Result<Tensor<B, 4>> {
    let image = image::open(path)
        .with_context(|| format!("Failed to open image at {}", path.display()))?
        .resize_exact(width, height, FilterType::Triangle)
        .into_rgb32f();

    let data = TensorData::new(image.into_raw(), [height as usize, width as usize, 3]);
    let mean = Tensor::<B, 1>::from_floats(IMAGENET_MEAN, device).reshape([1, 1, 3]);
    let std = Tensor::<B, 1>::from_floats(IMAGENET_STD, device).reshape([1, 1, 3]);

    let tensor = (Tensor::<B, 3>::from_data(data.convert::<B::FloatElem>(), device) - mean) / std;
    Ok(tensor.permute([2, 0, 1]).unsqueeze::<4>())
}

/// Dimensions of the image at `path` as `[height, width]`.
pub fn image_size(path: &Path) -> Result<[u32; 2]> {
    let (width, height) = image::image_dimensions(path)
        .with_context(|| format!("Failed to read image header of {}", path.display()))?;
    Ok([height, width])
}

/// Per-pixel class indices `[1, height, width]` as a grayscale image.
pub fn class_map_to_image<B: Backend>(classes: Tensor<B, 3, Int>) -> Result<GrayImage> {
    let [batch, height, width] = classes.dims();
    if batch != 1 {
        bail!("Expected batch size of 1, got {batch}");
    }

    let values = classes
        .into_data()
        .convert::<i64>()
        .to_vec::<i64>()
        .map_err(|e| anyhow::anyhow!("Failed to read class map: {e:?}"))?;
    let pixels = values
        .into_iter()
        .map(|class| u8::try_from(class).context("class index does not fit in a byte"))
        .collect::<Result<Vec<u8>>>()?;

    GrayImage::from_raw(width as u32, height as u32, pixels)
        .context("Class map does not match the image dimensions")
}
