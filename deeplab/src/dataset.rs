//! Dataset implementation for DeepLabV3 training and evaluation.
//!
//! A dataset directory holds an `images/` and a `masks/` sub-directory. Each
//! image is paired with the mask of the same file stem; mask pixel values are
//! class indices. Images are resized bilinearly, masks with nearest
//! neighbour, both to a fixed size.

use std::{
    collections::HashMap,
    path::{Path, PathBuf},
};

use burn::{
    data::{dataloader::batcher::Batcher, dataset::Dataset},
    prelude::*,
    tensor::TensorData,
};
use image::imageops::FilterType;
use tracing::{info, warn};
use walkdir::WalkDir;

use crate::{
    error::{DeepLabError, DeepLabResult},
    training::SegmentationBatch,
};

/// ImageNet channel means.
pub const IMAGENET_MEAN: [f32; 3] = [0.485, 0.456, 0.406];
/// ImageNet channel standard deviations.
pub const IMAGENET_STD: [f32; 3] = [0.229, 0.224, 0.225];

const IMAGE_EXTENSIONS: [&str; 4] = ["png", "jpg", "jpeg", "bmp"];

/// One preprocessed image/mask pair.
#[derive(Debug, Clone)]
pub struct SegmentationItem {
    /// Normalized image `[3, height, width]`
    pub image: TensorData,
    /// Class indices `[height, width]`
    pub mask: TensorData,
}

/// Stacks [`SegmentationItem`]s into a [`SegmentationBatch`] on the target
/// device.
#[derive(Clone, Debug, Default)]
pub struct SegmentationBatcher;

impl SegmentationBatcher {
    pub const fn new() -> Self {
        Self
    }
}

impl<B: Backend> Batcher<B, SegmentationItem, SegmentationBatch<B>> for SegmentationBatcher {
    fn batch(&self, items: Vec<SegmentationItem>, device: &B::Device) -> SegmentationBatch<B> {
        let mut images = Vec::with_capacity(items.len());
        let mut masks = Vec::with_capacity(items.len());

        for item in items {
            images.push(Tensor::<B, 3>::from_data(item.image, device));
            masks.push(Tensor::<B, 2, Int>::from_data(item.mask, device));
        }

        SegmentationBatch::new(Tensor::stack(images, 0), Tensor::stack(masks, 0))
    }
}

/// Image/mask pairs read from disk.
#[derive(Debug, Clone)]
pub struct SegmentationDataset {
    items: Vec<(PathBuf, PathBuf)>,
    /// `[height, width]`
    size: [u32; 2],
}

impl SegmentationDataset {
    /// Index the pairs under `root` (`root/images`, `root/masks`).
    ///
    /// # Errors
    ///
    /// [`DeepLabError::DatasetError`] when either directory is missing or no
    /// image has a matching mask.
    pub fn new(root: impl AsRef<Path>, size: [u32; 2]) -> DeepLabResult<Self> {
        let root = root.as_ref();
        let image_root = root.join("images");
        let mask_root = root.join("masks");

        for dir in [&image_root, &mask_root] {
            if !dir.is_dir() {
                return Err(DeepLabError::DatasetError {
                    message: format!("Directory does not exist: {}", dir.display()),
                });
            }
        }

        let masks: HashMap<String, PathBuf> = image_files(&mask_root)
            .filter_map(|path| Some((file_stem(&path)?, path)))
            .collect();

        let mut items = Vec::new();
        for image_path in image_files(&image_root) {
            let Some(stem) = file_stem(&image_path) else {
                continue;
            };
            match masks.get(&stem) {
                Some(mask_path) => items.push((image_path, mask_path.clone())),
                None => warn!("No mask found for image: {}", image_path.display()),
            }
        }

        if items.is_empty() {
            return Err(DeepLabError::DatasetError {
                message: format!("No valid image/mask pairs found in {}", root.display()),
            });
        }
        items.sort();

        info!("Found {} image/mask pairs in {}", items.len(), root.display());
        Ok(Self { items, size })
    }

    /// Load and preprocess pair `index`.
    pub fn load(&self, index: usize) -> DeepLabResult<SegmentationItem> {
        let (image_path, mask_path) = self.items.get(index).ok_or_else(|| {
            DeepLabError::DatasetError {
                message: format!("index {index} out of range ({} items)", self.items.len()),
            }
        })?;
        let [height, width] = self.size;

        let image = image::open(image_path).map_err(|e| DeepLabError::DatasetError {
            message: format!("Failed to read {}: {e}", image_path.display()),
        })?;
        let mask = image::open(mask_path).map_err(|e| DeepLabError::DatasetError {
            message: format!("Failed to read {}: {e}", mask_path.display()),
        })?;

        let image = image
            .resize_exact(width, height, FilterType::Triangle)
            .to_rgb32f();
        let mask = mask
            .resize_exact(width, height, FilterType::Nearest)
            .to_luma8();

        Ok(SegmentationItem {
            image: normalize(image.into_raw(), [height as usize, width as usize]),
            mask: TensorData::new(
                mask.into_raw().into_iter().map(i64::from).collect(),
                [height as usize, width as usize],
            ),
        })
    }
}

impl Dataset<SegmentationItem> for SegmentationDataset {
    fn get(&self, index: usize) -> Option<SegmentationItem> {
        self.load(index)
            .inspect_err(|e| warn!("Skipping dataset item {index}: {e}"))
            .ok()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Interleaved RGB in `[0, 1]` to ImageNet-normalized CHW data.
fn normalize(rgb: Vec<f32>, [height, width]: [usize; 2]) -> TensorData {
    let pixels = height * width;
    let mut chw = vec![0.0; 3 * pixels];
    for (i, value) in rgb.into_iter().enumerate() {
        let channel = i % 3;
        chw[channel * pixels + i / 3] = (value - IMAGENET_MEAN[channel]) / IMAGENET_STD[channel];
    }
    TensorData::new(chw, [3, height, width])
}

fn image_files(dir: &Path) -> impl Iterator<Item = PathBuf> {
    WalkDir::new(dir)
        .max_depth(1)
        .into_iter()
        .filter_map(Result::ok)
        .filter(|entry| entry.file_type().is_file())
        .map(walkdir::DirEntry::into_path)
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| IMAGE_EXTENSIONS.contains(&ext.to_ascii_lowercase().as_str()))
        })
}

fn file_stem(path: &Path) -> Option<String> {
    path.file_stem()
        .and_then(|stem| stem.to_str())
        .map(str::to_owned)
}
