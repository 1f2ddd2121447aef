//! # DeepLab-Burn
//!
//! This crate provides a Rust implementation of DeepLabV3 semantic
//! segmentation, built using the Burn deep learning framework.
//!
//! ## Modules
//!
//! - `models`: The model composer, the atrous spatial pyramid pooling module,
//!   the segmentation head and the activation identifiers they share.
//! - `weights`: Weight file references (paths or named pretrained weights)
//!   and record loading.
//! - `preprocessing`: Image preprocessing layers.
//! - `training`, `dataset`, `metrics`: Training step, data loading and
//!   evaluation metrics (feature `train`).
//!
//! ## Key Components
//!
//! - `DeepLabV3Config` / `DeepLabV3`: Backbone, ASPP and head composed into
//!   one module.
//! - `SegmentationHeadConfig` / `SegmentationHead`: Per-pixel classifier.
//! - `DeepLabError`: The enum for all possible errors.

mod error;
pub mod models;
pub mod preprocessing;
pub mod weights;

#[cfg(feature = "train")]
pub mod dataset;
#[cfg(feature = "train")]
pub mod metrics;
#[cfg(feature = "train")]
pub mod training;

#[cfg(test)]
mod tests;

#[doc(inline)]
pub use backbones::{
    create_backbone, Backbone, BackboneConfig, BackboneError, BackboneKind, BackboneWrapper,
    InputShape,
};
#[doc(inline)]
pub use error::{DeepLabError, DeepLabResult};
#[doc(inline)]
pub use models::{
    activation::Activation,
    deeplab::{DeepLabV3, DeepLabV3Config, DeepLabV3Record},
    head::{SegmentationHead, SegmentationHeadConfig},
    pyramid::FeaturePyramid,
    spatial_pyramid::{SpatialPyramidPooling, SpatialPyramidPoolingConfig},
    utils::Interpolation,
};
#[doc(inline)]
pub use preprocessing::{Grayscale, GrayscaleConfig};
#[doc(inline)]
pub use weights::{load_weights, save_weights, WeightsReference};

#[cfg(feature = "train")]
#[doc(inline)]
pub use dataset::{SegmentationBatcher, SegmentationDataset, SegmentationItem};
#[cfg(feature = "train")]
#[doc(inline)]
pub use metrics::{MeanIoUInput, MeanIoUMetric};
#[cfg(feature = "train")]
#[doc(inline)]
pub use training::{SegmentationBatch, SegmentationOutput};
