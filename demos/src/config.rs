//! Configuration for the demo binaries.
//!
//! The model itself is described by a [`DeepLabV3Config`] JSON file; these
//! structures only hold what the binaries add around it.

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::optim::AdamWConfig;
use deeplab_burn::DeepLabV3Config;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Configuration for the `train` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    /// Path to the model configuration JSON.
    pub model_config: PathBuf,
    /// Number of training epochs.
    pub num_epochs: usize,
    /// Batch size for training.
    pub batch_size: usize,
    /// Learning rate for AdamW.
    pub learning_rate: f64,
    /// `[height, width]` images and masks are resized to.
    pub image_size: [u32; 2],
    /// Dataset with `images/` and `masks/` directories.
    pub train_dataset_path: PathBuf,
    /// Validation dataset, same layout.
    pub val_dataset_path: PathBuf,
    /// Where checkpoints and the final record are written.
    pub checkpoint_path: PathBuf,
    /// Number of workers for data loading.
    pub num_workers: usize,
    /// Shuffle seed.
    pub seed: u64,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model_config: PathBuf::from("model.json"),
            num_epochs: 30,
            batch_size: 8,
            learning_rate: 1e-4,
            image_size: [512, 512],
            train_dataset_path: PathBuf::from("datasets/train"),
            val_dataset_path: PathBuf::from("datasets/val"),
            checkpoint_path: PathBuf::from("checkpoints"),
            num_workers: 4,
            seed: 42,
        }
    }
}

impl TrainingConfig {
    /// AdamW without its decoupled decay: the model's loss already carries
    /// the weight-decay penalty.
    pub fn optimizer(&self) -> AdamWConfig {
        AdamWConfig::new().with_weight_decay(0.0)
    }
}

/// Configuration for the `inference` binary.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Path to the model configuration JSON.
    pub model_config: PathBuf,
    /// Weights reference, a path or a pretrained name. Overrides the one in
    /// the model configuration.
    pub weights: Option<String>,
    /// `[height, width]` the image is resized to. `None` uses the model's
    /// declared input shape.
    pub image_size: Option<[u32; 2]>,
    /// Output path of the class-index PNG.
    pub output_path: PathBuf,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            model_config: PathBuf::from("model.json"),
            weights: None,
            image_size: None,
            output_path: PathBuf::from("prediction.png"),
        }
    }
}

/// Read a serde JSON file, or fall back to the default.
pub fn load_or_default<T: DeserializeOwned + Default>(path: Option<&PathBuf>) -> Result<T> {
    let Some(path) = path else {
        return Ok(T::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;
    serde_json::from_str(&text)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Load a model configuration JSON.
pub fn load_model_config(path: &PathBuf) -> Result<DeepLabV3Config> {
    DeepLabV3Config::load_json(path)
        .with_context(|| format!("Failed to load model configuration: {}", path.display()))
}
