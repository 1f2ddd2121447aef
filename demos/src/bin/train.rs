//! DeepLabV3 training.
//!
//! Trains on a dataset laid out as `images/` plus `masks/` (class-index PNGs
//! with matching file stems) using AdamW. The training loss includes the
//! model's weight-decay penalty.
//!
//! ```bash
//! cargo run --release --bin train -- --config train.json
//! cargo run --release --bin train --features wgpu -- --dataset-path data/voc
//! ```

use std::path::PathBuf;

use anyhow::{ensure, Context, Result};
use burn::{
    backend::Autodiff,
    data::dataloader::DataLoaderBuilder,
    record::CompactRecorder,
    train::{
        metric::{AccuracyMetric, LossMetric},
        LearnerBuilder,
    },
};
use clap::Parser;
use deeplab_burn::{
    save_weights, DeepLabV3, InputShape, MeanIoUMetric, SegmentationBatcher, SegmentationDataset,
};
use deeplab_demos::{
    config::{load_model_config, load_or_default},
    create_device, get_backend_name, init_logging, SelectedBackend, SelectedDevice,
    TrainingConfig,
};
use tracing::info;

type TrainBackend = Autodiff<SelectedBackend>;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Training configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model configuration JSON
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Override batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Override number of epochs
    #[arg(long)]
    num_epochs: Option<usize>,

    /// Override learning rate
    #[arg(long)]
    learning_rate: Option<f64>,

    /// Override dataset path; validation data is read from its `val` directory
    #[arg(long)]
    dataset_path: Option<PathBuf>,

    /// Override checkpoint path
    #[arg(long)]
    checkpoint_path: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config: TrainingConfig = load_or_default(args.config.as_ref())?;
    if let Some(model_config) = args.model_config {
        config.model_config = model_config;
    }
    if let Some(batch_size) = args.batch_size {
        config.batch_size = batch_size;
    }
    if let Some(num_epochs) = args.num_epochs {
        config.num_epochs = num_epochs;
    }
    if let Some(learning_rate) = args.learning_rate {
        config.learning_rate = learning_rate;
    }
    if let Some(dataset_path) = args.dataset_path {
        config.val_dataset_path = dataset_path.join("val");
        config.train_dataset_path = dataset_path;
    }
    if let Some(checkpoint_path) = args.checkpoint_path {
        config.checkpoint_path = checkpoint_path;
    }

    ensure!(config.batch_size > 0, "Batch size must be greater than 0");
    ensure!(config.num_epochs > 0, "Number of epochs must be greater than 0");
    ensure!(config.learning_rate > 0.0, "Learning rate must be positive");

    info!("Batch size: {}", config.batch_size);
    info!("Number of epochs: {}", config.num_epochs);
    info!("Learning rate: {}", config.learning_rate);
    info!("Training dataset: {}", config.train_dataset_path.display());
    info!("Validation dataset: {}", config.val_dataset_path.display());

    std::fs::create_dir_all(&config.checkpoint_path).with_context(|| {
        format!(
            "Failed to create checkpoint directory at {}",
            config.checkpoint_path.display()
        )
    })?;

    let device = create_device();
    info!("Using backend: {}", get_backend_name());

    let model = create_model(&config, &device)?;
    model
        .config()
        .save_json(config.checkpoint_path.join("model.json"))
        .context("Failed to save model configuration")?;

    let train_dataset = SegmentationDataset::new(&config.train_dataset_path, config.image_size)
        .context("Failed to create training dataset")?;
    let valid_dataset = SegmentationDataset::new(&config.val_dataset_path, config.image_size)
        .context("Failed to create validation dataset")?;

    let train_dataloader = DataLoaderBuilder::<TrainBackend, _, _>::new(SegmentationBatcher::new())
        .batch_size(config.batch_size)
        .shuffle(config.seed)
        .num_workers(config.num_workers)
        .build(train_dataset);
    let valid_dataloader = DataLoaderBuilder::<SelectedBackend, _, _>::new(SegmentationBatcher::new())
        .batch_size(config.batch_size)
        .num_workers(config.num_workers)
        .build(valid_dataset);

    let learner = LearnerBuilder::new(&config.checkpoint_path)
        .metric_train_numeric(LossMetric::new())
        .metric_train_numeric(AccuracyMetric::new())
        .metric_valid_numeric(LossMetric::new())
        .metric_valid_numeric(AccuracyMetric::new())
        .metric_valid_numeric(MeanIoUMetric::new())
        .with_file_checkpointer(CompactRecorder::new())
        .devices(vec![device])
        .num_epochs(config.num_epochs)
        .summary()
        .build(model, config.optimizer().init(), config.learning_rate);

    info!("Starting training...");
    let model_trained = learner.fit(train_dataloader, valid_dataloader);

    let final_model_path = config.checkpoint_path.join("final_model");
    save_weights(model_trained, &final_model_path)
        .with_context(|| format!("Failed to save final model to {}", final_model_path.display()))?;
    info!("Saved final model to {}.mpk", final_model_path.display());

    Ok(())
}

fn create_model(
    config: &TrainingConfig,
    device: &SelectedDevice,
) -> Result<DeepLabV3<TrainBackend>> {
    let [height, width] = config.image_size;
    let model_config = load_model_config(&config.model_config)?
        .with_input_shape(InputShape::fixed(height as usize, width as usize, 3));
    model_config
        .init::<TrainBackend>(device)
        .context("Failed to initialize DeepLabV3 model")
}
