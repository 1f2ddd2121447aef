//! DeepLabV3 inference on a single image.
//!
//! Writes a grayscale PNG whose pixel values are the predicted class indices.
//!
//! ```bash
//! cargo run --bin inference -- --model-config model.json --weights model.mpk image.jpg
//! cargo run --bin inference -- --config inference.json image.jpg --output mask.png
//! ```

use std::{path::PathBuf, time::Instant};

use anyhow::{ensure, Context, Result};
use burn::prelude::*;
use clap::Parser;
use deeplab_burn::{InputShape, WeightsReference};
use deeplab_demos::{
    config::{load_model_config, load_or_default},
    create_device, get_backend_name, imaging, init_logging, InferenceConfig, SelectedBackend,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the input image
    input: PathBuf,

    /// Inference configuration JSON
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the model configuration JSON
    #[arg(long)]
    model_config: Option<PathBuf>,

    /// Override the weights (path or pretrained name)
    #[arg(short, long)]
    weights: Option<String>,

    /// Override the processing size, as HEIGHT WIDTH
    #[arg(long, num_args = 2, value_names = ["HEIGHT", "WIDTH"])]
    size: Option<Vec<u32>>,

    /// Override the output path
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let mut config: InferenceConfig = load_or_default(args.config.as_ref())?;
    if let Some(model_config) = args.model_config {
        config.model_config = model_config;
    }
    if let Some(weights) = args.weights {
        config.weights = Some(weights);
    }
    if let Some(size) = args.size {
        config.image_size = Some([size[0], size[1]]);
    }
    if let Some(output) = args.output {
        config.output_path = output;
    }

    ensure!(
        args.input.exists(),
        "Input path does not exist: {}",
        args.input.display()
    );

    let mut model_config = load_model_config(&config.model_config)?;
    if let Some(weights) = &config.weights {
        model_config.weights = Some(WeightsReference::from(weights.clone()));
    }

    let size = match config.image_size {
        Some(size) => size,
        None => match model_config.input_shape.spatial() {
            Some([height, width]) => [height as u32, width as u32],
            None => imaging::image_size(&args.input)?,
        },
    };
    model_config.input_shape = InputShape::fixed(size[0] as usize, size[1] as usize, 3);

    let device = create_device();
    info!("Using backend: {}", get_backend_name());

    let model = model_config
        .init::<SelectedBackend>(&device)
        .context("Failed to initialize DeepLabV3 model")?;

    let image = imaging::load_image::<SelectedBackend>(&args.input, size, &device)?;

    let start = Instant::now();
    let probabilities = model.forward(image);
    let [_, _, height, width] = probabilities.dims();
    let classes = probabilities.argmax(1).reshape([1, height, width]);
    info!("Inference took {:.2?}", start.elapsed());

    imaging::class_map_to_image(classes)?
        .save(&config.output_path)
        .with_context(|| format!("Failed to save {}", config.output_path.display()))?;

    println!("Saved prediction to {}", config.output_path.display());
    Ok(())
}
