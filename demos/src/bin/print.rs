//! Build a DeepLabV3 model from its configuration and print its structure.
//!
//! ```bash
//! cargo run --bin print -- --config model.json
//! cargo run --bin print -- --backbone resnet50 --num-classes 21 --size 512
//! ```

use std::path::PathBuf;

use anyhow::{Context, Result};
use burn::module::Module;
use clap::Parser;
use deeplab_burn::{BackboneConfig, BackboneKind, DeepLabV3Config, InputShape};
use deeplab_demos::{config::load_model_config, create_device, get_backend_name, init_logging, SelectedBackend};
use tracing::info;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Model configuration JSON. Overrides the other options.
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Backbone used without a configuration file
    #[arg(long, default_value = "resnet50")]
    backbone: BackboneKind,

    /// Number of classes used without a configuration file
    #[arg(long, default_value_t = 21)]
    num_classes: usize,

    /// Square input size used without a configuration file
    #[arg(long, default_value_t = 512)]
    size: usize,

    /// Write the resolved configuration here
    #[arg(long)]
    save_config: Option<PathBuf>,
}

fn main() -> Result<()> {
    init_logging();
    let args = Args::parse();

    let config = match &args.config {
        Some(path) => load_model_config(path)?,
        None => DeepLabV3Config::new(
            args.num_classes,
            BackboneConfig::new(args.backbone)
                .with_input_shape(InputShape::fixed(args.size, args.size, 3)),
        ),
    };

    let device = create_device();
    info!("Using backend: {}", get_backend_name());

    let model = config
        .init::<SelectedBackend>(&device)
        .context("Failed to initialize DeepLabV3 model")?;

    println!("{model}");
    println!("Backbone: {}", model.backbone().kind());
    println!("Upsample factor: {:?}", model.upsample_factor());
    println!("Parameters: {}", model.num_params());

    if let Some(path) = &args.save_config {
        model
            .config()
            .save_json(path)
            .with_context(|| format!("Failed to save configuration to {}", path.display()))?;
        info!("Saved resolved configuration to {}", path.display());
    }

    Ok(())
}
