//! DeepLabV3 demos
//!
//! ## Available binaries
//!
//! - `print`: Build a model from its configuration and print its structure
//! - `inference`: Predict a class-index mask for one image
//! - `train`: Train on an `images/` + `masks/` dataset
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin print -- --config model.json
//! cargo run --bin inference -- --config model.json --weights model.mpk image.jpg
//! cargo run --bin train -- --config train.json
//! ```

pub mod backend;
pub mod config;
pub mod imaging;

pub use backend::{create_device, get_backend_name, SelectedBackend, SelectedDevice};
pub use config::{InferenceConfig, TrainingConfig};

use tracing_subscriber::EnvFilter;

/// Install the `tracing` subscriber. `RUST_LOG` overrides the `info` default.
pub fn init_logging() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
}
