//! Weight file references and loading.
//!
//! A model configuration may point at a weight file either directly by path
//! or through a named pretrained reference such as `"voc/segmentation"`.
//! Named references resolve under the weights root directory:
//! `$DEEPLAB_WEIGHTS_DIR` when set, the user cache directory otherwise.

use std::{
    fmt,
    path::{Path, PathBuf},
    str::FromStr,
};

use burn::{
    module::Module,
    record::{BinFileRecorder, FullPrecisionSettings, NamedMpkFileRecorder},
    tensor::backend::Backend,
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::{DeepLabError, DeepLabResult};

/// Environment variable overriding the weights root directory.
pub const WEIGHTS_DIR_ENV: &str = "DEEPLAB_WEIGHTS_DIR";

/// Cache sub-directory used when [`WEIGHTS_DIR_ENV`] is unset.
const CACHE_SUBDIR: &str = "deeplab-burn";

/// Known pretrained weights: alias and file path relative to the weights root.
const PRETRAINED: &[(&str, &str)] = &[
    ("voc", "deeplabv3/voc.mpk"),
    ("voc/segmentation", "deeplabv3/voc.mpk"),
];

/// Where the weights of a model come from.
///
/// Serialized as a plain string: a known pretrained alias, or a path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WeightsReference {
    /// A weight file on disk.
    Path(PathBuf),
    /// A named pretrained reference, e.g. `"voc/segmentation"`.
    Pretrained(String),
}

impl WeightsReference {
    /// Names accepted as [`WeightsReference::Pretrained`].
    pub fn pretrained_names() -> impl Iterator<Item = &'static str> {
        PRETRAINED.iter().map(|(name, _)| *name)
    }

    /// Resolve to an existing file path.
    ///
    /// # Errors
    ///
    /// Returns [`DeepLabError::WeightsNotFound`] when the file does not exist.
    pub fn resolve(&self) -> DeepLabResult<PathBuf> {
        match self {
            Self::Path(path) => Self::existing(path.clone()),
            Self::Pretrained(_) => self.resolve_in(&weights_root()?),
        }
    }

    /// Resolve with named references looked up under `root`.
    pub fn resolve_in(&self, root: &Path) -> DeepLabResult<PathBuf> {
        let path = match self {
            Self::Path(path) => path.clone(),
            Self::Pretrained(name) => {
                let relative = PRETRAINED
                    .iter()
                    .find(|entry| entry.0 == *name)
                    .map(|entry| entry.1)
                    .ok_or_else(|| DeepLabError::WeightsNotFound {
                        path: format!("unknown pretrained weights '{name}'"),
                    })?;
                root.join(relative)
            }
        };
        Self::existing(path)
    }

    fn existing(path: PathBuf) -> DeepLabResult<PathBuf> {
        if path.is_file() {
            debug!("Resolved weights to {}", path.display());
            Ok(path)
        } else {
            Err(DeepLabError::WeightsNotFound {
                path: path.display().to_string(),
            })
        }
    }
}

impl FromStr for WeightsReference {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::from(s.to_string()))
    }
}

impl From<String> for WeightsReference {
    fn from(s: String) -> Self {
        if PRETRAINED.iter().any(|(alias, _)| *alias == s) {
            Self::Pretrained(s)
        } else {
            Self::Path(PathBuf::from(s))
        }
    }
}

impl From<WeightsReference> for String {
    fn from(reference: WeightsReference) -> Self {
        match reference {
            WeightsReference::Path(path) => path.display().to_string(),
            WeightsReference::Pretrained(name) => name,
        }
    }
}

impl fmt::Display for WeightsReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Path(path) => write!(f, "{}", path.display()),
            Self::Pretrained(name) => f.write_str(name),
        }
    }
}

/// Directory holding named pretrained weights.
pub fn weights_root() -> DeepLabResult<PathBuf> {
    if let Some(dir) = std::env::var_os(WEIGHTS_DIR_ENV) {
        return Ok(PathBuf::from(dir));
    }
    dirs::cache_dir()
        .map(|dir| dir.join(CACHE_SUBDIR))
        .ok_or_else(|| DeepLabError::WeightLoadingFailed {
            reason: format!("no cache directory available, set {WEIGHTS_DIR_ENV}"),
        })
}

/// On-disk record format, chosen by file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WeightFormat {
    /// Burn named MessagePack (`.mpk`)
    MessagePack,
    /// Burn binary (`.bin`)
    Binary,
    /// PyTorch pickle (`.pt`, `.pth`)
    PyTorch,
}

impl WeightFormat {
    /// Detect format from file path
    pub fn from_path(path: &Path) -> Option<Self> {
        match path.extension().and_then(|s| s.to_str()) {
            Some("mpk") => Some(Self::MessagePack),
            Some("bin") => Some(Self::Binary),
            Some("pt" | "pth") => Some(Self::PyTorch),
            _ => None,
        }
    }
}

/// Resolve `reference` and load its record into `model`.
pub fn load_weights<B: Backend, M: Module<B>>(
    model: M,
    reference: &WeightsReference,
    device: &B::Device,
) -> DeepLabResult<M> {
    let path = reference.resolve()?;
    load_weights_file(model, &path, device)
}

/// Load the record stored at `path` into `model`.
pub fn load_weights_file<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> DeepLabResult<M> {
    let format = WeightFormat::from_path(path).ok_or_else(|| DeepLabError::WeightLoadingFailed {
        reason: format!("unsupported weight file extension: {}", path.display()),
    })?;
    info!("Loading {:?} weights from {}", format, path.display());

    match format {
        WeightFormat::MessagePack => model
            .load_file(
                path,
                &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
                device,
            )
            .map_err(|e| DeepLabError::WeightLoadingFailed {
                reason: format!("MessagePack record loading failed: {e}"),
            }),
        WeightFormat::Binary => model
            .load_file(path, &BinFileRecorder::<FullPrecisionSettings>::new(), device)
            .map_err(|e| DeepLabError::WeightLoadingFailed {
                reason: format!("Binary record loading failed: {e}"),
            }),
        WeightFormat::PyTorch => load_pytorch(model, path, device),
    }
}

#[cfg(feature = "pytorch")]
fn load_pytorch<B: Backend, M: Module<B>>(
    model: M,
    path: &Path,
    device: &B::Device,
) -> DeepLabResult<M> {
    use burn::record::Recorder;
    use burn_import::pytorch::{LoadArgs, PyTorchFileRecorder};

    let record: M::Record = PyTorchFileRecorder::<FullPrecisionSettings>::default()
        .load(LoadArgs::new(path.to_path_buf()), device)
        .map_err(|e| DeepLabError::WeightLoadingFailed {
            reason: format!("PyTorch record loading failed: {e}"),
        })?;
    Ok(model.load_record(record))
}

#[cfg(not(feature = "pytorch"))]
fn load_pytorch<B: Backend, M: Module<B>>(
    _model: M,
    path: &Path,
    _device: &B::Device,
) -> DeepLabResult<M> {
    Err(DeepLabError::WeightLoadingFailed {
        reason: format!(
            "{} is a PyTorch file; rebuild with the `pytorch` feature to load it",
            path.display()
        ),
    })
}

/// Save `model` as a named MessagePack record. The `.mpk` extension is
/// appended by the recorder.
pub fn save_weights<B: Backend, M: Module<B>>(model: M, path: &Path) -> DeepLabResult<()> {
    model
        .save_file(
            path.to_path_buf(),
            &NamedMpkFileRecorder::<FullPrecisionSettings>::new(),
        )
        .map_err(|e| DeepLabError::WeightLoadingFailed {
            reason: format!("failed to save record to {}: {e}", path.display()),
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::head::SegmentationHeadConfig;
    use burn::{backend::NdArray, tensor::Tensor};

    type TestBackend = NdArray<f32>;

    #[test]
    fn test_parse_reference() {
        assert_eq!(
            "voc/segmentation".parse::<WeightsReference>().unwrap(),
            WeightsReference::Pretrained("voc/segmentation".to_string())
        );
        assert_eq!(
            "runs/final.mpk".parse::<WeightsReference>().unwrap(),
            WeightsReference::Path(PathBuf::from("runs/final.mpk"))
        );
        assert_eq!(WeightsReference::pretrained_names().count(), 2);
    }

    #[test]
    fn test_reference_serializes_as_string() {
        let reference = WeightsReference::Pretrained("voc".to_string());
        let json = serde_json::to_string(&reference).unwrap();
        assert_eq!(json, "\"voc\"");
        assert_eq!(
            serde_json::from_str::<WeightsReference>(&json).unwrap(),
            reference
        );
    }

    #[test]
    fn test_resolve_pretrained_under_root() {
        let root = tempfile::tempdir().unwrap();
        let reference = WeightsReference::Pretrained("voc".to_string());

        assert!(matches!(
            reference.resolve_in(root.path()),
            Err(DeepLabError::WeightsNotFound { .. })
        ));

        std::fs::create_dir_all(root.path().join("deeplabv3")).unwrap();
        std::fs::write(root.path().join("deeplabv3/voc.mpk"), b"").unwrap();

        assert_eq!(
            reference.resolve_in(root.path()).unwrap(),
            root.path().join("deeplabv3/voc.mpk")
        );
    }

    #[test]
    fn test_missing_path_is_not_found() {
        let reference = WeightsReference::Path(PathBuf::from("/nonexistent/weights.mpk"));
        match reference.resolve() {
            Err(DeepLabError::WeightsNotFound { path }) => {
                assert_eq!(path, "/nonexistent/weights.mpk");
            }
            other => panic!("Expected WeightsNotFound, got {other:?}"),
        }
    }

    #[test]
    fn test_unknown_extension_fails_to_load() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("weights.onnx");
        std::fs::write(&path, b"").unwrap();

        let head = SegmentationHeadConfig::new(2).init::<TestBackend>(4, &device);
        let result = load_weights_file(head, &path, &device);

        assert!(matches!(
            result,
            Err(DeepLabError::WeightLoadingFailed { .. })
        ));
    }

    #[test]
    fn test_saved_record_loads_into_fresh_module() {
        let device = Default::default();
        let dir = tempfile::tempdir().unwrap();
        let config = SegmentationHeadConfig::new(3).with_filters(8);

        let trained = config.init::<TestBackend>(4, &device);
        save_weights(trained.clone(), &dir.path().join("head")).unwrap();

        let fresh = config.init::<TestBackend>(4, &device);
        let loaded = load_weights_file(fresh, &dir.path().join("head.mpk"), &device).unwrap();

        let input = crate::FeaturePyramid::single(
            1,
            Tensor::<TestBackend, 4>::ones([1, 4, 3, 3], &device),
        );
        loaded
            .forward_logits(&input)
            .into_data()
            .assert_approx_eq::<f32>(
                &trained.forward_logits(&input).into_data(),
                burn::tensor::Tolerance::absolute(1e-6),
            );
    }
}
