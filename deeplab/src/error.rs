use backbones::BackboneError;
use thiserror::Error;

/// The error type for `DeepLab-Burn` operations.
///
/// Every failure here is raised at construction or loading time; the forward
/// pass itself never fails.
#[derive(Error, Debug)]
pub enum DeepLabError {
    /// The backbone description names no known layer kind.
    #[error("Invalid backbone: {backbone}")]
    InvalidBackbone {
        /// The offending backbone description.
        backbone: String,
    },

    /// A weights reference does not resolve to an existing file.
    #[error("Weights not found: {path}")]
    WeightsNotFound {
        /// The path the reference resolved to.
        path: String,
    },

    /// Neither the model nor the backbone declares a height and width.
    #[error(
        "Cannot resolve input height and width: model input shape is {input_shape}, \
         backbone input shape is {backbone_shape}"
    )]
    UnresolvedInputShape {
        /// The model's declared input shape.
        input_shape: String,
        /// The backbone's declared input shape.
        backbone_shape: String,
    },

    /// The prediction head received an unusable feature mapping.
    #[error("Invalid head input: {reason}")]
    InvalidHeadInput {
        /// Why the input was rejected.
        reason: String,
    },

    /// Error for when an invalid model configuration is provided.
    #[error("Invalid model configuration: {reason}")]
    InvalidConfiguration {
        /// The reason why the configuration is invalid.
        reason: String,
    },

    /// Error for when loading model weights fails.
    #[error("Failed to load weights: {reason}")]
    WeightLoadingFailed {
        /// The reason for the weight loading failure.
        reason: String,
    },

    /// Error for when dataset operations fail.
    #[error("Dataset error: {message}")]
    DatasetError {
        /// The error message.
        message: String,
    },
}

impl From<BackboneError> for DeepLabError {
    fn from(err: BackboneError) -> Self {
        match err {
            BackboneError::UnknownKind { .. } => Self::InvalidBackbone {
                backbone: err.to_string(),
            },
            BackboneError::InvalidLevel { .. } => Self::InvalidConfiguration {
                reason: err.to_string(),
            },
        }
    }
}

/// A specialized `Result` type for `DeepLab-Burn` operations.
pub type DeepLabResult<T> = Result<T, DeepLabError>;
