use ort::Error as OrtError;
use std::fmt;

use crate::fetch::FetchError;
use crate::model_store::ModelState;

/// Represents the different types of errors that can occur while classifying an image.
#[derive(Debug)]
pub enum ClassifierError {
    /// The model or its metadata could not be loaded or failed validation
    ModelLoadError(String),
    /// Inference was attempted while the model store was not ready
    NotReadyError(ModelState),
    /// The image could not be acquired (network, timeout or size limit)
    ImageFetchError(FetchError),
    /// The image bytes are corrupt or in an unsupported format
    ImageDecodeError(String),
    /// The forward pass failed or produced an unexpected shape
    InferenceError(String),
    /// The label metadata does not contain the labels the decision needs
    LabelMismatchError(String),
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ModelLoadError(msg) => write!(f, "Model load error: {}", msg),
            Self::NotReadyError(state) => write!(f, "Model not loaded (state: {})", state),
            Self::ImageFetchError(err) => write!(f, "Image fetch error: {}", err),
            Self::ImageDecodeError(msg) => write!(f, "Image decode error: {}", msg),
            Self::InferenceError(msg) => write!(f, "Inference error: {}", msg),
            Self::LabelMismatchError(msg) => write!(f, "Label mismatch: {}", msg),
        }
    }
}

impl std::error::Error for ClassifierError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::ImageFetchError(err) => Some(err),
            _ => None,
        }
    }
}

impl From<OrtError> for ClassifierError {
    fn from(err: OrtError) -> Self {
        ClassifierError::InferenceError(err.to_string())
    }
}

impl From<FetchError> for ClassifierError {
    fn from(err: FetchError) -> Self {
        ClassifierError::ImageFetchError(err)
    }
}

impl From<image::ImageError> for ClassifierError {
    fn from(err: image::ImageError) -> Self {
        ClassifierError::ImageDecodeError(err.to_string())
    }
}
