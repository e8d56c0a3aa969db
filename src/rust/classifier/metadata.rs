use std::fs;
use std::path::Path;

use serde::Deserialize;

use super::error::ClassifierError;
use crate::preprocess::INPUT_SIZE;

/// Class names exported next to the model, index-aligned with its output.
///
/// Parsed from a Teachable Machine style `metadata.json`; only `labels` is
/// required, the remaining fields are kept for diagnostics.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LabelMetadata {
    pub labels: Vec<String>,
    #[serde(default)]
    pub model_name: Option<String>,
    #[serde(default)]
    pub image_size: Option<u32>,
    #[serde(default)]
    pub time_stamp: Option<String>,
}

impl LabelMetadata {
    pub fn from_labels(labels: Vec<impl Into<String>>) -> Self {
        Self {
            labels: labels.into_iter().map(Into::into).collect(),
            model_name: None,
            image_size: None,
            time_stamp: None,
        }
    }

    pub fn from_file(path: &Path) -> Result<Self, ClassifierError> {
        let content = fs::read_to_string(path).map_err(|e| {
            ClassifierError::ModelLoadError(format!("Failed to read metadata {:?}: {}", path, e))
        })?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ClassifierError> {
        let metadata: Self = serde_json::from_str(content)
            .map_err(|e| ClassifierError::ModelLoadError(format!("Malformed metadata: {}", e)))?;
        metadata.validate()?;
        Ok(metadata)
    }

    /// Checks the structure of the metadata itself, independent of the model.
    pub fn validate(&self) -> Result<(), ClassifierError> {
        if self.labels.is_empty() {
            return Err(ClassifierError::ModelLoadError("Metadata lists no labels".into()));
        }
        if let Some(pos) = self.labels.iter().position(|l| l.is_empty()) {
            return Err(ClassifierError::ModelLoadError(format!("Label {} is empty", pos)));
        }
        for (i, label) in self.labels.iter().enumerate() {
            if self.labels[..i].contains(label) {
                return Err(ClassifierError::ModelLoadError(format!("Duplicate label '{}'", label)));
            }
        }
        if let Some(size) = self.image_size {
            if size as usize != INPUT_SIZE {
                return Err(ClassifierError::ModelLoadError(format!(
                    "Model was trained on {}px images, expected {}px",
                    size, INPUT_SIZE
                )));
            }
        }
        Ok(())
    }

    /// Ensures every label in `required` is present.
    pub fn ensure_labels(&self, required: &[&str]) -> Result<(), ClassifierError> {
        let missing: Vec<&str> = required
            .iter()
            .copied()
            .filter(|r| !self.labels.iter().any(|l| l == r))
            .collect();
        if missing.is_empty() {
            Ok(())
        } else {
            Err(ClassifierError::LabelMismatchError(format!(
                "metadata labels {:?} do not include {:?}",
                self.labels, missing
            )))
        }
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }
}
