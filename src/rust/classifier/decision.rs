use std::fmt;

use serde::{Deserialize, Serialize};

use super::error::ClassifierError;
use super::inference::ClassProbabilities;

/// Label the exported model uses for "remove the background".
pub const DEFAULT_REMOVE_LABEL: &str = "Odstranit pozadí";
/// Label the exported model uses for "keep the background".
pub const DEFAULT_KEEP_LABEL: &str = "Ponechat pozadí";

/// Multiplier applied to the remove probability before comparing it with keep.
///
/// Empirically chosen for the deployed model: with two classes, remove wins
/// once its raw probability passes 0.6 instead of 0.5.
pub const REMOVE_WEIGHT: f32 = 1.5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    #[serde(rename = "Remove background")]
    RemoveBackground,
    #[serde(rename = "Keep background")]
    KeepBackground,
}

impl fmt::Display for Decision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::RemoveBackground => write!(f, "Remove background"),
            Self::KeepBackground => write!(f, "Keep background"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionScores {
    pub remove: f32,
    pub keep: f32,
    pub weighted_remove: f32,
}

/// The service's answer for one image.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PredictionResult {
    pub should_remove_background: bool,
    /// The larger of the two raw probabilities, never the weighted one
    pub confidence: f32,
    pub scores: PredictionScores,
    pub decision: Decision,
}

/// Turns the two class probabilities into a weighted binary decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecisionPolicy {
    remove_label: String,
    keep_label: String,
}

impl Default for DecisionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_REMOVE_LABEL, DEFAULT_KEEP_LABEL)
    }
}

impl DecisionPolicy {
    pub fn new(remove_label: impl Into<String>, keep_label: impl Into<String>) -> Self {
        Self {
            remove_label: remove_label.into(),
            keep_label: keep_label.into(),
        }
    }

    pub fn remove_label(&self) -> &str {
        &self.remove_label
    }

    pub fn keep_label(&self) -> &str {
        &self.keep_label
    }

    pub fn required_labels(&self) -> [&str; 2] {
        [&self.remove_label, &self.keep_label]
    }

    /// Looks up both labels and applies [`DecisionPolicy::decide_scores`].
    ///
    /// # Errors
    /// `LabelMismatchError` if either label is absent from `probabilities`.
    pub fn decide(
        &self,
        probabilities: &ClassProbabilities,
    ) -> Result<PredictionResult, ClassifierError> {
        let remove = probabilities.get(&self.remove_label);
        let keep = probabilities.get(&self.keep_label);
        match (remove, keep) {
            (Some(remove), Some(keep)) => Ok(Self::decide_scores(remove, keep)),
            _ => Err(ClassifierError::LabelMismatchError(format!(
                "expected classes '{}' and '{}', model reported {:?}",
                self.remove_label,
                self.keep_label,
                probabilities.labels().collect::<Vec<_>>()
            ))),
        }
    }

    pub fn decide_scores(remove: f32, keep: f32) -> PredictionResult {
        let weighted_remove = remove * REMOVE_WEIGHT;
        let should_remove = weighted_remove > keep;

        PredictionResult {
            should_remove_background: should_remove,
            confidence: remove.max(keep),
            scores: PredictionScores {
                remove,
                keep,
                weighted_remove,
            },
            decision: if should_remove {
                Decision::RemoveBackground
            } else {
                Decision::KeepBackground
            },
        }
    }
}
