mod builder;
mod classifier;
mod decision;
mod error;
pub(crate) mod inference;
mod metadata;

pub use builder::ClassifierBuilder;
pub use classifier::{BackgroundClassifier, ImagePredictor};
pub use decision::{
    Decision, DecisionPolicy, PredictionResult, PredictionScores, DEFAULT_KEEP_LABEL,
    DEFAULT_REMOVE_LABEL, REMOVE_WEIGHT,
};
pub use error::ClassifierError;
pub use inference::{infer, ClassProbabilities, InferenceBackend, OnnxBackend};
pub use metadata::LabelMetadata;

use crate::memory::MemoryStats;
use crate::model_store::ModelState;

/// Information about a classifier's current state
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassifierInfo {
    pub model_state: ModelState,
    pub labels: Vec<String>,
    pub remove_label: String,
    pub keep_label: String,
    pub completed_inferences: u64,
    pub memory: MemoryStats,
}
