use std::sync::Arc;

use log::{debug, warn};

use super::decision::{DecisionPolicy, PredictionResult};
use super::error::ClassifierError;
use super::inference::infer;
use super::ClassifierInfo;
use crate::memory::TensorMemory;
use crate::model_store::ModelStore;
use crate::preprocess::Preprocessor;
use crate::reclaimer::MemoryReclaimer;

/// Anything that can turn encoded image bytes into a [`PredictionResult`].
///
/// The HTTP layer depends on this rather than on [`BackgroundClassifier`].
pub trait ImagePredictor: Send + Sync {
    fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, ClassifierError>;

    fn info(&self) -> ClassifierInfo;
}

/// The full prediction pipeline: preprocess, infer, decide.
///
/// # Thread Safety
///
/// The loaded model is shared read-only through the store and every call
/// owns its own tensors, so one instance can serve concurrent requests
/// behind an `Arc`.
///
/// ```no_run
/// # fn main() -> Result<(), Box<dyn std::error::Error>> {
/// use bg_classifier::{BackgroundClassifier, LoadOptions, ModelStore};
/// use std::sync::Arc;
///
/// let store = Arc::new(ModelStore::new());
/// store.load("./model", &LoadOptions::default())?;
///
/// let classifier = BackgroundClassifier::builder()
///     .with_store(store)
///     .build()?;
///
/// let image = std::fs::read("photo.jpg")?;
/// let result = classifier.predict(&image)?;
/// println!("{} ({:.2})", result.decision, result.confidence);
/// # Ok(())
/// # }
/// ```
#[derive(Debug)]
pub struct BackgroundClassifier {
    pub(super) store: Arc<ModelStore>,
    pub(super) preprocessor: Preprocessor,
    pub(super) policy: DecisionPolicy,
    pub(super) reclaimer: Arc<MemoryReclaimer>,
}

// Compile-time verification of thread-safety
const _: () = {
    fn assert_send_sync<T: Send + Sync>() {}
    fn verify_thread_safety() {
        assert_send_sync::<BackgroundClassifier>();
    }
};

impl BackgroundClassifier {
    /// Creates a new ClassifierBuilder for fluent construction
    pub fn builder() -> super::builder::ClassifierBuilder {
        super::builder::ClassifierBuilder::new()
    }

    pub fn policy(&self) -> &DecisionPolicy {
        &self.policy
    }

    pub fn reclaimer(&self) -> &Arc<MemoryReclaimer> {
        &self.reclaimer
    }

    pub fn memory(&self) -> &Arc<TensorMemory> {
        self.preprocessor.memory()
    }

    /// Classifies one encoded image.
    ///
    /// Fails fast with `NotReadyError` before touching the image when the
    /// model is not loaded. Every per-call buffer is released before this
    /// returns, whatever the outcome.
    pub fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, ClassifierError> {
        let handle = self.store.handle()?;

        let tensor = self.preprocessor.preprocess(image_bytes)?;
        let probabilities = infer(handle.backend(), handle.labels(), tensor, self.memory());
        self.reclaimer.record_inference();

        let probabilities = probabilities.map_err(|e| {
            warn!("Forward pass failed: {}", e);
            e
        })?;
        debug!("Class probabilities: {:?}", probabilities);

        self.policy.decide(&probabilities)
    }

    /// Returns information about the classifier's current state
    pub fn info(&self) -> ClassifierInfo {
        ClassifierInfo {
            model_state: self.store.state(),
            labels: self
                .store
                .handle()
                .map(|h| h.labels().labels.clone())
                .unwrap_or_default(),
            remove_label: self.policy.remove_label().to_string(),
            keep_label: self.policy.keep_label().to_string(),
            completed_inferences: self.reclaimer.completed_inferences(),
            memory: self.memory().stats(),
        }
    }
}

impl ImagePredictor for BackgroundClassifier {
    fn predict(&self, image_bytes: &[u8]) -> Result<PredictionResult, ClassifierError> {
        BackgroundClassifier::predict(self, image_bytes)
    }

    fn info(&self) -> ClassifierInfo {
        BackgroundClassifier::info(self)
    }
}
