use std::sync::Arc;

use log::info;

use super::classifier::BackgroundClassifier;
use super::decision::DecisionPolicy;
use super::error::ClassifierError;
use crate::memory::{TensorMemory, DEFAULT_POOL_CAPACITY};
use crate::model_store::ModelStore;
use crate::preprocess::Preprocessor;
use crate::reclaimer::{MemoryReclaimer, DEFAULT_RECLAIM_EVERY};

/// A builder for constructing a BackgroundClassifier with a fluent interface.
#[derive(Debug, Default)]
pub struct ClassifierBuilder {
    store: Option<Arc<ModelStore>>,
    policy: Option<DecisionPolicy>,
    memory: Option<Arc<TensorMemory>>,
    reclaim_every: Option<u64>,
    pool_capacity: Option<usize>,
}

impl ClassifierBuilder {
    /// Creates a new empty ClassifierBuilder instance with default configuration
    ///
    /// # Example
    /// ```
    /// use bg_classifier::ClassifierBuilder;
    ///
    /// let builder = ClassifierBuilder::new();
    /// ```
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `store` instead of the process-wide [`ModelStore::global`].
    pub fn with_store(mut self, store: Arc<ModelStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the label names the decision looks up
    ///
    /// # Example
    /// ```
    /// use bg_classifier::{ClassifierBuilder, DecisionPolicy};
    ///
    /// let builder = ClassifierBuilder::new()
    ///     .with_policy(DecisionPolicy::new("remove", "keep"));
    /// ```
    pub fn with_policy(mut self, policy: DecisionPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Shares an existing buffer ledger and pool.
    pub fn with_memory(mut self, memory: Arc<TensorMemory>) -> Self {
        self.memory = Some(memory);
        self
    }

    /// Reclaim cached buffers after every `every` completed inferences (0 disables).
    pub fn with_reclaim_every(mut self, every: u64) -> Self {
        self.reclaim_every = Some(every);
        self
    }

    /// Maximum number of input buffers kept for reuse between calls.
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Builds and returns the final BackgroundClassifier instance
    ///
    /// # Returns
    /// * `Result<BackgroundClassifier, ClassifierError>` - or `LabelMismatchError` if
    ///   the store already holds a model whose labels the policy cannot find
    pub fn build(self) -> Result<BackgroundClassifier, ClassifierError> {
        let store = self.store.unwrap_or_else(ModelStore::global);
        let policy = self.policy.unwrap_or_default();
        let pool_capacity = self.pool_capacity.unwrap_or(DEFAULT_POOL_CAPACITY);
        let memory = self.memory.unwrap_or_else(|| TensorMemory::new(pool_capacity));
        let reclaimer = MemoryReclaimer::with_store(
            Arc::clone(&memory),
            Arc::clone(&store),
            self.reclaim_every.unwrap_or(DEFAULT_RECLAIM_EVERY),
        );

        if let Ok(handle) = store.handle() {
            handle.labels().ensure_labels(&policy.required_labels())?;
        }

        info!(
            "Classifier ready (remove label: '{}', keep label: '{}', model: {})",
            policy.remove_label(),
            policy.keep_label(),
            store.state()
        );

        Ok(BackgroundClassifier {
            store,
            preprocessor: Preprocessor::new(memory),
            policy,
            reclaimer,
        })
    }
}
