//! A thread-safe image classifier that decides whether a photo's background
//! should be removed, plus the HTTP service that exposes it.
//!
//! # Basic Usage
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use bg_classifier::{BackgroundClassifier, LoadOptions, ModelStore};
//!
//! let store = ModelStore::global();
//! store.load("./model", &LoadOptions::default())?;
//!
//! let classifier = BackgroundClassifier::builder().build()?;
//! let result = classifier.predict(&std::fs::read("product.jpg")?)?;
//! println!("{}: {:.2}", result.decision, result.confidence);
//! # Ok(())
//! # }
//! ```
//!
//! # Thread Safety
//!
//! The loaded model is written once and then shared read-only, and every
//! call owns its tensors, so the classifier can be shared across threads
//! using `Arc`:
//!
//! ```no_run
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! use bg_classifier::BackgroundClassifier;
//! use std::sync::Arc;
//! use std::thread;
//!
//! let classifier = Arc::new(BackgroundClassifier::builder().build()?);
//! let image = Arc::new(std::fs::read("product.jpg")?);
//!
//! let mut handles = vec![];
//! for _ in 0..3 {
//!     let classifier = Arc::clone(&classifier);
//!     let image = Arc::clone(&image);
//!     handles.push(thread::spawn(move || classifier.predict(&image).is_ok()));
//! }
//!
//! for handle in handles {
//!     handle.join().unwrap();
//! }
//! # Ok(())
//! # }
//! ```

pub mod classifier;
pub mod config;
pub mod fetch;
pub mod memory;
pub mod model_store;
pub mod preprocess;
pub mod reclaimer;
mod runtime;
pub mod server;

pub use classifier::{
    BackgroundClassifier, ClassProbabilities, ClassifierBuilder, ClassifierError, ClassifierInfo,
    Decision, DecisionPolicy, ImagePredictor, InferenceBackend, LabelMetadata, OnnxBackend,
    PredictionResult, PredictionScores,
};
pub use config::{ConfigError, ServiceConfig};
pub use fetch::{decode_base64_image, strip_data_url_prefix, FetchError, ImageFetcher};
pub use memory::{MemoryStats, TensorMemory};
pub use model_store::{LoadOptions, ModelState, ModelStore};
pub use preprocess::{NormalizedTensor, Preprocessor};
pub use reclaimer::{MemoryReclaimer, ReclaimReport, ReclaimTrigger};
pub use runtime::{create_session_builder, RuntimeConfig};
