use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, PoisonError, RwLock};

use lazy_static::lazy_static;
use log;
use serde::Serialize;
use sha2::{Digest, Sha256};

use crate::classifier::{ClassifierError, InferenceBackend, LabelMetadata, OnnxBackend};
use crate::runtime::RuntimeConfig;

pub const MODEL_FILE: &str = "model.onnx";
pub const METADATA_FILE: &str = "metadata.json";
pub const DEFAULT_MODEL_DIR: &str = "./model";

lazy_static! {
    static ref GLOBAL_STORE: Arc<ModelStore> = Arc::new(ModelStore::new());
}

/// Lifecycle of the store. Moves forward only; there is no reload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelState {
    Unloaded,
    Loading,
    Ready,
    Failed,
}

impl fmt::Display for ModelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unloaded => write!(f, "unloaded"),
            Self::Loading => write!(f, "loading"),
            Self::Ready => write!(f, "ready"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// The loaded classifier and the labels aligned with its output.
pub struct LoadedModel {
    backend: Box<dyn InferenceBackend>,
    labels: LabelMetadata,
    source: Option<PathBuf>,
}

/// Shared, read-only reference to the loaded model.
pub type ClassifierHandle = Arc<LoadedModel>;

impl LoadedModel {
    fn new(
        backend: Box<dyn InferenceBackend>,
        labels: LabelMetadata,
        required_labels: &[&str],
        source: Option<PathBuf>,
    ) -> Result<Self, ClassifierError> {
        labels.validate()?;
        labels.ensure_labels(required_labels)?;
        if let Some(output_len) = backend.output_len() {
            if output_len != labels.len() {
                return Err(ClassifierError::ModelLoadError(format!(
                    "Model outputs {} classes but metadata lists {} labels",
                    output_len,
                    labels.len()
                )));
            }
        }
        Ok(Self { backend, labels, source })
    }

    pub fn backend(&self) -> &dyn InferenceBackend {
        self.backend.as_ref()
    }

    pub fn labels(&self) -> &LabelMetadata {
        &self.labels
    }
}

impl fmt::Debug for LoadedModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LoadedModel")
            .field("labels", &self.labels.labels)
            .field("source", &self.source)
            .finish()
    }
}

/// Options for [`ModelStore::load`].
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    pub runtime: RuntimeConfig,
    /// Labels that must be present in the metadata
    pub required_labels: Vec<String>,
    /// Hex sha256 the model file must match
    pub expected_sha256: Option<String>,
}

enum LoadState {
    Unloaded,
    Loading,
    Ready(ClassifierHandle),
    Failed(String),
}

/// Write-once holder of the classifier.
///
/// Loading happens exactly once; every inference entry point asks the store
/// for a handle and gets `NotReadyError` until loading has succeeded.
pub struct ModelStore {
    state: RwLock<LoadState>,
}

impl fmt::Debug for ModelStore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ModelStore").field("state", &self.state()).finish()
    }
}

impl Default for ModelStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ModelStore {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(LoadState::Unloaded),
        }
    }

    /// The process-wide store used by the service binary.
    pub fn global() -> Arc<ModelStore> {
        Arc::clone(&GLOBAL_STORE)
    }

    pub fn get_model_path(model_dir: &Path) -> PathBuf {
        model_dir.join(MODEL_FILE)
    }

    pub fn get_metadata_path(model_dir: &Path) -> PathBuf {
        model_dir.join(METADATA_FILE)
    }

    pub fn is_model_present(model_dir: &Path) -> bool {
        let model_path = Self::get_model_path(model_dir);
        let metadata_path = Self::get_metadata_path(model_dir);
        log::info!("Checking model directory {:?}:", model_dir);
        log::info!("  Model path: {:?} (exists: {})", model_path, model_path.exists());
        log::info!("  Metadata path: {:?} (exists: {})", metadata_path, metadata_path.exists());
        model_path.is_file() && metadata_path.is_file()
    }

    pub fn verify_file(path: &Path, expected_hash: &str) -> Result<bool, ClassifierError> {
        log::info!("Verifying file: {:?}", path);
        let bytes = fs::read(path).map_err(|e| {
            ClassifierError::ModelLoadError(format!("Failed to read {:?}: {}", path, e))
        })?;
        let mut hasher = Sha256::new();
        hasher.update(&bytes);
        let hash = format!("{:x}", hasher.finalize());
        log::info!("Calculated hash: {}", hash);
        log::info!("Expected hash:   {}", expected_hash);
        Ok(hash.eq_ignore_ascii_case(expected_hash.trim()))
    }

    /// Loads `model.onnx` and `metadata.json` from `model_dir`.
    pub fn load(
        &self,
        model_dir: impl AsRef<Path>,
        options: &LoadOptions,
    ) -> Result<ClassifierHandle, ClassifierError> {
        let model_dir = model_dir.as_ref();
        self.begin_loading()?;
        log::info!("Loading model from {:?}", model_dir);
        let result = Self::load_from_dir(model_dir, options);
        self.finish_loading(result)
    }

    /// Installs an already constructed backend instead of reading from disk.
    pub fn install(
        &self,
        backend: Box<dyn InferenceBackend>,
        labels: LabelMetadata,
        required_labels: &[&str],
    ) -> Result<ClassifierHandle, ClassifierError> {
        self.begin_loading()?;
        let result = LoadedModel::new(backend, labels, required_labels, None);
        self.finish_loading(result)
    }

    pub fn state(&self) -> ModelState {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            LoadState::Unloaded => ModelState::Unloaded,
            LoadState::Loading => ModelState::Loading,
            LoadState::Ready(_) => ModelState::Ready,
            LoadState::Failed(_) => ModelState::Failed,
        }
    }

    /// Reason the last load failed, if it did.
    pub fn failure(&self) -> Option<String> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            LoadState::Failed(reason) => Some(reason.clone()),
            _ => None,
        }
    }

    pub fn handle(&self) -> Result<ClassifierHandle, ClassifierError> {
        match &*self.state.read().unwrap_or_else(PoisonError::into_inner) {
            LoadState::Ready(handle) => Ok(Arc::clone(handle)),
            LoadState::Unloaded => Err(ClassifierError::NotReadyError(ModelState::Unloaded)),
            LoadState::Loading => Err(ClassifierError::NotReadyError(ModelState::Loading)),
            LoadState::Failed(_) => Err(ClassifierError::NotReadyError(ModelState::Failed)),
        }
    }

    fn load_from_dir(
        model_dir: &Path,
        options: &LoadOptions,
    ) -> Result<LoadedModel, ClassifierError> {
        if !Self::is_model_present(model_dir) {
            return Err(ClassifierError::ModelLoadError(format!(
                "Expected {} and {} in {:?}",
                MODEL_FILE, METADATA_FILE, model_dir
            )));
        }

        let model_path = Self::get_model_path(model_dir);
        if let Some(expected) = &options.expected_sha256 {
            if !Self::verify_file(&model_path, expected)? {
                return Err(ClassifierError::ModelLoadError(format!(
                    "Hash mismatch for {:?}",
                    model_path
                )));
            }
            log::info!("Model file verified successfully");
        }

        let labels = LabelMetadata::from_file(&Self::get_metadata_path(model_dir))?;
        let required: Vec<&str> = options.required_labels.iter().map(String::as_str).collect();
        labels.ensure_labels(&required)?;
        log::info!("Classes: {:?}", labels.labels);

        let backend = OnnxBackend::from_file(&model_path, &options.runtime)?;
        LoadedModel::new(Box::new(backend), labels, &required, Some(model_dir.to_path_buf()))
    }

    fn begin_loading(&self) -> Result<(), ClassifierError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match &*state {
            LoadState::Unloaded => {
                *state = LoadState::Loading;
                Ok(())
            }
            LoadState::Loading => {
                Err(ClassifierError::ModelLoadError("Model is already loading".into()))
            }
            LoadState::Ready(_) => {
                Err(ClassifierError::ModelLoadError("Model is already loaded".into()))
            }
            LoadState::Failed(reason) => Err(ClassifierError::ModelLoadError(format!(
                "Model failed to load earlier: {}",
                reason
            ))),
        }
    }

    fn finish_loading(
        &self,
        result: Result<LoadedModel, ClassifierError>,
    ) -> Result<ClassifierHandle, ClassifierError> {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        match result {
            Ok(model) => {
                let handle = Arc::new(model);
                log::info!("Model ready: {:?}", handle);
                *state = LoadState::Ready(Arc::clone(&handle));
                Ok(handle)
            }
            Err(e) => {
                log::error!("Failed to load model: {}", e);
                *state = LoadState::Failed(e.to_string());
                Err(e)
            }
        }
    }
}
