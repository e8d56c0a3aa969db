use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, info, warn};
use ndarray::ArrayView4;
use ort::session::{RunOptions, Session, SessionOutputs};
use ort::value::{Tensor, ValueType};

use super::error::ClassifierError;
use super::metadata::LabelMetadata;
use crate::memory::TensorMemory;
use crate::preprocess::{NormalizedTensor, INPUT_SHAPE};
use crate::runtime::{create_session_builder, RuntimeConfig};

/// Runs the model's forward pass.
///
/// The backend receives a `[1, 224, 224, 3]` view and returns the raw output
/// vector. Implementations must be safe to call from several threads at once
/// and must not keep anything from the input alive after returning.
pub trait InferenceBackend: Send + Sync {
    fn forward(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ClassifierError>;

    /// Length of the output vector when the model declares it statically.
    fn output_len(&self) -> Option<usize> {
        None
    }

    /// Asks the engine to give back memory it keeps cached between calls.
    ///
    /// Must not block on an in-flight forward pass.
    fn reclaim(&self) {}
}

/// One probability per label, in the model's output order.
#[derive(Debug, Clone, PartialEq)]
pub struct ClassProbabilities {
    entries: Vec<(String, f32)>,
}

impl ClassProbabilities {
    /// Maps `output[i]` to `labels[i]`.
    pub fn from_output(labels: &LabelMetadata, output: &[f32]) -> Result<Self, ClassifierError> {
        if output.len() != labels.len() {
            return Err(ClassifierError::InferenceError(format!(
                "Model produced {} scores for {} labels",
                output.len(),
                labels.len()
            )));
        }
        Ok(Self {
            entries: labels.labels.iter().cloned().zip(output.iter().copied()).collect(),
        })
    }

    pub fn from_pairs(pairs: impl IntoIterator<Item = (String, f32)>) -> Self {
        Self {
            entries: pairs.into_iter().collect(),
        }
    }

    pub fn get(&self, label: &str) -> Option<f32> {
        self.entries.iter().find(|(l, _)| l == label).map(|(_, p)| *p)
    }

    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.entries.iter().map(|(l, _)| l.as_str())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, f32)> {
        self.entries.iter().map(|(l, p)| (l.as_str(), *p))
    }

    pub fn sum(&self) -> f32 {
        self.entries.iter().map(|(_, p)| p).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn to_map(&self) -> HashMap<String, f32> {
        self.entries.iter().cloned().collect()
    }
}

/// Runs one forward pass and maps the output onto `labels`.
///
/// Takes ownership of `tensor`, so the input buffer is released before this
/// returns on every path. The output buffer is tracked while it is alive.
pub fn infer(
    backend: &dyn InferenceBackend,
    labels: &LabelMetadata,
    tensor: NormalizedTensor,
    memory: &std::sync::Arc<TensorMemory>,
) -> Result<ClassProbabilities, ClassifierError> {
    let output = {
        let input = tensor.view()?;
        backend.forward(input)
    };
    drop(tensor);

    let output = output?;
    let _output = memory.track(output.len() * std::mem::size_of::<f32>());
    if let Some(bad) = output.iter().find(|p| !p.is_finite()) {
        return Err(ClassifierError::InferenceError(format!(
            "Model produced non-finite score {}",
            bad
        )));
    }
    ClassProbabilities::from_output(labels, &output)
}

/// [`InferenceBackend`] over an ONNX Runtime session.
#[derive(Debug)]
pub struct OnnxBackend {
    session: Session,
    input_name: String,
    output_name: String,
    output_len: Option<usize>,
    shrink_arena: AtomicBool,
}

/// Run option that releases unused CPU arena chunks after the run.
const ARENA_SHRINKAGE_KEY: &str = "memory.enable_memory_arena_shrinkage";
const ARENA_SHRINKAGE_DEVICES: &str = "cpu:0";

impl OnnxBackend {
    pub fn from_file(model_path: &Path, config: &RuntimeConfig) -> Result<Self, ClassifierError> {
        let session = create_session_builder(config)
            .and_then(|builder| builder.commit_from_file(model_path))
            .map_err(|e| {
                ClassifierError::ModelLoadError(format!(
                    "Failed to load model {:?}: {}",
                    model_path, e
                ))
            })?;
        Self::from_session(session)
    }

    pub fn from_session(session: Session) -> Result<Self, ClassifierError> {
        Self::validate_model(&session)?;

        let input_name = session.inputs[0].name.clone();
        let output_name = session.outputs[0].name.clone();
        let output_len = match &session.outputs[0].output_type {
            ValueType::Tensor { dimensions, .. } => dimensions
                .last()
                .and_then(|&d| usize::try_from(d).ok())
                .filter(|&d| d > 0),
            _ => None,
        };

        info!(
            "Model structure validated (input: {}, output: {}, classes: {:?})",
            input_name, output_name, output_len
        );

        Ok(Self {
            session,
            input_name,
            output_name,
            output_len,
            shrink_arena: AtomicBool::new(false),
        })
    }

    pub fn arena_shrink_pending(&self) -> bool {
        self.shrink_arena.load(Ordering::Acquire)
    }

    fn run_error(e: ort::Error) -> ClassifierError {
        ClassifierError::InferenceError(format!("Failed to run model: {}", e))
    }

    fn extract_output(
        &self,
        outputs: &SessionOutputs<'_, '_>,
    ) -> Result<Vec<f32>, ClassifierError> {
        let output_tensor = outputs[self.output_name.as_str()]
            .try_extract_tensor::<f32>()
            .map_err(|e| {
                ClassifierError::InferenceError(format!("Failed to extract output tensor: {}", e))
            })?;

        debug!("Model output shape: {:?}", output_tensor.shape());
        Ok(output_tensor.iter().copied().collect())
    }

    fn arena_shrink_options() -> Result<RunOptions, ClassifierError> {
        let mut options = RunOptions::new()?;
        options.add_config_entry(ARENA_SHRINKAGE_KEY, ARENA_SHRINKAGE_DEVICES)?;
        Ok(options)
    }

    /// Validates that the model takes one NHWC image and returns one tensor.
    fn validate_model(session: &Session) -> Result<(), ClassifierError> {
        let input = session.inputs.first().ok_or_else(|| {
            ClassifierError::ModelLoadError("Model must have an image input".to_string())
        })?;
        if session.outputs.is_empty() {
            return Err(ClassifierError::ModelLoadError(
                "Model must have at least 1 output for class scores".to_string(),
            ));
        }

        if let ValueType::Tensor { dimensions, .. } = &input.input_type {
            if dimensions.len() != INPUT_SHAPE.len() {
                return Err(ClassifierError::ModelLoadError(format!(
                    "Model input '{}' has rank {}, expected {}",
                    input.name,
                    dimensions.len(),
                    INPUT_SHAPE.len()
                )));
            }
            // Negative dimensions are symbolic (e.g. the batch axis).
            let axes = dimensions.iter().zip(INPUT_SHAPE.iter()).enumerate().skip(1);
            for (axis, (&actual, &expected)) in axes {
                if actual >= 0 && actual as usize != expected {
                    return Err(ClassifierError::ModelLoadError(format!(
                        "Model input '{}' has {} on axis {}, expected {} (shape {:?})",
                        input.name, actual, axis, expected, INPUT_SHAPE
                    )));
                }
            }
        }
        Ok(())
    }
}

impl InferenceBackend for OnnxBackend {
    fn forward(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
        let input_dyn = input.into_dyn();
        let input_array = input_dyn.as_standard_layout();

        let mut input_tensors = HashMap::new();
        input_tensors.insert(
            self.input_name.as_str(),
            Tensor::from_array(&input_array).map_err(|e| {
                ClassifierError::InferenceError(format!("Failed to create input tensor: {}", e))
            })?,
        );

        let shrink_options = if self.shrink_arena.swap(false, Ordering::AcqRel) {
            match Self::arena_shrink_options() {
                Ok(options) => Some(options),
                Err(e) => {
                    warn!("Skipping CPU arena shrinkage: {}", e);
                    None
                }
            }
        } else {
            None
        };

        match &shrink_options {
            Some(options) => {
                debug!("Running with CPU arena shrinkage");
                let outputs = self
                    .session
                    .run_with_options(input_tensors, options)
                    .map_err(Self::run_error)?;
                self.extract_output(&outputs)
            }
            None => {
                let outputs = self.session.run(input_tensors).map_err(Self::run_error)?;
                self.extract_output(&outputs)
            }
        }
    }

    fn output_len(&self) -> Option<usize> {
        self.output_len
    }

    /// The arena can only shrink at the end of a run, so the next run does it.
    fn reclaim(&self) {
        self.shrink_arena.store(true, Ordering::Release);
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::preprocess::Preprocessor;
    use crate::preprocess::tests::encode_png;
    use image::{DynamicImage, RgbImage};
    use std::sync::Arc;

    /// Softmax over two logits derived from the mean pixel value.
    pub(crate) struct MeanSoftmaxBackend;

    impl InferenceBackend for MeanSoftmaxBackend {
        fn forward(&self, input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
            if input.dim() != (1, 224, 224, 3) {
                return Err(ClassifierError::InferenceError(format!("bad shape {:?}", input.dim())));
            }
            let mean = input.mean().unwrap_or(0.0);
            let logits = [mean * 4.0 - 1.0, 1.0 - mean * 4.0];
            let max = logits[0].max(logits[1]);
            let exp: Vec<f32> = logits.iter().map(|l| (l - max).exp()).collect();
            let total: f32 = exp.iter().sum();
            Ok(exp.into_iter().map(|e| e / total).collect())
        }

        fn output_len(&self) -> Option<usize> {
            Some(2)
        }
    }

    struct FailingBackend;

    impl InferenceBackend for FailingBackend {
        fn forward(&self, _input: ArrayView4<'_, f32>) -> Result<Vec<f32>, ClassifierError> {
            Err(ClassifierError::InferenceError("shape mismatch".into()))
        }
    }

    fn black_tensor(memory: &Arc<TensorMemory>) -> NormalizedTensor {
        let bytes = encode_png(&DynamicImage::ImageRgb8(RgbImage::new(224, 224)));
        Preprocessor::new(Arc::clone(memory)).preprocess(&bytes).unwrap()
    }

    #[test]
    fn test_infer_maps_output_positionally() {
        let memory = TensorMemory::new(2);
        let labels = LabelMetadata::from_labels(vec!["remove", "keep"]);

        let probs = infer(&MeanSoftmaxBackend, &labels, black_tensor(&memory), &memory).unwrap();
        assert_eq!(probs.len(), 2);
        assert!((probs.sum() - 1.0).abs() < 1e-5);
        // Black image: logits (-1, 1), so keep dominates.
        assert!(probs.get("keep").unwrap() > probs.get("remove").unwrap());
        assert_eq!(probs.labels().collect::<Vec<_>>(), vec!["remove", "keep"]);
    }

    #[test]
    fn test_infer_releases_buffers_on_success_and_failure() {
        let memory = TensorMemory::new(2);
        let labels = LabelMetadata::from_labels(vec!["remove", "keep"]);

        infer(&MeanSoftmaxBackend, &labels, black_tensor(&memory), &memory).unwrap();
        assert_eq!(memory.stats().live_buffers, 0);

        let result = infer(&FailingBackend, &labels, black_tensor(&memory), &memory);
        assert!(matches!(result, Err(ClassifierError::InferenceError(_))));
        assert_eq!(memory.stats().live_buffers, 0);
        assert_eq!(memory.stats().live_bytes, 0);
    }

    #[test]
    fn test_output_length_mismatch_is_inference_error() {
        let memory = TensorMemory::new(2);
        let labels = LabelMetadata::from_labels(vec!["a", "b", "c"]);
        let result = infer(&MeanSoftmaxBackend, &labels, black_tensor(&memory), &memory);
        assert!(matches!(result, Err(ClassifierError::InferenceError(_))));
        assert_eq!(memory.stats().live_buffers, 0);
    }

    fn fixture_model(dir: &str) -> std::path::PathBuf {
        Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("tests/fixtures")
            .join(dir)
            .join("model.onnx")
    }

    #[test]
    fn test_onnx_backend_structure() {
        let backend =
            OnnxBackend::from_file(&fixture_model("model"), &RuntimeConfig::default()).unwrap();
        assert_eq!(backend.input_name, "image");
        assert_eq!(backend.output_name, "probabilities");
        assert_eq!(backend.output_len(), Some(2));
        assert!(!backend.arena_shrink_pending());
    }

    #[test]
    fn test_onnx_backend_forward_after_reclaim() {
        let memory = TensorMemory::new(2);
        let backend =
            OnnxBackend::from_file(&fixture_model("model"), &RuntimeConfig::default()).unwrap();

        let tensor = black_tensor(&memory);
        let first = backend.forward(tensor.view().unwrap()).unwrap();
        assert_eq!(first.len(), 2);
        assert!((first.iter().sum::<f32>() - 1.0).abs() < 1e-5);
        assert!(first[1] > first[0]);

        backend.reclaim();
        assert!(backend.arena_shrink_pending());
        let second = backend.forward(tensor.view().unwrap()).unwrap();
        assert!(!backend.arena_shrink_pending());
        assert_eq!(first, second);
    }

    #[test]
    fn test_onnx_backend_rejects_wrong_rank() {
        let result =
            OnnxBackend::from_file(&fixture_model("bad_rank_model"), &RuntimeConfig::default());
        match result {
            Err(ClassifierError::ModelLoadError(msg)) => assert!(msg.contains("rank 3")),
            other => panic!("expected a load error, got {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn test_class_probabilities_lookup() {
        let probs =
            ClassProbabilities::from_pairs(vec![("a".to_string(), 0.25), ("b".to_string(), 0.75)]);
        assert_eq!(probs.get("b"), Some(0.75));
        assert_eq!(probs.get("c"), None);
        assert_eq!(probs.to_map().len(), 2);
        assert_eq!(probs.iter().next(), Some(("a", 0.25)));
    }
}
