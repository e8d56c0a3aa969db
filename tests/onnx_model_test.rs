mod common;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bg_classifier::classifier::{DEFAULT_KEEP_LABEL, DEFAULT_REMOVE_LABEL};
use bg_classifier::{BackgroundClassifier, ClassifierError, LoadOptions, ModelState, ModelStore};

/// Fixture graph: mean pixel `m`, logits `(4m - 1, 1 - 4m)`, softmax.
fn fixture(name: &str) -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests").join("fixtures").join(name)
}

fn load_options() -> LoadOptions {
    LoadOptions {
        required_labels: vec![DEFAULT_REMOVE_LABEL.to_string(), DEFAULT_KEEP_LABEL.to_string()],
        ..LoadOptions::default()
    }
}

fn loaded_classifier() -> Result<BackgroundClassifier, ClassifierError> {
    let store = Arc::new(ModelStore::new());
    store.load(fixture("model"), &load_options())?;
    BackgroundClassifier::builder().with_store(store).build()
}

#[test]
fn test_load_then_predict_all_zero_image() -> Result<(), Box<dyn std::error::Error>> {
    let classifier = loaded_classifier()?;
    let info = classifier.info();
    assert_eq!(info.model_state, ModelState::Ready);
    assert_eq!(info.labels, vec![DEFAULT_REMOVE_LABEL, DEFAULT_KEEP_LABEL]);

    let black = common::png_sized(224, 224, [0, 0, 0]);
    let result = classifier.predict(&black)?;
    assert!((result.scores.remove + result.scores.keep - 1.0).abs() < 1e-5);
    // Logits (-1, 1).
    assert!((result.scores.keep - 0.880_797).abs() < 1e-4);
    assert!(!result.should_remove_background);
    assert_eq!(result.confidence, result.scores.keep);
    Ok(())
}

#[test]
fn test_bright_image_removes_background() -> Result<(), Box<dyn std::error::Error>> {
    let classifier = loaded_classifier()?;
    let white = common::png_sized(500, 300, [255, 255, 255]);

    let result = classifier.predict(&white)?;
    assert!(result.should_remove_background);
    assert!(result.scores.remove > 0.99);
    Ok(())
}

#[test]
fn test_engine_reclaim_between_predictions() -> Result<(), Box<dyn std::error::Error>> {
    let classifier = loaded_classifier()?;
    let image = common::png_sized(224, 224, [40, 120, 200]);

    let before = classifier.predict(&image)?;
    let report = classifier.reclaimer().reclaim();
    assert!(report.engine_reclaimed);

    // The next run carries the arena shrink request and must answer the same.
    let after = classifier.predict(&image)?;
    assert_eq!(before, after);
    assert_eq!(classifier.memory().stats().live_buffers, 0);
    Ok(())
}

#[test]
fn test_wrong_input_rank_fails_to_load() {
    let store = ModelStore::new();
    let result = store.load(fixture("bad_rank_model"), &load_options());
    assert!(matches!(result, Err(ClassifierError::ModelLoadError(_))));
    assert_eq!(store.state(), ModelState::Failed);
    assert!(store.failure().is_some_and(|reason| reason.contains("rank")));
}
