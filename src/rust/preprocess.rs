//! Image preprocessing.
//!
//! Turns arbitrary encoded image bytes into the `[1, 224, 224, 3]` `f32`
//! tensor the model was trained on. The steps and their order are fixed:
//!
//! 1. decode the raster image
//! 2. stretch ("fill" fit) to exactly 224×224, ignoring aspect ratio
//! 3. keep three channels, dropping alpha
//! 4. add a leading batch dimension of 1
//! 5. cast to `f32`
//! 6. divide by 255.0
//!
//! No mean subtraction or channel reordering happens anywhere.

use std::sync::Arc;

use image::imageops::FilterType;
use log::debug;
use ndarray::ArrayView4;

use crate::classifier::ClassifierError;
use crate::memory::{TensorMemory, TrackedBuffer};

/// Width and height the model expects.
pub const INPUT_SIZE: usize = 224;
pub const INPUT_CHANNELS: usize = 3;
/// NHWC shape of one preprocessed image.
pub const INPUT_SHAPE: [usize; 4] = [1, INPUT_SIZE, INPUT_SIZE, INPUT_CHANNELS];
/// Number of values in one preprocessed image.
pub const INPUT_LEN: usize = INPUT_SIZE * INPUT_SIZE * INPUT_CHANNELS;

/// Lanczos3, the kernel the training pipeline resized with.
pub const RESIZE_FILTER: FilterType = FilterType::Lanczos3;

/// A preprocessed image owned by exactly one prediction call.
///
/// The backing buffer is borrowed from the pool and goes back to it when the
/// tensor drops, at which point it also stops counting as live.
#[derive(Debug)]
pub struct NormalizedTensor {
    data: Vec<f32>,
    memory: Arc<TensorMemory>,
    _tracked: TrackedBuffer,
}

impl NormalizedTensor {
    pub fn shape(&self) -> [usize; 4] {
        INPUT_SHAPE
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.data
    }

    pub fn view(&self) -> Result<ArrayView4<'_, f32>, ClassifierError> {
        ArrayView4::from_shape(INPUT_SHAPE, &self.data)
            .map_err(|e| {
                ClassifierError::InferenceError(format!("Invalid input tensor shape: {}", e))
            })
    }
}

impl Drop for NormalizedTensor {
    fn drop(&mut self) {
        let data = std::mem::take(&mut self.data);
        self.memory.pool().release(data);
    }
}

#[derive(Debug, Clone)]
pub struct Preprocessor {
    memory: Arc<TensorMemory>,
}

impl Preprocessor {
    pub fn new(memory: Arc<TensorMemory>) -> Self {
        Self { memory }
    }

    pub fn memory(&self) -> &Arc<TensorMemory> {
        &self.memory
    }

    pub fn preprocess(&self, image_bytes: &[u8]) -> Result<NormalizedTensor, ClassifierError> {
        if image_bytes.is_empty() {
            return Err(ClassifierError::ImageDecodeError("Image buffer is empty".into()));
        }

        let rgb = {
            let decoded = image::load_from_memory(image_bytes)?;
            let _decoded = self.memory.track(decoded.as_bytes().len());
            debug!(
                "Decoded {}x{} image ({:?})",
                decoded.width(),
                decoded.height(),
                decoded.color()
            );
            decoded
                .resize_exact(INPUT_SIZE as u32, INPUT_SIZE as u32, RESIZE_FILTER)
                .into_rgb8()
        };
        let _rgb = self.memory.track(rgb.as_raw().len());

        let pixels = rgb.as_raw();
        if pixels.len() != INPUT_LEN {
            return Err(ClassifierError::ImageDecodeError(format!(
                "Resized image has {} values, expected {}",
                pixels.len(),
                INPUT_LEN
            )));
        }

        let mut data = self.memory.pool().acquire(INPUT_LEN);
        data.extend(pixels.iter().map(|&v| f32::from(v) / 255.0));

        Ok(NormalizedTensor {
            data,
            memory: Arc::clone(&self.memory),
            _tracked: self.memory.track(INPUT_LEN * std::mem::size_of::<f32>()),
        })
    }
}
