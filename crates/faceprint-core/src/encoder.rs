//! ONNX face encoder.
//!
//! Extracts 512-dimensional embeddings from aligned face crops via ONNX
//! Runtime, with optional horizontal-flip augmentation.

use image::RgbImage;
use ndarray::{Array4, Axis};
use ort::session::Session;
use ort::value::TensorRef;
use std::path::Path;
use thiserror::Error;

use crate::types::Embedding;

const EMBEDDING_DIM: usize = 512;

#[derive(Error, Debug)]
pub enum EncoderError {
    #[error("model file not found: {0}")]
    ModelNotFound(String),
    #[error("expected {expected}×{expected} aligned input, got {width}×{height}")]
    BadInputSize { expected: u32, width: u32, height: u32 },
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// ONNX-backed face encoder.
///
/// Holds the inference session, so calls take `&mut self`; wrap it in a
/// worker thread for concurrent use.
#[derive(Debug)]
pub struct FaceEncoder {
    session: Session,
    input_size: u32,
    batch_size: usize,
}

impl FaceEncoder {
    /// Load the encoder model from the given path.
    pub fn load(model_path: &str, input_size: u32, batch_size: usize) -> Result<Self, EncoderError> {
        if !Path::new(model_path).exists() {
            return Err(EncoderError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(2)?
            .commit_from_file(model_path)?;

        tracing::info!(
            path = model_path,
            inputs = ?session.inputs().iter().map(|i| (i.name(), i.dtype())).collect::<Vec<_>>(),
            outputs = ?session.outputs().iter().map(|o| o.name()).collect::<Vec<_>>(),
            "loaded face encoder model"
        );

        Ok(Self {
            session,
            input_size,
            batch_size: batch_size.max(1),
        })
    }

    /// Extract one embedding per aligned face crop.
    ///
    /// Crops are processed in batches of `batch_size`. With `flip` set, each
    /// batch gets a second forward pass on its mirror image and the two
    /// embeddings are summed element-wise (the original training-time
    /// augmentation; no averaging).
    pub fn embed(&mut self, faces: &[RgbImage], flip: bool) -> Result<Vec<Embedding>, EncoderError> {
        let mut embeddings = Vec::with_capacity(faces.len());

        for chunk in faces.chunks(self.batch_size) {
            let batch = Self::preprocess_batch(chunk, self.input_size)?;
            let mut rows = self.forward(&batch)?;

            if flip {
                let mirrored = mirror_batch(&batch);
                let mirrored_rows = self.forward(&mirrored)?;
                for (row, mirrored_row) in rows.iter_mut().zip(&mirrored_rows) {
                    for (v, m) in row.iter_mut().zip(mirrored_row) {
                        *v += m;
                    }
                }
            }

            embeddings.extend(rows.into_iter().map(|values| Embedding { values }));
        }

        Ok(embeddings)
    }

    /// One forward pass; returns one embedding row per batch entry.
    fn forward(&mut self, batch: &Array4<f32>) -> Result<Vec<Vec<f32>>, EncoderError> {
        let n = batch.shape()[0];
        let outputs = self
            .session
            .run(ort::inputs![TensorRef::from_array_view(batch.view())?])?;

        let (_, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| EncoderError::InferenceFailed(format!("embedding extraction: {e}")))?;

        if data.len() != n * EMBEDDING_DIM {
            return Err(EncoderError::InferenceFailed(format!(
                "expected {n}×{EMBEDDING_DIM} output, got {} values",
                data.len()
            )));
        }

        Ok(data.chunks(EMBEDDING_DIM).map(|row| row.to_vec()).collect())
    }

    /// Pack aligned crops into an NCHW float tensor.
    ///
    /// Raw pixel-value cast, HWC → CHW: the encoder model was exported
    /// without input normalization.
    fn preprocess_batch(faces: &[RgbImage], input_size: u32) -> Result<Array4<f32>, EncoderError> {
        let size = input_size as usize;
        let mut tensor = Array4::<f32>::zeros((faces.len(), 3, size, size));

        for (i, face) in faces.iter().enumerate() {
            let (width, height) = face.dimensions();
            if width != input_size || height != input_size {
                return Err(EncoderError::BadInputSize { expected: input_size, width, height });
            }
            for (x, y, pixel) in face.enumerate_pixels() {
                for c in 0..3 {
                    tensor[[i, c, y as usize, x as usize]] = pixel[c] as f32;
                }
            }
        }

        Ok(tensor)
    }
}

/// Reverse the width axis of an NCHW batch (horizontal mirror), restoring
/// standard layout for the runtime.
fn mirror_batch(batch: &Array4<f32>) -> Array4<f32> {
    let mut mirrored = batch.clone();
    mirrored.invert_axis(Axis(3));
    mirrored.as_standard_layout().to_owned()
}
