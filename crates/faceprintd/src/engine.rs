//! Inference engine thread.
//!
//! The ort session needs exclusive access while the daemon serves requests
//! concurrently, so the encoder lives on a dedicated OS thread fed by a
//! request channel; handlers talk to it through a clone-safe [`EngineHandle`].

use faceprint_core::encoder::EncoderError;
use faceprint_core::{Embedding, FaceEncoder};
use image::RgbImage;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("encoder error: {0}")]
    Encoder(#[from] EncoderError),
    #[error("encoder returned no embedding")]
    EmptyResult,
    #[error("engine thread exited")]
    ChannelClosed,
}

enum EngineRequest {
    Embed {
        faces: Vec<RgbImage>,
        reply: oneshot::Sender<Result<Vec<Embedding>, EngineError>>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Embed a batch of aligned face crops.
    pub async fn embed(&self, faces: Vec<RgbImage>) -> Result<Vec<Embedding>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Embed { faces, reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Embed a single aligned face crop.
    pub async fn embed_one(&self, face: RgbImage) -> Result<Embedding, EngineError> {
        let mut embeddings = self.embed(vec![face]).await?;
        embeddings.pop().ok_or(EngineError::EmptyResult)
    }
}

/// Spawn the encoder on a dedicated OS thread.
///
/// Loads the ONNX model synchronously so a missing or broken model fails the
/// daemon at startup rather than on the first request.
pub fn spawn_engine(
    model_path: &str,
    input_size: u32,
    batch_size: usize,
    flip: bool,
) -> Result<EngineHandle, EngineError> {
    let mut encoder = FaceEncoder::load(model_path, input_size, batch_size)?;
    tracing::info!(path = model_path, input_size, batch_size, flip, "face encoder loaded");

    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("faceprint-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            while let Some(EngineRequest::Embed { faces, reply }) = rx.blocking_recv() {
                let result = encoder.embed(&faces, flip).map_err(EngineError::from);
                let _ = reply.send(result);
            }
            tracing::info!("engine thread exiting");
        })
        .expect("failed to spawn engine thread");

    Ok(EngineHandle { tx })
}
