//! faceprint-core — face alignment and embedding extraction.
//!
//! Normalizes face images to the canonical ArcFace crop and extracts
//! fixed-length embeddings via ONNX Runtime for CPU inference.

pub mod aligner;
pub mod encoder;
pub mod types;

pub use aligner::FaceAligner;
pub use encoder::FaceEncoder;
pub use types::{BoundingBox, Embedding, LandmarkError, Landmarks};
