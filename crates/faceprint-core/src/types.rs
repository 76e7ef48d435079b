use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Rectangular face region, corner coordinates in pixels.
///
/// x1 ≤ x2 / y1 ≤ y2 is not required up front: the aligner clamps
/// out-of-order or out-of-bounds boxes instead of rejecting them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl From<[i32; 4]> for BoundingBox {
    fn from([x1, y1, x2, y2]: [i32; 4]) -> Self {
        Self { x1, y1, x2, y2 }
    }
}

#[derive(Error, Debug)]
pub enum LandmarkError {
    #[error(
        "expected exactly 5 landmarks (left eye, right eye, nose tip, \
         left mouth corner, right mouth corner), got {got}"
    )]
    WrongCount { got: usize },
}

/// Five facial landmarks in canonical order: left eye, right eye, nose tip,
/// left mouth corner, right mouth corner.
///
/// The order pairs positionally with the aligner's reference template, so it
/// is part of the contract. Untrusted input goes through the fallible
/// `TryFrom<Vec<[f32; 2]>>` conversion, which rejects any other count.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Landmarks([(f32, f32); 5]);

impl Landmarks {
    pub fn new(points: [(f32, f32); 5]) -> Self {
        Self(points)
    }

    pub fn points(&self) -> &[(f32, f32); 5] {
        &self.0
    }
}

impl TryFrom<Vec<[f32; 2]>> for Landmarks {
    type Error = LandmarkError;

    fn try_from(points: Vec<[f32; 2]>) -> Result<Self, Self::Error> {
        if points.len() != 5 {
            return Err(LandmarkError::WrongCount { got: points.len() });
        }
        let mut out = [(0.0f32, 0.0f32); 5];
        for (slot, p) in out.iter_mut().zip(points) {
            *slot = (p[0], p[1]);
        }
        Ok(Self(out))
    }
}

/// Face embedding vector (512-dimensional for the bundled encoder model).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity between two embeddings.
    ///
    /// Returns a value in [-1, 1]; zero vectors compare as 0.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        let mut dot = 0.0f32;
        let mut norm_a = 0.0f32;
        let mut norm_b = 0.0f32;

        for (a, b) in self.values.iter().zip(other.values.iter()) {
            dot += a * b;
            norm_a += a * a;
            norm_b += b * b;
        }

        let denom = norm_a.sqrt() * norm_b.sqrt();
        if denom > 0.0 {
            dot / denom
        } else {
            0.0
        }
    }
}
