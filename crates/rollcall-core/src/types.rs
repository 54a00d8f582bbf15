use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Length of every face descriptor produced and accepted by rollcall.
pub const EMBEDDING_DIM: usize = 128;

/// Bounding box of a detected face in frame pixel coordinates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
}

/// Face descriptor vector.
///
/// Holds whatever the producer handed over; use [`Embedding::is_well_formed`]
/// before trusting the length.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self { values }
    }

    /// True when the vector has exactly [`EMBEDDING_DIM`] finite components.
    pub fn is_well_formed(&self) -> bool {
        self.values.len() == EMBEDDING_DIM && self.values.iter().all(|v| v.is_finite())
    }

    /// Euclidean distance between two embeddings.
    ///
    /// Vectors of different length are infinitely far apart.
    pub fn euclidean_distance(&self, other: &Embedding) -> f32 {
        if self.values.len() != other.values.len() {
            return f32::INFINITY;
        }
        self.values
            .iter()
            .zip(other.values.iter())
            .map(|(a, b)| (a - b).powi(2))
            .sum::<f32>()
            .sqrt()
    }

    /// Little-endian `f32` encoding used for storage.
    pub fn to_le_bytes(&self) -> Vec<u8> {
        self.values.iter().flat_map(|v| v.to_le_bytes()).collect()
    }

    /// Decode a stored blob. Returns `None` if the blob is not a whole number of `f32`s.
    pub fn from_le_bytes(bytes: &[u8]) -> Option<Self> {
        if bytes.len() % 4 != 0 {
            return None;
        }
        let values = bytes
            .chunks_exact(4)
            .map(|c| f32::from_le_bytes([c[0], c[1], c[2], c[3]]))
            .collect();
        Some(Self { values })
    }
}

/// An enrolled student and their face descriptor.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Identity {
    pub student_id: String,
    pub name: String,
    pub embedding: Embedding,
    pub enrolled_at: DateTime<Utc>,
}

/// Winning candidate of a match, only produced when `distance < threshold`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MatchResult {
    pub student_id: String,
    pub name: String,
    /// Euclidean distance between query and winning embedding.
    pub distance: f32,
    /// `1 - distance / threshold`, in (0, 1].
    pub confidence: f32,
}
