//! rollcall-core — Face descriptors and matching.
//!
//! Detects the most confident face in an RGB frame, derives a 128-d
//! descriptor via ONNX Runtime, and matches descriptors against enrolled
//! identities by Euclidean distance.

pub mod crop;
pub mod detector;
pub mod matcher;
pub mod pipeline;
pub mod recognizer;
pub mod types;

pub use matcher::{EuclideanMatcher, Matcher, DEFAULT_MATCH_THRESHOLD};
pub use pipeline::{DescriptorExtractor, ExtractError, FaceDescriptor, FacePipeline};
pub use types::{BoundingBox, Embedding, Identity, MatchResult, EMBEDDING_DIM};
