//! facenet-core: face detection aggregation and identity matching.
//!
//! A cascade primitive is driven across several minimum face sizes to find
//! faces, FaceNet embeddings are computed via ONNX Runtime, and each
//! embedding is matched against an identity store of per-person centroids
//! and acceptance radii.

pub mod area;
pub mod config;
pub mod detector;
pub mod estimator;
pub mod face;
pub mod marker;
pub mod people;
pub mod recognizer;
#[cfg(feature = "rustface")]
pub mod rustface_cascade;
pub mod storage;

pub use area::{Area, PixelBounds, RelativeArea};
pub use config::Config;
pub use detector::{Cascade, FaceExtractor, LandmarkCascade};
pub use estimator::{Estimator, EstimatorError};
pub use face::{Face, Faces};
pub use marker::{FaceMarker, FaceMarkers};
pub use people::{MatchError, People, Person};
pub use recognizer::{EmbeddingService, FaceRecognizer, OnnxEmbedder};
#[cfg(feature = "rustface")]
pub use rustface_cascade::RustfaceCascade;
pub use storage::Storage;
