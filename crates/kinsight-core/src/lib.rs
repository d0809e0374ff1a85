//! kinsight-core: face detection, recognition and identity resolution.
//!
//! Uses SCRFD for face detection and ArcFace for face descriptors, both
//! running via ONNX Runtime on CPU, and matches descriptors against known
//! identities by cosine similarity.

pub mod adapter;
pub mod alignment;
pub mod detector;
pub mod frame;
pub mod recognizer;
pub mod resolver;
pub mod store;
pub mod types;

pub use adapter::{DetectError, DetectionAdapter, ModelPaths, OnnxAdapter};
pub use detector::FaceDetector;
pub use frame::{decode_payload, encode_payload, Frame, FrameError};
pub use recognizer::FaceRecognizer;
pub use resolver::{Registration, Resolution, ResolveError, Resolver, ResolverConfig};
pub use store::{IdentityStore, MemoryStore, StoreError};
pub use types::{BoundingBox, CosineMatcher, Embedding, FaceDescriptor, IdentityMatch, IdentityRecord, Matcher, NewIdentity};

use std::path::PathBuf;

/// Default directory for the ONNX model files: `$XDG_DATA_HOME/kinsight/models`.
pub fn default_model_dir() -> PathBuf {
    data_home().join("kinsight").join("models")
}

/// `$XDG_DATA_HOME`, falling back to `~/.local/share`.
pub fn data_home() -> PathBuf {
    std::env::var("XDG_DATA_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".local/share")
        })
}
