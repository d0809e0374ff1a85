//! Test doubles shared by the daemon's unit tests.

use kinsight_core::{
    BoundingBox, DetectError, DetectionAdapter, Embedding, FaceDescriptor, FrameError, IdentityMatch,
    IdentityRecord, IdentityStore, NewIdentity, StoreError,
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub const DIM: usize = 512;

/// Unit vector along axis `seed`.
pub fn spike(seed: usize) -> Vec<f32> {
    let mut v = vec![0.0f32; DIM];
    v[seed % DIM] = 1.0;
    v
}

pub fn descriptor(seed: usize, confidence: f32) -> FaceDescriptor {
    descriptor_from(spike(seed), confidence)
}

pub fn descriptor_from(values: Vec<f32>, confidence: f32) -> FaceDescriptor {
    FaceDescriptor {
        embedding: Embedding::new(values),
        confidence,
        region: BoundingBox {
            x: 10.0,
            y: 20.0,
            width: 90.0,
            height: 110.0,
            confidence,
            landmarks: None,
        },
    }
}

/// Adapter that answers from a fixed table keyed by the exact image bytes.
///
/// Empty input is an invalid image; unknown bytes contain no face.
pub struct ScriptedAdapter {
    faces: HashMap<Vec<u8>, Vec<FaceDescriptor>>,
    warm: bool,
    loads: Arc<AtomicUsize>,
    delay: Option<Duration>,
}

impl ScriptedAdapter {
    pub fn new() -> Self {
        Self {
            faces: HashMap::new(),
            warm: false,
            loads: Arc::new(AtomicUsize::new(0)),
            delay: None,
        }
    }

    /// Block every detection for `delay` before answering.
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn with_faces(mut self, image: &[u8], faces: Vec<FaceDescriptor>) -> Self {
        self.faces.insert(image.to_vec(), faces);
        self
    }

    /// Number of times models were "loaded".
    pub fn load_counter(&self) -> Arc<AtomicUsize> {
        self.loads.clone()
    }
}

impl DetectionAdapter for ScriptedAdapter {
    fn warm_up(&mut self) -> Result<(), DetectError> {
        if !self.warm {
            self.loads.fetch_add(1, Ordering::SeqCst);
            self.warm = true;
        }
        Ok(())
    }

    fn is_warm(&self) -> bool {
        self.warm
    }

    fn detect(&mut self, image: &[u8]) -> Result<Vec<FaceDescriptor>, DetectError> {
        if let Some(delay) = self.delay {
            std::thread::sleep(delay);
        }
        if image.is_empty() {
            return Err(DetectError::InvalidImage(FrameError::Empty));
        }
        self.warm_up()?;
        Ok(self.faces.get(image).cloned().unwrap_or_default())
    }
}

/// Store whose backend is always down.
pub struct DownStore;

impl IdentityStore for DownStore {
    fn find_nearest(&self, _: &[f32], _: f32) -> Result<Option<IdentityMatch>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn insert(&self, _: NewIdentity) -> Result<IdentityRecord, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn list(&self) -> Result<Vec<IdentityRecord>, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }

    fn count(&self) -> Result<usize, StoreError> {
        Err(StoreError::Unavailable("connection refused".into()))
    }
}
