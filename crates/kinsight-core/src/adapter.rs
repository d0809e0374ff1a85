//! Detection adapter: encoded image bytes in, one descriptor per face out.

use crate::detector::{DetectorError, FaceDetector};
use crate::frame::{Frame, FrameError};
use crate::recognizer::{FaceRecognizer, RecognizerError};
use crate::types::FaceDescriptor;
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectError {
    #[error("invalid image: {0}")]
    InvalidImage(#[from] FrameError),
    #[error("detector: {0}")]
    Detector(#[from] DetectorError),
    #[error("recognizer: {0}")]
    Recognizer(#[from] RecognizerError),
}

/// Turns images into face descriptors.
///
/// `warm_up` loads whatever the adapter needs and must be idempotent.
/// `detect` validates the input before warming up lazily, so bad bytes are
/// always `InvalidImage`. It returns faces in the detector's natural order
/// and an empty vector when the image holds no face.
pub trait DetectionAdapter: Send {
    fn warm_up(&mut self) -> Result<(), DetectError>;

    fn is_warm(&self) -> bool;

    fn detect(&mut self, image: &[u8]) -> Result<Vec<FaceDescriptor>, DetectError>;
}

/// Model file locations for the ONNX adapter.
#[derive(Debug, Clone)]
pub struct ModelPaths {
    pub scrfd: PathBuf,
    pub arcface: PathBuf,
}

impl ModelPaths {
    /// Standard insightface file names inside `dir`.
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            scrfd: dir.join("det_10g.onnx"),
            arcface: dir.join("w600k_r50.onnx"),
        }
    }
}

struct Pipeline {
    detector: FaceDetector,
    recognizer: FaceRecognizer,
}

impl Pipeline {
    fn load(paths: &ModelPaths, intra_threads: usize) -> Result<Self, DetectError> {
        Ok(Self {
            detector: FaceDetector::load(&paths.scrfd.to_string_lossy(), intra_threads)?,
            recognizer: FaceRecognizer::load(&paths.arcface.to_string_lossy(), intra_threads)?,
        })
    }
}

/// SCRFD + ArcFace adapter. Sessions are created on the first `warm_up`.
pub struct OnnxAdapter {
    paths: ModelPaths,
    intra_threads: usize,
    pipeline: Option<Pipeline>,
}

impl OnnxAdapter {
    pub fn new(paths: ModelPaths, intra_threads: usize) -> Self {
        Self {
            paths,
            intra_threads: intra_threads.max(1),
            pipeline: None,
        }
    }

    /// Loaded sessions, creating them on first use.
    fn pipeline(&mut self) -> Result<&mut Pipeline, DetectError> {
        match self.pipeline {
            Some(ref mut pipeline) => Ok(pipeline),
            None => {
                let loaded = Pipeline::load(&self.paths, self.intra_threads)?;
                tracing::info!("ONNX detection pipeline ready");
                Ok(self.pipeline.insert(loaded))
            }
        }
    }
}

impl DetectionAdapter for OnnxAdapter {
    fn warm_up(&mut self) -> Result<(), DetectError> {
        self.pipeline().map(|_| ())
    }

    fn is_warm(&self) -> bool {
        self.pipeline.is_some()
    }

    fn detect(&mut self, image: &[u8]) -> Result<Vec<FaceDescriptor>, DetectError> {
        let frame = Frame::decode(image)?;
        let pipeline = self.pipeline()?;

        let boxes = pipeline.detector.detect(&frame)?;
        let mut faces = Vec::with_capacity(boxes.len());
        for region in boxes {
            match pipeline.recognizer.extract(&frame, &region) {
                Ok(embedding) => faces.push(FaceDescriptor {
                    embedding,
                    confidence: region.confidence,
                    region,
                }),
                Err(RecognizerError::NoLandmarks) => {
                    tracing::warn!(confidence = region.confidence, "face without landmarks skipped");
                }
                Err(e) => return Err(e.into()),
            }
        }

        tracing::debug!(
            width = frame.width(),
            height = frame.height(),
            faces = faces.len(),
            "image described"
        );
        Ok(faces)
    }
}
