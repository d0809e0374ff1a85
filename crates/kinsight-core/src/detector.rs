//! SCRFD face detector via ONNX Runtime.
//!
//! Letterboxes the RGB frame to 640×640, runs the 3-stride anchor-free SCRFD
//! head and keeps the surviving boxes after NMS, most confident first.

use crate::frame::Frame;
use crate::types::BoundingBox;
use image::imageops::{self, FilterType};
use ndarray::Array4;
use ort::session::Session;
use ort::value::TensorRef;
use std::cmp::Ordering;
use std::path::Path;
use thiserror::Error;

const SCRFD_INPUT_SIZE: usize = 640;
const SCRFD_MEAN: f32 = 127.5;
const SCRFD_STD: f32 = 128.0;
const SCRFD_SCORE_THRESHOLD: f32 = 0.5;
const SCRFD_NMS_THRESHOLD: f32 = 0.4;
const SCRFD_STRIDES: [usize; 3] = [8, 16, 32];
const SCRFD_ANCHORS_PER_CELL: usize = 2;

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("model file not found: {0}; download det_10g.onnx from insightface")]
    ModelNotFound(String),
    #[error("inference failed: {0}")]
    InferenceFailed(String),
    #[error("ort: {0}")]
    Ort(#[from] ort::Error),
}

/// Scale and padding applied when fitting the frame into the square input.
#[derive(Debug, Clone, Copy)]
struct Letterbox {
    scale: f32,
    pad_x: f32,
    pad_y: f32,
}

impl Letterbox {
    fn fit(width: u32, height: u32, target: usize) -> Self {
        let scale = (target as f32 / width as f32).min(target as f32 / height as f32);
        let new_w = (width as f32 * scale).round();
        let new_h = (height as f32 * scale).round();
        Self {
            scale,
            pad_x: ((target as f32 - new_w) / 2.0).floor(),
            pad_y: ((target as f32 - new_h) / 2.0).floor(),
        }
    }

    /// Map a point from network input space back to frame space.
    fn unmap(&self, x: f32, y: f32) -> (f32, f32) {
        ((x - self.pad_x) / self.scale, (y - self.pad_y) / self.scale)
    }
}

/// Output tensor positions for one stride.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct StrideSlots {
    score: usize,
    bbox: usize,
    kps: usize,
}

/// SCRFD-based face detector.
pub struct FaceDetector {
    session: Session,
    slots: [StrideSlots; 3],
}

impl FaceDetector {
    /// Load the SCRFD ONNX model from the given path.
    pub fn load(model_path: &str, intra_threads: usize) -> Result<Self, DetectorError> {
        if !Path::new(model_path).exists() {
            return Err(DetectorError::ModelNotFound(model_path.to_string()));
        }

        let session = Session::builder()?
            .with_intra_threads(intra_threads)?
            .commit_from_file(model_path)?;

        let names: Vec<String> = session.outputs().iter().map(|o| o.name().to_string()).collect();
        if names.len() < 9 {
            return Err(DetectorError::InferenceFailed(format!(
                "SCRFD needs 9 outputs (score/bbox/kps per stride), model has {}",
                names.len()
            )));
        }

        let slots = map_output_slots(&names);
        tracing::info!(path = model_path, outputs = ?names, ?slots, "loaded SCRFD model");

        Ok(Self { session, slots })
    }

    /// Detect faces in an RGB frame, most confident first.
    pub fn detect(&mut self, frame: &Frame) -> Result<Vec<BoundingBox>, DetectorError> {
        let (input, letterbox) = preprocess(frame);
        let outputs = self.session.run(ort::inputs![TensorRef::from_array_view(input.view())?])?;

        let mut candidates = Vec::new();
        for (slot, &stride) in self.slots.iter().zip(SCRFD_STRIDES.iter()) {
            let extract = |idx: usize, what: &str| {
                outputs[idx]
                    .try_extract_tensor::<f32>()
                    .map(|(_, data)| data)
                    .map_err(|e| DetectorError::InferenceFailed(format!("{what} stride {stride}: {e}")))
            };
            let head = StrideHead {
                stride,
                scores: extract(slot.score, "scores")?,
                bboxes: extract(slot.bbox, "bboxes")?,
                kps: extract(slot.kps, "kps")?,
            };
            candidates.extend(head.decode(&letterbox, SCRFD_SCORE_THRESHOLD));
        }

        let faces = nms(candidates, SCRFD_NMS_THRESHOLD);
        tracing::debug!(faces = faces.len(), "SCRFD detection complete");
        Ok(faces)
    }
}

/// Letterbox-resize the frame into a normalized NCHW (RGB) tensor.
fn preprocess(frame: &Frame) -> (Array4<f32>, Letterbox) {
    let letterbox = Letterbox::fit(frame.width(), frame.height(), SCRFD_INPUT_SIZE);
    let new_w = ((frame.width() as f32 * letterbox.scale).round() as u32).max(1);
    let new_h = ((frame.height() as f32 * letterbox.scale).round() as u32).max(1);
    let resized = imageops::resize(&frame.image, new_w, new_h, FilterType::Triangle);

    // Padding stays at 0.0, i.e. the normalized value of SCRFD_MEAN.
    let mut tensor = Array4::<f32>::zeros((1, 3, SCRFD_INPUT_SIZE, SCRFD_INPUT_SIZE));
    let (ox, oy) = (letterbox.pad_x as usize, letterbox.pad_y as usize);
    for (x, y, px) in resized.enumerate_pixels() {
        let (tx, ty) = (ox + x as usize, oy + y as usize);
        if tx >= SCRFD_INPUT_SIZE || ty >= SCRFD_INPUT_SIZE {
            continue;
        }
        for c in 0..3 {
            tensor[[0, c, ty, tx]] = (px.0[c] as f32 - SCRFD_MEAN) / SCRFD_STD;
        }
    }

    (tensor, letterbox)
}

/// Resolve which output tensor holds which head.
///
/// Exports either name their outputs `score_8`, `bbox_16`, `kps_32`, ... or use
/// opaque numeric names; in the latter case the conventional layout is
/// scores 0-2, bboxes 3-5, kps 6-8.
fn map_output_slots(names: &[String]) -> [StrideSlots; 3] {
    let position = |head: &str, stride: usize| {
        let wanted = format!("{head}_{stride}");
        names.iter().position(|n| *n == wanted)
    };

    let named: Option<Vec<StrideSlots>> = SCRFD_STRIDES
        .iter()
        .map(|&s| {
            Some(StrideSlots {
                score: position("score", s)?,
                bbox: position("bbox", s)?,
                kps: position("kps", s)?,
            })
        })
        .collect();

    match named {
        Some(slots) => [slots[0], slots[1], slots[2]],
        None => {
            tracing::info!(?names, "SCRFD output names not recognized, using positional layout");
            std::array::from_fn(|i| StrideSlots { score: i, bbox: i + 3, kps: i + 6 })
        }
    }
}

/// Raw head outputs for one stride.
struct StrideHead<'a> {
    stride: usize,
    scores: &'a [f32],
    bboxes: &'a [f32],
    kps: &'a [f32],
}

impl StrideHead<'_> {
    fn decode(&self, letterbox: &Letterbox, threshold: f32) -> Vec<BoundingBox> {
        let cols = SCRFD_INPUT_SIZE / self.stride;
        let rows = SCRFD_INPUT_SIZE / self.stride;
        let step = self.stride as f32;

        (0..rows * cols * SCRFD_ANCHORS_PER_CELL)
            .filter_map(|idx| {
                let score = *self.scores.get(idx)?;
                if score <= threshold {
                    return None;
                }
                let cell = idx / SCRFD_ANCHORS_PER_CELL;
                let cx = (cell % cols) as f32 * step;
                let cy = (cell / cols) as f32 * step;

                let d = self.bboxes.get(idx * 4..idx * 4 + 4)?;
                let (x1, y1) = letterbox.unmap(cx - d[0] * step, cy - d[1] * step);
                let (x2, y2) = letterbox.unmap(cx + d[2] * step, cy + d[3] * step);

                let landmarks = self.kps.get(idx * 10..idx * 10 + 10).map(|k| {
                    std::array::from_fn(|i| letterbox.unmap(cx + k[i * 2] * step, cy + k[i * 2 + 1] * step))
                });

                Some(BoundingBox {
                    x: x1,
                    y: y1,
                    width: x2 - x1,
                    height: y2 - y1,
                    confidence: score,
                    landmarks,
                })
            })
            .collect()
    }
}

fn by_confidence_desc(a: &BoundingBox, b: &BoundingBox) -> Ordering {
    b.confidence.partial_cmp(&a.confidence).unwrap_or(Ordering::Equal)
}

/// Greedy non-maximum suppression; output is sorted by confidence.
fn nms(mut boxes: Vec<BoundingBox>, iou_threshold: f32) -> Vec<BoundingBox> {
    boxes.sort_by(by_confidence_desc);
    let mut kept: Vec<BoundingBox> = Vec::with_capacity(boxes.len());
    for candidate in boxes {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

/// Intersection-over-Union of two boxes.
fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    let inter_w = ((a.x + a.width).min(b.x + b.width) - a.x.max(b.x)).max(0.0);
    let inter_h = ((a.y + a.height).min(b.y + b.height) - a.y.max(b.y)).max(0.0);
    let inter = inter_w * inter_h;
    let union = a.width * a.height + b.width * b.height - inter;
    if union > 0.0 { inter / union } else { 0.0 }
}
