use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// Bounding box for a detected face, with optional facial landmarks.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BoundingBox {
    pub x: f32,
    pub y: f32,
    pub width: f32,
    pub height: f32,
    pub confidence: f32,
    /// Five-point facial landmarks: [left_eye, right_eye, nose, left_mouth, right_mouth].
    pub landmarks: Option<[(f32, f32); 5]>,
}

/// Face embedding vector (512-dimensional for ArcFace).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub values: Vec<f32>,
    /// Model version that produced this embedding (e.g., "w600k_r50").
    pub model_version: Option<String>,
}

impl Embedding {
    pub fn new(values: Vec<f32>) -> Self {
        Self {
            values,
            model_version: None,
        }
    }

    pub fn dim(&self) -> usize {
        self.values.len()
    }

    /// Cosine similarity in [-1, 1]. Higher = more similar.
    pub fn similarity(&self, other: &Embedding) -> f32 {
        cosine_similarity(&self.values, &other.values)
    }
}

/// Cosine similarity of two vectors; 0.0 when either has zero norm.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom > 0.0 { dot / denom } else { 0.0 }
}

/// One detected face: its descriptor plus where and how confidently it was found.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceDescriptor {
    #[serde(rename = "descriptor")]
    pub embedding: Embedding,
    /// Detector score in [0, 1].
    pub confidence: f32,
    pub region: BoundingBox,
}

/// A known person.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentityRecord {
    pub id: String,
    pub name: String,
    pub relationship: String,
    pub color: String,
    pub descriptor: Embedding,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Fields supplied when registering a new person. The store assigns id and timestamps.
#[derive(Debug, Clone)]
pub struct NewIdentity {
    pub name: String,
    pub relationship: String,
    pub color: String,
    pub descriptor: Embedding,
}

/// A stored record together with its similarity to the probe descriptor.
#[derive(Debug, Clone)]
pub struct IdentityMatch {
    pub record: IdentityRecord,
    pub similarity: f32,
}

/// Strategy for finding the closest record in a gallery.
pub trait Matcher {
    fn nearest(
        &self,
        probe: &[f32],
        gallery: &[IdentityRecord],
        threshold: f32,
    ) -> Option<IdentityMatch>;
}

/// Cosine similarity matcher.
///
/// A record qualifies when its similarity is at or above `threshold`. Among
/// qualifying records the highest similarity wins; ties go to the smallest id,
/// so the result never depends on gallery order.
pub struct CosineMatcher;

impl Matcher for CosineMatcher {
    fn nearest(
        &self,
        probe: &[f32],
        gallery: &[IdentityRecord],
        threshold: f32,
    ) -> Option<IdentityMatch> {
        let mut best: Option<(usize, f32)> = None;

        for (i, record) in gallery.iter().enumerate() {
            if record.descriptor.dim() != probe.len() {
                continue;
            }
            let sim = cosine_similarity(probe, &record.descriptor.values);
            if sim < threshold {
                continue;
            }
            let better = match best {
                None => true,
                Some((j, best_sim)) => match sim.partial_cmp(&best_sim) {
                    Some(Ordering::Greater) => true,
                    Some(Ordering::Equal) => record.id < gallery[j].id,
                    _ => false,
                },
            };
            if better {
                best = Some((i, sim));
            }
        }

        best.map(|(idx, similarity)| IdentityMatch {
            record: gallery[idx].clone(),
            similarity,
        })
    }
}
