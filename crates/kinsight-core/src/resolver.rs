//! Identity resolution: match a face against known people, or register it.
//!
//! Only descriptors of the configured dimensionality are accepted. A face is
//! bound to the closest stored identity whose cosine similarity is at least
//! the threshold. When nothing qualifies and the caller supplied both a name
//! and a relationship, a new identity is created from the face; with neither
//! supplied the face is reported as unmatched and the store is not touched.
//!
//! Two near-simultaneous first sightings of the same person can both miss
//! and both insert. Nothing here guards against that; the store would need a
//! uniqueness constraint to do so.

use crate::recognizer::ARCFACE_EMBEDDING_DIM;
use crate::store::{IdentityStore, StoreError};
use crate::types::{FaceDescriptor, IdentityRecord, NewIdentity};
use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_SIMILARITY_THRESHOLD: f32 = 0.7;

/// Reported as the confidence of a freshly registered identity.
pub const NEW_IDENTITY_CONFIDENCE: f32 = 1.0;

/// UI colors handed out to new identities that did not ask for one.
pub const COLOR_PALETTE: [&str; 8] = ["red", "blue", "green", "yellow", "purple", "orange", "pink", "cyan"];

#[derive(Error, Debug)]
pub enum ResolveError {
    #[error("descriptor has {actual} dimensions, expected {expected}")]
    DimensionMismatch { expected: usize, actual: usize },
    #[error("descriptor is degenerate (zero norm or non-finite values)")]
    DegenerateDescriptor,
    #[error("both a name and a relationship are required to register a new person")]
    IncompleteRegistration,
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Minimum cosine similarity (inclusive) for a match.
    pub similarity_threshold: f32,
    pub descriptor_dim: usize,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: DEFAULT_SIMILARITY_THRESHOLD,
            descriptor_dim: ARCFACE_EMBEDDING_DIM,
        }
    }
}

/// Caller-supplied details used when an unknown face should be registered.
#[derive(Debug, Clone, Default)]
pub struct Registration {
    pub name: Option<String>,
    pub relationship: Option<String>,
    pub color: Option<String>,
}

impl Registration {
    pub fn new(name: impl Into<String>, relationship: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            relationship: Some(relationship.into()),
            color: None,
        }
    }

    /// `Ok(None)` when nothing was supplied, an error when only half was.
    fn fields(&self) -> Result<Option<(&str, &str)>, ResolveError> {
        match (clean(&self.name), clean(&self.relationship)) {
            (Some(name), Some(relationship)) => Ok(Some((name, relationship))),
            (None, None) => Ok(None),
            _ => Err(ResolveError::IncompleteRegistration),
        }
    }
}

/// Trimmed value, or `None` when absent or blank.
fn clean(v: &Option<String>) -> Option<&str> {
    v.as_deref().map(str::trim).filter(|s| !s.is_empty())
}

/// Outcome of resolving one face.
#[derive(Debug, Clone)]
pub enum Resolution {
    Matched {
        record: IdentityRecord,
        similarity: f32,
        detection_confidence: f32,
    },
    Created {
        record: IdentityRecord,
        detection_confidence: f32,
    },
    Unmatched {
        detection_confidence: f32,
    },
}

impl Resolution {
    pub fn record(&self) -> Option<&IdentityRecord> {
        match self {
            Resolution::Matched { record, .. } | Resolution::Created { record, .. } => Some(record),
            Resolution::Unmatched { .. } => None,
        }
    }

    pub fn detection_confidence(&self) -> f32 {
        match self {
            Resolution::Matched { detection_confidence, .. }
            | Resolution::Created { detection_confidence, .. }
            | Resolution::Unmatched { detection_confidence } => *detection_confidence,
        }
    }

    /// Similarity to the matched record; only present for `Matched`.
    pub fn match_similarity(&self) -> Option<f32> {
        match self {
            Resolution::Matched { similarity, .. } => Some(*similarity),
            _ => None,
        }
    }

    /// Single headline confidence: match similarity, 1.0 for a new identity,
    /// detection confidence when unmatched.
    pub fn confidence(&self) -> f32 {
        match self {
            Resolution::Matched { similarity, .. } => *similarity,
            Resolution::Created { .. } => NEW_IDENTITY_CONFIDENCE,
            Resolution::Unmatched { detection_confidence } => *detection_confidence,
        }
    }

    pub fn is_new_person(&self) -> bool {
        matches!(self, Resolution::Created { .. })
    }
}

pub struct Resolver {
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(config: ResolverConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &ResolverConfig {
        &self.config
    }

    /// Match the face, registering it when unknown and `registration` is complete.
    pub fn resolve(
        &self,
        store: &dyn IdentityStore,
        face: &FaceDescriptor,
        registration: &Registration,
    ) -> Result<Resolution, ResolveError> {
        let found = self.lookup(store, face)?;
        if !matches!(found, Resolution::Unmatched { .. }) {
            return Ok(found);
        }

        let Some((name, relationship)) = registration.fields()? else {
            tracing::debug!(confidence = face.confidence, "face unmatched, no registration supplied");
            return Ok(found);
        };

        let color = registration
            .color
            .as_deref()
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .map(str::to_string)
            .unwrap_or_else(random_color);

        let record = store.insert(NewIdentity {
            name: name.to_string(),
            relationship: relationship.to_string(),
            color,
            descriptor: face.embedding.clone(),
        })?;
        tracing::info!(id = %record.id, name = %record.name, relationship = %record.relationship, "registered new identity");

        Ok(Resolution::Created {
            record,
            detection_confidence: face.confidence,
        })
    }

    /// Match only; never writes to the store.
    pub fn lookup(&self, store: &dyn IdentityStore, face: &FaceDescriptor) -> Result<Resolution, ResolveError> {
        let actual = face.embedding.dim();
        if actual != self.config.descriptor_dim {
            return Err(ResolveError::DimensionMismatch {
                expected: self.config.descriptor_dim,
                actual,
            });
        }
        if !is_usable(&face.embedding.values) {
            return Err(ResolveError::DegenerateDescriptor);
        }

        match store.find_nearest(&face.embedding.values, self.config.similarity_threshold)? {
            Some(found) => {
                tracing::debug!(id = %found.record.id, similarity = found.similarity, "face matched");
                Ok(Resolution::Matched {
                    record: found.record,
                    similarity: found.similarity,
                    detection_confidence: face.confidence,
                })
            }
            None => Ok(Resolution::Unmatched {
                detection_confidence: face.confidence,
            }),
        }
    }
}

/// Finite and of non-zero norm; anything else can never match itself.
fn is_usable(values: &[f32]) -> bool {
    values.iter().all(|v| v.is_finite()) && values.iter().any(|v| *v != 0.0)
}

pub fn random_color() -> String {
    COLOR_PALETTE
        .choose(&mut rand::thread_rng())
        .copied()
        .unwrap_or("blue")
        .to_string()
}
