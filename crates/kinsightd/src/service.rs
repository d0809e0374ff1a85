//! Identification flow: detect faces, gate on detection confidence, resolve
//! the primary face against the identity store.

use crate::api::{DetectionHealth, StoreHealth};
use crate::detection::{DetectionBackend, DetectionError};
use kinsight_core::{FaceDescriptor, IdentityRecord, IdentityStore, Registration, Resolution, ResolveError, Resolver};
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

pub const MSG_NO_FACE: &str = "No faces detected in the image";

#[derive(Error, Debug)]
pub enum IdentifyError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("no face detected")]
    NoFaceDetected,
    #[error("detection service unavailable: {0}")]
    DetectionServiceUnavailable(String),
    #[error("identity store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("{0}")]
    Validation(String),
}

impl IdentifyError {
    /// Stable machine-readable name, reported as `error` in responses.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::InvalidImage(_) => "InvalidImage",
            Self::NoFaceDetected => "NoFaceDetected",
            Self::DetectionServiceUnavailable(_) => "DetectionServiceUnavailable",
            Self::StoreUnavailable(_) => "StoreUnavailable",
            Self::Validation(_) => "ValidationError",
        }
    }

    /// Short message safe to hand to callers.
    pub fn message(&self) -> String {
        match self {
            Self::InvalidImage(_) => "Invalid image data".into(),
            Self::NoFaceDetected => MSG_NO_FACE.into(),
            Self::DetectionServiceUnavailable(_) => "Face detection service is unavailable".into(),
            Self::StoreUnavailable(_) => "Identity store is unavailable".into(),
            Self::Validation(msg) => msg.clone(),
        }
    }

    /// Whether retrying the same request later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DetectionServiceUnavailable(_) | Self::StoreUnavailable(_))
    }
}

impl From<DetectionError> for IdentifyError {
    fn from(e: DetectionError) -> Self {
        match e {
            DetectionError::InvalidImage(msg) => Self::InvalidImage(msg),
            DetectionError::Unavailable(msg) => Self::DetectionServiceUnavailable(msg),
        }
    }
}

impl From<ResolveError> for IdentifyError {
    fn from(e: ResolveError) -> Self {
        match e {
            ResolveError::IncompleteRegistration => {
                Self::Validation("Both person_name and person_relationship are required to add a new person".into())
            }
            ResolveError::DimensionMismatch { .. } | ResolveError::DegenerateDescriptor => {
                Self::Validation(e.to_string())
            }
            ResolveError::Store(inner) => Self::StoreUnavailable(inner.to_string()),
        }
    }
}

/// What one identify call produced.
#[derive(Debug)]
pub struct Identification {
    pub primary: Resolution,
    /// Faces after the primary one, resolved match-only.
    pub others: Vec<(FaceDescriptor, Resolution)>,
    pub primary_face: FaceDescriptor,
    /// Every face the detector returned, before the confidence gate.
    pub faces_detected: usize,
    /// The gate, when every detected face scored below it. The primary face is
    /// then the strongest one, reported unmatched without consulting the store.
    pub below_gate: Option<f32>,
}

#[derive(Debug, Clone, Default)]
pub struct IdentifyParams {
    pub image_data: Option<String>,
    pub registration: Registration,
    pub resolve_all_faces: bool,
}

#[derive(Clone)]
pub struct IdentifyService {
    detection: Arc<DetectionBackend>,
    store: Arc<dyn IdentityStore>,
    store_backend: &'static str,
    resolver: Arc<Resolver>,
    min_face_confidence: f32,
    store_timeout: Duration,
}

impl IdentifyService {
    pub fn new(
        detection: DetectionBackend,
        store: Arc<dyn IdentityStore>,
        store_backend: &'static str,
        resolver: Resolver,
        min_face_confidence: f32,
        store_timeout: Duration,
    ) -> Self {
        Self {
            detection: Arc::new(detection),
            store,
            store_backend,
            resolver: Arc::new(resolver),
            min_face_confidence,
            store_timeout,
        }
    }

    pub async fn identify(&self, params: IdentifyParams) -> Result<Identification, IdentifyError> {
        let payload = required_image(params.image_data.as_deref())?;

        let mut faces = self.detection.detect(payload).await.map_err(|e| {
            tracing::warn!(mode = self.detection.mode(), error = %e, "identify: detection failed");
            IdentifyError::from(e)
        })?;
        let faces_detected = faces.len();
        faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
        let mut faces = faces.into_iter();
        let Some(primary_face) = faces.next() else {
            tracing::info!("identify: no face in image");
            return Err(IdentifyError::NoFaceDetected);
        };

        if primary_face.confidence < self.min_face_confidence {
            tracing::info!(
                best = primary_face.confidence,
                minimum = self.min_face_confidence,
                "identify: faces below confidence gate"
            );
            return Ok(Identification {
                primary: Resolution::Unmatched {
                    detection_confidence: primary_face.confidence,
                },
                others: Vec::new(),
                primary_face,
                faces_detected,
                below_gate: Some(self.min_face_confidence),
            });
        }

        let minimum = self.min_face_confidence;
        let faces = faces.filter(move |f| f.confidence >= minimum);
        let secondary: Vec<FaceDescriptor> = if params.resolve_all_faces {
            faces.collect()
        } else {
            Vec::new()
        };

        let registration = params.registration;
        let probe = primary_face.clone();
        let (primary, others) = self
            .with_store("identify", move |store, resolver| {
                let primary = resolver.resolve(store, &probe, &registration)?;
                let mut others = Vec::with_capacity(secondary.len());
                for face in secondary {
                    let resolution = resolver.lookup(store, &face)?;
                    others.push((face, resolution));
                }
                Ok((primary, others))
            })
            .await?;

        tracing::info!(
            faces = faces_detected,
            outcome = outcome_label(&primary),
            identity = primary.record().map(|r| r.id.as_str()).unwrap_or("-"),
            confidence = primary.confidence(),
            "identify: done"
        );

        Ok(Identification {
            primary,
            others,
            primary_face,
            faces_detected,
            below_gate: None,
        })
    }

    /// Raw detection, no confidence gate and no store access.
    pub async fn detect(&self, image_data: Option<&str>) -> Result<Vec<FaceDescriptor>, IdentifyError> {
        let payload = required_image(image_data)?;
        let faces = self.detection.detect(payload).await?;
        tracing::debug!(faces = faces.len(), "detect: done");
        Ok(faces)
    }

    pub async fn list_identities(&self) -> Result<Vec<IdentityRecord>, IdentifyError> {
        self.with_store("list", |store, _| Ok(store.list()?)).await
    }

    pub async fn detection_health(&self) -> DetectionHealth {
        self.detection.health().await
    }

    pub async fn store_health(&self) -> StoreHealth {
        match self.with_store("count", |store, _| Ok(store.count()?)).await {
            Ok(n) => StoreHealth {
                backend: self.store_backend.into(),
                ready: true,
                identities: Some(n),
                detail: None,
            },
            Err(e) => StoreHealth {
                backend: self.store_backend.into(),
                ready: false,
                identities: None,
                detail: Some(e.to_string()),
            },
        }
    }

    /// Run a store operation on the blocking pool, bounded by the store timeout.
    async fn with_store<T, F>(&self, op: &'static str, f: F) -> Result<T, IdentifyError>
    where
        T: Send + 'static,
        F: FnOnce(&dyn IdentityStore, &Resolver) -> Result<T, ResolveError> + Send + 'static,
    {
        let store = self.store.clone();
        let resolver = self.resolver.clone();
        let task = tokio::task::spawn_blocking(move || f(store.as_ref(), &resolver));

        match tokio::time::timeout(self.store_timeout, task).await {
            Ok(Ok(result)) => result.map_err(|e| {
                if let ResolveError::Store(inner) = &e {
                    tracing::error!(op, error = %inner, "store operation failed");
                }
                IdentifyError::from(e)
            }),
            Ok(Err(join)) => {
                tracing::error!(op, error = %join, "store task panicked");
                Err(IdentifyError::StoreUnavailable(join.to_string()))
            }
            Err(_) => {
                tracing::error!(op, timeout_secs = self.store_timeout.as_secs(), "store operation timed out");
                Err(IdentifyError::StoreUnavailable(format!("{op} timed out")))
            }
        }
    }
}

fn required_image(image_data: Option<&str>) -> Result<&str, IdentifyError> {
    match image_data.map(str::trim) {
        Some(data) if !data.is_empty() => Ok(data),
        _ => Err(IdentifyError::Validation("image_data is required".into())),
    }
}

fn outcome_label(resolution: &Resolution) -> &'static str {
    match resolution {
        Resolution::Matched { .. } => "matched",
        Resolution::Created { .. } => "created",
        Resolution::Unmatched { .. } => "unmatched",
    }
}
