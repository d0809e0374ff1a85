//! JSON request and response bodies of the HTTP interface.
//!
//! `DetectRequest`/`DetectResponse` double as the wire format of the remote
//! detection backend, so one daemon can serve another.

use chrono::{DateTime, Utc};
use kinsight_core::{BoundingBox, FaceDescriptor, IdentityRecord, Resolution};
use serde::{Deserialize, Serialize};

pub const UNKNOWN_PERSON: &str = "Unknown";
pub const MSG_UNRECOGNIZED: &str =
    "Face detected but not recognized. Provide name and relationship to add new person.";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifyRequest {
    #[serde(default)]
    pub image_data: Option<String>,
    #[serde(default)]
    pub person_name: Option<String>,
    #[serde(default)]
    pub person_relationship: Option<String>,
    #[serde(default)]
    pub person_color: Option<String>,
    /// Also match (never register) every face after the primary one.
    #[serde(default)]
    pub resolve_all_faces: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentifyResponse {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub person: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub relationship: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub is_new_person: Option<bool>,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detection_confidence: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_similarity: Option<f32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces_detected: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub faces: Option<Vec<FaceResult>>,
}

/// Per-face outcome reported when `resolve_all_faces` is set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FaceResult {
    pub recognized: bool,
    pub person: String,
    pub relationship: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub color: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_id: Option<String>,
    pub confidence: f32,
    pub detection_confidence: f32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub match_similarity: Option<f32>,
    pub region: BoundingBox,
}

impl IdentifyResponse {
    /// Response for a primary face that was matched, created or left unmatched.
    pub fn resolved(primary: &Resolution, faces_detected: usize) -> Self {
        let mut response = Self {
            confidence: Some(primary.confidence()),
            detection_confidence: Some(primary.detection_confidence()),
            match_similarity: primary.match_similarity(),
            faces_detected: Some(faces_detected),
            ..Self::default()
        };

        match primary.record() {
            Some(record) => {
                response.success = true;
                response.person = Some(record.name.clone());
                response.relationship = Some(record.relationship.clone());
                response.color = Some(record.color.clone());
                response.identity_id = Some(record.id.clone());
                response.is_new_person = Some(primary.is_new_person());
                response.message = if primary.is_new_person() {
                    format!("New person added: {} ({})", record.name, record.relationship)
                } else {
                    format!("Recognized {} ({})", record.name, record.relationship)
                };
            }
            None => {
                response.person = Some(UNKNOWN_PERSON.into());
                response.relationship = Some(UNKNOWN_PERSON.into());
                response.is_new_person = Some(false);
                response.message = MSG_UNRECOGNIZED.into();
            }
        }
        response
    }

    /// Unmatched answer for a photo whose faces all scored below `gate`.
    pub fn below_gate(primary: &Resolution, faces_detected: usize, gate: f32) -> Self {
        let mut response = Self::resolved(primary, faces_detected);
        response.message = format!(
            "Face detected but confidence too low ({:.2} < {gate:.2})",
            primary.detection_confidence()
        );
        response
    }

    pub fn failure(kind: &str, message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            error: Some(kind.into()),
            ..Self::default()
        }
    }
}

impl FaceResult {
    pub fn new(face: &FaceDescriptor, resolution: &Resolution) -> Self {
        let record = resolution.record();
        Self {
            recognized: record.is_some(),
            person: record.map_or_else(|| UNKNOWN_PERSON.into(), |r| r.name.clone()),
            relationship: record.map_or_else(|| UNKNOWN_PERSON.into(), |r| r.relationship.clone()),
            color: record.map(|r| r.color.clone()),
            identity_id: record.map(|r| r.id.clone()),
            confidence: resolution.confidence(),
            detection_confidence: resolution.detection_confidence(),
            match_similarity: resolution.match_similarity(),
            region: face.region.clone(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectRequest {
    #[serde(default)]
    pub image_data: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DetectResponse {
    pub success: bool,
    #[serde(default)]
    pub faces: Vec<FaceDescriptor>,
    #[serde(default)]
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Identity as listed over HTTP; the descriptor stays server-side.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitySummary {
    pub id: String,
    pub name: String,
    pub relationship: String,
    pub color: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<IdentityRecord> for IdentitySummary {
    fn from(r: IdentityRecord) -> Self {
        Self {
            id: r.id,
            name: r.name,
            relationship: r.relationship,
            color: r.color,
            created_at: r.created_at,
            updated_at: r.updated_at,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IdentitiesResponse {
    pub success: bool,
    pub count: usize,
    pub identities: Vec<IdentitySummary>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: String,
    pub service: String,
    pub version: String,
    pub detection: DetectionHealth,
    pub store: StoreHealth,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DetectionHealth {
    pub mode: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_loaded: Option<bool>,
    /// Detections served by the local engine since start.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub processed: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreHealth {
    pub backend: String,
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identities: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}
