//! Where faces get detected: the local engine thread or a remote daemon.

use crate::api::{DetectRequest, DetectResponse, DetectionHealth};
use crate::engine::{EngineError, EngineHandle};
use kinsight_core::{decode_payload, DetectError, FaceDescriptor};
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum DetectionError {
    #[error("invalid image: {0}")]
    InvalidImage(String),
    #[error("detection unavailable: {0}")]
    Unavailable(String),
}

impl From<EngineError> for DetectionError {
    fn from(e: EngineError) -> Self {
        match e {
            EngineError::Detect(DetectError::InvalidImage(inner)) => Self::InvalidImage(inner.to_string()),
            other => Self::Unavailable(other.to_string()),
        }
    }
}

pub enum DetectionBackend {
    Local { engine: EngineHandle, timeout: Duration },
    Remote(RemoteDetector),
}

impl DetectionBackend {
    pub fn local(engine: EngineHandle, timeout: Duration) -> Self {
        Self::Local { engine, timeout }
    }

    pub fn mode(&self) -> &'static str {
        match self {
            Self::Local { .. } => "local",
            Self::Remote(_) => "remote",
        }
    }

    /// Detect faces in a base64 (or data URL) payload.
    pub async fn detect(&self, payload: &str) -> Result<Vec<FaceDescriptor>, DetectionError> {
        match self {
            Self::Local { engine, timeout } => {
                let image = decode_payload(payload).map_err(|e| DetectionError::InvalidImage(e.to_string()))?;
                match tokio::time::timeout(*timeout, engine.detect(image)).await {
                    Ok(result) => Ok(result?),
                    Err(_) => Err(DetectionError::Unavailable(format!(
                        "local detection timed out after {}ms",
                        timeout.as_millis()
                    ))),
                }
            }
            Self::Remote(remote) => remote.detect(payload).await,
        }
    }

    pub async fn health(&self) -> DetectionHealth {
        match self {
            Self::Local { engine, timeout } => match tokio::time::timeout(*timeout, engine.status()).await {
                Ok(Ok(status)) => DetectionHealth {
                    mode: self.mode().into(),
                    ready: true,
                    models_loaded: Some(status.warm),
                    processed: Some(status.processed),
                    detail: None,
                },
                Ok(Err(e)) => unhealthy(self.mode(), e.to_string()),
                Err(_) => unhealthy(self.mode(), "engine did not answer in time".into()),
            },
            Self::Remote(remote) => match remote.health().await {
                Ok(()) => DetectionHealth {
                    mode: self.mode().into(),
                    ready: true,
                    models_loaded: None,
                    processed: None,
                    detail: Some(remote.base_url.clone()),
                },
                Err(e) => unhealthy(self.mode(), e.to_string()),
            },
        }
    }
}

fn unhealthy(mode: &str, detail: String) -> DetectionHealth {
    DetectionHealth {
        mode: mode.into(),
        ready: false,
        models_loaded: None,
        processed: None,
        detail: Some(detail),
    }
}

/// HTTP client for another daemon's `/detect` endpoint.
pub struct RemoteDetector {
    client: reqwest::Client,
    base_url: String,
    health_timeout: Duration,
}

impl RemoteDetector {
    pub fn new(base_url: &str, timeout: Duration, health_timeout: Duration) -> Result<Self, DetectionError> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DetectionError::Unavailable(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            health_timeout,
        })
    }

    pub async fn detect(&self, payload: &str) -> Result<Vec<FaceDescriptor>, DetectionError> {
        let url = format!("{}/detect", self.base_url);
        let body = DetectRequest {
            image_data: Some(payload.to_string()),
        };

        let response = self.client.post(&url).json(&body).send().await.map_err(|e| {
            tracing::warn!(url = %url, error = %e, "remote detection request failed");
            DetectionError::Unavailable(format!("remote detection request failed: {e}"))
        })?;

        let status = response.status();
        let parsed: DetectResponse = response.json().await.map_err(|e| {
            tracing::warn!(url = %url, %status, error = %e, "remote detection returned an unreadable body");
            DetectionError::Unavailable(format!("unreadable response from detection service ({status})"))
        })?;

        if parsed.success {
            tracing::debug!(url = %url, faces = parsed.faces.len(), "remote detection done");
            return Ok(parsed.faces);
        }
        match parsed.error.as_deref() {
            Some("InvalidImage") => Err(DetectionError::InvalidImage(parsed.message)),
            _ => Err(DetectionError::Unavailable(format!(
                "detection service answered {status}: {}",
                parsed.message
            ))),
        }
    }

    pub async fn health(&self) -> Result<(), DetectionError> {
        let url = format!("{}/health", self.base_url);
        let response = self
            .client
            .get(&url)
            .timeout(self.health_timeout)
            .send()
            .await
            .map_err(|e| DetectionError::Unavailable(format!("health check failed: {e}")))?;
        if response.status().is_success() {
            Ok(())
        } else {
            Err(DetectionError::Unavailable(format!(
                "health check answered {}",
                response.status()
            )))
        }
    }
}
