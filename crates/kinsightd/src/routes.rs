use crate::api::{
    DetectRequest, DetectResponse, FaceResult, HealthResponse, IdentifyRequest, IdentifyResponse, IdentitiesResponse,
    IdentitySummary,
};
use crate::service::{IdentifyError, IdentifyParams, IdentifyService};
use axum::extract::rejection::JsonRejection;
use axum::extract::{DefaultBodyLimit, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use kinsight_core::Registration;
use serde_json::{json, Value};

pub const SERVICE_NAME: &str = "face-recognition";

pub fn router(service: IdentifyService, max_body_bytes: usize) -> Router {
    Router::new()
        .route("/", get(handler_root))
        .route("/health", get(handler_health))
        .route("/identify", post(handler_identify))
        .route("/detect", post(handler_detect))
        .route("/identities", get(handler_identities))
        .layer(DefaultBodyLimit::max(max_body_bytes))
        .with_state(service)
}

impl IdentifyError {
    fn status(&self) -> StatusCode {
        match self {
            Self::NoFaceDetected => StatusCode::OK,
            Self::InvalidImage(_) | Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::DetectionServiceUnavailable(_) | Self::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    fn log(&self) {
        if self.is_retryable() {
            tracing::warn!(kind = self.kind(), error = %self, "request failed");
        } else {
            tracing::info!(kind = self.kind(), error = %self, "request rejected");
        }
    }
}

impl IntoResponse for IdentifyError {
    fn into_response(self) -> Response {
        self.log();
        let body = IdentifyResponse::failure(self.kind(), self.message());
        (self.status(), Json(body)).into_response()
    }
}

fn malformed_body(rejection: JsonRejection) -> IdentifyError {
    IdentifyError::Validation(format!("Malformed request body: {}", rejection.body_text()))
}

async fn handler_root() -> Json<Value> {
    Json(json!({
        "message": "Face Recognition Service is running",
        "status": "healthy",
    }))
}

async fn handler_health(State(service): State<IdentifyService>) -> Response {
    let (detection, store) = tokio::join!(service.detection_health(), service.store_health());
    let healthy = detection.ready && store.ready;
    let body = HealthResponse {
        status: if healthy { "healthy" } else { "degraded" }.into(),
        service: SERVICE_NAME.into(),
        version: env!("CARGO_PKG_VERSION").into(),
        detection,
        store,
    };
    let status = if healthy {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };
    (status, Json(body)).into_response()
}

async fn handler_identify(
    State(service): State<IdentifyService>,
    payload: Result<Json<IdentifyRequest>, JsonRejection>,
) -> Result<Json<IdentifyResponse>, IdentifyError> {
    let Json(req) = payload.map_err(malformed_body)?;
    let resolve_all_faces = req.resolve_all_faces;
    let params = IdentifyParams {
        image_data: req.image_data,
        registration: Registration {
            name: req.person_name,
            relationship: req.person_relationship,
            color: req.person_color,
        },
        resolve_all_faces,
    };

    let result = service.identify(params).await?;
    let mut body = match result.below_gate {
        Some(gate) => IdentifyResponse::below_gate(&result.primary, result.faces_detected, gate),
        None => IdentifyResponse::resolved(&result.primary, result.faces_detected),
    };
    if resolve_all_faces {
        let mut faces = vec![FaceResult::new(&result.primary_face, &result.primary)];
        faces.extend(result.others.iter().map(|(face, res)| FaceResult::new(face, res)));
        body.faces = Some(faces);
    }
    Ok(Json(body))
}

async fn handler_detect(
    State(service): State<IdentifyService>,
    payload: Result<Json<DetectRequest>, JsonRejection>,
) -> Response {
    let result = match payload {
        Ok(Json(req)) => service.detect(req.image_data.as_deref()).await,
        Err(rejection) => Err(malformed_body(rejection)),
    };

    match result {
        Ok(faces) => {
            let message = format!("Detected {} face(s)", faces.len());
            let body = DetectResponse {
                success: true,
                faces,
                message,
                error: None,
            };
            (StatusCode::OK, Json(body)).into_response()
        }
        Err(e) => {
            e.log();
            let body = DetectResponse {
                success: false,
                faces: Vec::new(),
                message: e.message(),
                error: Some(e.kind().into()),
            };
            (e.status(), Json(body)).into_response()
        }
    }
}

async fn handler_identities(State(service): State<IdentifyService>) -> Result<Json<IdentitiesResponse>, IdentifyError> {
    let identities: Vec<IdentitySummary> = service
        .list_identities()
        .await?
        .into_iter()
        .map(IdentitySummary::from)
        .collect();
    Ok(Json(IdentitiesResponse {
        success: true,
        count: identities.len(),
        identities,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::MSG_UNRECOGNIZED;
    use crate::detection::{DetectionBackend, RemoteDetector};
    use crate::engine::spawn_engine;
    use crate::service::MSG_NO_FACE;
    use crate::testing::{descriptor, descriptor_from, spike, DownStore, ScriptedAdapter};
    use axum::body::Body;
    use axum::http::Request;
    use kinsight_core::{encode_payload, IdentityStore, MemoryStore, Resolver, ResolverConfig};
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    const BODY_LIMIT: usize = 1024 * 1024;

    fn scripted() -> ScriptedAdapter {
        let mut ana_later = spike(0);
        ana_later[3] = 0.2;
        ScriptedAdapter::new()
            .with_faces(b"face:ana", vec![descriptor(0, 0.97)])
            .with_faces(b"face:ana-later", vec![descriptor_from(ana_later, 0.92)])
            .with_faces(b"face:stranger", vec![descriptor(42, 0.81)])
            .with_faces(b"face:blurry", vec![descriptor(5, 0.3)])
            .with_faces(b"face:pair", vec![descriptor(0, 0.9), descriptor(42, 0.85)])
    }

    fn service(store: Arc<dyn IdentityStore>, backend: DetectionBackend) -> IdentifyService {
        IdentifyService::new(
            backend,
            store,
            "memory",
            Resolver::new(ResolverConfig::default()),
            0.6,
            Duration::from_secs(5),
        )
    }

    fn local_backend() -> DetectionBackend {
        let engine = spawn_engine(Box::new(scripted())).unwrap();
        DetectionBackend::local(engine, Duration::from_secs(5))
    }

    fn app(store: Arc<dyn IdentityStore>) -> Router {
        router(service(store, local_backend()), BODY_LIMIT)
    }

    async fn call(app: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
        let builder = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => builder
                .header("content-type", "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    fn image(bytes: &[u8]) -> String {
        format!("data:image/jpeg;base64,{}", encode_payload(bytes))
    }

    #[tokio::test]
    async fn test_root_and_health() {
        let app = app(Arc::new(MemoryStore::new()));

        let (status, body) = call(&app, "GET", "/", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");

        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["service"], SERVICE_NAME);
        assert_eq!(body["detection"]["mode"], "local");
        assert_eq!(body["store"]["identities"], 0);
    }

    #[tokio::test]
    async fn test_health_degraded_when_store_down() {
        let app = app(Arc::new(DownStore));
        let (status, body) = call(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "degraded");
        assert_eq!(body["store"]["ready"], false);
    }

    #[tokio::test]
    async fn test_register_then_recognize_over_http() {
        let app = app(Arc::new(MemoryStore::new()));

        let (status, body) = call(
            &app,
            "POST",
            "/identify",
            Some(json!({
                "image_data": image(b"face:ana"),
                "person_name": "Ana",
                "person_relationship": "Daughter",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["is_new_person"], true);
        assert_eq!(body["confidence"], 1.0);
        assert_eq!(body["faces_detected"], 1);
        let id = body["identity_id"].as_str().unwrap().to_string();

        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"face:ana-later") }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["person"], "Ana");
        assert_eq!(body["relationship"], "Daughter");
        assert_eq!(body["is_new_person"], false);
        assert_eq!(body["identity_id"], id.as_str());
        assert!(body["match_similarity"].as_f64().unwrap() >= 0.7);

        let (status, body) = call(&app, "GET", "/identities", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["count"], 1);
        assert_eq!(body["identities"][0]["name"], "Ana");
        assert!(body["identities"][0].get("descriptor").is_none());
    }

    #[tokio::test]
    async fn test_unrecognized_face() {
        let app = app(Arc::new(MemoryStore::new()));
        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"face:stranger") }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["person"], "Unknown");
        assert_eq!(body["message"], MSG_UNRECOGNIZED);
        assert!((body["confidence"].as_f64().unwrap() - 0.81).abs() < 1e-5);
    }

    #[tokio::test]
    async fn test_no_face_and_low_confidence() {
        let app = app(Arc::new(MemoryStore::new()));

        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"empty room") }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "NoFaceDetected");
        assert_eq!(body["message"], MSG_NO_FACE);

        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"face:blurry") }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], false);
        assert_eq!(body["person"], "Unknown");
        assert!(body.get("error").is_none());
        assert!((body["confidence"].as_f64().unwrap() - 0.3).abs() < 1e-5);
        assert_ne!(body["message"], MSG_NO_FACE);
        assert_ne!(body["message"], MSG_UNRECOGNIZED);
    }

    #[tokio::test]
    async fn test_validation_failures() {
        let app = app(Arc::new(MemoryStore::new()));

        let (status, body) = call(&app, "POST", "/identify", Some(json!({}))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");
        assert_eq!(body["message"], "image_data is required");

        let (status, body) = call(
            &app,
            "POST",
            "/identify",
            Some(json!({ "image_data": image(b"face:stranger"), "person_name": "Zed" })),
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "ValidationError");

        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": "***" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidImage");
    }

    #[tokio::test]
    async fn test_malformed_json_keeps_response_shape() {
        let app = app(Arc::new(MemoryStore::new()));
        let request = Request::builder()
            .method("POST")
            .uri("/identify")
            .header("content-type", "application/json")
            .body(Body::from("{not json"))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "ValidationError");
    }

    #[tokio::test]
    async fn test_store_down_is_503() {
        let app = app(Arc::new(DownStore));
        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"face:ana") }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "StoreUnavailable");

        let (status, _) = call(&app, "GET", "/identities", None).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_resolve_all_faces_lists_every_face() {
        let store: Arc<dyn IdentityStore> = Arc::new(MemoryStore::new());
        let app = app(store.clone());
        call(
            &app,
            "POST",
            "/identify",
            Some(json!({ "image_data": image(b"face:ana"), "person_name": "Ana", "person_relationship": "Daughter" })),
        )
        .await;

        let (status, body) = call(
            &app,
            "POST",
            "/identify",
            Some(json!({ "image_data": image(b"face:pair"), "resolve_all_faces": true })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["person"], "Ana");
        assert_eq!(body["faces_detected"], 2);
        let faces = body["faces"].as_array().unwrap();
        assert_eq!(faces.len(), 2);
        assert_eq!(faces[0]["recognized"], true);
        assert_eq!(faces[1]["recognized"], false);
        assert_eq!(faces[1]["person"], "Unknown");
        assert_eq!(store.count().unwrap(), 1);
    }

    #[tokio::test]
    async fn test_detect_endpoint() {
        let app = app(Arc::new(MemoryStore::new()));

        let (status, body) = call(&app, "POST", "/detect", Some(json!({ "image_data": image(b"face:pair") }))).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["success"], true);
        assert_eq!(body["faces"].as_array().unwrap().len(), 2);
        assert_eq!(body["faces"][0]["descriptor"]["values"].as_array().unwrap().len(), 512);

        let (status, body) = call(&app, "POST", "/detect", Some(json!({ "image_data": "" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["success"], false);
    }

    #[tokio::test]
    async fn test_remote_backend_against_live_daemon() {
        let detector = app(Arc::new(MemoryStore::new()));
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, detector).await.unwrap();
        });

        let remote = RemoteDetector::new(
            &format!("http://{addr}"),
            Duration::from_secs(5),
            Duration::from_secs(2),
        )
        .unwrap();
        let front = router(service(Arc::new(MemoryStore::new()), DetectionBackend::Remote(remote)), BODY_LIMIT);

        let (status, body) = call(
            &front,
            "POST",
            "/identify",
            Some(json!({ "image_data": image(b"face:ana"), "person_name": "Ana", "person_relationship": "Daughter" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["is_new_person"], true);

        let (status, body) = call(&front, "POST", "/identify", Some(json!({ "image_data": "***" }))).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"], "InvalidImage");

        let (status, body) = call(&front, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["detection"]["mode"], "remote");
        assert_eq!(body["detection"]["ready"], true);
    }

    #[tokio::test]
    async fn test_slow_detection_is_503() {
        let adapter = scripted().with_delay(Duration::from_millis(500));
        let engine = spawn_engine(Box::new(adapter)).unwrap();
        let backend = DetectionBackend::local(engine, Duration::from_millis(50));
        let app = router(service(Arc::new(MemoryStore::new()), backend), BODY_LIMIT);

        let (status, body) = call(&app, "POST", "/identify", Some(json!({ "image_data": image(b"face:ana") }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["success"], false);
        assert_eq!(body["error"], "DetectionServiceUnavailable");
    }

    #[tokio::test]
    async fn test_remote_backend_down_is_503() {
        let remote = RemoteDetector::new("http://127.0.0.1:9", Duration::from_secs(2), Duration::from_secs(1)).unwrap();
        let front = router(service(Arc::new(MemoryStore::new()), DetectionBackend::Remote(remote)), BODY_LIMIT);

        let (status, body) = call(&front, "POST", "/identify", Some(json!({ "image_data": image(b"face:ana") }))).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["error"], "DetectionServiceUnavailable");
    }
}
