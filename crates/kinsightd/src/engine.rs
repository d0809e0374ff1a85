use kinsight_core::{DetectError, DetectionAdapter, FaceDescriptor};
use thiserror::Error;
use tokio::sync::{mpsc, oneshot};

#[derive(Error, Debug)]
pub enum EngineError {
    #[error("detection failed: {0}")]
    Detect(#[from] DetectError),
    #[error("failed to spawn engine thread: {0}")]
    Spawn(#[source] std::io::Error),
    #[error("engine thread exited")]
    ChannelClosed,
}

/// Snapshot of the engine for health reporting.
#[derive(Debug, Clone, Copy)]
pub struct EngineStatus {
    pub warm: bool,
    pub processed: u64,
}

/// Messages sent from request handlers to the engine thread.
enum EngineRequest {
    WarmUp {
        reply: oneshot::Sender<Result<(), EngineError>>,
    },
    Detect {
        image: Vec<u8>,
        reply: oneshot::Sender<Result<Vec<FaceDescriptor>, EngineError>>,
    },
    Status {
        reply: oneshot::Sender<EngineStatus>,
    },
}

/// Clone-safe handle to the engine thread.
#[derive(Clone)]
pub struct EngineHandle {
    tx: mpsc::Sender<EngineRequest>,
}

impl EngineHandle {
    /// Load the models if they are not loaded yet. Repeated calls are no-ops.
    pub async fn warm_up(&self) -> Result<(), EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::WarmUp { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    /// Detect every face in an encoded image and describe each one.
    pub async fn detect(&self, image: Vec<u8>) -> Result<Vec<FaceDescriptor>, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Detect {
                image,
                reply: reply_tx,
            })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)?
    }

    pub async fn status(&self) -> Result<EngineStatus, EngineError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.tx
            .send(EngineRequest::Status { reply: reply_tx })
            .await
            .map_err(|_| EngineError::ChannelClosed)?;
        reply_rx.await.map_err(|_| EngineError::ChannelClosed)
    }
}

/// Spawn the engine on a dedicated OS thread.
///
/// The adapter is owned by that thread for its whole life, so model loading
/// and inference are serialized. Models are not touched here; call
/// [`EngineHandle::warm_up`] or let the first detection load them.
pub fn spawn_engine(mut adapter: Box<dyn DetectionAdapter>) -> Result<EngineHandle, EngineError> {
    let (tx, mut rx) = mpsc::channel::<EngineRequest>(16);

    std::thread::Builder::new()
        .name("kinsight-engine".into())
        .spawn(move || {
            tracing::info!("engine thread started");
            let mut processed = 0u64;
            while let Some(req) = rx.blocking_recv() {
                match req {
                    EngineRequest::WarmUp { reply } => {
                        let result = run_warm_up(adapter.as_mut());
                        let _ = reply.send(result);
                    }
                    EngineRequest::Detect { image, reply } => {
                        let result = run_detect(adapter.as_mut(), &image);
                        processed += 1;
                        let _ = reply.send(result);
                    }
                    EngineRequest::Status { reply } => {
                        let _ = reply.send(EngineStatus {
                            warm: adapter.is_warm(),
                            processed,
                        });
                    }
                }
            }
            tracing::info!("engine thread exiting");
        })
        .map_err(EngineError::Spawn)?;

    Ok(EngineHandle { tx })
}

fn run_warm_up(adapter: &mut dyn DetectionAdapter) -> Result<(), EngineError> {
    if adapter.is_warm() {
        tracing::debug!("warm-up requested, models already loaded");
        return Ok(());
    }
    let started = std::time::Instant::now();
    adapter.warm_up()?;
    tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "detection models loaded");
    Ok(())
}

/// Detect faces, strongest first. The adapter loads its models lazily once
/// the input has been validated.
fn run_detect(adapter: &mut dyn DetectionAdapter, image: &[u8]) -> Result<Vec<FaceDescriptor>, EngineError> {
    let was_warm = adapter.is_warm();
    let started = std::time::Instant::now();
    let mut faces = adapter.detect(image)?;
    if !was_warm && adapter.is_warm() {
        tracing::info!(elapsed_ms = started.elapsed().as_millis() as u64, "detection models loaded on first request");
    }
    faces.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    tracing::debug!(
        faces = faces.len(),
        bytes = image.len(),
        elapsed_ms = started.elapsed().as_millis() as u64,
        "detect: done"
    );
    Ok(faces)
}
