use anyhow::{bail, Context, Result};
use kinsight_core::recognizer::ARCFACE_EMBEDDING_DIM;
use kinsight_core::ResolverConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Daemon configuration: optional TOML file, then `KINSIGHT_*` environment overrides.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub server: ServerConfig,
    pub detection: DetectionConfig,
    pub store: StoreConfig,
    pub matching: ResolverConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub log_level: String,
    /// Request body limit; base64 photos are large.
    pub max_body_bytes: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DetectionMode {
    /// Run SCRFD + ArcFace in-process.
    Local,
    /// Forward images to another daemon's `/detect`.
    Remote,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DetectionConfig {
    pub mode: DetectionMode,
    /// Directory containing det_10g.onnx and w600k_r50.onnx.
    pub model_dir: PathBuf,
    /// Base URL of the remote detection service.
    pub remote_url: String,
    pub timeout_secs: u64,
    pub health_timeout_secs: u64,
    /// Faces scoring below this are dropped before resolution.
    pub min_face_confidence: f32,
    pub intra_threads: usize,
    /// Load models at startup instead of on the first request.
    pub eager_warmup: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    Sqlite,
    Memory,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub backend: StoreBackend,
    pub db_path: PathBuf,
    pub timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".into(),
            port: 8001,
            log_level: "info".into(),
            max_body_bytes: 16 * 1024 * 1024,
        }
    }
}

impl Default for DetectionConfig {
    fn default() -> Self {
        Self {
            mode: DetectionMode::Local,
            model_dir: kinsight_core::default_model_dir(),
            remote_url: "http://127.0.0.1:8002".into(),
            timeout_secs: 10,
            health_timeout_secs: 5,
            min_face_confidence: 0.6,
            intra_threads: 2,
            eager_warmup: true,
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::Sqlite,
            db_path: kinsight_core::data_home().join("kinsight").join("identities.db"),
            timeout_secs: 5,
        }
    }
}

impl FromStr for DetectionMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Self::Local),
            "remote" => Ok(Self::Remote),
            other => Err(format!("unknown detection mode {other:?}")),
        }
    }
}

impl FromStr for StoreBackend {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "sqlite" => Ok(Self::Sqlite),
            "memory" => Ok(Self::Memory),
            other => Err(format!("unknown store backend {other:?}")),
        }
    }
}

impl DetectionConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs)
    }
}

impl StoreConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// `$KINSIGHT_CONFIG`, else `$XDG_CONFIG_HOME/kinsight/config.toml`.
pub fn default_config_path() -> PathBuf {
    if let Ok(path) = std::env::var("KINSIGHT_CONFIG") {
        return PathBuf::from(path);
    }
    std::env::var("XDG_CONFIG_HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|_| {
            let home = std::env::var("HOME").unwrap_or_else(|_| "/tmp".to_string());
            PathBuf::from(home).join(".config")
        })
        .join("kinsight")
        .join("config.toml")
}

impl Config {
    pub fn load() -> Result<Self> {
        Self::load_from(default_config_path())
    }

    /// Load from a specific path (missing file means defaults), apply env
    /// overrides, then validate.
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let mut config = if path.exists() {
            let contents = std::fs::read_to_string(path)
                .with_context(|| format!("failed to read config file {}", path.display()))?;
            toml::from_str(&contents).context("failed to parse config TOML")?
        } else {
            Config::default()
        };
        config.apply_overrides(|key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Apply `KINSIGHT_*` overrides read through `lookup`.
    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(v) = lookup("KINSIGHT_HOST") {
            self.server.host = v;
        }
        if let Some(v) = parse_override(&lookup, "KINSIGHT_PORT") {
            self.server.port = v;
        }
        if let Some(v) = lookup("KINSIGHT_LOG_LEVEL") {
            self.server.log_level = v;
        }
        if let Some(v) = lookup("KINSIGHT_MODEL_DIR") {
            self.detection.model_dir = PathBuf::from(v);
        }
        if let Some(v) = parse_override(&lookup, "KINSIGHT_DETECTION_MODE") {
            self.detection.mode = v;
        }
        if let Some(v) = lookup("KINSIGHT_DETECTION_URL") {
            self.detection.remote_url = v;
        }
        if let Some(v) = parse_override(&lookup, "KINSIGHT_MIN_FACE_CONFIDENCE") {
            self.detection.min_face_confidence = v;
        }
        if let Some(v) = parse_override(&lookup, "KINSIGHT_STORE_BACKEND") {
            self.store.backend = v;
        }
        if let Some(v) = lookup("KINSIGHT_DB_PATH") {
            self.store.db_path = PathBuf::from(v);
        }
        if let Some(v) = parse_override(&lookup, "KINSIGHT_SIMILARITY_THRESHOLD") {
            self.matching.similarity_threshold = v;
        }
    }

    /// Reject settings the matcher and the stores cannot agree on.
    pub fn validate(&self) -> Result<()> {
        let threshold = self.matching.similarity_threshold;
        if !threshold.is_finite() || !(-1.0..=1.0).contains(&threshold) {
            bail!("matching.similarity_threshold must be within [-1, 1], got {threshold}");
        }
        let gate = self.detection.min_face_confidence;
        if !(0.0..=1.0).contains(&gate) {
            bail!("detection.min_face_confidence must be within [0, 1], got {gate}");
        }
        let dim = self.matching.descriptor_dim;
        if dim == 0 {
            bail!("matching.descriptor_dim must be greater than 0");
        }
        if self.detection.mode == DetectionMode::Local && dim != ARCFACE_EMBEDDING_DIM {
            bail!("matching.descriptor_dim must be {ARCFACE_EMBEDDING_DIM} with local detection, got {dim}");
        }
        Ok(())
    }

    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }
}

/// Parse an override, ignoring (with a warning) values that do not parse.
fn parse_override<T: FromStr>(lookup: &impl Fn(&str) -> Option<String>, key: &str) -> Option<T> {
    let raw = lookup(key)?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(key, value = %raw, "ignoring unparsable environment override");
            None
        }
    }
}
