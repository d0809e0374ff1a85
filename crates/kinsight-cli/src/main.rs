use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use kinsight_core::{encode_payload, DetectionAdapter, ModelPaths, OnnxAdapter};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Parser)]
#[command(name = "kinsight", about = "Kinsight face identification CLI")]
struct Cli {
    /// Base URL of the kinsightd daemon
    #[arg(long, global = true, env = "KINSIGHT_URL", default_value = "http://127.0.0.1:8001")]
    url: String,

    /// Request timeout in seconds
    #[arg(long, global = true, default_value_t = 30)]
    timeout: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the person in a photo, registering them if name and relationship are given
    Identify {
        /// Image file (JPEG, PNG, ...)
        image: PathBuf,
        /// Name to register if the face is unknown
        #[arg(short, long)]
        name: Option<String>,
        /// Relationship to register if the face is unknown (e.g., "daughter")
        #[arg(short, long)]
        relationship: Option<String>,
        /// UI color for a new person; random when omitted
        #[arg(short, long)]
        color: Option<String>,
        /// Also report every other face in the photo
        #[arg(long)]
        all: bool,
    },
    /// Detect faces without touching the identity store
    Detect {
        image: PathBuf,
        /// Print full descriptors instead of a summary
        #[arg(long)]
        raw: bool,
    },
    /// List known identities
    List,
    /// Show daemon health
    Status,
    /// Run detection locally against the ONNX models (bypasses the daemon)
    Check {
        image: PathBuf,
        /// Directory containing det_10g.onnx and w600k_r50.onnx
        #[arg(long)]
        model_dir: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let client = Client::new(&cli.url, Duration::from_secs(cli.timeout))?;

    match cli.command {
        Commands::Identify {
            image,
            name,
            relationship,
            color,
            all,
        } => {
            let mut body = json!({
                "image_data": load_image(&image)?,
                "resolve_all_faces": all,
            });
            for (key, value) in [
                ("person_name", name),
                ("person_relationship", relationship),
                ("person_color", color),
            ] {
                if let Some(v) = value {
                    body[key] = Value::String(v);
                }
            }
            let response = client.post("/identify", &body).await?;
            print_json(&response)?;
        }
        Commands::Detect { image, raw } => {
            let body = json!({ "image_data": load_image(&image)? });
            let response = client.post("/detect", &body).await?;
            if raw {
                print_json(&response)?;
            } else {
                print_json(&summarize_faces(&response))?;
            }
        }
        Commands::List => {
            let response = client.get("/identities").await?;
            print_json(&response)?;
        }
        Commands::Status => match client.get("/health").await {
            Ok(response) => print_json(&response)?,
            Err(e) => {
                println!("kinsightd: not reachable at {} ({e:#})", cli.url);
                std::process::exit(1);
            }
        },
        Commands::Check { image, model_dir } => {
            let dir = model_dir.unwrap_or_else(kinsight_core::default_model_dir);
            let bytes = std::fs::read(&image).with_context(|| format!("failed to read {}", image.display()))?;
            let report = tokio::task::spawn_blocking(move || run_local_check(&dir, &bytes)).await??;
            print_json(&report)?;
        }
    }

    Ok(())
}

/// Thin JSON client for the daemon. Error bodies are returned, not raised,
/// so the caller sees the daemon's message; only 5xx without a body fails.
struct Client {
    http: reqwest::Client,
    base_url: String,
}

impl Client {
    fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn get(&self, path: &str) -> Result<Value> {
        let response = self
            .http
            .get(format!("{}{path}", self.base_url))
            .send()
            .await
            .with_context(|| format!("GET {path} failed"))?;
        read_json(response).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        let response = self
            .http
            .post(format!("{}{path}", self.base_url))
            .json(body)
            .send()
            .await
            .with_context(|| format!("POST {path} failed"))?;
        read_json(response).await
    }
}

async fn read_json(response: reqwest::Response) -> Result<Value> {
    let status = response.status();
    let text = response.text().await.context("failed to read response body")?;
    match serde_json::from_str::<Value>(&text) {
        Ok(value) => {
            tracing::debug!(%status, "daemon answered");
            Ok(value)
        }
        Err(_) if !status.is_success() => bail!("daemon answered {status}: {text}"),
        Err(e) => Err(e).context("daemon returned invalid JSON"),
    }
}

fn load_image(path: &Path) -> Result<String> {
    let bytes = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    if bytes.is_empty() {
        bail!("{} is empty", path.display());
    }
    Ok(encode_payload(&bytes))
}

/// Replace each 512-float descriptor with its length so the output stays readable.
fn summarize_faces(response: &Value) -> Value {
    let mut summary = response.clone();
    if let Some(faces) = summary.get_mut("faces").and_then(Value::as_array_mut) {
        for face in faces {
            let dim = face
                .pointer("/descriptor/values")
                .and_then(Value::as_array)
                .map_or(0, Vec::len);
            if let Some(obj) = face.as_object_mut() {
                obj.remove("descriptor");
                obj.insert("descriptor_dim".into(), json!(dim));
            }
        }
    }
    summary
}

fn run_local_check(model_dir: &Path, image: &[u8]) -> Result<Value> {
    let paths = ModelPaths::in_dir(model_dir);
    println!("scrfd:   {}", paths.scrfd.display());
    println!("arcface: {}", paths.arcface.display());

    let mut adapter = OnnxAdapter::new(paths, 1);
    let started = std::time::Instant::now();
    adapter.warm_up().context("failed to load models")?;
    let load_ms = started.elapsed().as_millis() as u64;

    let started = std::time::Instant::now();
    let faces = adapter.detect(image)?;
    let detect_ms = started.elapsed().as_millis() as u64;

    let response = json!({ "success": true, "faces": faces });
    let mut report = summarize_faces(&response);
    report["load_ms"] = json!(load_ms);
    report["detect_ms"] = json!(detect_ms);
    Ok(report)
}

fn print_json(value: &Value) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_summarize_faces_drops_descriptors() {
        let response = json!({
            "success": true,
            "faces": [
                { "descriptor": { "values": [0.1, 0.2, 0.3], "model_version": null }, "confidence": 0.9 },
                { "descriptor": { "values": [], "model_version": null }, "confidence": 0.7 },
            ],
        });
        let summary = summarize_faces(&response);
        assert!(summary["faces"][0].get("descriptor").is_none());
        assert_eq!(summary["faces"][0]["descriptor_dim"], 3);
        assert_eq!(summary["faces"][1]["descriptor_dim"], 0);
        assert_eq!(summary["faces"][1]["confidence"], 0.7);
    }

    #[test]
    fn test_summarize_without_faces_is_identity() {
        let response = json!({ "success": false, "error": "InvalidImage" });
        assert_eq!(summarize_faces(&response), response);
    }

    #[test]
    fn test_load_image_encodes_base64() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\x89PNG").unwrap();
        assert_eq!(load_image(file.path()).unwrap(), "iVBORw==");
    }

    #[test]
    fn test_load_image_rejects_empty_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        assert!(load_image(file.path()).is_err());
    }

    #[test]
    fn test_cli_parses_identify() {
        let cli = Cli::try_parse_from([
            "kinsight",
            "--url",
            "http://host:9000",
            "identify",
            "photo.jpg",
            "--name",
            "Ana",
            "--relationship",
            "daughter",
            "--all",
        ])
        .unwrap();
        assert_eq!(cli.url, "http://host:9000");
        match cli.command {
            Commands::Identify { name, relationship, color, all, .. } => {
                assert_eq!(name.as_deref(), Some("Ana"));
                assert_eq!(relationship.as_deref(), Some("daughter"));
                assert!(color.is_none());
                assert!(all);
            }
            _ => panic!("expected identify"),
        }
    }
}
