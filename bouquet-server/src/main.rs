use std::io::Cursor;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use axum::body::Bytes;
use axum::extract::State;
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use axum::Router;
use bouquet_core::catalog::known_models;
use bouquet_core::lora::AdapterPaths;
use bouquet_core::{
    accelerator_label, load_model, DeviceMap, GenerationRequest, ModelConfig, TextToImage,
};
use clap::Parser;
use serde_json::json;
use tokio::net::TcpListener;
use tracing::{error, info};

// Define command line arguments
#[derive(Parser, Debug)]
#[command(author, version, about = "Bouquet image generation server")]
struct Args {
    /// Use CPU instead of GPU
    #[arg(long)]
    cpu: bool,

    /// Base model to serve
    #[arg(long, default_value = "runwayml/stable-diffusion-v1-5")]
    model: String,

    /// Directory holding a fine-tuned adapter checkpoint
    #[arg(long, default_value = "fine_tuned_model/final")]
    adapter_dir: PathBuf,

    /// Legacy adapter weights file, tried when no adapter directory exists
    #[arg(long, default_value = "fine_tuned_model/lora_weights.safetensors")]
    legacy_weights: PathBuf,

    /// Directory where generated images are saved
    #[arg(long, default_value = "generated_images")]
    output_dir: PathBuf,

    /// Load the model at startup instead of on the first request
    #[arg(long)]
    preload: bool,

    /// Host address to bind the server to
    #[arg(long, default_value = "127.0.0.1")]
    host: String,

    /// Port to bind the server to
    #[arg(long, default_value_t = 8000)]
    port: u16,
}

type Loader = Box<dyn Fn() -> Result<Arc<dyn TextToImage>> + Send + Sync>;

/// Application state: the lazily loaded model and how to load it. The model
/// mutex guards load-once state and is held only briefly; the inference gate
/// serializes generations so `/health` stays responsive while one runs.
struct AppState {
    model: Mutex<Option<Arc<dyn TextToImage>>>,
    inference_gate: Mutex<()>,
    loader: Loader,
    device: DeviceMap,
    output_dir: PathBuf,
}

impl AppState {
    fn from_args(args: &Args) -> Self {
        let device = if args.cpu {
            DeviceMap::ForceCpu
        } else {
            DeviceMap::default()
        };
        let config = ModelConfig {
            model_id: args.model.clone(),
            device,
            adapter: AdapterPaths {
                adapter_dir: args.adapter_dir.clone(),
                legacy_weights: args.legacy_weights.clone(),
            },
        };
        Self {
            model: Mutex::new(None),
            inference_gate: Mutex::new(()),
            loader: Box::new(move || load_model(&config)),
            device,
            output_dir: args.output_dir.clone(),
        }
    }
}

async fn health_handler(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    let model_loaded = state.model.lock().map(|m| m.is_some()).unwrap_or(false);
    Json(json!({
        "status": "ok",
        "model_loaded": model_loaded,
        "device": accelerator_label(state.device),
        "timestamp": chrono::Utc::now().to_rfc3339(),
    }))
}

async fn models_handler() -> Json<serde_json::Value> {
    Json(json!({ "models": known_models() }))
}

async fn generate_handler(State(state): State<Arc<AppState>>, body: Bytes) -> Response {
    let result = tokio::task::spawn_blocking(move || run_generation(&state, &body)).await;
    match result {
        Ok(Ok(png)) => ([(header::CONTENT_TYPE, "image/png")], png).into_response(),
        Ok(Err(e)) => {
            error!(error = format!("{e:#}"), "generation failed");
            failure_response(&e)
        }
        Err(e) => {
            error!(error = %e, "generation task panicked");
            failure_response(&anyhow!("internal error: {e}"))
        }
    }
}

fn failure_response(e: &anyhow::Error) -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": format!("{e:#}"), "status": "failed" })),
    )
        .into_response()
}

/// Parses the request, runs the model and returns the encoded PNG. Also
/// saves a copy under the output directory, mirroring what the endpoint
/// serves. Runs on a blocking thread; the model lock is released before the
/// denoise loop so other endpoints never wait on it, and the inference gate
/// keeps generations one at a time.
fn run_generation(state: &AppState, body: &[u8]) -> Result<Vec<u8>> {
    let request: GenerationRequest =
        serde_json::from_slice(body).context("invalid generation request")?;
    let job = request.to_job();
    info!(
        steps = job.steps,
        guidance = job.guidance,
        width = job.width,
        height = job.height,
        "generation request"
    );

    let model = {
        let mut guard = state
            .model
            .lock()
            .map_err(|_| anyhow!("model lock poisoned"))?;
        if guard.is_none() {
            info!("loading model on first request");
            *guard = Some((state.loader)()?);
        }
        guard
            .as_ref()
            .map(Arc::clone)
            .ok_or_else(|| anyhow!("model missing after load"))?
    };

    let gate = state
        .inference_gate
        .lock()
        .map_err(|_| anyhow!("inference gate poisoned"))?;
    let started = Instant::now();
    let image = model.generate(&job)?;
    info!(elapsed_s = started.elapsed().as_secs_f32(), "generation finished");
    drop(gate);

    let mut png = Vec::new();
    image
        .write_to(&mut Cursor::new(&mut png), image::ImageFormat::Png)
        .context("failed to encode the image as PNG")?;

    std::fs::create_dir_all(&state.output_dir)
        .with_context(|| format!("failed to create {}", state.output_dir.display()))?;
    let filename = format!("bouquet_{}.png", chrono::Local::now().format("%Y%m%d_%H%M%S"));
    let path = state.output_dir.join(filename);
    std::fs::write(&path, &png).with_context(|| format!("failed to save {}", path.display()))?;
    info!(path = %path.display(), "image saved");

    Ok(png)
}

fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/generate", post(generate_handler))
        .route("/models", get(models_handler))
        .with_state(state)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let args = Args::parse();
    let state = Arc::new(AppState::from_args(&args));

    if args.preload {
        let state = Arc::clone(&state);
        tokio::task::spawn_blocking(move || -> Result<()> {
            let mut guard = state
                .model
                .lock()
                .map_err(|_| anyhow!("model lock poisoned"))?;
            *guard = Some((state.loader)()?);
            Ok(())
        })
        .await
        .context("preload task panicked")??;
        info!("model preloaded");
    }

    let app = router(state);
    let bind_address = format!("{}:{}", args.host, args.port);
    let listener = TcpListener::bind(&bind_address)
        .await
        .with_context(|| format!("failed to bind {bind_address}"))?;
    info!("listening on {}", listener.local_addr()?);
    axum::serve(listener, app.into_make_service()).await?;

    Ok(())
}
