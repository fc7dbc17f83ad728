#![forbid(unsafe_code)]

//! HTTP backend for tubefetch.
//!
//! Four JSON endpoints drive the whole flow: two metadata lookups, the
//! download-and-mux pipeline, and a direct audio relay. Everything else the
//! router serves is the static browser page.

use std::{
    net::{IpAddr, SocketAddr},
    path::{Component, Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context as _, Result, anyhow};
use axum::{
    Json, Router,
    body::Body,
    extract::{FromRequest, Request, State, rejection::JsonRejection},
    http::{HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::post,
};
use mime_guess::MimeGuess;
use serde::Deserialize;
use tokio::{fs::File, signal, sync::Semaphore};
use tokio_util::io::ReaderStream;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;
use tubefetch::config::{ServerOverrides, resolve_server_options};
use tubefetch::error::PipelineError;
use tubefetch::extractor::{AUDIO_TARGET_TIER, Extractor, YtDlpExtractor};
use tubefetch::mux::Muxer;
use tubefetch::pipeline::{GuardedStream, download_and_mux, select_audio_only_format};
use tubefetch::security::ensure_not_root;

const VIDEO_ATTACHMENT: &str = "attachment; filename=\"video.mp4\"";
const AUDIO_ATTACHMENT: &str = "attachment; filename=\"audio.mp3\"";

#[derive(Debug, Clone, Default)]
struct BackendArgs {
    host: Option<String>,
    port: Option<u16>,
    static_root: Option<PathBuf>,
    temp_dir: Option<PathBuf>,
    max_downloads: Option<usize>,
    ytdlp: Option<PathBuf>,
    ffmpeg: Option<PathBuf>,
}

impl BackendArgs {
    fn parse() -> Result<Self> {
        Self::from_iter(std::env::args().skip(1))
    }

    fn from_iter<I>(iter: I) -> Result<Self>
    where
        I: IntoIterator<Item = String>,
    {
        let mut parsed = Self::default();
        let mut args = iter.into_iter();
        while let Some(arg) = args.next() {
            let (name, value) = match arg.split_once('=') {
                Some((name, value)) => (name.to_string(), value.to_string()),
                None => {
                    let value = args
                        .next()
                        .ok_or_else(|| anyhow!("{arg} requires a value"))?;
                    (arg, value)
                }
            };

            match name.as_str() {
                "--host" => parsed.host = Some(value),
                "--port" => parsed.port = Some(parse_port_arg(&value)?),
                "--static-root" => parsed.static_root = Some(PathBuf::from(value)),
                "--temp-dir" => parsed.temp_dir = Some(PathBuf::from(value)),
                "--max-downloads" => {
                    parsed.max_downloads = Some(
                        value
                            .parse::<usize>()
                            .context("expected a positive download limit")?,
                    )
                }
                "--ytdlp" => parsed.ytdlp = Some(PathBuf::from(value)),
                "--ffmpeg" => parsed.ffmpeg = Some(PathBuf::from(value)),
                _ => return Err(anyhow!("unknown argument: {name}")),
            }
        }
        Ok(parsed)
    }

    fn into_overrides(self) -> ServerOverrides {
        ServerOverrides {
            host: self.host,
            port: self.port,
            static_root: self.static_root,
            temp_dir: self.temp_dir,
            max_concurrent_downloads: self.max_downloads,
            ytdlp_bin: self.ytdlp,
            ffmpeg_bin: self.ffmpeg,
            env_path: None,
        }
    }
}

fn parse_port_arg(value: &str) -> Result<u16> {
    value
        .parse::<u16>()
        .context("expected a numeric port between 0 and 65535")
}

fn parse_host_arg(value: &str) -> Result<IpAddr> {
    value
        .parse::<IpAddr>()
        .context("expected a valid IPv4 or IPv6 address for --host/TUBEFETCH_HOST")
}

/// Shared state injected into every handler. Built once at startup; there
/// are no ambient globals.
#[derive(Clone)]
struct AppState {
    extractor: Arc<dyn Extractor>,
    muxer: Arc<Muxer>,
    temp_dir: Arc<PathBuf>,
    static_root: Arc<PathBuf>,
    downloads: Arc<Semaphore>,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: serde_json::Value,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: serde_json::json!({ "error": message.into() }),
        }
    }

    /// `{error, details}` payload used by the metadata and audio routes.
    fn failure(summary: &str, err: &PipelineError) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: serde_json::json!({ "error": summary, "details": err.to_string() }),
        }
    }

    /// `{message, error}` payload used by the download route.
    fn download_failure(err: &PipelineError) -> Self {
        let message = if err.is_mux_failure() {
            "Failed to process video"
        } else if matches!(err, PipelineError::Delivery(_)) {
            "Failed to download video"
        } else {
            "An error occurred"
        };
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: serde_json::json!({ "message": message, "error": err.to_string() }),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}

type ApiResult<T> = Result<T, ApiError>;

#[derive(Deserialize)]
struct UrlRequest {
    url: String,
}

#[derive(Deserialize)]
struct DownloadRequest {
    url: String,
    resolution: String,
}

/// `Json` extractor whose rejection matches the handlers' `400 {error}`
/// shape. The stock extractor answers malformed bodies with plain-text 422s,
/// which the browser page cannot parse.
struct ApiJson<T>(T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    Json<T>: FromRequest<S, Rejection = JsonRejection>,
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let Json(value) = Json::<T>::from_request(req, state)
            .await
            .map_err(|rejection| ApiError::bad_request(rejection.body_text()))?;
        Ok(Self(value))
    }
}

fn require_field<'a>(value: &'a str, name: &str) -> ApiResult<&'a str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Err(ApiError::bad_request(format!(
            "missing required field: {name}"
        )));
    }
    Ok(trimmed)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args = BackendArgs::parse()?;
    ensure_not_root("backend")?;
    let options = resolve_server_options(args.into_overrides())?;
    let host = parse_host_arg(&options.host)?;

    tokio::fs::create_dir_all(&options.temp_dir)
        .await
        .with_context(|| format!("creating temp dir {}", options.temp_dir.display()))?;

    let state = AppState {
        extractor: Arc::new(YtDlpExtractor::with_binary(options.ytdlp_bin)),
        muxer: Arc::new(Muxer::with_binary(options.ffmpeg_bin)),
        temp_dir: Arc::new(options.temp_dir),
        static_root: Arc::new(options.static_root),
        downloads: Arc::new(Semaphore::new(options.max_concurrent_downloads)),
    };

    let app = router(state);

    let addr = SocketAddr::new(host, options.port);
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("binding to {}", addr))?;
    info!(%addr, "backend listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("running backend")?;

    Ok(())
}

fn router(state: AppState) -> Router {
    Router::new()
        .route("/resolutions", post(list_resolutions))
        .route("/video-info", post(video_info))
        .route("/download", post(download_video))
        .route("/audio", post(download_audio))
        .fallback(static_fallback)
        .with_state(state)
}

async fn shutdown_signal() {
    if let Err(err) = signal::ctrl_c().await {
        error!(%err, "failed to install Ctrl+C handler");
    }
}

async fn list_resolutions(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<UrlRequest>,
) -> ApiResult<Json<Vec<String>>> {
    let url = require_field(&payload.url, "url")?;
    info!(%url, "resolutions requested");

    let info = state
        .extractor
        .probe(url)
        .await
        .map_err(|err| ApiError::failure("Failed to fetch resolutions", &err))?;

    // BTreeSet gives both deduplication and ascending lexicographic order.
    let resolutions: std::collections::BTreeSet<String> = info
        .formats
        .iter()
        .filter(|format| format.has_video())
        .filter_map(|format| format.quality_label.clone())
        .collect();

    Ok(Json(resolutions.into_iter().collect()))
}

async fn video_info(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<UrlRequest>,
) -> ApiResult<Response> {
    let url = require_field(&payload.url, "url")?;
    info!(%url, "video info requested");

    let info = state
        .extractor
        .probe(url)
        .await
        .map_err(|err| ApiError::failure("Failed to fetch video info", &err))?;

    Ok(Json(info.summary).into_response())
}

async fn download_video(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<DownloadRequest>,
) -> ApiResult<Response> {
    let url = require_field(&payload.url, "url")?;
    let resolution = require_field(&payload.resolution, "resolution")?;
    info!(%url, %resolution, "download requested");

    // Explicit concurrency bound across requests; the permit travels with
    // the response body so a slot stays occupied until delivery finishes.
    let permit = state
        .downloads
        .clone()
        .acquire_owned()
        .await
        .map_err(|_| ApiError::internal("server shutting down"))?;

    let result = download_and_mux(
        state.extractor.as_ref(),
        &state.muxer,
        &state.temp_dir,
        url,
        resolution,
    )
    .await
    .map_err(|err| {
        error!(%url, %err, "download pipeline failed");
        ApiError::download_failure(&err)
    })?;

    let file = File::open(&result.output).await.map_err(|err| {
        ApiError::download_failure(&PipelineError::Delivery(err.to_string()))
    })?;

    let stream = GuardedStream::new(ReaderStream::new(file), (result.temps, permit));
    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(VIDEO_ATTACHMENT),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("video/mp4"));
    Ok(response)
}

async fn download_audio(
    State(state): State<AppState>,
    ApiJson(payload): ApiJson<UrlRequest>,
) -> ApiResult<Response> {
    let url = require_field(&payload.url, "url")?;
    info!(%url, "audio download requested");

    let info = state
        .extractor
        .probe(url)
        .await
        .map_err(|err| ApiError::failure("Failed to download audio", &err))?;

    let format = select_audio_only_format(&info.formats, AUDIO_TARGET_TIER)
        .map_err(|err| ApiError::failure("Failed to download audio", &err))?;

    let stream = state.extractor.open_stream(format).await.map_err(|err| {
        ApiError::failure(
            "Failed to download audio",
            &PipelineError::Transfer {
                label: "audio",
                source: err,
            },
        )
    })?;

    let mut response = Body::from_stream(stream).into_response();
    response.headers_mut().insert(
        header::CONTENT_DISPOSITION,
        HeaderValue::from_static(AUDIO_ATTACHMENT),
    );
    response
        .headers_mut()
        .insert(header::CONTENT_TYPE, HeaderValue::from_static("audio/mpeg"));
    Ok(response)
}

async fn static_fallback(State(state): State<AppState>, req: Request<Body>) -> Response {
    match serve_static(&state.static_root, req.uri().path()).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    }
}

async fn serve_static(root: &Path, request_path: &str) -> ApiResult<Response> {
    let target = resolve_static_path(root, request_path)?;
    match tokio::fs::metadata(&target).await {
        Ok(meta) if meta.is_dir() => stream_static_file(root.join("index.html")).await,
        Ok(_) => stream_static_file(target).await,
        Err(_) => Err(ApiError::not_found("file not found")),
    }
}

fn resolve_static_path(root: &Path, request_path: &str) -> ApiResult<PathBuf> {
    let trimmed = request_path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Ok(root.join("index.html"));
    }
    let candidate = Path::new(trimmed);
    if candidate
        .components()
        .any(|component| !matches!(component, Component::Normal(_)))
    {
        return Err(ApiError::not_found("file not found"));
    }
    Ok(root.join(candidate))
}

async fn stream_static_file(path: PathBuf) -> ApiResult<Response> {
    let file = File::open(&path)
        .await
        .map_err(|_| ApiError::not_found("file not found"))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    if let Some(mime) = MimeGuess::from_path(&path).first()
        && let Ok(value) = mime.to_string().parse()
    {
        response.headers_mut().insert(header::CONTENT_TYPE, value);
    }
    Ok(response)
}
