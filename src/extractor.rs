#![forbid(unsafe_code)]

//! Seam between the backend and the external extraction collaborator.
//!
//! The production implementation shells out to `yt-dlp --dump-single-json`
//! for metadata and fetches stream bytes over HTTP. Handlers only ever see
//! the [`Extractor`] trait, which keeps the collaborator swappable in tests.

use std::io;
use std::path::PathBuf;
use std::pin::Pin;
use std::process::Stdio;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::{Stream, TryStreamExt};
use serde::Deserialize;
use tokio::process::Command;

use crate::error::PipelineError;

/// Audio tier the `/audio` endpoint insists on. Matches the quality note
/// yt-dlp attaches to its mid-bitrate audio-only formats.
pub const AUDIO_TARGET_TIER: &str = "medium";

/// One-directional stream of bytes from the remote source.
pub type ByteStream = Pin<Box<dyn Stream<Item = io::Result<Bytes>> + Send + 'static>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Video,
    Audio,
    Combined,
}

/// One retrievable media track for a given source URL. `url` is the opaque
/// handle [`Extractor::open_stream`] uses to open the byte stream.
#[derive(Debug, Clone)]
pub struct StreamDescriptor {
    pub kind: StreamKind,
    pub quality_label: Option<String>,
    pub audio_quality: Option<String>,
    pub container: String,
    pub url: String,
}

impl StreamDescriptor {
    pub fn has_video(&self) -> bool {
        matches!(self.kind, StreamKind::Video | StreamKind::Combined)
    }

    pub fn has_audio(&self) -> bool {
        matches!(self.kind, StreamKind::Audio | StreamKind::Combined)
    }
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct VideoSummary {
    pub title: String,
    pub thumbnail: String,
    pub duration: u64,
}

/// Everything one metadata lookup yields: the summary shown in the UI plus
/// the full descriptor table.
#[derive(Debug, Clone)]
pub struct SourceInfo {
    pub summary: VideoSummary,
    pub formats: Vec<StreamDescriptor>,
}

#[async_trait]
pub trait Extractor: Send + Sync {
    /// Resolves a source URL into its summary metadata and descriptor list.
    async fn probe(&self, url: &str) -> Result<SourceInfo, PipelineError>;

    /// Opens the remote byte stream behind a descriptor.
    async fn open_stream(&self, descriptor: &StreamDescriptor) -> io::Result<ByteStream>;
}

/// Production extractor backed by the `yt-dlp` binary and a shared HTTP
/// client for the actual byte transfers.
pub struct YtDlpExtractor {
    binary: PathBuf,
    http: reqwest::Client,
}

impl YtDlpExtractor {
    pub fn new() -> Self {
        Self::with_binary(PathBuf::from(crate::config::DEFAULT_YTDLP_BIN))
    }

    /// Points the extractor at an explicit binary, used by tests and by
    /// installs that keep yt-dlp outside PATH.
    pub fn with_binary(binary: PathBuf) -> Self {
        Self {
            binary,
            http: reqwest::Client::new(),
        }
    }
}

impl Default for YtDlpExtractor {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Extractor for YtDlpExtractor {
    async fn probe(&self, url: &str) -> Result<SourceInfo, PipelineError> {
        let output = Command::new(&self.binary)
            .arg("--dump-single-json")
            .arg("--skip-download")
            .arg("--no-warnings")
            .arg("--no-progress")
            .arg(url)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|err| {
                PipelineError::MetadataFetch(format!(
                    "failed to run {}: {err}",
                    self.binary.display()
                ))
            })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(PipelineError::MetadataFetch(format!(
                "extractor exited with {} for {url}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let info: RawInfo = serde_json::from_slice(&output.stdout)
            .map_err(|err| PipelineError::MetadataFetch(format!("unreadable metadata: {err}")))?;

        Ok(source_info_from_raw(info))
    }

    async fn open_stream(&self, descriptor: &StreamDescriptor) -> io::Result<ByteStream> {
        let response = self
            .http
            .get(&descriptor.url)
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(io::Error::other)?;

        Ok(Box::pin(response.bytes_stream().map_err(io::Error::other)))
    }
}

// Subset of the yt-dlp JSON dump we actually consume. Unknown fields are
// ignored by serde, which keeps this resilient across yt-dlp releases.
#[derive(Debug, Deserialize)]
struct RawInfo {
    title: Option<String>,
    thumbnail: Option<String>,
    #[serde(default)]
    thumbnails: Vec<RawThumbnail>,
    duration: Option<f64>,
    #[serde(default)]
    formats: Vec<RawFormat>,
}

#[derive(Debug, Deserialize)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawFormat {
    format_note: Option<String>,
    height: Option<i64>,
    ext: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    url: Option<String>,
    dynamic_range: Option<String>,
}

fn source_info_from_raw(info: RawInfo) -> SourceInfo {
    let thumbnail = info
        .thumbnail
        .or_else(|| {
            info.thumbnails
                .into_iter()
                .find_map(|thumbnail| thumbnail.url)
        })
        .unwrap_or_default();

    let summary = VideoSummary {
        title: info.title.unwrap_or_default(),
        thumbnail,
        duration: info.duration.map(|d| d.round() as u64).unwrap_or(0),
    };

    let formats = info
        .formats
        .into_iter()
        .filter_map(descriptor_from_format)
        .collect();

    SourceInfo { summary, formats }
}

fn descriptor_from_format(format: RawFormat) -> Option<StreamDescriptor> {
    // Formats without a direct URL (or with neither track, such as
    // storyboards) cannot be fetched and are dropped here.
    let url = format.url?;
    let has_video = codec_present(format.vcodec.as_deref());
    let has_audio = codec_present(format.acodec.as_deref());

    let kind = match (has_video, has_audio) {
        (true, true) => StreamKind::Combined,
        (true, false) => StreamKind::Video,
        (false, true) => StreamKind::Audio,
        (false, false) => return None,
    };

    let note = format
        .format_note
        .as_deref()
        .map(str::trim)
        .filter(|note| !note.is_empty())
        .map(str::to_owned);

    let quality_label = if has_video {
        note.clone()
            .or_else(|| quality_label_from_height(format.height, format.dynamic_range.as_deref()))
    } else {
        None
    };
    let audio_quality = if has_audio { note } else { None };

    Some(StreamDescriptor {
        kind,
        quality_label,
        audio_quality,
        container: format.ext.unwrap_or_else(|| "mp4".to_string()),
        url,
    })
}

fn codec_present(codec: Option<&str>) -> bool {
    codec.is_some_and(|codec| !codec.is_empty() && !codec.eq_ignore_ascii_case("none"))
}

fn quality_label_from_height(height: Option<i64>, dynamic_range: Option<&str>) -> Option<String> {
    let height = height?;
    let hdr = dynamic_range
        .map(|range| range.to_ascii_uppercase().starts_with("HDR"))
        .unwrap_or(false);
    if hdr {
        Some(format!("{height}p HDR"))
    } else {
        Some(format!("{height}p"))
    }
}
