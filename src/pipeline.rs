#![forbid(unsafe_code)]

//! Download-and-mux orchestration: resolve formats, run the two transfers
//! concurrently, invoke the muxer, and hand back the output together with a
//! guard that removes every temp file no matter how the request ends.

use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::task::{Context, Poll};
use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::{Stream, StreamExt};
use tokio::io::AsyncWriteExt;
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::extractor::{Extractor, StreamDescriptor, StreamKind};
use crate::mux::Muxer;

static NEXT_REQUEST_SEQ: AtomicU64 = AtomicU64::new(0);

/// Temp files created on behalf of one request. Dropping the set removes
/// every tracked file synchronously, so cleanup happens on success, on every
/// error return, and when the client walks away mid-stream.
#[derive(Debug, Default)]
pub struct TempFiles {
    paths: Vec<PathBuf>,
}

impl TempFiles {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn track(&mut self, path: PathBuf) {
        self.paths.push(path);
    }
}

impl Drop for TempFiles {
    fn drop(&mut self) {
        for path in &self.paths {
            if let Err(err) = std::fs::remove_file(path)
                && err.kind() != std::io::ErrorKind::NotFound
            {
                warn!(path = %path.display(), %err, "failed to remove temp file");
            }
        }
    }
}

/// Result of a successful pipeline run. The output path stays valid for as
/// long as `temps` is alive; move the guard into the response body so the
/// file survives until delivery finishes.
#[derive(Debug)]
pub struct MuxedDownload {
    pub output: PathBuf,
    pub temps: TempFiles,
}

/// Stream adapter that keeps arbitrary guards (temp files, semaphore
/// permits) alive until the wrapped stream is dropped.
pub struct GuardedStream<S, G> {
    inner: S,
    _guard: G,
}

impl<S, G> GuardedStream<S, G> {
    pub fn new(inner: S, guard: G) -> Self {
        Self {
            inner,
            _guard: guard,
        }
    }
}

impl<S, G> Stream for GuardedStream<S, G>
where
    S: Stream + Unpin,
    G: Unpin,
{
    type Item = S::Item;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.get_mut().inner).poll_next(cx)
    }
}

/// Picks the video descriptor whose quality label equals the requested one
/// exactly. Combined formats count as video-bearing, mirroring what the
/// resolution list shows the user.
pub fn select_video_format<'a>(
    formats: &'a [StreamDescriptor],
    resolution: &str,
) -> Result<&'a StreamDescriptor, PipelineError> {
    formats
        .iter()
        .filter(|format| format.has_video())
        .find(|format| format.quality_label.as_deref() == Some(resolution))
        .ok_or_else(|| PipelineError::FormatNotFound {
            kind: "video",
            wanted: resolution.to_string(),
        })
}

/// First audio-bearing descriptor with any non-empty quality indicator.
/// First-match on purpose; the tradeoff is recorded in DESIGN.md.
pub fn select_audio_format(
    formats: &[StreamDescriptor],
) -> Result<&StreamDescriptor, PipelineError> {
    formats
        .iter()
        .filter(|format| format.has_audio())
        .find(|format| {
            format
                .audio_quality
                .as_deref()
                .is_some_and(|quality| !quality.is_empty())
        })
        .ok_or_else(|| PipelineError::FormatNotFound {
            kind: "audio",
            wanted: "any".to_string(),
        })
}

/// Audio-only descriptor at the fixed target tier, used by `/audio`.
pub fn select_audio_only_format<'a>(
    formats: &'a [StreamDescriptor],
    tier: &str,
) -> Result<&'a StreamDescriptor, PipelineError> {
    formats
        .iter()
        .filter(|format| format.kind == StreamKind::Audio)
        .find(|format| format.audio_quality.as_deref() == Some(tier))
        .ok_or_else(|| PipelineError::FormatNotFound {
            kind: "audio",
            wanted: tier.to_string(),
        })
}

/// Per-request file stem: wall-clock nanoseconds plus a process-wide
/// counter. The counter closes the collision window between two requests
/// landing in the same clock tick.
fn unique_stem() -> String {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let seq = NEXT_REQUEST_SEQ.fetch_add(1, Ordering::Relaxed);
    format!("{nanos}-{seq}")
}

async fn copy_stream_to_file(
    extractor: &dyn Extractor,
    descriptor: &StreamDescriptor,
    target: &Path,
    label: &'static str,
) -> Result<(), PipelineError> {
    let wrap = |source| PipelineError::Transfer { label, source };

    let mut stream = extractor.open_stream(descriptor).await.map_err(wrap)?;
    let mut file = tokio::fs::File::create(target).await.map_err(wrap)?;

    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(wrap)?;
        file.write_all(&chunk).await.map_err(wrap)?;
    }
    file.flush().await.map_err(wrap)?;

    Ok(())
}

/// Runs the whole download pipeline for one request: resolve, transfer both
/// tracks concurrently, mux. Both transfers always reach a terminal state
/// before either result is inspected.
pub async fn download_and_mux(
    extractor: &dyn Extractor,
    muxer: &Muxer,
    temp_dir: &Path,
    url: &str,
    resolution: &str,
) -> Result<MuxedDownload, PipelineError> {
    let info = extractor.probe(url).await?;
    let video_format = select_video_format(&info.formats, resolution)?;
    let audio_format = select_audio_format(&info.formats)?;

    // Intermediate files keep their source container so ffmpeg probes them
    // correctly; the muxed output is always mp4.
    let stem = unique_stem();
    let video_path = temp_dir.join(format!("{stem}_video.{}", video_format.container));
    let audio_path = temp_dir.join(format!("{stem}_audio.{}", audio_format.container));
    let output_path = temp_dir.join(format!("{stem}.mp4"));

    let mut temps = TempFiles::new();
    temps.track(video_path.clone());
    temps.track(audio_path.clone());

    info!(%url, %resolution, "starting transfers");
    let (video_result, audio_result) = tokio::join!(
        copy_stream_to_file(extractor, video_format, &video_path, "video"),
        copy_stream_to_file(extractor, audio_format, &audio_path, "audio"),
    );
    video_result?;
    audio_result?;

    temps.track(output_path.clone());
    muxer.combine(&video_path, &audio_path, &output_path).await?;
    info!(%url, output = %output_path.display(), "mux complete");

    Ok(MuxedDownload {
        output: output_path,
        temps,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::extractor::{ByteStream, SourceInfo, VideoSummary};
    use async_trait::async_trait;
    use std::collections::{HashMap, HashSet};
    use std::io;
    use std::sync::Mutex;

    fn descriptor(kind: StreamKind, label: Option<&str>, audio: Option<&str>, url: &str) -> StreamDescriptor {
        StreamDescriptor {
            kind,
            quality_label: label.map(str::to_owned),
            audio_quality: audio.map(str::to_owned),
            container: "mp4".into(),
            url: url.into(),
        }
    }

    struct FakeExtractor {
        formats: Vec<StreamDescriptor>,
        payloads: HashMap<String, Vec<u8>>,
        failing_urls: HashSet<String>,
        opened: Mutex<Vec<String>>,
    }

    impl FakeExtractor {
        fn new(formats: Vec<StreamDescriptor>) -> Self {
            Self {
                formats,
                payloads: HashMap::new(),
                failing_urls: HashSet::new(),
                opened: Mutex::new(Vec::new()),
            }
        }

        fn with_payload(mut self, url: &str, bytes: &[u8]) -> Self {
            self.payloads.insert(url.to_string(), bytes.to_vec());
            self
        }

        fn with_failing_url(mut self, url: &str) -> Self {
            self.failing_urls.insert(url.to_string());
            self
        }

        fn opened_urls(&self) -> Vec<String> {
            self.opened.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl Extractor for FakeExtractor {
        async fn probe(&self, _url: &str) -> Result<SourceInfo, PipelineError> {
            Ok(SourceInfo {
                summary: VideoSummary {
                    title: "t".into(),
                    thumbnail: String::new(),
                    duration: 0,
                },
                formats: self.formats.clone(),
            })
        }

        async fn open_stream(&self, descriptor: &StreamDescriptor) -> io::Result<ByteStream> {
            self.opened.lock().unwrap().push(descriptor.url.clone());
            if self.failing_urls.contains(&descriptor.url) {
                return Err(io::Error::other("remote closed the connection"));
            }
            let payload = self
                .payloads
                .get(&descriptor.url)
                .cloned()
                .unwrap_or_default();
            let chunks: Vec<io::Result<bytes::Bytes>> = payload
                .chunks(3)
                .map(|chunk| Ok(bytes::Bytes::copy_from_slice(chunk)))
                .collect();
            Ok(Box::pin(futures_util::stream::iter(chunks)))
        }
    }

    fn standard_formats() -> Vec<StreamDescriptor> {
        vec![
            descriptor(StreamKind::Video, Some("360p"), None, "v360"),
            descriptor(StreamKind::Video, Some("720p"), None, "v720"),
            descriptor(StreamKind::Video, Some("1080p"), None, "v1080"),
            descriptor(StreamKind::Audio, None, Some("low"), "alow"),
            descriptor(StreamKind::Audio, None, Some("medium"), "amed"),
        ]
    }

    #[cfg(unix)]
    fn stub_muxer(dir: &Path, script_body: &str) -> Muxer {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("ffmpeg-stub");
        std::fs::write(
            &script_path,
            format!("#!/usr/bin/env bash\n{script_body}\n"),
        )
        .unwrap();
        let mut perms = std::fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        std::fs::set_permissions(&script_path, perms).unwrap();
        Muxer::with_binary(script_path)
    }

    #[test]
    fn video_selection_is_exact_match() {
        let formats = standard_formats();
        assert_eq!(select_video_format(&formats, "720p").unwrap().url, "v720");

        let err = select_video_format(&formats, "4K").unwrap_err();
        assert!(matches!(
            err,
            PipelineError::FormatNotFound { kind: "video", .. }
        ));
    }

    #[test]
    fn audio_selection_takes_first_with_quality() {
        let formats = standard_formats();
        assert_eq!(select_audio_format(&formats).unwrap().url, "alow");

        let video_only = vec![descriptor(StreamKind::Video, Some("720p"), None, "v")];
        assert!(select_audio_format(&video_only).is_err());
    }

    #[test]
    fn audio_only_selection_requires_the_tier() {
        let formats = standard_formats();
        assert_eq!(
            select_audio_only_format(&formats, "medium").unwrap().url,
            "amed"
        );
        assert!(select_audio_only_format(&formats, "high").is_err());

        // A combined format at the right tier must not satisfy audio-only.
        let combined = vec![descriptor(
            StreamKind::Combined,
            Some("360p"),
            Some("medium"),
            "c",
        )];
        assert!(select_audio_only_format(&combined, "medium").is_err());
    }

    #[test]
    fn stems_are_unique_across_rapid_calls() {
        let stems: HashSet<String> = (0..256).map(|_| unique_stem()).collect();
        assert_eq!(stems.len(), 256);
    }

    #[test]
    fn temp_files_removes_tracked_paths_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let kept = dir.path().join("kept.mp4");
        let removed = dir.path().join("removed.mp4");
        std::fs::write(&kept, b"k").unwrap();
        std::fs::write(&removed, b"r").unwrap();

        let mut temps = TempFiles::new();
        temps.track(removed.clone());
        // Tracking a path that was never created must not panic on drop.
        temps.track(dir.path().join("never-created.mp4"));
        drop(temps);

        assert!(kept.exists());
        assert!(!removed.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn pipeline_muxes_and_reports_output() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(standard_formats())
            .with_payload("v720", b"VIDEOBYTES")
            .with_payload("alow", b"AUDIOBYTES");
        let muxer = stub_muxer(
            dir.path(),
            r#"for last in "$@"; do :; done; cat "$2" "$4" > "$last""#,
        );

        let result = download_and_mux(&extractor, &muxer, dir.path(), "https://x", "720p")
            .await
            .unwrap();

        let muxed = std::fs::read(&result.output).unwrap();
        assert_eq!(muxed, b"VIDEOBYTESAUDIOBYTES");

        // All three temp files disappear with the guard.
        drop(result);
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1); // stub only
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn temp_paths_take_extensions_from_the_chosen_containers() {
        let dir = tempfile::tempdir().unwrap();
        let mut video = descriptor(StreamKind::Video, Some("720p"), None, "v720");
        video.container = "webm".into();
        let mut audio = descriptor(StreamKind::Audio, None, Some("low"), "alow");
        audio.container = "m4a".into();
        let extractor = FakeExtractor::new(vec![video, audio])
            .with_payload("v720", b"V")
            .with_payload("alow", b"A");
        let muxer = stub_muxer(
            dir.path(),
            r#"for last in "$@"; do :; done; printf '%s\n%s\n' "$2" "$4" > "$last""#,
        );

        let result = download_and_mux(&extractor, &muxer, dir.path(), "https://x", "720p")
            .await
            .unwrap();

        let recorded = std::fs::read_to_string(&result.output).unwrap();
        let mut inputs = recorded.lines();
        assert!(inputs.next().unwrap().ends_with("_video.webm"));
        assert!(inputs.next().unwrap().ends_with("_audio.m4a"));
        assert!(result.output.extension().is_some_and(|ext| ext == "mp4"));
    }

    #[tokio::test]
    async fn unknown_resolution_fails_before_any_transfer() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(standard_formats());
        let muxer = Muxer::with_binary(dir.path().join("unused"));

        let err = download_and_mux(&extractor, &muxer, dir.path(), "https://x", "4K")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::FormatNotFound { .. }));
        assert!(extractor.opened_urls().is_empty());
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn failed_transfer_still_drives_the_other_to_completion() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(standard_formats())
            .with_payload("v720", b"VIDEOBYTES")
            .with_failing_url("alow");
        let muxer = Muxer::with_binary(dir.path().join("unused"));

        let err = download_and_mux(&extractor, &muxer, dir.path(), "https://x", "720p")
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            PipelineError::Transfer { label: "audio", .. }
        ));
        // Join semantics: the video side was opened too, not short-circuited.
        let opened = extractor.opened_urls();
        assert!(opened.contains(&"v720".to_string()));
        assert!(opened.contains(&"alow".to_string()));
        // No temp files survive the failure.
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn muxer_failure_cleans_up_both_transfers() {
        let dir = tempfile::tempdir().unwrap();
        let extractor = FakeExtractor::new(standard_formats())
            .with_payload("v720", b"VIDEOBYTES")
            .with_payload("alow", b"AUDIOBYTES");
        let muxer = stub_muxer(dir.path(), "exit 1");

        let err = download_and_mux(&extractor, &muxer, dir.path(), "https://x", "720p")
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MuxExit { .. }));
        assert_eq!(std::fs::read_dir(dir.path()).unwrap().count(), 1); // stub only
    }

    #[tokio::test]
    async fn guarded_stream_forwards_items_and_drops_guard() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("payload.bin");
        std::fs::write(&file, b"abc").unwrap();

        let mut temps = TempFiles::new();
        temps.track(file.clone());

        let items: Vec<io::Result<bytes::Bytes>> = vec![Ok(bytes::Bytes::from_static(b"abc"))];
        let mut stream = GuardedStream::new(futures_util::stream::iter(items), temps);

        assert_eq!(stream.next().await.unwrap().unwrap().as_ref(), b"abc");
        assert!(stream.next().await.is_none());
        assert!(file.exists());

        drop(stream);
        assert!(!file.exists());
    }
}
