#![forbid(unsafe_code)]

//! Thin wrapper around the external ffmpeg process that combines a video
//! track and an audio track into one container file.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use tokio::process::Command;
use tracing::debug;

use crate::error::PipelineError;

pub struct Muxer {
    binary: PathBuf,
}

impl Muxer {
    pub fn new() -> Self {
        Self::with_binary(PathBuf::from(crate::config::DEFAULT_FFMPEG_BIN))
    }

    pub fn with_binary(binary: PathBuf) -> Self {
        Self { binary }
    }

    /// Copies the video stream as-is and transcodes the audio to AAC.
    /// Success is exit status zero; a spawn failure and a non-zero exit are
    /// reported separately so callers can tell a missing binary from a bad
    /// input file.
    pub async fn combine(
        &self,
        video: &Path,
        audio: &Path,
        output: &Path,
    ) -> Result<(), PipelineError> {
        debug!(
            video = %video.display(),
            audio = %audio.display(),
            output = %output.display(),
            "invoking muxer"
        );

        let mut child = Command::new(&self.binary)
            .arg("-i")
            .arg(video)
            .arg("-i")
            .arg(audio)
            .args(["-c:v", "copy", "-c:a", "aac", "-strict", "experimental"])
            .arg(output)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(PipelineError::MuxSpawn)?;

        let status = child.wait().await.map_err(PipelineError::MuxSpawn)?;
        if status.success() {
            Ok(())
        } else {
            Err(PipelineError::MuxExit { status })
        }
    }
}

impl Default for Muxer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::fs;

    fn install_muxer_stub(dir: &Path, script_body: &str) -> PathBuf {
        use std::os::unix::fs::PermissionsExt;

        let script_path = dir.join("ffmpeg");
        fs::write(&script_path, format!("#!/usr/bin/env bash\n{script_body}\n")).unwrap();
        let mut perms = fs::metadata(&script_path).unwrap().permissions();
        perms.set_mode(0o755);
        fs::set_permissions(&script_path, perms).unwrap();
        script_path
    }

    #[tokio::test]
    async fn combine_succeeds_on_zero_exit() {
        let dir = tempfile::tempdir().unwrap();
        // Stub writes its last argument so we can check the output path.
        let stub = install_muxer_stub(
            dir.path(),
            r#"for last in "$@"; do :; done; echo muxed > "$last""#,
        );
        let output = dir.path().join("out.mp4");

        let muxer = Muxer::with_binary(stub);
        muxer
            .combine(&dir.path().join("v.mp4"), &dir.path().join("a.mp4"), &output)
            .await
            .unwrap();

        assert_eq!(fs::read_to_string(&output).unwrap().trim(), "muxed");
    }

    #[tokio::test]
    async fn combine_reports_nonzero_exit() {
        let dir = tempfile::tempdir().unwrap();
        let stub = install_muxer_stub(dir.path(), "exit 3");

        let muxer = Muxer::with_binary(stub);
        let err = muxer
            .combine(
                &dir.path().join("v.mp4"),
                &dir.path().join("a.mp4"),
                &dir.path().join("out.mp4"),
            )
            .await
            .unwrap_err();

        match err {
            PipelineError::MuxExit { status } => assert_eq!(status.code(), Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn combine_reports_spawn_failure() {
        let dir = tempfile::tempdir().unwrap();
        let muxer = Muxer::with_binary(dir.path().join("missing-ffmpeg"));

        let err = muxer
            .combine(
                &dir.path().join("v.mp4"),
                &dir.path().join("a.mp4"),
                &dir.path().join("out.mp4"),
            )
            .await
            .unwrap_err();

        assert!(matches!(err, PipelineError::MuxSpawn(_)));
    }
}
