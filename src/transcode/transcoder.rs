//! Audio transcoding backend.
//!
//! Shells out to a local ffmpeg binary, the same way the other external
//! engines in this crate are driven: spawn, wait with a timeout, surface
//! stderr on failure.

use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio::process::Command;
use tokio::time::timeout;

/// Default wall-clock limit for one transcode
pub const DEFAULT_TRANSCODE_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Error)]
pub enum TranscodeError {
    #[error("Failed to spawn transcoder '{binary}': {source}")]
    Spawn {
        binary: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Transcoder timed out after {0:?}")]
    Timeout(Duration),

    #[error("Transcoder failed with exit code {exit_code}: {stderr}")]
    Failed { exit_code: i32, stderr: String },

    #[error("Transcoder produced no output at {0}")]
    MissingOutput(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// The fixed codec/container/bitrate every voice note is normalized to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TranscodeTarget {
    /// Encoder name passed to `-c:a`
    pub codec: String,

    /// Bitrate passed to `-b:a`
    pub bitrate: String,

    /// Container passed to `-f`
    pub container: String,

    /// Content type stored on the converted object
    pub content_type: String,

    /// File extension of the converted object
    pub extension: String,
}

impl TranscodeTarget {
    /// OGG/Opus at 32 kbit/s, the format the messaging channel accepts for voice
    pub fn canonical() -> Self {
        Self {
            codec: "libopus".to_string(),
            bitrate: "32k".to_string(),
            container: "ogg".to_string(),
            content_type: "audio/ogg".to_string(),
            extension: "ogg".to_string(),
        }
    }

    /// Whether an object of `content_type` is already in the target format
    pub fn is_canonical(&self, content_type: &str) -> bool {
        base_content_type(content_type) == self.content_type
    }
}

impl Default for TranscodeTarget {
    fn default() -> Self {
        Self::canonical()
    }
}

/// Strip parameters and normalize case (`Audio/OGG; codecs=opus` → `audio/ogg`)
pub fn base_content_type(content_type: &str) -> String {
    content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase()
}

/// Converts an input file into the target format
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Human-readable backend name
    fn name(&self) -> &str;

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target: &TranscodeTarget,
    ) -> Result<(), TranscodeError>;
}

/// ffmpeg subprocess transcoder
pub struct FfmpegTranscoder {
    /// Path to the ffmpeg binary (default: "ffmpeg")
    binary_path: String,

    /// Per-invocation time limit
    timeout: Duration,
}

impl Default for FfmpegTranscoder {
    fn default() -> Self {
        Self::new()
    }
}

impl FfmpegTranscoder {
    /// Use `FFMPEG_PATH` if set, otherwise `ffmpeg` from PATH
    pub fn new() -> Self {
        let binary_path = std::env::var("FFMPEG_PATH").unwrap_or_else(|_| "ffmpeg".to_string());
        Self {
            binary_path,
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_binary_path(binary_path: impl Into<String>) -> Self {
        Self {
            binary_path: binary_path.into(),
            timeout: DEFAULT_TRANSCODE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn binary_path(&self) -> &str {
        &self.binary_path
    }

    /// Arguments for one conversion
    fn build_args(input: &Path, output: &Path, target: &TranscodeTarget) -> Vec<String> {
        vec![
            "-hide_banner".to_string(),
            "-nostdin".to_string(),
            "-y".to_string(),
            "-i".to_string(),
            input.to_string_lossy().to_string(),
            "-vn".to_string(),
            "-c:a".to_string(),
            target.codec.clone(),
            "-b:a".to_string(),
            target.bitrate.clone(),
            "-f".to_string(),
            target.container.clone(),
            output.to_string_lossy().to_string(),
        ]
    }
}

#[async_trait]
impl Transcoder for FfmpegTranscoder {
    fn name(&self) -> &str {
        "ffmpeg"
    }

    async fn transcode(
        &self,
        input: &Path,
        output: &Path,
        target: &TranscodeTarget,
    ) -> Result<(), TranscodeError> {
        let child = Command::new(&self.binary_path)
            .args(Self::build_args(input, output, target))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| TranscodeError::Spawn {
                binary: self.binary_path.clone(),
                source,
            })?;

        let output_result = timeout(self.timeout, child.wait_with_output())
            .await
            .map_err(|_| TranscodeError::Timeout(self.timeout))??;

        if !output_result.status.success() {
            let stderr = String::from_utf8_lossy(&output_result.stderr);
            return Err(TranscodeError::Failed {
                exit_code: output_result.status.code().unwrap_or(-1),
                stderr: stderr.trim().to_string(),
            });
        }

        match tokio::fs::metadata(output).await {
            Ok(m) if m.len() > 0 => Ok(()),
            _ => Err(TranscodeError::MissingOutput(output.display().to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_canonical_target() {
        let target = TranscodeTarget::canonical();
        assert_eq!(target.codec, "libopus");
        assert_eq!(target.bitrate, "32k");
        assert_eq!(target.container, "ogg");
        assert!(target.is_canonical("audio/ogg"));
        assert!(target.is_canonical("Audio/OGG; codecs=opus"));
        assert!(!target.is_canonical("audio/webm"));
    }

    #[test]
    fn test_ffmpeg_args() {
        let args = FfmpegTranscoder::build_args(
            &PathBuf::from("/tmp/in.webm"),
            &PathBuf::from("/tmp/out.ogg"),
            &TranscodeTarget::canonical(),
        );

        let joined = args.join(" ");
        assert!(joined.contains("-i /tmp/in.webm"));
        assert!(joined.contains("-c:a libopus"));
        assert!(joined.contains("-b:a 32k"));
        assert!(joined.contains("-f ogg"));
        assert_eq!(args.last().unwrap(), "/tmp/out.ogg");
    }

    #[test]
    fn test_custom_binary_path() {
        let transcoder = FfmpegTranscoder::with_binary_path("/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(transcoder.binary_path(), "/opt/ffmpeg/bin/ffmpeg");
        assert_eq!(transcoder.name(), "ffmpeg");
    }

    #[tokio::test]
    async fn test_missing_binary_is_spawn_error() {
        let temp = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::with_binary_path("/nonexistent/voxrelay-ffmpeg");

        let result = transcoder
            .transcode(
                &temp.path().join("in.webm"),
                &temp.path().join("out.ogg"),
                &TranscodeTarget::canonical(),
            )
            .await;

        assert!(matches!(result, Err(TranscodeError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_nonzero_exit_is_failure() {
        let temp = tempfile::tempdir().unwrap();
        let transcoder = FfmpegTranscoder::with_binary_path("false");

        let result = transcoder
            .transcode(
                &temp.path().join("in.webm"),
                &temp.path().join("out.ogg"),
                &TranscodeTarget::canonical(),
            )
            .await;

        assert!(matches!(result, Err(TranscodeError::Failed { .. })));
    }
}
