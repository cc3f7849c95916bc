use std::process::Stdio;

use tokio::{io::AsyncWriteExt, process::Command};
use tracing::debug;

use crate::error::TranscodeError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetCodec {
    Mp3,
    Jpeg,
}

impl TargetCodec {
    pub fn mime_type(self) -> &'static str {
        match self {
            TargetCodec::Mp3 => "audio/mpeg",
            TargetCodec::Jpeg => "image/jpeg",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            TargetCodec::Mp3 => "mp3",
            TargetCodec::Jpeg => "jpg",
        }
    }

    fn ffmpeg_args(self) -> &'static [&'static str] {
        match self {
            TargetCodec::Mp3 => &[
                "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-vn", "-acodec",
                "libmp3lame", "-b:a", "128k", "-f", "mp3", "pipe:1",
            ],
            // ffmpeg applies EXIF orientation on decode, so the re-encoded frame
            // comes out upright.
            TargetCodec::Jpeg => &[
                "-hide_banner", "-loglevel", "error", "-i", "pipe:0", "-frames:v", "1",
                "-q:v", "3", "-f", "image2", "-vcodec", "mjpeg", "pipe:1",
            ],
        }
    }
}

/// Runs media conversions in an external ffmpeg process so the async
/// runtime never does codec work on its own threads.
#[derive(Debug, Clone)]
pub struct Transcoder {
    binary: String,
}

impl Transcoder {
    pub fn new(binary: impl Into<String>) -> Self {
        Transcoder {
            binary: binary.into(),
        }
    }

    pub async fn convert(&self, input: &[u8], target: TargetCodec) -> Result<Vec<u8>, TranscodeError> {
        let mut child = Command::new(&self.binary)
            .args(target.ffmpeg_args())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()?;

        let mut stdin = child.stdin.take().ok_or_else(|| {
            TranscodeError::Spawn(std::io::Error::other("transcoder stdin unavailable"))
        })?;
        let payload = input.to_vec();
        let writer = tokio::spawn(async move {
            let result = stdin.write_all(&payload).await;
            drop(stdin);
            result
        });

        let output = child.wait_with_output().await?;
        // A broken pipe here only means ffmpeg stopped reading early; the exit
        // status below is authoritative.
        let _ = writer.await;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(TranscodeError::Failed {
                code: output.status.code(),
                stderr: stderr.chars().take(500).collect(),
            });
        }
        debug!(
            target_codec = ?target,
            input_bytes = input.len(),
            output_bytes = output.stdout.len(),
            "media transcoded"
        );
        Ok(output.stdout)
    }
}
