//! Camera capture
//!
//! Photos are taken by an external capture program (ffmpeg on Linux,
//! imagesnap on macOS by default). Each capture is written to the upload
//! directory and read back so the caller gets both the bytes and the path.

use std::path::{Path, PathBuf};

use async_trait::async_trait;

use crate::{Error, Result};

/// Placeholder in the argument template replaced by the output file path
pub const OUTPUT_PLACEHOLDER: &str = "{output}";

/// A freshly captured photo
#[derive(Debug, Clone)]
pub struct CaptureResult {
    /// Encoded image (JPEG)
    pub image: Vec<u8>,
    /// Where the image was stored on disk
    pub path: PathBuf,
}

/// Source of photos
#[async_trait]
pub trait CameraCapture: Send + Sync {
    /// Take one photo
    ///
    /// # Errors
    ///
    /// Returns `Error::DeviceUnavailable` if no camera can be used
    async fn capture(&self) -> Result<CaptureResult>;
}

/// Camera backed by an external capture command
#[derive(Debug, Clone)]
pub struct CommandCamera {
    program: String,
    args: Vec<String>,
    upload_dir: PathBuf,
}

impl CommandCamera {
    /// Create a camera running `program` with `args`
    ///
    /// `args` should contain [`OUTPUT_PLACEHOLDER`] where the output path goes.
    #[must_use]
    pub fn new(program: impl Into<String>, args: Vec<String>, upload_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            upload_dir: upload_dir.into(),
        }
    }

    /// Default capture program and arguments for this platform
    #[must_use]
    pub fn platform_default() -> (String, Vec<String>) {
        if cfg!(target_os = "macos") {
            (
                "imagesnap".to_string(),
                vec!["-w".into(), "1".into(), OUTPUT_PLACEHOLDER.into()],
            )
        } else {
            (
                "ffmpeg".to_string(),
                [
                    "-hide_banner",
                    "-loglevel",
                    "error",
                    "-f",
                    "v4l2",
                    "-i",
                    "/dev/video0",
                    "-frames:v",
                    "1",
                    "-y",
                    OUTPUT_PLACEHOLDER,
                ]
                .iter()
                .map(ToString::to_string)
                .collect(),
            )
        }
    }

    #[must_use]
    pub fn upload_dir(&self) -> &Path {
        &self.upload_dir
    }

    fn output_path(&self) -> PathBuf {
        let timestamp = chrono::Utc::now().timestamp_millis();
        self.upload_dir.join(format!("capture_{timestamp}.jpg"))
    }

    fn render_args(&self, output: &Path) -> Vec<String> {
        let output = output.to_string_lossy();
        self.args
            .iter()
            .map(|a| a.replace(OUTPUT_PLACEHOLDER, &output))
            .collect()
    }
}

#[async_trait]
impl CameraCapture for CommandCamera {
    async fn capture(&self) -> Result<CaptureResult> {
        let program = which::which(&self.program).map_err(|e| {
            Error::DeviceUnavailable(format!("camera program '{}' not found: {e}", self.program))
        })?;

        tokio::fs::create_dir_all(&self.upload_dir).await?;
        let path = self.output_path();
        let args = self.render_args(&path);

        tracing::debug!(program = %program.display(), ?args, "capturing photo");

        let output = tokio::process::Command::new(&program)
            .args(&args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| Error::DeviceUnavailable(format!("failed to run camera program: {e}")))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(Error::DeviceUnavailable(format!(
                "camera program exited with {}: {}",
                output.status,
                stderr.trim()
            )));
        }

        let image = tokio::fs::read(&path).await.map_err(|e| {
            Error::DeviceUnavailable(format!("no image written to {}: {e}", path.display()))
        })?;
        if image.is_empty() {
            return Err(Error::Camera(format!("empty image at {}", path.display())));
        }

        tracing::info!(path = %path.display(), bytes = image.len(), "photo captured");
        Ok(CaptureResult { image, path })
    }
}
