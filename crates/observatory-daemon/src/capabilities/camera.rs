//! Capture device backed by an external command.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;

/// Placeholder in the capture command replaced by the output path.
pub const PATH_PLACEHOLDER: &str = "{path}";

#[derive(Debug, thiserror::Error)]
pub enum CaptureError {
    #[error("no capture command configured")]
    NotConfigured,
    #[error("failed to start capture command: {0}")]
    Spawn(#[from] std::io::Error),
    #[error("capture command exited with {status}: {stderr}")]
    Failed { status: String, stderr: String },
    #[error("capture command reported success but wrote no file at {}", .0.display())]
    Missing(PathBuf),
}

/// Reference to a captured asset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AssetHandle {
    pub path: PathBuf,
}

#[async_trait]
pub trait CaptureDevice: Send + Sync {
    /// Capture one frame into `path`.
    async fn capture(&self, path: &Path) -> Result<AssetHandle, CaptureError>;
}

/// Runs e.g. `libcamera-still -n -o {path}` once per frame.
///
/// The command line is split on whitespace; without a `{path}` argument the
/// path is appended as the last argument.
#[derive(Debug, Clone)]
pub struct CommandCamera {
    argv: Vec<String>,
}

impl CommandCamera {
    pub fn new(command_line: &str) -> Self {
        Self {
            argv: command_line.split_whitespace().map(str::to_string).collect(),
        }
    }

    fn command_for(&self, path: &Path) -> Result<Command, CaptureError> {
        let (program, rest) = self.argv.split_first().ok_or(CaptureError::NotConfigured)?;
        let path = path.to_string_lossy();

        let mut cmd = Command::new(program);
        let mut substituted = false;
        for arg in rest {
            if arg.contains(PATH_PLACEHOLDER) {
                cmd.arg(arg.replace(PATH_PLACEHOLDER, &path));
                substituted = true;
            } else {
                cmd.arg(arg);
            }
        }
        if !substituted {
            cmd.arg(&*path);
        }
        Ok(cmd)
    }
}

#[async_trait]
impl CaptureDevice for CommandCamera {
    async fn capture(&self, path: &Path) -> Result<AssetHandle, CaptureError> {
        let output = self
            .command_for(path)?
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(CaptureError::Failed {
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        if !tokio::fs::try_exists(path).await.unwrap_or(false) {
            return Err(CaptureError::Missing(path.to_path_buf()));
        }

        tracing::debug!(path = %path.display(), "Frame captured");
        Ok(AssetHandle {
            path: path.to_path_buf(),
        })
    }
}

/// Stand-in used when no capture command is configured.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoCamera;

#[async_trait]
impl CaptureDevice for NoCamera {
    async fn capture(&self, _path: &Path) -> Result<AssetHandle, CaptureError> {
        Err(CaptureError::NotConfigured)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(unix)]
    #[tokio::test]
    async fn command_camera_substitutes_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");

        let camera = CommandCamera::new("touch {path}");
        let handle = camera.capture(&path).await.unwrap();

        assert_eq!(handle.path, path);
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_camera_appends_path_without_placeholder() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("frame.jpg");

        CommandCamera::new("touch").capture(&path).await.unwrap();
        assert!(path.exists());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_command_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandCamera::new("false")
            .capture(&dir.path().join("frame.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Failed { .. }));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn command_that_writes_nothing_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let err = CommandCamera::new("true")
            .capture(&dir.path().join("frame.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::Missing(_)));
    }

    #[tokio::test]
    async fn empty_command_is_not_configured() {
        let err = CommandCamera::new("   ")
            .capture(Path::new("frame.jpg"))
            .await
            .unwrap_err();
        assert!(matches!(err, CaptureError::NotConfigured));
    }
}
