use std::{path::PathBuf, process::Stdio, time::Duration};

use common::{error::AppError, utils::source_url::ensure_supported_source_url};
use tempfile::TempDir;
use tokio::{process::Command, time::timeout};
use tracing::{info, warn};

/// How the downloader is invoked. Derived from `AppConfig` by the pipeline
/// services.
#[derive(Debug, Clone)]
pub struct MediaSettings {
    pub ytdlp_path: String,
    pub media_dir: PathBuf,
    pub download_timeout: Duration,
}

/// A locally acquired audio file. The backing temp directory is removed on
/// [`cleanup`](Self::cleanup), or on drop as a safety net for error paths.
#[derive(Debug)]
pub struct DownloadedMedia {
    pub file_path: String,
    pub duration_seconds: i64,
    workdir: Option<TempDir>,
}

impl DownloadedMedia {
    /// A media handle without a backing temp directory. Used by tests and
    /// mock services.
    pub fn detached(file_path: impl Into<String>, duration_seconds: i64) -> Self {
        Self {
            file_path: file_path.into(),
            duration_seconds,
            workdir: None,
        }
    }

    /// Best-effort removal of the temp directory. Failure is logged, never
    /// escalated: temp files are not central to job correctness.
    pub fn cleanup(&mut self) {
        if let Some(dir) = self.workdir.take() {
            let path = dir.path().display().to_string();
            if let Err(err) = dir.close() {
                warn!(%path, error = %err, "failed to remove temporary media directory");
            }
        }
    }
}

/// Downloads the source audio for a supported platform URL into a fresh
/// temp directory and reports its duration.
///
/// The URL is validated against the platform allow-list before anything is
/// executed; non-allow-listed input is a validation error, not a download
/// attempt.
pub async fn download_audio(
    settings: &MediaSettings,
    source_url: &str,
) -> Result<DownloadedMedia, AppError> {
    let url = ensure_supported_source_url(source_url)?;

    tokio::fs::create_dir_all(&settings.media_dir).await?;
    let workdir = tempfile::Builder::new()
        .prefix("transcribe-")
        .tempdir_in(&settings.media_dir)?;
    let output_template = workdir.path().join("audio.%(ext)s");
    let audio_path = workdir.path().join("audio.mp3");

    let mut command = Command::new(&settings.ytdlp_path);
    command
        .arg("--no-playlist")
        .arg("--no-progress")
        .arg("--extract-audio")
        .arg("--audio-format")
        .arg("mp3")
        .arg("--print-json")
        .arg("--output")
        .arg(&output_template)
        .arg(url.as_str())
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let output = timeout(settings.download_timeout, command.output())
        .await
        .map_err(|_| {
            AppError::Download(format!(
                "media download timed out after {}s",
                settings.download_timeout.as_secs()
            ))
        })?
        .map_err(|err| AppError::Download(format!("failed to run media downloader: {err}")))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        let reason = stderr
            .lines()
            .rev()
            .find(|line| !line.trim().is_empty())
            .unwrap_or("downloader exited with an error")
            .to_string();
        return Err(AppError::Download(format!("media download failed: {reason}")));
    }

    let metadata: serde_json::Value = serde_json::from_slice(&output.stdout)
        .map_err(|err| AppError::Download(format!("unreadable media metadata: {err}")))?;
    let duration_seconds = metadata
        .get("duration")
        .and_then(serde_json::Value::as_f64)
        .map(|secs| secs.ceil() as i64)
        .filter(|secs| *secs > 0)
        .ok_or_else(|| AppError::Download("source yielded no playable media".to_string()))?;

    if !tokio::fs::try_exists(&audio_path).await.unwrap_or(false) {
        return Err(AppError::Download(
            "downloader produced no audio file".to_string(),
        ));
    }

    info!(%url, duration_seconds, "acquired source audio");

    Ok(DownloadedMedia {
        file_path: audio_path.display().to_string(),
        duration_seconds,
        workdir: Some(workdir),
    })
}
