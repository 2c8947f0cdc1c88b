use std::{
    ffi::OsStr,
    io::ErrorKind,
    path::{Path, PathBuf},
    process::{Output, Stdio},
    time::Duration,
};

use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::{process::Command, time::Instant, time::timeout};
use tracing::{debug, info};

const STATUS_REFRESH_AFTER: Duration = Duration::from_secs(60);
const VERSION_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("{0} no esta instalado en el sistema")]
    NotFound(String),
    #[error("no se pudo ejecutar {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("{program} excedio el tiempo limite de {} segundos", .limit.as_secs())]
    Timeout { program: String, limit: Duration },
    #[error("{0}")]
    Failed(String),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolStatus {
    pub yt_dlp: Option<String>,
    pub ffmpeg: bool,
}

impl ToolStatus {
    pub fn yt_dlp_available(&self) -> bool {
        self.yt_dlp.is_some()
    }
}

pub struct ToolProbe {
    yt_dlp_path: PathBuf,
    ffmpeg_path: Option<PathBuf>,
    last_status: Mutex<Option<(Instant, ToolStatus)>>,
}

impl ToolProbe {
    pub fn new(yt_dlp_path: PathBuf, ffmpeg_path: Option<PathBuf>) -> Self {
        Self {
            yt_dlp_path,
            ffmpeg_path,
            last_status: Mutex::new(None),
        }
    }

    pub fn yt_dlp_path(&self) -> &Path {
        &self.yt_dlp_path
    }

    pub async fn status(&self) -> ToolStatus {
        {
            let last_status = self.last_status.lock();
            if let Some((checked_at, status)) = last_status.as_ref()
                && checked_at.elapsed() < STATUS_REFRESH_AFTER
            {
                return status.clone();
            }
        }

        let status = self.detect().await;
        *self.last_status.lock() = Some((Instant::now(), status.clone()));
        status
    }

    pub async fn detect(&self) -> ToolStatus {
        let yt_dlp = match run_tool(&self.yt_dlp_path, ["--version"], VERSION_TIMEOUT).await {
            Ok(output) => Some(
                String::from_utf8_lossy(&output.stdout)
                    .lines()
                    .map(str::trim)
                    .find(|line| !line.is_empty())
                    .unwrap_or("desconocida")
                    .to_string(),
            ),
            Err(error) => {
                debug!("yt-dlp no disponible: {error}");
                None
            }
        };

        let ffmpeg = match &self.ffmpeg_path {
            Some(path) => tokio::fs::metadata(path)
                .await
                .is_ok_and(|metadata| metadata.is_file()),
            None => run_tool(Path::new("ffmpeg"), ["-version"], VERSION_TIMEOUT)
                .await
                .is_ok(),
        };

        let status = ToolStatus { yt_dlp, ffmpeg };
        info!(
            "Herramientas detectadas: yt-dlp={:?} ffmpeg={}",
            status.yt_dlp, status.ffmpeg
        );
        status
    }
}

pub async fn run_tool<I, S>(program: &Path, args: I, limit: Duration) -> Result<Output, ToolError>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let name = program.display().to_string();
    let command_future = Command::new(program)
        .args(args)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output();

    let output = timeout(limit, command_future)
        .await
        .map_err(|_| ToolError::Timeout {
            program: name.clone(),
            limit,
        })?
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                ToolError::NotFound(name.clone())
            } else {
                ToolError::Spawn {
                    program: name.clone(),
                    source: error,
                }
            }
        })?;

    if !output.status.success() {
        return Err(ToolError::Failed(run_error_message(&output.stderr)));
    }

    Ok(output)
}

pub fn run_error_message(stderr: &[u8]) -> String {
    let message = String::from_utf8_lossy(stderr)
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .next_back()
        .unwrap_or("yt-dlp no pudo completar la operacion")
        .to_string();
    let lower = message.to_ascii_lowercase();

    if lower.contains("unsupported url") {
        "URL no soportada o invalida para descarga.".to_string()
    } else if lower.contains("video unavailable") || lower.contains("private video") {
        "El video no esta disponible.".to_string()
    } else if lower.contains("sign in to confirm") {
        "YouTube pidio verificacion anti-bot para este video.".to_string()
    } else {
        message
    }
}
