use std::{
    io::ErrorKind,
    path::{Path, PathBuf},
    process::Stdio,
    time::Duration,
};

use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    time::timeout,
};
use tracing::{debug, warn};

use super::Quality;
use crate::tools::run_error_message;

const USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const REFERER: &str = "https://www.youtube.com/";
const ACCEPT_LANGUAGE_HEADER: &str = "Accept-Language:en-US,en;q=0.9";
const MAX_STDERR_LINES: usize = 20;

#[derive(Debug, Error)]
pub enum AttemptError {
    #[error("{0} no esta instalado en el sistema")]
    ToolMissing(String),
    #[error("no se pudo ejecutar {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },
    #[error("error leyendo la salida de yt-dlp: {0}")]
    Io(#[from] std::io::Error),
    #[error("yt-dlp excedio el tiempo limite de {} segundos", .0.as_secs())]
    Timeout(Duration),
    #[error("yt-dlp termino con codigo {code:?}: {message}")]
    ExitStatus { code: Option<i32>, message: String },
    #[error("yt-dlp no informo el archivo de destino")]
    NoDestination,
    #[error("el archivo descargado no existe dentro de la carpeta temporal: {0}")]
    MissingOutput(String),
    #[error("yt-dlp produjo un formato inesperado: {0}")]
    UnexpectedFormat(String),
    #[error("no se pudo preparar la carpeta temporal: {0}")]
    Staging(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutputEvent {
    Progress(f32),
    Destination(String),
}

#[derive(Debug, Clone)]
pub struct ToolSettings {
    pub program: PathBuf,
    pub ffmpeg_location: Option<PathBuf>,
    pub timeout: Duration,
    pub socket_timeout_secs: u64,
    pub retries: u32,
}

pub fn build_args(
    settings: &ToolSettings,
    url: &str,
    quality: Quality,
    job_dir: &Path,
    stem: &str,
) -> Vec<String> {
    let mut args = vec![
        url.to_string(),
        "--no-playlist".to_string(),
        "--newline".to_string(),
        "--no-warnings".to_string(),
        "--user-agent".to_string(),
        USER_AGENT.to_string(),
        "--referer".to_string(),
        REFERER.to_string(),
        "--add-header".to_string(),
        ACCEPT_LANGUAGE_HEADER.to_string(),
        "--socket-timeout".to_string(),
        settings.socket_timeout_secs.to_string(),
        "--retries".to_string(),
        settings.retries.to_string(),
        "--fragment-retries".to_string(),
        settings.retries.to_string(),
    ];

    if let Some(ffmpeg) = &settings.ffmpeg_location {
        args.push("--ffmpeg-location".to_string());
        args.push(ffmpeg.to_string_lossy().into_owned());
    }

    args.push("--output".to_string());
    args.push(format!("{}/{stem}.%(ext)s", job_dir.to_string_lossy()));

    match quality {
        Quality::AudioKbps(kbps) => {
            args.push("--extract-audio".to_string());
            args.push("--audio-format".to_string());
            args.push("mp3".to_string());
            args.push("--audio-quality".to_string());
            args.push(format!("{kbps}K"));
        }
        Quality::VideoHeight(height) => {
            args.push("--format".to_string());
            args.push(format!("best[height<={height}][ext=mp4]"));
        }
    }

    args
}

pub fn parse_output_line(line: &str) -> Option<OutputEvent> {
    let line = line.trim();
    let rest = line.strip_prefix('[')?;
    let (stage, message) = rest.split_once(']')?;
    let message = message.trim();

    if let Some(path) = message.strip_prefix("Destination:") {
        let path = path.trim();
        return (!path.is_empty()).then(|| OutputEvent::Destination(path.to_string()));
    }

    if stage == "Merger"
        && let Some(path) = message.strip_prefix("Merging formats into")
    {
        let path = path.trim().trim_matches('"');
        return (!path.is_empty()).then(|| OutputEvent::Destination(path.to_string()));
    }

    if stage == "download" {
        if let Some(path) = message.strip_suffix("has already been downloaded") {
            let path = path.trim();
            return (!path.is_empty()).then(|| OutputEvent::Destination(path.to_string()));
        }

        let (percent, _) = message.split_once('%')?;
        return percent.trim().parse::<f32>().ok().map(OutputEvent::Progress);
    }

    None
}

/// Runs yt-dlp to completion under the hard timeout and returns the
/// canonical path of the produced file inside `job_dir`.
pub async fn attempt_real(
    settings: &ToolSettings,
    args: &[String],
    job_dir: &Path,
) -> Result<PathBuf, AttemptError> {
    let program = settings.program.display().to_string();
    let mut command = Command::new(&settings.program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    // Own group so a timeout also reaches ffmpeg and other helpers.
    #[cfg(unix)]
    command.process_group(0);

    let mut child = command
        .spawn()
        .map_err(|error| {
            if error.kind() == ErrorKind::NotFound {
                AttemptError::ToolMissing(program.clone())
            } else {
                AttemptError::Spawn {
                    program: program.clone(),
                    source: error,
                }
            }
        })?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| AttemptError::Staging("stdout de yt-dlp no disponible".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| AttemptError::Staging("stderr de yt-dlp no disponible".to_string()))?;

    let run = async {
        let (destination, stderr_tail) = tokio::join!(scan_stdout(stdout), drain_stderr(stderr));
        let status = child.wait().await?;
        Ok::<_, AttemptError>((status, destination?, stderr_tail?))
    };

    let outcome = timeout(settings.timeout, run).await;
    let (status, destination, stderr_tail) = match outcome {
        Ok(result) => result?,
        Err(_) => {
            kill_process_group(&child);
            if let Err(error) = child.kill().await {
                warn!("No se pudo terminar yt-dlp tras el tiempo limite: {error}");
            }
            return Err(AttemptError::Timeout(settings.timeout));
        }
    };

    if !status.success() {
        return Err(AttemptError::ExitStatus {
            code: status.code(),
            message: run_error_message(stderr_tail.join("\n").as_bytes()),
        });
    }

    let destination = destination.ok_or(AttemptError::NoDestination)?;
    resolve_destination(job_dir, &destination).await
}

#[cfg(unix)]
fn kill_process_group(child: &Child) {
    use nix::{
        sys::signal::{Signal, killpg},
        unistd::Pid,
    };

    let Some(pid) = child.id().and_then(|pid| i32::try_from(pid).ok()) else {
        return;
    };
    if let Err(error) = killpg(Pid::from_raw(pid), Signal::SIGKILL) {
        warn!("No se pudo terminar el grupo de procesos de yt-dlp: {error}");
    }
}

#[cfg(not(unix))]
fn kill_process_group(_child: &Child) {}

async fn scan_stdout<R>(stdout: R) -> Result<Option<String>, AttemptError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stdout).lines();
    let mut destination = None;

    while let Some(line) = lines.next_line().await? {
        match parse_output_line(&line) {
            Some(OutputEvent::Progress(percent)) => debug!("Progreso yt-dlp: {percent:.1}%"),
            Some(OutputEvent::Destination(path)) => {
                debug!("Destino informado por yt-dlp: {path}");
                destination = Some(path);
            }
            None => {}
        }
    }

    Ok(destination)
}

async fn drain_stderr<R>(stderr: R) -> Result<Vec<String>, AttemptError>
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(stderr).lines();
    let mut tail = Vec::new();

    while let Some(line) = lines.next_line().await? {
        if line.trim().is_empty() {
            continue;
        }
        if !line.contains("WARNING") {
            warn!("yt-dlp: {line}");
        }
        if tail.len() == MAX_STDERR_LINES {
            tail.remove(0);
        }
        tail.push(line);
    }

    Ok(tail)
}

async fn resolve_destination(job_dir: &Path, destination: &str) -> Result<PathBuf, AttemptError> {
    let canonical_job_dir = tokio::fs::canonicalize(job_dir)
        .await
        .map_err(|error| AttemptError::Staging(error.to_string()))?;

    let announced = PathBuf::from(destination);
    let candidate = if announced.is_absolute() {
        announced
    } else {
        job_dir.join(announced)
    };

    resolve_candidate(&canonical_job_dir, &candidate)
        .await?
        .ok_or_else(|| AttemptError::MissingOutput(destination.to_string()))
}

async fn resolve_candidate(
    canonical_job_dir: &Path,
    candidate: &Path,
) -> Result<Option<PathBuf>, AttemptError> {
    let metadata = match tokio::fs::metadata(candidate).await {
        Ok(metadata) => metadata,
        Err(error) if error.kind() == ErrorKind::NotFound => return Ok(None),
        Err(error) => return Err(AttemptError::Io(error)),
    };

    if !metadata.is_file() {
        return Ok(None);
    }

    let canonical_candidate = tokio::fs::canonicalize(candidate).await?;
    if !canonical_candidate.starts_with(canonical_job_dir) {
        warn!(
            "Se bloqueo un archivo fuera de la carpeta temporal esperada: {:?}",
            canonical_candidate
        );
        return Ok(None);
    }

    Ok(Some(canonical_candidate))
}
