mod fallback;
mod process;
mod staging;

use std::{path::PathBuf, time::Duration};

use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    config::{Config, DownloadPolicy},
    filename::file_stem,
    metadata::MediaKind,
};

pub use fallback::build_placeholder;
pub use process::AttemptError;
pub use staging::{StagedFile, cleanup_job_dir};

use process::{ToolSettings, attempt_real, build_args};

const DEFAULT_AUDIO_KBPS: u32 = 128;
const DEFAULT_VIDEO_HEIGHT: u32 = 720;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quality {
    AudioKbps(u32),
    VideoHeight(u32),
}

impl Quality {
    /// Reads the first run of digits in the itag (`audio-192`, `video-480`,
    /// `720p`) and falls back to a sane default when it is absent or out of
    /// range.
    pub fn from_itag(itag: &str, kind: MediaKind) -> Self {
        let number = itag
            .split(|character: char| !character.is_ascii_digit())
            .find(|part| !part.is_empty())
            .and_then(|digits| digits.parse::<u32>().ok());

        match kind {
            MediaKind::Audio => Self::AudioKbps(
                number
                    .filter(|kbps| (32..=320).contains(kbps))
                    .unwrap_or(DEFAULT_AUDIO_KBPS),
            ),
            MediaKind::Video => Self::VideoHeight(
                number
                    .filter(|height| (144..=4320).contains(height))
                    .unwrap_or(DEFAULT_VIDEO_HEIGHT),
            ),
        }
    }

    pub fn label(self) -> String {
        match self {
            Self::AudioKbps(kbps) => format!("{kbps}kbps"),
            Self::VideoHeight(height) => format!("{height}p"),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DownloadRequest {
    pub url: String,
    pub video_id: String,
    pub itag: String,
    pub kind: MediaKind,
    pub title: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryMethod {
    Real,
    Fallback,
}

impl DeliveryMethod {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Real => "real",
            Self::Fallback => "fallback",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DownloadResult {
    pub byte_count: u64,
    pub method: DeliveryMethod,
    pub path: Option<PathBuf>,
}

#[derive(Debug)]
pub enum Payload {
    Staged(StagedFile),
    Buffer(Vec<u8>),
}

#[derive(Debug)]
pub struct PreparedDownload {
    pub payload: Payload,
    pub result: DownloadResult,
}

#[derive(Debug, Error)]
pub enum DownloadError {
    #[error("la descarga real fallo: {0}")]
    RealDownloadFailed(#[from] AttemptError),
}

pub struct DownloadOrchestrator {
    policy: DownloadPolicy,
    tool: ToolSettings,
    staging_dir: PathBuf,
    cleanup_grace: Duration,
}

impl DownloadOrchestrator {
    pub fn new(config: &Config) -> Self {
        Self {
            policy: config.policy,
            tool: ToolSettings {
                program: config.yt_dlp_path.clone(),
                ffmpeg_location: config.ffmpeg_path.clone(),
                timeout: config.download_timeout,
                socket_timeout_secs: config.socket_timeout_seconds,
                retries: config.retries,
            },
            staging_dir: config.staging_dir.clone(),
            cleanup_grace: config.cleanup_grace,
        }
    }

    pub async fn prepare(&self, request: &DownloadRequest) -> Result<PreparedDownload, DownloadError> {
        if self.policy == DownloadPolicy::DemoOnly {
            info!("Modo demo activo, se entrega archivo de ejemplo para {}", request.video_id);
            return Ok(self.fallback(request));
        }

        match self.download_real(request).await {
            Ok(staged) => {
                info!(
                    "Descarga real lista para {}: {:?} ({} bytes)",
                    request.video_id,
                    staged.path(),
                    staged.size()
                );
                Ok(PreparedDownload {
                    result: DownloadResult {
                        byte_count: staged.size(),
                        method: DeliveryMethod::Real,
                        path: Some(staged.path().to_path_buf()),
                    },
                    payload: Payload::Staged(staged),
                })
            }
            Err(error) if self.policy == DownloadPolicy::StrictReal => {
                warn!("Descarga real fallo para {}: {error}", request.video_id);
                Err(DownloadError::RealDownloadFailed(error))
            }
            Err(error) => {
                warn!(
                    "Descarga real fallo para {}, se usara archivo de ejemplo: {error}",
                    request.video_id
                );
                Ok(self.fallback(request))
            }
        }
    }

    async fn download_real(&self, request: &DownloadRequest) -> Result<StagedFile, AttemptError> {
        let quality = Quality::from_itag(&request.itag, request.kind);
        let job_dir = self.staging_dir.join(Uuid::new_v4().to_string());
        tokio::fs::create_dir_all(&job_dir)
            .await
            .map_err(|error| AttemptError::Staging(error.to_string()))?;

        let stem = file_stem(&request.title, &request.video_id);
        let args = build_args(&self.tool, &request.url, quality, &job_dir, &stem);
        info!(
            "Iniciando yt-dlp para {} ({})",
            request.video_id,
            quality.label()
        );

        let staged = async {
            let path = attempt_real(&self.tool, &args, &job_dir).await?;
            let extension = path.extension().and_then(|value| value.to_str());
            if !extension.is_some_and(|value| value.eq_ignore_ascii_case(request.kind.extension())) {
                return Err(AttemptError::UnexpectedFormat(path.display().to_string()));
            }
            let metadata = tokio::fs::metadata(&path).await?;
            Ok::<_, AttemptError>((path, metadata.len()))
        }
        .await;

        match staged {
            Ok((path, size)) => Ok(StagedFile::new(path, job_dir, size, self.cleanup_grace)),
            Err(error) => {
                cleanup_job_dir(&job_dir).await;
                Err(error)
            }
        }
    }

    fn fallback(&self, request: &DownloadRequest) -> PreparedDownload {
        let payload = build_placeholder(request.kind, &request.title);
        PreparedDownload {
            result: DownloadResult {
                byte_count: payload.len() as u64,
                method: DeliveryMethod::Fallback,
                path: None,
            },
            payload: Payload::Buffer(payload),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{PROCESS_LOCK, test_config};
    #[cfg(unix)]
    use crate::test_support::{write_fake_downloader, write_fake_tool};

    fn request(kind: MediaKind, itag: &str) -> DownloadRequest {
        DownloadRequest {
            url: "https://www.youtube.com/watch?v=abc123".to_string(),
            video_id: "abc123".to_string(),
            itag: itag.to_string(),
            kind,
            title: "Test".to_string(),
        }
    }

    fn job_dirs(staging: &std::path::Path) -> usize {
        std::fs::read_dir(staging)
            .map(|entries| entries.filter_map(Result::ok).filter(|entry| entry.path().is_dir()).count())
            .unwrap_or(0)
    }

    #[test]
    fn quality_comes_from_the_itag_digits() {
        assert_eq!(Quality::from_itag("audio-192", MediaKind::Audio), Quality::AudioKbps(192));
        assert_eq!(Quality::from_itag("video-480", MediaKind::Video), Quality::VideoHeight(480));
        assert_eq!(Quality::from_itag("1080p", MediaKind::Video), Quality::VideoHeight(1080));
        assert_eq!(Quality::from_itag("", MediaKind::Audio), Quality::AudioKbps(128));
        assert_eq!(Quality::from_itag("best", MediaKind::Video), Quality::VideoHeight(720));
        assert_eq!(Quality::from_itag("audio-9000", MediaKind::Audio), Quality::AudioKbps(128));
        assert_eq!(Quality::from_itag("video-12", MediaKind::Video), Quality::VideoHeight(720));
        assert_eq!(Quality::AudioKbps(192).label(), "192kbps");
        assert_eq!(Quality::VideoHeight(360).label(), "360p");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn successful_tool_run_streams_the_staged_file() {
        let _guard = PROCESS_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        config.yt_dlp_path = write_fake_downloader(tools.path(), "mp3", "real-audio-bytes");

        let orchestrator = DownloadOrchestrator::new(&config);
        let prepared = orchestrator
            .prepare(&request(MediaKind::Audio, "audio-192"))
            .await
            .unwrap();

        assert_eq!(prepared.result.method, DeliveryMethod::Real);
        assert_eq!(prepared.result.byte_count, "real-audio-bytes".len() as u64);
        let path = prepared.result.path.clone().unwrap();
        assert!(path.ends_with("Test.mp3"));

        let args = std::fs::read_to_string(tools.path().join("args.txt")).unwrap();
        let args: Vec<_> = args.lines().collect();
        assert_eq!(args[0], "https://www.youtube.com/watch?v=abc123");
        assert!(args.contains(&"--no-playlist"));
        assert!(args.contains(&"192K"));

        let Payload::Staged(staged) = prepared.payload else {
            panic!("expected a staged file");
        };
        let body = staged.into_body().await.unwrap();
        let bytes = axum::body::to_bytes(body, usize::MAX).await.unwrap();
        assert_eq!(&bytes[..], b"real-audio-bytes");

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert!(!path.exists());
        assert_eq!(job_dirs(staging.path()), 0);
    }

    #[tokio::test]
    async fn missing_tool_falls_back_to_placeholder() {
        let _guard = PROCESS_LOCK.lock().await;
        let staging = tempfile::tempdir().unwrap();
        let orchestrator = DownloadOrchestrator::new(&test_config(staging.path()));

        let prepared = orchestrator
            .prepare(&request(MediaKind::Video, "video-720"))
            .await
            .unwrap();

        assert_eq!(prepared.result.method, DeliveryMethod::Fallback);
        assert_eq!(prepared.result.path, None);
        let Payload::Buffer(bytes) = prepared.payload else {
            panic!("expected a buffer");
        };
        assert_eq!(&bytes[4..12], b"ftypisom");
        assert_eq!(prepared.result.byte_count, bytes.len() as u64);
        assert_eq!(job_dirs(staging.path()), 0);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn failing_runs_fall_back_and_clean_their_job_dir() {
        let _guard = PROCESS_LOCK.lock().await;
        let outside = tempfile::tempdir().unwrap();
        let escaped = outside.path().join("escaped.mp3");
        let scripts = [
            "echo 'ERROR: Video unavailable' >&2\nexit 1\n".to_string(),
            "echo '[download] 50.0%'\nexit 0\n".to_string(),
            "echo '[ExtractAudio] Destination: /nonexistent/out.mp3'\nexit 0\n".to_string(),
            format!(
                "printf x > '{0}'\necho '[ExtractAudio] Destination: {0}'\nexit 0\n",
                escaped.display()
            ),
        ];

        for script in scripts {
            let tools = tempfile::tempdir().unwrap();
            let staging = tempfile::tempdir().unwrap();
            let mut config = test_config(staging.path());
            config.yt_dlp_path = write_fake_tool(tools.path(), "yt-dlp", &script);

            let prepared = DownloadOrchestrator::new(&config)
                .prepare(&request(MediaKind::Audio, "audio-128"))
                .await
                .unwrap();

            assert_eq!(prepared.result.method, DeliveryMethod::Fallback, "{script}");
            let Payload::Buffer(bytes) = prepared.payload else {
                panic!("expected a buffer for {script}");
            };
            assert!(bytes.starts_with(b"ID3"));
            assert_eq!(job_dirs(staging.path()), 0, "{script}");
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn video_in_a_non_mp4_container_falls_back() {
        let _guard = PROCESS_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        config.yt_dlp_path = write_fake_downloader(tools.path(), "webm", "webm-bytes");

        let prepared = DownloadOrchestrator::new(&config)
            .prepare(&request(MediaKind::Video, "video-720"))
            .await
            .unwrap();

        assert_eq!(prepared.result.method, DeliveryMethod::Fallback);
        let Payload::Buffer(bytes) = prepared.payload else {
            panic!("expected a buffer");
        };
        assert_eq!(&bytes[4..12], b"ftypisom");
        assert_eq!(job_dirs(staging.path()), 0);

        let args = std::fs::read_to_string(tools.path().join("args.txt")).unwrap();
        assert!(args.lines().any(|arg| arg == "best[height<=720][ext=mp4]"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn hung_tool_is_killed_at_the_timeout() {
        let _guard = PROCESS_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        config.yt_dlp_path = write_fake_tool(tools.path(), "yt-dlp", "exec sleep 30\n");
        config.download_timeout = Duration::from_millis(300);

        let started = std::time::Instant::now();
        let prepared = DownloadOrchestrator::new(&config)
            .prepare(&request(MediaKind::Audio, "audio-192"))
            .await
            .unwrap();

        assert_eq!(prepared.result.method, DeliveryMethod::Fallback);
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn strict_policy_surfaces_the_failure() {
        let _guard = PROCESS_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        config.yt_dlp_path = write_fake_tool(tools.path(), "yt-dlp", "exit 3\n");
        config.policy = DownloadPolicy::StrictReal;

        let error = DownloadOrchestrator::new(&config)
            .prepare(&request(MediaKind::Video, "video-360"))
            .await
            .unwrap_err();

        let DownloadError::RealDownloadFailed(attempt) = error;
        assert!(
            matches!(attempt, AttemptError::ExitStatus { code: Some(3), .. }),
            "{attempt:?}"
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn demo_policy_never_runs_the_tool() {
        let _guard = PROCESS_LOCK.lock().await;
        let tools = tempfile::tempdir().unwrap();
        let staging = tempfile::tempdir().unwrap();
        let mut config = test_config(staging.path());
        config.yt_dlp_path = write_fake_downloader(tools.path(), "mp3", "real");
        config.policy = DownloadPolicy::DemoOnly;

        let prepared = DownloadOrchestrator::new(&config)
            .prepare(&request(MediaKind::Audio, "audio-192"))
            .await
            .unwrap();

        assert_eq!(prepared.result.method, DeliveryMethod::Fallback);
        assert!(!tools.path().join("args.txt").exists());
    }
}
