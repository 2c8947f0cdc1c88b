use std::{
    cmp::Ordering,
    collections::HashSet,
    sync::Arc,
    time::Duration,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::{
    config::{Config, DownloadPolicy},
    identifier::extract_video_id,
    tools::{ToolError, ToolProbe, ToolStatus, run_tool},
};

const UNKNOWN: &str = "Desconocido";
const MAX_OPTIONS_PER_KIND: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl MediaKind {
    pub fn from_query(value: Option<&str>) -> Self {
        match value.map(|value| value.trim().to_ascii_lowercase()).as_deref() {
            Some("audio") => Self::Audio,
            _ => Self::Video,
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Self::Audio => "mp3",
            Self::Video => "mp4",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            Self::Audio => "audio/mpeg",
            Self::Video => "video/mp4",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ContainerFormat {
    Mp3,
    Mp4,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadMethod {
    Real,
    RealWithFallback,
    DemoOnly,
    Unavailable,
}

impl DownloadMethod {
    pub fn resolve(policy: DownloadPolicy, tool_available: bool) -> Self {
        match (policy, tool_available) {
            (DownloadPolicy::DemoOnly, _) => Self::DemoOnly,
            (DownloadPolicy::StrictReal, true) => Self::Real,
            (DownloadPolicy::StrictReal, false) => Self::Unavailable,
            (DownloadPolicy::RealWithFallback, true) => Self::RealWithFallback,
            (DownloadPolicy::RealWithFallback, false) => Self::DemoOnly,
        }
    }

    fn downloads_for_real(self) -> bool {
        matches!(self, Self::Real | Self::RealWithFallback)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct QualityOption {
    pub quality: String,
    pub format: ContainerFormat,
    pub itag: String,
    pub size: String,
}

impl QualityOption {
    fn new(quality: String, format: ContainerFormat, itag: String, size: impl Into<String>) -> Self {
        Self {
            quality,
            format,
            itag,
            size: size.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MetadataRecord {
    pub title: String,
    pub author: String,
    pub thumbnail: String,
    pub duration: String,
    pub views: String,
    pub audio_options: Vec<QualityOption>,
    pub video_options: Vec<QualityOption>,
    pub download_method: DownloadMethod,
    pub ffmpeg_available: bool,
    pub cached: bool,
}

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("no se pudo extraer el identificador del video")]
    InvalidUrl,
    #[error("fallo la consulta de metadatos: {0}")]
    Http(#[from] reqwest::Error),
    #[error("el servicio de metadatos respondio con estado {0}")]
    Status(reqwest::StatusCode),
    #[error("el servicio de metadatos devolvio un error: {0}")]
    Service(String),
    #[error("el servicio de metadatos no devolvio titulo")]
    MissingTitle,
}

#[derive(Debug, Deserialize)]
struct LookupResponse {
    title: Option<String>,
    author_name: Option<String>,
    thumbnail_url: Option<String>,
    error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BasicInfo {
    pub title: String,
    pub author: Option<String>,
    pub thumbnail: Option<String>,
}

#[derive(Debug, Deserialize)]
struct YtDlpVideoInfo {
    title: Option<String>,
    uploader: Option<String>,
    channel: Option<String>,
    thumbnail: Option<String>,
    duration: Option<f64>,
    view_count: Option<u64>,
    #[serde(default)]
    formats: Vec<YtDlpFormat>,
}

#[derive(Debug, Deserialize)]
struct YtDlpFormat {
    vcodec: Option<String>,
    acodec: Option<String>,
    height: Option<u32>,
    fps: Option<f32>,
    tbr: Option<f32>,
    abr: Option<f32>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

#[derive(Clone)]
pub struct MetadataFetcher {
    http_client: reqwest::Client,
    lookup_url: String,
    tools: Arc<ToolProbe>,
    policy: DownloadPolicy,
    format_probe: bool,
    probe_timeout: Duration,
}

impl MetadataFetcher {
    pub fn new(http_client: reqwest::Client, config: &Config, tools: Arc<ToolProbe>) -> Self {
        Self {
            http_client,
            lookup_url: config.metadata_lookup_url.clone(),
            tools,
            policy: config.policy,
            format_probe: config.format_probe,
            probe_timeout: config.probe_timeout,
        }
    }

    pub async fn fetch(&self, url: &str) -> Result<MetadataRecord, LookupError> {
        let video_id = extract_video_id(url).ok_or(LookupError::InvalidUrl)?;

        let basic = match self.lookup(&video_id).await {
            Ok(info) => Some(info),
            Err(error) => {
                warn!("Consulta de metadatos fallo para {video_id}, se usara fallback: {error}");
                None
            }
        };

        let status = self.tools.status().await;
        let method = DownloadMethod::resolve(self.policy, status.yt_dlp_available());

        let probed = if self.format_probe && method.downloads_for_real() {
            match self.probe(url).await {
                Ok(info) => Some(info),
                Err(error) => {
                    warn!("No se pudieron listar formatos con yt-dlp para {video_id}: {error}");
                    None
                }
            }
        } else {
            None
        };

        let record = build_record(&video_id, basic, probed.as_ref(), &status, method);
        info!(
            "Metadatos listos para {video_id}: metodo={:?} audio={} video={}",
            record.download_method,
            record.audio_options.len(),
            record.video_options.len()
        );
        Ok(record)
    }

    pub async fn lookup(&self, video_id: &str) -> Result<BasicInfo, LookupError> {
        let endpoint = self
            .lookup_url
            .replace("{id}", &urlencoding::encode(video_id));
        let response = self.http_client.get(&endpoint).send().await?;
        if !response.status().is_success() {
            return Err(LookupError::Status(response.status()));
        }

        let payload = response.json::<LookupResponse>().await?;
        if let Some(error) = payload.error {
            return Err(LookupError::Service(error));
        }

        let title = payload
            .title
            .filter(|value| !value.trim().is_empty())
            .ok_or(LookupError::MissingTitle)?;

        Ok(BasicInfo {
            title,
            author: payload.author_name.filter(|value| !value.trim().is_empty()),
            thumbnail: payload.thumbnail_url.filter(|value| !value.trim().is_empty()),
        })
    }

    pub async fn title_for(&self, video_id: &str) -> String {
        match self.lookup(video_id).await {
            Ok(info) => info.title,
            Err(error) => {
                warn!("Se usara el identificador como nombre de archivo para {video_id}: {error}");
                video_id.to_string()
            }
        }
    }

    async fn probe(&self, url: &str) -> Result<YtDlpVideoInfo, ToolError> {
        let output = run_tool(
            self.tools.yt_dlp_path(),
            ["-J", "--no-playlist", "--no-warnings", url],
            self.probe_timeout,
        )
        .await?;

        serde_json::from_slice(&output.stdout).map_err(|error| {
            ToolError::Failed(format!("No se pudo interpretar JSON de yt-dlp: {error}"))
        })
    }
}

fn build_record(
    video_id: &str,
    basic: Option<BasicInfo>,
    probed: Option<&YtDlpVideoInfo>,
    status: &ToolStatus,
    method: DownloadMethod,
) -> MetadataRecord {
    let downloads_for_real = method.downloads_for_real();

    let (title, author, thumbnail) = match basic {
        Some(info) => (Some(info.title), info.author, info.thumbnail),
        None => (None, None, None),
    };
    let probed_title = probed.and_then(|info| info.title.clone());
    let probed_author = probed.and_then(|info| info.uploader.clone().or(info.channel.clone()));
    let probed_thumbnail = probed.and_then(|info| info.thumbnail.clone());

    let mut audio_options = probed
        .map(|info| build_audio_options(&info.formats))
        .unwrap_or_default();
    if audio_options.is_empty() {
        audio_options = audio_template(downloads_for_real);
    }

    let mut video_options = probed
        .map(|info| build_video_options(&info.formats))
        .unwrap_or_default();
    if video_options.is_empty() {
        video_options = video_template(downloads_for_real);
    }

    MetadataRecord {
        title: title
            .or(probed_title)
            .unwrap_or_else(|| format!("Video de YouTube ({video_id})")),
        author: author
            .or(probed_author)
            .unwrap_or_else(|| "Canal de YouTube".to_string()),
        thumbnail: thumbnail
            .or(probed_thumbnail)
            .unwrap_or_else(|| format!("https://i.ytimg.com/vi/{video_id}/hqdefault.jpg")),
        duration: probed
            .and_then(|info| info.duration)
            .filter(|seconds| *seconds > 0.0)
            .map(|seconds| format_duration(seconds.round() as u64))
            .unwrap_or_else(|| UNKNOWN.to_string()),
        views: probed
            .and_then(|info| info.view_count)
            .map(format_views)
            .unwrap_or_else(|| UNKNOWN.to_string()),
        audio_options,
        video_options,
        download_method: method,
        ffmpeg_available: status.ffmpeg,
        cached: false,
    }
}

pub fn audio_template(downloads_for_real: bool) -> Vec<QualityOption> {
    [(128, "3-8 MB"), (192, "5-12 MB"), (256, "8-20 MB")]
        .into_iter()
        .map(|(kbps, size)| {
            QualityOption::new(
                format!("{kbps}kbps"),
                ContainerFormat::Mp3,
                format!("audio-{kbps}"),
                if downloads_for_real { size } else { "Demo" },
            )
        })
        .collect()
}

pub fn video_template(downloads_for_real: bool) -> Vec<QualityOption> {
    [(360, "15-50 MB"), (720, "40-150 MB"), (1080, "100-400 MB")]
        .into_iter()
        .map(|(height, size)| {
            QualityOption::new(
                format!("{height}p"),
                ContainerFormat::Mp4,
                format!("video-{height}"),
                if downloads_for_real { size } else { "Demo" },
            )
        })
        .collect()
}

fn build_video_options(formats: &[YtDlpFormat]) -> Vec<QualityOption> {
    let mut options: Vec<(u32, f32, f32, Option<f64>)> = formats
        .iter()
        .filter(|item| has_video(item))
        .filter_map(|item| {
            let height = item.height.filter(|height| *height > 0)?;
            Some((
                height,
                item.fps.unwrap_or_default(),
                item.tbr.unwrap_or_default(),
                item.filesize.or(item.filesize_approx),
            ))
        })
        .collect();

    options.sort_by(|a, b| {
        b.0.cmp(&a.0)
            .then_with(|| b.1.partial_cmp(&a.1).unwrap_or(Ordering::Equal))
            .then_with(|| b.2.partial_cmp(&a.2).unwrap_or(Ordering::Equal))
    });

    let mut seen_labels = HashSet::new();
    options
        .into_iter()
        .filter(|(height, ..)| seen_labels.insert(*height))
        .take(MAX_OPTIONS_PER_KIND)
        .map(|(height, _, _, size)| {
            QualityOption::new(
                format!("{height}p"),
                ContainerFormat::Mp4,
                format!("video-{height}"),
                size.map(format_filesize_mb)
                    .unwrap_or_else(|| "tamano variable".to_string()),
            )
        })
        .collect()
}

fn build_audio_options(formats: &[YtDlpFormat]) -> Vec<QualityOption> {
    let mut options: Vec<(u32, Option<f64>)> = formats
        .iter()
        .filter(|item| has_audio_only(item))
        .filter_map(|item| {
            let bitrate = item.abr.or(item.tbr).filter(|bitrate| *bitrate > 0.0)?;
            Some((
                bitrate.round() as u32,
                item.filesize.or(item.filesize_approx),
            ))
        })
        .collect();

    options.sort_by(|a, b| b.0.cmp(&a.0));

    let mut seen_labels = HashSet::new();
    options
        .into_iter()
        .filter(|(kbps, _)| seen_labels.insert(*kbps))
        .take(MAX_OPTIONS_PER_KIND)
        .map(|(kbps, size)| {
            QualityOption::new(
                format!("{kbps}kbps"),
                ContainerFormat::Mp3,
                format!("audio-{kbps}"),
                size.map(format_filesize_mb)
                    .unwrap_or_else(|| "tamano variable".to_string()),
            )
        })
        .collect()
}

fn has_video(format: &YtDlpFormat) -> bool {
    matches!(format.vcodec.as_deref(), Some(value) if value != "none")
}

fn has_audio(format: &YtDlpFormat) -> bool {
    matches!(format.acodec.as_deref(), Some(value) if value != "none")
}

fn has_audio_only(format: &YtDlpFormat) -> bool {
    !has_video(format) && has_audio(format)
}

fn format_filesize_mb(bytes: f64) -> String {
    let mb = bytes / 1_048_576.0;
    if mb > 1024.0 {
        format!("{:.2} GB", mb / 1024.0)
    } else {
        format!("{mb:.1} MB")
    }
}

pub fn format_duration(total_seconds: u64) -> String {
    let hours = total_seconds / 3600;
    let minutes = (total_seconds % 3600) / 60;
    let seconds = total_seconds % 60;

    if hours > 0 {
        format!("{hours}:{minutes:02}:{seconds:02}")
    } else {
        format!("{minutes}:{seconds:02}")
    }
}

pub fn format_views(views: u64) -> String {
    if views >= 1_000_000 {
        format!("{:.1}M vistas", views as f64 / 1_000_000.0)
    } else if views >= 1_000 {
        format!("{:.1}K vistas", views as f64 / 1_000.0)
    } else {
        format!("{views} vistas")
    }
}
