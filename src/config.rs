use std::{path::PathBuf, time::Duration};

use serde::Serialize;

use crate::error::ApiError;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:3000";
const DEFAULT_YT_DLP_PATH: &str = "yt-dlp";
const DEFAULT_METADATA_LOOKUP_URL: &str =
    "https://noembed.com/embed?url=https://www.youtube.com/watch?v={id}";
const DEFAULT_DOWNLOAD_TIMEOUT_SECONDS: u64 = 180;
const DEFAULT_SOCKET_TIMEOUT_SECONDS: u64 = 30;
const DEFAULT_RETRIES: u32 = 2;
const DEFAULT_CLEANUP_GRACE_SECONDS: u64 = 30;
const DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS: u64 = 60 * 60;
const DEFAULT_STAGING_MAX_AGE_SECONDS: u64 = 60 * 60;
const DEFAULT_CACHE_TTL_SECONDS: u64 = 24 * 60 * 60;
const DEFAULT_RATE_LIMIT_WINDOW_SECONDS: u64 = 15 * 60;
const DEFAULT_RATE_LIMIT_MAX: u32 = 100;
const PRODUCTION_RATE_LIMIT_MAX: u32 = 50;
const DEFAULT_METADATA_TIMEOUT_SECONDS: u64 = 10;
const DEFAULT_PROBE_TIMEOUT_SECONDS: u64 = 30;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum DownloadPolicy {
    StrictReal,
    RealWithFallback,
    DemoOnly,
}

impl DownloadPolicy {
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict-real" | "strict" | "real" => Some(Self::StrictReal),
            "real-with-fallback" | "fallback" => Some(Self::RealWithFallback),
            "demo-only" | "demo" => Some(Self::DemoOnly),
            _ => None,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::StrictReal => "strict-real",
            Self::RealWithFallback => "real-with-fallback",
            Self::DemoOnly => "demo-only",
        }
    }
}

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: String,
    pub production: bool,
    pub staging_dir: PathBuf,
    pub yt_dlp_path: PathBuf,
    pub ffmpeg_path: Option<PathBuf>,
    pub policy: DownloadPolicy,
    pub download_timeout: Duration,
    pub socket_timeout_seconds: u64,
    pub retries: u32,
    pub cleanup_grace: Duration,
    pub housekeeping_interval: Duration,
    pub staging_max_age: Duration,
    pub cache_ttl: Duration,
    pub rate_limit_window: Duration,
    pub rate_limit_max: u32,
    pub metadata_lookup_url: String,
    pub metadata_timeout: Duration,
    pub probe_timeout: Duration,
    pub format_probe: bool,
    pub trust_proxy_headers: bool,
    pub allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> Result<Self, ApiError> {
        Self::from_source(|name| std::env::var(name).ok())
    }

    pub fn from_source<F>(var: F) -> Result<Self, ApiError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let production = var("APP_ENV")
            .as_deref()
            .map(str::trim)
            .is_some_and(|value| value.eq_ignore_ascii_case("production"));

        let policy = match var("DOWNLOAD_POLICY").as_deref().and_then(non_empty) {
            Some(value) => DownloadPolicy::parse(value).ok_or_else(|| {
                ApiError::internal(format!(
                    "DOWNLOAD_POLICY invalido: {value}. Usa strict-real, real-with-fallback o demo-only."
                ))
            })?,
            None => DownloadPolicy::RealWithFallback,
        };

        let staging_dir = var("DOWNLOADS_DIR")
            .as_deref()
            .and_then(non_empty)
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("downloads"));

        let metadata_lookup_url = var("METADATA_LOOKUP_URL")
            .as_deref()
            .and_then(non_empty)
            .unwrap_or(DEFAULT_METADATA_LOOKUP_URL)
            .to_string();
        if !metadata_lookup_url.contains("{id}") {
            return Err(ApiError::internal(
                "METADATA_LOOKUP_URL debe incluir el marcador {id}.",
            ));
        }

        let rate_limit_max = read_u64_env(&var, "RATE_LIMIT_MAX")
            .filter(|value| *value > 0)
            .and_then(|value| u32::try_from(value).ok())
            .unwrap_or(if production {
                PRODUCTION_RATE_LIMIT_MAX
            } else {
                DEFAULT_RATE_LIMIT_MAX
            });

        Ok(Self {
            bind_addr: resolve_bind_addr(&var),
            production,
            staging_dir,
            yt_dlp_path: var("YT_DLP_PATH")
                .as_deref()
                .and_then(non_empty)
                .unwrap_or(DEFAULT_YT_DLP_PATH)
                .into(),
            ffmpeg_path: var("FFMPEG_PATH")
                .as_deref()
                .and_then(non_empty)
                .map(PathBuf::from),
            policy,
            download_timeout: read_seconds_env(
                &var,
                "YT_DLP_TIMEOUT_SECONDS",
                DEFAULT_DOWNLOAD_TIMEOUT_SECONDS,
            ),
            socket_timeout_seconds: read_u64_env(&var, "YT_DLP_SOCKET_TIMEOUT_SECONDS")
                .filter(|value| *value > 0)
                .unwrap_or(DEFAULT_SOCKET_TIMEOUT_SECONDS),
            retries: read_u64_env(&var, "YT_DLP_RETRIES")
                .and_then(|value| u32::try_from(value).ok())
                .unwrap_or(DEFAULT_RETRIES),
            cleanup_grace: read_seconds_env(
                &var,
                "CLEANUP_GRACE_SECONDS",
                DEFAULT_CLEANUP_GRACE_SECONDS,
            ),
            housekeeping_interval: read_seconds_env(
                &var,
                "HOUSEKEEPING_INTERVAL_SECONDS",
                DEFAULT_HOUSEKEEPING_INTERVAL_SECONDS,
            ),
            staging_max_age: read_seconds_env(
                &var,
                "STAGING_MAX_AGE_SECONDS",
                DEFAULT_STAGING_MAX_AGE_SECONDS,
            ),
            cache_ttl: read_seconds_env(&var, "VIDEO_CACHE_TTL_SECONDS", DEFAULT_CACHE_TTL_SECONDS),
            rate_limit_window: read_seconds_env(
                &var,
                "RATE_LIMIT_WINDOW_SECONDS",
                DEFAULT_RATE_LIMIT_WINDOW_SECONDS,
            ),
            rate_limit_max,
            metadata_lookup_url,
            metadata_timeout: read_seconds_env(
                &var,
                "METADATA_TIMEOUT_SECONDS",
                DEFAULT_METADATA_TIMEOUT_SECONDS,
            ),
            probe_timeout: read_seconds_env(
                &var,
                "FORMAT_PROBE_TIMEOUT_SECONDS",
                DEFAULT_PROBE_TIMEOUT_SECONDS,
            ),
            format_probe: read_bool_env(&var, "FORMAT_PROBE").unwrap_or(false),
            trust_proxy_headers: read_bool_env(&var, "TRUST_PROXY_HEADERS").unwrap_or(false),
            allowed_origins: var("ALLOWED_ORIGINS")
                .map(|value| {
                    value
                        .split(',')
                        .map(str::trim)
                        .filter(|origin| !origin.is_empty())
                        .map(ToString::to_string)
                        .collect()
                })
                .unwrap_or_default(),
        })
    }
}

fn read_bool_env<F>(var: &F, name: &str) -> Option<bool>
where
    F: Fn(&str) -> Option<String>,
{
    let value = var(name)?;
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

fn read_u64_env<F>(var: &F, name: &str) -> Option<u64>
where
    F: Fn(&str) -> Option<String>,
{
    var(name).and_then(|value| value.trim().parse::<u64>().ok())
}

fn read_seconds_env<F>(var: &F, name: &str, default_seconds: u64) -> Duration
where
    F: Fn(&str) -> Option<String>,
{
    Duration::from_secs(
        read_u64_env(var, name)
            .filter(|value| *value > 0)
            .unwrap_or(default_seconds),
    )
}

fn resolve_bind_addr<F>(var: &F) -> String
where
    F: Fn(&str) -> Option<String>,
{
    if let Some(configured) = var("APP_ADDR")
        .as_deref()
        .and_then(non_empty)
        .map(ToString::to_string)
    {
        return configured;
    }

    if let Some(port) = var("PORT").and_then(|value| value.trim().parse::<u16>().ok()) {
        return format!("0.0.0.0:{port}");
    }

    DEFAULT_BIND_ADDR.to_string()
}

pub fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed)
    }
}
