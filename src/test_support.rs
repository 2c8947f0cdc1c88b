use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use crate::{
    config::{Config, DownloadPolicy},
    metadata::{DownloadMethod, MetadataRecord, audio_template, video_template},
};

// Serializes every test that forks a process so a freshly written fake tool
// is never held open by another test's child (ETXTBSY).
pub(crate) static PROCESS_LOCK: tokio::sync::Mutex<()> = tokio::sync::Mutex::const_new(());

pub(crate) fn test_config(staging_dir: &Path) -> Config {
    Config {
        bind_addr: "127.0.0.1:0".to_string(),
        production: false,
        staging_dir: staging_dir.to_path_buf(),
        yt_dlp_path: PathBuf::from("/nonexistent/bin/yt-dlp"),
        ffmpeg_path: Some(PathBuf::from("/nonexistent/bin/ffmpeg")),
        policy: DownloadPolicy::RealWithFallback,
        download_timeout: Duration::from_secs(10),
        socket_timeout_seconds: 30,
        retries: 2,
        cleanup_grace: Duration::from_millis(50),
        housekeeping_interval: Duration::from_secs(60 * 60),
        staging_max_age: Duration::from_secs(60 * 60),
        cache_ttl: Duration::from_secs(60 * 60),
        rate_limit_window: Duration::from_secs(15 * 60),
        rate_limit_max: 100,
        metadata_lookup_url: "http://127.0.0.1:9/embed?url=https://www.youtube.com/watch?v={id}"
            .to_string(),
        metadata_timeout: Duration::from_secs(2),
        probe_timeout: Duration::from_secs(10),
        format_probe: false,
        trust_proxy_headers: false,
        allowed_origins: Vec::new(),
    }
}

pub(crate) fn sample_record(title: &str) -> MetadataRecord {
    MetadataRecord {
        title: title.to_string(),
        author: "Canal de prueba".to_string(),
        thumbnail: "https://i.ytimg.com/vi/abc123/hqdefault.jpg".to_string(),
        duration: "3:25".to_string(),
        views: "1.2K vistas".to_string(),
        audio_options: audio_template(true),
        video_options: video_template(true),
        download_method: DownloadMethod::RealWithFallback,
        ffmpeg_available: true,
        cached: false,
    }
}

#[cfg(unix)]
pub(crate) fn write_fake_tool(dir: &Path, name: &str, script_body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join(name);
    std::fs::write(&path, format!("#!/bin/sh\n{script_body}")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}

// Stands in for yt-dlp: records its arguments next to itself, finds the
// --output template and writes `contents` there with the given extension.
#[cfg(unix)]
pub(crate) fn write_fake_downloader(dir: &Path, extension: &str, contents: &str) -> PathBuf {
    let args_file = dir.join("args.txt");
    let script = format!(
        r#"printf '%s\n' "$@" > '{args}'
out=""
prev=""
for arg in "$@"; do
  if [ "$prev" = "--output" ]; then out="$arg"; fi
  prev="$arg"
done
file="${{out%".%(ext)s"}}.{extension}"
echo "[youtube] abc123: Downloading webpage"
echo "[download]  12.5% of 1.00MiB at 1.00MiB/s ETA 00:01"
printf '%s' '{contents}' > "$file"
echo "[download] 100% of 1.00MiB in 00:01"
echo "[ExtractAudio] Destination: $file"
exit 0
"#,
        args = args_file.display(),
    );
    write_fake_tool(dir, "yt-dlp", &script)
}
