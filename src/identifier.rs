use std::sync::LazyLock;

use regex::Regex;

// Tried in order; the first capture wins.
static VIDEO_ID_PATTERNS: LazyLock<Vec<Regex>> = LazyLock::new(|| {
    [
        r"youtube\.com/watch\?(?:[^#\s]*?&)?v=([^&?#/\s]+)",
        r"youtu\.be/([^&?#/\s]+)",
        r"youtube\.com/embed/([^&?#/\s]+)",
        r"youtube\.com/shorts/([^&?#/\s]+)",
    ]
    .iter()
    .filter_map(|pattern| Regex::new(pattern).ok())
    .collect()
});

pub fn extract_video_id(url: &str) -> Option<String> {
    VIDEO_ID_PATTERNS.iter().find_map(|pattern| {
        pattern
            .captures(url)
            .and_then(|captures| captures.get(1))
            .map(|id| id.as_str().to_string())
            .filter(|id| !id.is_empty())
    })
}
