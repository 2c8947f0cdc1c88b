use crate::metadata::MediaKind;

pub const MAX_FILENAME_LENGTH: usize = 50;

/// Keeps ASCII word characters, turns whitespace runs into a single `_` and
/// drops everything else, then truncates to `max_len` characters.
pub fn sanitize_filename(value: &str, max_len: usize) -> String {
    let mut sanitized = String::with_capacity(value.len().min(max_len));
    let mut pending_separator = false;

    for character in value.trim().chars() {
        if character.is_whitespace() {
            pending_separator = true;
            continue;
        }
        if !(character.is_ascii_alphanumeric() || character == '_') {
            continue;
        }
        if pending_separator && !sanitized.is_empty() {
            sanitized.push('_');
        }
        pending_separator = false;
        sanitized.push(character);
    }

    sanitized.truncate(max_len);
    sanitized
}

pub fn file_stem(title: &str, video_id: &str) -> String {
    let stem = sanitize_filename(title, MAX_FILENAME_LENGTH);
    if !stem.is_empty() {
        return stem;
    }

    let stem = sanitize_filename(video_id, MAX_FILENAME_LENGTH);
    if stem.is_empty() {
        "download".to_string()
    } else {
        stem
    }
}

pub fn download_filename(title: &str, video_id: &str, kind: MediaKind) -> String {
    format!("{}.{}", file_stem(title, video_id), kind.extension())
}

pub fn build_content_disposition(filename: &str) -> String {
    format!(
        "attachment; filename=\"{filename}\"; filename*=UTF-8''{}",
        urlencoding::encode(filename)
    )
}
