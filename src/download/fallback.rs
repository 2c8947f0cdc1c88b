//! Placeholder payloads sent when no real file could be produced. They carry
//! a valid container signature and a plausible size but no media frames.

use crate::metadata::MediaKind;

pub const ID3_SIGNATURE: &[u8] = b"ID3";
pub const MP4_SIGNATURE: &[u8] = b"ftypisom";

const AUDIO_PLACEHOLDER_BYTES: usize = 500 * 1024;
const VIDEO_PLACEHOLDER_BYTES: usize = 1000 * 1024;
const MAX_TITLE_CHARS: usize = 200;

pub fn build_placeholder(kind: MediaKind, title: &str) -> Vec<u8> {
    let title: String = title.trim().chars().take(MAX_TITLE_CHARS).collect();

    match kind {
        MediaKind::Audio => {
            let title = if title.is_empty() { "Demo Audio" } else { &title };
            id3_placeholder(title, AUDIO_PLACEHOLDER_BYTES)
        }
        MediaKind::Video => {
            let title = if title.is_empty() { "Demo Video" } else { &title };
            mp4_placeholder(title, VIDEO_PLACEHOLDER_BYTES)
        }
    }
}

// ID3v2.4 header, one TIT2 frame (UTF-8), then zero padding inside the tag.
fn id3_placeholder(title: &str, total_len: usize) -> Vec<u8> {
    let frame_body_len = 1 + title.len();
    let frame_len = 10 + frame_body_len;
    let tag_len = total_len.saturating_sub(10).max(frame_len);

    let mut payload = Vec::with_capacity(10 + tag_len);
    payload.extend_from_slice(ID3_SIGNATURE);
    payload.extend_from_slice(&[0x04, 0x00, 0x00]);
    payload.extend_from_slice(&syncsafe(tag_len as u32));

    payload.extend_from_slice(b"TIT2");
    payload.extend_from_slice(&syncsafe(frame_body_len as u32));
    payload.extend_from_slice(&[0x00, 0x00]);
    payload.push(0x03);
    payload.extend_from_slice(title.as_bytes());

    payload.resize(10 + tag_len, 0);
    payload
}

// `ftyp` box followed by a `free` box holding the title and zero fill.
fn mp4_placeholder(title: &str, total_len: usize) -> Vec<u8> {
    const FTYP_LEN: usize = 24;
    let free_len = total_len.saturating_sub(FTYP_LEN).max(8 + title.len());

    let mut payload = Vec::with_capacity(FTYP_LEN + free_len);
    payload.extend_from_slice(&(FTYP_LEN as u32).to_be_bytes());
    payload.extend_from_slice(MP4_SIGNATURE);
    payload.extend_from_slice(&0x0000_0200u32.to_be_bytes());
    payload.extend_from_slice(b"isom");
    payload.extend_from_slice(b"mp41");

    payload.extend_from_slice(&(free_len as u32).to_be_bytes());
    payload.extend_from_slice(b"free");
    payload.extend_from_slice(title.as_bytes());

    payload.resize(FTYP_LEN + free_len, 0);
    payload
}

fn syncsafe(value: u32) -> [u8; 4] {
    [
        ((value >> 21) & 0x7f) as u8,
        ((value >> 14) & 0x7f) as u8,
        ((value >> 7) & 0x7f) as u8,
        (value & 0x7f) as u8,
    ]
}
