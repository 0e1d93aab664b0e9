//! Utility functions for object key parsing and job name normalization.
//!
//! Shared by the admission trigger (job identity) and the worker (payload
//! resolution), so both sides agree on how a key maps to a video.

/// Maximum length of a compute job name.
pub const MAX_JOB_NAME_LEN: usize = 128;

/// Key prefixes that follow the `{prefix}/{video_id}/{file}` layout.
const VIDEO_KEY_PREFIXES: &[&str] = &["videos", "uploads"];

/// Extract the video id from an object key laid out as `videos/{id}/{file}`.
///
/// Returns `None` when the key does not follow the convention or the id
/// segment contains characters outside `[A-Za-z0-9_-]`.
pub fn extract_video_id_from_key(key: &str) -> Option<String> {
    let mut parts = key.trim_start_matches('/').split('/');
    let prefix = parts.next()?;
    if !VIDEO_KEY_PREFIXES.contains(&prefix) {
        return None;
    }

    let id = parts.next()?;
    // Need at least a file segment after the id.
    parts.next()?;

    if id.is_empty() || !id.chars().all(is_name_char) {
        return None;
    }

    Some(id.to_string())
}

/// Last path segment of a key without its extension.
///
/// `videos/103/raw.mp4` -> `raw`, `clip.final.mov` -> `clip.final`.
pub fn file_stem(key: &str) -> &str {
    let name = key.rsplit('/').next().unwrap_or(key);
    match name.rfind('.') {
        Some(0) | None => name,
        Some(idx) => &name[..idx],
    }
}

/// Normalize an arbitrary string into a valid compute job name.
///
/// Characters outside `[A-Za-z0-9_-]` become `-`, runs of `-` collapse,
/// leading/trailing separators are dropped and the result is capped at
/// [`MAX_JOB_NAME_LEN`]. The mapping is deterministic so the same input always
/// yields the same name.
pub fn normalize_job_name(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len().min(MAX_JOB_NAME_LEN));
    let mut last_dash = false;

    for c in raw.chars() {
        let c = if is_name_char(c) { c } else { '-' };
        if c == '-' {
            if last_dash || out.is_empty() {
                continue;
            }
            last_dash = true;
        } else {
            last_dash = false;
        }
        out.push(c);
    }

    while out.ends_with('-') || out.ends_with('_') {
        out.pop();
    }
    while out.starts_with('_') {
        out.remove(0);
    }

    out.truncate(MAX_JOB_NAME_LEN);
    while out.ends_with('-') {
        out.pop();
    }
    out
}

fn is_name_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || c == '-' || c == '_'
}
