//! Title normalization used for every comparison in the engine.

/// Extensions stripped from the end of a display name before comparison.
pub const KNOWN_EXTENSIONS: &[&str] = &[
    "pdf", "epub", "mobi", "azw", "azw3", "djvu", "chm", "doc", "docx", "odt", "rtf", "txt",
    "ppt", "pptx", "xls", "xlsx", "zip", "rar", "7z", "mp3", "m4a", "m4b", "ogg", "wav", "mp4",
    "mkv", "avi", "jpg", "jpeg", "png",
];

/// Canonical comparison form of a display string.
///
/// Strips a known trailing extension, turns `_`, `-` and other whitespace into
/// spaces, lower-cases, drops everything outside `[a-z0-9 ]`, then collapses
/// and trims spaces. Total and idempotent.
pub fn normalize(raw: &str) -> String {
    strip_known_extension(raw.trim_end())
        .chars()
        .map(|c| if c == '_' || c == '-' || c.is_whitespace() { ' ' } else { c })
        .flat_map(char::to_lowercase)
        .filter(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || *c == ' ')
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

/// Human-facing title proposed for new records: extension stripped and
/// separators turned into spaces, original casing kept.
pub fn display_title(raw: &str) -> String {
    strip_known_extension(raw.trim_end())
        .replace(['_', '-'], " ")
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
}

fn strip_known_extension(name: &str) -> &str {
    match name.rsplit_once('.') {
        Some((stem, ext))
            if KNOWN_EXTENSIONS
                .iter()
                .any(|known| ext.eq_ignore_ascii_case(known)) =>
        {
            stem
        }
        _ => name,
    }
}
