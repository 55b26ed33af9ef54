//! Attachment admission: size and file type, nothing else.
//!
//! The filename is only ever consulted for its extension. Whether a document
//! is actually a CV is decided by extraction, not here.

use serde::Serialize;

/// Extensions that are never candidate documents.
const BLOCKED_EXTENSIONS: &[&str] = &[
    // images
    "jpg", "jpeg", "png", "gif", "bmp", "tif", "tiff", "webp", "heic", "heif", "svg", "ico",
    // audio / video
    "mp3", "wav", "m4a", "aac", "ogg", "flac", "mp4", "mov", "avi", "mkv", "wmv", "webm",
    // archives
    "zip", "rar", "7z", "tar", "gz", "tgz", "bz2", "xz",
    // executables
    "exe", "msi", "bat", "cmd", "sh", "dll", "com", "scr", "jar", "apk", "dmg",
    // spreadsheets
    "xls", "xlsx", "xlsm", "csv", "ods", "numbers",
    // presentations
    "ppt", "pptx", "pps", "ppsx", "odp", "key",
];

const ALLOWED_MEDIA_TYPES: &[&str] = &[
    "application/pdf",
    "application/msword",
    "application/vnd.openxmlformats-officedocument.wordprocessingml.document",
    "application/rtf",
    "text/rtf",
];

const ALLOWED_EXTENSIONS: &[&str] = &["pdf", "doc", "docx", "rtf"];

/// Outcome of the admission check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", content = "reason", rename_all = "snake_case")]
pub enum Admission {
    Allow(&'static str),
    Deny(&'static str),
}

impl Admission {
    pub fn is_allowed(&self) -> bool {
        matches!(self, Self::Allow(_))
    }

    pub fn reason(&self) -> &'static str {
        match self {
            Self::Allow(r) | Self::Deny(r) => r,
        }
    }
}

/// Lowercased extension after the last dot, if any.
pub fn extension_of(filename: &str) -> Option<String> {
    let (_, ext) = filename.trim().rsplit_once('.')?;
    let ext = ext.trim().to_lowercase();
    (!ext.is_empty()).then_some(ext)
}

/// Strip parameters (`; charset=...`) and lowercase.
fn bare_media_type(media_type: &str) -> String {
    media_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_lowercase()
}

/// Size and type gate applied before any extraction call.
#[derive(Debug, Clone)]
pub struct AdmissionFilter {
    min_bytes: u64,
    max_bytes: u64,
}

impl Default for AdmissionFilter {
    fn default() -> Self {
        Self::new(5 * 1024, 15 * 1024 * 1024)
    }
}

impl AdmissionFilter {
    pub fn new(min_bytes: u64, max_bytes: u64) -> Self {
        Self { min_bytes, max_bytes }
    }

    /// Evaluate the rules in order; the first match wins.
    pub fn check(&self, filename: &str, media_type: &str, size: u64) -> Admission {
        if size < self.min_bytes {
            return Admission::Deny("too small");
        }
        if size > self.max_bytes {
            return Admission::Deny("too large");
        }

        let ext = extension_of(filename);
        if let Some(ext) = ext.as_deref() {
            if BLOCKED_EXTENSIONS.contains(&ext) {
                return Admission::Deny("blocked extension");
            }
        }

        if ALLOWED_MEDIA_TYPES.contains(&bare_media_type(media_type).as_str()) {
            return Admission::Allow("allowed media type");
        }
        if let Some(ext) = ext.as_deref() {
            if ALLOWED_EXTENSIONS.contains(&ext) {
                return Admission::Allow("allowed extension");
            }
        }
        Admission::Deny("unknown type")
    }
}
