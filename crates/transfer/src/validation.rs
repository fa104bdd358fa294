use serde::{Deserialize, Serialize};

use crate::TransferError;
use crate::chunked::OutgoingFile;

/// Extensions refused regardless of the configured rules.
pub const DANGEROUS_EXTENSIONS: &[&str] = &[
    ".exe", ".dll", ".bat", ".cmd", ".sh", ".js", ".vbs", ".ps1", ".msi", ".com", ".scr", ".jar",
];

/// Limits applied to files before they are offered to a peer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct ValidationRules {
    /// Maximum body size in bytes.
    pub max_size: u64,
    /// MIME patterns; `image/*` matches every image type. `None` allows all.
    pub allowed_types: Option<Vec<String>>,
    /// Lower-case extensions including the dot. `None` allows all.
    pub allowed_extensions: Option<Vec<String>>,
}

impl Default for ValidationRules {
    fn default() -> Self {
        Self {
            max_size: 100 * 1024 * 1024,
            allowed_types: None,
            allowed_extensions: None,
        }
    }
}

/// Checks an outgoing file against `rules`.
pub fn validate_file(file: &OutgoingFile, rules: &ValidationRules) -> Result<(), TransferError> {
    if file.size() > rules.max_size {
        return Err(TransferError::Validation(format!(
            "file size exceeds {} limit",
            format_size(rules.max_size)
        )));
    }

    if let Some(types) = &rules.allowed_types {
        let allowed = types.iter().any(|pattern| match pattern.strip_suffix("/*") {
            Some(base) => file.content_type.starts_with(base),
            None => file.content_type == *pattern,
        });
        if !allowed {
            return Err(TransferError::Validation(format!(
                "file type not supported: {}",
                file.content_type
            )));
        }
    }

    let extension = file_extension(&file.name);
    if DANGEROUS_EXTENSIONS.contains(&extension.as_str()) {
        return Err(TransferError::Validation(format!(
            "{extension} files are not allowed for security reasons"
        )));
    }

    if let Some(extensions) = &rules.allowed_extensions
        && !extensions.iter().any(|e| e.eq_ignore_ascii_case(&extension))
    {
        return Err(TransferError::Validation(format!(
            "file extension not supported: {extension}"
        )));
    }

    Ok(())
}

/// Lower-case extension including the dot, or empty.
fn file_extension(name: &str) -> String {
    match name.rfind('.') {
        Some(pos) if pos > 0 => name[pos..].to_ascii_lowercase(),
        _ => String::new(),
    }
}

/// Strips any directory part and replaces characters outside
/// `[A-Za-z0-9.-]` with `_`.
pub fn sanitize_file_name(name: &str) -> String {
    let base = name.rsplit(['/', '\\']).next().unwrap_or_default();
    let cleaned: String = base
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned.is_empty() {
        "file".to_string()
    } else {
        cleaned
    }
}

/// Formats a byte count as `0 B`, `1.5 KB`, `12.25 MB`.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    if bytes == 0 {
        return "0 B".to_string();
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    let rounded = (value * 100.0).round() / 100.0;
    format!("{rounded} {}", UNITS[unit])
}
