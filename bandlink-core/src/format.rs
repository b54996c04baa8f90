//! Display helpers for status text.

const UNITS: [&str; 9] = ["Bytes", "KB", "MB", "GB", "TB", "PB", "EB", "ZB", "YB"];

/// Human-readable size with 1024 steps, trailing zeros trimmed ("1.5 KB", "20 KB").
pub fn format_bytes(bytes: f64, decimals: usize) -> String {
    if !bytes.is_finite() || bytes <= 0.0 {
        return "0 Bytes".to_string();
    }
    let exp = (bytes.ln() / 1024f64.ln()).floor().clamp(0.0, (UNITS.len() - 1) as f64);
    let value = bytes / 1024f64.powi(exp as i32);
    let mut text = format!("{value:.decimals$}");
    if text.contains('.') {
        text = text.trim_end_matches('0').trim_end_matches('.').to_string();
    }
    format!("{} {}", text, UNITS[exp as usize])
}

/// Last segment of a path, accepting both `/` and `\` separators.
pub fn file_name(path: &str) -> &str {
    path.rsplit(['/', '\\']).next().unwrap_or("")
}
