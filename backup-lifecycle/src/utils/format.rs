//! Human-readable formatting for command reports.

/// Format bytes as a human-readable string
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= 1024.0 && unit_index < UNITS.len() - 1 {
        size /= 1024.0;
        unit_index += 1;
    }

    format!("{:.2} {}", size, UNITS[unit_index])
}

/// Format a duration in milliseconds as `1.23s` or `2m 03s`
pub fn format_elapsed(millis: u128) -> String {
    let secs = millis / 1000;
    if secs < 60 {
        format!("{}.{:02}s", secs, (millis % 1000) / 10)
    } else {
        format!("{}m {:02}s", secs / 60, secs % 60)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(0), "0.00 B");
        assert_eq!(format_bytes(1023), "1023.00 B");
        assert_eq!(format_bytes(1024), "1.00 KB");
        assert_eq!(format_bytes(1_048_576), "1.00 MB");
    }

    #[test]
    fn test_format_elapsed() {
        assert_eq!(format_elapsed(1_230), "1.23s");
        assert_eq!(format_elapsed(123_000), "2m 03s");
    }
}
