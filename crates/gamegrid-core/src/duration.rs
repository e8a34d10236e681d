//! Human-readable duration strings ("500ms", "30s", "5m", "24h").

use std::time::Duration;

/// Parse a duration string with an `ms`, `s`, `m` or `h` suffix.
///
/// Returns `None` for anything else, including a bare number or a value
/// whose seconds overflow `u64`.
pub fn parse_duration(s: &str) -> Option<Duration> {
    let s = s.trim();
    // "ms" must be checked before "s" and "m".
    if let Some(ms) = s.strip_suffix("ms") {
        return ms.trim().parse::<u64>().ok().map(Duration::from_millis);
    }
    let unit_at = s.len().checked_sub(1)?;
    if !s.is_char_boundary(unit_at) {
        return None;
    }
    let (digits, unit) = s.split_at(unit_at);
    let value = digits.trim().parse::<u64>().ok()?;
    match unit {
        "s" => Some(Duration::from_secs(value)),
        "m" => value.checked_mul(60).map(Duration::from_secs),
        "h" => value.checked_mul(3600).map(Duration::from_secs),
        _ => None,
    }
}

/// Render a duration back into the largest exact unit.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let secs = d.as_secs();
    if secs != 0 && secs % 3600 == 0 {
        format!("{}h", secs / 3600)
    } else if secs != 0 && secs % 60 == 0 {
        format!("{}m", secs / 60)
    } else {
        format!("{secs}s")
    }
}
