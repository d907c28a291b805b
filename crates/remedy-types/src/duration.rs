//! Go-style duration strings (`"3s"`, `"1m30s"`, `"250ms"`, `"1h"`).

use std::time::Duration;

use crate::error::{Result, TypesError};

/// Parse a duration string made of one or more `<number><unit>` groups.
///
/// Supported units: `ms`, `s`, `m`, `h`, `d`. A bare number is read as seconds.
pub fn parse_duration(input: &str) -> Result<Duration> {
    let s = input.trim();
    if s.is_empty() {
        return Err(TypesError::InvalidDuration(input.to_string()));
    }

    if let Ok(secs) = s.parse::<u64>() {
        return Ok(Duration::from_secs(secs));
    }

    let mut total = Duration::ZERO;
    let mut rest = s;
    while !rest.is_empty() {
        let digits = rest
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .ok_or_else(|| TypesError::InvalidDuration(input.to_string()))?;
        if digits == 0 {
            return Err(TypesError::InvalidDuration(input.to_string()));
        }
        let value: f64 = rest[..digits]
            .parse()
            .map_err(|_| TypesError::InvalidDuration(input.to_string()))?;
        rest = &rest[digits..];

        let unit_len = rest
            .find(|c: char| c.is_ascii_digit())
            .unwrap_or(rest.len());
        let unit = &rest[..unit_len];
        rest = &rest[unit_len..];

        let secs = match unit {
            "ms" => value / 1000.0,
            "s" => value,
            "m" => value * 60.0,
            "h" => value * 3600.0,
            "d" => value * 86400.0,
            _ => return Err(TypesError::InvalidDuration(input.to_string())),
        };
        total = Duration::try_from_secs_f64(secs)
            .ok()
            .and_then(|d| total.checked_add(d))
            .ok_or_else(|| TypesError::InvalidDuration(input.to_string()))?;
    }

    Ok(total)
}

/// Render a duration in the same compact notation `parse_duration` accepts.
pub fn format_duration(d: Duration) -> String {
    let ms = d.as_millis();
    if ms % 1000 != 0 {
        return format!("{ms}ms");
    }
    let mut secs = d.as_secs();
    let mut out = String::new();
    for (unit, size) in [("h", 3600), ("m", 60)] {
        if secs >= size {
            out.push_str(&format!("{}{unit}", secs / size));
            secs %= size;
        }
    }
    if secs > 0 || out.is_empty() {
        out.push_str(&format!("{secs}s"));
    }
    out
}
