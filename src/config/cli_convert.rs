//! Conversion helpers from CLI/TOML strings to typed values

use anyhow::{Context, Result};
use std::time::Duration;

/// Parse a duration string (e.g., "500ms", "60s", "5m", "1h")
///
/// A bare number is taken as seconds.
pub fn parse_duration(s: &str) -> Result<Duration> {
    let s = s.trim().to_lowercase();

    let (num_str, unit_ms) = if let Some(num) = s.strip_suffix("ms") {
        (num, 1u64)
    } else if let Some(num) = s.strip_suffix("sec").or_else(|| s.strip_suffix('s')) {
        (num, 1_000)
    } else if let Some(num) = s.strip_suffix("min").or_else(|| s.strip_suffix('m')) {
        (num, 60_000)
    } else if let Some(num) = s.strip_suffix("hr").or_else(|| s.strip_suffix('h')) {
        (num, 3_600_000)
    } else {
        (s.as_str(), 1_000)
    };

    let num: u64 = num_str
        .trim()
        .parse()
        .with_context(|| format!("Invalid duration format: {}", s))?;

    let millis = num
        .checked_mul(unit_ms)
        .with_context(|| format!("Duration out of range: {}", s))?;

    Ok(Duration::from_millis(millis))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_duration_seconds() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("30sec").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("45").unwrap(), Duration::from_secs(45));
    }

    #[test]
    fn test_parse_duration_minutes_and_hours() {
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2min").unwrap(), Duration::from_secs(120));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
        assert_eq!(parse_duration(" 1HR ").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn test_parse_duration_millis() {
        assert_eq!(parse_duration("500ms").unwrap(), Duration::from_millis(500));
    }

    #[test]
    fn test_parse_duration_invalid() {
        assert!(parse_duration("").is_err());
        assert!(parse_duration("fast").is_err());
        assert!(parse_duration("-5s").is_err());
    }
}
