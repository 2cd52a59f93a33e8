//! Suffix parsing for config values: durations (`30s`, `5m`, `12h`, `3d`)
//! and sizes (`512B`, `64KB`, `15MB`, `1GB`). Bare numbers mean seconds and
//! bytes respectively.

use std::time::Duration;

pub fn parse_duration(input: &str) -> Result<Duration, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty duration".to_string());
    }

    let (number, multiplier) = match trimmed.chars().last() {
        Some('s') | Some('S') => (&trimmed[..trimmed.len() - 1], 1u64),
        Some('m') | Some('M') => (&trimmed[..trimmed.len() - 1], 60),
        Some('h') | Some('H') => (&trimmed[..trimmed.len() - 1], 3600),
        Some('d') | Some('D') => (&trimmed[..trimmed.len() - 1], 86_400),
        _ => (trimmed, 1),
    };

    number
        .trim()
        .parse::<u64>()
        .map(|n| Duration::from_secs(n * multiplier))
        .map_err(|_| format!("invalid duration: {input:?}"))
}

pub fn parse_size(input: &str) -> Result<u64, String> {
    let trimmed = input.trim();
    if trimmed.is_empty() {
        return Err("empty size".to_string());
    }

    let upper = trimmed.to_ascii_uppercase();
    let (number, multiplier) = if let Some(n) = upper.strip_suffix("GB") {
        (n, 1024u64 * 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("MB") {
        (n, 1024 * 1024)
    } else if let Some(n) = upper.strip_suffix("KB") {
        (n, 1024)
    } else if let Some(n) = upper.strip_suffix("B") {
        (n, 1)
    } else {
        (upper.as_str(), 1)
    };

    number
        .trim()
        .parse::<u64>()
        .map(|n| n * multiplier)
        .map_err(|_| format!("invalid size: {input:?}"))
}
