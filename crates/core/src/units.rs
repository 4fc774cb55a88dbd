use once_cell::sync::Lazy;
use regex::Regex;

static SIZE_PATTERN: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)([\d.]+)\s*([KMGTP]?B)").expect("size pattern compiles")
});

/// Parses strings such as `"32.0 GB"` or `"500 MB"` into bytes using binary
/// multiples. Anything unparsable yields `0`.
pub fn parse_size(value: &str) -> u64 {
    let cleaned = value.replace(['(', ')'], "");
    let Some(captures) = SIZE_PATTERN.captures(cleaned.trim()) else {
        return 0;
    };
    let Ok(number) = captures[1].parse::<f64>() else {
        return 0;
    };

    let multiplier: u64 = match captures[2].to_ascii_uppercase().as_str() {
        "KB" => 1 << 10,
        "MB" => 1 << 20,
        "GB" => 1 << 30,
        "TB" => 1 << 40,
        "PB" => 1 << 50,
        _ => 1,
    };

    (number * multiplier as f64) as u64
}

pub fn human_bytes(value: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KB", "MB", "GB", "TB", "PB"];
    if value == 0 {
        return "0 B".to_string();
    }
    let mut size = value as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    format!("{size:.1} {}", UNITS[unit])
}
