use thiserror::Error;

use crate::shared_types::ByteCount;

pub const KB: ByteCount = 1024;
pub const MB: ByteCount = 1024 * KB;
pub const GB: ByteCount = 1024 * MB;
pub const TB: ByteCount = 1024 * GB;
pub const PB: ByteCount = 1024 * TB;

pub const MAX_SIZE: ByteCount = 10 * PB;

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SizeParseError {
    #[error("size string cannot be empty")]
    Empty,
    #[error("invalid size format: {0}")]
    Format(String),
    #[error("unsupported unit: {0}")]
    Unit(String),
    #[error("size must be at least 1 byte")]
    TooSmall,
    #[error("size must be at most 10PB")]
    TooLarge,
}

/// Parses sizes like `100B`, `1.5GB` or `64mb` (binary multiples).
pub fn parse_size(input: &str) -> Result<ByteCount, SizeParseError> {
    let s = input.trim().to_ascii_uppercase();
    if s.is_empty() {
        return Err(SizeParseError::Empty);
    }

    let split = s
        .find(|c: char| c.is_ascii_alphabetic())
        .ok_or_else(|| SizeParseError::Format(input.to_owned()))?;
    let (number, unit) = s.split_at(split);

    let well_formed = match number.split_once('.') {
        Some((int, frac)) => is_digits(int) && is_digits(frac),
        None => is_digits(number),
    };
    if !well_formed {
        return Err(SizeParseError::Format(input.to_owned()));
    }
    let value: f64 = number
        .parse()
        .map_err(|_| SizeParseError::Format(input.to_owned()))?;

    let multiplier = match unit {
        "B" => 1,
        "KB" => KB,
        "MB" => MB,
        "GB" => GB,
        "TB" => TB,
        "PB" => PB,
        other => return Err(SizeParseError::Unit(other.to_owned())),
    };

    let bytes = value * multiplier as f64;
    if bytes < 1.0 {
        return Err(SizeParseError::TooSmall);
    }
    if bytes > MAX_SIZE as f64 {
        return Err(SizeParseError::TooLarge);
    }
    Ok(bytes as ByteCount)
}

fn is_digits(s: &str) -> bool {
    !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit())
}

pub fn format_bytes(bytes: ByteCount) -> String {
    const UNITS: [(ByteCount, &str); 4] = [(TB, "TB"), (GB, "GB"), (MB, "MB"), (KB, "KB")];
    UNITS
        .iter()
        .find(|(size, _)| bytes >= *size)
        .map(|(size, unit)| format!("{:.2} {unit}", bytes as f64 / *size as f64))
        .unwrap_or_else(|| format!("{bytes} B"))
}

pub fn format_throughput(bytes_per_sec: f64) -> String {
    if bytes_per_sec >= GB as f64 {
        format!("{:.2} GB/s", bytes_per_sec / GB as f64)
    } else if bytes_per_sec >= MB as f64 {
        format!("{:.2} MB/s", bytes_per_sec / MB as f64)
    } else if bytes_per_sec >= KB as f64 {
        format!("{:.2} KB/s", bytes_per_sec / KB as f64)
    } else {
        format!("{:.0} B/s", bytes_per_sec)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_size("100B"), Ok(100));
        assert_eq!(parse_size("1KB"), Ok(1024));
        assert_eq!(parse_size("64mb"), Ok(64 * MB));
        assert_eq!(parse_size(" 1.5GB "), Ok(GB + GB / 2));
        assert_eq!(parse_size("10PB"), Ok(10 * PB));
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(parse_size(""), Err(SizeParseError::Empty));
        assert!(matches!(parse_size("100"), Err(SizeParseError::Format(_))));
        assert!(matches!(parse_size("1.GB"), Err(SizeParseError::Format(_))));
        assert!(matches!(parse_size("-1GB"), Err(SizeParseError::Format(_))));
        assert!(matches!(parse_size("5XB"), Err(SizeParseError::Unit(_))));
        assert_eq!(parse_size("0B"), Err(SizeParseError::TooSmall));
        assert_eq!(parse_size("11PB"), Err(SizeParseError::TooLarge));
    }

    #[test]
    fn formats_bytes() {
        assert_eq!(format_bytes(0), "0 B");
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.50 KB");
        assert_eq!(format_bytes(3 * GB), "3.00 GB");
        assert_eq!(format_throughput(2.0 * MB as f64), "2.00 MB/s");
        assert_eq!(format_throughput(10.0), "10 B/s");
    }
}
