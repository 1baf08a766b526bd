//! Byte-size parsing for sizes reported by source listings.

use serde::{Deserialize, Serialize};
use thiserror::Error;

const UNITS: &[(&str, u64)] = &[
    ("B", 1),
    ("KB", 1024),
    ("MB", 1024 * 1024),
    ("GB", 1024 * 1024 * 1024),
];

/// A malformed collaborator record. The record is skipped, the run goes on.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("unrecognized size '{0}'")]
    Size(String),
    #[error("record at position {position} has an empty display name")]
    EmptyName { position: usize },
    #[error("position {position} is used by more than one record")]
    DuplicatePosition { position: usize },
    #[error("{0}")]
    Malformed(String),
}

/// Size as it arrives from a listing: a byte count or a human string.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SizeValue {
    Bytes(u64),
    Text(String),
}

impl Default for SizeValue {
    fn default() -> Self {
        Self::Bytes(0)
    }
}

impl SizeValue {
    pub fn to_bytes(&self) -> Result<u64, ParseError> {
        match self {
            Self::Bytes(n) => Ok(*n),
            Self::Text(s) => parse_size(s),
        }
    }
}

/// Parses `"12.3 MB"`, `"512KB"`, `"1048576"` and friends into bytes.
///
/// Units are case-insensitive and binary (`KB` = 1024). Blank, `-` and `0`
/// mean unknown and yield `0`. Fractions round to the nearest byte.
pub fn parse_size(text: &str) -> Result<u64, ParseError> {
    let trimmed = text.trim();
    if trimmed.is_empty() || trimmed == "-" {
        return Ok(0);
    }

    let split = trimmed
        .find(|c: char| !(c.is_ascii_digit() || c == '.' || c == ','))
        .unwrap_or(trimmed.len());
    let (number, unit) = trimmed.split_at(split);
    let number = number.replace(',', "");
    let unit = unit.trim();

    let value: f64 = number
        .parse()
        .map_err(|_| ParseError::Size(text.to_string()))?;
    if !value.is_finite() || value < 0.0 {
        return Err(ParseError::Size(text.to_string()));
    }

    let multiplier = if unit.is_empty() {
        1
    } else {
        UNITS
            .iter()
            .find(|(name, _)| unit.eq_ignore_ascii_case(name))
            .map(|(_, m)| *m)
            .ok_or_else(|| ParseError::Size(text.to_string()))?
    };

    Ok((value * multiplier as f64).round() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unit_table_is_binary() {
        assert_eq!(parse_size("1 B").unwrap(), 1);
        assert_eq!(parse_size("1 KB").unwrap(), 1024);
        assert_eq!(parse_size("1 MB").unwrap(), 1_048_576);
        assert_eq!(parse_size("2 GB").unwrap(), 2 * 1_073_741_824);
    }

    #[test]
    fn decimals_and_spacing() {
        assert_eq!(parse_size("12.3 MB").unwrap(), (12.3_f64 * 1_048_576.0).round() as u64);
        assert_eq!(parse_size("512kb").unwrap(), 524_288);
        assert_eq!(parse_size(" 1,024 ").unwrap(), 1024);
    }

    #[test]
    fn blank_and_dash_mean_unknown() {
        assert_eq!(parse_size("").unwrap(), 0);
        assert_eq!(parse_size(" - ").unwrap(), 0);
        assert_eq!(parse_size("0").unwrap(), 0);
    }

    #[test]
    fn garbage_is_rejected() {
        assert!(matches!(parse_size("big"), Err(ParseError::Size(_))));
        assert!(matches!(parse_size("12 TB"), Err(ParseError::Size(_))));
        assert!(matches!(parse_size("1.2.3 MB"), Err(ParseError::Size(_))));
    }

    #[test]
    fn size_value_accepts_both_shapes() {
        let n: SizeValue = serde_json::from_str("2048").unwrap();
        let s: SizeValue = serde_json::from_str("\"2 KB\"").unwrap();
        assert_eq!(n.to_bytes().unwrap(), 2048);
        assert_eq!(s.to_bytes().unwrap(), 2048);
    }
}
