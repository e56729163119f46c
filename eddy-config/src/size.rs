//! Human-friendly byte sizes.
//!
//! Size fields accept either a plain integer or a string such as `"64MiB"`,
//! `"512 K"` or `"1GB"`. All unit prefixes are binary.

use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serializer};

/// Parses `"<digits>[unit]"` into bytes.
pub fn parse_size(text: &str) -> Result<usize, String> {
    let re = Regex::new(r"^\s*(\d+)\s*([A-Za-z]*)\s*$").map_err(|e| e.to_string())?;
    let caps = re
        .captures(text)
        .ok_or_else(|| format!("invalid size '{text}'"))?;
    let value: usize = caps[1]
        .parse()
        .map_err(|_| format!("size '{text}' out of range"))?;
    let shift = match caps[2].to_ascii_lowercase().as_str() {
        "" | "b" => 0,
        "k" | "kb" | "kib" => 10,
        "m" | "mb" | "mib" => 20,
        "g" | "gb" | "gib" => 30,
        unit => return Err(format!("unknown size unit '{unit}' in '{text}'")),
    };
    value
        .checked_mul(1 << shift)
        .ok_or_else(|| format!("size '{text}' out of range"))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum Raw {
    Int(u64),
    Text(String),
}

pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<usize, D::Error> {
    match Raw::deserialize(deserializer)? {
        Raw::Int(n) => usize::try_from(n).map_err(de::Error::custom),
        Raw::Text(text) => parse_size(&text).map_err(de::Error::custom),
    }
}

pub fn serialize<S: Serializer>(value: &usize, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_u64(*value as u64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_units() {
        assert_eq!(parse_size("4096"), Ok(4096));
        assert_eq!(parse_size("64MiB"), Ok(64 << 20));
        assert_eq!(parse_size("512 k"), Ok(512 << 10));
        assert_eq!(parse_size("1GB"), Ok(1 << 30));
        assert_eq!(parse_size(" 7b "), Ok(7));
    }

    #[test]
    fn rejects_garbage() {
        assert!(parse_size("").is_err());
        assert!(parse_size("12 parsecs").is_err());
        assert!(parse_size("-1").is_err());
        assert!(parse_size("1.5MiB").is_err());
    }
}
