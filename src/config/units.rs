// Parsing helpers for human-friendly configuration values

use serde::{Deserialize, Deserializer};
use std::time::Duration;

/// Parse a memory size such as "500M", "1G", "512K" or "1024" into bytes
pub fn parse_memory(s: &str) -> std::result::Result<u64, String> {
    let s = s.trim();
    if s.is_empty() {
        return Err("empty memory size".to_string());
    }

    let (digits, multiplier) = match s.char_indices().last() {
        Some((idx, c)) if c.is_ascii_alphabetic() => {
            let multiplier = match c.to_ascii_uppercase() {
                'B' => 1u64,
                'K' => 1024,
                'M' => 1024 * 1024,
                'G' => 1024 * 1024 * 1024,
                _ => return Err(format!("unknown memory unit in '{}'", s)),
            };
            (&s[..idx], multiplier)
        }
        _ => (s, 1u64),
    };

    let value: u64 = digits
        .trim()
        .parse()
        .map_err(|_| format!("invalid memory size '{}'", s))?;

    value
        .checked_mul(multiplier)
        .ok_or_else(|| format!("memory size '{}' is too large", s))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum DurationRepr {
    Millis(u64),
    Human(#[serde(with = "humantime_serde")] Duration),
}

impl From<DurationRepr> for Duration {
    fn from(repr: DurationRepr) -> Self {
        match repr {
            DurationRepr::Millis(ms) => Duration::from_millis(ms),
            DurationRepr::Human(d) => d,
        }
    }
}

/// Accepts humantime strings ("10s", "1m 30s") or integer milliseconds
pub fn duration<'de, D>(deserializer: D) -> std::result::Result<Duration, D::Error>
where
    D: Deserializer<'de>,
{
    DurationRepr::deserialize(deserializer).map(Duration::from)
}

pub fn optional_duration<'de, D>(deserializer: D) -> std::result::Result<Option<Duration>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(Option::<DurationRepr>::deserialize(deserializer)?.map(Duration::from))
}

#[derive(Deserialize)]
#[serde(untagged)]
enum MemoryRepr {
    Bytes(u64),
    Human(String),
}

pub fn optional_memory<'de, D>(deserializer: D) -> std::result::Result<Option<u64>, D::Error>
where
    D: Deserializer<'de>,
{
    match Option::<MemoryRepr>::deserialize(deserializer)? {
        None => Ok(None),
        Some(MemoryRepr::Bytes(bytes)) => Ok(Some(bytes)),
        Some(MemoryRepr::Human(s)) => parse_memory(&s).map(Some).map_err(serde::de::Error::custom),
    }
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ArgsRepr {
    List(Vec<String>),
    Line(String),
}

/// Arguments may be given as a list or as a single whitespace-separated string
pub fn args<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match ArgsRepr::deserialize(deserializer)? {
        ArgsRepr::List(list) => list,
        ArgsRepr::Line(line) => line.split_whitespace().map(str::to_string).collect(),
    })
}
