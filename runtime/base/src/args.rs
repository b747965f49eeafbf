//! Session argument strings and labels
//!
//! Session requests carry their parameters as a comma-separated list of
//! `key=value` assignments, e.g. `ram_quota=8K, cap_quota=2,
//! label="left"`. Numeric values accept K/M/G suffixes and 0x-prefixed
//! hex. Labels accumulate one `"name -> "` prefix per ancestor hop.

use serde::{Deserialize, Serialize};

/// Comma-separated `key=value` argument string
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Default)]
pub struct Args(String);

impl Args {
    pub fn new(args: &str) -> Self {
        Self(args.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Raw value of `key`, if assigned
    pub fn raw(&self, key: &str) -> Option<&str> {
        for assignment in split_outside_quotes(&self.0) {
            let Some((k, v)) = assignment.split_once('=') else {
                continue;
            };
            if k.trim() == key {
                return Some(v.trim());
            }
        }
        None
    }

    /// Numeric value of `key` with K/M/G suffix support
    pub fn ulong(&self, key: &str, default: u64) -> u64 {
        self.raw(key).and_then(parse_number).unwrap_or(default)
    }

    /// String value of `key` with surrounding quotes stripped
    pub fn string(&self, key: &str) -> Option<String> {
        self.raw(key)
            .map(|v| v.trim_matches('"').to_string())
    }

    /// Return a copy with `key` set to the given raw value, replacing any
    /// existing assignment
    pub fn with(&self, key: &str, value: &str) -> Args {
        let mut parts: Vec<String> = split_outside_quotes(&self.0)
            .into_iter()
            .filter(|assignment| {
                assignment
                    .split_once('=')
                    .map(|(k, _)| k.trim() != key)
                    .unwrap_or(true)
            })
            .map(|s| s.trim().to_string())
            .collect();
        parts.push(format!("{}={}", key, value));
        Args(parts.join(", "))
    }
}

/// Split at commas that are not enclosed in double quotes
fn split_outside_quotes(input: &str) -> Vec<&str> {
    let mut parts = Vec::new();
    let mut start = 0;
    let mut in_quotes = false;
    for (i, c) in input.char_indices() {
        match c {
            '"' => in_quotes = !in_quotes,
            ',' if !in_quotes => {
                parts.push(&input[start..i]);
                start = i + 1;
            }
            _ => {}
        }
    }
    parts.push(&input[start..]);
    parts.retain(|p| !p.trim().is_empty());
    parts
}

fn parse_number(value: &str) -> Option<u64> {
    let value = value.trim();
    if let Some(hex) = value.strip_prefix("0x") {
        return u64::from_str_radix(hex, 16).ok();
    }
    let (digits, factor) = match value.as_bytes().last()? {
        b'K' | b'k' => (&value[..value.len() - 1], 1u64 << 10),
        b'M' | b'm' => (&value[..value.len() - 1], 1 << 20),
        b'G' | b'g' => (&value[..value.len() - 1], 1 << 30),
        _ => (value, 1),
    };
    digits.parse::<u64>().ok()?.checked_mul(factor)
}

/// Session label: the client-chosen name plus one prefix per ancestor
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Label(String);

impl Label {
    pub fn new(label: &str) -> Self {
        Self(label.into())
    }

    /// Label as found in an argument string (empty when absent)
    pub fn from_args(args: &Args) -> Self {
        Self(args.string("label").unwrap_or_default())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Prepend an ancestor name
    pub fn prefixed(&self, prefix: &str) -> Label {
        if self.0.is_empty() {
            Label(prefix.into())
        } else {
            Label(format!("{} -> {}", prefix, self.0))
        }
    }

    /// The element closest to the session creator
    pub fn last_element(&self) -> &str {
        self.0.rsplit(" -> ").next().unwrap_or(&self.0)
    }
}

impl core::fmt::Display for Label {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}", self.0)
    }
}
