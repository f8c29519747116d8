use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

const KIB: u64 = 1024;
const MIB: u64 = 1024 * KIB;
const GIB: u64 = 1024 * MIB;

/// A byte count written either as an integer or as a human-readable string (`"5MB"`,
/// `"512 KiB"`, `"1.5g"`). Unit prefixes are binary: `KB` and `KiB` both mean 1024 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ByteSize(pub u64);

impl Serialize for ByteSize {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_u64(self.0)
    }
}

impl<'de> Deserialize<'de> for ByteSize {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Repr {
            Bytes(u64),
            Human(String),
        }

        match Repr::deserialize(deserializer)? {
            Repr::Bytes(value) => Ok(ByteSize(value)),
            Repr::Human(value) => value.parse().map_err(serde::de::Error::custom),
        }
    }
}

impl ByteSize {
    pub const fn bytes(self) -> u64 {
        self.0
    }
}

impl From<ByteSize> for u64 {
    fn from(size: ByteSize) -> Self {
        size.0
    }
}

impl fmt::Display for ByteSize {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let bytes = self.0;
        match bytes {
            0 => write!(f, "0B"),
            _ if bytes % GIB == 0 => write!(f, "{}GB", bytes / GIB),
            _ if bytes % MIB == 0 => write!(f, "{}MB", bytes / MIB),
            _ if bytes % KIB == 0 => write!(f, "{}KB", bytes / KIB),
            _ => write!(f, "{bytes}B"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ParseByteSizeError {
    #[error("byte size is empty")]
    Empty,

    #[error("invalid number in byte size `{0}`")]
    Number(String),

    #[error("unknown unit `{0}` (expected B, KB, MB or GB)")]
    Unit(String),

    #[error("byte size `{0}` does not fit in 64 bits")]
    Overflow(String),
}

impl FromStr for ByteSize {
    type Err = ParseByteSizeError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        if trimmed.is_empty() {
            return Err(ParseByteSizeError::Empty);
        }
        let split = trimmed
            .find(|c: char| !(c.is_ascii_digit() || c == '.'))
            .unwrap_or(trimmed.len());
        let (number, unit) = trimmed.split_at(split);
        let multiplier = match unit.trim().to_ascii_lowercase().as_str() {
            "" | "b" => 1,
            "k" | "kb" | "kib" => KIB,
            "m" | "mb" | "mib" => MIB,
            "g" | "gb" | "gib" => GIB,
            other => return Err(ParseByteSizeError::Unit(other.to_string())),
        };

        if let Ok(whole) = number.parse::<u64>() {
            return whole
                .checked_mul(multiplier)
                .map(ByteSize)
                .ok_or_else(|| ParseByteSizeError::Overflow(trimmed.to_string()));
        }
        let value: f64 = number
            .parse()
            .map_err(|_| ParseByteSizeError::Number(trimmed.to_string()))?;
        let bytes = (value * multiplier as f64).round();
        if !bytes.is_finite() || bytes < 0.0 || bytes >= u64::MAX as f64 {
            return Err(ParseByteSizeError::Overflow(trimmed.to_string()));
        }
        Ok(ByteSize(bytes as u64))
    }
}
