//! SIREN identifiers
//!
//! A SIREN is the 9-digit French company identifier. Storage and index
//! comparisons go through the numeric value; display is always zero-padded.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Number of digits in a SIREN
pub const SIREN_LEN: usize = 9;

/// Number of digits in a SIRET (SIREN + 5-digit establishment suffix)
const SIRET_LEN: usize = 14;

/// A validated 9-digit company identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Siren(u32);

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("'{0}' is not a 9-digit SIREN")]
pub struct InvalidSiren(pub String);

impl Siren {
    /// Strict parse: exactly nine ASCII digits, nothing else.
    pub fn parse(s: &str) -> Option<Self> {
        if s.len() != SIREN_LEN || !s.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        s.parse::<u32>().ok().map(Self)
    }

    /// Lenient parse for caller-supplied identifiers.
    ///
    /// Strips whitespace, reduces a 14-digit SIRET to its SIREN and left-pads
    /// shorter numeric input with zeros.
    pub fn normalize(input: &str) -> Option<Self> {
        let digits: String = input.chars().filter(|c| !c.is_whitespace()).collect();
        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        match digits.len() {
            SIRET_LEN => Self::parse(&digits[..SIREN_LEN]),
            n if n <= SIREN_LEN => Self::parse(&format!("{:0>9}", digits)),
            _ => None,
        }
    }

    pub fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Display for Siren {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:09}", self.0)
    }
}

impl FromStr for Siren {
    type Err = InvalidSiren;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| InvalidSiren(s.to_string()))
    }
}

impl Serialize for Siren {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Siren {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::parse(&raw).ok_or_else(|| serde::de::Error::custom(InvalidSiren(raw)))
    }
}
