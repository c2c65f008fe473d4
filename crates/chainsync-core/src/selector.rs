//! Event signatures and selectors.
//!
//! The selector of an EVM event is the keccak256 hash of its canonical
//! signature string, e.g.:
//!   keccak256("Transfer(address,address,uint256)")
//!   → 0xddf252ad1be2c89b69c2b068fc378daa952ba7f163c4a11628f55a4df523b3ef
//!
//! It is what appears as `topics[0]` of a matching log, and is the second half
//! of every handler registry key.

use serde::{Deserialize, Serialize};
use tiny_keccak::{Hasher, Keccak};

/// A 32-byte event selector, hex encoded with a `0x` prefix.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSelector(String);

impl EventSelector {
    /// Wrap an already-computed selector. Normalised to lowercase.
    pub fn new(hex: impl Into<String>) -> Self {
        Self(hex.into().to_ascii_lowercase())
    }

    /// Compute the selector of a canonical signature.
    pub fn from_signature(signature: &str) -> Self {
        let mut hasher = Keccak::v256();
        let mut output = [0u8; 32];
        hasher.update(signature.as_bytes());
        hasher.finalize(&mut output);
        Self(format!("0x{}", hex::encode(output)))
    }

    /// Extract the selector from a raw log's topics.
    /// Returns `None` if topics is empty or the first topic is malformed.
    pub fn from_topics(topics: &[String]) -> Option<Self> {
        let first = topics.first()?;
        let hex = first.strip_prefix("0x").unwrap_or(first);
        if hex.len() == 64 && hex.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self::new(format!("0x{hex}")))
        } else {
            None
        }
    }

    pub fn as_hex(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for EventSelector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Canonical ABI signature of an event: `"Name(type1,type2,...)"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventSignature(String);

impl EventSignature {
    /// Whitespace is stripped so `"Transfer(address, address, uint256)"`
    /// hashes the same as its canonical form.
    pub fn new(signature: impl Into<String>) -> Self {
        let raw: String = signature.into();
        Self(raw.chars().filter(|c| !c.is_whitespace()).collect())
    }

    /// The event name (everything before the opening parenthesis).
    pub fn name(&self) -> &str {
        self.0.split('(').next().unwrap_or(&self.0)
    }

    pub fn selector(&self) -> EventSelector {
        EventSelector::from_signature(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Display-safe name of a handler: `"<source>:<event>"` with anything outside
/// `[A-Za-z0-9_:]` replaced by `_`.
pub fn safe_name(source: &str, event: &str) -> String {
    format!("{source}:{event}")
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '_' || c == ':' {
                c
            } else {
                '_'
            }
        })
        .collect()
}
