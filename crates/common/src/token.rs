//! Bearer credential wrapper
//!
//! Upstream credentials travel with a `Bearer ` scheme tag in Authorization
//! headers and in some stored documents, but are compared and looked up bare.
//! `BearerToken` only ever stores the bare value and re-applies the tag when
//! an Authorization header is built, so a tagged and an untagged form of the
//! same secret always compare equal.

use std::fmt;
use std::hash::{Hash, Hasher};

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use zeroize::Zeroize;

/// Scheme tag carried by secrets on the wire.
pub const SCHEME: &str = "Bearer ";

/// An upstream access token, normalized to its bare value.
///
/// Debug and Display print the masked form only. The secret is zeroized
/// when the value is dropped.
pub struct BearerToken(String);

impl BearerToken {
    /// Normalize a raw secret, stripping the scheme tag and surrounding whitespace.
    pub fn parse(raw: &str) -> Self {
        let trimmed = raw.trim();
        let bare = trimmed.strip_prefix(SCHEME).unwrap_or(trimmed).trim();
        Self(bare.to_owned())
    }

    /// The bare secret, used for equality and lookup.
    pub fn bare(&self) -> &str {
        &self.0
    }

    /// The secret with its scheme tag, ready for an Authorization header.
    pub fn authorization(&self) -> String {
        format!("{SCHEME}{}", self.0)
    }

    /// First 6 and last 4 characters for display. Secrets of 10 characters
    /// or fewer are shown unchanged.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 10 {
            return self.0.clone();
        }
        let head: String = chars[..6].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{head}...{tail}")
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl Clone for BearerToken {
    fn clone(&self) -> Self {
        Self(self.0.clone())
    }
}

impl PartialEq for BearerToken {
    fn eq(&self, other: &Self) -> bool {
        self.0 == other.0
    }
}

impl Eq for BearerToken {}

impl Hash for BearerToken {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.hash(state);
    }
}

impl fmt::Debug for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "BearerToken({})", self.masked())
    }
}

impl fmt::Display for BearerToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}

impl Drop for BearerToken {
    fn drop(&mut self) {
        self.0.zeroize();
    }
}

impl Serialize for BearerToken {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for BearerToken {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Ok(Self::parse(&raw))
    }
}
