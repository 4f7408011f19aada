//! Entity keys.

use crate::error::{CoreError, CoreResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Stable `owner/name` identifier of a tracked entity.
///
/// The key is the only thing the engine owns about an entity; states,
/// metadata, leases and error contexts are all indexed by it.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    /// Parses an `owner/name` key.
    pub fn parse(key: &str) -> CoreResult<Self> {
        let invalid = |reason| CoreError::InvalidEntityKey {
            key: key.to_string(),
            reason,
        };

        let (owner, name) = key.split_once('/').ok_or_else(|| invalid("missing '/'"))?;
        if owner.is_empty() {
            return Err(invalid("empty owner"));
        }
        if name.is_empty() {
            return Err(invalid("empty name"));
        }
        if name.contains('/') {
            return Err(invalid("more than one '/'"));
        }
        if !key.chars().all(|c| c == '/' || is_key_char(c)) {
            return Err(invalid("unsupported character"));
        }

        Ok(Self(key.to_string()))
    }

    /// Builds a key from its two segments.
    pub fn new(owner: &str, name: &str) -> CoreResult<Self> {
        Self::parse(&format!("{owner}/{name}"))
    }

    /// Returns the owner segment.
    pub fn owner(&self) -> &str {
        self.0.split_once('/').map(|(owner, _)| owner).unwrap_or("")
    }

    /// Returns the name segment.
    pub fn name(&self) -> &str {
        self.0.split_once('/').map(|(_, name)| name).unwrap_or("")
    }

    /// Returns the full key.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

fn is_key_char(c: char) -> bool {
    c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-')
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for EntityKey {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for EntityKey {
    type Error = CoreError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<EntityKey> for String {
    fn from(key: EntityKey) -> Self {
        key.0
    }
}

impl AsRef<str> for EntityKey {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
