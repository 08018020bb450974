// ABOUTME: Validated identifiers for persisted entities: EntityType and EntityKey.
// ABOUTME: Both are restricted to file-name-safe characters so every backend can use them verbatim.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StorageError;

const MAX_LEN: usize = 128;

fn validate(kind: &str, raw: &str) -> Result<(), StorageError> {
    if raw.is_empty() {
        return Err(StorageError::InvalidKey(format!("{kind} must not be empty")));
    }
    if raw.len() > MAX_LEN {
        return Err(StorageError::InvalidKey(format!(
            "{kind} '{raw}' exceeds {MAX_LEN} bytes"
        )));
    }
    if raw.starts_with('.') {
        return Err(StorageError::InvalidKey(format!(
            "{kind} '{raw}' must not start with '.'"
        )));
    }
    if let Some(bad) = raw
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
    {
        return Err(StorageError::InvalidKey(format!(
            "{kind} '{raw}' contains unsupported character {bad:?}"
        )));
    }
    Ok(())
}

/// Names a family of records, e.g. `players` or `regions`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityType(String);

impl EntityType {
    pub fn new(raw: impl Into<String>) -> Result<Self, StorageError> {
        let raw = raw.into();
        validate("entity type", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// Stable identifier of one record within an entity type. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(raw: impl Into<String>) -> Result<Self, StorageError> {
        let raw = raw.into();
        validate("entity key", &raw)?;
        Ok(Self(raw))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

macro_rules! string_conversions {
    ($ty:ident) => {
        impl TryFrom<String> for $ty {
            type Error = StorageError;

            fn try_from(value: String) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl TryFrom<&str> for $ty {
            type Error = StorageError;

            fn try_from(value: &str) -> Result<Self, Self::Error> {
                Self::new(value)
            }
        }

        impl From<$ty> for String {
            fn from(value: $ty) -> Self {
                value.0
            }
        }

        impl FromStr for $ty {
            type Err = StorageError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                Self::new(s)
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl AsRef<str> for $ty {
            fn as_ref(&self) -> &str {
                &self.0
            }
        }
    };
}

string_conversions!(EntityType);
string_conversions!(EntityKey);
