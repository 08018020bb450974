// ABOUTME: The Record trait implemented by persisted domain types, plus Revision and Versioned.
// ABOUTME: Revisions drive optimistic concurrency; schema versions drive upgrades on decode.

use std::fmt;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

/// Monotonically increasing write counter. Revision 0 means "no stored record".
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Revision(pub u64);

impl Revision {
    pub const ZERO: Revision = Revision(0);

    pub fn next(self) -> Revision {
        Revision(self.0 + 1)
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl From<u64> for Revision {
    fn from(value: u64) -> Self {
        Revision(value)
    }
}

impl fmt::Display for Revision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A domain value that can be persisted by quill.
///
/// `ENTITY_TYPE` names the family (and therefore the directory or table
/// partition) the record lives in. `SCHEMA_VERSION` is written into every
/// stored document; when an older document is read, [`Record::upgrade`] is
/// called once per version step to lift the raw data to the current shape.
pub trait Record: Serialize + DeserializeOwned + Clone + Send + Sync + 'static {
    const ENTITY_TYPE: &'static str;

    const SCHEMA_VERSION: u32 = 1;

    /// Convert `data` stored at `from_version` into the shape of
    /// `from_version + 1`. The default has no upgrade path.
    fn upgrade(from_version: u32, data: serde_json::Value) -> Result<serde_json::Value, String> {
        let _ = data;
        Err(format!(
            "no upgrade path from schema version {from_version} for {}",
            Self::ENTITY_TYPE
        ))
    }
}

/// A record together with the revision it was read at or written as.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Versioned<R> {
    pub revision: Revision,
    pub value: R,
}

impl<R> Versioned<R> {
    pub fn new(revision: Revision, value: R) -> Self {
        Self { revision, value }
    }

    pub fn map<U>(self, f: impl FnOnce(R) -> U) -> Versioned<U> {
        Versioned {
            revision: self.revision,
            value: f(self.value),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn revision_next_is_strictly_greater() {
        let r = Revision::ZERO;
        assert!(r.next() > r);
        assert_eq!(r.next().next(), Revision(2));
    }

    #[test]
    fn revision_serializes_as_plain_number() {
        let json = serde_json::to_string(&Revision(7)).unwrap();
        assert_eq!(json, "7");
    }
}
